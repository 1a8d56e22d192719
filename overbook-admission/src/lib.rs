pub mod config;
pub mod memory;
pub mod processor;
pub mod producer;
pub mod registry;
pub mod retry;

pub use config::{AdmissionSettings, ProcessorConfig};
pub use processor::{AdmissionProcessor, AdmissionReport, AdmissionRun, AdmissionState, DrainEnd, Tally};
pub use producer::{BookingProducer, Submission, TriggerOutcome};
pub use registry::AdmissionRegistry;
pub use retry::RetryPolicy;
