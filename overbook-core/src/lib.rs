pub mod booking;
pub mod flight;
pub mod policy;
pub mod repository;

pub use booking::{Booking, BookingId, BookingRequest, BookingStatus};
pub use flight::{Flight, FlightId};
pub use policy::CapacityCounter;

/// Failure kinds surfaced by an admission run.
///
/// `AlreadyLocked` is expected contention and is reported to the caller as
/// "processing in progress". `StoreWriteConflict` is absorbed as a no-op by the
/// processor and only appears here so adapters can describe it.
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("Flight {0} is already being processed")]
    AlreadyLocked(FlightId),
    #[error("Flight not found: {0}")]
    FlightNotFound(FlightId),
    #[error("Flight {flight_id} has inconsistent capacity counters: {reason}")]
    InvalidFlight { flight_id: FlightId, reason: String },
    #[error("Queue connection failed: {0}")]
    QueueConnection(String),
    #[error("Booking {0} already recorded")]
    StoreWriteConflict(BookingId),
    #[error("Booking record write failed: {0}")]
    StoreWrite(String),
    #[error("Ledger flush failed: {0}")]
    LedgerFlush(String),
    #[error("Admission lease for flight {0} was lost")]
    LeaseLost(FlightId),
    #[error("Admission lock backend error: {0}")]
    LockBackend(String),
    #[error("Ledger read failed: {0}")]
    LedgerRead(String),
    #[error("No admission run for flight {0} in this process")]
    NotRunning(FlightId),
    #[error("Failed to enqueue booking request: {0}")]
    Enqueue(String),
}

impl AdmissionError {
    /// True for outcomes that mean "someone else is on it", not a failure.
    pub fn is_contention(&self) -> bool {
        matches!(self, AdmissionError::AlreadyLocked(_))
    }
}

pub type AdmissionResult<T> = Result<T, AdmissionError>;
