use std::sync::Arc;
use tracing::{info, warn};

use overbook_core::repository::{LedgerError, QueueError};
use overbook_core::{AdmissionError, AdmissionResult, BookingId, BookingRequest, FlightId};

use crate::registry::AdmissionRegistry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// This call started a new run.
    Started,
    /// A run already holds the flight. A run started by this process drains
    /// the queue once more before letting go of the flight.
    AlreadyProcessing,
    /// The request is queued but no run could be started now.
    Deferred(String),
}

#[derive(Debug, Clone)]
pub struct Submission {
    pub booking_id: BookingId,
    pub trigger: TriggerOutcome,
}

/// Accepts booking requests: enqueue first, then make sure a run is active.
#[derive(Clone)]
pub struct BookingProducer {
    registry: AdmissionRegistry,
}

impl BookingProducer {
    pub fn new(registry: AdmissionRegistry) -> Self {
        Self { registry }
    }

    pub async fn submit(&self, flight_id: FlightId, customer_id: &str) -> AdmissionResult<Submission> {
        let processor = self.registry.processor();

        match processor.bounded(processor.ledger().get_flight(flight_id)).await {
            Some(Ok(_)) => {}
            Some(Err(LedgerError::NotFound(_))) => return Err(AdmissionError::FlightNotFound(flight_id)),
            Some(Err(e)) => return Err(AdmissionError::LedgerRead(e.to_string())),
            None => {
                return Err(AdmissionError::LedgerRead(format!("reading flight {} timed out", flight_id)))
            }
        }

        let request = BookingRequest::new(customer_id);
        let queue = Arc::clone(processor.queue());
        let message = request.clone();
        processor
            .config()
            .retry
            .run("enqueue booking request", move || {
                let queue = Arc::clone(&queue);
                let message = message.clone();
                async move { queue.enqueue(flight_id, &message).await }
            })
            .await
            .map_err(|e| match e {
                QueueError::Connection(e) => AdmissionError::QueueConnection(e),
                QueueError::Payload(e) => AdmissionError::Enqueue(e),
            })?;
        info!("Queued booking {} for flight {}", request.booking_id, flight_id);

        let trigger = match self.registry.trigger(flight_id).await {
            Ok(_) => TriggerOutcome::Started,
            Err(e) if e.is_contention() => TriggerOutcome::AlreadyProcessing,
            Err(e) => {
                warn!("Booking {} queued but admission not started: {}", request.booking_id, e);
                TriggerOutcome::Deferred(e.to_string())
            }
        };

        Ok(Submission {
            booking_id: request.booking_id,
            trigger,
        })
    }
}
