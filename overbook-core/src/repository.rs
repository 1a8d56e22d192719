use async_trait::async_trait;
use std::time::Duration;

use crate::booking::{Booking, BookingId, BookingRequest};
use crate::flight::{Flight, FlightId};

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Flight not found: {0}")]
    NotFound(FlightId),
    #[error("Counter for flight {flight_id} diverged: expected {expected}, found {actual}")]
    Diverged {
        flight_id: FlightId,
        expected: i32,
        actual: i32,
    },
    #[error("Ledger backend error: {0}")]
    Backend(String),
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Booking {0} already exists")]
    Conflict(BookingId),
    #[error("Booking store backend error: {0}")]
    Backend(String),
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("Lock for flight {0} is already held")]
    AlreadyHeld(FlightId),
    #[error("Lock for flight {0} is not held by this token")]
    NotHeld(FlightId),
    #[error("Lock backend error: {0}")]
    Backend(String),
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue connection error: {0}")]
    Connection(String),
    #[error("Malformed queue payload: {0}")]
    Payload(String),
}

/// Durable record of a flight's capacity counters.
///
/// The ledger performs no concurrency control; writers must hold the
/// flight's admission lock.
#[async_trait]
pub trait FlightLedger: Send + Sync {
    async fn get_flight(&self, flight_id: FlightId) -> Result<Flight, LedgerError>;

    /// Full overwrite of `current_booking`.
    async fn update_counter(&self, flight_id: FlightId, current_booking: i32) -> Result<(), LedgerError>;

    /// Overwrites `current_booking` only if it still equals `expected`.
    async fn compare_and_set_counter(
        &self,
        flight_id: FlightId,
        expected: i32,
        current_booking: i32,
    ) -> Result<(), LedgerError>;
}

/// Idempotent-by-id store of booking outcomes.
#[async_trait]
pub trait BookingStore: Send + Sync {
    /// Returns `StoreError::Conflict` if the id is already present.
    async fn put(&self, booking: &Booking) -> Result<(), StoreError>;

    async fn get(&self, booking_id: BookingId) -> Result<Option<Booking>, StoreError>;
}

/// Opaque value proving ownership of a flight's lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(pub String);

impl LockToken {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Non-blocking per-flight mutual exclusion with expiry.
#[async_trait]
pub trait AdmissionLock: Send + Sync {
    /// Atomic set-if-absent. Never waits for the current holder.
    async fn try_acquire(&self, flight_id: FlightId, ttl: Duration) -> Result<LockToken, LockError>;

    /// Pushes the expiry out to `ttl` from now if `token` still holds the lock.
    async fn extend(&self, flight_id: FlightId, token: &LockToken, ttl: Duration) -> Result<(), LockError>;

    /// Deletes the lock if `token` still holds it.
    async fn release(&self, flight_id: FlightId, token: &LockToken) -> Result<(), LockError>;
}

/// A dequeued, not yet acknowledged request.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub request: BookingRequest,
    pub partition: i32,
    pub offset: i64,
}

/// Producer side of the per-flight request queue.
#[async_trait]
pub trait BookingQueue: Send + Sync {
    async fn enqueue(&self, flight_id: FlightId, request: &BookingRequest) -> Result<(), QueueError>;

    /// Opens an at-least-once consumer over one flight's queue.
    async fn consumer(&self, flight_id: FlightId) -> Result<Box<dyn QueueConsumer>, QueueError>;
}

#[async_trait]
pub trait QueueConsumer: Send {
    /// Waits up to `wait` for the next request. `Ok(None)` means empty.
    async fn dequeue(&mut self, wait: Duration) -> Result<Option<Delivery>, QueueError>;

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Hands an un-acked delivery back so it is seen again by the next consumer.
    async fn requeue(&mut self, delivery: Delivery) -> Result<(), QueueError>;
}
