//! In-process implementations of the four ports.
//!
//! Used by the test suites and for running the API without Postgres, Redis
//! or Kafka. Each one carries failure switches so tests can drive the
//! processor's error paths.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use overbook_core::repository::{
    AdmissionLock, BookingQueue, BookingStore, Delivery, FlightLedger, LedgerError, LockError,
    LockToken, QueueConsumer, QueueError, StoreError,
};
use overbook_core::{Booking, BookingId, BookingRequest, Flight, FlightId};

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Consumes one unit of an injected failure budget.
fn take_failure(budget: &AtomicUsize) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[derive(Default)]
pub struct MemoryLedger {
    flights: Mutex<HashMap<FlightId, Flight>>,
    fail_writes: AtomicBool,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, flight: Flight) {
        guard(&self.flights).insert(flight.id, flight);
    }

    pub fn snapshot(&self, flight_id: FlightId) -> Option<Flight> {
        guard(&self.flights).get(&flight_id).cloned()
    }

    /// Make every counter write fail until switched back.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl FlightLedger for MemoryLedger {
    async fn get_flight(&self, flight_id: FlightId) -> Result<Flight, LedgerError> {
        self.snapshot(flight_id).ok_or(LedgerError::NotFound(flight_id))
    }

    async fn update_counter(&self, flight_id: FlightId, current_booking: i32) -> Result<(), LedgerError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(LedgerError::Backend("ledger unavailable".to_string()));
        }
        let mut flights = guard(&self.flights);
        let flight = flights.get_mut(&flight_id).ok_or(LedgerError::NotFound(flight_id))?;
        flight.current_booking = current_booking;
        Ok(())
    }

    async fn compare_and_set_counter(
        &self,
        flight_id: FlightId,
        expected: i32,
        current_booking: i32,
    ) -> Result<(), LedgerError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(LedgerError::Backend("ledger unavailable".to_string()));
        }
        let mut flights = guard(&self.flights);
        let flight = flights.get_mut(&flight_id).ok_or(LedgerError::NotFound(flight_id))?;
        if flight.current_booking != expected {
            return Err(LedgerError::Diverged {
                flight_id,
                expected,
                actual: flight.current_booking,
            });
        }
        flight.current_booking = current_booking;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryBookingStore {
    bookings: Mutex<HashMap<BookingId, Booking>>,
    failing_puts: AtomicUsize,
}

impl MemoryBookingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` writes fail with a backend error.
    pub fn fail_next_puts(&self, count: usize) {
        self.failing_puts.store(count, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        guard(&self.bookings).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn for_flight(&self, flight_id: FlightId) -> Vec<Booking> {
        guard(&self.bookings)
            .values()
            .filter(|b| b.flight_id == flight_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl BookingStore for MemoryBookingStore {
    async fn put(&self, booking: &Booking) -> Result<(), StoreError> {
        if take_failure(&self.failing_puts) {
            return Err(StoreError::Backend("booking store unavailable".to_string()));
        }
        let mut bookings = guard(&self.bookings);
        if bookings.contains_key(&booking.id) {
            return Err(StoreError::Conflict(booking.id));
        }
        bookings.insert(booking.id, booking.clone());
        Ok(())
    }

    async fn get(&self, booking_id: BookingId) -> Result<Option<Booking>, StoreError> {
        Ok(guard(&self.bookings).get(&booking_id).cloned())
    }
}

/// Set-if-absent lock with expiry measured on the tokio clock.
#[derive(Default)]
pub struct MemoryLock {
    held: Mutex<HashMap<FlightId, (LockToken, Instant)>>,
}

impl MemoryLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, flight_id: FlightId) -> bool {
        guard(&self.held)
            .get(&flight_id)
            .is_some_and(|(_, expires_at)| *expires_at > Instant::now())
    }

    /// Drops the entry as if its TTL had lapsed.
    pub fn expire(&self, flight_id: FlightId) {
        guard(&self.held).remove(&flight_id);
    }
}

#[async_trait]
impl AdmissionLock for MemoryLock {
    async fn try_acquire(&self, flight_id: FlightId, ttl: Duration) -> Result<LockToken, LockError> {
        let now = Instant::now();
        let mut held = guard(&self.held);
        if let Some((_, expires_at)) = held.get(&flight_id) {
            if *expires_at > now {
                return Err(LockError::AlreadyHeld(flight_id));
            }
        }
        let token = LockToken::generate();
        held.insert(flight_id, (token.clone(), now + ttl));
        Ok(token)
    }

    async fn extend(&self, flight_id: FlightId, token: &LockToken, ttl: Duration) -> Result<(), LockError> {
        let now = Instant::now();
        let mut held = guard(&self.held);
        match held.get_mut(&flight_id) {
            Some((owner, expires_at)) if owner == token && *expires_at > now => {
                *expires_at = now + ttl;
                Ok(())
            }
            _ => Err(LockError::NotHeld(flight_id)),
        }
    }

    async fn release(&self, flight_id: FlightId, token: &LockToken) -> Result<(), LockError> {
        let mut held = guard(&self.held);
        match held.get(&flight_id) {
            Some((owner, _)) if owner == token => {
                held.remove(&flight_id);
                Ok(())
            }
            _ => Err(LockError::NotHeld(flight_id)),
        }
    }
}

#[derive(Default)]
struct Partition {
    pending: VecDeque<(i64, BookingRequest)>,
    next_offset: i64,
}

#[derive(Default)]
struct QueueState {
    partitions: Mutex<HashMap<FlightId, Partition>>,
    notify: Notify,
    failing_dequeues: AtomicUsize,
}

/// Per-flight FIFO with at-least-once delivery: anything a consumer did not
/// ack is put back at the front when the consumer goes away.
#[derive(Clone, Default)]
pub struct MemoryQueue {
    state: Arc<QueueState>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depth(&self, flight_id: FlightId) -> usize {
        guard(&self.state.partitions)
            .get(&flight_id)
            .map_or(0, |p| p.pending.len())
    }

    /// The next `count` dequeue calls fail with a connection error.
    pub fn fail_next_dequeues(&self, count: usize) {
        self.state.failing_dequeues.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl BookingQueue for MemoryQueue {
    async fn enqueue(&self, flight_id: FlightId, request: &BookingRequest) -> Result<(), QueueError> {
        {
            let mut partitions = guard(&self.state.partitions);
            let partition = partitions.entry(flight_id).or_default();
            let offset = partition.next_offset;
            partition.next_offset += 1;
            partition.pending.push_back((offset, request.clone()));
        }
        self.state.notify.notify_waiters();
        Ok(())
    }

    async fn consumer(&self, flight_id: FlightId) -> Result<Box<dyn QueueConsumer>, QueueError> {
        Ok(Box::new(MemoryConsumer {
            state: Arc::clone(&self.state),
            flight_id,
            unacked: Vec::new(),
        }))
    }
}

pub struct MemoryConsumer {
    state: Arc<QueueState>,
    flight_id: FlightId,
    unacked: Vec<(i64, BookingRequest)>,
}

impl MemoryConsumer {
    fn try_pop(&mut self) -> Option<Delivery> {
        let mut partitions = guard(&self.state.partitions);
        let (offset, request) = partitions.get_mut(&self.flight_id)?.pending.pop_front()?;
        self.unacked.push((offset, request.clone()));
        Some(Delivery {
            request,
            partition: 0,
            offset,
        })
    }

    fn give_back(&mut self, offset: i64) {
        if let Some(pos) = self.unacked.iter().position(|(o, _)| *o == offset) {
            let entry = self.unacked.remove(pos);
            let mut partitions = guard(&self.state.partitions);
            partitions.entry(self.flight_id).or_default().pending.push_front(entry);
        }
    }
}

#[async_trait]
impl QueueConsumer for MemoryConsumer {
    async fn dequeue(&mut self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        if take_failure(&self.state.failing_dequeues) {
            return Err(QueueError::Connection("broker unreachable".to_string()));
        }
        let deadline = Instant::now() + wait;
        loop {
            let state = Arc::clone(&self.state);
            let notified = state.notify.notified();
            if let Some(delivery) = self.try_pop() {
                return Ok(Some(delivery));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), QueueError> {
        self.unacked.retain(|(offset, _)| *offset != delivery.offset);
        Ok(())
    }

    async fn requeue(&mut self, delivery: Delivery) -> Result<(), QueueError> {
        self.give_back(delivery.offset);
        Ok(())
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        let unacked = std::mem::take(&mut self.unacked);
        if unacked.is_empty() {
            return;
        }
        let mut partitions = guard(&self.state.partitions);
        let partition = partitions.entry(self.flight_id).or_default();
        for entry in unacked.into_iter().rev() {
            partition.pending.push_front(entry);
        }
    }
}
