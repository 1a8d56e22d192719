use chrono::{DateTime, Utc};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use overbook_core::repository::{
    AdmissionLock, BookingQueue, BookingStore, Delivery, FlightLedger, LedgerError, LockError,
    LockToken, QueueConsumer, QueueError, StoreError,
};
use overbook_core::{
    AdmissionError, AdmissionResult, Booking, BookingStatus, CapacityCounter, Flight, FlightId,
};

use crate::config::ProcessorConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionState {
    Idle,
    Locking,
    Draining,
    Flushing,
    Released,
    Rejected,
}

impl fmt::Display for AdmissionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AdmissionState::Idle => "IDLE",
            AdmissionState::Locking => "LOCKING",
            AdmissionState::Draining => "DRAINING",
            AdmissionState::Flushing => "FLUSHING",
            AdmissionState::Released => "RELEASED",
            AdmissionState::Rejected => "REJECTED",
        };
        f.write_str(name)
    }
}

/// Why a drain stopped consuming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainEnd {
    /// `max_empty_attempts` consecutive empty dequeues.
    QueueIdle,
    /// External stop signal.
    Stopped,
    /// A record write failed; the message was left un-acked for redelivery.
    StoreWriteFailed(String),
    LeaseLost,
    /// Queue retries exhausted.
    QueueFailed(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    pub booked: u32,
    pub oversold: u32,
    pub failed: u32,
    /// Redelivered requests whose record already existed.
    pub duplicates: u32,
}

impl Tally {
    fn record(&mut self, status: BookingStatus) {
        match status {
            BookingStatus::Booked => self.booked += 1,
            BookingStatus::Oversold => self.oversold += 1,
            BookingStatus::Failed => self.failed += 1,
        }
    }

    pub fn decided(&self) -> u32 {
        self.booked + self.oversold + self.failed
    }
}

#[derive(Debug, Clone)]
pub struct AdmissionReport {
    pub flight_id: FlightId,
    pub tally: Tally,
    pub initial_current_booking: i32,
    pub final_current_booking: i32,
    /// Last value known to be durable in the ledger.
    pub flushed_current_booking: i32,
    pub end: DrainEnd,
    pub flush_error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Drives one flight through Locking, Draining, Flushing and Released.
#[derive(Clone)]
pub struct AdmissionProcessor {
    ledger: Arc<dyn FlightLedger>,
    store: Arc<dyn BookingStore>,
    lock: Arc<dyn AdmissionLock>,
    queue: Arc<dyn BookingQueue>,
    config: ProcessorConfig,
}

impl AdmissionProcessor {
    pub fn new(
        ledger: Arc<dyn FlightLedger>,
        store: Arc<dyn BookingStore>,
        lock: Arc<dyn AdmissionLock>,
        queue: Arc<dyn BookingQueue>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            ledger,
            store,
            lock,
            queue,
            config,
        }
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<dyn FlightLedger> {
        &self.ledger
    }

    pub fn store(&self) -> &Arc<dyn BookingStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<dyn BookingQueue> {
        &self.queue
    }

    /// Full run: lock, drain until idle or stopped, flush, release.
    pub async fn run(&self, flight_id: FlightId, stop: CancellationToken) -> AdmissionResult<AdmissionReport> {
        let run = self.begin(flight_id).await?;
        run.drain(stop).await
    }

    /// Takes the flight's lock and seeds the running counter.
    ///
    /// Fails fast with `AlreadyLocked` when another run holds the flight.
    /// A returned run that is dropped without `drain` keeps the lock until
    /// its TTL lapses.
    pub async fn begin(&self, flight_id: FlightId) -> AdmissionResult<AdmissionRun> {
        debug!("Flight {} {}", flight_id, AdmissionState::Locking);

        // Existence check only; no lock is taken for a missing flight.
        let flight = self.read_flight(flight_id).await?;
        validate(&flight)?;

        // Taken before the call so the lease is never assumed to outlive the key.
        let acquired_at = Instant::now();
        let token = match self.bounded(self.lock.try_acquire(flight_id, self.config.lock_ttl)).await {
            Some(Ok(token)) => token,
            Some(Err(LockError::AlreadyHeld(_))) => {
                info!("Flight {} {}: admission already in progress", flight_id, AdmissionState::Rejected);
                return Err(AdmissionError::AlreadyLocked(flight_id));
            }
            Some(Err(e)) => return Err(AdmissionError::LockBackend(e.to_string())),
            None => return Err(AdmissionError::LockBackend("lock acquisition timed out".to_string())),
        };

        // The counter is seeded from a read taken under the lock.
        let snapshot = match self.read_flight(flight_id).await.and_then(|f| validate(&f).map(|_| f)) {
            Ok(flight) => flight,
            Err(e) => {
                self.release_lock(flight_id, &token).await;
                return Err(e);
            }
        };

        Ok(AdmissionRun {
            processor: self.clone(),
            flight_id,
            token,
            acquired_at,
            counter: CapacityCounter::from_flight(&snapshot),
            initial: snapshot.current_booking,
            flushed: snapshot.current_booking,
            tally: Tally::default(),
            started_at: Utc::now(),
        })
    }

    async fn read_flight(&self, flight_id: FlightId) -> AdmissionResult<Flight> {
        match self.bounded(self.ledger.get_flight(flight_id)).await {
            Some(Ok(flight)) => Ok(flight),
            Some(Err(LedgerError::NotFound(_))) => Err(AdmissionError::FlightNotFound(flight_id)),
            Some(Err(e)) => Err(AdmissionError::LedgerRead(e.to_string())),
            None => Err(AdmissionError::LedgerRead(format!("reading flight {} timed out", flight_id))),
        }
    }

    async fn release_lock(&self, flight_id: FlightId, token: &LockToken) {
        match self.bounded(self.lock.release(flight_id, token)).await {
            Some(Ok(())) => debug!("Released admission lock for flight {}", flight_id),
            Some(Err(LockError::NotHeld(_))) => {
                warn!("Admission lock for flight {} had already lapsed at release", flight_id)
            }
            Some(Err(e)) => error!("Failed to release admission lock for flight {}: {}", flight_id, e),
            None => error!("Releasing admission lock for flight {} timed out", flight_id),
        }
    }

    /// `None` when the call exceeded `store_timeout`.
    pub(crate) async fn bounded<T>(&self, fut: impl Future<Output = T>) -> Option<T> {
        tokio::time::timeout(self.config.store_timeout, fut).await.ok()
    }
}

fn validate(flight: &Flight) -> AdmissionResult<()> {
    flight.validate().map_err(|reason| AdmissionError::InvalidFlight {
        flight_id: flight.id,
        reason,
    })
}

/// A locked flight, ready to drain.
pub struct AdmissionRun {
    processor: AdmissionProcessor,
    flight_id: FlightId,
    token: LockToken,
    acquired_at: Instant,
    counter: CapacityCounter,
    initial: i32,
    flushed: i32,
    tally: Tally,
    started_at: DateTime<Utc>,
}

impl AdmissionRun {
    pub fn flight_id(&self) -> FlightId {
        self.flight_id
    }

    pub fn counter(&self) -> CapacityCounter {
        self.counter
    }

    /// Draining through Released. The lock is released on every path.
    pub async fn drain(mut self, stop: CancellationToken) -> AdmissionResult<AdmissionReport> {
        let flight_id = self.flight_id;
        let lease = LeaseKeeper::spawn(&self.processor, flight_id, self.token.clone(), self.acquired_at);

        let queue = Arc::clone(&self.processor.queue);
        let opened = self
            .processor
            .config
            .retry
            .run("open booking queue", move || {
                let queue = Arc::clone(&queue);
                async move { queue.consumer(flight_id).await }
            })
            .await;

        let end = match opened {
            Ok(mut consumer) => {
                info!(
                    "Flight {} {}: current_booking={} booking_limit={} oversell_limit={}",
                    flight_id,
                    AdmissionState::Draining,
                    self.counter.current_booking,
                    self.counter.booking_limit,
                    self.counter.oversell_limit
                );
                self.drain_queue(consumer.as_mut(), &stop, &lease.lost).await
            }
            Err(e) => DrainEnd::QueueFailed(e.to_string()),
        };

        debug!("Flight {} {} after {:?}", flight_id, AdmissionState::Flushing, end);
        let lease_lost = lease.lost.is_cancelled();
        let flush_error = if lease_lost {
            Some("lease lost before flush; counter left for reconciliation".to_string())
        } else {
            self.flush().await.err().map(|e| e.to_string())
        };
        if let Some(e) = &flush_error {
            error!(
                "Flight {}: counter {} not flushed ({}); ledger stays at {} until the next run",
                flight_id, self.counter.current_booking, e, self.flushed
            );
        }

        drop(lease);
        self.processor.release_lock(flight_id, &self.token).await;

        let end = if lease_lost { DrainEnd::LeaseLost } else { end };
        let report = AdmissionReport {
            flight_id,
            tally: self.tally,
            initial_current_booking: self.initial,
            final_current_booking: self.counter.current_booking,
            flushed_current_booking: self.flushed,
            end: end.clone(),
            flush_error,
            started_at: self.started_at,
            finished_at: Utc::now(),
        };
        info!(
            "Flight {} {}: booked={} oversold={} failed={} duplicates={} current_booking={}",
            flight_id,
            AdmissionState::Released,
            report.tally.booked,
            report.tally.oversold,
            report.tally.failed,
            report.tally.duplicates,
            report.final_current_booking
        );

        match end {
            DrainEnd::QueueFailed(e) => Err(AdmissionError::QueueConnection(e)),
            DrainEnd::LeaseLost => Err(AdmissionError::LeaseLost(flight_id)),
            _ => Ok(report),
        }
    }

    async fn drain_queue(
        &mut self,
        consumer: &mut dyn QueueConsumer,
        stop: &CancellationToken,
        lease_lost: &CancellationToken,
    ) -> DrainEnd {
        let max_empty = self.processor.config.max_empty_attempts;
        let mut empty_attempts = 0;

        loop {
            if lease_lost.is_cancelled() {
                return DrainEnd::LeaseLost;
            }
            if stop.is_cancelled() {
                info!("Flight {}: stop requested", self.flight_id);
                return DrainEnd::Stopped;
            }
            if empty_attempts >= max_empty {
                return DrainEnd::QueueIdle;
            }

            let delivery = match self.dequeue(consumer).await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => {
                    empty_attempts += 1;
                    debug!("Flight {}: queue empty ({}/{})", self.flight_id, empty_attempts, max_empty);
                    continue;
                }
                Err(QueueError::Payload(e)) => {
                    warn!("Flight {}: skipping malformed booking request: {}", self.flight_id, e);
                    continue;
                }
                Err(QueueError::Connection(e)) => return DrainEnd::QueueFailed(e),
            };

            empty_attempts = 0;
            if lease_lost.is_cancelled() {
                if let Err(e) = consumer.requeue(delivery).await {
                    warn!("Flight {}: requeue after lost lease failed: {}", self.flight_id, e);
                }
                return DrainEnd::LeaseLost;
            }
            if let Some(end) = self.admit(consumer, delivery, lease_lost).await {
                return end;
            }
        }
    }

    /// Decide, persist, then ack. Returns `Some` when draining must end.
    async fn admit(
        &mut self,
        consumer: &mut dyn QueueConsumer,
        delivery: Delivery,
        lease_lost: &CancellationToken,
    ) -> Option<DrainEnd> {
        let status = self.counter.classify();
        let booking = Booking::from_request(&delivery.request, self.flight_id, status);

        match self.processor.bounded(self.processor.store.put(&booking)).await {
            Some(Ok(())) => {
                self.counter.commit(status);
                self.tally.record(status);
                info!(
                    "Booking {} for flight {}: {} (current_booking={})",
                    booking.id, self.flight_id, status, self.counter.current_booking
                );
            }
            Some(Err(StoreError::Conflict(_))) => {
                self.tally.duplicates += 1;
                info!("Booking {} already recorded; ignoring redelivery", booking.id);
            }
            Some(Err(StoreError::Backend(e))) => {
                return Some(self.leave_for_redelivery(consumer, delivery, e).await);
            }
            None => {
                let reason = format!("writing booking {} timed out", booking.id);
                return Some(self.leave_for_redelivery(consumer, delivery, reason).await);
            }
        }

        if let Err(e) = self.ack(consumer, &delivery).await {
            return Some(DrainEnd::QueueFailed(e.to_string()));
        }

        let unflushed = self.counter.current_booking - self.flushed;
        if !lease_lost.is_cancelled() && periodic_flush_due(self.processor.config.flush_every, unflushed) {
            if let Err(e) = self.flush().await {
                warn!("Flight {}: periodic flush failed, will retry at drain exit: {}", self.flight_id, e);
            }
        }
        None
    }

    async fn leave_for_redelivery(
        &mut self,
        consumer: &mut dyn QueueConsumer,
        delivery: Delivery,
        reason: String,
    ) -> DrainEnd {
        error!(
            "Flight {}: booking {} not recorded, leaving it for redelivery: {}",
            self.flight_id, delivery.request.booking_id, reason
        );
        if let Err(e) = consumer.requeue(delivery).await {
            warn!("Flight {}: requeue failed, relying on uncommitted position: {}", self.flight_id, e);
        }
        DrainEnd::StoreWriteFailed(reason)
    }

    async fn dequeue(&self, consumer: &mut dyn QueueConsumer) -> Result<Option<Delivery>, QueueError> {
        let config = &self.processor.config;
        let mut attempt = 1;
        loop {
            match consumer.dequeue(config.wait_timeout).await {
                Err(QueueError::Connection(e)) if config.retry.allows_retry(attempt) => {
                    warn!(
                        "Flight {}: dequeue attempt {}/{} failed: {}",
                        self.flight_id, attempt, config.retry.attempts, e
                    );
                    tokio::time::sleep(config.retry.delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn ack(&self, consumer: &mut dyn QueueConsumer, delivery: &Delivery) -> Result<(), QueueError> {
        let retry = self.processor.config.retry;
        let mut attempt = 1;
        loop {
            match consumer.ack(delivery).await {
                Err(QueueError::Connection(e)) if retry.allows_retry(attempt) => {
                    warn!("Flight {}: ack attempt {}/{} failed: {}", self.flight_id, attempt, retry.attempts, e);
                    tokio::time::sleep(retry.delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Compare-and-set from the last durable value to the running counter.
    async fn flush(&mut self) -> AdmissionResult<()> {
        let current = self.counter.current_booking;
        if current == self.flushed {
            return Ok(());
        }
        let write = self
            .processor
            .ledger
            .compare_and_set_counter(self.flight_id, self.flushed, current);
        match self.processor.bounded(write).await {
            Some(Ok(())) => {
                debug!("Flight {}: flushed current_booking {} -> {}", self.flight_id, self.flushed, current);
                self.flushed = current;
                Ok(())
            }
            Some(Err(e)) => Err(AdmissionError::LedgerFlush(e.to_string())),
            None => Err(AdmissionError::LedgerFlush("ledger write timed out".to_string())),
        }
    }
}

/// `flush_every == 0` disables periodic flushing.
fn periodic_flush_due(flush_every: u32, unflushed: i32) -> bool {
    flush_every > 0 && i64::from(unflushed) >= i64::from(flush_every)
}

/// Extends the lock on a fixed interval until dropped.
///
/// The lease counts as lost once `lock_ttl - store_timeout` has passed since
/// the last confirmed renewal, whether or not the backend answered.
struct LeaseKeeper {
    handle: JoinHandle<()>,
    lost: CancellationToken,
}

impl LeaseKeeper {
    fn spawn(processor: &AdmissionProcessor, flight_id: FlightId, token: LockToken, acquired_at: Instant) -> Self {
        let lock = Arc::clone(&processor.lock);
        let ttl = processor.config.lock_ttl;
        let interval = processor.config.lease_renew_interval;
        let call_timeout = processor.config.store_timeout;
        let grace = ttl.saturating_sub(call_timeout);
        let lost = CancellationToken::new();
        let signal = lost.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            let mut last_renewed = acquired_at;
            loop {
                let deadline = last_renewed + grace;
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
                if Instant::now() >= deadline {
                    error!(
                        "Admission lease for flight {} not renewed within {:?}; treating it as lost",
                        flight_id, grace
                    );
                    signal.cancel();
                    break;
                }

                let attempted_at = Instant::now();
                let call_deadline = (attempted_at + call_timeout).min(deadline);
                match tokio::time::timeout_at(call_deadline, lock.extend(flight_id, &token, ttl)).await {
                    Ok(Ok(())) => {
                        last_renewed = attempted_at;
                        debug!("Renewed admission lease for flight {}", flight_id);
                    }
                    Ok(Err(LockError::NotHeld(_))) => {
                        error!("Admission lease for flight {} lost while draining", flight_id);
                        signal.cancel();
                        break;
                    }
                    Ok(Err(e)) => warn!("Lease renewal for flight {} failed: {}", flight_id, e),
                    Err(_) => warn!("Lease renewal for flight {} timed out", flight_id),
                }
            }
        });

        Self { handle, lost }
    }
}

impl Drop for LeaseKeeper {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
