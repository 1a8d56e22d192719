use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use overbook_admission::memory::{MemoryBookingStore, MemoryLedger, MemoryLock, MemoryQueue};
use overbook_admission::{
    AdmissionProcessor, AdmissionRegistry, BookingProducer, DrainEnd, ProcessorConfig, RetryPolicy,
    TriggerOutcome,
};
use overbook_core::repository::{
    AdmissionLock, BookingQueue, BookingStore, FlightLedger, LedgerError, LockError, LockToken,
};
use overbook_core::{AdmissionError, BookingRequest, BookingStatus, Flight, FlightId};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const FLIGHT: FlightId = 42;

struct Harness {
    ledger: Arc<MemoryLedger>,
    store: Arc<MemoryBookingStore>,
    lock: Arc<MemoryLock>,
    queue: MemoryQueue,
    processor: AdmissionProcessor,
}

fn test_config() -> ProcessorConfig {
    ProcessorConfig {
        wait_timeout: Duration::from_secs(1),
        max_empty_attempts: 3,
        lock_ttl: Duration::from_secs(30),
        lease_renew_interval: Duration::from_secs(10),
        flush_every: 0,
        store_timeout: Duration::from_secs(5),
        retry: RetryPolicy {
            attempts: 3,
            delay: Duration::from_millis(500),
        },
    }
}

fn flight(booking_limit: i32, oversell_limit: i32, current_booking: i32) -> Flight {
    Flight {
        id: FLIGHT,
        origin: "JFK".to_string(),
        destination: "LHR".to_string(),
        flight_date: NaiveDate::from_ymd_opt(2024, 12, 25).unwrap(),
        price: 420.0,
        booking_limit,
        oversell_limit,
        current_booking,
    }
}

fn harness(booking_limit: i32, oversell_limit: i32, current_booking: i32, config: ProcessorConfig) -> Harness {
    let ledger = Arc::new(MemoryLedger::new());
    ledger.insert(flight(booking_limit, oversell_limit, current_booking));
    let store = Arc::new(MemoryBookingStore::new());
    let lock = Arc::new(MemoryLock::new());
    let queue = MemoryQueue::new();
    let processor = AdmissionProcessor::new(
        ledger.clone(),
        store.clone(),
        lock.clone(),
        Arc::new(queue.clone()),
        config,
    );
    Harness {
        ledger,
        store,
        lock,
        queue,
        processor,
    }
}

async fn enqueue(h: &Harness, count: usize) -> Vec<BookingRequest> {
    let mut requests = Vec::new();
    for i in 0..count {
        let request = BookingRequest::new(format!("customer-{}", i));
        h.queue.enqueue(FLIGHT, &request).await.unwrap();
        requests.push(request);
    }
    requests
}

async fn status_of(h: &Harness, request: &BookingRequest) -> BookingStatus {
    h.store.get(request.booking_id).await.unwrap().unwrap().status
}

async fn wait_for_records(h: &Harness, count: usize) {
    while h.store.len() < count {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_two_booked_one_oversold_one_failed() {
    let h = harness(2, 3, 0, test_config());
    let requests = enqueue(&h, 4).await;

    let report = h.processor.run(FLIGHT, CancellationToken::new()).await.unwrap();

    let mut statuses = Vec::new();
    for request in &requests {
        statuses.push(status_of(&h, request).await);
    }
    assert_eq!(
        statuses,
        vec![
            BookingStatus::Booked,
            BookingStatus::Booked,
            BookingStatus::Oversold,
            BookingStatus::Failed
        ]
    );
    assert_eq!(report.end, DrainEnd::QueueIdle);
    assert_eq!(report.final_current_booking, 3);
    assert_eq!(report.flushed_current_booking, 3);
    assert!(report.flush_error.is_none());
    assert_eq!(h.ledger.snapshot(FLIGHT).unwrap().current_booking, 3);
    assert!(!h.lock.is_held(FLIGHT));
    assert_eq!(h.queue.depth(FLIGHT), 0);
}

#[tokio::test(start_paused = true)]
async fn test_admission_counts_match_capacity() {
    let cases = [(0, 0, 0, 3), (2, 3, 0, 6), (2, 5, 1, 3), (3, 5, 4, 4), (4, 4, 4, 2), (1, 6, 0, 10)];

    for (b, o, c, n) in cases {
        let h = harness(b, o, c, test_config());
        enqueue(&h, n as usize).await;

        let report = h.processor.run(FLIGHT, CancellationToken::new()).await.unwrap();

        let records = h.store.for_flight(FLIGHT);
        let admitted = records.iter().filter(|r| r.status.takes_seat()).count() as i32;
        let booked = records.iter().filter(|r| r.status == BookingStatus::Booked).count() as i32;
        let failed = records.iter().filter(|r| r.status == BookingStatus::Failed).count() as i32;

        assert_eq!(records.len() as i32, n);
        assert_eq!(admitted, n.min(o - c), "b={} o={} c={} n={}", b, o, c, n);
        assert_eq!(booked, n.min((b - c).max(0)), "b={} o={} c={} n={}", b, o, c, n);
        assert_eq!(failed, n - admitted);
        assert_eq!(report.final_current_booking, c + n.min(o - c));
        assert_eq!(h.ledger.snapshot(FLIGHT).unwrap().current_booking, c + n.min(o - c));
    }
}

#[tokio::test(start_paused = true)]
async fn test_redelivered_booking_is_recorded_once() {
    let h = harness(5, 5, 0, test_config());
    let request = BookingRequest::new("customer-1");
    h.queue.enqueue(FLIGHT, &request).await.unwrap();
    h.queue.enqueue(FLIGHT, &request).await.unwrap();

    let report = h.processor.run(FLIGHT, CancellationToken::new()).await.unwrap();

    assert_eq!(h.store.len(), 1);
    assert_eq!(report.tally.booked, 1);
    assert_eq!(report.tally.duplicates, 1);
    assert_eq!(h.ledger.snapshot(FLIGHT).unwrap().current_booking, 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_triggers_admit_one_runner() {
    let h = harness(5, 5, 0, test_config());
    enqueue(&h, 2).await;

    let (a, b) = tokio::join!(
        h.processor.run(FLIGHT, CancellationToken::new()),
        h.processor.run(FLIGHT, CancellationToken::new())
    );

    let results = [a, b];
    let finished = results.iter().filter(|r| r.is_ok()).count();
    let rejected = results
        .iter()
        .filter(|r| matches!(r, Err(AdmissionError::AlreadyLocked(FLIGHT))))
        .count();
    assert_eq!(finished, 1);
    assert_eq!(rejected, 1);
    assert_eq!(h.store.len(), 2);
    assert_eq!(h.ledger.snapshot(FLIGHT).unwrap().current_booking, 2);
}

#[tokio::test(start_paused = true)]
async fn test_begin_rejects_while_locked() {
    let h = harness(5, 5, 0, test_config());

    let run = h.processor.begin(FLIGHT).await.unwrap();
    let second = h.processor.begin(FLIGHT).await;
    match second {
        Err(e) => {
            assert!(matches!(e, AdmissionError::AlreadyLocked(FLIGHT)));
            assert!(e.is_contention());
        }
        Ok(_) => panic!("second run should have been rejected"),
    }

    run.drain(CancellationToken::new()).await.unwrap();
    assert!(h.processor.begin(FLIGHT).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_idle_queue_drains_within_bound() {
    let config = ProcessorConfig {
        max_empty_attempts: 15,
        ..test_config()
    };
    let bound = config.idle_drain_bound();
    let h = harness(2, 3, 0, config);

    let started = Instant::now();
    let report = h.processor.run(FLIGHT, CancellationToken::new()).await.unwrap();

    assert_eq!(report.end, DrainEnd::QueueIdle);
    assert!(started.elapsed() <= bound);
    assert_eq!(report.tally.decided(), 0);
    assert!(!h.lock.is_held(FLIGHT));
}

#[tokio::test(start_paused = true)]
async fn test_unknown_flight_takes_no_lock() {
    let h = harness(2, 3, 0, test_config());

    let result = h.processor.run(999, CancellationToken::new()).await;

    assert!(matches!(result, Err(AdmissionError::FlightNotFound(999))));
    assert!(!h.lock.is_held(999));
}

#[tokio::test(start_paused = true)]
async fn test_inconsistent_flight_is_rejected() {
    let h = harness(4, 3, 0, test_config());

    let result = h.processor.run(FLIGHT, CancellationToken::new()).await;

    assert!(matches!(result, Err(AdmissionError::InvalidFlight { .. })));
    assert!(!h.lock.is_held(FLIGHT));
}

#[tokio::test(start_paused = true)]
async fn test_store_failure_leaves_message_for_redelivery() {
    let h = harness(5, 5, 0, test_config());
    let requests = enqueue(&h, 2).await;
    h.store.fail_next_puts(1);

    let report = h.processor.run(FLIGHT, CancellationToken::new()).await.unwrap();

    assert!(matches!(report.end, DrainEnd::StoreWriteFailed(_)));
    assert!(h.store.is_empty());
    assert_eq!(h.queue.depth(FLIGHT), 2);
    assert_eq!(h.ledger.snapshot(FLIGHT).unwrap().current_booking, 0);
    assert!(!h.lock.is_held(FLIGHT));

    let retry = h.processor.run(FLIGHT, CancellationToken::new()).await.unwrap();
    assert_eq!(retry.end, DrainEnd::QueueIdle);
    assert_eq!(status_of(&h, &requests[0]).await, BookingStatus::Booked);
    assert_eq!(status_of(&h, &requests[1]).await, BookingStatus::Booked);
    assert_eq!(h.ledger.snapshot(FLIGHT).unwrap().current_booking, 2);
}

#[tokio::test(start_paused = true)]
async fn test_flush_failure_still_releases_lock() {
    let h = harness(5, 5, 1, test_config());
    enqueue(&h, 2).await;
    h.ledger.set_fail_writes(true);

    let report = h.processor.run(FLIGHT, CancellationToken::new()).await.unwrap();

    assert!(report.flush_error.is_some());
    assert_eq!(report.final_current_booking, 3);
    assert_eq!(report.flushed_current_booking, 1);
    assert_eq!(h.ledger.snapshot(FLIGHT).unwrap().current_booking, 1);
    assert_eq!(h.store.len(), 2);
    assert!(!h.lock.is_held(FLIGHT));
}

#[tokio::test(start_paused = true)]
async fn test_external_counter_change_is_reported_as_divergence() {
    let h = harness(5, 5, 0, test_config());
    enqueue(&h, 1).await;

    let run = h.processor.begin(FLIGHT).await.unwrap();
    h.ledger.update_counter(FLIGHT, 4).await.unwrap();
    let report = run.drain(CancellationToken::new()).await.unwrap();

    let error = report.flush_error.unwrap();
    assert!(error.contains("diverged"), "{}", error);
    assert_eq!(h.ledger.snapshot(FLIGHT).unwrap().current_booking, 4);
    assert!(!h.lock.is_held(FLIGHT));
}

#[tokio::test(start_paused = true)]
async fn test_stop_signal_ends_drain_early() {
    let config = ProcessorConfig {
        max_empty_attempts: 1_000,
        ..test_config()
    };
    let h = Arc::new(harness(5, 5, 0, config));
    enqueue(&h, 2).await;
    let stop = CancellationToken::new();

    let runner = {
        let h = Arc::clone(&h);
        let stop = stop.clone();
        tokio::spawn(async move { h.processor.run(FLIGHT, stop).await })
    };
    wait_for_records(&h, 2).await;
    let started = Instant::now();
    stop.cancel();

    let report = runner.await.unwrap().unwrap();
    assert_eq!(report.end, DrainEnd::Stopped);
    assert!(started.elapsed() <= Duration::from_secs(1));
    assert_eq!(h.ledger.snapshot(FLIGHT).unwrap().current_booking, 2);
    assert!(!h.lock.is_held(FLIGHT));
}

#[tokio::test(start_paused = true)]
async fn test_lease_is_renewed_while_draining() {
    let config = ProcessorConfig {
        lock_ttl: Duration::from_secs(4),
        lease_renew_interval: Duration::from_secs(1),
        store_timeout: Duration::from_millis(500),
        max_empty_attempts: 10,
        ..test_config()
    };
    let h = Arc::new(harness(5, 5, 0, config));

    let runner = {
        let h = Arc::clone(&h);
        tokio::spawn(async move { h.processor.run(FLIGHT, CancellationToken::new()).await })
    };

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(matches!(
        h.lock.try_acquire(FLIGHT, Duration::from_secs(3)).await,
        Err(overbook_core::repository::LockError::AlreadyHeld(FLIGHT))
    ));

    let report = runner.await.unwrap().unwrap();
    assert_eq!(report.end, DrainEnd::QueueIdle);
    assert!(!h.lock.is_held(FLIGHT));
}

#[tokio::test(start_paused = true)]
async fn test_lost_lease_aborts_without_flush() {
    let config = ProcessorConfig {
        lease_renew_interval: Duration::from_secs(1),
        max_empty_attempts: 10,
        ..test_config()
    };
    let h = Arc::new(harness(5, 5, 0, config));
    enqueue(&h, 1).await;

    let runner = {
        let h = Arc::clone(&h);
        tokio::spawn(async move { h.processor.run(FLIGHT, CancellationToken::new()).await })
    };
    wait_for_records(&h, 1).await;
    h.lock.expire(FLIGHT);

    let result = runner.await.unwrap();
    assert!(matches!(result, Err(AdmissionError::LeaseLost(FLIGHT))));
    assert_eq!(h.ledger.snapshot(FLIGHT).unwrap().current_booking, 0);
}

#[tokio::test(start_paused = true)]
async fn test_transient_queue_errors_are_retried() {
    let h = harness(5, 5, 0, test_config());
    enqueue(&h, 1).await;
    h.queue.fail_next_dequeues(2);

    let report = h.processor.run(FLIGHT, CancellationToken::new()).await.unwrap();

    assert_eq!(report.tally.booked, 1);
    assert_eq!(report.end, DrainEnd::QueueIdle);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_queue_retries_abort_run() {
    let h = Arc::new(harness(5, 5, 0, test_config()));
    enqueue(&h, 1).await;

    let runner = {
        let h = Arc::clone(&h);
        tokio::spawn(async move { h.processor.run(FLIGHT, CancellationToken::new()).await })
    };
    wait_for_records(&h, 1).await;
    h.queue.fail_next_dequeues(10);

    let result = runner.await.unwrap();
    assert!(matches!(result, Err(AdmissionError::QueueConnection(_))));
    assert_eq!(h.ledger.snapshot(FLIGHT).unwrap().current_booking, 1);
    assert!(!h.lock.is_held(FLIGHT));
}

#[tokio::test(start_paused = true)]
async fn test_periodic_flush_persists_mid_drain() {
    let config = ProcessorConfig {
        flush_every: 1,
        max_empty_attempts: 1_000,
        ..test_config()
    };
    let h = Arc::new(harness(5, 5, 0, config));
    enqueue(&h, 2).await;
    let stop = CancellationToken::new();

    let runner = {
        let h = Arc::clone(&h);
        let stop = stop.clone();
        tokio::spawn(async move { h.processor.run(FLIGHT, stop).await })
    };
    wait_for_records(&h, 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(h.lock.is_held(FLIGHT));
    assert_eq!(h.ledger.snapshot(FLIGHT).unwrap().current_booking, 2);

    stop.cancel();
    runner.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_crash_drift_is_bounded_by_unflushed_decisions() {
    let config = ProcessorConfig {
        max_empty_attempts: 1_000,
        ..test_config()
    };
    let h = Arc::new(harness(5, 5, 1, config));
    enqueue(&h, 3).await;

    let runner = {
        let h = Arc::clone(&h);
        tokio::spawn(async move { h.processor.run(FLIGHT, CancellationToken::new()).await })
    };
    wait_for_records(&h, 3).await;
    runner.abort();
    let _ = runner.await;

    let ledger_count = h.ledger.snapshot(FLIGHT).unwrap().current_booking;
    let admitted = h
        .store
        .for_flight(FLIGHT)
        .iter()
        .filter(|b| b.status.takes_seat())
        .count() as i32;
    assert_eq!(ledger_count, 1);
    assert_eq!(admitted, 3);
    assert!(admitted + 1 - ledger_count <= 3);

    h.lock.expire(FLIGHT);
    let next = h.processor.run(FLIGHT, CancellationToken::new()).await;
    assert!(next.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_registry_trigger_and_stop() {
    let config = ProcessorConfig {
        max_empty_attempts: 1_000,
        ..test_config()
    };
    let h = harness(5, 5, 0, config);
    let registry = AdmissionRegistry::new(h.processor.clone());

    let handle = registry.trigger(FLIGHT).await.unwrap();
    assert!(registry.is_running(FLIGHT).await);
    assert!(matches!(registry.trigger(FLIGHT).await, Err(AdmissionError::AlreadyLocked(FLIGHT))));
    assert!(matches!(registry.stop(7).await, Err(AdmissionError::NotRunning(7))));

    registry.stop(FLIGHT).await.unwrap();
    let report = handle.await.unwrap().unwrap();
    assert_eq!(report.end, DrainEnd::Stopped);
    assert!(!registry.is_running(FLIGHT).await);
}

#[tokio::test(start_paused = true)]
async fn test_producer_queues_and_triggers() {
    let h = harness(1, 2, 0, test_config());
    let registry = AdmissionRegistry::new(h.processor.clone());
    let producer = BookingProducer::new(registry.clone());

    let first = producer.submit(FLIGHT, "alice").await.unwrap();
    let second = producer.submit(FLIGHT, "bob").await.unwrap();
    let third = producer.submit(FLIGHT, "carol").await.unwrap();
    assert_eq!(first.trigger, TriggerOutcome::Started);
    assert_eq!(second.trigger, TriggerOutcome::AlreadyProcessing);
    assert_eq!(third.trigger, TriggerOutcome::AlreadyProcessing);

    while registry.is_running(FLIGHT).await {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let status = |id: overbook_core::BookingId| {
        let store = h.store.clone();
        async move { store.get(id).await.unwrap().unwrap().status }
    };
    assert_eq!(status(first.booking_id).await, BookingStatus::Booked);
    assert_eq!(status(second.booking_id).await, BookingStatus::Oversold);
    assert_eq!(status(third.booking_id).await, BookingStatus::Failed);
    assert_eq!(h.ledger.snapshot(FLIGHT).unwrap().current_booking, 2);

    assert!(matches!(
        producer.submit(999, "dave").await,
        Err(AdmissionError::FlightNotFound(999))
    ));
}

/// Grants and releases normally, but every renewal hits an unreachable backend.
struct UnrenewableLock {
    inner: MemoryLock,
}

#[async_trait]
impl AdmissionLock for UnrenewableLock {
    async fn try_acquire(&self, flight_id: FlightId, ttl: Duration) -> Result<LockToken, LockError> {
        self.inner.try_acquire(flight_id, ttl).await
    }

    async fn extend(&self, _flight_id: FlightId, _token: &LockToken, _ttl: Duration) -> Result<(), LockError> {
        Err(LockError::Backend("connection refused".to_string()))
    }

    async fn release(&self, flight_id: FlightId, token: &LockToken) -> Result<(), LockError> {
        self.inner.release(flight_id, token).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_unconfirmed_renewals_end_drain_before_ttl() {
    let config = ProcessorConfig {
        max_empty_attempts: 100,
        ..test_config()
    };
    let ttl = config.lock_ttl;
    let ledger = Arc::new(MemoryLedger::new());
    ledger.insert(flight(1, 2, 0));
    let queue = MemoryQueue::new();
    queue.enqueue(FLIGHT, &BookingRequest::new("early")).await.unwrap();
    let processor = AdmissionProcessor::new(
        ledger.clone(),
        Arc::new(MemoryBookingStore::new()),
        Arc::new(UnrenewableLock { inner: MemoryLock::new() }),
        Arc::new(queue.clone()),
        config,
    );

    let started = Instant::now();
    let result = processor.run(FLIGHT, CancellationToken::new()).await;

    assert!(matches!(result, Err(AdmissionError::LeaseLost(FLIGHT))));
    assert!(started.elapsed() < ttl);
    // Nothing is flushed under a lease that may already belong to someone else.
    assert_eq!(ledger.snapshot(FLIGHT).unwrap().current_booking, 0);
}

/// Holds every counter flush for a while so triggers can land mid-flush.
struct SlowFlushLedger {
    inner: MemoryLedger,
    flushes_started: AtomicUsize,
}

#[async_trait]
impl FlightLedger for SlowFlushLedger {
    async fn get_flight(&self, flight_id: FlightId) -> Result<Flight, LedgerError> {
        self.inner.get_flight(flight_id).await
    }

    async fn update_counter(&self, flight_id: FlightId, current_booking: i32) -> Result<(), LedgerError> {
        self.inner.update_counter(flight_id, current_booking).await
    }

    async fn compare_and_set_counter(
        &self,
        flight_id: FlightId,
        expected: i32,
        current_booking: i32,
    ) -> Result<(), LedgerError> {
        self.flushes_started.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(2)).await;
        self.inner.compare_and_set_counter(flight_id, expected, current_booking).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_request_queued_during_flush_is_decided() {
    let ledger = Arc::new(SlowFlushLedger {
        inner: MemoryLedger::new(),
        flushes_started: AtomicUsize::new(0),
    });
    ledger.inner.insert(flight(5, 5, 0));
    let store = Arc::new(MemoryBookingStore::new());
    let processor = AdmissionProcessor::new(
        ledger.clone(),
        store.clone(),
        Arc::new(MemoryLock::new()),
        Arc::new(MemoryQueue::new()),
        test_config(),
    );
    let registry = AdmissionRegistry::new(processor);
    let producer = BookingProducer::new(registry.clone());

    let early = producer.submit(FLIGHT, "early").await.unwrap();
    assert_eq!(early.trigger, TriggerOutcome::Started);

    while ledger.flushes_started.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let late = producer.submit(FLIGHT, "late").await.unwrap();
    assert_eq!(late.trigger, TriggerOutcome::AlreadyProcessing);

    while registry.is_running(FLIGHT).await {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let late_record = store.get(late.booking_id).await.unwrap().unwrap();
    assert_eq!(late_record.status, BookingStatus::Booked);
    assert_eq!(store.len(), 2);
    assert_eq!(ledger.inner.snapshot(FLIGHT).unwrap().current_booking, 2);
}

#[tokio::test(start_paused = true)]
async fn test_registry_drains_again_after_failed_write() {
    let h = harness(5, 5, 0, test_config());
    let requests = enqueue(&h, 2).await;
    h.store.fail_next_puts(1);
    let registry = AdmissionRegistry::new(h.processor.clone());

    let handle = registry.trigger(FLIGHT).await.unwrap();
    let report = handle.await.unwrap().unwrap();

    assert_eq!(report.end, DrainEnd::QueueIdle);
    assert!(!registry.is_running(FLIGHT).await);
    for request in &requests {
        assert_eq!(status_of(&h, request).await, BookingStatus::Booked);
    }
    assert_eq!(h.ledger.snapshot(FLIGHT).unwrap().current_booking, 2);
}

/// A ledger whose reads never come back.
struct StalledLedger;

#[async_trait]
impl FlightLedger for StalledLedger {
    async fn get_flight(&self, _flight_id: FlightId) -> Result<Flight, LedgerError> {
        std::future::pending().await
    }

    async fn update_counter(&self, _flight_id: FlightId, _current_booking: i32) -> Result<(), LedgerError> {
        std::future::pending().await
    }

    async fn compare_and_set_counter(
        &self,
        _flight_id: FlightId,
        _expected: i32,
        _current_booking: i32,
    ) -> Result<(), LedgerError> {
        std::future::pending().await
    }
}

#[tokio::test(start_paused = true)]
async fn test_submit_gives_up_on_stalled_ledger() {
    let config = test_config();
    let store_timeout = config.store_timeout;
    let queue = MemoryQueue::new();
    let processor = AdmissionProcessor::new(
        Arc::new(StalledLedger),
        Arc::new(MemoryBookingStore::new()),
        Arc::new(MemoryLock::new()),
        Arc::new(queue.clone()),
        config,
    );
    let producer = BookingProducer::new(AdmissionRegistry::new(processor));

    let started = Instant::now();
    let result = producer.submit(FLIGHT, "alice").await;

    assert!(matches!(result, Err(AdmissionError::LedgerRead(_))));
    assert!(started.elapsed() >= store_timeout);
    assert!(started.elapsed() < store_timeout + Duration::from_secs(1));
    assert_eq!(queue.depth(FLIGHT), 0);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_submissions_respect_capacity() {
    let h = harness(3, 5, 1, test_config());
    let registry = AdmissionRegistry::new(h.processor.clone());
    let producer = BookingProducer::new(registry.clone());

    let mut tasks = Vec::new();
    for i in 0..8 {
        let producer = producer.clone();
        tasks.push(tokio::spawn(async move {
            producer.submit(FLIGHT, &format!("customer-{}", i)).await
        }));
    }
    for task in tasks {
        let submission = task.await.unwrap().unwrap();
        assert!(!matches!(submission.trigger, TriggerOutcome::Deferred(_)));
    }

    while registry.is_running(FLIGHT).await {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let records = h.store.for_flight(FLIGHT);
    let count = |status: BookingStatus| records.iter().filter(|b| b.status == status).count();
    assert_eq!(records.len(), 8);
    assert_eq!(count(BookingStatus::Booked), 2);
    assert_eq!(count(BookingStatus::Oversold), 2);
    assert_eq!(count(BookingStatus::Failed), 4);
    assert_eq!(h.ledger.snapshot(FLIGHT).unwrap().current_booking, 5);
}
