use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use overbook_core::{AdmissionError, AdmissionResult, FlightId};

use crate::processor::{AdmissionProcessor, AdmissionReport, AdmissionRun, DrainEnd};

struct RunningRun {
    run_id: Uuid,
    stop: CancellationToken,
    /// A trigger was turned away while this run held the flight.
    pending: bool,
}

type RunningMap = Arc<Mutex<HashMap<FlightId, RunningRun>>>;

/// Starts admission runs in the background and keeps their stop signals.
///
/// Mutual exclusion comes from the admission lock, not from this map; the
/// map lets this process stop what it started and remember triggers that
/// arrived while a run was finishing.
#[derive(Clone)]
pub struct AdmissionRegistry {
    processor: AdmissionProcessor,
    running: RunningMap,
}

impl AdmissionRegistry {
    pub fn new(processor: AdmissionProcessor) -> Self {
        Self {
            processor,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn processor(&self) -> &AdmissionProcessor {
        &self.processor
    }

    /// Locks the flight and spawns its drain.
    ///
    /// `AlreadyLocked` and `FlightNotFound` come back before anything is
    /// spawned. An `AlreadyLocked` against a run of this registry makes that
    /// run drain again before it lets go of the flight. The handle resolves
    /// to the report of the last drain.
    pub async fn trigger(&self, flight_id: FlightId) -> AdmissionResult<JoinHandle<AdmissionResult<AdmissionReport>>> {
        let run = match self.processor.begin(flight_id).await {
            Ok(run) => run,
            Err(e) if e.is_contention() => {
                if self.mark_pending(flight_id).await {
                    return Err(e);
                }
                // A local run may have released the lock since; try once more.
                match self.processor.begin(flight_id).await {
                    Ok(run) => run,
                    Err(e) => {
                        if e.is_contention() {
                            self.mark_pending(flight_id).await;
                        }
                        return Err(e);
                    }
                }
            }
            Err(e) => return Err(e),
        };

        let run_id = Uuid::new_v4();
        let stop = CancellationToken::new();
        self.running.lock().await.insert(
            flight_id,
            RunningRun {
                run_id,
                stop: stop.clone(),
                pending: false,
            },
        );

        let processor = self.processor.clone();
        let running = Arc::clone(&self.running);
        Ok(tokio::spawn(supervise(processor, running, run, run_id, stop)))
    }

    /// Sends the stop signal to a run started by this registry.
    pub async fn stop(&self, flight_id: FlightId) -> AdmissionResult<()> {
        match self.running.lock().await.get(&flight_id) {
            Some(run) => {
                info!("Stopping admission run for flight {}", flight_id);
                run.stop.cancel();
                Ok(())
            }
            None => Err(AdmissionError::NotRunning(flight_id)),
        }
    }

    pub async fn is_running(&self, flight_id: FlightId) -> bool {
        self.running.lock().await.contains_key(&flight_id)
    }

    /// True when a run of this registry holds the flight and will drain again.
    async fn mark_pending(&self, flight_id: FlightId) -> bool {
        match self.running.lock().await.get_mut(&flight_id) {
            Some(run) => {
                run.pending = true;
                true
            }
            None => false,
        }
    }
}

/// Drains, then drains again while triggers were turned away or a record
/// write failed (the latter at most `retry.attempts` times in a row).
async fn supervise(
    processor: AdmissionProcessor,
    running: RunningMap,
    mut run: AdmissionRun,
    run_id: Uuid,
    stop: CancellationToken,
) -> AdmissionResult<AdmissionReport> {
    let flight_id = run.flight_id();
    let retry = processor.config().retry;
    let mut store_failures = 0;

    loop {
        let result = run.drain(stop.clone()).await;
        match &result {
            Ok(report) => info!("Admission run for flight {} finished: {:?}", flight_id, report.end),
            Err(e) => error!("Admission run for flight {} failed: {}", flight_id, e),
        }

        let store_failed = matches!(&result, Ok(report) if matches!(report.end, DrainEnd::StoreWriteFailed(_)));
        store_failures = if store_failed { store_failures + 1 } else { 0 };

        let back_off = {
            let mut map = running.lock().await;
            let pending = match map.get_mut(&flight_id) {
                Some(entry) if entry.run_id == run_id => std::mem::take(&mut entry.pending),
                _ => return result,
            };
            let retry_store = store_failed && retry.allows_retry(store_failures);
            if stop.is_cancelled() || result.is_err() || !(pending || retry_store) {
                map.remove(&flight_id);
                return result;
            }
            !pending
        };

        if back_off {
            warn!(
                "Flight {}: draining again in {:?} after a failed record write ({}/{})",
                flight_id, retry.delay, store_failures, retry.attempts
            );
            tokio::time::sleep(retry.delay).await;
        } else {
            info!("Flight {}: requests arrived while finishing; draining again", flight_id);
        }

        run = match processor.begin(flight_id).await {
            Ok(next) => next,
            Err(e) => {
                warn!("Flight {}: follow-up drain not started: {}", flight_id, e);
                let mut map = running.lock().await;
                if map.get(&flight_id).is_some_and(|r| r.run_id == run_id) {
                    map.remove(&flight_id);
                }
                return result;
            }
        };
    }
}
