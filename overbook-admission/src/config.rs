use serde::Deserialize;
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Tuning for a single admission run.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Bounded wait for each dequeue.
    pub wait_timeout: Duration,
    /// Consecutive empty dequeues before the drain ends.
    pub max_empty_attempts: u32,
    pub lock_ttl: Duration,
    /// How often the lease is extended while draining.
    pub lease_renew_interval: Duration,
    /// Flush the counter after this many counted decisions; 0 flushes only at drain exit.
    pub flush_every: u32,
    /// Upper bound for any single ledger or store call.
    pub store_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            wait_timeout: Duration::from_secs(1),
            max_empty_attempts: 15,
            lock_ttl: Duration::from_secs(30),
            lease_renew_interval: Duration::from_secs(10),
            flush_every: 0,
            store_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }
}

impl ProcessorConfig {
    /// The lease must outlive the longest gap between two renewals.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_empty_attempts == 0 {
            return Err("max_empty_attempts must be at least 1".to_string());
        }
        if self.wait_timeout.is_zero() {
            return Err("wait_timeout must be positive".to_string());
        }
        let worst_gap = self.lease_renew_interval + self.wait_timeout + self.store_timeout * 2;
        if self.lock_ttl <= worst_gap {
            return Err(format!(
                "lock_ttl {:?} must exceed renew interval + wait + two store calls ({:?})",
                self.lock_ttl, worst_gap
            ));
        }
        Ok(())
    }

    /// Upper bound on how long an idle queue keeps a run alive.
    pub fn idle_drain_bound(&self) -> Duration {
        self.wait_timeout * self.max_empty_attempts
    }
}

/// Millisecond-based form used in configuration files.
#[derive(Debug, Clone, Deserialize)]
pub struct AdmissionSettings {
    #[serde(default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: u64,
    #[serde(default = "default_max_empty_attempts")]
    pub max_empty_attempts: u32,
    #[serde(default = "default_lock_ttl_ms")]
    pub lock_ttl_ms: u64,
    #[serde(default = "default_lease_renew_interval_ms")]
    pub lease_renew_interval_ms: u64,
    #[serde(default)]
    pub flush_every: u32,
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_wait_timeout_ms() -> u64 { 1_000 }
fn default_max_empty_attempts() -> u32 { 15 }
fn default_lock_ttl_ms() -> u64 { 30_000 }
fn default_lease_renew_interval_ms() -> u64 { 10_000 }
fn default_store_timeout_ms() -> u64 { 5_000 }
fn default_retry_attempts() -> u32 { 10 }
fn default_retry_delay_ms() -> u64 { 5_000 }

impl From<AdmissionSettings> for ProcessorConfig {
    fn from(s: AdmissionSettings) -> Self {
        Self {
            wait_timeout: Duration::from_millis(s.wait_timeout_ms),
            max_empty_attempts: s.max_empty_attempts,
            lock_ttl: Duration::from_millis(s.lock_ttl_ms),
            lease_renew_interval: Duration::from_millis(s.lease_renew_interval_ms),
            flush_every: s.flush_every,
            store_timeout: Duration::from_millis(s.store_timeout_ms),
            retry: RetryPolicy {
                attempts: s.retry_attempts.max(1),
                delay: Duration::from_millis(s.retry_delay_ms),
            },
        }
    }
}
