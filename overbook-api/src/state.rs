use std::sync::Arc;
use overbook_admission::{AdmissionRegistry, BookingProducer};
use overbook_store::RedisClient;

#[derive(Clone)]
pub struct StatusCache {
    pub redis: Arc<RedisClient>,
    pub ttl_seconds: u64,
}

#[derive(Clone)]
pub struct AppState {
    pub registry: AdmissionRegistry,
    pub producer: BookingProducer,
    /// Short-lived status lookups; `None` reads the store every time.
    pub status_cache: Option<StatusCache>,
}

impl AppState {
    pub fn new(registry: AdmissionRegistry, status_cache: Option<StatusCache>) -> Self {
        let producer = BookingProducer::new(registry.clone());
        Self {
            registry,
            producer,
            status_cache,
        }
    }
}
