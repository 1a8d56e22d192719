use async_trait::async_trait;
use redis::{AsyncCommands, RedisResult};
use std::time::Duration;
use tracing::info;

use overbook_core::repository::{AdmissionLock, LockError, LockToken};
use overbook_core::{BookingId, BookingStatus, FlightId};

// Delete only if the key still carries our token.
const RELEASE_SCRIPT: &str = r#"
    if redis.call("GET", KEYS[1]) == ARGV[1] then
        return redis.call("DEL", KEYS[1])
    else
        return 0
    end
"#;

// Push the expiry out only if the key still carries our token.
const EXTEND_SCRIPT: &str = r#"
    if redis.call("GET", KEYS[1]) == ARGV[1] then
        return redis.call("PEXPIRE", KEYS[1], ARGV[2])
    else
        return 0
    end
"#;

fn lock_key(flight_id: FlightId) -> String {
    format!("flight:{}:admission", flight_id)
}

fn status_key(booking_id: BookingId) -> String {
    format!("booking:{}:status", booking_id)
}

fn ttl_millis(ttl: Duration) -> u64 {
    ttl.as_millis().max(1) as u64
}

#[derive(Clone)]
pub struct RedisClient {
    client: redis::Client,
}

impl RedisClient {
    pub async fn new(connection_string: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(connection_string)?;
        Ok(Self { client })
    }

    /// SET NX PX: only set if the key does not exist.
    pub async fn acquire_flight_lock(&self, flight_id: FlightId, token: &str, ttl: Duration) -> RedisResult<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let result: Option<String> = redis::cmd("SET")
            .arg(lock_key(flight_id))
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;

        Ok(result.is_some())
    }

    pub async fn extend_flight_lock(&self, flight_id: FlightId, token: &str, ttl: Duration) -> RedisResult<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let extended: i64 = redis::Script::new(EXTEND_SCRIPT)
            .key(lock_key(flight_id))
            .arg(token)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(extended == 1)
    }

    pub async fn release_flight_lock(&self, flight_id: FlightId, token: &str) -> RedisResult<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let deleted: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(lock_key(flight_id))
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    pub async fn get_cached_status(&self, booking_id: BookingId) -> RedisResult<Option<String>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.get(status_key(booking_id)).await
    }

    /// Booking outcomes never change once written, so a short TTL only bounds memory.
    pub async fn cache_status(&self, booking_id: BookingId, status: BookingStatus, ttl_seconds: u64) -> RedisResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.set_ex::<_, _, ()>(status_key(booking_id), status.as_str(), ttl_seconds).await?;
        info!("Cached status {} for booking {}", status, booking_id);
        Ok(())
    }
}

/// Admission lock backed by a single Redis key per flight.
#[derive(Clone)]
pub struct RedisAdmissionLock {
    redis: RedisClient,
}

impl RedisAdmissionLock {
    pub fn new(redis: RedisClient) -> Self {
        Self { redis }
    }
}

fn backend(e: redis::RedisError) -> LockError {
    LockError::Backend(e.to_string())
}

#[async_trait]
impl AdmissionLock for RedisAdmissionLock {
    async fn try_acquire(&self, flight_id: FlightId, ttl: Duration) -> Result<LockToken, LockError> {
        let token = LockToken::generate();
        if self
            .redis
            .acquire_flight_lock(flight_id, token.as_str(), ttl)
            .await
            .map_err(backend)?
        {
            Ok(token)
        } else {
            Err(LockError::AlreadyHeld(flight_id))
        }
    }

    async fn extend(&self, flight_id: FlightId, token: &LockToken, ttl: Duration) -> Result<(), LockError> {
        if self
            .redis
            .extend_flight_lock(flight_id, token.as_str(), ttl)
            .await
            .map_err(backend)?
        {
            Ok(())
        } else {
            Err(LockError::NotHeld(flight_id))
        }
    }

    async fn release(&self, flight_id: FlightId, token: &LockToken) -> Result<(), LockError> {
        if self
            .redis
            .release_flight_lock(flight_id, token.as_str())
            .await
            .map_err(backend)?
        {
            Ok(())
        } else {
            Err(LockError::NotHeld(flight_id))
        }
    }
}
