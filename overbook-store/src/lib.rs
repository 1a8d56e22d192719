pub mod app_config;
pub mod booking_repo;
pub mod database;
pub mod events;
pub mod flight_repo;
pub mod redis_repo;

pub use booking_repo::PostgresBookingStore;
pub use database::DbClient;
pub use events::KafkaBookingQueue;
pub use flight_repo::PostgresFlightLedger;
pub use redis_repo::{RedisAdmissionLock, RedisClient};
