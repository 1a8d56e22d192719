use overbook_admission::AdmissionSettings;
use serde::Deserialize;
use std::env;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub kafka: KafkaConfig,
    pub admission: AdmissionSettings,
    #[serde(default)]
    pub status_cache: StatusCacheConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Run against in-process ports instead of Postgres, Redis and Kafka.
    #[serde(default)]
    pub in_memory: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 { 5 }

#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct KafkaConfig {
    pub brokers: String,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    #[serde(default = "default_group_prefix")]
    pub group_prefix: String,
}

fn default_topic_prefix() -> String { "booking.requests".to_string() }
fn default_group_prefix() -> String { "overbook-admission".to_string() }

#[derive(Debug, Deserialize, Clone)]
pub struct StatusCacheConfig {
    pub ttl_seconds: u64,
}

impl Default for StatusCacheConfig {
    fn default() -> Self {
        Self { ttl_seconds: 30 }
    }
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            // Per-environment overrides are optional
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false))
            // Not checked in
            .add_source(config::File::with_name("config/local").required(false))
            // Environment overrides, nested keys split on "__"
            .add_source(config::Environment::with_prefix("OVERBOOK").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}
