use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use overbook_admission::memory::{MemoryBookingStore, MemoryLedger, MemoryLock, MemoryQueue};
use overbook_admission::{AdmissionProcessor, AdmissionRegistry, ProcessorConfig};
use overbook_api::{app, seed, AppState, StatusCache};
use overbook_store::app_config::Config;
use overbook_store::{
    DbClient, KafkaBookingQueue, PostgresBookingStore, PostgresFlightLedger, RedisAdmissionLock,
    RedisClient,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "overbook_api=debug,overbook_admission=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().context("Failed to load config")?;
    tracing::info!("Starting Overbook API on port {}", config.server.port);

    let processor_config = ProcessorConfig::from(config.admission.clone());
    processor_config
        .validate()
        .map_err(anyhow::Error::msg)
        .context("Invalid admission settings")?;

    let (processor, status_cache) = if config.server.in_memory {
        tracing::warn!("Running with in-memory ports; nothing survives a restart");
        (in_memory_processor(processor_config), None)
    } else {
        backed_processor(&config, processor_config).await?
    };

    let app_state = AppState::new(AdmissionRegistry::new(processor), status_cache);
    let app = app(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn backed_processor(
    config: &Config,
    processor_config: ProcessorConfig,
) -> anyhow::Result<(AdmissionProcessor, Option<StatusCache>)> {
    // Postgres
    let db = DbClient::new(&config.database.url, config.database.max_connections)
        .await
        .context("Failed to connect to Postgres")?;
    db.migrate().await.context("Failed to run migrations")?;

    // Redis
    let redis = RedisClient::new(&config.redis.url)
        .await
        .context("Failed to connect to Redis")?;

    // Kafka
    let queue = KafkaBookingQueue::new(
        &config.kafka.brokers,
        &config.kafka.topic_prefix,
        &config.kafka.group_prefix,
    )
    .context("Failed to create Kafka producer")?;

    let processor = AdmissionProcessor::new(
        Arc::new(PostgresFlightLedger::new(db.pool.clone())),
        Arc::new(PostgresBookingStore::new(db.pool.clone())),
        Arc::new(RedisAdmissionLock::new(redis.clone())),
        Arc::new(queue),
        processor_config,
    );
    let status_cache = StatusCache {
        redis: Arc::new(redis),
        ttl_seconds: config.status_cache.ttl_seconds,
    };

    Ok((processor, Some(status_cache)))
}

fn in_memory_processor(processor_config: ProcessorConfig) -> AdmissionProcessor {
    let ledger = MemoryLedger::new();
    if let Some(flight) = seed::demo_flight() {
        ledger.insert(flight);
    }

    AdmissionProcessor::new(
        Arc::new(ledger),
        Arc::new(MemoryBookingStore::new()),
        Arc::new(MemoryLock::new()),
        Arc::new(MemoryQueue::new()),
        processor_config,
    )
}
