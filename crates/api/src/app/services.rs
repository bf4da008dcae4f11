//! Service wiring for the HTTP process.
//!
//! `DATABASE_URL` selects Postgres stores (otherwise in-memory), `REDIS_URL`
//! selects the Redis broker and turns on telemetry ingestion. Background tasks
//! are returned separately so `main` can stop them after the server drains.

use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use wattloop_infra::buffer::TelemetryBuffer;
use wattloop_infra::config::AppConfig;
use wattloop_infra::discovery::{DiscoveringStatusSink, DiscoveryCache, DEFAULT_MAX_PER_GATEWAY};
use wattloop_infra::events::{EventSink, TracingEventSink};
use wattloop_infra::ingestion::{
    Broker, InMemoryBroker, InMemoryDeviceRegistry, IngestionHandle, IngestionListener,
    StatusSink,
};
use wattloop_infra::pg;
use wattloop_infra::services::{
    CommandDispatcher, RecommendationService, RewardService, StreakService,
};
use wattloop_infra::store::{
    CommandStore, InMemoryCommandStore, InMemoryRecommendationStore, InMemoryRewardLedgerStore,
    InMemoryStreakStore, PostgresCommandStore, PostgresRecommendationStore,
    PostgresRewardLedgerStore, PostgresStreakStore, RecommendationStore, RewardLedgerStore,
    StreakStore,
};
use wattloop_infra::sweeper::{spawn_discovery_eviction, spawn_timeout_sweeper};
use wattloop_infra::telemetry_store::{
    InMemoryTelemetryStore, PostgresTelemetryStore, TelemetryStore,
};
use wattloop_infra::transport::BrokerTransport;
use wattloop_infra::worker::WorkerHandle;

/// Shared state handed to every handler.
pub struct AppServices {
    pub telemetry: Arc<dyn TelemetryStore>,
    /// Device/gateway lookups. Records are registered through `/devices`.
    pub registry: Arc<InMemoryDeviceRegistry>,
    /// Devices gateways reported but nobody has claimed yet.
    pub discovery: Arc<DiscoveryCache>,
    /// Where gateway and device status messages land; fills `discovery`.
    pub status: Arc<dyn StatusSink>,
    pub recommendations: Arc<RecommendationService>,
    pub dispatcher: Arc<CommandDispatcher>,
    pub rewards: Arc<RewardService>,
    pub streaks: Arc<StreakService>,
}

/// Long-running tasks started alongside the services.
pub struct BackgroundTasks {
    ingestion: Option<IngestionHandle>,
    sweeper: WorkerHandle,
    discovery_eviction: WorkerHandle,
}

impl BackgroundTasks {
    pub async fn shutdown(self) {
        if let Some(ingestion) = self.ingestion {
            ingestion.shutdown().await;
        }
        self.sweeper.shutdown().await;
        self.discovery_eviction.shutdown().await;
        info!("background tasks stopped");
    }
}

struct Stores {
    telemetry: Arc<dyn TelemetryStore>,
    recommendations: Arc<dyn RecommendationStore>,
    commands: Arc<dyn CommandStore>,
    ledger: Arc<dyn RewardLedgerStore>,
    streaks: Arc<dyn StreakStore>,
}

impl Stores {
    fn in_memory() -> Self {
        Self {
            telemetry: Arc::new(InMemoryTelemetryStore::new()),
            recommendations: Arc::new(InMemoryRecommendationStore::new()),
            commands: Arc::new(InMemoryCommandStore::new()),
            ledger: Arc::new(InMemoryRewardLedgerStore::new()),
            streaks: Arc::new(InMemoryStreakStore::new()),
        }
    }

    async fn postgres(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .context("failed to connect to Postgres")?;
        pg::migrate(&pool)
            .await
            .context("failed to apply schema")?;

        Ok(Self {
            telemetry: Arc::new(PostgresTelemetryStore::new(pool.clone())),
            recommendations: Arc::new(PostgresRecommendationStore::new(pool.clone())),
            commands: Arc::new(PostgresCommandStore::new(pool.clone())),
            ledger: Arc::new(PostgresRewardLedgerStore::new(pool.clone())),
            streaks: Arc::new(PostgresStreakStore::new(pool)),
        })
    }
}

#[cfg(feature = "redis")]
fn connect_broker(config: &AppConfig) -> anyhow::Result<(Arc<dyn Broker>, bool)> {
    match &config.redis_url {
        Some(url) => {
            let broker = wattloop_infra::ingestion::RedisBroker::new(url)
                .context("failed to create Redis broker")?;
            Ok((Arc::new(broker), true))
        }
        None => Ok((Arc::new(InMemoryBroker::new()), false)),
    }
}

#[cfg(not(feature = "redis"))]
fn connect_broker(config: &AppConfig) -> anyhow::Result<(Arc<dyn Broker>, bool)> {
    if config.redis_url.is_some() {
        tracing::warn!("REDIS_URL set but redis feature not enabled, ingestion disabled");
    }
    Ok((Arc::new(InMemoryBroker::new()), false))
}

/// Build the services and start the background tasks. Must run inside a Tokio runtime.
pub async fn build_services(config: &AppConfig) -> anyhow::Result<(AppServices, BackgroundTasks)> {
    let stores = match &config.database_url {
        Some(url) => {
            info!("using Postgres stores");
            Stores::postgres(url).await?
        }
        None => {
            tracing::warn!("DATABASE_URL not set; using in-memory stores");
            Stores::in_memory()
        }
    };

    let (broker, ingest) = connect_broker(config)?;
    let registry = Arc::new(InMemoryDeviceRegistry::new());
    let events: Arc<dyn EventSink> = Arc::new(TracingEventSink);
    let discovery = Arc::new(DiscoveryCache::new(
        config.discovery_ttl,
        DEFAULT_MAX_PER_GATEWAY,
    ));
    let status: Arc<dyn StatusSink> = Arc::new(DiscoveringStatusSink::new(
        Arc::clone(&discovery),
        registry.clone(),
    ));

    let recommendations = Arc::new(RecommendationService::new(
        stores.recommendations,
        Arc::clone(&stores.telemetry),
        Arc::clone(&events),
    ));
    let rewards = Arc::new(RewardService::new(stores.ledger, Arc::clone(&events)));
    let streaks = Arc::new(StreakService::new(stores.streaks, Arc::clone(&events)));
    let dispatcher = Arc::new(CommandDispatcher::new(
        stores.commands,
        Arc::clone(&recommendations),
        registry.clone(),
        Arc::new(BrokerTransport::new(Arc::clone(&broker))),
        Arc::clone(&rewards),
        Arc::clone(&streaks),
        events,
        config.dispatcher,
    ));

    let ingestion = if ingest {
        let buffer = Arc::new(TelemetryBuffer::new(
            Arc::clone(&stores.telemetry),
            config.buffer,
        ));
        let listener = Arc::new(IngestionListener::new(
            broker,
            registry.clone(),
            Arc::clone(&status),
            buffer,
            config.reconnect_policy(),
        ));
        Some(listener.start())
    } else {
        info!("REDIS_URL not set; telemetry ingestion disabled");
        None
    };
    let sweeper = spawn_timeout_sweeper(Arc::clone(&dispatcher), config.sweep_interval);
    let discovery_eviction = spawn_discovery_eviction(Arc::clone(&discovery), config.discovery_ttl);

    let services = AppServices {
        telemetry: stores.telemetry,
        registry,
        discovery,
        status,
        recommendations,
        dispatcher,
        rewards,
        streaks,
    };
    let background = BackgroundTasks {
        ingestion,
        sweeper,
        discovery_eviction,
    };
    Ok((services, background))
}
