// SPDX-License-Identifier: MIT

//! Tracklog: activity index and stream cache engine.
//!
//! Maintains a per-user index of activity metadata, a two-tier cache of
//! compressed GPS stream payloads, and the import pipeline that fills
//! both from an upstream fitness API. A capped event log records what
//! the engine does; webhook notifications keep the index current
//! without polling.

pub mod cache;
pub mod codec;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod import;
pub mod index;
pub mod models;
pub mod store;
pub mod upstream;
pub mod webhook;

use std::sync::Arc;

use cache::StreamCache;
use config::Config;
use db::{DocStore, MemoryDocStore, MongoDocStore, Retention};
use events::EventLog;
use import::Importer;
use index::ActivityIndex;
use store::{KvStore, MemoryKv, RedisKv};
use webhook::WebhookHandler;

pub use error::{EngineError, Result};

/// How often the background sweep purges durable documents that fell
/// out of their retention window.
const TTL_SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(600);

/// The wired-up engine: every component sharing one store pair.
#[derive(Clone)]
pub struct Engine {
    pub config: Arc<Config>,
    pub db: Arc<dyn DocStore>,
    pub index: ActivityIndex,
    pub cache: StreamCache,
    pub events: EventLog,
    pub importer: Importer,
    pub webhooks: WebhookHandler,
}

impl Engine {
    /// Build an engine on the given store pair.
    pub fn with_stores(config: Config, kv: Arc<dyn KvStore>, db: Arc<dyn DocStore>) -> Self {
        let config = Arc::new(config);

        let index = ActivityIndex::new(db.clone());
        let cache = StreamCache::new(kv.clone(), db.clone());
        let events = EventLog::new(db.clone());
        let importer = Importer::new(
            config.clone(),
            kv,
            index.clone(),
            cache.clone(),
            events.clone(),
        );
        let webhooks = WebhookHandler::new(index.clone(), importer.clone(), events.clone());

        Self {
            config,
            db,
            index,
            cache,
            events,
            importer,
            webhooks,
        }
    }

    /// Connect to Redis for the volatile tier and MongoDB for the
    /// durable tier, wire everything up, and start the retention sweep.
    pub async fn connect(config: Config) -> Result<Self> {
        let kv = RedisKv::connect(&config.redis_url).await?;
        let db = MongoDocStore::connect(
            &config.mongodb_uri,
            &config.mongodb_database,
            Retention::from_config(&config),
        )
        .await?;
        let engine = Self::with_stores(config, Arc::new(kv), Arc::new(db));
        // Detached; lives as long as the runtime.
        let _ = db::spawn_ttl_sweeper(engine.db.clone(), TTL_SWEEP_INTERVAL);
        Ok(engine)
    }

    /// Fully in-memory engine for tests and offline use.
    pub fn in_memory(config: Config) -> Self {
        let db = MemoryDocStore::new(Retention::from_config(&config));
        Self::with_stores(config, Arc::new(MemoryKv::new()), Arc::new(db))
    }
}

/// Initialize structured JSON logging. Call once at startup; embedders
/// that install their own subscriber should skip this.
pub fn init_logging() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let format = tracing_subscriber::fmt::layer()
        .json()
        .with_target(false)
        .with_current_span(true)
        .flatten_event(true);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into()),
        )
        .with(format)
        .init();
}
