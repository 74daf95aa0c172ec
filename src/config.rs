// SPDX-License-Identifier: MIT

//! Engine configuration loaded from environment variables.
//!
//! Timeouts are expressed in seconds to match what the stores expect.

use std::env;
use std::time::Duration;

/// Engine configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Redis connection URL for the volatile cache tier.
    pub redis_url: String,
    /// MongoDB connection URI for the durable document store.
    pub mongodb_uri: String,
    /// MongoDB database name.
    pub mongodb_database: String,
    /// Strava OAuth client ID (public).
    pub strava_client_id: String,
    /// Strava OAuth client secret.
    pub strava_client_secret: String,

    /// Bounded worker pool size for upstream stream fetches.
    pub concurrency: usize,
    /// Page size for paginated upstream summary listing.
    pub fetch_page_size: u32,

    /// Volatile-tier TTL for cached activity streams.
    pub cache_activities_ttl: Duration,
    /// Durable-tier retention window for activity stream documents.
    pub store_activities_ttl: Duration,
    /// Durable-tier retention window for activity index entries.
    pub store_index_ttl: Duration,
    /// TTL of the per-user "currently indexing" marker.
    pub indexing_flag_ttl: Duration,

    /// Maximum number of records retained by the capped event log.
    pub event_log_capacity: usize,

    /// Stream names fetched from upstream and cached per activity.
    pub streams_to_cache: Vec<String>,
    /// Stream names merged into records yielded to callers.
    pub streams_out: Vec<String>,
}

impl Default for Config {
    /// Default config for testing only.
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            mongodb_uri: "mongodb://127.0.0.1:27017".to_string(),
            mongodb_database: "tracklog".to_string(),
            strava_client_id: "test_client_id".to_string(),
            strava_client_secret: "test_secret".to_string(),
            concurrency: 4,
            fetch_page_size: 200,
            cache_activities_ttl: Duration::from_secs(12 * 60 * 60),
            store_activities_ttl: Duration::from_secs(3 * 24 * 60 * 60),
            store_index_ttl: Duration::from_secs(10 * 24 * 60 * 60),
            indexing_flag_ttl: Duration::from_secs(60),
            event_log_capacity: 4096,
            streams_to_cache: vec!["polyline".to_string(), "time".to_string()],
            streams_out: vec!["polyline".to_string(), "time".to_string()],
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Only the Strava credentials are required; anything else unset
    /// falls back to the defaults above.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok(); // Load .env file if present

        let defaults = Self::default();

        Ok(Self {
            redis_url: env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            mongodb_uri: env::var("MONGODB_URI").unwrap_or(defaults.mongodb_uri),
            mongodb_database: env::var("MONGODB_DATABASE").unwrap_or(defaults.mongodb_database),
            strava_client_id: env::var("STRAVA_CLIENT_ID")
                .map_err(|_| ConfigError::Missing("STRAVA_CLIENT_ID"))?,
            strava_client_secret: env::var("STRAVA_CLIENT_SECRET")
                .map(|v| v.trim().to_string())
                .map_err(|_| ConfigError::Missing("STRAVA_CLIENT_SECRET"))?,
            concurrency: env_parse("IMPORT_CONCURRENCY", defaults.concurrency),
            fetch_page_size: env_parse("FETCH_PAGE_SIZE", defaults.fetch_page_size),
            cache_activities_ttl: env_secs("CACHE_ACTIVITIES_TIMEOUT", defaults.cache_activities_ttl),
            store_activities_ttl: env_secs("STORE_ACTIVITIES_TIMEOUT", defaults.store_activities_ttl),
            store_index_ttl: env_secs("STORE_INDEX_TIMEOUT", defaults.store_index_ttl),
            indexing_flag_ttl: defaults.indexing_flag_ttl,
            event_log_capacity: env_parse("EVENT_LOG_CAPACITY", defaults.event_log_capacity),
            streams_to_cache: env_list("STREAMS_TO_CACHE", &defaults.streams_to_cache),
            streams_out: env_list("STREAMS_OUT", &defaults.streams_out),
        })
    }

    /// Default config for tests; alias kept for readability at call sites.
    pub fn test_default() -> Self {
        Self::default()
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn env_list(key: &str, default: &[String]) -> Vec<String> {
    env::var(key)
        .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
        .unwrap_or_else(|_| default.to_vec())
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
}
