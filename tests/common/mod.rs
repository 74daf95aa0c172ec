// SPDX-License-Identifier: MIT

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use tracklog::config::Config;
use tracklog::db::{MemoryDocStore, Retention};
use tracklog::error::{EngineError, Result};
use tracklog::models::{ActivityId, ActivityIndexEntry, UserId};
use tracklog::store::MemoryKv;
use tracklog::upstream::{RawStream, SummaryFilters, UpstreamActivity, UpstreamClient};
use tracklog::Engine;

/// Fully in-memory engine with test defaults.
#[allow(dead_code)]
pub fn test_engine() -> Engine {
    Engine::in_memory(Config::test_default())
}

#[allow(dead_code)]
pub fn test_engine_with(config: Config) -> Engine {
    Engine::in_memory(config)
}

/// In-memory engine plus a handle on its durable store, for tests that
/// toggle the store offline or share it across engines.
#[allow(dead_code)]
pub fn test_engine_parts() -> (Engine, Arc<MemoryDocStore>) {
    let config = Config::test_default();
    let db = Arc::new(MemoryDocStore::new(Retention::from_config(&config)));
    let engine = Engine::with_stores(config, Arc::new(MemoryKv::new()), db.clone());
    (engine, db)
}

/// An index entry starting on the given June 2024 day.
#[allow(dead_code)]
pub fn entry(id: ActivityId, user_id: UserId, day: u32) -> ActivityIndexEntry {
    summary(id, day).to_index_entry(user_id)
}

/// An upstream activity summary starting on the given June 2024 day.
#[allow(dead_code)]
pub fn summary(id: ActivityId, day: u32) -> UpstreamActivity {
    let start = NaiveDate::from_ymd_opt(2024, 6, day)
        .expect("valid test date")
        .and_hms_opt(8, 0, 0)
        .expect("valid test time");

    serde_json::from_value(serde_json::json!({
        "id": id,
        "name": format!("ride {id}"),
        "type": "Ride",
        "start_date": start.and_utc().to_rfc3339(),
        "start_date_local": start.format("%Y-%m-%dT%H:%M:%S").to_string(),
        "distance": 10_000.0,
        "elapsed_time": 3600,
        "average_speed": 2.8,
        "start_latlng": [37.4, -122.2],
    }))
    .expect("valid summary JSON")
}

/// A typical raw stream set: a latlng track plus an integer time series.
#[allow(dead_code)]
pub fn raw_streams() -> HashMap<String, RawStream> {
    HashMap::from([
        (
            "latlng".to_string(),
            RawStream::LatLng(vec![[37.4, -122.2], [37.41, -122.21], [37.42, -122.22]]),
        ),
        (
            "time".to_string(),
            RawStream::Ints(vec![0, 4, 8, 12, 16, 21]),
        ),
    ])
}

/// Offline stand-in for the upstream API.
#[derive(Default)]
pub struct MockUpstream {
    /// All summaries, newest-first; paginated by `per_page`.
    pub summaries: Vec<UpstreamActivity>,
    /// Raw streams by activity id; absent ids report "no streams".
    pub streams: HashMap<ActivityId, HashMap<String, RawStream>>,
    /// Ids whose stream fetch fails with a transient upstream error.
    pub fail_streams: HashSet<ActivityId>,
    /// Fail every call with an invalid-credential error.
    pub credential_invalid: bool,
    /// Artificial latency per summary page, for overlap tests.
    pub page_delay: Duration,
    /// Artificial latency per stream fetch, for cancellation tests.
    pub stream_delay: Duration,
    pub summary_calls: AtomicUsize,
    pub stream_calls: AtomicUsize,
}

#[async_trait]
impl UpstreamClient for MockUpstream {
    async fn activity_summaries(
        &self,
        page: u32,
        per_page: u32,
        _filters: SummaryFilters,
    ) -> Result<Vec<UpstreamActivity>> {
        self.summary_calls.fetch_add(1, Ordering::SeqCst);
        if self.credential_invalid {
            return Err(EngineError::CredentialInvalid);
        }
        if !self.page_delay.is_zero() {
            tokio::time::sleep(self.page_delay).await;
        }

        let start = ((page - 1) * per_page) as usize;
        let end = (start + per_page as usize).min(self.summaries.len());
        if start >= self.summaries.len() {
            return Ok(Vec::new());
        }
        Ok(self.summaries[start..end].to_vec())
    }

    async fn activity_streams(
        &self,
        id: ActivityId,
        _names: &[String],
    ) -> Result<Option<HashMap<String, RawStream>>> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        if self.credential_invalid {
            return Err(EngineError::CredentialInvalid);
        }
        if !self.stream_delay.is_zero() {
            tokio::time::sleep(self.stream_delay).await;
        }
        if self.fail_streams.contains(&id) {
            return Err(EngineError::Upstream("stream fetch failed".to_string()));
        }
        Ok(self.streams.get(&id).cloned())
    }

    async fn activity(&self, id: ActivityId) -> Result<UpstreamActivity> {
        if self.credential_invalid {
            return Err(EngineError::CredentialInvalid);
        }
        self.summaries
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("activity {id}")))
    }
}
