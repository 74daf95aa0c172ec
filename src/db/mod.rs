// SPDX-License-Identifier: MIT

//! Durable document store: the cold tier behind the volatile cache.
//!
//! Components consume the store through the [`DocStore`] capability
//! trait and never see past it. [`MongoDocStore`] is the production
//! implementation: a MongoDB database with last-touched TTL indexes, a
//! capped event collection, and a tailable cursor feeding live event
//! subscriptions. [`MemoryDocStore`] is the in-process implementation
//! for tests and offline use, with the same retention semantics.
//!
//! Collections:
//! - `index`: activity index entries, TTL on `ts`
//! - `activities`: compressed stream documents, TTL on `ts`
//! - `history`: capped event log, natural insertion order

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::config::Config;
use crate::error::Result;
use crate::models::{ActivityId, ActivityIndexEntry, EventRecord, UserId};

pub mod memory;
pub mod mongo;

pub use memory::MemoryDocStore;
pub use mongo::MongoDocStore;

/// Retention and capacity settings for the store.
#[derive(Debug, Clone)]
pub struct Retention {
    /// Index entries older than this (by last-touched `ts`) are purged.
    pub index: Duration,
    /// Stream documents older than this (by last-touched `ts`) are purged.
    pub streams: Duration,
    /// Maximum records in the capped event collection.
    pub event_capacity: usize,
}

impl Retention {
    /// Retention windows as configured.
    pub fn from_config(config: &Config) -> Self {
        Self {
            index: config.store_index_ttl,
            streams: config.store_activities_ttl,
            event_capacity: config.event_log_capacity,
        }
    }
}

/// Document-store capability consumed by the index, cache, and event
/// log. Mirrors the [`KvStore`](crate::store::KvStore) seam for the
/// volatile tier.
#[async_trait]
pub trait DocStore: Send + Sync {
    // Index collection.

    /// Upsert by activity id (store-native atomic replace).
    async fn upsert_index_entry(&self, entry: ActivityIndexEntry) -> Result<()>;

    /// Unordered bulk upsert.
    async fn bulk_upsert_index(&self, entries: Vec<ActivityIndexEntry>) -> Result<usize>;

    async fn get_index_entry(&self, id: ActivityId) -> Result<Option<ActivityIndexEntry>>;

    /// Snapshot of all index entries owned by a user.
    async fn index_entries_for_user(&self, user_id: UserId) -> Result<Vec<ActivityIndexEntry>>;

    /// Apply field deltas to one entry. Returns whether a matching
    /// document existed.
    async fn update_index_entry(
        &self,
        id: ActivityId,
        fields: HashMap<String, serde_json::Value>,
    ) -> Result<bool>;

    /// Delete one entry; absent ids are a no-op.
    async fn delete_index_entry(&self, id: ActivityId) -> Result<bool>;

    async fn delete_index_for_user(&self, user_id: UserId) -> Result<u64>;

    async fn count_index_for_user(&self, user_id: UserId) -> Result<u64>;

    /// Batched last-touched refresh for the given ids.
    async fn touch_index_entries(&self, ids: &[ActivityId], ts: DateTime<Utc>) -> Result<()>;

    // Stream collection.

    /// Upsert a serialized stream document with a fresh touch timestamp.
    async fn upsert_stream(&self, id: ActivityId, bytes: Vec<u8>) -> Result<()>;

    /// Fetch one stream document, refreshing its touch timestamp.
    async fn fetch_stream_and_touch(&self, id: ActivityId) -> Result<Option<Vec<u8>>>;

    /// Fetch a batch of stream documents, refreshing each touch
    /// timestamp. Missing ids are simply absent from the result.
    async fn fetch_streams_and_touch(
        &self,
        ids: &[ActivityId],
    ) -> Result<Vec<(ActivityId, Vec<u8>)>>;

    /// Number of stream documents currently retained.
    async fn stream_count(&self) -> Result<u64>;

    // Event collection (capped).

    /// Append to the capped log; once at capacity the oldest records
    /// are evicted. Live subscribers see the insert.
    async fn append_event(&self, record: EventRecord) -> Result<()>;

    /// Most recent `limit` events, newest-first. Zero means unlimited.
    async fn recent_events(&self, limit: usize) -> Result<Vec<EventRecord>>;

    /// Point read by insertion timestamp.
    async fn event_at(&self, ts: DateTime<Utc>) -> Result<Option<EventRecord>>;

    /// Events strictly after the given timestamp, oldest-first. Used by
    /// tail subscriptions to catch up before switching to live inserts.
    async fn events_after(&self, ts: DateTime<Utc>) -> Result<Vec<EventRecord>>;

    /// Tailable subscription to event inserts.
    fn subscribe_events(&self) -> broadcast::Receiver<EventRecord>;

    // TTL maintenance.

    /// Remove documents whose last-touched timestamp fell out of the
    /// retention window. Returns (index purged, streams purged).
    async fn purge_expired(&self) -> Result<(u64, u64)>;
}

/// Background TTL sweeper for stores without a native TTL monitor (the
/// MongoDB implementation has one; sweeping it again is a cheap no-op).
/// Runs until the returned handle is aborted.
pub fn spawn_ttl_sweeper(
    db: Arc<dyn DocStore>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = db.purge_expired().await {
                tracing::warn!(error = %e, "TTL sweep failed");
            }
        }
    })
}
