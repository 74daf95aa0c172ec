// SPDX-License-Identifier: MIT

//! In-process [`DocStore`] implementation for tests and offline use.
//!
//! Carries the same semantics as the server-backed store: last-touched
//! TTL retention enforced by [`purge_expired`](DocStore::purge_expired),
//! a capped event collection with oldest-first eviction, and broadcast
//! event subscriptions. An offline switch lets tests simulate the
//! durable tier being unavailable.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, RwLock};

use crate::error::{EngineError, Result};
use crate::models::{ActivityId, ActivityIndexEntry, EventRecord, UserId};

use super::{DocStore, Retention};

/// A stored stream document: serialized payload plus its touch clock.
#[derive(Debug, Clone)]
struct StreamDoc {
    ts: DateTime<Utc>,
    bytes: Vec<u8>,
}

struct Inner {
    index: RwLock<HashMap<ActivityId, ActivityIndexEntry>>,
    streams: RwLock<HashMap<ActivityId, StreamDoc>>,
    events: RwLock<VecDeque<EventRecord>>,
    event_tx: broadcast::Sender<EventRecord>,
    retention: Retention,
    online: AtomicBool,
}

/// In-memory document store handle. Cheap to clone.
#[derive(Clone)]
pub struct MemoryDocStore {
    inner: Arc<Inner>,
}

impl MemoryDocStore {
    pub fn new(retention: Retention) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                index: RwLock::new(HashMap::new()),
                streams: RwLock::new(HashMap::new()),
                events: RwLock::new(VecDeque::new()),
                event_tx,
                retention,
                online: AtomicBool::new(true),
            }),
        }
    }

    /// Test hook: simulate the durable tier being unavailable. While
    /// offline every operation returns a store error.
    pub fn set_online(&self, online: bool) {
        self.inner.online.store(online, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<()> {
        if self.inner.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EngineError::Store("document store unavailable".to_string()))
        }
    }
}

#[async_trait]
impl DocStore for MemoryDocStore {
    async fn upsert_index_entry(&self, entry: ActivityIndexEntry) -> Result<()> {
        self.check_online()?;
        self.inner.index.write().await.insert(entry.id, entry);
        Ok(())
    }

    async fn bulk_upsert_index(&self, entries: Vec<ActivityIndexEntry>) -> Result<usize> {
        self.check_online()?;
        let mut index = self.inner.index.write().await;
        let count = entries.len();
        for entry in entries {
            index.insert(entry.id, entry);
        }
        Ok(count)
    }

    async fn get_index_entry(&self, id: ActivityId) -> Result<Option<ActivityIndexEntry>> {
        self.check_online()?;
        Ok(self.inner.index.read().await.get(&id).cloned())
    }

    async fn index_entries_for_user(&self, user_id: UserId) -> Result<Vec<ActivityIndexEntry>> {
        self.check_online()?;
        Ok(self
            .inner
            .index
            .read()
            .await
            .values()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn update_index_entry(
        &self,
        id: ActivityId,
        fields: HashMap<String, serde_json::Value>,
    ) -> Result<bool> {
        self.check_online()?;
        let mut index = self.inner.index.write().await;
        let Some(entry) = index.get_mut(&id) else {
            return Ok(false);
        };
        if fields.is_empty() {
            return Ok(true);
        }

        let Ok(mut doc) = serde_json::to_value(&*entry) else {
            return Ok(true);
        };
        if let Some(map) = doc.as_object_mut() {
            for (field, value) in fields {
                map.insert(field, value);
            }
        }
        // A delta with an unknown shape is dropped rather than
        // corrupting the entry.
        if let Ok(updated) = serde_json::from_value(doc) {
            *entry = updated;
        }
        Ok(true)
    }

    async fn delete_index_entry(&self, id: ActivityId) -> Result<bool> {
        self.check_online()?;
        Ok(self.inner.index.write().await.remove(&id).is_some())
    }

    async fn delete_index_for_user(&self, user_id: UserId) -> Result<u64> {
        self.check_online()?;
        let mut index = self.inner.index.write().await;
        let before = index.len();
        index.retain(|_, e| e.user_id != user_id);
        Ok((before - index.len()) as u64)
    }

    async fn count_index_for_user(&self, user_id: UserId) -> Result<u64> {
        self.check_online()?;
        Ok(self
            .inner
            .index
            .read()
            .await
            .values()
            .filter(|e| e.user_id == user_id)
            .count() as u64)
    }

    async fn touch_index_entries(&self, ids: &[ActivityId], ts: DateTime<Utc>) -> Result<()> {
        self.check_online()?;
        let mut index = self.inner.index.write().await;
        for id in ids {
            if let Some(entry) = index.get_mut(id) {
                entry.ts = ts;
            }
        }
        Ok(())
    }

    async fn upsert_stream(&self, id: ActivityId, bytes: Vec<u8>) -> Result<()> {
        self.check_online()?;
        self.inner
            .streams
            .write()
            .await
            .insert(id, StreamDoc { ts: Utc::now(), bytes });
        Ok(())
    }

    async fn fetch_stream_and_touch(&self, id: ActivityId) -> Result<Option<Vec<u8>>> {
        self.check_online()?;
        let mut streams = self.inner.streams.write().await;
        Ok(streams.get_mut(&id).map(|doc| {
            doc.ts = Utc::now();
            doc.bytes.clone()
        }))
    }

    async fn fetch_streams_and_touch(
        &self,
        ids: &[ActivityId],
    ) -> Result<Vec<(ActivityId, Vec<u8>)>> {
        self.check_online()?;
        let now = Utc::now();
        let mut streams = self.inner.streams.write().await;
        let mut found = Vec::new();
        for id in ids {
            if let Some(doc) = streams.get_mut(id) {
                doc.ts = now;
                found.push((*id, doc.bytes.clone()));
            }
        }
        Ok(found)
    }

    async fn stream_count(&self) -> Result<u64> {
        self.check_online()?;
        Ok(self.inner.streams.read().await.len() as u64)
    }

    async fn append_event(&self, record: EventRecord) -> Result<()> {
        self.check_online()?;
        let mut events = self.inner.events.write().await;
        while events.len() >= self.inner.retention.event_capacity {
            events.pop_front();
        }
        events.push_back(record.clone());
        drop(events);

        // No subscribers is fine.
        let _ = self.inner.event_tx.send(record);
        Ok(())
    }

    async fn recent_events(&self, limit: usize) -> Result<Vec<EventRecord>> {
        self.check_online()?;
        let events = self.inner.events.read().await;
        let iter = events.iter().rev().cloned();
        Ok(if limit == 0 {
            iter.collect()
        } else {
            iter.take(limit).collect()
        })
    }

    async fn event_at(&self, ts: DateTime<Utc>) -> Result<Option<EventRecord>> {
        self.check_online()?;
        Ok(self
            .inner
            .events
            .read()
            .await
            .iter()
            .find(|e| e.ts == ts)
            .cloned())
    }

    async fn events_after(&self, ts: DateTime<Utc>) -> Result<Vec<EventRecord>> {
        self.check_online()?;
        Ok(self
            .inner
            .events
            .read()
            .await
            .iter()
            .filter(|e| e.ts > ts)
            .cloned()
            .collect())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<EventRecord> {
        self.inner.event_tx.subscribe()
    }

    async fn purge_expired(&self) -> Result<(u64, u64)> {
        self.check_online()?;
        let now = Utc::now();

        let index_cutoff = now
            - chrono::Duration::from_std(self.inner.retention.index)
                .unwrap_or_else(|_| chrono::Duration::days(3650));
        let stream_cutoff = now
            - chrono::Duration::from_std(self.inner.retention.streams)
                .unwrap_or_else(|_| chrono::Duration::days(3650));

        let mut index = self.inner.index.write().await;
        let before_index = index.len();
        index.retain(|_, e| e.ts >= index_cutoff);
        let purged_index = (before_index - index.len()) as u64;
        drop(index);

        let mut streams = self.inner.streams.write().await;
        let before_streams = streams.len();
        streams.retain(|_, doc| doc.ts >= stream_cutoff);
        let purged_streams = (before_streams - streams.len()) as u64;
        drop(streams);

        if purged_index + purged_streams > 0 {
            tracing::debug!(purged_index, purged_streams, "TTL purge complete");
        }
        Ok((purged_index, purged_streams))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::time::Duration;

    fn entry(id: ActivityId, user_id: UserId) -> ActivityIndexEntry {
        let start = NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap();
        ActivityIndexEntry {
            id,
            user_id,
            name: format!("activity {id}"),
            activity_type: "Ride".to_string(),
            ts_utc: start.and_utc(),
            ts_local: start,
            ts: Utc::now(),
            elapsed_time: 3600,
            total_distance: 25_000.0,
            average_speed: 6.9,
            start_latlng: None,
            bounds: None,
        }
    }

    fn test_db() -> MemoryDocStore {
        MemoryDocStore::new(Retention {
            index: Duration::from_secs(3600),
            streams: Duration::from_secs(3600),
            event_capacity: 4,
        })
    }

    #[tokio::test]
    async fn test_index_upsert_is_idempotent() {
        let db = test_db();
        db.upsert_index_entry(entry(1, 10)).await.unwrap();
        db.upsert_index_entry(entry(1, 10)).await.unwrap();
        assert_eq!(db.count_index_for_user(10).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_offline_mode_errors() {
        let db = test_db();
        db.set_online(false);
        assert!(db.upsert_index_entry(entry(1, 10)).await.is_err());
        assert!(db.fetch_stream_and_touch(1).await.is_err());

        db.set_online(true);
        assert!(db.upsert_index_entry(entry(1, 10)).await.is_ok());
    }

    #[tokio::test]
    async fn test_update_applies_field_deltas() {
        let db = test_db();
        db.upsert_index_entry(entry(1, 10)).await.unwrap();

        let fields = HashMap::from([("name".to_string(), serde_json::json!("renamed"))]);
        assert!(db.update_index_entry(1, fields).await.unwrap());
        assert_eq!(db.get_index_entry(1).await.unwrap().unwrap().name, "renamed");

        let fields = HashMap::from([("name".to_string(), serde_json::json!("x"))]);
        assert!(!db.update_index_entry(99, fields).await.unwrap());
    }

    #[tokio::test]
    async fn test_capped_events_evict_oldest_first() {
        let db = test_db();
        for i in 0..6 {
            db.append_event(EventRecord {
                ts: Utc::now() + chrono::Duration::milliseconds(i),
                msg: format!("event {i}"),
                payload: serde_json::Value::Null,
            })
            .await
            .unwrap();
        }

        let recent = db.recent_events(0).await.unwrap();
        assert_eq!(recent.len(), 4);
        // Newest-first; events 0 and 1 were evicted.
        assert_eq!(recent[0].msg, "event 5");
        assert_eq!(recent[3].msg, "event 2");
    }

    #[tokio::test]
    async fn test_purge_expired_respects_touch() {
        let db = MemoryDocStore::new(Retention {
            index: Duration::from_secs(60),
            streams: Duration::from_secs(60),
            event_capacity: 16,
        });

        let mut stale = entry(1, 10);
        stale.ts = Utc::now() - chrono::Duration::seconds(120);
        db.upsert_index_entry(stale).await.unwrap();
        db.upsert_index_entry(entry(2, 10)).await.unwrap();

        let (purged_index, _) = db.purge_expired().await.unwrap();
        assert_eq!(purged_index, 1);
        assert!(db.get_index_entry(1).await.unwrap().is_none());
        assert!(db.get_index_entry(2).await.unwrap().is_some());
    }
}
