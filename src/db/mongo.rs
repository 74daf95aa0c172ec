// SPDX-License-Identifier: MIT

//! MongoDB-backed [`DocStore`].
//!
//! Retention is store-native: TTL indexes on the last-touched `ts`
//! field expire cold index entries and stream documents, and the event
//! log is a capped collection. Live event subscriptions are fed by a
//! tailable cursor on the capped collection, so inserts from other
//! processes reach local subscribers too.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{StreamExt, TryStreamExt};
use mongodb::bson::{self, doc, spec::BinarySubtype, Binary, Bson, Document};
use mongodb::options::{CursorType, IndexOptions};
use mongodb::{Client, Collection, IndexModel};
use tokio::sync::broadcast;

use crate::error::{EngineError, Result};
use crate::models::{ActivityId, ActivityIndexEntry, EventRecord, UserId};

use super::{DocStore, Retention};

/// Width of the concurrent per-document writes inside a bulk upsert.
const BULK_WRITE_WIDTH: usize = 16;

/// Bytes reserved per record when sizing the capped event collection.
const EVENT_RECORD_SIZE: u64 = 1024;

/// MongoDB document store handle. Cheap to clone.
#[derive(Clone)]
pub struct MongoDocStore {
    index: Collection<Document>,
    streams: Collection<Document>,
    events: Collection<Document>,
    event_tx: broadcast::Sender<EventRecord>,
    retention: Retention,
}

impl MongoDocStore {
    /// Connect and prepare the collections: TTL indexes on `ts`, a
    /// user-id index for per-user scans, and the capped event
    /// collection. All of these are idempotent on an existing database.
    pub async fn connect(uri: &str, database: &str, retention: Retention) -> Result<Self> {
        let client = Client::with_uri_str(uri).await?;
        let db = client.database(database);

        let size = (retention.event_capacity as u64)
            .saturating_mul(EVENT_RECORD_SIZE)
            .max(4096);
        if let Err(e) = db
            .create_collection("history")
            .capped(true)
            .size(size)
            .max(retention.event_capacity as u64)
            .await
        {
            // Already exists on every start after the first.
            tracing::debug!(error = %e, "capped history collection not created");
        }

        let index = db.collection::<Document>("index");
        let streams = db.collection::<Document>("activities");
        let events = db.collection::<Document>("history");

        index
            .create_index(ttl_index(retention.index))
            .await?;
        index
            .create_index(IndexModel::builder().keys(doc! { "user_id": 1 }).build())
            .await?;
        streams
            .create_index(ttl_index(retention.streams))
            .await?;

        let (event_tx, _) = broadcast::channel(256);
        spawn_event_tail(events.clone(), event_tx.clone());

        Ok(Self {
            index,
            streams,
            events,
            event_tx,
            retention,
        })
    }
}

fn ttl_index(expire_after: Duration) -> IndexModel {
    IndexModel::builder()
        .keys(doc! { "ts": 1 })
        .options(IndexOptions::builder().expire_after(expire_after).build())
        .build()
}

/// Follow inserts on the capped collection with a tailable cursor and
/// fan them out to local subscribers. The cursor dies whenever the
/// collection wraps past it or the connection drops; it is reopened at
/// the current horizon, so records inserted during the gap are only
/// visible through catch-up reads.
fn spawn_event_tail(events: Collection<Document>, tx: broadcast::Sender<EventRecord>) {
    tokio::spawn(async move {
        loop {
            let horizon = bson::DateTime::now();
            let cursor = events
                .find(doc! { "ts": { "$gt": horizon } })
                .cursor_type(CursorType::TailableAwait)
                .await;
            let mut cursor = match cursor {
                Ok(cursor) => cursor,
                Err(e) => {
                    tracing::warn!(error = %e, "event tail cursor open failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            loop {
                match cursor.try_next().await {
                    Ok(Some(doc)) => match event_from_doc(doc) {
                        // No subscribers is fine.
                        Ok(record) => {
                            let _ = tx.send(record);
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "undecodable event record skipped")
                        }
                    },
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "event tail cursor failed");
                        break;
                    }
                }
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    });
}

fn bson_ts(ts: DateTime<Utc>) -> bson::DateTime {
    bson::DateTime::from_millis(ts.timestamp_millis())
}

fn chrono_ts(ts: bson::DateTime) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ts.timestamp_millis()).unwrap_or_default()
}

/// Index entries serialize through serde except for the last-touched
/// `ts`, which must be a BSON date for the TTL index to see it.
fn entry_to_doc(entry: &ActivityIndexEntry) -> Result<Document> {
    let mut doc = bson::to_document(entry).map_err(store_err)?;
    doc.insert("ts", bson_ts(entry.ts));
    Ok(doc)
}

fn entry_from_doc(mut doc: Document) -> Result<ActivityIndexEntry> {
    let ts = doc.get_datetime("ts").ok().copied();
    if let Some(ts) = ts {
        doc.insert("ts", chrono_ts(ts).to_rfc3339());
    }
    bson::from_document(doc).map_err(store_err)
}

fn event_to_doc(record: &EventRecord) -> Result<Document> {
    Ok(doc! {
        "ts": bson_ts(record.ts),
        "msg": &record.msg,
        "payload": bson::to_bson(&record.payload).map_err(store_err)?,
    })
}

fn event_from_doc(mut doc: Document) -> Result<EventRecord> {
    let ts = chrono_ts(*doc.get_datetime("ts").map_err(store_err)?);
    let msg = doc.get_str("msg").map_err(store_err)?.to_string();
    let payload = doc
        .remove("payload")
        .map(Bson::into_relaxed_extjson)
        .unwrap_or(serde_json::Value::Null);
    Ok(EventRecord { ts, msg, payload })
}

fn store_err<E: std::fmt::Display>(e: E) -> EngineError {
    EngineError::Store(e.to_string())
}

#[async_trait]
impl DocStore for MongoDocStore {
    async fn upsert_index_entry(&self, entry: ActivityIndexEntry) -> Result<()> {
        self.index
            .replace_one(doc! { "_id": entry.id as i64 }, entry_to_doc(&entry)?)
            .upsert(true)
            .await?;
        Ok(())
    }

    async fn bulk_upsert_index(&self, entries: Vec<ActivityIndexEntry>) -> Result<usize> {
        let count = entries.len();
        let results: Vec<Result<()>> = futures_util::stream::iter(entries.into_iter().map(
            |entry| {
                let coll = self.index.clone();
                async move {
                    let doc = entry_to_doc(&entry)?;
                    coll.replace_one(doc! { "_id": entry.id as i64 }, doc)
                        .upsert(true)
                        .await?;
                    Ok(())
                }
            },
        ))
        .buffer_unordered(BULK_WRITE_WIDTH)
        .collect()
        .await;

        for result in results {
            result?;
        }
        Ok(count)
    }

    async fn get_index_entry(&self, id: ActivityId) -> Result<Option<ActivityIndexEntry>> {
        self.index
            .find_one(doc! { "_id": id as i64 })
            .await?
            .map(entry_from_doc)
            .transpose()
    }

    async fn index_entries_for_user(&self, user_id: UserId) -> Result<Vec<ActivityIndexEntry>> {
        let mut cursor = self.index.find(doc! { "user_id": user_id as i64 }).await?;
        let mut entries = Vec::new();
        while let Some(doc) = cursor.try_next().await? {
            entries.push(entry_from_doc(doc)?);
        }
        Ok(entries)
    }

    async fn update_index_entry(
        &self,
        id: ActivityId,
        fields: HashMap<String, serde_json::Value>,
    ) -> Result<bool> {
        if fields.is_empty() {
            return Ok(self.get_index_entry(id).await?.is_some());
        }

        let mut set = Document::new();
        for (field, value) in fields {
            set.insert(field, bson::to_bson(&value).map_err(store_err)?);
        }
        let result = self
            .index
            .update_one(doc! { "_id": id as i64 }, doc! { "$set": set })
            .await?;
        Ok(result.matched_count > 0)
    }

    async fn delete_index_entry(&self, id: ActivityId) -> Result<bool> {
        let result = self.index.delete_one(doc! { "_id": id as i64 }).await?;
        Ok(result.deleted_count == 1)
    }

    async fn delete_index_for_user(&self, user_id: UserId) -> Result<u64> {
        let result = self
            .index
            .delete_many(doc! { "user_id": user_id as i64 })
            .await?;
        Ok(result.deleted_count)
    }

    async fn count_index_for_user(&self, user_id: UserId) -> Result<u64> {
        Ok(self
            .index
            .count_documents(doc! { "user_id": user_id as i64 })
            .await?)
    }

    async fn touch_index_entries(&self, ids: &[ActivityId], ts: DateTime<Utc>) -> Result<()> {
        let ids: Vec<i64> = ids.iter().map(|&id| id as i64).collect();
        self.index
            .update_many(
                doc! { "_id": { "$in": ids } },
                doc! { "$set": { "ts": bson_ts(ts) } },
            )
            .await?;
        Ok(())
    }

    async fn upsert_stream(&self, id: ActivityId, bytes: Vec<u8>) -> Result<()> {
        let doc = doc! {
            "_id": id as i64,
            "ts": bson::DateTime::now(),
            "data": Bson::Binary(Binary { subtype: BinarySubtype::Generic, bytes }),
        };
        self.streams
            .replace_one(doc! { "_id": id as i64 }, doc)
            .upsert(true)
            .await?;
        Ok(())
    }

    async fn fetch_stream_and_touch(&self, id: ActivityId) -> Result<Option<Vec<u8>>> {
        let found = self
            .streams
            .find_one_and_update(
                doc! { "_id": id as i64 },
                doc! { "$set": { "ts": bson::DateTime::now() } },
            )
            .await?;
        found
            .map(|doc| doc.get_binary_generic("data").cloned().map_err(store_err))
            .transpose()
    }

    async fn fetch_streams_and_touch(
        &self,
        ids: &[ActivityId],
    ) -> Result<Vec<(ActivityId, Vec<u8>)>> {
        let ids: Vec<i64> = ids.iter().map(|&id| id as i64).collect();
        self.streams
            .update_many(
                doc! { "_id": { "$in": ids.clone() } },
                doc! { "$set": { "ts": bson::DateTime::now() } },
            )
            .await?;

        let mut cursor = self.streams.find(doc! { "_id": { "$in": ids } }).await?;
        let mut found = Vec::new();
        while let Some(doc) = cursor.try_next().await? {
            let id = doc.get_i64("_id").map_err(store_err)? as ActivityId;
            let bytes = doc.get_binary_generic("data").cloned().map_err(store_err)?;
            found.push((id, bytes));
        }
        Ok(found)
    }

    async fn stream_count(&self) -> Result<u64> {
        Ok(self.streams.count_documents(doc! {}).await?)
    }

    async fn append_event(&self, record: EventRecord) -> Result<()> {
        // Subscribers are fed by the tailable cursor, not directly, so
        // an insert reaches them exactly once.
        self.events.insert_one(event_to_doc(&record)?).await?;
        Ok(())
    }

    async fn recent_events(&self, limit: usize) -> Result<Vec<EventRecord>> {
        let mut cursor = self
            .events
            .find(doc! {})
            .sort(doc! { "$natural": -1 })
            .limit(limit as i64)
            .await?;
        let mut events = Vec::new();
        while let Some(doc) = cursor.try_next().await? {
            events.push(event_from_doc(doc)?);
        }
        Ok(events)
    }

    async fn event_at(&self, ts: DateTime<Utc>) -> Result<Option<EventRecord>> {
        self.events
            .find_one(doc! { "ts": bson_ts(ts) })
            .await?
            .map(event_from_doc)
            .transpose()
    }

    async fn events_after(&self, ts: DateTime<Utc>) -> Result<Vec<EventRecord>> {
        let mut cursor = self
            .events
            .find(doc! { "ts": { "$gt": bson_ts(ts) } })
            .sort(doc! { "ts": 1 })
            .await?;
        let mut events = Vec::new();
        while let Some(doc) = cursor.try_next().await? {
            events.push(event_from_doc(doc)?);
        }
        Ok(events)
    }

    fn subscribe_events(&self) -> broadcast::Receiver<EventRecord> {
        self.event_tx.subscribe()
    }

    /// The TTL monitor already expires cold documents; an explicit
    /// purge is still honored so the sweep interval is an upper bound
    /// on retention slack rather than the monitor's own cadence.
    async fn purge_expired(&self) -> Result<(u64, u64)> {
        let now = Utc::now();
        let index_cutoff = now
            - chrono::Duration::from_std(self.retention.index)
                .unwrap_or_else(|_| chrono::Duration::days(3650));
        let stream_cutoff = now
            - chrono::Duration::from_std(self.retention.streams)
                .unwrap_or_else(|_| chrono::Duration::days(3650));

        let purged_index = self
            .index
            .delete_many(doc! { "ts": { "$lt": bson_ts(index_cutoff) } })
            .await?
            .deleted_count;
        let purged_streams = self
            .streams
            .delete_many(doc! { "ts": { "$lt": bson_ts(stream_cutoff) } })
            .await?
            .deleted_count;

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

    fn entry() -> ActivityIndexEntry {
        let start = NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap();
        ActivityIndexEntry {
            id: 42,
            user_id: 10,
            name: "morning ride".to_string(),
            activity_type: "Ride".to_string(),
            ts_utc: start.and_utc(),
            ts_local: start,
            ts: Utc::now(),
            elapsed_time: 3600,
            total_distance: 25_000.0,
            average_speed: 6.9,
            start_latlng: Some([37.4, -122.2]),
            bounds: None,
        }
    }

    #[test]
    fn test_entry_document_round_trip() {
        let entry = entry();
        let doc = entry_to_doc(&entry).unwrap();
        // `ts` must be a native date for the TTL index.
        assert!(doc.get_datetime("ts").is_ok());
        assert_eq!(doc.get_i64("_id").unwrap(), 42);

        let back = entry_from_doc(doc).unwrap();
        assert_eq!(back.id, entry.id);
        assert_eq!(back.name, entry.name);
        assert_eq!(back.ts_utc, entry.ts_utc);
        assert_eq!(back.ts.timestamp_millis(), entry.ts.timestamp_millis());
    }

    #[test]
    fn test_event_document_round_trip() {
        let record = EventRecord {
            ts: DateTime::from_timestamp(1_700_000_000, 500_000_000).unwrap(),
            msg: "queued 3 activities".to_string(),
            payload: serde_json::json!({ "user_id": 10, "count": 3 }),
        };
        let back = event_from_doc(event_to_doc(&record).unwrap()).unwrap();
        assert_eq!(back.ts, record.ts);
        assert_eq!(back.msg, record.msg);
        assert_eq!(back.payload["count"], 3);
    }
}
