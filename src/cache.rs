// SPDX-License-Identifier: MIT

//! Tiered cache for compressed per-activity stream payloads.
//!
//! Hides the two-tier topology: a volatile key-value tier with native
//! expiry in front of the durable document store with sliding
//! retention. Writes go volatile-first so a crash leaves at worst a hot
//! cache without durable backup, never the reverse; the choreography is
//! two independent calls with tolerated partial failure, not a
//! transaction.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::db::DocStore;
use crate::error::Result;
use crate::models::{ActivityId, StreamPayload};
use crate::store::KvStore;

fn cache_key(id: ActivityId) -> String {
    format!("A:{id}")
}

/// Two-tier store for stream payloads keyed by activity id.
#[derive(Clone)]
pub struct StreamCache {
    kv: Arc<dyn KvStore>,
    db: Arc<dyn DocStore>,
}

impl StreamCache {
    pub fn new(kv: Arc<dyn KvStore>, db: Arc<dyn DocStore>) -> Self {
        Self { kv, db }
    }

    /// Write a payload through both tiers.
    ///
    /// The volatile tier is written first; a durable-tier failure is
    /// logged and swallowed because the caller already has the hot
    /// copy. Only both tiers failing surfaces an error.
    pub async fn set(&self, id: ActivityId, payload: &StreamPayload, ttl: Duration) -> Result<()> {
        let bytes = serde_json::to_vec(payload)?;

        let volatile = self.kv.set_ex(&cache_key(id), &bytes, ttl).await;
        if let Err(e) = &volatile {
            tracing::warn!(activity_id = id, error = %e, "volatile cache write failed");
        }

        match self.db.upsert_stream(id, bytes).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::warn!(activity_id = id, error = %e, "durable stream write failed");
                // Swallow unless the volatile tier failed too.
                volatile
            }
        }
    }

    /// Read a payload: volatile tier first (hit refreshes its TTL),
    /// then the durable tier (hit back-fills the volatile tier and
    /// refreshes the durable touch timestamp).
    ///
    /// `Ok(None)` is a true miss; a payload whose `empty` flag is set
    /// is a found-but-no-data result and is returned as a hit.
    pub async fn get(&self, id: ActivityId, ttl: Duration) -> Result<Option<StreamPayload>> {
        let key = cache_key(id);

        let volatile_err = match self.kv.get(&key).await {
            Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                Ok(payload) => {
                    // Reset the expiry clock on every hit.
                    if let Err(e) = self.kv.expire(&key, ttl).await {
                        tracing::debug!(activity_id = id, error = %e, "TTL refresh failed");
                    }
                    return Ok(Some(payload));
                }
                Err(e) => {
                    // An undecodable hot entry is useless; drop it and
                    // fall through to the durable tier.
                    tracing::warn!(activity_id = id, error = %e, "corrupt cache entry dropped");
                    let _ = self.kv.del(&key).await;
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(activity_id = id, error = %e, "volatile cache read failed");
                Some(e)
            }
        };

        match self.db.fetch_stream_and_touch(id).await {
            Ok(Some(bytes)) => {
                let payload = serde_json::from_slice(&bytes)?;
                if let Err(e) = self.kv.set_ex(&key, &bytes, ttl).await {
                    tracing::debug!(activity_id = id, error = %e, "cache back-fill failed");
                }
                Ok(Some(payload))
            }
            Ok(None) => Ok(None),
            Err(durable_err) => {
                if volatile_err.is_some() {
                    tracing::error!(activity_id = id, "both cache tiers unavailable");
                } else {
                    tracing::warn!(activity_id = id, error = %durable_err, "durable stream read failed");
                }
                Err(durable_err)
            }
        }
    }

    /// Drop the hot copy of a payload. The durable document is left to
    /// age out through retention.
    pub async fn delete(&self, id: ActivityId) -> Result<()> {
        self.kv.del(&cache_key(id)).await
    }

    /// Batched read: one pipelined volatile lookup, a durable lookup
    /// only for the remainder, back-fill for durable hits. Yields
    /// `(id, payload)` pairs lazily in no guaranteed order relative to
    /// the input; missing ids are simply absent.
    pub fn get_many(
        &self,
        ids: Vec<ActivityId>,
        ttl: Duration,
    ) -> ReceiverStream<(ActivityId, StreamPayload)> {
        let (tx, rx) = mpsc::channel(32);
        let cache = self.clone();

        tokio::spawn(async move {
            if let Err(e) = cache.get_many_inner(ids, ttl, tx).await {
                tracing::warn!(error = %e, "batched stream read failed");
            }
        });

        ReceiverStream::new(rx)
    }

    async fn get_many_inner(
        &self,
        ids: Vec<ActivityId>,
        ttl: Duration,
        tx: mpsc::Sender<(ActivityId, StreamPayload)>,
    ) -> Result<()> {
        let keys: Vec<String> = ids.iter().map(|&id| cache_key(id)).collect();

        let cached = match self.kv.get_many(&keys).await {
            Ok(cached) => cached,
            Err(e) => {
                tracing::warn!(error = %e, "volatile batch read failed");
                vec![None; ids.len()]
            }
        };

        let mut hot_keys = Vec::new();
        let mut missing = Vec::new();
        for ((&id, key), slot) in ids.iter().zip(&keys).zip(cached) {
            match slot.and_then(|bytes| serde_json::from_slice(&bytes).ok()) {
                Some(payload) => {
                    hot_keys.push(key.clone());
                    if tx.send((id, payload)).await.is_err() {
                        return Ok(()); // consumer went away
                    }
                }
                None => missing.push(id),
            }
        }

        // Batch-refresh expiry for everything served hot.
        if let Err(e) = self.kv.expire_many(&hot_keys, ttl).await {
            tracing::debug!(error = %e, "batch TTL refresh failed");
        }

        if missing.is_empty() {
            return Ok(());
        }

        for (id, bytes) in self.db.fetch_streams_and_touch(&missing).await? {
            let payload: StreamPayload = match serde_json::from_slice(&bytes) {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(activity_id = id, error = %e, "corrupt stream document skipped");
                    continue;
                }
            };
            if let Err(e) = self.kv.set_ex(&cache_key(id), &bytes, ttl).await {
                tracing::debug!(activity_id = id, error = %e, "cache back-fill failed");
            }
            if tx.send((id, payload)).await.is_err() {
                return Ok(());
            }
        }

        Ok(())
    }
}

impl std::fmt::Debug for StreamCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamCache").finish_non_exhaustive()
    }
}
