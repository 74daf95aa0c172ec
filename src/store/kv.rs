// SPDX-License-Identifier: MIT

//! Key-value store capability: the volatile cache tier.
//!
//! Entries expire via the store's native TTL. The engine only ever
//! treats this tier as a rebuildable hot cache; losing it entirely
//! degrades to durable-tier reads.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::AsyncCommands;

use crate::error::Result;

/// Volatile key-value tier with native expiry.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;

    /// Atomic set-if-absent with TTL. Returns whether the key was set.
    /// Used as the per-user "currently indexing" guard.
    async fn set_nx_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool>;

    async fn del(&self, key: &str) -> Result<()>;

    /// Reset the TTL of an existing key; no-op if absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    /// Pipelined multi-get, one slot per input key.
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>>;

    /// Pipelined TTL refresh for a batch of keys.
    async fn expire_many(&self, keys: &[String], ttl: Duration) -> Result<()>;
}

// ─── Redis-backed implementation ─────────────────────────────────────

/// Redis-backed volatile tier.
#[derive(Clone)]
pub struct RedisKv {
    conn: ConnectionManager,
}

impl RedisKv {
    /// Connect to Redis with a bounded-retry connection manager.
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let config = ConnectionManagerConfig::new()
            .set_number_of_retries(1)
            .set_connection_timeout(Duration::from_millis(500));

        let client = redis::Client::open(redis_url)
            .map_err(crate::error::EngineError::from)?;
        let conn = client
            .get_connection_manager_with_config(config)
            .await
            .map_err(crate::error::EngineError::from)?;

        tracing::info!(url = redis_url, "Connected to Redis");
        Ok(Self { conn })
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let () = conn.set_ex(key, value, ttl.as_secs()).await?;
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let set: bool = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs())
            .query_async::<Option<String>>(&mut conn)
            .await?
            .is_some();
        Ok(set)
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let () = conn.del(key).await?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let () = conn.expire(key, ttl.as_secs() as i64).await?;
        Ok(())
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.get(key);
        }
        Ok(pipe.query_async(&mut conn).await?)
    }

    async fn expire_many(&self, keys: &[String], ttl: Duration) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.expire(key, ttl.as_secs() as i64).ignore();
        }
        let () = pipe.query_async(&mut conn).await?;
        Ok(())
    }
}

// ─── In-memory implementation ────────────────────────────────────────

/// In-process volatile tier for tests and embedded deployments.
///
/// Expiry is lazy: entries past their deadline are dropped when read.
#[derive(Default, Clone)]
pub struct MemoryKv {
    entries: std::sync::Arc<DashMap<String, (Vec<u8>, Option<Instant>)>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn live(&self, key: &str) -> Option<Vec<u8>> {
        let expired = match self.entries.get(key) {
            Some(entry) => match entry.value().1 {
                Some(deadline) if Instant::now() >= deadline => true,
                _ => return Some(entry.value().0.clone()),
            },
            None => return None,
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }

    /// Test hook: whether a key is present and unexpired.
    pub fn contains(&self, key: &str) -> bool {
        self.live(key).is_some()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.live(key))
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        self.entries
            .insert(key.to_string(), (value.to_vec(), Some(Instant::now() + ttl)));
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        // Entry API gives us the atomic check-and-set.
        let mut won = false;
        let deadline = Instant::now() + ttl;
        self.entries
            .entry(key.to_string())
            .and_modify(|slot| {
                if slot.1.is_some_and(|d| Instant::now() >= d) {
                    *slot = (value.to_vec(), Some(deadline));
                    won = true;
                }
            })
            .or_insert_with(|| {
                won = true;
                (value.to_vec(), Some(deadline))
            });
        Ok(won)
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.value_mut().1 = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        Ok(keys.iter().map(|k| self.live(k)).collect())
    }

    async fn expire_many(&self, keys: &[String], ttl: Duration) -> Result<()> {
        for key in keys {
            self.expire(key, ttl).await?;
        }
        Ok(())
    }
}
