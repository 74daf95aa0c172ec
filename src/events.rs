// SPDX-License-Identifier: MIT

//! Capped operational event log with a live tail.
//!
//! Records import and maintenance activity for operators. Readers get a
//! bounded history (the capped collection wraps around) and can tail
//! new inserts as server-sent-event frames without polling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Notify};
use tokio_stream::wrappers::ReceiverStream;

use crate::db::DocStore;
use crate::error::Result;
use crate::models::EventRecord;

/// How long a tail connection may sit idle before a keepalive comment
/// frame is emitted.
const KEEPALIVE_IDLE: Duration = Duration::from_secs(10);

/// Reconnect delay advertised to tail consumers.
const RETRY_MILLIS: u64 = 5000;

/// Cooperative cancellation handle for tail subscriptions.
///
/// Cloning shares the token; cancelling any clone stops them all.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        while !self.is_cancelled() {
            self.notify.notified().await;
        }
    }
}

/// Render one event as a server-sent-event frame. The frame id is the
/// insertion timestamp as fractional epoch seconds, so a reconnecting
/// consumer can resume from the last id it saw.
fn sse_frame(record: &EventRecord) -> String {
    let data = serde_json::to_string(record)
        .unwrap_or_else(|_| format!("{{\"msg\":{:?}}}", record.msg));
    format!("id: {}\ndata: {}\n\n", record.epoch_seconds(), data)
}

/// Handle to the capped event collection.
#[derive(Clone)]
pub struct EventLog {
    db: Arc<dyn DocStore>,
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog").finish_non_exhaustive()
    }
}

impl EventLog {
    pub fn new(db: Arc<dyn DocStore>) -> Self {
        Self { db }
    }

    /// Append a new event, stamping the insertion timestamp.
    pub async fn log(&self, msg: impl Into<String>, payload: serde_json::Value) -> Result<EventRecord> {
        let record = EventRecord {
            ts: Utc::now(),
            msg: msg.into(),
            payload,
        };
        self.db.append_event(record.clone()).await?;
        Ok(record)
    }

    /// Most recent `limit` events, newest-first. Zero means everything
    /// still retained.
    pub async fn read(&self, limit: usize) -> Result<Vec<EventRecord>> {
        self.db.recent_events(limit).await
    }

    /// Point read by insertion timestamp.
    pub async fn get(&self, ts: DateTime<Utc>) -> Result<Option<EventRecord>> {
        self.db.event_at(ts).await
    }

    /// Live tail as a stream of server-sent-event frames.
    ///
    /// Starts with a `retry:` directive, replays retained events newer
    /// than `since` (all live inserts only, when `None`), then follows
    /// inserts as they happen. Emits a comment frame on idle so
    /// intermediaries keep the connection open. Ends when `cancel`
    /// fires or the consumer drops the stream.
    pub fn tail(
        &self,
        since: Option<DateTime<Utc>>,
        cancel: CancelToken,
    ) -> ReceiverStream<String> {
        let (tx, rx) = mpsc::channel(32);
        let db = self.db.clone();

        tokio::spawn(async move {
            // Subscribe before the catch-up read so nothing inserted in
            // between is lost; duplicates are filtered by timestamp.
            let mut live = db.subscribe_events();

            if tx.send(format!("retry: {RETRY_MILLIS}\n\n")).await.is_err() {
                return;
            }

            let mut last_ts = since;
            if let Some(since) = since {
                let backlog = match db.events_after(since).await {
                    Ok(backlog) => backlog,
                    Err(e) => {
                        tracing::warn!(error = %e, "event tail catch-up failed");
                        Vec::new()
                    }
                };
                for record in backlog {
                    last_ts = Some(record.ts);
                    if tx.send(sse_frame(&record)).await.is_err() {
                        return;
                    }
                }
            }

            let mut idle = Duration::ZERO;
            loop {
                let received = tokio::select! {
                    _ = cancel.cancelled() => return,
                    received = tokio::time::timeout(Duration::from_secs(1), live.recv()) => received,
                };

                match received {
                    Ok(Ok(record)) => {
                        // Already replayed during catch-up.
                        if last_ts.is_some_and(|ts| record.ts <= ts) {
                            continue;
                        }
                        last_ts = Some(record.ts);
                        idle = Duration::ZERO;
                        if tx.send(sse_frame(&record)).await.is_err() {
                            return;
                        }
                    }
                    Ok(Err(tokio::sync::broadcast::error::RecvError::Lagged(n))) => {
                        tracing::warn!(skipped = n, "event tail lagged, records skipped");
                    }
                    Ok(Err(tokio::sync::broadcast::error::RecvError::Closed)) => return,
                    Err(_) => {
                        idle += Duration::from_secs(1);
                        if idle >= KEEPALIVE_IDLE {
                            idle = Duration::ZERO;
                            if tx.send(": \n\n".to_string()).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        });

        ReceiverStream::new(rx)
    }
}
