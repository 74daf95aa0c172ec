// SPDX-License-Identifier: MIT

//! Import pipeline: the read path that materializes activities.
//!
//! A query resolves against the index (building it from upstream on
//! first contact), then attaches stream payloads from the tiered cache,
//! importing misses from upstream with bounded concurrency. Results are
//! pushed through a channel as they become available; dropping the
//! returned stream cancels the remaining work.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::NaiveDateTime;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::cache::StreamCache;
use crate::codec;
use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::events::EventLog;
use crate::index::{ActivityIndex, IndexQuery};
use crate::models::{ActivityId, ActivityIndexEntry, StreamData, StreamPayload, UserId};
use crate::store::KvStore;
use crate::upstream::{RawStream, SummaryFilters, UpstreamClient};

/// Query parameters for [`Importer::query_activities`].
#[derive(Debug, Clone)]
pub struct ImportQuery {
    /// Permit a full index build when the user has none yet. When
    /// false, a missing index is an error instead.
    pub build: bool,
    /// Maximum activities yielded; 0 means unlimited.
    pub limit: usize,
    /// Local start time lower bound (inclusive).
    pub after: Option<NaiveDateTime>,
    /// Local start time upper bound (inclusive).
    pub before: Option<NaiveDateTime>,
    /// Restrict to this id set, if present.
    pub activity_ids: Option<HashSet<ActivityId>>,
    /// Ids the consumer already holds; matching ones are not re-sent.
    pub exclude_ids: HashSet<ActivityId>,
    /// Attach stream payloads. When false only index entries flow.
    pub streams: bool,
    /// Refresh last-touched timestamps of everything served.
    pub update_ts: bool,
}

impl Default for ImportQuery {
    fn default() -> Self {
        Self {
            build: true,
            limit: 0,
            after: None,
            before: None,
            activity_ids: None,
            exclude_ids: HashSet::new(),
            streams: false,
            update_ts: false,
        }
    }
}

/// One record on the result stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ImportRecord {
    /// A renderable activity: index entry plus its stream payload
    /// (restricted to the configured output streams).
    Activity {
        entry: ActivityIndexEntry,
        streams: StreamPayload,
    },
    /// Ids the consumer holds that no longer match the query.
    Delete(Vec<ActivityId>),
    /// Index build progress: summaries indexed so far.
    Progress { count: usize },
    /// Every renderable record has been sent; what follows is
    /// bookkeeping only.
    StopRendering,
    /// Fatal failure; the stream ends after this record.
    Error(String),
    /// Terminal summary.
    Done {
        /// Activities yielded to the consumer.
        count: usize,
        /// Payloads served from the cache tiers.
        fetched: usize,
        /// Payloads imported from upstream during this query.
        imported: usize,
        /// Activities confirmed to have no usable streams.
        empty: usize,
    },
}

#[derive(Debug, Default)]
struct Counts {
    count: usize,
    fetched: usize,
    imported: usize,
    empty: usize,
}

/// Orchestrates index resolution, cache reads, and upstream imports.
#[derive(Clone)]
pub struct Importer {
    config: Arc<Config>,
    kv: Arc<dyn KvStore>,
    index: ActivityIndex,
    cache: StreamCache,
    events: EventLog,
}

impl Importer {
    pub fn new(
        config: Arc<Config>,
        kv: Arc<dyn KvStore>,
        index: ActivityIndex,
        cache: StreamCache,
        events: EventLog,
    ) -> Self {
        Self {
            config,
            kv,
            index,
            cache,
            events,
        }
    }

    /// The tiered cache this importer writes through.
    pub fn cache(&self) -> &StreamCache {
        &self.cache
    }

    /// Resolve a query into a lazy stream of [`ImportRecord`]s.
    ///
    /// Dropping the returned stream cancels the remaining work; whatever
    /// was already imported stays imported.
    pub fn query_activities(
        &self,
        user_id: UserId,
        client: Arc<dyn UpstreamClient>,
        query: ImportQuery,
    ) -> ReceiverStream<ImportRecord> {
        let (tx, rx) = mpsc::channel(32);
        let importer = self.clone();

        tokio::spawn(async move {
            match importer.run_query(user_id, client, query, &tx).await {
                Ok(Some(counts)) => {
                    importer.log_done(user_id, &counts).await;
                    let _ = tx
                        .send(ImportRecord::Done {
                            count: counts.count,
                            fetched: counts.fetched,
                            imported: counts.imported,
                            empty: counts.empty,
                        })
                        .await;
                }
                Ok(None) => {} // consumer went away
                Err(e) => {
                    tracing::error!(user_id, error = %e, "activity query failed");
                    let _ = tx.send(ImportRecord::Error(e.to_string())).await;
                }
            }
        });

        ReceiverStream::new(rx)
    }

    /// `Ok(None)` means the consumer dropped the stream mid-flight.
    async fn run_query(
        &self,
        user_id: UserId,
        client: Arc<dyn UpstreamClient>,
        query: ImportQuery,
        tx: &mpsc::Sender<ImportRecord>,
    ) -> Result<Option<Counts>> {
        let entries = if self.index.size_for_user(user_id).await? > 0 {
            let result = self
                .index
                .query(
                    user_id,
                    &IndexQuery {
                        activity_ids: query.activity_ids.clone(),
                        exclude_ids: query.exclude_ids.clone(),
                        after: query.after,
                        before: query.before,
                        limit: query.limit,
                        refresh_ts: query.update_ts,
                    },
                )
                .await?;

            if !result.to_delete.is_empty()
                && tx
                    .send(ImportRecord::Delete(result.to_delete))
                    .await
                    .is_err()
            {
                return Ok(None);
            }
            result.entries
        } else {
            if !query.build {
                return Err(EngineError::BadQuery(
                    "user has no activity index".to_string(),
                ));
            }
            match self.build_index(user_id, client.as_ref(), &query, tx).await? {
                Some(entries) => entries,
                None => return Ok(None),
            }
        };

        let mut counts = Counts::default();
        if !query.streams {
            for entry in entries {
                counts.count += 1;
                let record = ImportRecord::Activity {
                    entry,
                    streams: StreamPayload::default(),
                };
                if tx.send(record).await.is_err() {
                    return Ok(None);
                }
            }
            if tx.send(ImportRecord::StopRendering).await.is_err() {
                return Ok(None);
            }
            return Ok(Some(counts));
        }

        if !self.attach_streams(entries, client, tx, &mut counts).await? {
            return Ok(None);
        }

        if tx.send(ImportRecord::StopRendering).await.is_err() {
            return Ok(None);
        }
        Ok(Some(counts))
    }

    /// Full index build for a user with no entries yet, guarded by a
    /// short-lived marker so concurrent first-contact queries do not
    /// hammer upstream in parallel. Returns the renderable subset in
    /// newest-first order, or `None` if the consumer went away.
    async fn build_index(
        &self,
        user_id: UserId,
        client: &dyn UpstreamClient,
        query: &ImportQuery,
        tx: &mpsc::Sender<ImportRecord>,
    ) -> Result<Option<Vec<ActivityIndexEntry>>> {
        let flag_key = format!("indexing:{user_id}");
        let acquired = self
            .kv
            .set_nx_ex(&flag_key, b"1", self.config.indexing_flag_ttl)
            .await?;
        if !acquired {
            return Err(EngineError::IndexBusy);
        }

        let result = self.paginate_and_index(user_id, client, query, tx).await;

        if let Err(e) = self.kv.del(&flag_key).await {
            tracing::warn!(user_id, error = %e, "failed to clear indexing marker");
        }
        result
    }

    async fn paginate_and_index(
        &self,
        user_id: UserId,
        client: &dyn UpstreamClient,
        query: &ImportQuery,
        tx: &mpsc::Sender<ImportRecord>,
    ) -> Result<Option<Vec<ActivityIndexEntry>>> {
        tracing::info!(user_id, "building activity index from upstream");

        let mut renderable = Vec::new();
        let mut indexed = 0usize;
        let mut page = 1u32;

        loop {
            let summaries = client
                .activity_summaries(page, self.config.fetch_page_size, SummaryFilters::default())
                .await?;
            if summaries.is_empty() {
                break;
            }

            // Summaries without GPS data carry nothing to render or
            // cache, so they are not indexed.
            let batch: Vec<ActivityIndexEntry> = summaries
                .iter()
                .filter(|s| s.has_position())
                .map(|s| s.to_index_entry(user_id))
                .collect();

            // Pages arrive newest-first, so the renderable subset can be
            // selected in order while indexing continues to the end.
            for entry in &batch {
                if (query.limit == 0 || renderable.len() < query.limit)
                    && entry_matches(entry, query)
                {
                    renderable.push(entry.clone());
                }
            }

            indexed += self.index.bulk_add(batch).await?;
            if tx
                .send(ImportRecord::Progress { count: indexed })
                .await
                .is_err()
            {
                return Ok(None);
            }
            page += 1;
        }

        tracing::info!(user_id, indexed, "activity index build complete");
        Ok(Some(renderable))
    }

    /// Serve payloads for `entries`: cache first, then a bounded-width
    /// upstream import for the misses. Returns false if the consumer
    /// dropped the stream.
    async fn attach_streams(
        &self,
        entries: Vec<ActivityIndexEntry>,
        client: Arc<dyn UpstreamClient>,
        tx: &mpsc::Sender<ImportRecord>,
        counts: &mut Counts,
    ) -> Result<bool> {
        let mut by_id: HashMap<ActivityId, ActivityIndexEntry> =
            entries.iter().map(|e| (e.id, e.clone())).collect();
        let ids: Vec<ActivityId> = entries.iter().map(|e| e.id).collect();

        let mut hits = self
            .cache
            .get_many(ids, self.config.cache_activities_ttl);
        while let Some((id, payload)) = hits.next().await {
            let Some(entry) = by_id.remove(&id) else {
                continue;
            };
            if payload.empty {
                counts.empty += 1;
                continue;
            }
            counts.fetched += 1;
            counts.count += 1;
            let record = ImportRecord::Activity {
                entry,
                streams: self.render_view(&payload),
            };
            if tx.send(record).await.is_err() {
                return Ok(false);
            }
        }

        if by_id.is_empty() {
            return Ok(true);
        }

        // Cache misses: import from upstream with bounded concurrency,
        // in the original (newest-first) entry order.
        let misses: Vec<ActivityIndexEntry> = entries
            .into_iter()
            .filter(|e| by_id.contains_key(&e.id))
            .collect();
        let fetch_names = self.upstream_stream_names();

        let mut imports = futures_util::stream::iter(misses.into_iter().map(|entry| {
            let client = client.clone();
            let names = fetch_names.clone();
            async move {
                let raw = client.activity_streams(entry.id, &names).await;
                (entry, raw)
            }
        }))
        .buffer_unordered(self.config.concurrency);

        while let Some((entry, raw)) = imports.next().await {
            let payload = match raw {
                Ok(Some(raw)) => self.encode_payload(raw),
                Ok(None) => StreamPayload::empty_marker(),
                // A fatal error (rejected credential) fails every
                // remaining fetch identically; rate-limit and transient
                // errors are per-item and siblings keep flowing.
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::warn!(activity_id = entry.id, error = %e, "stream import failed, skipped");
                    continue;
                }
            };

            if let Err(e) = self
                .cache
                .set(entry.id, &payload, self.config.cache_activities_ttl)
                .await
            {
                tracing::warn!(activity_id = entry.id, error = %e, "imported payload not cached");
            }

            if payload.empty {
                counts.empty += 1;
                continue;
            }
            counts.imported += 1;
            counts.count += 1;
            let record = ImportRecord::Activity {
                entry,
                streams: self.render_view(&payload),
            };
            if tx.send(record).await.is_err() {
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// Import specific activities by id, bypassing the index query.
    /// Used for webhook-driven creates. Returns how many were imported.
    pub async fn import_by_id(
        &self,
        user_id: UserId,
        client: Arc<dyn UpstreamClient>,
        ids: &[ActivityId],
    ) -> Result<usize> {
        let fetch_names = self.upstream_stream_names();
        let mut imported = 0usize;

        for &id in ids {
            let summary = match client.activity(id).await {
                Ok(summary) => summary,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::warn!(activity_id = id, error = %e, "activity fetch failed, skipped");
                    continue;
                }
            };
            if !summary.has_position() {
                continue;
            }
            self.index.add(summary.to_index_entry(user_id)).await?;

            let payload = match client.activity_streams(id, &fetch_names).await {
                Ok(Some(raw)) => self.encode_payload(raw),
                Ok(None) => StreamPayload::empty_marker(),
                Err(e) => {
                    tracing::warn!(activity_id = id, error = %e, "stream fetch failed, entry indexed without streams");
                    imported += 1;
                    continue;
                }
            };
            self.cache
                .set(id, &payload, self.config.cache_activities_ttl)
                .await?;
            imported += 1;
        }

        if imported > 0 {
            if let Err(e) = self
                .events
                .log(
                    format!("imported {imported} activities for user {user_id}"),
                    serde_json::json!({ "user_id": user_id, "ids": ids }),
                )
                .await
            {
                tracing::warn!(error = %e, "event log append failed");
            }
        }
        Ok(imported)
    }

    /// Stream names requested from upstream. The stored `polyline`
    /// stream is derived from the upstream `latlng` series.
    fn upstream_stream_names(&self) -> Vec<String> {
        self.config
            .streams_to_cache
            .iter()
            .map(|n| {
                if n == "polyline" {
                    "latlng".to_string()
                } else {
                    n.clone()
                }
            })
            .collect()
    }

    /// Build the stored payload from raw upstream series: latlng becomes
    /// an encoded polyline, integer series go through the delta codec,
    /// float series are kept raw. No usable series yields the empty
    /// sentinel.
    fn encode_payload(&self, raw: HashMap<String, RawStream>) -> StreamPayload {
        let mut payload = StreamPayload::default();

        for name in &self.config.streams_to_cache {
            let upstream_name = if name == "polyline" { "latlng" } else { name.as_str() };
            let Some(stream) = raw.get(upstream_name) else {
                continue;
            };
            // A present-but-blank series carries nothing worth storing.
            if stream.is_empty() {
                continue;
            }

            match stream {
                RawStream::LatLng(pairs) => {
                    let coords = pairs.iter().map(|ll| geo::Coord { x: ll[1], y: ll[0] });
                    match polyline::encode_coordinates(coords, 5) {
                        Ok(encoded) => {
                            payload
                                .streams
                                .insert(name.clone(), StreamData::Polyline(encoded));
                        }
                        Err(e) => {
                            tracing::warn!(stream = %name, error = %e, "polyline encoding failed")
                        }
                    }
                }
                RawStream::Ints(values) => match codec::encode(values) {
                    Ok(tokens) => {
                        payload
                            .streams
                            .insert(name.clone(), StreamData::Encoded(tokens));
                    }
                    Err(e) => tracing::debug!(stream = %name, error = %e, "series not encodable"),
                },
                RawStream::Floats(values) => {
                    payload
                        .streams
                        .insert(name.clone(), StreamData::Raw(values.clone()));
                }
            }
        }

        if payload.streams.is_empty() {
            StreamPayload::empty_marker()
        } else {
            payload
        }
    }

    /// Restrict a stored payload to the configured output streams.
    fn render_view(&self, payload: &StreamPayload) -> StreamPayload {
        StreamPayload {
            empty: payload.empty,
            streams: payload
                .streams
                .iter()
                .filter(|(name, _)| self.config.streams_out.contains(name))
                .map(|(name, data)| (name.clone(), data.clone()))
                .collect(),
        }
    }

    async fn log_done(&self, user_id: UserId, counts: &Counts) {
        let msg = format!(
            "queued {} activities for user {user_id} ({} hot, {} imported, {} empty)",
            counts.count, counts.fetched, counts.imported, counts.empty
        );
        if let Err(e) = self
            .events
            .log(
                msg,
                serde_json::json!({
                    "user_id": user_id,
                    "count": counts.count,
                    "fetched": counts.fetched,
                    "imported": counts.imported,
                    "empty": counts.empty,
                }),
            )
            .await
        {
            tracing::warn!(error = %e, "event log append failed");
        }
    }
}

fn entry_matches(entry: &ActivityIndexEntry, query: &ImportQuery) -> bool {
    query
        .activity_ids
        .as_ref()
        .map_or(true, |ids| ids.contains(&entry.id))
        && !query.exclude_ids.contains(&entry.id)
        && entry.in_date_range(query.after, query.before)
}

impl std::fmt::Debug for Importer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Importer").finish_non_exhaustive()
    }
}
