// SPDX-License-Identifier: MIT

//! Activity index: the authoritative, queryable list of what activities
//! exist for a user and in what order.
//!
//! The index owns its entries independently of the stream cache; an
//! indexed activity without a cached stream is a normal state (streams
//! materialize lazily), not a consistency violation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{NaiveDateTime, Utc};

use crate::db::DocStore;
use crate::error::Result;
use crate::models::{ActivityId, ActivityIndexEntry, UserId};

/// Query parameters for [`ActivityIndex::query`].
#[derive(Debug, Clone, Default)]
pub struct IndexQuery {
    /// Restrict to this id set, if present.
    pub activity_ids: Option<HashSet<ActivityId>>,
    /// The caller's already-known id set, for reconciliation.
    pub exclude_ids: HashSet<ActivityId>,
    /// Local start time lower bound (inclusive).
    pub after: Option<NaiveDateTime>,
    /// Local start time upper bound (inclusive).
    pub before: Option<NaiveDateTime>,
    /// Maximum entries returned; 0 means unlimited.
    pub limit: usize,
    /// Refresh the last-touched timestamp of every returned entry.
    /// Set for reads about to be rendered to a user, never for
    /// background maintenance reads.
    pub refresh_ts: bool,
}

/// Result of a reconciling index query.
#[derive(Debug, Default)]
pub struct QueryResult {
    /// Matching entries not already known to the caller, newest-first.
    pub entries: Vec<ActivityIndexEntry>,
    /// Ids the caller knows that no longer match or exist.
    pub to_delete: Vec<ActivityId>,
}

/// Per-user chronological metadata index over activities.
#[derive(Clone)]
pub struct ActivityIndex {
    db: Arc<dyn DocStore>,
}

impl ActivityIndex {
    pub fn new(db: Arc<dyn DocStore>) -> Self {
        Self { db }
    }

    /// Upsert one entry by activity id.
    pub async fn add(&self, entry: ActivityIndexEntry) -> Result<()> {
        self.db.upsert_index_entry(entry).await
    }

    /// Unordered bulk upsert; one store write per batch.
    pub async fn bulk_add(&self, entries: Vec<ActivityIndexEntry>) -> Result<usize> {
        self.db.bulk_upsert_index(entries).await
    }

    pub async fn get(&self, id: ActivityId) -> Result<Option<ActivityIndexEntry>> {
        self.db.get_index_entry(id).await
    }

    /// Entries for `user` restricted by the query, newest-first.
    ///
    /// When `exclude_ids` is supplied, the result additionally reports
    /// `to_delete`: ids the caller holds that the query no longer
    /// matches, letting a live view reconcile stale state without
    /// re-sending full payloads. Matching entries the caller already
    /// holds are omitted from `entries`.
    pub async fn query(&self, user_id: UserId, query: &IndexQuery) -> Result<QueryResult> {
        let matched = self.matching_entries(user_id, query).await?;

        let mut result = QueryResult::default();
        if query.exclude_ids.is_empty() {
            result.entries = matched;
        } else {
            let matched_ids: HashSet<ActivityId> = matched.iter().map(|e| e.id).collect();
            result.to_delete = query
                .exclude_ids
                .difference(&matched_ids)
                .copied()
                .collect();
            result.entries = matched
                .into_iter()
                .filter(|e| !query.exclude_ids.contains(&e.id))
                .collect();
        }

        if query.refresh_ts && !result.entries.is_empty() {
            let ids: Vec<ActivityId> = result.entries.iter().map(|e| e.id).collect();
            self.db.touch_index_entries(&ids, Utc::now()).await?;
        }

        Ok(result)
    }

    /// Id-only variant of [`query`](Self::query), used for client-side
    /// reconciliation. Never refreshes touch timestamps.
    pub async fn query_ids(
        &self,
        user_id: UserId,
        query: &IndexQuery,
    ) -> Result<(Vec<ActivityId>, Vec<ActivityId>)> {
        let matched = self.matching_entries(user_id, query).await?;
        let matched_ids: HashSet<ActivityId> = matched.iter().map(|e| e.id).collect();

        let to_delete = query
            .exclude_ids
            .difference(&matched_ids)
            .copied()
            .collect();
        let to_fetch = matched
            .iter()
            .map(|e| e.id)
            .filter(|id| !query.exclude_ids.contains(id))
            .collect();

        Ok((to_fetch, to_delete))
    }

    async fn matching_entries(
        &self,
        user_id: UserId,
        query: &IndexQuery,
    ) -> Result<Vec<ActivityIndexEntry>> {
        let mut entries: Vec<ActivityIndexEntry> = self
            .db
            .index_entries_for_user(user_id)
            .await?
            .into_iter()
            .filter(|e| {
                query
                    .activity_ids
                    .as_ref()
                    .map_or(true, |ids| ids.contains(&e.id))
            })
            .filter(|e| e.in_date_range(query.after, query.before))
            .collect();

        entries.sort_by(|a, b| b.ts_utc.cmp(&a.ts_utc));
        if query.limit > 0 {
            entries.truncate(query.limit);
        }
        Ok(entries)
    }

    /// Partial update for webhook-driven edits. An upstream `title`
    /// delta is mapped onto the stored `name` field. Returns whether a
    /// matching document existed, so callers can distinguish "update"
    /// from "this must actually be a create".
    pub async fn update(
        &self,
        id: ActivityId,
        deltas: &HashMap<String, serde_json::Value>,
    ) -> Result<bool> {
        if deltas.is_empty() {
            return self.db.get_index_entry(id).await.map(|e| e.is_some());
        }

        let mut deltas = deltas.clone();
        if let Some(title) = deltas.remove("title") {
            deltas.insert("name".to_string(), title);
        }
        // Identity fields never change after creation.
        deltas.remove("_id");
        deltas.remove("user_id");

        self.db.update_index_entry(id, deltas).await
    }

    /// Durable removal; deleting an absent id is a no-op.
    pub async fn delete(&self, id: ActivityId) -> Result<bool> {
        self.db.delete_index_entry(id).await
    }

    /// Remove every entry owned by `user`, for account deletion.
    pub async fn delete_all_for_user(&self, user_id: UserId) -> Result<u64> {
        let deleted = self.db.delete_index_for_user(user_id).await?;
        tracing::debug!(user_id, deleted, "deleted index entries");
        Ok(deleted)
    }

    /// Entry count; zero means the user needs a full index build.
    pub async fn size_for_user(&self, user_id: UserId) -> Result<u64> {
        self.db.count_index_for_user(user_id).await
    }
}
