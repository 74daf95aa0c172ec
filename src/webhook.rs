// SPDX-License-Identifier: MIT

//! Webhook-driven index maintenance.
//!
//! Upstream pushes create/update/delete notifications after an activity
//! changes. The handler applies them to the index so it stays current
//! without polling. Notifications for users who never built an index
//! are ignored: there is nothing to maintain and no reason to start an
//! import on their behalf.

use std::sync::Arc;

use crate::error::Result;
use crate::events::EventLog;
use crate::import::Importer;
use crate::index::ActivityIndex;
use crate::models::{AspectType, ObjectType, WebhookUpdate};
use crate::upstream::UpstreamClient;

/// Applies upstream change notifications to the activity index.
#[derive(Clone)]
pub struct WebhookHandler {
    index: ActivityIndex,
    importer: Importer,
    events: EventLog,
}

impl std::fmt::Debug for WebhookHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookHandler").finish_non_exhaustive()
    }
}

impl WebhookHandler {
    pub fn new(index: ActivityIndex, importer: Importer, events: EventLog) -> Self {
        Self {
            index,
            importer,
            events,
        }
    }

    /// Handle one notification. Idempotent: replaying a delivery leaves
    /// the index in the same state.
    pub async fn handle_update(
        &self,
        update: WebhookUpdate,
        client: Arc<dyn UpstreamClient>,
    ) -> Result<()> {
        if update.object_type == ObjectType::Athlete {
            return self.handle_athlete_update(&update).await;
        }

        // A user without an index has nothing to maintain; their index
        // will be built from scratch on first contact anyway.
        if self.index.size_for_user(update.owner_id).await? == 0 {
            tracing::debug!(
                user_id = update.owner_id,
                activity_id = update.object_id,
                "notification for unindexed user ignored"
            );
            return Ok(());
        }

        match update.aspect_type {
            AspectType::Create => {
                self.importer
                    .import_by_id(update.owner_id, client, &[update.object_id])
                    .await?;
            }
            AspectType::Update => {
                let existed = self.index.update(update.object_id, &update.updates).await?;
                if !existed {
                    // An update for an activity we never saw is really a
                    // late create.
                    tracing::debug!(
                        activity_id = update.object_id,
                        "update for unknown activity, importing instead"
                    );
                    self.importer
                        .import_by_id(update.owner_id, client, &[update.object_id])
                        .await?;
                }
            }
            AspectType::Delete => {
                let existed = self.index.delete(update.object_id).await?;
                if existed {
                    self.importer.cache().delete(update.object_id).await?;
                }
            }
        }

        self.audit(&update).await;
        Ok(())
    }

    /// Athlete-level notifications: the only one acted on is
    /// deauthorization, which removes every index entry the user owns.
    async fn handle_athlete_update(&self, update: &WebhookUpdate) -> Result<()> {
        let deauthorized = update
            .updates
            .get("authorized")
            .is_some_and(|v| v.as_str() == Some("false") || v.as_bool() == Some(false));
        if !deauthorized {
            return Ok(());
        }

        let deleted = self.index.delete_all_for_user(update.owner_id).await?;
        tracing::info!(
            user_id = update.owner_id,
            deleted,
            "user deauthorized, index entries removed"
        );
        self.audit(update).await;
        Ok(())
    }

    async fn audit(&self, update: &WebhookUpdate) {
        let msg = format!(
            "webhook {:?} {:?} {} (user {})",
            update.aspect_type, update.object_type, update.object_id, update.owner_id
        );
        if let Err(e) = self
            .events
            .log(
                msg,
                serde_json::json!({
                    "object_id": update.object_id,
                    "owner_id": update.owner_id,
                }),
            )
            .await
        {
            tracing::warn!(error = %e, "webhook audit event not logged");
        }
    }
}
