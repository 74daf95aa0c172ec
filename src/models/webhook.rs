// SPDX-License-Identifier: MIT

//! Incoming webhook update model.
//!
//! Transient: the engine applies updates to the activity index but does
//! not persist them beyond an event-log audit record.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::models::{ActivityId, UserId};

/// What kind of object the update refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectType {
    Activity,
    Athlete,
}

/// What happened to the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AspectType {
    Create,
    Update,
    Delete,
}

/// An asynchronous push notification from the upstream service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookUpdate {
    pub subscription_id: u64,
    pub owner_id: UserId,
    pub object_id: ActivityId,
    pub object_type: ObjectType,
    pub aspect_type: AspectType,
    /// Field deltas for `update` aspects (e.g. a renamed title).
    #[serde(default)]
    pub updates: HashMap<String, serde_json::Value>,
}
