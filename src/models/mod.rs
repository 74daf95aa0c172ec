// SPDX-License-Identifier: MIT

//! Data models owned by the engine.

pub mod activity;
pub mod event;
pub mod stream;
pub mod webhook;

pub use activity::{ActivityIndexEntry, Bounds};
pub use event::EventRecord;
pub use stream::{StreamData, StreamPayload};
pub use webhook::{AspectType, ObjectType, WebhookUpdate};

/// Upstream-assigned activity identifier, globally unique.
pub type ActivityId = u64;

/// Owning user identifier.
pub type UserId = u64;
