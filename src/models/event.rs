// SPDX-License-Identifier: MIT

//! Event log record model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Append-only operational event. Immutable once written; logically
/// deleted only by capped-collection wraparound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Insertion timestamp, assigned by the log.
    pub ts: DateTime<Utc>,
    /// Human-readable message.
    pub msg: String,
    /// Arbitrary structured payload.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
}

impl EventRecord {
    /// Insertion timestamp as fractional epoch seconds, the identifier
    /// used on the live feed wire.
    pub fn epoch_seconds(&self) -> f64 {
        self.ts.timestamp() as f64 + f64::from(self.ts.timestamp_subsec_millis()) / 1000.0
    }
}
