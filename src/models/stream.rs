// SPDX-License-Identifier: MIT

//! Cached stream payload model.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::codec::Token;

/// One named stream inside a cached payload.
///
/// Untagged: an encoded stream is a token list, a raw series is a list
/// of floats, and a polyline is a string. The stored document shape is
/// the same as what gets rendered to consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StreamData {
    /// Codec-encoded integer series (e.g. elapsed time).
    Encoded(Vec<Token>),
    /// Encoded polyline string (compressed latlng track).
    Polyline(String),
    /// Raw numeric series kept as-is (e.g. altitude).
    Raw(Vec<f64>),
}

/// Per-activity stream document, owned by the tiered cache.
///
/// The `empty` sentinel flags activities confirmed to have no usable
/// streams, so repeated fetch attempts are avoided. It is a
/// found-but-no-data result, distinct from a cache miss.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamPayload {
    #[serde(default, skip_serializing_if = "is_false")]
    pub empty: bool,
    #[serde(flatten)]
    pub streams: HashMap<String, StreamData>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl StreamPayload {
    /// The sentinel for an activity confirmed to have no usable streams.
    pub fn empty_marker() -> Self {
        Self {
            empty: true,
            streams: HashMap::new(),
        }
    }

    pub fn with_stream(mut self, name: impl Into<String>, data: StreamData) -> Self {
        self.streams.insert(name.into(), data);
        self
    }

    pub fn get(&self, name: &str) -> Option<&StreamData> {
        self.streams.get(name)
    }
}
