// SPDX-License-Identifier: MIT

//! Engine error types.
//!
//! The taxonomy distinguishes failures that abort a whole operation
//! (invalid credential, both storage tiers down) from per-item failures
//! that are logged and skipped so sibling work keeps flowing.

/// Error type shared by all engine components.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The upstream rejected our credential. Fatal for the current
    /// operation; the user must re-authenticate.
    #[error("invalid upstream credential")]
    CredentialInvalid,

    /// The upstream request-rate ceiling was hit. Per-item scope: the
    /// current item is skipped and logged, never retried locally.
    #[error("upstream rate limit exceeded")]
    RateLimited,

    /// Any other upstream failure (network, 5xx, parse). Per-activity
    /// scope: skip and continue.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Stream encoding failed. Treated by callers as "activity has no
    /// usable stream", never as a hard failure.
    #[error("codec error: {0}")]
    Codec(String),

    /// A storage tier is unavailable. Single-tier failures are swallowed
    /// by the cache choreography; this surfaces only when no tier can
    /// serve the request.
    #[error("store error: {0}")]
    Store(String),

    /// Another request is currently building this user's index.
    /// Fail fast with a retry-later signal instead of racing it.
    #[error("activity index build already in progress")]
    IndexBusy,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid query: {0}")]
    BadQuery(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    /// Whether this error terminates the whole import rather than a
    /// single activity.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::CredentialInvalid | EngineError::BadQuery(_) | EngineError::IndexBusy
        )
    }
}

impl From<mongodb::error::Error> for EngineError {
    fn from(e: mongodb::error::Error) -> Self {
        EngineError::Store(e.to_string())
    }
}

impl From<redis::RedisError> for EngineError {
    fn from(e: redis::RedisError) -> Self {
        EngineError::Store(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Store(format!("document serialization: {e}"))
    }
}

/// Result type alias used throughout the engine.
pub type Result<T> = std::result::Result<T, EngineError>;
