// SPDX-License-Identifier: MIT

//! Upstream fitness API capability.
//!
//! The engine consumes activity summaries and per-stream time series
//! through the [`UpstreamClient`] trait; [`StravaClient`] is the
//! production implementation. Failures are split into "invalid
//! credential" (fatal for the whole import) and per-activity errors
//! (skip and continue).

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::error::{EngineError, Result};
use crate::models::{ActivityId, ActivityIndexEntry, Bounds, UserId};

/// Date-range filters for paginated summary listing.
#[derive(Debug, Clone, Copy, Default)]
pub struct SummaryFilters {
    /// Only activities starting after this instant (epoch seconds).
    pub after: Option<i64>,
    /// Only activities starting before this instant (epoch seconds).
    pub before: Option<i64>,
}

/// One named raw series as delivered by the upstream.
#[derive(Debug, Clone, PartialEq)]
pub enum RawStream {
    /// Coordinate track as (lat, lng) pairs.
    LatLng(Vec<[f64; 2]>),
    /// Integer series (e.g. elapsed seconds).
    Ints(Vec<i64>),
    /// Floating-point series (e.g. altitude).
    Floats(Vec<f64>),
}

impl RawStream {
    pub fn len(&self) -> usize {
        match self {
            RawStream::LatLng(v) => v.len(),
            RawStream::Ints(v) => v.len(),
            RawStream::Floats(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Activity summary as delivered by the upstream.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamActivity {
    pub id: ActivityId,
    pub name: String,
    #[serde(alias = "type")]
    pub sport_type: String,
    pub start_date: DateTime<Utc>,
    pub start_date_local: NaiveDateTime,
    #[serde(default)]
    pub distance: f64,
    #[serde(default)]
    pub elapsed_time: i64,
    #[serde(default)]
    pub average_speed: f64,
    #[serde(default)]
    pub start_latlng: Option<Vec<f64>>,
    #[serde(default)]
    pub map: Option<UpstreamMap>,
}

/// Activity map data with the summary polyline.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamMap {
    pub summary_polyline: Option<String>,
}

impl UpstreamActivity {
    /// Whether the activity carries GPS data worth indexing.
    pub fn has_position(&self) -> bool {
        self.start_latlng.as_ref().is_some_and(|ll| ll.len() >= 2)
    }

    /// Convert to an index entry, computing the bounding box from the
    /// summary polyline when present.
    pub fn to_index_entry(&self, user_id: UserId) -> ActivityIndexEntry {
        let polyline = self
            .map
            .as_ref()
            .and_then(|m| m.summary_polyline.as_deref());

        ActivityIndexEntry {
            id: self.id,
            user_id,
            name: self.name.clone(),
            activity_type: self.sport_type.clone(),
            ts_utc: self.start_date,
            ts_local: self.start_date_local,
            ts: Utc::now(),
            elapsed_time: self.elapsed_time,
            total_distance: self.distance,
            average_speed: self.average_speed,
            start_latlng: self
                .start_latlng
                .as_ref()
                .filter(|ll| ll.len() >= 2)
                .map(|ll| [ll[0], ll[1]]),
            bounds: polyline.and_then(Bounds::from_polyline),
        }
    }
}

/// Upstream client capability consumed by the import pipeline.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// One page of activity summaries, newest-first. An empty page
    /// signals the end of pagination.
    async fn activity_summaries(
        &self,
        page: u32,
        per_page: u32,
        filters: SummaryFilters,
    ) -> Result<Vec<UpstreamActivity>>;

    /// Raw time series for one activity. `Ok(None)` means the activity
    /// has no streams at all (a confirmed-empty result, not an error).
    async fn activity_streams(
        &self,
        id: ActivityId,
        names: &[String],
    ) -> Result<Option<HashMap<String, RawStream>>>;

    /// One activity summary by id.
    async fn activity(&self, id: ActivityId) -> Result<UpstreamActivity>;
}

// ─── Strava implementation ───────────────────────────────────────────

/// OAuth credential for one user, refreshed in place when expired.
#[derive(Debug, Clone)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
    /// Expiry as epoch seconds.
    pub expires_at: i64,
}

/// Margin before expiry at which the token is proactively refreshed.
const TOKEN_REFRESH_MARGIN_SECS: i64 = 5 * 60;

/// Strava API client bound to one user's credential.
pub struct StravaClient {
    http: reqwest::Client,
    base_url: String,
    client_id: String,
    client_secret: String,
    credential: RwLock<Credential>,
}

impl StravaClient {
    pub fn new(client_id: String, client_secret: String, credential: Credential) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: "https://www.strava.com/api/v3".to_string(),
            client_id,
            client_secret,
            credential: RwLock::new(credential),
        }
    }

    /// Get a valid access token, refreshing through the OAuth token
    /// endpoint when the current one is expired or expiring soon.
    async fn valid_token(&self) -> Result<String> {
        let now = Utc::now().timestamp();
        {
            let cred = self.credential.read().await;
            if now + TOKEN_REFRESH_MARGIN_SECS < cred.expires_at {
                return Ok(cred.access_token.clone());
            }
        }

        let mut cred = self.credential.write().await;
        // Another task may have refreshed while we waited on the lock.
        if now + TOKEN_REFRESH_MARGIN_SECS < cred.expires_at {
            return Ok(cred.access_token.clone());
        }

        tracing::info!("access token expired, refreshing");
        let response = self
            .http
            .post("https://www.strava.com/oauth/token")
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("refresh_token", cred.refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|e| EngineError::Upstream(format!("token refresh request failed: {e}")))?;

        if !response.status().is_success() {
            // A rejected refresh token means the user must re-authenticate.
            return Err(EngineError::CredentialInvalid);
        }

        let refreshed: TokenRefreshResponse = response
            .json()
            .await
            .map_err(|e| EngineError::Upstream(format!("token refresh parse: {e}")))?;

        cred.access_token = refreshed.access_token.clone();
        cred.refresh_token = refreshed.refresh_token;
        cred.expires_at = refreshed.expires_at;

        Ok(refreshed.access_token)
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let token = self.valid_token().await?;
        let response = self
            .http
            .get(url)
            .bearer_auth(token)
            .query(query)
            .send()
            .await
            .map_err(|e| EngineError::Upstream(e.to_string()))?;

        Self::check_response_json(response).await
    }

    /// Map response status onto the engine error taxonomy and parse.
    async fn check_response_json<T: for<'de> Deserialize<'de>>(
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();

            return Err(match status.as_u16() {
                401 => EngineError::CredentialInvalid,
                429 => {
                    tracing::warn!("upstream rate limit hit (429)");
                    EngineError::RateLimited
                }
                404 => EngineError::NotFound(body),
                _ => EngineError::Upstream(format!("HTTP {status}: {body}")),
            });
        }

        response
            .json()
            .await
            .map_err(|e| EngineError::Upstream(format!("JSON parse error: {e}")))
    }
}

#[async_trait]
impl UpstreamClient for StravaClient {
    async fn activity_summaries(
        &self,
        page: u32,
        per_page: u32,
        filters: SummaryFilters,
    ) -> Result<Vec<UpstreamActivity>> {
        let url = format!("{}/athlete/activities", self.base_url);

        let mut query = vec![
            ("page", page.to_string()),
            ("per_page", per_page.to_string()),
        ];
        if let Some(after) = filters.after {
            query.push(("after", after.to_string()));
        }
        if let Some(before) = filters.before {
            query.push(("before", before.to_string()));
        }

        self.get_json(&url, &query).await
    }

    async fn activity_streams(
        &self,
        id: ActivityId,
        names: &[String],
    ) -> Result<Option<HashMap<String, RawStream>>> {
        let url = format!("{}/activities/{}/streams", self.base_url, id);
        let query = [
            ("keys", names.join(",")),
            ("key_by_type", "true".to_string()),
            ("series_type", "time".to_string()),
        ];

        let raw: HashMap<String, StreamEnvelope> = match self.get_json(&url, &query).await {
            Ok(raw) => raw,
            // No streams recorded at all: confirmed empty, not an error.
            Err(EngineError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        if raw.is_empty() {
            return Ok(None);
        }

        let mut streams = HashMap::with_capacity(raw.len());
        for (name, envelope) in raw {
            streams.insert(name, envelope.into_raw_stream());
        }
        Ok(Some(streams))
    }

    async fn activity(&self, id: ActivityId) -> Result<UpstreamActivity> {
        let url = format!("{}/activities/{}", self.base_url, id);
        self.get_json(&url, &[]).await
    }
}

/// Token refresh response from the OAuth endpoint.
#[derive(Debug, Clone, Deserialize)]
struct TokenRefreshResponse {
    access_token: String,
    refresh_token: String,
    expires_at: i64,
}

/// One stream as keyed by type in the upstream response.
#[derive(Debug, Deserialize)]
struct StreamEnvelope {
    data: Vec<serde_json::Value>,
}

impl StreamEnvelope {
    /// Classify the series shape: coordinate pairs, integers, or floats.
    fn into_raw_stream(self) -> RawStream {
        if self.data.iter().all(|v| v.is_array()) && !self.data.is_empty() {
            let pairs = self
                .data
                .iter()
                .filter_map(|v| {
                    let pair = v.as_array()?;
                    Some([pair.first()?.as_f64()?, pair.get(1)?.as_f64()?])
                })
                .collect();
            return RawStream::LatLng(pairs);
        }

        if self.data.iter().all(|v| v.is_i64()) {
            RawStream::Ints(self.data.iter().filter_map(|v| v.as_i64()).collect())
        } else {
            RawStream::Floats(self.data.iter().filter_map(|v| v.as_f64()).collect())
        }
    }
}
