// SPDX-License-Identifier: MIT

//! Activity index entry model and bounding-box computation.

use chrono::{DateTime, NaiveDateTime, Utc};
use geo::BoundingRect;
use serde::{Deserialize, Serialize};

use crate::models::{ActivityId, UserId};

/// Geographic bounding box of an activity track.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    /// South-west corner as (lat, lng).
    #[serde(rename = "SW")]
    pub sw: [f64; 2],
    /// North-east corner as (lat, lng).
    #[serde(rename = "NE")]
    pub ne: [f64; 2],
}

impl Bounds {
    /// Compute the bounding box of an encoded polyline.
    ///
    /// Returns `None` for an empty or undecodable polyline; activities
    /// without GPS tracks simply have no bounds.
    pub fn from_polyline(encoded: &str) -> Option<Bounds> {
        let line = polyline::decode_polyline(encoded, 5).ok()?;
        let rect = line.bounding_rect()?;
        // geo coordinates are (x=lng, y=lat); stored corners are (lat, lng).
        Some(Bounds {
            sw: [rect.min().y, rect.min().x],
            ne: [rect.max().y, rect.max().x],
        })
    }
}

/// One entry per upstream activity, owned by the activity index.
///
/// `ts` is the last-touched timestamp driving sliding retention; it is
/// refreshed on reads that are about to be rendered to a user, never on
/// background maintenance reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityIndexEntry {
    /// Activity ID (document key, assigned upstream).
    #[serde(rename = "_id")]
    pub id: ActivityId,
    /// Owning user; immutable after creation.
    pub user_id: UserId,
    /// Activity name/title.
    pub name: String,
    /// Sport type (Ride, Run, Hike, etc.)
    pub activity_type: String,
    /// Start time in UTC.
    pub ts_utc: DateTime<Utc>,
    /// Start time in the activity's local timezone.
    pub ts_local: NaiveDateTime,
    /// Last-touched timestamp (sliding retention clock).
    pub ts: DateTime<Utc>,
    /// Elapsed time in seconds.
    pub elapsed_time: i64,
    /// Total distance in meters.
    pub total_distance: f64,
    /// Average speed in meters per second.
    pub average_speed: f64,
    /// Start coordinate as (lat, lng), if the activity has GPS data.
    pub start_latlng: Option<[f64; 2]>,
    /// Bounding box computed from the summary polyline.
    pub bounds: Option<Bounds>,
}

impl ActivityIndexEntry {
    /// Whether the entry's local start time falls inside the given
    /// inclusive range. An unset bound does not constrain.
    pub fn in_date_range(
        &self,
        after: Option<NaiveDateTime>,
        before: Option<NaiveDateTime>,
    ) -> bool {
        let t1 = after.map_or(true, |a| a <= self.ts_local);
        let t2 = before.map_or(true, |b| self.ts_local <= b);
        t1 && t2
    }
}
