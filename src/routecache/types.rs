use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::{RoutePoint, Submit};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
}

/// Polar offset of the target as seen from own ship.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelativePosition {
    pub origin: Position,
    pub distance: f64,
    pub bearing: f64,
    pub bearing_unit: String,
    pub distance_unit: String,
}

/// One radar-target sample as delivered by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub target_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub position: Position,
    #[serde(default)]
    pub relative: Option<RelativePosition>,
    #[serde(default)]
    pub speed_over_ground: Option<f64>,
    #[serde(default)]
    pub course_over_ground_true: Option<f64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

/// Oldest run of unsent points of a single track, at least two long.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingBatch {
    pub track: Uuid,
    /// Epoch milliseconds of the first point.
    pub start_ms: i64,
    pub points: Vec<RoutePoint>,
}

impl PendingBatch {
    /// Absolute timestamp of the last point.
    pub fn end_ms(&self) -> i64 {
        self.start_ms + self.points.last().map_or(0, |p| p.timestamp)
    }

    pub fn to_submit(&self) -> Submit {
        Submit {
            uuid: self.track.to_string(),
            start: self.start_ms,
            route: self.points.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PendingStats {
    pub unsent_datapoints: u64,
    pub unsent_tracks: u64,
}
