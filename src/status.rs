use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::Serialize;
use tokio::sync::watch;

/// Occupancy level derived from one detection reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OccupancyLevel {
    Ok,
    NearFull,
    Full,
}

/// Classify a reading. FULL at or above capacity, NEAR_FULL at or above 80%.
///
/// Near the thresholds the level follows detector noise directly, there is no
/// hysteresis.
pub fn classify(occupancy: u32, capacity: u32) -> OccupancyLevel {
    if occupancy >= capacity {
        OccupancyLevel::Full
    } else if u64::from(occupancy) * 5 >= u64::from(capacity) * 4 {
        // occupancy >= 0.8 * capacity, kept in integers
        OccupancyLevel::NearFull
    } else {
        OccupancyLevel::Ok
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SystemStatus {
    Initializing,
    Ok,
    NearFull,
    Full,
}

impl SystemStatus {
    pub fn label(self) -> &'static str {
        match self {
            SystemStatus::Initializing => "Initializing",
            SystemStatus::Ok => "OK",
            SystemStatus::NearFull => "NEAR FULL",
            SystemStatus::Full => "FULL!",
        }
    }
}

impl From<OccupancyLevel> for SystemStatus {
    fn from(level: OccupancyLevel) -> Self {
        match level {
            OccupancyLevel::Ok => SystemStatus::Ok,
            OccupancyLevel::NearFull => SystemStatus::NearFull,
            OccupancyLevel::Full => SystemStatus::Full,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationState {
    Locating,
    Resolved,
    Unavailable,
}

/// Everything the display, overlay and status endpoint show. Published as a
/// whole value; readers never see a half-applied update.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub occupancy: u32,
    pub capacity: u32,
    pub last_update: Option<DateTime<Local>>,
    pub status: SystemStatus,
    pub camera_ready: bool,
    pub api_reachable: bool,
    pub location_label: String,
    pub location_state: LocationState,
    pub location_updated_at: Option<DateTime<Local>>,
}

impl StatusSnapshot {
    pub fn initial(capacity: u32) -> Self {
        Self {
            occupancy: 0,
            capacity,
            last_update: None,
            status: SystemStatus::Initializing,
            camera_ready: false,
            api_reachable: false,
            location_label: "Locating...".to_string(),
            location_state: LocationState::Locating,
            location_updated_at: None,
        }
    }

    /// True once a reading exists and is older than `max_age`.
    pub fn is_stale(&self, now: DateTime<Local>, max_age: Duration) -> bool {
        match self.last_update {
            Some(at) => now
                .signed_duration_since(at)
                .to_std()
                .map(|age| age > max_age)
                .unwrap_or(false),
            None => false,
        }
    }
}

/// Shared handle to the agent's single status snapshot.
///
/// Each writer replaces the whole value under the channel's lock, so the four
/// reading fields always travel together.
#[derive(Clone)]
pub struct SnapshotHandle {
    tx: Arc<watch::Sender<StatusSnapshot>>,
}

impl SnapshotHandle {
    pub fn new(initial: StatusSnapshot) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> StatusSnapshot {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.tx.subscribe()
    }

    /// Publish a new reading and the status derived from it.
    pub fn publish_reading(&self, occupancy: u32, capacity: u32, at: DateTime<Local>) {
        let status = SystemStatus::from(classify(occupancy, capacity));
        self.publish(|prev| StatusSnapshot {
            occupancy,
            capacity,
            last_update: Some(at),
            status,
            ..prev.clone()
        });
    }

    pub fn set_camera_ready(&self, camera_ready: bool) {
        self.publish(|prev| StatusSnapshot {
            camera_ready,
            ..prev.clone()
        });
    }

    pub fn set_api_reachable(&self, api_reachable: bool) {
        self.tx.send_if_modified(|snapshot| {
            if snapshot.api_reachable == api_reachable {
                return false;
            }
            *snapshot = StatusSnapshot {
                api_reachable,
                ..snapshot.clone()
            };
            true
        });
    }

    pub fn set_location(&self, label: String, at: DateTime<Local>) {
        self.publish(|prev| StatusSnapshot {
            location_label: label,
            location_state: LocationState::Resolved,
            location_updated_at: Some(at),
            ..prev.clone()
        });
    }

    /// Keep the last label but flag it as no longer current.
    pub fn mark_location_unavailable(&self) {
        self.publish(|prev| StatusSnapshot {
            location_state: LocationState::Unavailable,
            ..prev.clone()
        });
    }

    fn publish(&self, next: impl FnOnce(&StatusSnapshot) -> StatusSnapshot) {
        self.tx.send_modify(|snapshot| *snapshot = next(snapshot));
    }
}
