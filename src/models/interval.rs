use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Active seconds observed during one checkpoint window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TrackingInterval {
    /// Checkpoint time, not the start of the window.
    pub timestamp: DateTime<Utc>,
    pub duration_seconds: u64,
    /// False if the tab went to the background at any point in the window.
    pub is_active: bool,
}

impl TrackingInterval {
    pub fn new(timestamp: DateTime<Utc>, duration_seconds: u64, is_active: bool) -> Self {
        Self {
            timestamp,
            duration_seconds,
            is_active,
        }
    }
}
