use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Identity, TrackingInterval};

/// Accumulated, not-yet-synced activity for one identity.
///
/// `intervals` is append-only in chronological order until a sync drains a
/// prefix of it. The owner never changes; a different identity gets a new
/// ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionLedger {
    pub ledger_id: Uuid,
    pub owner: Identity,
    pub started_at: DateTime<Utc>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub intervals: Vec<TrackingInterval>,
}

impl SessionLedger {
    pub fn new(owner: Identity, started_at: DateTime<Utc>) -> Self {
        Self {
            ledger_id: Uuid::new_v4(),
            owner,
            started_at,
            last_sync_at: None,
            intervals: Vec::new(),
        }
    }

    pub fn total_seconds(&self) -> u64 {
        self.intervals
            .iter()
            .map(|interval| interval.duration_seconds)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn belongs_to(&self, identity: &Identity) -> bool {
        &self.owner == identity
    }

    /// Removes the first `count` intervals, i.e. exactly the snapshot a sync
    /// transmitted. Anything appended after the snapshot stays.
    pub fn drain_synced(&mut self, count: usize, synced_at: DateTime<Utc>) {
        let count = count.min(self.intervals.len());
        self.intervals.drain(..count);
        self.last_sync_at = Some(synced_at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_synced_keeps_intervals_appended_after_snapshot() {
        let now = Utc::now();
        let mut ledger = SessionLedger::new(Identity::user("u1"), now);
        ledger.intervals.push(TrackingInterval::new(now, 60, true));
        ledger.intervals.push(TrackingInterval::new(now, 30, true));
        let snapshot_len = ledger.intervals.len();
        ledger.intervals.push(TrackingInterval::new(now, 12, false));

        ledger.drain_synced(snapshot_len, now);

        assert_eq!(ledger.total_seconds(), 12);
        assert_eq!(ledger.last_sync_at, Some(now));
    }

    #[test]
    fn ownership_compares_the_full_pair() {
        let ledger = SessionLedger::new(Identity::new("u1", Some("s1".into())), Utc::now());
        assert!(ledger.belongs_to(&Identity::new("u1", Some("s1".into()))));
        assert!(!ledger.belongs_to(&Identity::new("u1", Some("s2".into()))));
        assert!(!ledger.belongs_to(&Identity::user("u1")));
    }

    #[test]
    fn serializes_camel_case() {
        let ledger = SessionLedger::new(Identity::user("u1"), Utc::now());
        let json = serde_json::to_value(&ledger).unwrap();
        assert!(json.get("startedAt").is_some());
        assert!(json.get("lastSyncAt").is_some());
        assert_eq!(json["owner"]["userId"], "u1");
    }
}
