//! Delivery channels for ledger intervals.
//!
//! Two channels with different guarantees:
//! - [`SyncTransport`]: confirmed. The caller learns whether the server
//!   accepted the batch and only then clears it from the ledger.
//! - [`BeaconTransport`]: fire-and-forget. Used while the host is tearing
//!   down; no response is awaited and nothing is cleared.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{SessionLedger, TrackingInterval};

mod http;

pub use http::{HttpBeacon, HttpSyncTransport};

/// Body sent to the remote sync endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncPayload {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub total_seconds: u64,
    pub intervals: Vec<TrackingInterval>,
}

impl SyncPayload {
    /// Snapshot of the ledger's current intervals, in ledger order.
    pub fn from_ledger(ledger: &SessionLedger) -> Self {
        Self {
            user_id: ledger.owner.user_id.clone(),
            session_id: ledger.owner.session_id.clone(),
            started_at: ledger.started_at,
            total_seconds: ledger.total_seconds(),
            intervals: ledger.intervals.clone(),
        }
    }

    pub fn interval_count(&self) -> usize {
        self.intervals.len()
    }
}

#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Resolves `Ok` only when the server acknowledged the batch.
    async fn send(&self, payload: &SyncPayload) -> Result<()>;
}

pub trait BeaconTransport: Send + Sync {
    /// Hands the payload off without waiting. Returns whether it was queued.
    fn dispatch(&self, payload: SyncPayload) -> bool;
}
