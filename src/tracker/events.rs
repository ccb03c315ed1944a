use serde::Serialize;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::{
    models::{Identity, SessionLedger},
    transport::SyncPayload,
};

use super::state::Visibility;

/// Why a confirmed sync was issued; decides threshold gating and what a
/// success clears.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SyncKind {
    /// Cadence, backgrounding or manual trigger on the live ledger.
    Scheduled,
    /// Leftover ledger of a previous identity, discarded regardless of outcome.
    Handover,
    /// Logout flush of the live ledger.
    Final,
}

/// Out-of-cadence sources of a scheduled sync, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    Cadence,
    Hidden,
    Manual,
}

/// A transmission the agent loop must perform.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncRequest {
    pub ledger_id: Uuid,
    pub kind: SyncKind,
    pub payload: SyncPayload,
}

impl SyncRequest {
    pub fn for_ledger(ledger: &SessionLedger, kind: SyncKind) -> Self {
        Self {
            ledger_id: ledger.ledger_id,
            kind,
            payload: SyncPayload::from_ledger(ledger),
        }
    }

    pub fn complete(&self, result: anyhow::Result<()>) -> SyncCompletion {
        SyncCompletion {
            ledger_id: self.ledger_id,
            kind: self.kind,
            interval_count: self.payload.interval_count(),
            result,
        }
    }
}

/// Outcome of a [`SyncRequest`], posted back to the agent loop.
#[derive(Debug)]
pub struct SyncCompletion {
    pub ledger_id: Uuid,
    pub kind: SyncKind,
    /// Length of the snapshot that was sent; a success drains exactly this
    /// many leading intervals.
    pub interval_count: usize,
    pub result: anyhow::Result<()>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointOutcome {
    NotRunning,
    Idle,
    Recorded { seconds: u64 },
    PersistFailed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BindOutcome {
    /// Same identity; the existing ledger is kept as is.
    Resumed,
    /// A new empty ledger was created.
    Fresh,
    /// A foreign non-empty ledger was found; it must be flushed with this
    /// request. A new empty ledger was created for the incoming identity.
    Handover(SyncRequest),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackerSnapshot {
    pub identity: Option<Identity>,
    pub pending_seconds: u64,
    pub is_active: bool,
    pub ledger: Option<SessionLedger>,
    pub sync_in_flight: bool,
}

pub(crate) enum AgentCommand {
    Start {
        identity: Identity,
        reply: oneshot::Sender<BindOutcome>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Visibility(Visibility),
    UserInput,
    RequestSync,
    Unload,
    Snapshot {
        reply: oneshot::Sender<TrackerSnapshot>,
    },
}
