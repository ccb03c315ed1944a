//! Learning-time tracking agent.
//!
//! Counts the seconds a user is actively engaged with the hosting
//! application, checkpoints them into a durable ledger and reconciles the
//! ledger with a remote endpoint:
//!
//! ```text
//! Activity Clock -> Checkpoint -> ledger slot -> Sync Engine -> endpoint
//! ```
//!
//! Identity changes, backgrounding and teardown trigger out-of-cadence
//! flushes. See [`TrackingAgent`] for the host-facing API.

mod utils;

pub mod clock;
pub mod db;
pub mod models;
pub mod settings;
pub mod tracker;
pub mod transport;

pub use clock::{Clock, ManualClock, SystemClock};
pub use db::{LedgerStore, MemoryLedgerStore, SqliteLedgerStore};
pub use models::{Identity, SessionLedger, TrackingInterval};
pub use settings::{SettingsStore, TrackerSettings};
pub use tracker::{BindOutcome, TrackerCore, TrackerSnapshot, TrackingAgent};
pub use transport::{BeaconTransport, HttpBeacon, HttpSyncTransport, SyncPayload, SyncTransport};

/// Installs `env_logger` at `info` unless `RUST_LOG` says otherwise.
///
/// Safe to call when the host already set up a logger; the second
/// installation is skipped.
pub fn init_logging() {
    let result = env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .try_init();

    if result.is_ok() {
        log::info!("studytime tracking agent logging initialized");
    }
}
