pub mod controller;
pub mod engine;
pub mod events;
pub mod state;

pub use controller::TrackingAgent;
pub use engine::TrackerCore;
pub use events::{
    BindOutcome, CheckpointOutcome, SyncCompletion, SyncKind, SyncRequest, SyncTrigger,
    TrackerSnapshot,
};
pub use state::{ActivityState, ClockStatus, Visibility};
