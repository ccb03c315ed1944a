pub mod identity;
pub mod interval;
pub mod ledger;

pub use identity::Identity;
pub use interval::TrackingInterval;
pub use ledger::SessionLedger;
