use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Mutex,
};

use anyhow::{anyhow, bail, Result};

use super::LedgerStore;
use crate::models::SessionLedger;

/// Ledger slot kept in process memory.
///
/// Writes can be made to fail on demand to exercise the quota-exceeded path.
#[derive(Default)]
pub struct MemoryLedgerStore {
    slot: Mutex<Option<SessionLedger>>,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ledger(ledger: SessionLedger) -> Self {
        Self {
            slot: Mutex::new(Some(ledger)),
            ..Self::default()
        }
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful `save` calls.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn slot(&self) -> Result<std::sync::MutexGuard<'_, Option<SessionLedger>>> {
        self.slot
            .lock()
            .map_err(|_| anyhow!("memory ledger lock poisoned"))
    }
}

impl LedgerStore for MemoryLedgerStore {
    fn load(&self) -> Result<Option<SessionLedger>> {
        Ok(self.slot()?.clone())
    }

    fn save(&self, ledger: &SessionLedger) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("storage quota exceeded");
        }
        *self.slot()? = Some(ledger.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("storage unavailable");
        }
        *self.slot()? = None;
        Ok(())
    }
}
