//! Synchronous tracking state machine.
//!
//! Every mutation of the ledger happens inside one `&mut self` call with no
//! suspension point between reading and writing it. Network I/O is pushed
//! out as [`SyncRequest`] values; their outcomes come back through
//! [`TrackerCore::complete_sync`].

use std::sync::Arc;

use uuid::Uuid;

use crate::{
    clock::Clock,
    db::LedgerStore,
    models::{Identity, SessionLedger, TrackingInterval},
    settings::TrackerSettings,
    transport::SyncPayload,
};

use super::{
    events::{
        BindOutcome, CheckpointOutcome, SyncCompletion, SyncKind, SyncRequest, SyncTrigger,
        TrackerSnapshot,
    },
    state::{ActivityState, Visibility},
};

const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

#[derive(Debug, Clone, Copy)]
struct InFlight {
    ledger_id: Uuid,
    kind: SyncKind,
}

pub struct TrackerCore {
    settings: TrackerSettings,
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    activity: ActivityState,
    identity: Option<Identity>,
    ledger: Option<SessionLedger>,
    in_flight: Option<InFlight>,
}

impl TrackerCore {
    pub fn new(
        settings: TrackerSettings,
        store: Arc<dyn LedgerStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let activity = ActivityState::new(settings.idle_timeout_secs);
        Self {
            settings,
            store,
            clock,
            activity,
            identity: None,
            ledger: None,
            in_flight: None,
        }
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn ledger(&self) -> Option<&SessionLedger> {
        self.ledger.as_ref()
    }

    pub fn activity(&self) -> &ActivityState {
        &self.activity
    }

    pub fn is_running(&self) -> bool {
        self.activity.is_running()
    }

    pub fn sync_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        TrackerSnapshot {
            identity: self.identity.clone(),
            pending_seconds: self.activity.pending_seconds,
            is_active: self.activity.is_active(),
            ledger: self.ledger.clone(),
            sync_in_flight: self.sync_in_flight(),
        }
    }

    pub fn tick(&mut self) {
        self.activity.tick();
    }

    pub fn record_input(&mut self) {
        self.activity.record_input();
    }

    /// Binds the tracker to `identity` and starts the clock.
    pub fn bind(&mut self, identity: Identity) -> BindOutcome {
        if self.identity.as_ref() == Some(&identity)
            && self.ledger.is_some()
            && self.activity.is_running()
        {
            return BindOutcome::Resumed;
        }

        // Seconds counted for the outgoing identity belong to its ledger.
        if self.identity.is_some() {
            self.close_window();
        }

        let existing = match self.ledger.take() {
            Some(ledger) => Some(ledger),
            None => self.load_persisted(),
        };
        self.identity = Some(identity.clone());

        let outcome = match existing {
            Some(ledger) if ledger.belongs_to(&identity) => {
                log_info!(
                    "Resuming ledger {} for {} ({} intervals, {}s unsynced)",
                    ledger.ledger_id,
                    identity,
                    ledger.intervals.len(),
                    ledger.total_seconds()
                );
                self.ledger = Some(ledger);
                BindOutcome::Resumed
            }
            Some(previous) => {
                let handover = if previous.is_empty() {
                    None
                } else {
                    log_info!(
                        "Ledger {} belongs to {}; flushing {}s before switching to {}",
                        previous.ledger_id,
                        previous.owner,
                        previous.total_seconds(),
                        identity
                    );
                    Some(SyncRequest::for_ledger(&previous, SyncKind::Handover))
                };
                self.install_fresh(identity);
                handover.map_or(BindOutcome::Fresh, BindOutcome::Handover)
            }
            None => {
                self.install_fresh(identity);
                BindOutcome::Fresh
            }
        };

        self.activity.start();
        outcome
    }

    /// Logout: final checkpoint, stop the clock, then release the ledger.
    pub fn unbind(&mut self) -> Option<SyncRequest> {
        self.stop_clock();
        self.release_ledger()
    }

    /// Checkpoints whatever the clock holds and stops counting.
    pub fn stop_clock(&mut self) {
        self.close_window();
    }

    /// Drops the ledger from memory and returns the final flush for it, if
    /// it holds anything. The persisted copy stays until that flush succeeds.
    pub fn release_ledger(&mut self) -> Option<SyncRequest> {
        self.activity.stop();
        let identity = self.identity.take()?;
        let ledger = self.ledger.take()?;

        if ledger.is_empty() {
            if let Err(err) = self.store.clear() {
                log_warn!("Failed to clear empty ledger for {identity}: {err:#}");
            }
            log_info!("Released empty ledger for {identity}");
            return None;
        }

        log_info!(
            "Releasing ledger {} for {identity} with {}s unsynced",
            ledger.ledger_id,
            ledger.total_seconds()
        );
        let request = SyncRequest::for_ledger(&ledger, SyncKind::Final);
        self.in_flight = Some(InFlight {
            ledger_id: ledger.ledger_id,
            kind: SyncKind::Final,
        });
        Some(request)
    }

    /// Moves the in-memory counter into the ledger and persists it.
    pub fn checkpoint(&mut self) -> CheckpointOutcome {
        if !self.activity.is_running() {
            return CheckpointOutcome::NotRunning;
        }
        let Some(identity) = self.identity.clone() else {
            return CheckpointOutcome::NotRunning;
        };

        let pending = self.activity.pending_seconds;
        if pending == 0 {
            self.activity.reset_window();
            return CheckpointOutcome::Idle;
        }

        let now = self.clock.now();
        let interval = TrackingInterval::new(now, pending, self.activity.window_was_active());
        if pending > self.settings.checkpoint_interval_secs {
            log_info!("Checkpoint absorbs {pending}s carried over from unpersisted windows");
        }

        let ledger = self
            .ledger
            .get_or_insert_with(|| SessionLedger::new(identity, now));
        ledger.intervals.push(interval);

        match self.store.save(ledger) {
            Ok(()) => {
                self.activity.reset_window();
                CheckpointOutcome::Recorded { seconds: pending }
            }
            Err(err) => {
                ledger.intervals.pop();
                log_warn!("Checkpoint of {pending}s not persisted, keeping counter: {err:#}");
                CheckpointOutcome::PersistFailed
            }
        }
    }

    /// Visibility Monitor transition. Going hidden closes the current
    /// window with a checkpoint and may start an eager sync.
    pub fn set_visibility(&mut self, visibility: Visibility) -> Option<SyncRequest> {
        if self.activity.visibility == visibility {
            return None;
        }

        if visibility == Visibility::Visible {
            self.activity.set_visibility(visibility);
            return None;
        }

        if self.activity.is_running() {
            self.checkpoint();
        }
        self.activity.set_visibility(visibility);
        self.begin_sync(SyncTrigger::Hidden)
    }

    /// Threshold-gated sync of the live ledger. Returns `None` when there is
    /// nothing to do or another sync is already in flight.
    pub fn begin_sync(&mut self, trigger: SyncTrigger) -> Option<SyncRequest> {
        let ledger = self.ledger.as_ref()?;

        if let Some(in_flight) = self.in_flight {
            log::debug!(
                "Sync ({trigger:?}) coalesced; {:?} sync for ledger {} still pending",
                in_flight.kind,
                in_flight.ledger_id
            );
            return None;
        }

        let total = ledger.total_seconds();
        if total == 0 || total < self.settings.min_sync_seconds {
            log::debug!(
                "Sync ({trigger:?}) skipped: {total}s below threshold {}s",
                self.settings.min_sync_seconds
            );
            return None;
        }

        let request = SyncRequest::for_ledger(ledger, SyncKind::Scheduled);
        self.in_flight = Some(InFlight {
            ledger_id: request.ledger_id,
            kind: SyncKind::Scheduled,
        });
        log_info!(
            "Sync ({trigger:?}) started for ledger {}: {} intervals, {total}s",
            request.ledger_id,
            request.payload.interval_count()
        );
        Some(request)
    }

    pub fn complete_sync(&mut self, completion: SyncCompletion) {
        if let Some(in_flight) = self.in_flight {
            if in_flight.ledger_id == completion.ledger_id && in_flight.kind == completion.kind {
                self.in_flight = None;
            }
        }

        let SyncCompletion {
            ledger_id,
            kind,
            interval_count,
            result,
        } = completion;

        if let Err(err) = result {
            match kind {
                SyncKind::Handover => {
                    log_warn!("Handover flush of ledger {ledger_id} failed; discarded: {err:#}")
                }
                _ => log_warn!(
                    "{kind:?} sync of ledger {ledger_id} failed; {interval_count} intervals kept for retry: {err:#}"
                ),
            }
            return;
        }

        let now = self.clock.now();
        match kind {
            SyncKind::Handover => {
                log_info!("Handover flush of ledger {ledger_id} delivered");
            }
            SyncKind::Scheduled | SyncKind::Final => {
                if let Some(ledger) = self
                    .ledger
                    .as_mut()
                    .filter(|ledger| ledger.ledger_id == ledger_id)
                {
                    ledger.drain_synced(interval_count, now);
                    if let Err(err) = self.store.save(ledger) {
                        log_warn!("Synced ledger {ledger_id} not persisted: {err:#}");
                    }
                    log_info!(
                        "{kind:?} sync of ledger {ledger_id} delivered {interval_count} intervals; {}s remain",
                        ledger.total_seconds()
                    );
                } else if kind == SyncKind::Final {
                    self.clear_persisted(ledger_id);
                } else {
                    log_info!("Sync of ledger {ledger_id} delivered after it was replaced");
                }
            }
        }
    }

    /// Page teardown: forced checkpoint, then the payload for the
    /// fire-and-forget channel if anything is unsynced. Stops the clock.
    pub fn unload(&mut self) -> Option<SyncPayload> {
        self.close_window();

        let ledger = self.ledger.as_ref()?;
        if ledger.total_seconds() == 0 {
            return None;
        }
        Some(SyncPayload::from_ledger(ledger))
    }

    /// Final checkpoint before the clock stops. Seconds that cannot be
    /// persisted still go into the in-memory ledger so the flush that
    /// follows carries them.
    fn close_window(&mut self) {
        if self.checkpoint() == CheckpointOutcome::PersistFailed {
            let pending = self.activity.pending_seconds;
            let interval =
                TrackingInterval::new(self.clock.now(), pending, self.activity.window_was_active());
            if let Some(ledger) = self.ledger.as_mut() {
                ledger.intervals.push(interval);
                log_warn!(
                    "Keeping {pending}s for ledger {} in memory only",
                    ledger.ledger_id
                );
            }
        }
        self.activity.stop();
    }

    fn install_fresh(&mut self, identity: Identity) {
        let ledger = SessionLedger::new(identity, self.clock.now());
        if let Err(err) = self.store.save(&ledger) {
            log_warn!(
                "Fresh ledger {} for {} not persisted: {err:#}",
                ledger.ledger_id,
                ledger.owner
            );
        } else {
            log_info!("Created ledger {} for {}", ledger.ledger_id, ledger.owner);
        }
        self.ledger = Some(ledger);
    }

    fn load_persisted(&self) -> Option<SessionLedger> {
        match self.store.load() {
            Ok(ledger) => ledger,
            Err(err) => {
                log_error!("Persisted ledger unreadable; starting without it: {err:#}");
                None
            }
        }
    }

    fn clear_persisted(&self, ledger_id: Uuid) {
        match self.store.load() {
            Ok(Some(persisted)) if persisted.ledger_id == ledger_id => {
                if let Err(err) = self.store.clear() {
                    log_warn!("Final sync delivered but ledger {ledger_id} not cleared: {err:#}");
                } else {
                    log_info!("Final sync of ledger {ledger_id} delivered; slot cleared");
                }
            }
            Ok(_) => log_info!("Final sync of ledger {ledger_id} delivered; slot already reused"),
            Err(err) => log_warn!("Final sync delivered but slot unreadable: {err:#}"),
        }
    }
}
