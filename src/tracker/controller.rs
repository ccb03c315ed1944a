use std::{collections::VecDeque, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use tokio::{
    sync::{mpsc, oneshot, Mutex},
    task::JoinHandle,
    time::{self, Instant, Interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    clock::{Clock, SystemClock},
    db::{LedgerStore, SqliteLedgerStore},
    models::Identity,
    settings::TrackerSettings,
    transport::{BeaconTransport, HttpBeacon, HttpSyncTransport, SyncTransport},
};

use super::{
    engine::TrackerCore,
    events::{
        AgentCommand, BindOutcome, SyncCompletion, SyncKind, SyncRequest, SyncTrigger,
        TrackerSnapshot,
    },
    state::Visibility,
};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Handle to the tracking agent loop.
///
/// The loop owns all tracking state. Every method here only posts a message,
/// so none of them can interleave with a ledger mutation in progress.
pub struct TrackingAgent {
    commands: mpsc::UnboundedSender<AgentCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
    cancel_token: CancellationToken,
}

impl TrackingAgent {
    /// Spawns the agent loop on the current tokio runtime. Nothing is
    /// tracked until [`TrackingAgent::start`] binds an identity.
    pub fn spawn(
        settings: TrackerSettings,
        store: Arc<dyn LedgerStore>,
        transport: Arc<dyn SyncTransport>,
        beacon: Arc<dyn BeaconTransport>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        settings.validate().context("invalid tracker settings")?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let cancel_token = CancellationToken::new();

        let timers = Timers::new(&settings);
        let agent = AgentLoop {
            core: TrackerCore::new(settings, store, clock),
            transport,
            beacon,
            completions: completion_tx,
            stop: StopPhase::Idle,
            deferred_starts: VecDeque::new(),
        };

        let handle = tokio::spawn(agent_loop(
            agent,
            timers,
            command_rx,
            completion_rx,
            cancel_token.clone(),
        ));

        Ok(Self {
            commands: command_tx,
            worker: Mutex::new(Some(handle)),
            cancel_token,
        })
    }

    /// Agent wired to the HTTP endpoint from `settings` for both channels.
    pub fn with_http(settings: TrackerSettings, store: Arc<dyn LedgerStore>) -> Result<Self> {
        let transport = HttpSyncTransport::new(&settings)?;
        let beacon = HttpBeacon::new(reqwest::Client::new(), settings.endpoint.clone());
        Self::spawn(
            settings,
            store,
            Arc::new(transport),
            Arc::new(beacon),
            Arc::new(SystemClock),
        )
    }

    /// Agent persisting its ledger in the SQLite file at `db_path`, under
    /// the slot named by `settings.storage_key`.
    pub fn with_sqlite(settings: TrackerSettings, db_path: PathBuf) -> Result<Self> {
        let store = SqliteLedgerStore::from_settings(db_path, &settings)?;
        Self::with_http(settings, Arc::new(store))
    }

    /// Identity became available (login or reload with a valid session).
    /// While a logout is still flushing, the bind waits for it to finish.
    pub async fn start(&self, identity: Identity) -> Result<BindOutcome> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(AgentCommand::Start { identity, reply })?;
        reply_rx.await.map_err(|_| not_running())
    }

    /// Identity went away (logout). Resolves after the final flush attempt.
    pub async fn stop(&self) -> Result<()> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(AgentCommand::Stop { reply })?;
        reply_rx.await.map_err(|_| not_running())
    }

    pub fn visibility_changed(&self, visible: bool) {
        let visibility = if visible {
            Visibility::Visible
        } else {
            Visibility::Hidden
        };
        self.post(AgentCommand::Visibility(visibility));
    }

    pub fn user_input(&self) {
        self.post(AgentCommand::UserInput);
    }

    /// Out-of-cadence sync, subject to the threshold like the periodic one.
    pub fn request_sync(&self) {
        self.post(AgentCommand::RequestSync);
    }

    /// Host teardown. Never blocks; the loop checkpoints, fires the beacon
    /// and exits.
    pub fn unload(&self) {
        self.post(AgentCommand::Unload);
    }

    pub async fn snapshot(&self) -> Result<TrackerSnapshot> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(AgentCommand::Snapshot { reply })?;
        reply_rx.await.map_err(|_| not_running())
    }

    /// Ends the loop without flushing and waits for it to finish.
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();
        if let Some(handle) = self.worker.lock().await.take() {
            if let Err(err) = handle.await {
                log::error!("Tracking agent loop failed to join: {err}");
            }
        }
    }

    fn send(&self, command: AgentCommand) -> Result<()> {
        self.commands.send(command).map_err(|_| not_running())
    }

    fn post(&self, command: AgentCommand) {
        if self.send(command).is_err() {
            log::debug!("Tracking agent gone; signal dropped");
        }
    }
}

impl Drop for TrackingAgent {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

fn not_running() -> anyhow::Error {
    anyhow!("tracking agent is not running")
}

enum StopPhase {
    Idle,
    /// Logout requested while a sync was pending; the final flush waits for it.
    AwaitingInFlight(oneshot::Sender<()>),
    FinalFlush(oneshot::Sender<()>),
}

enum Flow {
    Continue,
    Exit,
}

/// A checkpoint falls on every `ticks_per_checkpoint`-th tick of the running
/// clock; a window never holds more ticks than that.
struct Timers {
    ticker: Interval,
    syncs: Interval,
    ticks_per_checkpoint: u64,
    ticks_since_checkpoint: u64,
}

impl Timers {
    fn new(settings: &TrackerSettings) -> Self {
        Self {
            ticker: cadence(TICK_INTERVAL),
            syncs: cadence(settings.sync_interval()),
            ticks_per_checkpoint: settings.checkpoint_interval_secs,
            ticks_since_checkpoint: 0,
        }
    }

    /// Restarts all cadences from now.
    fn restart(&mut self) {
        self.ticker.reset();
        self.syncs.reset();
        self.ticks_since_checkpoint = 0;
    }

    fn checkpoint_due(&mut self) -> bool {
        self.ticks_since_checkpoint += 1;
        if self.ticks_since_checkpoint < self.ticks_per_checkpoint {
            return false;
        }
        self.ticks_since_checkpoint = 0;
        true
    }
}

fn cadence(period: Duration) -> Interval {
    let mut interval = time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

struct AgentLoop {
    core: TrackerCore,
    transport: Arc<dyn SyncTransport>,
    beacon: Arc<dyn BeaconTransport>,
    completions: mpsc::UnboundedSender<SyncCompletion>,
    stop: StopPhase,
    deferred_starts: VecDeque<(Identity, oneshot::Sender<BindOutcome>)>,
}

async fn agent_loop(
    mut agent: AgentLoop,
    mut timers: Timers,
    mut commands: mpsc::UnboundedReceiver<AgentCommand>,
    mut completions: mpsc::UnboundedReceiver<SyncCompletion>,
    cancel_token: CancellationToken,
) {
    log_info!("Tracking agent loop started");

    loop {
        let running = agent.core.is_running();
        tokio::select! {
            biased;

            _ = cancel_token.cancelled() => {
                break;
            }
            // Ahead of the sync cadence so a shared deadline syncs the
            // freshly checkpointed seconds.
            _ = timers.ticker.tick(), if running => {
                agent.core.tick();
                if timers.checkpoint_due() {
                    agent.core.checkpoint();
                }
            }
            _ = timers.syncs.tick(), if running => {
                let request = agent.core.begin_sync(SyncTrigger::Cadence);
                agent.dispatch(request);
            }
            Some(completion) = completions.recv() => {
                agent.on_completion(completion, &mut timers);
            }
            command = commands.recv() => {
                let Some(command) = command else {
                    break;
                };
                if let Flow::Exit = agent.handle(command, &mut timers) {
                    break;
                }
            }
        }
    }

    log_info!("Tracking agent loop shutting down");
}

impl AgentLoop {
    fn handle(&mut self, command: AgentCommand, timers: &mut Timers) -> Flow {
        match command {
            AgentCommand::Start { identity, reply } => {
                if matches!(self.stop, StopPhase::Idle) {
                    self.start(identity, reply, timers);
                } else {
                    log_info!("Bind of {identity} deferred until logout completes");
                    self.deferred_starts.push_back((identity, reply));
                }
            }
            AgentCommand::Stop { reply } => self.begin_stop(reply),
            AgentCommand::Visibility(visibility) => {
                let request = self.core.set_visibility(visibility);
                self.dispatch(request);
            }
            AgentCommand::UserInput => self.core.record_input(),
            AgentCommand::RequestSync => {
                let request = self.core.begin_sync(SyncTrigger::Manual);
                self.dispatch(request);
            }
            AgentCommand::Unload => {
                if let Some(payload) = self.core.unload() {
                    let seconds = payload.total_seconds;
                    if self.beacon.dispatch(payload) {
                        log_info!("Unload beacon dispatched with {seconds}s");
                    } else {
                        log_warn!("Unload beacon refused; {seconds}s stay in the ledger");
                    }
                }
                return Flow::Exit;
            }
            AgentCommand::Snapshot { reply } => {
                let _ = reply.send(self.core.snapshot());
            }
        }
        Flow::Continue
    }

    fn start(
        &mut self,
        identity: Identity,
        reply: oneshot::Sender<BindOutcome>,
        timers: &mut Timers,
    ) {
        // Re-announcing the bound identity keeps the running cadences.
        let rebind = !self.core.is_running() || self.core.identity() != Some(&identity);
        let outcome = self.core.bind(identity);
        if let BindOutcome::Handover(request) = &outcome {
            self.dispatch(Some(request.clone()));
        }
        if rebind {
            timers.restart();
        }
        let _ = reply.send(outcome);
    }

    fn begin_stop(&mut self, reply: oneshot::Sender<()>) {
        if !matches!(self.stop, StopPhase::Idle) {
            log_warn!("Logout already in progress");
            let _ = reply.send(());
            return;
        }

        self.core.stop_clock();
        if self.core.sync_in_flight() {
            log_info!("Logout waiting for pending sync before final flush");
            self.stop = StopPhase::AwaitingInFlight(reply);
        } else {
            self.finish_stop(reply);
        }
    }

    fn finish_stop(&mut self, reply: oneshot::Sender<()>) {
        match self.core.release_ledger() {
            Some(request) => {
                self.dispatch(Some(request));
                self.stop = StopPhase::FinalFlush(reply);
            }
            None => {
                self.stop = StopPhase::Idle;
                let _ = reply.send(());
            }
        }
    }

    fn on_completion(&mut self, completion: SyncCompletion, timers: &mut Timers) {
        let was_final = completion.kind == SyncKind::Final;
        self.core.complete_sync(completion);

        match std::mem::replace(&mut self.stop, StopPhase::Idle) {
            StopPhase::AwaitingInFlight(reply) if !self.core.sync_in_flight() => {
                self.finish_stop(reply);
            }
            StopPhase::FinalFlush(reply) if was_final => {
                let _ = reply.send(());
            }
            other => self.stop = other,
        }

        if matches!(self.stop, StopPhase::Idle) {
            while let Some((identity, reply)) = self.deferred_starts.pop_front() {
                self.start(identity, reply, timers);
            }
        }
    }

    /// Runs the transmission off the loop; the outcome comes back as a
    /// completion message.
    fn dispatch(&self, request: Option<SyncRequest>) {
        let Some(request) = request else {
            return;
        };
        let transport = Arc::clone(&self.transport);
        let completions = self.completions.clone();
        tokio::spawn(async move {
            let result = transport.send(&request.payload).await;
            if completions.send(request.complete(result)).is_err() {
                log::debug!("Sync finished after the agent loop exited");
            }
        });
    }
}
