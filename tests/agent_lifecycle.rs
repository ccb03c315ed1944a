use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use studytime::{
    BeaconTransport, BindOutcome, Identity, LedgerStore, MemoryLedgerStore, SessionLedger,
    SyncPayload, SyncTransport, SystemClock, TrackerSettings, TrackingAgent, TrackingInterval,
};
use tokio::{sync::Notify, time::sleep};

#[derive(Default)]
struct RecordingTransport {
    sent: Mutex<Vec<SyncPayload>>,
    fail: AtomicBool,
    calls: AtomicUsize,
    /// When set, the first call waits for this before answering.
    first_call_gate: Option<Arc<Notify>>,
}

impl RecordingTransport {
    fn failing() -> Self {
        Self {
            fail: AtomicBool::new(true),
            ..Self::default()
        }
    }

    fn gated(gate: Arc<Notify>) -> Self {
        Self {
            first_call_gate: Some(gate),
            ..Self::default()
        }
    }

    fn payloads(&self) -> Vec<SyncPayload> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl SyncTransport for RecordingTransport {
    async fn send(&self, payload: &SyncPayload) -> Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.sent.lock().unwrap().push(payload.clone());
        if call == 0 {
            if let Some(gate) = &self.first_call_gate {
                gate.notified().await;
            }
        }
        if self.fail.load(Ordering::SeqCst) {
            bail!("connection refused");
        }
        Ok(())
    }
}

#[derive(Default)]
struct RecordingBeacon {
    dispatched: Mutex<Vec<SyncPayload>>,
}

impl BeaconTransport for RecordingBeacon {
    fn dispatch(&self, payload: SyncPayload) -> bool {
        self.dispatched.lock().unwrap().push(payload);
        true
    }
}

struct Fixture {
    agent: Arc<TrackingAgent>,
    store: Arc<MemoryLedgerStore>,
    transport: Arc<RecordingTransport>,
    beacon: Arc<RecordingBeacon>,
}

fn settings() -> TrackerSettings {
    TrackerSettings {
        endpoint: "http://sync.test/api/study-time".into(),
        checkpoint_interval_secs: 60,
        sync_interval_secs: 900,
        min_sync_seconds: 60,
        ..TrackerSettings::default()
    }
}

fn fixture_with(
    settings: TrackerSettings,
    store: MemoryLedgerStore,
    transport: RecordingTransport,
) -> Fixture {
    let store = Arc::new(store);
    let transport = Arc::new(transport);
    let beacon = Arc::new(RecordingBeacon::default());
    let agent = TrackingAgent::spawn(
        settings,
        store.clone(),
        transport.clone(),
        beacon.clone(),
        Arc::new(SystemClock),
    )
    .unwrap();
    Fixture {
        agent: Arc::new(agent),
        store,
        transport,
        beacon,
    }
}

fn fixture() -> Fixture {
    fixture_with(settings(), MemoryLedgerStore::new(), RecordingTransport::default())
}

fn alice() -> Identity {
    Identity::new("alice", Some("sess-a".into()))
}

fn bob() -> Identity {
    Identity::new("bob", Some("sess-b".into()))
}

/// Half a tick past `secs`: the loop has handled tick `secs` and not the next.
fn after(secs: u64) -> Duration {
    Duration::from_millis(secs * 1000 + 500)
}

/// Lets spawned sync tasks report back to the loop.
async fn settle() {
    sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn periodic_sync_delivers_checkpointed_seconds_once() {
    let fx = fixture_with(
        TrackerSettings {
            sync_interval_secs: 120,
            ..settings()
        },
        MemoryLedgerStore::new(),
        RecordingTransport::default(),
    );
    assert_eq!(fx.agent.start(alice()).await.unwrap(), BindOutcome::Fresh);

    sleep(after(120)).await;
    settle().await;

    let sent = fx.transport.payloads();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].user_id, "alice");
    assert_eq!(sent[0].total_seconds, 120);
    assert_eq!(sent[0].interval_count(), 2);

    let snapshot = fx.agent.snapshot().await.unwrap();
    let ledger = snapshot.ledger.unwrap();
    assert!(ledger.last_sync_at.is_some());
    assert!(ledger.is_empty());
    assert_eq!(snapshot.pending_seconds, 0);
}

#[tokio::test(start_paused = true)]
async fn below_threshold_never_reaches_the_network() {
    let fx = fixture_with(
        TrackerSettings {
            sync_interval_secs: 60,
            min_sync_seconds: 600,
            ..settings()
        },
        MemoryLedgerStore::new(),
        RecordingTransport::default(),
    );
    fx.agent.start(alice()).await.unwrap();

    sleep(after(300)).await;
    fx.agent.request_sync();
    settle().await;

    assert!(fx.transport.payloads().is_empty());
    let ledger = fx.agent.snapshot().await.unwrap().ledger.unwrap();
    assert_eq!(ledger.total_seconds(), 300);
}

#[tokio::test(start_paused = true)]
async fn backgrounding_flushes_eagerly() {
    let fx = fixture();
    fx.agent.start(alice()).await.unwrap();

    sleep(after(70)).await;
    fx.agent.visibility_changed(false);
    settle().await;

    let sent = fx.transport.payloads();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].total_seconds, 70);

    let snapshot = fx.agent.snapshot().await.unwrap();
    assert!(!snapshot.is_active);
    assert!(snapshot.ledger.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn hidden_time_is_not_counted() {
    let fx = fixture();
    fx.agent.start(alice()).await.unwrap();

    sleep(after(10)).await;
    fx.agent.visibility_changed(false);
    sleep(Duration::from_secs(30)).await;
    fx.agent.visibility_changed(true);
    sleep(Duration::from_secs(10)).await;

    let snapshot = fx.agent.snapshot().await.unwrap();
    assert_eq!(snapshot.ledger.unwrap().total_seconds(), 10);
    assert_eq!(snapshot.pending_seconds, 10);
    assert!(fx.transport.payloads().is_empty());
}

#[tokio::test(start_paused = true)]
async fn logout_flushes_regardless_of_threshold() {
    let fx = fixture();
    fx.agent.start(alice()).await.unwrap();

    sleep(after(10)).await;
    fx.agent.stop().await.unwrap();

    let sent = fx.transport.payloads();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].total_seconds, 10);
    assert!(fx.store.load().unwrap().is_none());

    let snapshot = fx.agent.snapshot().await.unwrap();
    assert!(snapshot.identity.is_none());
    assert!(snapshot.ledger.is_none());
}

#[tokio::test(start_paused = true)]
async fn failed_logout_flush_is_resumed_by_same_identity() {
    let fx = fixture_with(settings(), MemoryLedgerStore::new(), RecordingTransport::failing());
    fx.agent.start(alice()).await.unwrap();

    sleep(after(30)).await;
    fx.agent.stop().await.unwrap();

    let persisted = fx.store.load().unwrap().unwrap();
    assert_eq!(persisted.total_seconds(), 30);

    assert_eq!(fx.agent.start(alice()).await.unwrap(), BindOutcome::Resumed);
    let ledger = fx.agent.snapshot().await.unwrap().ledger.unwrap();
    assert_eq!(ledger.ledger_id, persisted.ledger_id);
    assert_eq!(ledger.started_at, persisted.started_at);
    assert_eq!(ledger.intervals, persisted.intervals);
}

#[tokio::test(start_paused = true)]
async fn new_identity_hands_over_previous_ledger() {
    let now = Utc::now();
    let mut previous = SessionLedger::new(alice(), now);
    previous.intervals.push(TrackingInterval::new(now, 120, true));
    let fx = fixture_with(
        settings(),
        MemoryLedgerStore::with_ledger(previous),
        RecordingTransport::failing(),
    );

    let outcome = fx.agent.start(bob()).await.unwrap();
    assert!(matches!(outcome, BindOutcome::Handover(_)));
    settle().await;

    let sent = fx.transport.payloads();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].user_id, "alice");
    assert_eq!(sent[0].total_seconds, 120);

    let ledger = fx.agent.snapshot().await.unwrap().ledger.unwrap();
    assert_eq!(ledger.owner, bob());
    assert!(ledger.is_empty());
}

#[tokio::test(start_paused = true)]
async fn logout_waits_for_in_flight_sync() {
    let gate = Arc::new(Notify::new());
    let fx = fixture_with(
        TrackerSettings {
            min_sync_seconds: 30,
            ..settings()
        },
        MemoryLedgerStore::new(),
        RecordingTransport::gated(gate.clone()),
    );
    fx.agent.start(alice()).await.unwrap();

    sleep(after(61)).await;
    fx.agent.request_sync();
    settle().await;
    assert!(fx.agent.snapshot().await.unwrap().sync_in_flight);

    // Triggers while the request is pending are coalesced.
    fx.agent.request_sync();
    fx.agent.visibility_changed(false);
    fx.agent.visibility_changed(true);
    settle().await;
    assert_eq!(fx.transport.payloads().len(), 1);

    sleep(Duration::from_secs(20)).await;
    let agent = fx.agent.clone();
    let stop = tokio::spawn(async move { agent.stop().await });
    sleep(Duration::from_secs(1)).await;
    assert!(!stop.is_finished());

    gate.notify_one();
    stop.await.unwrap().unwrap();

    let sent = fx.transport.payloads();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].total_seconds, 60);
    // Only what was appended after the first snapshot goes out again.
    assert_eq!(sent[1].intervals.len(), 2);
    assert_eq!(sent[1].total_seconds, 21);
    assert!(fx.store.load().unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn login_during_pending_logout_waits_for_it() {
    let gate = Arc::new(Notify::new());
    let fx = fixture_with(
        TrackerSettings {
            min_sync_seconds: 30,
            ..settings()
        },
        MemoryLedgerStore::new(),
        RecordingTransport::gated(gate.clone()),
    );
    fx.agent.start(alice()).await.unwrap();

    sleep(after(61)).await;
    fx.agent.request_sync();
    settle().await;

    let agent = fx.agent.clone();
    let stop = tokio::spawn(async move { agent.stop().await });
    settle().await;
    let agent = fx.agent.clone();
    let login = tokio::spawn(async move { agent.start(bob()).await });
    sleep(Duration::from_secs(1)).await;
    assert!(!stop.is_finished());
    assert!(!login.is_finished());

    gate.notify_one();
    stop.await.unwrap().unwrap();
    assert_eq!(login.await.unwrap().unwrap(), BindOutcome::Fresh);

    let sent = fx.transport.payloads();
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|payload| payload.user_id == "alice"));

    sleep(after(10)).await;
    let snapshot = fx.agent.snapshot().await.unwrap();
    assert_eq!(snapshot.identity, Some(bob()));
    assert_eq!(snapshot.pending_seconds, 10);
    assert_eq!(snapshot.ledger.unwrap().owner, bob());
    assert_eq!(fx.store.load().unwrap().unwrap().owner, bob());
}

#[tokio::test(start_paused = true)]
async fn reannounced_identity_keeps_checkpoint_cadence() {
    let fx = fixture();
    fx.agent.start(alice()).await.unwrap();

    for _ in 0..4 {
        sleep(Duration::from_secs(50)).await;
        assert_eq!(fx.agent.start(alice()).await.unwrap(), BindOutcome::Resumed);
    }
    sleep(Duration::from_millis(500)).await;

    let snapshot = fx.agent.snapshot().await.unwrap();
    assert_eq!(snapshot.ledger.unwrap().total_seconds(), 180);
    assert_eq!(snapshot.pending_seconds, 20);
}

#[tokio::test(start_paused = true)]
async fn checkpoint_windows_stay_within_period() {
    let fx = fixture_with(
        TrackerSettings {
            min_sync_seconds: 100_000,
            ..settings()
        },
        MemoryLedgerStore::new(),
        RecordingTransport::default(),
    );
    fx.agent.start(alice()).await.unwrap();

    // A background blip mid-window splits it without shifting the cadence.
    sleep(after(90)).await;
    fx.agent.visibility_changed(false);
    fx.agent.visibility_changed(true);
    sleep(Duration::from_secs(510)).await;

    let ledger = fx.agent.snapshot().await.unwrap().ledger.unwrap();
    let durations: Vec<u64> = ledger
        .intervals
        .iter()
        .map(|interval| interval.duration_seconds)
        .collect();
    assert_eq!(durations[..3], [60, 30, 30]);
    assert!(durations[3..].iter().all(|&seconds| seconds == 60));
    assert_eq!(ledger.total_seconds(), 600);
    assert!(fx.transport.payloads().is_empty());
}

#[tokio::test(start_paused = true)]
async fn unload_dispatches_beacon_and_keeps_ledger() {
    let fx = fixture();
    fx.agent.start(alice()).await.unwrap();

    sleep(after(15)).await;
    fx.agent.unload();
    fx.agent.shutdown().await;

    let dispatched = fx.beacon.dispatched.lock().unwrap().clone();
    assert_eq!(dispatched.len(), 1);
    assert_eq!(dispatched[0].total_seconds, 15);
    assert!(fx.transport.payloads().is_empty());

    let persisted = fx.store.load().unwrap().unwrap();
    assert_eq!(persisted.total_seconds(), dispatched[0].total_seconds);

    assert!(fx.agent.snapshot().await.is_err());
}

#[tokio::test(start_paused = true)]
async fn nothing_is_counted_before_start() {
    let fx = fixture();
    sleep(Duration::from_secs(90)).await;

    let snapshot = fx.agent.snapshot().await.unwrap();
    assert!(snapshot.identity.is_none());
    assert_eq!(snapshot.pending_seconds, 0);
    assert!(fx.store.load().unwrap().is_none());
}

#[tokio::test]
async fn spawn_rejects_invalid_settings() {
    let result = TrackingAgent::spawn(
        TrackerSettings {
            sync_interval_secs: 0,
            ..settings()
        },
        Arc::new(MemoryLedgerStore::new()),
        Arc::new(RecordingTransport::default()),
        Arc::new(RecordingBeacon::default()),
        Arc::new(SystemClock),
    );
    assert!(result.is_err());
}
