//! Reconciliation engine.
//!
//! One engine instance keeps one local state (order book or trade history)
//! in sync with the exchange for one market pair:
//! - buffers stream updates while a baseline snapshot is in flight
//! - validates that snapshot + buffer form a continuous sequence
//! - merges and republishes on every accepted update
//! - resyncs from scratch whenever continuity cannot be guaranteed
//!
//! Design principles:
//! - a single task owns buffer and state; every input (stream event,
//!   snapshot result, reachability edge, control command) is serialized
//!   through one `select!` loop, so there are no locks and no races between
//!   "snapshot arrived" and "update arrived"
//! - no partial recovery: a gap, an overflow or a transport loss always
//!   discards local state and rebuilds from a fresh snapshot
//! - consumers only ever see states that passed continuity validation

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep, Sleep};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::feed::binance_rest::FetchError;
use crate::feed::binance_ws::{MarketStream, StreamEvent};
use crate::feed::messages::FeedMessage;

// =============================================================================
// FEED-KIND ABSTRACTION
// =============================================================================

/// A feed kind the engine can reconcile: a baseline state plus a stream of
/// sequence-ranged updates. Implemented once per feed (depth, trades).
pub trait Reconcile: Send + 'static {
    type State: Clone + Send + Sync + 'static;
    type Update: Send + 'static;

    /// Short name for logs ("depth", "trades").
    const KIND: &'static str;

    /// Pick this kind's update out of a decoded frame, if it carries one.
    fn accept(msg: FeedMessage) -> Option<Self::Update>;

    /// Sequence marker of a state: the last update id it reflects.
    fn marker(state: &Self::State) -> u64;

    /// Sequence range `(first, last)` covered by an update.
    fn range(update: &Self::Update) -> (u64, u64);

    /// Entirely behind the marker; already reflected in the state.
    fn is_stale(update: &Self::Update, marker: u64) -> bool;

    /// Bridges the baseline seam. The range may overlap the marker, since
    /// level amounts are absolute and re-applying is harmless.
    fn bridges(update: &Self::Update, marker: u64) -> bool;

    /// Immediately follows the marker with no gap.
    fn follows(update: &Self::Update, marker: u64) -> bool;

    /// Fold the update into the state.
    fn apply(state: &mut Self::State, update: Self::Update);
}

/// Baseline provider, already bound to a pair and page size. The engine
/// retries by calling `fetch` again; implementations never sleep or retry
/// on their own.
#[async_trait]
pub trait SnapshotSource: Send + Sync + 'static {
    type State;

    async fn fetch(&self) -> Result<Self::State, FetchError>;
}

// =============================================================================
// STATE MACHINE
// =============================================================================

/// Engine lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Not running. Entered on `stop()`.
    Idle,
    /// Stream opening; nothing buffered yet.
    Connecting,
    /// Stream delivering; updates buffered while the snapshot is fetched.
    Buffering,
    /// Baseline merged; every update is applied and republished as it lands.
    Synced,
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Buffering => write!(f, "BUFFERING"),
            Self::Synced => write!(f, "SYNCED"),
        }
    }
}

// =============================================================================
// METRICS
// =============================================================================

/// Engine counters for monitoring. All relaxed; read via `summary()`.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub resyncs: AtomicU64,
    pub snapshots_requested: AtomicU64,
    pub snapshot_failures: AtomicU64,
    pub snapshots_applied: AtomicU64,
    pub updates_applied: AtomicU64,
    pub updates_buffered: AtomicU64,
    pub stale_dropped: AtomicU64,
    pub decode_errors: AtomicU64,
    pub server_errors: AtomicU64,
    pub gaps_detected: AtomicU64,
    pub buffer_overflows: AtomicU64,
    pub transport_losses: AtomicU64,
}

impl EngineMetrics {
    #[inline]
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Summary string for logging.
    pub fn summary(&self) -> String {
        format!(
            "resyncs={} snapshots={}/{} applied={} buffered={} stale={} decode_errors={} gaps={} overflows={} transport_losses={}",
            self.resyncs.load(Ordering::Relaxed),
            self.snapshots_applied.load(Ordering::Relaxed),
            self.snapshots_requested.load(Ordering::Relaxed),
            self.updates_applied.load(Ordering::Relaxed),
            self.updates_buffered.load(Ordering::Relaxed),
            self.stale_dropped.load(Ordering::Relaxed),
            self.decode_errors.load(Ordering::Relaxed),
            self.gaps_detected.load(Ordering::Relaxed),
            self.buffer_overflows.load(Ordering::Relaxed),
            self.transport_losses.load(Ordering::Relaxed),
        )
    }
}

// =============================================================================
// RECONNECT BACKOFF
// =============================================================================

/// Backoff for stream reopen attempts, with jitter so a fleet of instances
/// does not reconnect in lockstep. Reset after every successful sync.
#[derive(Debug)]
pub(crate) struct RestartBackoff {
    base_ms: u64,
    max_ms: u64,
    multiplier: f64,
    jitter_factor: f64,
    attempt: u32,
    rng_state: u64,
}

impl RestartBackoff {
    pub(crate) fn new(config: &SyncConfig) -> Self {
        Self {
            base_ms: config.backoff_base_ms,
            max_ms: config.backoff_max_ms,
            multiplier: config.backoff_multiplier,
            jitter_factor: config.jitter_factor,
            attempt: 0,
            rng_state: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(12345),
        }
    }

    /// Fast PRNG for jitter (xorshift64)
    #[inline]
    fn next_random(&mut self) -> f64 {
        self.rng_state ^= self.rng_state << 13;
        self.rng_state ^= self.rng_state >> 7;
        self.rng_state ^= self.rng_state << 17;
        (self.rng_state as f64) / (u64::MAX as f64)
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let base = (self.base_ms as f64) * self.multiplier.powi(self.attempt as i32);
        let capped = base.min(self.max_ms as f64);

        let jitter_range = capped * self.jitter_factor;
        let jitter = (self.next_random() * 2.0 - 1.0) * jitter_range;
        let final_ms = (capped + jitter).max(self.base_ms as f64);

        self.attempt += 1;

        Duration::from_millis(final_ms as u64)
    }

    pub(crate) fn reset(&mut self) {
        self.attempt = 0;
    }
}

// =============================================================================
// HANDLE
// =============================================================================

enum Command {
    Start,
    Pause,
    Stop(oneshot::Sender<()>),
    Restart,
}

/// Caller-side handle to one engine instance. The engine task owns the
/// stream and fetcher for its whole lifetime; dropping every handle tears
/// the instance down.
pub struct EngineHandle<St> {
    label: String,
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<Option<St>>,
    connecting_rx: watch::Receiver<bool>,
    metrics: Arc<EngineMetrics>,
}

impl<St: Clone> EngineHandle<St> {
    /// Begin syncing, or resume after `pause()`.
    pub fn start(&self) {
        let _ = self.cmd_tx.send(Command::Start);
    }

    /// Suspend stream delivery without discarding state. Any gap formed
    /// while paused is caught by the continuity check on resume.
    pub fn pause(&self) {
        let _ = self.cmd_tx.send(Command::Pause);
    }

    /// Discard state and rebuild from a fresh snapshot.
    pub fn restart(&self) {
        let _ = self.cmd_tx.send(Command::Restart);
    }

    /// Tear down the stream and cancel any in-flight snapshot fetch.
    /// Idempotent. When this returns, nothing will be published again
    /// until `start()`.
    pub async fn stop(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Stop(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Latest merged state. `None` until the first validated merge.
    /// Emits only on successful merges.
    pub fn state(&self) -> watch::Receiver<Option<St>> {
        self.state_rx.clone()
    }

    /// True from start until a validated baseline has been merged, and
    /// again whenever the instance is resyncing or the network is gone.
    pub fn is_connecting(&self) -> watch::Receiver<bool> {
        self.connecting_rx.clone()
    }

    pub fn latest(&self) -> Option<St> {
        self.state_rx.borrow().clone()
    }

    pub fn metrics(&self) -> Arc<EngineMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

// =============================================================================
// ENGINE
// =============================================================================

type FetchFuture<St> = Pin<Box<dyn Future<Output = Result<St, FetchError>> + Send>>;

struct Core<K, S, F>
where
    K: Reconcile,
    S: MarketStream,
    F: SnapshotSource<State = K::State>,
{
    label: String,
    config: SyncConfig,
    stream: S,
    snapshots: Arc<F>,
    state_tx: watch::Sender<Option<K::State>>,
    connecting_tx: watch::Sender<bool>,
    metrics: Arc<EngineMetrics>,
    sync: SyncState,
    paused: bool,
    buffer: Vec<K::Update>,
    current: Option<K::State>,
    backoff: RestartBackoff,
}

/// Spawn one engine instance. Dependencies are injected per instance;
/// instances for different pairs or feed kinds share nothing.
pub fn spawn<K, S, F>(
    label: String,
    stream: S,
    snapshots: Arc<F>,
    reachability: watch::Receiver<bool>,
    config: SyncConfig,
) -> EngineHandle<K::State>
where
    K: Reconcile,
    S: MarketStream + 'static,
    F: SnapshotSource<State = K::State>,
{
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(None);
    let (connecting_tx, connecting_rx) = watch::channel(true);
    let metrics = Arc::new(EngineMetrics::default());

    let core = Core::<K, S, F> {
        label: label.clone(),
        backoff: RestartBackoff::new(&config),
        config,
        stream,
        snapshots,
        state_tx,
        connecting_tx,
        metrics: Arc::clone(&metrics),
        sync: SyncState::Idle,
        paused: false,
        buffer: Vec::new(),
        current: None,
    };

    tokio::spawn(run(core, cmd_rx, reachability));

    EngineHandle {
        label,
        cmd_tx,
        state_rx,
        connecting_rx,
        metrics,
    }
}

impl<K, S, F> Core<K, S, F>
where
    K: Reconcile,
    S: MarketStream,
    F: SnapshotSource<State = K::State>,
{
    fn transition(&mut self, to: SyncState, reason: &str) {
        let from = self.sync;
        self.sync = to;
        info!(
            instance = %self.label,
            kind = K::KIND,
            from = %from,
            to = %to,
            reason,
            "sync_transition"
        );
    }

    /// Entry point of every (re)connect: wipe buffer and merged state,
    /// raise the connecting indicator.
    fn begin_connecting(&mut self, reason: &str) {
        self.buffer.clear();
        self.current = None;
        self.transition(SyncState::Connecting, reason);
        self.set_connecting(true);
    }

    fn set_connecting(&mut self, connecting: bool) {
        self.connecting_tx.send_if_modified(|current| {
            if *current == connecting {
                return false;
            }
            *current = connecting;
            true
        });
    }

    fn publish(&mut self) {
        self.state_tx.send_replace(self.current.clone());
    }

    fn begin_fetch(&self) -> FetchFuture<K::State> {
        EngineMetrics::bump(&self.metrics.snapshots_requested);
        debug!(instance = %self.label, kind = K::KIND, "snapshot_fetch_started");
        let snapshots = Arc::clone(&self.snapshots);
        Box::pin(async move { snapshots.fetch().await })
    }
}

/// Result of folding buffered updates onto a baseline snapshot.
#[derive(Debug)]
pub(crate) struct BridgeGap {
    pub marker: u64,
    pub first: u64,
    pub last: u64,
}

/// Fold buffered updates onto a fresh baseline, in arrival order.
///
/// Stale updates are dropped; the first retained one must bridge the
/// baseline marker and every later one must follow without a gap. On any
/// violation the whole attempt is rejected and the caller refetches.
pub(crate) fn reconcile_baseline<K: Reconcile>(
    baseline: K::State,
    buffered: Vec<K::Update>,
) -> Result<(K::State, u64), BridgeGap> {
    let mut state = baseline;
    let mut bridged = false;
    let mut applied = 0u64;

    for update in buffered {
        let marker = K::marker(&state);
        if K::is_stale(&update, marker) {
            continue;
        }
        let continuous = if bridged {
            K::follows(&update, marker)
        } else {
            K::bridges(&update, marker)
        };
        if !continuous {
            let (first, last) = K::range(&update);
            return Err(BridgeGap {
                marker,
                first,
                last,
            });
        }
        K::apply(&mut state, update);
        bridged = true;
        applied += 1;
    }

    Ok((state, applied))
}

enum Input<St> {
    Cmd(Option<Command>),
    Reach(bool),
    Stream(Option<StreamEvent>),
    Snapshot(Result<St, FetchError>),
    Reopen,
    Retry,
}

/// Full teardown and reconnect. `delay` paces transport-loss storms; gap
/// and command driven resyncs reconnect immediately.
async fn resync<K, S, F>(
    core: &mut Core<K, S, F>,
    events: &mut Option<mpsc::UnboundedReceiver<StreamEvent>>,
    fetch: &mut Option<FetchFuture<K::State>>,
    reopen_at: &mut Option<Pin<Box<Sleep>>>,
    retry_at: &mut Option<Pin<Box<Sleep>>>,
    reason: &str,
    delay: Option<Duration>,
) where
    K: Reconcile,
    S: MarketStream,
    F: SnapshotSource<State = K::State>,
{
    core.stream.close().await;
    *fetch = None;
    *retry_at = None;
    EngineMetrics::bump(&core.metrics.resyncs);
    core.begin_connecting(reason);

    match delay.filter(|d| !d.is_zero()) {
        Some(d) => {
            *events = None;
            *reopen_at = Some(Box::pin(sleep(d)));
        }
        None => {
            *reopen_at = None;
            *events = Some(core.stream.open().await);
        }
    }
}

async fn run<K, S, F>(
    mut core: Core<K, S, F>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    mut reach_rx: watch::Receiver<bool>,
) where
    K: Reconcile,
    S: MarketStream,
    F: SnapshotSource<State = K::State>,
{
    let mut events: Option<mpsc::UnboundedReceiver<StreamEvent>> = None;
    let mut fetch: Option<FetchFuture<K::State>> = None;
    let mut reopen_at: Option<Pin<Box<Sleep>>> = None;
    let mut retry_at: Option<Pin<Box<Sleep>>> = None;
    let mut reach_active = true;

    loop {
        let input: Input<K::State> = tokio::select! {
            cmd = cmd_rx.recv() => Input::Cmd(cmd),

            res = reach_rx.changed(), if reach_active => match res {
                Ok(()) => Input::Reach(*reach_rx.borrow_and_update()),
                Err(_) => {
                    // Monitor gone; transport failures still drive resyncs.
                    reach_active = false;
                    continue;
                }
            },

            ev = async { events.as_mut().unwrap().recv().await }, if events.is_some() =>
                Input::Stream(ev),

            snap = async { fetch.as_mut().unwrap().as_mut().await }, if fetch.is_some() =>
                Input::Snapshot(snap),

            _ = async { reopen_at.as_mut().unwrap().as_mut().await }, if reopen_at.is_some() =>
                Input::Reopen,

            _ = async { retry_at.as_mut().unwrap().as_mut().await }, if retry_at.is_some() =>
                Input::Retry,
        };

        match input {
            Input::Cmd(None) => {
                // Every handle dropped.
                core.stream.close().await;
                return;
            }

            Input::Cmd(Some(Command::Start)) => {
                if core.paused {
                    core.paused = false;
                    core.stream.resume().await;
                    info!(instance = %core.label, kind = K::KIND, "engine_resumed");
                    if core.sync == SyncState::Connecting
                        && events.is_none()
                        && reopen_at.is_none()
                    {
                        events = Some(core.stream.open().await);
                    }
                } else if core.sync == SyncState::Idle {
                    core.begin_connecting("started");
                    events = Some(core.stream.open().await);
                }
            }

            Input::Cmd(Some(Command::Pause)) => {
                if !core.paused && core.sync != SyncState::Idle {
                    core.paused = true;
                    core.stream.pause().await;
                    info!(instance = %core.label, kind = K::KIND, "engine_paused");
                }
            }

            Input::Cmd(Some(Command::Restart)) => {
                core.paused = false;
                if core.sync == SyncState::Idle {
                    core.begin_connecting("restart requested");
                    events = Some(core.stream.open().await);
                } else {
                    resync(
                        &mut core,
                        &mut events,
                        &mut fetch,
                        &mut reopen_at,
                        &mut retry_at,
                        "restart requested",
                        None,
                    )
                    .await;
                }
            }

            Input::Cmd(Some(Command::Stop(ack))) => {
                core.stream.close().await;
                events = None;
                fetch = None;
                reopen_at = None;
                retry_at = None;
                core.buffer.clear();
                core.current = None;
                core.paused = false;
                if core.sync != SyncState::Idle {
                    core.transition(SyncState::Idle, "stopped");
                }
                let _ = ack.send(());
            }

            Input::Reach(up) => {
                if core.sync == SyncState::Idle {
                    // Not running; nothing to resync.
                } else if up {
                    resync(
                        &mut core,
                        &mut events,
                        &mut fetch,
                        &mut reopen_at,
                        &mut retry_at,
                        "reachability regained",
                        None,
                    )
                    .await;
                } else {
                    // Keep the last published state; only flag the outage.
                    info!(instance = %core.label, kind = K::KIND, "network_lost");
                    core.set_connecting(true);
                }
            }

            Input::Stream(None) => {
                // Reader ended without a close event (adapter dropped).
                events = None;
                if core.sync != SyncState::Idle {
                    EngineMetrics::bump(&core.metrics.transport_losses);
                    let delay = core.backoff.next_delay();
                    resync(
                        &mut core,
                        &mut events,
                        &mut fetch,
                        &mut reopen_at,
                        &mut retry_at,
                        "stream channel closed",
                        Some(delay),
                    )
                    .await;
                }
            }

            Input::Stream(Some(StreamEvent::Opened)) => {
                debug!(instance = %core.label, kind = K::KIND, "stream_opened");
            }

            Input::Stream(Some(StreamEvent::Decode(e))) => {
                // One bad frame; the stream goes on.
                EngineMetrics::bump(&core.metrics.decode_errors);
                warn!(instance = %core.label, kind = K::KIND, error = %e, "frame_decode_failed");
            }

            Input::Stream(Some(StreamEvent::Closed { reason })) => {
                events = None;
                if core.sync != SyncState::Idle {
                    EngineMetrics::bump(&core.metrics.transport_losses);
                    let delay = core.backoff.next_delay();
                    warn!(
                        instance = %core.label,
                        kind = K::KIND,
                        reason = %reason,
                        retry_in_ms = delay.as_millis() as u64,
                        "transport_lost"
                    );
                    resync(
                        &mut core,
                        &mut events,
                        &mut fetch,
                        &mut reopen_at,
                        &mut retry_at,
                        "transport closed",
                        Some(delay),
                    )
                    .await;
                }
            }

            Input::Stream(Some(StreamEvent::Message(msg))) => {
                if let FeedMessage::ServerError(err) = &msg {
                    EngineMetrics::bump(&core.metrics.server_errors);
                    warn!(
                        instance = %core.label,
                        kind = K::KIND,
                        code = err.code,
                        message = %err.message,
                        "stream_server_error"
                    );
                    continue;
                }

                let Some(update) = K::accept(msg) else {
                    debug!(instance = %core.label, kind = K::KIND, "frame_for_other_feed");
                    continue;
                };

                match core.sync {
                    SyncState::Idle => {}

                    SyncState::Connecting => {
                        core.buffer.push(update);
                        EngineMetrics::bump(&core.metrics.updates_buffered);
                        core.transition(SyncState::Buffering, "first event buffered");
                        if fetch.is_none() && retry_at.is_none() {
                            fetch = Some(core.begin_fetch());
                        }
                    }

                    SyncState::Buffering => {
                        core.buffer.push(update);
                        EngineMetrics::bump(&core.metrics.updates_buffered);
                        if core.buffer.len() > core.config.max_buffer_len {
                            EngineMetrics::bump(&core.metrics.buffer_overflows);
                            warn!(
                                instance = %core.label,
                                kind = K::KIND,
                                buffered = core.buffer.len(),
                                "buffer_overflow"
                            );
                            resync(
                                &mut core,
                                &mut events,
                                &mut fetch,
                                &mut reopen_at,
                                &mut retry_at,
                                "buffer overflow",
                                None,
                            )
                            .await;
                        }
                    }

                    SyncState::Synced => {
                        let Some(marker) = core.current.as_ref().map(K::marker) else {
                            continue;
                        };
                        if K::is_stale(&update, marker) {
                            EngineMetrics::bump(&core.metrics.stale_dropped);
                        } else if K::follows(&update, marker) {
                            if let Some(state) = core.current.as_mut() {
                                K::apply(state, update);
                            }
                            EngineMetrics::bump(&core.metrics.updates_applied);
                            core.publish();
                        } else {
                            let (first, last) = K::range(&update);
                            EngineMetrics::bump(&core.metrics.gaps_detected);
                            warn!(
                                instance = %core.label,
                                kind = K::KIND,
                                marker,
                                first,
                                last,
                                "sequence_gap"
                            );
                            resync(
                                &mut core,
                                &mut events,
                                &mut fetch,
                                &mut reopen_at,
                                &mut retry_at,
                                "sequence gap",
                                None,
                            )
                            .await;
                        }
                    }
                }
            }

            Input::Snapshot(result) => {
                fetch = None;
                match result {
                    Err(e) => {
                        EngineMetrics::bump(&core.metrics.snapshot_failures);
                        warn!(
                            instance = %core.label,
                            kind = K::KIND,
                            error = %e,
                            "snapshot_fetch_failed"
                        );
                        if core.sync == SyncState::Buffering {
                            let delay = core.config.snapshot_retry_delay();
                            if delay.is_zero() {
                                fetch = Some(core.begin_fetch());
                            } else {
                                retry_at = Some(Box::pin(sleep(delay)));
                            }
                        }
                    }
                    Ok(baseline) => {
                        if core.sync != SyncState::Buffering {
                            debug!(
                                instance = %core.label,
                                kind = K::KIND,
                                "snapshot_discarded"
                            );
                            continue;
                        }

                        let buffered = std::mem::take(&mut core.buffer);
                        let buffered_len = buffered.len();
                        match reconcile_baseline::<K>(baseline, buffered) {
                            Ok((state, applied)) => {
                                EngineMetrics::bump(&core.metrics.snapshots_applied);
                                core.metrics
                                    .updates_applied
                                    .fetch_add(applied, Ordering::Relaxed);
                                info!(
                                    instance = %core.label,
                                    kind = K::KIND,
                                    buffered = buffered_len,
                                    applied,
                                    marker = K::marker(&state),
                                    "baseline_merged"
                                );
                                core.current = Some(state);
                                core.publish();
                                core.transition(SyncState::Synced, "baseline merged");
                                core.set_connecting(false);
                                core.backoff.reset();
                            }
                            Err(gap) => {
                                EngineMetrics::bump(&core.metrics.gaps_detected);
                                warn!(
                                    instance = %core.label,
                                    kind = K::KIND,
                                    marker = gap.marker,
                                    first = gap.first,
                                    last = gap.last,
                                    "baseline_bridge_failed"
                                );
                                resync(
                                    &mut core,
                                    &mut events,
                                    &mut fetch,
                                    &mut reopen_at,
                                    &mut retry_at,
                                    "baseline bridge failed",
                                    None,
                                )
                                .await;
                            }
                        }
                    }
                }
            }

            Input::Reopen => {
                reopen_at = None;
                if core.sync == SyncState::Connecting && !core.paused {
                    events = Some(core.stream.open().await);
                }
            }

            Input::Retry => {
                retry_at = None;
                if core.sync == SyncState::Buffering {
                    fetch = Some(core.begin_fetch());
                }
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_resets() {
        let config = SyncConfig::default();
        let mut backoff = RestartBackoff::new(&config);

        // First delay around 100ms (with jitter)
        let d1 = backoff.next_delay();
        assert!(d1.as_millis() >= 70 && d1.as_millis() <= 130);

        // Second around 200ms
        let d2 = backoff.next_delay();
        assert!(d2.as_millis() >= 140 && d2.as_millis() <= 260);

        backoff.reset();
        let d3 = backoff.next_delay();
        assert!(d3.as_millis() >= 70 && d3.as_millis() <= 130);
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = SyncConfig::default();
        let mut backoff = RestartBackoff::new(&config);

        for _ in 0..20 {
            let d = backoff.next_delay();
            assert!(d.as_millis() <= 39_000); // 30000 * 1.3
        }
    }

    /// Minimal feed kind over a counter, for exercising the baseline fold
    /// without any market semantics.
    struct CounterKind;

    impl Reconcile for CounterKind {
        type State = u64;
        type Update = (u64, u64);

        const KIND: &'static str = "counter";

        fn accept(_msg: FeedMessage) -> Option<Self::Update> {
            None
        }

        fn marker(state: &u64) -> u64 {
            *state
        }

        fn range(update: &(u64, u64)) -> (u64, u64) {
            *update
        }

        fn is_stale(update: &(u64, u64), marker: u64) -> bool {
            update.1 <= marker
        }

        fn bridges(update: &(u64, u64), marker: u64) -> bool {
            update.0 <= marker + 1 && update.1 >= marker + 1
        }

        fn follows(update: &(u64, u64), marker: u64) -> bool {
            update.0 == marker + 1
        }

        fn apply(state: &mut u64, update: (u64, u64)) {
            *state = update.1;
        }
    }

    #[test]
    fn test_reconcile_drops_stale_and_bridges() {
        // Marker 1000; 995-999 stale, 998-1003 bridges, 1004-1005 follows.
        let buffered = vec![(995, 999), (998, 1003), (1004, 1005)];
        let (state, applied) = reconcile_baseline::<CounterKind>(1000, buffered).unwrap();
        assert_eq!(state, 1005);
        assert_eq!(applied, 2);
    }

    #[test]
    fn test_reconcile_empty_buffer_keeps_baseline() {
        let (state, applied) = reconcile_baseline::<CounterKind>(1000, Vec::new()).unwrap();
        assert_eq!(state, 1000);
        assert_eq!(applied, 0);
    }

    #[test]
    fn test_reconcile_all_stale_keeps_baseline() {
        let buffered = vec![(995, 996), (997, 999)];
        let (state, applied) = reconcile_baseline::<CounterKind>(1000, buffered).unwrap();
        assert_eq!(state, 1000);
        assert_eq!(applied, 0);
    }

    #[test]
    fn test_reconcile_rejects_bridge_gap() {
        // First retained update starts beyond marker+1.
        let gap = reconcile_baseline::<CounterKind>(1000, vec![(1005, 1010)]).unwrap_err();
        assert_eq!(gap.marker, 1000);
        assert_eq!(gap.first, 1005);
        assert_eq!(gap.last, 1010);
    }

    #[test]
    fn test_reconcile_rejects_gap_after_bridge() {
        let buffered = vec![(1001, 1002), (1005, 1006)];
        let gap = reconcile_baseline::<CounterKind>(1000, buffered).unwrap_err();
        assert_eq!(gap.marker, 1002);
        assert_eq!(gap.first, 1005);
    }
}
