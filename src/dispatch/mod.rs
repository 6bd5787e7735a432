//! Real-time dispatch core
//!
//! The dispatcher walks the hour's spawn events in order and, for each one
//! that is due, hands the point to the cheapest idle worker under an
//! admission ceiling. Around that core sit the supporting behaviors: the
//! mystery backlog is drained opportunistically while waiting for future
//! events, credential backpressure pauses the loop when the verification
//! queue grows past its ceiling, stale events are skipped, already-covered
//! events are counted as redundant, and a cold start runs the bootstrap
//! procedure before steady-state scanning begins.
//!
//! # State machine
//!
//! ```text
//! ColdStart ──bootstrap──▶ Steady ──stop signal──▶ Draining ──▶ Stopped
//! ```
//!
//! # Fault contract
//!
//! A fault inside one iteration is logged and the loop continues; more than
//! [`MAX_CONSECUTIVE_FAULTS`] in a row aborts the run. Cancellation is never
//! treated as a fault: it propagates immediately through every layer.

pub mod admission;
mod bootstrap;
pub mod selector;

pub use admission::{AdmissionGate, AdmissionPermit};
pub use selector::{DeadlinePolicy, WorkerSelector};

pub(crate) use bootstrap::Bootstrapper;

use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;

use crate::accounts::{AccountRegistry, CredentialRotator};
use crate::config::{AreaConfig, BootstrapConfig, Config, DispatchConfig};
use crate::geo::Point;
use crate::spawns::{epoch_secs, hour_phase, time_of_hour, SpawnError, SpawnEvent, SpawnSource};
use crate::store::SightingStore;
use crate::worker::Worker;

/// Consecutive iteration faults tolerated before the run aborts.
pub const MAX_CONSECUTIVE_FAULTS: u32 = 100;

/// Overdue events already present in the sighting store are redundant only
/// past this grace, in seconds.
const REDUNDANT_GRACE_SECS: f64 = 5.0;

/// Cold-start seek stops early once an event this close to now is found.
const COLD_START_SEEK_TOLERANCE_SECS: f64 = 3.0;

/// Dispatch errors
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The stop signal fired. Never caught and retried.
    #[error("dispatch cancelled")]
    Cancelled,

    #[error("{count} consecutive dispatch faults, aborting")]
    FaultLimit { count: u32 },

    /// The very first spawn load failed; nothing can be scheduled without
    /// spawn data.
    #[error("initial spawn refresh failed")]
    InitialRefresh(#[source] SpawnError),

    #[error("admission gate closed")]
    GateClosed,

    #[error(transparent)]
    Spawns(#[from] SpawnError),
}

// ============================================================================
// Dispatch state
// ============================================================================

/// Lifecycle state of the dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    ColdStart,
    Steady,
    Draining,
    Stopped,
}

impl DispatchState {
    fn as_u8(self) -> u8 {
        match self {
            Self::ColdStart => 0,
            Self::Steady => 1,
            Self::Draining => 2,
            Self::Stopped => 3,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::ColdStart,
            1 => Self::Steady,
            2 => Self::Draining,
            _ => Self::Stopped,
        }
    }
}

impl fmt::Display for DispatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ColdStart => "cold start",
            Self::Steady => "steady",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        };
        write!(f, "{name}")
    }
}

// ============================================================================
// Counters
// ============================================================================

/// Process-wide dispatch totals, mutated from the scheduling context and the
/// visit tasks it spawns.
#[derive(Debug, Default)]
pub struct DispatchCounters {
    visits: AtomicU64,
    skipped: AtomicU64,
    redundant: AtomicU64,
    idle_ms: AtomicU64,
}

impl DispatchCounters {
    pub fn inc_visits(&self) {
        self.visits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_redundant(&self) {
        self.redundant.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_idle(&self, waited: Duration) {
        self.idle_ms
            .fetch_add(waited.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            visits: self.visits.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            redundant: self.redundant.load(Ordering::Relaxed),
            idle: Duration::from_millis(self.idle_ms.load(Ordering::Relaxed)),
        }
    }
}

/// Point-in-time copy of the dispatch totals.
#[derive(Debug, Clone, Copy, Default)]
pub struct CountersSnapshot {
    pub visits: u64,
    pub skipped: u64,
    pub redundant: u64,
    pub idle: Duration,
}

// ============================================================================
// Event classification
// ============================================================================

/// What to do with a due event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventDisposition {
    /// Dispatch a visit task.
    Dispatch,
    /// Another path already covered it; count and move on.
    Redundant,
    /// Too stale for any worker to usefully visit; count and move on.
    Skip,
}

/// Classify an event by how late it is and whether it was already sighted.
///
/// `time_diff` is `now - spawn_time`: negative means not yet due, positive
/// means overdue.
pub fn classify_event(time_diff: f64, already_seen: bool, skip_threshold: f64) -> EventDisposition {
    if time_diff > REDUNDANT_GRACE_SECS && already_seen {
        EventDisposition::Redundant
    } else if time_diff > skip_threshold {
        EventDisposition::Skip
    } else {
        EventDisposition::Dispatch
    }
}

/// Index of the event nearest (and not after) the current time-of-hour.
///
/// Used on the first pass to avoid replaying an entire hour of backlog.
/// Events must be ordered by offset; returns 0 when nothing is due yet.
fn seek_index(events: &[SpawnEvent], now: f64) -> usize {
    let current = time_of_hour(now);
    let mut best: Option<(f64, usize)> = None;

    for (i, event) in events.iter().enumerate() {
        let diff = current - f64::from(event.offset_secs);
        if diff > 0.0 && best.map_or(true, |(b, _)| diff < b) {
            best = Some((diff, i));
            if diff < COLD_START_SEEK_TOLERANCE_SECS {
                break;
            }
        }
    }

    best.map_or(0, |(_, i)| i)
}

// ============================================================================
// Shared dispatch context
// ============================================================================

/// State shared between the dispatch loop, its visit tasks, and the stats
/// view.
pub(crate) struct Shared {
    pub(crate) config: DispatchConfig,
    jitter: f64,
    pub(crate) counters: DispatchCounters,
    backlog: Mutex<VecDeque<Point>>,
    pub(crate) gate: AdmissionGate,
    pub(crate) selector: WorkerSelector,
    pub(crate) workers: Arc<Vec<Arc<Worker>>>,
    store: Arc<dyn SightingStore>,
    rotator: Arc<CredentialRotator>,
    pub(crate) paused: Arc<AtomicBool>,
    state: AtomicU8,
}

impl Shared {
    fn backlog_lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Point>> {
        self.backlog.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pop_mystery(&self) -> Option<Point> {
        self.backlog_lock().pop_front()
    }

    fn push_mystery(&self, point: Point) {
        self.backlog_lock().push_back(point);
    }

    pub(crate) fn backlog_len(&self) -> usize {
        self.backlog_lock().len()
    }

    /// One visit task: jitter the coordinate, find a worker, visit, fold the
    /// result into the counters. The admission permit is released on every
    /// exit path when it drops at the end of this function.
    async fn try_point(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
        point: Point,
        known: Option<(u64, f64)>,
        permit: AdmissionPermit,
    ) {
        match self.try_point_inner(&mut shutdown, point, known).await {
            Ok(()) | Err(DispatchError::Cancelled) => {}
            Err(e) => tracing::error!("visit task failed: {e}"),
        }
        drop(permit);
    }

    async fn try_point_inner(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        point: Point,
        known: Option<(u64, f64)>,
    ) -> Result<(), DispatchError> {
        let target = point.jittered(self.jitter, &mut rand::thread_rng());

        let policy = match known {
            Some((_, spawn_time)) => DeadlinePolicy::Known { spawn_time },
            None => DeadlinePolicy::Unknown,
        };

        let claim = match self
            .selector
            .select(target, policy, &self.config, shutdown)
            .await?
        {
            Some(claim) => claim,
            None => {
                match known {
                    // A timed event nobody could reach is lost for this hour.
                    Some(_) => self.counters.inc_skipped(),
                    // An untimed point goes back on the backlog for a later try.
                    None => self.push_mystery(point),
                }
                return Ok(());
            }
        };

        if let Some((_, spawn_time)) = known {
            claim.set_after_spawn(epoch_secs() - spawn_time);
        }

        match claim.visit(target, known.map(|(id, _)| id)).await {
            Ok(true) => self.counters.inc_visits(),
            Ok(false) => {}
            Err(fault) => {
                tracing::debug!(worker = claim.index(), point = %target, "visit fault: {fault}");
                self.rotator.handle_visit_fault(&claim, &fault);
            }
        }
        Ok(())
    }
}

/// Cheap handle onto the dispatcher's observable state.
#[derive(Clone)]
pub struct DispatchHandle {
    shared: Arc<Shared>,
}

impl DispatchHandle {
    pub fn counters(&self) -> CountersSnapshot {
        self.shared.counters.snapshot()
    }

    pub fn state(&self) -> DispatchState {
        DispatchState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    pub fn paused(&self) -> bool {
        self.shared.paused.load(Ordering::Acquire)
    }

    pub fn in_flight(&self) -> usize {
        self.shared.gate.in_flight()
    }

    pub fn concurrency_limit(&self) -> usize {
        self.shared.gate.limit()
    }

    pub fn backlog_len(&self) -> usize {
        self.shared.backlog_len()
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Launch options from the command line.
#[derive(Debug, Clone, Copy, Default)]
pub struct LaunchOptions {
    /// Run the bootstrap procedure even when spawn data already exists.
    pub force_bootstrap: bool,

    /// Allow the first spawn load to come from the on-disk snapshot.
    pub load_snapshot: bool,
}

/// The top-level scheduler.
pub struct Dispatcher {
    shared: Arc<Shared>,
    spawns: SpawnSource,
    registry: Arc<AccountRegistry>,
    accounts_snapshot: PathBuf,
    area: AreaConfig,
    boot: BootstrapConfig,
    shutdown: watch::Receiver<bool>,
    next_mystery_reload: Instant,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &Config,
        workers: Arc<Vec<Arc<Worker>>>,
        store: Arc<dyn SightingStore>,
        rotator: Arc<CredentialRotator>,
        registry: Arc<AccountRegistry>,
        spawns: SpawnSource,
        paused: Arc<AtomicBool>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let shared = Arc::new(Shared {
            config: config.dispatch.clone(),
            jitter: config.area.jitter,
            counters: DispatchCounters::default(),
            backlog: Mutex::new(VecDeque::new()),
            gate: AdmissionGate::new(config.dispatch.concurrency_limit),
            selector: WorkerSelector::new(workers.clone(), &config.dispatch),
            workers,
            store,
            rotator,
            paused,
            state: AtomicU8::new(DispatchState::ColdStart.as_u8()),
        });

        Self {
            shared,
            spawns,
            registry,
            accounts_snapshot: config.paths.accounts_snapshot(),
            area: config.area.clone(),
            boot: config.bootstrap.clone(),
            shutdown,
            next_mystery_reload: Instant::now(),
        }
    }

    pub fn handle(&self) -> DispatchHandle {
        DispatchHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn spawns(&self) -> &SpawnSource {
        &self.spawns
    }

    fn set_state(&self, state: DispatchState) {
        self.shared.state.store(state.as_u8(), Ordering::Release);
        tracing::info!(state = %state, "dispatch state changed");
    }

    /// Run the dispatch loop until cancellation or the fault limit.
    ///
    /// Returns `Err(Cancelled)` on a clean stop-signal exit; the caller is
    /// expected to drain afterwards either way.
    pub async fn run(&mut self, opts: LaunchOptions) -> Result<(), DispatchError> {
        self.set_state(DispatchState::ColdStart);

        // The system cannot start without spawn data: the very first load
        // is fatal on failure, later ones retry with backoff.
        self.spawns
            .refresh(opts.load_snapshot)
            .await
            .map_err(DispatchError::InitialRefresh)?;

        if self.spawns.is_empty() || opts.force_bootstrap {
            tracing::warn!(
                forced = opts.force_bootstrap,
                "no spawn data yet, running bootstrap"
            );
            let bootstrapper = Bootstrapper::new(
                self.shared.clone(),
                self.area.clone(),
                self.boot.clone(),
                self.shutdown.clone(),
            );
            bootstrapper
                .run(self.spawns.mystery_backlog().into())
                .await?;
            self.refresh_with_retry().await?;
        }

        self.reload_backlog();
        self.next_mystery_reload = Instant::now() + self.shared.config.mystery_rescan();
        self.set_state(DispatchState::Steady);

        let mut refreshed = false;
        let mut faults: u32 = 0;
        loop {
            if *self.shutdown.borrow() {
                return Err(DispatchError::Cancelled);
            }
            match self.iterate(refreshed).await {
                Ok(()) => {
                    refreshed = true;
                    faults = 0;
                }
                Err(DispatchError::Cancelled) => return Err(DispatchError::Cancelled),
                Err(e) => {
                    faults += 1;
                    tracing::error!(consecutive = faults, "dispatch iteration failed: {e}");
                    if faults > MAX_CONSECUTIVE_FAULTS {
                        return Err(DispatchError::FaultLimit { count: faults });
                    }
                    refreshed = false;
                }
            }
        }
    }

    /// One pass over the hour's events.
    async fn iterate(&mut self, refreshed: bool) -> Result<(), DispatchError> {
        if refreshed {
            self.refresh_with_retry().await?;
            self.snapshot_accounts();
        }

        let now = epoch_secs();
        let rolled_over = self.spawns.past_last_event(now);
        let mut hour = hour_phase(now);
        if rolled_over {
            // Raw offsets now belong to the next cycle.
            hour += 3600.0;
        }

        let events = self.spawns.events().to_vec();
        if events.is_empty() {
            // Nothing scheduled this hour; avoid spinning on refresh.
            tracing::debug!("no timed events, sleeping until next refresh");
            self.sleep_or_cancel(self.shared.config.refresh_backoff())
                .await?;
            return Ok(());
        }

        let start = if refreshed || rolled_over {
            0
        } else {
            seek_index(&events, now)
        };

        for event in &events[start..] {
            self.pause_on_backpressure().await?;

            let spawn_time = event.absolute_time(hour);

            // Work the mystery backlog while the event is still in the
            // future, then fall through once it is due.
            loop {
                let time_diff = epoch_secs() - spawn_time;
                if time_diff >= 0.5 {
                    break;
                }

                if let Some(point) = self.shared.pop_mystery() {
                    let permit = self.admit().await?;
                    self.spawn_visit(point, None, permit);
                } else if Instant::now() >= self.next_mystery_reload {
                    self.reload_backlog();
                    self.next_mystery_reload = Instant::now() + self.shared.config.mystery_rescan();
                } else {
                    let until_spawn = (spawn_time - epoch_secs() + 0.5).max(0.0);
                    let until_reload = self
                        .next_mystery_reload
                        .saturating_duration_since(Instant::now());
                    let nap = Duration::from_secs_f64(until_spawn)
                        .min(until_reload)
                        .max(Duration::from_millis(10));
                    self.sleep_or_cancel(nap).await?;
                }
            }

            let time_diff = epoch_secs() - spawn_time;
            let already_seen = self.shared.store.contains(event.id);
            match classify_event(
                time_diff,
                already_seen,
                self.shared.config.skip_threshold_secs as f64,
            ) {
                EventDisposition::Redundant => self.shared.counters.inc_redundant(),
                EventDisposition::Skip => self.shared.counters.inc_skipped(),
                EventDisposition::Dispatch => {
                    let permit = self.admit().await?;
                    self.spawn_visit(event.point, Some((event.id, spawn_time)), permit);
                }
            }
        }

        Ok(())
    }

    /// Pause while the verification backlog is over its ceiling, folding the
    /// wait into the idle counter so throughput stats stay honest.
    async fn pause_on_backpressure(&mut self) -> Result<(), DispatchError> {
        let ceiling = self.shared.config.verification_ceiling;
        if self.shared.rotator.verification_len() <= ceiling {
            return Ok(());
        }

        self.shared.paused.store(true, Ordering::Release);
        tracing::warn!(
            backlog = self.shared.rotator.verification_len(),
            ceiling,
            "verification backlog over ceiling, pausing dispatch"
        );

        let waited = tokio::select! {
            waited = self.shared.rotator.wait_until_verification_below(ceiling) => waited,
            _ = self.shutdown.changed() => {
                self.shared.paused.store(false, Ordering::Release);
                return Err(DispatchError::Cancelled);
            }
        };

        self.shared.counters.add_idle(waited);
        self.shared.paused.store(false, Ordering::Release);
        tracing::info!(waited_secs = waited.as_secs(), "verification backlog drained, resuming");
        Ok(())
    }

    /// Reload spawn data, retrying with a fixed backoff until it succeeds or
    /// the stop signal fires.
    async fn refresh_with_retry(&mut self) -> Result<(), DispatchError> {
        loop {
            if *self.shutdown.borrow() {
                return Err(DispatchError::Cancelled);
            }
            let refreshed = tokio::select! {
                result = self.spawns.refresh(false) => result,
                _ = self.shutdown.changed() => return Err(DispatchError::Cancelled),
            };
            match refreshed {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::error!(
                        backoff_secs = self.shared.config.refresh_backoff_secs,
                        "spawn refresh failed, retrying: {e}"
                    );
                    self.sleep_or_cancel(self.shared.config.refresh_backoff())
                        .await?;
                }
            }
        }
    }

    /// Rewrite the account snapshot in the background.
    fn snapshot_accounts(&self) {
        let registry = self.registry.clone();
        let path = self.accounts_snapshot.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = registry.snapshot_to(&path) {
                tracing::warn!("account snapshot write failed: {e}");
            }
        });
    }

    fn reload_backlog(&self) {
        let backlog = self.spawns.mystery_backlog();
        tracing::debug!(len = backlog.len(), "reloaded mystery backlog");
        *self.shared.backlog_lock() = backlog;
    }

    async fn admit(&mut self) -> Result<AdmissionPermit, DispatchError> {
        if *self.shutdown.borrow() {
            return Err(DispatchError::Cancelled);
        }
        tokio::select! {
            permit = self.shared.gate.admit() => permit,
            _ = self.shutdown.changed() => Err(DispatchError::Cancelled),
        }
    }

    fn spawn_visit(&self, point: Point, known: Option<(u64, f64)>, permit: AdmissionPermit) {
        let shared = self.shared.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(shared.try_point(shutdown, point, known, permit));
    }

    async fn sleep_or_cancel(&mut self, duration: Duration) -> Result<(), DispatchError> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.shutdown.changed() => Err(DispatchError::Cancelled),
        }
    }

    /// Close the gate and wait for in-flight tasks, up to the drain timeout.
    ///
    /// Returns the number of tasks abandoned to the timeout.
    pub async fn drain(&self) -> usize {
        self.set_state(DispatchState::Draining);
        self.shared.gate.close();

        let deadline = Instant::now() + self.shared.config.drain_timeout();
        while self.shared.gate.in_flight() > 0 && Instant::now() < deadline {
            tracing::info!(
                in_flight = self.shared.gate.in_flight(),
                "waiting for visit tasks to finish"
            );
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        let abandoned = self.shared.gate.in_flight();
        if abandoned > 0 {
            tracing::warn!(abandoned, "drain timeout expired, abandoning in-flight tasks");
        }
        self.set_state(DispatchState::Stopped);
        abandoned
    }
}

// ============================================================================
// Tests
// ============================================================================
