//! Field workers
//!
//! A [`Worker`] is one long-lived slot in the pool: it carries a login
//! session, a last known location, and the counters the stats view samples.
//! Exactly one visit may run on a worker at a time. The busy lock is a real
//! mutex handed out as an owned guard inside a [`WorkerClaim`]; several
//! tasks may observe the same worker as idle and race to claim it, but only
//! one `WorkerClaim::try_acquire` wins and the losers re-poll.
//!
//! The actual protocol/session work of a visit lives behind the
//! [`VisitHandler`] trait; the worker records the outcome (location,
//! counters, status, sighting commits) around that call.

pub mod sim;

use async_trait::async_trait;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::accounts::Account;
use crate::geo::Point;
use crate::store::SightingStore;

pub use sim::FieldSimulator;

// ============================================================================
// Visit boundary
// ============================================================================

/// Result of one visit operation.
#[derive(Debug, Clone, Default)]
pub struct VisitOutcome {
    /// Whether the visit completed usefully.
    pub success: bool,

    /// Number of sightings made during the visit.
    pub seen: u32,

    /// Ids of sightings to commit to the store.
    pub sighting_ids: Vec<u64>,
}

/// Visit failures reported by the protocol layer.
///
/// These are per-event faults: they are recorded on the worker and counted,
/// never propagated as scheduling faults.
#[derive(Debug, Error)]
pub enum VisitError {
    #[error("FAILED LOGIN")]
    FailedLogin,

    #[error("NOT AUTHENTICATED")]
    NotAuthenticated,

    #[error("VERIFICATION REQUIRED")]
    ChallengeRequired,

    #[error("BANNED")]
    Banned,

    #[error("TIMEOUT after {0:?}")]
    Timeout(Duration),

    #[error("MALFORMED RESPONSE")]
    MalformedResponse,
}

impl VisitError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::FailedLogin => ErrorCode::FailedLogin,
            Self::NotAuthenticated => ErrorCode::NotAuthenticated,
            Self::ChallengeRequired => ErrorCode::ChallengeRequired,
            Self::Banned => ErrorCode::Banned,
            Self::Timeout(_) => ErrorCode::Timeout,
            Self::MalformedResponse => ErrorCode::MalformedResponse,
        }
    }

    /// Whether the worker's account must be routed to the verification queue.
    pub fn requires_verification(&self) -> bool {
        matches!(self, Self::ChallengeRequired)
    }

    /// Whether the worker's account is permanently unusable.
    pub fn is_ban(&self) -> bool {
        matches!(self, Self::Banned)
    }
}

/// Worker error codes, one glyph each for the operator grid view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    FailedLogin,
    NotAuthenticated,
    ChallengeRequired,
    Banned,
    Timeout,
    MalformedResponse,
    NoAccount,
}

impl ErrorCode {
    pub fn glyph(&self) -> char {
        match self {
            Self::FailedLogin => 'L',
            Self::NotAuthenticated => 'A',
            Self::ChallengeRequired => 'C',
            Self::Banned => 'B',
            Self::Timeout => 'T',
            Self::MalformedResponse => 'M',
            Self::NoAccount => 'N',
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.glyph())
    }
}

/// The protocol/session layer a worker drives to perform a visit.
#[async_trait]
pub trait VisitHandler: Send + Sync {
    /// Visit a point during steady-state scanning.
    async fn visit(&self, worker_index: usize, point: Point) -> Result<VisitOutcome, VisitError>;

    /// Visit a point during the bootstrap procedure.
    async fn bootstrap_visit(
        &self,
        worker_index: usize,
        point: Point,
    ) -> Result<VisitOutcome, VisitError>;
}

// ============================================================================
// Worker
// ============================================================================

struct WorkerState {
    /// Last visited location; a worker that has not moved yet can be
    /// assigned anywhere at no cost.
    location: Option<Point>,
    last_action: Instant,
    session_start: Instant,
    account: Option<Account>,
    status: String,
    error_code: Option<ErrorCode>,
}

/// One slot in the worker pool.
pub struct Worker {
    index: usize,
    busy: Arc<AsyncMutex<()>>,

    /// Advisory idle flag for cheap pool scans; the mutex is authoritative.
    idle: AtomicBool,

    state: Mutex<WorkerState>,
    visits: AtomicU64,
    total_seen: AtomicU64,
    session_seen: AtomicU64,
    after_spawn_ms: AtomicI64,
    speed_bits: AtomicU64,

    handler: Arc<dyn VisitHandler>,
    store: Arc<dyn SightingStore>,
}

impl Worker {
    pub fn new(
        index: usize,
        handler: Arc<dyn VisitHandler>,
        store: Arc<dyn SightingStore>,
        account: Option<Account>,
    ) -> Arc<Self> {
        let now = Instant::now();
        let error_code = if account.is_none() {
            Some(ErrorCode::NoAccount)
        } else {
            None
        };
        Arc::new(Self {
            index,
            busy: Arc::new(AsyncMutex::new(())),
            idle: AtomicBool::new(true),
            state: Mutex::new(WorkerState {
                location: None,
                last_action: now,
                session_start: now,
                account,
                status: String::from("initial"),
                error_code,
            }),
            visits: AtomicU64::new(0),
            total_seen: AtomicU64::new(0),
            session_seen: AtomicU64::new(0),
            after_spawn_ms: AtomicI64::new(0),
            speed_bits: AtomicU64::new(0f64.to_bits()),
            handler,
            store,
        })
    }

    fn state(&self) -> MutexGuard<'_, WorkerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Whether the worker looked idle at the moment of the call.
    ///
    /// Purely advisory: the claim can still be lost to another task.
    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::Acquire)
    }

    /// Travel speed (km/h) the worker would need to reach `point` now.
    ///
    /// A worker that has not visited anything yet reports zero cost.
    pub fn travel_cost(&self, point: Point) -> f64 {
        let state = self.state();
        let Some(location) = state.location else {
            return 0.0;
        };
        let meters = location.distance_m(point);
        let hours = state.last_action.elapsed().as_secs_f64().max(1.0) / 3600.0;
        (meters / 1000.0) / hours
    }

    /// Place the worker at a location as of `age` ago.
    ///
    /// Used by the simulator and tests to prime travel costs.
    pub fn place_at(&self, point: Point, age: Duration) {
        let mut state = self.state();
        state.location = Some(point);
        state.last_action = Instant::now().checked_sub(age).unwrap_or_else(Instant::now);
    }

    fn record_arrival(&self, point: Point) {
        let mut state = self.state();
        state.location = Some(point);
        state.last_action = Instant::now();
    }

    pub fn set_status(&self, status: impl Into<String>, error_code: Option<ErrorCode>) {
        let mut state = self.state();
        state.status = status.into();
        state.error_code = error_code;
    }

    pub fn status(&self) -> String {
        self.state().status.clone()
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        self.state().error_code
    }

    pub fn visits(&self) -> u64 {
        self.visits.load(Ordering::Relaxed)
    }

    pub fn total_seen(&self) -> u64 {
        self.total_seen.load(Ordering::Relaxed)
    }

    /// Scheduling delay of the last known-time assignment, in seconds.
    pub fn after_spawn(&self) -> f64 {
        self.after_spawn_ms.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn set_after_spawn(&self, secs: f64) {
        self.after_spawn_ms
            .store((secs * 1000.0) as i64, Ordering::Relaxed);
    }

    /// Travel speed of the last winning selection, in km/h.
    pub fn speed(&self) -> f64 {
        f64::from_bits(self.speed_bits.load(Ordering::Relaxed))
    }

    pub fn set_speed(&self, speed: f64) {
        self.speed_bits.store(speed.to_bits(), Ordering::Relaxed);
    }

    /// Age of the current credential session.
    pub fn session_age(&self) -> Duration {
        self.state().session_start.elapsed()
    }

    /// Sightings per minute over the current credential session.
    pub fn sightings_per_minute(&self) -> f64 {
        let minutes = (self.session_age().as_secs_f64() / 60.0).max(1.0 / 60.0);
        self.session_seen.load(Ordering::Relaxed) as f64 / minutes
    }

    pub fn account_username(&self) -> Option<String> {
        self.state().account.as_ref().map(|a| a.username.clone())
    }

    /// Replace the worker's credential and start a fresh session window.
    ///
    /// Returns the outgoing account. Passing `None` leaves the worker
    /// without a credential until the rotator finds a replacement.
    pub fn swap_credential(&self, account: Option<Account>) -> Option<Account> {
        let mut state = self.state();
        let old = match account {
            Some(new) => {
                state.status = format!("swapped in {}", new.username);
                state.error_code = None;
                state.account.replace(new)
            }
            None => {
                state.status = String::from("NO ACCOUNT");
                state.error_code = Some(ErrorCode::NoAccount);
                state.account.take()
            }
        };
        state.session_start = Instant::now();
        drop(state);
        self.session_seen.store(0, Ordering::Relaxed);
        old
    }

    /// Perform a steady-state visit, recording the outcome on the worker.
    ///
    /// `event_id` is committed to the sighting store on success so later
    /// occurrences of the same event classify as redundant.
    pub async fn visit(&self, point: Point, event_id: Option<u64>) -> Result<bool, VisitError> {
        self.set_status(format!("visiting {point}"), None);
        let outcome = match self.handler.visit(self.index, point).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.note_error(&e);
                return Err(e);
            }
        };
        self.absorb_outcome(point, &outcome, event_id);
        Ok(outcome.success)
    }

    /// Perform a bootstrap visit, recording the outcome on the worker.
    pub async fn bootstrap_visit(&self, point: Point) -> Result<bool, VisitError> {
        self.set_status(format!("bootstrapping {point}"), None);
        let outcome = match self.handler.bootstrap_visit(self.index, point).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.note_error(&e);
                return Err(e);
            }
        };
        self.absorb_outcome(point, &outcome, None);
        Ok(outcome.success)
    }

    fn absorb_outcome(&self, point: Point, outcome: &VisitOutcome, event_id: Option<u64>) {
        self.record_arrival(point);
        if outcome.success {
            self.visits.fetch_add(1, Ordering::Relaxed);
            let seen = u64::from(outcome.seen);
            self.total_seen.fetch_add(seen, Ordering::Relaxed);
            self.session_seen.fetch_add(seen, Ordering::Relaxed);
            for id in &outcome.sighting_ids {
                self.store.commit(*id);
            }
            if let Some(id) = event_id {
                self.store.commit(id);
            }
            self.set_status(format!("visited {point}"), None);
        } else {
            self.set_status("visit came up empty", None);
        }
    }

    fn note_error(&self, error: &VisitError) {
        self.set_status(error.to_string(), Some(error.error_code()));
    }

    /// Point-in-time copy of the observable worker fields.
    pub fn snapshot(&self) -> WorkerSnapshot {
        let state = self.state();
        WorkerSnapshot {
            index: self.index,
            busy: !self.is_idle(),
            visits: self.visits(),
            total_seen: self.total_seen(),
            after_spawn: self.after_spawn(),
            speed: self.speed(),
            session_secs: state.session_start.elapsed().as_secs(),
            status: state.status.clone(),
            error_code: state.error_code,
            username: state.account.as_ref().map(|a| a.username.clone()),
        }
    }
}

/// Observable worker fields sampled by the stats view.
#[derive(Debug, Clone)]
pub struct WorkerSnapshot {
    pub index: usize,
    pub busy: bool,
    pub visits: u64,
    pub total_seen: u64,
    pub after_spawn: f64,
    pub speed: f64,
    pub session_secs: u64,
    pub status: String,
    pub error_code: Option<ErrorCode>,
    pub username: Option<String>,
}

impl WorkerSnapshot {
    /// Single-character summary for the operator grid.
    pub fn glyph(&self) -> char {
        match self.error_code {
            Some(code) => code.glyph(),
            None if self.busy => '!',
            None => '.',
        }
    }
}

// ============================================================================
// Worker claim
// ============================================================================

/// Exclusive hold on a worker for the duration of one visit or swap.
pub struct WorkerClaim {
    worker: Arc<Worker>,
    _guard: OwnedMutexGuard<()>,
}

impl WorkerClaim {
    /// Claim the worker if it is free right now.
    ///
    /// Multiple tasks racing for a worker they both observed as idle settle
    /// it here: exactly one wins the lock, the losers get `None`.
    pub fn try_acquire(worker: &Arc<Worker>) -> Option<WorkerClaim> {
        let guard = worker.busy.clone().try_lock_owned().ok()?;
        worker.idle.store(false, Ordering::Release);
        Some(WorkerClaim {
            worker: worker.clone(),
            _guard: guard,
        })
    }

    /// Claim the worker, waiting for the current holder to finish.
    pub async fn acquire(worker: &Arc<Worker>) -> WorkerClaim {
        let guard = worker.busy.clone().lock_owned().await;
        worker.idle.store(false, Ordering::Release);
        WorkerClaim {
            worker: worker.clone(),
            _guard: guard,
        }
    }

    pub fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }
}

impl Deref for WorkerClaim {
    type Target = Worker;

    fn deref(&self) -> &Worker {
        &self.worker
    }
}

impl Drop for WorkerClaim {
    fn drop(&mut self) {
        self.worker.idle.store(true, Ordering::Release);
    }
}

// ============================================================================
// Tests
// ============================================================================
