//! Integration tests for the dispatch core
//!
//! These drive a full dispatcher — real queues, workers, selector, and
//! admission gate — against a deterministic spawn set and an instrumented
//! visit handler, and verify the concurrency and backpressure contracts
//! end to end.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use patrol::accounts::{Account, AccountQueue, AccountRegistry, CredentialRotator};
use patrol::config::Config;
use patrol::dispatch::{DispatchError, DispatchHandle, DispatchState, Dispatcher, LaunchOptions};
use patrol::geo::Point;
use patrol::spawns::{
    epoch_secs, time_of_hour, SpawnError, SpawnEvent, SpawnRepository, SpawnSet, SpawnSource,
};
use patrol::stats::StatsAggregator;
use patrol::store::{MemorySightingStore, SightingStore};
use patrol::worker::{VisitError, VisitHandler, VisitOutcome, Worker};

// ============================================================================
// Test fixtures
// ============================================================================

/// Visit handler that records concurrency and per-worker exclusivity.
struct TrackingHandler {
    latency: Duration,
    current: AtomicUsize,
    max_concurrent: AtomicUsize,
    per_worker: Vec<AtomicUsize>,
    exclusivity_violations: AtomicUsize,
}

impl TrackingHandler {
    fn new(pool_size: usize, latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            latency,
            current: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(0),
            per_worker: (0..pool_size).map(|_| AtomicUsize::new(0)).collect(),
            exclusivity_violations: AtomicUsize::new(0),
        })
    }

    async fn tracked_visit(&self, worker_index: usize) -> Result<VisitOutcome, VisitError> {
        let now_running = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(now_running, Ordering::SeqCst);

        if self.per_worker[worker_index].fetch_add(1, Ordering::SeqCst) != 0 {
            self.exclusivity_violations.fetch_add(1, Ordering::SeqCst);
        }

        tokio::time::sleep(self.latency).await;

        self.per_worker[worker_index].fetch_sub(1, Ordering::SeqCst);
        self.current.fetch_sub(1, Ordering::SeqCst);

        Ok(VisitOutcome {
            success: true,
            seen: 1,
            sighting_ids: vec![],
        })
    }
}

#[async_trait]
impl VisitHandler for TrackingHandler {
    async fn visit(&self, worker_index: usize, _: Point) -> Result<VisitOutcome, VisitError> {
        self.tracked_visit(worker_index).await
    }

    async fn bootstrap_visit(
        &self,
        worker_index: usize,
        _: Point,
    ) -> Result<VisitOutcome, VisitError> {
        self.tracked_visit(worker_index).await
    }
}

struct StaticRepo(SpawnSet);

impl SpawnRepository for StaticRepo {
    fn load(&self) -> Result<SpawnSet, SpawnError> {
        Ok(self.0.clone())
    }
}

struct World {
    dispatcher: Dispatcher,
    handle: DispatchHandle,
    handler: Arc<TrackingHandler>,
    store: Arc<MemorySightingStore>,
    available: Arc<AccountQueue>,
    verification: Arc<AccountQueue>,
    workers: Arc<Vec<Arc<Worker>>>,
    shutdown_tx: watch::Sender<bool>,
    _dir: tempfile::TempDir,
}

fn build_world(pool_size: usize, set: SpawnSet, latency: Duration, tune: impl FnOnce(&mut Config)) -> World {
    let dir = tempfile::tempdir().unwrap();

    let mut config = Config::default();
    config.area.grid_rows = pool_size;
    config.area.grid_cols = 1;
    config.paths.data_dir = dir.path().to_path_buf();
    config.dispatch.poll_interval_ms = 10;
    config.dispatch.refresh_backoff_secs = 1;
    // Keep steady-state passes from refilling the mystery backlog.
    config.dispatch.mystery_rescan_secs = 600;
    // These tests exercise scheduling contracts, not travel physics: an
    // effectively unlimited speed ceiling keeps workers always eligible.
    config.dispatch.speed_ceiling = 10_000.0;
    tune(&mut config);
    config.validate().unwrap();

    let handler = TrackingHandler::new(pool_size, latency);
    let store = Arc::new(MemorySightingStore::new());
    let dyn_store: Arc<dyn SightingStore> = store.clone();

    let workers: Arc<Vec<Arc<Worker>>> = Arc::new(
        (0..pool_size)
            .map(|i| {
                Worker::new(
                    i,
                    handler.clone(),
                    dyn_store.clone(),
                    Some(Account::new(format!("scout{i}"), "pw")),
                )
            })
            .collect(),
    );

    let registry = Arc::new(AccountRegistry::new());
    let available = Arc::new(AccountQueue::new("available"));
    let verification = Arc::new(AccountQueue::new("verification"));
    let paused = Arc::new(AtomicBool::new(false));
    let rotator = CredentialRotator::new(
        available.clone(),
        verification.clone(),
        registry.clone(),
        workers.clone(),
        config.rotation.clone(),
        paused.clone(),
    );

    let spawns = SpawnSource::new(Arc::new(StaticRepo(set)), config.paths.spawn_snapshot());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let dispatcher = Dispatcher::new(
        &config,
        workers.clone(),
        dyn_store,
        rotator,
        registry,
        spawns,
        paused,
        shutdown_rx,
    );
    let handle = dispatcher.handle();

    World {
        dispatcher,
        handle,
        handler,
        store,
        available,
        verification,
        workers,
        shutdown_tx,
        _dir: dir,
    }
}

fn point(i: u64) -> Point {
    Point::new(40.78 + i as f64 * 1e-4, -73.97)
}

/// Events all due `age` seconds ago, plus a far-future sentinel the loop
/// parks on once the due work is dispatched.
fn due_events(count: u64, age: u32) -> SpawnSet {
    let toh = time_of_hour(epoch_secs()) as u32;
    let due = toh.saturating_sub(age);

    let mut known: Vec<SpawnEvent> = (0..count)
        .map(|i| SpawnEvent {
            id: 1000 + i,
            point: point(i),
            offset_secs: due,
        })
        .collect();
    known.push(SpawnEvent {
        id: 1,
        point: point(999),
        offset_secs: toh + 600,
    });

    SpawnSet {
        known,
        mysteries: Vec::new(),
    }
}

/// Wait for the test start to be far enough into the hour that "due `age`
/// seconds ago" events do not collapse onto the hour boundary.
async fn ensure_past_hour_start(age: u32) {
    let toh = time_of_hour(epoch_secs());
    let needed = f64::from(age + 5);
    if toh < needed {
        tokio::time::sleep(Duration::from_secs_f64(needed - toh)).await;
    }
}

async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    cond()
}

fn launch(world: World) -> (tokio::task::JoinHandle<(Dispatcher, Result<(), DispatchError>)>, World2) {
    let World {
        mut dispatcher,
        handle,
        handler,
        store,
        available,
        verification,
        workers,
        shutdown_tx,
        _dir,
    } = world;

    let task = tokio::spawn(async move {
        let result = dispatcher.run(LaunchOptions::default()).await;
        (dispatcher, result)
    });

    (
        task,
        World2 {
            handle,
            handler,
            store,
            available,
            verification,
            workers,
            shutdown_tx,
            _dir,
        },
    )
}

/// The world minus the dispatcher, which the run task owns.
#[allow(dead_code)]
struct World2 {
    handle: DispatchHandle,
    handler: Arc<TrackingHandler>,
    store: Arc<MemorySightingStore>,
    available: Arc<AccountQueue>,
    verification: Arc<AccountQueue>,
    workers: Arc<Vec<Arc<Worker>>>,
    shutdown_tx: watch::Sender<bool>,
    _dir: tempfile::TempDir,
}

async fn stop(
    task: tokio::task::JoinHandle<(Dispatcher, Result<(), DispatchError>)>,
    shutdown_tx: &watch::Sender<bool>,
) -> Dispatcher {
    let _ = shutdown_tx.send(true);
    let (dispatcher, result) = task.await.unwrap();
    assert!(
        matches!(result, Err(DispatchError::Cancelled)),
        "run must exit via cancellation, got {result:?}"
    );
    dispatcher
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_admission_bound_and_worker_exclusivity() {
    ensure_past_hour_start(3).await;

    let world = build_world(
        3,
        due_events(30, 3),
        Duration::from_millis(10),
        |config| config.dispatch.concurrency_limit = 4,
    );
    let (task, world) = launch(world);

    assert!(
        wait_until(Duration::from_secs(20), || world.handle.counters().visits >= 30).await,
        "all due events must be visited, got {:?}",
        world.handle.counters()
    );

    let dispatcher = stop(task, &world.shutdown_tx).await;
    dispatcher.drain().await;

    // The admission bound held the whole run.
    assert!(world.handler.max_concurrent.load(Ordering::SeqCst) <= 4);
    // No two tasks ever drove the same worker at once.
    assert_eq!(world.handler.exclusivity_violations.load(Ordering::SeqCst), 0);
    // Every permit was released.
    assert_eq!(world.handle.in_flight(), 0);
    assert_eq!(world.handle.state(), DispatchState::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_backpressure_blocks_dispatch_until_drained() {
    ensure_past_hour_start(3).await;

    let world = build_world(
        2,
        due_events(4, 3),
        Duration::from_millis(5),
        |config| config.dispatch.verification_ceiling = 5,
    );

    // Six accounts awaiting verification: one over the ceiling.
    for i in 0..6 {
        world.verification.push(Account::new(format!("stuck{i}"), "pw"));
    }

    let (task, world) = launch(world);

    // The loop must pause before dispatching anything.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(world.handle.paused(), "loop must report the paused state");
    assert_eq!(world.handle.counters().visits, 0, "no dispatches while paused");

    // Drop the backlog to the ceiling; dispatch resumes.
    world.verification.try_pop();
    assert!(
        wait_until(Duration::from_secs(10), || world.handle.counters().visits >= 4).await,
        "dispatch must resume once the backlog drains"
    );
    assert!(!world.handle.paused());
    // The pause was accounted as idle time.
    assert!(world.handle.counters().idle >= Duration::from_millis(400));

    let dispatcher = stop(task, &world.shutdown_tx).await;
    dispatcher.drain().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_already_seen_overdue_event_is_redundant() {
    ensure_past_hour_start(10).await;

    let world = build_world(2, due_events(2, 10), Duration::from_millis(5), |_| {});

    // Event 1000 was already covered by another path.
    world.store.commit(1000);

    let (task, world) = launch(world);

    assert!(
        wait_until(Duration::from_secs(10), || {
            let counters = world.handle.counters();
            counters.visits >= 1 && counters.redundant >= 1
        })
        .await,
        "got {:?}",
        world.handle.counters()
    );

    // Only the unseen event was dispatched.
    assert_eq!(world.handle.counters().visits, 1);
    assert!(world.store.contains(1001), "the fresh event was visited");

    let dispatcher = stop(task, &world.shutdown_tx).await;
    dispatcher.drain().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_mysteries_drain_while_waiting_for_future_event() {
    let now = epoch_secs();
    let toh = time_of_hour(now) as u32;

    // One timed event 8 seconds out and three mysteries to fill the wait.
    let set = SpawnSet {
        known: vec![SpawnEvent {
            id: 42,
            point: point(0),
            offset_secs: toh + 8,
        }],
        mysteries: vec![point(10), point(11), point(12)],
    };

    let world = build_world(2, set, Duration::from_millis(5), |_| {});
    let (task, world) = launch(world);

    // The mysteries go out while the timed event is still in the future.
    assert!(
        wait_until(Duration::from_secs(6), || world.handle.counters().visits >= 3).await,
        "mysteries must be dispatched during the wait, got {:?}",
        world.handle.counters()
    );
    assert_eq!(world.handle.counters().visits, 3, "timed event must not fire early");
    assert!(!world.store.contains(42));

    // Then the timed event itself.
    assert!(
        wait_until(Duration::from_secs(15), || world.store.contains(42)).await,
        "timed event must be visited once due"
    );

    let dispatcher = stop(task, &world.shutdown_tx).await;
    dispatcher.drain().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_future_event_with_no_mysteries_sleeps_without_dispatch() {
    let toh = time_of_hour(epoch_secs()) as u32;
    let set = SpawnSet {
        known: vec![SpawnEvent {
            id: 7,
            point: point(0),
            offset_secs: toh + 30,
        }],
        mysteries: Vec::new(),
    };

    let world = build_world(1, set, Duration::from_millis(5), |_| {});
    let (task, world) = launch(world);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(world.handle.counters().visits, 0);
    assert_eq!(world.handle.in_flight(), 0);

    let dispatcher = stop(task, &world.shutdown_tx).await;
    dispatcher.drain().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_drain_abandons_tasks_past_timeout() {
    ensure_past_hour_start(3).await;

    // A visit that outlives any reasonable drain.
    let world = build_world(1, due_events(1, 3), Duration::from_secs(60), |config| {
        config.dispatch.drain_timeout_secs = 1;
    });
    let (task, world) = launch(world);

    assert!(
        wait_until(Duration::from_secs(10), || world.handle.in_flight() == 1).await,
        "the long visit must be in flight"
    );

    let dispatcher = stop(task, &world.shutdown_tx).await;
    let abandoned = dispatcher.drain().await;
    assert_eq!(abandoned, 1, "the stuck task is abandoned at the timeout");
    assert_eq!(world.handle.state(), DispatchState::Stopped);
}

#[tokio::test]
async fn test_status_view_renders_counters_and_grid() {
    let world = build_world(2, SpawnSet::default(), Duration::from_millis(5), |_| {});

    let stats = StatsAggregator::new(
        world.handle.clone(),
        world.workers.clone(),
        world.available.clone(),
        world.verification.clone(),
        world.store.clone(),
        1,
    );

    let view = stats.render();
    assert!(view.contains("state: cold start"));
    assert!(view.contains("Visits: 0"));
    assert!(view.contains("Extra accounts: 0"));
    // One glyph row per worker with a single-column grid.
    let glyph_rows = view.lines().filter(|l| *l == ".").count();
    assert_eq!(glyph_rows, 2);
}
