//! Worker selection
//!
//! Given a target point, find the idle worker that can reach it at the
//! lowest travel speed. The scan claims candidates as it compares them, so
//! the worker returned is already locked for the caller; tasks that lose
//! the observe/claim race simply skip that worker and the selector re-polls
//! after a short interval as visits complete and workers free up.
//!
//! This is a bounded polling loop, not an event-driven wake. The poll
//! interval trades dispatch latency against scan overhead and is
//! configurable.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use super::DispatchError;
use crate::config::DispatchConfig;
use crate::geo::Point;
use crate::spawns::epoch_secs;
use crate::worker::{Worker, WorkerClaim};

/// How long a selection may keep looking before giving up.
#[derive(Debug, Clone, Copy)]
pub enum DeadlinePolicy {
    /// Event with a known spawn time: give up `give_up_known` from now, or
    /// at the spawn time itself if that is later.
    Known { spawn_time: f64 },

    /// Point with unknown timing: give up `give_up_unknown` from now.
    Unknown,

    /// Never give up; used only during bootstrap.
    MustComplete,
}

impl DeadlinePolicy {
    fn deadline(&self, config: &DispatchConfig) -> Option<Instant> {
        match self {
            Self::Known { spawn_time } => {
                let until_spawn = (spawn_time - epoch_secs()).max(0.0);
                let budget = config.give_up_known().as_secs_f64().max(until_spawn);
                Some(Instant::now() + Duration::from_secs_f64(budget))
            }
            Self::Unknown => Some(Instant::now() + config.give_up_unknown()),
            Self::MustComplete => None,
        }
    }
}

/// Finds and claims the best idle worker for a point.
pub struct WorkerSelector {
    workers: Arc<Vec<Arc<Worker>>>,
    speed_ceiling: f64,
    good_enough: Option<f64>,
    poll_interval: Duration,
}

impl WorkerSelector {
    pub fn new(workers: Arc<Vec<Arc<Worker>>>, config: &DispatchConfig) -> Self {
        Self {
            workers,
            speed_ceiling: config.speed_ceiling,
            good_enough: config.good_enough,
            poll_interval: config.poll_interval(),
        }
    }

    /// Claim the idle worker with the lowest travel cost to `point`.
    ///
    /// Returns `Ok(None)` once the policy deadline passes without a worker
    /// under the speed ceiling becoming available, and never before.
    /// Propagates `Cancelled` when the shutdown signal fires.
    pub async fn select(
        &self,
        point: Point,
        policy: DeadlinePolicy,
        config: &DispatchConfig,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<WorkerClaim>, DispatchError> {
        let deadline = policy.deadline(config);

        loop {
            if *shutdown.borrow() {
                return Err(DispatchError::Cancelled);
            }

            if let Some((cost, claim)) = self.scan(point) {
                claim.set_speed(cost);
                return Ok(Some(claim));
            }

            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Ok(None);
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.changed() => return Err(DispatchError::Cancelled),
            }
        }
    }

    /// One pass over the pool: claim the cheapest idle worker, or nothing
    /// if no claimable worker is under the speed ceiling.
    fn scan(&self, point: Point) -> Option<(f64, WorkerClaim)> {
        let mut best: Option<(f64, WorkerClaim)> = None;

        for worker in self.workers.iter() {
            if !worker.is_idle() {
                continue;
            }
            // Claim while comparing; a lost race just skips this worker.
            let Some(claim) = WorkerClaim::try_acquire(worker) else {
                continue;
            };
            let cost = claim.travel_cost(point);

            let better = match &best {
                Some((lowest, _)) => cost < *lowest,
                None => true,
            };
            if better {
                best = Some((cost, claim));
                if let Some(good_enough) = self.good_enough {
                    if cost < good_enough {
                        break;
                    }
                }
            }
        }

        match best {
            Some((cost, claim)) if cost < self.speed_ceiling => Some((cost, claim)),
            _ => None,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::Account;
    use crate::store::MemorySightingStore;
    use crate::worker::{VisitError, VisitHandler, VisitOutcome};
    use async_trait::async_trait;

    struct NullHandler;

    #[async_trait]
    impl VisitHandler for NullHandler {
        async fn visit(&self, _: usize, _: Point) -> Result<VisitOutcome, VisitError> {
            Ok(VisitOutcome::default())
        }

        async fn bootstrap_visit(&self, _: usize, _: Point) -> Result<VisitOutcome, VisitError> {
            Ok(VisitOutcome::default())
        }
    }

    const TARGET: Point = Point {
        lat: 40.79,
        lon: -73.97,
    };

    /// Pool where worker `i` costs roughly `costs[i]` km/h to reach TARGET.
    fn pool_with_costs(costs: &[f64]) -> Arc<Vec<Arc<Worker>>> {
        let handler = Arc::new(NullHandler);
        let store = Arc::new(MemorySightingStore::new());
        let workers: Vec<Arc<Worker>> = costs
            .iter()
            .enumerate()
            .map(|(i, &cost)| {
                let worker = Worker::new(
                    i,
                    handler.clone(),
                    store.clone(),
                    Some(Account::new(format!("scout{i}"), "pw")),
                );
                // `cost` km away with one hour elapsed = `cost` km/h.
                let lat = TARGET.lat - cost / 111.195;
                worker.place_at(Point::new(lat, TARGET.lon), Duration::from_secs(3600));
                worker
            })
            .collect();
        Arc::new(workers)
    }

    fn config() -> DispatchConfig {
        DispatchConfig {
            speed_ceiling: 5.0,
            good_enough: None,
            give_up_unknown_secs: 1,
            poll_interval_ms: 10,
            ..DispatchConfig::default()
        }
    }

    fn no_shutdown() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        // Keep the sender alive for the whole test.
        std::mem::forget(tx);
        rx
    }

    #[tokio::test]
    async fn test_selects_cheapest_idle_worker() {
        let workers = pool_with_costs(&[7.0, 3.0]);
        let config = config();
        let selector = WorkerSelector::new(workers.clone(), &config);
        let mut shutdown = no_shutdown();

        let claim = selector
            .select(TARGET, DeadlinePolicy::Unknown, &config, &mut shutdown)
            .await
            .unwrap()
            .expect("a worker under the ceiling exists");

        assert_eq!(claim.index(), 1);
        // The winning cost is recorded on the worker.
        assert!((claim.speed() - 3.0).abs() < 0.5, "got {}", claim.speed());
    }

    #[tokio::test]
    async fn test_none_once_deadline_passes_when_over_ceiling() {
        // Both workers cost more than the 5 km/h ceiling.
        let workers = pool_with_costs(&[8.0, 12.0]);
        let config = config();
        let selector = WorkerSelector::new(workers, &config);
        let mut shutdown = no_shutdown();

        let started = Instant::now();
        let got = selector
            .select(TARGET, DeadlinePolicy::Unknown, &config, &mut shutdown)
            .await
            .unwrap();

        assert!(got.is_none());
        // Not before the deadline (give_up_unknown = 1s).
        assert!(started.elapsed() >= Duration::from_millis(950));
    }

    #[tokio::test]
    async fn test_busy_workers_are_not_considered() {
        let workers = pool_with_costs(&[3.0, 4.0]);
        let config = config();
        let selector = WorkerSelector::new(workers.clone(), &config);
        let mut shutdown = no_shutdown();

        let held = WorkerClaim::try_acquire(&workers[0]).unwrap();
        let claim = selector
            .select(TARGET, DeadlinePolicy::Unknown, &config, &mut shutdown)
            .await
            .unwrap()
            .expect("the other worker is free");
        assert_eq!(claim.index(), 1);
        drop(held);
    }

    #[tokio::test]
    async fn test_waits_for_a_worker_to_free_up() {
        let workers = pool_with_costs(&[3.0]);
        let config = config();
        let selector = WorkerSelector::new(workers.clone(), &config);
        let mut shutdown = no_shutdown();

        let held = WorkerClaim::try_acquire(&workers[0]).unwrap();
        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            drop(held);
        });

        let claim = selector
            .select(TARGET, DeadlinePolicy::Unknown, &config, &mut shutdown)
            .await
            .unwrap();
        assert!(claim.is_some(), "worker freed before the deadline");
        release.await.unwrap();
    }

    #[tokio::test]
    async fn test_good_enough_early_exit_settles_for_first_below_threshold() {
        let workers = pool_with_costs(&[2.0, 0.01, 1.0]);
        let config = DispatchConfig {
            good_enough: Some(3.0),
            ..config()
        };
        let selector = WorkerSelector::new(workers, &config);
        let mut shutdown = no_shutdown();

        let claim = selector
            .select(TARGET, DeadlinePolicy::Unknown, &config, &mut shutdown)
            .await
            .unwrap()
            .expect("first worker is already good enough");

        // Worker 0 is under the threshold, so the scan stopped there even
        // though worker 1 would have been cheaper.
        assert_eq!(claim.index(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_selection() {
        let workers = pool_with_costs(&[8.0]);
        let config = DispatchConfig {
            give_up_unknown_secs: 3600,
            ..config()
        };
        let selector = WorkerSelector::new(workers, &config);

        let (tx, mut rx) = watch::channel(false);
        let cancel = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = tx.send(true);
            // Hold the sender until the selector has observed the signal.
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let got = selector
            .select(TARGET, DeadlinePolicy::Unknown, &config, &mut rx)
            .await;
        assert!(matches!(got, Err(DispatchError::Cancelled)));
        cancel.await.unwrap();
    }

    #[tokio::test]
    async fn test_must_complete_outlasts_known_deadlines() {
        let workers = pool_with_costs(&[8.0]);
        let config = config();
        let selector = WorkerSelector::new(workers.clone(), &config);
        let mut shutdown = no_shutdown();

        // Free the pool after the unknown deadline would already have fired.
        let workers2 = workers.clone();
        let helper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1200)).await;
            workers2[0].place_at(TARGET, Duration::from_secs(3600));
        });

        let claim = selector
            .select(TARGET, DeadlinePolicy::MustComplete, &config, &mut shutdown)
            .await
            .unwrap();
        assert!(claim.is_some(), "must-complete selection never gives up");
        helper.await.unwrap();
    }
}
