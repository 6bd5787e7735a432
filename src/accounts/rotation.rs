//! Credential rotation
//!
//! Two timers run alongside the dispatch loop: one swaps the credential of
//! the worker with the lowest sightings-per-minute rate, the other rotates
//! the longest-running session once it passes a minimum age. Swaps wait on
//! the worker's busy lock, so an in-flight visit always finishes first, and
//! they never consume an admission permit — rotation is account lifecycle,
//! not a visit.
//!
//! The rotator also routes accounts reactively when a visit reports a
//! verification challenge or a ban.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{Account, AccountQueue, AccountRegistry};
use crate::config::RotationConfig;
use crate::worker::{Worker, WorkerClaim};

/// Owns the account queues and the rotation policy.
pub struct CredentialRotator {
    available: Arc<AccountQueue>,
    verification: Arc<AccountQueue>,
    registry: Arc<AccountRegistry>,
    workers: Arc<Vec<Arc<Worker>>>,
    config: RotationConfig,
    paused: Arc<AtomicBool>,
}

impl CredentialRotator {
    pub fn new(
        available: Arc<AccountQueue>,
        verification: Arc<AccountQueue>,
        registry: Arc<AccountRegistry>,
        workers: Arc<Vec<Arc<Worker>>>,
        config: RotationConfig,
        paused: Arc<AtomicBool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            available,
            verification,
            registry,
            workers,
            config,
            paused,
        })
    }

    pub fn available_len(&self) -> usize {
        self.available.len()
    }

    pub fn verification_len(&self) -> usize {
        self.verification.len()
    }

    /// Block until the verification backlog is at or below `ceiling`;
    /// returns the time spent waiting.
    pub async fn wait_until_verification_below(&self, ceiling: usize) -> Duration {
        self.verification.wait_until_below(ceiling).await
    }

    /// Start the two rotation timers. Both exit on the shutdown signal.
    pub fn spawn_timers(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        vec![
            self.clone().run_timer(
                "swap-worst",
                self.config.swap_worst_interval(),
                shutdown.clone(),
                SwapPolicy::LowestRate,
            ),
            self.clone().run_timer(
                "swap-oldest",
                self.config.swap_oldest_interval(),
                shutdown,
                SwapPolicy::OldestSession,
            ),
        ]
    }

    fn run_timer(
        self: Arc<Self>,
        name: &'static str,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
        policy: SwapPolicy,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            // First check only after a full period; there is nothing to
            // rotate right after startup.
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.consider_swap(name, policy),
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    fn consider_swap(self: &Arc<Self>, name: &'static str, policy: SwapPolicy) {
        if self.paused.load(Ordering::Acquire) || self.available.is_empty() {
            return;
        }

        let target = match policy {
            SwapPolicy::LowestRate => pick_lowest_rate(&self.workers),
            SwapPolicy::OldestSession => pick_oldest_session(&self.workers)
                .filter(|w| w.session_age() > self.config.minimum_runtime()),
        };

        if let Some(worker) = target {
            tracing::info!(
                timer = name,
                worker = worker.index(),
                rate = worker.sightings_per_minute(),
                session_secs = worker.session_age().as_secs(),
                "scheduling credential swap"
            );
            let rotator = self.clone();
            let worker = worker.clone();
            tokio::spawn(async move { rotator.swap(worker).await });
        }
    }

    /// Exchange a worker's credential for a fresh one from the pool.
    async fn swap(&self, worker: Arc<Worker>) {
        let Some(fresh) = self.available.try_pop() else {
            return;
        };

        let claim = WorkerClaim::acquire(&worker).await;
        let old = claim.swap_credential(Some(fresh));
        drop(claim);

        if let Some(old) = old {
            self.route_retired(old);
        }
    }

    /// Route a swapped-out account back into the pool by its flags.
    fn route_retired(&self, account: Account) {
        self.registry.record(&account);
        if account.banned {
            tracing::warn!(username = %account.username, "retiring banned account");
        } else if account.needs_verification {
            self.verification.push(account);
        } else {
            self.available.push(account);
        }
    }

    /// React to a visit fault that invalidates the worker's credential.
    ///
    /// Challenge: flag the account and move it to the verification queue.
    /// Ban: retire the account. Either way a replacement is pulled from the
    /// available queue when one exists.
    pub fn handle_visit_fault(&self, worker: &Worker, fault: &crate::worker::VisitError) {
        if !fault.requires_verification() && !fault.is_ban() {
            return;
        }

        let replacement = self.available.try_pop();
        let old = worker.swap_credential(replacement);

        if let Some(mut old) = old {
            if fault.is_ban() {
                old.banned = true;
            } else {
                old.needs_verification = true;
            }
            self.route_retired(old);
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum SwapPolicy {
    LowestRate,
    OldestSession,
}

/// Worker with the lowest sightings-per-minute rate.
pub fn pick_lowest_rate(workers: &[Arc<Worker>]) -> Option<&Arc<Worker>> {
    workers.iter().min_by(|a, b| {
        a.sightings_per_minute()
            .total_cmp(&b.sightings_per_minute())
    })
}

/// Worker whose current session has run the longest.
pub fn pick_oldest_session(workers: &[Arc<Worker>]) -> Option<&Arc<Worker>> {
    workers.iter().max_by_key(|w| w.session_age())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::Point;
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

    fn pool(n: usize) -> Arc<Vec<Arc<Worker>>> {
        let handler = Arc::new(NullHandler);
        let store = Arc::new(MemorySightingStore::new());
        Arc::new(
            (0..n)
                .map(|i| {
                    Worker::new(
                        i,
                        handler.clone(),
                        store.clone(),
                        Some(Account::new(format!("scout{i}"), "pw")),
                    )
                })
                .collect(),
        )
    }

    fn rotator(workers: Arc<Vec<Arc<Worker>>>) -> (Arc<CredentialRotator>, Arc<AccountQueue>, Arc<AccountQueue>) {
        let available = Arc::new(AccountQueue::new("available"));
        let verification = Arc::new(AccountQueue::new("verification"));
        let r = CredentialRotator::new(
            available.clone(),
            verification.clone(),
            Arc::new(AccountRegistry::new()),
            workers,
            RotationConfig::default(),
            Arc::new(AtomicBool::new(false)),
        );
        (r, available, verification)
    }

    #[test]
    fn test_pick_oldest_session() {
        let workers = pool(3);
        // Swap resets the session window, so refreshing 0 and 2 leaves 1
        // with the oldest session.
        workers[0].swap_credential(Some(Account::new("a", "pw")));
        workers[2].swap_credential(Some(Account::new("b", "pw")));
        std::thread::sleep(Duration::from_millis(10));

        let oldest = pick_oldest_session(&workers).unwrap();
        assert_eq!(oldest.index(), 1);
    }

    #[tokio::test]
    async fn test_swap_exchanges_credentials() {
        let workers = pool(1);
        let (rotator, available, _) = rotator(workers.clone());
        available.push(Account::new("fresh", "pw"));

        rotator.swap(workers[0].clone()).await;

        assert_eq!(workers[0].account_username().unwrap(), "fresh");
        // The old account went back to the available pool.
        assert_eq!(available.len(), 1);
        assert_eq!(available.try_pop().unwrap().username, "scout0");
    }

    #[tokio::test]
    async fn test_swap_waits_for_busy_worker() {
        let workers = pool(1);
        let (rotator, available, _) = rotator(workers.clone());
        available.push(Account::new("fresh", "pw"));

        let claim = WorkerClaim::try_acquire(&workers[0]).unwrap();
        let swap = {
            let rotator = rotator.clone();
            let worker = workers[0].clone();
            tokio::spawn(async move { rotator.swap(worker).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!swap.is_finished(), "swap must wait for the busy lock");

        drop(claim);
        swap.await.unwrap();
        assert_eq!(workers[0].account_username().unwrap(), "fresh");
    }

    #[tokio::test]
    async fn test_challenge_routes_account_to_verification() {
        let workers = pool(1);
        let (rotator, available, verification) = rotator(workers.clone());
        available.push(Account::new("fresh", "pw"));

        rotator.handle_visit_fault(&workers[0], &VisitError::ChallengeRequired);

        assert_eq!(verification.len(), 1);
        let flagged = verification.try_pop().unwrap();
        assert_eq!(flagged.username, "scout0");
        assert!(flagged.needs_verification);
        assert_eq!(workers[0].account_username().unwrap(), "fresh");
    }

    #[tokio::test]
    async fn test_ban_retires_account() {
        let workers = pool(1);
        let (rotator, _, verification) = rotator(workers.clone());

        rotator.handle_visit_fault(&workers[0], &VisitError::Banned);

        // Banned accounts go nowhere; no replacement was available.
        assert_eq!(verification.len(), 0);
        assert!(workers[0].account_username().is_none());
    }

    #[tokio::test]
    async fn test_transient_fault_keeps_account() {
        let workers = pool(1);
        let (rotator, _, verification) = rotator(workers.clone());

        rotator.handle_visit_fault(&workers[0], &VisitError::Timeout(Duration::from_secs(5)));

        assert_eq!(verification.len(), 0);
        assert_eq!(workers[0].account_username().unwrap(), "scout0");
    }
}
