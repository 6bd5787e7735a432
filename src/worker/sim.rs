//! Simulated field protocol
//!
//! Stands in for the real protocol/session layer behind [`VisitHandler`]:
//! every visit sleeps a random latency and then rolls success, failure, or a
//! verification challenge from a seeded RNG. Deterministic when given a
//! seed, which is how the integration tests drive the dispatcher end to end.

use async_trait::async_trait;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use super::{VisitError, VisitHandler, VisitOutcome};
use crate::config::SimConfig;
use crate::geo::Point;

enum Roll {
    Success { seen: u32, sighting_ids: Vec<u64> },
    Empty,
    Timeout,
    Challenge,
}

/// Seeded simulation of the field protocol.
pub struct FieldSimulator {
    min_latency: Duration,
    max_latency: Duration,
    success_rate: f64,
    challenge_rate: f64,
    max_seen: u32,
    rng: Mutex<ChaCha8Rng>,
}

impl FieldSimulator {
    pub fn new(config: &SimConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        Self {
            min_latency: Duration::from_millis(config.min_latency_ms),
            max_latency: Duration::from_millis(config.max_latency_ms),
            success_rate: config.success_rate,
            challenge_rate: config.challenge_rate,
            max_seen: config.max_seen,
            rng: Mutex::new(rng),
        }
    }

    /// All randomness happens here, under the lock, before any await.
    fn roll(&self) -> (Duration, Roll) {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);

        let latency = rng.gen_range(self.min_latency..=self.max_latency);

        if rng.gen_bool(self.challenge_rate) {
            return (latency, Roll::Challenge);
        }
        if !rng.gen_bool(self.success_rate) {
            let roll = if rng.gen_bool(0.5) {
                Roll::Timeout
            } else {
                Roll::Empty
            };
            return (latency, roll);
        }

        let seen = if self.max_seen == 0 {
            0
        } else {
            rng.gen_range(0..=self.max_seen)
        };
        let sighting_ids = (0..seen).map(|_| rng.gen::<u64>()).collect();
        (latency, Roll::Success { seen, sighting_ids })
    }

    async fn perform(&self, _point: Point) -> Result<VisitOutcome, VisitError> {
        let (latency, roll) = self.roll();
        tokio::time::sleep(latency).await;

        match roll {
            Roll::Success { seen, sighting_ids } => Ok(VisitOutcome {
                success: true,
                seen,
                sighting_ids,
            }),
            Roll::Empty => Ok(VisitOutcome::default()),
            Roll::Timeout => Err(VisitError::Timeout(latency)),
            Roll::Challenge => Err(VisitError::ChallengeRequired),
        }
    }
}

#[async_trait]
impl VisitHandler for FieldSimulator {
    async fn visit(&self, _worker_index: usize, point: Point) -> Result<VisitOutcome, VisitError> {
        self.perform(point).await
    }

    async fn bootstrap_visit(
        &self,
        _worker_index: usize,
        point: Point,
    ) -> Result<VisitOutcome, VisitError> {
        self.perform(point).await
    }
}
