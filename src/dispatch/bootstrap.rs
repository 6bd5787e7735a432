//! Cold-start bootstrap
//!
//! Before steady-state dispatch can run, every worker gets an initial
//! coverage assignment. Phase one sends each worker to the center of its
//! own grid cell, staggering task creation so the whole pool does not log
//! in at once. Phase two sweeps a hex-packed coverage grid over the area,
//! each point visited by whichever worker the selector finds — with no
//! deadline, so every point is eventually covered. Phase three gives every
//! known mystery point one visit under the same no-deadline policy.
//!
//! Faults inside any phase are logged and do not abort the bootstrap;
//! cancellation always does.

use futures::future::join_all;
use rand::seq::SliceRandom;
use std::sync::Arc;
use tokio::sync::watch;

use super::selector::DeadlinePolicy;
use super::{DispatchError, Shared};
use crate::config::{AreaConfig, BootstrapConfig};
use crate::geo::{cell_center, coverage_grid, Point};
use crate::worker::WorkerClaim;

pub(crate) struct Bootstrapper {
    shared: Arc<Shared>,
    area: AreaConfig,
    boot: BootstrapConfig,
    shutdown: watch::Receiver<bool>,
}

impl Bootstrapper {
    pub(crate) fn new(
        shared: Arc<Shared>,
        area: AreaConfig,
        boot: BootstrapConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            shared,
            area,
            boot,
            shutdown,
        }
    }

    /// Run all bootstrap phases to completion.
    pub(crate) async fn run(&self, mysteries: Vec<Point>) -> Result<(), DispatchError> {
        let mut shutdown = self.shutdown.clone();
        if *shutdown.borrow() {
            return Err(DispatchError::Cancelled);
        }

        tracing::warn!("starting bootstrap phase 1");
        self.phase_one().await?;

        tokio::select! {
            _ = tokio::time::sleep(self.boot.settle()) => {}
            _ = shutdown.changed() => return Err(DispatchError::Cancelled),
        }

        tracing::warn!("starting bootstrap phase 2");
        self.phase_two().await?;

        tracing::warn!("starting bootstrap phase 3");
        self.phase_three(mysteries).await?;

        tracing::warn!("finished bootstrapping");
        Ok(())
    }

    /// Send every worker to its own grid-cell center, staggered.
    async fn phase_one(&self) -> Result<(), DispatchError> {
        let bounds = self.area.bounds();
        let (rows, cols) = (self.area.grid_rows, self.area.grid_cols);
        let stagger = self.boot.stagger();

        let tasks = self.shared.workers.iter().enumerate().map(|(i, worker)| {
            let shared = self.shared.clone();
            let worker = worker.clone();
            let mut shutdown = self.shutdown.clone();
            let point = cell_center(&bounds, rows, cols, i);
            let delay = stagger * i as u32;

            async move {
                if *shutdown.borrow() {
                    return Err(DispatchError::Cancelled);
                }
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => return Err(DispatchError::Cancelled),
                }

                let permit = tokio::select! {
                    permit = shared.gate.admit() => permit?,
                    _ = shutdown.changed() => return Err(DispatchError::Cancelled),
                };

                let claim = WorkerClaim::acquire(&worker).await;
                tracing::info!(worker = claim.index(), point = %point, "bootstrap start point");
                match claim.bootstrap_visit(point).await {
                    Ok(true) => shared.counters.inc_visits(),
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!(worker = claim.index(), "bootstrap visit failed: {e}");
                    }
                }
                drop(permit);
                Ok(())
            }
        });

        collect_phase(join_all(tasks).await)
    }

    /// Sweep the coverage grid; every point is eventually visited.
    async fn phase_two(&self) -> Result<(), DispatchError> {
        let mut points = coverage_grid(&self.area.bounds(), self.area.bootstrap_radius_m);
        points.shuffle(&mut rand::thread_rng());
        tracing::info!(points = points.len(), "bootstrap coverage grid built");

        let tasks = points
            .into_iter()
            .map(|point| coverage_visit(self.shared.clone(), self.shutdown.clone(), point));
        collect_phase(join_all(tasks).await)
    }

    /// Give every known mystery point one visit.
    async fn phase_three(&self, mut mysteries: Vec<Point>) -> Result<(), DispatchError> {
        if mysteries.is_empty() {
            return Ok(());
        }
        mysteries.shuffle(&mut rand::thread_rng());
        tracing::info!(points = mysteries.len(), "bootstrapping mystery points");

        let tasks = mysteries
            .into_iter()
            .map(|point| coverage_visit(self.shared.clone(), self.shutdown.clone(), point));
        collect_phase(join_all(tasks).await)
    }
}

/// One permit-gated, no-deadline bootstrap visit.
async fn coverage_visit(
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
    point: Point,
) -> Result<(), DispatchError> {
    if *shutdown.borrow() {
        return Err(DispatchError::Cancelled);
    }
    let permit = tokio::select! {
        permit = shared.gate.admit() => permit?,
        _ = shutdown.changed() => return Err(DispatchError::Cancelled),
    };

    let claim = match shared
        .selector
        .select(point, DeadlinePolicy::MustComplete, &shared.config, &mut shutdown)
        .await?
    {
        Some(claim) => claim,
        // MustComplete only returns empty-handed on cancellation paths.
        None => {
            drop(permit);
            return Ok(());
        }
    };

    match claim.bootstrap_visit(point).await {
        Ok(true) => shared.counters.inc_visits(),
        Ok(false) => {}
        Err(e) => {
            tracing::warn!(worker = claim.index(), point = %point, "bootstrap visit failed: {e}");
        }
    }
    drop(permit);
    Ok(())
}

/// A phase completes only when every task has; cancellation aborts it.
fn collect_phase(results: Vec<Result<(), DispatchError>>) -> Result<(), DispatchError> {
    for result in results {
        result?;
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
