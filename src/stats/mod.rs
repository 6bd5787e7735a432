//! Operational statistics
//!
//! A thin periodic sampler over the observable state: per-worker counters,
//! dispatch totals, queue depths, and the admission gate. Backpressure
//! pauses are subtracted from the running time so the reported visit rate
//! reflects time actually spent dispatching.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::accounts::AccountQueue;
use crate::dispatch::DispatchHandle;
use crate::store::SightingStore;
use crate::worker::Worker;

/// Median of an unsorted sample; 0 when empty.
fn median(mut values: Vec<f64>) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

fn min_max_med(values: Vec<f64>) -> (f64, f64, f64) {
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let med = median(values);
    if min.is_finite() {
        (min, max, med)
    } else {
        (0.0, 0.0, 0.0)
    }
}

/// Periodically samples worker counters for operational visibility.
pub struct StatsAggregator {
    handle: DispatchHandle,
    workers: Arc<Vec<Arc<Worker>>>,
    available: Arc<AccountQueue>,
    verification: Arc<AccountQueue>,
    store: Arc<dyn SightingStore>,
    grid_cols: usize,
    started: Instant,
}

impl StatsAggregator {
    pub fn new(
        handle: DispatchHandle,
        workers: Arc<Vec<Arc<Worker>>>,
        available: Arc<AccountQueue>,
        verification: Arc<AccountQueue>,
        store: Arc<dyn SightingStore>,
        grid_cols: usize,
    ) -> Self {
        Self {
            handle,
            workers,
            available,
            verification,
            store,
            grid_cols: grid_cols.max(1),
            started: Instant::now(),
        }
    }

    /// Render the current status view.
    pub fn render(&self) -> String {
        let counters = self.handle.counters();
        let snapshots: Vec<_> = self.workers.iter().map(|w| w.snapshot()).collect();

        let uptime = self.started.elapsed();
        // Backpressure pauses do not count against throughput.
        let active_secs = (uptime.as_secs_f64() - counters.idle.as_secs_f64()).max(0.1);

        let (seen_min, seen_max, seen_med) =
            min_max_med(snapshots.iter().map(|s| s.total_seen as f64).collect());
        let (visits_min, visits_max, visits_med) =
            min_max_med(snapshots.iter().map(|s| s.visits as f64).collect());
        let (delay_min, delay_max, delay_med) =
            min_max_med(snapshots.iter().map(|s| s.after_spawn).collect());
        let (speed_min, speed_max, speed_med) =
            min_max_med(snapshots.iter().map(|s| s.speed).collect());

        let mut out = String::new();
        out.push_str(&format!(
            "patrol running for {}s, state: {}{}\n",
            uptime.as_secs(),
            self.handle.state(),
            if self.handle.paused() { " (PAUSED)" } else { "" },
        ));
        out.push_str(&format!(
            "Visits: {}, per second: {:.2}\n",
            counters.visits,
            counters.visits as f64 / active_secs,
        ));
        out.push_str(&format!(
            "Skipped: {}, redundant: {}, idle: {}s\n",
            counters.skipped,
            counters.redundant,
            counters.idle.as_secs(),
        ));
        out.push_str(&format!(
            "Seen per worker: min {seen_min:.0}, max {seen_max:.0}, med {seen_med:.0}\n"
        ));
        out.push_str(&format!(
            "Visits per worker: min {visits_min:.0}, max {visits_max:.0}, med {visits_med:.0}\n"
        ));
        out.push_str(&format!(
            "Visit delay: min {delay_min:.1}, max {delay_max:.1}, med {delay_med:.1}\n"
        ));
        out.push_str(&format!(
            "Speed: min {speed_min:.1}, max {speed_max:.1}, med {speed_med:.1}\n"
        ));
        out.push_str(&format!(
            "Extra accounts: {}, needing verification: {}\n",
            self.available.len(),
            self.verification.len(),
        ));
        out.push_str(&format!(
            "Sightings: {}, mystery backlog: {}, in flight: {}/{}\n",
            self.store.approximate_count(),
            self.handle.backlog_len(),
            self.handle.in_flight(),
            self.handle.concurrency_limit(),
        ));

        // Worker glyph grid, one row per grid row.
        for row in snapshots.chunks(self.grid_cols) {
            let line: Vec<String> = row.iter().map(|s| s.glyph().to_string()).collect();
            out.push_str(&line.join(" "));
            out.push('\n');
        }

        // Status lines for workers in an error state.
        for snapshot in &snapshots {
            if snapshot.error_code.is_some() {
                out.push_str(&format!(
                    "  worker {}: {}\n",
                    snapshot.index, snapshot.status
                ));
            }
        }

        out
    }

    /// Log the status view on a fixed period until shutdown.
    pub fn spawn(self, period: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        tracing::info!("status:\n{}", self.render());
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_median_odd_and_even() {
        assert_eq!(median(vec![3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median(vec![4.0, 1.0, 2.0, 3.0]), 2.5);
        assert_eq!(median(vec![]), 0.0);
    }

    #[test]
    fn test_min_max_med_empty_pool() {
        assert_eq!(min_max_med(vec![]), (0.0, 0.0, 0.0));
    }

    #[test]
    fn test_min_max_med() {
        let (min, max, med) = min_max_med(vec![5.0, 1.0, 3.0]);
        assert_eq!(min, 1.0);
        assert_eq!(max, 5.0);
        assert_eq!(med, 3.0);
    }
}
