//! Spawn data management
//!
//! Spawn events repeat on an hour cycle: each event carries an offset in
//! seconds within the hour phase and its absolute time is recomputed every
//! cycle as `hour_phase + offset`. Points whose timing is unknown are held
//! separately as mysteries and retried opportunistically.
//!
//! The persistent storage behind the data is an external collaborator,
//! reached through the blocking [`SpawnRepository`] trait; loads are
//! offloaded to the blocking pool so they never stall the dispatch loop. A
//! JSON snapshot of the last successful load is kept on disk, written
//! atomically, and can serve as the first load on a warm start.

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::geo::Point;

/// Spawn data errors
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("spawn load failed: {reason}")]
    Load { reason: String },

    #[error("failed to read spawn data {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode spawn data")]
    Decode(#[from] serde_json::Error),

    #[error("failed to write spawn snapshot {path}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// ============================================================================
// Time helpers
// ============================================================================

/// Wall-clock time as fractional seconds since the epoch.
pub fn epoch_secs() -> f64 {
    let now = chrono::Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_millis()) / 1000.0
}

/// Start of the hour phase containing `now`.
pub fn hour_phase(now: f64) -> f64 {
    (now / 3600.0).floor() * 3600.0
}

/// Seconds elapsed within the current hour phase.
pub fn time_of_hour(now: f64) -> f64 {
    now - hour_phase(now)
}

// ============================================================================
// Spawn data
// ============================================================================

/// An event expected to occur at a known offset within the hour cycle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpawnEvent {
    pub id: u64,
    pub point: Point,

    /// Seconds after the start of the hour phase at which the event is due.
    pub offset_secs: u32,
}

impl SpawnEvent {
    /// Absolute time of this event within the given hour phase.
    pub fn absolute_time(&self, hour: f64) -> f64 {
        hour + f64::from(self.offset_secs)
    }
}

/// One load of spawn data: timed events plus mystery points.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpawnSet {
    pub known: Vec<SpawnEvent>,
    pub mysteries: Vec<Point>,
}

impl SpawnSet {
    /// Sort events by offset and drop duplicate mystery coordinates.
    fn normalize(&mut self) {
        self.known.sort_by_key(|e| e.offset_secs);

        let mut seen = HashSet::new();
        self.mysteries.retain(|p| seen.insert(p.key()));
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }
}

/// Blocking storage boundary producing spawn data.
pub trait SpawnRepository: Send + Sync {
    fn load(&self) -> Result<SpawnSet, SpawnError>;
}

/// Repository backed by a JSON spawn database file.
pub struct FileSpawnRepository {
    path: PathBuf,
}

impl FileSpawnRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SpawnRepository for FileSpawnRepository {
    fn load(&self) -> Result<SpawnSet, SpawnError> {
        let bytes = std::fs::read(&self.path).map_err(|source| SpawnError::Read {
            path: self.path.clone(),
            source,
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

// ============================================================================
// Spawn source
// ============================================================================

/// Owns the current spawn data and its on-disk snapshot.
pub struct SpawnSource {
    repo: Arc<dyn SpawnRepository>,
    snapshot_path: PathBuf,
    set: SpawnSet,
}

impl SpawnSource {
    pub fn new(repo: Arc<dyn SpawnRepository>, snapshot_path: impl Into<PathBuf>) -> Self {
        Self {
            repo,
            snapshot_path: snapshot_path.into(),
            set: SpawnSet::default(),
        }
    }

    /// Reload spawn data.
    ///
    /// With `load_snapshot`, a non-empty on-disk snapshot is accepted as-is;
    /// otherwise the repository is consulted on the blocking pool and the
    /// snapshot rewritten. A failed snapshot rewrite is logged, not fatal:
    /// the fresh data is already in memory.
    pub async fn refresh(&mut self, load_snapshot: bool) -> Result<(), SpawnError> {
        if load_snapshot {
            match self.read_snapshot().await {
                Ok(Some(set)) if !set.known.is_empty() || !set.mysteries.is_empty() => {
                    tracing::info!(
                        known = set.known.len(),
                        mysteries = set.mysteries.len(),
                        "loaded spawns from snapshot"
                    );
                    self.set = set;
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("ignoring unreadable spawn snapshot: {e}"),
            }
        }

        let repo = self.repo.clone();
        let mut set = tokio::task::spawn_blocking(move || repo.load())
            .await
            .map_err(|e| SpawnError::Load {
                reason: format!("load task failed: {e}"),
            })??;
        set.normalize();

        tracing::info!(
            known = set.known.len(),
            mysteries = set.mysteries.len(),
            "refreshed spawn data"
        );
        self.set = set;

        if let Err(e) = self.write_snapshot().await {
            tracing::warn!("spawn snapshot write failed: {e}");
        }
        Ok(())
    }

    /// Timed events ordered by hour offset.
    pub fn events(&self) -> &[SpawnEvent] {
        &self.set.known
    }

    /// Number of known timed events.
    pub fn len(&self) -> usize {
        self.set.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.known.is_empty()
    }

    pub fn mystery_count(&self) -> usize {
        self.set.mysteries.len()
    }

    /// Fresh shuffled backlog of every known mystery point.
    pub fn mystery_backlog(&self) -> VecDeque<Point> {
        let mut points = self.set.mysteries.clone();
        points.shuffle(&mut rand::thread_rng());
        points.into()
    }

    /// Whether the current time-of-hour is past the last event's offset,
    /// i.e. the hour phase has effectively rolled over for this data.
    pub fn past_last_event(&self, now: f64) -> bool {
        match self.set.known.last() {
            Some(last) => time_of_hour(now) > f64::from(last.offset_secs),
            None => false,
        }
    }

    /// Write the current data to the snapshot atomically.
    pub async fn write_snapshot(&self) -> Result<(), SpawnError> {
        let set = self.set.clone();
        let path = self.snapshot_path.clone();
        tokio::task::spawn_blocking(move || write_snapshot_blocking(&path, &set))
            .await
            .map_err(|e| SpawnError::Load {
                reason: format!("snapshot task failed: {e}"),
            })?
    }

    async fn read_snapshot(&self) -> Result<Option<SpawnSet>, SpawnError> {
        match tokio::fs::read(&self.snapshot_path).await {
            Ok(bytes) => {
                let mut set: SpawnSet = serde_json::from_slice(&bytes)?;
                set.normalize();
                Ok(Some(set))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(SpawnError::Read {
                path: self.snapshot_path.clone(),
                source,
            }),
        }
    }
}

fn write_snapshot_blocking(path: &Path, set: &SpawnSet) -> Result<(), SpawnError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|source| SpawnError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
    }

    let json = serde_json::to_vec_pretty(set)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).map_err(|source| SpawnError::Write {
        path: tmp.clone(),
        source,
    })?;
    std::fs::rename(&tmp, path).map_err(|source| SpawnError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
