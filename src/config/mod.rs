//! Configuration management for the patrol dispatcher
//!
//! Configuration is loaded from a TOML file or from environment variables
//! (with the `PATROL_` prefix for the commonly tuned values), validated once
//! at startup, and then passed by reference into the components that need it.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::geo::Bounds;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value for {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Dispatch loop configuration
    pub dispatch: DispatchConfig,

    /// Credential rotation configuration
    pub rotation: RotationConfig,

    /// Scan area and worker grid configuration
    pub area: AreaConfig,

    /// Bootstrap procedure configuration
    pub bootstrap: BootstrapConfig,

    /// File locations
    pub paths: PathsConfig,

    /// Field simulation configuration
    pub sim: SimConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Dispatch loop tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Maximum number of concurrent visit tasks (admission gate size)
    pub concurrency_limit: usize,

    /// Hard ceiling on the travel speed a worker may be asked for, in km/h
    pub speed_ceiling: f64,

    /// Stop scanning for a better worker once one is found below this
    /// travel speed, in km/h (None scans the whole pool every pass)
    pub good_enough: Option<f64>,

    /// How long to keep looking for a worker for an event with a known
    /// spawn time, in seconds
    pub give_up_known_secs: u64,

    /// How long to keep looking for a worker for a point with unknown
    /// timing, in seconds
    pub give_up_unknown_secs: u64,

    /// Events older than this many seconds are skipped outright
    pub skip_threshold_secs: u64,

    /// Pause dispatching when the needs-verification queue grows past this
    pub verification_ceiling: usize,

    /// Worker selector rescan interval, in milliseconds
    ///
    /// Trades dispatch latency against scan overhead: shorter intervals
    /// claim freed workers sooner but rescan the pool more often.
    pub poll_interval_ms: u64,

    /// How often the mystery backlog may be refilled from the spawn source,
    /// in seconds
    pub mystery_rescan_secs: u64,

    /// Spawn data refresh retry backoff, in seconds
    pub refresh_backoff_secs: u64,

    /// How long shutdown waits for in-flight visit tasks, in seconds
    pub drain_timeout_secs: u64,
}

/// Credential rotation tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    /// Interval between underperformer swap checks, in seconds
    pub swap_worst_interval_secs: u64,

    /// Interval between stale-session swap checks, in seconds
    pub swap_oldest_interval_secs: u64,

    /// Minimum session age before a proactive swap, in minutes
    pub minimum_runtime_mins: u64,
}

/// Scan area and worker grid
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AreaConfig {
    pub lat_start: f64,
    pub lon_start: f64,
    pub lat_end: f64,
    pub lon_end: f64,

    /// Worker grid rows (pool size = rows * cols)
    pub grid_rows: usize,

    /// Worker grid columns
    pub grid_cols: usize,

    /// Sight radius used to build the bootstrap coverage grid, in meters
    pub bootstrap_radius_m: f64,

    /// Coordinate randomization amount, in degrees (~0.0003 is 47 m)
    pub jitter: f64,
}

/// Bootstrap procedure tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    /// Delay between phase-one task launches, in milliseconds
    ///
    /// Staggers worker logins so a full pool does not authenticate at once.
    pub stagger_ms: u64,

    /// Settle time between phase one and phase two, in seconds
    pub settle_secs: u64,
}

/// File locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory for serialized snapshots
    pub data_dir: PathBuf,

    /// Spawn database file (JSON)
    pub spawn_db: PathBuf,

    /// Account roster file (TOML)
    pub accounts_file: PathBuf,
}

/// Field simulation tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Minimum simulated visit latency, in milliseconds
    pub min_latency_ms: u64,

    /// Maximum simulated visit latency, in milliseconds
    pub max_latency_ms: u64,

    /// Probability that a visit succeeds
    pub success_rate: f64,

    /// Probability that a visit triggers a verification challenge
    pub challenge_rate: f64,

    /// Maximum sightings reported per successful visit
    pub max_seen: u32,

    /// RNG seed for reproducible runs (random when absent)
    pub seed: Option<u64>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Build configuration from environment variables over the defaults
    pub fn from_env() -> Self {
        fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
            std::env::var(name).ok().and_then(|v| v.parse().ok())
        }

        let mut config = Self::default();

        if let Some(v) = env_parse("PATROL_CONCURRENCY_LIMIT") {
            config.dispatch.concurrency_limit = v;
        }
        if let Some(v) = env_parse("PATROL_SPEED_CEILING") {
            config.dispatch.speed_ceiling = v;
        }
        if let Some(v) = env_parse("PATROL_SKIP_THRESHOLD") {
            config.dispatch.skip_threshold_secs = v;
        }
        if let Some(v) = env_parse("PATROL_VERIFICATION_CEILING") {
            config.dispatch.verification_ceiling = v;
        }
        if let Some(v) = env_parse("PATROL_POLL_INTERVAL_MS") {
            config.dispatch.poll_interval_ms = v;
        }
        if let Some(v) = env_parse("PATROL_GRID_ROWS") {
            config.area.grid_rows = v;
        }
        if let Some(v) = env_parse("PATROL_GRID_COLS") {
            config.area.grid_cols = v;
        }
        if let Ok(v) = std::env::var("PATROL_DATA_DIR") {
            config.paths.data_dir = v.into();
        }
        if let Ok(v) = std::env::var("PATROL_LOG_LEVEL") {
            config.logging.level = v;
        }

        config
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dispatch.concurrency_limit == 0 {
            return Err(ConfigError::Invalid {
                field: "dispatch.concurrency_limit",
                reason: "must be greater than 0",
            });
        }
        if self.dispatch.speed_ceiling <= 0.0 {
            return Err(ConfigError::Invalid {
                field: "dispatch.speed_ceiling",
                reason: "must be positive",
            });
        }
        if self.dispatch.skip_threshold_secs < 5 {
            return Err(ConfigError::Invalid {
                field: "dispatch.skip_threshold_secs",
                reason: "must be at least the 5 second redundancy grace",
            });
        }
        if self.area.grid_rows == 0 || self.area.grid_cols == 0 {
            return Err(ConfigError::Invalid {
                field: "area.grid_rows/grid_cols",
                reason: "worker grid must be non-empty",
            });
        }
        if self.area.lat_start >= self.area.lat_end || self.area.lon_start >= self.area.lon_end {
            return Err(ConfigError::Invalid {
                field: "area",
                reason: "start coordinates must be south-west of end coordinates",
            });
        }
        if self.area.bootstrap_radius_m <= 0.0 {
            return Err(ConfigError::Invalid {
                field: "area.bootstrap_radius_m",
                reason: "must be positive",
            });
        }
        if !(0.0..=1.0).contains(&self.sim.success_rate) {
            return Err(ConfigError::Invalid {
                field: "sim.success_rate",
                reason: "must be within 0.0..=1.0",
            });
        }
        if !(0.0..=1.0).contains(&self.sim.challenge_rate) {
            return Err(ConfigError::Invalid {
                field: "sim.challenge_rate",
                reason: "must be within 0.0..=1.0",
            });
        }
        if self.sim.min_latency_ms > self.sim.max_latency_ms {
            return Err(ConfigError::Invalid {
                field: "sim.min_latency_ms",
                reason: "must not exceed sim.max_latency_ms",
            });
        }
        Ok(())
    }
}

impl AreaConfig {
    pub fn bounds(&self) -> Bounds {
        Bounds::new(self.lat_start, self.lon_start, self.lat_end, self.lon_end)
    }

    /// Worker pool size implied by the grid.
    pub fn pool_size(&self) -> usize {
        self.grid_rows * self.grid_cols
    }
}

impl DispatchConfig {
    pub fn give_up_known(&self) -> Duration {
        Duration::from_secs(self.give_up_known_secs)
    }

    pub fn give_up_unknown(&self) -> Duration {
        Duration::from_secs(self.give_up_unknown_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn mystery_rescan(&self) -> Duration {
        Duration::from_secs(self.mystery_rescan_secs)
    }

    pub fn refresh_backoff(&self) -> Duration {
        Duration::from_secs(self.refresh_backoff_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

impl RotationConfig {
    pub fn swap_worst_interval(&self) -> Duration {
        Duration::from_secs(self.swap_worst_interval_secs)
    }

    pub fn swap_oldest_interval(&self) -> Duration {
        Duration::from_secs(self.swap_oldest_interval_secs)
    }

    pub fn minimum_runtime(&self) -> Duration {
        Duration::from_secs(self.minimum_runtime_mins * 60)
    }
}

impl BootstrapConfig {
    pub fn stagger(&self) -> Duration {
        Duration::from_millis(self.stagger_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_secs(self.settle_secs)
    }
}

impl PathsConfig {
    pub fn spawn_snapshot(&self) -> PathBuf {
        self.data_dir.join("spawns.json")
    }

    pub fn accounts_snapshot(&self) -> PathBuf {
        self.data_dir.join("accounts.json")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dispatch: DispatchConfig::default(),
            rotation: RotationConfig::default(),
            area: AreaConfig::default(),
            bootstrap: BootstrapConfig::default(),
            paths: PathsConfig::default(),
            sim: SimConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 100,
            speed_ceiling: 19.5,
            good_enough: Some(0.1),
            give_up_known_secs: 75,
            give_up_unknown_secs: 60,
            skip_threshold_secs: 90,
            verification_ceiling: 25,
            poll_interval_ms: 250,
            mystery_rescan_secs: 90,
            refresh_backoff_secs: 20,
            drain_timeout_secs: 40,
        }
    }
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            swap_worst_interval_secs: 300,
            swap_oldest_interval_secs: 180,
            minimum_runtime_mins: 10,
        }
    }
}

impl Default for AreaConfig {
    fn default() -> Self {
        // A ~2x2 km patch of Central Park.
        Self {
            lat_start: 40.768,
            lon_start: -73.982,
            lat_end: 40.786,
            lon_end: -73.958,
            grid_rows: 2,
            grid_cols: 2,
            bootstrap_radius_m: 120.0,
            jitter: 0.0003,
        }
    }
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            stagger_ms: 250,
            settle_secs: 5,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            spawn_db: PathBuf::from("data/spawndb.json"),
            accounts_file: PathBuf::from("accounts.toml"),
        }
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            min_latency_ms: 400,
            max_latency_ms: 2500,
            success_rate: 0.95,
            challenge_rate: 0.01,
            max_seen: 6,
            seed: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}
