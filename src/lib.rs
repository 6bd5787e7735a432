//! patrol - Field-agent dispatch simulator
//!
//! A real-time scheduler coordinating a fixed pool of simulated field
//! workers that must visit geographic spawn points at precise times, under
//! a global concurrency ceiling and a rotating pool of credentials.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration management and settings
//! - [`dispatch`] - The dispatch loop, admission gate, worker selector, and
//!   bootstrap procedure
//! - [`worker`] - Worker pool, busy locks, and the visit-handler boundary
//! - [`accounts`] - Account queues, registry, and credential rotation
//! - [`spawns`] - Spawn data, hour-phase timing, and snapshots
//! - [`store`] - Sighting store boundary
//! - [`stats`] - Operational status sampling
//! - [`geo`] - Geographic primitives and coverage grids
//!
//! # Example
//!
//! ```no_run
//! use patrol::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env();
//!     config.validate()?;
//!     // wire up the queues, workers, and dispatcher; see src/main.rs
//!     Ok(())
//! }
//! ```

pub mod accounts;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod geo;
pub mod spawns;
pub mod stats;
pub mod store;
pub mod worker;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::accounts::{Account, AccountQueue, AccountRegistry, CredentialRotator};
    pub use crate::config::Config;
    pub use crate::dispatch::{DispatchHandle, DispatchState, Dispatcher, LaunchOptions};
    pub use crate::error::{Error, ErrorCategory, Result};
    pub use crate::geo::{Bounds, Point};
    pub use crate::spawns::{SpawnEvent, SpawnSource};
    pub use crate::store::{MemorySightingStore, SightingStore};
    pub use crate::worker::{FieldSimulator, VisitHandler, Worker};
}

// Direct re-exports for convenience
pub use config::Config;
pub use dispatch::{Dispatcher, LaunchOptions};
pub use error::{Error, Result};
