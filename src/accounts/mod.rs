//! Account pool management
//!
//! Accounts flow between three places: the *available* queue (ready to be
//! handed to a worker), the *needs-verification* queue (waiting for an
//! operator to resolve a challenge), and the workers themselves. The
//! [`AccountRegistry`] keeps the authoritative record of every account's
//! latest flags so the whole set can be snapshotted on shutdown and reloaded
//! on the next cold start.

pub mod rotation;

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;

pub use rotation::CredentialRotator;

/// Account pool errors
#[derive(Debug, Error)]
pub enum AccountError {
    #[error("failed to read account roster {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse account roster {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to decode account snapshot")]
    Decode(#[from] serde_json::Error),

    #[error("failed to write account snapshot {path}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("account roster is empty")]
    EmptyRoster,
}

// ============================================================================
// Account
// ============================================================================

/// A login credential for the field protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub username: String,
    pub password: String,

    /// Permanently unusable; excluded from the pool at load time.
    #[serde(default)]
    pub banned: bool,

    /// Requires a challenge to be resolved before reuse.
    #[serde(default)]
    pub needs_verification: bool,
}

impl Account {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            banned: false,
            needs_verification: false,
        }
    }
}

// ============================================================================
// Account queue
// ============================================================================

/// FIFO account queue with a watchable length.
///
/// `pop` blocks until an account is available; `wait_until_below` blocks
/// until the queue has drained to the threshold and reports how long the
/// caller waited. Both are built on a watch channel carrying the current
/// length, so waiters wake exactly when the length changes.
pub struct AccountQueue {
    name: &'static str,
    inner: Mutex<VecDeque<Account>>,
    len_tx: watch::Sender<usize>,
}

impl AccountQueue {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Mutex::new(VecDeque::new()),
            len_tx: watch::channel(0).0,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Account>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an account to the back of the queue.
    pub fn push(&self, account: Account) {
        let mut queue = self.lock();
        queue.push_back(account);
        let len = queue.len();
        drop(queue);
        self.len_tx.send_replace(len);
    }

    /// Take the account at the front of the queue, if any.
    pub fn try_pop(&self) -> Option<Account> {
        let mut queue = self.lock();
        let account = queue.pop_front();
        let len = queue.len();
        drop(queue);
        if account.is_some() {
            self.len_tx.send_replace(len);
        }
        account
    }

    /// Take the account at the front of the queue, waiting for one to arrive.
    pub async fn pop(&self) -> Account {
        let mut len_rx = self.len_tx.subscribe();
        loop {
            if let Some(account) = self.try_pop() {
                return account;
            }
            // The sender lives in self, so the channel cannot close here.
            let _ = len_rx.wait_for(|len| *len > 0).await;
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Block until the queue length is at or below `threshold`; returns the
    /// time spent waiting.
    pub async fn wait_until_below(&self, threshold: usize) -> Duration {
        let started = Instant::now();
        let mut len_rx = self.len_tx.subscribe();
        let _ = len_rx.wait_for(|len| *len <= threshold).await;
        started.elapsed()
    }

    /// Remove and return every queued account.
    pub fn drain_all(&self) -> Vec<Account> {
        let mut queue = self.lock();
        let accounts: Vec<Account> = queue.drain(..).collect();
        drop(queue);
        self.len_tx.send_replace(0);
        accounts
    }
}

// ============================================================================
// Account registry
// ============================================================================

/// Authoritative record of every account's latest flags.
///
/// Queues and workers hold copies of accounts; the registry is updated on
/// every state transition (load, swap, challenge, ban) so the shutdown
/// snapshot reflects reality regardless of where each account currently
/// lives.
#[derive(Default)]
pub struct AccountRegistry {
    accounts: Mutex<HashMap<String, Account>>,
}

impl AccountRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Account>> {
        self.accounts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the latest state of an account.
    pub fn record(&self, account: &Account) {
        self.lock()
            .insert(account.username.clone(), account.clone());
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// All known accounts, ordered by username for stable snapshots.
    pub fn all(&self) -> Vec<Account> {
        let mut accounts: Vec<Account> = self.lock().values().cloned().collect();
        accounts.sort_by(|a, b| a.username.cmp(&b.username));
        accounts
    }

    /// Serialize the account set to `path` atomically (temp file + rename).
    pub fn snapshot_to(&self, path: &Path) -> Result<(), AccountError> {
        let accounts = self.all();
        let json = serde_json::to_vec_pretty(&accounts)?;

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|source| AccountError::Write {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, path).map_err(|source| AccountError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }
}

// ============================================================================
// Roster loading
// ============================================================================

#[derive(Debug, Deserialize)]
struct RosterFile {
    #[serde(default)]
    accounts: Vec<Account>,
}

/// Load the account set: the shutdown snapshot if one exists (and is
/// wanted), otherwise the operator-maintained TOML roster.
pub fn load_accounts(
    roster_path: &Path,
    snapshot_path: &Path,
    use_snapshot: bool,
) -> Result<Vec<Account>, AccountError> {
    if use_snapshot && snapshot_path.exists() {
        let bytes = std::fs::read(snapshot_path).map_err(|source| AccountError::Read {
            path: snapshot_path.to_path_buf(),
            source,
        })?;
        let accounts: Vec<Account> = serde_json::from_slice(&bytes)?;
        if !accounts.is_empty() {
            tracing::info!(
                count = accounts.len(),
                path = %snapshot_path.display(),
                "loaded accounts from snapshot"
            );
            return Ok(accounts);
        }
    }

    let content = std::fs::read_to_string(roster_path).map_err(|source| AccountError::Read {
        path: roster_path.to_path_buf(),
        source,
    })?;
    let roster: RosterFile = toml::from_str(&content).map_err(|source| AccountError::Parse {
        path: roster_path.to_path_buf(),
        source,
    })?;

    if roster.accounts.is_empty() {
        return Err(AccountError::EmptyRoster);
    }
    Ok(roster.accounts)
}

/// Distribute loaded accounts into the pool queues.
///
/// Banned accounts are retired (registry only), challenge-flagged accounts
/// go to the verification queue, everything else to the available queue.
/// Returns (available, verification, retired) counts.
pub fn partition_accounts(
    accounts: Vec<Account>,
    registry: &AccountRegistry,
    available: &AccountQueue,
    verification: &AccountQueue,
) -> (usize, usize, usize) {
    let (mut ok, mut pending, mut retired) = (0, 0, 0);
    for account in accounts {
        registry.record(&account);
        if account.banned {
            retired += 1;
        } else if account.needs_verification {
            pending += 1;
            verification.push(account);
        } else {
            ok += 1;
            available.push(account);
        }
    }
    (ok, pending, retired)
}

// ============================================================================
// Tests
// ============================================================================
