//! Crash-detecting mutual exclusion for named operations
//!
//! Each lock has two flags:
//! - an in-process flag, set while a call is running in this process
//! - a persisted flag in the [`DurableStore`], set for the same span
//!
//! The in-process flag is set only together with the persisted one, so
//! finding the persisted flag with no in-process holder means an earlier
//! process started the operation and never finished it. That case is
//! reported as [`LockError::InterruptedPreviously`], distinct from plain
//! contention ([`LockError::InProgress`]), because the interrupted call's
//! partial effects are unknown and the caller has to recover.
//!
//! A persisted flag this process failed to clear on release is remembered
//! as its own, so it is not mistaken for a crash on the next call.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;

use crate::error::Error;
use crate::store::DurableStore;

/// Value written under a lock's key while it is held
const LOCKED: &str = "locked";

/// Attempts at clearing the persisted flag on release
const RELEASE_ATTEMPTS: usize = 3;

/// Failure of a [`LockManager::run_exclusive`] call
#[derive(Debug, Error)]
pub enum LockError<E> {
    /// Another call holding this lock is running in this process
    #[error("lock {lock} is held by a call in progress")]
    InProgress { lock: String },

    /// The persisted flag was left behind by a call that never finished
    #[error("lock {lock} was left held by an interrupted call")]
    InterruptedPreviously { lock: String },

    /// The persisted flag could not be written; the operation did not run
    #[error("failed to persist lock {lock}: {source}")]
    Storage {
        lock: String,
        #[source]
        source: Error,
    },

    /// The operation ran and failed
    #[error(transparent)]
    Operation(E),
}

impl<E> LockError<E> {
    /// True for the two outcomes where the operation never ran
    pub fn is_lock_failure(&self) -> bool {
        !matches!(self, LockError::Operation(_))
    }
}

#[derive(Default)]
struct Flags {
    /// Locks held by a call running in this process
    running: HashSet<String>,
    /// Released locks whose persisted flag could not be cleared
    unreleased: HashSet<String>,
}

/// Registry of named two-tier locks over one durable store
pub struct LockManager {
    store: Arc<DurableStore>,
    flags: Mutex<Flags>,
}

impl LockManager {
    pub fn new(store: Arc<DurableStore>) -> Self {
        Self {
            store,
            flags: Mutex::new(Flags::default()),
        }
    }

    fn flags(&self) -> MutexGuard<'_, Flags> {
        self.flags.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `op` while holding the lock `name`
    ///
    /// Lock failures return before `op` is called and leave the store
    /// untouched. Once `op` has started, both flags are cleared when it
    /// finishes, whichever way it finishes, and also if the returned
    /// future is dropped mid-flight.
    ///
    /// Progress the operation reports through its own channels is not
    /// intercepted.
    pub async fn run_exclusive<T, E, F, Fut>(&self, name: &str, op: F) -> Result<T, LockError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let guard = self.acquire(name)?;
        tracing::debug!(lock = name, "Lock acquired");

        let result = op().await;

        drop(guard);
        result.map_err(LockError::Operation)
    }

    fn acquire<E>(&self, name: &str) -> Result<HeldLock<'_>, LockError<E>> {
        let mut flags = self.flags();

        if flags.running.contains(name) {
            return Err(LockError::InProgress {
                lock: name.to_string(),
            });
        }

        if self.store.contains(name) && !flags.unreleased.contains(name) {
            return Err(LockError::InterruptedPreviously {
                lock: name.to_string(),
            });
        }

        self.store
            .put(name, &LOCKED)
            .map_err(|source| LockError::Storage {
                lock: name.to_string(),
                source,
            })?;
        flags.unreleased.remove(name);
        flags.running.insert(name.to_string());

        Ok(HeldLock {
            manager: self,
            name: name.to_string(),
        })
    }

    /// Whether a call holding `name` is running in this process
    pub fn is_held_in_process(&self, name: &str) -> bool {
        self.flags().running.contains(name)
    }

    /// Whether the persisted flag for `name` is set
    pub fn is_held_persisted(&self, name: &str) -> bool {
        self.store.contains(name)
    }

    /// Whether the persisted flag for `name` was left by an interrupted call
    ///
    /// A flag this process set and failed to clear does not count.
    pub fn is_stale(&self, name: &str) -> bool {
        let flags = self.flags();
        !flags.running.contains(name)
            && !flags.unreleased.contains(name)
            && self.store.contains(name)
    }

    /// Clear a persisted flag left behind by an interrupted call
    ///
    /// Does nothing while a call in this process holds the lock. Returns
    /// whether a stale flag was removed.
    pub fn clear_stale(&self, name: &str) -> crate::error::Result<bool> {
        let mut flags = self.flags();
        if flags.running.contains(name) || !self.store.contains(name) {
            return Ok(false);
        }
        self.store.remove(name)?;
        flags.unreleased.remove(name);
        tracing::info!(lock = name, "Cleared stale lock");
        Ok(true)
    }
}

/// Releases both flags on drop
struct HeldLock<'a> {
    manager: &'a LockManager,
    name: String,
}

impl Drop for HeldLock<'_> {
    fn drop(&mut self) {
        let mut flags = self.manager.flags();
        // Persisted flag first, so the in-process flag never outlives it
        let mut cleared = false;
        for attempt in 1..=RELEASE_ATTEMPTS {
            match self.manager.store.remove(&self.name) {
                Ok(()) => {
                    cleared = true;
                    break;
                }
                Err(e) => tracing::warn!(
                    lock = %self.name,
                    attempt,
                    error = %e,
                    "Failed to clear persisted lock"
                ),
            }
        }
        if !cleared {
            flags.unreleased.insert(self.name.clone());
        }
        flags.running.remove(&self.name);
        tracing::debug!(lock = %self.name, cleared, "Lock released");
    }
}
