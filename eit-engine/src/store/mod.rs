//! Versioned channel and schedule stores.
//!
//! Both stores sit behind a [`StateLock`]: a read/write lock whose writers
//! give up after a bounded wait. A writer reports through
//! [`StateWriteGuard::release`] whether it changed anything, which bumps the
//! store version so observers can tell stale snapshots apart.

pub mod channels;
pub mod schedules;

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

pub use channels::{Channel, ChannelId, Channels};
pub use schedules::{Component, Event, Schedule, Schedules};

/// Store-related errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Write lock could not be acquired in time.
    #[error("Timed out after {0:?} waiting for the {1} write lock")]
    Timeout(Duration, &'static str),
}

/// A lockable store with a modification version.
pub struct StateLock<T> {
    name: &'static str,
    inner: RwLock<T>,
    version: AtomicU64,
}

impl<T> StateLock<T> {
    /// Create a new lock around `value`.
    pub fn new(name: &'static str, value: T) -> Self {
        Self {
            name,
            inner: RwLock::new(value),
            version: AtomicU64::new(0),
        }
    }

    /// Number of modifying write cycles so far.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Acquire a shared read lock.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.inner.read()
    }

    /// Acquire the write lock, waiting at most `timeout`.
    pub fn write(&self, timeout: Duration) -> Result<StateWriteGuard<'_, T>, StoreError> {
        let guard = self
            .inner
            .try_write_for(timeout)
            .ok_or(StoreError::Timeout(timeout, self.name))?;
        Ok(StateWriteGuard {
            guard,
            version: &self.version,
        })
    }
}

/// Exclusive access to a store.
///
/// Dropping the guard without calling [`release`](Self::release) counts as
/// an unmodified write cycle.
pub struct StateWriteGuard<'a, T> {
    guard: RwLockWriteGuard<'a, T>,
    version: &'a AtomicU64,
}

impl<'a, T> StateWriteGuard<'a, T> {
    /// Release the lock, recording whether the store was modified.
    pub fn release(self, modified: bool) {
        if modified {
            self.version.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl<'a, T> Deref for StateWriteGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<'a, T> DerefMut for StateWriteGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
