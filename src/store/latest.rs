//! Latest-value store with multi-waiter change notification
//!
//! Holds at most one value and a version counter under a single mutex. Every `set`
//! bumps the version and wakes all waiters; a waiter compares versions under the same
//! lock, so no pulse is lost between checking and blocking, and a waiter that waits
//! again blocks until the next change rather than observing the same one twice.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug)]
struct Slot<T> {
    value: Option<T>,
    version: u64,
}

/// Thread-safe holder of the most recently received value
///
/// Shared by reference counting between the subscriber callback that feeds it and any
/// number of readers (streaming clients, the periodic aggregator).
#[derive(Debug)]
pub struct LatestValueStore<T> {
    slot: Mutex<Slot<T>>,
    changed: Condvar,
}

impl<T: Clone> LatestValueStore<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                value: None,
                version: 0,
            }),
            changed: Condvar::new(),
        }
    }

    /// Replace the held value and release every currently waiting reader
    pub fn set(&self, value: T) {
        let mut slot = self.lock();
        slot.value = Some(value);
        slot.version = slot.version.wrapping_add(1);
        drop(slot);
        self.changed.notify_all();
    }

    /// Clone of the held value
    pub fn latest(&self) -> Option<T> {
        self.lock().value.clone()
    }

    /// Current version together with the held value
    pub fn snapshot(&self) -> (u64, Option<T>) {
        let slot = self.lock();
        (slot.version, slot.value.clone())
    }

    /// Current version; 0 until the first `set`
    pub fn version(&self) -> u64 {
        self.lock().version
    }

    /// Block until the next change or until `timeout` elapses
    ///
    /// Returns `true` if a change occurred.
    pub fn wait_for_change(&self, timeout: Duration) -> bool {
        let slot = self.lock();
        let seen = slot.version;
        self.wait_past(slot, seen, timeout).is_some()
    }

    /// Block until the version moves past `seen` or until `timeout` elapses
    ///
    /// Returns immediately if a change already happened after `seen` was observed,
    /// which lets a looping reader never miss a pulse between two waits. Returns the
    /// new version, or `None` on timeout.
    pub fn wait_for_change_since(&self, seen: u64, timeout: Duration) -> Option<u64> {
        let slot = self.lock();
        self.wait_past(slot, seen, timeout).map(|slot| slot.version)
    }

    /// Like `wait_for_change_since`, but also returns the value held at the new version
    ///
    /// Version and value are read under the same lock, so a reader that keeps passing
    /// the returned version back in receives each stored value at most once.
    pub fn wait_for_value_since(&self, seen: u64, timeout: Duration) -> Option<(u64, Option<T>)> {
        let slot = self.lock();
        self.wait_past(slot, seen, timeout)
            .map(|slot| (slot.version, slot.value.clone()))
    }

    fn wait_past<'a>(
        &'a self,
        slot: MutexGuard<'a, Slot<T>>,
        seen: u64,
        timeout: Duration,
    ) -> Option<MutexGuard<'a, Slot<T>>> {
        let (slot, result) = match self
            .changed
            .wait_timeout_while(slot, timeout, |slot| slot.version == seen)
        {
            Ok(pair) => pair,
            Err(poisoned) => poisoned.into_inner(),
        };
        if result.timed_out() && slot.version == seen {
            None
        } else {
            Some(slot)
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        match self.slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<T: Clone> Default for LatestValueStore<T> {
    fn default() -> Self {
        Self::new()
    }
}
