// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Named-mutex registry for `exclusive: true` caches. Acquiring multiple
//! names always locks them in canonical (sorted) order, regardless of the
//! order the caller asked for them in, so two callers requesting disjoint
//! sets never deadlock against each other.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{ArcMutexGuard, Mutex, RawMutex};

/// Registry of per-cache-name mutexes. Cloning shares the underlying locks.
#[derive(Clone, Default)]
pub struct CacheLockManager {
    locks: Arc<Mutex<BTreeMap<String, Arc<Mutex<()>>>>>,
}

/// Held while `names` are locked. Dropping releases every lock it holds;
/// `release` does the same thing explicitly and is safe to call more than
/// once (it just consumes `self`, so a double-release can't happen).
pub struct CacheLockGuard {
    _guards: Vec<ArcMutexGuard<RawMutex, ()>>,
}

impl CacheLockGuard {
    pub fn release(self) {}
}

impl CacheLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock();
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Acquire every name in `names`, in sorted order, blocking until all
    /// are held. The returned guard releases them on drop.
    pub fn acquire(&self, names: &[impl AsRef<str>]) -> CacheLockGuard {
        let mut sorted: Vec<&str> = names.iter().map(AsRef::as_ref).collect();
        sorted.sort_unstable();
        sorted.dedup();

        let mut guards = Vec::with_capacity(sorted.len());
        for name in sorted {
            let mutex = self.lock_for(name);
            guards.push(mutex.lock_arc());
        }
        CacheLockGuard { _guards: guards }
    }
}

#[cfg(test)]
#[path = "cache_lock_tests.rs"]
mod tests;
