// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Keyed one-shot timers with cancel-and-replace semantics.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::AbortHandle;

struct TimerEntry {
    generation: u64,
    handle: AbortHandle,
}

struct TimerInner<K> {
    timers: HashMap<K, TimerEntry>,
    next_generation: u64,
    closed: bool,
}

impl<K> Drop for TimerInner<K> {
    fn drop(&mut self) {
        for (_, entry) in self.timers.drain() {
            entry.handle.abort();
        }
    }
}

/// At most one pending timer per key.
///
/// Scheduling a key that already has a timer aborts the old one first, so a
/// key never has two live timers. Each timer carries a generation number and
/// removes itself from the map before its callback runs; a timer whose
/// generation was replaced never fires, even if its task was already past the
/// sleep when it got replaced.
///
/// After [`close`](Self::close) every timer is aborted and new ones are
/// refused.
///
/// Timers are tokio tasks, so scheduling requires a running runtime.
pub struct TimerMap<K> {
    inner: Arc<Mutex<TimerInner<K>>>,
}

impl<K> TimerMap<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(TimerInner {
                timers: HashMap::new(),
                next_generation: 0,
                closed: false,
            })),
        }
    }

    /// Runs `callback` after `delay`, replacing any timer pending for `key`.
    ///
    /// Returns `false` without scheduling if the map is closed.
    pub fn schedule<F>(&self, key: K, delay: Duration, callback: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let mut inner = self.inner.lock();
        if inner.closed {
            return false;
        }

        inner.next_generation += 1;
        let generation = inner.next_generation;
        if let Some(previous) = inner.timers.remove(&key) {
            previous.handle.abort();
        }

        let weak: Weak<Mutex<TimerInner<K>>> = Arc::downgrade(&self.inner);
        let task_key = key.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            {
                let mut inner = inner.lock();
                let current = inner
                    .timers
                    .get(&task_key)
                    .is_some_and(|entry| entry.generation == generation);
                if !current || inner.closed {
                    return;
                }
                inner.timers.remove(&task_key);
            }
            callback();
        });

        inner.timers.insert(
            key,
            TimerEntry {
                generation,
                handle: task.abort_handle(),
            },
        );
        true
    }

    /// Cancels the timer for `key`. Returns `true` if one was pending.
    pub fn cancel(&self, key: &K) -> bool {
        match self.inner.lock().timers.remove(key) {
            Some(entry) => {
                entry.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Returns `true` if a timer is pending for `key`.
    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.inner.lock().timers.contains_key(key)
    }

    /// Returns the number of pending timers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().timers.len()
    }

    /// Returns `true` if no timer is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().timers.is_empty()
    }

    /// Aborts every timer and refuses new ones.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        for (_, entry) in inner.timers.drain() {
            entry.handle.abort();
        }
    }

    /// Returns `true` once [`close`](Self::close) was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

impl<K> Default for TimerMap<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> std::fmt::Debug for TimerMap<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("TimerMap")
            .field("pending", &inner.timers.len())
            .field("closed", &inner.closed)
            .finish()
    }
}
