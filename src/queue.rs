// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded asynchronous operation queue with per-key serialization.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

struct Pending<K> {
    key: K,
    kind: &'static str,
    job: Job,
}

struct QueueState<K> {
    pending: VecDeque<Pending<K>>,
    in_flight: HashMap<K, &'static str>,
    stopped: bool,
}

struct Shared<K> {
    state: Mutex<QueueState<K>>,
    token: CancellationToken,
    concurrency: usize,
}

/// Runs asynchronous operations with bounded concurrency.
///
/// - at most `concurrency` operations run at once;
/// - at most one operation per key runs at once, so operations on the same
///   device never overlap;
/// - runnable operations start in submission order;
/// - an operation with the same key and kind as one already queued or running
///   is dropped.
///
/// Each operation is split into the work future and a completion callback.
/// [`stop`](Self::stop) cancels running work, discards queued operations and
/// guarantees that no completion callback runs afterwards.
///
/// Cloning the queue is cheap and shares the same state.
pub struct OperationQueue<K> {
    shared: Arc<Shared<K>>,
}

impl<K> Clone for OperationQueue<K> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K> OperationQueue<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    /// Creates a queue running at most `concurrency` operations at once.
    ///
    /// A concurrency of zero is treated as one.
    #[must_use]
    pub fn new(concurrency: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState {
                    pending: VecDeque::new(),
                    in_flight: HashMap::new(),
                    stopped: false,
                }),
                token: CancellationToken::new(),
                concurrency: concurrency.max(1),
            }),
        }
    }

    /// Queues an operation.
    ///
    /// `work` runs once a slot is free and no other operation for `key` is
    /// running; `complete` receives its output unless the queue was stopped
    /// in the meantime.
    ///
    /// Returns `false` if the queue is stopped or an operation with the same
    /// key and kind is already queued or running.
    pub fn push<T, Fut, C>(&self, key: K, kind: &'static str, work: Fut, complete: C) -> bool
    where
        T: Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        C: FnOnce(T) + Send + 'static,
    {
        {
            let mut state = self.shared.state.lock();
            if state.stopped {
                return false;
            }
            let duplicate = state.in_flight.get(&key) == Some(&kind)
                || state
                    .pending
                    .iter()
                    .any(|p| p.key == key && p.kind == kind);
            if duplicate {
                return false;
            }

            let token = self.shared.token.clone();
            let job: Job = Box::pin(async move {
                let output = work.await;
                if !token.is_cancelled() {
                    complete(output);
                }
            });
            state.pending.push_back(Pending { key, kind, job });
        }
        pump(&self.shared);
        true
    }

    /// Drops queued (not running) operations for `key`, returning how many.
    pub fn remove_pending(&self, key: &K) -> usize {
        let mut state = self.shared.state.lock();
        let before = state.pending.len();
        state.pending.retain(|p| p.key != *key);
        before - state.pending.len()
    }

    /// Drops queued operations of one kind for `key`, returning how many.
    pub fn remove_pending_kind(&self, key: &K, kind: &str) -> usize {
        let mut state = self.shared.state.lock();
        let before = state.pending.len();
        state.pending.retain(|p| !(p.key == *key && p.kind == kind));
        before - state.pending.len()
    }

    /// Returns `true` if an operation of `kind` for `key` is queued or running.
    #[must_use]
    pub fn contains(&self, key: &K, kind: &str) -> bool {
        let state = self.shared.state.lock();
        state.in_flight.get(key).is_some_and(|k| *k == kind)
            || state.pending.iter().any(|p| p.key == *key && p.kind == kind)
    }

    /// Returns the number of queued operations.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    /// Returns the number of running operations.
    #[must_use]
    pub fn running(&self) -> usize {
        self.shared.state.lock().in_flight.len()
    }

    /// Cancels running work, discards queued operations and refuses new ones.
    pub fn stop(&self) {
        let discarded = {
            let mut state = self.shared.state.lock();
            state.stopped = true;
            std::mem::take(&mut state.pending)
        };
        self.shared.token.cancel();
        drop(discarded);
    }

    /// Returns `true` once [`stop`](Self::stop) was called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.shared.token.is_cancelled()
    }
}

fn pump<K>(shared: &Arc<Shared<K>>)
where
    K: Eq + Hash + Clone + Send + 'static,
{
    loop {
        let (key, job) = {
            let mut state = shared.state.lock();
            if state.stopped || state.in_flight.len() >= shared.concurrency {
                return;
            }
            let Some(index) = state
                .pending
                .iter()
                .position(|p| !state.in_flight.contains_key(&p.key))
            else {
                return;
            };
            let Some(next) = state.pending.remove(index) else {
                return;
            };
            state.in_flight.insert(next.key.clone(), next.kind);
            (next.key, next.job)
        };

        let task_shared = Arc::clone(shared);
        tokio::spawn(async move {
            let token = task_shared.token.clone();
            tokio::select! {
                biased;
                () = token.cancelled() => {}
                () = job => {}
            }
            task_shared.state.lock().in_flight.remove(&key);
            pump(&task_shared);
        });
    }
}

impl<K> std::fmt::Debug for OperationQueue<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("OperationQueue")
            .field("concurrency", &self.shared.concurrency)
            .field("pending", &state.pending.len())
            .field("running", &state.in_flight.len())
            .field("stopped", &state.stopped)
            .finish()
    }
}
