// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Debounce and throttle coalescing of rapid device updates.
//!
//! Both policies keep two pieces of state apart: the committed cache, which
//! is updated as soon as a delta arrives, and the pending outbound payload,
//! which is published later. Reads of the cache therefore never lag behind
//! the device, even while the bus publish is held back.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::Attributes;
use crate::entity::{Entity, EntityId, EntityRegistry};
use crate::event::PublishReason;
use crate::publish::Publisher;
use crate::timer::TimerMap;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum FlushKey {
    Debounce(EntityId),
    Throttle(EntityId),
}

#[derive(Default)]
struct ThrottleState {
    last_publish: Option<Instant>,
    pending: Option<Attributes>,
}

struct CoalescerInner {
    publisher: Publisher,
    registry: EntityRegistry,
    debounced: Mutex<HashMap<EntityId, Attributes>>,
    throttled: Mutex<HashMap<EntityId, ThrottleState>>,
    timers: TimerMap<FlushKey>,
    stopped: AtomicBool,
}

/// Per-entity debounce and throttle buffers in front of the [`Publisher`].
///
/// Flushes look the entity up again in the [`EntityRegistry`], so a rename
/// during a window publishes under the new name and a removal drops the
/// payload.
///
/// Cloning is cheap and shares the buffers.
#[derive(Clone)]
pub struct Coalescer {
    inner: Arc<CoalescerInner>,
}

impl Coalescer {
    /// Creates a coalescer publishing through `publisher`.
    #[must_use]
    pub fn new(publisher: Publisher, registry: EntityRegistry) -> Self {
        Self {
            inner: Arc::new(CoalescerInner {
                publisher,
                registry,
                debounced: Mutex::new(HashMap::new()),
                throttled: Mutex::new(HashMap::new()),
                timers: TimerMap::new(),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Buffers `delta` and publishes the union once `window` passes without
    /// further deltas.
    ///
    /// If a key listed in `ignore` arrives with a value different from the
    /// pending one, the pending payload is published immediately and `delta`
    /// starts a fresh window.
    pub fn debounce(&self, entity: &Entity, delta: &Attributes, window: Duration, ignore: &[String]) {
        if self.is_stopped() {
            return;
        }
        let id = entity.id();

        let conflicting = {
            let mut debounced = self.inner.debounced.lock();
            let conflict = debounced
                .get(&id)
                .is_some_and(|pending| is_conflicting(pending, delta, ignore));
            if conflict { debounced.remove(&id) } else { None }
        };
        if let Some(previous) = conflicting {
            self.inner.timers.cancel(&FlushKey::Debounce(id.clone()));
            tracing::debug!(entity = %entity.name(), "Debounce conflict, flushing pending payload");
            self.inner
                .publisher
                .publish_entity_state(entity, &previous, PublishReason::Debounce);
        }

        let pending = {
            let mut debounced = self.inner.debounced.lock();
            let pending = debounced.entry(id.clone()).or_default();
            pending.extend(delta.iter().map(|(k, v)| (k.clone(), v.clone())));
            pending.clone()
        };
        self.inner
            .publisher
            .cache()
            .set(entity, &pending, PublishReason::Debounce);

        let weak = Arc::downgrade(&self.inner);
        let flush_id = id.clone();
        self.inner.timers.schedule(FlushKey::Debounce(id), window, move || {
            if let Some(inner) = Weak::upgrade(&weak) {
                flush_debounced(&inner, &flush_id);
            }
        });
    }

    /// Publishes `delta` at most once per `window`.
    ///
    /// The cache is updated immediately. If `window` has elapsed since the
    /// last publish and nothing is pending, `delta` is published at once;
    /// otherwise it is merged into the pending payload, which is published
    /// `window` after the last publish.
    pub fn throttle(&self, entity: &Entity, delta: &Attributes, window: Duration) {
        if self.is_stopped() {
            return;
        }
        let id = entity.id();
        self.inner
            .publisher
            .cache()
            .set(entity, delta, PublishReason::Throttle);

        let now = Instant::now();
        let flush_in = {
            let mut throttled = self.inner.throttled.lock();
            let state = throttled.entry(id.clone()).or_default();
            let window_elapsed = state
                .last_publish
                .is_none_or(|last| now.duration_since(last) >= window);

            if window_elapsed && state.pending.is_none() {
                state.last_publish = Some(now);
                None
            } else {
                state
                    .pending
                    .get_or_insert_with(Attributes::new)
                    .extend(delta.iter().map(|(k, v)| (k.clone(), v.clone())));
                let delay = state
                    .last_publish
                    .map_or(Duration::ZERO, |last| window.saturating_sub(now.duration_since(last)));
                Some(delay)
            }
        };

        match flush_in {
            None => {
                self.inner
                    .publisher
                    .publish_entity_state(entity, delta, PublishReason::Throttle);
            }
            Some(delay) => {
                let key = FlushKey::Throttle(id.clone());
                if !self.inner.timers.contains(&key) {
                    let weak = Arc::downgrade(&self.inner);
                    self.inner.timers.schedule(key, delay, move || {
                        if let Some(inner) = Weak::upgrade(&weak) {
                            flush_throttled(&inner, &id);
                        }
                    });
                }
            }
        }
    }

    /// Removes `keys` from the pending debounce payload of an entity.
    ///
    /// Used when the entity state was published by another source, so the
    /// delayed flush does not re-send values that are already stale.
    pub fn forget_keys<'a, I>(&self, id: &EntityId, keys: I)
    where
        I: IntoIterator<Item = &'a String>,
    {
        if let Some(pending) = self.inner.debounced.lock().get_mut(id) {
            for key in keys {
                pending.remove(key);
            }
        }
    }

    /// Drops every buffer and timer of an entity.
    pub fn forget(&self, id: &EntityId) {
        self.inner.timers.cancel(&FlushKey::Debounce(id.clone()));
        self.inner.timers.cancel(&FlushKey::Throttle(id.clone()));
        self.inner.debounced.lock().remove(id);
        self.inner.throttled.lock().remove(id);
    }

    /// Returns the pending debounce payload of an entity.
    #[must_use]
    pub fn pending(&self, id: &EntityId) -> Option<Attributes> {
        self.inner.debounced.lock().get(id).cloned()
    }

    /// Returns the number of pending flush timers.
    #[must_use]
    pub fn pending_flushes(&self) -> usize {
        self.inner.timers.len()
    }

    /// Cancels every timer and drops pending payloads without publishing.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        self.inner.timers.close();
        self.inner.debounced.lock().clear();
        self.inner.throttled.lock().clear();
    }

    fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Coalescer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coalescer")
            .field("debounced", &self.inner.debounced.lock().len())
            .field("throttled", &self.inner.throttled.lock().len())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

fn is_conflicting(pending: &Attributes, delta: &Attributes, ignore: &[String]) -> bool {
    ignore.iter().any(|key| match (pending.get(key), delta.get(key)) {
        (Some(old), Some(new)) => old != new,
        _ => false,
    })
}

fn flush_debounced(inner: &CoalescerInner, id: &EntityId) {
    if inner.stopped.load(Ordering::Acquire) {
        return;
    }
    let Some(payload) = inner.debounced.lock().remove(id) else {
        return;
    };
    match inner.registry.get(id) {
        Some(entity) => {
            inner
                .publisher
                .publish_entity_state(&entity, &payload, PublishReason::Debounce);
        }
        None => tracing::debug!(entity = %id, "Dropping debounced payload of removed entity"),
    }
}

fn flush_throttled(inner: &CoalescerInner, id: &EntityId) {
    if inner.stopped.load(Ordering::Acquire) {
        return;
    }
    let payload = {
        let mut throttled = inner.throttled.lock();
        let Some(state) = throttled.get_mut(id) else {
            return;
        };
        let Some(payload) = state.pending.take() else {
            return;
        };
        state.last_publish = Some(Instant::now());
        payload
    };
    match inner.registry.get(id) {
        Some(entity) => {
            inner
                .publisher
                .publish_entity_state(&entity, &payload, PublishReason::Throttle);
        }
        None => tracing::debug!(entity = %id, "Dropping throttled payload of removed entity"),
    }
}
