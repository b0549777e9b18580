// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Synchronous typed event bus.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::error::BoxError;

/// Result returned by event handlers.
pub type HandlerResult = Result<(), BoxError>;

/// An event type that can travel over the [`EventBus`].
pub trait BusEvent: Any + Send + Sync {
    /// Event name used in logs.
    const NAME: &'static str;
}

/// Unique identifier for a subscription.
///
/// Returned by [`EventBus::on`] and accepted by [`EventBus::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    /// Returns the raw ID value.
    #[must_use]
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Sub({})", self.0)
    }
}

/// Identity under which handlers are registered.
///
/// Two owners created with the same name are still distinct; the name only
/// appears in logs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenerOwner {
    id: u64,
    name: Arc<str>,
}

impl ListenerOwner {
    /// Returns the name used in logs.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

type ErasedHandler = Arc<dyn Fn(&dyn Any) -> HandlerResult + Send + Sync>;

struct Listener {
    id: SubscriptionId,
    owner: ListenerOwner,
    handler: ErasedHandler,
}

#[derive(Default)]
struct BusInner {
    listeners: RwLock<HashMap<TypeId, Vec<Listener>>>,
    next_subscription: AtomicU64,
    next_owner: AtomicU64,
}

/// In-process publish/subscribe hub.
///
/// Handlers run synchronously inside [`emit`](Self::emit), in registration
/// order. A handler that returns an error or panics is logged with its
/// owner's name and the event name; the remaining handlers still run and the
/// emitter never sees the failure.
///
/// The handler list is copied before dispatch, so handlers may emit further
/// events or (un)register handlers without deadlocking. A handler registered
/// during an emission only sees later emissions.
///
/// Cloning the bus is cheap and shares the same handlers.
///
/// # Examples
///
/// ```
/// use meshbridge::event::{BusConnectionChanged, EventBus};
///
/// let bus = EventBus::new();
/// let owner = bus.owner("logger");
///
/// bus.on(&owner, |event: &BusConnectionChanged| {
///     println!("connected: {}", event.connected);
///     Ok(())
/// });
///
/// bus.emit(&BusConnectionChanged { connected: true });
/// bus.remove_listeners(&owner);
/// ```
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Creates a bus without handlers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new owner identity.
    #[must_use]
    pub fn owner(&self, name: &str) -> ListenerOwner {
        ListenerOwner {
            id: self.inner.next_owner.fetch_add(1, Ordering::Relaxed),
            name: Arc::from(name),
        }
    }

    /// Registers a handler for events of type `E`.
    pub fn on<E, F>(&self, owner: &ListenerOwner, handler: F) -> SubscriptionId
    where
        E: BusEvent,
        F: Fn(&E) -> HandlerResult + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed));
        let handler: ErasedHandler = Arc::new(move |event: &dyn Any| {
            event.downcast_ref::<E>().map_or(Ok(()), &handler)
        });

        self.inner
            .listeners
            .write()
            .entry(TypeId::of::<E>())
            .or_default()
            .push(Listener {
                id,
                owner: owner.clone(),
                handler,
            });
        id
    }

    /// Delivers an event to every handler registered for its type.
    pub fn emit<E: BusEvent>(&self, event: &E) {
        let handlers: Vec<(ListenerOwner, ErasedHandler)> = {
            let listeners = self.inner.listeners.read();
            let Some(list) = listeners.get(&TypeId::of::<E>()) else {
                return;
            };
            list.iter()
                .map(|l| (l.owner.clone(), Arc::clone(&l.handler)))
                .collect()
        };

        for (owner, handler) in handlers {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(event as &dyn Any)));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(
                        owner = %owner.name(),
                        event = E::NAME,
                        error = %e,
                        "Event handler failed"
                    );
                }
                Err(payload) => {
                    tracing::error!(
                        owner = %owner.name(),
                        event = E::NAME,
                        panic = %panic_message(payload.as_ref()),
                        "Event handler panicked"
                    );
                }
            }
        }
    }

    /// Removes a single handler. Returns `true` if it was registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.inner.listeners.write();
        for list in listeners.values_mut() {
            if let Some(pos) = list.iter().position(|l| l.id == id) {
                list.remove(pos);
                return true;
            }
        }
        false
    }

    /// Removes every handler registered by `owner`, returning how many.
    pub fn remove_listeners(&self, owner: &ListenerOwner) -> usize {
        let mut listeners = self.inner.listeners.write();
        let mut removed = 0;
        for list in listeners.values_mut() {
            let before = list.len();
            list.retain(|l| l.owner != *owner);
            removed += before - list.len();
        }
        listeners.retain(|_, list| !list.is_empty());
        removed
    }

    /// Returns the number of handlers registered for `E`.
    #[must_use]
    pub fn listener_count<E: BusEvent>(&self) -> usize {
        self.inner
            .listeners
            .read()
            .get(&TypeId::of::<E>())
            .map_or(0, Vec::len)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count: usize = self.inner.listeners.read().values().map(Vec::len).sum();
        f.debug_struct("EventBus").field("listeners", &count).finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

/// Handles registered on behalf of one component instance.
///
/// Every handler goes through a single [`ListenerOwner`], so
/// [`dispose`](Self::dispose) removes all of them at once. Dropping the arena
/// disposes it as well.
pub struct Subscriptions {
    bus: EventBus,
    owner: ListenerOwner,
    ids: Mutex<Vec<SubscriptionId>>,
}

impl Subscriptions {
    /// Creates an empty arena owned by a fresh owner named `name`.
    #[must_use]
    pub fn new(bus: &EventBus, name: &str) -> Self {
        Self {
            owner: bus.owner(name),
            bus: bus.clone(),
            ids: Mutex::new(Vec::new()),
        }
    }

    /// Registers a handler in this arena.
    pub fn on<E, F>(&self, handler: F) -> SubscriptionId
    where
        E: BusEvent,
        F: Fn(&E) -> HandlerResult + Send + Sync + 'static,
    {
        let id = self.bus.on(&self.owner, handler);
        self.ids.lock().push(id);
        id
    }

    /// Returns the owner identity.
    #[must_use]
    pub fn owner(&self) -> &ListenerOwner {
        &self.owner
    }

    /// Returns the number of live handlers in this arena.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.lock().len()
    }

    /// Returns `true` if the arena holds no handlers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.lock().is_empty()
    }

    /// Removes every handler in the arena. Safe to call repeatedly.
    pub fn dispose(&self) {
        let had_any = !std::mem::take(&mut *self.ids.lock()).is_empty();
        if had_any {
            self.bus.remove_listeners(&self.owner);
        }
    }
}

impl Drop for Subscriptions {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for Subscriptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriptions")
            .field("owner", &self.owner.name())
            .field("handlers", &self.len())
            .finish()
    }
}
