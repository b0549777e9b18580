// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Extension construction and lifecycle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use super::{BuiltinExtension, Extension, ExtensionContext, ExtensionFactory};
use crate::error::{ExtensionError, Result};

/// Lifecycle state of one extension instance.
///
/// Transitions only move forward: `Constructed` to `Started` to `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtensionState {
    /// Built, not started yet.
    Constructed,
    /// Running.
    Started,
    /// Stopped; the instance is never started again.
    Stopped,
}

struct Slot {
    extension: Arc<dyn Extension>,
    state: Mutex<ExtensionState>,
}

impl Slot {
    fn new(extension: Arc<dyn Extension>) -> Arc<Self> {
        Arc::new(Self {
            extension,
            state: Mutex::new(ExtensionState::Constructed),
        })
    }

    fn name(&self) -> &str {
        self.extension.name()
    }

    fn state(&self) -> ExtensionState {
        *self.state.lock()
    }

    fn is_active(&self) -> bool {
        self.state() != ExtensionState::Stopped
    }
}

struct ManagerInner {
    context: ExtensionContext,
    slots: Mutex<Vec<Arc<Slot>>>,
    factories: RwLock<HashMap<String, Arc<dyn ExtensionFactory>>>,
    running: AtomicBool,
}

/// Owns the extensions of a bridge and drives their lifecycle.
///
/// Built-in extensions listed in the settings are constructed immediately, in
/// the fixed order of [`BuiltinExtension::ALL`]. [`start_all`](Self::start_all)
/// starts them in order, [`stop_all`](Self::stop_all) stops them in reverse.
/// While running, extensions can be enabled, disabled and added; enabling
/// always constructs a fresh instance.
///
/// A failing or panicking `start` or `stop` of one extension is logged and does not affect
/// the others. Misuse, such as starting twice or enabling an unknown name, is
/// returned as an [`ExtensionError`].
///
/// Cloning is cheap and shares the same extensions.
#[derive(Clone)]
pub struct ExtensionManager {
    inner: Arc<ManagerInner>,
}

impl ExtensionManager {
    /// Creates a manager and constructs the configured built-in extensions.
    ///
    /// The `control` field of `context` is replaced by a handle to the new
    /// manager.
    #[must_use]
    pub fn new(mut context: ExtensionContext) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<ManagerInner>| {
            context.control = ExtensionControl {
                manager: weak.clone(),
            };
            let slots = BuiltinExtension::configured(&context.settings)
                .into_iter()
                .map(|builtin| Slot::new(builtin.construct(context.clone())))
                .collect();
            ManagerInner {
                context,
                slots: Mutex::new(slots),
                factories: RwLock::new(HashMap::new()),
                running: AtomicBool::new(false),
            }
        });
        Self { inner }
    }

    /// Returns the context handed to extensions.
    #[must_use]
    pub fn context(&self) -> &ExtensionContext {
        &self.inner.context
    }

    /// Registers a factory for an external extension kind.
    ///
    /// Factories named in the settings' extension list are constructed by
    /// [`start_all`](Self::start_all); any factory can be enabled later.
    pub fn register_factory(&self, factory: Arc<dyn ExtensionFactory>) {
        let name = factory.name().to_string();
        tracing::debug!(extension = %name, "Registered extension factory");
        self.inner.factories.write().insert(name, factory);
    }

    /// Starts every constructed extension in order.
    ///
    /// # Errors
    ///
    /// Returns [`ExtensionError::AlreadyStarted`] if an extension already
    /// left the constructed state, e.g. when called twice.
    pub async fn start_all(&self) -> Result<()> {
        self.construct_configured_factories();
        self.inner.running.store(true, Ordering::Release);

        let slots = self.inner.slots.lock().clone();
        for slot in slots {
            self.start_slot(&slot).await?;
        }
        Ok(())
    }

    /// Stops every started extension in reverse order.
    pub async fn stop_all(&self) {
        self.inner.running.store(false, Ordering::Release);
        let slots = self.inner.slots.lock().clone();
        for slot in slots.iter().rev() {
            self.stop_slot(slot).await;
        }
    }

    /// Constructs and starts a fresh instance of the named extension.
    ///
    /// # Errors
    ///
    /// Returns [`ExtensionError::AlreadyEnabled`] if it is already enabled
    /// and [`ExtensionError::Unknown`] if no built-in or factory has this
    /// name.
    pub async fn enable(&self, name: &str) -> Result<()> {
        if self.find_active(name).is_some() {
            return Err(ExtensionError::AlreadyEnabled(name.to_string()).into());
        }
        let extension = self
            .construct(name)
            .ok_or_else(|| ExtensionError::Unknown(name.to_string()))?;
        self.add_extension(extension).await
    }

    /// Stops the named extension and drops it.
    ///
    /// # Errors
    ///
    /// Returns [`ExtensionError::NotEnabled`] if it is not enabled.
    pub async fn disable(&self, name: &str) -> Result<()> {
        let slot = self
            .find_active(name)
            .ok_or_else(|| ExtensionError::NotEnabled(name.to_string()))?;
        self.stop_slot(&slot).await;
        Ok(())
    }

    /// Adds an already constructed extension, starting it if the manager is
    /// running.
    ///
    /// # Errors
    ///
    /// Returns [`ExtensionError::AlreadyEnabled`] if an extension with the
    /// same name is enabled.
    pub async fn add_extension(&self, extension: Arc<dyn Extension>) -> Result<()> {
        let slot = {
            let mut slots = self.inner.slots.lock();
            let name = extension.name();
            if slots.iter().any(|s| s.name() == name && s.is_active()) {
                return Err(ExtensionError::AlreadyEnabled(name.to_string()).into());
            }
            slots.retain(|s| s.name() != name);
            let slot = Slot::new(extension);
            slots.push(Arc::clone(&slot));
            slot
        };

        if self.inner.running.load(Ordering::Acquire) {
            self.start_slot(&slot).await?;
        }
        Ok(())
    }

    /// Returns the names of enabled extensions in start order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.inner
            .slots
            .lock()
            .iter()
            .filter(|s| s.is_active())
            .map(|s| s.name().to_string())
            .collect()
    }

    /// Returns the lifecycle state of the named extension.
    #[must_use]
    pub fn state_of(&self, name: &str) -> Option<ExtensionState> {
        self.inner
            .slots
            .lock()
            .iter()
            .rev()
            .find(|s| s.name() == name)
            .map(|s| s.state())
    }

    /// Returns the enabled extension with this name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Extension>> {
        self.find_active(name).map(|slot| Arc::clone(&slot.extension))
    }

    fn find_active(&self, name: &str) -> Option<Arc<Slot>> {
        self.inner
            .slots
            .lock()
            .iter()
            .find(|s| s.name() == name && s.is_active())
            .cloned()
    }

    fn construct(&self, name: &str) -> Option<Arc<dyn Extension>> {
        let context = self.inner.context.clone();
        if let Some(builtin) = BuiltinExtension::from_name(name) {
            return Some(builtin.construct(context));
        }
        let factory = self.inner.factories.read().get(name).cloned()?;
        Some(factory.create(context))
    }

    fn construct_configured_factories(&self) {
        for name in &self.inner.context.settings.extensions {
            if BuiltinExtension::from_name(name).is_some() || self.find_active(name).is_some() {
                continue;
            }
            let factory = self.inner.factories.read().get(name).cloned();
            match factory {
                Some(factory) => {
                    let extension = factory.create(self.inner.context.clone());
                    self.inner.slots.lock().push(Slot::new(extension));
                }
                None => tracing::warn!(extension = %name, "Unknown extension in settings, ignoring"),
            }
        }
    }

    async fn start_slot(&self, slot: &Arc<Slot>) -> Result<()> {
        {
            let mut state = slot.state.lock();
            if *state != ExtensionState::Constructed {
                return Err(ExtensionError::AlreadyStarted(slot.name().to_string()).into());
            }
            *state = ExtensionState::Started;
        }

        if run_isolated(&slot.extension, Lifecycle::Start).await {
            self.inner
                .context
                .publisher
                .register_hook(Arc::clone(&slot.extension));
            tracing::info!(extension = %slot.name(), "Extension started");
        } else {
            *slot.state.lock() = ExtensionState::Stopped;
            run_isolated(&slot.extension, Lifecycle::Stop).await;
        }
        Ok(())
    }

    async fn stop_slot(&self, slot: &Arc<Slot>) {
        let previous = std::mem::replace(&mut *slot.state.lock(), ExtensionState::Stopped);
        if previous != ExtensionState::Started {
            return;
        }

        self.inner.context.publisher.unregister_hook(&slot.extension);
        if run_isolated(&slot.extension, Lifecycle::Stop).await {
            tracing::info!(extension = %slot.name(), "Extension stopped");
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Lifecycle {
    Start,
    Stop,
}

impl Lifecycle {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
        }
    }
}

/// Runs `start` or `stop` on its own task and logs any error or panic.
///
/// Returns `true` if the call completed successfully.
async fn run_isolated(extension: &Arc<dyn Extension>, call: Lifecycle) -> bool {
    let task_extension = Arc::clone(extension);
    let task = tokio::spawn(async move {
        match call {
            Lifecycle::Start => task_extension.start().await,
            Lifecycle::Stop => task_extension.stop().await,
        }
    });

    match task.await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::error!(
                extension = %extension.name(),
                call = call.as_str(),
                error = %e,
                "Extension lifecycle call failed"
            );
            false
        }
        Err(e) => {
            tracing::error!(
                extension = %extension.name(),
                call = call.as_str(),
                panicked = e.is_panic(),
                error = %e,
                "Extension lifecycle task did not complete"
            );
            false
        }
    }
}

impl std::fmt::Debug for ExtensionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionManager")
            .field("extensions", &self.names())
            .field("running", &self.inner.running.load(Ordering::Acquire))
            .finish()
    }
}

/// Weak handle to an [`ExtensionManager`], given to extensions.
///
/// Every call fails with [`ExtensionError::ManagerGone`] once the manager is
/// dropped.
#[derive(Clone, Default)]
pub struct ExtensionControl {
    manager: Weak<ManagerInner>,
}

impl ExtensionControl {
    /// Creates a handle bound to no manager.
    #[must_use]
    pub fn detached() -> Self {
        Self::default()
    }

    fn manager(&self) -> Result<ExtensionManager> {
        self.manager
            .upgrade()
            .map(|inner| ExtensionManager { inner })
            .ok_or_else(|| ExtensionError::ManagerGone.into())
    }

    /// See [`ExtensionManager::enable`].
    ///
    /// # Errors
    ///
    /// Fails like [`ExtensionManager::enable`], or if the manager is gone.
    pub async fn enable(&self, name: &str) -> Result<()> {
        self.manager()?.enable(name).await
    }

    /// See [`ExtensionManager::disable`].
    ///
    /// # Errors
    ///
    /// Fails like [`ExtensionManager::disable`], or if the manager is gone.
    pub async fn disable(&self, name: &str) -> Result<()> {
        self.manager()?.disable(name).await
    }

    /// See [`ExtensionManager::add_extension`].
    ///
    /// # Errors
    ///
    /// Fails like [`ExtensionManager::add_extension`], or if the manager is
    /// gone.
    pub async fn add_extension(&self, extension: Arc<dyn Extension>) -> Result<()> {
        self.manager()?.add_extension(extension).await
    }

    /// See [`ExtensionManager::names`]. Empty once the manager is gone.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.manager().map(|m| m.names()).unwrap_or_default()
    }
}

impl std::fmt::Debug for ExtensionControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionControl")
            .field("attached", &(self.manager.strong_count() > 0))
            .finish()
    }
}
