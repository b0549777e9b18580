// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The bridge: composition root and inbound event pumps.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::Attributes;
use crate::entity::{Device, Entity, EntityId, EntityOptions, EntityRegistry};
use crate::error::{EntityError, ExtensionError, Result};
use crate::event::{
    BusConnectionChanged, BusMessage, DeviceAnnounce, DeviceInterview, DeviceJoined, DeviceLeave, DeviceMessage,
    EntityOptionsChanged, EntityRemoved, EntityRenamed, EventBus, GroupMembersChanged, LastSeenChanged,
    PublishReason,
};
use crate::extension::{ExtensionContext, ExtensionControl, ExtensionManager};
use crate::network::{DeviceNetwork, InterviewStatus, MessageConverter, NetworkEvent};
use crate::publish::Publisher;
use crate::publish::payload::flatten_attributes;
use crate::settings::BridgeSettings;
use crate::state::StateCache;
use crate::transport::{BusTransport, TopicPublisher, TransportEvent};

/// Command topics subscribed under the base topic.
const COMMAND_FILTERS: [&str; 4] = ["+/set", "+/set/+", "+/get", "+/get/+"];

struct BridgeInner {
    settings: Arc<BridgeSettings>,
    bus: EventBus,
    registry: EntityRegistry,
    cache: StateCache,
    publisher: Publisher,
    topics: TopicPublisher,
    network: Arc<dyn DeviceNetwork>,
    extensions: ExtensionManager,
    shutdown: CancellationToken,
    pumps: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

/// Mirrors a device network onto a message bus.
///
/// The bridge owns the shared components (event bus, entity registry, state
/// cache, publisher) and the [`ExtensionManager`]. Inbound traffic enters
/// through [`handle_network_event`](Self::handle_network_event) and
/// [`handle_bus_message`](Self::handle_bus_message), usually fed by the pumps
/// started with [`attach_network_events`](Self::attach_network_events) and
/// [`attach_bus_messages`](Self::attach_bus_messages).
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
///
/// use meshbridge::{Bridge, BridgeSettings, MqttTransport, PassthroughConverter};
/// # use meshbridge::network::DeviceNetwork;
///
/// # async fn run(network: Arc<dyn DeviceNetwork>) -> meshbridge::Result<()> {
/// let settings = BridgeSettings::default();
/// let transport = MqttTransport::builder()
///     .host("localhost")
///     .last_will("meshbridge/bridge/state", meshbridge::extension::bridge_state_payload(false, false))
///     .build()
///     .await?;
/// let events = transport.take_event_receiver();
///
/// let bridge = Bridge::new(settings, Arc::new(transport), network, Arc::new(PassthroughConverter));
/// if let Some(events) = events {
///     bridge.attach_bus_messages(events);
/// }
/// bridge.start().await?;
/// # bridge.stop().await;
/// # Ok(())
/// # }
/// ```
///
/// Cloning is cheap and shares the same bridge.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

impl Bridge {
    /// Wires the components together. Nothing runs before [`start`](Self::start).
    #[must_use]
    pub fn new(
        settings: BridgeSettings,
        transport: Arc<dyn BusTransport>,
        network: Arc<dyn DeviceNetwork>,
        converter: Arc<dyn MessageConverter>,
    ) -> Self {
        let settings = Arc::new(settings);
        let bus = EventBus::new();
        let registry = EntityRegistry::new();
        let cache = StateCache::new(&settings);
        let topics = TopicPublisher::new(transport, &settings.base_topic, settings.force_disable_retain);
        let publisher = Publisher::new(Arc::clone(&settings), cache.clone(), bus.clone(), topics.clone());

        let extensions = ExtensionManager::new(ExtensionContext {
            bus: bus.clone(),
            cache: cache.clone(),
            registry: registry.clone(),
            publisher: publisher.clone(),
            topics: topics.clone(),
            network: Arc::clone(&network),
            converter,
            settings: Arc::clone(&settings),
            control: ExtensionControl::detached(),
        });

        Self {
            inner: Arc::new(BridgeInner {
                settings,
                bus,
                registry,
                cache,
                publisher,
                topics,
                network,
                extensions,
                shutdown: CancellationToken::new(),
                pumps: Mutex::new(Vec::new()),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Loads entities, starts persistence and extensions, and subscribes to
    /// command topics.
    ///
    /// # Errors
    ///
    /// Returns an error if the bridge was already started, the device network
    /// cannot list its entities, an extension is misused or the command
    /// subscriptions cannot be queued. A failure to list the entities leaves
    /// the bridge unstarted, so `start` may be called again.
    pub async fn start(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(ExtensionError::AlreadyStarted("bridge".to_string()).into());
        }

        let entities = match self.inner.network.entities().await {
            Ok(entities) => entities,
            Err(e) => {
                self.inner.started.store(false, Ordering::Release);
                return Err(e.into());
            }
        };
        for entity in entities {
            let name = entity.name().to_string();
            if let Err(e) = self.inner.registry.insert(entity) {
                tracing::warn!(entity = %name, error = %e, "Skipping entity");
            }
        }

        self.inner.cache.start_persistence();
        self.inner.extensions.start_all().await?;
        for filter in COMMAND_FILTERS {
            self.inner.topics.subscribe(filter)?;
        }

        tracing::info!(
            entities = self.inner.registry.len(),
            extensions = ?self.inner.extensions.names(),
            "Bridge started"
        );
        Ok(())
    }

    /// Stops extensions in reverse order, ends the pumps and writes the state
    /// snapshot. Safe to call repeatedly.
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.extensions.stop_all().await;
        self.inner.shutdown.cancel();

        let pumps = std::mem::take(&mut *self.inner.pumps.lock());
        for pump in pumps {
            if let Err(e) = pump.await
                && e.is_panic()
            {
                tracing::error!(error = %e, "Event pump panicked");
            }
        }

        self.inner.cache.stop_persistence();
        tracing::info!("Bridge stopped");
    }

    /// Feeds device network events into the bridge until the channel closes
    /// or the bridge stops.
    pub fn attach_network_events(&self, mut events: mpsc::Receiver<NetworkEvent>) {
        let bridge = self.clone();
        let shutdown = self.inner.shutdown.clone();
        let pump = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => bridge.handle_network_event(event),
                        None => break,
                    },
                }
            }
            tracing::debug!("Network event pump finished");
        });
        self.inner.pumps.lock().push(pump);
    }

    /// Feeds transport events into the bridge until the channel closes or
    /// the bridge stops.
    pub fn attach_bus_messages(&self, mut events: mpsc::Receiver<TransportEvent>) {
        let bridge = self.clone();
        let shutdown = self.inner.shutdown.clone();
        let pump = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    event = events.recv() => match event {
                        Some(TransportEvent::Connected) => {
                            bridge.inner.bus.emit(&BusConnectionChanged { connected: true });
                        }
                        Some(TransportEvent::Disconnected) => {
                            bridge.inner.bus.emit(&BusConnectionChanged { connected: false });
                        }
                        Some(TransportEvent::Message(message)) => bridge.handle_bus_message(message),
                        None => break,
                    },
                }
            }
            tracing::debug!("Bus message pump finished");
        });
        self.inner.pumps.lock().push(pump);
    }

    /// Applies one device network event.
    ///
    /// Traffic from a known device updates its `last_seen` and emits
    /// [`LastSeenChanged`] before the event itself is emitted.
    pub fn handle_network_event(&self, event: NetworkEvent) {
        if self.inner.stopped.load(Ordering::Acquire) {
            return;
        }
        let registry = &self.inner.registry;
        let bus = &self.inner.bus;

        match event {
            NetworkEvent::Message { address, message } => {
                let Some(device) = self.touch(&address) else {
                    tracing::debug!(device = %address, "Message from unknown device");
                    return;
                };
                bus.emit(&DeviceMessage { device, message });
            }
            NetworkEvent::Joined { device } => {
                let address = device.address.clone();
                if registry.device(&address).is_none() {
                    if let Err(e) = registry.insert(device) {
                        tracing::warn!(device = %address, error = %e, "Cannot register joined device");
                        return;
                    }
                    tracing::info!(device = %address, "Device joined");
                }
                if let Some(device) = self.touch(&address) {
                    bus.emit(&DeviceJoined { device });
                }
            }
            NetworkEvent::Left { address } => {
                let id = EntityId::device(address.clone());
                let name = registry.remove(&id).map(|entity| entity.name().to_string());
                self.inner.cache.remove(&id);
                tracing::info!(device = %address, "Device left");
                bus.emit(&DeviceLeave { address, name });
            }
            NetworkEvent::Announce { address } => {
                if let Some(device) = self.touch(&address) {
                    tracing::debug!(entity = %device.friendly_name, "Device announced");
                    bus.emit(&DeviceAnnounce { device });
                }
            }
            NetworkEvent::Interview { device, status } => {
                let address = device.address.clone();
                let device = self.apply_interview(device, status);
                tracing::info!(device = %address, status = ?status, "Device interview");
                bus.emit(&DeviceInterview { device, status });
            }
        }
    }

    /// Re-emits a bus message for command-routing extensions.
    pub fn handle_bus_message(&self, message: BusMessage) {
        if self.inner.stopped.load(Ordering::Acquire) {
            return;
        }
        tracing::debug!(topic = %message.topic, "Received bus message");
        self.inner.bus.emit(&message);
    }

    /// Publishes a state delta for the entity with this name or identifier.
    ///
    /// # Errors
    ///
    /// Returns [`EntityError::NotFound`] if the entity is unknown.
    pub fn publish_entity_state(&self, name: &str, payload: &Attributes) -> Result<Option<Attributes>> {
        let entity = self.resolve(name)?;
        Ok(self
            .inner
            .publisher
            .publish_entity_state(&entity, payload, PublishReason::External))
    }

    /// Renames an entity.
    ///
    /// Retained state under the old name is cleared and the cached state is
    /// republished under the new one.
    ///
    /// # Errors
    ///
    /// Returns [`EntityError`] if `from` is unknown or `to` is taken or
    /// invalid.
    pub fn rename_entity(&self, from: &str, to: &str) -> Result<()> {
        let (id, old) = self.inner.registry.rename(from, to)?;
        let entity = self
            .inner
            .registry
            .get(&id)
            .ok_or_else(|| EntityError::NotFound(to.to_string()))?;

        let cached = self.inner.cache.get(&id);
        self.clear_state_topics(&old, &cached);
        tracing::info!(from = %old, to = %to, "Entity renamed");
        self.inner.bus.emit(&EntityRenamed {
            entity: entity.clone(),
            from: old,
            to: to.to_string(),
        });

        self.inner
            .publisher
            .publish_entity_state(&entity, &cached, PublishReason::Cached);
        Ok(())
    }

    /// Removes an entity, its cached state and its retained state topics.
    ///
    /// # Errors
    ///
    /// Returns [`EntityError::NotFound`] if the entity is unknown.
    pub fn remove_entity(&self, name: &str) -> Result<()> {
        let entity = self.resolve(name)?;
        let id = entity.id();
        let cached = self.inner.cache.get(&id);

        self.inner.registry.remove(&id);
        self.inner.cache.remove(&id);
        self.clear_state_topics(entity.name(), &cached);
        tracing::info!(entity = %entity.name(), "Entity removed");
        self.inner.bus.emit(&EntityRemoved {
            id,
            name: entity.name().to_string(),
        });
        Ok(())
    }

    /// Replaces the options of an entity.
    ///
    /// # Errors
    ///
    /// Returns [`EntityError::NotFound`] if the entity is unknown.
    pub fn set_entity_options(&self, name: &str, options: EntityOptions) -> Result<()> {
        let entity = self.resolve(name)?;
        let id = entity.id();
        let from = entity.options().clone();

        self.inner.registry.set_options(&id, options.clone())?;
        let entity = self
            .inner
            .registry
            .get(&id)
            .ok_or_else(|| EntityError::NotFound(name.to_string()))?;
        self.inner.bus.emit(&EntityOptionsChanged {
            entity,
            from,
            to: options,
        });
        Ok(())
    }

    /// Replaces the members of a group.
    ///
    /// # Errors
    ///
    /// Returns [`EntityError::NotFound`] if the group is unknown.
    pub fn set_group_members(&self, name: &str, members: Vec<String>) -> Result<()> {
        let group = self
            .resolve(name)?
            .as_group()
            .cloned()
            .ok_or_else(|| EntityError::NotFound(name.to_string()))?;

        let added = members
            .iter()
            .filter(|m| !group.has_member(m))
            .cloned()
            .collect();
        let removed = group
            .members
            .iter()
            .filter(|m| !members.contains(m))
            .cloned()
            .collect();
        self.inner.registry.set_members(group.id, members.clone())?;

        self.inner.bus.emit(&GroupMembersChanged {
            group: group.with_members(members),
            added,
            removed,
        });
        Ok(())
    }

    /// Returns the extension manager.
    #[must_use]
    pub fn extensions(&self) -> &ExtensionManager {
        &self.inner.extensions
    }

    /// Returns the entity registry.
    #[must_use]
    pub fn registry(&self) -> &EntityRegistry {
        &self.inner.registry
    }

    /// Returns the state cache.
    #[must_use]
    pub fn cache(&self) -> &StateCache {
        &self.inner.cache
    }

    /// Returns the event bus.
    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Returns the settings.
    #[must_use]
    pub fn settings(&self) -> &BridgeSettings {
        &self.inner.settings
    }

    fn resolve(&self, name: &str) -> Result<Entity> {
        self.inner
            .registry
            .resolve(name)
            .ok_or_else(|| EntityError::NotFound(name.to_string()).into())
    }

    /// Updates `last_seen` and emits [`LastSeenChanged`].
    fn touch(&self, address: &str) -> Option<Device> {
        let previous = self.inner.registry.touch(address, Utc::now())?;
        let device = self.inner.registry.device(address)?;
        self.inner.bus.emit(&LastSeenChanged {
            device: device.clone(),
            previous,
        });
        Some(device)
    }

    fn apply_interview(&self, reported: Device, status: InterviewStatus) -> Device {
        let registry = &self.inner.registry;
        registry.set_interviewing(&reported.address, status == InterviewStatus::Started);

        let Some(mut device) = registry.device(&reported.address) else {
            return reported;
        };
        if status == InterviewStatus::Successful {
            device.kind = reported.kind;
            device.power_source = reported.power_source;
            device.model = reported.model;
            device.manufacturer = reported.manufacturer;
            device.capabilities = reported.capabilities;
            if let Err(e) = registry.insert(device.clone()) {
                tracing::warn!(device = %device.address, error = %e, "Cannot update interviewed device");
            }
        }
        device
    }

    fn clear_state_topics(&self, name: &str, cached: &Attributes) {
        let topics = &self.inner.topics;
        topics.clear_retained(name);
        if self.inner.settings.output.publishes_attributes() {
            for (attribute, _) in flatten_attributes(cached) {
                topics.clear_retained(&format!("{name}/{attribute}"));
            }
        }
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("registry", &self.inner.registry)
            .field("extensions", &self.inner.extensions)
            .field("stopped", &self.inner.stopped.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}
