// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Meshbridge - Entity state synchronization between a mesh device network
//! and an MQTT broker.
//!
//! The bridge keeps a registry of devices and groups, caches their last
//! known state, and publishes state changes on `<base_topic>/<friendly_name>`.
//! Behavior is split into extensions sharing one event bus.
//!
//! # Built-in Extensions
//!
//! - **`bridge_state`**: Retained `online`/`offline` on `<base>/bridge/state`
//! - **`receive`**: Converts device messages to state, with debounce and throttle
//! - **`availability`**: Tracks device and group availability, pinging mains-powered devices
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use meshbridge::network::{DeviceNetwork, NetworkEvent};
//! use meshbridge::{Bridge, BridgeSettings, MqttTransport, PassthroughConverter};
//! use tokio::sync::mpsc;
//!
//! async fn run(
//!     network: Arc<dyn DeviceNetwork>,
//!     network_events: mpsc::Receiver<NetworkEvent>,
//! ) -> meshbridge::Result<()> {
//!     let settings = BridgeSettings::default().with_base_topic("home");
//!     let transport = MqttTransport::builder()
//!         .host("192.168.1.50")
//!         .last_will("home/bridge/state", meshbridge::extension::bridge_state_payload(false, false))
//!         .build()
//!         .await?;
//!     let bus_events = transport.take_event_receiver();
//!
//!     let bridge = Bridge::new(settings, Arc::new(transport), network, Arc::new(PassthroughConverter));
//!     bridge.attach_network_events(network_events);
//!     if let Some(bus_events) = bus_events {
//!         bridge.attach_bus_messages(bus_events);
//!     }
//!     bridge.start().await?;
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
//!     bridge.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! # Custom Extensions
//!
//! Implement [`Extension`] and hand an instance to
//! [`ExtensionManager::add_extension`], or register an
//! [`ExtensionFactory`] so the extension can be enabled by name.

pub mod availability;
mod bridge;
pub mod coalesce;
pub mod entity;
pub mod error;
pub mod event;
pub mod extension;
pub mod network;
pub mod publish;
pub mod queue;
pub mod settings;
pub mod state;
pub mod timer;
pub mod transport;

#[cfg(test)]
mod testing;

/// A flat JSON object of entity attributes.
pub type Attributes = serde_json::Map<String, serde_json::Value>;

pub use availability::{Availability, AvailabilityState};
pub use bridge::Bridge;
pub use entity::{Device, Entity, EntityId, EntityOptions, EntityRegistry, Group};
pub use error::{Error, Result};
pub use event::{EventBus, PublishReason};
pub use extension::{Extension, ExtensionContext, ExtensionFactory, ExtensionManager};
pub use network::{DeviceNetwork, MessageConverter, NetworkEvent, PassthroughConverter, RawMessage};
pub use publish::Publisher;
pub use settings::{AvailabilitySettings, BridgeSettings, LastSeenFormat, OutputMode};
pub use state::StateCache;
#[cfg(feature = "mqtt")]
pub use transport::MqttTransport;
pub use transport::{BusTransport, PublishOptions, QoS, TopicPublisher};
