// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Extensions and their lifecycle.
//!
//! An extension is a named unit of behavior built on the shared
//! [`ExtensionContext`]. It subscribes to bus events in
//! [`start`](Extension::start), releases everything in
//! [`stop`](Extension::stop), and may adjust every outgoing state message
//! through [`adjust_message_before_publish`](Extension::adjust_message_before_publish).
//!
//! - [`ExtensionManager`] - Construction, ordered start/stop, runtime enable/disable
//! - [`BuiltinExtension`] - The extensions shipped with the crate
//! - [`ExtensionFactory`] - Plugin boundary for externally supplied kinds

mod bridge_state;
mod builtin;
mod manager;
mod receive;

use std::sync::Arc;

use async_trait::async_trait;

pub use bridge_state::{BRIDGE_STATE_TOPIC, BridgeState, bridge_state_payload};
pub use builtin::BuiltinExtension;
pub use manager::{ExtensionControl, ExtensionManager, ExtensionState};
pub use receive::Receive;

use crate::Attributes;
use crate::entity::{Entity, EntityRegistry};
use crate::error::Result;
use crate::event::EventBus;
use crate::network::{DeviceNetwork, MessageConverter};
use crate::publish::Publisher;
use crate::settings::BridgeSettings;
use crate::state::StateCache;
use crate::transport::TopicPublisher;

/// A unit of bridge behavior with an explicit lifecycle.
///
/// An instance is started at most once. After `stop` it is discarded;
/// re-enabling an extension constructs a fresh instance.
#[async_trait]
pub trait Extension: Send + Sync {
    /// Unique name, used for enable/disable and in logs.
    fn name(&self) -> &str;

    /// Subscribes to events and publishes initial state.
    async fn start(&self) -> Result<()>;

    /// Releases subscriptions, timers and queued work. Must be idempotent.
    async fn stop(&self) -> Result<()>;

    /// Adjusts an outgoing entity state message.
    fn adjust_message_before_publish(&self, _entity: &Entity, _message: &mut Attributes) {}
}

/// Constructs extensions that are not built into the crate.
pub trait ExtensionFactory: Send + Sync {
    /// Name of the extensions this factory builds.
    fn name(&self) -> &str;

    /// Builds a fresh, not yet started instance.
    fn create(&self, context: ExtensionContext) -> Arc<dyn Extension>;
}

/// Everything an extension may use.
#[derive(Clone)]
pub struct ExtensionContext {
    /// Shared event bus.
    pub bus: EventBus,
    /// Entity state cache.
    pub cache: StateCache,
    /// Known devices and groups.
    pub registry: EntityRegistry,
    /// Entity state publisher.
    pub publisher: Publisher,
    /// Raw topic publisher under the base topic.
    pub topics: TopicPublisher,
    /// The device network.
    pub network: Arc<dyn DeviceNetwork>,
    /// Converter from raw frames to attributes.
    pub converter: Arc<dyn MessageConverter>,
    /// Bridge configuration.
    pub settings: Arc<BridgeSettings>,
    /// Handle to the manager owning the extension.
    pub control: ExtensionControl,
}

impl std::fmt::Debug for ExtensionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionContext")
            .field("registry", &self.registry)
            .field("topics", &self.topics)
            .finish_non_exhaustive()
    }
}
