// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-crate fakes shared by unit tests.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::Attributes;
use crate::entity::{Entity, EntityRegistry};
use crate::error::{Error, NetworkError, TransportError};
use crate::event::EventBus;
use crate::extension::{Extension, ExtensionContext, ExtensionControl};
use crate::network::{DeviceNetwork, PassthroughConverter};
use crate::publish::Publisher;
use crate::settings::BridgeSettings;
use crate::state::StateCache;
use crate::transport::{BusTransport, PublishOptions, TopicPublisher};

/// Builds attributes from a JSON object literal.
pub fn attrs(value: Value) -> Attributes {
    value.as_object().cloned().unwrap_or_default()
}

/// One message accepted by [`RecordingTransport`].
#[derive(Debug, Clone)]
pub struct Published {
    pub topic: String,
    pub payload: String,
    pub options: PublishOptions,
}

impl Published {
    pub fn json(&self) -> Value {
        serde_json::from_str(&self.payload).unwrap_or(Value::Null)
    }
}

/// Transport that records publishes instead of sending them.
pub struct RecordingTransport {
    connected: AtomicBool,
    published: Mutex<Vec<Published>>,
    subscriptions: Mutex<Vec<String>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connected: AtomicBool::new(true),
            published: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<Published> {
        self.published.lock().clone()
    }

    pub fn published_to(&self, topic: &str) -> Vec<Published> {
        self.published
            .lock()
            .iter()
            .filter(|p| p.topic == topic)
            .cloned()
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().clone()
    }

    pub fn clear(&self) {
        self.published.lock().clear();
    }
}

impl BusTransport for RecordingTransport {
    fn publish(&self, topic: &str, payload: &str, options: PublishOptions) -> Result<(), TransportError> {
        self.published.lock().push(Published {
            topic: topic.to_string(),
            payload: payload.to_string(),
            options,
        });
        Ok(())
    }

    fn subscribe(&self, filter: &str) -> Result<(), TransportError> {
        self.subscriptions.lock().push(filter.to_string());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Scripted device network.
///
/// Pings succeed unless the address was marked unreachable; every call is
/// recorded.
#[derive(Default)]
pub struct FakeNetwork {
    entities: Mutex<Vec<Entity>>,
    entities_unavailable: AtomicBool,
    unreachable: Mutex<HashSet<String>>,
    ping_delay: Mutex<Duration>,
    pings: Mutex<Vec<(String, bool)>>,
    reads: Mutex<Vec<(String, Vec<String>)>>,
}

impl FakeNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_entities(entities: Vec<Entity>) -> Arc<Self> {
        let network = Self::default();
        *network.entities.lock() = entities;
        Arc::new(network)
    }

    pub fn set_reachable(&self, address: &str, reachable: bool) {
        let mut unreachable = self.unreachable.lock();
        if reachable {
            unreachable.remove(address);
        } else {
            unreachable.insert(address.to_string());
        }
    }

    /// Makes `entities` fail until called again with `true`.
    pub fn set_entities_available(&self, available: bool) {
        self.entities_unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn set_ping_delay(&self, delay: Duration) {
        *self.ping_delay.lock() = delay;
    }

    pub fn pings(&self) -> Vec<(String, bool)> {
        self.pings.lock().clone()
    }

    pub fn reads(&self) -> Vec<(String, Vec<String>)> {
        self.reads.lock().clone()
    }
}

#[async_trait]
impl DeviceNetwork for FakeNetwork {
    async fn entities(&self) -> Result<Vec<Entity>, NetworkError> {
        if self.entities_unavailable.load(Ordering::SeqCst) {
            return Err(NetworkError::Failed("stack not ready".to_string()));
        }
        Ok(self.entities.lock().clone())
    }

    async fn ping(&self, address: &str, disable_recovery: bool) -> Result<(), NetworkError> {
        self.pings.lock().push((address.to_string(), disable_recovery));
        let delay = *self.ping_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.unreachable.lock().contains(address) {
            Err(NetworkError::Unreachable(address.to_string()))
        } else {
            Ok(())
        }
    }

    async fn read_attributes(&self, address: &str, keys: &[String]) -> Result<(), NetworkError> {
        self.reads.lock().push((address.to_string(), keys.to_vec()));
        Ok(())
    }
}

/// Extension that records its lifecycle calls.
pub struct RecordingExtension {
    name: String,
    annotation: Option<(String, Value)>,
    fail_start: bool,
    panic_on: Option<&'static str>,
    calls: Mutex<Vec<&'static str>>,
}

impl RecordingExtension {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            annotation: None,
            fail_start: false,
            panic_on: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_annotation(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.annotation = Some((key.to_string(), value.into()));
        self
    }

    pub fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    /// Panics inside `start` or `stop`, after recording the call.
    pub fn panicking_on(mut self, call: &'static str) -> Self {
        self.panic_on = Some(call);
        self
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Extension for RecordingExtension {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> crate::Result<()> {
        self.calls.lock().push("start");
        assert!(self.panic_on != Some("start"), "{} panicked in start", self.name);
        if self.fail_start {
            return Err(Error::Other("start failed".into()));
        }
        Ok(())
    }

    async fn stop(&self) -> crate::Result<()> {
        self.calls.lock().push("stop");
        assert!(self.panic_on != Some("stop"), "{} panicked in stop", self.name);
        Ok(())
    }

    fn adjust_message_before_publish(&self, _entity: &Entity, message: &mut Attributes) {
        if let Some((key, value)) = &self.annotation {
            message.insert(key.clone(), value.clone());
        }
    }
}

/// A context wired to fakes.
pub struct TestContext {
    pub context: ExtensionContext,
    pub transport: Arc<RecordingTransport>,
    pub network: Arc<FakeNetwork>,
}

impl TestContext {
    pub fn new(settings: BridgeSettings, network: Arc<FakeNetwork>) -> Self {
        let transport = RecordingTransport::new();
        let settings = Arc::new(settings);
        let bus = EventBus::new();
        let cache = StateCache::in_memory();
        let topics = TopicPublisher::new(transport.clone(), &settings.base_topic, settings.force_disable_retain);
        let publisher = Publisher::new(Arc::clone(&settings), cache.clone(), bus.clone(), topics.clone());

        Self {
            context: ExtensionContext {
                bus,
                cache,
                registry: EntityRegistry::new(),
                publisher,
                topics,
                network: network.clone(),
                converter: Arc::new(PassthroughConverter),
                settings,
                control: ExtensionControl::detached(),
            },
            transport,
            network,
        }
    }
}
