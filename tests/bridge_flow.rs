// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end tests of the bridge with an in-memory bus and device network.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use meshbridge::entity::{DeviceKind, PowerSource};
use meshbridge::error::{NetworkError, TransportError};
use meshbridge::extension::ExtensionState;
use meshbridge::{
    Attributes, Bridge, BridgeSettings, BusTransport, Device, DeviceNetwork, Entity, EntityOptions,
    Extension, ExtensionContext, ExtensionFactory, Group, NetworkEvent, PublishOptions, RawMessage,
};
use parking_lot::Mutex;
use serde_json::{Value, json};

#[derive(Debug, Clone)]
struct Published {
    topic: String,
    payload: String,
    retain: bool,
}

#[derive(Default)]
struct MemoryBus {
    published: Mutex<Vec<Published>>,
    subscriptions: Mutex<Vec<String>>,
    offline: AtomicBool,
}

impl MemoryBus {
    fn payloads(&self, topic: &str) -> Vec<String> {
        self.published
            .lock()
            .iter()
            .filter(|p| p.topic == topic)
            .map(|p| p.payload.clone())
            .collect()
    }

    fn last_json(&self, topic: &str) -> Option<Value> {
        self.payloads(topic)
            .last()
            .and_then(|payload| serde_json::from_str(payload).ok())
    }
}

impl BusTransport for MemoryBus {
    fn publish(&self, topic: &str, payload: &str, options: PublishOptions) -> Result<(), TransportError> {
        self.published.lock().push(Published {
            topic: topic.to_string(),
            payload: payload.to_string(),
            retain: options.retain,
        });
        Ok(())
    }

    fn subscribe(&self, filter: &str) -> Result<(), TransportError> {
        self.subscriptions.lock().push(filter.to_string());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.offline.load(Ordering::SeqCst)
    }
}

struct StaticNetwork {
    entities: Vec<Entity>,
}

#[async_trait]
impl DeviceNetwork for StaticNetwork {
    async fn entities(&self) -> Result<Vec<Entity>, NetworkError> {
        Ok(self.entities.clone())
    }

    async fn ping(&self, _address: &str, _disable_recovery: bool) -> Result<(), NetworkError> {
        Ok(())
    }

    async fn read_attributes(&self, _address: &str, _keys: &[String]) -> Result<(), NetworkError> {
        Ok(())
    }
}

/// Maps the on/off cluster to `state`.
fn on_off_converter(_device: &Device, message: &RawMessage) -> Attributes {
    let mut out = Attributes::new();
    if let Some(on) = message.data.get("onOff").and_then(Value::as_u64) {
        let state = if on == 1 { "ON" } else { "OFF" };
        out.insert("state".to_string(), json!(state));
    }
    if let Some(level) = message.data.get("currentLevel") {
        out.insert("brightness".to_string(), level.clone());
    }
    out
}

fn bulb() -> Device {
    Device::new("0x0017880103a0c2f4", "bulb")
        .with_kind(DeviceKind::Router)
        .with_power_source(PowerSource::Mains)
        .with_options(EntityOptions::default().with_retain(true))
}

fn settings(extensions: &[&str]) -> BridgeSettings {
    let mut settings = BridgeSettings::default().with_extensions(extensions.iter().copied());
    settings.cache_state_persistent = false;
    settings
}

fn bridge(settings: BridgeSettings, entities: Vec<Entity>) -> (Bridge, Arc<MemoryBus>) {
    let bus = Arc::new(MemoryBus::default());
    let bridge = Bridge::new(
        settings,
        bus.clone(),
        Arc::new(StaticNetwork { entities }),
        Arc::new(on_off_converter),
    );
    (bridge, bus)
}

fn report(data: Value, sequence: u8) -> NetworkEvent {
    let Value::Object(data) = data else {
        panic!("object expected");
    };
    NetworkEvent::Message {
        address: "0x0017880103a0c2f4".to_string(),
        message: RawMessage::new("genOnOff", "attributeReport", data)
            .with_link_quality(87)
            .with_transaction_sequence(sequence),
    }
}

// ============================================================================
// State Flow Tests
// ============================================================================

mod state_flow {
    use super::*;

    #[tokio::test]
    async fn device_report_is_merged_with_cached_state() {
        let (bridge, bus) = bridge(settings(&["bridge_state", "receive"]), vec![bulb().into()]);
        bridge.start().await.unwrap();

        let Value::Object(brightness) = json!({"brightness": 50}) else {
            unreachable!()
        };
        bridge.publish_entity_state("bulb", &brightness).unwrap();
        bridge.handle_network_event(report(json!({"onOff": 1}), 1));

        assert_eq!(
            bus.last_json("meshbridge/bulb"),
            Some(json!({"brightness": 50, "state": "ON", "linkquality": 87}))
        );
        let retained = bus.published.lock().iter().all(|p| p.retain);
        assert!(retained);
        bridge.stop().await;
    }

    #[tokio::test]
    async fn bridge_state_online_then_offline() {
        let (bridge, bus) = bridge(settings(&["bridge_state"]), Vec::new());
        bridge.start().await.unwrap();
        bridge.stop().await;

        assert_eq!(
            bus.payloads("meshbridge/bridge/state"),
            vec![r#"{"state":"online"}"#, r#"{"state":"offline"}"#]
        );
    }

    #[tokio::test]
    async fn disconnected_bus_drops_messages() {
        let (bridge, bus) = bridge(settings(&["receive"]), vec![bulb().into()]);
        bridge.start().await.unwrap();
        bus.offline.store(true, Ordering::SeqCst);

        bridge.handle_network_event(report(json!({"onOff": 0}), 1));
        assert!(bus.payloads("meshbridge/bulb").is_empty());

        let cached = bridge.cache().get(&bulb().id());
        assert_eq!(cached.get("state"), Some(&json!("OFF")));
        bridge.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn debounced_reports_are_combined() {
        let device = bulb().with_options(EntityOptions::default().with_debounce(0.5));
        let (bridge, bus) = bridge(settings(&["receive"]), vec![device.into()]);
        bridge.start().await.unwrap();

        bridge.handle_network_event(report(json!({"onOff": 1}), 1));
        bridge.handle_network_event(report(json!({"currentLevel": 200}), 2));
        assert!(bus.payloads("meshbridge/bulb").is_empty());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(
            bus.last_json("meshbridge/bulb"),
            Some(json!({"state": "ON", "brightness": 200, "linkquality": 87}))
        );
        bridge.stop().await;
    }

    #[tokio::test]
    async fn rename_moves_retained_state() {
        let (bridge, bus) = bridge(settings(&["receive"]), vec![bulb().into()]);
        bridge.start().await.unwrap();
        bridge.handle_network_event(report(json!({"onOff": 1}), 1));

        bridge.rename_entity("bulb", "desk_lamp").unwrap();

        assert_eq!(bus.payloads("meshbridge/bulb").last().map(String::as_str), Some(""));
        assert_eq!(
            bus.last_json("meshbridge/desk_lamp"),
            Some(json!({"state": "ON", "linkquality": 87}))
        );
        bridge.stop().await;
    }
}

// ============================================================================
// Availability Tests
// ============================================================================

mod availability {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn devices_and_groups_are_published_online() {
        let group = Group::new(5, "living_room").with_members(["0x0017880103a0c2f4"]);
        let (bridge, bus) = bridge(
            settings(&["availability"]),
            vec![bulb().with_last_seen(chrono::Utc::now()).into(), group.into()],
        );
        bridge.start().await.unwrap();

        assert_eq!(
            bus.payloads("meshbridge/bulb/availability"),
            vec![r#"{"state":"online"}"#]
        );
        assert_eq!(
            bus.payloads("meshbridge/living_room/availability"),
            vec![r#"{"state":"online"}"#]
        );
        bridge.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn leaving_device_clears_availability() {
        let (bridge, bus) = bridge(
            settings(&["availability"]),
            vec![bulb().with_last_seen(chrono::Utc::now()).into()],
        );
        bridge.start().await.unwrap();

        bridge.handle_network_event(NetworkEvent::Left {
            address: "0x0017880103a0c2f4".to_string(),
        });
        assert_eq!(
            bus.payloads("meshbridge/bulb/availability").last().map(String::as_str),
            Some("")
        );
        bridge.stop().await;
    }
}

// ============================================================================
// Extension Tests
// ============================================================================

mod extensions {
    use super::*;

    struct Annotate;

    #[async_trait]
    impl Extension for Annotate {
        fn name(&self) -> &str {
            "annotate"
        }

        async fn start(&self) -> meshbridge::Result<()> {
            Ok(())
        }

        async fn stop(&self) -> meshbridge::Result<()> {
            Ok(())
        }

        fn adjust_message_before_publish(&self, _entity: &Entity, message: &mut Attributes) {
            message.insert("source".to_string(), json!("mesh"));
        }
    }

    struct AnnotateFactory;

    impl ExtensionFactory for AnnotateFactory {
        fn name(&self) -> &str {
            "annotate"
        }

        fn create(&self, _context: ExtensionContext) -> Arc<dyn Extension> {
            Arc::new(Annotate)
        }
    }

    #[tokio::test]
    async fn factory_extension_adjusts_messages() {
        let (bridge, bus) = bridge(settings(&["receive", "annotate"]), vec![bulb().into()]);
        bridge.extensions().register_factory(Arc::new(AnnotateFactory));
        bridge.start().await.unwrap();

        bridge.handle_network_event(report(json!({"onOff": 1}), 1));
        assert_eq!(bus.last_json("meshbridge/bulb").unwrap()["source"], json!("mesh"));

        bridge.extensions().disable("annotate").await.unwrap();
        assert_eq!(
            bridge.extensions().state_of("annotate"),
            Some(ExtensionState::Stopped)
        );
        bridge.handle_network_event(report(json!({"onOff": 0}), 2));
        assert!(bus.last_json("meshbridge/bulb").unwrap().get("source").is_none());
        bridge.stop().await;
    }

    #[tokio::test]
    async fn runtime_enable_and_disable() {
        let (bridge, bus) = bridge(settings(&["receive"]), Vec::new());
        bridge.start().await.unwrap();

        bridge.extensions().enable("bridge_state").await.unwrap();
        assert!(bridge.extensions().enable("bridge_state").await.is_err());
        bridge.extensions().disable("bridge_state").await.unwrap();
        assert!(bridge.extensions().enable("frontend").await.is_err());

        assert_eq!(
            bus.payloads("meshbridge/bridge/state"),
            vec![r#"{"state":"online"}"#, r#"{"state":"offline"}"#]
        );
        bridge.stop().await;
    }
}
