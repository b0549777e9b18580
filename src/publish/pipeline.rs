// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The entity state publish pipeline.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use super::payload::{device_information, filter_attributes, flatten_attributes, format_last_seen};
use crate::Attributes;
use crate::entity::{Entity, EntityOptions};
use crate::event::{EventBus, PublishEntityState, PublishReason};
use crate::extension::Extension;
use crate::settings::BridgeSettings;
use crate::state::StateCache;
use crate::transport::{PublishOptions, QoS, TopicPublisher};

struct PublisherInner {
    settings: Arc<BridgeSettings>,
    cache: StateCache,
    bus: EventBus,
    topics: TopicPublisher,
    hooks: RwLock<Vec<Arc<dyn Extension>>>,
}

/// Turns attribute deltas into bus messages.
///
/// [`publish_entity_state`](Self::publish_entity_state) is the only writer of
/// entity state topics. Each call:
///
/// 1. merges the delta into the [`StateCache`];
/// 2. starts from the merged record when `cache_state` is on, else the delta;
/// 3. adds device metadata under `device` when requested;
/// 4. adds `last_seen` and drops `linkquality` per the settings;
/// 5. lets every started extension adjust the message;
/// 6. removes the entity's `filtered_attributes` (the cache keeps them);
/// 7. stops here if the message is empty;
/// 8. publishes JSON and/or per-attribute messages per the output mode;
/// 9. emits [`PublishEntityState`].
///
/// Cloning is cheap and shares the hook list.
#[derive(Clone)]
pub struct Publisher {
    inner: Arc<PublisherInner>,
}

impl Publisher {
    /// Creates a publisher.
    #[must_use]
    pub fn new(
        settings: Arc<BridgeSettings>,
        cache: StateCache,
        bus: EventBus,
        topics: TopicPublisher,
    ) -> Self {
        Self {
            inner: Arc::new(PublisherInner {
                settings,
                cache,
                bus,
                topics,
                hooks: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Returns the state cache written by this publisher.
    #[must_use]
    pub fn cache(&self) -> &StateCache {
        &self.inner.cache
    }

    /// Returns the topic publisher.
    #[must_use]
    pub fn topics(&self) -> &TopicPublisher {
        &self.inner.topics
    }

    /// Adds an extension whose pre-publish hook runs on every publish.
    pub fn register_hook(&self, extension: Arc<dyn Extension>) {
        let mut hooks = self.inner.hooks.write();
        if !hooks.iter().any(|h| Arc::ptr_eq(h, &extension)) {
            hooks.push(extension);
        }
    }

    /// Removes an extension's pre-publish hook.
    pub fn unregister_hook(&self, extension: &Arc<dyn Extension>) {
        self.inner.hooks.write().retain(|h| !Arc::ptr_eq(h, extension));
    }

    /// Returns the number of registered hooks.
    #[must_use]
    pub fn hook_count(&self) -> usize {
        self.inner.hooks.read().len()
    }

    /// Publishes a state delta for an entity.
    ///
    /// Returns the message that was published, or `None` if it was empty and
    /// nothing was sent.
    pub fn publish_entity_state(
        &self,
        entity: &Entity,
        delta: &Attributes,
        reason: PublishReason,
    ) -> Option<Attributes> {
        let settings = &self.inner.settings;
        let options = entity.options();

        let merged = self.inner.cache.set(entity, delta, reason);
        let mut message = if settings.cache_state {
            merged
        } else {
            delta.clone()
        };

        if let Entity::Device(device) = entity {
            let include_info = options
                .device_information
                .unwrap_or(settings.include_device_information);
            if include_info {
                message.insert("device".to_string(), device_information(device));
            }
            if let Some(last_seen) = device.last_seen
                && let Some(formatted) = format_last_seen(last_seen, settings.last_seen)
            {
                message.insert("last_seen".to_string(), formatted);
            }
        }
        if !settings.include_link_quality {
            message.remove("linkquality");
        }

        self.run_hooks(entity, &mut message);
        filter_attributes(&mut message, &options.filtered_attributes);

        if message.is_empty() {
            tracing::trace!(entity = %entity.name(), reason = %reason, "Nothing to publish");
            return None;
        }

        let publish_options = publish_options(options);
        let name = entity.name();
        if settings.output.publishes_json() {
            let json = Value::Object(message.clone()).to_string();
            self.inner.topics.publish(name, &json, publish_options);
        }
        if settings.output.publishes_attributes() {
            for (attribute, payload) in flatten_attributes(&message) {
                let topic = format!("{name}/{attribute}");
                self.inner.topics.publish(&topic, &payload, publish_options);
            }
        }

        self.inner.bus.emit(&PublishEntityState {
            entity: entity.clone(),
            message: message.clone(),
            payload: delta.clone(),
            reason,
        });
        Some(message)
    }

    fn run_hooks(&self, entity: &Entity, message: &mut Attributes) {
        let hooks: Vec<Arc<dyn Extension>> = self.inner.hooks.read().clone();
        for hook in hooks {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                hook.adjust_message_before_publish(entity, message);
            }));
            if outcome.is_err() {
                tracing::error!(
                    extension = %hook.name(),
                    entity = %entity.name(),
                    "Pre-publish hook panicked"
                );
            }
        }
    }
}

fn publish_options(options: &EntityOptions) -> PublishOptions {
    PublishOptions::new()
        .with_retain(options.retain)
        .with_qos(QoS::from_level(options.qos))
        .with_message_expiry(options.retention)
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("topics", &self.inner.topics)
            .field("hooks", &self.hook_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Device, EntityOptions, Group};
    use crate::settings::{LastSeenFormat, OutputMode};
    use crate::testing::{RecordingExtension, RecordingTransport, attrs};
    use chrono::{TimeZone, Utc};
    use parking_lot::Mutex;
    use serde_json::json;

    struct Fixture {
        transport: Arc<RecordingTransport>,
        publisher: Publisher,
        bus: EventBus,
    }

    fn fixture(settings: BridgeSettings) -> Fixture {
        let transport = RecordingTransport::new();
        let bus = EventBus::new();
        let topics = TopicPublisher::new(transport.clone(), &settings.base_topic, settings.force_disable_retain);
        let publisher = Publisher::new(Arc::new(settings), StateCache::in_memory(), bus.clone(), topics);
        Fixture {
            transport,
            publisher,
            bus,
        }
    }

    fn bulb() -> Entity {
        Device::new("0x01", "bulb")
            .with_options(EntityOptions::default().with_retain(true))
            .into()
    }

    #[test]
    fn merges_with_cached_state() {
        let f = fixture(BridgeSettings::default());
        f.publisher.cache().set(&bulb(), &attrs(json!({"brightness": 50})), PublishReason::Device);

        let message = f
            .publisher
            .publish_entity_state(&bulb(), &attrs(json!({"state": "ON"})), PublishReason::Device)
            .unwrap();

        assert_eq!(Value::Object(message), json!({"state": "ON", "brightness": 50}));
        let published = f.transport.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "meshbridge/bulb");
        assert_eq!(published[0].json(), json!({"state": "ON", "brightness": 50}));
        assert!(published[0].options.retain);
    }

    #[test]
    fn without_cache_state_only_delta_is_published() {
        let f = fixture(BridgeSettings::default().with_cache_state(false));
        f.publisher.cache().set(&bulb(), &attrs(json!({"brightness": 50})), PublishReason::Device);

        f.publisher
            .publish_entity_state(&bulb(), &attrs(json!({"state": "ON"})), PublishReason::Device);
        assert_eq!(f.transport.published()[0].json(), json!({"state": "ON"}));
    }

    #[test]
    fn empty_message_is_suppressed() {
        let f = fixture(BridgeSettings::default());
        let events = Arc::new(Mutex::new(0));
        let owner = f.bus.owner("test");
        let counter = Arc::clone(&events);
        f.bus.on(&owner, move |_: &PublishEntityState| {
            *counter.lock() += 1;
            Ok(())
        });

        let result = f
            .publisher
            .publish_entity_state(&bulb(), &Attributes::new(), PublishReason::Device);

        assert!(result.is_none());
        assert!(f.transport.published().is_empty());
        assert_eq!(*events.lock(), 0);
    }

    #[test]
    fn filtered_attributes_stay_in_cache() {
        let f = fixture(BridgeSettings::default());
        let entity: Entity = Device::new("0x02", "sensor")
            .with_options(EntityOptions::default().with_filtered_attributes(["linkquality"]))
            .into();

        f.publisher.publish_entity_state(
            &entity,
            &attrs(json!({"temperature": 20, "linkquality": 80})),
            PublishReason::Device,
        );

        assert_eq!(f.transport.published()[0].json(), json!({"temperature": 20}));
        assert_eq!(f.publisher.cache().get(&entity.id())["linkquality"], json!(80));
    }

    #[test]
    fn attribute_output_mode() {
        let f = fixture(BridgeSettings::default().with_output(OutputMode::Attribute));
        f.publisher.publish_entity_state(
            &bulb(),
            &attrs(json!({"state": "ON", "color": {"x": 0.5}})),
            PublishReason::Device,
        );

        let mut topics: Vec<(String, String)> = f
            .transport
            .published()
            .into_iter()
            .map(|p| (p.topic, p.payload))
            .collect();
        topics.sort();
        assert_eq!(
            topics,
            vec![
                ("meshbridge/bulb/color-x".to_string(), "0.5".to_string()),
                ("meshbridge/bulb/state".to_string(), "ON".to_string()),
            ]
        );
    }

    #[test]
    fn attribute_and_json_publishes_both() {
        let f = fixture(BridgeSettings::default().with_output(OutputMode::AttributeAndJson));
        f.publisher
            .publish_entity_state(&bulb(), &attrs(json!({"state": "ON"})), PublishReason::Device);

        let topics: Vec<String> = f.transport.published().into_iter().map(|p| p.topic).collect();
        assert_eq!(topics, vec!["meshbridge/bulb".to_string(), "meshbridge/bulb/state".to_string()]);
    }

    #[test]
    fn device_information_and_last_seen() {
        let settings = BridgeSettings::default().with_last_seen(LastSeenFormat::Epoch);
        let f = fixture(settings);
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let entity: Entity = Device::new("0x03", "plug")
            .with_last_seen(at)
            .with_options(EntityOptions {
                device_information: Some(true),
                ..EntityOptions::default()
            })
            .into();

        let message = f
            .publisher
            .publish_entity_state(&entity, &attrs(json!({"state": "OFF"})), PublishReason::Device)
            .unwrap();

        assert_eq!(message["last_seen"], json!(at.timestamp_millis()));
        assert_eq!(message["device"]["friendly_name"], json!("plug"));
    }

    #[test]
    fn groups_get_no_device_metadata() {
        let mut settings = BridgeSettings::default().with_last_seen(LastSeenFormat::Iso8601);
        settings.include_device_information = true;
        let f = fixture(settings);
        let group: Entity = Group::new(1, "room").into();

        let message = f
            .publisher
            .publish_entity_state(&group, &attrs(json!({"state": "ON"})), PublishReason::Device)
            .unwrap();
        assert_eq!(Value::Object(message), json!({"state": "ON"}));
    }

    #[test]
    fn link_quality_can_be_dropped() {
        let mut settings = BridgeSettings::default();
        settings.include_link_quality = false;
        let f = fixture(settings);

        f.publisher.publish_entity_state(
            &bulb(),
            &attrs(json!({"state": "ON", "linkquality": 10})),
            PublishReason::Device,
        );
        assert_eq!(f.transport.published()[0].json(), json!({"state": "ON"}));
    }

    #[test]
    fn hooks_adjust_message() {
        let f = fixture(BridgeSettings::default());
        let hook: Arc<dyn Extension> = Arc::new(RecordingExtension::new("annotate").with_annotation("via", "hook"));
        f.publisher.register_hook(Arc::clone(&hook));
        f.publisher.register_hook(Arc::clone(&hook));
        assert_eq!(f.publisher.hook_count(), 1);

        let message = f
            .publisher
            .publish_entity_state(&bulb(), &attrs(json!({"state": "ON"})), PublishReason::Device)
            .unwrap();
        assert_eq!(message["via"], json!("hook"));

        f.publisher.unregister_hook(&hook);
        let message = f
            .publisher
            .publish_entity_state(&bulb(), &attrs(json!({"state": "OFF"})), PublishReason::Device)
            .unwrap();
        assert!(!message.contains_key("via"));
    }

    #[test]
    fn emits_publish_entity_state_event() {
        let f = fixture(BridgeSettings::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let owner = f.bus.owner("test");
        let sink = Arc::clone(&seen);
        f.bus.on(&owner, move |event: &PublishEntityState| {
            sink.lock().push((event.entity.name().to_string(), event.reason, event.payload.clone()));
            Ok(())
        });

        f.publisher
            .publish_entity_state(&bulb(), &attrs(json!({"state": "ON"})), PublishReason::Debounce);

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "bulb");
        assert_eq!(seen[0].1, PublishReason::Debounce);
        assert_eq!(Value::Object(seen[0].2.clone()), json!({"state": "ON"}));
    }

    #[test]
    fn retention_and_qos_options() {
        let f = fixture(BridgeSettings::default().with_force_disable_retain(true));
        let entity: Entity = Device::new("0x04", "lamp")
            .with_options(EntityOptions {
                retain: true,
                qos: 2,
                retention: Some(60),
                ..EntityOptions::default()
            })
            .into();

        f.publisher
            .publish_entity_state(&entity, &attrs(json!({"state": "ON"})), PublishReason::Device);
        let published = &f.transport.published()[0];
        assert!(!published.options.retain);
        assert_eq!(published.options.qos, QoS::ExactlyOnce);
        assert_eq!(published.options.message_expiry, Some(60));
    }
}
