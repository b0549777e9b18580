// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The receive extension: device messages to entity state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::time::Instant;

use super::{Extension, ExtensionContext};
use crate::coalesce::Coalescer;
use crate::entity::{Entity, EntityId};
use crate::error::Result;
use crate::event::{DeviceLeave, DeviceMessage, EntityRemoved, PublishEntityState, PublishReason, Subscriptions};
use crate::network::MessageFingerprint;

struct Shared {
    context: ExtensionContext,
    coalescer: Coalescer,
    fingerprints: Mutex<HashMap<String, MessageFingerprint>>,
    last_message: Mutex<HashMap<String, Instant>>,
    subscriptions: Mutex<Option<Subscriptions>>,
    stopped: AtomicBool,
}

/// Converts device messages and publishes the result.
///
/// For each [`DeviceMessage`] of a known, enabled device:
///
/// - frames repeating the previous `(endpoint, cluster, kind, sequence)` of
///   the same device are dropped;
/// - the frame is converted by the [`MessageConverter`](crate::network::MessageConverter);
///   an empty result is dropped;
/// - `linkquality` and, when the device has the `elapsed` option, `elapsed`
///   are added;
/// - the attributes are debounced, throttled or published right away,
///   following the device options.
pub struct Receive {
    shared: Arc<Shared>,
}

impl Receive {
    /// Creates the extension.
    #[must_use]
    pub fn new(context: ExtensionContext) -> Self {
        let coalescer = Coalescer::new(context.publisher.clone(), context.registry.clone());
        Self {
            shared: Arc::new(Shared {
                context,
                coalescer,
                fingerprints: Mutex::new(HashMap::new()),
                last_message: Mutex::new(HashMap::new()),
                subscriptions: Mutex::new(None),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Returns the coalescer holding pending debounce and throttle payloads.
    #[must_use]
    pub fn coalescer(&self) -> &Coalescer {
        &self.shared.coalescer
    }
}

#[async_trait]
impl Extension for Receive {
    fn name(&self) -> &str {
        "receive"
    }

    async fn start(&self) -> Result<()> {
        let subscriptions = Subscriptions::new(&self.shared.context.bus, self.name());

        let weak = Arc::downgrade(&self.shared);
        subscriptions.on(move |event: &DeviceMessage| {
            if let Some(shared) = Weak::upgrade(&weak) {
                shared.on_message(event);
            }
            Ok(())
        });

        let weak = Arc::downgrade(&self.shared);
        subscriptions.on(move |event: &PublishEntityState| {
            if let Some(shared) = Weak::upgrade(&weak)
                && event.reason != PublishReason::Debounce
            {
                shared.coalescer.forget_keys(&event.entity.id(), event.payload.keys());
            }
            Ok(())
        });

        let weak = Arc::downgrade(&self.shared);
        subscriptions.on(move |event: &DeviceLeave| {
            if let Some(shared) = Weak::upgrade(&weak) {
                shared.forget(&EntityId::device(event.address.clone()));
            }
            Ok(())
        });

        let weak = Arc::downgrade(&self.shared);
        subscriptions.on(move |event: &EntityRemoved| {
            if let Some(shared) = Weak::upgrade(&weak) {
                shared.forget(&event.id);
            }
            Ok(())
        });

        *self.shared.subscriptions.lock() = Some(subscriptions);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if self.shared.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(subscriptions) = self.shared.subscriptions.lock().take() {
            subscriptions.dispose();
        }
        self.shared.coalescer.stop();
        Ok(())
    }
}

impl std::fmt::Debug for Receive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Receive")
            .field("coalescer", &self.shared.coalescer)
            .field("stopped", &self.shared.stopped.load(Ordering::Acquire))
            .finish()
    }
}

impl Shared {
    fn on_message(&self, event: &DeviceMessage) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        let address = &event.device.address;
        let Some(device) = self.context.registry.device(address) else {
            tracing::debug!(device = %address, "Message from unknown device");
            return;
        };
        if device.options.disabled {
            return;
        }

        if let Some(fingerprint) = event.message.fingerprint() {
            let mut fingerprints = self.fingerprints.lock();
            if fingerprints.get(address) == Some(&fingerprint) {
                tracing::debug!(entity = %device.friendly_name, "Skipping repeated message");
                return;
            }
            fingerprints.insert(address.clone(), fingerprint);
        }

        let mut payload = self.context.converter.convert(&device, &event.message);
        if payload.is_empty() {
            tracing::debug!(
                entity = %device.friendly_name,
                cluster = %event.message.cluster,
                kind = %event.message.kind,
                "No converter output for message"
            );
            return;
        }
        if let Some(link_quality) = event.message.link_quality {
            payload.insert("linkquality".to_string(), json!(link_quality));
        }
        if device.options.elapsed {
            let now = Instant::now();
            let previous = self.last_message.lock().insert(address.clone(), now);
            if let Some(previous) = previous {
                let elapsed = now.duration_since(previous).as_millis();
                payload.insert("elapsed".to_string(), json!(u64::try_from(elapsed).unwrap_or(u64::MAX)));
            }
        }

        let options = device.options.clone();
        let entity = Entity::from(device);
        if let Some(window) = options.debounce_window() {
            self.coalescer
                .debounce(&entity, &payload, window, &options.debounce_ignore);
        } else if let Some(window) = options.throttle_window() {
            self.coalescer.throttle(&entity, &payload, window);
        } else {
            self.context
                .publisher
                .publish_entity_state(&entity, &payload, PublishReason::Device);
        }
    }

    fn forget(&self, id: &EntityId) {
        self.coalescer.forget(id);
        if let Some(address) = id.address() {
            self.fingerprints.lock().remove(address);
            self.last_message.lock().remove(address);
        }
    }
}
