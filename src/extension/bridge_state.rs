// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `bridge/state` extension.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{Extension, ExtensionContext};
use crate::availability::availability_payload;
use crate::error::Result;
use crate::event::{BusConnectionChanged, Subscriptions};
use crate::transport::{PublishOptions, TopicPublisher};

/// Relative topic of the bridge state.
pub const BRIDGE_STATE_TOPIC: &str = "bridge/state";

/// Publishes whether the bridge is running.
///
/// `online` is published on start and after every bus reconnect, `offline`
/// on stop. Both are retained so late subscribers see the current state;
/// register [`bridge_state_payload`] as the transport's last will to cover
/// crashes.
pub struct BridgeState {
    context: ExtensionContext,
    subscriptions: Mutex<Option<Subscriptions>>,
    stopped: AtomicBool,
}

/// Returns the `bridge/state` payload.
#[must_use]
pub fn bridge_state_payload(online: bool, legacy: bool) -> String {
    availability_payload(online, legacy)
}

impl BridgeState {
    /// Creates the extension.
    #[must_use]
    pub fn new(context: ExtensionContext) -> Self {
        Self {
            context,
            subscriptions: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    fn publish(&self, online: bool) {
        publish_state(&self.context.topics, online, self.context.settings.legacy_availability_payload);
    }
}

fn publish_state(topics: &TopicPublisher, online: bool, legacy: bool) {
    topics.publish(
        BRIDGE_STATE_TOPIC,
        &bridge_state_payload(online, legacy),
        PublishOptions::retained(),
    );
}

#[async_trait]
impl Extension for BridgeState {
    fn name(&self) -> &str {
        "bridge_state"
    }

    async fn start(&self) -> Result<()> {
        let subscriptions = Subscriptions::new(&self.context.bus, self.name());
        let topics = self.context.topics.clone();
        let legacy = self.context.settings.legacy_availability_payload;
        subscriptions.on(move |event: &BusConnectionChanged| {
            if event.connected {
                publish_state(&topics, true, legacy);
            }
            Ok(())
        });
        *self.subscriptions.lock() = Some(subscriptions);

        self.publish(true);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(subscriptions) = self.subscriptions.lock().take() {
            subscriptions.dispose();
        }
        self.publish(false);
        Ok(())
    }
}

impl std::fmt::Debug for BridgeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeState")
            .field("stopped", &self.stopped.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::BridgeSettings;
    use crate::testing::{FakeNetwork, TestContext};

    fn payloads(test: &TestContext) -> Vec<String> {
        test.transport
            .published_to("meshbridge/bridge/state")
            .into_iter()
            .map(|p| p.payload)
            .collect()
    }

    #[tokio::test]
    async fn online_on_start_and_reconnect_offline_on_stop() {
        let test = TestContext::new(BridgeSettings::default(), FakeNetwork::new());
        let extension = BridgeState::new(test.context.clone());

        extension.start().await.unwrap();
        test.context.bus.emit(&BusConnectionChanged { connected: false });
        test.context.bus.emit(&BusConnectionChanged { connected: true });
        extension.stop().await.unwrap();
        extension.stop().await.unwrap();
        test.context.bus.emit(&BusConnectionChanged { connected: true });

        assert_eq!(
            payloads(&test),
            vec![
                r#"{"state":"online"}"#,
                r#"{"state":"online"}"#,
                r#"{"state":"offline"}"#,
            ]
        );
        let published = test.transport.published_to("meshbridge/bridge/state");
        assert!(published.iter().all(|p| p.options.retain));
    }

    #[tokio::test]
    async fn legacy_payload() {
        let settings = BridgeSettings::default().with_legacy_availability_payload(true);
        let test = TestContext::new(settings, FakeNetwork::new());
        let extension = BridgeState::new(test.context.clone());

        extension.start().await.unwrap();
        assert_eq!(payloads(&test), vec!["online"]);
    }
}
