// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Message bus transport.
//!
//! - [`BusTransport`] - What the runtime needs from a bus client
//! - [`TopicPublisher`] - Base-topic aware, fault-tolerant publishing
//! - [`MqttTransport`] - `rumqttc` implementation (feature `mqtt`)
//!
//! Publishing is non-blocking: a transport hands the message to its client
//! queue and returns. The runtime never waits for a broker acknowledgement.

#[cfg(feature = "mqtt")]
mod mqtt;

use std::sync::Arc;

#[cfg(feature = "mqtt")]
pub use mqtt::{MqttTransport, MqttTransportBuilder};

use crate::error::TransportError;
use crate::event::BusMessage;

/// Delivery guarantee of a publish or subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum QoS {
    /// Fire and forget.
    #[default]
    AtMostOnce,
    /// Acknowledged delivery, possibly duplicated.
    AtLeastOnce,
    /// Exactly-once handshake.
    ExactlyOnce,
}

impl QoS {
    /// Maps a numeric level to a QoS, saturating above 2.
    #[must_use]
    pub const fn from_level(level: u8) -> Self {
        match level {
            0 => Self::AtMostOnce,
            1 => Self::AtLeastOnce,
            _ => Self::ExactlyOnce,
        }
    }
}

/// Options of a single publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// Delivery guarantee.
    pub qos: QoS,
    /// Ask the broker to keep the message for new subscribers.
    pub retain: bool,
    /// Seconds after which the broker discards the message.
    pub message_expiry: Option<u32>,
}

impl PublishOptions {
    /// Non-retained, QoS 0, no expiry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Retained, QoS 1; used for availability and bridge state.
    #[must_use]
    pub fn retained() -> Self {
        Self {
            qos: QoS::AtLeastOnce,
            retain: true,
            message_expiry: None,
        }
    }

    /// Sets the QoS.
    #[must_use]
    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    /// Sets the retain flag.
    #[must_use]
    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    /// Sets the message expiry in seconds.
    #[must_use]
    pub fn with_message_expiry(mut self, seconds: Option<u32>) -> Self {
        self.message_expiry = seconds;
        self
    }
}

/// What a transport reports to the bridge.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The transport (re)connected.
    Connected,
    /// The transport lost its connection.
    Disconnected,
    /// A message arrived on a subscribed topic.
    Message(BusMessage),
}

/// A message bus client.
///
/// Implementations must not block: [`publish`](Self::publish) enqueues and
/// returns, failing if the message cannot be queued.
pub trait BusTransport: Send + Sync {
    /// Enqueues a message for publication.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be queued.
    fn publish(&self, topic: &str, payload: &str, options: PublishOptions) -> Result<(), TransportError>;

    /// Subscribes to a topic filter. Subscriptions survive reconnects.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be queued.
    fn subscribe(&self, filter: &str) -> Result<(), TransportError>;

    /// Returns `true` while connected to the broker.
    fn is_connected(&self) -> bool;
}

/// Publishes relative topics under the configured base topic.
///
/// Publishing never fails from the caller's point of view: while the
/// transport is disconnected, or when it rejects a message, the message is
/// logged and dropped. The `force_disable_retain` setting clears the retain
/// flag of every message.
///
/// Cloning is cheap and shares the transport.
#[derive(Clone)]
pub struct TopicPublisher {
    transport: Arc<dyn BusTransport>,
    base_topic: Arc<str>,
    force_disable_retain: bool,
}

impl TopicPublisher {
    /// Creates a publisher for `base_topic`.
    #[must_use]
    pub fn new(transport: Arc<dyn BusTransport>, base_topic: &str, force_disable_retain: bool) -> Self {
        Self {
            transport,
            base_topic: Arc::from(base_topic),
            force_disable_retain,
        }
    }

    /// Returns the base topic.
    #[must_use]
    pub fn base_topic(&self) -> &str {
        &self.base_topic
    }

    /// Returns the absolute form of a relative topic.
    #[must_use]
    pub fn full_topic(&self, topic: &str) -> String {
        format!("{}/{topic}", self.base_topic)
    }

    /// Returns the relative form of an absolute topic under the base topic.
    #[must_use]
    pub fn relative_topic<'a>(&self, topic: &'a str) -> Option<&'a str> {
        topic
            .strip_prefix(&*self.base_topic)
            .and_then(|rest| rest.strip_prefix('/'))
    }

    /// Returns `true` while the transport is connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Publishes `payload` on `<base>/<topic>`.
    ///
    /// Returns `true` if the transport accepted the message.
    pub fn publish(&self, topic: &str, payload: &str, mut options: PublishOptions) -> bool {
        let full = self.full_topic(topic);
        if self.force_disable_retain {
            options.retain = false;
        }

        if !self.transport.is_connected() {
            tracing::error!(topic = %full, "Not connected to the message bus, dropping message");
            return false;
        }

        match self.transport.publish(&full, payload, options) {
            Ok(()) => {
                tracing::debug!(
                    topic = %full,
                    payload = %payload,
                    retain = options.retain,
                    "Published"
                );
                true
            }
            Err(e) => {
                tracing::error!(topic = %full, error = %e, "Failed to publish");
                false
            }
        }
    }

    /// Clears a retained message by publishing an empty retained payload.
    pub fn clear_retained(&self, topic: &str) -> bool {
        let full = self.full_topic(topic);
        if !self.transport.is_connected() {
            tracing::error!(topic = %full, "Not connected to the message bus, cannot clear retained message");
            return false;
        }
        match self.transport.publish(&full, "", PublishOptions::retained()) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(topic = %full, error = %e, "Failed to clear retained message");
                false
            }
        }
    }

    /// Subscribes to `<base>/<filter>`.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport rejects the request.
    pub fn subscribe(&self, filter: &str) -> Result<(), TransportError> {
        let full = self.full_topic(filter);
        self.transport.subscribe(&full)?;
        tracing::debug!(filter = %full, "Subscribed");
        Ok(())
    }
}

impl std::fmt::Debug for TopicPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicPublisher")
            .field("base_topic", &self.base_topic)
            .field("force_disable_retain", &self.force_disable_retain)
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingTransport;

    #[test]
    fn qos_from_level() {
        assert_eq!(QoS::from_level(0), QoS::AtMostOnce);
        assert_eq!(QoS::from_level(1), QoS::AtLeastOnce);
        assert_eq!(QoS::from_level(2), QoS::ExactlyOnce);
        assert_eq!(QoS::from_level(9), QoS::ExactlyOnce);
    }

    #[test]
    fn publishes_under_base_topic() {
        let transport = RecordingTransport::new();
        let publisher = TopicPublisher::new(transport.clone(), "home", false);

        assert!(publisher.publish("bulb", "{}", PublishOptions::retained()));
        let published = transport.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "home/bulb");
        assert!(published[0].options.retain);
    }

    #[test]
    fn force_disable_retain_clears_flag() {
        let transport = RecordingTransport::new();
        let publisher = TopicPublisher::new(transport.clone(), "home", true);

        publisher.publish("bulb", "{}", PublishOptions::retained());
        assert!(!transport.published()[0].options.retain);
    }

    #[test]
    fn disconnected_messages_are_dropped() {
        let transport = RecordingTransport::new();
        transport.set_connected(false);
        let publisher = TopicPublisher::new(transport.clone(), "home", false);

        assert!(!publisher.publish("bulb", "{}", PublishOptions::new()));
        assert!(!publisher.clear_retained("bulb"));
        assert!(transport.published().is_empty());
    }

    #[test]
    fn relative_topic_strips_base() {
        let transport = RecordingTransport::new();
        let publisher = TopicPublisher::new(transport, "home", false);

        assert_eq!(publisher.relative_topic("home/bulb/set"), Some("bulb/set"));
        assert_eq!(publisher.relative_topic("homes/bulb"), None);
        assert_eq!(publisher.relative_topic("other/bulb"), None);
    }

    #[test]
    fn clear_retained_publishes_empty_payload() {
        let transport = RecordingTransport::new();
        let publisher = TopicPublisher::new(transport.clone(), "home", false);

        publisher.clear_retained("old/availability");
        let published = transport.published();
        assert_eq!(published[0].topic, "home/old/availability");
        assert_eq!(published[0].payload, "");
        assert!(published[0].options.retain);
    }
}
