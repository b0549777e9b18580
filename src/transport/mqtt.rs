// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! MQTT transport backed by `rumqttc`.
//!
//! # Examples
//!
//! ```no_run
//! use meshbridge::transport::MqttTransport;
//!
//! # async fn example() -> meshbridge::Result<()> {
//! let transport = MqttTransport::builder()
//!     .host("192.168.1.50")
//!     .port(1883)
//!     .credentials("user", "password")
//!     .last_will("meshbridge/bridge/state", r#"{"state":"offline"}"#)
//!     .build()
//!     .await?;
//!
//! let mut events = transport.take_event_receiver().expect("receiver taken once");
//! # let _ = events.recv().await;
//! transport.disconnect().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rumqttc::{AsyncClient, EventLoop, LastWill, MqttOptions};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{BusTransport, PublishOptions, QoS, TransportEvent};
use crate::error::TransportError;
use crate::event::BusMessage;

/// Configuration for an MQTT connection.
#[derive(Debug, Clone)]
struct MqttTransportConfig {
    host: String,
    port: u16,
    client_id: Option<String>,
    credentials: Option<(String, String)>,
    keep_alive: Duration,
    connection_timeout: Duration,
    reconnect_delay: Duration,
    request_capacity: usize,
    event_capacity: usize,
    last_will: Option<(String, String)>,
}

impl Default for MqttTransportConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 1883,
            client_id: None,
            credentials: None,
            keep_alive: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(5),
            request_capacity: 256,
            event_capacity: 1024,
            last_will: None,
        }
    }
}

/// An MQTT 3.1.1 connection implementing [`BusTransport`].
///
/// The connection is established by [`MqttTransportBuilder::build`]. After a
/// connection loss the event loop keeps retrying and re-subscribes every
/// filter once the broker accepts it again.
///
/// Inbound messages and connection changes are delivered through the channel
/// returned by [`take_event_receiver`](Self::take_event_receiver).
///
/// MQTT 3.1.1 has no message expiry; [`PublishOptions::message_expiry`] is
/// ignored.
///
/// `MqttTransport` is cheaply cloneable (via `Arc`).
#[derive(Clone)]
pub struct MqttTransport {
    inner: Arc<MqttTransportInner>,
}

struct MqttTransportInner {
    client: AsyncClient,
    config: MqttTransportConfig,
    connected: AtomicBool,
    subscriptions: Mutex<Vec<String>>,
    event_tx: mpsc::Sender<TransportEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    shutdown: CancellationToken,
}

impl MqttTransport {
    /// Creates a new builder for configuring an MQTT connection.
    #[must_use]
    pub fn builder() -> MqttTransportBuilder {
        MqttTransportBuilder::default()
    }

    /// Returns the host address of the broker.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.inner.config.host
    }

    /// Returns the port of the broker.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.inner.config.port
    }

    /// Takes the receiver of inbound messages and connection changes.
    ///
    /// Returns `None` after the first call.
    pub fn take_event_receiver(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.inner.event_rx.lock().take()
    }

    /// Disconnects from the broker and stops reconnecting.
    ///
    /// # Errors
    ///
    /// Returns error if the disconnect request cannot be sent.
    pub async fn disconnect(&self) -> Result<(), TransportError> {
        tracing::info!(
            host = %self.inner.config.host,
            port = %self.inner.config.port,
            "Disconnecting from MQTT broker"
        );

        let sent = self.inner.client.disconnect().await;
        self.inner.shutdown.cancel();
        self.inner.connected.store(false, Ordering::Release);
        sent?;
        Ok(())
    }

    fn emit(&self, event: TransportEvent) {
        if let Err(e) = self.inner.event_tx.try_send(event) {
            tracing::warn!(error = %e, "Transport event channel full, dropping event");
        }
    }

    fn resubscribe(&self) {
        let filters = self.inner.subscriptions.lock().clone();
        for filter in filters {
            if let Err(e) = self.inner.client.try_subscribe(filter.as_str(), rumqttc::QoS::AtLeastOnce) {
                tracing::warn!(filter = %filter, error = %e, "Failed to restore subscription");
            }
        }
    }
}

impl BusTransport for MqttTransport {
    fn publish(&self, topic: &str, payload: &str, options: PublishOptions) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.inner
            .client
            .try_publish(topic, to_rumqttc(options.qos), options.retain, payload.as_bytes().to_vec())?;
        Ok(())
    }

    fn subscribe(&self, filter: &str) -> Result<(), TransportError> {
        {
            let mut subscriptions = self.inner.subscriptions.lock();
            if !subscriptions.iter().any(|f| f == filter) {
                subscriptions.push(filter.to_string());
            }
        }
        self.inner
            .client
            .try_subscribe(filter, rumqttc::QoS::AtLeastOnce)?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for MqttTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttTransport")
            .field("host", &self.inner.config.host)
            .field("port", &self.inner.config.port)
            .field("connected", &self.is_connected())
            .finish()
    }
}

fn to_rumqttc(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

/// Builder for an [`MqttTransport`].
#[derive(Debug, Default)]
pub struct MqttTransportBuilder {
    config: MqttTransportConfig,
}

impl MqttTransportBuilder {
    /// Sets the broker host address.
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    /// Sets the broker port (default: 1883).
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Sets the client id (default: generated).
    #[must_use]
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.config.client_id = Some(client_id.into());
        self
    }

    /// Sets authentication credentials.
    #[must_use]
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.credentials = Some((username.into(), password.into()));
        self
    }

    /// Sets the keep-alive interval (default: 30 seconds).
    #[must_use]
    pub fn keep_alive(mut self, duration: Duration) -> Self {
        self.config.keep_alive = duration;
        self
    }

    /// Sets the connection timeout (default: 10 seconds).
    #[must_use]
    pub fn connection_timeout(mut self, duration: Duration) -> Self {
        self.config.connection_timeout = duration;
        self
    }

    /// Sets the delay between reconnect attempts (default: 5 seconds).
    #[must_use]
    pub fn reconnect_delay(mut self, duration: Duration) -> Self {
        self.config.reconnect_delay = duration;
        self
    }

    /// Sets how many publishes may wait in the client queue (default: 256).
    #[must_use]
    pub fn request_capacity(mut self, capacity: usize) -> Self {
        self.config.request_capacity = capacity.max(1);
        self
    }

    /// Sets a retained QoS 1 last-will message.
    #[must_use]
    pub fn last_will(mut self, topic: impl Into<String>, payload: impl Into<String>) -> Self {
        self.config.last_will = Some((topic.into(), payload.into()));
        self
    }

    /// Builds and connects to the MQTT broker.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - Host is not set
    /// - Connection fails
    /// - Connection times out
    pub async fn build(self) -> Result<MqttTransport, TransportError> {
        if self.config.host.is_empty() {
            return Err(TransportError::InvalidAddress(
                "MQTT broker host is required".to_string(),
            ));
        }

        let client_id = self
            .config
            .client_id
            .clone()
            .unwrap_or_else(|| format!("meshbridge_{}", Uuid::new_v4().simple()));

        let mut mqtt_options = MqttOptions::new(&client_id, &self.config.host, self.config.port);
        mqtt_options.set_keep_alive(self.config.keep_alive);
        mqtt_options.set_clean_session(true);

        if let Some((ref username, ref password)) = self.config.credentials {
            mqtt_options.set_credentials(username, password);
        }
        if let Some((ref topic, ref payload)) = self.config.last_will {
            mqtt_options.set_last_will(LastWill::new(
                topic.as_str(),
                payload.clone(),
                rumqttc::QoS::AtLeastOnce,
                true,
            ));
        }

        let (client, event_loop) = AsyncClient::new(mqtt_options, self.config.request_capacity);
        let (event_tx, event_rx) = mpsc::channel(self.config.event_capacity);

        let transport = MqttTransport {
            inner: Arc::new(MqttTransportInner {
                client,
                config: self.config.clone(),
                connected: AtomicBool::new(false),
                subscriptions: Mutex::new(Vec::new()),
                event_tx,
                event_rx: Mutex::new(Some(event_rx)),
                shutdown: CancellationToken::new(),
            }),
        };

        let (connack_tx, connack_rx) = oneshot::channel();
        let loop_transport = transport.clone();
        tokio::spawn(async move {
            handle_events(event_loop, loop_transport, connack_tx).await;
        });

        let timeout = self.config.connection_timeout;
        match tokio::time::timeout(timeout, connack_rx).await {
            Ok(Ok(())) => {
                tracing::info!(
                    host = %self.config.host,
                    port = %self.config.port,
                    "Connected to MQTT broker"
                );
                Ok(transport)
            }
            Ok(Err(_)) => {
                transport.inner.shutdown.cancel();
                Err(TransportError::ConnectionFailed(
                    "MQTT event loop terminated unexpectedly".to_string(),
                ))
            }
            Err(_) => {
                transport.inner.shutdown.cancel();
                Err(TransportError::ConnectionFailed(format!(
                    "MQTT connection timeout after {}s",
                    timeout.as_secs()
                )))
            }
        }
    }
}

/// Drives the `rumqttc` event loop until shutdown.
async fn handle_events(
    mut event_loop: EventLoop,
    transport: MqttTransport,
    connack_tx: oneshot::Sender<()>,
) {
    use rumqttc::{Event, Packet};

    let mut connack_tx = Some(connack_tx);
    let shutdown = transport.inner.shutdown.clone();

    loop {
        let polled = tokio::select! {
            () = shutdown.cancelled() => break,
            polled = event_loop.poll() => polled,
        };

        match polled {
            Ok(Event::Incoming(Packet::ConnAck(connack))) => {
                tracing::debug!(?connack, "MQTT broker connected");
                transport.inner.connected.store(true, Ordering::Release);
                if let Some(tx) = connack_tx.take() {
                    let _ = tx.send(());
                } else {
                    tracing::info!("Reconnected to MQTT broker");
                    transport.resubscribe();
                }
                transport.emit(TransportEvent::Connected);
            }
            Ok(Event::Incoming(Packet::SubAck(suback))) => {
                tracing::debug!(?suback, "MQTT subscription acknowledged");
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => match String::from_utf8(publish.payload.to_vec()) {
                Ok(payload) => {
                    tracing::debug!(topic = %publish.topic, "MQTT message received");
                    transport.emit(TransportEvent::Message(BusMessage {
                        topic: publish.topic,
                        payload,
                    }));
                }
                Err(_) => {
                    tracing::warn!(topic = %publish.topic, "Ignoring non UTF-8 MQTT payload");
                }
            },
            Ok(Event::Incoming(Packet::Disconnect)) => {
                tracing::info!("MQTT broker disconnected");
                mark_disconnected(&transport);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(error = %e, "MQTT event loop error");
                mark_disconnected(&transport);
                if connack_tx.is_none() {
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = tokio::time::sleep(transport.inner.config.reconnect_delay) => {}
                    }
                } else {
                    break;
                }
            }
        }
    }
    transport.inner.connected.store(false, Ordering::Release);
}

fn mark_disconnected(transport: &MqttTransport) {
    if transport.inner.connected.swap(false, Ordering::AcqRel) {
        transport.emit(TransportEvent::Disconnected);
    }
}
