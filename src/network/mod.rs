// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Boundary to the mesh radio stack and the converter registry.
//!
//! The runtime never speaks the radio protocol itself. The host application
//! supplies a [`DeviceNetwork`] to ping and query devices, a
//! [`MessageConverter`] to turn raw cluster data into attributes, and feeds
//! [`NetworkEvent`]s into the bridge through a channel.

use async_trait::async_trait;

use crate::Attributes;
use crate::entity::{Device, Entity};
use crate::error::NetworkError;

/// Raw cluster data received from a device.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    /// Source endpoint.
    pub endpoint: u8,
    /// Cluster name, e.g. `genOnOff`.
    pub cluster: String,
    /// Message kind, e.g. `attributeReport` or `commandOn`.
    pub kind: String,
    /// Decoded cluster payload.
    pub data: Attributes,
    /// Link quality of the frame.
    pub link_quality: Option<u8>,
    /// Application-level transaction sequence number.
    pub transaction_sequence: Option<u8>,
    /// Group the frame was addressed to, for group casts.
    pub group_id: Option<u16>,
}

impl RawMessage {
    /// Creates a message on endpoint 1.
    #[must_use]
    pub fn new(cluster: impl Into<String>, kind: impl Into<String>, data: Attributes) -> Self {
        Self {
            endpoint: 1,
            cluster: cluster.into(),
            kind: kind.into(),
            data,
            link_quality: None,
            transaction_sequence: None,
            group_id: None,
        }
    }

    /// Sets the source endpoint.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: u8) -> Self {
        self.endpoint = endpoint;
        self
    }

    /// Sets the link quality.
    #[must_use]
    pub fn with_link_quality(mut self, link_quality: u8) -> Self {
        self.link_quality = Some(link_quality);
        self
    }

    /// Sets the transaction sequence number.
    #[must_use]
    pub fn with_transaction_sequence(mut self, sequence: u8) -> Self {
        self.transaction_sequence = Some(sequence);
        self
    }

    /// Returns the de-duplication fingerprint.
    ///
    /// Frames without a transaction sequence cannot be told apart from
    /// legitimate repeats and have no fingerprint.
    #[must_use]
    pub fn fingerprint(&self) -> Option<MessageFingerprint> {
        self.transaction_sequence.map(|sequence| MessageFingerprint {
            endpoint: self.endpoint,
            cluster: self.cluster.clone(),
            kind: self.kind.clone(),
            sequence,
        })
    }
}

/// Identity of a frame for duplicate suppression.
///
/// Devices retransmit when they miss an acknowledgement; the retransmission
/// carries the same fingerprint and must not be published twice.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageFingerprint {
    /// Source endpoint.
    pub endpoint: u8,
    /// Cluster name.
    pub cluster: String,
    /// Message kind.
    pub kind: String,
    /// Transaction sequence number.
    pub sequence: u8,
}

/// Progress of a device interview.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterviewStatus {
    /// The interview started.
    Started,
    /// The interview completed; the device definition is known.
    Successful,
    /// The interview failed.
    Failed,
}

/// Events produced by the radio stack.
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    /// A device sent data.
    Message {
        /// Source device address.
        address: String,
        /// The raw frame.
        message: RawMessage,
    },
    /// A new device joined the network.
    Joined {
        /// The device as known so far.
        device: Device,
    },
    /// A device left the network.
    Left {
        /// Address of the departed device.
        address: String,
    },
    /// A device announced itself, usually after a power cycle.
    Announce {
        /// Address of the announcing device.
        address: String,
    },
    /// Interview progress for a device.
    Interview {
        /// The device, with capabilities filled in on success.
        device: Device,
        /// Interview progress.
        status: InterviewStatus,
    },
}

/// The mesh radio stack, as seen by the runtime.
#[async_trait]
pub trait DeviceNetwork: Send + Sync {
    /// Returns every known device and group.
    async fn entities(&self) -> Result<Vec<Entity>, NetworkError>;

    /// Checks that a device responds.
    ///
    /// `disable_recovery` asks the stack not to run its own route recovery
    /// before giving up, which keeps a single attempt short.
    async fn ping(&self, address: &str, disable_recovery: bool) -> Result<(), NetworkError>;

    /// Asks a device to report the given attributes.
    ///
    /// The values arrive later as ordinary [`NetworkEvent::Message`]s.
    async fn read_attributes(&self, address: &str, keys: &[String]) -> Result<(), NetworkError>;
}

/// Maps raw cluster data to semantic attributes.
pub trait MessageConverter: Send + Sync {
    /// Converts a frame; an empty map means nothing to publish.
    fn convert(&self, device: &Device, message: &RawMessage) -> Attributes;
}

/// Converter that publishes cluster data unchanged.
///
/// Useful for devices whose stack already decodes to attribute names.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughConverter;

impl MessageConverter for PassthroughConverter {
    fn convert(&self, _device: &Device, message: &RawMessage) -> Attributes {
        message
            .data
            .iter()
            .filter(|(_, value)| !value.is_null())
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }
}

impl<F> MessageConverter for F
where
    F: Fn(&Device, &RawMessage) -> Attributes + Send + Sync,
{
    fn convert(&self, device: &Device, message: &RawMessage) -> Attributes {
        self(device, message)
    }
}
