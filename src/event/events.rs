// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Event payloads carried by the [`EventBus`](super::EventBus).

use std::fmt;

use chrono::{DateTime, Utc};

use super::BusEvent;
use crate::Attributes;
use crate::availability::AvailabilityState;
use crate::entity::{Device, Entity, EntityId, EntityOptions, Group};
use crate::network::{InterviewStatus, RawMessage};

macro_rules! bus_event {
    ($($ty:ident => $name:literal),+ $(,)?) => {
        $(
            impl BusEvent for $ty {
                const NAME: &'static str = $name;
            }
        )+
    };
}

bus_event! {
    DeviceMessage => "deviceMessage",
    LastSeenChanged => "lastSeenChanged",
    PublishEntityState => "publishEntityState",
    BusMessage => "busMessage",
    BusConnectionChanged => "busConnectionChanged",
    DeviceJoined => "deviceJoined",
    DeviceLeave => "deviceLeave",
    DeviceAnnounce => "deviceAnnounce",
    DeviceInterview => "deviceInterview",
    EntityRenamed => "entityRenamed",
    EntityRemoved => "entityRemoved",
    EntityOptionsChanged => "entityOptionsChanged",
    GroupMembersChanged => "groupMembersChanged",
    AvailabilityChanged => "availabilityChanged",
}

/// Why an entity state was published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PublishReason {
    /// A device message published without coalescing.
    Device,
    /// A debounce window flushed.
    Debounce,
    /// A throttle window flushed.
    Throttle,
    /// The cached state was republished, e.g. after a rename.
    Cached,
    /// Anything else, e.g. a command confirmation from a routing extension.
    External,
}

impl fmt::Display for PublishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Device => "device",
            Self::Debounce => "debounce",
            Self::Throttle => "throttle",
            Self::Cached => "cached",
            Self::External => "external",
        };
        f.write_str(name)
    }
}

/// A device sent data.
#[derive(Debug, Clone)]
pub struct DeviceMessage {
    /// The sending device.
    pub device: Device,
    /// The raw frame.
    pub message: RawMessage,
}

/// A device was heard from.
#[derive(Debug, Clone)]
pub struct LastSeenChanged {
    /// The device, with `last_seen` already updated.
    pub device: Device,
    /// The timestamp before this update.
    pub previous: Option<DateTime<Utc>>,
}

/// An entity state was published.
#[derive(Debug, Clone)]
pub struct PublishEntityState {
    /// The entity.
    pub entity: Entity,
    /// The message as published.
    pub message: Attributes,
    /// The delta that caused the publish.
    pub payload: Attributes,
    /// Why the state was published.
    pub reason: PublishReason,
}

/// A message arrived from the bus.
#[derive(Debug, Clone)]
pub struct BusMessage {
    /// Full topic, including the base topic.
    pub topic: String,
    /// UTF-8 payload.
    pub payload: String,
}

/// The bus transport connected or disconnected.
#[derive(Debug, Clone, Copy)]
pub struct BusConnectionChanged {
    /// The transport is connected.
    pub connected: bool,
}

/// A device joined the network.
#[derive(Debug, Clone)]
pub struct DeviceJoined {
    /// The new device.
    pub device: Device,
}

/// A device left the network.
#[derive(Debug, Clone)]
pub struct DeviceLeave {
    /// Address of the device.
    pub address: String,
    /// Friendly name, if the device was registered.
    pub name: Option<String>,
}

/// A device announced itself.
#[derive(Debug, Clone)]
pub struct DeviceAnnounce {
    /// The announcing device.
    pub device: Device,
}

/// Interview progress for a device.
#[derive(Debug, Clone)]
pub struct DeviceInterview {
    /// The device.
    pub device: Device,
    /// Interview progress.
    pub status: InterviewStatus,
}

/// An entity got a new friendly name.
#[derive(Debug, Clone)]
pub struct EntityRenamed {
    /// The entity, already carrying the new name.
    pub entity: Entity,
    /// Previous friendly name.
    pub from: String,
    /// New friendly name.
    pub to: String,
}

/// An entity was removed.
#[derive(Debug, Clone)]
pub struct EntityRemoved {
    /// Identifier of the removed entity.
    pub id: EntityId,
    /// Its friendly name.
    pub name: String,
}

/// The options of an entity changed.
#[derive(Debug, Clone)]
pub struct EntityOptionsChanged {
    /// The entity, already carrying the new options.
    pub entity: Entity,
    /// Options before the change.
    pub from: EntityOptions,
    /// Options after the change.
    pub to: EntityOptions,
}

/// The members of a group changed.
#[derive(Debug, Clone)]
pub struct GroupMembersChanged {
    /// The group with its new member list.
    pub group: Group,
    /// Addresses that joined the group.
    pub added: Vec<String>,
    /// Addresses that left the group.
    pub removed: Vec<String>,
}

/// The availability of an entity changed.
#[derive(Debug, Clone)]
pub struct AvailabilityChanged {
    /// The entity.
    pub id: EntityId,
    /// Its friendly name.
    pub name: String,
    /// New availability.
    pub state: AvailabilityState,
}
