// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Devices, groups and their per-entity options.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Capabilities, EntityId};

/// Role of a device in the mesh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceKind {
    /// The network coordinator (the bridge's own radio).
    Coordinator,
    /// A routing node.
    Router,
    /// A leaf node.
    #[default]
    EndDevice,
}

/// How a device is powered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerSource {
    /// Mains powered.
    Mains,
    /// Battery powered.
    Battery,
    /// DC source.
    Dc,
    /// Not reported.
    #[default]
    Unknown,
}

/// Per-entity availability override.
///
/// Deserializes from `true`, `false` or `{"timeout": <minutes>}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AvailabilityOverride {
    /// Force tracking on or off.
    Toggle(bool),
    /// Track with a custom timeout in minutes.
    Custom {
        /// Minutes of silence before the entity is probed or marked offline.
        timeout: u64,
    },
}

impl AvailabilityOverride {
    /// Returns `true` unless tracking is forced off.
    #[must_use]
    pub const fn is_enabled(self) -> bool {
        !matches!(self, Self::Toggle(false))
    }

    /// Returns the custom timeout, if any.
    #[must_use]
    pub const fn timeout(self) -> Option<Duration> {
        match self {
            Self::Custom { timeout } => Some(Duration::from_secs(timeout.saturating_mul(60))),
            Self::Toggle(_) => None,
        }
    }
}

/// Options that tune how one entity is published and tracked.
///
/// Every field is optional in serialized form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
// Independent option flags, one per publish behavior.
#[allow(clippy::struct_excessive_bools)]
pub struct EntityOptions {
    /// Availability override; `None` follows the global settings.
    pub availability: Option<AvailabilityOverride>,
    /// Debounce window in seconds.
    pub debounce: Option<f64>,
    /// Keys whose changed values force an early debounce flush.
    pub debounce_ignore: Vec<String>,
    /// Throttle window in seconds.
    pub throttle: Option<f64>,
    /// Publish state with the retain flag.
    pub retain: bool,
    /// QoS level of state publishes (0, 1 or 2).
    pub qos: u8,
    /// Seconds after which the broker drops a retained state message.
    pub retention: Option<u32>,
    /// Glob patterns of attributes removed from published messages.
    pub filtered_attributes: Vec<String>,
    /// Glob patterns of attributes never stored in the state cache.
    pub filtered_cache: Vec<String>,
    /// Add device metadata to published messages; `None` follows the
    /// global setting.
    pub device_information: Option<bool>,
    /// Add `elapsed` (ms since the previous message) to device messages.
    pub elapsed: bool,
    /// Ignore the entity entirely.
    pub disabled: bool,
}

impl EntityOptions {
    /// Returns the debounce window, if a positive one is configured.
    #[must_use]
    pub fn debounce_window(&self) -> Option<Duration> {
        positive_seconds(self.debounce)
    }

    /// Returns the throttle window, if a positive one is configured.
    #[must_use]
    pub fn throttle_window(&self) -> Option<Duration> {
        positive_seconds(self.throttle)
    }

    /// Sets the debounce window in seconds.
    #[must_use]
    pub fn with_debounce(mut self, seconds: f64) -> Self {
        self.debounce = Some(seconds);
        self
    }

    /// Sets the keys that force an early debounce flush.
    #[must_use]
    pub fn with_debounce_ignore<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.debounce_ignore = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the throttle window in seconds.
    #[must_use]
    pub fn with_throttle(mut self, seconds: f64) -> Self {
        self.throttle = Some(seconds);
        self
    }

    /// Enables the retain flag.
    #[must_use]
    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    /// Sets the QoS level.
    #[must_use]
    pub fn with_qos(mut self, qos: u8) -> Self {
        self.qos = qos.min(2);
        self
    }

    /// Sets the attributes filtered from published messages.
    #[must_use]
    pub fn with_filtered_attributes<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filtered_attributes = patterns.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the availability override.
    #[must_use]
    pub fn with_availability(mut self, availability: AvailabilityOverride) -> Self {
        self.availability = Some(availability);
        self
    }
}

fn positive_seconds(seconds: Option<f64>) -> Option<Duration> {
    seconds
        .filter(|s| s.is_finite() && *s > 0.0)
        .and_then(|s| Duration::try_from_secs_f64(s).ok())
}

/// A device on the mesh network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Network address, the stable identity.
    pub address: String,
    /// Unique, user-visible name.
    pub friendly_name: String,
    /// Short network address.
    pub network_address: u16,
    /// Role in the mesh.
    pub kind: DeviceKind,
    /// Power source.
    pub power_source: PowerSource,
    /// Model identifier reported by the definition registry.
    pub model: Option<String>,
    /// Manufacturer name.
    pub manufacturer: Option<String>,
    /// What the runtime may ask of the device.
    pub capabilities: Capabilities,
    /// Last time the device was heard from.
    pub last_seen: Option<DateTime<Utc>>,
    /// The device is still being interviewed.
    pub interviewing: bool,
    /// Per-device options.
    pub options: EntityOptions,
}

impl Device {
    /// Creates an end device with default options.
    #[must_use]
    pub fn new(address: impl Into<String>, friendly_name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            friendly_name: friendly_name.into(),
            network_address: 0,
            kind: DeviceKind::EndDevice,
            power_source: PowerSource::Unknown,
            model: None,
            manufacturer: None,
            capabilities: Capabilities::unsupported(),
            last_seen: None,
            interviewing: false,
            options: EntityOptions::default(),
        }
    }

    /// Sets the device role.
    #[must_use]
    pub fn with_kind(mut self, kind: DeviceKind) -> Self {
        self.kind = kind;
        self
    }

    /// Sets the power source.
    #[must_use]
    pub fn with_power_source(mut self, power_source: PowerSource) -> Self {
        self.power_source = power_source;
        self
    }

    /// Sets the model identifier.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Sets the capabilities.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Sets the options.
    #[must_use]
    pub fn with_options(mut self, options: EntityOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the last-seen timestamp.
    #[must_use]
    pub fn with_last_seen(mut self, last_seen: DateTime<Utc>) -> Self {
        self.last_seen = Some(last_seen);
        self
    }

    /// Returns the device identifier.
    #[must_use]
    pub fn id(&self) -> EntityId {
        EntityId::Device(self.address.clone())
    }

    /// Returns `true` for devices that can be pinged on a timer.
    ///
    /// Routers that are not battery powered, and anything on mains power,
    /// are expected to answer at any time.
    #[must_use]
    pub fn is_actively_pollable(&self) -> bool {
        (self.kind == DeviceKind::Router && self.power_source != PowerSource::Battery)
            || self.power_source == PowerSource::Mains
    }

    /// Returns `true` for the coordinator, which is never tracked or published.
    #[must_use]
    pub fn is_coordinator(&self) -> bool {
        self.kind == DeviceKind::Coordinator
    }
}

/// A group of devices addressed together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    /// Numeric group id, the stable identity.
    pub id: u16,
    /// Unique, user-visible name.
    pub friendly_name: String,
    /// Addresses of member devices.
    pub members: Vec<String>,
    /// Per-group options.
    pub options: EntityOptions,
}

impl Group {
    /// Creates an empty group with default options.
    #[must_use]
    pub fn new(id: u16, friendly_name: impl Into<String>) -> Self {
        Self {
            id,
            friendly_name: friendly_name.into(),
            members: Vec::new(),
            options: EntityOptions::default(),
        }
    }

    /// Adds member devices.
    #[must_use]
    pub fn with_members<I, S>(mut self, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.members.extend(members.into_iter().map(Into::into));
        self
    }

    /// Sets the options.
    #[must_use]
    pub fn with_options(mut self, options: EntityOptions) -> Self {
        self.options = options;
        self
    }

    /// Returns `true` if the device is a member.
    #[must_use]
    pub fn has_member(&self, address: &str) -> bool {
        self.members.iter().any(|m| m == address)
    }
}

/// A device or a group.
#[derive(Debug, Clone, PartialEq)]
pub enum Entity {
    /// A single device.
    Device(Device),
    /// A group of devices.
    Group(Group),
}

impl Entity {
    /// Returns the stable identifier.
    #[must_use]
    pub fn id(&self) -> EntityId {
        match self {
            Self::Device(device) => device.id(),
            Self::Group(group) => EntityId::Group(group.id),
        }
    }

    /// Returns the friendly name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Device(device) => &device.friendly_name,
            Self::Group(group) => &group.friendly_name,
        }
    }

    /// Returns the options.
    #[must_use]
    pub fn options(&self) -> &EntityOptions {
        match self {
            Self::Device(device) => &device.options,
            Self::Group(group) => &group.options,
        }
    }

    /// Returns the device, if this is one.
    #[must_use]
    pub fn as_device(&self) -> Option<&Device> {
        match self {
            Self::Device(device) => Some(device),
            Self::Group(_) => None,
        }
    }

    /// Returns the group, if this is one.
    #[must_use]
    pub fn as_group(&self) -> Option<&Group> {
        match self {
            Self::Group(group) => Some(group),
            Self::Device(_) => None,
        }
    }

    /// Returns `true` for devices.
    #[must_use]
    pub fn is_device(&self) -> bool {
        matches!(self, Self::Device(_))
    }
}

impl From<Device> for Entity {
    fn from(device: Device) -> Self {
        Self::Device(device)
    }
}

impl From<Group> for Entity {
    fn from(group: Group) -> Self {
        Self::Group(group)
    }
}
