// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Entity identifier type.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Stable identity of a device or group.
///
/// Devices are identified by their network address (e.g. an IEEE address
/// such as `0x00124b0012345678`), groups by their numeric id. Unlike the
/// friendly name, the identifier never changes for the lifetime of an entity,
/// so it keys the state cache and the persisted snapshot.
///
/// The string form is the address for devices and the decimal id for groups.
/// Parsing treats any string that is a valid `u16` as a group id.
///
/// # Examples
///
/// ```
/// use meshbridge::entity::EntityId;
///
/// let device = EntityId::device("0x00124b0012345678");
/// let group: EntityId = "7".parse().unwrap();
///
/// assert_eq!(group, EntityId::Group(7));
/// assert_eq!(device.to_string(), "0x00124b0012345678");
/// ```
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityId {
    /// A device, by network address.
    Device(String),
    /// A group, by numeric id.
    Group(u16),
}

impl EntityId {
    /// Creates a device identifier.
    #[must_use]
    pub fn device(address: impl Into<String>) -> Self {
        Self::Device(address.into())
    }

    /// Creates a group identifier.
    #[must_use]
    pub const fn group(id: u16) -> Self {
        Self::Group(id)
    }

    /// Returns `true` for device identifiers.
    #[must_use]
    pub const fn is_device(&self) -> bool {
        matches!(self, Self::Device(_))
    }

    /// Returns the device address, if this is a device.
    #[must_use]
    pub fn address(&self) -> Option<&str> {
        match self {
            Self::Device(address) => Some(address),
            Self::Group(_) => None,
        }
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device(address) => write!(f, "Device({address})"),
            Self::Group(id) => write!(f, "Group({id})"),
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device(address) => f.write_str(address),
            Self::Group(id) => write!(f, "{id}"),
        }
    }
}

impl FromStr for EntityId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(s.parse::<u16>()
            .map_or_else(|_| Self::Device(s.to_string()), Self::Group))
    }
}

impl Serialize for EntityId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EntityId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(s.parse().unwrap_or_else(|never| match never {}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_group_and_device() {
        assert_eq!("12".parse::<EntityId>().unwrap(), EntityId::Group(12));
        assert_eq!(
            "0x0017880104e45517".parse::<EntityId>().unwrap(),
            EntityId::device("0x0017880104e45517")
        );
    }

    #[test]
    fn display_matches_parse() {
        for id in [EntityId::group(3), EntityId::device("0xabc")] {
            let text = id.to_string();
            assert_eq!(text.parse::<EntityId>().unwrap(), id);
        }
    }

    #[test]
    fn debug_format() {
        assert_eq!(format!("{:?}", EntityId::group(4)), "Group(4)");
        assert_eq!(format!("{:?}", EntityId::device("0x1")), "Device(0x1)");
    }

    #[test]
    fn serializes_as_string_key() {
        let mut map = std::collections::BTreeMap::new();
        map.insert(EntityId::group(1), 1);
        map.insert(EntityId::device("0x01"), 2);

        let json = serde_json::to_string(&map).unwrap();
        let back: std::collections::BTreeMap<EntityId, i32> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, map);
    }

    #[test]
    fn address_only_for_devices() {
        assert_eq!(EntityId::device("0x2").address(), Some("0x2"));
        assert_eq!(EntityId::group(2).address(), None);
        assert!(EntityId::device("0x2").is_device());
        assert!(!EntityId::group(2).is_device());
    }
}
