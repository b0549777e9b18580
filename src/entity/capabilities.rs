// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device capabilities as seen by the runtime.
//!
//! The device definition registry is an external collaborator. The runtime
//! only needs to ask it yes/no questions, so a definition is reduced to a
//! [`Capabilities`] value when the device is registered: whether a definition
//! exists at all and which attributes can be read back from the device.

use serde::{Deserialize, Serialize};

/// What the runtime may ask of a device.
///
/// # Examples
///
/// ```
/// use meshbridge::entity::Capabilities;
///
/// let bulb = Capabilities::builder()
///     .readable("state")
///     .readable("brightness")
///     .build();
///
/// assert!(bulb.can_read("brightness"));
/// assert!(!bulb.can_read("color_temp"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// A definition is known for the device.
    pub supported: bool,

    /// Attribute keys that can be read back on request.
    pub readable: Vec<String>,
}

impl Capabilities {
    /// Capabilities of a device without a known definition.
    #[must_use]
    pub const fn unsupported() -> Self {
        Self {
            supported: false,
            readable: Vec::new(),
        }
    }

    /// Creates a builder for supported devices.
    #[must_use]
    pub fn builder() -> CapabilitiesBuilder {
        CapabilitiesBuilder::new()
    }

    /// Returns `true` if `key` can be read back.
    #[must_use]
    pub fn can_read(&self, key: &str) -> bool {
        self.readable.iter().any(|k| k == key)
    }

    /// Returns `true` if any of `keys` can be read back.
    #[must_use]
    pub fn can_read_any(&self, keys: &[&str]) -> bool {
        keys.iter().any(|key| self.can_read(key))
    }
}

/// Builder for [`Capabilities`].
#[derive(Debug, Clone)]
pub struct CapabilitiesBuilder {
    capabilities: Capabilities,
}

impl CapabilitiesBuilder {
    /// Creates a builder for a supported device with nothing readable.
    #[must_use]
    pub fn new() -> Self {
        Self {
            capabilities: Capabilities {
                supported: true,
                readable: Vec::new(),
            },
        }
    }

    /// Marks `key` as readable.
    #[must_use]
    pub fn readable(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        if !self.capabilities.readable.contains(&key) {
            self.capabilities.readable.push(key);
        }
        self
    }

    /// Builds the capabilities.
    #[must_use]
    pub fn build(self) -> Capabilities {
        self.capabilities
    }
}

impl Default for CapabilitiesBuilder {
    fn default() -> Self {
        Self::new()
    }
}
