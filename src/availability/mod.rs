// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Online/offline tracking of devices and groups.
//!
//! Devices are either *active*, meaning they route traffic on mains power and
//! are pinged after a period of silence, or *passive*, meaning they are only
//! observed and marked offline once silent for the passive timeout. A group is
//! online when all of its tracked members are.
//!
//! The state is published retained on `<name>/availability`, either as
//! `{"state":"online"}` or, with the legacy payload setting, as plain
//! `online`.

mod scheduler;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use scheduler::Availability;

/// Availability of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AvailabilityState {
    /// Not evaluated yet.
    #[default]
    Unknown,
    /// Responding.
    Online,
    /// Silent past its timeout, or not answering pings.
    Offline,
}

impl AvailabilityState {
    /// Returns the state for an online flag.
    #[must_use]
    pub const fn from_online(online: bool) -> Self {
        if online { Self::Online } else { Self::Offline }
    }

    /// Returns `true` for [`Online`](Self::Online).
    #[must_use]
    pub const fn is_online(self) -> bool {
        matches!(self, Self::Online)
    }

    /// Returns the lowercase wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }
}

impl fmt::Display for AvailabilityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Renders an online/offline payload.
///
/// Used for entity availability topics and for `bridge/state`.
#[must_use]
pub fn availability_payload(online: bool, legacy: bool) -> String {
    let state = AvailabilityState::from_online(online).as_str();
    if legacy {
        state.to_string()
    } else {
        serde_json::json!({ "state": state }).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_formats() {
        assert_eq!(availability_payload(true, false), r#"{"state":"online"}"#);
        assert_eq!(availability_payload(false, false), r#"{"state":"offline"}"#);
        assert_eq!(availability_payload(true, true), "online");
        assert_eq!(availability_payload(false, true), "offline");
    }

    #[test]
    fn state_names() {
        assert_eq!(AvailabilityState::default(), AvailabilityState::Unknown);
        assert_eq!(AvailabilityState::from_online(true).to_string(), "online");
        assert!(!AvailabilityState::Offline.is_online());
    }
}
