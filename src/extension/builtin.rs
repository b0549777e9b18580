// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Table of the extensions shipped with the crate.

use std::fmt;
use std::sync::Arc;

use super::{BridgeState, Extension, ExtensionContext, Receive};
use crate::availability::Availability;
use crate::settings::BridgeSettings;

/// Extensions built into the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinExtension {
    /// Publishes `bridge/state`.
    BridgeState,
    /// Turns device messages into entity state publishes.
    Receive,
    /// Tracks device and group availability.
    Availability,
}

impl BuiltinExtension {
    /// Every built-in extension, in start order.
    pub const ALL: [Self; 3] = [Self::BridgeState, Self::Receive, Self::Availability];

    /// Returns the configuration name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::BridgeState => "bridge_state",
            Self::Receive => "receive",
            Self::Availability => "availability",
        }
    }

    /// Looks up a built-in extension by configuration name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|builtin| builtin.name() == name)
    }

    /// Returns the built-ins enabled in `settings`, in start order.
    #[must_use]
    pub fn configured(settings: &BridgeSettings) -> Vec<Self> {
        Self::ALL
            .into_iter()
            .filter(|builtin| settings.extensions.iter().any(|name| name == builtin.name()))
            .collect()
    }

    /// Constructs a fresh instance.
    #[must_use]
    pub fn construct(self, context: ExtensionContext) -> Arc<dyn Extension> {
        match self {
            Self::BridgeState => Arc::new(BridgeState::new(context)),
            Self::Receive => Arc::new(Receive::new(context)),
            Self::Availability => Arc::new(Availability::new(context)),
        }
    }
}

impl fmt::Display for BuiltinExtension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
