// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Devices and groups exposed on the message bus.
//!
//! - [`EntityId`] - Stable identity (address or group id)
//! - [`Entity`], [`Device`], [`Group`] - Entity data
//! - [`EntityOptions`] - Per-entity publish and tracking options
//! - [`EntityRegistry`] - Shared registry enforcing unique friendly names

mod capabilities;
#[allow(clippy::module_inception)]
mod entity;
mod entity_id;
mod registry;

pub use capabilities::{Capabilities, CapabilitiesBuilder};
pub use entity::{
    AvailabilityOverride, Device, DeviceKind, Entity, EntityOptions, Group, PowerSource,
};
pub use entity_id::EntityId;
pub use registry::EntityRegistry;
