// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-process event system.
//!
//! Components never call each other directly; they emit and handle typed
//! events on a shared [`EventBus`]:
//!
//! - [`EventBus`] - Synchronous dispatcher with per-owner handler sets
//! - [`Subscriptions`] - Handles of one component, disposed together
//! - Event payloads such as [`DeviceMessage`] and [`PublishEntityState`]

mod event_bus;
mod events;

pub use event_bus::{BusEvent, EventBus, HandlerResult, ListenerOwner, SubscriptionId, Subscriptions};
pub use events::{
    AvailabilityChanged, BusConnectionChanged, BusMessage, DeviceAnnounce, DeviceInterview,
    DeviceJoined, DeviceLeave, DeviceMessage, EntityOptionsChanged, EntityRemoved, EntityRenamed,
    GroupMembersChanged, LastSeenChanged, PublishEntityState, PublishReason,
};
