// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Entity state cache.
//!
//! - [`StateCache`] - Last-known attributes per entity, optionally persisted
//! - [`persistence`] - Atomic snapshot file reads and writes

pub mod persistence;
mod state_cache;

pub use persistence::Snapshot;
pub use state_cache::StateCache;
