// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Entity state publication.
//!
//! - [`Publisher`] - Delta to bus message pipeline
//! - [`payload`] - Message shaping helpers (flattening, `last_seen`, filters)

pub mod payload;
mod pipeline;

pub use pipeline::Publisher;
