// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bridge configuration.
//!
//! [`BridgeSettings`] is plain data: it derives `Deserialize` so the host
//! application can load it from whatever file format it uses, and every field
//! has a default so partial documents work.
//!
//! # Examples
//!
//! ```
//! use meshbridge::settings::{BridgeSettings, OutputMode};
//!
//! let settings = BridgeSettings::default()
//!     .with_base_topic("home")
//!     .with_output(OutputMode::AttributeAndJson)
//!     .with_force_disable_retain(true);
//!
//! assert_eq!(settings.base_topic, "home");
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

/// Keys that are published but never kept in the state cache.
///
/// These describe momentary events rather than state; caching them would
/// make every later publish repeat the last button press.
pub const DEFAULT_CACHE_EXCLUSIONS: &[&str] = &[
    "action",
    "action_*",
    "button",
    "button_left",
    "button_right",
    "click",
    "forgotten",
    "keyerror",
    "step_size",
    "transition_time",
    "group_list",
    "group_capacity",
    "no_occupancy_since",
    "step_mode",
];

/// How entity state is encoded on the bus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// One JSON object on the entity topic.
    #[default]
    Json,
    /// One message per attribute under the entity topic.
    Attribute,
    /// Both of the above.
    AttributeAndJson,
}

impl OutputMode {
    /// Returns `true` if the aggregate JSON message is published.
    #[must_use]
    pub const fn publishes_json(self) -> bool {
        matches!(self, Self::Json | Self::AttributeAndJson)
    }

    /// Returns `true` if per-attribute messages are published.
    #[must_use]
    pub const fn publishes_attributes(self) -> bool {
        matches!(self, Self::Attribute | Self::AttributeAndJson)
    }
}

/// Format of the `last_seen` attribute added to device messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LastSeenFormat {
    /// Do not add `last_seen`.
    #[default]
    #[serde(rename = "disable")]
    Disable,
    /// RFC 3339 in UTC, e.g. `2024-01-02T03:04:05.678Z`.
    #[serde(rename = "ISO_8601")]
    Iso8601,
    /// RFC 3339 with the local UTC offset.
    #[serde(rename = "ISO_8601_local")]
    Iso8601Local,
    /// Milliseconds since the Unix epoch, as a number.
    #[serde(rename = "epoch")]
    Epoch,
}

/// Top-level bridge configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    /// Prefix of every topic the bridge publishes or subscribes to.
    pub base_topic: String,
    /// Encoding of entity state messages.
    pub output: OutputMode,
    /// Publish the full cached state instead of only the changed attributes.
    pub cache_state: bool,
    /// Persist the state cache across restarts.
    pub cache_state_persistent: bool,
    /// Location of the persisted state snapshot.
    pub state_file: Option<PathBuf>,
    /// Seconds between snapshot writes.
    pub state_save_interval: u64,
    /// Glob patterns of attributes that are published but never cached.
    pub cache_exclusions: Vec<String>,
    /// Format of the `last_seen` attribute.
    pub last_seen: LastSeenFormat,
    /// Add device metadata to every device message.
    pub include_device_information: bool,
    /// Keep the `linkquality` attribute in published messages.
    pub include_link_quality: bool,
    /// Publish everything with the retain flag cleared.
    pub force_disable_retain: bool,
    /// Publish availability as plain `online`/`offline` instead of JSON.
    pub legacy_availability_payload: bool,
    /// Availability tracking settings.
    pub availability: AvailabilitySettings,
    /// Names of the built-in extensions to start, in start order.
    pub extensions: Vec<String>,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            base_topic: "meshbridge".to_string(),
            output: OutputMode::Json,
            cache_state: true,
            cache_state_persistent: true,
            state_file: None,
            state_save_interval: 300,
            cache_exclusions: DEFAULT_CACHE_EXCLUSIONS
                .iter()
                .map(ToString::to_string)
                .collect(),
            last_seen: LastSeenFormat::Disable,
            include_device_information: false,
            include_link_quality: true,
            force_disable_retain: false,
            legacy_availability_payload: false,
            availability: AvailabilitySettings::default(),
            extensions: vec![
                "bridge_state".to_string(),
                "receive".to_string(),
                "availability".to_string(),
            ],
        }
    }
}

impl BridgeSettings {
    /// Sets the base topic.
    #[must_use]
    pub fn with_base_topic(mut self, base_topic: impl Into<String>) -> Self {
        self.base_topic = base_topic.into();
        self
    }

    /// Sets the output mode.
    #[must_use]
    pub fn with_output(mut self, output: OutputMode) -> Self {
        self.output = output;
        self
    }

    /// Enables or disables publishing of the full cached state.
    #[must_use]
    pub fn with_cache_state(mut self, enabled: bool) -> Self {
        self.cache_state = enabled;
        self
    }

    /// Sets the state snapshot file and enables persistence.
    #[must_use]
    pub fn with_state_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_file = Some(path.into());
        self.cache_state_persistent = true;
        self
    }

    /// Sets the `last_seen` format.
    #[must_use]
    pub fn with_last_seen(mut self, format: LastSeenFormat) -> Self {
        self.last_seen = format;
        self
    }

    /// Forces the retain flag off for every publish.
    #[must_use]
    pub fn with_force_disable_retain(mut self, disabled: bool) -> Self {
        self.force_disable_retain = disabled;
        self
    }

    /// Switches availability payloads to plain strings.
    #[must_use]
    pub fn with_legacy_availability_payload(mut self, legacy: bool) -> Self {
        self.legacy_availability_payload = legacy;
        self
    }

    /// Replaces the availability settings.
    #[must_use]
    pub fn with_availability(mut self, availability: AvailabilitySettings) -> Self {
        self.availability = availability;
        self
    }

    /// Replaces the list of built-in extensions to start.
    #[must_use]
    pub fn with_extensions<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extensions = names.into_iter().map(Into::into).collect();
        self
    }

    /// Interval between snapshot writes.
    #[must_use]
    pub fn state_save_interval(&self) -> Duration {
        Duration::from_secs(self.state_save_interval.max(1))
    }

    /// Returns the snapshot path when persistence is enabled.
    #[must_use]
    pub fn persistence_path(&self) -> Option<&PathBuf> {
        if self.cache_state_persistent {
            self.state_file.as_ref()
        } else {
            None
        }
    }
}

/// Availability tracking configuration.
///
/// Timeouts for devices are in minutes, everything else in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AvailabilitySettings {
    /// Track availability for every entity not excluded below.
    pub enabled: bool,
    /// Minutes of silence before an actively pollable device is pinged.
    pub active_timeout: u64,
    /// Minutes of silence before a passive device is marked offline.
    pub passive_timeout: u64,
    /// Upper bound of the random delay added to active timers, as a fraction
    /// of the timeout. Clamped to `[0, 1]`.
    #[serde(deserialize_with = "deserialize_fraction")]
    pub jitter_fraction: f64,
    /// Maximum number of pings in flight at once.
    pub ping_concurrency: usize,
    /// Seconds before a single ping attempt counts as failed.
    pub ping_timeout: u64,
    /// Seconds between the two attempts made for a device believed online.
    pub ping_retry_delay: u64,
    /// Seconds to wait for announce bursts to settle before re-reading state.
    pub reconnect_read_debounce: u64,
    /// Only these entities are tracked (friendly names or ids) when non-empty.
    pub include: Vec<String>,
    /// These entities are never tracked, unless `include` is non-empty.
    pub exclude: Vec<String>,
}

impl Default for AvailabilitySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            active_timeout: 10,
            passive_timeout: 1500,
            jitter_fraction: 0.1,
            ping_concurrency: 1,
            ping_timeout: 10,
            ping_retry_delay: 3,
            reconnect_read_debounce: 2,
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }
}

impl AvailabilitySettings {
    /// Creates settings with tracking disabled.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Sets the active timeout in minutes.
    #[must_use]
    pub fn with_active_timeout(mut self, minutes: u64) -> Self {
        self.active_timeout = minutes;
        self
    }

    /// Sets the passive timeout in minutes.
    #[must_use]
    pub fn with_passive_timeout(mut self, minutes: u64) -> Self {
        self.passive_timeout = minutes;
        self
    }

    /// Sets the jitter fraction, clamped to `[0, 1]`.
    #[must_use]
    pub fn with_jitter_fraction(mut self, fraction: f64) -> Self {
        self.jitter_fraction = clamp_fraction(fraction);
        self
    }

    /// Sets the maximum number of concurrent pings.
    #[must_use]
    pub fn with_ping_concurrency(mut self, concurrency: usize) -> Self {
        self.ping_concurrency = concurrency;
        self
    }

    /// Sets the allow-list.
    #[must_use]
    pub fn with_include<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.include = names.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the block-list.
    #[must_use]
    pub fn with_exclude<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude = names.into_iter().map(Into::into).collect();
        self
    }

    /// Returns the active timeout.
    #[must_use]
    pub fn active_timeout(&self) -> Duration {
        Duration::from_secs(self.active_timeout.saturating_mul(60))
    }

    /// Returns the passive timeout.
    #[must_use]
    pub fn passive_timeout(&self) -> Duration {
        Duration::from_secs(self.passive_timeout.saturating_mul(60))
    }

    /// Returns the deadline of one ping attempt.
    #[must_use]
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout)
    }

    /// Returns the delay between two ping attempts.
    #[must_use]
    pub fn ping_retry_delay(&self) -> Duration {
        Duration::from_secs(self.ping_retry_delay)
    }

    /// Returns the settle delay before a reconnect re-read.
    #[must_use]
    pub fn reconnect_read_debounce(&self) -> Duration {
        Duration::from_secs(self.reconnect_read_debounce)
    }
}

/// Clamps a fraction to `[0, 1]`; NaN becomes 0.
fn clamp_fraction(fraction: f64) -> f64 {
    if fraction.is_nan() {
        0.0
    } else {
        fraction.clamp(0.0, 1.0)
    }
}

fn deserialize_fraction<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    f64::deserialize(deserializer).map(clamp_fraction)
}
