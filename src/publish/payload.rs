// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Message shaping helpers used by the publish pipeline.

use chrono::{DateTime, Local, SecondsFormat, Utc};
use serde_json::{Value, json};
use wildmatch::WildMatch;

use crate::Attributes;
use crate::entity::Device;
use crate::settings::LastSeenFormat;

/// Formats a `last_seen` timestamp, or `None` when disabled.
#[must_use]
pub fn format_last_seen(at: DateTime<Utc>, format: LastSeenFormat) -> Option<Value> {
    match format {
        LastSeenFormat::Disable => None,
        LastSeenFormat::Iso8601 => Some(Value::String(at.to_rfc3339_opts(SecondsFormat::Millis, true))),
        LastSeenFormat::Iso8601Local => Some(Value::String(
            at.with_timezone(&Local).to_rfc3339_opts(SecondsFormat::Millis, false),
        )),
        LastSeenFormat::Epoch => Some(json!(at.timestamp_millis())),
    }
}

/// Builds the `device` object added to messages of devices that request it.
#[must_use]
pub fn device_information(device: &Device) -> Value {
    json!({
        "friendly_name": device.friendly_name,
        "model": device.model,
        "ieee_address": device.address,
        "network_address": device.network_address,
        "type": device.kind,
        "power_source": device.power_source,
        "manufacturer": device.manufacturer,
    })
}

/// Removes top-level keys matching any of the glob `patterns`.
pub fn filter_attributes(message: &mut Attributes, patterns: &[String]) {
    if patterns.is_empty() {
        return;
    }
    let patterns: Vec<WildMatch> = patterns.iter().map(|p| WildMatch::new(p)).collect();
    message.retain(|key, _| !patterns.iter().any(|p| p.matches(key)));
}

/// Flattens a message into `(sub-topic, payload)` pairs for attribute output.
///
/// Nested objects become `<attr>-<nested>` topics, a `color` object with
/// `r`, `g` and `b` becomes `r,g,b`, arrays are joined with `,`, null becomes
/// an empty string, strings are sent raw and other scalars as JSON text.
#[must_use]
pub fn flatten_attributes(message: &Attributes) -> Vec<(String, String)> {
    let mut out = Vec::new();
    flatten_into("", message, &mut out);
    out
}

fn flatten_into(prefix: &str, message: &Attributes, out: &mut Vec<(String, String)>) {
    for (key, value) in message {
        let topic = format!("{prefix}{key}");

        if key == "color"
            && let Value::Object(color) = value
            && let (Some(r), Some(g), Some(b)) = (color.get("r"), color.get("g"), color.get("b"))
        {
            let rgb = [r, g, b].map(scalar_text).join(",");
            out.push((topic, rgb));
            continue;
        }

        match value {
            Value::Object(nested) => flatten_into(&format!("{topic}-"), nested, out),
            Value::Array(items) => {
                let joined: Vec<String> = items.iter().map(scalar_text).collect();
                out.push((topic, joined.join(",")));
            }
            other => out.push((topic, scalar_text(other))),
        }
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
