// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error types for the bridge runtime.
//!
//! Only programmer errors (starting an extension twice, naming an extension
//! that does not exist, renaming onto a taken name) surface as hard failures.
//! Transport, device network and persistence faults are recovered where they
//! occur and logged; their error types exist so the recovering code can log
//! something meaningful.

use std::time::Duration;

use thiserror::Error;

/// Boxed error returned by event handlers and external collaborators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The main error type for this library.
#[derive(Debug, Error)]
pub enum Error {
    /// Error while talking to the message bus.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Error reported by the device network.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// Error while loading or saving the state snapshot.
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// Extension lifecycle misuse or failure.
    #[error("extension error: {0}")]
    Extension(#[from] ExtensionError),

    /// Entity lookup or naming error.
    #[error("entity error: {0}")]
    Entity(#[from] EntityError),

    /// Failure raised by extension code outside this crate.
    #[error("{0}")]
    Other(BoxError),
}

/// Errors related to the message bus transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The MQTT client rejected the request (usually a full request queue).
    #[cfg(feature = "mqtt")]
    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    /// The transport is not connected to the broker.
    #[error("not connected to the message bus")]
    NotConnected,

    /// Connection to the broker failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Invalid broker address.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

/// Errors reported by the device network layer.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// The operation did not complete in time.
    #[error("operation timed out after {} ms", .0.as_millis())]
    Timeout(Duration),

    /// The device did not respond.
    #[error("device {0} is unreachable")]
    Unreachable(String),

    /// Any other failure reported by the radio stack.
    #[error("{0}")]
    Failed(String),
}

/// Errors related to the persisted state snapshot.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Reading or writing the snapshot file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The snapshot could not be encoded or decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors related to the extension lifecycle.
#[derive(Debug, Error)]
pub enum ExtensionError {
    /// `start` was called on an extension that already left the
    /// constructed state.
    #[error("extension '{0}' was already started")]
    AlreadyStarted(String),

    /// An extension with the same name is already running.
    #[error("extension '{0}' is already enabled")]
    AlreadyEnabled(String),

    /// No built-in or registered extension has this name.
    #[error("unknown extension '{0}'")]
    Unknown(String),

    /// The extension is not currently enabled.
    #[error("extension '{0}' is not enabled")]
    NotEnabled(String),

    /// The manager that owned this handle has been dropped.
    #[error("extension manager is gone")]
    ManagerGone,
}

/// Errors related to entity naming and lookup.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EntityError {
    /// No entity with this friendly name or identifier.
    #[error("entity '{0}' not found")]
    NotFound(String),

    /// The friendly name is already used by another entity.
    #[error("friendly name '{0}' is already in use")]
    NameTaken(String),

    /// The friendly name cannot be used as a topic segment.
    #[error("invalid friendly name '{0}'")]
    InvalidName(String),
}

/// A specialized Result type for this library.
pub type Result<T> = std::result::Result<T, Error>;
