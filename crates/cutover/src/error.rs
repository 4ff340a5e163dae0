// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for cutover.

use std::time::Duration;

use thiserror::Error;

/// Cutover errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Object storage operation failed.
    #[error("Storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),

    /// Container runtime operation failed.
    #[error("Runtime error: {0}")]
    Runtime(#[from] crate::containers::RuntimeError),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// No current launch configuration exists (never-deployed environment).
    #[error("launch configuration not found")]
    LaunchConfigNotFound,

    /// No history has been persisted yet.
    #[error("container history is empty")]
    EmptyHistory,

    /// Stored content does not hash to the requested key.
    #[error("given hash {expected:?} doesn't match actual hash {actual:?}")]
    HashMismatch {
        /// Hash the caller asked for.
        expected: String,
        /// Hash of the bytes actually retrieved.
        actual: String,
    },

    /// A hash was referenced that is not part of the history.
    #[error("launch config {0:?} not part of container history")]
    NotInHistory(String),

    /// Switch requested for a revision that was never started.
    #[error("don't know about a container with revision {0:?}")]
    UnknownRevision(String),

    /// Force reload asked for the container that is receiving traffic.
    #[error("refusing to recreate container {0} while it receives traffic")]
    ForceReloadLive(String),

    /// Container never answered its health check in time.
    #[error("container {container_id} failed health check after {elapsed:?}")]
    HealthCheckTimeout {
        /// Container that was being polled.
        container_id: String,
        /// How long polling went on.
        elapsed: Duration,
    },

    /// Health polling was interrupted by shutdown.
    #[error("health check for container {0} cancelled")]
    HealthCheckCancelled(String),

    /// The internal port is not mapped to exactly one host port.
    #[error("container {container_id} maps port {port} to {found} host ports, expected exactly one")]
    PortMapping {
        /// Inspected container.
        container_id: String,
        /// Internal port looked up (e.g. `9292/tcp`).
        port: String,
        /// Number of host bindings found.
        found: usize,
    },

    /// Superseded container cleanup aborted.
    #[error("failed to {step} container {container_id}: {source}")]
    Cleanup {
        /// Container being cleaned up.
        container_id: String,
        /// Step that failed (stop, remove, delete image).
        step: &'static str,
        /// Underlying runtime failure.
        #[source]
        source: crate::containers::RuntimeError,
    },

    /// The acting identity could not be resolved.
    #[error("failed to resolve deployer identity: {0}")]
    Identity(String),

    /// Request validation failed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type using cutover Error.
pub type Result<T> = std::result::Result<T, Error>;
