// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container runtime trait definitions.
//!
//! Defines the abstract interface to the container runtime and the wire
//! types shared with launch configurations. Field names follow the Docker
//! Engine API so configurations can be passed through unchanged.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::{ErrorCategory, Retryable, classify_http_status};

/// Errors from container runtime operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RuntimeError {
    /// The runtime answered with a non-success status.
    #[error("container runtime returned [{status}] {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },

    /// The runtime could not be reached.
    #[error("container runtime unreachable: {0}")]
    Transport(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other error.
    #[error("Other: {0}")]
    Other(String),
}

impl RuntimeError {
    /// Whether the runtime reported the object as missing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::Status { status: 404, .. })
    }
}

impl Retryable for RuntimeError {
    fn category(&self) -> ErrorCategory {
        match self {
            RuntimeError::Status { status, .. } => classify_http_status(*status),
            RuntimeError::Transport(e) if e.is_connect() || e.is_timeout() => {
                ErrorCategory::Transient
            }
            _ => ErrorCategory::Permanent,
        }
    }
}

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Serializes as `{}`; used for Docker's set-like maps (`ExposedPorts`, `Volumes`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmptyObject {}

/// Container creation parameters, sent as the body of `POST /containers/create`.
///
/// Empty lists and unset options are left out of the encoding so the runtime
/// falls back to the image defaults (an empty `Entrypoint` would clear the
/// image's own). Fields not modelled here are kept in `extra` and passed
/// through unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ContainerConfig {
    /// Container hostname.
    pub hostname: String,
    /// Container domain name.
    pub domainname: String,
    /// User the process runs as.
    pub user: String,
    /// Memory limit in bytes; 0 means unlimited.
    pub memory: i64,
    /// Memory plus swap limit in bytes; -1 disables swap.
    pub memory_swap: i64,
    /// Relative CPU weight.
    pub cpu_shares: i64,
    /// Attach stdin.
    pub attach_stdin: bool,
    /// Attach stdout.
    pub attach_stdout: bool,
    /// Attach stderr.
    pub attach_stderr: bool,
    /// Legacy port specs.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub port_specs: Vec<String>,
    /// Exposed ports, keyed like `9292/tcp`.
    pub exposed_ports: BTreeMap<String, EmptyObject>,
    /// Allocate a tty.
    pub tty: bool,
    /// Keep stdin open.
    pub open_stdin: bool,
    /// Close stdin after the first client detaches.
    pub stdin_once: bool,
    /// Environment as `KEY=value` entries.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    /// Command to run.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cmd: Vec<String>,
    /// DNS servers.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dns: Vec<String>,
    /// Image reference, e.g. `localhost:8080/app:abc123`.
    pub image: String,
    /// Anonymous volumes keyed by container path.
    pub volumes: BTreeMap<String, EmptyObject>,
    /// Containers to mount volumes from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volumes_from: Option<serde_json::Value>,
    /// Working directory.
    pub working_dir: String,
    /// Entrypoint override.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub entrypoint: Vec<String>,
    /// Disable networking.
    pub network_disabled: bool,
    /// Host settings applied when the container is created.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_config: Option<HostConfig>,
    /// Any other creation parameter, passed through as is.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Host side binding of a container port.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PortBinding {
    /// Host interface.
    pub host_ip: String,
    /// Host port, as a string.
    pub host_port: String,
}

/// Host level container settings, embedded in the create request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct HostConfig {
    /// Publish every exposed port on a random host port.
    pub publish_all_ports: bool,
    /// Network mode (`bridge`, `host`, ...); empty means runtime default.
    pub network_mode: String,
    /// Bind mounts, `host:container[:mode]`.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub binds: Vec<String>,
    /// Port bindings keyed like `9292/tcp`.
    pub port_bindings: BTreeMap<String, Vec<PortBinding>>,
    /// LXC options.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lxc_conf: Option<serde_json::Value>,
    /// Any other host setting, passed through as is.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Entry of a container listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Container {
    /// Container id.
    pub id: String,
    /// Image reference the container was created from.
    pub image: String,
    /// Human readable status, `Up 3 hours` for running containers.
    pub status: String,
    /// Names, each with a leading `/`.
    pub names: Vec<String>,
}

impl Container {
    /// Whether the runtime reports the container as running.
    pub fn is_running(&self) -> bool {
        self.status.starts_with("Up ")
    }
}

/// Network part of a container inspection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct NetworkSettings {
    /// Published ports; unpublished exposed ports map to `null`.
    pub ports: BTreeMap<String, Option<Vec<PortBinding>>>,
}

/// Result of inspecting a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ContainerInfo {
    /// Container id.
    pub id: String,
    /// Image id.
    pub image: String,
    /// Network settings with the port mapping table.
    pub network_settings: NetworkSettings,
}

impl ContainerInfo {
    /// Host bindings for an internal port such as `9292/tcp`.
    pub fn host_bindings(&self, port: &str) -> &[PortBinding] {
        self.network_settings
            .ports
            .get(port)
            .and_then(|b| b.as_deref())
            .unwrap_or_default()
    }
}

/// Subset of runtime host information.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct HostInfo {
    /// Storage driver in use.
    pub driver: String,
}

/// Trait for container runtimes.
///
/// The runtime is the ground truth for containers; callers only cache what
/// they learn from it.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Runtime type identifier (e.g., "docker", "mock")
    fn runtime_type(&self) -> &'static str;

    /// List containers; `all` includes stopped ones.
    async fn list_containers(&self, all: bool) -> Result<Vec<Container>>;

    /// Inspect a container.
    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo>;

    /// Create a container with the given name and return its id.
    ///
    /// Host settings travel inside `config.host_config`.
    async fn create_container(&self, config: &ContainerConfig, name: &str) -> Result<String>;

    /// Start a created or stopped container.
    async fn start_container(&self, id: &str) -> Result<()>;

    /// Stop a running container.
    async fn stop_container(&self, id: &str) -> Result<()>;

    /// Remove a stopped container.
    async fn remove_container(&self, id: &str) -> Result<()>;

    /// Delete an image by reference or id.
    async fn delete_image(&self, image: &str) -> Result<()>;

    /// Pull an image from its registry.
    async fn pull_image(&self, image: &str) -> Result<()>;

    /// Host information (storage driver).
    async fn host_info(&self) -> Result<HostInfo>;
}
