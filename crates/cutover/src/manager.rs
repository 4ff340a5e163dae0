// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container deployment state machine.
//!
//! A revision moves through `absent -> created -> started -> healthy ->
//! routed -> superseded -> removed`. Deploying is split in two steps:
//!
//! 1. [`ContainerManager::start_container`] makes a revision ready: it
//!    reuses, starts or creates the container and waits for its health
//!    check. Live traffic is not touched.
//! 2. [`ContainerManager::switch_container`] points the proxy at the ready
//!    revision and sweeps every other container of the app in the
//!    background.
//!
//! The runtime is the source of truth for which containers exist. The
//! manager only tracks `hash -> (container, port)` for revisions it started
//! and the container currently receiving traffic.
//!
//! All mutating operations run one at a time behind a single async lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use crate::containers::{Container, ContainerRuntime, HostConfig, RuntimeError};
use crate::error::{Error, Result};
use crate::health::HealthChecker;
use crate::launch_config::{LaunchConfig, LaunchConfigStore};
use crate::proxy::Proxy;

/// Port every application container listens on internally.
pub const INTERNAL_PORT: &str = "9292/tcp";

/// Static settings of a [`ContainerManager`].
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Application name; images are `localhost:{registry_port}/{app_name}:{revision}`.
    pub app_name: String,
    /// Port of the local image registry.
    pub registry_port: u16,
    /// Variables appended to the `Env` of every created container.
    pub container_env: BTreeMap<String, String>,
    /// Storage driver the runtime should report.
    pub expected_storage_driver: String,
}

impl ManagerConfig {
    /// Settings for an app with no extra container environment.
    pub fn new(app_name: impl Into<String>, registry_port: u16) -> Self {
        Self {
            app_name: app_name.into(),
            registry_port,
            container_env: BTreeMap::new(),
            expected_storage_driver: "overlay2".to_string(),
        }
    }

    /// Prefix shared by all image references of the app.
    pub fn image_prefix(&self) -> String {
        format!("localhost:{}/{}:", self.registry_port, self.app_name)
    }
}

/// A container started for a launch configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedContainer {
    /// Runtime container id.
    pub id: String,
    /// Host port the internal port is published on.
    pub port: u16,
}

#[derive(Debug, Default)]
struct ManagerState {
    containers: HashMap<String, TrackedContainer>,
    current_container: Option<String>,
    // Started but not routed yet.
    pending_container: Option<String>,
}

/// Manager statistics for the status endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ManagerStats {
    /// `Ok`, or which storage driver was found instead of the expected one.
    pub docker_state: String,
    /// Container receiving traffic.
    pub current_container: Option<String>,
    /// Hashes of launch configurations started by this process.
    pub known_revisions: Vec<String>,
}

/// Drives containers of one application through deployments.
pub struct ContainerManager {
    runtime: Arc<dyn ContainerRuntime>,
    store: LaunchConfigStore,
    proxy: Proxy,
    health: HealthChecker,
    config: ManagerConfig,
    deploy_lock: Mutex<()>,
    state: RwLock<ManagerState>,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for ContainerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerManager")
            .field("runtime", &self.runtime.runtime_type())
            .field("config", &self.config)
            .field("proxy", &self.proxy)
            .finish_non_exhaustive()
    }
}

impl ContainerManager {
    /// Create a manager. Nothing is started until [`run_latest`](Self::run_latest)
    /// or [`start_container`](Self::start_container) is called.
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: LaunchConfigStore,
        proxy: Proxy,
        health: HealthChecker,
        config: ManagerConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            runtime,
            store,
            proxy,
            health,
            config,
            deploy_lock: Mutex::new(()),
            state: RwLock::new(ManagerState::default()),
            shutdown,
        }
    }

    /// Static settings.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Container currently receiving traffic.
    pub fn current_container(&self) -> Option<String> {
        self.read_state().current_container.clone()
    }

    /// Container started for a launch configuration hash.
    pub fn tracked(&self, hash: &str) -> Option<TrackedContainer> {
        self.read_state().containers.get(hash).cloned()
    }

    /// Cancel health checks in progress. Further deployments fail immediately.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Load the configuration for `hash` and make its container ready.
    ///
    /// Traffic keeps flowing to the current container. Both it and the new
    /// container are exempt from sweeps until
    /// [`switch_container`](Self::switch_container).
    pub async fn start_container(&self, hash: &str) -> Result<(String, u16)> {
        let _deploy = self.deploy_lock.lock().await;

        let config = self.store.load_by_hash(hash).await?;
        info!(hash, revision = %config.revision, "Starting container");

        let (id, port) = self.execute(&config).await?;
        {
            let mut state = self.write_state();
            state.pending_container = Some(id.clone());
            state.containers.insert(
                hash.to_string(),
                TrackedContainer {
                    id: id.clone(),
                    port,
                },
            );
        }

        info!(hash, container_id = %id, port, "Container ready");
        Ok((id, port))
    }

    /// Route traffic to the container started for `hash` and sweep the rest.
    ///
    /// Fails with [`Error::UnknownRevision`] unless
    /// [`start_container`](Self::start_container) succeeded for `hash`.
    /// The sweep runs in the background; its errors are only logged.
    pub async fn switch_container(self: &Arc<Self>, hash: &str) -> Result<(String, u16)> {
        let tracked = {
            let _deploy = self.deploy_lock.lock().await;

            let tracked = self
                .tracked(hash)
                .ok_or_else(|| Error::UnknownRevision(hash.to_string()))?;
            let config = self.store.load_by_hash(hash).await?;

            self.proxy
                .update(self.upstream(tracked.port), config.maintenance_path())
                .await;
            {
                let mut state = self.write_state();
                state.current_container = Some(tracked.id.clone());
                if state.pending_container.as_deref() == Some(tracked.id.as_str()) {
                    state.pending_container = None;
                }
            }

            info!(hash, container_id = %tracked.id, port = tracked.port, "Switched traffic");
            tracked
        };

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            debug!("Stopping old containers");
            if let Err(e) = manager.stop_old_containers().await {
                error!(error = %e, "Failed to stop old containers");
            }
        });

        Ok((tracked.id, tracked.port))
    }

    /// Resume the live configuration after a restart.
    ///
    /// Returns `Ok(None)` for an environment that was never deployed.
    pub async fn run_latest(&self) -> Result<Option<(String, u16)>> {
        let (id, port) = {
            let _deploy = self.deploy_lock.lock().await;

            let (hash, config) = match self.store.load_current().await {
                Ok(current) => current,
                Err(Error::LaunchConfigNotFound) => {
                    info!("No current launch configuration, nothing to run");
                    return Ok(None);
                }
                Err(e) => return Err(e),
            };
            info!(hash = %hash, revision = %config.revision, "Resuming current launch configuration");

            let (id, port) = self.execute(&config).await?;
            {
                let mut state = self.write_state();
                state.current_container = Some(id.clone());
                state.containers.insert(
                    hash,
                    TrackedContainer {
                        id: id.clone(),
                        port,
                    },
                );
            }
            self.proxy
                .update(self.upstream(port), config.maintenance_path())
                .await;
            (id, port)
        };

        self.stop_old_containers().await?;
        Ok(Some((id, port)))
    }

    /// Stop, remove and delete the image of every app container except the
    /// current one and one started but not switched to yet.
    /// The first failure aborts the sweep.
    pub async fn stop_old_containers(&self) -> Result<()> {
        let _deploy = self.deploy_lock.lock().await;

        let (current, pending) = {
            let state = self.read_state();
            (state.current_container.clone(), state.pending_container.clone())
        };
        let Some(current) = current else {
            debug!("No current container, skipping sweep");
            return Ok(());
        };

        for container in self.available_containers().await? {
            if container.id == current || pending.as_deref() == Some(container.id.as_str()) {
                continue;
            }
            info!(container_id = %container.id, image = %container.image, "Stopping old container");

            self.runtime
                .stop_container(&container.id)
                .await
                .map_err(|e| cleanup(&container, "stop", e))?;
            self.runtime
                .remove_container(&container.id)
                .await
                .map_err(|e| cleanup(&container, "remove", e))?;
            self.write_state()
                .containers
                .retain(|_, tracked| tracked.id != container.id);
            self.runtime
                .delete_image(&container.image)
                .await
                .map_err(|e| cleanup(&container, "delete image of", e))?;
        }
        Ok(())
    }

    /// Containers of this app whose name matches the revision in their image tag.
    pub async fn available_containers(&self) -> Result<Vec<Container>> {
        let prefix = self.config.image_prefix();
        let containers = self.runtime.list_containers(true).await?;

        Ok(containers
            .into_iter()
            .filter(|c| match c.image.strip_prefix(&prefix) {
                Some(revision) => {
                    let name = format!("/{}", revision);
                    c.names.iter().any(|n| *n == name)
                }
                None => false,
            })
            .collect())
    }

    /// Host port a container publishes `internal_port` on.
    ///
    /// Anything other than exactly one binding is an error.
    pub async fn exposed_container_port(
        &self,
        container_id: &str,
        internal_port: &str,
    ) -> Result<u16> {
        let info = self.runtime.inspect_container(container_id).await?;
        let bindings = info.host_bindings(internal_port);
        if bindings.len() != 1 {
            return Err(Error::PortMapping {
                container_id: container_id.to_string(),
                port: internal_port.to_string(),
                found: bindings.len(),
            });
        }

        bindings[0].host_port.parse().map_err(|_| {
            Error::Other(format!(
                "container {} publishes {} on invalid host port {:?}",
                container_id, internal_port, bindings[0].host_port
            ))
        })
    }

    /// Runtime health merged into the status endpoint.
    pub async fn stats(&self) -> Result<ManagerStats> {
        let host = self.runtime.host_info().await?;
        let expected = &self.config.expected_storage_driver;
        let docker_state = if host.driver == *expected {
            "Ok".to_string()
        } else {
            format!("Wrong driver; expected {:?} got {:?}", expected, host.driver)
        };

        let state = self.read_state();
        let mut known_revisions: Vec<String> = state.containers.keys().cloned().collect();
        known_revisions.sort();

        Ok(ManagerStats {
            docker_state,
            current_container: state.current_container.clone(),
            known_revisions,
        })
    }

    /// Reuse, start or create the container for `config` and wait until it is healthy.
    async fn execute(&self, config: &LaunchConfig) -> Result<(String, u16)> {
        let image = &config.container_config.image;
        let existing = self.container_for_image(image).await?;

        let id = match existing {
            Some(container) if config.force_reload => {
                if self.current_container().as_deref() == Some(container.id.as_str()) {
                    return Err(Error::ForceReloadLive(container.id));
                }
                info!(container_id = %container.id, "Recreating container (force reload)");
                if container.is_running() {
                    self.runtime.stop_container(&container.id).await?;
                }
                self.runtime.remove_container(&container.id).await?;
                self.create_and_start(config).await?
            }
            Some(container) if container.is_running() => {
                info!(
                    container_id = %container.id,
                    image = %image,
                    "Container already runs the required image"
                );
                container.id
            }
            Some(container) => {
                info!(container_id = %container.id, "Starting existing container");
                self.runtime.start_container(&container.id).await?;
                container.id
            }
            None => {
                info!(image = %image, "Creating new container");
                self.create_and_start(config).await?
            }
        };

        let port = self.wait_for_container(&id, &config.health_check_path).await?;
        Ok((id, port))
    }

    async fn container_for_image(&self, image: &str) -> Result<Option<Container>> {
        Ok(self
            .available_containers()
            .await?
            .into_iter()
            .find(|c| c.image == image))
    }

    async fn create_and_start(&self, config: &LaunchConfig) -> Result<String> {
        let mut container_config = config.container_config.clone();
        container_config.env.extend(
            self.config
                .container_env
                .iter()
                .map(|(k, v)| format!("{}={}", k, v)),
        );
        if container_config.host_config.is_none() || config.host_config != HostConfig::default() {
            container_config.host_config = Some(config.host_config.clone());
        }

        let id = match self
            .runtime
            .create_container(&container_config, &config.revision)
            .await
        {
            Ok(id) => id,
            Err(e) if e.is_not_found() => {
                info!(image = %container_config.image, "Image not present, pulling");
                self.runtime.pull_image(&container_config.image).await?;
                self.runtime
                    .create_container(&container_config, &config.revision)
                    .await?
            }
            Err(e) => return Err(e.into()),
        };

        self.runtime.start_container(&id).await?;
        info!(container_id = %id, image = %container_config.image, "Started container");
        Ok(id)
    }

    async fn wait_for_container(
        &self,
        container_id: &str,
        health_check_path: &str,
    ) -> Result<u16> {
        let port = self
            .exposed_container_port(container_id, INTERNAL_PORT)
            .await?;
        if let Err(e) = self
            .health
            .wait_until_healthy(
                container_id,
                port,
                health_check_path,
                self.shutdown.subscribe(),
            )
            .await
        {
            warn!(container_id, port, error = %e, "Container did not become healthy");
            return Err(e);
        }
        Ok(port)
    }

    fn upstream(&self, port: u16) -> String {
        format!("{}:{}", self.health.host(), port)
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, ManagerState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, ManagerState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn cleanup(container: &Container, step: &'static str, source: RuntimeError) -> Error {
    Error::Cleanup {
        container_id: container.id.clone(),
        step,
        source,
    }
}
