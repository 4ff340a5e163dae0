// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock runtime for testing.
//!
//! Keeps containers and images in memory. Host ports are assigned from a
//! counter unless a port was registered for the image, which lets tests
//! point a "container" at a real local HTTP server.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::traits::*;

/// Mock container state.
#[derive(Debug, Clone)]
struct MockContainer {
    container: Container,
    env: Vec<String>,
    host_config: Option<HostConfig>,
    host_ports: Vec<u16>,
}

#[derive(Debug, Default)]
struct MockState {
    containers: BTreeMap<String, MockContainer>,
    images: BTreeSet<String>,
    image_ports: HashMap<String, u16>,
    failures: HashMap<&'static str, u16>,
    calls: Vec<String>,
    next_id: u64,
    next_port: u16,
}

/// In-memory container runtime.
#[derive(Debug, Clone)]
pub struct MockRuntime {
    state: Arc<Mutex<MockState>>,
    driver: String,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRuntime {
    /// Create an empty mock runtime reporting the `overlay2` driver.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                next_port: 49153,
                ..Default::default()
            })),
            driver: "overlay2".to_string(),
        }
    }

    /// Report a different storage driver from `host_info`.
    pub fn with_driver(mut self, driver: impl Into<String>) -> Self {
        self.driver = driver.into();
        self
    }

    /// Make images available to create containers from.
    pub async fn add_image(&self, image: &str) {
        let mut state = self.state.lock().await;
        state.images.insert(image.to_string());
    }

    /// Containers created from `image` publish `9292/tcp` on `port`.
    pub async fn set_port_for_image(&self, image: &str, port: u16) {
        let mut state = self.state.lock().await;
        state.image_ports.insert(image.to_string(), port);
    }

    /// Seed an existing container. `name` is stored with a leading `/`.
    pub async fn add_container(&self, id: &str, image: &str, name: &str, running: bool, port: u16) {
        let mut state = self.state.lock().await;
        state.images.insert(image.to_string());
        state.containers.insert(
            id.to_string(),
            MockContainer {
                container: Container {
                    id: id.to_string(),
                    image: image.to_string(),
                    status: status(running),
                    names: vec![format!("/{}", name)],
                },
                env: Vec::new(),
                host_config: None,
                host_ports: vec![port],
            },
        );
    }

    /// Publish `9292/tcp` of a container on the given host ports.
    pub async fn set_host_ports(&self, id: &str, ports: Vec<u16>) {
        let mut state = self.state.lock().await;
        if let Some(c) = state.containers.get_mut(id) {
            c.host_ports = ports;
        }
    }

    /// Make every call to `operation` (e.g. `"stop_container"`) fail with `status`.
    pub async fn fail_on(&self, operation: &'static str, status: u16) {
        let mut state = self.state.lock().await;
        state.failures.insert(operation, status);
    }

    /// Snapshot of all containers.
    pub async fn containers(&self) -> Vec<Container> {
        let state = self.state.lock().await;
        state
            .containers
            .values()
            .map(|c| c.container.clone())
            .collect()
    }

    /// `Env` a container was created with.
    pub async fn container_env(&self, id: &str) -> Option<Vec<String>> {
        let state = self.state.lock().await;
        state.containers.get(id).map(|c| c.env.clone())
    }

    /// `HostConfig` a container was created with.
    pub async fn container_host_config(&self, id: &str) -> Option<HostConfig> {
        let state = self.state.lock().await;
        state.containers.get(id).and_then(|c| c.host_config.clone())
    }

    /// Whether the image is still present.
    pub async fn has_image(&self, image: &str) -> bool {
        let state = self.state.lock().await;
        state.images.contains(image)
    }

    /// Recorded mutating calls, e.g. `"stop c1"`.
    pub async fn calls(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.calls.clone()
    }
}

fn status(running: bool) -> String {
    if running {
        "Up 1 second".to_string()
    } else {
        "Exited (0) 1 second ago".to_string()
    }
}

fn check(state: &MockState, operation: &'static str) -> Result<()> {
    match state.failures.get(operation) {
        Some(&status) => Err(RuntimeError::Status {
            status,
            body: format!("mock failure in {}", operation),
        }),
        None => Ok(()),
    }
}

fn no_such(kind: &str, id: &str) -> RuntimeError {
    RuntimeError::Status {
        status: 404,
        body: format!("No such {}: {}", kind, id),
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    fn runtime_type(&self) -> &'static str {
        "mock"
    }

    async fn list_containers(&self, all: bool) -> Result<Vec<Container>> {
        let state = self.state.lock().await;
        check(&state, "list_containers")?;
        Ok(state
            .containers
            .values()
            .filter(|c| all || c.container.is_running())
            .map(|c| c.container.clone())
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo> {
        let state = self.state.lock().await;
        check(&state, "inspect_container")?;
        let c = state
            .containers
            .get(id)
            .ok_or_else(|| no_such("container", id))?;

        let bindings = c
            .host_ports
            .iter()
            .map(|p| PortBinding {
                host_ip: "0.0.0.0".to_string(),
                host_port: p.to_string(),
            })
            .collect();
        let mut ports = BTreeMap::new();
        ports.insert("9292/tcp".to_string(), Some(bindings));

        Ok(ContainerInfo {
            id: c.container.id.clone(),
            image: c.container.image.clone(),
            network_settings: NetworkSettings { ports },
        })
    }

    async fn create_container(&self, config: &ContainerConfig, name: &str) -> Result<String> {
        let mut state = self.state.lock().await;
        check(&state, "create_container")?;
        if !state.images.contains(&config.image) {
            return Err(no_such("image", &config.image));
        }
        if state
            .containers
            .values()
            .any(|c| c.container.names.iter().any(|n| n == &format!("/{}", name)))
        {
            return Err(RuntimeError::Status {
                status: 409,
                body: format!("Conflict. The container name \"/{}\" is already in use", name),
            });
        }

        state.next_id += 1;
        let id = format!("mock{:060}", state.next_id);
        let registered = state.image_ports.get(&config.image).copied();
        let port = match registered {
            Some(port) => port,
            None => {
                state.next_port += 1;
                state.next_port
            }
        };
        state.calls.push(format!("create {}", name));
        state.containers.insert(
            id.clone(),
            MockContainer {
                container: Container {
                    id: id.clone(),
                    image: config.image.clone(),
                    status: "Created".to_string(),
                    names: vec![format!("/{}", name)],
                },
                env: config.env.clone(),
                host_config: config.host_config.clone(),
                host_ports: vec![port],
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        check(&state, "start_container")?;
        state.calls.push(format!("start {}", id));
        let c = state
            .containers
            .get_mut(id)
            .ok_or_else(|| no_such("container", id))?;
        c.container.status = status(true);
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        check(&state, "stop_container")?;
        state.calls.push(format!("stop {}", id));
        let c = state
            .containers
            .get_mut(id)
            .ok_or_else(|| no_such("container", id))?;
        c.container.status = status(false);
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        check(&state, "remove_container")?;
        state.calls.push(format!("remove {}", id));
        state
            .containers
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| no_such("container", id))
    }

    async fn delete_image(&self, image: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        check(&state, "delete_image")?;
        state.calls.push(format!("delete_image {}", image));
        if state.images.remove(image) {
            Ok(())
        } else {
            Err(no_such("image", image))
        }
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        check(&state, "pull_image")?;
        state.calls.push(format!("pull {}", image));
        state.images.insert(image.to_string());
        Ok(())
    }

    async fn host_info(&self) -> Result<HostInfo> {
        let state = self.state.lock().await;
        check(&state, "host_info")?;
        Ok(HostInfo {
            driver: self.driver.clone(),
        })
    }
}
