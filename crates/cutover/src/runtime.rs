// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for cutover.
//!
//! [`CutoverRuntime`] wires the launch config store, container manager,
//! traffic proxy and control API together and runs them inside an existing
//! tokio application.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use cutover::containers::DockerRuntime;
//! use cutover::identity::StaticIdentity;
//! use cutover::launch_config::LaunchConfigStore;
//! use cutover::manager::ManagerConfig;
//! use cutover::runtime::CutoverRuntime;
//! use cutover::storage::S3Client;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = LaunchConfigStore::new(Arc::new(S3Client::from_env()?), "deploys", "shop/production");
//!
//!     let runtime = CutoverRuntime::builder()
//!         .store(store)
//!         .container_runtime(Arc::new(DockerRuntime::new("http://127.0.0.1:4243")))
//!         .identity(Arc::new(StaticIdentity("ops".into())))
//!         .manager_config(ManagerConfig::new("shop", 8080))
//!         .proxy_addr("0.0.0.0:80".parse()?)
//!         .api_addr("127.0.0.1:8001".parse()?)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::api::{self, ApiState};
use crate::containers::ContainerRuntime;
use crate::health::HealthChecker;
use crate::history::DEFAULT_MAX_SIZE;
use crate::identity::IdentityProvider;
use crate::launch_config::LaunchConfigStore;
use crate::manager::{ContainerManager, ManagerConfig};
use crate::proxy::{self, Proxy};

/// Builder for creating a [`CutoverRuntime`].
pub struct CutoverRuntimeBuilder {
    store: Option<LaunchConfigStore>,
    container_runtime: Option<Arc<dyn ContainerRuntime>>,
    identity: Option<Arc<dyn IdentityProvider>>,
    manager_config: Option<ManagerConfig>,
    proxy_addr: SocketAddr,
    api_addr: SocketAddr,
    container_host: String,
    health_check_interval: Duration,
    health_check_timeout: Duration,
    history_max_size: usize,
    run_latest: bool,
}

impl Default for CutoverRuntimeBuilder {
    fn default() -> Self {
        Self {
            store: None,
            container_runtime: None,
            identity: None,
            manager_config: None,
            proxy_addr: SocketAddr::from(([0, 0, 0, 0], 80)),
            api_addr: SocketAddr::from(([0, 0, 0, 0], 8001)),
            container_host: "localhost".to_string(),
            health_check_interval: Duration::from_secs(5),
            health_check_timeout: Duration::from_secs(300), // 5 minutes
            history_max_size: DEFAULT_MAX_SIZE,
            run_latest: true,
        }
    }
}

impl CutoverRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the launch config store (required).
    pub fn store(mut self, store: LaunchConfigStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the container runtime (required).
    pub fn container_runtime(mut self, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.container_runtime = Some(runtime);
        self
    }

    /// Set how deployers are identified in the history (required).
    pub fn identity(mut self, identity: Arc<dyn IdentityProvider>) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Set the application settings (required).
    pub fn manager_config(mut self, config: ManagerConfig) -> Self {
        self.manager_config = Some(config);
        self
    }

    /// Set the bind address of the traffic proxy.
    ///
    /// Default: `0.0.0.0:80`
    pub fn proxy_addr(mut self, addr: SocketAddr) -> Self {
        self.proxy_addr = addr;
        self
    }

    /// Set the bind address of the control API.
    ///
    /// Default: `0.0.0.0:8001`
    pub fn api_addr(mut self, addr: SocketAddr) -> Self {
        self.api_addr = addr;
        self
    }

    /// Set the host containers publish their ports on.
    ///
    /// Default: `localhost`
    pub fn container_host(mut self, host: impl Into<String>) -> Self {
        self.container_host = host.into();
        self
    }

    /// Set the delay between health check attempts.
    ///
    /// Default: 5 seconds
    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Set how long a new container may take to become healthy.
    ///
    /// Default: 5 minutes
    pub fn health_check_timeout(mut self, timeout: Duration) -> Self {
        self.health_check_timeout = timeout;
        self
    }

    /// Set the number of history events kept.
    ///
    /// Default: 10
    pub fn history_max_size(mut self, size: usize) -> Self {
        self.history_max_size = size;
        self
    }

    /// Whether to resume the current launch configuration on start.
    ///
    /// Default: `true`
    pub fn run_latest(mut self, enabled: bool) -> Self {
        self.run_latest = enabled;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<CutoverRuntimeConfig> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;
        let container_runtime = self
            .container_runtime
            .ok_or_else(|| anyhow::anyhow!("container_runtime is required"))?;
        let identity = self
            .identity
            .ok_or_else(|| anyhow::anyhow!("identity is required"))?;
        let manager_config = self
            .manager_config
            .ok_or_else(|| anyhow::anyhow!("manager_config is required"))?;

        Ok(CutoverRuntimeConfig {
            store,
            container_runtime,
            identity,
            manager_config,
            proxy_addr: self.proxy_addr,
            api_addr: self.api_addr,
            container_host: self.container_host,
            health_check_interval: self.health_check_interval,
            health_check_timeout: self.health_check_timeout,
            history_max_size: self.history_max_size,
            run_latest: self.run_latest,
        })
    }
}

/// Configuration for a [`CutoverRuntime`].
pub struct CutoverRuntimeConfig {
    store: LaunchConfigStore,
    container_runtime: Arc<dyn ContainerRuntime>,
    identity: Arc<dyn IdentityProvider>,
    manager_config: ManagerConfig,
    proxy_addr: SocketAddr,
    api_addr: SocketAddr,
    container_host: String,
    health_check_interval: Duration,
    health_check_timeout: Duration,
    history_max_size: usize,
    run_latest: bool,
}

impl CutoverRuntimeConfig {
    /// Bind both listeners and start serving.
    ///
    /// Startup reconciliation runs in the background; deploy requests queue
    /// behind it.
    pub async fn start(self) -> Result<CutoverRuntime> {
        let proxy_listener = TcpListener::bind(self.proxy_addr).await?;
        let api_listener = TcpListener::bind(self.api_addr).await?;
        let proxy_addr = proxy_listener.local_addr()?;
        let api_addr = api_listener.local_addr()?;

        let proxy = Proxy::new();
        let health = HealthChecker::new(self.health_check_interval, self.health_check_timeout)
            .with_host(self.container_host);
        let manager = Arc::new(ContainerManager::new(
            self.container_runtime,
            self.store.clone(),
            proxy.clone(),
            health,
            self.manager_config,
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let proxy_handle = tokio::spawn(proxy::serve(
            proxy_listener,
            proxy.clone(),
            shutdown_rx.clone(),
        ));

        let state = ApiState::new(
            manager.clone(),
            proxy.clone(),
            self.store,
            self.identity,
            self.history_max_size,
        );
        let api_handle = tokio::spawn(api::serve(api_listener, state, shutdown_rx));

        let reconcile_handle = if self.run_latest {
            let manager = manager.clone();
            Some(tokio::spawn(async move {
                match manager.run_latest().await {
                    Ok(Some((container_id, port))) => {
                        info!(container_id = %container_id, port, "Resumed current container");
                    }
                    Ok(None) => {}
                    Err(e) => error!(error = %e, "Failed to resume current container"),
                }
            }))
        } else {
            None
        };

        info!(
            proxy_addr = %proxy_addr,
            api_addr = %api_addr,
            app = %manager.config().app_name,
            "CutoverRuntime started"
        );

        Ok(CutoverRuntime {
            proxy_handle,
            api_handle,
            reconcile_handle,
            shutdown_tx,
            manager,
            proxy,
            proxy_addr,
            api_addr,
        })
    }
}

/// A running proxy and control API.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct CutoverRuntime {
    proxy_handle: JoinHandle<std::io::Result<()>>,
    api_handle: JoinHandle<std::io::Result<()>>,
    reconcile_handle: Option<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
    manager: Arc<ContainerManager>,
    proxy: Proxy,
    proxy_addr: SocketAddr,
    api_addr: SocketAddr,
}

impl CutoverRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> CutoverRuntimeBuilder {
        CutoverRuntimeBuilder::new()
    }

    /// Address the proxy is bound to.
    pub fn proxy_addr(&self) -> SocketAddr {
        self.proxy_addr
    }

    /// Address the control API is bound to.
    pub fn api_addr(&self) -> SocketAddr {
        self.api_addr
    }

    /// The container manager.
    pub fn manager(&self) -> &Arc<ContainerManager> {
        &self.manager
    }

    /// The traffic proxy.
    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    /// Check if both servers are still running.
    pub fn is_running(&self) -> bool {
        !self.proxy_handle.is_finished() && !self.api_handle.is_finished()
    }

    /// Gracefully shut down the runtime.
    ///
    /// Cancels pending health checks, stops accepting connections and waits
    /// for in-flight requests to finish.
    pub async fn shutdown(self) -> Result<()> {
        info!("CutoverRuntime shutting down...");

        self.manager.shutdown();
        let _ = self.shutdown_tx.send(true);

        if let Some(handle) = self.reconcile_handle
            && let Err(e) = handle.await
        {
            error!("Startup reconciliation task panicked: {}", e);
        }

        let api_result = join_server("control API", self.api_handle).await;
        let proxy_result = join_server("proxy", self.proxy_handle).await;
        api_result.and(proxy_result)?;

        info!("CutoverRuntime shutdown complete");
        Ok(())
    }
}

async fn join_server(name: &str, handle: JoinHandle<std::io::Result<()>>) -> Result<()> {
    match handle.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!("{} server error during shutdown: {}", name, e);
            Err(e.into())
        }
        Err(e) => {
            error!("{} server task panicked: {}", name, e);
            Err(anyhow::anyhow!("{} server task panicked: {}", name, e))
        }
    }
}
