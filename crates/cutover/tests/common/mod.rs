// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for cutover integration tests.
//!
//! Provides a proxy bound to an ephemeral port, upstream servers that answer
//! with a fixed body, and a manager wired to in-memory storage and a mock
//! container runtime.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use wiremock::matchers::{any, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use cutover::containers::{ContainerConfig, MockRuntime};
use cutover::health::HealthChecker;
use cutover::identity::StaticIdentity;
use cutover::launch_config::{LaunchConfig, LaunchConfigStore};
use cutover::manager::{ContainerManager, ManagerConfig};
use cutover::proxy::{self, Proxy};
use cutover::storage::MemoryObjectStore;

pub const BUCKET: &str = "deploys";
pub const PREFIX: &str = "shop/production";
pub const APP: &str = "shop";
pub const REGISTRY_PORT: u16 = 8080;

/// Proxy served on `127.0.0.1:0`, stopped when dropped.
pub struct TestProxy {
    pub proxy: Proxy,
    pub addr: SocketAddr,
    pub client: reqwest::Client,
    shutdown: watch::Sender<bool>,
}

impl TestProxy {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind proxy listener");
        let addr = listener.local_addr().expect("Failed to get local addr");
        let proxy = Proxy::new();
        let (shutdown, rx) = watch::channel(false);
        tokio::spawn(proxy::serve(listener, proxy.clone(), rx));

        Self {
            proxy,
            addr,
            client: reqwest::Client::new(),
            shutdown,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// GET through the proxy, returning status and body.
    pub async fn get(&self, path: &str) -> (u16, String) {
        let response = self
            .client
            .get(self.url(path))
            .send()
            .await
            .expect("Request through proxy failed");
        let status = response.status().as_u16();
        let body = response.text().await.expect("Failed to read body");
        (status, body)
    }
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

/// Upstream answering every request with `body`.
pub async fn upstream(body: &str) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&server)
        .await;
    server
}

/// Upstream that is healthy on `/status` and serves a maintenance page.
pub async fn app_server(body: &str, maintenance_page: &str) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/status"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/maintenance"))
        .respond_with(ResponseTemplate::new(200).set_body_string(maintenance_page))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&server)
        .await;
    server
}

pub fn image(revision: &str) -> String {
    format!("localhost:{}/{}:{}", REGISTRY_PORT, APP, revision)
}

pub fn launch_config(revision: &str) -> LaunchConfig {
    LaunchConfig {
        container_config: ContainerConfig {
            image: image(revision),
            env: vec!["RACK_ENV=production".to_string()],
            ..Default::default()
        },
        health_check_path: "status".to_string(),
        maintenance_path: Some("maintenance".to_string()),
        revision: revision.to_string(),
        ..Default::default()
    }
}

/// Manager over in-memory storage and a mock runtime.
pub struct TestEnv {
    pub objects: MemoryObjectStore,
    pub store: LaunchConfigStore,
    pub runtime: MockRuntime,
    pub proxy: TestProxy,
    pub manager: Arc<ContainerManager>,
}

impl TestEnv {
    pub async fn new() -> Self {
        Self::build(ManagerConfig::new(APP, REGISTRY_PORT), Duration::from_secs(5)).await
    }

    pub async fn with_config(config: ManagerConfig) -> Self {
        Self::build(config, Duration::from_secs(5)).await
    }

    pub async fn with_health_timeout(timeout: Duration) -> Self {
        Self::build(ManagerConfig::new(APP, REGISTRY_PORT), timeout).await
    }

    async fn build(config: ManagerConfig, health_timeout: Duration) -> Self {
        let objects = MemoryObjectStore::new();
        let store = LaunchConfigStore::new(Arc::new(objects.clone()), BUCKET, PREFIX);
        let runtime = MockRuntime::new();
        let proxy = TestProxy::start().await;
        let health = HealthChecker::new(Duration::from_millis(10), health_timeout)
            .with_host("127.0.0.1");
        let manager = Arc::new(ContainerManager::new(
            Arc::new(runtime.clone()),
            store.clone(),
            proxy.proxy.clone(),
            health,
            config,
        ));

        Self {
            objects,
            store,
            runtime,
            proxy,
            manager,
        }
    }

    pub fn identity() -> Arc<StaticIdentity> {
        Arc::new(StaticIdentity("deployer".to_string()))
    }

    /// Save `config`, make its image available and publish its containers on `server`'s port.
    pub async fn register(&self, config: &LaunchConfig, server: &MockServer) -> String {
        let hash = self.store.save(config).await.expect("Failed to save launch config");
        self.runtime.add_image(&config.container_config.image).await;
        self.runtime
            .set_port_for_image(&config.container_config.image, server.address().port())
            .await;
        hash
    }

    /// Wait until the runtime holds exactly `count` containers.
    pub async fn wait_for_container_count(&self, count: usize) {
        for _ in 0..200 {
            if self.runtime.containers().await.len() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "expected {} containers, found {:?}",
            count,
            self.runtime.containers().await
        );
    }
}
