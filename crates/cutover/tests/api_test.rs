// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Control API over HTTP.

mod common;

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;

use common::{BUCKET, TestEnv, app_server, launch_config};
use cutover::Error;
use cutover::api::{self, ApiState, StoredConfig};
use cutover::history::ContainerHistoryEvent;
use wiremock::MockServer;

/// API served on an ephemeral port next to a [`TestEnv`].
struct TestApi {
    env: TestEnv,
    addr: SocketAddr,
    client: reqwest::Client,
    _shutdown: watch::Sender<bool>,
}

impl TestApi {
    async fn start() -> Self {
        Self::with_env(TestEnv::new().await).await
    }

    async fn with_env(env: TestEnv) -> Self {
        let state = ApiState::new(
            env.manager.clone(),
            env.proxy.proxy.clone(),
            env.store.clone(),
            TestEnv::identity(),
            10,
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown, rx) = watch::channel(false);
        tokio::spawn(api::serve(listener, state, rx));

        Self {
            env,
            addr,
            client: reqwest::Client::new(),
            _shutdown: shutdown,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn post(&self, path: &str, body: &str) -> (u16, String) {
        let response = self
            .client
            .post(self.url(path))
            .body(body.to_string())
            .send()
            .await
            .unwrap();
        (response.status().as_u16(), response.text().await.unwrap())
    }

    async fn deploy(&self, revision: &str) -> StoredConfig {
        let response = self
            .client
            .post(self.url("/deploy"))
            .json(&launch_config(revision))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);
        response.json().await.unwrap()
    }

    /// Publish containers of `revision` on `server`'s port.
    async fn serve_revision(&self, revision: &str, server: &MockServer) {
        let image = launch_config(revision).container_config.image;
        self.env.runtime.add_image(&image).await;
        self.env
            .runtime
            .set_port_for_image(&image, server.address().port())
            .await;
    }

    /// Deploy, launch and switch to `revision`, returning its hash.
    async fn release(&self, revision: &str) -> String {
        let server = app_server(revision, "").await;
        self.serve_revision(revision, &server).await;

        let stored = self.deploy(revision).await;
        let (status, body) = self.post("/launch", &stored.hash).await;
        assert_eq!(status, 200, "{}", body);
        let (status, body) = self.post("/switch", &stored.hash).await;
        assert_eq!(status, 200, "{}", body);
        stored.hash
    }

    async fn history(&self) -> Vec<ContainerHistoryEvent> {
        self.client
            .get(self.url("/history"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn test_deploy_launch_switch() {
    let api = TestApi::start().await;
    let server = app_server("abc123", "<p>down</p>").await;
    api.serve_revision("abc123", &server).await;

    let stored = api.deploy("abc123").await;
    assert_eq!(stored.revision, "abc123");
    assert!(api.history().await.is_empty());
    assert!(matches!(
        api.env.store.load_current().await,
        Err(Error::LaunchConfigNotFound)
    ));

    let port = server.address().port();
    let (status, body) = api.post("/launch", &format!("{}\n", stored.hash)).await;
    assert_eq!(status, 200, "{}", body);
    assert!(body.starts_with("started container mock0000"), "{}", body);
    assert!(
        body.ends_with(&format!(
            "with revision {} listening on port {}",
            &stored.hash[..8],
            port
        )),
        "{}",
        body
    );
    assert!(api.history().await.is_empty());

    let (status, body) = api.post("/switch", &stored.hash).await;
    assert_eq!(status, 200, "{}", body);
    assert!(
        body.starts_with(&format!("switched proxy to port {} of container ", port)),
        "{}",
        body
    );

    let (status, body) = api.env.proxy.get("/").await;
    assert_eq!((status, body.as_str()), (200, "abc123"));

    let history = api.history().await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].hash, stored.hash);
    assert_eq!(history[0].revision, "abc123");
    assert_eq!(history[0].deployed_by, "deployer");
    let (current, _) = api.env.store.load_current().await.unwrap();
    assert_eq!(current, stored.hash);

    // Switching again to the live revision records nothing new.
    let (status, _) = api.post("/switch", &stored.hash).await;
    assert_eq!(status, 200);
    assert_eq!(api.history().await.len(), 1);
}

#[tokio::test]
async fn test_failed_launch_keeps_current() {
    let env = TestEnv::with_health_timeout(Duration::from_millis(300)).await;
    let api = TestApi::with_env(env).await;
    let live = api.release("good1").await;

    // Nothing answers the health check of the broken revision.
    let broken_server = MockServer::start().await;
    api.serve_revision("broken2", &broken_server).await;
    let broken = api.deploy("broken2").await;

    let (status, _) = api.post("/launch", &broken.hash).await;
    assert_eq!(status, 500);
    let (status, _) = api.post("/switch", &broken.hash).await;
    assert_eq!(status, 404);

    let (current, config) = api.env.store.load_current().await.unwrap();
    assert_eq!(current, live);
    assert_eq!(config.revision, "good1");
    let history = api.history().await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].hash, live);
}

#[tokio::test]
async fn test_deploy_requires_image() {
    let api = TestApi::start().await;
    let response = api
        .client
        .post(api.url("/deploy"))
        .json(&serde_json::json!({ "Revision": "abc123" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
    assert!(api.env.objects.keys(BUCKET).await.is_empty());
}

#[tokio::test]
async fn test_switch_unknown_revision() {
    let api = TestApi::start().await;
    let (status, body) = api.post("/switch", "deadbeef").await;
    assert_eq!(status, 404);
    assert_eq!(
        body,
        "don't know about a container with revision \"deadbeef\"\n"
    );
}

#[tokio::test]
async fn test_launch_without_hash() {
    let api = TestApi::start().await;
    let (status, _) = api.post("/launch", "  \n").await;
    assert_eq!(status, 400);
}

#[tokio::test]
async fn test_status() {
    let api = TestApi::start().await;
    let response = api.client.get(api.url("/status")).send().await.unwrap();
    assert_eq!(response.status().as_u16(), 200);

    let stats: serde_json::Value = response.json().await.unwrap();
    assert_eq!(stats["Requests"], 0);
    assert_eq!(stats["MaintenanceMode"], false);
    assert_eq!(stats["DockerState"], "Ok");
    assert!(stats["CurrentContainer"].is_null());
    assert_eq!(stats["KnownRevisions"], serde_json::json!([]));
}

#[tokio::test]
async fn test_history_and_rollback() {
    let api = TestApi::start().await;

    let (status, _) = api.post("/history/rollback", "deadbeef").await;
    assert_eq!(status, 404);

    let first = api.release("first").await;
    let second = api.release("second").await;
    let third = api.release("third").await;
    let hashes = |events: Vec<ContainerHistoryEvent>| {
        events.into_iter().map(|e| e.hash).collect::<Vec<_>>()
    };
    assert_eq!(
        hashes(api.history().await),
        vec![first.clone(), second.clone(), third]
    );

    let (status, body) = api.post("/history/rollback", &second).await;
    assert_eq!(status, 200, "{}", body);
    let target: ContainerHistoryEvent = serde_json::from_str(&body).unwrap();
    assert_eq!(target.hash, second);
    assert_eq!(target.revision, "second");
    assert_eq!(hashes(api.history().await), vec![first, second.clone()]);

    let (hash, _) = api.env.store.load_current().await.unwrap();
    assert_eq!(hash, second);

    let (status, _) = api.post("/history/rollback", "0000").await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn test_maintenance_toggle() {
    let api = TestApi::start().await;
    let server = app_server("hello", "<h1>Back soon</h1>").await;
    api.env
        .proxy
        .proxy
        .update(server.address().to_string(), "maintenance")
        .await;

    let (status, _) = api.post("/maintenance/up", "").await;
    assert_eq!(status, 200);
    let (status, body) = api.env.proxy.get("/").await;
    assert_eq!((status, body.as_str()), (500, "<h1>Back soon</h1>"));

    let (status, _) = api.post("/maintenance/down", "").await;
    assert_eq!(status, 200);
    let (status, body) = api.env.proxy.get("/").await;
    assert_eq!((status, body.as_str()), (200, "hello"));
}
