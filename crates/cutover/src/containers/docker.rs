// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Docker Engine API client.
//!
//! Talks to a runtime listening on TCP (e.g. `http://127.0.0.1:4243`). Only
//! the calls the deployment cycle needs are implemented.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::traits::*;
use crate::retry::RetryConfig;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateResponse {
    id: String,
}

/// Docker runtime over HTTP.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    http: reqwest::Client,
    base_url: String,
    retry: RetryConfig,
}

impl DockerRuntime {
    /// Create a client for the runtime at `base_url`.
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            retry: RetryConfig::default(),
        }
    }

    /// Replace the retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_MODIFIED {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(RuntimeError::Status {
            status: status.as_u16(),
            body: body.trim().to_string(),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.send(self.http.get(self.url(path))).await?;
        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn call(&self, method: Method, path: &str) -> Result<()> {
        self.send(self.http.request(method, self.url(path))).await?;
        Ok(())
    }

    async fn post_drained(&self, path: &str) -> Result<()> {
        let response = self.send(self.http.post(self.url(path))).await?;
        response.bytes().await?;
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn runtime_type(&self) -> &'static str {
        "docker"
    }

    async fn list_containers(&self, all: bool) -> Result<Vec<Container>> {
        let path = &format!("/containers/json?all={}", if all { 1 } else { 0 });
        self.retry
            .run("docker.list_containers", move || self.get_json(path))
            .await
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo> {
        let path = &format!("/containers/{}/json", id);
        self.retry
            .run("docker.inspect_container", move || self.get_json(path))
            .await
    }

    async fn create_container(&self, config: &ContainerConfig, name: &str) -> Result<String> {
        // Not retried: a lost response followed by a retry would hit a name conflict.
        let url = self.url(&format!(
            "/containers/create?name={}",
            urlencoding::encode(name)
        ));
        let response = self.send(self.http.post(url).json(config)).await?;
        let created: CreateResponse = serde_json::from_slice(&response.bytes().await?)?;
        debug!(container_id = %created.id, name, "Created container");
        Ok(created.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        // Current engines reject a start request with a body.
        let path = &format!("/containers/{}/start", id);
        self.retry
            .run("docker.start_container", move || self.call(Method::POST, path))
            .await
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        let path = &format!("/containers/{}/stop?t=10", id);
        self.retry
            .run("docker.stop_container", move || self.call(Method::POST, path))
            .await
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let path = &format!("/containers/{}", id);
        self.retry
            .run("docker.remove_container", move || self.call(Method::DELETE, path))
            .await
    }

    async fn delete_image(&self, image: &str) -> Result<()> {
        let path = &format!("/images/{}", image);
        self.retry
            .run("docker.delete_image", move || self.call(Method::DELETE, path))
            .await
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        // The body is a progress stream; it is drained so the pull completes.
        let path = &format!("/images/create?fromImage={}", urlencoding::encode(image));
        self.retry
            .run("docker.pull_image", move || self.post_drained(path))
            .await
    }

    async fn host_info(&self) -> Result<HostInfo> {
        self.retry
            .run("docker.host_info", move || self.get_json("/info"))
            .await
    }
}
