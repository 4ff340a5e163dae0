// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Health polling of freshly started containers.

use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Polls `GET http://{host}:{port}/{path}` until it answers 200.
#[derive(Debug, Clone)]
pub struct HealthChecker {
    http: reqwest::Client,
    host: String,
    interval: Duration,
    timeout: Duration,
}

impl HealthChecker {
    /// Create a checker polling `localhost` every `interval`, giving up after `timeout`.
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(interval.max(Duration::from_secs(1)))
            .build()
            .unwrap_or_default();
        Self {
            http,
            host: "localhost".to_string(),
            interval,
            timeout,
        }
    }

    /// Poll a different host than `localhost`.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Host containers publish their ports on.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// URL polled for a port and health check path.
    pub fn url(&self, port: u16, path: &str) -> String {
        format!(
            "http://{}:{}/{}",
            self.host,
            port,
            path.trim_start_matches('/')
        )
    }

    async fn probe(&self, url: &str) -> bool {
        // Apps that force SSL would otherwise redirect the probe.
        match self
            .http
            .get(url)
            .header("X-Forwarded-Proto", "https")
            .send()
            .await
        {
            Ok(response) => response.status() == reqwest::StatusCode::OK,
            Err(e) => {
                debug!(url, error = %e, "Health probe failed");
                false
            }
        }
    }

    /// Wait until the container is healthy, the timeout passes, or `shutdown` flips to true.
    pub async fn wait_until_healthy(
        &self,
        container_id: &str,
        port: u16,
        path: &str,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let url = self.url(port, path);
        let started = Instant::now();

        loop {
            if *shutdown.borrow() {
                return Err(Error::HealthCheckCancelled(container_id.to_string()));
            }
            if self.probe(&url).await {
                info!(
                    container_id,
                    port,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Container is healthy"
                );
                return Ok(());
            }

            let elapsed = started.elapsed();
            if elapsed >= self.timeout {
                return Err(Error::HealthCheckTimeout {
                    container_id: container_id.to_string(),
                    elapsed,
                });
            }

            let wait = self.interval.min(self.timeout - elapsed);
            debug!(container_id, wait_ms = wait.as_millis() as u64, "Waiting for container");
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancelled(&mut shutdown) => {
                    return Err(Error::HealthCheckCancelled(container_id.to_string()));
                }
            }
        }
    }
}

/// Resolves once the flag is true; never if the sender is gone first.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}
