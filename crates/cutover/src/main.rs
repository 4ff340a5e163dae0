// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cutover - Zero-Downtime Container Deployment Server
//!
//! Runs the traffic proxy and the control API for one application:
//! - Launch configurations and history in S3
//! - Containers through the Docker Engine API
//! - Traffic switching between container versions

use std::sync::Arc;

use tracing::{info, warn};

use cutover::config::Config;
use cutover::containers::{ContainerRuntime, DockerRuntime};
use cutover::identity::{IamIdentity, IdentityProvider, StaticIdentity};
use cutover::launch_config::LaunchConfigStore;
use cutover::manager::ManagerConfig;
use cutover::runtime::CutoverRuntime;
use cutover::storage::{S3Client, S3Credentials};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cutover=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        app = %config.app_name,
        proxy_addr = %config.proxy_addr,
        api_addr = %config.api_addr,
        bucket = %config.s3_bucket,
        prefix = %config.s3_prefix,
        "Starting cutover"
    );

    let store = LaunchConfigStore::new(
        Arc::new(S3Client::from_env()?),
        &config.s3_bucket,
        &config.s3_prefix,
    );

    let identity: Arc<dyn IdentityProvider> = match &config.deployed_by {
        Some(name) => Arc::new(StaticIdentity(name.clone())),
        None => Arc::new(IamIdentity::new(S3Credentials::from_env()?)),
    };

    let docker = Arc::new(DockerRuntime::new(&config.docker_url));
    info!(
        runtime_type = docker.runtime_type(),
        url = %config.docker_url,
        "Container runtime initialized"
    );

    let mut manager_config = ManagerConfig::new(&config.app_name, config.registry_port);
    manager_config.container_env = config.container_env()?;
    manager_config.expected_storage_driver = config.expected_storage_driver.clone();

    let runtime = CutoverRuntime::builder()
        .store(store)
        .container_runtime(docker)
        .identity(identity)
        .manager_config(manager_config)
        .proxy_addr(config.proxy_addr)
        .api_addr(config.api_addr)
        .health_check_interval(config.health_check_interval)
        .health_check_timeout(config.health_check_timeout)
        .history_max_size(config.history_max_size)
        .build()?
        .start()
        .await?;

    info!(
        proxy_addr = %runtime.proxy_addr(),
        api_addr = %runtime.api_addr(),
        "Cutover ready"
    );

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Cutover shut down");

    Ok(())
}
