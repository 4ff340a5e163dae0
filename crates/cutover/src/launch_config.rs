// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Content-addressed launch configurations.
//!
//! A launch configuration describes how to run one version of the
//! application container. It is identified by the MD5 hash of its canonical
//! JSON encoding and stored as `{prefix}/container.{hash}.json`. The object
//! `{prefix}/current.json` is a byte copy of the live configuration.
//!
//! Canonical JSON is the serde encoding in field declaration order, with all
//! maps sorted (`BTreeMap`), followed by a single newline.

use std::sync::Arc;

use bytes::Bytes;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::containers::{ContainerConfig, HostConfig};
use crate::error::{Error, Result};
use crate::storage::ObjectStore;

/// How to run one version of the application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LaunchConfig {
    /// Container creation parameters (image, env, command, ports, volumes).
    #[serde(default)]
    pub container_config: ContainerConfig,
    /// Port bindings, bind mounts and network mode.
    #[serde(default)]
    pub host_config: HostConfig,
    /// Path polled until the container answers 200.
    #[serde(default)]
    pub health_check_path: String,
    /// Path of the maintenance page served by the app; health check path when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintenance_path: Option<String>,
    /// Deployment label, e.g. a git SHA. Also the container name.
    #[serde(default)]
    pub revision: String,
    /// Recreate the container even if one for the image exists.
    #[serde(default)]
    pub force_reload: bool,
}

impl LaunchConfig {
    /// Canonical JSON bytes, newline terminated.
    pub fn to_canonical_json(&self) -> Result<Vec<u8>> {
        let mut buf = serde_json::to_vec(self)?;
        buf.push(b'\n');
        Ok(buf)
    }

    /// Path the proxy fetches the maintenance page from.
    pub fn maintenance_path(&self) -> &str {
        self.maintenance_path
            .as_deref()
            .unwrap_or(&self.health_check_path)
    }
}

/// Hex MD5 of a byte slice.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Md5::digest(bytes))
}

/// Launch configuration store for one environment prefix.
#[derive(Clone)]
pub struct LaunchConfigStore {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    prefix: String,
}

impl std::fmt::Debug for LaunchConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchConfigStore")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl LaunchConfigStore {
    /// Create a store rooted at `{bucket}/{prefix}/`.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        bucket: impl Into<String>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            prefix: prefix.into().trim_end_matches('/').to_string(),
        }
    }

    /// Underlying object store.
    pub fn object_store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Bucket name.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Key of a configuration by hash.
    pub fn container_key(&self, hash: &str) -> String {
        format!("{}/container.{}.json", self.prefix, hash)
    }

    /// Key of the current pointer.
    pub fn current_key(&self) -> String {
        format!("{}/current.json", self.prefix)
    }

    /// Key of the history list.
    pub fn history_key(&self) -> String {
        format!("{}/history.json", self.prefix)
    }

    /// Persist a configuration and return its content hash.
    ///
    /// Saving identical content twice writes the same key.
    pub async fn save(&self, config: &LaunchConfig) -> Result<String> {
        let bytes = config.to_canonical_json()?;
        let hash = content_hash(&bytes);
        let key = self.container_key(&hash);
        self.store
            .put(&self.bucket, &key, Bytes::from(bytes))
            .await?;
        info!(hash = %hash, revision = %config.revision, key = %key, "Saved launch config");
        Ok(hash)
    }

    /// Load the live configuration and its hash.
    ///
    /// Returns [`Error::LaunchConfigNotFound`] for a never-deployed environment.
    pub async fn load_current(&self) -> Result<(String, LaunchConfig)> {
        let bytes = self.fetch(&self.current_key()).await?;
        let hash = content_hash(&bytes);
        let config = serde_json::from_slice(&bytes)?;
        Ok((hash, config))
    }

    /// Load a configuration by hash, verifying the retrieved bytes hash to it.
    pub async fn load_by_hash(&self, hash: &str) -> Result<LaunchConfig> {
        let bytes = self.fetch(&self.container_key(hash)).await?;
        let actual = content_hash(&bytes);
        if actual != hash {
            return Err(Error::HashMismatch {
                expected: hash.to_string(),
                actual,
            });
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn fetch(&self, key: &str) -> Result<Bytes> {
        match self.store.get(&self.bucket, key).await? {
            Some(bytes) => Ok(bytes),
            None => {
                debug!(key, "Launch config not found");
                Err(Error::LaunchConfigNotFound)
            }
        }
    }
}
