// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory object store for testing and local development.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;

use super::{ObjectStore, Result, StorageError};

/// Object store backed by a map of `(bucket, key)` to bytes.
#[derive(Debug, Clone, Default)]
pub struct MemoryObjectStore {
    objects: Arc<Mutex<BTreeMap<(String, String), Bytes>>>,
}

impl MemoryObjectStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys currently stored in a bucket, sorted.
    pub async fn keys(&self, bucket: &str) -> Vec<String> {
        let objects = self.objects.lock().await;
        objects
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect()
    }

    /// Overwrite an object directly, bypassing any invariants callers keep.
    pub async fn corrupt(&self, bucket: &str, key: &str, body: impl Into<Bytes>) {
        let mut objects = self.objects.lock().await;
        objects.insert((bucket.to_string(), key.to_string()), body.into());
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Bytes>> {
        let objects = self.objects.lock().await;
        Ok(objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned())
    }

    async fn put(&self, bucket: &str, key: &str, body: Bytes) -> Result<()> {
        let mut objects = self.objects.lock().await;
        objects.insert((bucket.to_string(), key.to_string()), body);
        Ok(())
    }

    async fn copy(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> Result<()> {
        let mut objects = self.objects.lock().await;
        let body = objects
            .get(&(src_bucket.to_string(), src_key.to_string()))
            .cloned()
            .ok_or_else(|| StorageError::MissingSource(src_key.to_string()))?;
        objects.insert((dst_bucket.to_string(), dst_key.to_string()), body);
        Ok(())
    }
}
