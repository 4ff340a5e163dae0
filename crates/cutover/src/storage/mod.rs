// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Object storage backends.
//!
//! Launch configurations and the deployment history live in an object store.
//! The store is addressed by bucket and key; a missing object is an expected
//! condition and is reported as `Ok(None)`, never as an error.

pub mod memory;
pub mod s3;
pub mod sigv4;

pub use memory::MemoryObjectStore;
pub use s3::{S3Client, S3Credentials};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::retry::{ErrorCategory, Retryable, classify_http_status};

/// Errors from object storage operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// The store answered with a non-success status.
    #[error("storage request for key {key:?} failed: [{status}] {body}")]
    Status {
        /// Key that was requested.
        key: String,
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },

    /// Source object of a copy does not exist.
    #[error("source object {0:?} does not exist")]
    MissingSource(String),

    /// The request never produced a response.
    #[error("storage transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Credentials are missing or unusable.
    #[error("storage credentials: {0}")]
    Credentials(String),

    /// Endpoint, bucket or key do not form a valid URL.
    #[error("invalid object URL {0:?}")]
    InvalidUrl(String),
}

impl Retryable for StorageError {
    fn category(&self) -> ErrorCategory {
        match self {
            StorageError::Status { status, .. } => classify_http_status(*status),
            StorageError::Transport(e) if e.is_connect() || e.is_timeout() => {
                ErrorCategory::Transient
            }
            _ => ErrorCategory::Permanent,
        }
    }
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Durable key/value blob storage.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch an object. `Ok(None)` means the object does not exist.
    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Bytes>>;

    /// Store an object, replacing any existing one.
    async fn put(&self, bucket: &str, key: &str, body: Bytes) -> Result<()>;

    /// Server-side copy of an object within or across buckets.
    async fn copy(&self, src_bucket: &str, src_key: &str, dst_bucket: &str, dst_key: &str)
    -> Result<()>;
}
