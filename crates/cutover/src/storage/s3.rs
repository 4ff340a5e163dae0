// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! S3 compatible object store over plain HTTP with SigV4 signing.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use reqwest::StatusCode;
use tracing::debug;
use url::Url;

use super::sigv4::{EMPTY_PAYLOAD_SHA256, Signer, sha256_hex};
use super::{ObjectStore, Result, StorageError};
use crate::retry::RetryConfig;

/// Static AWS credentials.
#[derive(Clone)]
pub struct S3Credentials {
    /// Access key id.
    pub access_key_id: String,
    /// Secret access key.
    pub secret_access_key: String,
    /// Session token for temporary credentials.
    pub session_token: Option<String>,
}

impl std::fmt::Debug for S3Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl S3Credentials {
    /// Read `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY` and the optional
    /// `AWS_SESSION_TOKEN`.
    pub fn from_env() -> Result<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .map_err(|_| StorageError::Credentials("AWS_ACCESS_KEY_ID is not set".into()))?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .map_err(|_| StorageError::Credentials("AWS_SECRET_ACCESS_KEY is not set".into()))?;
        let session_token = std::env::var("AWS_SESSION_TOKEN")
            .ok()
            .filter(|v| !v.is_empty());
        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

/// Region from `AWS_REGION`, then `AWS_DEFAULT_REGION`, then `us-east-1`.
pub fn region_from_env() -> String {
    std::env::var("AWS_REGION")
        .or_else(|_| std::env::var("AWS_DEFAULT_REGION"))
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "us-east-1".to_string())
}

/// Path-style S3 client.
#[derive(Debug, Clone)]
pub struct S3Client {
    http: reqwest::Client,
    endpoint: String,
    signer: Signer,
    retry: RetryConfig,
}

impl S3Client {
    /// Create a client for the given endpoint (e.g. `https://s3.eu-west-1.amazonaws.com`).
    pub fn new(endpoint: impl Into<String>, region: &str, credentials: S3Credentials) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            http,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            signer: Signer::new(
                credentials.access_key_id,
                credentials.secret_access_key,
                credentials.session_token,
                region,
                "s3",
            ),
            retry: RetryConfig::default(),
        }
    }

    /// Build a client from the process environment.
    ///
    /// The endpoint comes from `CUTOVER_S3_ENDPOINT` and defaults to the
    /// regional AWS endpoint.
    pub fn from_env() -> Result<Self> {
        let region = region_from_env();
        let endpoint = std::env::var("CUTOVER_S3_ENDPOINT")
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| format!("https://s3.{}.amazonaws.com", region));
        Ok(Self::new(endpoint, &region, S3Credentials::from_env()?))
    }

    /// Replace the retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn object_url(&self, bucket: &str, key: &str) -> Result<Url> {
        let raw = format!("{}/{}/{}", self.endpoint, bucket, key.trim_start_matches('/'));
        Url::parse(&raw).map_err(|_| StorageError::InvalidUrl(raw))
    }

    fn signed(
        &self,
        method: reqwest::Method,
        url: Url,
        extra: &[(&str, &str)],
        payload_sha256: &str,
    ) -> Result<reqwest::RequestBuilder> {
        let headers = self
            .signer
            .sign(method.as_str(), &url, extra, payload_sha256, Utc::now())?;
        let mut request = self.http.request(method, url);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        Ok(request)
    }

    async fn get_once(&self, bucket: &str, key: &str) -> Result<Option<Bytes>> {
        let url = self.object_url(bucket, key)?;
        let response = self
            .signed(reqwest::Method::GET, url, &[], EMPTY_PAYLOAD_SHA256)?
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            debug!(bucket, key, "Object not found");
            return Ok(None);
        }
        if !status.is_success() {
            return Err(status_error(key, response).await);
        }
        Ok(Some(response.bytes().await?))
    }

    async fn put_once(&self, bucket: &str, key: &str, body: Bytes) -> Result<()> {
        let url = self.object_url(bucket, key)?;
        let payload_sha256 = sha256_hex(&body);
        let response = self
            .signed(reqwest::Method::PUT, url, &[], &payload_sha256)?
            .body(body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(status_error(key, response).await);
        }
        Ok(())
    }

    async fn copy_once(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> Result<()> {
        let url = self.object_url(dst_bucket, dst_key)?;
        let source = format!(
            "/{}/{}",
            src_bucket,
            urlencoding::encode(src_key).replace("%2F", "/")
        );
        let response = self
            .signed(
                reqwest::Method::PUT,
                url,
                &[("x-amz-copy-source", source.as_str())],
                EMPTY_PAYLOAD_SHA256,
            )?
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(StorageError::MissingSource(src_key.to_string()));
        }
        if !status.is_success() {
            return Err(status_error(dst_key, response).await);
        }
        Ok(())
    }
}

async fn status_error(key: &str, response: reqwest::Response) -> StorageError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    StorageError::Status {
        key: key.to_string(),
        status,
        body,
    }
}

#[async_trait]
impl ObjectStore for S3Client {
    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Bytes>> {
        self.retry
            .run("s3.get", move || self.get_once(bucket, key))
            .await
    }

    async fn put(&self, bucket: &str, key: &str, body: Bytes) -> Result<()> {
        self.retry
            .run("s3.put", move || self.put_once(bucket, key, body.clone()))
            .await
    }

    async fn copy(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> Result<()> {
        self.retry
            .run("s3.copy", move || {
                self.copy_once(src_bucket, src_key, dst_bucket, dst_key)
            })
            .await
    }
}
