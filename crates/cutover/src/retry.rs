// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bounded retry with exponential backoff for calls to external services.
//!
//! Object storage and the container runtime are remote HTTP services. A
//! dropped connection or a 5xx should not fail a deploy outright, but a 4xx
//! (bad request, missing object) must surface immediately.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Classification of a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Worth trying again (network failure, 408, 429, 5xx).
    Transient,
    /// Retrying cannot help.
    Permanent,
}

/// Classify an HTTP status code into an error category.
///
/// - 408 Request Timeout → Transient
/// - 429 Too Many Requests → Transient
/// - 5xx Server Errors → Transient
/// - everything else → Permanent
pub fn classify_http_status(status: u16) -> ErrorCategory {
    match status {
        408 | 429 => ErrorCategory::Transient,
        500..=599 => ErrorCategory::Transient,
        _ => ErrorCategory::Permanent,
    }
}

/// Errors that know whether they are worth retrying.
pub trait Retryable {
    /// Category of this error.
    fn category(&self) -> ErrorCategory;
}

/// Retry policy: exponential backoff, `delay * 2^(attempt-1)`.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = no retries, just one attempt).
    pub max_retries: u32,
    /// Base delay between retries.
    pub delay: Duration,
}

impl RetryConfig {
    /// Create a new retry configuration.
    pub fn new(max_retries: u32, delay: Duration) -> Self {
        Self { max_retries, delay }
    }

    /// Never retry.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Calculate delay for a given attempt (1-indexed).
    ///
    /// Attempt 1 is the first retry (after the initial failure).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.delay.saturating_mul(multiplier)
    }

    /// Run `op` until it succeeds, fails permanently, or retries run out.
    pub async fn run<T, E, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, E>
    where
        E: Retryable + std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e)
                    if attempt < self.max_retries
                        && e.category() == ErrorCategory::Transient =>
                {
                    attempt += 1;
                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(2, Duration::from_millis(200))
    }
}
