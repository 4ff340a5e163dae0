// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for cutover.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Cutover configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the traffic proxy listens on
    pub proxy_addr: SocketAddr,
    /// Address of the operator control API
    pub api_addr: SocketAddr,
    /// Object storage bucket holding launch configs and history
    pub s3_bucket: String,
    /// Key prefix (one per environment) inside the bucket
    pub s3_prefix: String,
    /// Application name, used to recognise this app's images
    pub app_name: String,
    /// Port of the local image registry (`localhost:{port}/{app}:{revision}`)
    pub registry_port: u16,
    /// Base URL of the container runtime API
    pub docker_url: String,
    /// Optional file with `key=value` lines injected into created containers
    pub container_env_file: Option<PathBuf>,
    /// Delay between health-check attempts
    pub health_check_interval: Duration,
    /// Give up on a container that is not healthy after this long
    pub health_check_timeout: Duration,
    /// Number of history events kept when persisting
    pub history_max_size: usize,
    /// Storage driver the runtime is expected to report
    pub expected_storage_driver: String,
    /// Static deployer identity; IAM is asked when unset
    pub deployed_by: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let s3_bucket = required("CUTOVER_S3_BUCKET")?;
        let s3_prefix = required("CUTOVER_S3_PREFIX")?;
        let app_name = required("CUTOVER_APP_NAME")?;

        let proxy_addr = parse_addr("CUTOVER_PROXY_ADDR", "0.0.0.0:80")?;
        let api_addr = parse_addr("CUTOVER_API_ADDR", "0.0.0.0:8001")?;

        let registry_port: u16 = std::env::var("CUTOVER_REGISTRY_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let docker_url = std::env::var("CUTOVER_DOCKER_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:4243".to_string());

        let container_env_file = std::env::var("CUTOVER_CONTAINER_ENV_FILE")
            .ok()
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        let health_check_interval =
            Duration::from_secs(parse_or("CUTOVER_HEALTH_CHECK_INTERVAL_SECS", 5)?);
        let health_check_timeout =
            Duration::from_secs(parse_or("CUTOVER_HEALTH_CHECK_TIMEOUT_SECS", 300)?);
        let history_max_size = parse_or("CUTOVER_HISTORY_MAX_SIZE", 10)? as usize;

        let expected_storage_driver = std::env::var("CUTOVER_EXPECTED_STORAGE_DRIVER")
            .unwrap_or_else(|_| "overlay2".to_string());

        let deployed_by = std::env::var("CUTOVER_DEPLOYED_BY")
            .ok()
            .filter(|v| !v.is_empty());

        Ok(Self {
            proxy_addr,
            api_addr,
            s3_bucket,
            s3_prefix,
            app_name,
            registry_port,
            docker_url,
            container_env_file,
            health_check_interval,
            health_check_timeout,
            history_max_size,
            expected_storage_driver,
            deployed_by,
        })
    }

    /// Read the container environment file, if one is configured.
    pub fn container_env(&self) -> Result<BTreeMap<String, String>, ConfigError> {
        match &self.container_env_file {
            Some(path) => read_env_file(path),
            None => Ok(BTreeMap::new()),
        }
    }
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::MissingEnvVar(name))
}

fn parse_addr(name: &'static str, default: &str) -> Result<SocketAddr, ConfigError> {
    std::env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| ConfigError::InvalidAddr(name))
}

fn parse_or(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(name) {
        Ok(v) => v.parse().map_err(|_| ConfigError::InvalidNumber(name)),
        Err(_) => Ok(default),
    }
}

/// Parse a container environment file.
///
/// Each non-empty line that does not start with `#` must be `key=value`.
/// Keys and values are trimmed; the value may itself contain `=`.
pub fn read_env_file(path: &Path) -> Result<BTreeMap<String, String>, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::EnvFile {
        path: path.to_path_buf(),
        source: e,
    })?;
    parse_env_lines(&content)
}

fn parse_env_lines(content: &str) -> Result<BTreeMap<String, String>, ConfigError> {
    let mut env = BTreeMap::new();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let (key, value) = trimmed
            .split_once('=')
            .ok_or_else(|| ConfigError::EnvFileSyntax(line.to_string()))?;
        env.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(env)
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// The port number is invalid.
    #[error("Invalid port number")]
    InvalidPort,
    /// A socket address could not be parsed.
    #[error("Invalid socket address in {0}")]
    InvalidAddr(&'static str),
    /// A numeric setting could not be parsed.
    #[error("Invalid number in {0}")]
    InvalidNumber(&'static str),
    /// The container env file could not be read.
    #[error("failed to open container config file {path}: {source}")]
    EnvFile {
        /// File that was opened.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// A line of the container env file is not `key=value`.
    #[error("syntax error: expected lines of key=value format, got\n\t{0:?}")]
    EnvFileSyntax(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_env_lines() {
        let env = parse_env_lines("RACK_ENV = production\nDATABASE_URL=postgres://u:p@db/app?a=b\n")
            .unwrap();
        assert_eq!(env.len(), 2);
        assert_eq!(env["RACK_ENV"], "production");
        assert_eq!(env["DATABASE_URL"], "postgres://u:p@db/app?a=b");
    }

    #[test]
    fn test_parse_env_lines_skips_blank_and_comments() {
        let env = parse_env_lines("\n# comment\nA=1\n   \n").unwrap();
        assert_eq!(env.len(), 1);
        assert_eq!(env["A"], "1");
    }

    #[test]
    fn test_parse_env_lines_rejects_garbage() {
        let err = parse_env_lines("A=1\nnot a pair\n").unwrap_err();
        assert!(matches!(err, ConfigError::EnvFileSyntax(ref l) if l == "not a pair"));
    }

    #[test]
    fn test_read_env_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "SECRET_KEY_BASE=abc").unwrap();
        let env = read_env_file(file.path()).unwrap();
        assert_eq!(env["SECRET_KEY_BASE"], "abc");
    }

    #[test]
    fn test_read_env_file_missing() {
        let err = read_env_file(Path::new("/nonexistent/cutover.env")).unwrap_err();
        assert!(matches!(err, ConfigError::EnvFile { .. }));
    }
}
