//! Startup configuration for Betamax
//!
//! This is the process-level configuration (listener, upstream, limits).
//! The runtime cassette settings live in [`crate::tray`].

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use hyper::Uri;

use crate::{BetamaxError, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Port the proxy listens on
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Upstream the proxy forwards to, e.g. `http://api.example.com:8000`
    pub target_url: String,
    /// Directory holding one JSON file per cassette
    #[serde(default = "default_cassette_dir")]
    pub cassette_dir: PathBuf,
    /// Resource limits
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Transport timeouts
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

fn default_listen_port() -> u16 {
    8080
}

fn default_cassette_dir() -> PathBuf {
    PathBuf::from("./cassettes")
}

/// Resource limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// Maximum request size in bytes
    pub max_request_size: usize,
    /// Maximum response size in bytes
    pub max_response_size: usize,
    /// Maximum headers per request
    pub max_headers: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: 4096,
            max_request_size: 16 * 1024 * 1024,   // 16 MB
            max_response_size: 256 * 1024 * 1024, // 256 MB
            max_headers: 128,
        }
    }
}

/// Transport timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Upper bound for one upstream round trip
    pub upstream_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { upstream_ms: 15_000 }
    }
}

impl ServerConfig {
    /// Configuration with defaults for everything but the upstream
    #[must_use]
    pub fn new(target_url: impl Into<String>) -> Self {
        Self {
            listen_port: default_listen_port(),
            target_url: target_url.into(),
            cassette_dir: default_cassette_dir(),
            limits: LimitsConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }

    /// Load configuration from TOML file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BetamaxError::ConfigError(format!("Failed to read config file: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| BetamaxError::ConfigError(format!("Failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid
    pub fn validate(&self) -> Result<()> {
        let uri = self.target_uri()?;

        if !matches!(uri.scheme_str(), Some("http" | "https")) {
            return Err(BetamaxError::ConfigError(format!(
                "target_url must use the http or https scheme: {}",
                self.target_url
            )));
        }

        if self.listen_port == 0 {
            return Err(BetamaxError::ConfigError(
                "listen_port cannot be 0".to_string(),
            ));
        }

        let limits = &self.limits;
        if limits.max_connections == 0
            || limits.max_request_size == 0
            || limits.max_response_size == 0
            || limits.max_headers == 0
        {
            return Err(BetamaxError::ConfigError(
                "resource limits must be > 0".to_string(),
            ));
        }

        if self.timeouts.upstream_ms == 0 {
            return Err(BetamaxError::ConfigError(
                "timeouts.upstream_ms must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Parsed upstream URL
    ///
    /// # Errors
    ///
    /// Returns error if the URL is empty, unparsable or has no host
    pub fn target_uri(&self) -> Result<Uri> {
        if self.target_url.is_empty() {
            return Err(BetamaxError::ConfigError(
                "target_url cannot be empty".to_string(),
            ));
        }

        let uri = self.target_url.parse::<Uri>().map_err(|e| {
            BetamaxError::ConfigError(format!("Invalid target_url '{}': {e}", self.target_url))
        })?;

        if uri.authority().is_none() {
            return Err(BetamaxError::ConfigError(format!(
                "target_url has no host: {}. Try http://{}",
                self.target_url, self.target_url
            )));
        }

        Ok(uri)
    }

    /// Host (and port) of the upstream, as sent in a rewritten Host header
    ///
    /// # Errors
    ///
    /// Returns error if the target URL is invalid
    pub fn target_host(&self) -> Result<String> {
        let uri = self.target_uri()?;
        uri.authority()
            .map(ToString::to_string)
            .ok_or_else(|| BetamaxError::ConfigError("target_url has no host".to_string()))
    }
}
