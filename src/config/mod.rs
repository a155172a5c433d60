//! Typed configuration from environment variables or a TOML file.
//!
//! Resolved once per invocation and handed to each component at
//! construction. The API token is wrapped in secrecy::SecretString to
//! prevent log leaks.

pub mod secrets;

use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use secrets::SecretString;
use serde::Deserialize;

/// Port used with an explicit cluster host when none is configured.
pub const DEFAULT_HTTPS_PORT: u16 = 443;

/// Dispatches allowed per poll cycle when none is configured.
pub const DEFAULT_PLAYBOOK_LIMIT: usize = 4;

/// Base URL of the platform the runner is installed on.
pub const DEFAULT_PLATFORM_BASE_URL: &str = "https://127.0.0.1";

#[derive(Debug)]
pub struct Config {
    /// Explicit cluster host, e.g. `https://soar.example.com`.
    pub cluster_base_url: Option<String>,
    pub https_port: u16,
    /// Sent as `ph-auth-token` on every request when present.
    pub api_token: Option<SecretString>,
    /// Per-cycle execution budget.
    pub playbook_limit: usize,
    pub debug: bool,
    /// Inherited base URL used when no cluster host is configured.
    pub platform_base_url: String,
    pub verify_tls: bool,
    pub request_timeout: Option<Duration>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cluster_base_url: None,
            https_port: DEFAULT_HTTPS_PORT,
            api_token: None,
            playbook_limit: DEFAULT_PLAYBOOK_LIMIT,
            debug: false,
            platform_base_url: DEFAULT_PLATFORM_BASE_URL.to_string(),
            verify_tls: false,
            request_timeout: None,
            otel_endpoint: None,
            log_level: "info".to_string(),
        }
    }
}

/// On-disk shape of a TOML config file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    cluster_base_url: Option<String>,
    https_port: Option<u16>,
    cluster_api_token: Option<SecretString>,
    playbook_limit: Option<usize>,
    debug: Option<bool>,
    platform_base_url: Option<String>,
    verify_tls: Option<bool>,
    request_timeout_secs: Option<u64>,
    otel_endpoint: Option<String>,
    log_level: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let https_port = match optional_var("RUNNER_HTTPS_PORT") {
            Some(port) => port
                .parse()
                .map_err(|_| Error::Config(format!("RUNNER_HTTPS_PORT is not a port: {port}")))?,
            None => DEFAULT_HTTPS_PORT,
        };

        let playbook_limit = match optional_var("RUNNER_PLAYBOOK_LIMIT") {
            Some(raw) => match raw.parse::<usize>() {
                Ok(limit) => limit,
                Err(_) => {
                    tracing::warn!(
                        value = %raw,
                        "could not parse RUNNER_PLAYBOOK_LIMIT, defaulting to {DEFAULT_PLAYBOOK_LIMIT}"
                    );
                    DEFAULT_PLAYBOOK_LIMIT
                }
            },
            None => DEFAULT_PLAYBOOK_LIMIT,
        };

        let request_timeout = match optional_var("RUNNER_REQUEST_TIMEOUT_SECS") {
            Some(secs) => Some(Duration::from_secs(secs.parse().map_err(|_| {
                Error::Config(format!("RUNNER_REQUEST_TIMEOUT_SECS is not a number: {secs}"))
            })?)),
            None => None,
        };

        let config = Self {
            cluster_base_url: optional_var("RUNNER_CLUSTER_BASE_URL"),
            https_port,
            api_token: optional_var("RUNNER_API_TOKEN").map(SecretString::from),
            playbook_limit,
            debug: bool_var("RUNNER_DEBUG")?.unwrap_or(defaults.debug),
            platform_base_url: optional_var("RUNNER_PLATFORM_BASE_URL")
                .unwrap_or(defaults.platform_base_url),
            verify_tls: bool_var("RUNNER_VERIFY_TLS")?.unwrap_or(defaults.verify_tls),
            request_timeout,
            otel_endpoint: optional_var("OTEL_ENDPOINT"),
            log_level: optional_var("LOG_LEVEL").unwrap_or(defaults.log_level),
        };
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config file {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML document. Missing keys take defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: FileConfig =
            toml::from_str(content).map_err(|e| Error::Config(format!("bad config file: {e}")))?;
        let defaults = Self::default();

        let config = Self {
            cluster_base_url: file.cluster_base_url.filter(|url| !url.trim().is_empty()),
            https_port: file.https_port.unwrap_or(defaults.https_port),
            api_token: file.cluster_api_token,
            playbook_limit: file.playbook_limit.unwrap_or(defaults.playbook_limit),
            debug: file.debug.unwrap_or(defaults.debug),
            platform_base_url: file
                .platform_base_url
                .unwrap_or(defaults.platform_base_url),
            verify_tls: file.verify_tls.unwrap_or(defaults.verify_tls),
            request_timeout: file.request_timeout_secs.map(Duration::from_secs),
            otel_endpoint: file.otel_endpoint,
            log_level: file.log_level.unwrap_or(defaults.log_level),
        };
        config.validate()?;
        Ok(config)
    }

    /// Effective REST base: explicit host plus port, or the platform default.
    pub fn base_url(&self) -> String {
        match &self.cluster_base_url {
            Some(host) => format!("{}:{}", host.trim_end_matches('/'), self.https_port),
            None => self.platform_base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Default tracing directive when `RUST_LOG` is not set.
    pub fn log_directive(&self) -> String {
        if self.debug {
            "debug".to_string()
        } else {
            self.log_level.clone()
        }
    }

    fn validate(&self) -> Result<()> {
        if self.playbook_limit == 0 {
            return Err(Error::Config(
                "playbook limit must allow at least one execution per cycle".to_string(),
            ));
        }
        if self.https_port == 0 {
            return Err(Error::Config("https port must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Unset and empty variables are treated alike.
fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn bool_var(name: &str) -> Result<Option<bool>> {
    match optional_var(name) {
        None => Ok(None),
        Some(v) => match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(Error::Config(format!("{name} is not a boolean: {v}"))),
        },
    }
}
