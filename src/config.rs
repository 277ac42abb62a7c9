//! Configuration parsing and management

use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// File name of the root certificate inside the CA directory
pub const ROOT_CERT_FILE: &str = "erra.crt.pem";

/// File name of the root private key inside the CA directory
pub const ROOT_KEY_FILE: &str = "erra.key.pem";

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Listener settings
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Forged certificate settings
    #[serde(default)]
    pub certificates: CertificateConfig,

    /// Timeouts for upstream connects, tunnels and breakpoints
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// Host both listeners bind to
    #[serde(default = "default_bind_host")]
    pub bind_host: String,

    /// Port of the plaintext HTTP / CONNECT listener
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Port of the TLS listener that tunnels to port 443 are routed to
    #[serde(default = "default_https_port")]
    pub https_port: u16,

    /// Directory holding `erra.crt.pem` and `erra.key.pem`
    #[serde(default = "default_ca_dir")]
    pub ca_dir: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_host: default_bind_host(),
            http_port: default_http_port(),
            https_port: default_https_port(),
            ca_dir: default_ca_dir(),
        }
    }
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    3344
}

fn default_https_port() -> u16 {
    3355
}

fn default_ca_dir() -> String {
    "ca".to_string()
}

impl ProxyConfig {
    /// Path of the root certificate PEM
    pub fn ca_cert_path(&self) -> PathBuf {
        Path::new(&self.ca_dir).join(ROOT_CERT_FILE)
    }

    /// Path of the root private key PEM
    pub fn ca_key_path(&self) -> PathBuf {
        Path::new(&self.ca_dir).join(ROOT_KEY_FILE)
    }
}

/// Leaf certificate cache configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CertificateConfig {
    /// Maximum number of leaf certificates kept in memory
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    /// Seconds a cached leaf stays valid
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Validity period written into generated leaves
    #[serde(default = "default_leaf_validity_days")]
    pub leaf_validity_days: i64,
}

impl Default for CertificateConfig {
    fn default() -> Self {
        Self {
            cache_capacity: default_cache_capacity(),
            cache_ttl_secs: default_cache_ttl_secs(),
            leaf_validity_days: default_leaf_validity_days(),
        }
    }
}

fn default_cache_capacity() -> usize {
    500
}

fn default_cache_ttl_secs() -> u64 {
    60 * 60
}

fn default_leaf_validity_days() -> i64 {
    365
}

impl CertificateConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

/// Timeouts. A value of 0 disables the corresponding timeout.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_upstream_connect_secs")]
    pub upstream_connect_secs: u64,

    #[serde(default)]
    pub tunnel_idle_secs: u64,

    #[serde(default)]
    pub breakpoint_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            upstream_connect_secs: default_upstream_connect_secs(),
            tunnel_idle_secs: 0,
            breakpoint_secs: 0,
        }
    }
}

fn default_upstream_connect_secs() -> u64 {
    30
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

impl TimeoutConfig {
    pub fn upstream_connect(&self) -> Option<Duration> {
        non_zero_secs(self.upstream_connect_secs)
    }

    pub fn tunnel_idle(&self) -> Option<Duration> {
        non_zero_secs(self.tunnel_idle_secs)
    }

    pub fn breakpoint(&self) -> Option<Duration> {
        non_zero_secs(self.breakpoint_secs)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,

    /// Whether to log each intercepted request line
    pub log_requests: bool,

    /// Whether to log each response status
    pub log_responses: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_requests: true,
            log_responses: true,
        }
    }
}

/// Helper for deserializing `log_traffic` as either a bool or a table.
#[derive(Deserialize)]
#[serde(untagged)]
enum LogTrafficValue {
    Bool(bool),
    Table {
        #[serde(default = "default_true")]
        requests: bool,
        #[serde(default = "default_true")]
        responses: bool,
    },
}

fn default_true() -> bool {
    true
}

/// Raw helper struct for deserializing LoggingConfig from TOML.
#[derive(Deserialize)]
struct LoggingConfigRaw {
    #[serde(default = "default_log_level")]
    level: String,
    #[serde(default)]
    log_traffic: Option<LogTrafficValue>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl<'de> Deserialize<'de> for LoggingConfig {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = LoggingConfigRaw::deserialize(deserializer)?;
        let (log_requests, log_responses) = match raw.log_traffic {
            None => (true, true),
            Some(LogTrafficValue::Bool(b)) => (b, b),
            Some(LogTrafficValue::Table {
                requests,
                responses,
            }) => (requests, responses),
        };
        Ok(LoggingConfig {
            level: raw.level,
            log_requests,
            log_responses,
        })
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::config(format!(
                "Failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| Error::config(format!("Invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the proxy cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.certificates.cache_capacity == 0 {
            return Err(Error::config("certificates.cache_capacity must be at least 1"));
        }
        if self.certificates.leaf_validity_days <= 0 {
            return Err(Error::config(
                "certificates.leaf_validity_days must be positive",
            ));
        }
        if self.proxy.http_port != 0 && self.proxy.http_port == self.proxy.https_port {
            return Err(Error::config(format!(
                "proxy.http_port and proxy.https_port are both {}",
                self.proxy.http_port
            )));
        }
        Ok(())
    }

    /// Create a minimal configuration with ephemeral loopback ports
    pub fn minimal(ca_dir: impl Into<String>) -> Self {
        Self {
            proxy: ProxyConfig {
                bind_host: "127.0.0.1".to_string(),
                http_port: 0,
                https_port: 0,
                ca_dir: ca_dir.into(),
            },
            ..Self::default()
        }
    }
}
