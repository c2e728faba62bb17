//! Configuration schema definitions.
//!
//! Every section has defaults so an empty file (or no file at all) yields a
//! runnable configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listen addresses and the certificate directory.
    pub listener: ListenerConfig,

    /// Config-store location and discovery behavior.
    pub discovery: DiscoveryConfig,

    /// Container runtime endpoint and client TLS.
    pub runtime: RuntimeConfig,

    pub timeouts: TimeoutConfig,

    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Plain HTTP bind address. `:80` means all interfaces.
    pub http_address: String,

    /// HTTPS bind address. Only used when `cert_dir` is set.
    pub https_address: String,

    /// Directory searched recursively for `*.crt`/`*.key` pairs.
    /// Unset disables TLS and the HTTPS redirect.
    pub cert_dir: Option<PathBuf>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            http_address: "0.0.0.0:80".to_string(),
            https_address: "0.0.0.0:443".to_string(),
            cert_dir: None,
        }
    }
}

/// Config-store settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// etcd endpoint, e.g. `http://127.0.0.1:2379`.
    pub etcd_endpoint: String,

    /// Directory whose immediate children map hostname → container.
    pub directory: String,

    /// Fixed delay between failed snapshot attempts.
    pub retry_interval_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            etcd_endpoint: "http://127.0.0.1:2379".to_string(),
            directory: "dockroute".to_string(),
            retry_interval_ms: 1000,
        }
    }
}

impl DiscoveryConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

/// Container runtime settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Docker endpoint: `unix:///path`, `tcp://host:port` or `http(s)://...`.
    pub endpoint: String,

    /// Directory holding `ca.pem`, `cert.pem` and `key.pem` for client TLS.
    pub cert_dir: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            endpoint: "unix:///var/run/docker.sock".to_string(),
            cert_dir: None,
        }
    }
}

/// Timeout configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Time to wait for backend response headers. 0 disables the limit.
    pub backend_secs: u64,
}

impl TimeoutConfig {
    pub fn backend(&self) -> Option<Duration> {
        (self.backend_secs > 0).then(|| Duration::from_secs(self.backend_secs))
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub log_level: String,

    pub log_format: LogFormat,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "dockroute=info,tower_http=info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}
