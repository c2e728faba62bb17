//! dockroute
//!
//! Edge reverse proxy: hostnames registered under an etcd directory map to
//! Docker containers, requests are forwarded to the container's address and
//! TLS is terminated here.
//!
//! # Architecture Overview
//!
//! ```text
//!     etcd ──snapshot/watch──▶ RouteTable ◀──resolve── Docker
//!                                 ▲
//!                                 │ get(host)
//!     Client ──HTTP──▶ ┌──────────┴─────────┐
//!                      │     EdgeServer     │ ──plain HTTP──▶ container
//!     Client ──TLS───▶ └────────────────────┘
//!                        ▲
//!                        │ SNI certificates, TLS-capable hosts
//!                   certificate directory
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use dockroute::config::{parse_config, validate_config, ConfigError, ProxyConfig};
use dockroute::lifecycle::signals::shutdown_signal;
use dockroute::observability::init_logging;
use dockroute::EdgeServer;

#[derive(Debug, Parser)]
#[command(name = "dockroute")]
#[command(about = "Edge reverse proxy for containers registered in etcd", long_about = None)]
struct Cli {
    /// TOML configuration file; flags override its values.
    #[arg(long, env = "DOCKROUTE_CONFIG_FILE")]
    config_file: Option<PathBuf>,

    /// Plain HTTP listen address.
    #[arg(long)]
    listen_http: Option<String>,

    /// HTTPS listen address.
    #[arg(long)]
    listen_https: Option<String>,

    /// etcd endpoint.
    #[arg(long, env = "DOCKROUTE_ETCD")]
    etcd: Option<String>,

    /// Docker endpoint.
    #[arg(long, env = "DOCKER_HOST")]
    docker: Option<String>,

    /// Docker client TLS directory (ca.pem, cert.pem, key.pem). Empty disables.
    #[arg(long, env = "DOCKER_CERT_PATH")]
    docker_certs: Option<String>,

    /// Certificate directory. Empty disables HTTPS.
    #[arg(long)]
    certs: Option<String>,

    /// etcd directory holding hostname → container keys.
    #[arg(long)]
    config: Option<String>,

    /// Log filter directive, e.g. `dockroute=debug`.
    #[arg(long)]
    log_level: Option<String>,
}

fn optional_dir(value: String) -> Option<PathBuf> {
    (!value.trim().is_empty()).then(|| PathBuf::from(value))
}

impl Cli {
    fn apply(self, config: &mut ProxyConfig) {
        if let Some(address) = self.listen_http {
            config.listener.http_address = address;
        }
        if let Some(address) = self.listen_https {
            config.listener.https_address = address;
        }
        if let Some(endpoint) = self.etcd {
            config.discovery.etcd_endpoint = endpoint;
        }
        if let Some(endpoint) = self.docker {
            config.runtime.endpoint = endpoint;
        }
        if let Some(dir) = self.docker_certs {
            config.runtime.cert_dir = optional_dir(dir);
        }
        if let Some(dir) = self.certs {
            config.listener.cert_dir = optional_dir(dir);
        }
        if let Some(directory) = self.config {
            config.discovery.directory = directory;
        }
        if let Some(level) = self.log_level {
            config.observability.log_level = level;
        }
    }

    /// File values, then flag overrides, then a single validation pass.
    fn into_config(mut self) -> anyhow::Result<ProxyConfig> {
        let mut config = match self.config_file.take() {
            Some(path) => {
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading configuration from {}", path.display()))?;
                parse_config(&content)
                    .with_context(|| format!("parsing configuration from {}", path.display()))?
            }
            None => ProxyConfig::default(),
        };
        self.apply(&mut config);
        validate_config(&config).map_err(ConfigError::Validation)?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Cli::parse().into_config()?;

    init_logging(&config.observability).context("installing log subscriber")?;

    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("a rustls crypto provider is already installed"))?;

    tracing::info!(
        http = %config.listener.http_address,
        https = %config.listener.https_address,
        tls = config.listener.cert_dir.is_some(),
        etcd = %config.discovery.etcd_endpoint,
        directory = %config.discovery.directory,
        docker = %config.runtime.endpoint,
        "dockroute v{} starting",
        env!("CARGO_PKG_VERSION")
    );

    let mut server = EdgeServer::from_config(&config)
        .await
        .context("starting edge server")?;
    server.start();

    if let Err(e) = shutdown_signal().await {
        tracing::error!(error = %e, "Signal handler failed; shutting down");
    }

    server.stop().await;
    tracing::info!("Shutdown complete");
    Ok(())
}
