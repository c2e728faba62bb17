//! Container runtime access.
//!
//! Resolves the container identifier stored in the config-store to the
//! network address the proxy forwards to.

pub mod docker;

use async_trait::async_trait;
use thiserror::Error;

pub use docker::DockerRuntime;

/// Errors from the container runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("invalid runtime endpoint {0:?}")]
    InvalidEndpoint(String),

    #[error("invalid container identifier {0:?}")]
    InvalidIdentifier(String),

    #[error("runtime TLS setup failed: {0}")]
    Tls(String),

    #[error("container {0} not found")]
    NotFound(String),

    #[error("container {0} has no network address")]
    NoAddress(String),

    #[error("runtime returned status {status}: {message}")]
    Api { status: u16, message: String },

    #[error("runtime request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("runtime connection failed: {0}")]
    Connection(#[from] hyper::Error),

    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed runtime response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Resolves container identifiers to backend addresses.
#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    async fn resolve(&self, container: &str) -> Result<String, RuntimeError>;
}
