//! Listener binding.
//!
//! # Responsibilities
//! - Normalize listen addresses (`:80` means all interfaces)
//! - Bind the plain HTTP listener (tokio) and the TLS listener (std, handed
//!   to the rustls acceptor at start)
//! - Surface bind failures as fatal startup errors

use std::net::SocketAddr;
use tokio::net::TcpListener;

/// Error type for listener operations.
#[derive(Debug)]
pub enum ListenerError {
    /// Failed to bind to address.
    Bind { address: String, source: std::io::Error },
}

impl std::fmt::Display for ListenerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenerError::Bind { address, source } => {
                write!(f, "Failed to bind {}: {}", address, source)
            }
        }
    }
}

impl std::error::Error for ListenerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ListenerError::Bind { source, .. } => Some(source),
        }
    }
}

/// Expand a port-only address such as `:8080` to `0.0.0.0:8080`.
pub fn normalize_address(address: &str) -> String {
    if address.starts_with(':') {
        format!("0.0.0.0{}", address)
    } else {
        address.to_string()
    }
}

/// Bind a plain TCP listener for the HTTP side.
pub async fn bind(address: &str) -> Result<(TcpListener, SocketAddr), ListenerError> {
    let address = normalize_address(address);
    let bind_err = |source: std::io::Error| ListenerError::Bind {
        address: address.clone(),
        source,
    };

    let listener = TcpListener::bind(address.as_str()).await.map_err(bind_err)?;
    let local_addr = listener.local_addr().map_err(bind_err)?;

    tracing::info!(address = %local_addr, "Listener bound");
    Ok((listener, local_addr))
}

/// Bind a non-blocking std listener for the TLS side.
pub fn bind_std(address: &str) -> Result<(std::net::TcpListener, SocketAddr), ListenerError> {
    let address = normalize_address(address);
    let bind_err = |source: std::io::Error| ListenerError::Bind {
        address: address.clone(),
        source,
    };

    let listener = std::net::TcpListener::bind(address.as_str()).map_err(bind_err)?;
    listener.set_nonblocking(true).map_err(bind_err)?;
    let local_addr = listener.local_addr().map_err(bind_err)?;

    tracing::info!(address = %local_addr, tls = true, "Listener bound");
    Ok((listener, local_addr))
}
