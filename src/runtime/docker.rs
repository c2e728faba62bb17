//! Docker Engine API client.
//!
//! Only container inspection is needed: `GET /containers/{id}/json`, reading
//! the container's IP from `NetworkSettings`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use axum::body::{Body, Bytes};
use serde::Deserialize;
use url::Url;

use super::{ContainerRuntime, RuntimeError};
use crate::routing::matcher::strip_port;

const DEFAULT_PORT: u16 = 2375;
const DEFAULT_TLS_PORT: u16 = 2376;
const INSPECT_BODY_LIMIT: usize = 4 * 1024 * 1024;

#[derive(Debug, Deserialize)]
struct ContainerInspect {
    #[serde(rename = "NetworkSettings", default)]
    network_settings: Option<NetworkSettings>,
}

#[derive(Debug, Deserialize)]
struct NetworkSettings {
    #[serde(rename = "IPAddress", default)]
    ip_address: String,
    #[serde(rename = "Networks", default)]
    networks: Option<BTreeMap<String, EndpointSettings>>,
}

#[derive(Debug, Deserialize)]
struct EndpointSettings {
    #[serde(rename = "IPAddress", default)]
    ip_address: String,
}

/// Where the Docker daemon listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    Http(Url),
}

/// Parse `unix:///path`, `tcp://host:port`, `http(s)://...` or a bare `host[:port]`.
pub fn parse_endpoint(endpoint: &str, tls: bool) -> Result<Endpoint, RuntimeError> {
    let endpoint = endpoint.trim();
    let invalid = || RuntimeError::InvalidEndpoint(endpoint.to_string());

    if let Some(path) = endpoint.strip_prefix("unix://") {
        if path.is_empty() {
            return Err(invalid());
        }
        return Ok(Endpoint::Unix(PathBuf::from(path)));
    }

    let scheme = if tls { "https" } else { "http" };
    let (authority_and_path, explicit_scheme) = if let Some(rest) = endpoint.strip_prefix("tcp://") {
        (rest, false)
    } else if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        (endpoint, true)
    } else if endpoint.contains("://") || endpoint.is_empty() {
        return Err(invalid());
    } else {
        (endpoint, false)
    };

    if explicit_scheme {
        let url = Url::parse(endpoint).map_err(|_| invalid())?;
        if url.host_str().is_none() {
            return Err(invalid());
        }
        return Ok(Endpoint::Http(url));
    }

    let authority = authority_and_path.split('/').next().unwrap_or_default();
    if authority.is_empty() {
        return Err(invalid());
    }
    let raw = if strip_port(authority) == authority {
        let port = if tls { DEFAULT_TLS_PORT } else { DEFAULT_PORT };
        format!("{}://{}:{}", scheme, authority, port)
    } else {
        format!("{}://{}", scheme, authority)
    };
    Url::parse(&raw).map(Endpoint::Http).map_err(|_| invalid())
}

/// Pick the address a container is reachable on.
///
/// The default bridge address wins; containers only attached to user-defined
/// networks fall back to the first network (by name) that has an address.
pub fn container_address(container: &str, body: &[u8]) -> Result<String, RuntimeError> {
    let inspect: ContainerInspect = serde_json::from_slice(body)?;
    let settings = inspect
        .network_settings
        .ok_or_else(|| RuntimeError::NoAddress(container.to_string()))?;

    if !settings.ip_address.is_empty() {
        return Ok(settings.ip_address);
    }

    settings
        .networks
        .unwrap_or_default()
        .into_values()
        .map(|network| network.ip_address)
        .find(|ip| !ip.is_empty())
        .ok_or_else(|| RuntimeError::NoAddress(container.to_string()))
}

fn validate_identifier(container: &str) -> Result<&str, RuntimeError> {
    let id = container.trim().trim_start_matches('/');
    let valid = !id.is_empty()
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'.' || b == b'-');
    if valid {
        Ok(id)
    } else {
        Err(RuntimeError::InvalidIdentifier(container.to_string()))
    }
}

#[derive(Debug, Clone)]
enum Transport {
    Http { client: reqwest::Client, base: Url },
    Unix { socket: PathBuf },
}

/// Docker-backed [`ContainerRuntime`].
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    transport: Transport,
}

impl DockerRuntime {
    /// `cert_dir`, when set, must hold `ca.pem`, `cert.pem` and `key.pem`.
    pub fn new(endpoint: &str, cert_dir: Option<&Path>) -> Result<Self, RuntimeError> {
        let transport = match parse_endpoint(endpoint, cert_dir.is_some())? {
            Endpoint::Unix(socket) => {
                if cert_dir.is_some() {
                    tracing::warn!(socket = %socket.display(), "Ignoring runtime TLS credentials for unix socket");
                }
                Transport::Unix { socket }
            }
            Endpoint::Http(base) => {
                let client = match cert_dir {
                    Some(dir) => tls_client(dir)?,
                    None => reqwest::Client::builder().build()?,
                };
                Transport::Http { client, base }
            }
        };

        tracing::info!(endpoint, tls = cert_dir.is_some(), "Container runtime client ready");
        Ok(Self { transport })
    }

    async fn get(&self, path: &str) -> Result<(u16, Bytes), RuntimeError> {
        match &self.transport {
            Transport::Http { client, base } => {
                let url = format!("{}{}", base.as_str().trim_end_matches('/'), path);
                let resp = client.get(url).send().await?;
                let status = resp.status().as_u16();
                Ok((status, resp.bytes().await?))
            }
            Transport::Unix { socket } => unix_get(socket, path).await,
        }
    }
}

fn tls_client(cert_dir: &Path) -> Result<reqwest::Client, RuntimeError> {
    let read = |name: &str| {
        let path = cert_dir.join(name);
        std::fs::read(&path).map_err(|e| RuntimeError::Tls(format!("{}: {}", path.display(), e)))
    };
    let tls_err = |e: reqwest::Error| RuntimeError::Tls(e.to_string());

    let ca = reqwest::Certificate::from_pem(&read("ca.pem")?).map_err(tls_err)?;
    let mut identity_pem = read("cert.pem")?;
    identity_pem.push(b'\n');
    identity_pem.extend(read("key.pem")?);
    let identity = reqwest::Identity::from_pem(&identity_pem).map_err(tls_err)?;

    reqwest::Client::builder()
        .use_rustls_tls()
        .tls_built_in_root_certs(false)
        .add_root_certificate(ca)
        .identity(identity)
        .build()
        .map_err(tls_err)
}

#[cfg(unix)]
async fn unix_get(socket: &Path, path: &str) -> Result<(u16, Bytes), RuntimeError> {
    use hyper_util::rt::TokioIo;
    use tokio::net::UnixStream;

    let stream = UnixStream::connect(socket).await?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::debug!(error = %e, "Runtime connection closed with error");
        }
    });

    let request = hyper::Request::get(path)
        .header(hyper::header::HOST, "docker")
        .body(Body::empty())
        .map_err(|e| RuntimeError::InvalidIdentifier(e.to_string()))?;
    let response = sender.send_request(request).await?;
    let status = response.status().as_u16();
    let body = axum::body::to_bytes(Body::new(response.into_body()), INSPECT_BODY_LIMIT)
        .await
        .map_err(std::io::Error::other)?;
    Ok((status, body))
}

#[cfg(not(unix))]
async fn unix_get(socket: &Path, _path: &str) -> Result<(u16, Bytes), RuntimeError> {
    Err(RuntimeError::InvalidEndpoint(socket.display().to_string()))
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn resolve(&self, container: &str) -> Result<String, RuntimeError> {
        let id = validate_identifier(container)?;
        let (status, body) = self.get(&format!("/containers/{}/json", id)).await?;

        match status {
            404 => Err(RuntimeError::NotFound(id.to_string())),
            200..=299 => container_address(id, &body),
            _ => Err(RuntimeError::Api {
                status,
                message: String::from_utf8_lossy(&body).trim().to_string(),
            }),
        }
    }
}
