//! Request forwarding to the resolved backend.
//!
//! Backends are always spoken to over plain HTTP/1.1; TLS ends at the edge.

use std::net::{IpAddr, Ipv6Addr};
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Request, Uri, Version};
use axum::response::Response;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;

use super::response::ProxyError;

pub type HttpClient = Client<HttpConnector, Body>;

pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
pub const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");

const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
];

pub fn http_client() -> HttpClient {
    let mut connector = HttpConnector::new();
    connector.set_nodelay(true);
    Client::builder(TokioExecutor::new()).build(connector)
}

/// `http://{address}{path_and_query}`, bracketing bare IPv6 addresses.
pub fn backend_uri(address: &str, original: &Uri) -> Result<Uri, ProxyError> {
    let authority = match address.parse::<Ipv6Addr>() {
        Ok(v6) => format!("[{}]", v6),
        Err(_) => address.to_string(),
    };
    let path_and_query = original
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    Uri::builder()
        .scheme("http")
        .authority(authority.as_str())
        .path_and_query(path_and_query)
        .build()
        .map_err(|_| ProxyError::InvalidBackend(address.to_string()))
}

/// Remove connection-scoped headers, including any named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|token| HeaderName::try_from(token.trim()).ok())
        .collect();

    for name in named.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
    headers.remove(header::UPGRADE);
}

fn add_forwarding_headers(headers: &mut HeaderMap, client_ip: Option<IpAddr>, proto: &'static str, host: Option<&HeaderValue>) {
    if let Some(ip) = client_ip {
        let forwarded = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(prior) if !prior.is_empty() => format!("{}, {}", prior, ip),
            _ => ip.to_string(),
        };
        if let Ok(value) = HeaderValue::try_from(forwarded) {
            headers.insert(X_FORWARDED_FOR, value);
        }
    }

    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));

    if let Some(host) = host {
        if !headers.contains_key(&X_FORWARDED_HOST) {
            headers.insert(X_FORWARDED_HOST, host.clone());
        }
    }
}

/// Send `request` to `address` and relay the streamed response.
pub async fn forward(
    client: &HttpClient,
    address: &str,
    mut request: Request<Body>,
    client_ip: Option<IpAddr>,
    proto: &'static str,
    timeout: Option<Duration>,
) -> Result<Response, ProxyError> {
    // HTTP/2 clients carry the host in the URI authority only.
    let host = match request.headers().get(header::HOST) {
        Some(host) => Some(host.clone()),
        None => request
            .uri()
            .authority()
            .and_then(|authority| HeaderValue::from_str(authority.as_str()).ok()),
    };

    *request.uri_mut() = backend_uri(address, request.uri())?;
    *request.version_mut() = Version::HTTP_11;

    let headers = request.headers_mut();
    strip_hop_by_hop(headers);
    add_forwarding_headers(headers, client_ip, proto, host.as_ref());
    if let Some(host) = host {
        headers.insert(header::HOST, host);
    }

    let pending = client.request(request);
    let response = match timeout {
        Some(limit) => tokio::time::timeout(limit, pending)
            .await
            .map_err(|_| ProxyError::Timeout(limit))?,
        None => pending.await,
    }
    .map_err(ProxyError::Upstream)?;

    let (mut parts, body) = response.into_parts();
    strip_hop_by_hop(&mut parts.headers);
    Ok(Response::from_parts(parts, Body::new(body)))
}
