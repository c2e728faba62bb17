//! Edge server: listeners, redirect policy and dispatch.
//!
//! # Responsibilities
//! - Bind the plain HTTP listener and, with certificates, the TLS listener
//! - Redirect TLS-capable hosts from HTTP to HTTPS
//! - Look up the backend for each request and forward to it
//! - Turn handler panics into 500s
//! - Count in-flight requests and drain them on stop
//!
//! # Design Decisions
//! - Everything that can fail at startup happens in `bind`, before the
//!   discovery task is spawned
//! - The in-flight guard lives until the response body has been sent
//! - The route table is closed last so draining requests can still resolve

use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    extract::{ConnectInfo, Request, State},
    http::Uri,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use axum_server::tls_rustls::RustlsConfig;
use hyper::body::{Body as HttpBody, Frame, SizeHint};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};

use super::proxy::{forward, http_client, HttpClient};
use super::response::{found, panic_response, ProxyError};
use crate::config::ProxyConfig;
use crate::lifecycle::Shutdown;
use crate::net::connection::{InFlightGuard, InFlightTracker};
use crate::net::listener::{self, ListenerError};
use crate::net::tls::{self, CertError};
use crate::routing::{normalize_host, strip_port, RouteTable, TlsHostMatcher};
use crate::runtime::{ContainerRuntime, DockerRuntime, RuntimeError};
use crate::store::{ConfigStore, EtcdStore, StoreError};

/// Fatal startup errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Bind(#[from] ListenerError),

    #[error("certificate loading failed: {0}")]
    Certificates(#[from] CertError),

    #[error("config-store client: {0}")]
    Store(#[from] StoreError),

    #[error("container runtime client: {0}")]
    Runtime(#[from] RuntimeError),
}

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub routes: Arc<RouteTable>,
    pub tls_hosts: Arc<TlsHostMatcher>,
    pub client: HttpClient,
    /// Port used in redirect targets; `None` when TLS is disabled.
    pub https_port: Option<u16>,
    pub backend_timeout: Option<Duration>,
}

/// Both listeners plus the route table they share.
pub struct EdgeServer {
    http_listener: Option<TcpListener>,
    tls_listener: Option<(std::net::TcpListener, RustlsConfig)>,
    http_addr: SocketAddr,
    https_addr: Option<SocketAddr>,
    state: AppState,
    in_flight: InFlightTracker,
    http_shutdown: Shutdown,
    tls_handle: axum_server::Handle,
    tasks: Vec<JoinHandle<()>>,
}

impl EdgeServer {
    /// Build the etcd and Docker clients from `config`, then bind.
    pub async fn from_config(config: &ProxyConfig) -> Result<Self, ServerError> {
        let store = EtcdStore::new(&config.discovery.etcd_endpoint)?;
        let runtime = DockerRuntime::new(&config.runtime.endpoint, config.runtime.cert_dir.as_deref())?;
        Self::bind(config, Arc::new(store), Arc::new(runtime)).await
    }

    /// Load certificates, bind the listeners and start route discovery.
    pub async fn bind(
        config: &ProxyConfig,
        store: Arc<dyn ConfigStore>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Result<Self, ServerError> {
        let (tls_listener, https_addr, tls_hosts) = match &config.listener.cert_dir {
            Some(dir) => {
                let entries = tls::load_certificates(dir)?;
                if entries.is_empty() {
                    tracing::warn!(dir = %dir.display(), "No certificates found; TLS handshakes will fail");
                }
                let hosts = tls::derive_hosts(&entries);
                tracing::info!(certificates = entries.len(), hosts = hosts.len(), "Certificates loaded");

                let rustls_config = RustlsConfig::from_config(tls::server_config(&entries)?);
                let (listener, addr) = listener::bind_std(&config.listener.https_address)?;
                (Some((listener, rustls_config)), Some(addr), TlsHostMatcher::new(hosts))
            }
            None => {
                tracing::info!("No certificate directory; HTTPS disabled");
                (None, None, TlsHostMatcher::default())
            }
        };

        let (http_listener, http_addr) = listener::bind(&config.listener.http_address).await?;

        let routes = RouteTable::spawn(
            store,
            runtime,
            &config.discovery.directory,
            config.discovery.retry_interval(),
        );

        let state = AppState {
            routes: Arc::new(routes),
            tls_hosts: Arc::new(tls_hosts),
            client: http_client(),
            https_port: https_addr.map(|addr| addr.port()),
            backend_timeout: config.timeouts.backend(),
        };

        Ok(Self {
            http_listener: Some(http_listener),
            tls_listener,
            http_addr,
            https_addr,
            state,
            in_flight: InFlightTracker::new(),
            http_shutdown: Shutdown::new(),
            tls_handle: axum_server::Handle::new(),
            tasks: Vec::new(),
        })
    }

    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    pub fn https_addr(&self) -> Option<SocketAddr> {
        self.https_addr
    }

    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.state.routes
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.active_count()
    }

    /// Serve both listeners in the background and return.
    pub fn start(&mut self) {
        if let Some(listener) = self.http_listener.take() {
            let app = self
                .router(false)
                .into_make_service_with_connect_info::<SocketAddr>();
            let mut signal = self.http_shutdown.subscribe();
            let addr = self.http_addr;

            self.tasks.push(tokio::spawn(async move {
                tracing::info!(address = %addr, "HTTP listener serving");
                let result = axum::serve(listener, app)
                    .with_graceful_shutdown(async move { signal.recv().await })
                    .await;
                match result {
                    Ok(()) => tracing::info!(address = %addr, "HTTP listener stopped"),
                    Err(e) => tracing::error!(address = %addr, error = %e, "HTTP listener failed"),
                }
            }));
        }

        if let Some((listener, rustls_config)) = self.tls_listener.take() {
            let app = self
                .router(true)
                .into_make_service_with_connect_info::<SocketAddr>();
            let handle = self.tls_handle.clone();
            let addr = self.https_addr;

            self.tasks.push(tokio::spawn(async move {
                tracing::info!(address = ?addr, "HTTPS listener serving");
                let result = axum_server::from_tcp_rustls(listener, rustls_config)
                    .handle(handle)
                    .serve(app)
                    .await;
                match result {
                    Ok(()) => tracing::info!(address = ?addr, "HTTPS listener stopped"),
                    Err(e) => tracing::error!(address = ?addr, error = %e, "HTTPS listener failed"),
                }
            }));
        }
    }

    /// Close HTTPS, then HTTP, wait for in-flight requests, then stop discovery.
    pub async fn stop(mut self) {
        tracing::info!(in_flight = self.in_flight.active_count(), "Stopping edge server");

        self.tls_handle.graceful_shutdown(None);
        drop(self.tls_listener.take());
        self.http_shutdown.trigger();
        drop(self.http_listener.take());

        self.in_flight.wait_for_drain().await;

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Listener task failed");
            }
        }

        self.state.routes.close().await;
        tracing::info!("Edge server stopped");
    }

    fn router(&self, tls: bool) -> Router {
        let handler = if tls { any(https_handler) } else { any(http_handler) };

        let router = Router::new()
            .route("/{*path}", handler.clone())
            .route("/", handler)
            .with_state(self.state.clone());
        with_edge_layers(router, self.in_flight.clone())
    }
}

/// Wrap `router` in the layers every listener shares. From the outside in:
/// in-flight counting, tracing, then panic recovery.
pub fn with_edge_layers(router: Router, in_flight: InFlightTracker) -> Router {
    router
        .layer(recovery_layer())
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn_with_state(in_flight, track_in_flight))
}

/// Panic boundary around every handler.
pub fn recovery_layer() -> CatchPanicLayer<fn(Box<dyn std::any::Any + Send + 'static>) -> axum::http::Response<Body>> {
    CatchPanicLayer::custom(panic_response as fn(_) -> _)
}

/// Count the request until its response body is finished or dropped.
async fn track_in_flight(State(tracker): State<InFlightTracker>, request: Request, next: Next) -> Response {
    let guard = tracker.track();
    let response = next.run(request).await;
    response.map(|inner| Body::new(GuardedBody { inner, _guard: guard }))
}

/// Response body that holds an in-flight guard. Frames, trailers and the
/// size hint pass through untouched.
struct GuardedBody {
    inner: Body,
    _guard: InFlightGuard,
}

impl HttpBody for GuardedBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.get_mut().inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Normalized request host without port, from the URI authority or `Host`.
pub fn request_host(request: &Request) -> Option<String> {
    let raw = match request.uri().authority() {
        Some(authority) => authority.as_str(),
        None => request
            .headers()
            .get(axum::http::header::HOST)?
            .to_str()
            .ok()?,
    };
    let host = normalize_host(strip_port(raw));
    (!host.is_empty()).then_some(host)
}

/// `https://host[:port]/path?query` for the redirect.
pub fn https_location(host: &str, https_port: Option<u16>, uri: &Uri) -> String {
    let host = if host.contains(':') {
        format!("[{}]", host)
    } else {
        host.to_string()
    };
    let port = match https_port {
        Some(443) | None => String::new(),
        Some(port) => format!(":{}", port),
    };
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    format!("https://{}{}{}", host, port, path_and_query)
}

fn client_ip(request: &Request) -> Option<IpAddr> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}

async fn http_handler(State(state): State<AppState>, request: Request) -> Response {
    if let Some(host) = request_host(&request) {
        if state.tls_hosts.matches(&host) {
            let location = https_location(&host, state.https_port, request.uri());
            tracing::debug!(host = %host, location = %location, "Redirecting to HTTPS");
            return found(&location);
        }
    }
    dispatch(&state, request, "http").await
}

async fn https_handler(State(state): State<AppState>, request: Request) -> Response {
    dispatch(&state, request, "https").await
}

async fn dispatch(state: &AppState, request: Request, proto: &'static str) -> Response {
    let Some(host) = request_host(&request) else {
        return ProxyError::NoRoute(String::new()).into_response();
    };
    let Some(address) = state.routes.get(&host) else {
        return ProxyError::NoRoute(host).into_response();
    };

    let ip = client_ip(&request);
    tracing::debug!(host = %host, backend = %address, method = %request.method(), path = %request.uri().path(), "Proxying request");

    match forward(&state.client, &address, request, ip, proto, state.backend_timeout).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use tower::ServiceExt;

    fn request(uri: &str, host: Option<&str>) -> Request {
        let mut builder = axum::http::Request::builder().uri(uri);
        if let Some(host) = host {
            builder = builder.header("host", host);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn host_from_header_or_authority() {
        assert_eq!(request_host(&request("/", Some("Example.com:8080"))).as_deref(), Some("example.com"));
        assert_eq!(request_host(&request("http://a.test/x", None)).as_deref(), Some("a.test"));
        assert_eq!(request_host(&request("/", Some("[::1]:80"))).as_deref(), Some("::1"));
        assert_eq!(request_host(&request("/", None)), None);
    }

    #[test]
    fn redirect_targets() {
        let uri: Uri = "/a/b?c=1".parse().unwrap();
        assert_eq!(https_location("www.x.com", Some(443), &uri), "https://www.x.com/a/b?c=1");
        assert_eq!(https_location("www.x.com", Some(8443), &uri), "https://www.x.com:8443/a/b?c=1");
        assert_eq!(https_location("::1", Some(8443), &uri), "https://[::1]:8443/a/b?c=1");

        let root: Uri = "/".parse().unwrap();
        assert_eq!(https_location("a.test", None, &root), "https://a.test/");
    }

    #[tokio::test]
    async fn panics_become_500() {
        async fn explode() -> &'static str {
            panic!("handler exploded")
        }

        let app = Router::new().route("/", any(explode)).layer(recovery_layer());
        let response = app.oneshot(request("/", Some("a.test"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("handler exploded"));
    }

    #[tokio::test]
    async fn in_flight_released_after_body() {
        let tracker = InFlightTracker::new();
        let app = Router::new()
            .route("/", any(|| async { "done" }))
            .layer(middleware::from_fn_with_state(tracker.clone(), track_in_flight));

        let response = app.oneshot(request("/", Some("a.test"))).await.unwrap();
        assert_eq!(tracker.active_count(), 1);

        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"done");
        assert_eq!(tracker.active_count(), 0);
    }

    #[tokio::test]
    async fn in_flight_body_keeps_size_hint() {
        let tracker = InFlightTracker::new();
        let app = Router::new()
            .route("/", any(|| async { "twelve bytes" }))
            .layer(middleware::from_fn_with_state(tracker.clone(), track_in_flight));

        let response = app.oneshot(request("/", Some("a.test"))).await.unwrap();
        assert_eq!(response.body().size_hint().exact(), Some(12));

        drop(response);
        assert_eq!(tracker.active_count(), 0);
    }
}
