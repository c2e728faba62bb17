//! Error responses.
//!
//! # Responsibilities
//! - Map proxy failures to status codes
//! - Build the redirect and panic-recovery responses
//!
//! # Design Decisions
//! - Bodies are short plain-text reasons; details go to the log, not the client

use std::any::Any;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderValue, Response, StatusCode};
use axum::response::IntoResponse;
use thiserror::Error;

/// Per-request failure while dispatching to a backend.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// No route for this host.
    #[error("no route for host {0:?}")]
    NoRoute(String),

    /// The resolved address does not form a valid URI.
    #[error("invalid backend address {0:?}")]
    InvalidBackend(String),

    #[error("upstream request failed: {0}")]
    Upstream(#[source] hyper_util::client::legacy::Error),

    #[error("upstream timed out after {0:?}")]
    Timeout(Duration),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::NoRoute(_) => StatusCode::NOT_FOUND,
            ProxyError::InvalidBackend(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        match &self {
            ProxyError::NoRoute(host) => tracing::debug!(host = %host, "No route"),
            _ => tracing::warn!(error = %self, status = status.as_u16(), "Proxy request failed"),
        }
        let reason = status.canonical_reason().unwrap_or("Error");
        (status, reason).into_response()
    }
}

/// Converts a handler panic into a 500 describing the failure.
pub fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response<Body> {
    let message = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    tracing::error!(panic = %message, "Request handler panicked");

    let mut response = Response::new(Body::from(format!("Internal Server Error: {}", message)));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

/// `302 Found` pointing at `location`.
pub fn found(location: &str) -> axum::response::Response {
    match HeaderValue::try_from(location) {
        Ok(value) => (StatusCode::FOUND, [(header::LOCATION, value)]).into_response(),
        Err(_) => (StatusCode::BAD_REQUEST, "Bad Request").into_response(),
    }
}
