//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP / TLS connection
//!     → server.rs (in-flight guard, trace, panic recovery)
//!     → http_handler: TLS-capable host? → 302 to https://
//!     → dispatch: RouteTable.get(host) → 404 when absent
//!     → proxy.rs (rewrite URI, forwarding headers, stream response)
//!     → response.rs (error → status mapping)
//! ```

pub mod proxy;
pub mod response;
pub mod server;

pub use response::ProxyError;
pub use server::{with_edge_layers, AppState, EdgeServer, ServerError};
