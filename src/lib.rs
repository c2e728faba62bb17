//! dockroute: a reverse proxy that routes by hostname to Docker containers
//! registered in etcd, terminating TLS at the edge.

pub mod config;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod routing;
pub mod runtime;
pub mod store;

pub use config::schema::ProxyConfig;
pub use http::EdgeServer;
pub use lifecycle::Shutdown;
pub use routing::RouteTable;
