//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! config addresses
//!     → listener.rs (bind plain + TLS sockets)
//!     → tls.rs (certificate directory → rustls ServerConfig, SNI resolver)
//!     → connection.rs (in-flight request accounting for drain)
//!     → Hand off to HTTP layer
//! ```
//!
//! # Design Decisions
//! - Binding happens before anything is spawned so startup errors are clean
//! - TLS is optional: no certificate directory, no HTTPS listener

pub mod connection;
pub mod listener;
pub mod tls;
