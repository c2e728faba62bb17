//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! config-store ──snapshot/watch──▶ discovery.rs ──resolve──▶ container runtime
//!                                      │
//!                                      ▼ upsert / remove
//!                                  table.rs (RouteMap)
//!                                      ▲ get(host)
//! request handlers ──strip_port/normalize_host (matcher.rs)
//! ```
//!
//! # Design Decisions
//! - One writer (the discovery task), many readers
//! - Lookups never wait on network I/O
//! - A failed container resolution keeps the previous address

pub mod discovery;
pub mod matcher;
pub mod table;

pub use matcher::{normalize_host, strip_port, TlsHostMatcher};
pub use table::{normalize_directory, RouteMap, RouteTable};
