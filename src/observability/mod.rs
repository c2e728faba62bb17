//! Observability subsystem.
//!
//! Every subsystem emits `tracing` events with structured fields (`host`,
//! `backend`, `container`, `error`); `logging.rs` decides where they go.
//! Request spans come from `tower_http::trace::TraceLayer` in the server.

pub mod logging;

pub use logging::init_logging;
