//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (main.rs):
//!     Load config → Validate → Load certificates → Bind listeners → Spawn discovery
//!
//! Shutdown (EdgeServer::stop):
//!     Signal received → Close HTTPS listener → Close HTTP listener
//!                     → Drain in-flight handlers → Stop discovery
//! ```
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Route table closes last so draining handlers can still resolve hosts
//! - Stop signals are cooperative, never forced

pub mod shutdown;
pub mod signals;

pub use shutdown::{Shutdown, ShutdownSignal};
