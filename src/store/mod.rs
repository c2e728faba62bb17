//! Config-store access.
//!
//! # Data Flow
//! ```text
//! discovery loop
//!     → snapshot(dir)          (list immediate children + store index)
//!     → watch(dir, index + 1)  (recursive change stream)
//!     → WatchEvent { Set | Delete, node }
//! ```
//!
//! The loop only sees the [`ConfigStore`] trait; [`etcd::EtcdStore`] is the
//! production implementation.

pub mod etcd;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use thiserror::Error;

pub use etcd::EtcdStore;

/// A key/value node under the watched directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreNode {
    pub key: String,
    pub value: String,
}

impl StoreNode {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Immediate children of a directory at a given store index.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub nodes: Vec<StoreNode>,
    pub index: u64,
}

/// What happened to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchAction {
    Set,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub action: WatchAction,
    pub node: StoreNode,
}

/// Change stream. Ends (or yields an error) when the subscription is lost.
pub type WatchStream = BoxStream<'static, Result<WatchEvent, StoreError>>;

/// Errors from the config-store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid config-store endpoint {0:?}")]
    InvalidEndpoint(String),

    #[error("config-store request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("config-store returned error {code}: {message}")]
    Api { code: u64, message: String },

    #[error("watch index {0} is no longer available")]
    IndexCleared(u64),

    #[error("malformed config-store response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("config-store unavailable: {0}")]
    Unavailable(String),
}

/// Source of routing entries.
#[async_trait]
pub trait ConfigStore: Send + Sync + 'static {
    /// List the immediate (non-directory) children of `directory`.
    async fn snapshot(&self, directory: &str) -> Result<Snapshot, StoreError>;

    /// Subscribe to recursive changes below `directory`, starting at `from_index`.
    async fn watch(&self, directory: &str, from_index: u64) -> Result<WatchStream, StoreError>;
}
