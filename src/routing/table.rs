//! Hostname → backend address table.
//!
//! # Responsibilities
//! - Serve lock-free-ish lookups to request handlers
//! - Own the discovery task that keeps the map in sync with the config-store
//! - Stop that task and wait for it on close
//!
//! # Design Decisions
//! - `DashMap` shards: reads take a shard read lock, every mutation (upsert
//!   and remove alike) takes the shard write lock
//! - Only the discovery task writes; no I/O happens while a shard is locked
//! - The table may start empty and converge asynchronously

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::discovery::Discovery;
use crate::lifecycle::Shutdown;
use crate::runtime::ContainerRuntime;
use crate::store::ConfigStore;

/// Shared map handle. Cloning shares the underlying table.
#[derive(Debug, Clone, Default)]
pub struct RouteMap(Arc<DashMap<String, String>>);

impl RouteMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, host: &str) -> Option<String> {
        self.0.get(host).map(|entry| entry.value().clone())
    }

    /// Insert or replace; returns the previous address.
    pub fn upsert(&self, host: String, address: String) -> Option<String> {
        self.0.insert(host, address)
    }

    pub fn remove(&self, host: &str) -> Option<String> {
        self.0.remove(host).map(|(_, address)| address)
    }

    /// Snapshot of the current hostnames.
    pub fn hosts(&self) -> Vec<String> {
        self.0.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Ensure `dir` has exactly one leading and one trailing `/`.
pub fn normalize_directory(dir: &str) -> String {
    let trimmed = dir.trim().trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{}/", trimmed)
    }
}

/// Live routing table backed by a discovery task.
pub struct RouteTable {
    routes: RouteMap,
    shutdown: Shutdown,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RouteTable {
    /// Start discovery under `directory`. Returns immediately; the first
    /// snapshot is applied in the background.
    pub fn spawn(
        store: Arc<dyn ConfigStore>,
        runtime: Arc<dyn ContainerRuntime>,
        directory: &str,
        retry_interval: Duration,
    ) -> Self {
        let routes = RouteMap::new();
        let shutdown = Shutdown::new();
        let directory = normalize_directory(directory);

        tracing::info!(directory = %directory, "Starting route discovery");

        let discovery = Discovery::new(store, runtime, routes.clone(), directory, retry_interval);
        let task = tokio::spawn(discovery.run(shutdown.subscribe()));

        Self {
            routes,
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    /// Backend address for a normalized hostname.
    pub fn get(&self, host: &str) -> Option<String> {
        self.routes.get(host)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn hosts(&self) -> Vec<String> {
        self.routes.hosts()
    }

    /// Stop discovery and wait for the task to finish.
    ///
    /// Safe to call more than once; later calls return once the first has
    /// joined the task. The store and runtime clients are dropped with the
    /// task, so nothing touches them after this returns.
    pub async fn close(&self) {
        self.shutdown.trigger();

        let mut task = self.task.lock().await;
        if let Some(handle) = task.take() {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Route discovery task failed");
            }
            tracing::info!(routes = self.routes.len(), "Route discovery stopped");
        }
    }
}

impl std::fmt::Debug for RouteTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteTable")
            .field("routes", &self.routes.len())
            .field("closed", &self.shutdown.is_triggered())
            .finish()
    }
}

impl Drop for RouteTable {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}
