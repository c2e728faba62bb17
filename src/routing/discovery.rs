//! Discovery loop.
//!
//! ```text
//! snapshot ──ok──▶ watch(index + 1) ──events──▶ apply in order
//!    ▲  │fail                     │error, or ended before any event
//!    │  ▼                         │
//!    └─ sleep(retry_interval) ◀───┘
//! ```
//!
//! A watch that ends after delivering events, or that reports the directory
//! itself deleted, re-snapshots immediately.
//!
//! The shutdown signal is checked ahead of every await point.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;

use super::matcher::normalize_host;
use super::table::RouteMap;
use crate::lifecycle::ShutdownSignal;
use crate::runtime::ContainerRuntime;
use crate::store::{ConfigStore, StoreNode, WatchAction, WatchEvent};

pub(crate) struct Discovery {
    store: Arc<dyn ConfigStore>,
    runtime: Arc<dyn ContainerRuntime>,
    routes: RouteMap,
    directory: String,
    retry_interval: Duration,
}

/// Hostname for a store key, or `None` when the key is outside `directory`,
/// nested below a child directory, or empty.
pub fn hostname_for(directory: &str, key: &str) -> Option<String> {
    let name = key.strip_prefix(directory)?;
    if name.is_empty() || name.contains('/') {
        return None;
    }
    let host = normalize_host(name);
    (!host.is_empty()).then_some(host)
}

/// Whether `event` deletes the watched directory or one of its ancestors.
pub fn removes_directory(directory: &str, event: &WatchEvent) -> bool {
    if event.action != WatchAction::Delete {
        return false;
    }
    let key = format!("{}/", event.node.key.trim_end_matches('/'));
    directory.starts_with(&key)
}

impl Discovery {
    pub(crate) fn new(
        store: Arc<dyn ConfigStore>,
        runtime: Arc<dyn ContainerRuntime>,
        routes: RouteMap,
        directory: String,
        retry_interval: Duration,
    ) -> Self {
        Self {
            store,
            runtime,
            routes,
            directory,
            retry_interval,
        }
    }

    pub(crate) async fn run(self, mut shutdown: ShutdownSignal) {
        'resync: while !shutdown.is_triggered() {
            let snapshot = tokio::select! {
                biased;
                _ = shutdown.recv() => break 'resync,
                result = self.store.snapshot(&self.directory) => result,
            };

            let snapshot = match snapshot {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    tracing::warn!(error = %e, retry_ms = self.retry_interval.as_millis() as u64, "Config-store snapshot failed");
                    if self.backoff(&mut shutdown).await {
                        break 'resync;
                    }
                    continue 'resync;
                }
            };

            tracing::debug!(nodes = snapshot.nodes.len(), index = snapshot.index, "Applying snapshot");
            let mut present = HashSet::with_capacity(snapshot.nodes.len());
            for node in &snapshot.nodes {
                if let Some(host) = hostname_for(&self.directory, &node.key) {
                    present.insert(host);
                }
                tokio::select! {
                    biased;
                    _ = shutdown.recv() => break 'resync,
                    _ = self.set_entry(node) => {}
                }
            }
            self.prune(&present);

            let watch = tokio::select! {
                biased;
                _ = shutdown.recv() => break 'resync,
                result = self.store.watch(&self.directory, snapshot.index + 1) => result,
            };

            let mut stream = match watch {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!(error = %e, "Config-store watch failed to open");
                    if self.backoff(&mut shutdown).await {
                        break 'resync;
                    }
                    continue 'resync;
                }
            };

            let mut delivered = false;
            loop {
                let next = tokio::select! {
                    biased;
                    _ = shutdown.recv() => break 'resync,
                    next = stream.next() => next,
                };

                match next {
                    Some(Ok(event)) => {
                        delivered = true;
                        if removes_directory(&self.directory, &event) {
                            tracing::warn!(key = %event.node.key, "Route directory removed; clearing routes");
                            self.clear();
                            continue 'resync;
                        }
                        tokio::select! {
                            biased;
                            _ = shutdown.recv() => break 'resync,
                            _ = self.apply(&event) => {}
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, retry_ms = self.retry_interval.as_millis() as u64, "Config-store watch interrupted; resyncing");
                        if self.backoff(&mut shutdown).await {
                            break 'resync;
                        }
                        continue 'resync;
                    }
                    None => {
                        tracing::info!("Config-store watch ended; resyncing");
                        // A stream that ends without delivering anything is treated as a failure.
                        if !delivered && self.backoff(&mut shutdown).await {
                            break 'resync;
                        }
                        continue 'resync;
                    }
                }
            }
        }

        tracing::debug!("Discovery loop exited");
    }

    /// Sleep for the retry interval. Returns true when shutdown won the race.
    async fn backoff(&self, shutdown: &mut ShutdownSignal) -> bool {
        tokio::select! {
            biased;
            _ = shutdown.recv() => true,
            _ = tokio::time::sleep(self.retry_interval) => false,
        }
    }

    async fn apply(&self, event: &WatchEvent) {
        match event.action {
            WatchAction::Delete => self.delete_entry(&event.node),
            WatchAction::Set => self.set_entry(&event.node).await,
        }
    }

    async fn set_entry(&self, node: &StoreNode) {
        let Some(host) = hostname_for(&self.directory, &node.key) else {
            tracing::trace!(key = %node.key, "Ignoring key outside route directory");
            return;
        };

        let container = node.value.trim();
        match self.runtime.resolve(container).await {
            Ok(address) => {
                let previous = self.routes.upsert(host.clone(), address.clone());
                if previous.as_deref() != Some(address.as_str()) {
                    tracing::info!(host = %host, container, address = %address, "Route set");
                }
            }
            Err(e) => {
                tracing::warn!(host = %host, container, error = %e, "Container resolution failed; keeping previous route");
            }
        }
    }

    fn delete_entry(&self, node: &StoreNode) {
        let Some(host) = hostname_for(&self.directory, &node.key) else {
            return;
        };
        if self.routes.remove(&host).is_some() {
            tracing::info!(host = %host, "Route deleted");
        }
    }

    fn clear(&self) {
        for host in self.routes.hosts() {
            self.routes.remove(&host);
        }
    }

    fn prune(&self, present: &HashSet<String>) {
        for host in self.routes.hosts() {
            if !present.contains(&host) && self.routes.remove(&host).is_some() {
                tracing::info!(host = %host, "Route pruned after resync");
            }
        }
    }
}
