//! Shared utilities for integration tests.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use dockroute::runtime::{ContainerRuntime, RuntimeError};
use dockroute::store::{
    ConfigStore, Snapshot, StoreError, StoreNode, WatchAction, WatchEvent, WatchStream,
};

async fn read_head(socket: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

fn status_line(status: u16) -> &'static str {
    match status {
        200 => "200 OK",
        404 => "404 Not Found",
        500 => "500 Internal Server Error",
        503 => "503 Service Unavailable",
        _ => "200 OK",
    }
}

/// Start a programmable mock backend. The closure sees the request head and
/// returns status and body.
pub async fn start_programmable_backend<F, Fut>(f: F) -> SocketAddr
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = (u16, String)> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let f = Arc::new(f);

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let f = f.clone();
            tokio::spawn(async move {
                let head = read_head(&mut socket).await;
                let (status, body) = f(head).await;
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status_line(status),
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    addr
}

/// Backend that echoes the request head it received as the response body.
pub async fn start_echo_backend() -> SocketAddr {
    start_programmable_backend(|head| async move { (200, head) }).await
}

/// Backend that answers `body` after `delay`.
pub async fn start_delayed_backend(delay: Duration, body: &'static str) -> SocketAddr {
    start_programmable_backend(move |_| async move {
        tokio::time::sleep(delay).await;
        (200, body.to_string())
    })
    .await
}

/// An address nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Poll `condition` until it holds or five seconds pass.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Write a self-signed `{base}.crt`/`{base}.key` pair for `names`.
pub fn write_certificate(dir: &Path, base: &str, names: &[&str]) {
    let names = names.iter().map(|n| n.to_string()).collect::<Vec<_>>();
    let cert = rcgen::generate_simple_self_signed(names).unwrap();
    std::fs::write(dir.join(format!("{base}.crt")), cert.cert.pem()).unwrap();
    std::fs::write(dir.join(format!("{base}.key")), cert.key_pair.serialize_pem()).unwrap();
}

type WatchSender = mpsc::UnboundedSender<Result<WatchEvent, StoreError>>;

#[derive(Default)]
struct StoreState {
    nodes: BTreeMap<String, String>,
    index: u64,
    failures_remaining: u32,
    watches_fail_on_open: bool,
    watchers: Vec<WatchSender>,
}

/// In-memory config-store.
#[derive(Default)]
pub struct FakeStore {
    state: Mutex<StoreState>,
    snapshots: AtomicU32,
}

impl FakeStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next `n` snapshot calls fail.
    pub fn fail_snapshots(&self, n: u32) {
        self.state.lock().unwrap().failures_remaining = n;
    }

    pub fn snapshot_count(&self) -> u32 {
        self.snapshots.load(Ordering::SeqCst)
    }

    fn publish(state: &mut StoreState, action: WatchAction, key: &str, value: &str) {
        state.index += 1;
        let event = WatchEvent {
            action,
            node: StoreNode::new(key, value),
        };
        state.watchers.retain(|tx| tx.send(Ok(event.clone())).is_ok());
    }

    pub fn put(&self, key: &str, value: &str) {
        let mut state = self.state.lock().unwrap();
        state.nodes.insert(key.to_string(), value.to_string());
        Self::publish(&mut state, WatchAction::Set, key, value);
    }

    pub fn delete(&self, key: &str) {
        let mut state = self.state.lock().unwrap();
        let value = state.nodes.remove(key).unwrap_or_default();
        Self::publish(&mut state, WatchAction::Delete, key, &value);
    }

    /// Change the data without notifying watchers, as if an event was missed.
    pub fn remove_silently(&self, key: &str) {
        let mut state = self.state.lock().unwrap();
        state.nodes.remove(key);
        state.index += 1;
    }

    /// Send an error down every open watch.
    pub fn break_watches(&self) {
        let mut state = self.state.lock().unwrap();
        for tx in state.watchers.drain(..) {
            let _ = tx.send(Err(StoreError::Unavailable("watch broken".into())));
        }
    }

    /// Make every new watch yield one error and end.
    pub fn fail_watches_on_open(&self, fail: bool) {
        self.state.lock().unwrap().watches_fail_on_open = fail;
    }

    /// Remove a directory and everything below it with a single event.
    pub fn delete_directory(&self, key: &str) {
        let mut state = self.state.lock().unwrap();
        let prefix = format!("{}/", key.trim_end_matches('/'));
        state.nodes.retain(|k, _| !k.starts_with(&prefix));
        Self::publish(&mut state, WatchAction::Delete, key, "");
    }

    /// Close every open watch stream.
    pub fn end_watches(&self) {
        self.state.lock().unwrap().watchers.clear();
    }

    /// Watches whose consumer is still alive.
    pub fn active_watches(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        state.watchers.retain(|tx| !tx.is_closed());
        state.watchers.len()
    }
}

#[async_trait]
impl ConfigStore for FakeStore {
    async fn snapshot(&self, directory: &str) -> Result<Snapshot, StoreError> {
        let mut state = self.state.lock().unwrap();
        if state.failures_remaining > 0 {
            state.failures_remaining -= 1;
            return Err(StoreError::Unavailable("injected failure".into()));
        }
        self.snapshots.fetch_add(1, Ordering::SeqCst);

        let nodes = state
            .nodes
            .iter()
            .filter(|(key, _)| key.starts_with(directory))
            .map(|(key, value)| StoreNode::new(key.as_str(), value.as_str()))
            .collect();
        Ok(Snapshot {
            nodes,
            index: state.index,
        })
    }

    async fn watch(&self, _directory: &str, _from_index: u64) -> Result<WatchStream, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.state.lock().unwrap();
            if state.watches_fail_on_open {
                let _ = tx.send(Err(StoreError::Unavailable("watch refused".into())));
            } else {
                state.watchers.push(tx);
            }
        }

        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }
}

/// In-memory container runtime: container id → address.
#[derive(Default)]
pub struct FakeRuntime {
    containers: Mutex<HashMap<String, String>>,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, container: &str, address: impl ToString) {
        self.containers
            .lock()
            .unwrap()
            .insert(container.to_string(), address.to_string());
    }

    pub fn remove(&self, container: &str) {
        self.containers.lock().unwrap().remove(container);
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn resolve(&self, container: &str) -> Result<String, RuntimeError> {
        self.containers
            .lock()
            .unwrap()
            .get(container)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(container.to_string()))
    }
}
