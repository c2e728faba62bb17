//! Route discovery against in-memory store and runtime fakes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dockroute::RouteTable;

mod common;
use common::{eventually, FakeRuntime, FakeStore};

const DIR: &str = "dockroute";

fn spawn_table(store: &Arc<FakeStore>, runtime: &Arc<FakeRuntime>) -> RouteTable {
    RouteTable::spawn(store.clone(), runtime.clone(), DIR, Duration::from_millis(20))
}

async fn watching(store: &FakeStore) {
    eventually("watch to open", || store.active_watches() > 0).await;
}

#[tokio::test]
async fn snapshot_populates_table() {
    let store = FakeStore::new();
    let runtime = FakeRuntime::new();
    runtime.set("web", "172.17.0.2");
    runtime.set("api", "172.17.0.3");
    store.put("/dockroute/www.example.com", "web");
    store.put("/dockroute/API.example.com", "api");
    store.put("/dockroute/nested/skip.example.com", "web");
    store.put("/elsewhere/other.example.com", "web");

    let table = spawn_table(&store, &runtime);
    eventually("snapshot", || table.len() == 2).await;

    assert_eq!(table.get("www.example.com").as_deref(), Some("172.17.0.2"));
    assert_eq!(table.get("api.example.com").as_deref(), Some("172.17.0.3"));
    assert!(table.get("skip.example.com").is_none());
    assert!(table.get("other.example.com").is_none());
    assert!(table.get("unknown.example.com").is_none());

    table.close().await;
}

#[tokio::test]
async fn watch_events_apply_in_order() {
    let store = FakeStore::new();
    let runtime = FakeRuntime::new();
    runtime.set("web", "10.0.0.1");
    runtime.set("web2", "10.0.0.2");

    let table = spawn_table(&store, &runtime);
    watching(&store).await;

    // set then delete: absent
    store.put("/dockroute/a.test", "web");
    store.delete("/dockroute/a.test");
    // delete then set: present with the set value
    store.delete("/dockroute/b.test");
    store.put("/dockroute/b.test", "web2");

    eventually("b.test", || table.get("b.test").is_some()).await;
    assert_eq!(table.get("b.test").as_deref(), Some("10.0.0.2"));
    assert!(table.get("a.test").is_none());

    table.close().await;
}

#[tokio::test]
async fn deleting_unknown_host_is_noop() {
    let store = FakeStore::new();
    let runtime = FakeRuntime::new();
    runtime.set("web", "10.0.0.1");
    store.put("/dockroute/keep.test", "web");

    let table = spawn_table(&store, &runtime);
    watching(&store).await;
    eventually("snapshot", || table.len() == 1).await;

    store.delete("/dockroute/never-existed.test");
    store.put("/dockroute/marker.test", "web");
    eventually("marker", || table.get("marker.test").is_some()).await;

    assert_eq!(table.get("keep.test").as_deref(), Some("10.0.0.1"));
    assert_eq!(table.len(), 2);

    table.close().await;
}

#[tokio::test]
async fn resolution_failure_keeps_previous_value() {
    let store = FakeStore::new();
    let runtime = FakeRuntime::new();
    runtime.set("web", "10.0.0.1");
    runtime.set("marker", "10.0.0.9");

    let table = spawn_table(&store, &runtime);
    watching(&store).await;

    store.put("/dockroute/a.test", "web");
    eventually("a.test", || table.get("a.test").is_some()).await;

    store.put("/dockroute/a.test", "missing-container");
    store.put("/dockroute/marker.test", "marker");
    eventually("marker", || table.get("marker.test").is_some()).await;

    assert_eq!(table.get("a.test").as_deref(), Some("10.0.0.1"));

    table.close().await;
}

#[tokio::test]
async fn snapshot_failures_converge() {
    let store = FakeStore::new();
    let runtime = FakeRuntime::new();
    runtime.set("web", "10.0.0.1");
    store.put("/dockroute/a.test", "web");
    store.fail_snapshots(5);

    let table = spawn_table(&store, &runtime);
    eventually("convergence", || table.get("a.test").is_some()).await;
    assert_eq!(store.snapshot_count(), 1);

    table.close().await;
}

#[tokio::test]
async fn stream_end_resyncs_and_prunes() {
    let store = FakeStore::new();
    let runtime = FakeRuntime::new();
    runtime.set("web", "10.0.0.1");
    store.put("/dockroute/a.test", "web");
    store.put("/dockroute/b.test", "web");

    let table = spawn_table(&store, &runtime);
    watching(&store).await;
    eventually("snapshot", || table.len() == 2).await;

    store.remove_silently("/dockroute/a.test");
    store.end_watches();

    eventually("resync", || store.snapshot_count() >= 2).await;
    eventually("prune", || table.get("a.test").is_none()).await;
    assert_eq!(table.get("b.test").as_deref(), Some("10.0.0.1"));

    table.close().await;
}

#[tokio::test]
async fn stream_error_resyncs() {
    let store = FakeStore::new();
    let runtime = FakeRuntime::new();
    runtime.set("web", "10.0.0.1");

    let table = spawn_table(&store, &runtime);
    watching(&store).await;

    store.break_watches();
    eventually("resync", || store.snapshot_count() >= 2).await;
    watching(&store).await;

    store.put("/dockroute/a.test", "web");
    eventually("a.test", || table.get("a.test").is_some()).await;

    table.close().await;
}

#[tokio::test]
async fn failing_watch_backs_off() {
    let store = FakeStore::new();
    let runtime = FakeRuntime::new();
    store.fail_watches_on_open(true);

    let table = RouteTable::spawn(store.clone(), runtime.clone(), DIR, Duration::from_millis(100));
    tokio::time::sleep(Duration::from_millis(500)).await;

    let snapshots = store.snapshot_count();
    assert!(snapshots >= 2, "expected a retry, saw {snapshots} snapshots");
    assert!(snapshots <= 7, "retry loop is not backing off: {snapshots} snapshots");

    table.close().await;
}

#[tokio::test]
async fn directory_delete_clears_routes() {
    let store = FakeStore::new();
    let runtime = FakeRuntime::new();
    runtime.set("web", "10.0.0.1");
    store.put("/dockroute/a.test", "web");
    store.put("/dockroute/b.test", "web");

    let table = spawn_table(&store, &runtime);
    watching(&store).await;
    eventually("snapshot", || table.len() == 2).await;

    store.delete_directory("/dockroute");
    eventually("routes cleared", || table.is_empty()).await;

    // Discovery keeps running after the directory is recreated.
    eventually("resync", || store.snapshot_count() >= 2).await;
    watching(&store).await;
    store.put("/dockroute/c.test", "web");
    eventually("c.test", || table.get("c.test").is_some()).await;
    assert_eq!(table.len(), 1);

    table.close().await;
}

#[tokio::test]
async fn close_is_prompt_and_cancels_watch() {
    let store = FakeStore::new();
    let runtime = FakeRuntime::new();

    let table = spawn_table(&store, &runtime);
    watching(&store).await;

    let started = Instant::now();
    table.close().await;
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(store.active_watches(), 0);

    // Idempotent.
    table.close().await;
}

#[tokio::test]
async fn close_interrupts_backoff() {
    let store = FakeStore::new();
    let runtime = FakeRuntime::new();
    store.fail_snapshots(u32::MAX);

    let table = RouteTable::spawn(store.clone(), runtime.clone(), DIR, Duration::from_secs(60));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    table.close().await;
    assert!(started.elapsed() < Duration::from_secs(1));
}
