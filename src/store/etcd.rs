//! etcd v2 keys API client.
//!
//! Snapshots are a plain `GET /v2/keys/<dir>`; watches are long polls with
//! `wait=true&recursive=true&waitIndex=N`, each answered event advancing `N`
//! past the event's `modifiedIndex`.

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use reqwest::StatusCode;
use serde::Deserialize;
use url::Url;

use super::{ConfigStore, Snapshot, StoreError, StoreNode, WatchAction, WatchEvent, WatchStream};

const DEFAULT_PORT: u16 = 2379;
const ETCD_INDEX_HEADER: &str = "x-etcd-index";

/// etcd "Key not found".
const ERROR_KEY_NOT_FOUND: u64 = 100;
/// etcd "The event in requested index is outdated and cleared".
const ERROR_INDEX_CLEARED: u64 = 401;

#[derive(Debug, Deserialize)]
struct EtcdResponse {
    action: String,
    node: Option<EtcdNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EtcdNode {
    key: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    dir: bool,
    #[serde(default)]
    nodes: Vec<EtcdNode>,
    #[serde(default)]
    modified_index: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EtcdErrorBody {
    error_code: u64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    cause: String,
    #[serde(default)]
    index: u64,
}

impl From<EtcdErrorBody> for StoreError {
    fn from(body: EtcdErrorBody) -> Self {
        if body.error_code == ERROR_INDEX_CLEARED {
            return StoreError::IndexCleared(body.index);
        }
        let message = if body.cause.is_empty() {
            body.message
        } else {
            format!("{} ({})", body.message, body.cause)
        };
        StoreError::Api {
            code: body.error_code,
            message,
        }
    }
}

/// Map an etcd action name onto set/delete.
pub fn action_kind(action: &str) -> WatchAction {
    match action {
        "delete" | "expire" | "compareAndDelete" => WatchAction::Delete,
        _ => WatchAction::Set,
    }
}

/// Accepts `host`, `host:port` or a full `http(s)://` URL.
pub fn endpoint_url(endpoint: &str) -> Result<Url, StoreError> {
    let endpoint = endpoint.trim();
    if endpoint.is_empty() {
        return Err(StoreError::InvalidEndpoint(endpoint.to_string()));
    }

    let with_scheme = if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("http://{}", endpoint)
    };
    let mut url =
        Url::parse(&with_scheme).map_err(|_| StoreError::InvalidEndpoint(endpoint.to_string()))?;

    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(StoreError::InvalidEndpoint(endpoint.to_string()));
    }
    if url.port().is_none() && !endpoint.contains("://") {
        url.set_port(Some(DEFAULT_PORT))
            .map_err(|_| StoreError::InvalidEndpoint(endpoint.to_string()))?;
    }
    Ok(url)
}

/// etcd v2 backed [`ConfigStore`].
#[derive(Debug, Clone)]
pub struct EtcdStore {
    client: reqwest::Client,
    base: Url,
}

impl EtcdStore {
    pub fn new(endpoint: &str) -> Result<Self, StoreError> {
        let base = endpoint_url(endpoint)?;
        let client = reqwest::Client::builder().build()?;
        tracing::info!(endpoint = %base, "Config-store client ready");
        Ok(Self { client, base })
    }

    fn keys_url(&self, directory: &str) -> String {
        format!(
            "{}/v2/keys{}",
            self.base.as_str().trim_end_matches('/'),
            directory
        )
    }
}

#[async_trait]
impl ConfigStore for EtcdStore {
    async fn snapshot(&self, directory: &str) -> Result<Snapshot, StoreError> {
        let resp = self.client.get(self.keys_url(directory)).send().await?;
        let status = resp.status();
        let index = resp
            .headers()
            .get(ETCD_INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let body = resp.bytes().await?;
        parse_snapshot(status, index, &body)
    }

    async fn watch(&self, directory: &str, from_index: u64) -> Result<WatchStream, StoreError> {
        let poller = WatchPoller {
            client: self.client.clone(),
            url: self.keys_url(directory),
            next_index: from_index,
        };
        tracing::debug!(directory, from_index, "Opening config-store watch");

        let events = stream::try_unfold(poller, |mut poller| async move {
            let event = poller.next_event().await?;
            Ok(Some((event, poller)))
        });
        Ok(events.boxed())
    }
}

struct WatchPoller {
    client: reqwest::Client,
    url: String,
    next_index: u64,
}

impl WatchPoller {
    async fn next_event(&mut self) -> Result<WatchEvent, StoreError> {
        loop {
            let resp = self
                .client
                .get(&self.url)
                .query(&[
                    ("wait", "true".to_string()),
                    ("recursive", "true".to_string()),
                    ("waitIndex", self.next_index.to_string()),
                ])
                .send()
                .await?;
            let status = resp.status();
            let body = resp.bytes().await?;

            // etcd answers an idle long poll with an empty body; poll again.
            if status.is_success() && body.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            let (event, modified_index) = parse_watch_event(status, &body)?;
            self.next_index = self.next_index.max(modified_index + 1);
            return Ok(event);
        }
    }
}

fn parse_error(body: &[u8], status: StatusCode) -> StoreError {
    match serde_json::from_slice::<EtcdErrorBody>(body) {
        Ok(err) => err.into(),
        Err(_) => StoreError::Api {
            code: u64::from(status.as_u16()),
            message: String::from_utf8_lossy(body).into_owned(),
        },
    }
}

fn parse_snapshot(status: StatusCode, index: Option<u64>, body: &[u8]) -> Result<Snapshot, StoreError> {
    if !status.is_success() {
        // A directory nobody has written yet is an empty route set.
        if let Ok(err) = serde_json::from_slice::<EtcdErrorBody>(body) {
            if err.error_code == ERROR_KEY_NOT_FOUND {
                return Ok(Snapshot {
                    nodes: Vec::new(),
                    index: index.unwrap_or(err.index),
                });
            }
        }
        return Err(parse_error(body, status));
    }

    let resp: EtcdResponse = serde_json::from_slice(body)?;
    let root = resp
        .node
        .ok_or_else(|| StoreError::Unavailable("snapshot without node".to_string()))?;

    let mut highest = root.modified_index;
    let nodes = root
        .nodes
        .into_iter()
        .inspect(|node| highest = highest.max(node.modified_index))
        .filter(|node| !node.dir)
        .filter_map(|node| node.value.map(|value| StoreNode::new(node.key, value)))
        .collect();

    Ok(Snapshot {
        nodes,
        index: index.unwrap_or(highest),
    })
}

fn parse_watch_event(status: StatusCode, body: &[u8]) -> Result<(WatchEvent, u64), StoreError> {
    if !status.is_success() {
        return Err(parse_error(body, status));
    }

    let resp: EtcdResponse = serde_json::from_slice(body)?;
    let node = resp
        .node
        .ok_or_else(|| StoreError::Unavailable("watch event without node".to_string()))?;
    let modified_index = node.modified_index;

    let event = WatchEvent {
        action: action_kind(&resp.action),
        node: StoreNode::new(node.key, node.value.unwrap_or_default()),
    };
    Ok((event, modified_index))
}
