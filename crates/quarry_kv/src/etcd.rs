use std::time::Duration;

use async_trait::async_trait;
use percent_encoding::{percent_encode, AsciiSet, CONTROLS};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{
    normalize_key, Event, EventAction, KvEntry, KvError, KvStore, Watch, WATCH_CHANNEL_CAPACITY,
};

// Repository keys carry '@' and ':'; those are fine in a path, but spaces
// and the usual URL metacharacters are not.
const KEY_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

const WATCH_RETRY_DELAY: Duration = Duration::from_secs(1);

// etcd v2 error codes we translate into first-class failures.
const ECODE_KEY_NOT_FOUND: i64 = 100;
const ECODE_NOT_FILE: i64 = 102;
const ECODE_NOT_DIR: i64 = 104;
const ECODE_NODE_EXIST: i64 = 105;
const ECODE_EVENT_INDEX_CLEARED: i64 = 401;

/// Connection settings for an etcd v2 keys endpoint.
#[derive(Clone, Debug)]
pub struct EtcdConfig {
    /// Base URL of the etcd server, e.g. `http://127.0.0.1:2379`.
    pub endpoint: String,
    /// Timeout for plain (non-watch) requests.
    pub request_timeout: Duration,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoint: String::from("http://127.0.0.1:2379"),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Adapter onto the etcd v2 `/v2/keys` HTTP API.
pub struct EtcdStore {
    client: reqwest::Client,
    watch_client: reqwest::Client,
    endpoint: String,
}

impl EtcdStore {
    pub fn new(cfg: EtcdConfig) -> Result<Self, KvError> {
        let client = reqwest::Client::builder()
            .timeout(cfg.request_timeout)
            .build()?;
        // Watch requests long-poll and must not be cut off by the overall
        // request timeout.
        let watch_client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            watch_client,
            endpoint: cfg.endpoint.trim_end_matches('/').to_string(),
        })
    }

    fn key_url(&self, key: &str) -> String {
        let key = normalize_key(key);
        let encoded = percent_encode(key.as_bytes(), KEY_ENCODE_SET);
        format!("{}/v2/keys/{}", self.endpoint, encoded)
    }
}

#[async_trait]
impl KvStore for EtcdStore {
    async fn get(&self, key: &str) -> Result<String, KvError> {
        let resp = self.client.get(self.key_url(key)).send().await?;
        let parsed = parse_response(resp.status(), &resp.bytes().await?)?;
        let node = require_node(parsed.node)?;
        if node.dir {
            return Err(KvError::NotAFile(normalize_key(key)));
        }
        Ok(node.value.unwrap_or_default())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        let resp = self
            .client
            .put(self.key_url(key))
            .form(&[("value", value)])
            .send()
            .await?;
        parse_response(resp.status(), &resp.bytes().await?)?;
        Ok(())
    }

    async fn set_dir(&self, key: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        let mut form: Vec<(&str, String)> = vec![
            ("dir", String::from("true")),
            ("prevExist", String::from("false")),
        ];
        if let Some(ttl) = ttl {
            form.push(("ttl", ttl.as_secs().max(1).to_string()));
        }
        let resp = self
            .client
            .put(self.key_url(key))
            .form(&form)
            .send()
            .await?;
        parse_response(resp.status(), &resp.bytes().await?)?;
        Ok(())
    }

    async fn update_dir(&self, key: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        let mut form: Vec<(&str, String)> = vec![
            ("dir", String::from("true")),
            ("prevExist", String::from("true")),
        ];
        if let Some(ttl) = ttl {
            form.push(("ttl", ttl.as_secs().max(1).to_string()));
        }
        let resp = self
            .client
            .put(self.key_url(key))
            .form(&form)
            .send()
            .await?;
        parse_response(resp.status(), &resp.bytes().await?)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        let url = self.key_url(key);
        let resp = self.client.delete(&url).send().await?;
        match parse_response(resp.status(), &resp.bytes().await?) {
            Ok(_) => Ok(()),
            // Plain DELETE refuses directories; retry recursively.
            Err(KvError::NotAFile(_)) => {
                let resp = self
                    .client
                    .delete(&url)
                    .query(&[("dir", "true"), ("recursive", "true")])
                    .send()
                    .await?;
                parse_response(resp.status(), &resp.bytes().await?)?;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn list(&self, key: &str, recursive: bool) -> Result<Vec<KvEntry>, KvError> {
        let mut req = self.client.get(self.key_url(key));
        if recursive {
            req = req.query(&[("recursive", "true")]);
        }
        let resp = req.send().await?;
        let parsed = parse_response(resp.status(), &resp.bytes().await?)?;
        let node = require_node(parsed.node)?;
        if !node.dir {
            return Ok(vec![KvEntry {
                key: strip_slash(&node.key),
                value: node.value,
                dir: false,
            }]);
        }
        let mut out = Vec::new();
        flatten_children(&node, &mut out);
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }

    async fn watch(&self, key: &str, recursive: bool) -> Result<Watch, KvError> {
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let url = self.key_url(key);
        let client = self.watch_client.clone();
        tokio::spawn(watch_loop(client, url, recursive, tx));
        Ok(Watch::new(rx))
    }
}

/// Long-poll `?wait=true` until the receiving side goes away.
async fn watch_loop(
    client: reqwest::Client,
    url: String,
    recursive: bool,
    tx: mpsc::Sender<Event>,
) {
    let mut wait_index: Option<u64> = None;
    loop {
        let mut query: Vec<(&str, String)> = vec![("wait", String::from("true"))];
        if recursive {
            query.push(("recursive", String::from("true")));
        }
        if let Some(index) = wait_index {
            query.push(("waitIndex", index.to_string()));
        }
        let request = client.get(&url).query(&query).send();
        let resp = tokio::select! {
            _ = tx.closed() => return,
            resp = request => resp,
        };
        let resp = match resp {
            Ok(resp) => resp,
            Err(err) => {
                warn!(error = ?err, "coordination store watch request failed, retrying");
                tokio::time::sleep(WATCH_RETRY_DELAY).await;
                continue;
            }
        };
        let status = resp.status();
        let body = match resp.bytes().await {
            Ok(body) => body,
            Err(err) => {
                warn!(error = ?err, "coordination store watch read failed, retrying");
                tokio::time::sleep(WATCH_RETRY_DELAY).await;
                continue;
            }
        };
        if !status.is_success() {
            if let Ok(err) = serde_json::from_slice::<EtcdErrorBody>(&body) {
                // Our index fell out of the server's event history; resume
                // from its current head.
                if err.error_code == ECODE_EVENT_INDEX_CLEARED {
                    wait_index = err.index.map(|index| index + 1);
                    continue;
                }
                warn!(
                    code = err.error_code,
                    message = %err.message,
                    "coordination store watch error, retrying"
                );
            }
            tokio::time::sleep(WATCH_RETRY_DELAY).await;
            continue;
        }
        let parsed: EtcdResponse = match serde_json::from_slice(&body) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(error = ?err, "coordination store watch returned malformed body");
                tokio::time::sleep(WATCH_RETRY_DELAY).await;
                continue;
            }
        };
        let Some(node) = parsed.node else {
            continue;
        };
        if let Some(index) = node.modified_index {
            wait_index = Some(index + 1);
        }
        let Some(action) = EventAction::from_wire(&parsed.action) else {
            debug!(action = %parsed.action, "ignoring coordination store action");
            continue;
        };
        let event = Event {
            action,
            key: strip_slash(&node.key),
            value: node.value,
        };
        if tx.send(event).await.is_err() {
            return;
        }
    }
}

#[derive(Debug, Deserialize)]
struct EtcdResponse {
    action: String,
    node: Option<EtcdNodeBody>,
}

#[derive(Debug, Deserialize)]
struct EtcdNodeBody {
    key: String,
    #[serde(default)]
    dir: bool,
    value: Option<String>,
    #[serde(rename = "modifiedIndex")]
    modified_index: Option<u64>,
    #[serde(default)]
    nodes: Vec<EtcdNodeBody>,
}

#[derive(Debug, Deserialize)]
struct EtcdErrorBody {
    #[serde(rename = "errorCode")]
    error_code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    cause: String,
    index: Option<u64>,
}

fn parse_response(status: reqwest::StatusCode, body: &[u8]) -> Result<EtcdResponse, KvError> {
    if status.is_success() {
        return serde_json::from_slice::<EtcdResponse>(body)
            .map_err(|err| KvError::Decode(err.to_string()));
    }
    let err: EtcdErrorBody =
        serde_json::from_slice(body).map_err(|err| KvError::Decode(err.to_string()))?;
    Err(map_error(err))
}

fn map_error(err: EtcdErrorBody) -> KvError {
    let subject = strip_slash(&err.cause);
    match err.error_code {
        ECODE_KEY_NOT_FOUND => KvError::KeyNotExist(subject),
        ECODE_NOT_FILE => KvError::NotAFile(subject),
        ECODE_NOT_DIR => KvError::NotADirectory(subject),
        ECODE_NODE_EXIST => KvError::KeyExists(subject),
        code => KvError::Remote {
            code,
            message: err.message,
        },
    }
}

fn require_node(node: Option<EtcdNodeBody>) -> Result<EtcdNodeBody, KvError> {
    node.ok_or_else(|| KvError::Decode(String::from("response without node")))
}

fn flatten_children(node: &EtcdNodeBody, out: &mut Vec<KvEntry>) {
    for child in &node.nodes {
        out.push(KvEntry {
            key: strip_slash(&child.key),
            value: child.value.clone(),
            dir: child.dir,
        });
        flatten_children(child, out);
    }
}

fn strip_slash(key: &str) -> String {
    key.trim_start_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_url_encodes_but_keeps_path_separators() {
        let store = EtcdStore::new(EtcdConfig {
            endpoint: String::from("http://127.0.0.1:2379/"),
            request_timeout: Duration::from_secs(1),
        })
        .expect("store");
        assert_eq!(
            store.key_url("/quarry/registry/data/git/https/user@host:8080/a b"),
            "http://127.0.0.1:2379/v2/keys/quarry/registry/data/git/https/user@host:8080/a%20b"
        );
    }

    #[test]
    fn recursive_listing_flattens_and_sorts() {
        let body = br#"{
            "action": "get",
            "node": {
                "key": "/reg/data",
                "dir": true,
                "nodes": [
                    {"key": "/reg/data/k2", "dir": true, "nodes": [
                        {"key": "/reg/data/k2/$nodes", "dir": true, "nodes": []}
                    ]},
                    {"key": "/reg/data/k1", "dir": true, "nodes": [
                        {"key": "/reg/data/k1/$nodes", "dir": true, "nodes": [
                            {"key": "/reg/data/k1/$nodes/n1", "value": "", "modifiedIndex": 7}
                        ]}
                    ]}
                ]
            }
        }"#;
        let parsed = parse_response(reqwest::StatusCode::OK, body).expect("parse");
        let node = parsed.node.expect("node");
        let mut out = Vec::new();
        flatten_children(&node, &mut out);
        out.sort_by(|a, b| a.key.cmp(&b.key));

        let keys: Vec<&str> = out.iter().map(|entry| entry.key.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "reg/data/k1",
                "reg/data/k1/$nodes",
                "reg/data/k1/$nodes/n1",
                "reg/data/k2",
                "reg/data/k2/$nodes",
            ]
        );
        assert!(!out[2].dir);
    }

    #[test]
    fn error_codes_map_to_kv_errors() {
        let body = br#"{"errorCode": 100, "message": "Key not found", "cause": "/x/y", "index": 12}"#;
        let err = parse_response(reqwest::StatusCode::NOT_FOUND, body).expect_err("error");
        match err {
            KvError::KeyNotExist(cause) => assert_eq!(cause, "x/y"),
            other => panic!("unexpected error: {other:?}"),
        }

        let body = br#"{"errorCode": 105, "message": "Key already exists", "cause": "/nodes/n1"}"#;
        let err = parse_response(reqwest::StatusCode::PRECONDITION_FAILED, body)
            .expect_err("error");
        assert!(matches!(err, KvError::KeyExists(_)), "got {err:?}");

        let body = br#"{"errorCode": 300, "message": "Raft Internal Error"}"#;
        let err =
            parse_response(reqwest::StatusCode::INTERNAL_SERVER_ERROR, body).expect_err("error");
        assert!(matches!(err, KvError::Remote { code: 300, .. }), "got {err:?}");
    }
}
