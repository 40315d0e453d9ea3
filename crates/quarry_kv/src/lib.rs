//! Hierarchical key/value coordination store.
//!
//! The routing cluster keeps its shared state (node membership, repository
//! placement) in a small hierarchical store with directory keys, per-key TTL
//! expiry and recursive watches. [`MemoryStore`] keeps everything in-process;
//! [`EtcdStore`] adapts the same surface onto an etcd v2 `/v2/keys` endpoint.

mod etcd;
mod memory;

pub use etcd::{EtcdConfig, EtcdStore};
pub use memory::MemoryStore;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub(crate) const WATCH_CHANNEL_CAPACITY: usize = 256;

/// Failures of the coordination store.
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("key not found: {0}")]
    KeyNotExist(String),
    #[error("key already exists: {0}")]
    KeyExists(String),
    #[error("not a file: {0}")]
    NotAFile(String),
    #[error("not a directory: {0}")]
    NotADirectory(String),
    #[error("store request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("store error {code}: {message}")]
    Remote { code: i64, message: String },
    #[error("malformed store response: {0}")]
    Decode(String),
}

impl KvError {
    /// True for the distinguished "no such key" failure.
    pub fn is_not_exist(&self) -> bool {
        matches!(self, KvError::KeyNotExist(_))
    }
}

/// What happened to a watched key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventAction {
    Create,
    Set,
    Update,
    Delete,
    Expire,
}

impl EventAction {
    /// Actions that announce a key going away rather than appearing.
    pub fn is_removal(self) -> bool {
        matches!(self, EventAction::Delete | EventAction::Expire)
    }

    pub(crate) fn from_wire(action: &str) -> Option<Self> {
        match action {
            "create" => Some(EventAction::Create),
            "set" | "compareAndSwap" => Some(EventAction::Set),
            "update" => Some(EventAction::Update),
            "delete" | "compareAndDelete" => Some(EventAction::Delete),
            "expire" => Some(EventAction::Expire),
            _ => None,
        }
    }
}

/// A single change observed by a watch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub action: EventAction,
    pub key: String,
    pub value: Option<String>,
}

/// One entry of a listing: a value key or a directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KvEntry {
    pub key: String,
    pub value: Option<String>,
    pub dir: bool,
}

/// Stream of change events for a key or subtree.
///
/// Dropping the watch releases it; the store notices the closed channel and
/// cleans up the subscription.
pub struct Watch {
    rx: mpsc::Receiver<Event>,
}

impl Watch {
    pub(crate) fn new(rx: mpsc::Receiver<Event>) -> Self {
        Self { rx }
    }

    /// Next event, or `None` once the store side shut down.
    pub async fn next(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}

/// Operations every coordination store backend provides.
///
/// Keys are slash-separated paths. Writing a key creates missing parent
/// directories. Directory keys can carry a TTL after which the directory and
/// everything below it expire. Watches observe a key or, recursively, a whole
/// subtree and deliver events in the order the store applied them; consumers
/// must tolerate duplicate delivery.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Value of a value key. `KeyNotExist` when absent.
    async fn get(&self, key: &str) -> Result<String, KvError>;

    /// Create or replace a value key. Replacing with an identical value still
    /// notifies watchers.
    async fn set(&self, key: &str, value: &str) -> Result<(), KvError>;

    /// Create a directory key, optionally with a TTL. Fails with `KeyExists`
    /// when the key is already present.
    async fn set_dir(&self, key: &str, ttl: Option<Duration>) -> Result<(), KvError>;

    /// Refresh an existing directory key, resetting its TTL.
    async fn update_dir(&self, key: &str, ttl: Option<Duration>) -> Result<(), KvError>;

    /// Delete a key. Directories are deleted with their contents.
    async fn delete(&self, key: &str) -> Result<(), KvError>;

    /// Entries below a directory key. Listing a value key yields that entry
    /// alone.
    async fn list(&self, key: &str, recursive: bool) -> Result<Vec<KvEntry>, KvError>;

    /// Value keys below a directory key, directories filtered out.
    async fn list_keys(&self, key: &str, recursive: bool) -> Result<Vec<String>, KvError> {
        let entries = self.list(key, recursive).await?;
        Ok(entries
            .into_iter()
            .filter(|entry| !entry.dir)
            .map(|entry| entry.key)
            .collect())
    }

    /// Watch a key, or with `recursive` a whole subtree, for changes.
    async fn watch(&self, key: &str, recursive: bool) -> Result<Watch, KvError>;
}

/// Canonical form of a store key: no leading or trailing slashes and no empty
/// segments.
pub fn normalize_key(key: &str) -> String {
    key.split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_slashes_and_empty_segments() {
        assert_eq!(normalize_key("/a/b/c/"), "a/b/c");
        assert_eq!(normalize_key("a//b"), "a/b");
        assert_eq!(normalize_key("a"), "a");
        assert_eq!(normalize_key("/"), "");
    }

    #[test]
    fn wire_actions_map_to_event_actions() {
        assert_eq!(EventAction::from_wire("set"), Some(EventAction::Set));
        assert_eq!(EventAction::from_wire("create"), Some(EventAction::Create));
        assert_eq!(EventAction::from_wire("expire"), Some(EventAction::Expire));
        assert_eq!(EventAction::from_wire("get"), None);
        assert!(EventAction::Expire.is_removal());
        assert!(!EventAction::Update.is_removal());
    }
}
