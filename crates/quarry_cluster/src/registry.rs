//! Bidirectional (repository key, node) mapping over the coordination store.
//!
//! Layout under the configured root:
//!
//! | purpose                    | path                                      |
//! |----------------------------|-------------------------------------------|
//! | live node membership       | `<root>/nodes/<node>` (directory, TTL)    |
//! | nodes holding a repository | `<root>/registry/data/<key>/$nodes/<node>`|
//! | repositories held by a node| `<root>/registry/nodes/<node>/$keys/<key>`|
//!
//! Repository keys contain slashes; the `$nodes` / `$keys` marker segments
//! delimit them when parsing recursive listings. Writers attempt both mirror
//! writes even when the first fails; readers tolerate transient asymmetry
//! between the two indices.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use quarry_kv::{KvError, KvStore};
use tracing::warn;

use crate::{ClusterError, NodeName};

const NODES_MARKER: &str = "$nodes";
const KEYS_MARKER: &str = "$keys";

pub struct Registry {
    store: Arc<dyn KvStore>,
    root: String,
}

impl Registry {
    pub fn new(store: Arc<dyn KvStore>, root: impl Into<String>) -> Self {
        Self {
            store,
            root: quarry_kv::normalize_key(&root.into()),
        }
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    fn membership_dir(&self) -> String {
        format!("{}/nodes", self.root)
    }

    fn membership_key(&self, node: &NodeName) -> String {
        format!("{}/nodes/{node}", self.root)
    }

    fn data_key(&self, key: &str, node: &NodeName) -> String {
        format!("{}/registry/data/{}/{NODES_MARKER}/{node}", self.root, clean(key))
    }

    fn data_dir(&self, key: &str) -> String {
        format!("{}/registry/data/{}/{NODES_MARKER}", self.root, clean(key))
    }

    fn node_key(&self, node: &NodeName, key: &str) -> String {
        format!("{}/registry/nodes/{node}/{KEYS_MARKER}/{}", self.root, clean(key))
    }

    /// Subtree the node agent watches for assignments addressed at `node`.
    pub fn node_keys_subtree(&self, node: &NodeName) -> String {
        format!("{}/registry/nodes/{node}/{KEYS_MARKER}", self.root)
    }

    /// Repository key carried by a store event under a node's `$keys`
    /// subtree, if the event key is such an entry.
    pub fn key_of_node_event(&self, node: &NodeName, event_key: &str) -> Option<String> {
        let prefix = format!("{}/", self.node_keys_subtree(node));
        event_key
            .strip_prefix(prefix.as_str())
            .filter(|rest| !rest.is_empty())
            .map(str::to_string)
    }

    /// Register the (key, node) pair in both indices. Re-asserting an
    /// existing pair is legal and still notifies the node's watcher.
    pub async fn add(&self, key: &str, node: &NodeName) -> Result<(), ClusterError> {
        let data = self.store.set(&self.data_key(key, node), "").await;
        let mirror = self.store.set(&self.node_key(node, key), "").await;
        data?;
        mirror?;
        Ok(())
    }

    /// Remove the pair from both indices. Missing entries are not an error.
    pub async fn remove(&self, key: &str, node: &NodeName) -> Result<(), ClusterError> {
        let data = ignore_missing(self.store.delete(&self.data_key(key, node)).await);
        let mirror = ignore_missing(self.store.delete(&self.node_key(node, key)).await);
        data?;
        mirror?;
        Ok(())
    }

    pub async fn nodes_for_key(&self, key: &str) -> Result<Vec<NodeName>, ClusterError> {
        let entries = match self.store.list_keys(&self.data_dir(key), false).await {
            Ok(entries) => entries,
            Err(err) if err.is_not_exist() => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut nodes = Vec::with_capacity(entries.len());
        for entry in entries {
            let Some(name) = entry.rsplit('/').next() else {
                continue;
            };
            match NodeName::new(name) {
                Ok(node) => nodes.push(node),
                Err(_) => warn!(entry = %entry, "skipping malformed node entry"),
            }
        }
        nodes.sort();
        Ok(nodes)
    }

    pub async fn keys_for_node(&self, node: &NodeName) -> Result<Vec<String>, ClusterError> {
        let subtree = self.node_keys_subtree(node);
        let entries = match self.store.list_keys(&subtree, true).await {
            Ok(entries) => entries,
            Err(err) if err.is_not_exist() => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let prefix = format!("{subtree}/");
        let mut keys: Vec<String> = entries
            .into_iter()
            .filter_map(|entry| entry.strip_prefix(prefix.as_str()).map(str::to_string))
            .collect();
        keys.sort();
        Ok(keys)
    }

    /// Every registered key with the nodes currently holding it. Keys whose
    /// `$nodes` directory is empty map to an empty list ("orphaned").
    pub async fn key_map(&self) -> Result<BTreeMap<String, Vec<NodeName>>, ClusterError> {
        let data_root = format!("{}/registry/data", self.root);
        let entries = match self.store.list(&data_root, true).await {
            Ok(entries) => entries,
            Err(err) if err.is_not_exist() => return Ok(BTreeMap::new()),
            Err(err) => return Err(err.into()),
        };
        let prefix = format!("{data_root}/");
        let marker = format!("/{NODES_MARKER}");
        let mut map: BTreeMap<String, Vec<NodeName>> = BTreeMap::new();
        for entry in entries {
            let Some(rest) = entry.key.strip_prefix(prefix.as_str()) else {
                continue;
            };
            if entry.dir {
                if let Some(key) = rest.strip_suffix(marker.as_str()) {
                    map.entry(key.to_string()).or_default();
                }
                continue;
            }
            let Some(pos) = rest.rfind(&format!("{marker}/")) else {
                continue;
            };
            let key = &rest[..pos];
            let name = &rest[pos + marker.len() + 1..];
            match NodeName::new(name) {
                Ok(node) => map.entry(key.to_string()).or_default().push(node),
                Err(_) => warn!(entry = %entry.key, "skipping malformed node entry"),
            }
        }
        for nodes in map.values_mut() {
            nodes.sort();
        }
        Ok(map)
    }

    /// Create this node's membership entry, updating instead when it already
    /// exists from an earlier incarnation.
    pub async fn announce(&self, node: &NodeName, ttl: Duration) -> Result<(), ClusterError> {
        let key = self.membership_key(node);
        match self.store.set_dir(&key, Some(ttl)).await {
            Ok(()) => Ok(()),
            Err(KvError::KeyExists(_)) => Ok(self.store.update_dir(&key, Some(ttl)).await?),
            Err(err) => Err(err.into()),
        }
    }

    /// Renew this node's membership lease, recreating the entry when it
    /// already expired.
    pub async fn refresh(&self, node: &NodeName, ttl: Duration) -> Result<(), ClusterError> {
        let key = self.membership_key(node);
        match self.store.update_dir(&key, Some(ttl)).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_exist() => Ok(self.store.set_dir(&key, Some(ttl)).await?),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn nodes_in_cluster(&self) -> Result<Vec<NodeName>, ClusterError> {
        let entries = match self.store.list(&self.membership_dir(), false).await {
            Ok(entries) => entries,
            Err(err) if err.is_not_exist() => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut nodes = Vec::new();
        for entry in entries {
            let Some(name) = entry.key.rsplit('/').next() else {
                continue;
            };
            match NodeName::new(name) {
                Ok(node) => nodes.push(node),
                Err(_) => warn!(entry = %entry.key, "skipping malformed membership entry"),
            }
        }
        nodes.sort();
        Ok(nodes)
    }
}

fn clean(key: &str) -> String {
    quarry_kv::normalize_key(key)
}

fn ignore_missing(result: Result<(), KvError>) -> Result<(), ClusterError> {
    match result {
        Ok(()) => Ok(()),
        Err(err) if err.is_not_exist() => Ok(()),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_kv::MemoryStore;

    fn registry() -> Registry {
        Registry::new(Arc::new(MemoryStore::new()), "quarry")
    }

    fn node(name: &str) -> NodeName {
        NodeName::new(name).expect("node name")
    }

    #[tokio::test]
    async fn add_is_mirrored_in_both_indices() {
        let registry = registry();
        let n1 = node("10.0.0.1:7080");
        registry.add("git/http/example.com/a/b", &n1).await.expect("add");

        assert_eq!(
            registry
                .nodes_for_key("git/http/example.com/a/b")
                .await
                .expect("nodes"),
            vec![n1.clone()]
        );
        assert_eq!(
            registry.keys_for_node(&n1).await.expect("keys"),
            vec![String::from("git/http/example.com/a/b")]
        );
    }

    #[tokio::test]
    async fn remove_clears_both_indices_and_tolerates_missing() {
        let registry = registry();
        let n1 = node("10.0.0.1:7080");
        registry.add("git/http/example.com/a", &n1).await.expect("add");
        registry.remove("git/http/example.com/a", &n1).await.expect("remove");

        assert!(registry
            .nodes_for_key("git/http/example.com/a")
            .await
            .expect("nodes")
            .is_empty());
        assert!(registry.keys_for_node(&n1).await.expect("keys").is_empty());

        // A second remove of the same pair is a no-op.
        registry.remove("git/http/example.com/a", &n1).await.expect("re-remove");
    }

    #[tokio::test]
    async fn re_adding_a_pair_is_idempotent_for_the_mapping() {
        let registry = registry();
        let n1 = node("10.0.0.1:7080");
        registry.add("git/http/example.com/a", &n1).await.expect("add");
        registry.add("git/http/example.com/a", &n1).await.expect("re-add");
        assert_eq!(
            registry
                .nodes_for_key("git/http/example.com/a")
                .await
                .expect("nodes")
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn key_map_reports_orphans_with_empty_lists() {
        let registry = registry();
        let n1 = node("10.0.0.1:7080");
        let n2 = node("10.0.0.2:7080");
        registry.add("git/http/example.com/a", &n1).await.expect("add");
        registry.add("git/http/example.com/a", &n2).await.expect("add");
        registry.add("git/http/example.com/b", &n1).await.expect("add");
        registry.remove("git/http/example.com/b", &n1).await.expect("remove");

        let map = registry.key_map().await.expect("key map");
        assert_eq!(
            map.get("git/http/example.com/a"),
            Some(&vec![n1.clone(), n2.clone()])
        );
        // The emptied $nodes directory survives the removal, marking b as
        // orphaned rather than unknown.
        assert_eq!(map.get("git/http/example.com/b"), Some(&Vec::new()));
    }

    #[tokio::test]
    async fn membership_announce_refresh_and_expiry() {
        let registry = registry();
        let n1 = node("10.0.0.1:7080");
        registry
            .announce(&n1, Duration::from_secs(30))
            .await
            .expect("announce");
        // Announcing again (restart with a live lease) updates in place.
        registry
            .announce(&n1, Duration::from_secs(30))
            .await
            .expect("re-announce");
        registry
            .refresh(&n1, Duration::from_secs(30))
            .await
            .expect("refresh");
        assert_eq!(
            registry.nodes_in_cluster().await.expect("nodes"),
            vec![n1.clone()]
        );

        let short = node("10.0.0.9:7080");
        registry
            .announce(&short, Duration::from_millis(100))
            .await
            .expect("announce short");
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(
            registry.nodes_in_cluster().await.expect("nodes"),
            vec![n1]
        );
    }

    #[tokio::test]
    async fn watcher_sees_re_asserted_registrations() {
        let registry = registry();
        let n1 = node("10.0.0.1:7080");
        let mut watch = registry
            .store()
            .watch(&registry.node_keys_subtree(&n1), true)
            .await
            .expect("watch");

        registry.add("git/http/example.com/a", &n1).await.expect("add");
        registry.add("git/http/example.com/a", &n1).await.expect("re-add");

        for _ in 0..2 {
            let event = tokio::time::timeout(Duration::from_secs(1), watch.next())
                .await
                .expect("event in time")
                .expect("event");
            assert!(!event.action.is_removal());
            assert_eq!(
                registry.key_of_node_event(&n1, &event.key).as_deref(),
                Some("git/http/example.com/a")
            );
        }
    }
}
