//! Cluster-facing routing client.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::registry::Registry;
use crate::transport::{HttpCarrier, KeyTransport};
use crate::{ClusterError, NodeName};

/// Resolves repository keys to nodes and hands out per-key transports.
pub struct RoutingClient {
    registry: Arc<Registry>,
    carrier: Arc<dyn HttpCarrier>,
}

impl RoutingClient {
    pub fn new(registry: Arc<Registry>, carrier: Arc<dyn HttpCarrier>) -> Self {
        Self { registry, carrier }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn carrier(&self) -> &Arc<dyn HttpCarrier> {
        &self.carrier
    }

    pub async fn nodes_in_cluster(&self) -> Result<Vec<NodeName>, ClusterError> {
        self.registry.nodes_in_cluster().await
    }

    pub async fn nodes_for_key(&self, key: &str) -> Result<Vec<NodeName>, ClusterError> {
        self.registry.nodes_for_key(key).await
    }

    /// Ensure `key` is registered somewhere and nudge its holders to pull
    /// fresh content.
    ///
    /// An orphaned key is registered on a node chosen by the stable bucket
    /// hash over the cluster list; a registered key has every existing
    /// registration re-asserted, which each holder's watcher turns into an
    /// update. Returns the nodes now registered.
    pub async fn update(&self, key: &str) -> Result<Vec<NodeName>, ClusterError> {
        self.update_excluding(key, &HashSet::new()).await
    }

    /// `update` with a caller-provided exclusion set for registration, used
    /// by the transport to avoid re-registering on nodes that just failed.
    pub async fn update_excluding(
        &self,
        key: &str,
        exclude: &HashSet<NodeName>,
    ) -> Result<Vec<NodeName>, ClusterError> {
        let nodes = self.registry.nodes_for_key(key).await?;
        if nodes.is_empty() {
            let cluster = self.registry.nodes_in_cluster().await?;
            let candidates: Vec<NodeName> = cluster
                .into_iter()
                .filter(|node| !exclude.contains(node))
                .collect();
            let Some(chosen) = bucket_node(&candidates, key) else {
                return Err(ClusterError::NoAvailableNodesForRegistration);
            };
            self.registry.add(key, chosen).await?;
            return Ok(vec![chosen.clone()]);
        }
        for node in &nodes {
            self.registry.add(key, node).await?;
        }
        Ok(nodes)
    }

    /// A transport bound to `key` and a snapshot of its current nodes.
    pub async fn transport_for_key(
        self: &Arc<Self>,
        key: &str,
    ) -> Result<KeyTransport, ClusterError> {
        self.transport_for_key_prefixed(key, "").await
    }

    /// As [`transport_for_key`](Self::transport_for_key), prepending
    /// `path_prefix` to every outgoing request path.
    pub async fn transport_for_key_prefixed(
        self: &Arc<Self>,
        key: &str,
        path_prefix: &str,
    ) -> Result<KeyTransport, ClusterError> {
        let nodes = self.registry.nodes_for_key(key).await?;
        Ok(KeyTransport::with_nodes(
            key.to_string(),
            self.clone(),
            self.carrier.clone(),
            path_prefix.to_string(),
            nodes,
        ))
    }

    /// A transport for `key` pinned to an explicit node list, used for
    /// per-node liveness checks.
    pub(crate) fn transport_for_nodes(
        self: &Arc<Self>,
        key: &str,
        nodes: Vec<NodeName>,
    ) -> KeyTransport {
        KeyTransport::with_nodes(
            key.to_string(),
            self.clone(),
            self.carrier.clone(),
            String::new(),
            nodes,
        )
    }
}

/// Deterministic node choice for `key`: a stable bucket hash over the node
/// list. Every caller with the same list picks the same node.
pub fn bucket_node<'a>(nodes: &'a [NodeName], key: &str) -> Option<&'a NodeName> {
    if nodes.is_empty() {
        return None;
    }
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    let bucket = (hasher.finish() % nodes.len() as u64) as usize;
    nodes.get(bucket)
}
