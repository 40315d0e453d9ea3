//! Routing and replication cluster.
//!
//! The cluster keeps one piece of shared state in the coordination store: a
//! bidirectional mapping between repository keys and the nodes holding them,
//! plus a TTL-bounded membership entry per node. [`registry::Registry`] owns
//! that mapping, [`node::NodeAgent`] keeps a node's membership and local
//! clones current, and [`client::RoutingClient`] turns a repository key plus
//! HTTP request into a cluster call with failover.

pub mod cache;
pub mod client;
pub mod node;
pub mod registry;
pub mod transport;

use std::fmt;

use quarry_kv::KvError;

/// Cluster-level failures.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// `Update` was asked to register a key but the exclusion set left no
    /// candidate nodes.
    #[error("no available nodes for registration")]
    NoAvailableNodesForRegistration,
    #[error("no nodes for key {0}")]
    NoNodesForKey(String),
    #[error("invalid node name {0:?}: must be host:port")]
    InvalidNodeName(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Kv(#[from] KvError),
}

/// A cluster node's `host:port`, the HTTP destination for requests addressed
/// at it. Validated on construction.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct NodeName(String);

impl NodeName {
    pub fn new(name: impl Into<String>) -> Result<Self, ClusterError> {
        let name = name.into();
        let Some((host, port)) = name.rsplit_once(':') else {
            return Err(ClusterError::InvalidNodeName(name));
        };
        if host.is_empty() || host.contains('/') || port.parse::<u16>().is_err() {
            return Err(ClusterError::InvalidNodeName(name));
        }
        Ok(NodeName(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
