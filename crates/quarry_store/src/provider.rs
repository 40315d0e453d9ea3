//! Adapter from the repository service to the cluster node agent.

use std::sync::Arc;

use async_trait::async_trait;
use quarry_cluster::node::UpdateProvider;
use quarry_vcs::RemoteOpts;

use crate::key::decode_key;
use crate::service::RepoService;

/// Lets the node agent enumerate and refresh this node's repositories.
/// Agent-driven updates carry the node's standing credentials, not
/// per-request ones.
pub struct ClusterProvider {
    service: Arc<RepoService>,
    opts: RemoteOpts,
}

impl ClusterProvider {
    pub fn new(service: Arc<RepoService>, opts: RemoteOpts) -> Self {
        Self { service, opts }
    }
}

#[async_trait]
impl UpdateProvider for ClusterProvider {
    async fn keys(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.service.local_keys()?)
    }

    async fn has_key(&self, key: &str) -> bool {
        self.service.has_key(key)
    }

    async fn update(&self, key: &str) -> anyhow::Result<()> {
        let (vcs, clone_url) = decode_key(key)?;
        self.service
            .create_or_update(&vcs, &clone_url, &self.opts)
            .await?;
        Ok(())
    }
}
