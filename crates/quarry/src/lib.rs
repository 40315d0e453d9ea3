//! Composition root for one quarry node.
//!
//! A node is the HTTP repository server from `quarry_store` plus the cluster
//! agent from `quarry_cluster`, wired over one coordination store. [`run`]
//! drives a standalone process; [`start_embedded_node`] runs the same stack
//! inside another process (mostly tests) with an injected store and VCS
//! engines, and hands back a handle that knows the bound address.

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use quarry_cluster::cache::{CacheMode, CachingCarrier};
use quarry_cluster::client::RoutingClient;
use quarry_cluster::node::{NodeAgent, NodeAgentConfig};
use quarry_cluster::registry::Registry;
use quarry_cluster::transport::ReqwestCarrier;
use quarry_cluster::NodeName;
use quarry_kv::{EtcdConfig, EtcdStore, KvStore, MemoryStore};
use quarry_store::provider::ClusterProvider;
use quarry_store::server::{router, BasicAuth, ServerConfig};
use quarry_store::service::RepoService;
use quarry_vcs::git::GitBackend;
use quarry_vcs::{Backend, RemoteOpts};
use tokio::sync::oneshot;
use tracing::{info, warn};

/// Runtime configuration for one quarry node process.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Directory holding one clone per repository key.
    pub storage_dir: PathBuf,
    /// HTTP bind address. Port 0 binds an ephemeral port.
    pub http_addr: SocketAddr,
    /// Public `host:port` other nodes route to; empty means the bound
    /// address.
    pub node_name: String,
    /// Whether to join the cluster and run the node agent.
    pub cluster_enabled: bool,
    /// Membership lease TTL.
    pub ttl: Duration,
    /// Balancer cadence.
    pub balance_interval: Duration,
    /// Update worker pool size.
    pub updaters: usize,
    /// Where the HTTP response cache lives.
    pub cache_mode: CacheMode,
    /// Coordination store endpoint; `None` keeps registrations in process
    /// memory, which only coordinates with embedded nodes sharing the store.
    pub store_endpoint: Option<String>,
    /// Registry root inside the coordination store.
    pub key_prefix: String,
    /// Credentials required from HTTP clients, when set.
    pub auth: Option<BasicAuth>,
    /// Include error details in HTTP error bodies.
    pub debug: bool,
    /// Standing origin credentials used by agent-driven updates.
    pub remote_opts: RemoteOpts,
    /// How long to wait for the listener when embedding.
    pub ready_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from(".quarry/repos"),
            http_addr: "127.0.0.1:7080".parse().expect("static address"),
            node_name: String::new(),
            cluster_enabled: true,
            ttl: Duration::from_secs(10),
            balance_interval: Duration::from_secs(60),
            updaters: 4,
            cache_mode: CacheMode::Mem,
            store_endpoint: None,
            key_prefix: String::from("/quarry"),
            auth: None,
            debug: false,
            remote_opts: RemoteOpts::default(),
            ready_timeout: Duration::from_secs(20),
        }
    }
}

impl NodeConfig {
    /// Configuration from `QUARRY_*` environment variables over the
    /// defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut cfg = NodeConfig::default();
        if let Ok(dir) = std::env::var("QUARRY_STORAGE_DIR") {
            cfg.storage_dir = PathBuf::from(dir);
        }
        if let Ok(addr) = std::env::var("QUARRY_HTTP_ADDR") {
            cfg.http_addr = addr
                .parse()
                .with_context(|| format!("QUARRY_HTTP_ADDR {addr:?}"))?;
        }
        if let Ok(name) = std::env::var("QUARRY_NODE_NAME") {
            cfg.node_name = name;
        }
        if let Ok(enabled) = std::env::var("QUARRY_CLUSTER") {
            cfg.cluster_enabled = enabled
                .parse()
                .with_context(|| format!("QUARRY_CLUSTER {enabled:?}"))?;
        }
        if let Ok(secs) = std::env::var("QUARRY_TTL_SECS") {
            cfg.ttl = Duration::from_secs(
                secs.parse().with_context(|| format!("QUARRY_TTL_SECS {secs:?}"))?,
            );
        }
        if let Ok(secs) = std::env::var("QUARRY_BALANCE_INTERVAL_SECS") {
            cfg.balance_interval = Duration::from_secs(
                secs.parse()
                    .with_context(|| format!("QUARRY_BALANCE_INTERVAL_SECS {secs:?}"))?,
            );
        }
        if let Ok(count) = std::env::var("QUARRY_UPDATERS") {
            cfg.updaters = count
                .parse()
                .with_context(|| format!("QUARRY_UPDATERS {count:?}"))?;
        }
        if let Ok(mode) = std::env::var("QUARRY_CACHE") {
            cfg.cache_mode = mode.parse().map_err(anyhow::Error::msg)?;
        }
        if let Ok(endpoint) = std::env::var("QUARRY_STORE_ENDPOINT") {
            cfg.store_endpoint = Some(endpoint);
        }
        if let Ok(prefix) = std::env::var("QUARRY_KEY_PREFIX") {
            cfg.key_prefix = prefix;
        }
        if let Ok(auth) = std::env::var("QUARRY_AUTH") {
            cfg.auth = Some(parse_auth(&auth)?);
        }
        if let Ok(debug) = std::env::var("QUARRY_DEBUG") {
            cfg.debug = debug
                .parse()
                .with_context(|| format!("QUARRY_DEBUG {debug:?}"))?;
        }
        Ok(cfg)
    }
}

/// Parse `user:password` credentials.
pub fn parse_auth(raw: &str) -> anyhow::Result<BasicAuth> {
    let (username, password) = raw
        .split_once(':')
        .context("credentials must be user:password")?;
    if username.is_empty() {
        anyhow::bail!("credentials must carry a user name");
    }
    Ok(BasicAuth {
        username: username.to_string(),
        password: password.to_string(),
    })
}

/// The coordination store named by the configuration.
pub fn build_store(config: &NodeConfig) -> anyhow::Result<Arc<dyn KvStore>> {
    match &config.store_endpoint {
        Some(endpoint) => Ok(Arc::new(EtcdStore::new(EtcdConfig {
            endpoint: endpoint.clone(),
            request_timeout: Duration::from_secs(10),
        })?)),
        None => {
            if config.cluster_enabled {
                warn!("no coordination store endpoint; registrations stay in process memory");
            }
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

/// Runs the node until Ctrl-C is received.
pub async fn run(config: NodeConfig) -> anyhow::Result<()> {
    run_with_shutdown(config, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

/// Runs the node with an externally supplied shutdown signal.
pub async fn run_with_shutdown<F>(config: NodeConfig, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let store = build_store(&config)?;
    run_node(config, store, vec![Arc::new(GitBackend)], None, shutdown).await
}

/// The full node stack over an injected store and VCS engines.
pub async fn run_node<F>(
    config: NodeConfig,
    store: Arc<dyn KvStore>,
    backends: Vec<Arc<dyn Backend>>,
    ready: Option<oneshot::Sender<SocketAddr>>,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    std::fs::create_dir_all(&config.storage_dir)
        .with_context(|| format!("create storage dir {}", config.storage_dir.display()))?;
    let listener = tokio::net::TcpListener::bind(config.http_addr)
        .await
        .with_context(|| format!("bind {}", config.http_addr))?;
    let local_addr = listener.local_addr()?;
    let node_name = if config.node_name.is_empty() {
        local_addr.to_string()
    } else {
        config.node_name.clone()
    };

    let mut service = RepoService::new(&config.storage_dir);
    for backend in backends {
        service = service.with_backend(backend);
    }
    let service = Arc::new(service);

    let agent = if config.cluster_enabled {
        let registry = Arc::new(Registry::new(store, &config.key_prefix));
        let carrier = Arc::new(CachingCarrier::new(
            Arc::new(ReqwestCarrier::new()?),
            config.cache_mode.clone(),
        )?);
        let client = Arc::new(RoutingClient::new(registry.clone(), carrier));
        let provider = Arc::new(ClusterProvider::new(
            service.clone(),
            config.remote_opts.clone(),
        ));
        let agent = NodeAgent::new(
            NodeAgentConfig {
                node: NodeName::new(&node_name)?,
                ttl: config.ttl,
                balance_interval: config.balance_interval,
                updaters: config.updaters,
            },
            registry,
            client,
            provider,
        )?;
        agent.start().await?;
        Some(agent)
    } else {
        None
    };

    let app = router(
        service,
        ServerConfig {
            debug: config.debug,
            auth: config.auth.clone(),
        },
    );
    info!(node = %node_name, addr = %local_addr, "serving repositories");
    if let Some(ready) = ready {
        let _ = ready.send(local_addr);
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    if let Some(agent) = agent {
        agent.stop();
    }
    Ok(())
}

/// A node running inside this process.
pub struct EmbeddedNodeHandle {
    http_addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl EmbeddedNodeHandle {
    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    /// The name under which the node registered itself.
    pub fn node_name(&self) -> String {
        self.http_addr.to_string()
    }

    pub async fn shutdown(mut self) -> anyhow::Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(anyhow::anyhow!("node task join failed: {err}")),
        }
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Start a node in this process and wait until its listener answers.
pub async fn start_embedded_node(
    config: NodeConfig,
    store: Arc<dyn KvStore>,
    backends: Vec<Arc<dyn Backend>>,
) -> anyhow::Result<EmbeddedNodeHandle> {
    let wait_timeout = config.ready_timeout.max(Duration::from_secs(1));
    let (ready_tx, ready_rx) = oneshot::channel();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(run_node(config, store, backends, Some(ready_tx), async move {
        let _ = shutdown_rx.await;
    }));

    let http_addr = tokio::time::timeout(wait_timeout, ready_rx)
        .await
        .context("timeout waiting for the node to bind")?
        .context("node exited before binding its listener")?;
    wait_for_listener(http_addr, wait_timeout, &task).await?;

    Ok(EmbeddedNodeHandle {
        http_addr,
        shutdown_tx: Some(shutdown_tx),
        task,
    })
}

async fn wait_for_listener(
    addr: SocketAddr,
    timeout: Duration,
    task: &tokio::task::JoinHandle<anyhow::Result<()>>,
) -> anyhow::Result<()> {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        if task.is_finished() {
            anyhow::bail!("embedded node exited before its listener became ready");
        }
        if tokio::net::TcpStream::connect(addr).await.is_ok() {
            return Ok(());
        }
        if std::time::Instant::now() >= deadline {
            anyhow::bail!("timeout waiting for the node listener at {addr}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_credentials_parse() {
        let auth = parse_auth("reader:sesame").expect("parse");
        assert_eq!(auth.username, "reader");
        assert_eq!(auth.password, "sesame");
        assert!(parse_auth("no-colon").is_err());
        assert!(parse_auth(":empty-user").is_err());
    }

    #[test]
    fn defaults_are_sane() {
        let cfg = NodeConfig::default();
        assert!(cfg.cluster_enabled);
        assert!(cfg.ttl >= Duration::from_secs(1));
        assert!(cfg.updaters >= 1);
        assert_eq!(cfg.cache_mode, CacheMode::Mem);
    }
}
