//! Node agent: membership lease, assignment watcher, update worker pool and
//! the periodic balancer.
//!
//! All background work runs as spawned tasks observing one shutdown signal.
//! The update queue is bounded and deduplicated by key: a key already queued
//! is not queued twice, a key in progress coalesces any number of further
//! requests into a single follow-up run.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, Request};
use rand::Rng;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client::{bucket_node, RoutingClient};
use crate::registry::Registry;
use crate::{ClusterError, NodeName};

/// Shortest membership TTL the agent accepts.
const MIN_TTL: Duration = Duration::from_secs(1);
/// Per-node liveness probe budget during a balance pass.
const LIVENESS_TIMEOUT: Duration = Duration::from_secs(2);
/// One pass in this many enqueues updates of the keys this node holds.
const SELF_REFRESH_DRAW: u32 = 10;
/// Backoff before re-establishing a broken registry watch.
const WATCH_RETRY: Duration = Duration::from_secs(1);

/// Node-local repository operations the agent drives.
#[async_trait]
pub trait UpdateProvider: Send + Sync + 'static {
    /// Keys of every repository present in local storage.
    async fn keys(&self) -> anyhow::Result<Vec<String>>;

    /// Whether `key` is present locally.
    async fn has_key(&self, key: &str) -> bool;

    /// Converge the local mirror of `key` on its origin, cloning first when
    /// absent. Must be idempotent.
    async fn update(&self, key: &str) -> anyhow::Result<()>;
}

#[derive(Clone, Debug)]
pub struct NodeAgentConfig {
    /// This node's public `host:port`.
    pub node: NodeName,
    /// Membership lease TTL; renewed at half this interval. At least 1s.
    pub ttl: Duration,
    /// Cadence of the balancer; a single pass is bounded to half of it.
    pub balance_interval: Duration,
    /// Size of the update worker pool, at least 1.
    pub updaters: usize,
}

#[derive(Default)]
struct QueueState {
    /// Keys with an update pending: false = queued, true = in progress.
    pending: HashMap<String, bool>,
    /// In-progress keys that were asked for again; re-enqueued on completion.
    followup: HashSet<String>,
}

pub struct NodeAgent {
    cfg: NodeAgentConfig,
    registry: Arc<Registry>,
    client: Arc<RoutingClient>,
    provider: Arc<dyn UpdateProvider>,
    queue_state: StdMutex<QueueState>,
    queue_tx: mpsc::Sender<String>,
    queue_rx: Mutex<mpsc::Receiver<String>>,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for NodeAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeAgent")
            .field("cfg", &self.cfg)
            .finish_non_exhaustive()
    }
}

impl NodeAgent {
    pub fn new(
        cfg: NodeAgentConfig,
        registry: Arc<Registry>,
        client: Arc<RoutingClient>,
        provider: Arc<dyn UpdateProvider>,
    ) -> Result<Arc<Self>, ClusterError> {
        if cfg.ttl < MIN_TTL {
            return Err(ClusterError::InvalidConfig(format!(
                "membership ttl {:?} below minimum {MIN_TTL:?}",
                cfg.ttl
            )));
        }
        if cfg.updaters == 0 {
            return Err(ClusterError::InvalidConfig(String::from(
                "at least one updater required",
            )));
        }
        let (queue_tx, queue_rx) = mpsc::channel(cfg.updaters);
        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new(Self {
            cfg,
            registry,
            client,
            provider,
            queue_state: StdMutex::new(QueueState::default()),
            queue_tx,
            queue_rx: Mutex::new(queue_rx),
            shutdown,
        }))
    }

    pub fn node(&self) -> &NodeName {
        &self.cfg.node
    }

    /// Join the cluster and spawn the refresh task, initial publication,
    /// watcher, update workers and balancer.
    pub async fn start(self: &Arc<Self>) -> Result<(), ClusterError> {
        self.registry.announce(&self.cfg.node, self.cfg.ttl).await?;
        info!(node = %self.cfg.node, "joined cluster");

        tokio::spawn(self.clone().refresh_loop(self.shutdown.subscribe()));
        tokio::spawn(self.clone().publish_local_keys());
        tokio::spawn(self.clone().watcher_loop(self.shutdown.subscribe()));
        for _ in 0..self.cfg.updaters {
            tokio::spawn(self.clone().worker_loop(self.shutdown.subscribe()));
        }
        tokio::spawn(self.clone().balancer_loop(self.shutdown.subscribe()));
        Ok(())
    }

    /// Signal every background task to exit. Outstanding queue entries are
    /// dropped.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Ask for an update of `key`, deduplicating against pending work.
    pub fn enqueue_update(&self, key: &str) {
        {
            let mut state = self.queue_lock();
            match state.pending.get(key) {
                // In progress: coalesce into a single follow-up run.
                Some(true) => {
                    state.followup.insert(key.to_string());
                    return;
                }
                // Already queued.
                Some(false) => return,
                None => {
                    state.pending.insert(key.to_string(), false);
                }
            }
        }
        if let Err(mpsc::error::TrySendError::Full(key)) = self.queue_tx.try_send(key.to_string())
        {
            // The queue applies backpressure; hand the send to a task rather
            // than stalling the watcher. Dedup keeps this bounded.
            let tx = self.queue_tx.clone();
            tokio::spawn(async move {
                let _ = tx.send(key).await;
            });
        }
    }

    fn queue_lock(&self) -> MutexGuard<'_, QueueState> {
        self.queue_state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn refresh_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.cfg.ttl / 2);
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => {}
            }
            if let Err(err) = self.registry.refresh(&self.cfg.node, self.cfg.ttl).await {
                warn!(node = %self.cfg.node, error = ?err, "membership refresh failed");
            }
        }
    }

    async fn publish_local_keys(self: Arc<Self>) {
        let keys = match self.provider.keys().await {
            Ok(keys) => keys,
            Err(err) => {
                warn!(error = ?err, "enumerating local repositories failed");
                return;
            }
        };
        for key in keys {
            if let Err(err) = self.registry.add(&key, &self.cfg.node).await {
                warn!(key = %key, error = ?err, "publishing local repository failed");
            }
        }
    }

    async fn watcher_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let subtree = self.registry.node_keys_subtree(&self.cfg.node);
        loop {
            let mut watch = match self.registry.store().watch(&subtree, true).await {
                Ok(watch) => watch,
                Err(err) => {
                    warn!(error = ?err, "registry watch failed, retrying");
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        _ = tokio::time::sleep(WATCH_RETRY) => continue,
                    }
                }
            };
            loop {
                let event = tokio::select! {
                    _ = shutdown.changed() => return,
                    event = watch.next() => event,
                };
                let Some(event) = event else {
                    // Stream closed; re-establish the watch.
                    break;
                };
                // Deregistration is caused externally; only additions and
                // re-assertions mean work.
                if event.action.is_removal() {
                    continue;
                }
                if let Some(key) = self.registry.key_of_node_event(&self.cfg.node, &event.key) {
                    debug!(key = %key, "assignment observed");
                    self.enqueue_update(&key);
                }
            }
        }
    }

    async fn worker_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let key = {
                let mut rx = self.queue_rx.lock().await;
                tokio::select! {
                    _ = shutdown.changed() => return,
                    key = rx.recv() => match key {
                        Some(key) => key,
                        None => return,
                    },
                }
            };
            self.run_update(key).await;
        }
    }

    async fn run_update(&self, key: String) {
        self.queue_lock().pending.insert(key.clone(), true);
        debug!(key = %key, "update starting");
        match self.provider.update(&key).await {
            Ok(()) => debug!(key = %key, "update complete"),
            Err(err) => warn!(key = %key, error = ?err, "update failed"),
        }
        let followup = {
            let mut state = self.queue_lock();
            state.pending.remove(&key);
            state.followup.remove(&key)
        };
        if followup {
            self.enqueue_update(&key);
        }
    }

    async fn balancer_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.cfg.balance_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => {}
            }
            let deadline = Instant::now() + self.cfg.balance_interval / 2;
            if let Err(err) = self.balance_once(deadline).await {
                warn!(error = ?err, "balance pass failed");
            }
        }
    }

    /// One balance pass: register orphaned keys, liveness-check registered
    /// owners, occasionally refresh this node's own keys. Bounded by
    /// `deadline`; an overflowing pass stops early and resumes next tick.
    pub async fn balance_once(&self, deadline: Instant) -> anyhow::Result<()> {
        let key_map = self.registry.key_map().await?;
        let cluster = self.registry.nodes_in_cluster().await?;

        for (key, nodes) in key_map {
            if Instant::now() >= deadline {
                debug!("balance pass deadline reached, resuming next tick");
                break;
            }
            if nodes.is_empty() {
                let Some(chosen) = bucket_node(&cluster, &key) else {
                    continue;
                };
                info!(key = %key, node = %chosen, "registering orphaned key");
                if let Err(err) = self.registry.add(&key, chosen).await {
                    warn!(key = %key, error = ?err, "registering orphaned key failed");
                }
                continue;
            }
            for node in nodes {
                self.check_liveness(&key, &node).await;
            }
        }

        if rand::thread_rng().gen_range(0..SELF_REFRESH_DRAW) == 0 {
            for key in self.provider.keys().await? {
                self.enqueue_update(&key);
            }
        }
        Ok(())
    }

    /// A short GET against the key's route, pinned to one node. The
    /// transport deregisters the node on a client-observed failure; a probe
    /// that times out is deregistered here.
    async fn check_liveness(&self, key: &str, node: &NodeName) {
        let transport = self.client.transport_for_nodes(key, vec![node.clone()]);
        let probe = Request::builder()
            .method(Method::GET)
            .uri(format!("/{key}"))
            .body(Bytes::new());
        let probe = match probe {
            Ok(probe) => probe,
            Err(err) => {
                warn!(key = %key, error = ?err, "building liveness probe failed");
                return;
            }
        };
        match tokio::time::timeout(LIVENESS_TIMEOUT, transport.round_trip(probe)).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => {
                debug!(key = %key, %node, error = %err, "liveness check failed");
            }
            Err(_) => {
                warn!(key = %key, %node, "liveness check timed out, deregistering");
                if let Err(err) = self.registry.remove(key, node).await {
                    warn!(key = %key, %node, error = ?err, "deregistering timed-out node");
                }
            }
        }
    }
}
