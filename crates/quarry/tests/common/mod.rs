//! Shared harness for cluster integration tests: embedded nodes over one
//! in-process coordination store and an in-memory VCS engine.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use quarry::NodeConfig;
use quarry_cluster::cache::CacheMode;
use quarry_vcs::mock::{MockBackend, MockRepo};
use quarry_vcs::{Backend, RemoteOpts};

pub const TIP: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
pub const URL: &str = "http://code.example.com/team/repo";
pub const KEY: &str = "git/http/code.example.com/team/repo";
pub const PREFIX: &str = "/quarry-test";

/// A node configuration tuned for tests: ephemeral port, short lease and
/// balance cadence.
pub fn node_config(storage: &Path) -> NodeConfig {
    NodeConfig {
        storage_dir: storage.to_path_buf(),
        http_addr: "127.0.0.1:0".parse().expect("static address"),
        node_name: String::new(),
        cluster_enabled: true,
        ttl: Duration::from_secs(1),
        balance_interval: Duration::from_secs(1),
        updaters: 2,
        cache_mode: CacheMode::Mem,
        store_endpoint: None,
        key_prefix: PREFIX.to_string(),
        auth: None,
        debug: true,
        remote_opts: RemoteOpts::default(),
        ready_timeout: Duration::from_secs(10),
    }
}

/// An engine with one single-commit origin at [`URL`].
pub fn mock_backend() -> Arc<MockBackend> {
    let backend = Arc::new(MockBackend::new());
    backend.put_origin(URL, MockRepo::single(TIP, &[("README.md", "hello\n")]));
    backend
}

/// Put a clone of [`URL`] into `storage` before any node starts.
pub async fn seed_clone(storage: &Path, backend: Arc<MockBackend>) {
    let service = Arc::new(
        quarry_store::service::RepoService::new(storage)
            .with_backend(backend as Arc<dyn Backend>),
    );
    service
        .clone_repo("git", URL, &RemoteOpts::default())
        .await
        .expect("seed clone");
}

/// Poll `cond` until it holds or a generous deadline passes.
pub async fn wait_for<F, Fut>(what: &str, mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        if cond().await {
            return;
        }
        if Instant::now() >= deadline {
            panic!("timeout waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
