//! End-to-end cluster behavior over embedded nodes sharing one in-memory
//! coordination store.

mod common;

use std::sync::Arc;

use bytes::Bytes;
use common::{mock_backend, node_config, seed_clone, wait_for, KEY, PREFIX, TIP};
use quarry::start_embedded_node;
use quarry_cluster::client::RoutingClient;
use quarry_cluster::registry::Registry;
use quarry_cluster::transport::ReqwestCarrier;
use quarry_cluster::NodeName;
use quarry_kv::{KvStore, MemoryStore};
use quarry_vcs::Backend;

fn shared_store() -> Arc<dyn KvStore> {
    Arc::new(MemoryStore::new())
}

#[tokio::test(flavor = "multi_thread")]
async fn started_node_announces_itself_and_its_repositories() {
    let store = shared_store();
    let registry = Arc::new(Registry::new(store.clone(), PREFIX));
    let backend = mock_backend();
    let storage = tempfile::tempdir().expect("tempdir");
    seed_clone(storage.path(), backend.clone()).await;

    let handle = start_embedded_node(
        node_config(storage.path()),
        store,
        vec![backend as Arc<dyn Backend>],
    )
    .await
    .expect("start node");
    let node = NodeName::new(&handle.node_name()).expect("node name");

    wait_for("cluster membership", || {
        let registry = registry.clone();
        let node = node.clone();
        async move {
            registry
                .nodes_in_cluster()
                .await
                .is_ok_and(|nodes| nodes.contains(&node))
        }
    })
    .await;
    wait_for("local key publication", || {
        let registry = registry.clone();
        let node = node.clone();
        async move {
            registry
                .nodes_for_key(KEY)
                .await
                .is_ok_and(|nodes| nodes.contains(&node))
        }
    })
    .await;

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread")]
async fn membership_lapses_after_a_node_stops() {
    let store = shared_store();
    let registry = Arc::new(Registry::new(store.clone(), PREFIX));
    let storage = tempfile::tempdir().expect("tempdir");

    let handle = start_embedded_node(
        node_config(storage.path()),
        store,
        vec![mock_backend() as Arc<dyn Backend>],
    )
    .await
    .expect("start node");

    wait_for("cluster membership", || {
        let registry = registry.clone();
        async move {
            registry
                .nodes_in_cluster()
                .await
                .is_ok_and(|nodes| !nodes.is_empty())
        }
    })
    .await;
    handle.shutdown().await.expect("shutdown");

    // The 1s lease stops being refreshed; the entry must age out.
    wait_for("membership expiry", || {
        let registry = registry.clone();
        async move {
            registry
                .nodes_in_cluster()
                .await
                .is_ok_and(|nodes| nodes.is_empty())
        }
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn registering_a_key_makes_the_assigned_node_clone_it() {
    let store = shared_store();
    let registry = Arc::new(Registry::new(store.clone(), PREFIX));
    let backend = mock_backend();
    let storage = tempfile::tempdir().expect("tempdir");

    let handle = start_embedded_node(
        node_config(storage.path()),
        store,
        vec![backend as Arc<dyn Backend>],
    )
    .await
    .expect("start node");

    wait_for("cluster membership", || {
        let registry = registry.clone();
        async move {
            registry
                .nodes_in_cluster()
                .await
                .is_ok_and(|nodes| !nodes.is_empty())
        }
    })
    .await;

    let client = Arc::new(RoutingClient::new(
        registry.clone(),
        Arc::new(ReqwestCarrier::new().expect("carrier")),
    ));
    let assigned = client.update(KEY).await.expect("register key");
    assert_eq!(assigned, vec![NodeName::new(&handle.node_name()).expect("node name")]);

    // The watcher picks the assignment up and the update workers clone.
    let base = format!("http://{}", handle.http_addr());
    wait_for("clone on demand", || {
        let url = format!("{base}/{KEY}");
        async move {
            reqwest::get(&url)
                .await
                .is_ok_and(|resp| resp.status() == reqwest::StatusCode::OK)
        }
    })
    .await;

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread")]
async fn transport_fails_over_and_sheds_the_dead_node() {
    let store = shared_store();
    let registry = Arc::new(Registry::new(store.clone(), PREFIX));
    let backend = mock_backend();
    let storage = tempfile::tempdir().expect("tempdir");
    seed_clone(storage.path(), backend.clone()).await;

    // Keep the balancer quiet so the transport alone handles the dead node.
    let mut config = node_config(storage.path());
    config.balance_interval = std::time::Duration::from_secs(3600);
    let handle = start_embedded_node(config, store, vec![backend as Arc<dyn Backend>])
        .await
        .expect("start node");
    let live = NodeName::new(&handle.node_name()).expect("node name");

    // Sorts before any 127.0.0.1 name, so the transport tries it first.
    let dead = NodeName::new("0.0.0.0:1").expect("node name");
    registry.add(KEY, &dead).await.expect("register dead");
    registry.add(KEY, &live).await.expect("register live");

    let client = Arc::new(RoutingClient::new(
        registry.clone(),
        Arc::new(ReqwestCarrier::new().expect("carrier")),
    ));
    let transport = client.transport_for_key(KEY).await.expect("transport");
    assert_eq!(transport.nodes().await, vec![dead.clone(), live.clone()]);

    let request = http::Request::get(format!("/{KEY}/.branches"))
        .body(Bytes::new())
        .expect("request");
    let response = transport.round_trip(request).await.expect("failover");
    assert_eq!(response.status(), http::StatusCode::OK);

    wait_for("dead node deregistration", || {
        let registry = registry.clone();
        let dead = dead.clone();
        async move {
            registry
                .nodes_for_key(KEY)
                .await
                .is_ok_and(|nodes| !nodes.contains(&dead))
        }
    })
    .await;

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread")]
async fn balancer_adopts_orphaned_keys() {
    let store = shared_store();
    let registry = Arc::new(Registry::new(store.clone(), PREFIX));
    let backend = mock_backend();
    let storage = tempfile::tempdir().expect("tempdir");

    let handle = start_embedded_node(
        node_config(storage.path()),
        store,
        vec![backend as Arc<dyn Backend>],
    )
    .await
    .expect("start node");
    let node = NodeName::new(&handle.node_name()).expect("node name");

    // Leave the key registered with nobody: an empty owner set survives the
    // departed owner and marks the key as orphaned.
    let ghost = NodeName::new("127.0.0.1:9").expect("node name");
    registry.add(KEY, &ghost).await.expect("register ghost");
    registry.remove(KEY, &ghost).await.expect("remove ghost");

    wait_for("orphan adoption", || {
        let registry = registry.clone();
        let node = node.clone();
        async move {
            registry
                .nodes_for_key(KEY)
                .await
                .is_ok_and(|nodes| nodes == vec![node])
        }
    })
    .await;

    let base = format!("http://{}", handle.http_addr());
    wait_for("adopted key cloned", || {
        let url = format!("{base}/{KEY}");
        async move {
            reqwest::get(&url)
                .await
                .is_ok_and(|resp| resp.status() == reqwest::StatusCode::OK)
        }
    })
    .await;

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread")]
async fn revision_redirects_carry_the_cache_policy() {
    let store = shared_store();
    let backend = mock_backend();
    let storage = tempfile::tempdir().expect("tempdir");
    seed_clone(storage.path(), backend.clone()).await;

    let handle = start_embedded_node(
        node_config(storage.path()),
        store,
        vec![backend as Arc<dyn Backend>],
    )
    .await
    .expect("start node");
    let base = format!("http://{}", handle.http_addr());
    let http = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .expect("client");

    // A short revision may drift, so its redirect is barely cacheable.
    let short = http
        .get(format!("{base}/{KEY}/.revs/{}", &TIP[..8]))
        .send()
        .await
        .expect("short rev");
    assert_eq!(short.status(), reqwest::StatusCode::FOUND);
    assert_eq!(
        short.headers()[reqwest::header::CACHE_CONTROL],
        "public, max-age=5"
    );
    assert_eq!(
        short.headers()[reqwest::header::LOCATION],
        format!("/{KEY}/.commits/{TIP}")
    );

    // The full id is immutable and its redirect cacheable for a year.
    let full = http
        .get(format!("{base}/{KEY}/.revs/{TIP}"))
        .send()
        .await
        .expect("full rev");
    assert_eq!(full.status(), reqwest::StatusCode::MOVED_PERMANENTLY);
    assert_eq!(
        full.headers()[reqwest::header::CACHE_CONTROL],
        "public, max-age=31536000"
    );

    let commit = http
        .get(format!("{base}/{KEY}/.commits/{TIP}"))
        .send()
        .await
        .expect("commit");
    assert_eq!(commit.status(), reqwest::StatusCode::OK);
    assert_eq!(
        commit.headers()[reqwest::header::CACHE_CONTROL],
        "public, max-age=31536000"
    );

    handle.shutdown().await.expect("shutdown");
}
