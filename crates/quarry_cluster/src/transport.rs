//! Per-key HTTP transport with node failover.
//!
//! [`HttpCarrier`] is the seam between routing and the wire: the cluster is
//! carrier-agnostic, concrete implementations use reqwest, in-process
//! routers, or test fakes. [`KeyTransport`] binds one repository key to a
//! snapshot of its registered nodes and walks them in order until one
//! answers, deregistering the ones that do not.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::uri::{PathAndQuery, Uri};
use http::{Method, Request, Response};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::client::RoutingClient;
use crate::{ClusterError, NodeName};

/// Bytes of a failing response body kept for diagnostics.
const ERROR_BODY_LIMIT: usize = 4096;

pub type CarrierRequest = Request<Bytes>;
pub type CarrierResponse = Response<Bytes>;

/// One HTTP round trip. Cancellation is the carrier's concern; callers drop
/// the future.
#[async_trait]
pub trait HttpCarrier: Send + Sync + 'static {
    async fn round_trip(&self, req: CarrierRequest) -> anyhow::Result<CarrierResponse>;
}

/// Carrier over a shared reqwest client. Redirects are not followed; the
/// public API uses 301/302 responses that callers must see as is.
pub struct ReqwestCarrier {
    client: reqwest::Client,
}

impl ReqwestCarrier {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpCarrier for ReqwestCarrier {
    async fn round_trip(&self, req: CarrierRequest) -> anyhow::Result<CarrierResponse> {
        let (parts, body) = req.into_parts();
        let url = reqwest::Url::parse(&parts.uri.to_string())?;
        let mut outgoing = self.client.request(parts.method, url);
        for (name, value) in &parts.headers {
            outgoing = outgoing.header(name, value);
        }
        if !body.is_empty() {
            outgoing = outgoing.body(body);
        }
        let incoming = outgoing.send().await?;

        let mut response = Response::builder().status(incoming.status());
        if let Some(headers) = response.headers_mut() {
            headers.extend(incoming.headers().clone());
        }
        let body = incoming.bytes().await?;
        Ok(response.body(body)?)
    }
}

/// Aggregated failure of a [`KeyTransport`] request: every attempted node
/// with its error, plus the outcome of the follow-up `Update` call.
#[derive(Debug)]
pub struct KeyTransportError {
    pub key: String,
    pub attempts: Vec<(NodeName, String)>,
    pub other: Option<String>,
}

impl fmt::Display for KeyTransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "all nodes failed for key {}:", self.key)?;
        for (node, error) in &self.attempts {
            write!(f, " [{node}: {error}]")?;
        }
        if let Some(other) = &self.other {
            write!(f, " (update: {other})")?;
        }
        Ok(())
    }
}

impl std::error::Error for KeyTransportError {}

/// HTTP transport bound to one repository key.
///
/// Each request tries the working node list in order. Success is a status in
/// `[200, 399]`; anything else (or a carrier error) removes the node from the
/// registry for this key and from the working list, and the next node is
/// tried. When every node fails, `Update` is attempted with the failed set
/// excluded so the key is re-registered elsewhere; the request itself still
/// fails with a [`KeyTransportError`].
pub struct KeyTransport {
    key: String,
    client: Arc<RoutingClient>,
    carrier: Arc<dyn HttpCarrier>,
    path_prefix: String,
    nodes: Mutex<Vec<NodeName>>,
}

impl KeyTransport {
    pub(crate) fn with_nodes(
        key: String,
        client: Arc<RoutingClient>,
        carrier: Arc<dyn HttpCarrier>,
        path_prefix: String,
        nodes: Vec<NodeName>,
    ) -> Self {
        Self {
            key,
            client,
            carrier,
            path_prefix,
            nodes: Mutex::new(nodes),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current working list, in attempt order.
    pub async fn nodes(&self) -> Vec<NodeName> {
        self.nodes.lock().await.clone()
    }

    /// Replace the working list with the registry's current view of the key.
    pub async fn sync_with_registry(&self) -> Result<(), ClusterError> {
        let fresh = self.client.nodes_for_key(&self.key).await?;
        *self.nodes.lock().await = fresh;
        Ok(())
    }

    pub async fn round_trip(
        &self,
        req: CarrierRequest,
    ) -> Result<CarrierResponse, KeyTransportError> {
        let (parts, body) = req.into_parts();
        let candidates = self.nodes.lock().await.clone();
        let mut attempts: Vec<(NodeName, String)> = Vec::new();

        for node in candidates {
            let attempt = match self.rewrite(&parts.method, &parts.uri, &parts.headers, &body, &node)
            {
                Ok(attempt) => attempt,
                Err(err) => {
                    attempts.push((node, format!("building request: {err}")));
                    continue;
                }
            };
            match self.carrier.round_trip(attempt).await {
                Ok(resp) if (200..400).contains(&resp.status().as_u16()) => {
                    return Ok(resp);
                }
                Ok(resp) => {
                    let status = resp.status();
                    let body = trimmed_body(resp.body());
                    debug!(key = %self.key, %node, %status, "node answered with bad status");
                    attempts.push((node.clone(), format!("status {status}: {body}")));
                }
                Err(err) => {
                    debug!(key = %self.key, %node, error = %err, "node unreachable");
                    attempts.push((node.clone(), err.to_string()));
                }
            }
            // Deregister the failed node and drop it from the working list
            // outright, so the next request skips it.
            if let Err(err) = self.client.registry().remove(&self.key, &node).await {
                warn!(key = %self.key, %node, error = ?err, "deregistering failed node");
            }
            self.nodes.lock().await.retain(|candidate| candidate != &node);
        }

        let exclude: HashSet<NodeName> =
            attempts.iter().map(|(node, _)| node.clone()).collect();
        let other = match self.client.update_excluding(&self.key, &exclude).await {
            Ok(fresh) => {
                *self.nodes.lock().await = fresh;
                None
            }
            Err(err) => Some(err.to_string()),
        };
        Err(KeyTransportError {
            key: self.key.clone(),
            attempts,
            other,
        })
    }

    fn rewrite(
        &self,
        method: &Method,
        uri: &Uri,
        headers: &http::HeaderMap,
        body: &Bytes,
        node: &NodeName,
    ) -> anyhow::Result<CarrierRequest> {
        // Only scheme, path and query survive; the host is the chosen node.
        let path_and_query = uri
            .path_and_query()
            .map(PathAndQuery::as_str)
            .unwrap_or("/");
        let path = format!("{}{}", self.path_prefix, path_and_query);
        let rewritten = Uri::builder()
            .scheme(uri.scheme_str().unwrap_or("http"))
            .authority(node.as_str())
            .path_and_query(path)
            .build()?;
        let mut request = Request::builder().method(method.clone()).uri(rewritten);
        if let Some(out) = request.headers_mut() {
            out.extend(headers.clone());
        }
        Ok(request.body(body.clone())?)
    }
}

fn trimmed_body(body: &Bytes) -> String {
    let slice = &body[..body.len().min(ERROR_BODY_LIMIT)];
    String::from_utf8_lossy(slice).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::RoutingClient;
    use crate::registry::Registry;
    use quarry_kv::MemoryStore;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    /// Scripted carrier: per-authority response status and body, with a log
    /// of attempted authorities.
    pub(crate) struct ScriptedCarrier {
        responses: HashMap<String, (u16, &'static str)>,
        pub(crate) log: StdMutex<Vec<String>>,
    }

    impl ScriptedCarrier {
        pub(crate) fn new(responses: &[(&str, u16, &'static str)]) -> Self {
            Self {
                responses: responses
                    .iter()
                    .map(|(node, status, body)| (node.to_string(), (*status, *body)))
                    .collect(),
                log: StdMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl HttpCarrier for ScriptedCarrier {
        async fn round_trip(&self, req: CarrierRequest) -> anyhow::Result<CarrierResponse> {
            let authority = req
                .uri()
                .authority()
                .map(|authority| authority.to_string())
                .unwrap_or_default();
            self.log.lock().expect("log lock").push(format!(
                "{} {} {}",
                req.method(),
                authority,
                req.uri().path()
            ));
            let Some((status, body)) = self.responses.get(&authority) else {
                anyhow::bail!("connection refused: {authority}");
            };
            Ok(Response::builder()
                .status(*status)
                .body(Bytes::from_static(body.as_bytes()))?)
        }
    }

    fn node(name: &str) -> NodeName {
        NodeName::new(name).expect("node name")
    }

    async fn client_with(
        carrier: Arc<dyn HttpCarrier>,
        pairs: &[(&str, &str)],
    ) -> Arc<RoutingClient> {
        let registry = Registry::new(Arc::new(MemoryStore::new()), "quarry");
        for (key, name) in pairs {
            registry.add(key, &node(name)).await.expect("add");
        }
        Arc::new(RoutingClient::new(Arc::new(registry), carrier))
    }

    fn get(path: &str) -> CarrierRequest {
        Request::builder()
            .method(Method::GET)
            .uri(path)
            .body(Bytes::new())
            .expect("request")
    }

    #[tokio::test]
    async fn first_healthy_node_in_order_wins() {
        let carrier = Arc::new(ScriptedCarrier::new(&[
            ("10.0.0.1:7080", 500, "boom"),
            ("10.0.0.2:7080", 200, "payload"),
        ]));
        let client = client_with(
            carrier.clone(),
            &[("k/a", "10.0.0.1:7080"), ("k/a", "10.0.0.2:7080")],
        )
        .await;
        let transport = client.transport_for_key("k/a").await.expect("transport");

        let resp = transport.round_trip(get("/k/a")).await.expect("round trip");
        assert_eq!(resp.status().as_u16(), 200);
        assert_eq!(resp.body().as_ref(), b"payload");

        // The failing node was deregistered and dropped from the working
        // list; its sibling was not duplicated in its place.
        assert_eq!(transport.nodes().await, vec![node("10.0.0.2:7080")]);
        assert_eq!(
            client.nodes_for_key("k/a").await.expect("nodes"),
            vec![node("10.0.0.2:7080")]
        );
    }

    #[tokio::test]
    async fn redirects_count_as_success() {
        let carrier = Arc::new(ScriptedCarrier::new(&[("10.0.0.1:7080", 302, "")]));
        let client = client_with(carrier, &[("k/a", "10.0.0.1:7080")]).await;
        let transport = client.transport_for_key("k/a").await.expect("transport");
        let resp = transport.round_trip(get("/k/a")).await.expect("round trip");
        assert_eq!(resp.status().as_u16(), 302);
    }

    #[tokio::test]
    async fn total_failure_reports_every_node_and_reregisters() {
        let carrier = Arc::new(ScriptedCarrier::new(&[
            ("10.0.0.1:7080", 500, "bad disk"),
            // 10.0.0.2 is absent: connection errors.
            ("10.0.0.3:7080", 200, "alive"),
        ]));
        let client = client_with(
            carrier.clone(),
            &[("k/a", "10.0.0.1:7080"), ("k/a", "10.0.0.2:7080")],
        )
        .await;
        // A third node is in the cluster but not registered for the key.
        client
            .registry()
            .announce(&node("10.0.0.3:7080"), std::time::Duration::from_secs(30))
            .await
            .expect("announce");

        let transport = client.transport_for_key("k/a").await.expect("transport");
        let err = transport.round_trip(get("/k/a")).await.expect_err("total failure");
        assert_eq!(err.attempts.len(), 2);
        assert!(err.attempts[0].1.contains("status 500"));
        assert!(err.attempts[0].1.contains("bad disk"));
        assert!(err.other.is_none(), "update should succeed: {err}");

        // Update re-registered the key on the surviving cluster node and the
        // transport now targets it.
        assert_eq!(
            client.nodes_for_key("k/a").await.expect("nodes"),
            vec![node("10.0.0.3:7080")]
        );
        assert_eq!(transport.nodes().await, vec![node("10.0.0.3:7080")]);
        let resp = transport.round_trip(get("/k/a")).await.expect("retry");
        assert_eq!(resp.body().as_ref(), b"alive");
    }

    #[tokio::test]
    async fn total_failure_with_empty_cluster_reports_update_error() {
        let carrier = Arc::new(ScriptedCarrier::new(&[]));
        let client = client_with(carrier, &[("k/a", "10.0.0.1:7080")]).await;
        let transport = client.transport_for_key("k/a").await.expect("transport");

        let err = transport.round_trip(get("/k/a")).await.expect_err("failure");
        let other = err.other.as_deref().expect("update error");
        assert!(
            other.contains("no available nodes"),
            "unexpected update error: {other}"
        );
    }

    #[tokio::test]
    async fn requests_carry_prefix_host_and_query() {
        let carrier = Arc::new(ScriptedCarrier::new(&[("10.0.0.1:7080", 200, "")]));
        let client = client_with(carrier.clone(), &[("k/a", "10.0.0.1:7080")]).await;
        let transport = client
            .transport_for_key_prefixed("k/a", "/datad")
            .await
            .expect("transport");

        transport
            .round_trip(get("/k/a/.commits?N=5&Skip=1"))
            .await
            .expect("round trip");
        let log = carrier.log.lock().expect("log lock");
        assert_eq!(log.as_slice(), ["GET 10.0.0.1:7080 /datad/k/a/.commits"]);
    }

    #[tokio::test]
    async fn sync_with_registry_replaces_the_working_list() {
        let carrier = Arc::new(ScriptedCarrier::new(&[]));
        let client = client_with(carrier, &[("k/a", "10.0.0.1:7080")]).await;
        let transport = client.transport_for_key("k/a").await.expect("transport");

        client
            .registry()
            .add("k/a", &node("10.0.0.2:7080"))
            .await
            .expect("add");
        assert_eq!(transport.nodes().await.len(), 1);
        transport.sync_with_registry().await.expect("sync");
        assert_eq!(transport.nodes().await.len(), 2);
    }
}
