//! `quarry` command line: run a node, or talk to a running cluster.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use clap::{Args, Parser, Subcommand};
use quarry_cluster::cache::CacheMode;
use quarry_cluster::client::RoutingClient;
use quarry_cluster::registry::Registry;
use quarry_cluster::transport::ReqwestCarrier;
use quarry_kv::{EtcdConfig, EtcdStore};
use quarry_store::key::{decode_key, encode_key};
use quarry::{parse_auth, run, NodeConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "quarry", about = "Distributed repository mirror")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a node: repository storage, HTTP read API and cluster agent.
    Serve(ServeArgs),
    /// Print the repository key for a clone URL.
    Repo(RepoArgs),
    /// Ask the cluster to mirror a repository.
    Clone(CloneArgs),
    /// Fetch a path from whichever node serves its repository.
    Get(GetArgs),
}

#[derive(Args)]
struct ServeArgs {
    /// Directory holding repository clones.
    #[arg(long)]
    storage_dir: Option<PathBuf>,
    /// HTTP bind address.
    #[arg(long)]
    http_addr: Option<SocketAddr>,
    /// Public node name (`host:port`) registered in the cluster.
    #[arg(long)]
    node: Option<String>,
    /// Serve without joining a cluster.
    #[arg(long)]
    no_cluster: bool,
    /// Coordination store endpoint.
    #[arg(long)]
    store_endpoint: Option<String>,
    /// Registry root inside the coordination store.
    #[arg(long)]
    key_prefix: Option<String>,
    /// Response cache: `mem` or `disk:<dir>`.
    #[arg(long)]
    cache: Option<CacheMode>,
    /// Require these credentials from HTTP clients (`user:password`).
    #[arg(long)]
    auth: Option<String>,
    /// Include error details in HTTP error bodies.
    #[arg(long)]
    debug: bool,
}

#[derive(Args)]
struct RepoArgs {
    #[arg(long, default_value = "git")]
    vcs: String,
    clone_url: String,
}

#[derive(Args)]
struct CloneArgs {
    #[arg(long, default_value = "git")]
    vcs: String,
    clone_url: String,
    #[command(flatten)]
    cluster: ClusterArgs,
}

#[derive(Args)]
struct GetArgs {
    /// Request path, e.g. `git/http/host/team/repo/.branches`.
    path: String,
    #[command(flatten)]
    cluster: ClusterArgs,
}

#[derive(Args)]
struct ClusterArgs {
    #[arg(long, default_value = "http://127.0.0.1:2379")]
    store_endpoint: String,
    #[arg(long, default_value = "/quarry")]
    key_prefix: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("quarry=info,quarry_cluster=info,warn")),
        )
        .init();

    match Cli::parse().command {
        Command::Serve(args) => serve(args).await,
        Command::Repo(args) => {
            println!("{}", encode_key(&args.vcs, &args.clone_url)?);
            Ok(())
        }
        Command::Clone(args) => clone(args).await,
        Command::Get(args) => get(args).await,
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let mut config = NodeConfig::from_env()?;
    if let Some(dir) = args.storage_dir {
        config.storage_dir = dir;
    }
    if let Some(addr) = args.http_addr {
        config.http_addr = addr;
    }
    if let Some(node) = args.node {
        config.node_name = node;
    }
    if args.no_cluster {
        config.cluster_enabled = false;
    }
    if let Some(endpoint) = args.store_endpoint {
        config.store_endpoint = Some(endpoint);
    }
    if let Some(prefix) = args.key_prefix {
        config.key_prefix = prefix;
    }
    if let Some(cache) = args.cache {
        config.cache_mode = cache;
    }
    if let Some(auth) = args.auth {
        config.auth = Some(parse_auth(&auth)?);
    }
    if args.debug {
        config.debug = true;
    }
    run(config).await
}

fn routing_client(args: &ClusterArgs) -> anyhow::Result<Arc<RoutingClient>> {
    let store = Arc::new(EtcdStore::new(EtcdConfig {
        endpoint: args.store_endpoint.clone(),
        request_timeout: Duration::from_secs(10),
    })?);
    let registry = Arc::new(Registry::new(store, &args.key_prefix));
    Ok(Arc::new(RoutingClient::new(
        registry,
        Arc::new(ReqwestCarrier::new()?),
    )))
}

async fn clone(args: CloneArgs) -> anyhow::Result<()> {
    let key = encode_key(&args.vcs, &args.clone_url)?;
    let client = routing_client(&args.cluster)?;
    client
        .update(&key)
        .await
        .with_context(|| format!("registering {key}"))?;
    let transport = client.transport_for_key(&key).await?;
    let request = http::Request::post(format!("/{key}"))
        .body(Bytes::new())
        .context("build request")?;
    let response = transport
        .round_trip(request)
        .await
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    println!("{} {}", response.status().as_u16(), key);
    Ok(())
}

async fn get(args: GetArgs) -> anyhow::Result<()> {
    let path = args.path.trim_matches('/');
    let repo: Vec<&str> = path
        .split('/')
        .take_while(|segment| !segment.starts_with('.'))
        .collect();
    let key = repo.join("/");
    decode_key(&key).with_context(|| format!("{path:?} does not start with a repository key"))?;

    let client = routing_client(&args.cluster)?;
    let transport = client.transport_for_key(&key).await?;
    let request = http::Request::get(format!("/{path}"))
        .body(Bytes::new())
        .context("build request")?;
    let response = transport
        .round_trip(request)
        .await
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    let body = String::from_utf8_lossy(response.body());
    if !body.is_empty() {
        println!("{body}");
    }
    if let Some(location) = response
        .headers()
        .get(http::header::LOCATION)
        .and_then(|value| value.to_str().ok())
    {
        println!("{} -> {location}", response.status().as_u16());
    }
    Ok(())
}
