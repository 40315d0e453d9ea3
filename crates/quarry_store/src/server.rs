//! Public HTTP read API of a node.
//!
//! Every route hangs off a repository key: segments up to the first
//! `.`-prefixed marker name the repository, the marker names the operation.
//! Responses derived from a canonical commit id (40 lowercase hex) are
//! immutable and long-cached; everything reached through a mutable name
//! redirects to the canonical form with a short cache. Errors are never
//! cached and carry a body only in debug mode.

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Path as UrlPath, RawQuery, State};
use axum::http::header::{AUTHORIZATION, CACHE_CONTROL, CONTENT_TYPE, LOCATION, WWW_AUTHENTICATE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use quarry_vcs::{
    commit_id_is_canonical, commit_id_is_valid, compute_file_range, FileRange, FileWithRange,
    GetFileOptions, RemoteOpts, Repository, RevSpec, TreeEntryKind, VcsError,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::key::decode_key;
use crate::service::RepoService;
use crate::StoreError;

const LONG_CACHE: &str = "public, max-age=31536000";
const SHORT_CACHE: &str = "public, max-age=5";
const NO_CACHE: &str = "no-cache, max-age=0";

/// Header carrying the total commit count of a paged log response.
pub const TOTAL_COMMITS_HEADER: &str = "X-Total-Commits";

#[derive(Clone, Debug)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

#[derive(Clone, Debug, Default)]
pub struct ServerConfig {
    /// When set, error responses carry a JSON body naming the failure.
    pub debug: bool,
    /// When set, every request must present these credentials.
    pub auth: Option<BasicAuth>,
}

struct ServerState {
    service: Arc<RepoService>,
    debug: bool,
    auth: Option<BasicAuth>,
}

/// The node's public router.
pub fn router(service: Arc<RepoService>, config: ServerConfig) -> Router {
    let state = Arc::new(ServerState {
        service,
        debug: config.debug,
        auth: config.auth,
    });
    Router::new()
        .route("/", get(handle_root))
        .route("/*path", get(handle_get).post(handle_post))
        .with_state(state)
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: String::from("authentication required"),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let status = if err.is_not_exist() {
            StatusCode::NOT_FOUND
        } else {
            match &err {
                StoreError::InvalidKey(_) | StoreError::UnsupportedVcs(_) => {
                    StatusCode::BAD_REQUEST
                }
                StoreError::Vcs(
                    VcsError::InvalidRevSpec(_)
                    | VcsError::InvalidFileRange(_)
                    | VcsError::AmbiguousRevision(_),
                ) => StatusCode::BAD_REQUEST,
                StoreError::Vcs(VcsError::NotImplemented(_)) => StatusCode::NOT_IMPLEMENTED,
                _ => auth_status(&err.to_string()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            }
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<VcsError> for ApiError {
    fn from(err: VcsError) -> Self {
        StoreError::Vcs(err).into()
    }
}

/// Status implied by well-known credential failure messages from origins.
fn auth_status(message: &str) -> Option<StatusCode> {
    let message = message.to_ascii_lowercase();
    if message.contains("authentication required") {
        Some(StatusCode::UNAUTHORIZED)
    } else if message.contains("access denied") || message.contains("forbidden") {
        Some(StatusCode::FORBIDDEN)
    } else {
        None
    }
}

impl ServerState {
    fn authorize(&self, headers: &HeaderMap) -> Result<(), ApiError> {
        let Some(auth) = &self.auth else {
            return Ok(());
        };
        let expected = format!(
            "Basic {}",
            BASE64.encode(format!("{}:{}", auth.username, auth.password))
        );
        let presented = headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok());
        if presented == Some(expected.as_str()) {
            Ok(())
        } else {
            Err(ApiError::unauthorized())
        }
    }

    fn error_response(&self, err: ApiError) -> Response {
        let mut builder = Response::builder()
            .status(err.status)
            .header(CACHE_CONTROL, NO_CACHE);
        if err.status == StatusCode::UNAUTHORIZED {
            builder = builder.header(WWW_AUTHENTICATE, "Basic realm=\"repository store\"");
        }
        let body = if self.debug {
            builder = builder.header(CONTENT_TYPE, "application/json");
            Body::from(
                serde_json::json!({ "Error": err.message })
                    .to_string()
                    .into_bytes(),
            )
        } else {
            Body::empty()
        };
        builder.body(body).unwrap_or_default()
    }
}

fn json_response<T: Serialize>(status: StatusCode, cache: &str, value: &T) -> Response {
    match serde_json::to_vec(value) {
        Ok(body) => Response::builder()
            .status(status)
            .header(CONTENT_TYPE, "application/json")
            .header(CACHE_CONTROL, cache)
            .body(Body::from(body))
            .unwrap_or_default(),
        Err(_) => Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .header(CACHE_CONTROL, NO_CACHE)
            .body(Body::empty())
            .unwrap_or_default(),
    }
}

fn redirect(status: StatusCode, location: String, cache: &str) -> Response {
    Response::builder()
        .status(status)
        .header(LOCATION, location)
        .header(CACHE_CONTROL, cache)
        .body(Body::empty())
        .unwrap_or_default()
}

fn empty(status: StatusCode, cache: &str) -> Response {
    Response::builder()
        .status(status)
        .header(CACHE_CONTROL, cache)
        .body(Body::empty())
        .unwrap_or_default()
}

fn commit_url(repo: &str, commit_id: &str) -> String {
    format!("/{repo}/.commits/{commit_id}")
}

async fn handle_root(State(state): State<Arc<ServerState>>, headers: HeaderMap) -> Response {
    if let Err(err) = state.authorize(&headers) {
        return state.error_response(err);
    }
    match state.service.local_keys() {
        Ok(keys) => json_response(StatusCode::OK, NO_CACHE, &keys),
        Err(err) => state.error_response(err.into()),
    }
}

async fn handle_get(
    State(state): State<Arc<ServerState>>,
    UrlPath(path): UrlPath<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    if let Err(err) = state.authorize(&headers) {
        return state.error_response(err);
    }
    match dispatch_get(&state, &path, query.as_deref().unwrap_or("")).await {
        Ok(response) => response,
        Err(err) => state.error_response(err),
    }
}

async fn handle_post(
    State(state): State<Arc<ServerState>>,
    UrlPath(path): UrlPath<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(err) = state.authorize(&headers) {
        return state.error_response(err);
    }
    match dispatch_post(&state, &path, &body).await {
        Ok(response) => response,
        Err(err) => state.error_response(err),
    }
}

/// A parsed request path: the repository it names and the operation on it.
struct Route {
    key: String,
    vcs: String,
    clone_url: String,
    op: Op,
}

enum Op {
    Probe,
    Branches,
    Branch(String),
    Tags,
    Tag(String),
    Rev(String),
    Commit(String),
    Log,
    Tree { commit_id: String, path: String },
    Search(String),
    Blame(String),
    Diff { base: String, head: String },
    CrossRepoDiff { base: String, other: String, head: String },
    MergeBase(String, String),
    CrossRepoMergeBase { a: String, other: String, b: String },
}

fn parse_route(path: &str) -> Result<Route, ApiError> {
    let segments: Vec<&str> = path.split('/').filter(|seg| !seg.is_empty()).collect();
    let marker = segments.iter().position(|seg| seg.starts_with('.'));
    let (repo, rest) = match marker {
        Some(idx) => (&segments[..idx], &segments[idx..]),
        None => (&segments[..], &[][..]),
    };
    let key = repo.join("/");
    let (vcs, clone_url) =
        decode_key(&key).map_err(|err| ApiError::bad_request(err.to_string()))?;

    let op = match rest {
        [] => Op::Probe,
        [".branches"] => Op::Branches,
        [".branches", name @ ..] => Op::Branch(name.join("/")),
        [".tags"] => Op::Tags,
        [".tags", name @ ..] => Op::Tag(name.join("/")),
        [".revs", rev @ ..] if !rev.is_empty() => Op::Rev(rev.join("/")),
        [".commits"] => Op::Log,
        [".commits", id] => Op::Commit(commit_param(id)?),
        [".commits", id, "tree", tree_path @ ..] => Op::Tree {
            commit_id: commit_param(id)?,
            path: clean_tree_path(tree_path)?,
        },
        [".commits", id, "search"] => Op::Search(commit_param(id)?),
        [".blame", file @ ..] if !file.is_empty() => Op::Blame(file.join("/")),
        [".diff", spec @ ..] if !spec.is_empty() => {
            let spec = spec.join("/");
            let (base, head) = spec
                .split_once("..")
                .ok_or_else(|| ApiError::bad_request(format!("{spec:?}: expected base..head")))?;
            Op::Diff {
                base: commit_param(base)?,
                head: commit_param(head)?,
            }
        }
        [".cross-repo-diff", spec @ ..] if !spec.is_empty() => {
            let spec = spec.join("/");
            let (base, remainder) = spec
                .split_once("..")
                .ok_or_else(|| {
                    ApiError::bad_request(format!("{spec:?}: expected base..otherRepo:head"))
                })?;
            let (other, head) = remainder.rsplit_once(':').ok_or_else(|| {
                ApiError::bad_request(format!("{spec:?}: expected base..otherRepo:head"))
            })?;
            Op::CrossRepoDiff {
                base: commit_param(base)?,
                other: other.to_string(),
                head: commit_param(head)?,
            }
        }
        [".merge-base", a, b] => Op::MergeBase(commit_param(a)?, commit_param(b)?),
        [".cross-repo-merge-base", a, other @ .., b] if !other.is_empty() => {
            Op::CrossRepoMergeBase {
                a: commit_param(a)?,
                other: other.join("/"),
                b: commit_param(b)?,
            }
        }
        _ => {
            return Err(ApiError::bad_request(format!(
                "unrecognized operation {:?}",
                rest.first().copied().unwrap_or_default()
            )))
        }
    };
    Ok(Route {
        key,
        vcs,
        clone_url,
        op,
    })
}

/// Commit ids on the path must be nonempty lowercase hex.
fn commit_param(id: &str) -> Result<String, ApiError> {
    if commit_id_is_valid(id) {
        Ok(id.to_string())
    } else {
        Err(ApiError::bad_request(format!("invalid commit id {id:?}")))
    }
}

/// Empty and `.` segments collapse; `..` never names a tree entry.
fn clean_tree_path(segments: &[&str]) -> Result<String, ApiError> {
    let mut parts = Vec::new();
    for segment in segments {
        match *segment {
            "" | "." => {}
            ".." => return Err(ApiError::bad_request("invalid tree path")),
            part => parts.push(part),
        }
    }
    if parts.is_empty() {
        Ok(String::from("."))
    } else {
        Ok(parts.join("/"))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct CommitsQuery {
    head: String,
    n: u64,
    skip: u64,
}

#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase", default)]
struct FileQuery {
    start_line: i64,
    end_line: i64,
    start_byte: i64,
    end_byte: i64,
    expand_context_lines: i64,
    full_lines: bool,
    entire_file: bool,
}

impl FileQuery {
    fn options(&self) -> GetFileOptions {
        GetFileOptions {
            range: FileRange {
                start_line: self.start_line,
                end_line: self.end_line,
                start_byte: self.start_byte,
                end_byte: self.end_byte,
            },
            expand_context_lines: self.expand_context_lines,
            full_lines: self.full_lines,
            entire_file: self.entire_file,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct SearchQuery {
    query: String,
    n: i64,
    offset: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct BlameQuery {
    newest_commit: String,
    oldest_commit: String,
    start_line: i64,
    end_line: i64,
}

fn parse_query<T: Default + for<'de> Deserialize<'de>>(query: &str) -> Result<T, ApiError> {
    if query.is_empty() {
        return Ok(T::default());
    }
    serde_urlencoded::from_str(query)
        .map_err(|err| ApiError::bad_request(format!("invalid query: {err}")))
}

async fn dispatch_get(
    state: &Arc<ServerState>,
    path: &str,
    query: &str,
) -> Result<Response, ApiError> {
    let Route {
        key,
        vcs,
        clone_url,
        op,
    } = parse_route(path)?;
    match op {
        Op::Probe => {
            if state.service.present(&vcs, &clone_url)? {
                Ok(empty(StatusCode::OK, NO_CACHE))
            } else {
                Err(StoreError::NotExist(key).into())
            }
        }
        Op::Branches => {
            let branches = with_repo(state, &vcs, &clone_url, |repo| repo.branches()).await?;
            Ok(json_response(StatusCode::OK, SHORT_CACHE, &branches))
        }
        Op::Branch(name) => {
            let branch =
                with_repo(state, &vcs, &clone_url, move |repo| repo.branch(&name)).await?;
            Ok(redirect(
                StatusCode::FOUND,
                commit_url(&key, &branch.commit_id),
                SHORT_CACHE,
            ))
        }
        Op::Tags => {
            let tags = with_repo(state, &vcs, &clone_url, |repo| repo.tags()).await?;
            Ok(json_response(StatusCode::OK, SHORT_CACHE, &tags))
        }
        Op::Tag(name) => {
            let tag = with_repo(state, &vcs, &clone_url, move |repo| repo.tag(&name)).await?;
            Ok(redirect(
                StatusCode::FOUND,
                commit_url(&key, &tag.commit_id),
                SHORT_CACHE,
            ))
        }
        Op::Rev(rev) => {
            let spec = RevSpec::parse(&rev)?;
            let resolved = with_repo(state, &vcs, &clone_url, move |repo| {
                repo.resolve_revision(&spec)
            })
            .await?;
            let (status, cache) = if commit_id_is_canonical(&rev) {
                (StatusCode::MOVED_PERMANENTLY, LONG_CACHE)
            } else {
                (StatusCode::FOUND, SHORT_CACHE)
            };
            Ok(redirect(status, commit_url(&key, &resolved), cache))
        }
        Op::Commit(id) => {
            let requested = id.clone();
            let commit = with_repo(state, &vcs, &clone_url, move |repo| repo.commit(&id)).await?;
            if commit.id != requested {
                return Ok(redirect(
                    StatusCode::FOUND,
                    commit_url(&key, &commit.id),
                    SHORT_CACHE,
                ));
            }
            Ok(json_response(StatusCode::OK, LONG_CACHE, &commit))
        }
        Op::Log => {
            let params: CommitsQuery = parse_query(query)?;
            if !params.head.is_empty() && !commit_id_is_valid(&params.head) {
                return Err(ApiError::bad_request(format!(
                    "invalid commit id {:?}",
                    params.head
                )));
            }
            let opt = quarry_vcs::CommitsOptions {
                head: params.head,
                n: params.n,
                skip: params.skip,
            };
            let list = with_repo(state, &vcs, &clone_url, move |repo| repo.commits(&opt)).await?;
            let mut response = json_response(StatusCode::OK, SHORT_CACHE, &list.commits);
            if let Ok(total) = list.total.to_string().parse() {
                response.headers_mut().insert(TOTAL_COMMITS_HEADER, total);
            }
            Ok(response)
        }
        Op::Tree { commit_id, path } => {
            let params: FileQuery = parse_query(query)?;
            let cache = if commit_id_is_canonical(&commit_id) {
                LONG_CACHE
            } else {
                SHORT_CACHE
            };
            let id = commit_id.clone();
            let entry = with_repo(state, &vcs, &clone_url, move |repo| {
                repo.tree_entry(&id, &path)
            })
            .await?;
            if entry.kind != TreeEntryKind::File || params == FileQuery::default() {
                return Ok(json_response(StatusCode::OK, cache, &entry));
            }
            let data = entry.contents.clone().unwrap_or_default();
            let range = compute_file_range(data.as_bytes(), &params.options())?;
            let mut entry = entry;
            entry.contents = Some(
                String::from_utf8_lossy(
                    &data.as_bytes()[range.start_byte as usize..range.end_byte as usize],
                )
                .into_owned(),
            );
            Ok(json_response(
                StatusCode::OK,
                cache,
                &FileWithRange { entry, range },
            ))
        }
        Op::Search(commit_id) => {
            let params: SearchQuery = parse_query(query)?;
            let cache = if commit_id_is_canonical(&commit_id) {
                LONG_CACHE
            } else {
                SHORT_CACHE
            };
            let opt = quarry_vcs::SearchOptions {
                query: params.query,
                n: params.n,
                offset: params.offset,
            };
            let results = with_repo(state, &vcs, &clone_url, move |repo| {
                repo.search(&commit_id, &opt)
            })
            .await?;
            Ok(json_response(StatusCode::OK, cache, &results))
        }
        Op::Blame(path) => {
            let params: BlameQuery = parse_query(query)?;
            let opt = quarry_vcs::BlameOptions {
                newest_commit: params.newest_commit,
                oldest_commit: params.oldest_commit,
                start_line: params.start_line,
                end_line: params.end_line,
            };
            let hunks =
                with_repo(state, &vcs, &clone_url, move |repo| repo.blame(&path, &opt)).await?;
            Ok(json_response(StatusCode::OK, SHORT_CACHE, &hunks))
        }
        Op::Diff { base, head } => {
            let cache = if commit_id_is_canonical(&base) && commit_id_is_canonical(&head) {
                LONG_CACHE
            } else {
                SHORT_CACHE
            };
            let diff =
                with_repo(state, &vcs, &clone_url, move |repo| repo.diff(&base, &head)).await?;
            Ok(json_response(StatusCode::OK, cache, &diff))
        }
        Op::CrossRepoDiff { base, other, head } => {
            let cache = if commit_id_is_canonical(&base) && commit_id_is_canonical(&head) {
                LONG_CACHE
            } else {
                SHORT_CACHE
            };
            let (this, other) = open_pair(state, &vcs, &clone_url, &other).await?;
            let diff = run_blocking(move || {
                this.cross_repo_diff(&base, other.as_ref(), &head)
            })
            .await??;
            Ok(json_response(StatusCode::OK, cache, &diff))
        }
        Op::MergeBase(a, b) => {
            let (status, cache) = if commit_id_is_canonical(&a) && commit_id_is_canonical(&b) {
                (StatusCode::MOVED_PERMANENTLY, LONG_CACHE)
            } else {
                (StatusCode::FOUND, SHORT_CACHE)
            };
            let id =
                with_repo(state, &vcs, &clone_url, move |repo| repo.merge_base(&a, &b)).await?;
            Ok(redirect(status, commit_url(&key, &id), cache))
        }
        Op::CrossRepoMergeBase { a, other, b } => {
            let (status, cache) = if commit_id_is_canonical(&a) && commit_id_is_canonical(&b) {
                (StatusCode::MOVED_PERMANENTLY, LONG_CACHE)
            } else {
                (StatusCode::FOUND, SHORT_CACHE)
            };
            let (this, other) = open_pair(state, &vcs, &clone_url, &other).await?;
            let id = run_blocking(move || {
                this.cross_repo_merge_base(&a, other.as_ref(), &b)
            })
            .await??;
            Ok(redirect(status, commit_url(&key, &id), cache))
        }
    }
}

async fn dispatch_post(
    state: &Arc<ServerState>,
    path: &str,
    body: &[u8],
) -> Result<Response, ApiError> {
    let Route {
        key,
        vcs,
        clone_url,
        op,
    } = parse_route(path)?;
    if !matches!(op, Op::Probe) {
        return Err(ApiError {
            status: StatusCode::METHOD_NOT_ALLOWED,
            message: String::from("POST is only supported on the repository itself"),
        });
    }
    let opts: RemoteOpts = if body.is_empty() {
        RemoteOpts::default()
    } else {
        serde_json::from_slice(body)
            .map_err(|err| ApiError::bad_request(format!("invalid remote options: {err}")))?
    };
    let created = state.service.create_or_update(&vcs, &clone_url, &opts).await?;
    info!(key = %key, created, "repository create-or-update");
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok(empty(status, NO_CACHE))
}

/// Run a read against the routed repository on the blocking pool. The
/// handle rides along so its reference is held for the duration.
async fn with_repo<T, F>(
    state: &Arc<ServerState>,
    vcs: &str,
    clone_url: &str,
    work: F,
) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&dyn Repository) -> Result<T, VcsError> + Send + 'static,
{
    let handle = state.service.open(vcs, clone_url).await?;
    let result = run_blocking(move || work(handle.repo().as_ref())).await?;
    result.map_err(ApiError::from)
}

/// Open the routed repository and a second one named by `other_key`.
async fn open_pair(
    state: &Arc<ServerState>,
    vcs: &str,
    clone_url: &str,
    other_key: &str,
) -> Result<(Arc<dyn Repository>, Arc<dyn Repository>), ApiError> {
    let this = state.service.open(vcs, clone_url).await?;
    let (other_vcs, other_url) =
        decode_key(other_key).map_err(|err| ApiError::bad_request(err.to_string()))?;
    let other = state.service.open(&other_vcs, &other_url).await?;
    Ok((this.repo(), other.repo()))
}

async fn run_blocking<T: Send + 'static>(
    work: impl FnOnce() -> T + Send + 'static,
) -> Result<T, ApiError> {
    tokio::task::spawn_blocking(work).await.map_err(|err| ApiError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        message: format!("blocking task failed: {err}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use axum::http::Request;
    use quarry_vcs::mock::{MockBackend, MockCommit, MockRepo};
    use quarry_vcs::Backend;
    use tower::ServiceExt;

    const C1: &str = "1111111111111111111111111111111111111111";
    const C2: &str = "2222222222222222222222222222222222222222";
    const URL: &str = "http://code.example.com/team/repo";
    const KEY: &str = "git/http/code.example.com/team/repo";

    fn origin() -> MockRepo {
        let mut repo = MockRepo::single(C1, &[("README.md", "one\n"), ("src/lib.rs", "lib\n")]);
        repo.commits.push(MockCommit {
            id: C2.to_string(),
            message: String::from("second"),
            parents: vec![C1.to_string()],
            files: [
                (String::from("README.md"), String::from("one\ntwo\nthree\n")),
                (String::from("src/lib.rs"), String::from("lib\n")),
            ]
            .into(),
        });
        repo.branches.insert(String::from("trunk"), C2.to_string());
        repo.tags.insert(String::from("v1"), C1.to_string());
        repo
    }

    async fn harness(config: ServerConfig) -> (tempfile::TempDir, Arc<MockBackend>, Router) {
        let root = tempfile::tempdir().expect("tempdir");
        let backend = Arc::new(MockBackend::new());
        backend.put_origin(URL, origin());
        let service = Arc::new(
            RepoService::new(root.path()).with_backend(backend.clone() as Arc<dyn Backend>),
        );
        service
            .clone_repo("git", URL, &RemoteOpts::default())
            .await
            .expect("seed clone");
        (root, backend, router(service, config))
    }

    async fn get_path(router: &Router, path: &str) -> Response {
        router
            .clone()
            .oneshot(
                Request::get(path)
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response")
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&body).expect("json")
    }

    fn header<'a>(response: &'a Response, name: &str) -> &'a str {
        response
            .headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn probe_distinguishes_present_and_absent() {
        let (_root, _backend, router) = harness(ServerConfig::default()).await;
        let resp = get_path(&router, &format!("/{KEY}")).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = get_path(&router, "/git/http/code.example.com/team/missing").await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(header(&resp, "cache-control"), NO_CACHE);

        // Fewer than four segments cannot name a repository.
        let resp = get_path(&router, "/git/http/code.example.com").await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn post_clones_then_updates() {
        let (_root, backend, router) = harness(ServerConfig::default()).await;
        backend.put_origin(
            "http://code.example.com/team/fresh",
            MockRepo::single(C1, &[]),
        );
        let post = |path: &str| {
            Request::post(path)
                .body(Body::empty())
                .expect("request")
        };

        let resp = router
            .clone()
            .oneshot(post("/git/http/code.example.com/team/fresh"))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::CREATED);

        let resp = router
            .clone()
            .oneshot(post("/git/http/code.example.com/team/fresh"))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn post_maps_credential_failures() {
        let (_root, backend, router) = harness(ServerConfig::default()).await;
        let mut armed = MockRepo::single(C1, &[]);
        armed.update_error = Some(String::from("authentication required"));
        backend.put_origin("http://code.example.com/team/secret", armed);

        let resp = router
            .clone()
            .oneshot(
                Request::post("/git/http/code.example.com/team/secret")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn branches_list_and_redirect() {
        let (_root, _backend, router) = harness(ServerConfig::default()).await;
        let resp = get_path(&router, &format!("/{KEY}/.branches")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(header(&resp, "cache-control"), SHORT_CACHE);
        let branches = body_json(resp).await;
        assert_eq!(branches[0]["Name"], "trunk");
        assert_eq!(branches[0]["CommitId"], C2);

        let resp = get_path(&router, &format!("/{KEY}/.branches/trunk")).await;
        assert_eq!(resp.status(), StatusCode::FOUND);
        assert_eq!(header(&resp, "location"), format!("/{KEY}/.commits/{C2}"));
        assert_eq!(header(&resp, "cache-control"), SHORT_CACHE);
    }

    #[tokio::test]
    async fn tag_redirects_to_its_commit() {
        let (_root, _backend, router) = harness(ServerConfig::default()).await;
        let resp = get_path(&router, &format!("/{KEY}/.tags/v1")).await;
        assert_eq!(resp.status(), StatusCode::FOUND);
        assert_eq!(header(&resp, "location"), format!("/{KEY}/.commits/{C1}"));
    }

    #[tokio::test]
    async fn rev_redirect_cache_tracks_canonicality() {
        let (_root, _backend, router) = harness(ServerConfig::default()).await;

        let resp = get_path(&router, &format!("/{KEY}/.revs/{C2}")).await;
        assert_eq!(resp.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(header(&resp, "cache-control"), LONG_CACHE);
        assert_eq!(header(&resp, "location"), format!("/{KEY}/.commits/{C2}"));

        let resp = get_path(&router, &format!("/{KEY}/.revs/trunk")).await;
        assert_eq!(resp.status(), StatusCode::FOUND);
        assert_eq!(header(&resp, "cache-control"), SHORT_CACHE);
        assert_eq!(header(&resp, "location"), format!("/{KEY}/.commits/{C2}"));
    }

    #[tokio::test]
    async fn short_commit_id_redirects_to_canonical() {
        let (_root, _backend, router) = harness(ServerConfig::default()).await;
        let resp = get_path(&router, &format!("/{KEY}/.commits/2222")).await;
        assert_eq!(resp.status(), StatusCode::FOUND);
        assert_eq!(header(&resp, "location"), format!("/{KEY}/.commits/{C2}"));
        assert_eq!(header(&resp, "cache-control"), SHORT_CACHE);

        let resp = get_path(&router, &format!("/{KEY}/.commits/{C2}")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(header(&resp, "cache-control"), LONG_CACHE);
        let commit = body_json(resp).await;
        assert_eq!(commit["Id"], C2);
        assert_eq!(commit["Parents"][0], C1);
    }

    #[tokio::test]
    async fn malformed_commit_ids_are_rejected() {
        let (_root, _backend, router) = harness(ServerConfig::default()).await;
        for path in [
            format!("/{KEY}/.commits/XYZ"),
            format!("/{KEY}/.commits/22@2"),
            format!("/{KEY}/.merge-base/{C1}/nothex!"),
        ] {
            let resp = get_path(&router, &path).await;
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{path}");
        }
    }

    #[tokio::test]
    async fn commit_log_pages_and_reports_total() {
        let (_root, _backend, router) = harness(ServerConfig::default()).await;
        let resp = get_path(&router, &format!("/{KEY}/.commits?N=1")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(header(&resp, TOTAL_COMMITS_HEADER), "2");
        let page = body_json(resp).await;
        assert_eq!(page.as_array().expect("array").len(), 1);
        assert_eq!(page[0]["Id"], C2);

        let resp = get_path(&router, &format!("/{KEY}/.commits?N=1&Skip=1")).await;
        let page = body_json(resp).await;
        assert_eq!(page[0]["Id"], C1);
    }

    #[tokio::test]
    async fn tree_serves_directories_and_trimmed_files() {
        let (_root, _backend, router) = harness(ServerConfig::default()).await;
        let resp = get_path(&router, &format!("/{KEY}/.commits/{C2}/tree")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(header(&resp, "cache-control"), LONG_CACHE);
        let root = body_json(resp).await;
        assert_eq!(root["Type"], "dir");
        assert_eq!(root["Entries"][0]["Name"], "src");
        assert_eq!(root["Entries"][1]["Name"], "README.md");

        let resp =
            get_path(&router, &format!("/{KEY}/.commits/{C2}/tree/README.md")).await;
        let file = body_json(resp).await;
        assert_eq!(file["Contents"], "one\ntwo\nthree\n");

        let resp = get_path(
            &router,
            &format!("/{KEY}/.commits/{C2}/tree/README.md?StartLine=2&EndLine=2"),
        )
        .await;
        let file = body_json(resp).await;
        assert_eq!(file["Contents"], "two\n");
        assert_eq!(file["FileRange"]["StartByte"], 4);
        assert_eq!(file["FileRange"]["EndByte"], 8);

        let resp = get_path(
            &router,
            &format!("/{KEY}/.commits/{C2}/tree/README.md?StartLine=3&EndLine=2"),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn search_finds_matching_lines() {
        let (_root, _backend, router) = harness(ServerConfig::default()).await;
        let resp = get_path(
            &router,
            &format!("/{KEY}/.commits/{C2}/search?Query=two"),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let results = body_json(resp).await;
        assert_eq!(results[0]["File"], "README.md");
        assert_eq!(results[0]["StartLine"], 2);
    }

    #[tokio::test]
    async fn unimplemented_capability_maps_to_501() {
        let (_root, _backend, router) = harness(ServerConfig::default()).await;
        let resp = get_path(&router, &format!("/{KEY}/.blame/README.md")).await;
        assert_eq!(resp.status(), StatusCode::NOT_IMPLEMENTED);
    }

    #[tokio::test]
    async fn diff_between_commits() {
        let (_root, _backend, router) = harness(ServerConfig::default()).await;
        let resp = get_path(&router, &format!("/{KEY}/.diff/{C1}..{C2}")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(header(&resp, "cache-control"), LONG_CACHE);
        let diff = body_json(resp).await;
        assert!(diff["Raw"].as_str().expect("raw").contains("README.md"));

        let resp = get_path(&router, &format!("/{KEY}/.diff/{C1}")).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn merge_base_redirects_with_long_cache_when_canonical() {
        let (_root, _backend, router) = harness(ServerConfig::default()).await;
        let resp = get_path(&router, &format!("/{KEY}/.merge-base/{C1}/{C2}")).await;
        assert_eq!(resp.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(header(&resp, "cache-control"), LONG_CACHE);
        assert_eq!(header(&resp, "location"), format!("/{KEY}/.commits/{C1}"));
    }

    #[tokio::test]
    async fn unknown_operations_are_rejected() {
        let (_root, _backend, router) = harness(ServerConfig::default()).await;
        let resp = get_path(&router, &format!("/{KEY}/.bogus")).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn basic_auth_guards_every_route() {
        let config = ServerConfig {
            debug: false,
            auth: Some(BasicAuth {
                username: String::from("reader"),
                password: String::from("sesame"),
            }),
        };
        let (_root, _backend, router) = harness(config).await;

        let resp = get_path(&router, &format!("/{KEY}/.branches")).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert!(header(&resp, "www-authenticate").starts_with("Basic"));

        let credentials = BASE64.encode("reader:sesame");
        let resp = router
            .clone()
            .oneshot(
                Request::get(format!("/{KEY}/.branches"))
                    .header(AUTHORIZATION, format!("Basic {credentials}"))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn debug_mode_includes_error_bodies() {
        let (_root, _backend, plain) = harness(ServerConfig::default()).await;
        let resp = get_path(&plain, "/git/http/code.example.com/team/missing").await;
        let body = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
        assert!(body.is_empty());

        let (_root, _backend, debug) = harness(ServerConfig {
            debug: true,
            auth: None,
        })
        .await;
        let resp = get_path(&debug, "/git/http/code.example.com/team/missing").await;
        let err = body_json(resp).await;
        assert!(err["Error"]
            .as_str()
            .expect("message")
            .contains("not found"));
    }
}
