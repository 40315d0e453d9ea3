//! Node-local repository service: shared handles and atomic clones.
//!
//! One handle per open (vcsType, clone directory) is shared across
//! concurrent requests by reference count under a single map lock. Clones
//! are serialized per (vcsType, clone directory) through a registry of
//! mutexes and performed into a sibling temporary directory that is renamed
//! into place, so a clone directory either does not exist or is complete.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use quarry_vcs::{Backend, RemoteOpts, Repository};
use rand::Rng;
use tracing::{debug, info, warn};

use crate::key::{decode_key, encode_key};
use crate::StoreError;

type HandleKey = (String, PathBuf);

struct HandleEntry {
    repo: Arc<dyn Repository>,
    refs: usize,
}

pub struct RepoService {
    storage_root: PathBuf,
    backends: HashMap<&'static str, Arc<dyn Backend>>,
    handles: StdMutex<HashMap<HandleKey, HandleEntry>>,
    clone_locks: StdMutex<HashMap<HandleKey, Arc<tokio::sync::Mutex<()>>>>,
}

/// A shared reference to an open repository. Dropping the handle releases
/// its reference; the underlying repository is closed when the last handle
/// goes away.
pub struct RepoHandle {
    service: Arc<RepoService>,
    vcs: String,
    dir: PathBuf,
    repo: Arc<dyn Repository>,
}

impl RepoHandle {
    pub fn repo(&self) -> Arc<dyn Repository> {
        self.repo.clone()
    }
}

impl std::fmt::Debug for RepoHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepoHandle")
            .field("vcs", &self.vcs)
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl Drop for RepoHandle {
    fn drop(&mut self) {
        self.service.release(&self.vcs, &self.dir);
    }
}

impl RepoService {
    pub fn new(storage_root: impl Into<PathBuf>) -> Self {
        Self {
            storage_root: storage_root.into(),
            backends: HashMap::new(),
            handles: StdMutex::new(HashMap::new()),
            clone_locks: StdMutex::new(HashMap::new()),
        }
    }

    pub fn with_backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backends.insert(backend.vcs_type(), backend);
        self
    }

    pub fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    fn backend(&self, vcs: &str) -> Result<Arc<dyn Backend>, StoreError> {
        self.backends
            .get(vcs)
            .cloned()
            .ok_or_else(|| StoreError::UnsupportedVcs(vcs.to_string()))
    }

    /// Clone directory for (vcs, cloneURL), which is the encoded key
    /// relative to the storage root.
    pub fn clone_dir(&self, vcs: &str, clone_url: &str) -> Result<PathBuf, StoreError> {
        Ok(self.storage_root.join(encode_key(vcs, clone_url)?))
    }

    /// Whether the repository is present in local storage.
    pub fn present(&self, vcs: &str, clone_url: &str) -> Result<bool, StoreError> {
        Ok(self.clone_dir(vcs, clone_url)?.is_dir())
    }

    /// Open the local clone, sharing any handle already open for it. Fails
    /// with a not-exist error when the clone directory is missing.
    pub async fn open(
        self: &Arc<Self>,
        vcs: &str,
        clone_url: &str,
    ) -> Result<RepoHandle, StoreError> {
        let backend = self.backend(vcs)?;
        let key = encode_key(vcs, clone_url)?;
        let dir = self.storage_root.join(&key);
        let handle_key = (vcs.to_string(), dir.clone());

        if let Some(repo) = self.acquire_existing(&handle_key) {
            return Ok(self.handle(vcs, dir, repo));
        }
        if !dir.is_dir() {
            return Err(StoreError::NotExist(key));
        }

        let opened = {
            let backend = backend.clone();
            let dir = dir.clone();
            run_blocking(move || backend.open(&dir)).await??
        };
        let repo = {
            let mut handles = lock(&self.handles);
            match handles.get_mut(&handle_key) {
                // A concurrent open won the race; share its handle.
                Some(entry) => {
                    entry.refs += 1;
                    entry.repo.clone()
                }
                None => {
                    handles.insert(
                        handle_key,
                        HandleEntry {
                            repo: opened.clone(),
                            refs: 1,
                        },
                    );
                    opened
                }
            }
        };
        Ok(self.handle(vcs, dir, repo))
    }

    /// Clone the repository, or open it when the clone directory already
    /// exists. Concurrent clones of the same key serialize on a per-key
    /// mutex; the loser of the race observes the winner's clone.
    pub async fn clone_repo(
        self: &Arc<Self>,
        vcs: &str,
        clone_url: &str,
        opts: &RemoteOpts,
    ) -> Result<RepoHandle, StoreError> {
        let backend = self.backend(vcs)?;
        let key = encode_key(vcs, clone_url)?;
        let dir = self.storage_root.join(&key);
        if dir.is_dir() {
            return self.open(vcs, clone_url).await;
        }

        let clone_lock = self.clone_lock(vcs, &dir);
        let _guard = clone_lock.lock().await;
        if dir.is_dir() {
            return self.open(vcs, clone_url).await;
        }

        let parent = dir
            .parent()
            .ok_or_else(|| StoreError::InvalidKey(key.clone()))?;
        std::fs::create_dir_all(parent).map_err(|err| StoreError::io(parent.display(), err))?;
        let basename = dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| String::from("clone"));
        let temp = parent.join(format!(
            "_tmp_{basename}-{:08x}",
            rand::thread_rng().gen::<u32>()
        ));

        info!(key = %key, "cloning repository");
        let cloned = {
            let backend = backend.clone();
            let url = clone_url.to_string();
            let temp = temp.clone();
            let opts = opts.clone();
            run_blocking(move || backend.clone_repo(&url, &temp, &opts)).await?
        };
        if let Err(err) = cloned {
            // Leave nothing behind: a partial temp directory must never be
            // observable as a clone.
            remove_temp(&temp);
            return Err(err.into());
        }
        if let Err(err) = std::fs::rename(&temp, &dir) {
            remove_temp(&temp);
            return Err(StoreError::io(dir.display(), err));
        }
        drop(_guard);
        self.open(vcs, clone_url).await
    }

    /// Fetch from origin, converging the local clone on upstream.
    pub async fn update(
        &self,
        vcs: &str,
        clone_url: &str,
        opts: &RemoteOpts,
    ) -> Result<(), StoreError> {
        let backend = self.backend(vcs)?;
        let key = encode_key(vcs, clone_url)?;
        let dir = self.storage_root.join(&key);
        if !dir.is_dir() {
            return Err(StoreError::NotExist(key));
        }
        let opts = opts.clone();
        run_blocking(move || backend.update(&dir, &opts)).await??;
        Ok(())
    }

    /// Clone when absent, update when present. Returns whether a clone was
    /// created.
    pub async fn create_or_update(
        self: &Arc<Self>,
        vcs: &str,
        clone_url: &str,
        opts: &RemoteOpts,
    ) -> Result<bool, StoreError> {
        if self.present(vcs, clone_url)? {
            self.update(vcs, clone_url, opts).await?;
            Ok(false)
        } else {
            self.clone_repo(vcs, clone_url, opts).await?;
            Ok(true)
        }
    }

    /// Whether `key` decodes and its clone directory exists.
    pub fn has_key(&self, key: &str) -> bool {
        decode_key(key).is_ok() && self.storage_root.join(key.trim_matches('/')).is_dir()
    }

    /// Keys of every repository present under the storage root.
    pub fn local_keys(&self) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        if !self.storage_root.is_dir() {
            return Ok(keys);
        }
        for (vcs, backend) in &self.backends {
            let root = self.storage_root.join(vcs);
            if root.is_dir() {
                walk_clones(&self.storage_root, &root, backend.as_ref(), &mut keys)?;
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn acquire_existing(&self, handle_key: &HandleKey) -> Option<Arc<dyn Repository>> {
        let mut handles = lock(&self.handles);
        let entry = handles.get_mut(handle_key)?;
        entry.refs += 1;
        Some(entry.repo.clone())
    }

    fn handle(self: &Arc<Self>, vcs: &str, dir: PathBuf, repo: Arc<dyn Repository>) -> RepoHandle {
        RepoHandle {
            service: self.clone(),
            vcs: vcs.to_string(),
            dir,
            repo,
        }
    }

    fn release(&self, vcs: &str, dir: &Path) {
        let mut handles = lock(&self.handles);
        let handle_key = (vcs.to_string(), dir.to_path_buf());
        let Some(entry) = handles.get_mut(&handle_key) else {
            return;
        };
        entry.refs -= 1;
        if entry.refs == 0 {
            debug!(dir = %dir.display(), "closing repository handle");
            handles.remove(&handle_key);
        }
    }

    fn clone_lock(&self, vcs: &str, dir: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = lock(&self.clone_locks);
        locks
            .entry((vcs.to_string(), dir.to_path_buf()))
            .or_default()
            .clone()
    }

    #[cfg(test)]
    fn open_handle_count(&self) -> usize {
        lock(&self.handles).len()
    }
}

fn walk_clones(
    storage_root: &Path,
    dir: &Path,
    backend: &dyn Backend,
    keys: &mut Vec<String>,
) -> Result<(), StoreError> {
    let entries = std::fs::read_dir(dir).map_err(|err| StoreError::io(dir.display(), err))?;
    for entry in entries {
        let entry = entry.map_err(|err| StoreError::io(dir.display(), err))?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name();
        if name.to_string_lossy().starts_with("_tmp_") {
            continue;
        }
        if backend.is_clone_dir(&path) {
            let Ok(rel) = path.strip_prefix(storage_root) else {
                continue;
            };
            let key: Vec<String> = rel
                .components()
                .map(|component| component.as_os_str().to_string_lossy().into_owned())
                .collect();
            let key = key.join("/");
            if decode_key(&key).is_ok() {
                keys.push(key);
            } else {
                warn!(dir = %path.display(), "clone directory does not decode as a key");
            }
            continue;
        }
        walk_clones(storage_root, &path, backend, keys)?;
    }
    Ok(())
}

fn remove_temp(temp: &Path) {
    if let Err(err) = std::fs::remove_dir_all(temp) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(dir = %temp.display(), error = ?err, "removing partial clone failed");
        }
    }
}

async fn run_blocking<T: Send + 'static>(
    work: impl FnOnce() -> T + Send + 'static,
) -> Result<T, StoreError> {
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| StoreError::Internal(format!("blocking task failed: {err}")))
}

fn lock<'a, T>(mutex: &'a StdMutex<T>) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
