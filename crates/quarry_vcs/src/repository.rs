use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::types::{
    BlameOptions, Branch, Commit, CommitList, CommitsOptions, Diff, Hunk, SearchOptions,
    SearchResult, Tag, TreeEntry,
};
use crate::{RevSpec, VcsError};

/// Credentials and knobs forwarded to the origin during clone and update.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RemoteOpts {
    pub username: Option<String>,
    pub password: Option<String>,
    pub ssh_private_key: Option<String>,
}

/// Read operations over one local repository clone.
///
/// All methods are blocking; callers on async executors are expected to move
/// them onto a blocking pool. Capabilities a backend does not provide keep
/// the default implementation, which the HTTP surface reports as 501.
pub trait Repository: Send + Sync {
    /// The on-disk clone backing this handle.
    fn clone_dir(&self) -> &Path;

    /// Canonical commit id for a revision specifier.
    fn resolve_revision(&self, spec: &RevSpec) -> Result<String, VcsError>;

    fn branches(&self) -> Result<Vec<Branch>, VcsError>;

    fn branch(&self, name: &str) -> Result<Branch, VcsError> {
        self.branches()?
            .into_iter()
            .find(|branch| branch.name == name)
            .ok_or_else(|| VcsError::BranchNotFound(name.to_string()))
    }

    fn tags(&self) -> Result<Vec<Tag>, VcsError>;

    fn tag(&self, name: &str) -> Result<Tag, VcsError> {
        self.tags()?
            .into_iter()
            .find(|tag| tag.name == name)
            .ok_or_else(|| VcsError::TagNotFound(name.to_string()))
    }

    /// Commit for a full or abbreviated id.
    fn commit(&self, id: &str) -> Result<Commit, VcsError>;

    /// A page of the commit log plus the total count.
    fn commits(&self, opt: &CommitsOptions) -> Result<CommitList, VcsError>;

    /// The tree entry at (commit, path). `.` names the root directory.
    fn tree_entry(&self, commit_id: &str, path: &str) -> Result<TreeEntry, VcsError>;

    fn diff(&self, _base: &str, _head: &str) -> Result<Diff, VcsError> {
        Err(VcsError::NotImplemented("diff"))
    }

    /// Diff against a commit that lives in another local repository.
    fn cross_repo_diff(
        &self,
        _base: &str,
        _other: &dyn Repository,
        _head: &str,
    ) -> Result<Diff, VcsError> {
        Err(VcsError::NotImplemented("cross-repo-diff"))
    }

    fn merge_base(&self, _a: &str, _b: &str) -> Result<String, VcsError> {
        Err(VcsError::NotImplemented("merge-base"))
    }

    fn cross_repo_merge_base(
        &self,
        _a: &str,
        _other: &dyn Repository,
        _b: &str,
    ) -> Result<String, VcsError> {
        Err(VcsError::NotImplemented("cross-repo-merge-base"))
    }

    fn blame(&self, _path: &str, _opt: &BlameOptions) -> Result<Vec<Hunk>, VcsError> {
        Err(VcsError::NotImplemented("blame"))
    }

    fn search(&self, _commit_id: &str, _opt: &SearchOptions) -> Result<Vec<SearchResult>, VcsError> {
        Err(VcsError::NotImplemented("search"))
    }
}

/// A VCS engine: opens, clones and updates local mirrors.
pub trait Backend: Send + Sync + 'static {
    /// Engine name as it appears in repository keys, e.g. `git`.
    fn vcs_type(&self) -> &'static str;

    /// Open an existing clone directory.
    fn open(&self, clone_dir: &Path) -> Result<Arc<dyn Repository>, VcsError>;

    /// Whether `dir` holds a clone this engine can open. Used when walking
    /// the storage root; must not be expensive.
    fn is_clone_dir(&self, dir: &Path) -> bool {
        self.open(dir).is_ok()
    }

    /// Mirror `url` into `dest`. The parent of `dest` exists; `dest` itself
    /// does not. Callers provide atomicity by cloning into a temporary
    /// sibling and renaming.
    fn clone_repo(&self, url: &str, dest: &Path, opt: &RemoteOpts) -> Result<(), VcsError>;

    /// Fetch from origin, converging the local mirror on upstream. Must be
    /// idempotent.
    fn update(&self, clone_dir: &Path, opt: &RemoteOpts) -> Result<(), VcsError>;
}
