//! Git engine over libgit2.
//!
//! Clones are bare mirrors (`+refs/*:refs/*`), so branch and tag refs track
//! the origin directly and `update` is a plain fetch with pruning.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::types::{line_spans, sort_tree_entries};
use crate::{
    Backend, BlameOptions, Branch, Commit, CommitList, CommitsOptions, Diff, Hunk, RemoteOpts,
    Repository, RevSpec, SearchOptions, SearchResult, Signature, Tag, TreeEntry, TreeEntryKind,
    VcsError, NULL_COMMIT_ID,
};

const MIRROR_REFSPEC: &str = "+refs/*:refs/*";
// Commits fetched for cross-repository operations land in their own ref
// namespace so they never show up as branches or tags.
const CROSS_FETCH_REFSPEC: &str = "+refs/*:refs/cross-fetch/*";
const FILEMODE_SYMLINK: i32 = 0o120000;

#[derive(Clone, Copy, Debug, Default)]
pub struct GitBackend;

impl Backend for GitBackend {
    fn vcs_type(&self) -> &'static str {
        "git"
    }

    fn open(&self, clone_dir: &Path) -> Result<Arc<dyn Repository>, VcsError> {
        let repo = git2::Repository::open(clone_dir)?;
        Ok(Arc::new(GitRepository {
            repo: Mutex::new(repo),
            dir: clone_dir.to_path_buf(),
        }))
    }

    fn is_clone_dir(&self, dir: &Path) -> bool {
        // Bare mirrors keep HEAD at the top level.
        dir.join("HEAD").is_file()
    }

    fn clone_repo(&self, url: &str, dest: &Path, opt: &RemoteOpts) -> Result<(), VcsError> {
        debug!(url, dest = %dest.display(), "cloning bare mirror");
        let mut fetch_opts = git2::FetchOptions::new();
        fetch_opts.remote_callbacks(remote_callbacks(opt));
        fetch_opts.download_tags(git2::AutotagOption::All);
        let mut builder = git2::build::RepoBuilder::new();
        builder.bare(true);
        builder.fetch_options(fetch_opts);
        builder.remote_create(|repo, name, url| repo.remote_with_fetch(name, url, MIRROR_REFSPEC));
        builder.clone(url, dest)?;
        Ok(())
    }

    fn update(&self, clone_dir: &Path, opt: &RemoteOpts) -> Result<(), VcsError> {
        debug!(dir = %clone_dir.display(), "fetching from origin");
        let repo = git2::Repository::open(clone_dir)?;
        let mut remote = repo
            .find_remote("origin")
            .map_err(|_| VcsError::Other(format!("{} has no origin remote", clone_dir.display())))?;
        let mut fetch_opts = git2::FetchOptions::new();
        fetch_opts.remote_callbacks(remote_callbacks(opt));
        fetch_opts.download_tags(git2::AutotagOption::All);
        fetch_opts.prune(git2::FetchPrune::On);
        remote.fetch(&[] as &[&str], Some(&mut fetch_opts), None)?;
        Ok(())
    }
}

pub struct GitRepository {
    // git2 repositories are not Sync; every operation takes the lock.
    repo: Mutex<git2::Repository>,
    dir: PathBuf,
}

impl GitRepository {
    fn lock(&self) -> MutexGuard<'_, git2::Repository> {
        self.repo.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Repository for GitRepository {
    fn clone_dir(&self) -> &Path {
        &self.dir
    }

    fn resolve_revision(&self, spec: &RevSpec) -> Result<String, VcsError> {
        let repo = self.lock();
        match spec {
            RevSpec::Tip => tip_commit(&repo).map(|oid| oid.to_string()),
            RevSpec::Null => Ok(NULL_COMMIT_ID.to_string()),
            RevSpec::FileRevision(number) => {
                let tip = tip_commit(&repo)?;
                let mut walk = repo.revwalk()?;
                walk.push(tip)?;
                walk.set_sorting(git2::Sort::TOPOLOGICAL | git2::Sort::REVERSE)?;
                match walk.nth(*number as usize) {
                    Some(Ok(oid)) => Ok(oid.to_string()),
                    Some(Err(err)) => Err(err.into()),
                    None => Err(VcsError::RevisionNotFound(number.to_string())),
                }
            }
            RevSpec::CommitId(id) => match revparse_commit(&repo, id) {
                Ok(oid) => Ok(oid.to_string()),
                // Hex-shaped branch and tag names still resolve.
                Err(VcsError::CommitNotFound(_)) => resolve_name(&repo, id),
                Err(err) => Err(err),
            },
            RevSpec::Name(name) => resolve_name(&repo, name),
        }
    }

    fn branches(&self) -> Result<Vec<Branch>, VcsError> {
        let repo = self.lock();
        let mut out = Vec::new();
        for branch in repo.branches(Some(git2::BranchType::Local))? {
            let (branch, _) = branch?;
            let Some(name) = branch.name()?.map(str::to_string) else {
                continue;
            };
            let Ok(commit) = branch.get().peel_to_commit() else {
                continue;
            };
            out.push(Branch {
                name,
                commit_id: commit.id().to_string(),
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    fn tags(&self) -> Result<Vec<Tag>, VcsError> {
        let repo = self.lock();
        let mut out = Vec::new();
        for name in repo.tag_names(None)?.iter().flatten() {
            let Ok(reference) = repo.find_reference(&format!("refs/tags/{name}")) else {
                continue;
            };
            let Ok(commit) = reference.peel_to_commit() else {
                continue;
            };
            out.push(Tag {
                name: name.to_string(),
                commit_id: commit.id().to_string(),
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    fn commit(&self, id: &str) -> Result<Commit, VcsError> {
        let repo = self.lock();
        let oid = revparse_commit(&repo, id)?;
        let commit = repo.find_commit(oid)?;
        Ok(convert_commit(&commit))
    }

    fn commits(&self, opt: &CommitsOptions) -> Result<CommitList, VcsError> {
        let repo = self.lock();
        let head = if opt.head.is_empty() {
            tip_commit(&repo)?
        } else {
            revparse_commit(&repo, &opt.head)?
        };
        let mut walk = repo.revwalk()?;
        walk.push(head)?;
        let ids = walk.collect::<Result<Vec<_>, _>>()?;
        let total = ids.len() as u64;
        let page = ids.into_iter().skip(opt.skip as usize);
        let page: Vec<git2::Oid> = if opt.n > 0 {
            page.take(opt.n as usize).collect()
        } else {
            page.collect()
        };
        let mut commits = Vec::with_capacity(page.len());
        for oid in page {
            commits.push(convert_commit(&repo.find_commit(oid)?));
        }
        Ok(CommitList { commits, total })
    }

    fn tree_entry(&self, commit_id: &str, path: &str) -> Result<TreeEntry, VcsError> {
        let repo = self.lock();
        let oid = revparse_commit(&repo, commit_id)?;
        let commit = repo.find_commit(oid)?;
        let tree = commit.tree()?;
        let mod_time = commit.time().seconds();

        if path.is_empty() || path == "." {
            return Ok(TreeEntry {
                name: String::from("."),
                kind: TreeEntryKind::Dir,
                size: 0,
                mod_time,
                contents: None,
                entries: list_tree(&repo, &tree, mod_time)?,
            });
        }

        let entry = tree
            .get_path(Path::new(path))
            .map_err(|_| VcsError::FileNotFound(path.to_string()))?;
        let name = entry
            .name()
            .map(str::to_string)
            .unwrap_or_else(|| path.to_string());
        match entry.kind() {
            Some(git2::ObjectType::Tree) => {
                let subtree = repo.find_tree(entry.id())?;
                Ok(TreeEntry {
                    name,
                    kind: TreeEntryKind::Dir,
                    size: 0,
                    mod_time,
                    contents: None,
                    entries: list_tree(&repo, &subtree, mod_time)?,
                })
            }
            Some(git2::ObjectType::Blob) => {
                let blob = repo.find_blob(entry.id())?;
                let kind = if entry.filemode() == FILEMODE_SYMLINK {
                    TreeEntryKind::Symlink
                } else {
                    TreeEntryKind::File
                };
                Ok(TreeEntry {
                    name,
                    kind,
                    size: blob.size() as i64,
                    mod_time,
                    contents: Some(String::from_utf8_lossy(blob.content()).into_owned()),
                    entries: Vec::new(),
                })
            }
            _ => Err(VcsError::FileNotFound(path.to_string())),
        }
    }

    fn diff(&self, base: &str, head: &str) -> Result<Diff, VcsError> {
        let repo = self.lock();
        diff_in(&repo, base, head)
    }

    fn cross_repo_diff(
        &self,
        base: &str,
        other: &dyn Repository,
        head: &str,
    ) -> Result<Diff, VcsError> {
        let repo = self.lock();
        fetch_commit_from(&repo, other.clone_dir(), head)?;
        diff_in(&repo, base, head)
    }

    fn merge_base(&self, a: &str, b: &str) -> Result<String, VcsError> {
        let repo = self.lock();
        merge_base_in(&repo, a, b)
    }

    fn cross_repo_merge_base(
        &self,
        a: &str,
        other: &dyn Repository,
        b: &str,
    ) -> Result<String, VcsError> {
        let repo = self.lock();
        fetch_commit_from(&repo, other.clone_dir(), b)?;
        merge_base_in(&repo, a, b)
    }

    fn blame(&self, path: &str, opt: &BlameOptions) -> Result<Vec<Hunk>, VcsError> {
        let repo = self.lock();
        let newest = if opt.newest_commit.is_empty() {
            tip_commit(&repo)?
        } else {
            revparse_commit(&repo, &opt.newest_commit)?
        };

        let mut blame_opt = git2::BlameOptions::new();
        blame_opt.newest_commit(newest);
        if !opt.oldest_commit.is_empty() {
            blame_opt.oldest_commit(revparse_commit(&repo, &opt.oldest_commit)?);
        }
        if opt.start_line > 0 {
            blame_opt.min_line(opt.start_line as usize);
        }
        if opt.end_line > 0 {
            blame_opt.max_line(opt.end_line as usize);
        }
        let blame = repo
            .blame_file(Path::new(path), Some(&mut blame_opt))
            .map_err(|err| match err.code() {
                git2::ErrorCode::NotFound => VcsError::FileNotFound(path.to_string()),
                _ => VcsError::Git(err),
            })?;

        // Byte offsets come from the file as it exists at the newest commit.
        let tree = repo.find_commit(newest)?.tree()?;
        let entry = tree
            .get_path(Path::new(path))
            .map_err(|_| VcsError::FileNotFound(path.to_string()))?;
        let blob = repo.find_blob(entry.id())?;
        let spans = line_spans(blob.content());

        let mut hunks = Vec::new();
        for hunk in blame.iter() {
            let start_line = hunk.final_start_line() as i64;
            let end_line = start_line + hunk.lines_in_hunk() as i64 - 1;
            let start_byte = spans
                .get((start_line - 1) as usize)
                .map(|span| span.0 as i64)
                .unwrap_or(0);
            let end_byte = spans
                .get((end_line - 1) as usize)
                .map(|span| span.1 as i64)
                .unwrap_or(blob.size() as i64);
            hunks.push(Hunk {
                start_line,
                end_line,
                start_byte,
                end_byte,
                commit_id: hunk.final_commit_id().to_string(),
                author: convert_signature(&hunk.final_signature()),
            });
        }
        Ok(hunks)
    }

    fn search(&self, commit_id: &str, opt: &SearchOptions) -> Result<Vec<SearchResult>, VcsError> {
        if opt.query.is_empty() {
            return Ok(Vec::new());
        }
        let repo = self.lock();
        let oid = revparse_commit(&repo, commit_id)?;
        let tree = repo.find_commit(oid)?.tree()?;

        let mut results = Vec::new();
        let mut to_skip = opt.offset.max(0);
        let limit = if opt.n > 0 { opt.n as usize } else { usize::MAX };
        tree.walk(git2::TreeWalkMode::PreOrder, |root, entry| {
            if entry.kind() != Some(git2::ObjectType::Blob) {
                return git2::TreeWalkResult::Ok;
            }
            let Ok(blob) = repo.find_blob(entry.id()) else {
                return git2::TreeWalkResult::Ok;
            };
            if blob.is_binary() {
                return git2::TreeWalkResult::Ok;
            }
            let file = format!("{root}{}", entry.name().unwrap_or_default());
            let contents = String::from_utf8_lossy(blob.content()).into_owned();
            for (idx, line) in contents.lines().enumerate() {
                if !line.contains(&opt.query) {
                    continue;
                }
                if to_skip > 0 {
                    to_skip -= 1;
                    continue;
                }
                let line_number = idx as i64 + 1;
                results.push(SearchResult {
                    file: file.clone(),
                    start_line: line_number,
                    end_line: line_number,
                    matched: line.to_string(),
                });
                if results.len() >= limit {
                    return git2::TreeWalkResult::Abort;
                }
            }
            git2::TreeWalkResult::Ok
        })?;
        Ok(results)
    }
}

fn tip_commit(repo: &git2::Repository) -> Result<git2::Oid, VcsError> {
    let head = repo.head().map_err(|err| match err.code() {
        git2::ErrorCode::UnbornBranch | git2::ErrorCode::NotFound => {
            VcsError::RevisionNotFound(String::from("tip"))
        }
        _ => VcsError::Git(err),
    })?;
    let commit = head
        .peel_to_commit()
        .map_err(|_| VcsError::RevisionNotFound(String::from("tip")))?;
    Ok(commit.id())
}

fn revparse_commit(repo: &git2::Repository, spec: &str) -> Result<git2::Oid, VcsError> {
    match repo.revparse_single(spec) {
        Ok(object) => object
            .peel_to_commit()
            .map(|commit| commit.id())
            .map_err(|_| VcsError::CommitNotFound(spec.to_string())),
        Err(err) => match err.code() {
            git2::ErrorCode::Ambiguous => Err(VcsError::AmbiguousRevision(spec.to_string())),
            git2::ErrorCode::NotFound | git2::ErrorCode::InvalidSpec => {
                Err(VcsError::CommitNotFound(spec.to_string()))
            }
            _ => Err(err.into()),
        },
    }
}

fn resolve_name(repo: &git2::Repository, name: &str) -> Result<String, VcsError> {
    if let Ok(branch) = repo.find_branch(name, git2::BranchType::Local) {
        if let Ok(commit) = branch.get().peel_to_commit() {
            return Ok(commit.id().to_string());
        }
    }
    if let Ok(reference) = repo.find_reference(&format!("refs/tags/{name}")) {
        if let Ok(commit) = reference.peel_to_commit() {
            return Ok(commit.id().to_string());
        }
    }
    Err(VcsError::RevisionNotFound(name.to_string()))
}

fn list_tree(
    repo: &git2::Repository,
    tree: &git2::Tree<'_>,
    mod_time: i64,
) -> Result<Vec<TreeEntry>, VcsError> {
    let mut out = Vec::with_capacity(tree.len());
    for entry in tree.iter() {
        let Some(name) = entry.name().map(str::to_string) else {
            continue;
        };
        let (kind, size) = match entry.kind() {
            Some(git2::ObjectType::Tree) => (TreeEntryKind::Dir, 0),
            Some(git2::ObjectType::Blob) => {
                let size = repo
                    .find_blob(entry.id())
                    .map(|blob| blob.size() as i64)
                    .unwrap_or(0);
                let kind = if entry.filemode() == FILEMODE_SYMLINK {
                    TreeEntryKind::Symlink
                } else {
                    TreeEntryKind::File
                };
                (kind, size)
            }
            _ => continue,
        };
        out.push(TreeEntry {
            name,
            kind,
            size,
            mod_time,
            contents: None,
            entries: Vec::new(),
        });
    }
    sort_tree_entries(&mut out);
    Ok(out)
}

fn diff_in(repo: &git2::Repository, base: &str, head: &str) -> Result<Diff, VcsError> {
    let base_tree = repo.find_commit(revparse_commit(repo, base)?)?.tree()?;
    let head_tree = repo.find_commit(revparse_commit(repo, head)?)?.tree()?;
    let diff = repo.diff_tree_to_tree(Some(&base_tree), Some(&head_tree), None)?;
    let mut raw = Vec::new();
    diff.print(git2::DiffFormat::Patch, |_, _, line| {
        match line.origin() {
            '+' | '-' | ' ' => raw.push(line.origin() as u8),
            _ => {}
        }
        raw.extend_from_slice(line.content());
        true
    })?;
    Ok(Diff {
        raw: String::from_utf8_lossy(&raw).into_owned(),
    })
}

fn merge_base_in(repo: &git2::Repository, a: &str, b: &str) -> Result<String, VcsError> {
    let a_oid = revparse_commit(repo, a)?;
    let b_oid = revparse_commit(repo, b)?;
    repo.merge_base(a_oid, b_oid)
        .map(|oid| oid.to_string())
        .map_err(|err| match err.code() {
            git2::ErrorCode::NotFound => {
                VcsError::RevisionNotFound(format!("merge base of {a} and {b}"))
            }
            _ => VcsError::Git(err),
        })
}

/// Make `commit_id` from another local clone available here, fetching its
/// refs into a private namespace when the object is missing.
fn fetch_commit_from(
    repo: &git2::Repository,
    other_dir: &Path,
    commit_id: &str,
) -> Result<(), VcsError> {
    if let Ok(oid) = git2::Oid::from_str(commit_id) {
        if repo.find_commit(oid).is_ok() {
            return Ok(());
        }
    }
    let url = other_dir.to_string_lossy();
    let mut remote = repo.remote_anonymous(&url)?;
    remote.fetch(&[CROSS_FETCH_REFSPEC], None, None)?;
    let oid =
        git2::Oid::from_str(commit_id).map_err(|_| VcsError::CommitNotFound(commit_id.to_string()))?;
    repo.find_commit(oid)
        .map_err(|_| VcsError::CommitNotFound(commit_id.to_string()))?;
    Ok(())
}

fn remote_callbacks(opt: &RemoteOpts) -> git2::RemoteCallbacks<'static> {
    let username = opt.username.clone();
    let password = opt.password.clone();
    let ssh_key = opt.ssh_private_key.clone();
    let mut callbacks = git2::RemoteCallbacks::new();
    callbacks.credentials(move |url, username_from_url, allowed| {
        if allowed.contains(git2::CredentialType::SSH_KEY) {
            if let Some(key) = &ssh_key {
                let user = username.as_deref().or(username_from_url).unwrap_or("git");
                debug!(url, %user, "offering ssh key");
                return git2::Cred::ssh_key_from_memory(user, None, key, None);
            }
        }
        if allowed.contains(git2::CredentialType::USER_PASS_PLAINTEXT) {
            if let (Some(user), Some(pass)) = (&username, &password) {
                debug!(url, %user, "offering userpass credentials");
                return git2::Cred::userpass_plaintext(user, pass);
            }
        }
        debug!(url, ?allowed, "remote wants credentials none are configured for");
        Err(git2::Error::from_str(
            "authentication required but no credentials configured",
        ))
    });
    callbacks
}

fn convert_commit(commit: &git2::Commit<'_>) -> Commit {
    Commit {
        id: commit.id().to_string(),
        author: convert_signature(&commit.author()),
        committer: Some(convert_signature(&commit.committer())),
        message: commit.message().unwrap_or_default().to_string(),
        parents: commit.parent_ids().map(|id| id.to_string()).collect(),
    }
}

fn convert_signature(sig: &git2::Signature<'_>) -> Signature {
    Signature {
        name: sig.name().unwrap_or_default().to_string(),
        email: sig.email().unwrap_or_default().to_string(),
        date: sig.when().seconds(),
        tz_offset: sig.when().offset_minutes(),
    }
}
