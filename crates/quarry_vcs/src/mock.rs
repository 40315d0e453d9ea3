//! In-memory VCS engine for tests.
//!
//! Origins are registered on the backend by URL; `clone_repo` serializes the
//! registered state into the clone directory and `update` re-reads it, so
//! repeated updates converge on whatever the origin holds at the time. An
//! origin can be armed to fail its clone and update calls with a fixed
//! message, which is how authentication failures are simulated.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::types::{line_spans, sort_tree_entries};
use crate::{
    Backend, Branch, Commit, CommitList, CommitsOptions, Diff, RemoteOpts, Repository, RevSpec,
    SearchOptions, SearchResult, Signature, Tag, TreeEntry, TreeEntryKind, VcsError,
    NULL_COMMIT_ID,
};

const STATE_FILE: &str = "mock.json";
const ORIGIN_FILE: &str = "origin";

/// Serialized state of a mock repository: its full history plus refs.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MockRepo {
    /// Commits oldest first; the last one is the tip.
    pub commits: Vec<MockCommit>,
    pub branches: BTreeMap<String, String>,
    pub tags: BTreeMap<String, String>,
    /// When set, clone and update of this origin fail with this message.
    pub update_error: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MockCommit {
    pub id: String,
    pub message: String,
    pub parents: Vec<String>,
    /// Full file tree at this commit, path to contents.
    pub files: BTreeMap<String, String>,
}

impl MockRepo {
    /// A single-commit repository with one branch `trunk` at `tip_id`.
    pub fn single(tip_id: &str, files: &[(&str, &str)]) -> Self {
        let mut repo = MockRepo::default();
        repo.commits.push(MockCommit {
            id: tip_id.to_string(),
            message: String::from("initial"),
            parents: Vec::new(),
            files: files
                .iter()
                .map(|(path, contents)| (path.to_string(), contents.to_string()))
                .collect(),
        });
        repo.branches
            .insert(String::from("trunk"), tip_id.to_string());
        repo
    }
}

pub struct MockBackend {
    vcs: &'static str,
    origins: Mutex<BTreeMap<String, MockRepo>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::with_vcs_type("git")
    }

    pub fn with_vcs_type(vcs: &'static str) -> Self {
        Self {
            vcs,
            origins: Mutex::new(BTreeMap::new()),
        }
    }

    /// Register or replace the state served for `url`.
    pub fn put_origin(&self, url: &str, repo: MockRepo) {
        self.origins
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(url.to_string(), repo);
    }

    fn origin(&self, url: &str) -> Result<MockRepo, VcsError> {
        let origins = self
            .origins
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        origins
            .get(url)
            .cloned()
            .ok_or_else(|| VcsError::Other(format!("unknown origin {url}")))
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for MockBackend {
    fn vcs_type(&self) -> &'static str {
        self.vcs
    }

    fn open(&self, clone_dir: &Path) -> Result<Arc<dyn Repository>, VcsError> {
        let raw = std::fs::read_to_string(clone_dir.join(STATE_FILE))
            .map_err(|err| VcsError::Other(format!("{}: {err}", clone_dir.display())))?;
        let state: MockRepo = serde_json::from_str(&raw)
            .map_err(|err| VcsError::Other(format!("corrupt mock state: {err}")))?;
        Ok(Arc::new(MockRepository {
            state,
            dir: clone_dir.to_path_buf(),
        }))
    }

    fn clone_repo(&self, url: &str, dest: &Path, _opt: &RemoteOpts) -> Result<(), VcsError> {
        let repo = self.origin(url)?;
        if let Some(message) = &repo.update_error {
            return Err(VcsError::Other(message.clone()));
        }
        std::fs::create_dir_all(dest)
            .map_err(|err| VcsError::Other(format!("{}: {err}", dest.display())))?;
        write_state(dest, url, &repo)
    }

    fn update(&self, clone_dir: &Path, _opt: &RemoteOpts) -> Result<(), VcsError> {
        let url = std::fs::read_to_string(clone_dir.join(ORIGIN_FILE))
            .map_err(|err| VcsError::Other(format!("{}: {err}", clone_dir.display())))?;
        let repo = self.origin(url.trim())?;
        if let Some(message) = &repo.update_error {
            return Err(VcsError::Other(message.clone()));
        }
        write_state(clone_dir, url.trim(), &repo)
    }

    fn is_clone_dir(&self, dir: &Path) -> bool {
        dir.join(STATE_FILE).is_file()
    }
}

fn write_state(dir: &Path, url: &str, repo: &MockRepo) -> Result<(), VcsError> {
    let raw = serde_json::to_string(repo)
        .map_err(|err| VcsError::Other(format!("encode mock state: {err}")))?;
    std::fs::write(dir.join(STATE_FILE), raw)
        .map_err(|err| VcsError::Other(format!("{}: {err}", dir.display())))?;
    std::fs::write(dir.join(ORIGIN_FILE), url)
        .map_err(|err| VcsError::Other(format!("{}: {err}", dir.display())))?;
    Ok(())
}

pub struct MockRepository {
    state: MockRepo,
    dir: PathBuf,
}

impl MockRepository {
    fn commit_index(&self, id: &str) -> Result<usize, VcsError> {
        let matches: Vec<usize> = self
            .state
            .commits
            .iter()
            .enumerate()
            .filter(|(_, commit)| commit.id.starts_with(id))
            .map(|(idx, _)| idx)
            .collect();
        match matches.as_slice() {
            [] => Err(VcsError::CommitNotFound(id.to_string())),
            [idx] => Ok(*idx),
            _ => Err(VcsError::AmbiguousRevision(id.to_string())),
        }
    }

    fn tip(&self) -> Result<&MockCommit, VcsError> {
        self.state
            .commits
            .last()
            .ok_or_else(|| VcsError::RevisionNotFound(String::from("tip")))
    }

    fn signature(&self, index: usize) -> Signature {
        Signature {
            name: String::from("Mock Author"),
            email: String::from("mock@example.com"),
            date: 1_700_000_000 + index as i64 * 60,
            tz_offset: 0,
        }
    }

    fn convert(&self, index: usize) -> Commit {
        let commit = &self.state.commits[index];
        Commit {
            id: commit.id.clone(),
            author: self.signature(index),
            committer: Some(self.signature(index)),
            message: commit.message.clone(),
            parents: commit.parents.clone(),
        }
    }

    /// Ancestor chain from `index` down the first parents, newest first.
    fn first_parent_chain(&self, index: usize) -> Vec<usize> {
        let mut chain = vec![index];
        let mut current = index;
        loop {
            let Some(parent_id) = self.state.commits[current].parents.first() else {
                break;
            };
            let Ok(parent) = self.commit_index(parent_id) else {
                break;
            };
            chain.push(parent);
            current = parent;
        }
        chain
    }
}

impl Repository for MockRepository {
    fn clone_dir(&self) -> &Path {
        &self.dir
    }

    fn resolve_revision(&self, spec: &RevSpec) -> Result<String, VcsError> {
        match spec {
            RevSpec::Tip => Ok(self.tip()?.id.clone()),
            RevSpec::Null => Ok(NULL_COMMIT_ID.to_string()),
            RevSpec::FileRevision(number) => self
                .state
                .commits
                .get(*number as usize)
                .map(|commit| commit.id.clone())
                .ok_or_else(|| VcsError::RevisionNotFound(number.to_string())),
            RevSpec::CommitId(id) => match self.commit_index(id) {
                Ok(idx) => Ok(self.state.commits[idx].id.clone()),
                Err(VcsError::CommitNotFound(_)) => resolve_name(&self.state, id),
                Err(err) => Err(err),
            },
            RevSpec::Name(name) => resolve_name(&self.state, name),
        }
    }

    fn branches(&self) -> Result<Vec<Branch>, VcsError> {
        Ok(self
            .state
            .branches
            .iter()
            .map(|(name, commit_id)| Branch {
                name: name.clone(),
                commit_id: commit_id.clone(),
            })
            .collect())
    }

    fn tags(&self) -> Result<Vec<Tag>, VcsError> {
        Ok(self
            .state
            .tags
            .iter()
            .map(|(name, commit_id)| Tag {
                name: name.clone(),
                commit_id: commit_id.clone(),
            })
            .collect())
    }

    fn commit(&self, id: &str) -> Result<Commit, VcsError> {
        Ok(self.convert(self.commit_index(id)?))
    }

    fn commits(&self, opt: &CommitsOptions) -> Result<CommitList, VcsError> {
        let head = if opt.head.is_empty() {
            self.state.commits.len().checked_sub(1).ok_or_else(|| {
                VcsError::RevisionNotFound(String::from("tip"))
            })?
        } else {
            self.commit_index(&opt.head)?
        };
        let chain = self.first_parent_chain(head);
        let total = chain.len() as u64;
        let page = chain.into_iter().skip(opt.skip as usize);
        let page: Vec<usize> = if opt.n > 0 {
            page.take(opt.n as usize).collect()
        } else {
            page.collect()
        };
        Ok(CommitList {
            commits: page.into_iter().map(|idx| self.convert(idx)).collect(),
            total,
        })
    }

    fn tree_entry(&self, commit_id: &str, path: &str) -> Result<TreeEntry, VcsError> {
        let index = self.commit_index(commit_id)?;
        let commit = &self.state.commits[index];
        let mod_time = self.signature(index).date;

        let path = if path.is_empty() { "." } else { path };
        if let Some(contents) = commit.files.get(path) {
            return Ok(TreeEntry {
                name: path.rsplit('/').next().unwrap_or(path).to_string(),
                kind: TreeEntryKind::File,
                size: contents.len() as i64,
                mod_time,
                contents: Some(contents.clone()),
                entries: Vec::new(),
            });
        }

        let prefix = if path == "." {
            String::new()
        } else {
            format!("{path}/")
        };
        let mut names: Vec<(String, TreeEntryKind, i64)> = Vec::new();
        for (file, contents) in &commit.files {
            let Some(rest) = file.strip_prefix(&prefix) else {
                continue;
            };
            match rest.split_once('/') {
                Some((dir, _)) => {
                    if !names.iter().any(|(name, _, _)| name == dir) {
                        names.push((dir.to_string(), TreeEntryKind::Dir, 0));
                    }
                }
                None => names.push((rest.to_string(), TreeEntryKind::File, contents.len() as i64)),
            }
        }
        if names.is_empty() && path != "." {
            return Err(VcsError::FileNotFound(path.to_string()));
        }
        let mut entries: Vec<TreeEntry> = names
            .into_iter()
            .map(|(name, kind, size)| TreeEntry {
                name,
                kind,
                size,
                mod_time,
                contents: None,
                entries: Vec::new(),
            })
            .collect();
        sort_tree_entries(&mut entries);
        Ok(TreeEntry {
            name: path.rsplit('/').next().unwrap_or(".").to_string(),
            kind: TreeEntryKind::Dir,
            size: 0,
            mod_time,
            contents: None,
            entries,
        })
    }

    fn diff(&self, base: &str, head: &str) -> Result<Diff, VcsError> {
        let base = &self.state.commits[self.commit_index(base)?];
        let head = &self.state.commits[self.commit_index(head)?];
        let mut raw = String::new();
        for (path, new) in &head.files {
            match base.files.get(path) {
                Some(old) if old == new => {}
                Some(old) => {
                    raw.push_str(&format!("--- a/{path}\n+++ b/{path}\n-{old}+{new}"));
                }
                None => {
                    raw.push_str(&format!("--- /dev/null\n+++ b/{path}\n+{new}"));
                }
            }
        }
        for path in base.files.keys() {
            if !head.files.contains_key(path) {
                raw.push_str(&format!("--- a/{path}\n+++ /dev/null\n"));
            }
        }
        Ok(Diff { raw })
    }

    fn merge_base(&self, a: &str, b: &str) -> Result<String, VcsError> {
        let a_chain = self.first_parent_chain(self.commit_index(a)?);
        let b_chain = self.first_parent_chain(self.commit_index(b)?);
        for idx in &a_chain {
            if b_chain.contains(idx) {
                return Ok(self.state.commits[*idx].id.clone());
            }
        }
        Err(VcsError::RevisionNotFound(format!(
            "merge base of {a} and {b}"
        )))
    }

    fn search(&self, commit_id: &str, opt: &SearchOptions) -> Result<Vec<SearchResult>, VcsError> {
        if opt.query.is_empty() {
            return Ok(Vec::new());
        }
        let commit = &self.state.commits[self.commit_index(commit_id)?];
        let mut results = Vec::new();
        let mut to_skip = opt.offset.max(0);
        let limit = if opt.n > 0 { opt.n as usize } else { usize::MAX };
        for (file, contents) in &commit.files {
            let spans = line_spans(contents.as_bytes());
            for (idx, _) in spans.iter().enumerate() {
                let line = contents[spans[idx].0..spans[idx].1].trim_end_matches('\n');
                if !line.contains(&opt.query) {
                    continue;
                }
                if to_skip > 0 {
                    to_skip -= 1;
                    continue;
                }
                results.push(SearchResult {
                    file: file.clone(),
                    start_line: idx as i64 + 1,
                    end_line: idx as i64 + 1,
                    matched: line.to_string(),
                });
                if results.len() >= limit {
                    return Ok(results);
                }
            }
        }
        Ok(results)
    }
}

fn resolve_name(state: &MockRepo, name: &str) -> Result<String, VcsError> {
    if let Some(commit_id) = state.branches.get(name) {
        return Ok(commit_id.clone());
    }
    if let Some(commit_id) = state.tags.get(name) {
        return Ok(commit_id.clone());
    }
    Err(VcsError::RevisionNotFound(name.to_string()))
}
