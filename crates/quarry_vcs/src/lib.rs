//! Revision-graph data model and VCS engine seams.
//!
//! Everything a node serves about a repository flows through the
//! [`Repository`] trait: commits, branches, tags, tree entries, diffs,
//! blames, merge bases and searches. [`Backend`] is the engine-level seam
//! that opens, clones and updates local mirrors. A libgit2 engine ships in
//! [`git`]; an in-memory engine for tests lives behind the `testing` feature.

pub mod git;
#[cfg(feature = "testing")]
pub mod mock;
mod repository;
mod revspec;
mod types;

pub use repository::{Backend, RemoteOpts, Repository};
pub use revspec::{RevRange, RevSpec};
pub use types::{
    compute_file_range, BlameOptions, Branch, Commit, CommitList, CommitsOptions, Diff, FileRange,
    FileWithRange, GetFileOptions, Hunk, SearchOptions, SearchResult, Signature, Tag, TreeEntry,
    TreeEntryKind,
};

/// Length of a canonical (full) commit id in hex characters.
pub const COMMIT_ID_LEN: usize = 40;

/// The all-zero commit id used for the `null` revision.
pub const NULL_COMMIT_ID: &str = "0000000000000000000000000000000000000000";

/// Whether `id` is in canonical form: exactly 40 lowercase hex characters.
///
/// Canonicality decides redirect status (301 vs 302) and cache policy (long
/// vs short) on the HTTP surface, so this predicate must not drift.
pub fn commit_id_is_canonical(id: &str) -> bool {
    id.len() == COMMIT_ID_LEN && id.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Whether `id` is plausible as a (possibly abbreviated) commit id: nonempty
/// lowercase hex, no longer than canonical.
pub fn commit_id_is_valid(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= COMMIT_ID_LEN
        && id.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Failures of repository read and mirror operations.
#[derive(Debug, thiserror::Error)]
pub enum VcsError {
    #[error("commit not found: {0}")]
    CommitNotFound(String),
    #[error("branch not found: {0}")]
    BranchNotFound(String),
    #[error("tag not found: {0}")]
    TagNotFound(String),
    #[error("file not found: {0}")]
    FileNotFound(String),
    #[error("revision not found: {0}")]
    RevisionNotFound(String),
    #[error("ambiguous revision: {0}")]
    AmbiguousRevision(String),
    #[error("invalid revision spec: {0}")]
    InvalidRevSpec(String),
    #[error("invalid file range: {0}")]
    InvalidFileRange(String),
    #[error("capability not implemented: {0}")]
    NotImplemented(&'static str),
    #[error(transparent)]
    Git(#[from] git2::Error),
    #[error("{0}")]
    Other(String),
}

impl VcsError {
    /// True when the failure means "the named object does not exist" rather
    /// than a malfunction.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            VcsError::CommitNotFound(_)
                | VcsError::BranchNotFound(_)
                | VcsError::TagNotFound(_)
                | VcsError::FileNotFound(_)
                | VcsError::RevisionNotFound(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_commit_ids_are_forty_lowercase_hex() {
        assert!(commit_id_is_canonical(
            "0123456789abcdef0123456789abcdef01234567"
        ));
        assert!(!commit_id_is_canonical("0123456789abcdef"));
        assert!(!commit_id_is_canonical(
            "0123456789ABCDEF0123456789abcdef01234567"
        ));
        assert!(!commit_id_is_canonical(
            "0123456789abcdef0123456789abcdef012345678"
        ));
    }

    #[test]
    fn short_ids_are_valid_but_not_canonical() {
        assert!(commit_id_is_valid("ab"));
        assert!(!commit_id_is_canonical("ab"));
        assert!(!commit_id_is_valid(""));
        assert!(!commit_id_is_valid("xyz"));
    }
}
