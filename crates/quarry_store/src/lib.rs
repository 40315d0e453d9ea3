//! Node-local repository service and its HTTP read API.
//!
//! A node stores one clone per repository under its storage root, named by
//! the encoded repository key. [`service::RepoService`] hands out shared,
//! reference-counted handles and performs atomic clones;
//! [`provider::ClusterProvider`] adapts the service to the node agent;
//! [`server`] exposes the public read API.

pub mod key;
pub mod provider;
pub mod server;
pub mod service;

use quarry_vcs::VcsError;

/// Failures of the repository service and its HTTP surface.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The repository is not present in local storage.
    #[error("repository not found: {0}")]
    NotExist(String),
    #[error("invalid repository identifier: {0}")]
    InvalidKey(String),
    #[error("unsupported vcs type: {0}")]
    UnsupportedVcs(String),
    #[error(transparent)]
    Vcs(#[from] VcsError),
    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{0}")]
    Internal(String),
}

impl StoreError {
    pub(crate) fn io(path: impl std::fmt::Display, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.to_string(),
            source,
        }
    }

    /// True when the failure means "no such repository or object".
    pub fn is_not_exist(&self) -> bool {
        match self {
            StoreError::NotExist(_) => true,
            StoreError::Vcs(err) => err.is_not_found(),
            _ => false,
        }
    }
}
