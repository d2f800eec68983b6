use std::path::PathBuf;

use thiserror::Error;

/// Errors from store operations
#[derive(Debug, Error)]
pub enum StoreError {
    /// A step failure wrapped with the public operation it happened in
    #[error("{op} command: {source}")]
    Op {
        op: &'static str,
        #[source]
        source: Box<StoreError>,
    },

    /// Clone/fetch/checkout against the remote failed
    #[error("sync {step}: {source}")]
    Sync {
        step: &'static str,
        #[source]
        source: git2::Error,
    },

    #[error("key '{key}' already exists")]
    KeyExists { key: String },

    #[error("key '{key}' not found")]
    KeyNotFound { key: String },

    #[error("key '{key}' names a directory")]
    KeyIsDirectory { key: String },

    /// The remote branch advanced since synchronization, or the remote
    /// refused the reference update
    #[error("publish of '{refname}' rejected: {message}")]
    PublishRejected { refname: String, message: String },

    #[error("revision would be empty and empty revisions are disabled")]
    EmptyRevision,

    #[error("advisory lock on '{path}': {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("key error: {0}")]
    Key(#[from] libkeyrow_core::KeyError),

    #[error("core error: {0}")]
    Core(#[from] libkeyrow_core::KeyrowError),

    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Strip operation-context wrappers down to the underlying failure
    pub fn root(&self) -> &StoreError {
        match self {
            StoreError::Op { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether this is a precondition failure: no mutation was performed and
    /// no revision was created
    pub fn is_precondition(&self) -> bool {
        matches!(
            self.root(),
            StoreError::KeyExists { .. }
                | StoreError::KeyNotFound { .. }
                | StoreError::KeyIsDirectory { .. }
        )
    }

    /// Whether this is a rejected publish (remote advanced since sync)
    pub fn is_publish_conflict(&self) -> bool {
        matches!(self.root(), StoreError::PublishRejected { .. })
    }

    /// Whether this reports an absent key
    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), StoreError::KeyNotFound { .. })
    }
}

/// Wrap step failures with the name of the enclosing public operation
pub(crate) fn op(name: &'static str) -> impl Fn(StoreError) -> StoreError {
    move |source| StoreError::Op {
        op: name,
        source: Box::new(source),
    }
}
