//! Git-backed key-value store operations for keyrow
//!
//! This crate implements the synchronization-and-transaction layer:
//! - mirror convergence against a remote branch at bounded history depth
//! - record staging with advisory file locks
//! - the stage → commit → publish transaction behind create/upsert/delete
//! - listing with lazy content and last-modifying-revision resolution
//!
//! All git interaction lives here; no other keyrow crate imports `git2`.

mod auth;
mod db;
mod error;
mod list;
mod sync;
mod txn;
mod write;

pub use auth::Credentials;
pub use db::{CreateOptions, Database, DeleteOptions, ListOptions, UpsertOptions, Upserted};
pub use error::StoreError;
pub use list::{CommitGraph, Entries, Entry};
pub use sync::{Synchronizer, REMOTE_NAME};
pub use txn::{commit_staged, push_branch};
pub use write::{RecordWriter, WriteMode};

pub use git2::Oid;
pub use libkeyrow_core::{CancelToken, Key, KeyError, KeyrowError, RepoOptions};
