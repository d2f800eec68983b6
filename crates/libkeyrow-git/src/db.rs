//! The public store handle
//!
//! `Database` ties the pieces together: every operation synchronizes the
//! mirror first, then performs its own step. Mutations run the full
//! stage → commit → publish transaction; either the branch advances by
//! exactly one published revision or the remote is left untouched.
//!
//! One handle owns one mirror directory. Operations take `&mut self`, so a
//! single handle cannot be driven concurrently from within a process;
//! concurrent writers in *different* processes need an external lock, or one
//! of them will have its publish rejected and must re-run the operation.

use git2::{Oid, Repository};
use libkeyrow_core::{CancelToken, Key, RepoOptions};
use tracing::debug;

use crate::auth::Credentials;
use crate::error::{op, StoreError};
use crate::list::{list_at, Entries};
use crate::sync::{branch_tip, Synchronizer};
use crate::txn::{commit_staged, push_branch, worktree_clean};
use crate::write::{RecordWriter, WriteMode};

/// Options for [`Database::create`]
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    message: Option<String>,
}

impl CreateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the revision message; whitespace-only overrides are ignored
    /// and the operation default is used instead
    pub fn with_message(mut self, message: impl AsRef<str>) -> Self {
        self.message = non_empty(message.as_ref());
        self
    }
}

/// Options for [`Database::upsert`]
#[derive(Debug, Clone, Default)]
pub struct UpsertOptions {
    message: Option<String>,
    allow_empty_revision: bool,
}

impl UpsertOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the revision message; whitespace-only overrides are ignored
    pub fn with_message(mut self, message: impl AsRef<str>) -> Self {
        self.message = non_empty(message.as_ref());
        self
    }

    /// Allow publishing a revision even when the content did not change
    ///
    /// Off by default: an upsert that changes nothing publishes nothing and
    /// reports the current tip with `changed = false`.
    pub fn allow_empty_revision(mut self, allow: bool) -> Self {
        self.allow_empty_revision = allow;
        self
    }
}

/// Options for [`Database::delete`]
#[derive(Debug, Clone, Default)]
pub struct DeleteOptions {
    message: Option<String>,
}

impl DeleteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the revision message; whitespace-only overrides are ignored
    pub fn with_message(mut self, message: impl AsRef<str>) -> Self {
        self.message = non_empty(message.as_ref());
        self
    }
}

/// Options for [`Database::list`]
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    prefix: Option<String>,
}

impl ListOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep only keys whose immediate parent directory equals `prefix`
    ///
    /// This is an exact-parent-directory match, not a path-prefix match:
    /// a prefix of `a/b` excludes `a/b/c/d`. A whitespace-only prefix is
    /// ignored.
    pub fn with_prefix(mut self, prefix: impl AsRef<str>) -> Self {
        self.prefix = non_empty(prefix.as_ref());
        self
    }
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Outcome of an upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Upserted {
    /// The newly published revision, or the current tip when nothing changed
    pub revision: Oid,
    /// Whether the upsert changed the stored content
    pub changed: bool,
}

/// A key-value store over one remote branch
pub struct Database {
    options: RepoOptions,
    credentials: Credentials,
    cancel: CancelToken,
    repo: Option<Repository>,
}

impl Database {
    /// Open a handle; the mirror is materialized lazily on first use
    pub fn open(options: RepoOptions, credentials: Credentials) -> Result<Self, StoreError> {
        options.validate()?;
        Ok(Self {
            options,
            credentials,
            cancel: CancelToken::new(),
            repo: None,
        })
    }

    /// Install a cancellation token honored at clone/fetch/push boundaries
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// The handle's options
    pub fn options(&self) -> &RepoOptions {
        &self.options
    }

    /// Read one key's content at the current remote tip
    pub fn get(&mut self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.get_inner(key).map_err(op("get"))
    }

    fn get_inner(&mut self, key: &str) -> Result<Vec<u8>, StoreError> {
        let key = Key::new(key)?;
        self.synchronize()?;
        let repo = self.repo()?;
        RecordWriter::new(repo).read(&key)
    }

    /// Store a new key; fails when the key already exists
    ///
    /// Returns the published revision.
    pub fn create(
        &mut self,
        key: &str,
        data: &[u8],
        options: CreateOptions,
    ) -> Result<Oid, StoreError> {
        self.create_inner(key, data, options).map_err(op("create"))
    }

    fn create_inner(
        &mut self,
        key: &str,
        data: &[u8],
        options: CreateOptions,
    ) -> Result<Oid, StoreError> {
        let key = Key::new(key)?;
        self.synchronize()?;
        let repo = self.repo()?;

        RecordWriter::new(repo).stage(&key, data, WriteMode::Create)?;

        let base = branch_tip(repo, &self.options.branch_ref())?;
        let message = options
            .message
            .unwrap_or_else(|| format!("keyrow: create {key}"));
        let revision = commit_staged(repo, &self.options, &message, false)?;
        push_branch(repo, &self.options, &self.credentials, &self.cancel, base)?;
        Ok(revision)
    }

    /// Store a key, creating or overwriting it
    ///
    /// An upsert whose content equals the current tip's publishes nothing and
    /// returns the tip revision with `changed = false`, unless empty
    /// revisions were explicitly allowed.
    pub fn upsert(
        &mut self,
        key: &str,
        data: &[u8],
        options: UpsertOptions,
    ) -> Result<Upserted, StoreError> {
        self.upsert_inner(key, data, options).map_err(op("upsert"))
    }

    fn upsert_inner(
        &mut self,
        key: &str,
        data: &[u8],
        options: UpsertOptions,
    ) -> Result<Upserted, StoreError> {
        let key = Key::new(key)?;
        self.synchronize()?;
        let repo = self.repo()?;

        RecordWriter::new(repo).stage(&key, data, WriteMode::Upsert)?;

        let changed = !worktree_clean(repo)?;
        let base = branch_tip(repo, &self.options.branch_ref())?;

        if !changed && !options.allow_empty_revision {
            let revision = base.ok_or_else(|| {
                git2::Error::from_str("no revision at branch after clean upsert")
            })?;
            debug!(key = %key, %revision, "upsert changed nothing, skipping publish");
            return Ok(Upserted {
                revision,
                changed: false,
            });
        }

        let message = options
            .message
            .unwrap_or_else(|| format!("keyrow: upsert {key}"));
        let revision = commit_staged(repo, &self.options, &message, options.allow_empty_revision)?;
        push_branch(repo, &self.options, &self.credentials, &self.cancel, base)?;
        Ok(Upserted { revision, changed })
    }

    /// Remove a key; fails when the key does not exist
    ///
    /// Returns the published revision.
    pub fn delete(&mut self, key: &str, options: DeleteOptions) -> Result<Oid, StoreError> {
        self.delete_inner(key, options).map_err(op("delete"))
    }

    fn delete_inner(&mut self, key: &str, options: DeleteOptions) -> Result<Oid, StoreError> {
        let key = Key::new(key)?;
        self.synchronize()?;
        let repo = self.repo()?;

        RecordWriter::new(repo).remove(&key)?;

        let base = branch_tip(repo, &self.options.branch_ref())?;
        let message = options
            .message
            .unwrap_or_else(|| format!("keyrow: delete {key}"));
        let revision = commit_staged(repo, &self.options, &message, false)?;
        push_branch(repo, &self.options, &self.credentials, &self.cancel, base)?;
        Ok(revision)
    }

    /// Enumerate all keys at the current remote tip
    ///
    /// Entries come in tree traversal order with lazy content accessors and
    /// each key's last-modifying revision within the retained history (the
    /// tip revision when the true one lies outside the window).
    pub fn list(&mut self, options: ListOptions) -> Result<Entries<'_>, StoreError> {
        let prefix = match options.prefix {
            Some(ref prefix) => Some(Key::new(prefix).map_err(|e| op("list")(e.into()))?),
            None => None,
        };

        self.synchronize().map_err(op("list"))?;
        let repo = self.repo.as_ref().ok_or_else(unsynchronized)?;

        let tip = match branch_tip(repo, &self.options.branch_ref()).map_err(op("list"))? {
            Some(tip) => tip,
            // unborn branch: nothing stored yet
            None => return Ok(Entries::empty()),
        };

        list_at(repo, tip, prefix.as_ref().map(Key::as_str)).map_err(op("list"))
    }

    /// The current remote tip, `None` while the branch is unborn
    pub fn head(&mut self) -> Result<Option<Oid>, StoreError> {
        self.synchronize().map_err(op("head"))?;
        let repo = self.repo()?;
        branch_tip(repo, &self.options.branch_ref()).map_err(op("head"))
    }

    fn synchronize(&mut self) -> Result<(), StoreError> {
        let sync = Synchronizer::new(&self.options, &self.credentials, &self.cancel);
        self.repo = Some(sync.converge()?);
        Ok(())
    }

    fn repo(&self) -> Result<&Repository, StoreError> {
        self.repo.as_ref().ok_or_else(unsynchronized)
    }
}

fn unsynchronized() -> StoreError {
    StoreError::Git(git2::Error::from_str("mirror not synchronized"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_override_trimmed() {
        let options = CreateOptions::new().with_message("  tidy message  ");
        assert_eq!(options.message.as_deref(), Some("tidy message"));
    }

    #[test]
    fn test_blank_message_falls_back_to_default() {
        let options = UpsertOptions::new().with_message("   ");
        assert!(options.message.is_none());
    }

    #[test]
    fn test_blank_prefix_ignored() {
        let options = ListOptions::new().with_prefix("  ");
        assert!(options.prefix.is_none());

        let options = ListOptions::new().with_prefix("a/b");
        assert_eq!(options.prefix.as_deref(), Some("a/b"));
    }

    #[test]
    fn test_open_validates_options() {
        let err = Database::open(RepoOptions::new(""), Credentials::none());
        assert!(err.is_err());
    }
}
