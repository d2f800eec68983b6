//! Revision creation and publication
//!
//! A mutation is published as one revision: the staged index is written to a
//! tree, committed on the branch (creating it when unborn), and the branch is
//! force-pushed as a single-refspec update. The remote applies a one-ref push
//! atomically, and the update is guarded against the remote having advanced
//! since synchronization: the push negotiation compares the remote's
//! advertised tip with the tip we synchronized from and rejects the publish
//! on mismatch instead of overwriting concurrent work. A rejected publish is
//! surfaced verbatim and never retried here; callers re-run the whole
//! operation.

use std::cell::RefCell;

use git2::{ErrorCode, Oid, PushOptions, Repository, Signature, StatusOptions};
use libkeyrow_core::{CancelToken, RepoOptions};
use tracing::{info, warn};

use crate::auth::{remote_callbacks, Credentials};
use crate::error::StoreError;
use crate::sync::REMOTE_NAME;

/// Commit the staged index as a new revision on the configured branch
///
/// The revision's parent is the current branch tip; an unborn branch gets a
/// root revision and springs into existence. Unless `allow_empty` is set, a
/// revision whose tree equals its parent's is refused.
pub fn commit_staged(
    repo: &Repository,
    options: &RepoOptions,
    message: &str,
    allow_empty: bool,
) -> Result<Oid, StoreError> {
    let mut index = repo.index()?;
    let tree_id = index.write_tree()?;
    let tree = repo.find_tree(tree_id)?;

    let parent = match repo.head() {
        Ok(head) => Some(head.peel_to_commit()?),
        Err(e) if e.code() == ErrorCode::UnbornBranch || e.code() == ErrorCode::NotFound => None,
        Err(e) => return Err(e.into()),
    };

    if !allow_empty {
        let unchanged = match parent {
            Some(ref parent) => parent.tree_id() == tree_id,
            None => tree.is_empty(),
        };
        if unchanged {
            return Err(StoreError::EmptyRevision);
        }
    }

    let signature = Signature::now(&options.author_name, &options.author_email)?;
    let parents: Vec<_> = parent.iter().collect();
    let revision = repo.commit(Some("HEAD"), &signature, &signature, message, &tree, &parents)?;
    Ok(revision)
}

/// Force-push the branch to the remote as one atomic reference update
///
/// `expected_remote` is the remote tip observed at synchronization (`None`
/// for an unborn branch). If the remote advertises a different tip at push
/// time, the publish fails with [`StoreError::PublishRejected`] and the
/// remote is left untouched.
pub fn push_branch(
    repo: &Repository,
    options: &RepoOptions,
    credentials: &Credentials,
    cancel: &CancelToken,
    expected_remote: Option<Oid>,
) -> Result<(), StoreError> {
    if cancel.is_cancelled() {
        return Err(StoreError::Cancelled);
    }

    let branch_ref = options.branch_ref();
    let refspec = format!("+{branch_ref}:{branch_ref}");
    let expected = expected_remote.unwrap_or_else(Oid::zero);

    let mut remote = repo.find_remote(REMOTE_NAME)?;

    let rejection: RefCell<Option<String>> = RefCell::new(None);
    let outcome = {
        let mut callbacks = remote_callbacks(credentials, &options.ssh_user, cancel);

        callbacks.push_negotiation(|updates| {
            for update in updates {
                let current = update.src();
                if current != expected {
                    *rejection.borrow_mut() = Some(format!(
                        "remote branch advanced: at {current}, synchronized from {expected}"
                    ));
                    return Err(git2::Error::from_str("remote branch advanced"));
                }
            }
            Ok(())
        });

        callbacks.push_update_reference(|refname, status| {
            if let Some(message) = status {
                *rejection.borrow_mut() = Some(format!("{refname}: {message}"));
            }
            Ok(())
        });

        let mut push = PushOptions::new();
        push.remote_callbacks(callbacks);
        remote.push(&[refspec.as_str()], Some(&mut push))
    };

    if let Some(message) = rejection.into_inner() {
        warn!(branch = %branch_ref, %message, "publish rejected");
        return Err(StoreError::PublishRejected {
            refname: branch_ref,
            message,
        });
    }

    outcome.map_err(|e| {
        if cancel.is_cancelled() {
            StoreError::Cancelled
        } else {
            StoreError::Git(e)
        }
    })?;

    info!(branch = %branch_ref, "published branch");
    Ok(())
}

/// Whether the working area and index match HEAD exactly
pub(crate) fn worktree_clean(repo: &Repository) -> Result<bool, StoreError> {
    let mut status = StatusOptions::new();
    status.include_untracked(true).include_ignored(false);
    let statuses = repo.statuses(Some(&mut status))?;
    Ok(statuses.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::write::{RecordWriter, WriteMode};
    use libkeyrow_core::Key;
    use tempfile::TempDir;

    fn test_setup(dir: &TempDir) -> (RepoOptions, Repository) {
        let remote_path = dir.path().join("remote.git");
        Repository::init_bare(&remote_path).unwrap();

        let options = RepoOptions::new(remote_path.to_str().unwrap())
            .with_volume(dir.path().join("mirrors"));
        let local = Repository::init(options.mirror_dir()).unwrap();
        local
            .remote(REMOTE_NAME, &options.remote)
            .unwrap();
        local.set_head(&options.branch_ref()).unwrap();
        (options, local)
    }

    fn stage(repo: &Repository, key: &str, data: &[u8]) {
        RecordWriter::new(repo)
            .stage(&Key::new(key).unwrap(), data, WriteMode::Upsert)
            .unwrap();
    }

    #[test]
    fn test_commit_creates_unborn_branch() {
        let dir = TempDir::new().unwrap();
        let (options, repo) = test_setup(&dir);

        stage(&repo, "a.md", b"v1");
        let revision = commit_staged(&repo, &options, "first", false).unwrap();

        assert_eq!(
            repo.refname_to_id("refs/heads/main").unwrap(),
            revision
        );
        let commit = repo.find_commit(revision).unwrap();
        assert_eq!(commit.parent_count(), 0);
        assert_eq!(commit.message(), Some("first"));
        assert_eq!(commit.author().name(), Some("keyrow"));
    }

    #[test]
    fn test_commit_advances_branch_by_one() {
        let dir = TempDir::new().unwrap();
        let (options, repo) = test_setup(&dir);

        stage(&repo, "a.md", b"v1");
        let first = commit_staged(&repo, &options, "first", false).unwrap();

        stage(&repo, "a.md", b"v2");
        let second = commit_staged(&repo, &options, "second", false).unwrap();

        let commit = repo.find_commit(second).unwrap();
        assert_eq!(commit.parent_id(0).unwrap(), first);
    }

    #[test]
    fn test_empty_revision_refused_by_default() {
        let dir = TempDir::new().unwrap();
        let (options, repo) = test_setup(&dir);

        stage(&repo, "a.md", b"v1");
        commit_staged(&repo, &options, "first", false).unwrap();

        // nothing staged since the last revision
        let err = commit_staged(&repo, &options, "again", false).unwrap_err();
        assert!(matches!(err, StoreError::EmptyRevision));
    }

    #[test]
    fn test_empty_revision_allowed_when_enabled() {
        let dir = TempDir::new().unwrap();
        let (options, repo) = test_setup(&dir);

        stage(&repo, "a.md", b"v1");
        let first = commit_staged(&repo, &options, "first", false).unwrap();

        let second = commit_staged(&repo, &options, "checkpoint", true).unwrap();
        assert_ne!(first, second);
        let commit = repo.find_commit(second).unwrap();
        assert_eq!(commit.tree_id(), repo.find_commit(first).unwrap().tree_id());
    }

    #[test]
    fn test_push_publishes_new_branch() {
        let dir = TempDir::new().unwrap();
        let (options, repo) = test_setup(&dir);

        stage(&repo, "a.md", b"v1");
        let revision = commit_staged(&repo, &options, "first", false).unwrap();

        let credentials = Credentials::none();
        let cancel = CancelToken::new();
        push_branch(&repo, &options, &credentials, &cancel, None).unwrap();

        let remote = Repository::open_bare(dir.path().join("remote.git")).unwrap();
        assert_eq!(remote.refname_to_id("refs/heads/main").unwrap(), revision);
    }

    #[test]
    fn test_push_rejected_when_remote_advanced() {
        let dir = TempDir::new().unwrap();
        let (options, repo) = test_setup(&dir);
        let credentials = Credentials::none();
        let cancel = CancelToken::new();

        stage(&repo, "a.md", b"v1");
        let first = commit_staged(&repo, &options, "first", false).unwrap();
        push_branch(&repo, &options, &credentials, &cancel, None).unwrap();

        stage(&repo, "a.md", b"v2");
        commit_staged(&repo, &options, "second", false).unwrap();

        // claim we synchronized from an unborn branch; the remote is at
        // `first`, so the publish must be refused and the remote untouched
        let err = push_branch(&repo, &options, &credentials, &cancel, None).unwrap_err();
        assert!(err.is_publish_conflict());

        let remote = Repository::open_bare(dir.path().join("remote.git")).unwrap();
        assert_eq!(remote.refname_to_id("refs/heads/main").unwrap(), first);
    }

    #[test]
    fn test_worktree_clean_tracks_staging() {
        let dir = TempDir::new().unwrap();
        let (options, repo) = test_setup(&dir);

        stage(&repo, "a.md", b"v1");
        assert!(!worktree_clean(&repo).unwrap());

        commit_staged(&repo, &options, "first", false).unwrap();
        assert!(worktree_clean(&repo).unwrap());
    }
}
