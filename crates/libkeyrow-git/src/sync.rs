//! Mirror synchronization
//!
//! `Synchronizer` converges the local mirror onto the remote branch tip,
//! discarding any uncommitted or unpushed local state. Convergence walks the
//! states Absent → Mirrored → RemoteLinked → Fetched → CheckedOut; every
//! public store operation runs it before doing anything else, and running it
//! again with no remote change is a no-op.
//!
//! History is transferred at the configured depth (default 1), so the mirror
//! holds only a suffix of the revision graph. The mirror is materialized as
//! init + single-branch forced fetch rather than a porcelain clone: the end
//! state is the same and the empty-remote and missing-branch cases collapse
//! into one path (an unborn branch that the first commit creates).

use git2::build::CheckoutBuilder;
use git2::{ErrorCode, FetchOptions, Oid, Repository, ResetType};
use libkeyrow_core::{CancelToken, RepoOptions};
use tracing::debug;

use crate::auth::{remote_callbacks, Credentials};
use crate::error::StoreError;

/// Name of the remote link the mirror keeps to the configured address
pub const REMOTE_NAME: &str = "origin";

/// Converges a local mirror onto the remote branch tip
pub struct Synchronizer<'a> {
    options: &'a RepoOptions,
    credentials: &'a Credentials,
    cancel: &'a CancelToken,
}

impl<'a> Synchronizer<'a> {
    pub fn new(
        options: &'a RepoOptions,
        credentials: &'a Credentials,
        cancel: &'a CancelToken,
    ) -> Self {
        Self {
            options,
            credentials,
            cancel,
        }
    }

    /// Run the full convergence and return the opened mirror
    ///
    /// On return the local branch reference equals the remote tip and the
    /// working area reflects it exactly. When the remote branch does not
    /// exist yet (including an entirely empty remote), HEAD is left as a
    /// symbolic reference to the unborn branch and the first commit creates
    /// it. Errors other than the documented idempotent conditions leave the
    /// mirror in an unspecified state; callers must not use it.
    pub fn converge(&self) -> Result<Repository, StoreError> {
        let repo = self.open_or_init()?;
        self.ensure_remote(&repo)?;
        self.fetch_branch(&repo)?;
        self.checkout(&repo)?;
        Ok(repo)
    }

    /// Absent → Mirrored: open the mirror, creating an empty repository on
    /// first use (an existing mirror directory is success, not an error)
    fn open_or_init(&self) -> Result<Repository, StoreError> {
        let dir = self.options.mirror_dir();

        if dir.join(".git").exists() {
            debug!(mirror = %dir.display(), "mirror present, opening");
            return Repository::open(&dir).map_err(|e| StoreError::Sync {
                step: "open",
                source: e,
            });
        }

        self.check_cancel()?;
        debug!(mirror = %dir.display(), "mirror absent, initializing");
        Repository::init(&dir).map_err(|e| StoreError::Sync {
            step: "init",
            source: e,
        })
    }

    /// Mirrored → RemoteLinked: make sure `origin` exists and points at the
    /// configured address
    fn ensure_remote(&self, repo: &Repository) -> Result<(), StoreError> {
        match repo.find_remote(REMOTE_NAME) {
            Ok(remote) => {
                if remote.url() != Some(self.options.remote.as_str()) {
                    repo.remote_set_url(REMOTE_NAME, &self.options.remote)
                        .map_err(|e| StoreError::Sync {
                            step: "remote",
                            source: e,
                        })?;
                }
                Ok(())
            }
            Err(e) if e.code() == ErrorCode::NotFound => repo
                .remote(REMOTE_NAME, &self.options.remote)
                .map(|_| ())
                .map_err(|e| StoreError::Sync {
                    step: "remote",
                    source: e,
                }),
            Err(e) => Err(StoreError::Sync {
                step: "remote",
                source: e,
            }),
        }
    }

    /// RemoteLinked → Fetched: forced bounded-depth fetch of the branch into
    /// the local branch reference
    ///
    /// An empty remote or a remote without the branch fetches nothing; the
    /// local branch then stays unborn and HEAD is pointed at it symbolically
    /// so the first commit creates the branch. Transports without shallow
    /// support fall back to a full-history fetch.
    fn fetch_branch(&self, repo: &Repository) -> Result<(), StoreError> {
        self.check_cancel()?;

        let branch_ref = self.options.branch_ref();
        let refspec = format!("+{branch_ref}:{branch_ref}");

        let mut remote = repo.find_remote(REMOTE_NAME).map_err(|e| StoreError::Sync {
            step: "remote",
            source: e,
        })?;

        debug!(refspec = %refspec, depth = self.options.depth, "fetching branch");
        let result = remote.fetch(
            &[refspec.as_str()],
            Some(&mut self.fetch_options(Some(self.options.depth))),
            None,
        );
        match result {
            Ok(()) => {}
            Err(_) if self.cancel.is_cancelled() => return Err(StoreError::Cancelled),
            Err(e) if shallow_unsupported(&e) => {
                debug!("transport lacks shallow support, fetching full history");
                remote
                    .fetch(&[refspec.as_str()], Some(&mut self.fetch_options(None)), None)
                    .map_err(|e| {
                        if self.cancel.is_cancelled() {
                            StoreError::Cancelled
                        } else {
                            StoreError::Sync {
                                step: "fetch",
                                source: e,
                            }
                        }
                    })?;
            }
            Err(e) => {
                return Err(StoreError::Sync {
                    step: "fetch",
                    source: e,
                })
            }
        }

        if branch_tip(repo, &branch_ref)?.is_none() {
            debug!(branch = %self.options.branch, "branch has no revision, setting symbolic HEAD");
            repo.set_head(&branch_ref).map_err(|e| StoreError::Sync {
                step: "fetch",
                source: e,
            })?;
        }

        Ok(())
    }

    /// Fetched → CheckedOut: discard local edits and force the working area
    /// onto the branch tip; skipped while the branch is unborn
    fn checkout(&self, repo: &Repository) -> Result<(), StoreError> {
        let branch_ref = self.options.branch_ref();
        let tip = match branch_tip(repo, &branch_ref)? {
            Some(tip) => tip,
            None => {
                debug!(branch = %self.options.branch, "no revision yet, skipping checkout");
                return Ok(());
            }
        };

        let commit = repo.find_commit(tip).map_err(|e| StoreError::Sync {
            step: "checkout",
            source: e,
        })?;

        debug!(tip = %tip, "resetting working area to branch tip");
        repo.reset(commit.as_object(), ResetType::Hard, None)
            .map_err(|e| StoreError::Sync {
                step: "reset",
                source: e,
            })?;

        repo.set_head(&branch_ref).map_err(|e| StoreError::Sync {
            step: "checkout",
            source: e,
        })?;

        let mut checkout = CheckoutBuilder::new();
        checkout.force();
        repo.checkout_head(Some(&mut checkout))
            .map_err(|e| StoreError::Sync {
                step: "checkout",
                source: e,
            })?;

        Ok(())
    }

    fn fetch_options(&self, depth: Option<i32>) -> FetchOptions<'a> {
        let mut fetch = FetchOptions::new();
        fetch.remote_callbacks(remote_callbacks(
            self.credentials,
            &self.options.ssh_user,
            self.cancel,
        ));
        if let Some(depth) = depth {
            fetch.depth(depth);
        }
        fetch
    }

    fn check_cancel(&self) -> Result<(), StoreError> {
        if self.cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        Ok(())
    }
}

fn shallow_unsupported(error: &git2::Error) -> bool {
    error.message().to_lowercase().contains("shallow")
}

/// Tip of a branch reference, `None` while the branch is unborn
pub(crate) fn branch_tip(repo: &Repository, branch_ref: &str) -> Result<Option<Oid>, StoreError> {
    match repo.refname_to_id(branch_ref) {
        Ok(oid) => Ok(Some(oid)),
        Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::Signature;
    use tempfile::TempDir;

    fn seeded_remote(dir: &TempDir, branch: &str, files: &[(&str, &str)]) -> Repository {
        let remote = Repository::init_bare(dir.path().join("remote.git")).unwrap();
        commit_files(&remote, branch, files, "seed");
        remote
    }

    fn commit_files(repo: &Repository, branch: &str, files: &[(&str, &str)], message: &str) -> Oid {
        let mut builder = repo.treebuilder(None).unwrap();
        for (name, content) in files {
            let blob = repo.blob(content.as_bytes()).unwrap();
            builder.insert(name, blob, 0o100644).unwrap();
        }
        let tree_id = builder.write().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = Signature::now("test", "test@example.com").unwrap();
        let refname = format!("refs/heads/{branch}");
        let parent = repo
            .refname_to_id(&refname)
            .ok()
            .map(|oid| repo.find_commit(oid).unwrap());
        let parents: Vec<_> = parent.iter().collect();
        repo.commit(Some(&refname), &sig, &sig, message, &tree, &parents)
            .unwrap()
    }

    fn options(dir: &TempDir) -> RepoOptions {
        RepoOptions::new(dir.path().join("remote.git").to_str().unwrap())
            .with_volume(dir.path().join("mirrors"))
    }

    #[test]
    fn test_converge_empty_remote_initializes_unborn_branch() {
        let dir = TempDir::new().unwrap();
        Repository::init_bare(dir.path().join("remote.git")).unwrap();

        let options = options(&dir);
        let credentials = Credentials::none();
        let cancel = CancelToken::new();
        let sync = Synchronizer::new(&options, &credentials, &cancel);

        let repo = sync.converge().unwrap();
        assert!(branch_tip(&repo, &options.branch_ref()).unwrap().is_none());
        // HEAD symbolic on the unborn branch
        let head = repo.find_reference("HEAD").unwrap();
        assert_eq!(head.symbolic_target(), Some("refs/heads/main"));
    }

    #[test]
    fn test_converge_checks_out_remote_tip() {
        let dir = TempDir::new().unwrap();
        seeded_remote(&dir, "main", &[("note.md", "hello")]);

        let options = options(&dir);
        let credentials = Credentials::none();
        let cancel = CancelToken::new();
        let repo = Synchronizer::new(&options, &credentials, &cancel)
            .converge()
            .unwrap();

        let workdir = repo.workdir().unwrap().to_path_buf();
        let content = std::fs::read_to_string(workdir.join("note.md")).unwrap();
        assert_eq!(content, "hello");
    }

    #[test]
    fn test_converge_is_idempotent() {
        let dir = TempDir::new().unwrap();
        seeded_remote(&dir, "main", &[("note.md", "hello")]);

        let options = options(&dir);
        let credentials = Credentials::none();
        let cancel = CancelToken::new();

        let first = Synchronizer::new(&options, &credentials, &cancel)
            .converge()
            .unwrap();
        let tip_first = branch_tip(&first, &options.branch_ref()).unwrap();
        drop(first);

        let second = Synchronizer::new(&options, &credentials, &cancel)
            .converge()
            .unwrap();
        let tip_second = branch_tip(&second, &options.branch_ref()).unwrap();
        assert_eq!(tip_first, tip_second);
        let content = std::fs::read_to_string(second.workdir().unwrap().join("note.md")).unwrap();
        assert_eq!(content, "hello");
    }

    #[test]
    fn test_converge_discards_local_edits() {
        let dir = TempDir::new().unwrap();
        seeded_remote(&dir, "main", &[("note.md", "hello")]);

        let options = options(&dir);
        let credentials = Credentials::none();
        let cancel = CancelToken::new();
        let sync = Synchronizer::new(&options, &credentials, &cancel);

        let repo = sync.converge().unwrap();
        let note = repo.workdir().unwrap().join("note.md");
        std::fs::write(&note, "scribbled over").unwrap();
        drop(repo);

        let repo = sync.converge().unwrap();
        let content = std::fs::read_to_string(repo.workdir().unwrap().join("note.md")).unwrap();
        assert_eq!(content, "hello");
    }

    #[test]
    fn test_converge_picks_up_remote_advance() {
        let dir = TempDir::new().unwrap();
        let remote = seeded_remote(&dir, "main", &[("note.md", "hello")]);

        let options = options(&dir);
        let credentials = Credentials::none();
        let cancel = CancelToken::new();
        let sync = Synchronizer::new(&options, &credentials, &cancel);
        sync.converge().unwrap();

        commit_files(
            &remote,
            "main",
            &[("note.md", "hello"), ("extra.md", "more")],
            "advance",
        );

        let repo = sync.converge().unwrap();
        let workdir = repo.workdir().unwrap().to_path_buf();
        assert!(workdir.join("extra.md").exists());
        assert_eq!(
            branch_tip(&repo, &options.branch_ref()).unwrap(),
            Some(remote.refname_to_id("refs/heads/main").unwrap())
        );
    }

    #[test]
    fn test_cancelled_token_stops_before_fetch() {
        let dir = TempDir::new().unwrap();
        Repository::init_bare(dir.path().join("remote.git")).unwrap();

        let options = options(&dir);
        let credentials = Credentials::none();
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = Synchronizer::new(&options, &credentials, &cancel)
            .converge()
            .map(|_| ())
            .unwrap_err();
        assert!(matches!(err, StoreError::Cancelled));
    }

    #[test]
    fn test_converge_fails_on_missing_remote() {
        let dir = TempDir::new().unwrap();
        let options = RepoOptions::new(dir.path().join("nowhere.git").to_str().unwrap())
            .with_volume(dir.path().join("mirrors"));
        let credentials = Credentials::none();
        let cancel = CancelToken::new();

        let err = Synchronizer::new(&options, &credentials, &cancel)
            .converge()
            .map(|_| ())
            .unwrap_err();
        assert!(matches!(err, StoreError::Sync { .. }));
    }
}
