//! Key enumeration and last-revision resolution
//!
//! Listing walks the branch tip's tree and yields one entry per blob, with a
//! lazy content accessor bound to the blob and the key's last-modifying
//! revision. Resolution walks backward from the tip over the locally
//! retained history and picks the nearest revision whose tree differs from
//! its first parent at the key's path.
//!
//! The mirror keeps only a depth-bounded suffix of history, so a key whose
//! last modification predates the retained window resolves to the tip
//! revision. That is a documented approximation, not an error; raise the
//! handle's depth for exact attribution.

use std::collections::HashMap;
use std::fmt;
use std::io::Cursor;
use std::path::Path;

use git2::{ObjectType, Oid, Repository, Tree, TreeWalkMode, TreeWalkResult};
use libkeyrow_core::Key;

use crate::error::StoreError;

/// One listed key with lazy content and its last-modifying revision
pub struct Entry<'repo> {
    repo: &'repo Repository,
    key: String,
    blob: Oid,
    last_revision: Oid,
}

impl<'repo> Entry<'repo> {
    /// The normalized key
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Identifier of the blob holding this entry's content
    pub fn blob_id(&self) -> Oid {
        self.blob
    }

    /// The last revision that touched this key within the retained history,
    /// or the tip revision when the touching revision is outside the window
    pub fn last_revision(&self) -> Oid {
        self.last_revision
    }

    /// Read the entry's content; each call reads the blob afresh
    pub fn content(&self) -> Result<Vec<u8>, StoreError> {
        let blob = self.repo.find_blob(self.blob)?;
        Ok(blob.content().to_vec())
    }

    /// A fresh reader over the entry's content
    pub fn reader(&self) -> Result<Cursor<Vec<u8>>, StoreError> {
        Ok(Cursor::new(self.content()?))
    }
}

impl fmt::Debug for Entry<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("key", &self.key)
            .field("blob", &self.blob)
            .field("last_revision", &self.last_revision)
            .finish()
    }
}

/// Entries listed from one branch tip, in tree traversal order
#[derive(Debug, Default)]
pub struct Entries<'repo> {
    entries: Vec<Entry<'repo>>,
}

impl<'repo> Entries<'repo> {
    pub(crate) fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Entry<'repo>> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Find an entry by its normalized key
    pub fn get(&self, key: &str) -> Option<&Entry<'repo>> {
        self.entries.iter().find(|entry| entry.key == key)
    }
}

impl<'repo> IntoIterator for Entries<'repo> {
    type Item = Entry<'repo>;
    type IntoIter = std::vec::IntoIter<Entry<'repo>>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<'a, 'repo> IntoIterator for &'a Entries<'repo> {
    type Item = &'a Entry<'repo>;
    type IntoIter = std::slice::Iter<'a, Entry<'repo>>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// Index over the locally retained revision history of one branch tip
///
/// Built from a first-parent walk starting at the tip; the walk ends at the
/// retained-history boundary (shallow mirror) or at a root revision.
pub struct CommitGraph {
    commits: Vec<Oid>,
}

impl CommitGraph {
    /// Collect the retained revisions reachable from `tip`, tip first
    pub fn build(repo: &Repository, tip: Oid) -> Result<Self, StoreError> {
        let mut revwalk = repo.revwalk()?;
        revwalk.simplify_first_parent()?;
        revwalk.push(tip)?;

        let mut commits = Vec::new();
        for entry in revwalk {
            match entry {
                Ok(oid) => commits.push(oid),
                // the walk ran off the retained window
                Err(_) => break,
            }
        }
        if commits.is_empty() {
            commits.push(tip);
        }

        Ok(Self { commits })
    }

    /// Number of retained revisions in the index
    pub fn len(&self) -> usize {
        self.commits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commits.is_empty()
    }

    /// Resolve, per path, the nearest retained revision whose tree differs
    /// from its first parent at that path
    ///
    /// Paths not resolved within the retained window are absent from the
    /// result; callers fall back to the tip revision for them.
    pub fn last_commit_for_paths(
        &self,
        repo: &Repository,
        paths: &[String],
    ) -> Result<HashMap<String, Oid>, StoreError> {
        let mut resolved = HashMap::new();
        let mut unresolved: Vec<&String> = paths.iter().collect();

        'walk: for &oid in &self.commits {
            if unresolved.is_empty() {
                break;
            }

            let commit = match repo.find_commit(oid) {
                Ok(commit) => commit,
                Err(_) => break,
            };
            let tree = commit.tree()?;

            let parent_tree = if commit.parent_count() == 0 {
                None
            } else {
                match commit.parent(0) {
                    Ok(parent) => Some(parent.tree()?),
                    // first parent lies outside the retained window; nothing
                    // further back is comparable
                    Err(_) => break 'walk,
                }
            };

            unresolved.retain(|path| {
                let here = tree_entry_id(&tree, path);
                let touched = match parent_tree {
                    Some(ref parent_tree) => here != tree_entry_id(parent_tree, path),
                    // a root revision introduced everything it carries
                    None => here.is_some(),
                };
                if touched {
                    resolved.insert((*path).clone(), oid);
                }
                !touched
            });
        }

        Ok(resolved)
    }
}

fn tree_entry_id(tree: &Tree<'_>, path: &str) -> Option<Oid> {
    tree.get_path(Path::new(path)).ok().map(|entry| entry.id())
}

/// List all keys at `tip`, optionally filtered by exact parent directory
///
/// The filter keeps entries whose immediate parent directory equals the
/// (normalized) prefix; it is not a general path-prefix match, so a prefix
/// of `a/b` excludes `a/b/c/d`.
pub(crate) fn list_at<'repo>(
    repo: &'repo Repository,
    tip: Oid,
    prefix: Option<&str>,
) -> Result<Entries<'repo>, StoreError> {
    let commit = repo.find_commit(tip)?;
    let tree = commit.tree()?;

    let mut files: Vec<(String, Oid)> = Vec::new();
    tree.walk(TreeWalkMode::PreOrder, |root, entry| {
        if entry.kind() == Some(ObjectType::Blob) {
            if let Some(name) = entry.name() {
                files.push((format!("{root}{name}"), entry.id()));
            }
        }
        TreeWalkResult::Ok
    })?;

    if let Some(prefix) = prefix {
        files.retain(|(path, _)| Key::parent_of(path) == Some(prefix));
    }

    let graph = CommitGraph::build(repo, tip)?;
    let paths: Vec<String> = files.iter().map(|(path, _)| path.clone()).collect();
    let last = graph.last_commit_for_paths(repo, &paths)?;

    let entries = files
        .into_iter()
        .map(|(key, blob)| {
            let last_revision = last.get(&key).copied().unwrap_or(tip);
            Entry {
                repo,
                key,
                blob,
                last_revision,
            }
        })
        .collect();

    Ok(Entries { entries })
}
