//! Repository handle options
//!
//! `RepoOptions` describes one remote/branch pair and where its local mirror
//! lives. The mirror path is a pure function of (volume, remote host, remote
//! path), computed once at construction time, so two handles for the same
//! remote land in the same directory without any process-global state.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::KeyrowError;

/// Default branch synchronized and published
pub const DEFAULT_BRANCH: &str = "main";

/// Default base directory for local mirrors
pub const DEFAULT_VOLUME: &str = "keyrow-data";

/// Default user for scp-style ssh remotes
pub const DEFAULT_SSH_USER: &str = "git";

/// Default history depth retained by the local mirror
///
/// Depth 1 keeps transfer and storage minimal; listing then reports the tip
/// revision for keys whose true last modification predates the retained
/// window. Raise the depth when exact attribution matters.
pub const DEFAULT_DEPTH: i32 = 1;

/// Options for one repository handle, stored as TOML when persisted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoOptions {
    /// Remote address (scp-style, URL, or local path)
    pub remote: String,
    /// Branch synchronized and published
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Base directory under which mirrors are placed
    #[serde(default = "default_volume")]
    pub volume: PathBuf,
    /// History depth retained by clone and fetch
    #[serde(default = "default_depth")]
    pub depth: i32,
    /// User name for ssh remotes
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    /// Author and committer name for created revisions
    #[serde(default = "default_author_name")]
    pub author_name: String,
    /// Author and committer email for created revisions
    #[serde(default = "default_author_email")]
    pub author_email: String,
}

fn default_branch() -> String {
    DEFAULT_BRANCH.to_string()
}

fn default_volume() -> PathBuf {
    PathBuf::from(DEFAULT_VOLUME)
}

fn default_depth() -> i32 {
    DEFAULT_DEPTH
}

fn default_ssh_user() -> String {
    DEFAULT_SSH_USER.to_string()
}

fn default_author_name() -> String {
    "keyrow".to_string()
}

fn default_author_email() -> String {
    "keyrow@localhost".to_string()
}

impl RepoOptions {
    /// Options for a remote with all defaults
    pub fn new(remote: impl Into<String>) -> Self {
        Self {
            remote: remote.into(),
            branch: default_branch(),
            volume: default_volume(),
            depth: default_depth(),
            ssh_user: default_ssh_user(),
            author_name: default_author_name(),
            author_email: default_author_email(),
        }
    }

    /// Override the branch
    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = branch.into();
        self
    }

    /// Override the mirror base directory
    pub fn with_volume(mut self, volume: impl Into<PathBuf>) -> Self {
        self.volume = volume.into();
        self
    }

    /// Override the retained history depth
    pub fn with_depth(mut self, depth: i32) -> Self {
        self.depth = depth;
        self
    }

    /// Override the ssh user
    pub fn with_ssh_user(mut self, user: impl Into<String>) -> Self {
        self.ssh_user = user.into();
        self
    }

    /// Override the revision author identity
    pub fn with_author(mut self, name: impl Into<String>, email: impl Into<String>) -> Self {
        self.author_name = name.into();
        self.author_email = email.into();
        self
    }

    /// Check the options are usable before opening a handle
    pub fn validate(&self) -> Result<(), KeyrowError> {
        if self.remote.trim().is_empty() {
            return Err(KeyrowError::InvalidOptions("remote is empty".to_string()));
        }
        if self.branch.trim().is_empty() {
            return Err(KeyrowError::InvalidOptions("branch is empty".to_string()));
        }
        if self.depth < 1 {
            return Err(KeyrowError::InvalidOptions(format!(
                "depth must be at least 1, got {}",
                self.depth
            )));
        }
        Ok(())
    }

    /// Local mirror directory for this remote: `<volume>/<host>/<path>`
    pub fn mirror_dir(&self) -> PathBuf {
        let (host, path) = split_remote(&self.remote);
        let mut dir = self.volume.clone();
        dir.push(host);
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            dir.push(segment);
        }
        dir
    }

    /// Fully qualified ref name of the configured branch
    pub fn branch_ref(&self) -> String {
        format!("refs/heads/{}", self.branch)
    }
}

/// Split a remote address into (host, path) for mirror placement
///
/// Handles scp-style `user@host:path`, URL-style `scheme://[user@]host/path`,
/// and plain local paths (bucketed under "local"). This is placement only,
/// not URL normalization; the address is passed to the transport verbatim.
fn split_remote(remote: &str) -> (String, String) {
    if let Some(rest) = remote.split_once("://").map(|(_, r)| r) {
        let (authority, path) = match rest.split_once('/') {
            Some((a, p)) => (a, p),
            None => (rest, ""),
        };
        let host = authority.rsplit_once('@').map_or(authority, |(_, h)| h);
        let host = host.split_once(':').map_or(host, |(h, _)| h);
        return (host.to_string(), path.to_string());
    }

    // scp-style: user@host:path
    if let Some((authority, path)) = remote.split_once(':') {
        if let Some((_, host)) = authority.rsplit_once('@') {
            return (host.to_string(), path.to_string());
        }
    }

    ("local".to_string(), remote.trim_start_matches('/').to_string())
}

/// Load options from a TOML file
pub fn load_options(path: &Path) -> Result<Option<RepoOptions>, KeyrowError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)?;
    let options: RepoOptions = toml::from_str(&content)?;
    Ok(Some(options))
}

/// Save options to a TOML file
pub fn save_options(path: &Path, options: &RepoOptions) -> Result<(), KeyrowError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = toml::to_string_pretty(options)?;
    std::fs::write(path, content)?;
    Ok(())
}
