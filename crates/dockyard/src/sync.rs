//! Working copy synchronisation.
//!
//! Brings a local working copy to the exact tip of a remote branch: fetch,
//! then hard reset. Untracked files are left alone since deployments keep
//! secrets and generated artefacts next to the sources.

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::process::{CommandOutput, CommandRunner, CommandSpec};

/// Remote every working copy is synchronised against.
const REMOTE: &str = "origin";

/// Synchronisation errors.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Branch name rejected before reaching git.
    #[error("invalid branch name {0:?}")]
    InvalidBranch(String),

    /// The git binary could not be started.
    #[error("failed to run git: {0}")]
    Spawn(#[source] std::io::Error),

    /// `git fetch` failed.
    #[error("fetch failed: {0}")]
    Fetch(String),

    /// `git reset --hard` failed.
    #[error("reset to origin/{branch} failed: {message}")]
    Reset {
        /// Target branch.
        branch: String,
        /// Trailing git output.
        message: String,
    },

    /// HEAD could not be resolved after the reset.
    #[error("could not resolve HEAD: {0}")]
    Revision(String),
}

/// Result of a successful synchronisation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The path is not a working copy; nothing was done.
    NotARepository,
    /// The working copy matches the remote branch tip.
    Synced {
        /// HEAD before the reset; `None` when the history was empty.
        old_revision: Option<String>,
        /// HEAD after the reset.
        new_revision: String,
    },
}

/// Reject branch names that git could read as options or revision ranges.
pub fn validate_branch(branch: &str) -> Result<(), SyncError> {
    let invalid = branch.is_empty()
        || branch.starts_with('-')
        || branch.contains("..")
        || branch.chars().any(|c| c.is_whitespace() || c.is_control());
    if invalid {
        return Err(SyncError::InvalidBranch(branch.to_owned()));
    }
    Ok(())
}

/// Runs git against working copies.
#[derive(Clone)]
pub struct RepoSynchronizer {
    runner: Arc<dyn CommandRunner>,
    git: String,
    tail_bytes: usize,
}

impl std::fmt::Debug for RepoSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepoSynchronizer")
            .field("git", &self.git)
            .finish_non_exhaustive()
    }
}

impl RepoSynchronizer {
    /// Create a synchroniser running `git_binary` through `runner`.
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        git_binary: impl Into<String>,
        tail_bytes: usize,
    ) -> Self {
        Self {
            runner,
            git: git_binary.into(),
            tail_bytes,
        }
    }

    /// Make the working copy at `path` match `origin/<branch>`.
    ///
    /// A path without a `.git` entry is not a working copy and is reported
    /// as [`SyncOutcome::NotARepository`] rather than an error.
    #[instrument(skip(self, path), fields(path = %path.display()))]
    pub async fn sync(&self, path: &Path, branch: &str) -> Result<SyncOutcome, SyncError> {
        if !path.join(".git").exists() {
            debug!("not a working copy, skipping");
            return Ok(SyncOutcome::NotARepository);
        }
        validate_branch(branch)?;

        let old_revision = self.head(path).await?;

        let fetch = self.git(path, ["fetch", REMOTE]).await?;
        if !fetch.success() {
            return Err(SyncError::Fetch(fetch.diagnostic_tail(self.tail_bytes)));
        }

        let target = format!("{REMOTE}/{branch}");
        let reset = self.git(path, ["reset", "--hard", target.as_str()]).await?;
        if !reset.success() {
            return Err(SyncError::Reset {
                branch: branch.to_owned(),
                message: reset.diagnostic_tail(self.tail_bytes),
            });
        }

        let new_revision = self
            .head(path)
            .await?
            .ok_or_else(|| SyncError::Revision(format!("no commit at {target}")))?;

        info!(
            old = old_revision.as_deref().unwrap_or("none"),
            new = %new_revision,
            changed = old_revision.as_deref() != Some(new_revision.as_str()),
            "working copy synchronised"
        );

        Ok(SyncOutcome::Synced {
            old_revision,
            new_revision,
        })
    }

    /// Current HEAD, or `None` if it does not resolve (empty history).
    async fn head(&self, path: &Path) -> Result<Option<String>, SyncError> {
        let out = self.git(path, ["rev-parse", "HEAD"]).await?;
        if !out.success() {
            return Ok(None);
        }
        let rev = out.stdout.trim();
        Ok((!rev.is_empty()).then(|| rev.to_owned()))
    }

    async fn git<const N: usize>(
        &self,
        path: &Path,
        args: [&str; N],
    ) -> Result<CommandOutput, SyncError> {
        let spec = CommandSpec::new(&self.git).args(args).current_dir(path);
        self.runner.run(&spec).await.map_err(SyncError::Spawn)
    }
}
