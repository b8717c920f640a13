//! Core types for the deployment orchestrator.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DeployError, PipelineStage};
use crate::sync::SyncOutcome;

/// Unique identifier for a deployment attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttemptId(String);

impl AttemptId {
    /// Generate a new unique attempt ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Return the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where the compose stack of a project is defined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ComposeTarget {
    /// An explicit compose file, optionally with an env-file.
    File {
        /// Compose file path.
        path: PathBuf,
        /// Env-file passed alongside the compose file.
        #[serde(skip_serializing_if = "Option::is_none")]
        env_file: Option<PathBuf>,
    },
    /// A directory searched for a default compose file.
    Directory {
        /// Directory to search.
        path: PathBuf,
    },
}

/// A registered, independently deployable project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Project {
    /// Unique project name.
    pub name: String,
    /// Project root on disk.
    pub path: PathBuf,
    /// Compose stack location.
    pub compose: ComposeTarget,
    /// Branches that trigger a deployment.
    pub allowed_branches: Vec<String>,
    /// Repositories synchronised before a rebuild. Empty means the root itself.
    pub repositories: Vec<String>,
}

impl Project {
    /// Whether a push to `branch` should be deployed.
    #[must_use]
    pub fn allows_branch(&self, branch: &str) -> bool {
        self.allowed_branches.iter().any(|b| b == branch)
    }

    /// Working copies to synchronise, in declaration order.
    ///
    /// Returns `(label, path)` pairs; the project root is used when no
    /// repositories are declared.
    #[must_use]
    pub fn sync_targets(&self) -> Vec<(String, PathBuf)> {
        if self.repositories.is_empty() {
            return vec![(self.name.clone(), self.path.clone())];
        }
        self.repositories
            .iter()
            .map(|repo| (repo.clone(), self.path.join(repo)))
            .collect()
    }
}

/// Push event payload. Only the fields the orchestrator uses are modelled.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PushEvent {
    /// Full ref name, e.g. `refs/heads/main`.
    #[serde(default, rename = "ref")]
    pub git_ref: String,
    /// Repository the push happened in.
    #[serde(default)]
    pub repository: Option<RepositoryInfo>,
    /// Who pushed.
    #[serde(default)]
    pub pusher: Option<PusherInfo>,
}

/// Repository section of a push event.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RepositoryInfo {
    /// Repository name without owner.
    #[serde(default)]
    pub name: Option<String>,
}

/// Pusher section of a push event.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PusherInfo {
    /// Display name of the pusher.
    #[serde(default)]
    pub name: Option<String>,
}

impl PushEvent {
    /// Branch name for `refs/heads/*` refs; `None` for tags and other refs.
    #[must_use]
    pub fn branch(&self) -> Option<&str> {
        self.git_ref
            .strip_prefix("refs/heads/")
            .filter(|b| !b.is_empty())
    }

    /// Repository name, if the payload carries one.
    #[must_use]
    pub fn repository_name(&self) -> Option<&str> {
        self.repository
            .as_ref()
            .and_then(|r| r.name.as_deref())
            .filter(|n| !n.is_empty())
    }

    /// Pusher name for logging.
    #[must_use]
    pub fn pusher_name(&self) -> &str {
        self.pusher
            .as_ref()
            .and_then(|p| p.name.as_deref())
            .unwrap_or("unknown")
    }
}

/// An accepted event bound to a project and branch.
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentAttempt {
    /// Attempt identifier.
    pub id: AttemptId,
    /// Resolved project.
    pub project: String,
    /// Branch to deploy.
    pub branch: String,
    /// Repository named by the event.
    pub repository: String,
    /// Who triggered the event.
    pub pusher: String,
    /// When the event was accepted.
    pub received_at: DateTime<Utc>,
}

impl DeploymentAttempt {
    /// Create an attempt for `project` from an accepted push event.
    #[must_use]
    pub fn new(project: &Project, branch: &str, repository: &str, pusher: &str) -> Self {
        Self {
            id: AttemptId::generate(),
            project: project.name.clone(),
            branch: branch.to_owned(),
            repository: repository.to_owned(),
            pusher: pusher.to_owned(),
            received_at: Utc::now(),
        }
    }
}

/// Per-repository synchronisation result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RepoStatus {
    /// The path is not a working copy; nothing was done.
    NotARepository,
    /// The working copy now matches the remote branch tip.
    Synced {
        /// Revision before synchronisation (absent for an empty history).
        old_revision: Option<String>,
        /// Revision after synchronisation.
        new_revision: String,
    },
    /// Synchronisation failed.
    Failed {
        /// Error message.
        error: String,
    },
}

impl From<SyncOutcome> for RepoStatus {
    fn from(outcome: SyncOutcome) -> Self {
        match outcome {
            SyncOutcome::NotARepository => Self::NotARepository,
            SyncOutcome::Synced {
                old_revision,
                new_revision,
            } => Self::Synced {
                old_revision,
                new_revision,
            },
        }
    }
}

/// Outcome of synchronising one repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepoOutcome {
    /// Repository label.
    pub repository: String,
    /// Working copy path.
    pub path: PathBuf,
    /// What happened.
    #[serde(flatten)]
    pub status: RepoStatus,
}

/// Terminal state of a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PipelineOutcome {
    /// Every stage completed.
    Success,
    /// A stage failed and the remaining stages were skipped.
    Failed {
        /// Failing stage.
        stage: PipelineStage,
        /// Machine-readable error tag.
        error_type: String,
        /// Error message.
        error: String,
    },
}

impl PipelineOutcome {
    /// Build a failed outcome from a pipeline error.
    #[must_use]
    pub fn failed(err: &DeployError) -> Self {
        Self::Failed {
            stage: err.stage().unwrap_or(PipelineStage::Sync),
            error_type: err.error_type().to_owned(),
            error: err.to_string(),
        }
    }
}

/// Structured record of one pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentResult {
    /// Project that was deployed.
    pub project: String,
    /// Branch that was deployed.
    pub branch: String,
    /// Per-repository outcomes, in sync order.
    pub repositories: Vec<RepoOutcome>,
    /// Terminal state.
    pub outcome: PipelineOutcome,
    /// When the pipeline started.
    pub started_at: DateTime<Utc>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

impl DeploymentResult {
    /// Whether the pipeline reached `Success`.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.outcome, PipelineOutcome::Success)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn project(repos: &[&str]) -> Project {
        Project {
            name: "shop".to_owned(),
            path: PathBuf::from("/srv/hosting/shop"),
            compose: ComposeTarget::Directory {
                path: PathBuf::from("/srv/hosting/shop"),
            },
            allowed_branches: vec!["main".to_owned(), "prod".to_owned()],
            repositories: repos.iter().map(|r| (*r).to_owned()).collect(),
        }
    }

    #[rstest]
    #[case("refs/heads/main", Some("main"))]
    #[case("refs/heads/feature/login", Some("feature/login"))]
    #[case("refs/tags/v1.0.0", None)]
    #[case("refs/heads/", None)]
    #[case("", None)]
    fn branch_from_ref(#[case] git_ref: &str, #[case] expected: Option<&str>) {
        let event = PushEvent {
            git_ref: git_ref.to_owned(),
            ..PushEvent::default()
        };
        assert_eq!(event.branch(), expected);
    }

    #[test]
    fn push_event_ignores_unknown_fields() {
        let payload = serde_json::json!({
            "ref": "refs/heads/main",
            "before": "0000",
            "repository": { "name": "shop-api", "full_name": "acme/shop-api" },
            "pusher": { "name": "alice", "email": "alice@example.com" },
            "commits": []
        });
        let event: PushEvent = serde_json::from_value(payload).unwrap();
        assert_eq!(event.branch(), Some("main"));
        assert_eq!(event.repository_name(), Some("shop-api"));
        assert_eq!(event.pusher_name(), "alice");
    }

    #[test]
    fn pusher_defaults_to_unknown() {
        let event: PushEvent = serde_json::from_str(r#"{"ref":"refs/heads/main"}"#).unwrap();
        assert_eq!(event.pusher_name(), "unknown");
        assert_eq!(event.repository_name(), None);
    }

    #[test]
    fn sync_targets_default_to_root() {
        let p = project(&[]);
        assert_eq!(
            p.sync_targets(),
            vec![("shop".to_owned(), PathBuf::from("/srv/hosting/shop"))]
        );

        let p = project(&["shop-api", "shop-web"]);
        let targets = p.sync_targets();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[1].1, PathBuf::from("/srv/hosting/shop/shop-web"));
    }

    #[test]
    fn branch_allow_list() {
        let p = project(&[]);
        assert!(p.allows_branch("prod"));
        assert!(!p.allows_branch("feature-x"));
    }
}
