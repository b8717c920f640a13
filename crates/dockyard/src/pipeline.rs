//! Deployment pipeline.
//!
//! Sync every repository, resolve the compose stack, then build, restart and
//! verify it. Each step is a hard boundary: the first failure ends the run.
//! A best-effort image prune follows a successful restart.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{error, info, instrument, warn};

use crate::config::EngineConfig;
use crate::error::{DeployError, DeployResult, PipelineStage};
use crate::process::{CommandOutput, CommandRunner, CommandSpec};
use crate::sync::RepoSynchronizer;
use crate::types::{
    ComposeTarget, DeploymentResult, PipelineOutcome, Project, RepoOutcome, RepoStatus,
};

/// Compose file names searched in a directory, in order of preference.
pub const DEFAULT_COMPOSE_FILES: [&str; 2] = ["docker-compose.yml", "docker-compose.yaml"];

/// Env-file picked up automatically next to a compose file.
pub const DEFAULT_ENV_FILE: &str = ".env";

/// A resolved compose stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeStack {
    /// Compose file.
    pub file: PathBuf,
    /// Env-file passed with `--env-file`.
    pub env_file: Option<PathBuf>,
}

impl ComposeStack {
    /// Resolve the compose stack of `project`.
    ///
    /// An explicit compose file wins; otherwise the target directory is
    /// searched for [`DEFAULT_COMPOSE_FILES`]. Without an explicit env-file, a
    /// `.env` next to the compose file is used when present.
    pub fn resolve(project: &Project) -> DeployResult<Self> {
        let (file, env_file) = match &project.compose {
            ComposeTarget::File { path, env_file } => {
                if !path.is_file() {
                    return Err(DeployError::Config(format!(
                        "compose file {} does not exist",
                        path.display()
                    )));
                }
                (path.clone(), env_file.clone())
            }
            ComposeTarget::Directory { path } => {
                let file = DEFAULT_COMPOSE_FILES
                    .iter()
                    .map(|name| path.join(name))
                    .find(|candidate| candidate.is_file())
                    .ok_or_else(|| {
                        DeployError::Config(format!(
                            "no compose file found in {}",
                            path.display()
                        ))
                    })?;
                (file, None)
            }
        };

        let env_file = match env_file {
            Some(env) if env.is_file() => Some(env),
            Some(env) => {
                return Err(DeployError::Config(format!(
                    "env file {} does not exist",
                    env.display()
                )));
            }
            None => file
                .parent()
                .map(|dir| dir.join(DEFAULT_ENV_FILE))
                .filter(|env| env.is_file()),
        };

        Ok(Self { file, env_file })
    }

    /// Directory compose commands run in.
    #[must_use]
    pub fn workdir(&self) -> &Path {
        self.file.parent().unwrap_or_else(|| Path::new("."))
    }

    fn base_args(&self) -> Vec<String> {
        let mut args = vec![
            "compose".to_owned(),
            "-f".to_owned(),
            self.file.display().to_string(),
        ];
        if let Some(env) = &self.env_file {
            args.push("--env-file".to_owned());
            args.push(env.display().to_string());
        }
        args
    }
}

/// Runs the sync, build and restart sequence for one project.
#[derive(Clone)]
pub struct DeploymentPipeline {
    runner: Arc<dyn CommandRunner>,
    synchronizer: RepoSynchronizer,
    engine: EngineConfig,
}

impl std::fmt::Debug for DeploymentPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentPipeline")
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

impl DeploymentPipeline {
    /// Create a pipeline running external tools through `runner`.
    pub fn new(runner: Arc<dyn CommandRunner>, engine: EngineConfig) -> Self {
        let synchronizer = RepoSynchronizer::new(
            Arc::clone(&runner),
            engine.git_binary.clone(),
            engine.output_tail_bytes,
        );
        Self {
            runner,
            synchronizer,
            engine,
        }
    }

    /// Deploy `branch` of `project`.
    ///
    /// Never fails: errors become the [`PipelineOutcome`] of the result and
    /// are logged once here with their stage.
    #[instrument(skip(self, project), fields(project = %project.name))]
    pub async fn run(&self, project: &Project, branch: &str) -> DeploymentResult {
        let started_at = Utc::now();
        let clock = Instant::now();
        let mut repositories = Vec::new();

        info!("deployment started");
        let outcome = match self.execute(project, branch, &mut repositories).await {
            Ok(()) => PipelineOutcome::Success,
            Err(err) => {
                error!(
                    stage = %err.stage().unwrap_or(PipelineStage::Sync),
                    error = %err,
                    "deployment failed"
                );
                PipelineOutcome::failed(&err)
            }
        };

        let duration_ms = u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX);
        if matches!(outcome, PipelineOutcome::Success) {
            info!(duration_ms, "deployment finished");
        }

        DeploymentResult {
            project: project.name.clone(),
            branch: branch.to_owned(),
            repositories,
            outcome,
            started_at,
            duration_ms,
        }
    }

    async fn execute(
        &self,
        project: &Project,
        branch: &str,
        repositories: &mut Vec<RepoOutcome>,
    ) -> DeployResult<()> {
        for (repository, path) in project.sync_targets() {
            match self.synchronizer.sync(&path, branch).await {
                Ok(outcome) => repositories.push(RepoOutcome {
                    repository,
                    path,
                    status: RepoStatus::from(outcome),
                }),
                Err(source) => {
                    repositories.push(RepoOutcome {
                        repository: repository.clone(),
                        path,
                        status: RepoStatus::Failed {
                            error: source.to_string(),
                        },
                    });
                    return Err(DeployError::Sync { repository, source });
                }
            }
        }

        let stack = ComposeStack::resolve(project)?;
        info!(
            compose_file = %stack.file.display(),
            env_file = ?stack.env_file,
            "compose stack resolved"
        );

        self.compose(&stack, &["build"], PipelineStage::Build).await?;
        self.compose(&stack, &["up", "-d", "--force-recreate"], PipelineStage::Up)
            .await?;
        let listing = self.compose(&stack, &["ps"], PipelineStage::Up).await?;
        info!(containers = %listing.stdout.trim(), "stack restarted");

        self.prune().await;
        Ok(())
    }

    async fn compose(
        &self,
        stack: &ComposeStack,
        step: &[&str],
        stage: PipelineStage,
    ) -> DeployResult<CommandOutput> {
        let spec = CommandSpec::new(&self.engine.compose_binary)
            .args(stack.base_args())
            .args(step.iter().copied())
            .current_dir(stack.workdir());

        info!(command = %spec, "running compose step");
        let fail = |message: String| match stage {
            PipelineStage::Build => DeployError::Build(message),
            _ => DeployError::Up(message),
        };

        let output = self
            .runner
            .run(&spec)
            .await
            .map_err(|e| fail(format!("failed to run {}: {e}", spec.program)))?;

        if !output.success() {
            return Err(fail(format!(
                "`{}` failed: {}",
                step.join(" "),
                output.diagnostic_tail(self.engine.output_tail_bytes)
            )));
        }
        Ok(output)
    }

    /// Remove unused images older than the retention window. Failures only warn.
    async fn prune(&self) {
        let spec = CommandSpec::new(&self.engine.compose_binary).args([
            "image".to_owned(),
            "prune".to_owned(),
            "-af".to_owned(),
            "--filter".to_owned(),
            format!("until={}h", self.engine.prune_retention_hours),
        ]);

        match self.runner.run(&spec).await {
            Ok(out) if out.success() => info!("old images pruned"),
            Ok(out) => warn!(
                error = %out.diagnostic_tail(self.engine.output_tail_bytes),
                "image prune failed"
            ),
            Err(e) => warn!(error = %e, "image prune could not run"),
        }
    }
}
