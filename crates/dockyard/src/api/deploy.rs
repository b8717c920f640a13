//! Push event intake.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::{error, info, info_span, Instrument};

use super::AppState;
use crate::config::DeployMode;
use crate::error::{DeployError, DeployResult};
use crate::types::{DeploymentAttempt, DeploymentResult, Project, PushEvent};

/// Body returned when an event is queued for background deployment.
#[derive(Debug, Serialize)]
struct AcceptedResponse {
    status: &'static str,
    attempt_id: String,
    project: String,
    repository: String,
    branch: String,
    triggered_by: String,
}

/// Body returned when an event does not lead to a deployment.
#[derive(Debug, Serialize)]
struct SkippedResponse {
    status: &'static str,
    message: String,
}

/// Body returned by a synchronous deployment.
#[derive(Debug, Serialize)]
struct CompletedResponse {
    status: &'static str,
    attempt_id: String,
    #[serde(flatten)]
    result: DeploymentResult,
}

fn skipped(message: String) -> Response {
    info!(reason = %message, "deployment skipped");
    (
        StatusCode::OK,
        Json(SkippedResponse {
            status: "skipped",
            message,
        }),
    )
        .into_response()
}

/// Handle a verified push event.
pub(super) async fn deploy(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> DeployResult<Response> {
    let event: PushEvent = serde_json::from_slice(&body)
        .map_err(|e| DeployError::InvalidPayload(e.to_string()))?;
    let repository = event
        .repository_name()
        .ok_or_else(|| DeployError::InvalidPayload("missing repository.name".to_owned()))?;

    let project = state.registry.resolve(repository)?;

    let Some(branch) = event.branch() else {
        return Ok(skipped(format!("{} is not a branch push", event.git_ref)));
    };
    if !project.allows_branch(branch) {
        return Ok(skipped(format!(
            "branch {branch} is not deployed for {}",
            project.name
        )));
    }

    let attempt = DeploymentAttempt::new(&project, branch, repository, event.pusher_name());
    let span = info_span!(
        "deployment",
        attempt_id = %attempt.id,
        project = %attempt.project,
        branch = %attempt.branch,
        repository = %attempt.repository,
        pusher = %attempt.pusher,
    );
    span.in_scope(|| info!("push event accepted"));

    match state.config.webhook.mode {
        DeployMode::Background => {
            let response = AcceptedResponse {
                status: "accepted",
                attempt_id: attempt.id.to_string(),
                project: attempt.project.clone(),
                repository: attempt.repository.clone(),
                branch: attempt.branch.clone(),
                triggered_by: attempt.pusher.clone(),
            };

            let task_state = Arc::clone(&state);
            state.tasks.spawn(
                async move {
                    if let Err(e) = execute(&task_state, &project, &attempt).await {
                        error!(error = %e, "deployment did not run");
                    }
                }
                .instrument(span),
            );

            Ok((StatusCode::ACCEPTED, Json(response)).into_response())
        }
        DeployMode::Synchronous => {
            let result = execute(&state, &project, &attempt).instrument(span).await?;
            let (status, label) = if result.is_success() {
                (StatusCode::OK, "success")
            } else {
                (StatusCode::INTERNAL_SERVER_ERROR, "failed")
            };
            Ok((
                status,
                Json(CompletedResponse {
                    status: label,
                    attempt_id: attempt.id.to_string(),
                    result,
                }),
            )
                .into_response())
        }
    }
}

/// Run the pipeline for `attempt` under the deployment lock.
async fn execute(
    state: &AppState,
    project: &Project,
    attempt: &DeploymentAttempt,
) -> DeployResult<DeploymentResult> {
    let lock = state
        .locks
        .acquire(
            &project.name,
            state.config.lock.timeout(),
            state.config.lock.retry_interval(),
        )
        .await?;

    let result = state.pipeline.run(project, &attempt.branch).await;

    if let Err(e) = lock.release() {
        error!(error = %e, "failed to release deployment lock");
    }
    Ok(result)
}
