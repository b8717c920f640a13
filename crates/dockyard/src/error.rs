//! Error types for the deployment orchestrator.

use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::lock::LockError;
use crate::registry::RegistryError;
use crate::sync::SyncError;

/// Pipeline stage for error context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    /// Repository synchronisation.
    Sync,
    /// Compose target resolution.
    Compose,
    /// Container image build.
    Build,
    /// Stack restart and verification.
    Up,
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sync => write!(f, "sync"),
            Self::Compose => write!(f, "compose"),
            Self::Build => write!(f, "build"),
            Self::Up => write!(f, "up"),
        }
    }
}

/// Errors that can occur while receiving and executing a deployment.
#[derive(Debug, Error)]
pub enum DeployError {
    // ─────────────────────────────────────────────────────────────────────────
    // Receiver errors
    // ─────────────────────────────────────────────────────────────────────────
    /// Missing or invalid webhook signature.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Request body could not be interpreted.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Repository is not registered with any project.
    #[error("repository {0} is not configured for deployment")]
    UnknownProject(String),

    /// Another deployment held the lock for the whole wait window.
    #[error("deployment lock not acquired within {waited:?}")]
    LockTimeout {
        /// How long the caller waited.
        waited: Duration,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Pipeline errors
    // ─────────────────────────────────────────────────────────────────────────
    /// Source synchronisation failed for a repository.
    #[error("sync of {repository} failed: {source}")]
    Sync {
        /// Repository name (or the project name for root repositories).
        repository: String,
        /// Underlying failure.
        #[source]
        source: SyncError,
    },

    /// Misconfiguration detected at dispatch time.
    #[error("configuration error: {0}")]
    Config(String),

    /// Project registry could not be loaded.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Container image build failed.
    #[error("container build failed: {0}")]
    Build(String),

    /// Container restart or its verification failed.
    #[error("container restart failed: {0}")]
    Up(String),

    // ─────────────────────────────────────────────────────────────────────────
    // Internal errors
    // ─────────────────────────────────────────────────────────────────────────
    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl DeployError {
    /// Create an authentication error.
    #[must_use]
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Stable machine-readable tag for the error.
    #[must_use]
    pub const fn error_type(&self) -> &'static str {
        match self {
            Self::Auth(_) => "auth_error",
            Self::InvalidPayload(_) => "invalid_payload",
            Self::UnknownProject(_) => "unknown_project",
            Self::LockTimeout { .. } => "lock_timeout",
            Self::Sync { .. } => "sync_error",
            Self::Config(_) | Self::Registry(_) => "config_error",
            Self::Build(_) => "build_error",
            Self::Up(_) => "up_error",
            Self::Io(_) | Self::Internal(_) => "internal_error",
        }
    }

    /// Pipeline stage the error belongs to, if any.
    #[must_use]
    pub const fn stage(&self) -> Option<PipelineStage> {
        match self {
            Self::Sync { .. } => Some(PipelineStage::Sync),
            Self::Config(_) => Some(PipelineStage::Compose),
            Self::Build(_) => Some(PipelineStage::Build),
            Self::Up(_) => Some(PipelineStage::Up),
            _ => None,
        }
    }

    /// HTTP status the receiver answers with.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            Self::UnknownProject(_) => StatusCode::NOT_FOUND,
            Self::LockTimeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Sync { .. }
            | Self::Config(_)
            | Self::Registry(_)
            | Self::Build(_)
            | Self::Up(_)
            | Self::Io(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<LockError> for DeployError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Timeout { waited } => Self::LockTimeout { waited },
            LockError::Io(e) => Self::Io(e),
            LockError::Record(msg) => Self::Internal(msg),
        }
    }
}

/// Error response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error message.
    pub error: String,
    /// Machine-readable error tag.
    #[serde(rename = "type")]
    pub error_type: String,
    /// Failing pipeline stage, for pipeline errors.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<PipelineStage>,
}

impl From<&DeployError> for ErrorResponse {
    fn from(err: &DeployError) -> Self {
        let error = match err {
            // Filesystem details stay in the log.
            DeployError::Io(_) | DeployError::Internal(_) => "Internal server error".to_owned(),
            other => other.to_string(),
        };
        Self {
            error,
            error_type: err.error_type().to_owned(),
            stage: err.stage(),
        }
    }
}

impl IntoResponse for DeployError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(ErrorResponse::from(&self))).into_response()
    }
}

/// Result type alias for deployment operations.
pub type DeployResult<T> = Result<T, DeployError>;
