//! Webhook-driven deployment orchestrator for docker compose stacks.
//!
//! This crate provides:
//! - A project registry loaded from declarative descriptor files
//! - A system-wide deployment lock with stale-holder recovery
//! - Working copy synchronisation against a remote branch
//! - A sync, build and restart pipeline for compose stacks
//! - An HTTP receiver authenticating push events by HMAC signature
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐    ┌──────────────┐    ┌──────────────┐
//! │   Receiver   │───▶│   Registry   │    │     Lock     │
//! │  (HTTP API)  │───────────────────────▶│   Manager    │
//! └──────────────┘    └──────────────┘    └──────────────┘
//!         │
//!         ▼
//!  ┌──────────────┐    ┌──────────────┐
//!  │   Pipeline   │───▶│ Synchronizer │
//!  │ (compose)    │    │    (git)     │
//!  └──────────────┘    └──────────────┘
//! ```
//!
//! Deployments are strictly serial across all projects: every accepted event
//! waits on the lock before touching the filesystem.

pub mod api;
pub mod config;
pub mod error;
pub mod lock;
pub mod pipeline;
pub mod process;
pub mod registry;
pub mod sync;
pub mod types;

// Re-export configuration types
pub use config::{DeployMode, MonitorConfig, ServiceConfig};

// Re-export error types
pub use error::{DeployError, DeployResult, PipelineStage};

// Re-export core types
pub use types::{
    AttemptId, ComposeTarget, DeploymentAttempt, DeploymentResult, PipelineOutcome, Project,
    PushEvent, RepoOutcome, RepoStatus,
};

// Re-export lock types
pub use lock::{LockError, LockHandle, LockManager, LockRecord, LockStatus};

// Re-export registry types
pub use registry::{ProjectRegistry, RegistryError, RegistryResult, RegistrySource};

// Re-export pipeline types
pub use pipeline::{ComposeStack, DeploymentPipeline};
pub use process::{CommandOutput, CommandRunner, CommandSpec, SystemRunner};
pub use sync::{RepoSynchronizer, SyncError, SyncOutcome};

// Re-export API types
pub use api::{router as api_router, AppState};
