//! Common test utilities for dockyard integration tests.

#![allow(dead_code, clippy::unwrap_used)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::Request;
use axum::response::Response;
use axum::Router;
use dockyard::api::signature;
use dockyard::{
    api, CommandOutput, CommandRunner, CommandSpec, DeployMode, ProjectRegistry, RegistrySource,
    ServiceConfig,
};
use parking_lot::Mutex;
use secrecy::SecretString;
use tempfile::TempDir;
use tower::ServiceExt;

/// Shared webhook secret used by every fixture.
pub const SECRET: &str = "integration-secret";

/// Records every command and fails those whose arguments contain a marker.
#[derive(Default)]
pub struct FakeRunner {
    fail_on: Mutex<Option<String>>,
    calls: Mutex<Vec<String>>,
}

impl FakeRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail any later command whose argument line contains `marker`.
    pub fn fail_on(&self, marker: &str) {
        *self.fail_on.lock() = Some(marker.to_owned());
    }

    /// Every command run so far, as `program args...`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Commands run for `program`, arguments only.
    pub fn calls_to(&self, program: &str) -> Vec<String> {
        let prefix = format!("{program} ");
        self.calls()
            .iter()
            .filter_map(|c| c.strip_prefix(&prefix).map(str::to_owned))
            .collect()
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, spec: &CommandSpec) -> std::io::Result<CommandOutput> {
        let line = spec.args.join(" ");
        self.calls.lock().push(format!("{} {line}", spec.program));

        if let Some(marker) = self.fail_on.lock().as_deref() {
            if line.contains(marker) {
                return Ok(CommandOutput::failed(1, format!("{line}: simulated failure")));
            }
        }
        if line == "rev-parse HEAD" {
            return Ok(CommandOutput::ok("4b825dc642cb6eb9a060e54bf8d69288fbee4904\n"));
        }
        Ok(CommandOutput::ok(""))
    }
}

/// A complete receiver wired to temporary directories and a [`FakeRunner`].
pub struct TestService {
    pub hosting: TempDir,
    pub projects: TempDir,
    pub locks: TempDir,
    pub runner: Arc<FakeRunner>,
    pub state: Arc<api::AppState>,
}

impl TestService {
    /// Build a receiver over the given descriptors (`file name`, `content`).
    pub fn new(mode: DeployMode, descriptors: &[(&str, &str)]) -> Self {
        let hosting = TempDir::new().unwrap();
        let projects = TempDir::new().unwrap();
        let locks = TempDir::new().unwrap();
        for (name, content) in descriptors {
            std::fs::write(projects.path().join(name), content).unwrap();
        }

        let mut config = ServiceConfig::default();
        config.paths.hosting_dir = hosting.path().to_owned();
        config.paths.projects_dir = projects.path().to_owned();
        config.paths.lock_dir = locks.path().to_owned();
        config.webhook.secret = SecretString::from(SECRET.to_owned());
        config.webhook.mode = mode;
        config.lock.timeout_secs = 1;
        config.lock.retry_interval_secs = 1;

        let registry = ProjectRegistry::load(RegistrySource::new(
            projects.path(),
            hosting.path(),
            "main",
        ))
        .unwrap();

        let runner = FakeRunner::new();
        let state = Arc::new(api::AppState::new(
            config,
            Arc::new(registry),
            runner.clone(),
        ));

        Self {
            hosting,
            projects,
            locks,
            runner,
            state,
        }
    }

    pub fn router(&self) -> Router {
        api::router(Arc::clone(&self.state))
    }

    /// Create a project directory with a compose file, optionally as a working copy.
    pub fn add_checkout(&self, relative: &str, working_copy: bool) -> PathBuf {
        let dir = self.hosting.path().join(relative);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("docker-compose.yml"), "services: {}\n").unwrap();
        if working_copy {
            std::fs::create_dir_all(dir.join(".git")).unwrap();
        }
        dir
    }

    pub fn write_descriptor(&self, name: &str, content: &str) {
        std::fs::write(self.projects.path().join(name), content).unwrap();
    }

    /// POST a signed push event to `/deploy`.
    pub async fn push(&self, repository: &str, git_ref: &str) -> Response {
        let body = push_payload(repository, git_ref);
        self.router()
            .oneshot(signed_request("POST", "/deploy", &body))
            .await
            .unwrap()
    }

    /// Wait for every background deployment to finish.
    pub async fn drain(&self) {
        self.state.tasks.close();
        self.state.tasks.wait().await;
    }

    pub fn lock_path(&self) -> &Path {
        self.state.locks.record_path()
    }
}

/// A minimal push event payload.
pub fn push_payload(repository: &str, git_ref: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "ref": git_ref,
        "repository": { "name": repository, "full_name": format!("ops/{repository}") },
        "pusher": { "name": "octocat" },
        "head_commit": { "message": "ship it" }
    }))
    .unwrap()
}

/// A request signed with [`SECRET`].
pub fn signed_request(method: &str, uri: &str, body: &[u8]) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .header(
            signature::SIGNATURE_HEADER,
            signature::sign(SECRET.as_bytes(), body).unwrap(),
        )
        .body(Body::from(body.to_vec()))
        .unwrap()
}

pub async fn body_json(response: Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
