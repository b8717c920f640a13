//! HTTP API for the webhook receiver.
//!
//! `/health`, `/status` and the read-only dashboard routes under `/api` are
//! open. `/projects`, `/deploy` and `/reload-config` sit behind
//! [`SignatureLayer`].

pub mod certs;
mod containers;
mod deploy;
pub mod signature;
pub mod system;

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

pub use certs::{CertificateInfo, CertificateReport, CertificateStatus};
pub use containers::{ContainerInfo, ContainerListing};
pub use signature::{SignatureLayer, SIGNATURE_HEADER};
pub use system::SystemStats;

use crate::config::ServiceConfig;
use crate::error::{DeployError, DeployResult};
use crate::lock::{LockManager, LockStatus};
use crate::pipeline::DeploymentPipeline;
use crate::process::{CommandRunner, CommandSpec};
use crate::registry::ProjectRegistry;
use crate::types::{ComposeTarget, Project};

/// Shared application state for the webhook receiver.
pub struct AppState {
    /// Service configuration.
    pub config: ServiceConfig,
    /// Registered projects.
    pub registry: Arc<ProjectRegistry>,
    /// System-wide deployment lock.
    pub locks: LockManager,
    /// Pipeline run for accepted events.
    pub pipeline: DeploymentPipeline,
    /// Runner for read-only engine queries.
    pub runner: Arc<dyn CommandRunner>,
    /// Background deployments still in flight.
    pub tasks: TaskTracker,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("registry", &self.registry)
            .field("locks", &self.locks)
            .field("pipeline", &self.pipeline)
            .finish_non_exhaustive()
    }
}

impl AppState {
    /// Wire the receiver's collaborators from configuration.
    pub fn new(
        config: ServiceConfig,
        registry: Arc<ProjectRegistry>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            locks: LockManager::new(&config.paths.lock_dir),
            pipeline: DeploymentPipeline::new(Arc::clone(&runner), config.engine.clone()),
            registry,
            runner,
            tasks: TaskTracker::new(),
            config,
        }
    }
}

/// Creates the API router.
pub fn router(state: Arc<AppState>) -> Router {
    let authenticated = Router::new()
        .route("/projects", get(list_projects))
        .route("/deploy", post(deploy::deploy))
        .route("/reload-config", post(reload_config))
        .layer(SignatureLayer::new(
            state.config.webhook.secret.clone(),
            state.config.server.max_body_bytes,
        ));

    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(lock_status))
        .route("/api/system", get(system_stats))
        .route("/api/docker", get(list_containers))
        .route("/api/ssl", get(certificate_status))
        .merge(authenticated)
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: DateTime<Utc>,
}

/// Health check endpoint.
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        timestamp: Utc::now(),
    })
}

#[derive(Debug, Default, Serialize)]
struct StatusResponse {
    deploying: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    project: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    started: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stale: Option<bool>,
}

impl From<LockStatus> for StatusResponse {
    fn from(status: LockStatus) -> Self {
        let deploying = status.is_held();
        match status {
            LockStatus::Free => Self::default(),
            LockStatus::Held { record, stale } => Self {
                deploying,
                project: Some(record.project),
                pid: Some(record.pid),
                started: Some(record.acquired_at),
                stale: Some(stale),
            },
            LockStatus::Unreadable => Self {
                deploying,
                stale: Some(true),
                ..Self::default()
            },
        }
    }
}

/// Current lock state.
async fn lock_status(State(state): State<Arc<AppState>>) -> DeployResult<Json<StatusResponse>> {
    Ok(Json(state.locks.status()?.into()))
}

#[derive(Serialize)]
struct ProjectSummary {
    name: String,
    path: PathBuf,
    repos: Vec<String>,
    branch: Vec<String>,
    compose: ComposeTarget,
}

impl From<&Project> for ProjectSummary {
    fn from(project: &Project) -> Self {
        Self {
            name: project.name.clone(),
            path: project.path.clone(),
            repos: project.repositories.clone(),
            branch: project.allowed_branches.clone(),
            compose: project.compose.clone(),
        }
    }
}

#[derive(Serialize)]
struct ProjectsResponse {
    projects: Vec<ProjectSummary>,
}

/// List registered projects.
async fn list_projects(State(state): State<Arc<AppState>>) -> Json<ProjectsResponse> {
    let snapshot = state.registry.snapshot();
    Json(ProjectsResponse {
        projects: snapshot
            .projects()
            .iter()
            .map(|p| ProjectSummary::from(p.as_ref()))
            .collect(),
    })
}

#[derive(Serialize)]
struct ReloadResponse {
    message: &'static str,
    projects: Vec<String>,
}

/// Re-read project descriptors. The previous registry stays active on error.
async fn reload_config(State(state): State<Arc<AppState>>) -> DeployResult<Json<ReloadResponse>> {
    let registry = Arc::clone(&state.registry);
    let snapshot = tokio::task::spawn_blocking(move || registry.reload())
        .await
        .map_err(|e| DeployError::internal(format!("reload task failed: {e}")))??;

    info!(projects = snapshot.len(), "configuration reloaded via API");
    Ok(Json(ReloadResponse {
        message: "Configuration reloaded",
        projects: snapshot.names(),
    }))
}

/// List containers known to the engine.
async fn list_containers(
    State(state): State<Arc<AppState>>,
) -> DeployResult<Json<ContainerListing>> {
    let spec = CommandSpec::new(&state.config.engine.compose_binary).args([
        "ps",
        "-a",
        "--format",
        containers::PS_FORMAT,
    ]);

    let output = state
        .runner
        .run(&spec)
        .await
        .map_err(|e| DeployError::internal(format!("failed to query containers: {e}")))?;

    if !output.success() {
        warn!(
            error = %output.diagnostic_tail(state.config.engine.output_tail_bytes),
            "container listing failed"
        );
        return Ok(Json(ContainerListing::empty()));
    }
    Ok(Json(ContainerListing::parse(&output.stdout)))
}

/// Host resource usage.
async fn system_stats(State(state): State<Arc<AppState>>) -> Json<SystemStats> {
    Json(system::collect(&state.config.monitor, state.runner.as_ref()).await)
}

/// Certificate expiry, most urgent first.
async fn certificate_status(
    State(state): State<Arc<AppState>>,
) -> DeployResult<Json<CertificateReport>> {
    let inspector = certs::CertificateInspector {
        runner: state.runner.as_ref(),
        openssl: &state.config.monitor.openssl_binary,
        warning_days: state.config.monitor.expiry_warning_days,
    };
    let report = inspector
        .report(&state.config.certificates_dir(), Utc::now())
        .await?;
    Ok(Json(report))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::process::CommandOutput;
    use crate::registry::RegistrySource;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use secrecy::SecretString;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const SECRET: &str = "test-secret";

    /// Answers each command with the first reply whose markers all appear
    /// in its command line; anything else succeeds with empty output.
    #[derive(Default)]
    struct Replies(Vec<(Vec<String>, CommandOutput)>);

    impl Replies {
        fn fixed(output: CommandOutput) -> Self {
            Self(vec![(Vec::new(), output)])
        }

        fn on(mut self, markers: &[&str], output: CommandOutput) -> Self {
            let markers = markers.iter().map(|m| (*m).to_owned()).collect();
            self.0.push((markers, output));
            self
        }
    }

    #[async_trait]
    impl CommandRunner for Replies {
        async fn run(&self, spec: &CommandSpec) -> std::io::Result<CommandOutput> {
            let line = format!("{} {}", spec.program, spec.args.join(" "));
            Ok(self
                .0
                .iter()
                .find(|(markers, _)| markers.iter().all(|m| line.contains(m.as_str())))
                .map_or_else(|| CommandOutput::ok(""), |(_, output)| output.clone()))
        }
    }

    fn app_with(
        lock_dir: &TempDir,
        runner: Replies,
        configure: impl FnOnce(&mut ServiceConfig),
    ) -> Router {
        let mut config = ServiceConfig::default();
        config.paths.lock_dir = lock_dir.path().to_owned();
        config.webhook.secret = SecretString::from(SECRET.to_owned());
        configure(&mut config);

        let registry = ProjectRegistry::from_projects(
            RegistrySource::new("/nonexistent", "/srv", "main"),
            Vec::new(),
        )
        .unwrap();
        let state = AppState::new(config, Arc::new(registry), Arc::new(runner));
        router(Arc::new(state))
    }

    fn app(lock_dir: &TempDir, output: CommandOutput) -> Router {
        app_with(lock_dir, Replies::fixed(output), |_| {})
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        (status, body_json(response).await)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_needs_no_auth() {
        let dir = TempDir::new().unwrap();
        let response = app(&dir, CommandOutput::ok(""))
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "healthy");
    }

    #[tokio::test]
    async fn status_reports_free_lock() {
        let dir = TempDir::new().unwrap();
        let response = app(&dir, CommandOutput::ok(""))
            .oneshot(Request::get("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["deploying"], false);
        assert!(body.get("project").is_none());
    }

    #[tokio::test]
    async fn status_reports_holder() {
        let dir = TempDir::new().unwrap();
        let _held = LockManager::new(dir.path())
            .acquire(
                "blog",
                std::time::Duration::ZERO,
                std::time::Duration::ZERO,
            )
            .await
            .unwrap();

        let response = app(&dir, CommandOutput::ok(""))
            .oneshot(Request::get("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["deploying"], true);
        assert_eq!(body["project"], "blog");
        assert_eq!(body["pid"], std::process::id());
        assert_eq!(body["stale"], false);
    }

    #[tokio::test]
    async fn projects_requires_signature() {
        let dir = TempDir::new().unwrap();
        let response = app(&dir, CommandOutput::ok(""))
            .oneshot(Request::get("/projects").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["type"], "auth_error");
    }

    #[tokio::test]
    async fn projects_with_signature_over_empty_body() {
        let dir = TempDir::new().unwrap();
        let request = Request::get("/projects")
            .header(SIGNATURE_HEADER, signature::sign(SECRET.as_bytes(), b"").unwrap())
            .body(Body::empty())
            .unwrap();

        let response = app(&dir, CommandOutput::ok(""))
            .oneshot(request)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["projects"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn containers_are_listed_running_first() {
        let dir = TempDir::new().unwrap();
        let output = CommandOutput::ok("blog\texited\tExited (1)\nproxy\trunning\tUp 2 days\n");
        let response = app(&dir, output)
            .oneshot(Request::get("/api/docker").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let body = body_json(response).await;
        assert_eq!(body["total"], 2);
        assert_eq!(body["running"], 1);
        assert_eq!(body["containers"][0]["name"], "proxy");
    }

    #[tokio::test]
    async fn failed_container_query_yields_empty_listing() {
        let dir = TempDir::new().unwrap();
        let response = app(&dir, CommandOutput::failed(1, "Cannot connect to the Docker daemon"))
            .oneshot(Request::get("/api/docker").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["total"], 0);
    }

    #[tokio::test]
    async fn system_stats_read_configured_sources() {
        let dir = TempDir::new().unwrap();
        let proc_dir = TempDir::new().unwrap();
        std::fs::write(proc_dir.path().join("loadavg"), "0.50 0.40 0.30 1/200 999\n").unwrap();
        std::fs::write(
            proc_dir.path().join("meminfo"),
            "MemTotal: 4000 kB\nMemAvailable: 1000 kB\n",
        )
        .unwrap();
        std::fs::write(proc_dir.path().join("uptime"), "93784.12 1000.00\n").unwrap();
        std::fs::write(proc_dir.path().join("temp"), "51250\n").unwrap();

        let df = CommandOutput::ok(
            "Filesystem 1B-blocks Used Available Use% Mounted on\n/dev/root 1000 250 750 25% /\n",
        );
        let app = app_with(&dir, Replies::default().on(&["df", "-B1"], df), |config| {
            config.monitor.proc_dir = proc_dir.path().to_owned();
            config.monitor.thermal_file = proc_dir.path().join("temp");
        });

        let (status, body) = get_json(app, "/api/system").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["memory"]["total"], 4000 * 1024);
        assert_eq!(body["memory"]["used"], 3000 * 1024);
        assert_eq!(body["disk"]["total"], 1000);
        assert_eq!(body["disk"]["used"], 250);
        assert_eq!(body["temperature"], 51.25);
        assert_eq!(body["uptime"], "1d 2h 3m");
        let cpu = body["cpu"]["percent"].as_f64().unwrap();
        assert!(cpu > 0.0 && cpu <= 100.0);
    }

    #[tokio::test]
    async fn system_stats_tolerate_missing_sources() {
        let dir = TempDir::new().unwrap();
        let app = app_with(
            &dir,
            Replies::fixed(CommandOutput::failed(1, "df: not found")),
            |config| {
                config.monitor.proc_dir = dir.path().join("absent");
                config.monitor.thermal_file = dir.path().join("absent/temp");
            },
        );

        let (status, body) = get_json(app, "/api/system").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["memory"]["total"], 0);
        assert_eq!(body["disk"]["total"], 0);
        assert_eq!(body["temperature"], 0.0);
        assert_eq!(body["uptime"], "unknown");
    }

    #[tokio::test]
    async fn certificates_are_reported_most_urgent_first() {
        let dir = TempDir::new().unwrap();
        let store = TempDir::new().unwrap();
        for name in ["example.org", "broken.net", "soon.dev"] {
            std::fs::create_dir(store.path().join(name)).unwrap();
            std::fs::write(store.path().join(name).join("fullchain.pem"), "").unwrap();
        }
        std::fs::create_dir(store.path().join("no-pem")).unwrap();
        std::fs::write(store.path().join("README"), "certbot").unwrap();

        let not_after = |days: i64| {
            let at = Utc::now() + chrono::Duration::days(days) + chrono::Duration::hours(1);
            CommandOutput::ok(format!("notAfter={}\n", at.format("%b %e %H:%M:%S %Y GMT")))
        };
        let runner = Replies::default()
            .on(&["example.org", "-enddate"], not_after(60))
            .on(&["soon.dev", "-enddate"], not_after(10))
            .on(&["broken.net", "-enddate"], CommandOutput::failed(1, "unable to load"))
            .on(
                &["example.org", "-text"],
                CommandOutput::ok("    DNS:example.org, DNS:www.example.org\n"),
            );
        let app = app_with(&dir, runner, |config| {
            config.monitor.certificates_dir = Some(store.path().to_owned());
        });

        let (status, body) = get_json(app, "/api/ssl").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 3);

        let certs = body["certificates"].as_array().unwrap();
        let names: Vec<_> = certs.iter().map(|c| c["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["soon.dev", "example.org", "broken.net"]);

        assert_eq!(certs[0]["status"], "expiring");
        assert_eq!(certs[0]["days_left"], 10);
        assert_eq!(certs[0]["domains"], serde_json::json!(["soon.dev"]));
        assert_eq!(certs[1]["status"], "valid");
        assert_eq!(
            certs[1]["domains"],
            serde_json::json!(["example.org", "www.example.org"])
        );
        assert_eq!(certs[2]["status"], "error");
        assert!(certs[2]["expiry"].is_null());
    }

    #[tokio::test]
    async fn missing_certificate_store_is_empty() {
        let dir = TempDir::new().unwrap();
        let app = app_with(&dir, Replies::default(), |config| {
            config.monitor.certificates_dir = Some(dir.path().join("live"));
        });

        let (status, body) = get_json(app, "/api/ssl").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 0);
    }
}
