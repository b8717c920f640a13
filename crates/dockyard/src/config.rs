//! Service configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};

use crate::error::{DeployError, DeployResult};

/// Webhook secret used when none is configured.
pub const PLACEHOLDER_SECRET: &str = "change-me-in-production";

/// Top-level configuration for the dockyard service.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ServiceConfig {
    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Filesystem locations.
    #[serde(default)]
    pub paths: PathsConfig,

    /// Webhook authentication and dispatch behaviour.
    #[serde(default)]
    pub webhook: WebhookConfig,

    /// Deployment lock timing.
    #[serde(default)]
    pub lock: LockConfig,

    /// External tool invocation.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Host monitoring sources for the dashboard routes.
    #[serde(default)]
    pub monitor: MonitorConfig,
}

impl ServiceConfig {
    /// Load configuration from the default sources.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default values
    /// 2. `dockyard.toml` in the current directory (if present)
    /// 3. Environment variables with `DOCKYARD_` prefix
    pub fn load() -> DeployResult<Self> {
        Self::from_file("dockyard.toml")
    }

    /// Load configuration from a specific TOML file, still honouring the environment.
    pub fn from_file(path: impl AsRef<Path>) -> DeployResult<Self> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("DOCKYARD_").split("__"))
            .extract()
            .map_err(|e| DeployError::Config(e.to_string()))
    }

    /// Directory of per-domain certificate folders, each holding `fullchain.pem`.
    #[must_use]
    pub fn certificates_dir(&self) -> PathBuf {
        self.monitor
            .certificates_dir
            .clone()
            .unwrap_or_else(|| self.paths.hosting_dir.join("Infra/certbot/conf/live"))
    }

    /// Whether the webhook secret is still the built-in placeholder.
    #[must_use]
    pub fn uses_placeholder_secret(&self) -> bool {
        self.webhook.secret.expose_secret() == PLACEHOLDER_SECRET
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address the webhook receiver binds to.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Largest request body accepted on authenticated routes.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

const fn default_listen_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 9000)
}

const fn default_max_body_bytes() -> usize {
    1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

/// Filesystem locations used by the service.
#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    /// Deployment root. Relative project paths are resolved against it.
    #[serde(default = "default_hosting_dir")]
    pub hosting_dir: PathBuf,

    /// Directory holding one descriptor file per project.
    #[serde(default = "default_projects_dir")]
    pub projects_dir: PathBuf,

    /// Append-only deployment log.
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,

    /// Directory holding the deployment lock record.
    #[serde(default = "default_lock_dir")]
    pub lock_dir: PathBuf,
}

fn default_hosting_dir() -> PathBuf {
    PathBuf::from("/srv/hosting")
}

fn default_projects_dir() -> PathBuf {
    PathBuf::from("/etc/dockyard/projects")
}

fn default_log_file() -> PathBuf {
    PathBuf::from("/var/log/dockyard/webhook.log")
}

fn default_lock_dir() -> PathBuf {
    std::env::temp_dir()
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            hosting_dir: default_hosting_dir(),
            projects_dir: default_projects_dir(),
            log_file: default_log_file(),
            lock_dir: default_lock_dir(),
        }
    }
}

/// How `/deploy` runs an accepted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployMode {
    /// Respond `202 Accepted` at once; the pipeline runs on a background task.
    #[default]
    Background,

    /// Hold the request open until the pipeline finishes and return its result.
    Synchronous,
}

/// Webhook authentication and dispatch configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    /// Shared secret for `X-Hub-Signature-256` verification.
    #[serde(
        default = "default_secret",
        deserialize_with = "deserialize_secret"
    )]
    pub secret: SecretString,

    /// Branch assumed when a descriptor does not list any.
    #[serde(default = "default_branch")]
    pub default_branch: String,

    /// Dispatch mode for accepted events.
    #[serde(default)]
    pub mode: DeployMode,
}

fn default_secret() -> SecretString {
    SecretString::from(PLACEHOLDER_SECRET.to_owned())
}

fn default_branch() -> String {
    "main".to_owned()
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
where
    D: Deserializer<'de>,
{
    String::deserialize(deserializer).map(SecretString::from)
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            secret: default_secret(),
            default_branch: default_branch(),
            mode: DeployMode::default(),
        }
    }
}

/// Deployment lock timing.
#[derive(Debug, Clone, Deserialize)]
pub struct LockConfig {
    /// How long an event waits for a running deployment before giving up.
    #[serde(default = "default_lock_timeout_secs")]
    pub timeout_secs: u64,

    /// Pause between acquisition attempts while the lock is held.
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,
}

impl LockConfig {
    /// Acquisition timeout as a [`Duration`].
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Retry interval as a [`Duration`].
    #[must_use]
    pub const fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }
}

const fn default_lock_timeout_secs() -> u64 {
    900 // 15 minutes
}

const fn default_retry_interval_secs() -> u64 {
    5
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_lock_timeout_secs(),
            retry_interval_secs: default_retry_interval_secs(),
        }
    }
}

/// External tool configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Source-control client binary.
    #[serde(default = "default_git_binary")]
    pub git_binary: String,

    /// Container engine binary (invoked as `<binary> compose ...`).
    #[serde(default = "default_compose_binary")]
    pub compose_binary: String,

    /// Images unused for longer than this are pruned after a deployment.
    #[serde(default = "default_prune_retention_hours")]
    pub prune_retention_hours: u64,

    /// How much trailing command output is kept in error messages.
    #[serde(default = "default_output_tail_bytes")]
    pub output_tail_bytes: usize,
}

fn default_git_binary() -> String {
    "git".to_owned()
}

fn default_compose_binary() -> String {
    "docker".to_owned()
}

const fn default_prune_retention_hours() -> u64 {
    24
}

const fn default_output_tail_bytes() -> usize {
    1000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            git_binary: default_git_binary(),
            compose_binary: default_compose_binary(),
            prune_retention_hours: default_prune_retention_hours(),
            output_tail_bytes: default_output_tail_bytes(),
        }
    }
}

/// Host monitoring configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Mount point of the proc filesystem.
    #[serde(default = "default_proc_dir")]
    pub proc_dir: PathBuf,

    /// Temperature source in millidegrees Celsius.
    #[serde(default = "default_thermal_file")]
    pub thermal_file: PathBuf,

    /// Filesystem whose usage is reported.
    #[serde(default = "default_disk_mount")]
    pub disk_mount: PathBuf,

    /// Certificate store. Defaults to `<hosting_dir>/Infra/certbot/conf/live`.
    #[serde(default)]
    pub certificates_dir: Option<PathBuf>,

    /// Binary used to read certificate metadata.
    #[serde(default = "default_openssl_binary")]
    pub openssl_binary: String,

    /// Certificates closer than this to expiry are reported as expiring.
    #[serde(default = "default_expiry_warning_days")]
    pub expiry_warning_days: i64,
}

fn default_proc_dir() -> PathBuf {
    PathBuf::from("/proc")
}

fn default_thermal_file() -> PathBuf {
    PathBuf::from("/sys/class/thermal/thermal_zone0/temp")
}

fn default_disk_mount() -> PathBuf {
    PathBuf::from("/")
}

fn default_openssl_binary() -> String {
    "openssl".to_owned()
}

const fn default_expiry_warning_days() -> i64 {
    30
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            proc_dir: default_proc_dir(),
            thermal_file: default_thermal_file(),
            disk_mount: default_disk_mount(),
            certificates_dir: None,
            openssl_binary: default_openssl_binary(),
            expiry_warning_days: default_expiry_warning_days(),
        }
    }
}
