//! Project registry.
//!
//! Loads one descriptor file per project from a directory and answers
//! "which project does this repository belong to?". The loaded set is an
//! immutable snapshot; [`ProjectRegistry::reload`] builds a new snapshot and
//! swaps it in only if the whole directory parsed and validated, so readers
//! never observe a half-loaded registry.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::{DeployError, DeployResult};
use crate::types::{ComposeTarget, Project};

/// Errors raised while loading descriptors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A descriptor or the descriptor directory could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        /// Offending path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A descriptor is not valid YAML/TOML for the expected shape.
    #[error("failed to parse {path}: {message}")]
    Parse {
        /// Offending descriptor.
        path: PathBuf,
        /// Parser message.
        message: String,
    },

    /// A descriptor parsed but carries an invalid value.
    #[error("invalid descriptor {path}: {reason}")]
    Invalid {
        /// Offending descriptor.
        path: PathBuf,
        /// Reason for rejection.
        reason: String,
    },

    /// Two descriptors declare the same project name.
    #[error("duplicate project name: {0}")]
    DuplicateName(String),

    /// A repository name would resolve to more than one project.
    #[error("repository {repository} is claimed by both {first} and {second}")]
    AmbiguousRepository {
        /// Repository name.
        repository: String,
        /// Project registered first.
        first: String,
        /// Project registered second.
        second: String,
    },
}

/// Result type alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Branch list as written in a descriptor: a single name or a list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum BranchList {
    One(String),
    Many(Vec<String>),
}

/// On-disk descriptor shape.
#[derive(Debug, Clone, Deserialize)]
struct ProjectDescriptor {
    name: String,
    path: PathBuf,
    #[serde(default)]
    compose_file: Option<PathBuf>,
    #[serde(default)]
    compose_dir: Option<PathBuf>,
    #[serde(default)]
    env_file: Option<PathBuf>,
    #[serde(default)]
    branch: Option<BranchList>,
    #[serde(default)]
    repos: Vec<String>,
}

/// Where descriptors come from and how relative paths are resolved.
#[derive(Debug, Clone)]
pub struct RegistrySource {
    /// Directory with one descriptor per project.
    pub projects_dir: PathBuf,
    /// Root that relative project paths are joined to.
    pub hosting_dir: PathBuf,
    /// Branch assumed when a descriptor omits `branch`.
    pub default_branch: String,
}

impl RegistrySource {
    /// Create a descriptor source.
    pub fn new(
        projects_dir: impl Into<PathBuf>,
        hosting_dir: impl Into<PathBuf>,
        default_branch: impl Into<String>,
    ) -> Self {
        Self {
            projects_dir: projects_dir.into(),
            hosting_dir: hosting_dir.into(),
            default_branch: default_branch.into(),
        }
    }
}

/// Immutable view of the registered projects.
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    projects: Vec<Arc<Project>>,
    by_repository: HashMap<String, usize>,
}

impl RegistrySnapshot {
    /// Build a snapshot, rejecting duplicate names and ambiguous repositories.
    pub fn from_projects(projects: Vec<Project>) -> RegistryResult<Self> {
        let mut by_repository: HashMap<String, usize> = HashMap::new();
        let mut names: HashMap<&str, usize> = HashMap::new();

        for (idx, project) in projects.iter().enumerate() {
            if names.insert(project.name.as_str(), idx).is_some() {
                return Err(RegistryError::DuplicateName(project.name.clone()));
            }

            let keys = std::iter::once(&project.name).chain(project.repositories.iter());
            for key in keys {
                match by_repository.get(key) {
                    Some(&owner) if owner != idx => {
                        return Err(RegistryError::AmbiguousRepository {
                            repository: key.clone(),
                            first: projects[owner].name.clone(),
                            second: project.name.clone(),
                        });
                    }
                    Some(_) => {}
                    None => {
                        by_repository.insert(key.clone(), idx);
                    }
                }
            }
        }

        Ok(Self {
            projects: projects.into_iter().map(Arc::new).collect(),
            by_repository,
        })
    }

    /// Project owning `repository`, if any.
    #[must_use]
    pub fn find(&self, repository: &str) -> Option<Arc<Project>> {
        self.by_repository
            .get(repository)
            .map(|&idx| Arc::clone(&self.projects[idx]))
    }

    /// All projects in load order.
    #[must_use]
    pub fn projects(&self) -> &[Arc<Project>] {
        &self.projects
    }

    /// Project names in load order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.projects.iter().map(|p| p.name.clone()).collect()
    }

    /// Number of registered projects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.projects.len()
    }

    /// Whether no project is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.projects.is_empty()
    }
}

/// Hot-reloadable mapping from repository names to projects.
#[derive(Debug)]
pub struct ProjectRegistry {
    source: RegistrySource,
    current: RwLock<Arc<RegistrySnapshot>>,
}

impl ProjectRegistry {
    /// Load every descriptor under `source.projects_dir`.
    pub fn load(source: RegistrySource) -> RegistryResult<Self> {
        let snapshot = load_snapshot(&source)?;
        info!(
            projects_dir = %source.projects_dir.display(),
            projects = ?snapshot.names(),
            "project registry loaded"
        );
        Ok(Self {
            source,
            current: RwLock::new(Arc::new(snapshot)),
        })
    }

    /// Build a registry from in-memory projects.
    pub fn from_projects(source: RegistrySource, projects: Vec<Project>) -> RegistryResult<Self> {
        let snapshot = RegistrySnapshot::from_projects(projects)?;
        Ok(Self {
            source,
            current: RwLock::new(Arc::new(snapshot)),
        })
    }

    /// Re-read the descriptor directory and swap the snapshot in.
    ///
    /// On error the previous snapshot stays in effect.
    pub fn reload(&self) -> RegistryResult<Arc<RegistrySnapshot>> {
        let snapshot = Arc::new(load_snapshot(&self.source)?);
        *self.current.write() = Arc::clone(&snapshot);
        info!(projects = ?snapshot.names(), "project registry reloaded");
        Ok(snapshot)
    }

    /// Current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        Arc::clone(&self.current.read())
    }

    /// Resolve the project an event for `repository` targets.
    ///
    /// Fails with [`DeployError::UnknownProject`] when nothing matches, and
    /// with [`DeployError::Config`] when the project root is missing on disk.
    pub fn resolve(&self, repository: &str) -> DeployResult<Arc<Project>> {
        let project = self
            .snapshot()
            .find(repository)
            .ok_or_else(|| DeployError::UnknownProject(repository.to_owned()))?;

        if !project.path.is_dir() {
            return Err(DeployError::Config(format!(
                "project {} path {} does not exist",
                project.name,
                project.path.display()
            )));
        }

        Ok(project)
    }
}

fn load_snapshot(source: &RegistrySource) -> RegistryResult<RegistrySnapshot> {
    if !source.projects_dir.exists() {
        warn!(
            projects_dir = %source.projects_dir.display(),
            "descriptor directory does not exist, registry is empty"
        );
        return Ok(RegistrySnapshot::default());
    }

    let entries = std::fs::read_dir(&source.projects_dir).map_err(|e| RegistryError::Read {
        path: source.projects_dir.clone(),
        source: e,
    })?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| RegistryError::Read {
            path: source.projects_dir.clone(),
            source: e,
        })?;
        let path = entry.path();
        if path.is_file() && descriptor_format(&path).is_some() {
            files.push(path);
        }
    }
    files.sort();

    let mut projects = Vec::with_capacity(files.len());
    for path in files {
        let descriptor = read_descriptor(&path)?;
        projects.push(into_project(descriptor, &path, source)?);
        debug!(path = %path.display(), "descriptor loaded");
    }

    RegistrySnapshot::from_projects(projects)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DescriptorFormat {
    Yaml,
    Toml,
}

fn descriptor_format(path: &Path) -> Option<DescriptorFormat> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("yml" | "yaml") => Some(DescriptorFormat::Yaml),
        Some("toml") => Some(DescriptorFormat::Toml),
        _ => None,
    }
}

fn read_descriptor(path: &Path) -> RegistryResult<ProjectDescriptor> {
    let content = std::fs::read_to_string(path).map_err(|e| RegistryError::Read {
        path: path.to_owned(),
        source: e,
    })?;

    let parsed = match descriptor_format(path) {
        Some(DescriptorFormat::Toml) => toml::from_str(&content).map_err(|e| e.to_string()),
        _ => serde_yaml::from_str(&content).map_err(|e| e.to_string()),
    };

    parsed.map_err(|message| RegistryError::Parse {
        path: path.to_owned(),
        message,
    })
}

fn into_project(
    descriptor: ProjectDescriptor,
    file: &Path,
    source: &RegistrySource,
) -> RegistryResult<Project> {
    let invalid = |reason: String| RegistryError::Invalid {
        path: file.to_owned(),
        reason,
    };

    let name = descriptor.name.trim().to_owned();
    if name.is_empty() {
        return Err(invalid("name must not be empty".to_owned()));
    }
    if descriptor.path.as_os_str().is_empty() {
        return Err(invalid("path must not be empty".to_owned()));
    }

    for repo in &descriptor.repos {
        if !is_plain_relative(Path::new(repo)) {
            return Err(invalid(format!(
                "repository {repo:?} must be a relative path inside the project"
            )));
        }
    }

    let allowed_branches = match descriptor.branch {
        None => vec![source.default_branch.clone()],
        Some(BranchList::One(branch)) => vec![branch],
        Some(BranchList::Many(branches)) if branches.is_empty() => {
            return Err(invalid("branch list must not be empty".to_owned()));
        }
        Some(BranchList::Many(branches)) => branches,
    };

    let path = source.hosting_dir.join(&descriptor.path);

    let compose = match descriptor.compose_file {
        Some(file) => ComposeTarget::File {
            path: path.join(file),
            env_file: descriptor.env_file.map(|env| path.join(env)),
        },
        None => ComposeTarget::Directory {
            path: descriptor
                .compose_dir
                .map_or_else(|| path.clone(), |dir| path.join(dir)),
        },
    };

    Ok(Project {
        name,
        path,
        compose,
        allowed_branches,
        repositories: descriptor.repos,
    })
}

fn is_plain_relative(path: &Path) -> bool {
    !path.as_os_str().is_empty() && path.components().all(|c| matches!(c, Component::Normal(_)))
}
