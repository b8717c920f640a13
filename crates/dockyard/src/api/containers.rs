//! Container listing.

use serde::Serialize;

/// Format string handed to `docker ps`.
pub const PS_FORMAT: &str = "{{.Names}}\t{{.State}}\t{{.Status}}";

/// One container as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerInfo {
    /// Container name.
    pub name: String,
    /// Machine state (`running`, `exited`, ...).
    pub state: String,
    /// Human status line (`Up 3 hours`, ...).
    pub status: String,
}

impl ContainerInfo {
    fn is_running(&self) -> bool {
        self.state == "running"
    }
}

/// Listing with summary counts.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerListing {
    /// Containers, running first, then by name.
    pub containers: Vec<ContainerInfo>,
    /// Number of containers.
    pub total: usize,
    /// Number of running containers.
    pub running: usize,
}

impl ContainerListing {
    /// Parse tab-separated `docker ps` output produced with [`PS_FORMAT`].
    #[must_use]
    pub fn parse(output: &str) -> Self {
        let mut containers: Vec<ContainerInfo> = output
            .lines()
            .filter_map(|line| {
                let mut fields = line.splitn(3, '\t');
                let name = fields.next()?.trim();
                let state = fields.next()?.trim();
                let status = fields.next()?.trim();
                (!name.is_empty()).then(|| ContainerInfo {
                    name: name.to_owned(),
                    state: state.to_owned(),
                    status: status.to_owned(),
                })
            })
            .collect();

        containers.sort_by(|a, b| {
            b.is_running()
                .cmp(&a.is_running())
                .then_with(|| a.name.cmp(&b.name))
        });

        let running = containers.iter().filter(|c| c.is_running()).count();
        Self {
            total: containers.len(),
            running,
            containers,
        }
    }

    /// An empty listing.
    #[must_use]
    pub fn empty() -> Self {
        Self::parse("")
    }
}
