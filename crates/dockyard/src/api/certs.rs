//! TLS certificate expiry report.
//!
//! The store holds one folder per certificate name, each with a
//! `fullchain.pem`. Metadata is read with `openssl x509`.

use std::path::Path;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{DeployError, DeployResult};
use crate::process::{CommandRunner, CommandSpec};

const CERTIFICATE_FILE: &str = "fullchain.pem";

/// Expiry classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CertificateStatus {
    Valid,
    Expiring,
    Expired,
    /// Metadata could not be read.
    Error,
}

impl CertificateStatus {
    /// Classify `days_left`; anything within `warning_days` is expiring.
    #[must_use]
    pub const fn from_days_left(days_left: i64, warning_days: i64) -> Self {
        if days_left > warning_days {
            Self::Valid
        } else if days_left > 0 {
            Self::Expiring
        } else {
            Self::Expired
        }
    }
}

/// One certificate in the store.
#[derive(Debug, Clone, Serialize)]
pub struct CertificateInfo {
    /// Folder name in the store.
    pub name: String,
    /// Subject alternative names, or the folder name when none are listed.
    pub domains: Vec<String>,
    pub expiry: Option<DateTime<Utc>>,
    pub days_left: Option<i64>,
    pub status: CertificateStatus,
}

/// Report returned by `/api/ssl`, most urgent first.
#[derive(Debug, Clone, Serialize)]
pub struct CertificateReport {
    pub certificates: Vec<CertificateInfo>,
    pub total: usize,
}

/// Parse `notAfter=Mar 15 12:00:00 2026 GMT`.
#[must_use]
pub fn parse_not_after(output: &str) -> Option<DateTime<Utc>> {
    let value = output.trim().strip_prefix("notAfter=")?;
    let value = value.trim_end().strip_suffix("GMT")?;
    // openssl pads single-digit days with a space.
    let normalised = value.split_whitespace().collect::<Vec<_>>().join(" ");
    NaiveDateTime::parse_from_str(&normalised, "%b %d %H:%M:%S %Y")
        .ok()
        .map(|naive| naive.and_utc())
}

/// DNS names from the first subject-alternative-name line of `x509 -text`.
#[must_use]
pub fn parse_san(text: &str) -> Vec<String> {
    text.lines()
        .find(|line| line.contains("DNS:"))
        .map(|line| {
            line.split(',')
                .filter_map(|entry| entry.trim().strip_prefix("DNS:"))
                .filter(|name| !name.is_empty())
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

/// Inspects certificates through an `openssl` binary.
pub struct CertificateInspector<'a> {
    pub runner: &'a dyn CommandRunner,
    pub openssl: &'a str,
    pub warning_days: i64,
}

impl CertificateInspector<'_> {
    /// Inspect every certificate under `store`. A missing store is empty.
    pub async fn report(&self, store: &Path, now: DateTime<Utc>) -> DeployResult<CertificateReport> {
        let mut entries = match tokio::fs::read_dir(store).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %store.display(), "certificate store not found");
                return Ok(CertificateReport {
                    certificates: Vec::new(),
                    total: 0,
                });
            }
            Err(e) => return Err(DeployError::Io(e)),
        };

        let mut certificates = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || name == "README" {
                continue;
            }
            let pem = entry.path().join(CERTIFICATE_FILE);
            if !tokio::fs::try_exists(&pem).await.unwrap_or(false) {
                continue;
            }
            certificates.push(self.inspect(name, &pem, now).await);
        }

        certificates.sort_by(|a, b| {
            let urgency = |c: &CertificateInfo| c.days_left.unwrap_or(i64::MAX);
            urgency(a).cmp(&urgency(b)).then_with(|| a.name.cmp(&b.name))
        });
        Ok(CertificateReport {
            total: certificates.len(),
            certificates,
        })
    }

    async fn inspect(&self, name: String, pem: &Path, now: DateTime<Utc>) -> CertificateInfo {
        let Some(expiry) = self.not_after(pem).await else {
            warn!(certificate = %name, "could not read certificate expiry");
            return CertificateInfo {
                domains: vec![name.clone()],
                name,
                expiry: None,
                days_left: None,
                status: CertificateStatus::Error,
            };
        };

        let mut domains = self.alt_names(pem).await;
        if domains.is_empty() {
            domains.push(name.clone());
        }
        let days_left = (expiry - now).num_days();
        CertificateInfo {
            name,
            domains,
            expiry: Some(expiry),
            days_left: Some(days_left),
            status: CertificateStatus::from_days_left(days_left, self.warning_days),
        }
    }

    async fn not_after(&self, pem: &Path) -> Option<DateTime<Utc>> {
        let spec = self.x509(pem).args(["-enddate", "-noout"]);
        let output = self.runner.run(&spec).await.ok()?;
        if !output.success() {
            return None;
        }
        parse_not_after(&output.stdout)
    }

    async fn alt_names(&self, pem: &Path) -> Vec<String> {
        let spec = self.x509(pem).args(["-noout", "-text"]);
        match self.runner.run(&spec).await {
            Ok(output) if output.success() => parse_san(&output.stdout),
            _ => Vec::new(),
        }
    }

    fn x509(&self, pem: &Path) -> CommandSpec {
        CommandSpec::new(self.openssl)
            .arg("x509")
            .arg("-in")
            .arg(pem.display().to_string())
    }
}
