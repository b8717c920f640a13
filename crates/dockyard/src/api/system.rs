//! Host resource usage for the dashboard.
//!
//! Every source is best effort: one that cannot be read reports zeros and
//! the rest of the snapshot is still returned.

use std::path::Path;

use serde::Serialize;
use tracing::debug;

use crate::config::MonitorConfig;
use crate::process::{CommandRunner, CommandSpec};

/// Processor load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CpuStats {
    /// One-minute load average as a share of all cores, capped at 100.
    pub percent: f64,
}

/// Memory usage in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    pub total: u64,
    pub used: u64,
    pub available: u64,
}

/// Disk usage in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiskStats {
    pub total: u64,
    pub used: u64,
}

/// Snapshot returned by `/api/system`.
#[derive(Debug, Clone, Serialize)]
pub struct SystemStats {
    pub cpu: CpuStats,
    pub memory: MemoryStats,
    pub disk: DiskStats,
    /// Degrees Celsius, `0.0` when no sensor is available.
    pub temperature: f64,
    /// Human readable uptime, e.g. `3d 4h 12m`.
    pub uptime: String,
}

/// Load as a percentage of `cores`.
#[must_use]
pub fn cpu_percent(load: f64, cores: usize) -> f64 {
    let cores = cores.max(1) as f64;
    (load * 100.0 / cores).clamp(0.0, 100.0)
}

/// One-minute average from `/proc/loadavg`.
#[must_use]
pub fn parse_loadavg(text: &str) -> Option<f64> {
    text.split_whitespace().next()?.parse().ok()
}

/// Memory figures from `/proc/meminfo`, whose values are in KiB.
#[must_use]
pub fn parse_meminfo(text: &str) -> MemoryStats {
    let field = |name: &str| {
        text.lines()
            .find_map(|line| {
                let rest = line.strip_prefix(name)?.strip_prefix(':')?;
                rest.split_whitespace().next()?.parse::<u64>().ok()
            })
            .unwrap_or(0)
            .saturating_mul(1024)
    };
    let total = field("MemTotal");
    let available = field("MemAvailable");
    MemoryStats {
        total,
        used: total.saturating_sub(available),
        available,
    }
}

/// Size and usage from `df -B1 <mount>`.
#[must_use]
pub fn parse_df(output: &str) -> Option<DiskStats> {
    let line = output.lines().nth(1)?;
    let mut fields = line.split_whitespace().skip(1);
    Some(DiskStats {
        total: fields.next()?.parse().ok()?,
        used: fields.next()?.parse().ok()?,
    })
}

/// Thermal zone reading in millidegrees.
#[must_use]
pub fn parse_thermal(text: &str) -> Option<f64> {
    let millis: i64 = text.trim().parse().ok()?;
    Some(millis as f64 / 1000.0)
}

/// Seconds since boot from `/proc/uptime`.
#[must_use]
pub fn parse_uptime(text: &str) -> Option<f64> {
    text.split_whitespace().next()?.parse().ok()
}

/// Render an uptime, dropping leading zero units.
#[must_use]
pub fn format_uptime(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    let days = total / 86_400;
    let hours = total % 86_400 / 3_600;
    let minutes = total % 3_600 / 60;
    if days > 0 {
        format!("{days}d {hours}h {minutes}m")
    } else if hours > 0 {
        format!("{hours}h {minutes}m")
    } else {
        format!("{minutes}m")
    }
}

async fn read(path: &Path) -> Option<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Some(text),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "monitoring source unavailable");
            None
        }
    }
}

/// Gather a snapshot from the configured sources.
pub async fn collect(monitor: &MonitorConfig, runner: &dyn CommandRunner) -> SystemStats {
    let cores = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
    let cpu = read(&monitor.proc_dir.join("loadavg"))
        .await
        .as_deref()
        .and_then(parse_loadavg)
        .map(|load| CpuStats {
            percent: cpu_percent(load, cores),
        })
        .unwrap_or_default();

    let memory = read(&monitor.proc_dir.join("meminfo"))
        .await
        .as_deref()
        .map(parse_meminfo)
        .unwrap_or_default();

    let df = CommandSpec::new("df").args(["-B1"]).arg(monitor.disk_mount.display().to_string());
    let disk = match runner.run(&df).await {
        Ok(output) if output.success() => parse_df(&output.stdout).unwrap_or_default(),
        Ok(output) => {
            debug!(code = ?output.code, "df failed");
            DiskStats::default()
        }
        Err(e) => {
            debug!(error = %e, "df could not be started");
            DiskStats::default()
        }
    };

    let temperature = read(&monitor.thermal_file)
        .await
        .as_deref()
        .and_then(parse_thermal)
        .unwrap_or(0.0);

    let uptime = read(&monitor.proc_dir.join("uptime"))
        .await
        .as_deref()
        .and_then(parse_uptime)
        .map_or_else(|| "unknown".to_owned(), format_uptime);

    SystemStats {
        cpu,
        memory,
        disk,
        temperature,
        uptime,
    }
}
