//! System-wide deployment lock.
//!
//! The lock is a single record file, `deploy.lock`, inside the lock
//! directory. Its existence is the mutual-exclusion signal. A record is
//! published atomically: the JSON body is written to a uniquely named
//! temporary file which is then hard-linked to the record path, and
//! `link(2)` refuses to replace an existing file. Readers therefore never
//! see a half-written record.
//!
//! A record whose holder process is no longer alive is stale and may be
//! removed by any acquirer. Stale reclaims retry immediately and do not count
//! against the acquisition timeout.
//!
//! Publishing, reclaiming and releasing all happen while holding an exclusive
//! `flock(2)` on a sidecar guard file, so a record judged stale cannot be
//! replaced by another acquirer between the check and the removal.

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// File name of the lock record inside the lock directory.
pub const LOCK_FILE_NAME: &str = "deploy.lock";

/// File name of the guard serialising changes to the record.
pub const GUARD_FILE_NAME: &str = "deploy.lock.guard";

/// Lock errors.
#[derive(Debug, Error)]
pub enum LockError {
    /// A live holder kept the lock for the whole wait window.
    #[error("lock still held after {waited:?}")]
    Timeout {
        /// How long the acquirer waited.
        waited: Duration,
    },

    /// The lock directory or record could not be accessed.
    #[error("lock I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The record could not be encoded.
    #[error("lock record error: {0}")]
    Record(String),
}

/// Contents of the lock record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// Process holding the lock.
    pub pid: u32,
    /// Project being deployed.
    pub project: String,
    /// When the lock was taken.
    pub acquired_at: DateTime<Utc>,
}

impl LockRecord {
    fn for_current_process(project: &str) -> Self {
        Self {
            pid: std::process::id(),
            project: project.to_owned(),
            acquired_at: Utc::now(),
        }
    }

    /// Whether the recorded holder is still running.
    #[must_use]
    pub fn holder_alive(&self) -> bool {
        is_process_alive(self.pid)
    }
}

/// Snapshot of the lock state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockStatus {
    /// No record exists.
    Free,
    /// A record exists.
    Held {
        /// The record.
        record: LockRecord,
        /// The recorded holder is no longer alive.
        stale: bool,
    },
    /// A record exists but cannot be parsed. Treated as stale by acquirers.
    Unreadable,
}

impl LockStatus {
    /// Whether a deployment currently holds (or appears to hold) the lock.
    #[must_use]
    pub const fn is_held(&self) -> bool {
        !matches!(self, Self::Free)
    }
}

/// Report whether `pid` names a live process.
///
/// Uses signal 0, which performs the permission and existence checks without
/// delivering anything. `EPERM` means the process exists under another user.
#[must_use]
pub fn is_process_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Record observed on disk. `None` when it does not parse.
struct Observed {
    record: Option<LockRecord>,
}

impl Observed {
    fn is_stale(&self) -> bool {
        self.record.as_ref().map_or(true, |r| !r.holder_alive())
    }
}

/// Take the exclusive guard at `path`, blocking until it is free.
///
/// The critical sections it protects are a handful of metadata operations,
/// so the wait is short even under contention.
fn lock_guard(path: &Path) -> Result<Flock<File>, LockError> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)?;
    Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| LockError::Io(errno.into()))
}

/// Acquires and inspects the deployment lock.
#[derive(Debug, Clone)]
pub struct LockManager {
    dir: PathBuf,
    record_path: PathBuf,
    guard_path: PathBuf,
}

impl LockManager {
    /// Create a manager for the lock record inside `lock_dir`.
    pub fn new(lock_dir: impl Into<PathBuf>) -> Self {
        let dir = lock_dir.into();
        let record_path = dir.join(LOCK_FILE_NAME);
        let guard_path = dir.join(GUARD_FILE_NAME);
        Self {
            dir,
            record_path,
            guard_path,
        }
    }

    /// Path of the lock record.
    #[must_use]
    pub fn record_path(&self) -> &Path {
        &self.record_path
    }

    /// Take the lock on behalf of `project`.
    ///
    /// Waits `retry_interval` between attempts while a live holder owns the
    /// lock and fails once `timeout` has elapsed, so a permanently held lock
    /// fails no earlier than `timeout` and no later than
    /// `timeout + retry_interval`.
    pub async fn acquire(
        &self,
        project: &str,
        timeout: Duration,
        retry_interval: Duration,
    ) -> Result<LockHandle, LockError> {
        let started = Instant::now();
        let record = LockRecord::for_current_process(project);
        let body = serde_json::to_vec(&record).map_err(|e| LockError::Record(e.to_string()))?;

        loop {
            let Some(holder) = self.try_acquire(&body)? else {
                info!(
                    project = %project,
                    pid = record.pid,
                    waited_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                    "deployment lock acquired"
                );
                return Ok(LockHandle {
                    path: self.record_path.clone(),
                    guard_path: self.guard_path.clone(),
                    record,
                    released: false,
                });
            };

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                warn!(
                    project = %project,
                    waited_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                    "timed out waiting for deployment lock"
                );
                return Err(LockError::Timeout { waited: elapsed });
            }

            debug!(
                holder_project = %holder.project,
                holder_pid = holder.pid,
                "deployment lock busy, waiting"
            );
            tokio::time::sleep(retry_interval.min(timeout - elapsed)).await;
        }
    }

    /// One acquisition attempt under the guard.
    ///
    /// Returns `None` once `body` is published, or the live holder's record.
    /// Stale and unreadable records are removed and the publish retried
    /// without releasing the guard.
    fn try_acquire(&self, body: &[u8]) -> Result<Option<LockRecord>, LockError> {
        std::fs::create_dir_all(&self.dir)?;
        let _guard = lock_guard(&self.guard_path)?;

        loop {
            if self.try_publish(body)? {
                return Ok(None);
            }

            let Some(observed) = self.observe()? else {
                // Released between our publish attempt and the read.
                continue;
            };

            if observed.is_stale() {
                warn!(
                    holder_pid = observed.record.as_ref().map(|r| r.pid),
                    holder_project = observed.record.as_ref().map(|r| r.project.as_str()),
                    "removing stale deployment lock"
                );
                remove_record(&self.record_path)?;
                continue;
            }

            // A live record always parses.
            if let Some(record) = observed.record {
                return Ok(Some(record));
            }
        }
    }

    /// Current state of the lock.
    pub fn status(&self) -> Result<LockStatus, LockError> {
        let Some(observed) = self.observe()? else {
            return Ok(LockStatus::Free);
        };
        Ok(match observed.record {
            Some(record) => {
                let stale = !record.holder_alive();
                LockStatus::Held { record, stale }
            }
            None => LockStatus::Unreadable,
        })
    }

    fn try_publish(&self, body: &[u8]) -> Result<bool, LockError> {
        let staging = self
            .dir
            .join(format!(".{LOCK_FILE_NAME}.{}", uuid::Uuid::new_v4()));
        std::fs::write(&staging, body)?;

        let linked = std::fs::hard_link(&staging, &self.record_path);
        if let Err(e) = std::fs::remove_file(&staging) {
            debug!(path = %staging.display(), error = %e, "failed to remove staging file");
        }

        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn observe(&self) -> Result<Option<Observed>, LockError> {
        match std::fs::read(&self.record_path) {
            Ok(raw) => Ok(Some(Observed {
                record: serde_json::from_slice(&raw).ok(),
            })),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn remove_record(path: &Path) -> Result<(), LockError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Scoped ownership of the deployment lock. Dropping the handle releases it.
#[derive(Debug)]
#[must_use = "the lock is released as soon as the handle is dropped"]
pub struct LockHandle {
    path: PathBuf,
    guard_path: PathBuf,
    record: LockRecord,
    released: bool,
}

impl LockHandle {
    /// The record this handle published.
    pub fn record(&self) -> &LockRecord {
        &self.record
    }

    /// Release the lock now. Succeeds if the record is already gone.
    pub fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        self.remove()?;
        info!(project = %self.record.project, "deployment lock released");
        Ok(())
    }

    fn remove(&self) -> Result<(), LockError> {
        let _guard = lock_guard(&self.guard_path)?;
        remove_record(&self.path)
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match self.remove() {
            Ok(()) => info!(project = %self.record.project, "deployment lock released"),
            Err(e) => warn!(
                project = %self.record.project,
                error = %e,
                "failed to release deployment lock"
            ),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    const SHORT: Duration = Duration::from_millis(20);

    /// A pid above the kernel's maximum, so it never names a live process.
    const DEAD_PID: u32 = 999_999_999;

    fn write_record(manager: &LockManager, pid: u32, project: &str) {
        let record = LockRecord {
            pid,
            project: project.to_owned(),
            acquired_at: Utc::now(),
        };
        std::fs::write(manager.record_path(), serde_json::to_vec(&record).unwrap()).unwrap();
    }

    #[test]
    fn liveness_of_known_processes() {
        assert!(is_process_alive(std::process::id()));
        assert!(!is_process_alive(DEAD_PID));
        assert!(!is_process_alive(0));
        assert!(!is_process_alive(u32::MAX));
    }

    #[tokio::test]
    async fn acquire_writes_record_and_drop_releases() {
        let dir = TempDir::new().unwrap();
        let manager = LockManager::new(dir.path());

        let handle = manager.acquire("blog", SHORT, SHORT).await.unwrap();
        match manager.status().unwrap() {
            LockStatus::Held { record, stale } => {
                assert_eq!(record.project, "blog");
                assert_eq!(record.pid, std::process::id());
                assert!(!stale);
            }
            other => panic!("unexpected status {other:?}"),
        }

        drop(handle);
        assert_eq!(manager.status().unwrap(), LockStatus::Free);
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let manager = LockManager::new(dir.path());

        let handle = manager.acquire("blog", SHORT, SHORT).await.unwrap();
        std::fs::remove_file(manager.record_path()).unwrap();
        handle.release().unwrap();
        assert_eq!(manager.status().unwrap(), LockStatus::Free);
    }

    #[tokio::test]
    async fn staging_files_do_not_accumulate() {
        let dir = TempDir::new().unwrap();
        let manager = LockManager::new(dir.path());

        let held = manager.acquire("a", SHORT, SHORT).await.unwrap();
        let _ = manager.acquire("b", SHORT, SHORT).await.unwrap_err();
        drop(held);

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .filter(|name| name != GUARD_FILE_NAME)
            .collect();
        assert!(leftovers.is_empty(), "unexpected files {leftovers:?}");
    }

    #[tokio::test]
    async fn stale_record_is_reclaimed_regardless_of_age() {
        let dir = TempDir::new().unwrap();
        let manager = LockManager::new(dir.path());
        write_record(&manager, DEAD_PID, "old");

        assert!(matches!(
            manager.status().unwrap(),
            LockStatus::Held { stale: true, .. }
        ));

        // Zero timeout: a reclaim must not count against the wait.
        let handle = manager.acquire("new", Duration::ZERO, SHORT).await.unwrap();
        assert_eq!(handle.record().project, "new");
    }

    #[tokio::test]
    async fn unreadable_record_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let manager = LockManager::new(dir.path());
        std::fs::write(manager.record_path(), b"not json").unwrap();

        assert_eq!(manager.status().unwrap(), LockStatus::Unreadable);
        let handle = manager.acquire("new", Duration::ZERO, SHORT).await.unwrap();
        assert_eq!(handle.record().project, "new");
    }

    #[tokio::test]
    async fn timeout_is_bounded_by_retry_interval() {
        let dir = TempDir::new().unwrap();
        let manager = LockManager::new(dir.path());
        let _held = manager.acquire("holder", SHORT, SHORT).await.unwrap();

        let timeout = Duration::from_millis(300);
        let retry = Duration::from_millis(100);
        let started = std::time::Instant::now();
        let err = manager.acquire("waiter", timeout, retry).await.unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(err, LockError::Timeout { .. }));
        assert!(elapsed >= timeout, "failed early after {elapsed:?}");
        // Scheduling slack on top of the contract.
        assert!(
            elapsed <= timeout + retry + Duration::from_millis(200),
            "failed late after {elapsed:?}"
        );
    }

    #[tokio::test]
    async fn waiter_acquires_after_release() {
        let dir = TempDir::new().unwrap();
        let manager = LockManager::new(dir.path());
        let held = manager.acquire("first", SHORT, SHORT).await.unwrap();

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .acquire("second", Duration::from_secs(5), SHORT)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        held.release().unwrap();

        let handle = waiter.await.unwrap().unwrap();
        assert_eq!(handle.record().project, "second");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_acquirers_are_serialised() {
        let dir = TempDir::new().unwrap();
        let manager = LockManager::new(dir.path());
        let holders = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let manager = manager.clone();
                let holders = Arc::clone(&holders);
                let peak = Arc::clone(&peak);
                tokio::spawn(async move {
                    let handle = manager
                        .acquire(&format!("p{i}"), Duration::from_secs(10), Duration::from_millis(5))
                        .await
                        .unwrap();
                    let now = holders.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    holders.fetch_sub(1, Ordering::SeqCst);
                    drop(handle);
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(manager.status().unwrap(), LockStatus::Free);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn racing_reclaims_of_a_stale_record_admit_one_holder() {
        const ACQUIRERS: usize = 8;

        let dir = TempDir::new().unwrap();
        let manager = LockManager::new(dir.path());

        for round in 0..200 {
            write_record(&manager, DEAD_PID, "crashed");
            let holders = Arc::new(AtomicUsize::new(0));
            let peak = Arc::new(AtomicUsize::new(0));
            let start = Arc::new(tokio::sync::Barrier::new(ACQUIRERS));

            let tasks: Vec<_> = (0..ACQUIRERS)
                .map(|i| {
                    let manager = manager.clone();
                    let holders = Arc::clone(&holders);
                    let peak = Arc::clone(&peak);
                    let start = Arc::clone(&start);
                    tokio::spawn(async move {
                        start.wait().await;
                        let handle = manager
                            .acquire(&format!("p{i}"), Duration::from_secs(10), Duration::from_millis(1))
                            .await
                            .unwrap();
                        let now = holders.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(1)).await;
                        holders.fetch_sub(1, Ordering::SeqCst);
                        drop(handle);
                    })
                })
                .collect();

            for task in tasks {
                task.await.unwrap();
            }
            assert_eq!(peak.load(Ordering::SeqCst), 1, "two holders in round {round}");
            assert_eq!(manager.status().unwrap(), LockStatus::Free);
        }
    }
}
