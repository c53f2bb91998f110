//! Run-level mutual exclusion.
//!
//! At most one live process may hold the lock for a run identifier. The lock
//! is a JSON file `locks/<run_id>.lock` holding `{pid, hostname, acquired_at}`;
//! presence means held until the recorded holder is found dead. Creation is
//! atomic and exclusive, so two processes racing for the same run can never
//! both succeed.

pub mod probe;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::fsutil;

pub use probe::{current_hostname, FixedProbe, ProcessProbe, SystemProbe};

const LOCK_EXTENSION: &str = "lock";

/// Errors that can occur during lock operations.
#[derive(Error, Debug)]
pub enum LockError {
    /// Another process holds the lock for this run.
    #[error("run {run_id} is already locked by pid {holder_pid} on {hostname}")]
    AlreadyLocked {
        run_id: String,
        holder_pid: u32,
        hostname: String,
    },

    /// The recorded holder is still alive, so the lock cannot be forced.
    #[error("lock for run {run_id} is still held by live pid {holder_pid}")]
    StillHeld { run_id: String, holder_pid: u32 },

    /// The lock file exists but belongs to a different holder.
    #[error("lock for run {run_id} is not held by this process")]
    NotHolder { run_id: String },

    /// The run identifier cannot be used as a file name.
    #[error("invalid run ID: {0:?}")]
    InvalidRunId(String),

    /// IO error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for lock operations.
pub type LockResult<T> = Result<T, LockError>;

/// Contents of a lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    pub pid: u32,
    pub hostname: String,
    pub acquired_at: DateTime<Utc>,
}

impl LockHolder {
    fn current(hostname: String) -> Self {
        Self {
            pid: std::process::id(),
            hostname,
            acquired_at: Utc::now(),
        }
    }
}

/// A lock found on disk, as reported by [`RunLockManager::list_locks`].
#[derive(Debug, Clone, Serialize)]
pub struct LockRecord {
    pub run_id: String,
    pub holder: LockHolder,
    pub lock_path: PathBuf,
    /// Whether the recorded holder is still running.
    pub holder_alive: bool,
}

/// A held run lock.
///
/// The lock file is removed when the value is released or dropped, so every
/// exit path of the owning task gives the run back, including panics.
#[derive(Debug)]
pub struct RunLock {
    pub run_id: String,
    pub holder_pid: u32,
    pub hostname: String,
    pub acquired_at: DateTime<Utc>,
    pub lock_path: PathBuf,
    armed: bool,
}

impl RunLock {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(err) = release_file(&self.lock_path, &self.run_id, self.holder_pid) {
            if !std::thread::panicking() {
                warn!(run_id = %self.run_id, error = %err, "Failed to release run lock");
            }
        }
    }
}

/// Remove the lock file only if it still records `pid` as the holder.
fn release_file(lock_path: &Path, run_id: &str, pid: u32) -> LockResult<()> {
    let holder: Option<LockHolder> = fsutil::read_json(lock_path)?;
    match holder {
        None => Ok(()),
        Some(holder) if holder.pid == pid => {
            fsutil::remove_if_exists(lock_path)?;
            debug!(run_id, "Run lock released");
            Ok(())
        }
        Some(_) => Err(LockError::NotHolder {
            run_id: run_id.to_string(),
        }),
    }
}

/// Filesystem-backed run lock manager.
#[derive(Debug, Clone)]
pub struct RunLockManager {
    locks_dir: PathBuf,
    probe: Arc<dyn ProcessProbe>,
}

impl RunLockManager {
    /// Create a manager storing lock files under `locks_dir`.
    pub fn new(locks_dir: impl Into<PathBuf>, probe: Arc<dyn ProcessProbe>) -> Self {
        Self {
            locks_dir: locks_dir.into(),
            probe,
        }
    }

    /// Directory holding the lock files.
    pub fn locks_dir(&self) -> &Path {
        &self.locks_dir
    }

    fn lock_path(&self, run_id: &str) -> PathBuf {
        self.locks_dir.join(format!("{}.{}", run_id, LOCK_EXTENSION))
    }

    fn validate(run_id: &str) -> LockResult<()> {
        if fsutil::is_safe_component(run_id) {
            Ok(())
        } else {
            Err(LockError::InvalidRunId(run_id.to_string()))
        }
    }

    /// Acquire the lock for `run_id`.
    ///
    /// Fails with [`LockError::AlreadyLocked`] while a live process holds
    /// the run. A lock left behind by a dead holder is reclaimed through
    /// [`RunLockManager::force_unlock`] and the acquire is retried once.
    pub fn acquire(&self, run_id: &str) -> LockResult<RunLock> {
        Self::validate(run_id)?;
        fs::create_dir_all(&self.locks_dir)?;

        if let Some(lock) = self.try_create(run_id)? {
            return Ok(lock);
        }

        match self.force_unlock(run_id) {
            Ok(true) => {
                warn!(run_id, "Reclaimed run lock left by a dead holder");
                if let Some(lock) = self.try_create(run_id)? {
                    return Ok(lock);
                }
            }
            // Released between our create and the liveness check.
            Ok(false) => {
                if let Some(lock) = self.try_create(run_id)? {
                    return Ok(lock);
                }
            }
            Err(LockError::StillHeld { .. }) => {}
            Err(err) => return Err(err),
        }

        let existing = self.holder(run_id).ok().flatten();
        Err(LockError::AlreadyLocked {
            run_id: run_id.to_string(),
            holder_pid: existing.as_ref().map(|h| h.pid).unwrap_or(0),
            hostname: existing.map(|h| h.hostname).unwrap_or_default(),
        })
    }

    fn try_create(&self, run_id: &str) -> LockResult<Option<RunLock>> {
        let lock_path = self.lock_path(run_id);
        let holder = LockHolder::current(self.probe.hostname());

        if !fsutil::create_json_exclusive(&lock_path, &holder)? {
            return Ok(None);
        }
        debug!(run_id, pid = holder.pid, "Run lock acquired");
        Ok(Some(RunLock {
            run_id: run_id.to_string(),
            holder_pid: holder.pid,
            hostname: holder.hostname,
            acquired_at: holder.acquired_at,
            lock_path,
            armed: true,
        }))
    }

    /// Release a held lock.
    pub fn release(&self, mut lock: RunLock) -> LockResult<()> {
        lock.disarm();
        release_file(&lock.lock_path, &lock.run_id, lock.holder_pid)
    }

    /// Whether a lock file exists for `run_id`.
    pub fn is_locked(&self, run_id: &str) -> bool {
        Self::validate(run_id).is_ok() && self.lock_path(run_id).exists()
    }

    /// Read the recorded holder of a run lock.
    pub fn holder(&self, run_id: &str) -> LockResult<Option<LockHolder>> {
        Self::validate(run_id)?;
        Ok(fsutil::read_json(&self.lock_path(run_id))?)
    }

    /// Remove the lock for `run_id` if its recorded holder is dead.
    ///
    /// Returns `Ok(false)` when no lock exists and [`LockError::StillHeld`]
    /// when the holder is alive.
    pub fn force_unlock(&self, run_id: &str) -> LockResult<bool> {
        Self::validate(run_id)?;
        let lock_path = self.lock_path(run_id);
        let Some(holder) = fsutil::read_json::<LockHolder>(&lock_path)? else {
            return Ok(false);
        };

        if self.probe.holder_alive(holder.pid, &holder.hostname) {
            return Err(LockError::StillHeld {
                run_id: run_id.to_string(),
                holder_pid: holder.pid,
            });
        }

        fsutil::remove_if_exists(&lock_path)?;
        info!(run_id, dead_pid = holder.pid, "Removed stale run lock");
        Ok(true)
    }

    /// List every lock file with its holder's liveness.
    pub fn list_locks(&self) -> LockResult<Vec<LockRecord>> {
        let entries = match fs::read_dir(&self.locks_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut records = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(LOCK_EXTENSION) {
                continue;
            }
            let Some(run_id) = path.file_stem().map(|s| s.to_string_lossy().to_string()) else {
                continue;
            };
            match fsutil::read_json::<LockHolder>(&path) {
                Ok(Some(holder)) => records.push(LockRecord {
                    holder_alive: self.probe.holder_alive(holder.pid, &holder.hostname),
                    run_id,
                    holder,
                    lock_path: path,
                }),
                Ok(None) => {}
                Err(err) => warn!(path = %path.display(), error = %err, "Unreadable lock file"),
            }
        }
        records.sort_by(|a, b| a.run_id.cmp(&b.run_id));
        Ok(records)
    }

    /// Force-unlock every lock whose holder is dead.
    ///
    /// Returns the run IDs that were reclaimed.
    pub fn reclaim_stale(&self) -> LockResult<Vec<String>> {
        let mut reclaimed = Vec::new();
        for record in self.list_locks()? {
            if record.holder_alive {
                continue;
            }
            match self.force_unlock(&record.run_id) {
                Ok(true) => reclaimed.push(record.run_id),
                Ok(false) | Err(LockError::StillHeld { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(reclaimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;
    use tempfile::TempDir;

    fn manager(dir: &TempDir, probe: impl ProcessProbe + 'static) -> RunLockManager {
        RunLockManager::new(dir.path().join("locks"), Arc::new(probe))
    }

    #[test]
    fn test_acquire_writes_holder_file() {
        let temp_dir = TempDir::new().expect("temp dir");
        let locks = manager(&temp_dir, FixedProbe::alive());

        let lock = locks.acquire("run-1").expect("acquire");

        assert!(locks.is_locked("run-1"));
        let holder = locks.holder("run-1").expect("read").expect("holder");
        assert_eq!(holder.pid, std::process::id());
        assert_eq!(holder.pid, lock.holder_pid);
        assert_eq!(lock.lock_path, temp_dir.path().join("locks").join("run-1.lock"));
    }

    #[test]
    fn test_second_acquire_fails_while_held() {
        let temp_dir = TempDir::new().expect("temp dir");
        let locks = manager(&temp_dir, FixedProbe::alive());

        let _lock = locks.acquire("run-1").expect("acquire");
        let err = locks.acquire("run-1").expect_err("second acquire must fail");

        assert!(matches!(err, LockError::AlreadyLocked { holder_pid, .. } if holder_pid == std::process::id()));
    }

    #[test]
    fn test_release_frees_the_run() {
        let temp_dir = TempDir::new().expect("temp dir");
        let locks = manager(&temp_dir, FixedProbe::alive());

        let lock = locks.acquire("run-1").expect("acquire");
        locks.release(lock).expect("release");

        assert!(!locks.is_locked("run-1"));
        let _again = locks.acquire("run-1").expect("reacquire");
    }

    #[test]
    fn test_drop_releases_lock() {
        let temp_dir = TempDir::new().expect("temp dir");
        let locks = manager(&temp_dir, FixedProbe::alive());

        {
            let _lock = locks.acquire("run-1").expect("acquire");
            assert!(locks.is_locked("run-1"));
        }

        assert!(!locks.is_locked("run-1"));
    }

    #[test]
    fn test_concurrent_acquire_exactly_one_wins() {
        let temp_dir = TempDir::new().expect("temp dir");
        let locks_dir = temp_dir.path().join("locks");
        let contenders = 8;
        let barrier = Arc::new(Barrier::new(contenders));

        let handles: Vec<_> = (0..contenders)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                let locks_dir = locks_dir.clone();
                thread::spawn(move || {
                    // Each thread gets its own manager, as a separate process would.
                    let locks = RunLockManager::new(locks_dir, Arc::new(FixedProbe::alive()));
                    barrier.wait();
                    locks.acquire("shared-run").map(|mut lock| {
                        // Keep the file in place so late contenders still see it.
                        lock.disarm();
                    })
                })
            })
            .collect();

        let results: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().expect("thread"))
            .collect();
        let winners = results.iter().filter(|r| r.is_ok()).count();
        let contended = results
            .iter()
            .filter(|r| matches!(r, Err(LockError::AlreadyLocked { .. })))
            .count();

        assert_eq!(winners, 1);
        assert_eq!(contended, contenders - 1);
    }

    #[test]
    fn test_force_unlock_refuses_live_holder() {
        let temp_dir = TempDir::new().expect("temp dir");
        let locks = manager(&temp_dir, FixedProbe::alive());

        let _lock = locks.acquire("run-1").expect("acquire");
        let err = locks.force_unlock("run-1").expect_err("holder is alive");

        assert!(matches!(err, LockError::StillHeld { .. }));
        assert!(locks.is_locked("run-1"));
    }

    #[test]
    fn test_force_unlock_removes_dead_holder() {
        let temp_dir = TempDir::new().expect("temp dir");
        let locks = manager(&temp_dir, FixedProbe::dead());

        let mut lock = locks.acquire("run-1").expect("acquire");
        lock.disarm();

        assert!(locks.force_unlock("run-1").expect("force unlock"));
        assert!(!locks.is_locked("run-1"));
        assert!(!locks.force_unlock("run-1").expect("nothing left"));
    }

    #[test]
    fn test_acquire_reclaims_lock_of_dead_holder() {
        let temp_dir = TempDir::new().expect("temp dir");
        let locks = manager(&temp_dir, FixedProbe::dead());
        fs::create_dir_all(locks.locks_dir()).expect("locks dir");
        let crashed = LockHolder {
            pid: std::process::id().wrapping_add(1),
            hostname: current_hostname(),
            acquired_at: Utc::now(),
        };
        fsutil::write_json_atomic(&locks.locks_dir().join("run-1.lock"), &crashed).expect("leftover");

        let lock = locks.acquire("run-1").expect("stale lock is reclaimed");

        assert_eq!(lock.holder_pid, std::process::id());
        let holder = locks.holder("run-1").expect("read").expect("holder");
        assert_eq!(holder.pid, std::process::id());
    }

    #[test]
    fn test_release_does_not_remove_foreign_lock() {
        let temp_dir = TempDir::new().expect("temp dir");
        let locks = manager(&temp_dir, FixedProbe::alive());

        let lock = locks.acquire("run-1").expect("acquire");
        let foreign = LockHolder {
            pid: lock.holder_pid.wrapping_add(1),
            hostname: current_hostname(),
            acquired_at: Utc::now(),
        };
        fsutil::write_json_atomic(&lock.lock_path, &foreign).expect("overwrite");

        let err = locks.release(lock).expect_err("not our lock");
        assert!(matches!(err, LockError::NotHolder { .. }));
        assert!(locks.is_locked("run-1"));
    }

    #[test]
    fn test_reclaim_stale_only_touches_dead_holders() {
        let temp_dir = TempDir::new().expect("temp dir");
        let dead = manager(&temp_dir, FixedProbe::dead());

        let mut first = dead.acquire("run-a").expect("acquire a");
        first.disarm();
        let mut second = dead.acquire("run-b").expect("acquire b");
        second.disarm();

        let reclaimed = dead.reclaim_stale().expect("reclaim");
        assert_eq!(reclaimed, vec!["run-a".to_string(), "run-b".to_string()]);
        assert!(dead.list_locks().expect("list").is_empty());
    }

    #[test]
    fn test_invalid_run_id_rejected() {
        let temp_dir = TempDir::new().expect("temp dir");
        let locks = manager(&temp_dir, FixedProbe::alive());

        assert!(matches!(
            locks.acquire("../escape"),
            Err(LockError::InvalidRunId(_))
        ));
        assert!(!locks.is_locked("../escape"));
    }
}
