//! Advisory cross-process lock built on exclusive directory creation.
//!
//! Layout:
//!   <resource>.lock/            # exists while the lock is held
//!   <resource>.lock/info.json   # `{ "pid": 1234, "ts": <epoch millis> }`
//!
//! `create_dir` is atomic across processes, so whoever creates the marker
//! owns the lock. A marker is reclaimed when its timestamp is older than
//! `stale_after` or when its owning process is gone.

use crate::error::{HiveError, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const LOCK_SUFFIX: &str = ".lock";
const INFO_FILE: &str = "info.json";

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    pub retries: u32,
    pub retry_delay: Duration,
    pub stale_after: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            retries: 50,
            retry_delay: Duration::from_millis(100),
            stale_after: Duration::from_secs(10),
        }
    }
}

// ---------------------------------------------------------------------------
// Process liveness
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Dead,
    Unknown,
}

/// Answers whether the process that wrote a lock marker still exists.
pub trait ProcessProbe {
    fn probe(&self, pid: u32) -> Liveness;
}

/// Probe backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsProbe;

impl ProcessProbe for OsProbe {
    #[cfg(unix)]
    fn probe(&self, pid: u32) -> Liveness {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        // 0 and negative pids address process groups, not a single process.
        let raw = match i32::try_from(pid) {
            Ok(raw) if raw > 0 => raw,
            _ => return Liveness::Unknown,
        };
        match kill(Pid::from_raw(raw), None) {
            Ok(()) => Liveness::Alive,
            Err(Errno::ESRCH) => Liveness::Dead,
            // EPERM: the process exists but belongs to someone else.
            Err(Errno::EPERM) => Liveness::Alive,
            Err(_) => Liveness::Unknown,
        }
    }

    #[cfg(not(unix))]
    fn probe(&self, _pid: u32) -> Liveness {
        Liveness::Unknown
    }
}

// ---------------------------------------------------------------------------
// Lock marker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
    /// Acquisition time in milliseconds since the Unix epoch.
    ts: i64,
}

/// Held lock. Dropping the guard releases it.
#[derive(Debug)]
pub struct LockGuard {
    dir: PathBuf,
    released: bool,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Release explicitly. Never fails; removal errors are ignored.
    pub fn release(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if !self.released {
            self.released = true;
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.remove();
    }
}

pub fn lock_dir_for(resource: &Path) -> PathBuf {
    let mut name = OsString::from(resource.as_os_str());
    name.push(LOCK_SUFFIX);
    PathBuf::from(name)
}

// ---------------------------------------------------------------------------
// Acquisition
// ---------------------------------------------------------------------------

/// Acquire the lock guarding `resource`, probing owner liveness via the OS.
pub fn acquire(resource: &Path, opts: &LockOptions) -> Result<LockGuard> {
    acquire_with(resource, opts, &OsProbe)
}

/// Acquire the lock guarding `resource` with a caller-supplied liveness probe.
///
/// Makes `opts.retries + 1` attempts. Between attempts on a live holder the
/// thread sleeps for `opts.retry_delay`; a stale holder is removed and the
/// next attempt starts immediately.
pub fn acquire_with(
    resource: &Path,
    opts: &LockOptions,
    probe: &dyn ProcessProbe,
) -> Result<LockGuard> {
    let dir = lock_dir_for(resource);
    if let Some(parent) = dir.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut unreadable_before = false;
    for attempt in 0..=opts.retries {
        match std::fs::create_dir(&dir) {
            Ok(()) => {
                write_info(&dir);
                tracing::trace!(lock = %dir.display(), attempt, "lock acquired");
                return Ok(LockGuard {
                    dir,
                    released: false,
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }

        if let Some(reason) = stale_reason(&dir, attempt, &mut unreadable_before, opts, probe) {
            tracing::warn!(lock = %dir.display(), reason, "removing stale lock");
            let _ = std::fs::remove_dir_all(&dir);
            continue;
        }

        if attempt < opts.retries {
            std::thread::sleep(opts.retry_delay);
        }
    }

    Err(HiveError::LockTimeout {
        resource: resource.display().to_string(),
        retries: opts.retries,
    })
}

fn write_info(dir: &Path) {
    let info = LockInfo {
        pid: std::process::id(),
        ts: Utc::now().timestamp_millis(),
    };
    // The directory alone is the lock; the info record only helps others
    // judge staleness.
    let written = serde_json::to_vec(&info)
        .map_err(HiveError::from)
        .and_then(|data| write_info_in(dir, &data));
    if let Err(e) = written {
        tracing::debug!(lock = %dir.display(), error = %e, "could not write lock info");
    }
}

/// Write `info.json` atomically inside an existing marker. Unlike
/// `io::atomic_write` this never creates `dir`: a marker removed by another
/// process as stale must stay removed.
fn write_info_in(dir: &Path, data: &[u8]) -> Result<()> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.persist(dir.join(INFO_FILE)).map_err(|e| e.error)?;
    Ok(())
}

/// Returns why the existing marker may be removed, or `None` if it is held.
///
/// A fresh holder may still be between `create_dir` and writing
/// `info.json`, so an unreadable record is only stale once it has been
/// unreadable on two consecutive attempts.
fn stale_reason(
    dir: &Path,
    attempt: u32,
    unreadable_before: &mut bool,
    opts: &LockOptions,
    probe: &dyn ProcessProbe,
) -> Option<&'static str> {
    let info = std::fs::read_to_string(dir.join(INFO_FILE))
        .ok()
        .and_then(|s| serde_json::from_str::<LockInfo>(&s).ok());

    let Some(info) = info else {
        if std::mem::replace(unreadable_before, true) {
            return Some("unreadable lock info");
        }
        return None;
    };
    *unreadable_before = false;

    let age_ms = Utc::now().timestamp_millis().saturating_sub(info.ts);
    let stale_ms = i64::try_from(opts.stale_after.as_millis()).unwrap_or(i64::MAX);
    if age_ms > stale_ms {
        return Some("lock older than stale threshold");
    }

    match probe.probe(info.pid) {
        Liveness::Alive => None,
        Liveness::Dead => Some("owner process is gone"),
        Liveness::Unknown => (attempt > 0).then_some("owner liveness unknown"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    struct FixedProbe(Liveness);

    impl ProcessProbe for FixedProbe {
        fn probe(&self, _pid: u32) -> Liveness {
            self.0
        }
    }

    fn quick(retries: u32) -> LockOptions {
        LockOptions {
            retries,
            retry_delay: Duration::from_millis(5),
            stale_after: Duration::from_secs(10),
        }
    }

    fn plant_marker(resource: &Path, pid: u32, age: Duration) {
        let dir = lock_dir_for(resource);
        std::fs::create_dir_all(&dir).unwrap();
        let ts = Utc::now().timestamp_millis() - age.as_millis() as i64;
        std::fs::write(
            dir.join(INFO_FILE),
            serde_json::to_string(&LockInfo { pid, ts }).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn lock_dir_appends_suffix() {
        assert_eq!(
            lock_dir_for(Path::new("/p/.hive-workers/merge-queue.json")),
            PathBuf::from("/p/.hive-workers/merge-queue.json.lock")
        );
    }

    #[test]
    fn acquire_writes_info_and_release_removes_marker() {
        let dir = TempDir::new().unwrap();
        let resource = dir.path().join("merge-queue.json");
        let guard = acquire(&resource, &quick(0)).unwrap();
        let info: LockInfo =
            serde_json::from_str(&std::fs::read_to_string(guard.path().join(INFO_FILE)).unwrap())
                .unwrap();
        assert_eq!(info.pid, std::process::id());
        guard.release();
        assert!(!lock_dir_for(&resource).exists());
    }

    #[test]
    fn info_write_does_not_recreate_a_removed_marker() {
        let dir = TempDir::new().unwrap();
        let marker = lock_dir_for(&dir.path().join("merge-queue.json"));
        std::fs::create_dir(&marker).unwrap();
        std::fs::remove_dir(&marker).unwrap();

        write_info(&marker);
        assert!(!marker.exists());
        assert!(write_info_in(&marker, b"{}").is_err());
    }

    #[test]
    fn drop_releases_lock() {
        let dir = TempDir::new().unwrap();
        let resource = dir.path().join("doc.json");
        {
            let _guard = acquire(&resource, &quick(0)).unwrap();
            assert!(lock_dir_for(&resource).is_dir());
        }
        assert!(!lock_dir_for(&resource).exists());
    }

    #[test]
    fn held_lock_times_out() {
        let dir = TempDir::new().unwrap();
        let resource = dir.path().join("doc.json");
        let _held = acquire(&resource, &quick(0)).unwrap();

        let err = acquire_with(&resource, &quick(2), &FixedProbe(Liveness::Alive)).unwrap_err();
        match err {
            HiveError::LockTimeout { resource: r, retries } => {
                assert!(r.ends_with("doc.json"));
                assert_eq!(retries, 2);
            }
            other => panic!("expected LockTimeout, got {other:?}"),
        }
    }

    #[test]
    fn old_marker_is_reclaimed_without_waiting() {
        let dir = TempDir::new().unwrap();
        let resource = dir.path().join("doc.json");
        plant_marker(&resource, std::process::id(), Duration::from_secs(60));

        let opts = LockOptions {
            retries: 1,
            retry_delay: Duration::from_secs(30),
            stale_after: Duration::from_secs(1),
        };
        let started = std::time::Instant::now();
        let guard = acquire_with(&resource, &opts, &FixedProbe(Liveness::Alive)).unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        drop(guard);
    }

    #[test]
    fn dead_owner_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let resource = dir.path().join("doc.json");
        plant_marker(&resource, 4242, Duration::ZERO);
        acquire_with(&resource, &quick(0), &FixedProbe(Liveness::Dead)).unwrap();
    }

    #[test]
    fn corrupt_info_waits_once_then_reclaims() {
        let dir = TempDir::new().unwrap();
        let resource = dir.path().join("doc.json");
        let marker = lock_dir_for(&resource);
        std::fs::create_dir_all(&marker).unwrap();
        std::fs::write(marker.join(INFO_FILE), "garbage").unwrap();

        let probe = FixedProbe(Liveness::Alive);
        assert!(matches!(
            acquire_with(&resource, &quick(0), &probe),
            Err(HiveError::LockTimeout { .. })
        ));
        acquire_with(&resource, &quick(1), &probe).unwrap();
    }

    #[test]
    fn unknown_liveness_is_conservative_on_first_attempt_only() {
        let dir = TempDir::new().unwrap();
        let resource = dir.path().join("doc.json");
        plant_marker(&resource, 4242, Duration::ZERO);

        let probe = FixedProbe(Liveness::Unknown);
        assert!(acquire_with(&resource, &quick(0), &probe).is_err());
        assert!(lock_dir_for(&resource).exists());
        acquire_with(&resource, &quick(1), &probe).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn os_probe_sees_own_process() {
        assert_eq!(OsProbe.probe(std::process::id()), Liveness::Alive);
        assert_eq!(OsProbe.probe(0), Liveness::Unknown);
    }

    #[cfg(unix)]
    #[test]
    fn os_probe_reports_exited_child_dead() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert_eq!(OsProbe.probe(pid), Liveness::Dead);
    }

    #[test]
    fn contending_threads_never_overlap() {
        let dir = TempDir::new().unwrap();
        let resource = Arc::new(dir.path().join("counter.json"));
        let inside = Arc::new(AtomicU32::new(0));
        let opts = LockOptions {
            retries: 500,
            retry_delay: Duration::from_millis(5),
            stale_after: Duration::from_secs(60),
        };

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let resource = Arc::clone(&resource);
                let inside = Arc::clone(&inside);
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        let guard = acquire(&resource, &opts).unwrap();
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        let n: u32 = std::fs::read_to_string(&*resource)
                            .ok()
                            .and_then(|s| s.parse().ok())
                            .unwrap_or(0);
                        crate::io::atomic_write(&resource, (n + 1).to_string().as_bytes())
                            .unwrap();
                        inside.fetch_sub(1, Ordering::SeqCst);
                        guard.release();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(std::fs::read_to_string(&*resource).unwrap(), "80");
    }
}
