//! Directory lock serializing writers of the file-backed label store.
//!
//! The lock file lives at `<store_dir>/store.lock` and contains JSON
//! metadata about the holder (PID, hostname, timestamp, purpose). Creation
//! uses `create_new`, so two processes can never both believe they hold it.
//! A holder that crashed leaves a stale file behind; waiters take it over
//! once it is older than the configured staleness bound.
//!
//! Each holder writes a random owner token into the file. Takeover renames
//! the stale file to a private tombstone, checks that the tombstone is the
//! file that was judged stale, and only then competes through `create_new`.
//! Release removes the file only while it still carries the holder's token.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const LOCK_FILE: &str = "store.lock";

/// Poll interval while waiting for a busy lock.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Information stored in the lock file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    /// Process ID of the lock holder
    pub pid: u32,
    /// Hostname where the lock was acquired
    pub hostname: String,
    /// When the lock was acquired
    pub acquired_at: DateTime<Utc>,
    /// What the holder is doing (e.g. "write")
    pub purpose: Option<String>,
    /// Random token identifying this holder
    #[serde(default)]
    pub token: String,
}

/// Lock file handle that automatically releases on Drop
#[derive(Debug)]
pub struct StoreLock {
    path: PathBuf,
    token: String,
    held: bool,
}

impl StoreLock {
    /// Try to take the lock once.
    ///
    /// Fails if a lock file already exists, stale or not.
    pub fn acquire(store_dir: &Path, purpose: Option<&str>) -> Result<Self> {
        fs::create_dir_all(store_dir)
            .with_context(|| format!("failed to create store dir {}", store_dir.display()))?;

        let lock_path = lock_path(store_dir);
        let info = LockInfo {
            pid: std::process::id(),
            hostname: gethostname::gethostname().to_string_lossy().to_string(),
            acquired_at: Utc::now(),
            purpose: purpose.map(str::to_string),
            token: new_token(),
        };
        let json = serde_json::to_string_pretty(&info).context("failed to serialize lock info")?;

        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let holder = read_lock_info_from_path(&lock_path)
                    .map(|i| format!("pid {} on {} since {}", i.pid, i.hostname, i.acquired_at))
                    .unwrap_or_else(|_| "unknown holder".to_string());
                bail!("lock already held by {holder}");
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to create lock file {}", lock_path.display()));
            }
        };

        file.write_all(json.as_bytes())
            .with_context(|| format!("failed to write lock file {}", lock_path.display()))?;
        file.sync_all().context("failed to sync lock file")?;

        Ok(Self {
            path: lock_path,
            token: info.token,
            held: true,
        })
    }

    /// Take the lock, taking it over first if it is older than `stale_after`.
    ///
    /// A timestamp in the future is never stale.
    pub fn acquire_with_timeout(
        store_dir: &Path,
        stale_after: Duration,
        purpose: Option<&str>,
    ) -> Result<Self> {
        let lock_path = lock_path(store_dir);

        if lock_path.exists() {
            match read_lock_info_from_path(&lock_path) {
                Ok(info) => {
                    if is_stale(&info, stale_after) {
                        take_over(&lock_path, Some(&info))?;
                    }
                }
                // Half-written by a crashed holder, or mid-write by a live one.
                // Only the age of the file itself tells them apart.
                Err(_) => {
                    if file_age(&lock_path).is_some_and(|age| age > stale_after) {
                        take_over(&lock_path, None)?;
                    }
                }
            }
        }

        Self::acquire(store_dir, purpose)
    }

    /// Keep trying until the lock is ours or `wait` elapses.
    pub fn acquire_waiting(
        store_dir: &Path,
        wait: Duration,
        stale_after: Duration,
        purpose: Option<&str>,
    ) -> Result<Self> {
        let started = Instant::now();
        loop {
            match Self::acquire_with_timeout(store_dir, stale_after, purpose) {
                Ok(lock) => return Ok(lock),
                Err(e) if started.elapsed() >= wait => {
                    return Err(e).with_context(|| {
                        format!(
                            "timed out after {:?} waiting for store lock in {}",
                            wait,
                            store_dir.display()
                        )
                    });
                }
                Err(_) => thread::sleep(POLL_INTERVAL),
            }
        }
    }

    /// Release the lock file, unless another holder has taken it over.
    pub fn release(&mut self) -> Result<()> {
        if !self.held {
            return Ok(());
        }
        self.held = false;
        match read_lock_info_from_path(&self.path) {
            Ok(info) if info.token == self.token => remove_if_present(&self.path),
            _ => Ok(()),
        }
    }

    /// Owner token written into the lock file.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Check if a lock file exists
    pub fn is_locked(store_dir: &Path) -> bool {
        lock_path(store_dir).exists()
    }

    /// Read the lock file information
    pub fn read_lock_info(store_dir: &Path) -> Result<LockInfo> {
        read_lock_info_from_path(&lock_path(store_dir))
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

fn new_token() -> String {
    format!("{}-{:016x}", std::process::id(), rand::random::<u64>())
}

fn is_stale(info: &LockInfo, stale_after: Duration) -> bool {
    (Utc::now() - info.acquired_at)
        .to_std()
        .is_ok_and(|age| age > stale_after)
}

fn same_holder(a: &LockInfo, b: &LockInfo) -> bool {
    a.token == b.token && a.pid == b.pid && a.acquired_at == b.acquired_at
}

/// Move the stale lock at `lock_path` out of the way.
///
/// `observed` is the holder that was judged stale (`None` for an unreadable
/// file). If the file moved is not that holder, it is put back and the
/// takeover fails.
fn take_over(lock_path: &Path, observed: Option<&LockInfo>) -> Result<()> {
    let tombstone = lock_path.with_file_name(format!("{LOCK_FILE}.stale-{}", new_token()));
    match fs::rename(lock_path, &tombstone) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {
            bail!("stale lock {} was taken over concurrently", lock_path.display());
        }
        Err(e) => {
            return Err(e).with_context(|| {
                format!("failed to move stale lock file {}", lock_path.display())
            });
        }
    }

    let moved = read_lock_info_from_path(&tombstone).ok();
    let expected = match (observed, &moved) {
        (Some(observed), Some(moved)) => same_holder(observed, moved),
        (None, None) => true,
        _ => false,
    };
    if !expected {
        // A new holder got in between the staleness check and the rename.
        let restored = fs::hard_link(&tombstone, lock_path);
        remove_if_present(&tombstone)?;
        restored.with_context(|| format!("failed to restore lock file {}", lock_path.display()))?;
        bail!("lock {} changed hands during takeover", lock_path.display());
    }
    remove_if_present(&tombstone)
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("failed to remove lock file {}", path.display())),
    }
}

fn file_age(path: &Path) -> Option<Duration> {
    fs::metadata(path).ok()?.modified().ok()?.elapsed().ok()
}

fn read_lock_info_from_path(path: &Path) -> Result<LockInfo> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read lock file {}", path.display()))?;
    let info: LockInfo = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse lock JSON from {}", path.display()))?;
    Ok(info)
}

/// Get the lock file path for a store directory
pub fn lock_path(store_dir: &Path) -> PathBuf {
    store_dir.join(LOCK_FILE)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn acquire_creates_and_release_removes_lock_file() {
        let td = tempdir().expect("tempdir");
        let mut lock = StoreLock::acquire(td.path(), Some("write")).expect("acquire");
        assert!(lock_path(td.path()).exists());
        lock.release().expect("release");
        assert!(!lock_path(td.path()).exists());
    }

    #[test]
    fn acquire_fails_when_locked() {
        let td = tempdir().expect("tempdir");
        let _lock1 = StoreLock::acquire(td.path(), None).expect("first acquire");

        let err = StoreLock::acquire(td.path(), None).unwrap_err();
        assert!(err.to_string().contains("lock already held"));
    }

    #[test]
    fn drop_releases_lock() {
        let td = tempdir().expect("tempdir");
        {
            let _lock = StoreLock::acquire(td.path(), None).expect("acquire");
            assert!(StoreLock::is_locked(td.path()));
        }
        assert!(!StoreLock::is_locked(td.path()));
    }

    #[test]
    fn read_lock_info_returns_holder() {
        let td = tempdir().expect("tempdir");
        let _lock = StoreLock::acquire(td.path(), Some("write")).expect("acquire");

        let info = StoreLock::read_lock_info(td.path()).expect("read info");
        assert_eq!(info.pid, std::process::id());
        assert!(!info.hostname.is_empty());
        assert_eq!(info.purpose.as_deref(), Some("write"));
    }

    #[test]
    fn acquire_with_timeout_takes_over_stale_lock() {
        let td = tempdir().expect("tempdir");
        let old_info = LockInfo {
            pid: 12345,
            hostname: "crashed-host".to_string(),
            acquired_at: Utc::now() - chrono::Duration::hours(2),
            purpose: None,
            token: "crashed".to_string(),
        };
        fs::write(
            lock_path(td.path()),
            serde_json::to_string(&old_info).expect("serialize"),
        )
        .expect("write stale lock");

        let _lock = StoreLock::acquire_with_timeout(td.path(), Duration::from_secs(60), None)
            .expect("acquire with timeout");

        let info = StoreLock::read_lock_info(td.path()).expect("read info");
        assert_eq!(info.pid, std::process::id());
        assert_ne!(info.token, "crashed");

        // The tombstone is cleaned up after the takeover.
        let leftovers: Vec<_> = fs::read_dir(td.path())
            .expect("read dir")
            .map(|e| e.expect("entry").file_name())
            .filter(|name| name != LOCK_FILE)
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }

    fn write_info(dir: &Path, acquired_at: DateTime<Utc>, token: &str) {
        let info = LockInfo {
            pid: 4242,
            hostname: "other-host".to_string(),
            acquired_at,
            purpose: Some("write".to_string()),
            token: token.to_string(),
        };
        fs::write(lock_path(dir), serde_json::to_string(&info).expect("serialize"))
            .expect("write lock");
    }

    #[test]
    fn future_dated_lock_is_not_stale() {
        let td = tempdir().expect("tempdir");
        write_info(td.path(), Utc::now() + chrono::Duration::hours(1), "ahead");

        let err = StoreLock::acquire_with_timeout(td.path(), Duration::from_secs(60), None)
            .unwrap_err();
        assert!(err.to_string().contains("lock already held"));
        let info = StoreLock::read_lock_info(td.path()).expect("read info");
        assert_eq!(info.token, "ahead");
    }

    #[test]
    fn release_keeps_a_lock_taken_over_by_someone_else() {
        let td = tempdir().expect("tempdir");
        let mut lock = StoreLock::acquire(td.path(), None).expect("acquire");
        assert_eq!(
            StoreLock::read_lock_info(td.path()).expect("info").token,
            lock.token()
        );

        // Another process declared us stale and now holds the lock.
        write_info(td.path(), Utc::now(), "successor");
        lock.release().expect("release");
        drop(lock);

        let info = StoreLock::read_lock_info(td.path()).expect("read info");
        assert_eq!(info.token, "successor");
    }

    #[test]
    fn takeover_restores_a_lock_that_changed_hands() {
        let td = tempdir().expect("tempdir");
        let stale = LockInfo {
            pid: 1,
            hostname: "crashed-host".to_string(),
            acquired_at: Utc::now() - chrono::Duration::hours(2),
            purpose: None,
            token: "crashed".to_string(),
        };
        // The file on disk is already a fresh holder's, not the one judged stale.
        write_info(td.path(), Utc::now(), "fresh");

        let err = take_over(&lock_path(td.path()), Some(&stale)).unwrap_err();
        assert!(err.to_string().contains("changed hands"));
        let info = StoreLock::read_lock_info(td.path()).expect("read info");
        assert_eq!(info.token, "fresh");
        assert_eq!(fs::read_dir(td.path()).expect("read dir").count(), 1);
    }

    #[test]
    fn racing_takeovers_of_a_stale_lock_yield_one_holder() {
        let td = tempdir().expect("tempdir");
        write_info(td.path(), Utc::now() - chrono::Duration::hours(2), "crashed");
        let dir = Arc::new(td.path().to_path_buf());
        let barrier = Arc::new(std::sync::Barrier::new(2));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let dir = Arc::clone(&dir);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    StoreLock::acquire_with_timeout(&dir, Duration::from_secs(60), None).ok()
                })
            })
            .collect();
        let winners: Vec<StoreLock> = handles
            .into_iter()
            .filter_map(|h| h.join().expect("join"))
            .collect();

        assert_eq!(winners.len(), 1);
        let info = StoreLock::read_lock_info(td.path()).expect("read info");
        assert_eq!(info.token, winners[0].token());
    }

    #[test]
    fn acquire_with_timeout_respects_fresh_lock() {
        let td = tempdir().expect("tempdir");
        let _lock1 = StoreLock::acquire(td.path(), None).expect("first acquire");

        let result = StoreLock::acquire_with_timeout(td.path(), Duration::from_secs(3600), None);
        assert!(result.is_err());
    }

    #[test]
    fn acquire_waiting_times_out_on_held_lock() {
        let td = tempdir().expect("tempdir");
        let _held = StoreLock::acquire(td.path(), None).expect("acquire");

        let err = StoreLock::acquire_waiting(
            td.path(),
            Duration::from_millis(30),
            Duration::from_secs(3600),
            None,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("timed out"));
    }

    #[test]
    fn waiting_writers_serialize() {
        let td = tempdir().expect("tempdir");
        let dir = Arc::new(td.path().to_path_buf());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let dir = Arc::clone(&dir);
                let inside = Arc::clone(&inside);
                let max_seen = Arc::clone(&max_seen);
                thread::spawn(move || {
                    for _ in 0..10 {
                        let _lock = StoreLock::acquire_waiting(
                            &dir,
                            Duration::from_secs(10),
                            Duration::from_secs(3600),
                            None,
                        )
                        .expect("acquire");
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().expect("join");
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }
}
