//! Exclusive advisory lock guarding registry writes.
//!
//! The lock is a sibling file (`registry.json.lock`) locked with `flock`.
//! Its contents name the holder so that a lock left behind by a wedged
//! process can be identified and broken once it is older than the
//! configured staleness bound. A holder that has not written itself yet
//! is only judged by how long this waiter has watched it.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use orch_core::config::RegistryConfig;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("failed to open lock file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to lock {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to record lock holder in {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to break stale lock {path}: {source}")]
    Break {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("timed out after {waited:?} waiting for {path}{}", holder_suffix(.holder))]
    Timeout {
        path: PathBuf,
        waited: Duration,
        holder: Option<LockHolder>,
    },
}

fn holder_suffix(holder: &Option<LockHolder>) -> String {
    holder
        .as_ref()
        .map(|holder| format!(" (held by {holder})"))
        .unwrap_or_default()
}

/// What the current holder wrote into the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

impl std::fmt::Display for LockHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pid {} since {}", self.pid, self.acquired_at.to_rfc3339())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    pub timeout: Duration,
    pub stale_after: Duration,
    pub retry_initial: Duration,
    pub retry_max: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self::from(&RegistryConfig::default())
    }
}

impl From<&RegistryConfig> for LockOptions {
    fn from(config: &RegistryConfig) -> Self {
        let retry_initial = config.retry_initial_ms.max(1);
        Self {
            timeout: Duration::from_millis(config.lock_timeout_ms),
            stale_after: Duration::from_secs(config.stale_lock_secs),
            retry_initial: Duration::from_millis(retry_initial),
            retry_max: Duration::from_millis(config.retry_max_ms.max(retry_initial)),
        }
    }
}

/// A lock that was force-broken while acquiring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokenLock {
    pub holder: Option<LockHolder>,
    pub age: Duration,
}

/// Held exclusive lock. Released when dropped, on every exit path.
#[derive(Debug)]
pub struct RegistryLock {
    file: File,
    path: PathBuf,
    broken: Vec<BrokenLock>,
}

impl RegistryLock {
    pub fn acquire(path: &Path, options: &LockOptions) -> Result<Self, LockError> {
        if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| LockError::Open {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let started = Instant::now();
        let mut delay = options.retry_initial;
        let mut broken = Vec::new();
        let mut unrecorded_since: Option<Instant> = None;

        loop {
            let file = open_lock_file(path)?;
            match file.try_lock_exclusive() {
                Ok(()) => {
                    if !still_linked(&file, path) {
                        // Another process broke and replaced the file between
                        // our open and our lock.
                        debug!(path = %path.display(), "lock file replaced while locking; retrying");
                        drop(file);
                        if started.elapsed() >= options.timeout {
                            return Err(LockError::Timeout {
                                path: path.to_path_buf(),
                                waited: started.elapsed(),
                                holder: None,
                            });
                        }
                        continue;
                    }
                    let mut lock = Self {
                        file,
                        path: path.to_path_buf(),
                        broken,
                    };
                    lock.record_holder()?;
                    return Ok(lock);
                }
                Err(err) if is_contended(&err) => {}
                Err(source) => {
                    return Err(LockError::Lock {
                        path: path.to_path_buf(),
                        source,
                    })
                }
            }

            let holder = read_holder(path);
            let age = match &holder {
                Some(holder) => {
                    unrecorded_since = None;
                    (Utc::now() - holder.acquired_at).to_std().ok()
                }
                None => Some(unrecorded_since.get_or_insert_with(Instant::now).elapsed()),
            };
            if let Some(age) = age {
                if age > options.stale_after {
                    warn!(
                        path = %path.display(),
                        holder = ?holder,
                        age_secs = age.as_secs(),
                        "breaking stale registry lock"
                    );
                    match fs::remove_file(path) {
                        Ok(()) => {}
                        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                        Err(source) => {
                            return Err(LockError::Break {
                                path: path.to_path_buf(),
                                source,
                            })
                        }
                    }
                    broken.push(BrokenLock { holder, age });
                    unrecorded_since = None;
                    continue;
                }
            }

            let waited = started.elapsed();
            if waited >= options.timeout {
                return Err(LockError::Timeout {
                    path: path.to_path_buf(),
                    waited,
                    holder,
                });
            }
            thread::sleep(delay.min(options.timeout - waited));
            delay = (delay * 2).min(options.retry_max);
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stale locks broken on the way to acquiring this one.
    pub fn broken(&self) -> &[BrokenLock] {
        &self.broken
    }

    fn record_holder(&mut self) -> Result<(), LockError> {
        let holder = LockHolder {
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        let body = serde_json::to_vec(&holder).map_err(|err| LockError::Write {
            path: self.path.clone(),
            source: io::Error::new(io::ErrorKind::InvalidData, err),
        })?;
        let write = |file: &mut File| -> io::Result<()> {
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&body)?;
            file.sync_all()
        };
        write(&mut self.file).map_err(|source| LockError::Write {
            path: self.path.clone(),
            source,
        })
    }
}

impl Drop for RegistryLock {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        if let Err(err) = self.file.unlock() {
            warn!(path = %self.path.display(), error = %err, "failed to release registry lock");
        }
    }
}

fn open_lock_file(path: &Path) -> Result<File, LockError> {
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(|source| LockError::Open {
            path: path.to_path_buf(),
            source,
        })
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

#[cfg(unix)]
fn still_linked(file: &File, path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    match (file.metadata(), fs::metadata(path)) {
        (Ok(locked), Ok(current)) => locked.ino() == current.ino() && locked.dev() == current.dev(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn still_linked(_file: &File, path: &Path) -> bool {
    path.exists()
}

fn read_holder(path: &Path) -> Option<LockHolder> {
    let mut text = String::new();
    File::open(path).ok()?.read_to_string(&mut text).ok()?;
    serde_json::from_str(text.trim()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    fn fast(timeout_ms: u64) -> LockOptions {
        LockOptions {
            timeout: Duration::from_millis(timeout_ms),
            stale_after: Duration::from_secs(3600),
            retry_initial: Duration::from_millis(5),
            retry_max: Duration::from_millis(20),
        }
    }

    #[test]
    fn holder_is_recorded_and_cleared_on_release() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("registry.json.lock");

        let lock = RegistryLock::acquire(&path, &fast(100)).expect("acquire");
        let holder = read_holder(&path).expect("holder written");
        assert_eq!(holder.pid, std::process::id());
        assert!(lock.broken().is_empty());
        drop(lock);

        assert_eq!(fs::read_to_string(&path).expect("read"), "");
        RegistryLock::acquire(&path, &fast(100)).expect("reacquire after release");
    }

    #[test]
    fn contended_lock_times_out_within_bound() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("registry.json.lock");

        let _held = RegistryLock::acquire(&path, &fast(100)).expect("first");
        let started = Instant::now();
        let err = RegistryLock::acquire(&path, &fast(120)).expect_err("contended");
        let elapsed = started.elapsed();

        match err {
            LockError::Timeout { holder, .. } => {
                assert_eq!(holder.map(|h| h.pid), Some(std::process::id()));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(elapsed >= Duration::from_millis(120));
        assert!(elapsed < Duration::from_secs(2), "took {elapsed:?}");
    }

    #[test]
    fn stale_holder_is_broken_and_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("registry.json.lock");

        let held = RegistryLock::acquire(&path, &fast(100)).expect("first");
        let old = LockHolder {
            pid: 999_999,
            acquired_at: Utc::now() - chrono::Duration::hours(2),
        };
        fs::write(&path, serde_json::to_vec(&old).expect("json")).expect("backdate");

        let lock = RegistryLock::acquire(&path, &fast(500)).expect("break stale lock");
        assert_eq!(lock.broken().len(), 1);
        assert_eq!(lock.broken()[0].holder.as_ref(), Some(&old));
        assert!(lock.broken()[0].age >= Duration::from_secs(3600));
        drop(held);
    }

    fn hold_unrecorded(path: &Path, idle_for: Duration) -> File {
        let file = open_lock_file(path).expect("open");
        file.set_modified(SystemTime::now() - idle_for)
            .expect("backdate mtime");
        file.try_lock_exclusive().expect("flock");
        file
    }

    #[test]
    fn long_idle_lock_file_is_not_stale_while_holder_records_itself() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("registry.json.lock");
        let held = hold_unrecorded(&path, Duration::from_secs(600));

        let options = LockOptions {
            stale_after: Duration::from_secs(120),
            ..fast(150)
        };
        match RegistryLock::acquire(&path, &options) {
            Err(LockError::Timeout { holder, .. }) => assert!(holder.is_none()),
            Ok(lock) => panic!("acquired a held lock, broke {:?}", lock.broken()),
            Err(other) => panic!("unexpected error: {other}"),
        }
        assert!(path.exists(), "lock file must not be removed");
        drop(held);
    }

    #[test]
    fn unrecorded_holder_is_broken_only_after_waiting_out_staleness() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("registry.json.lock");
        let held = hold_unrecorded(&path, Duration::ZERO);

        let options = LockOptions {
            stale_after: Duration::from_millis(60),
            ..fast(2_000)
        };
        let started = Instant::now();
        let lock = RegistryLock::acquire(&path, &options).expect("break wedged lock");
        assert!(started.elapsed() >= Duration::from_millis(60));
        assert_eq!(lock.broken().len(), 1);
        assert!(lock.broken()[0].holder.is_none());
        drop(held);
    }

    #[test]
    fn options_follow_registry_config() {
        let config = RegistryConfig {
            lock_timeout_ms: 250,
            stale_lock_secs: 30,
            retry_initial_ms: 0,
            retry_max_ms: 0,
            ..RegistryConfig::default()
        };
        let options = LockOptions::from(&config);
        assert_eq!(options.timeout, Duration::from_millis(250));
        assert_eq!(options.stale_after, Duration::from_secs(30));
        assert_eq!(options.retry_initial, Duration::from_millis(1));
        assert_eq!(options.retry_max, Duration::from_millis(1));
    }
}
