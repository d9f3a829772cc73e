//! Single-instance lock: one hub process per lock file.
//!
//! The lock file is created with create-new semantics and holds a JSON
//! [`LockMeta`]. A lock file whose PID no longer maps to a live process is
//! orphaned: it is removed and acquisition is retried once. Contenders
//! serialize on an advisory lock over a sibling `.guard` file while they
//! inspect or replace the lock file.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::LockError;

/// Contents of the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockMeta {
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

/// Ownership token for the lock file. Releases on drop.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    meta: LockMeta,
    released: bool,
}

impl InstanceLock {
    /// Acquire the lock at `path` for the current process.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self, LockError> {
        Self::acquire_as(path, std::process::id())
    }

    /// Acquire the lock on behalf of `pid`.
    pub fn acquire_as(path: impl AsRef<Path>, pid: u32) -> Result<Self, LockError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| LockError::Io {
                path: path.clone(),
                source,
            })?;
        }

        // Inspection and orphan removal happen under the guard, so no
        // contender can remove a lock another one just created.
        let _guard = lock_guard(&path)?;

        if let Some(lock) = try_create(&path, pid)? {
            return Ok(lock);
        }

        match read_meta(&path) {
            Some(meta) if is_process_alive(meta.pid) => {
                return Err(LockError::AlreadyRunning {
                    pid: meta.pid,
                    path,
                });
            }
            Some(meta) => {
                warn!(
                    pid = meta.pid,
                    path = %path.display(),
                    "Removing orphaned lock file (process not running)"
                );
            }
            None => {
                warn!(path = %path.display(), "Removing unreadable lock file");
            }
        }

        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => return Err(LockError::Io { path, source }),
        }

        match try_create(&path, pid)? {
            Some(lock) => Ok(lock),
            None => {
                let holder = read_meta(&path).map(|m| m.pid).unwrap_or(0);
                Err(LockError::AlreadyRunning { pid: holder, path })
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn meta(&self) -> &LockMeta {
        &self.meta
    }

    /// Remove the lock file. Idempotent.
    pub fn release(mut self) -> Result<(), LockError> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<(), LockError> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        let _guard = lock_guard(&self.path)?;
        // Only remove the file if it is still ours.
        match read_meta(&self.path) {
            Some(meta) if meta.pid != self.meta.pid => {
                warn!(
                    path = %self.path.display(),
                    owner = meta.pid,
                    "Lock file now belongs to another process; leaving it"
                );
                return Ok(());
            }
            _ => {}
        }

        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "Instance lock released");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(LockError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            warn!("Failed to release instance lock on drop: {e}");
        }
    }
}

/// Atomically create the lock file. `Ok(None)` means it already exists.
///
/// The metadata is written to a private temp file first and then
/// hard-linked into place, so the lock never exists half-written.
fn try_create(path: &Path, pid: u32) -> Result<Option<InstanceLock>, LockError> {
    let io_err = |source| LockError::Io {
        path: path.to_path_buf(),
        source,
    };

    let meta = LockMeta {
        pid,
        acquired_at: Utc::now(),
    };
    let body = serde_json::to_vec(&meta).unwrap_or_else(|_| pid.to_string().into_bytes());

    let staging = staging_path(path, pid);
    let written = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&staging)
        .and_then(|mut file| {
            file.write_all(&body)?;
            file.sync_all()
        });
    if let Err(source) = written {
        let _ = fs::remove_file(&staging);
        return Err(io_err(source));
    }

    let linked = fs::hard_link(&staging, path);
    let _ = fs::remove_file(&staging);
    match linked {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(None),
        Err(source) => return Err(io_err(source)),
    }

    info!(pid, path = %path.display(), "Instance lock acquired");
    Ok(Some(InstanceLock {
        path: path.to_path_buf(),
        meta,
        released: false,
    }))
}

/// Open the sibling guard file and take an exclusive advisory lock on it.
///
/// The guard file is never removed; the OS drops the lock when the
/// returned handle closes.
fn lock_guard(path: &Path) -> Result<File, LockError> {
    let guard_path = sibling(path, "guard");
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&guard_path)
        .map_err(|source| LockError::Io {
            path: guard_path.clone(),
            source,
        })?;
    file.lock_exclusive().map_err(|source| LockError::Io {
        path: guard_path,
        source,
    })?;
    Ok(file)
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "hub.lock".to_string());
    path.with_file_name(format!(".{name}.{suffix}"))
}

/// Unique sibling path used to stage the lock contents.
fn staging_path(path: &Path, pid: u32) -> PathBuf {
    let nonce = uuid::Uuid::new_v4().simple();
    sibling(path, &format!("{pid}.{nonce}.tmp"))
}

/// Read lock metadata. Accepts a bare PID for older lock files.
fn read_meta(path: &Path) -> Option<LockMeta> {
    let raw = fs::read_to_string(path).ok()?;
    if let Ok(meta) = serde_json::from_str::<LockMeta>(&raw) {
        return Some(meta);
    }
    let pid = raw.trim().parse::<u32>().ok()?;
    debug!(pid, "Lock file holds a bare PID");
    Some(LockMeta {
        pid,
        acquired_at: DateTime::<Utc>::MIN_UTC,
    })
}

/// Whether `pid` maps to a running process.
#[cfg(target_os = "linux")]
pub fn is_process_alive(pid: u32) -> bool {
    pid != 0 && Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(all(unix, not(target_os = "linux")))]
pub fn is_process_alive(pid: u32) -> bool {
    pid != 0
        && std::process::Command::new("kill")
            .args(["-0", &pid.to_string()])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(true)
}

#[cfg(not(unix))]
pub fn is_process_alive(pid: u32) -> bool {
    pid != 0
}
