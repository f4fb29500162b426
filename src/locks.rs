//! Per-app mutual exclusion.
//!
//! Locks never wait: a second caller for the same app gets `Busy` straight
//! away. The lock is held for the whole of the wrapped future and released by
//! a guard, so errors, panics and dropped futures all release it.
//!
//! A manager opened [`in_dir`](LockManager::in_dir) also takes an exclusive
//! `flock` on `<dir>/<name>.lock`, so the daemon and one-shot commands
//! sharing a root exclude each other. The OS drops that lock with the file
//! handle, including when the holding process dies.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use anyhow::Context;
use fs2::FileExt;
use tracing::{debug, warn};

use crate::errors::{SupervisorError, SupervisorResult};

#[derive(Debug)]
struct Held {
    since: Instant,
    /// Keeps the file lock alive; dropping it unlocks.
    _file: Option<File>,
}

#[derive(Debug, Default, Clone)]
pub struct LockManager {
    held: Arc<Mutex<HashMap<String, Held>>>,
    dir: Option<Arc<PathBuf>>,
}

/// Releases its app lock on drop.
#[derive(Debug)]
pub struct AppLockGuard {
    manager: LockManager,
    name: String,
}

impl Drop for AppLockGuard {
    fn drop(&mut self) {
        self.manager.release(&self.name);
    }
}

impl LockManager {
    /// Locks scoped to this process only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks shared with every other process using the same `dir`.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            held: Arc::default(),
            dir: Some(Arc::new(dir.into())),
        }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref().map(PathBuf::as_path)
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, Held>> {
        // The table holds plain data; a poisoned lock is still consistent.
        self.held.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_file(&self, name: &str) -> io::Result<Option<File>> {
        let Some(dir) = &self.dir else {
            return Ok(None);
        };
        std::fs::create_dir_all(dir.as_path())?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(dir.join(format!("{name}.lock")))?;
        Ok(Some(file))
    }

    /// `Ok(false)` when another holder, in this process or another, has it.
    fn acquire(&self, name: &str) -> io::Result<bool> {
        let mut table = self.table();
        if table.contains_key(name) {
            return Ok(false);
        }
        let file = self.lock_file(name)?;
        if let Some(file) = &file {
            if let Err(e) = FileExt::try_lock_exclusive(file) {
                if is_contended(&e) {
                    return Ok(false);
                }
                return Err(e);
            }
        }
        table.insert(
            name.to_string(),
            Held {
                since: Instant::now(),
                _file: file,
            },
        );
        Ok(true)
    }

    /// `true` if the lock was free and is now held by the caller.
    pub fn try_acquire(&self, name: &str) -> bool {
        self.acquire(name).unwrap_or_else(|e| {
            warn!(app = %name, error = %e, "could not take app lock file");
            false
        })
    }

    pub fn release(&self, name: &str) {
        self.table().remove(name);
    }

    /// Held by this manager.
    pub fn is_held(&self, name: &str) -> bool {
        self.table().contains_key(name)
    }

    /// Held by another process sharing the lock directory. Never true for a
    /// process-local manager or for names this manager holds itself.
    pub fn is_held_elsewhere(&self, name: &str) -> bool {
        if self.is_held(name) {
            return false;
        }
        let file = match self.lock_file(name) {
            Ok(Some(file)) => file,
            Ok(None) => return false,
            Err(e) => {
                debug!(app = %name, error = %e, "could not open app lock file");
                return false;
            }
        };
        match FileExt::try_lock_shared(&file) {
            Ok(()) => {
                let _ = FileExt::unlock(&file);
                false
            }
            Err(e) => is_contended(&e),
        }
    }

    /// Currently held names with the instant each was taken, oldest first.
    pub fn held(&self) -> Vec<(String, Instant)> {
        let mut held: Vec<_> = self
            .table()
            .iter()
            .map(|(name, held)| (name.clone(), held.since))
            .collect();
        held.sort_by_key(|(_, at)| *at);
        held
    }

    /// Acquire `name` or fail with `Busy`.
    pub fn guard(&self, name: &str) -> SupervisorResult<AppLockGuard> {
        let acquired = self
            .acquire(name)
            .with_context(|| format!("Failed to take lock for \"{name}\""))?;
        if !acquired {
            debug!(app = %name, "lock busy");
            return Err(SupervisorError::Busy {
                name: name.to_string(),
            });
        }
        Ok(AppLockGuard {
            manager: self.clone(),
            name: name.to_string(),
        })
    }

    /// Run `work` while holding the lock for `name`.
    pub async fn with_lock<T, Fut>(&self, name: &str, work: Fut) -> SupervisorResult<T>
    where
        Fut: Future<Output = SupervisorResult<T>>,
    {
        let _guard = self.guard(name)?;
        work.await
    }
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
