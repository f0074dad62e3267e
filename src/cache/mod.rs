//! Shared on-disk snapshot cache.
//!
//! One cache root holds a per-host file tree (`<root>/<grid>/<cluster>/<host>`)
//! plus a single sentinel file. The sentinel's mtime is the staleness clock
//! for the whole tree and its advisory write lock serializes materializers
//! across probe processes. Readers never lock.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use fs2::FileExt;
use thiserror::Error;
use tracing::{debug, warn};

/// Name of the raw snapshot dump written under the cache root.
const DUMP_FILE: &str = "dump.xml";

/// Errors raised by the cache store.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("unable to access cache sentinel {}: {source}", path.display())]
    Stat {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("unable to open cache sentinel {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cache sentinel {} is locked by another process", path.display())]
    LockBusy { path: PathBuf },

    #[error("unable to create cache directory {}: {source}", path.display())]
    Path {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Handle on one cache root.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
    sentinel_name: String,
    max_age: u64,
}

impl CacheStore {
    pub fn new(root: &Path, sentinel_name: &str, max_age: u64) -> Self {
        Self {
            root: root.to_path_buf(),
            sentinel_name: sentinel_name.to_string(),
            max_age,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sentinel_path(&self) -> PathBuf {
        self.root.join(&self.sentinel_name)
    }

    pub fn dump_path(&self) -> PathBuf {
        self.root.join(DUMP_FILE)
    }

    pub fn grid_dir(&self, grid: &str) -> PathBuf {
        self.root.join(grid)
    }

    /// Path of the per-host cache file for an already-transformed host key.
    pub fn host_path(&self, grid: &str, cluster: &str, host_key: &str) -> PathBuf {
        self.root.join(grid).join(cluster).join(host_key)
    }

    /// Seconds since the sentinel was last touched.
    ///
    /// An absent sentinel is created empty (owner read/write only) and
    /// reported as exactly `max_age` old, forcing the first refresh.
    pub fn sentinel_age(&self) -> Result<u64, CacheError> {
        let path = self.sentinel_path();

        let meta = match fs::metadata(&path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.create_sentinel(&path)?;
                debug!(path = %path.display(), "created cache sentinel");
                return Ok(self.max_age);
            }
            Err(source) => return Err(CacheError::Stat { path, source }),
        };

        let mtime = meta
            .modified()
            .map_err(|source| CacheError::Stat { path, source })?;

        let age = SystemTime::now()
            .duration_since(mtime)
            .unwrap_or_default()
            .as_secs();

        Ok(age)
    }

    fn create_sentinel(&self, path: &Path) -> Result<(), CacheError> {
        let mut opts = OpenOptions::new();
        opts.write(true).create_new(true);

        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o600);
        }

        match opts.open(path) {
            Ok(_) => Ok(()),
            // Another probe won the creation race; the sentinel exists now.
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(source) => Err(CacheError::Stat {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Take the exclusive advisory write lock on the sentinel.
    ///
    /// Non-blocking: contention surfaces immediately as
    /// [`CacheError::LockBusy`] so the caller can drive its own backoff.
    pub fn lock(&self) -> Result<CacheLock, CacheError> {
        let path = self.sentinel_path();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| CacheError::Open {
                path: path.clone(),
                source,
            })?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!(path = %path.display(), "acquired cache write lock");
                Ok(CacheLock { file, path })
            }
            Err(_) => Err(CacheError::LockBusy { path }),
        }
    }
}

/// Exclusive write lock over the cache sentinel.
///
/// The lock releases when the guard drops, on every exit path.
#[derive(Debug)]
pub struct CacheLock {
    file: File,
    path: PathBuf,
}

impl CacheLock {
    /// Bump the sentinel mtime to now, resetting the staleness clock.
    ///
    /// Best-effort: a failed touch leaves the cache stale for the next
    /// probe, which is safe, so it is logged rather than propagated.
    pub fn touch(&self) {
        if let Err(e) = self.file.set_modified(SystemTime::now()) {
            warn!(path = %self.path.display(), error = %e, "failed to touch cache sentinel");
        }
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        if let Err(e) = fs2::FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %e, "failed to release cache lock");
        }
    }
}

/// Create a cache tree directory if it does not exist yet.
///
/// Losing a creation race to another probe is success.
pub fn ensure_dir(dir: &Path) -> Result<(), CacheError> {
    match fs::create_dir(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(source) => Err(CacheError::Path {
            path: dir.to_path_buf(),
            source,
        }),
    }
}

/// Cache key for a host name: truncated at the first `.` when the
/// short-name option is on, unchanged otherwise.
pub fn host_key(host: &str, short_name: bool) -> &str {
    if short_name {
        host.split('.').next().unwrap_or(host)
    } else {
        host
    }
}
