//! Cache refresh coordination.
//!
//! One pass per process: check staleness, fetch, lock, materialize, touch,
//! unlock — strictly in that order. Lock contention is the only recoverable
//! condition; everything else is terminal for the run. The lock guard drops
//! on every path, so a failed materialization still releases the sentinel.

use std::fs;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use tracing::debug;

use crate::cache::{CacheError, CacheLock, CacheStore};
use crate::config::Config;
use crate::{fetch, snapshot};

/// Lock acquisition attempts before giving up on a (possibly stale) lock.
pub const MAX_LOCK_ATTEMPTS: u32 = 4;

/// Backoff base grows by this much per failed attempt.
const BACKOFF_STEP_SECS: f64 = 0.5;

/// Uniform random jitter added to every backoff sleep, in seconds.
const BACKOFF_JITTER_SECS: f64 = 3.0;

/// What the coordinator did with the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refresh {
    /// Cache was younger than max-age; nothing fetched.
    Fresh,
    /// A snapshot was fetched and materialized.
    Refreshed,
}

/// Refresh the shared cache if the sentinel says it is stale.
///
/// Many probe invocations race on the same cache root; whoever gets the
/// write lock materializes for everyone else. Returns once the cache is
/// guaranteed fresh enough to read.
pub fn refresh_if_stale(cfg: &Config, store: &CacheStore) -> Result<Refresh> {
    let age = store.sentinel_age().context("checking cache age")?;
    debug!(age, max_age = cfg.max_age, "cache age");

    if age < cfg.max_age {
        return Ok(Refresh::Fresh);
    }

    debug!(
        host = %cfg.gmetad_host,
        port = cfg.gmetad_port,
        "cache is stale, fetching snapshot"
    );
    let xml = fetch::fetch(&cfg.gmetad_host, cfg.gmetad_port)
        .context("unable to fetch snapshot from gmetad")?;
    debug!(bytes = xml.len(), "snapshot received");

    if cfg.dump {
        let path = store.dump_path();
        fs::write(&path, &xml)
            .with_context(|| format!("unable to dump snapshot to {}", path.display()))?;
        debug!(path = %path.display(), "dumped raw snapshot");
    }

    let lock = acquire_lock(store)?;

    snapshot::materialize(&xml, store, cfg.short_name).context("unable to materialize snapshot")?;

    lock.touch();

    Ok(Refresh::Refreshed)
}

/// Take the sentinel write lock, backing off on contention.
///
/// Each failed attempt `i` sleeps `i * 0.5 + U(0, 3)` seconds; the jitter
/// spreads out probes that went stale together. The final failed attempt
/// returns immediately instead of sleeping again.
fn acquire_lock(store: &CacheStore) -> Result<CacheLock> {
    let mut attempt = 0;

    loop {
        match store.lock() {
            Ok(lock) => return Ok(lock),
            Err(e @ CacheError::LockBusy { .. }) => {
                attempt += 1;
                if attempt >= MAX_LOCK_ATTEMPTS {
                    return Err(e).with_context(|| {
                        format!("unable to lock cache after {attempt} attempts (stale lock?)")
                    });
                }
                backoff(attempt - 1);
            }
            Err(e) => return Err(e).context("unable to open cache sentinel for locking"),
        }
    }
}

/// Sleep for the backoff of the given 0-based failed attempt.
fn backoff(attempt: u32) {
    let base = f64::from(attempt) * BACKOFF_STEP_SECS;
    let jitter = rand::thread_rng().gen_range(0.0..BACKOFF_JITTER_SECS);
    let delay = Duration::from_secs_f64(base + jitter);

    debug!(attempt, ?delay, "cache lock busy, backing off");
    thread::sleep(delay);
}
