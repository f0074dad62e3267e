//! Metric lookup against the per-host cache files.
//!
//! Readers never take the cache lock; they only scan the tree and parse
//! `name,units,value` lines.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::debug;

use crate::cache::{self, CacheStore};
use crate::snapshot::REPORTED_METRIC;

/// Errors raised while looking a metric up in a host cache file.
#[derive(Error, Debug)]
pub enum LookupError {
    #[error("unable to read cache at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed cache line {line} in {}", path.display())]
    Malformed { path: PathBuf, line: usize },

    #[error("metric {name} not found")]
    NotFound { name: String },
}

/// One metric value as cached: both fields are opaque strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricSample {
    pub value: String,
    pub units: String,
}

/// Find the cache file for `host` by scanning the grid and cluster levels
/// under the cache root. The short-name transform applies to the lookup key
/// when configured, matching how the materializer keyed the file.
pub fn locate_host_file(store: &CacheStore, host: &str, short_name: bool) -> Option<PathBuf> {
    let key = cache::host_key(host, short_name);

    let grids = fs::read_dir(store.root()).ok()?;
    for grid in grids.flatten() {
        // The sentinel and dump files live at the root; only descend
        // into directories.
        if !grid.file_type().is_ok_and(|t| t.is_dir()) {
            continue;
        }

        let clusters = match fs::read_dir(grid.path()) {
            Ok(clusters) => clusters,
            Err(_) => continue,
        };

        for cluster in clusters.flatten() {
            if !cluster.file_type().is_ok_and(|t| t.is_dir()) {
                continue;
            }

            let candidate = cluster.path().join(key);
            if candidate.is_file() {
                debug!(path = %candidate.display(), "located host cache file");
                return Some(candidate);
            }
        }
    }

    None
}

/// Scan `path` for the first line whose name field equals `metric`.
///
/// Lines split on comma into name, units, value; only the first three
/// fields are meaningful. A line with fewer than two commas is a corrupt
/// cache and surfaces as [`LookupError::Malformed`] rather than a silent
/// empty value.
pub fn read_metric(path: &Path, metric: &str) -> Result<MetricSample, LookupError> {
    let file = File::open(path).map_err(|source| LookupError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|source| LookupError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let line = line.trim_end_matches('\r');

        let mut fields = line.splitn(3, ',');
        let (Some(name), Some(units), Some(value)) =
            (fields.next(), fields.next(), fields.next())
        else {
            return Err(LookupError::Malformed {
                path: path.to_path_buf(),
                line: idx + 1,
            });
        };

        if name == metric {
            return Ok(MetricSample {
                value: value.to_string(),
                units: units.to_string(),
            });
        }
    }

    Err(LookupError::NotFound {
        name: metric.to_string(),
    })
}

/// Seconds since the host last reported, from the `#REPORTED` line.
///
/// This is the heartbeat query: it never aliases a user-supplied metric
/// name, it reads the synthetic line directly.
pub fn heartbeat_age(path: &Path) -> Result<u64, LookupError> {
    let sample = read_metric(path, REPORTED_METRIC)?;

    // The cached value came straight from the snapshot; tolerate garbage
    // the way the rest of the pipeline does instead of failing the check.
    let reported: u64 = sample.value.trim().parse().unwrap_or(0);

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    Ok(now.saturating_sub(reported))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use assert_matches::assert_matches;
    use tempfile::TempDir;

    use super::*;

    fn write_host_file(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut f = File::create(&path).expect("create host file");
        f.write_all(content.as_bytes()).expect("write host file");
        path
    }

    #[test]
    fn test_read_metric_returns_value_and_units() {
        let dir = TempDir::new().expect("tempdir");
        let path = write_host_file(
            &dir,
            "h",
            "#REPORTED,,1000\nload_one,,5.0\nmem_free,KB,1024\n",
        );

        let sample = read_metric(&path, "load_one").expect("lookup");
        assert_eq!(sample.value, "5.0");
        assert_eq!(sample.units, "");

        let sample = read_metric(&path, "mem_free").expect("lookup");
        assert_eq!(sample.value, "1024");
        assert_eq!(sample.units, "KB");
    }

    #[test]
    fn test_read_metric_first_match_wins() {
        let dir = TempDir::new().expect("tempdir");
        let path = write_host_file(&dir, "h", "dup,a,1\ndup,b,2\n");

        let sample = read_metric(&path, "dup").expect("lookup");
        assert_eq!(sample.value, "1");
        assert_eq!(sample.units, "a");
    }

    #[test]
    fn test_read_metric_tolerates_crlf() {
        let dir = TempDir::new().expect("tempdir");
        let path = write_host_file(&dir, "h", "#REPORTED,,1000\r\nload_one,,5.0\r\n");

        let sample = read_metric(&path, "load_one").expect("lookup");
        assert_eq!(sample.value, "5.0");
    }

    #[test]
    fn test_read_metric_missing_is_not_found() {
        let dir = TempDir::new().expect("tempdir");
        let path = write_host_file(&dir, "h", "#REPORTED,,1000\n");

        let err = read_metric(&path, "load_one").expect_err("should miss");
        assert_matches!(err, LookupError::NotFound { name } if name == "load_one");
    }

    #[test]
    fn test_read_metric_malformed_line_is_an_error() {
        let dir = TempDir::new().expect("tempdir");
        let path = write_host_file(&dir, "h", "#REPORTED,,1000\nbroken line\n");

        let err = read_metric(&path, "load_one").expect_err("should fail");
        assert_matches!(err, LookupError::Malformed { line: 2, .. });
    }

    #[test]
    fn test_read_metric_unreadable_file() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("missing");

        let err = read_metric(&path, "load_one").expect_err("should fail");
        assert_matches!(err, LookupError::Read { .. });
    }

    #[test]
    fn test_locate_host_file_scans_grid_and_cluster_levels() {
        let dir = TempDir::new().expect("tempdir");
        let store = CacheStore::new(dir.path(), ".gm-cache", 120);

        // Sentinel at the root must not confuse the scan.
        store.sentinel_age().expect("create sentinel");

        fs::create_dir_all(dir.path().join("g/c")).expect("mkdir");
        write_host_file(&dir, "g/c/web01", "#REPORTED,,1000\n");

        let found = locate_host_file(&store, "web01", false).expect("should find");
        assert_eq!(found, dir.path().join("g/c/web01"));

        assert!(locate_host_file(&store, "nope", false).is_none());
    }

    #[test]
    fn test_locate_host_file_applies_short_name() {
        let dir = TempDir::new().expect("tempdir");
        let store = CacheStore::new(dir.path(), ".gm-cache", 120);

        fs::create_dir_all(dir.path().join("g/c")).expect("mkdir");
        write_host_file(&dir, "g/c/web01", "#REPORTED,,1000\n");

        assert!(locate_host_file(&store, "web01.example.com", true).is_some());
        assert!(locate_host_file(&store, "web01.example.com", false).is_none());
    }

    #[test]
    fn test_heartbeat_age_from_reported_line() {
        let dir = TempDir::new().expect("tempdir");

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_secs();
        let path = write_host_file(&dir, "h", &format!("#REPORTED,,{}\n", now - 5));

        let age = heartbeat_age(&path).expect("heartbeat");
        assert!((5..=7).contains(&age), "age={age}");
    }
}
