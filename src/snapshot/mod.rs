//! Snapshot materialization.
//!
//! Parses one gmetad XML dump and rewrites the per-host cache files under
//! the cache root. The walk is GRID -> CLUSTER -> HOST -> METRIC; any other
//! element (and its whole subtree) is skipped silently. Each host file is
//! fully overwritten: a synthetic `#REPORTED,,<epoch>` first line, then one
//! `name,units,value` line per metric. A write failure mid-host leaves that
//! file truncated; there is no rollback.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;
use tracing::{debug, trace};

use crate::cache::{self, CacheError, CacheStore};

/// Expected document root tag of a gmetad dump.
const ROOT_TAG: &[u8] = b"GANGLIA_XML";

/// Synthetic metric name carrying the host's last-report time.
pub const REPORTED_METRIC: &str = "#REPORTED";

/// Errors raised while materializing a snapshot.
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("malformed snapshot XML at byte {position}: {message}")]
    Malformed { position: u64, message: String },

    #[error("unexpected document root <{found}>, expected <GANGLIA_XML>")]
    UnexpectedRoot { found: String },

    #[error("unable to write host cache file {}: {source}", path.display())]
    CacheWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// One open element on the walk, carrying whatever the level below needs.
enum Frame {
    /// The GANGLIA_XML document root.
    Doc,
    /// A GRID element; its directory under the cache root exists.
    Grid { dir: PathBuf },
    /// A CLUSTER element; its directory under the grid exists.
    Cluster { dir: PathBuf },
    /// A HOST element with its cache file open for rewrite.
    Host(HostWriter),
    /// Anything else: the subtree is ignored.
    Skip,
}

struct HostWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    metrics: usize,
}

impl HostWriter {
    fn open(path: PathBuf, reported: &str) -> Result<Self, SnapshotError> {
        let file = File::create(&path).map_err(|source| SnapshotError::CacheWrite {
            path: path.clone(),
            source,
        })?;

        let mut host = Self {
            path,
            writer: BufWriter::new(file),
            metrics: 0,
        };
        host.write_line(REPORTED_METRIC, "", reported)?;
        Ok(host)
    }

    fn write_line(&mut self, name: &str, units: &str, value: &str) -> Result<(), SnapshotError> {
        writeln!(self.writer, "{name},{units},{value}").map_err(|source| {
            SnapshotError::CacheWrite {
                path: self.path.clone(),
                source,
            }
        })
    }

    fn finish(mut self) -> Result<(), SnapshotError> {
        self.writer
            .flush()
            .map_err(|source| SnapshotError::CacheWrite {
                path: self.path.clone(),
                source,
            })?;

        debug!(path = %self.path.display(), metrics = self.metrics, "wrote host cache file");
        Ok(())
    }
}

/// Parse `xml` and rewrite the per-host files under `store`.
///
/// A document with zero grids is a valid, empty snapshot. The caller must
/// hold the cache write lock for the whole call.
pub fn materialize(xml: &[u8], store: &CacheStore, short_name: bool) -> Result<(), SnapshotError> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().check_end_names = true;

    let mut stack: Vec<Frame> = Vec::new();

    loop {
        let event = match reader.read_event() {
            Ok(event) => event,
            Err(e) => {
                return Err(SnapshotError::Malformed {
                    position: reader.buffer_position() as u64,
                    message: e.to_string(),
                })
            }
        };

        match event {
            Event::Start(e) => {
                let frame = enter(&e, stack.last_mut(), store, short_name)?;
                stack.push(frame);
            }
            Event::Empty(e) => {
                // Same classification as Start, but the element closes
                // immediately, so a matched host flushes right away.
                if let Frame::Host(host) = enter(&e, stack.last_mut(), store, short_name)? {
                    host.finish()?;
                }
            }
            Event::End(_) => {
                if let Some(Frame::Host(host)) = stack.pop() {
                    host.finish()?;
                }
            }
            Event::Eof => {
                if !stack.is_empty() {
                    return Err(SnapshotError::Malformed {
                        position: reader.buffer_position() as u64,
                        message: "unexpected end of document".to_string(),
                    });
                }
                break;
            }
            // Text, CDATA, comments, declarations, PIs, doctypes.
            _ => {}
        }
    }

    Ok(())
}

/// Classify an opening element against the expected walk level and perform
/// its side effects: directory creation, host file rewrite, metric lines.
fn enter(
    e: &BytesStart<'_>,
    parent: Option<&mut Frame>,
    store: &CacheStore,
    short_name: bool,
) -> Result<Frame, SnapshotError> {
    let name = e.name();
    let tag = name.as_ref();

    let frame = match parent {
        None => {
            if tag != ROOT_TAG {
                return Err(SnapshotError::UnexpectedRoot {
                    found: String::from_utf8_lossy(tag).into_owned(),
                });
            }
            Frame::Doc
        }

        Some(Frame::Doc) if tag == b"GRID" => {
            let grid = attr(e, b"NAME");
            trace!(grid = %grid, "found grid");

            let dir = store.grid_dir(&grid);
            cache::ensure_dir(&dir)?;
            Frame::Grid { dir }
        }

        Some(Frame::Grid { dir }) if tag == b"CLUSTER" => {
            let cluster = attr(e, b"NAME");
            trace!(cluster = %cluster, "found cluster");

            let dir = dir.join(cluster);
            cache::ensure_dir(&dir)?;
            Frame::Cluster { dir }
        }

        Some(Frame::Cluster { dir }) if tag == b"HOST" => {
            let host = attr(e, b"NAME");
            let reported = attr(e, b"REPORTED");
            trace!(host = %host, reported = %reported, "found host");

            let path = dir.join(cache::host_key(&host, short_name));
            Frame::Host(HostWriter::open(path, &reported)?)
        }

        Some(Frame::Host(host)) if tag == b"METRIC" => {
            let name = attr(e, b"NAME");
            let units = attr(e, b"UNITS");
            let value = attr(e, b"VAL");
            trace!(metric = %name, value = %value, "found metric");

            host.write_line(&name, &units, &value)?;
            host.metrics += 1;
            // METRIC children (EXTRA_DATA and friends) are ignored.
            Frame::Skip
        }

        // Unexpected tag at any level: skip the whole subtree.
        _ => Frame::Skip,
    };

    Ok(frame)
}

/// Look up one attribute by name, unescaped; missing or undecodable
/// attributes become empty strings.
fn attr(e: &BytesStart<'_>, name: &[u8]) -> String {
    for a in e.attributes().flatten() {
        if a.key.as_ref() == name {
            return match a.unescape_value() {
                Ok(v) => v.into_owned(),
                Err(_) => String::from_utf8_lossy(&a.value).into_owned(),
            };
        }
    }

    String::new()
}
