use std::path::Path;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use gmprobe::cache::CacheStore;
use gmprobe::config::{Cli, Config, Query};
use gmprobe::metric::{self, LookupError};
use gmprobe::refresh;
use gmprobe::threshold::{self, Status};

/// Build-time version info.
mod version {
    /// Release version string.
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // All diagnostics go to stderr; stdout carries only the status line
    // Nagios parses.
    let filter = if cli.verbose { "gmprobe=debug" } else { "warn" };
    fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    tracing::debug!(version = version::RELEASE, "starting gmprobe");

    let cfg = match Config::from_cli(cli) {
        Ok(cfg) => cfg,
        Err(e) => {
            println!("ERROR - {e:#}");
            return ExitCode::from(2);
        }
    };

    match run(&cfg) {
        Ok((status, line)) => {
            println!("{line}");
            ExitCode::from(status.exit_code())
        }
        Err(e) => {
            println!("ERROR - {e:#}");
            ExitCode::from(2)
        }
    }
}

/// One probe pass: ensure the cache is fresh, read the queried value,
/// classify it. Infrastructure failures propagate as errors; check
/// outcomes (including missing hosts and metrics) are status lines.
fn run(cfg: &Config) -> Result<(Status, String)> {
    let store = CacheStore::new(&cfg.cache_path, &cfg.cache_name, cfg.max_age);

    refresh::refresh_if_stale(cfg, &store)?;

    let Some(host_file) = metric::locate_host_file(&store, &cfg.host, cfg.short_name) else {
        return Ok((
            Status::Critical,
            format!("CRITICAL - Unable to locate cache file for {}", cfg.host),
        ));
    };

    match &cfg.query {
        Query::Heartbeat(threshold) => match metric::heartbeat_age(&host_file) {
            Ok(age) if age > *threshold => Ok((
                Status::Critical,
                format!("CRITICAL - {age} over threshold {threshold}"),
            )),
            Ok(age) => Ok((Status::Ok, format!("OK - {age}"))),
            Err(e) => Ok(lookup_failure(&e, &host_file)),
        },

        Query::Metric(name) => match metric::read_metric(&host_file, name) {
            Ok(sample) => {
                let status = threshold::evaluate(&sample.value, &cfg.warning, &cfg.critical);
                let line = format!("{status} - {} {}", sample.value, sample.units);
                Ok((status, line))
            }
            Err(e) => Ok(lookup_failure(&e, &host_file)),
        },
    }
}

/// Map a lookup failure onto the plugin's critical status lines.
fn lookup_failure(e: &LookupError, host_file: &Path) -> (Status, String) {
    tracing::debug!(error = %e, "metric lookup failed");

    let line = match e {
        LookupError::NotFound { name } => format!("CRITICAL - Metric {name} not found"),
        LookupError::Read { .. } | LookupError::Malformed { .. } => {
            format!("CRITICAL - Unable to read cache at {}", host_file.display())
        }
    };

    (Status::Critical, line)
}
