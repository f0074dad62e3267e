//! Runtime configuration.
//!
//! Built once from the command line and passed read-only into every
//! component. Option spellings stay compatible with the classic
//! check_ganglia_metric plugin so existing Nagios command definitions
//! keep working.

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;

/// Default staleness threshold in seconds.
pub const DEFAULT_MAX_AGE: u64 = 120;

/// Default gmetad interactive port.
pub const DEFAULT_GMETAD_PORT: u16 = 8651;

/// Command-line options.
#[derive(Parser, Debug)]
#[command(
    name = "gmprobe",
    version,
    about = "Check a Ganglia metric through a shared gmetad snapshot cache"
)]
pub struct Cli {
    /// Host whose metric to check.
    #[arg(short = 'a', long = "metric_host")]
    pub metric_host: String,

    /// Metric to read from the host's cache file.
    #[arg(short = 'm', long = "metric_name")]
    pub metric_name: Option<String>,

    /// Alert when the host has not reported for this many seconds.
    #[arg(short = 'b', long = "heartbeat")]
    pub heartbeat: Option<u64>,

    /// Warning range expression (Nagios syntax).
    #[arg(short = 'w', long = "warning", default_value = "")]
    pub warning: String,

    /// Critical range expression (Nagios syntax).
    #[arg(short = 'c', long = "critical", default_value = "")]
    pub critical: String,

    /// Cache root directory shared by every probe on this machine.
    #[arg(short = 'f', long = "cache_path", default_value = "/tmp")]
    pub cache_path: PathBuf,

    /// Sentinel file name under the cache root.
    #[arg(short = 'n', long = "cache_name", default_value = ".gm-cache")]
    pub cache_name: String,

    /// gmetad host to fetch snapshots from.
    #[arg(short = 'd', long = "gmetad_host", default_value = "localhost")]
    pub gmetad_host: String,

    /// gmetad interactive port.
    #[arg(short = 'p', long = "gmetad_port", default_value_t = DEFAULT_GMETAD_PORT)]
    pub gmetad_port: u16,

    /// Seconds before the cached snapshot counts as stale.
    #[arg(short = 't', long = "max_age", default_value_t = DEFAULT_MAX_AGE)]
    pub max_age: u64,

    /// Key host cache files by the name truncated at the first dot.
    #[arg(short = 's', long = "short_name")]
    pub short_name: bool,

    /// Log debug detail to stderr.
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// Write the raw fetched XML to <cache_path>/dump.xml.
    #[arg(long = "dump")]
    pub dump: bool,
}

/// What the probe is asked to check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    /// Compare a named metric's value against the warning/critical ranges.
    Metric(String),
    /// Compare the host's last-report age against a threshold in seconds.
    Heartbeat(u64),
}

/// Immutable runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub query: Query,
    pub gmetad_host: String,
    pub gmetad_port: u16,
    pub cache_path: PathBuf,
    pub cache_name: String,
    pub max_age: u64,
    pub warning: String,
    pub critical: String,
    pub short_name: bool,
    pub dump: bool,
}

impl Config {
    /// Validate the parsed command line and build the configuration.
    pub fn from_cli(cli: Cli) -> Result<Self> {
        let query = match (cli.metric_name, cli.heartbeat) {
            (Some(metric), None) => Query::Metric(metric),
            (None, Some(0)) => bail!("heartbeat threshold must be positive"),
            (None, Some(heartbeat)) => Query::Heartbeat(heartbeat),
            (None, None) => bail!("must supply a metric name or a heartbeat threshold"),
            (Some(_), Some(_)) => {
                bail!("metric name and heartbeat threshold are mutually exclusive")
            }
        };

        Ok(Self {
            host: cli.metric_host,
            query,
            gmetad_host: cli.gmetad_host,
            gmetad_port: cli.gmetad_port,
            cache_path: cli.cache_path,
            cache_name: cli.cache_name,
            max_age: cli.max_age,
            warning: cli.warning,
            critical: cli.critical,
            short_name: cli.short_name,
            dump: cli.dump,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Config> {
        let mut argv = vec!["gmprobe"];
        argv.extend_from_slice(args);
        let cli = Cli::try_parse_from(argv)?;
        Config::from_cli(cli)
    }

    #[test]
    fn test_metric_query_with_defaults() {
        let cfg = parse(&["-a", "web01", "-m", "load_one"]).expect("config");

        assert_eq!(cfg.host, "web01");
        assert_eq!(cfg.query, Query::Metric("load_one".to_string()));
        assert_eq!(cfg.gmetad_host, "localhost");
        assert_eq!(cfg.gmetad_port, DEFAULT_GMETAD_PORT);
        assert_eq!(cfg.cache_path, PathBuf::from("/tmp"));
        assert_eq!(cfg.cache_name, ".gm-cache");
        assert_eq!(cfg.max_age, DEFAULT_MAX_AGE);
        assert!(cfg.warning.is_empty());
        assert!(cfg.critical.is_empty());
        assert!(!cfg.short_name);
        assert!(!cfg.dump);
    }

    #[test]
    fn test_heartbeat_query() {
        let cfg = parse(&["-a", "web01", "-b", "300"]).expect("config");
        assert_eq!(cfg.query, Query::Heartbeat(300));
    }

    #[test]
    fn test_long_option_spellings() {
        let cfg = parse(&[
            "--metric_host",
            "web01.example.com",
            "--metric_name",
            "load_one",
            "--warning",
            "3:8",
            "--critical",
            "10",
            "--cache_path",
            "/var/cache/ganglia",
            "--gmetad_host",
            "mon1",
            "--gmetad_port",
            "8652",
            "--max_age",
            "60",
            "--short_name",
        ])
        .expect("config");

        assert_eq!(cfg.host, "web01.example.com");
        assert_eq!(cfg.warning, "3:8");
        assert_eq!(cfg.critical, "10");
        assert_eq!(cfg.cache_path, PathBuf::from("/var/cache/ganglia"));
        assert_eq!(cfg.gmetad_host, "mon1");
        assert_eq!(cfg.gmetad_port, 8652);
        assert_eq!(cfg.max_age, 60);
        assert!(cfg.short_name);
    }

    #[test]
    fn test_host_is_required() {
        assert!(parse(&["-m", "load_one"]).is_err());
    }

    #[test]
    fn test_exactly_one_query_required() {
        let err = parse(&["-a", "web01"]).expect_err("no query");
        assert!(err.to_string().contains("metric name or a heartbeat"));

        let err =
            parse(&["-a", "web01", "-m", "load_one", "-b", "300"]).expect_err("both queries");
        assert!(err.to_string().contains("mutually exclusive"));
    }

    #[test]
    fn test_zero_heartbeat_rejected() {
        let err = parse(&["-a", "web01", "-b", "0"]).expect_err("zero heartbeat");
        assert!(err.to_string().contains("positive"));
    }
}
