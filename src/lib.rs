//! gmprobe: a Nagios-style probe for Ganglia metrics.
//!
//! One invocation checks one metric (or the heartbeat) of one host. The
//! gmetad XML snapshot is materialized into a per-host file cache shared by
//! every concurrent probe on the machine, so only one process per staleness
//! window pays for the network fetch and parse.

pub mod cache;
pub mod config;
pub mod fetch;
pub mod metric;
pub mod refresh;
pub mod snapshot;
pub mod threshold;
