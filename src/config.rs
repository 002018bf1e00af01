//! Configuration value types consumed (never produced or parsed) by this
//! crate. Loading these from an XML/TOML/YAML file, command-line parsing,
//! and lockfile/daemonization concerns are all external collaborators; see
//! the crate's non-goals.

use std::path::PathBuf;
use std::time::Duration;

/// PakBus addressing header carried on every outbound packet and matched
/// on every inbound one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PBAddr {
    pub src_node: u16,
    pub dst_node: u16,
    pub src_phys: u16,
    pub dst_phys: u16,
    pub hop_count: u8,
}

/// Per-table collection options: how much of the table's span to keep
/// requesting and the logger's own sample interval, both informational to
/// the collection loop (the authoritative cursor is `Table::next_record_number`).
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TableOpt {
    pub name: String,
    pub table_span_s: u32,
    pub sample_interval_s: u32,
}

/// Output-side configuration: where to write, and how to label, each
/// table's output file.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DataOutputConfig {
    pub working_path: PathBuf,
    pub station_name: String,
    pub logger_type: String,
    pub tables: Vec<TableOpt>,
}

/// The data-source transport kind. The transport itself (the actual serial
/// line or TCP socket) is an external collaborator; this only records
/// which the embedder chose, for anything downstream that needs to know
/// (e.g. whether retry-on-fail applies).
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DataSourceKind {
    Serial { device: String, baud: u32 },
    Tcp { host: String, port: u16 },
}

/// Top-level configuration consumed by the collection loop.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Config {
    pub pakbus_addr: PBAddr,
    pub data_source: DataSourceKind,
    pub retry_on_fail: bool,
    pub output: DataOutputConfig,
    /// Separator placed between fields in the output file, default `", "`.
    pub field_separator: String,
    /// Per-packet read timeout; default derived as a few seconds.
    #[cfg_attr(feature = "serde", serde(with = "duration_secs"))]
    pub packet_timeout: Duration,
    /// Security code presented on FileReceive of the `.TDF`.
    pub tdf_security_code: u16,
    /// Maximum number of session attempts per collection cycle before the
    /// outer loop gives up for that cycle.
    pub max_session_attempts: u32,
}

impl Config {
    /// Smallest of the configured per-table sample intervals, used by the
    /// collection loop to size the between-cycle sleep.
    pub fn smallest_table_interval(&self) -> Duration {
        self.output
            .tables
            .iter()
            .map(|t| t.sample_interval_s)
            .min()
            .map(|secs| Duration::from_secs(secs as u64))
            .unwrap_or(Duration::from_secs(60))
    }
}

#[cfg(feature = "serde")]
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        d.as_secs().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
