//! RDMA transfer benchmarks from the perftest suite (`ib_write_bw`, ...).
//!
//! Results are printed as a header naming the columns followed by one data
//! row:
//!
//! ```text
//!  #bytes     #iterations    BW peak[MB/sec]    BW average[MB/sec]   MsgRate[Mpps]
//!  65536      10000          11023.45           11020.13             0.176322
//! ```
//!
//! Columns are separated by at least two spaces, or by a single space before
//! a `#`-prefixed name. A bracketed suffix is the column's unit.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{Arc, LazyLock, Mutex, MutexGuard},
};

use regex::Regex;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, EnumString};

use crate::{
    constants::{GIB, MB, MIB, PERFTEST_HEADER_MARKER},
    error::StageError,
    pipeline::LineStage,
    supervisor::CommandLine,
    tools::mbw::TrafficLog,
};

static COLUMN_SEPARATOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s{2,}").expect("separator pattern is valid"));

static UNIT_SUFFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.*?)\s*\[([^\]]*)\]$").expect("unit pattern is valid")
});

/// perftest binaries this crate knows how to drive.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, AsRefStr, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Benchmark {
    #[default]
    IbWriteBw,
    IbReadBw,
    IbSendBw,
    IbWriteLat,
    IbReadLat,
    IbSendLat,
}

impl Benchmark {
    pub fn is_latency(&self) -> bool {
        matches!(
            self,
            Benchmark::IbWriteLat | Benchmark::IbReadLat | Benchmark::IbSendLat
        )
    }

    /// Path of the binary, inside `dir` when given.
    pub fn program(&self, dir: Option<&Path>) -> String {
        match dir {
            Some(dir) => dir.join(self.as_ref()).display().to_string(),
            None => self.as_ref().to_string(),
        }
    }
}

/// Latency distribution reported by the `*_lat` benchmarks, in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencyDistribution {
    pub min: f64,
    pub max: f64,
    pub typical: f64,
    pub avg: f64,
    pub stdev: Option<f64>,
    pub p99: Option<f64>,
    pub p999: Option<f64>,
}

#[derive(Debug, Default)]
struct ResultState {
    fields: BTreeMap<String, f64>,
    units: BTreeMap<String, String>,
}

/// Shared view of the result table a [`PerftestStage`] parsed.
///
/// Derived metrics return `None` when a field they need was never reported.
#[derive(Debug, Clone, Default)]
pub struct PerftestResult {
    state: Arc<Mutex<ResultState>>,
}

impl PerftestResult {
    fn lock(&self) -> MutexGuard<'_, ResultState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn field(&self, name: &str) -> Option<f64> {
        self.lock().fields.get(name).copied()
    }

    pub fn unit(&self, name: &str) -> Option<String> {
        self.lock().units.get(name).cloned()
    }

    pub fn fields(&self) -> BTreeMap<String, f64> {
        self.lock().fields.clone()
    }

    pub fn units(&self) -> BTreeMap<String, String> {
        self.lock().units.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().fields.is_empty()
    }

    /// Average bandwidth in MiB/s. perftest reports decimal megabytes.
    pub fn bandwidth(&self) -> Option<f64> {
        self.field("BW average").map(|mb| mb * MB / MIB)
    }

    /// Peak bandwidth in MiB/s.
    pub fn peak_bandwidth(&self) -> Option<f64> {
        self.field("BW peak").map(|mb| mb * MB / MIB)
    }

    pub fn message_rate(&self) -> Option<f64> {
        self.field("MsgRate")
    }

    /// Bytes transferred over all iterations, in GiB.
    pub fn data_volume(&self) -> Option<f64> {
        Some(self.field("bytes")? * self.field("iterations")? / GIB)
    }

    pub fn latency(&self) -> Option<LatencyDistribution> {
        Some(LatencyDistribution {
            min: self.field("t_min")?,
            max: self.field("t_max")?,
            typical: self.field("t_typical")?,
            avg: self.field("t_avg")?,
            stdev: self.field("t_stdev"),
            p99: self.field("99% percentile"),
            p999: self.field("99.9% percentile"),
        })
    }

    fn set_units(&self, units: BTreeMap<String, String>) {
        self.lock().units.extend(units);
    }

    fn set_field(&self, name: &str, value: f64) {
        self.lock().fields.insert(name.to_string(), value);
    }
}

/// Parses a perftest result table into a [`PerftestResult`].
#[derive(Debug, Default)]
pub struct PerftestStage {
    result: PerftestResult,
    traffic: Option<TrafficLog>,
    columns: Vec<String>,
    awaiting_row: bool,
}

impl PerftestStage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears `traffic` when the header appears, so traffic statistics cover
    /// only the interval measured by the benchmark.
    pub fn clears(mut self, traffic: Option<TrafficLog>) -> Self {
        self.traffic = traffic;
        self
    }

    pub fn result(&self) -> PerftestResult {
        self.result.clone()
    }

    fn read_header(&mut self, header: &str) {
        let mut columns = Vec::new();
        let mut units = BTreeMap::new();

        for column in split_columns(header) {
            let column = column.trim_start_matches('#');
            match UNIT_SUFFIX.captures(column) {
                Some(caps) => {
                    units.insert(caps[1].to_string(), caps[2].to_string());
                    columns.push(caps[1].to_string());
                }
                None => columns.push(column.to_string()),
            }
        }

        self.result.set_units(units);
        self.columns = columns;
        self.awaiting_row = true;

        if let Some(traffic) = &self.traffic {
            traffic.clear();
        }
    }

    fn read_row(&mut self, row: &str) -> Result<(), StageError> {
        self.awaiting_row = false;
        let values: Vec<&str> = row.split_whitespace().collect();
        let mut first_error = None;

        for (column, raw) in self.columns.iter().zip(&values) {
            match raw.parse::<f64>() {
                Ok(value) => self.result.set_field(column, value),
                Err(_) => {
                    first_error.get_or_insert(StageError::InvalidNumber {
                        field: column.clone(),
                        value: raw.to_string(),
                    });
                }
            }
        }

        if let Some(err) = first_error {
            return Err(err);
        }
        if values.len() != self.columns.len() {
            return Err(StageError::ColumnMismatch {
                columns: self.columns.len(),
                values: values.len(),
            });
        }
        Ok(())
    }
}

impl LineStage for PerftestStage {
    fn observe(&mut self, line: &str) -> Result<(), StageError> {
        let trimmed = line.trim();
        if trimmed.starts_with(PERFTEST_HEADER_MARKER) {
            self.read_header(trimmed);
            return Ok(());
        }

        if self.awaiting_row && !trimmed.is_empty() {
            return self.read_row(trimmed);
        }

        Ok(())
    }
}

/// Splits a header line into raw column names.
fn split_columns(header: &str) -> Vec<String> {
    let mut columns = Vec::new();

    for chunk in COLUMN_SEPARATOR.split(header.trim()) {
        let mut current: Option<String> = None;
        for token in chunk.split_whitespace() {
            match current.as_mut() {
                Some(column) if !token.starts_with('#') => {
                    column.push(' ');
                    column.push_str(token);
                }
                _ => {
                    columns.extend(current.take());
                    current = Some(token.to_string());
                }
            }
        }
        columns.extend(current);
    }

    columns
}

/// Parameters shared by the server and client invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerftestInvocation {
    pub benchmark: Benchmark,
    pub binary_dir: Option<PathBuf>,
    pub device: Option<String>,
    pub port: Option<u16>,
    pub message_size: u64,
    pub duration_secs: u64,
    /// File mapped as the transfer buffer instead of system memory.
    pub mmap: Option<PathBuf>,
}

impl PerftestInvocation {
    pub fn server(&self) -> CommandLine {
        CommandLine::new(self.benchmark.program(self.binary_dir.as_deref()), self.args())
    }

    pub fn client(&self, host: &str) -> CommandLine {
        let mut args = self.args();
        args.push(host.to_string());
        CommandLine::new(self.benchmark.program(self.binary_dir.as_deref()), args)
    }

    fn args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(device) = &self.device {
            args.push("-d".to_string());
            args.push(device.clone());
        }
        if let Some(port) = self.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        args.push("-s".to_string());
        args.push(self.message_size.to_string());
        args.push("-D".to_string());
        args.push(self.duration_secs.to_string());
        args.push("-F".to_string());
        if let Some(mmap) = &self.mmap {
            args.push(format!("--mmap={}", mmap.display()));
        }
        args
    }
}
