//! Command-line interface for rdmaprobe.
use std::{path::PathBuf, str::FromStr};

use clap::Parser;
use tracing::level_filters::LevelFilter;

use crate::{config::RunConfig, tools::perftest::Benchmark};

/// Wrapper around `LevelFilter` so clap can parse log levels from either
/// string names ("info", "debug", etc.) or numeric shorthands (0-5).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// String representation suitable for `RUST_LOG`.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("log level cannot be empty".into());
        }

        if let Ok(number) = trimmed.parse::<u8>() {
            let level = match number {
                0 => LevelFilter::OFF,
                1 => LevelFilter::ERROR,
                2 => LevelFilter::WARN,
                3 => LevelFilter::INFO,
                4 => LevelFilter::DEBUG,
                5 => LevelFilter::TRACE,
                _ => {
                    return Err(format!(
                        "unsupported log level number '{number}' (expected 0-5)"
                    ));
                }
            };
            return Ok(LogLevelArg(level));
        }

        let level = match trimmed.to_ascii_lowercase().as_str() {
            "off" => LevelFilter::OFF,
            "error" | "err" => LevelFilter::ERROR,
            "warn" | "warning" => LevelFilter::WARN,
            "info" => LevelFilter::INFO,
            "debug" => LevelFilter::DEBUG,
            "trace" => LevelFilter::TRACE,
            _ => return Err(format!("invalid log level '{trimmed}'")),
        };

        Ok(LogLevelArg(level))
    }
}

/// Measures RDMA bandwidth under background memory traffic, against system
/// memory and optionally against a memory-mapped device region.
#[derive(Parser, Debug)]
#[command(name = "rdmaprobe", version, author)]
#[command(about = "Measure RDMA bandwidth degradation under memory traffic", long_about = None)]
pub struct Cli {
    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<LogLevelArg>,

    /// YAML file with run parameters; flags override its values.
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Host running the benchmark server.
    #[arg(long)]
    pub host: Option<String>,

    /// Benchmark duration in seconds.
    #[arg(short = 'D', long, value_name = "SECS")]
    pub duration: Option<u64>,

    /// Message size in bytes.
    #[arg(short, long, value_name = "BYTES")]
    pub size: Option<u64>,

    /// CPU socket the background traffic is pinned to.
    #[arg(long)]
    pub socket: Option<u32>,

    /// RDMA device name (e.g. mlx5_0).
    #[arg(short, long)]
    pub device: Option<String>,

    /// Port used by the benchmark to exchange connection data.
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Device region to map as the transfer buffer for the second run.
    #[arg(long, value_name = "PATH")]
    pub mmap: Option<PathBuf>,

    /// perftest binary (ib_write_bw, ib_read_bw, ib_send_bw, ib_*_lat).
    #[arg(short, long)]
    pub benchmark: Option<Benchmark>,

    /// Size of each background copy in MiB.
    #[arg(long, value_name = "MIB")]
    pub traffic_size: Option<u64>,

    /// Run without background memory traffic.
    #[arg(long)]
    pub no_traffic: bool,

    /// Do not sample hardware counters around the traffic generator.
    #[arg(long)]
    pub no_counters: bool,

    /// Directory receiving one log file per process.
    #[arg(long, value_name = "DIR")]
    pub log_dir: Option<PathBuf>,

    /// Emit the report as JSON.
    #[arg(long)]
    pub json: bool,
}

impl Cli {
    /// Overrides the file configuration with the flags that were given.
    pub fn apply(&self, config: &mut RunConfig) {
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(duration) = self.duration {
            config.duration_secs = duration;
        }
        if let Some(size) = self.size {
            config.message_size = size;
        }
        if let Some(socket) = self.socket {
            config.socket = socket;
        }
        if let Some(device) = &self.device {
            config.device = Some(device.clone());
        }
        if let Some(port) = self.port {
            config.port = Some(port);
        }
        if let Some(mmap) = &self.mmap {
            config.mmap = Some(mmap.clone());
        }
        if let Some(benchmark) = self.benchmark {
            config.benchmark = benchmark;
        }
        if let Some(size) = self.traffic_size {
            config.traffic.size_mib = size;
        }
        if self.no_traffic {
            config.traffic.enabled = false;
        }
        if self.no_counters {
            config.traffic.counters = false;
        }
        if let Some(dir) = &self.log_dir {
            config.log_dir = Some(dir.clone());
        }
    }
}

/// Parses command-line arguments.
pub fn parse_args() -> Cli {
    Cli::parse()
}
