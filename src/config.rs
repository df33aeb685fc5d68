//! Run configuration for rdmaprobe.
use regex::Regex;
use serde::Deserialize;
use std::{
    env, fs,
    path::{Path, PathBuf},
};

use crate::{error::ConfigError, tools::mbw::CopyMethod, tools::perftest::Benchmark};

/// Parameters of one probe run: a baseline against system memory and,
/// when `mmap` is set, a second run against the mapped device region.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    /// Host running the benchmark server, passed to the client.
    pub host: String,
    /// Benchmark duration in seconds.
    pub duration_secs: u64,
    /// Message size in bytes.
    pub message_size: u64,
    /// CPU socket the background traffic is pinned to.
    pub socket: u32,
    /// RDMA device name (e.g. `mlx5_0`).
    pub device: Option<String>,
    /// TCP port used by perftest to exchange connection data.
    pub port: Option<u16>,
    /// Device region to map as the transfer buffer.
    pub mmap: Option<PathBuf>,
    /// perftest binary to run.
    pub benchmark: Benchmark,
    /// Directory receiving one log file per process and run.
    pub log_dir: Option<PathBuf>,
    /// Text the benchmark server prints once it listens.
    pub readiness_marker: Option<String>,
    /// Background traffic settings.
    pub traffic: TrafficConfig,
    /// Locations of the external tools.
    pub tools: ToolPaths,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            duration_secs: 10,
            message_size: 65536,
            socket: 0,
            device: None,
            port: None,
            mmap: None,
            benchmark: Benchmark::default(),
            log_dir: None,
            readiness_marker: None,
            traffic: TrafficConfig::default(),
            tools: ToolPaths::default(),
        }
    }
}

/// Background memory traffic generated while the benchmark runs.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct TrafficConfig {
    /// Run the traffic generator at all.
    pub enabled: bool,
    /// Copy method used by mbw.
    pub method: CopyMethod,
    /// Size of each copy in MiB.
    pub size_mib: u64,
    /// Number of copy iterations; `0` copies until interrupted.
    pub runs: u32,
    /// Sample hardware counters around the traffic generator.
    pub counters: bool,
    /// likwid performance group to sample.
    pub counter_group: String,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            method: CopyMethod::default(),
            size_mib: 1024,
            runs: 0,
            counters: true,
            counter_group: "MEM".to_string(),
        }
    }
}

/// Programs invoked by the probe.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ToolPaths {
    pub mbw: String,
    pub likwid: String,
    /// Directory holding the perftest binaries; `PATH` is searched otherwise.
    pub perftest_dir: Option<PathBuf>,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            mbw: "mbw".to_string(),
            likwid: "likwid-perfctr".to_string(),
            perftest_dir: None,
        }
    }
}

impl RunConfig {
    /// Rejects values no run can succeed with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid("host must not be empty".into()));
        }
        if self.duration_secs == 0 {
            return Err(ConfigError::Invalid("duration must be at least 1 second".into()));
        }
        if self.message_size == 0 {
            return Err(ConfigError::Invalid("message size must be positive".into()));
        }
        if self.traffic.enabled && self.traffic.size_mib == 0 {
            return Err(ConfigError::Invalid("traffic size must be positive".into()));
        }
        if matches!(&self.readiness_marker, Some(marker) if marker.trim().is_empty()) {
            return Err(ConfigError::Invalid("readiness marker must not be empty".into()));
        }
        Ok(())
    }

    /// CPU list handed to likwid for the traffic generator.
    pub fn traffic_cpus(&self) -> String {
        format!("S{}:0", self.socket)
    }
}

/// Expands `$VAR` and `${VAR}` references within a string.
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?")
        .map_err(|err| ConfigError::Invalid(err.to_string()))?;

    let mut missing = None;
    let result = re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        match env::var(var_name) {
            Ok(value) => value,
            Err(_) => {
                missing.get_or_insert_with(|| var_name.to_string());
                String::new()
            }
        }
    });

    match missing {
        Some(var_name) => Err(ConfigError::Invalid(format!(
            "missing environment variable: {var_name}"
        ))),
        None => Ok(result.into_owned()),
    }
}

/// Loads the configuration file, expanding environment variables. Without a
/// path the defaults are returned.
pub fn load_config(config_path: Option<&Path>) -> Result<RunConfig, ConfigError> {
    let Some(config_path) = config_path else {
        return Ok(RunConfig::default());
    };

    let content = fs::read_to_string(config_path).map_err(|e| {
        ConfigError::Read(std::io::Error::new(
            e.kind(),
            format!("{} ({})", e, config_path.display()),
        ))
    })?;

    let expanded = expand_env_vars(&content)?;
    if expanded.trim().is_empty() {
        return Ok(RunConfig::default());
    }

    Ok(serde_yaml::from_str(&expanded)?)
}
