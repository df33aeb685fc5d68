//! Background memory traffic generated by `mbw`.
//!
//! Every completed copy iteration is reported on one line:
//!
//! ```text
//! 0	Method: MEMCPY	Elapsed: 0.05735	MiB: 512.00000	Copy: 8927.061 MiB/s
//! ```

use std::{
    str::FromStr,
    sync::{Arc, LazyLock, Mutex, MutexGuard},
};

use regex::Regex;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, EnumString};

use crate::{
    constants::{GIB, MIB},
    error::{StageError, StatsError},
    pipeline::LineStage,
    stats::TrimmedSummary,
    supervisor::CommandLine,
};

static ITERATION_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(\d+)\s+Method:\s+(\S+)\s+Elapsed:\s+([0-9.]+)\s+MiB:\s+([0-9.]+)\s+Copy:\s+([0-9.]+)\s+MiB/s",
    )
    .expect("iteration pattern is valid")
});

/// Copy strategy used by mbw.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, AsRefStr, Serialize, Deserialize,
)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum CopyMethod {
    #[default]
    Memcpy,
    Dumb,
    Mcblock,
}

impl CopyMethod {
    /// Value of mbw's `-t` flag.
    pub fn test_number(&self) -> u8 {
        match self {
            CopyMethod::Memcpy => 0,
            CopyMethod::Dumb => 1,
            CopyMethod::Mcblock => 2,
        }
    }
}

/// One copy iteration reported by mbw.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrafficSample {
    pub iteration: u64,
    pub method: CopyMethod,
    pub elapsed_secs: f64,
    pub mib: f64,
    pub rate_mib_s: f64,
}

/// Statistics over the traffic generated while the benchmark ran.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TrafficSummary {
    /// Copy rate in MiB/s.
    pub rate: TrimmedSummary,
    /// Bytes read plus bytes written, in GiB.
    pub volume_gib: f64,
}

#[derive(Debug, Default)]
struct TrafficState {
    samples: Vec<TrafficSample>,
    total_mib: f64,
}

/// Shared view of everything a [`TrafficStage`] recorded.
#[derive(Debug, Clone, Default)]
pub struct TrafficLog {
    state: Arc<Mutex<TrafficState>>,
}

impl TrafficLog {
    fn lock(&self) -> MutexGuard<'_, TrafficState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record(&self, sample: TrafficSample) {
        let mut state = self.lock();
        state.total_mib += sample.mib;
        state.samples.push(sample);
    }

    /// Discards the rate samples recorded so far. The volume keeps running.
    pub fn clear(&self) {
        self.lock().samples.clear();
    }

    pub fn samples(&self) -> Vec<TrafficSample> {
        self.lock().samples.clone()
    }

    pub fn rates(&self) -> Vec<f64> {
        self.lock().samples.iter().map(|s| s.rate_mib_s).collect()
    }

    /// Total MiB copied since the stage was created.
    pub fn total_mib(&self) -> f64 {
        self.lock().total_mib
    }

    /// Copies read and write every byte, so the volume is twice the copy size.
    pub fn volume_gib(&self) -> f64 {
        2.0 * self.total_mib() * MIB / GIB
    }

    pub fn summary(&self) -> Result<TrafficSummary, StatsError> {
        Ok(TrafficSummary {
            rate: TrimmedSummary::from_samples(&self.rates())?,
            volume_gib: self.volume_gib(),
        })
    }
}

/// Parses mbw iteration lines into a [`TrafficLog`].
#[derive(Debug, Default)]
pub struct TrafficStage {
    log: TrafficLog,
}

impl TrafficStage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self) -> TrafficLog {
        self.log.clone()
    }
}

impl LineStage for TrafficStage {
    fn observe(&mut self, line: &str) -> Result<(), StageError> {
        let Some(caps) = ITERATION_LINE.captures(line) else {
            return Ok(());
        };

        let method = CopyMethod::from_str(&caps[2])
            .map_err(|_| StageError::UnknownMethod(caps[2].to_string()))?;

        self.log.record(TrafficSample {
            iteration: parse_field("iteration", &caps[1])?,
            method,
            elapsed_secs: parse_field("Elapsed", &caps[3])?,
            mib: parse_field("MiB", &caps[4])?,
            rate_mib_s: parse_field("Copy", &caps[5])?,
        });
        Ok(())
    }
}

fn parse_field<T: FromStr>(field: &str, value: &str) -> Result<T, StageError> {
    value.parse().map_err(|_| StageError::InvalidNumber {
        field: field.to_string(),
        value: value.to_string(),
    })
}

/// Builds an mbw invocation copying `size_mib` per iteration.
///
/// `runs == 0` keeps mbw copying until it is interrupted.
pub fn command(program: &str, method: CopyMethod, runs: u32, size_mib: u64) -> CommandLine {
    CommandLine::new(
        program,
        [
            "-q".to_string(),
            "-n".to_string(),
            runs.to_string(),
            "-t".to_string(),
            method.test_number().to_string(),
            size_mib.to_string(),
        ],
    )
}
