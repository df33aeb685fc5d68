//! Trimmed summary statistics over per-line measurements.
//!
//! The first and last sample of a series are ramp-up and ramp-down artefacts
//! of the measuring tool, so they are dropped before anything is computed.

use serde::Serialize;

use crate::error::StatsError;

/// Minimum number of samples: two are trimmed and one must remain.
pub const MIN_SAMPLES: usize = 3;

/// Max, min, mean and count over a series without its first and last sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TrimmedSummary {
    pub max: f64,
    pub min: f64,
    pub avg: f64,
    pub count: usize,
}

impl TrimmedSummary {
    /// Summarises `samples`, failing when fewer than three were recorded.
    pub fn from_samples(samples: &[f64]) -> Result<Self, StatsError> {
        if samples.len() < MIN_SAMPLES {
            return Err(StatsError::InsufficientSamples {
                found: samples.len(),
            });
        }

        let kept = &samples[1..samples.len() - 1];
        let (min, max, sum) = kept.iter().fold(
            (f64::INFINITY, f64::NEG_INFINITY, 0.0),
            |(min, max, sum), &value| (min.min(value), max.max(value), sum + value),
        );

        Ok(Self {
            max,
            min,
            avg: sum / kept.len() as f64,
            count: kept.len(),
        })
    }
}
