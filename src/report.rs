//! Probe results and their human-readable rendering.
use std::{collections::BTreeMap, fmt::Write as _};

use serde::Serialize;

use crate::{
    constants::{LIKWID_MEMORY_BANDWIDTH, LIKWID_MEMORY_VOLUME},
    probe::Target,
    tools::{
        likwid::CounterReading,
        mbw::TrafficSummary,
        perftest::{Benchmark, LatencyDistribution, PerftestResult},
    },
};

/// Metrics derived from the benchmark's result table.
///
/// `None` means the benchmark never reported the value, not that it measured
/// zero.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BenchmarkMetrics {
    pub bandwidth_mib_s: Option<f64>,
    pub peak_bandwidth_mib_s: Option<f64>,
    pub message_rate_mpps: Option<f64>,
    pub data_volume_gib: Option<f64>,
    pub latency_usec: Option<LatencyDistribution>,
    pub fields: BTreeMap<String, f64>,
    pub units: BTreeMap<String, String>,
}

impl BenchmarkMetrics {
    pub fn from_result(result: &PerftestResult) -> Self {
        Self {
            bandwidth_mib_s: result.bandwidth(),
            peak_bandwidth_mib_s: result.peak_bandwidth(),
            message_rate_mpps: result.message_rate(),
            data_volume_gib: result.data_volume(),
            latency_usec: result.latency(),
            fields: result.fields(),
            units: result.units(),
        }
    }
}

/// Everything measured for one target.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetRun {
    pub target: Target,
    pub benchmark: BenchmarkMetrics,
    pub traffic: Option<TrafficSummary>,
    pub counters: BTreeMap<String, CounterReading>,
}

/// Result of a complete probe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeReport {
    pub benchmark: Benchmark,
    pub message_size: u64,
    pub duration_secs: u64,
    pub baseline: TargetRun,
    pub mapped: Option<TargetRun>,
}

impl ProbeReport {
    /// Bandwidth lost on the mapped device relative to system memory, in
    /// percent. Negative values mean the device was faster.
    pub fn bandwidth_degradation(&self) -> Option<f64> {
        let baseline = self.baseline.benchmark.bandwidth_mib_s?;
        let mapped = self.mapped.as_ref()?.benchmark.bandwidth_mib_s?;
        if baseline == 0.0 {
            return None;
        }
        Some((1.0 - mapped / baseline) * 100.0)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{} with {} byte messages for {}s",
            self.benchmark.as_ref(),
            self.message_size,
            self.duration_secs
        );

        render_run(&mut out, &self.baseline);
        if let Some(mapped) = &self.mapped {
            render_run(&mut out, mapped);
        }

        if let Some(degradation) = self.bandwidth_degradation() {
            let _ = writeln!(out, "\nBandwidth degradation on mapped device: {degradation:.2}%");
        }
        out
    }
}

fn render_run(out: &mut String, run: &TargetRun) {
    let _ = writeln!(out, "\n== {} ==", run.target.name());
    if let Target::MappedDevice(path) = &run.target {
        let _ = writeln!(out, "  mapped region:      {}", path.display());
    }

    let metrics = &run.benchmark;
    let _ = writeln!(out, "  bandwidth:          {}", optional(metrics.bandwidth_mib_s, "MiB/s"));
    if metrics.peak_bandwidth_mib_s.is_some() {
        let _ = writeln!(
            out,
            "  peak bandwidth:     {}",
            optional(metrics.peak_bandwidth_mib_s, "MiB/s")
        );
    }
    if metrics.message_rate_mpps.is_some() {
        let _ = writeln!(out, "  message rate:       {}", optional(metrics.message_rate_mpps, "Mpps"));
    }
    let _ = writeln!(out, "  data volume:        {}", optional(metrics.data_volume_gib, "GiB"));

    if let Some(latency) = &metrics.latency_usec {
        let _ = writeln!(
            out,
            "  latency (usec):     min {:.2} / typical {:.2} / avg {:.2} / max {:.2}",
            latency.min, latency.typical, latency.avg, latency.max
        );
        if let (Some(p99), Some(p999)) = (latency.p99, latency.p999) {
            let _ = writeln!(out, "  latency tail:       p99 {p99:.2} / p99.9 {p999:.2}");
        }
    }

    match &run.traffic {
        Some(traffic) => {
            let _ = writeln!(
                out,
                "  traffic rate:       avg {:.2} / min {:.2} / max {:.2} MiB/s over {} samples",
                traffic.rate.avg, traffic.rate.min, traffic.rate.max, traffic.rate.count
            );
            let _ = writeln!(out, "  traffic volume:     {:.2} GiB", traffic.volume_gib);
        }
        None => {
            let _ = writeln!(out, "  traffic:            n/a");
        }
    }

    for (label, name) in [
        ("DRAM bandwidth:    ", LIKWID_MEMORY_BANDWIDTH),
        ("DRAM volume:       ", LIKWID_MEMORY_VOLUME),
    ] {
        if let Some(reading) = run.counters.get(name) {
            let _ = writeln!(out, "  {label} {}", reading_text(reading));
        }
    }

    let others: Vec<_> = run
        .counters
        .iter()
        .filter(|(name, _)| *name != LIKWID_MEMORY_BANDWIDTH && *name != LIKWID_MEMORY_VOLUME)
        .collect();
    if !others.is_empty() {
        let _ = writeln!(out, "  counters:");
        for (name, reading) in others {
            let _ = writeln!(out, "    {name}: {}", reading_text(reading));
        }
    }
}

fn reading_text(reading: &CounterReading) -> String {
    match &reading.unit {
        Some(unit) => format!("{} {unit}", reading.value),
        None => reading.value.to_string(),
    }
}

fn optional(value: Option<f64>, unit: &str) -> String {
    match value {
        Some(value) => format!("{value:.2} {unit}"),
        None => "n/a".to_string(),
    }
}
