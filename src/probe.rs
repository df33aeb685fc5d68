//! Orchestration of one probe: a benchmark run against system memory and,
//! optionally, one against a memory-mapped device region, each with
//! background memory traffic.

use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use serde::Serialize;
use tracing::{info, warn};

use crate::{
    constants::{CLIENT_GRACE, EXIT_POLL_INTERVAL, PERFTEST_READY_MARKER},
    config::RunConfig,
    error::ProbeError,
    logs::resolve_log_path,
    pipeline::{EchoStage, LineStage},
    report::{BenchmarkMetrics, ProbeReport, TargetRun},
    scope::Scope,
    supervisor::{ReadinessMarker, Supervisor, SupervisorOptions},
    tools::{
        likwid::{self, CounterStage, CounterTable},
        mbw::{self, TrafficLog, TrafficStage},
        perftest::{PerftestInvocation, PerftestResult, PerftestStage},
    },
};

/// Memory backing the benchmark's transfer buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "path")]
pub enum Target {
    SystemMemory,
    MappedDevice(PathBuf),
}

impl Target {
    /// Short name used for log files and report headings.
    pub fn name(&self) -> &'static str {
        match self {
            Target::SystemMemory => "system-memory",
            Target::MappedDevice(_) => "mapped-device",
        }
    }

    fn mmap(&self) -> Option<PathBuf> {
        match self {
            Target::SystemMemory => None,
            Target::MappedDevice(path) => Some(path.clone()),
        }
    }
}

/// Runs the configured benchmark against every target.
pub struct Probe {
    config: RunConfig,
    interrupted: Arc<AtomicBool>,
}

impl Probe {
    pub fn new(config: RunConfig, interrupted: Arc<AtomicBool>) -> Self {
        Self {
            config,
            interrupted,
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Targets in run order: system memory first, then the mapped device.
    pub fn targets(&self) -> Vec<Target> {
        let mut targets = vec![Target::SystemMemory];
        if let Some(path) = &self.config.mmap {
            targets.push(Target::MappedDevice(path.clone()));
        }
        targets
    }

    pub fn run(&self) -> Result<ProbeReport, ProbeError> {
        self.config.validate()?;

        let baseline = self.measure(&Target::SystemMemory)?;
        let mapped = match &self.config.mmap {
            Some(path) => Some(self.measure(&Target::MappedDevice(path.clone()))?),
            None => None,
        };

        Ok(ProbeReport {
            benchmark: self.config.benchmark,
            message_size: self.config.message_size,
            duration_secs: self.config.duration_secs,
            baseline,
            mapped,
        })
    }

    fn measure(&self, target: &Target) -> Result<TargetRun, ProbeError> {
        self.check_interrupted()?;
        info!(
            "Measuring {} against {}",
            self.config.benchmark.as_ref(),
            target.name()
        );
        self.run_target(target)
    }

    /// Runs traffic generator, server and client for one target.
    pub fn run_target(&self, target: &Target) -> Result<TargetRun, ProbeError> {
        let config = &self.config;
        let mut scope = Scope::new();

        let (traffic, counters) = match self.traffic_supervisor(target) {
            Some((supervisor, traffic, counters)) => {
                scope.enter(supervisor)?;
                (Some(traffic), counters)
            }
            None => (None, None),
        };
        self.check_interrupted()?;

        let invocation = PerftestInvocation {
            benchmark: config.benchmark,
            binary_dir: config.tools.perftest_dir.clone(),
            device: config.device.clone(),
            port: config.port,
            message_size: config.message_size,
            duration_secs: config.duration_secs,
            mmap: target.mmap(),
        };

        let marker = config
            .readiness_marker
            .clone()
            .unwrap_or_else(|| PERFTEST_READY_MARKER.to_string());
        let server = Supervisor::new(
            invocation.server(),
            SupervisorOptions::new("server")
                .readiness(ReadinessMarker::Substring(marker))
                .log_path(self.log_path(target, "server")),
            EchoStage::new("server"),
        );
        scope.enter(server)?;
        self.check_interrupted()?;

        let stage = PerftestStage::new().clears(traffic.clone());
        let result = stage.result();
        let client = Supervisor::new(
            invocation.client(&config.host),
            SupervisorOptions::new("client")
                .kill_on_stop(false)
                .log_path(self.log_path(target, "client")),
            stage.then(EchoStage::new("client")),
        );
        let client_index = scope.enter(client)?;

        self.wait_for_client(&mut scope, client_index)?;
        let stopped = scope.close()?;

        let client_command = stopped
            .get(client_index)
            .map(|client| client.command().to_string())
            .unwrap_or_default();
        self.collect(target, &result, traffic.as_ref(), counters.as_ref(), client_command)
    }

    /// Builds the traffic generator, wrapped by likwid when counters are on.
    fn traffic_supervisor(
        &self,
        target: &Target,
    ) -> Option<(Supervisor, TrafficLog, Option<CounterTable>)> {
        let config = &self.config;
        if !config.traffic.enabled {
            return None;
        }

        let traffic_stage = TrafficStage::new();
        let traffic = traffic_stage.log();
        let mut command = mbw::command(
            &config.tools.mbw,
            config.traffic.method,
            config.traffic.runs,
            config.traffic.size_mib,
        );

        let mut counters = None;
        let stage: Box<dyn LineStage> = if config.traffic.counters {
            let counter_stage = CounterStage::new();
            counters = Some(counter_stage.table());
            command = command.wrapped_by(likwid::command(
                &config.tools.likwid,
                &config.traffic_cpus(),
                &config.traffic.counter_group,
            ));
            Box::new(counter_stage.then(traffic_stage))
        } else {
            Box::new(traffic_stage)
        };

        let supervisor = Supervisor::new(
            command,
            SupervisorOptions::new("traffic").log_path(self.log_path(target, "traffic")),
            stage,
        );
        Some((supervisor, traffic, counters))
    }

    /// Polls the client until it exits, the user interrupts, or the run
    /// overshoots its duration by `CLIENT_GRACE`.
    fn wait_for_client(&self, scope: &mut Scope, index: usize) -> Result<(), ProbeError> {
        let deadline =
            Instant::now() + Duration::from_secs(self.config.duration_secs) + CLIENT_GRACE;

        let Some(client) = scope.get_mut(index) else {
            return Ok(());
        };

        loop {
            self.check_interrupted()?;
            if client.has_exited() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!(
                    "'{}' still running {:?} past its duration; terminating",
                    client.label(),
                    CLIENT_GRACE
                );
                client.terminate()?;
                return Ok(());
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        }
    }

    fn collect(
        &self,
        target: &Target,
        result: &PerftestResult,
        traffic: Option<&TrafficLog>,
        counters: Option<&CounterTable>,
        client_command: String,
    ) -> Result<TargetRun, ProbeError> {
        if result.is_empty() {
            return Err(ProbeError::MissingResult {
                command: client_command,
            });
        }

        let traffic = traffic.and_then(|log| match log.summary() {
            Ok(summary) => Some(summary),
            Err(err) => {
                warn!("Traffic statistics for {} unavailable: {err}", target.name());
                None
            }
        });

        Ok(TargetRun {
            target: target.clone(),
            benchmark: BenchmarkMetrics::from_result(result),
            traffic,
            counters: counters.map(CounterTable::snapshot).unwrap_or_else(BTreeMap::new),
        })
    }

    fn log_path(&self, target: &Target, role: &str) -> Option<PathBuf> {
        resolve_log_path(self.config.log_dir.as_deref(), target.name(), role)
    }

    fn check_interrupted(&self) -> Result<(), ProbeError> {
        if self.interrupted.load(Ordering::SeqCst) {
            return Err(ProbeError::Interrupted);
        }
        Ok(())
    }
}
