#![allow(dead_code)]

use std::{
    fs,
    path::Path,
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use rdmaprobe::{
    error::StageError,
    pipeline::LineStage,
    supervisor::{CommandLine, Supervisor, SupervisorOptions},
};
use sysinfo::{Pid, ProcessesToUpdate, System};

/// `sh -c <script>` as a command line.
pub fn shell(script: &str) -> CommandLine {
    CommandLine::new("sh", ["-c", script])
}

pub fn supervisor(label: &str, script: &str) -> Supervisor {
    Supervisor::new(shell(script), SupervisorOptions::new(label), Recorder::default())
}

/// Stage that keeps every line it observes and optionally fails on some.
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    lines: Arc<Mutex<Vec<String>>>,
    fail_on: Option<String>,
    panic_on: Option<String>,
}

impl Recorder {
    pub fn failing_on(text: &str) -> Self {
        Self {
            fail_on: Some(text.to_string()),
            ..Self::default()
        }
    }

    pub fn panicking_on(text: &str) -> Self {
        Self {
            panic_on: Some(text.to_string()),
            ..Self::default()
        }
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl LineStage for Recorder {
    fn observe(&mut self, line: &str) -> Result<(), StageError> {
        self.lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(line.to_string());
        if let Some(text) = &self.panic_on
            && line.contains(text.as_str())
        {
            panic!("cannot interpret {line:?}");
        }
        match &self.fail_on {
            Some(text) if line.contains(text.as_str()) => Err(StageError::InvalidNumber {
                field: "recorder".into(),
                value: line.to_string(),
            }),
            _ => Ok(()),
        }
    }
}

/// Appends `entry` to a shared journal; used to observe start/stop order.
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn stage(&self, label: &str) -> JournalStage {
        JournalStage {
            label: label.to_string(),
            journal: self.clone(),
        }
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

#[derive(Debug)]
pub struct JournalStage {
    label: String,
    journal: Journal,
}

impl LineStage for JournalStage {
    fn observe(&mut self, line: &str) -> Result<(), StageError> {
        self.journal
            .0
            .lock()
            .unwrap()
            .push(format!("{}: {line}", self.label));
        Ok(())
    }
}

pub fn is_process_alive(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        // Reaped-but-unrefreshed entries and zombies both count as gone.
        let stat_path = format!("/proc/{pid}/stat");
        if let Ok(stat) = fs::read_to_string(&stat_path)
            && let Some(state_start) = stat.rfind(')')
            && let Some(state) = stat[state_start + 1..].trim().chars().next()
            && (state == 'Z' || state == 'X')
        {
            return false;
        }
    }

    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    system.process(Pid::from_u32(pid)).is_some()
}

pub fn wait_for_process_exit(pid: u32) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if !is_process_alive(pid) {
            return;
        }
        thread::sleep(Duration::from_millis(100));
    }
    panic!("Timed out waiting for PID {pid} to exit");
}

pub fn wait_for_pid_file(path: &Path) -> u32 {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(contents) = fs::read_to_string(path)
            && let Ok(pid) = contents.trim().parse::<u32>()
        {
            return pid;
        }

        if Instant::now() >= deadline {
            panic!("Timed out waiting for a PID in {:?}", path);
        }

        thread::sleep(Duration::from_millis(50));
    }
}
