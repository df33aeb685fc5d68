#[path = "common/mod.rs"]
mod common;

use std::{fs, time::Instant};

use common::{Recorder, is_process_alive, shell, supervisor, wait_for_pid_file, wait_for_process_exit};
use rdmaprobe::{
    constants::{READY_TIMEOUT, START_TIMEOUT, STOP_TIMEOUT},
    error::SupervisorError,
    supervisor::{CommandLine, ReadinessMarker, Supervisor, SupervisorOptions},
};
use tempfile::tempdir;

#[test]
fn missing_executable_fails_to_spawn() {
    let mut sup = Supervisor::new(
        CommandLine::new("/nonexistent/rdmaprobe-missing-tool", ["--flag"]),
        SupervisorOptions::new("missing"),
        Recorder::default(),
    );

    let err = sup.start().unwrap_err();
    assert!(
        matches!(&err, SupervisorError::Spawn { program, .. } if program.contains("rdmaprobe-missing-tool"))
    );
    assert!(sup.pid().is_none());
    assert!(sup.is_started());
}

#[test]
fn stop_interrupts_long_running_process() {
    let mut sup = supervisor("sleeper", "echo ready; exec sleep 60");
    sup.start().unwrap();
    let pid = sup.pid().expect("running child has a pid");
    assert!(is_process_alive(pid));

    let began = Instant::now();
    let report = sup.stop().unwrap();

    assert!(report.killed_by_supervisor);
    assert_eq!(report.code, None);
    assert!(report.signal.is_some());
    assert!(began.elapsed() < START_TIMEOUT * 3);
    assert_eq!(sup.output(), vec!["ready".to_string()]);
    wait_for_process_exit(pid);
}

#[test]
fn stop_sweeps_background_children() {
    let temp = tempdir().unwrap();
    let pid_file = temp.path().join("child.pid");
    let script = format!(
        "sleep 60 & echo $! > {}; echo started; wait",
        pid_file.display()
    );

    let mut sup = supervisor("spawner", &script);
    sup.start().unwrap();
    let grandchild = wait_for_pid_file(&pid_file);
    assert!(is_process_alive(grandchild));

    let report = sup.stop().unwrap();
    assert!(report.killed_by_supervisor);
    wait_for_process_exit(grandchild);
}

#[test]
fn non_zero_exit_carries_captured_output() {
    let mut sup = Supervisor::new(
        shell("echo failing now; echo details >&2; exit 3"),
        SupervisorOptions::new("failing").kill_on_stop(false),
        Recorder::default(),
    );
    sup.start().unwrap();

    let err = sup.stop().unwrap_err();
    match &err {
        SupervisorError::Process {
            exit_code, output, ..
        } => {
            assert_eq!(*exit_code, Some(3));
            assert!(output.contains("failing now"));
            assert!(output.contains("details"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(err.captured_output(), Some("failing now\ndetails"));
    assert_eq!(sup.exit_code(), Some(3));
}

#[test]
fn stdout_and_stderr_arrive_in_write_order() {
    let recorder = Recorder::default();
    let mut sup = Supervisor::new(
        shell("echo first; echo second >&2; echo third"),
        SupervisorOptions::new("merged"),
        recorder.clone(),
    );
    sup.start().unwrap();
    let report = sup.wait().unwrap();

    assert_eq!(report.code, Some(0));
    assert!(!report.killed_by_supervisor);
    assert_eq!(recorder.lines(), vec!["first", "second", "third"]);
    assert_eq!(sup.output(), recorder.lines());
}

#[test]
fn readiness_marker_unblocks_dependents() {
    let mut sup = Supervisor::new(
        shell("echo booting; echo '* Waiting for client to connect... *'; exec sleep 60"),
        SupervisorOptions::new("server")
            .readiness(ReadinessMarker::Substring("Waiting for client to connect".into())),
        Recorder::default(),
    );
    sup.start().unwrap();
    sup.wait_ready().unwrap();

    assert!(sup.is_started());
    assert!(sup.is_ready());
    sup.stop().unwrap();
}

#[test]
fn readiness_pattern_is_matched_per_line() {
    let mut sup = Supervisor::new(
        shell("echo 'listening on 18515'; exec sleep 60"),
        SupervisorOptions::new("server").readiness(ReadinessMarker::Pattern(
            regex::Regex::new(r"listening on \d+").unwrap(),
        )),
        Recorder::default(),
    );
    sup.start().unwrap();
    sup.wait_ready().unwrap();
    sup.stop().unwrap();
}

#[test]
fn missing_readiness_marker_times_out_with_output() {
    let mut sup = Supervisor::new(
        shell("echo booting; exec sleep 60"),
        SupervisorOptions::new("server").readiness(ReadinessMarker::Substring("never printed".into())),
        Recorder::default(),
    );
    sup.start().unwrap();

    let began = Instant::now();
    let err = sup.wait_ready().unwrap_err();
    assert!(began.elapsed() >= READY_TIMEOUT);
    match &err {
        SupervisorError::ReadinessTimeout { label, output, .. } => {
            assert_eq!(label, "server");
            assert!(output.contains("booting"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!sup.is_ready());

    sup.terminate().unwrap();
}

#[test]
fn failing_stage_does_not_stop_the_reader() {
    let recorder = Recorder::failing_on("bad");
    let mut sup = Supervisor::new(
        shell("printf 'one\\nbad\\nthree\\n'"),
        SupervisorOptions::new("parser"),
        recorder.clone(),
    );
    sup.start().unwrap();
    sup.wait().unwrap();

    assert_eq!(recorder.lines(), vec!["one", "bad", "three"]);
}

#[test]
fn log_file_holds_every_line_verbatim() {
    let temp = tempdir().unwrap();
    let log = temp.path().join("logs").join("traffic.log");

    let mut sup = Supervisor::new(
        shell("echo 'AvgTime: 0.1  Copy: 1000.0 MiB/s'; echo '  indented  '; echo"),
        SupervisorOptions::new("traffic").log_path(Some(log.clone())),
        Recorder::default(),
    );
    sup.start().unwrap();
    sup.wait().unwrap();

    let contents = fs::read_to_string(&log).unwrap();
    let lines: Vec<String> = contents.lines().map(str::to_string).collect();
    assert_eq!(lines, sup.output());
    assert_eq!(lines[1], "  indented  ");
    assert_eq!(lines[2], "");
}

#[test]
fn silent_process_reports_startup_timeout() {
    let mut sup = supervisor("silent", "exec sleep 30");

    let began = Instant::now();
    sup.start().unwrap();
    assert!(began.elapsed() >= START_TIMEOUT);
    assert!(!sup.is_started());
    let pid = sup.pid().unwrap();

    let err = sup.wait().unwrap_err();
    assert!(matches!(err, SupervisorError::StartupTimeout { .. }));
    wait_for_process_exit(pid);
}

#[test]
fn silent_exit_does_not_stall_start() {
    let mut sup = supervisor("quiet", "exit 0");

    let began = Instant::now();
    sup.start().unwrap();
    assert!(began.elapsed() < START_TIMEOUT);
    assert!(sup.is_started());

    let report = sup.wait().unwrap();
    assert_eq!(report.code, Some(0));
    assert!(sup.output().is_empty());
}

#[test]
fn dropping_a_running_supervisor_kills_it() {
    let pid = {
        let mut sup = supervisor("dropped", "echo up; exec sleep 60");
        sup.start().unwrap();
        sup.pid().unwrap()
    };
    wait_for_process_exit(pid);
}

#[test]
fn supervisor_starts_only_once() {
    let mut sup = supervisor("once", "echo hi");
    sup.start().unwrap();
    sup.wait().unwrap();
    assert!(matches!(
        sup.start(),
        Err(SupervisorError::AlreadyStarted { .. })
    ));
}

#[test]
fn panicking_stage_keeps_output_capture_alive() {
    let recorder = Recorder::panicking_on("boom");
    let mut sup = Supervisor::new(
        shell("printf 'one\\nboom\\nthree\\n'"),
        SupervisorOptions::new("parser"),
        recorder.clone(),
    );
    sup.start().unwrap();

    let began = Instant::now();
    let report = sup.wait().unwrap();

    assert_eq!(report.code, Some(0));
    assert!(began.elapsed() < STOP_TIMEOUT);
    assert_eq!(recorder.lines(), vec!["one", "boom", "three"]);
    assert_eq!(sup.output(), vec!["one", "boom", "three"]);
}

#[test]
fn sweep_keeps_exit_status_of_interrupted_leader() {
    let temp = tempdir().unwrap();
    let pid_file = temp.path().join("child.pid");
    let script = format!(
        "sleep 60 & echo $! > {}; trap 'exit 0' INT; echo started; while :; do sleep 0.1; done",
        pid_file.display()
    );

    let mut sup = supervisor("trapping", &script);
    sup.start().unwrap();
    let grandchild = wait_for_pid_file(&pid_file);
    assert!(!sup.has_exited());

    let report = sup.stop().unwrap();
    assert!(report.killed_by_supervisor);
    assert_eq!(report.code, Some(0));
    wait_for_process_exit(grandchild);
}
