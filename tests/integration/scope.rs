#[path = "common/mod.rs"]
mod common;

use std::{fs, time::Instant};

use common::{Journal, Recorder, shell, wait_for_process_exit};
use rdmaprobe::{
    constants::READY_TIMEOUT,
    error::SupervisorError,
    scope::Scope,
    supervisor::{ReadinessMarker, Supervisor, SupervisorOptions},
};
use tempfile::tempdir;

#[test]
fn supervisors_start_in_declaration_order() {
    let journal = Journal::default();
    let mut scope = Scope::new();

    for label in ["traffic", "server", "client"] {
        let sup = Supervisor::new(
            shell(&format!("echo {label} up; exec sleep 60")),
            SupervisorOptions::new(label),
            journal.stage(label),
        );
        scope.enter(sup).unwrap();
    }

    assert_eq!(
        journal.entries(),
        vec!["traffic: traffic up", "server: server up", "client: client up"]
    );
    assert_eq!(scope.len(), 3);
    assert_eq!(scope.get(1).map(Supervisor::label), Some("server"));

    let stopped = scope.close().unwrap();
    let labels: Vec<_> = stopped.iter().map(Supervisor::label).collect();
    assert_eq!(labels, vec!["traffic", "server", "client"]);
    assert!(stopped.iter().all(|sup| sup.exit_report().is_some()));
}

#[test]
fn close_stops_in_reverse_order() {
    let temp = tempdir().unwrap();
    let trail = temp.path().join("trail");
    let mut scope = Scope::new();

    for label in ["first", "second", "third"] {
        let script = format!(
            "trap 'echo {label} >> {trail}; exit 0' INT; echo {label} up; while :; do sleep 0.1; done",
            trail = trail.display()
        );
        scope
            .enter(Supervisor::new(
                shell(&script),
                SupervisorOptions::new(label),
                Recorder::default(),
            ))
            .unwrap();
    }

    scope.close().unwrap();

    let order: Vec<String> = fs::read_to_string(&trail)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect();
    assert_eq!(order, vec!["third", "second", "first"]);
}

#[test]
fn readiness_failure_tears_down_earlier_entries() {
    let mut scope = Scope::new();
    scope
        .enter(Supervisor::new(
            shell("echo traffic up; exec sleep 60"),
            SupervisorOptions::new("traffic"),
            Recorder::default(),
        ))
        .unwrap();
    let traffic_pid = scope.get(0).and_then(Supervisor::pid).unwrap();

    let began = Instant::now();
    let err = scope
        .enter(Supervisor::new(
            shell("echo server booting; exec sleep 60"),
            SupervisorOptions::new("server")
                .readiness(ReadinessMarker::Substring("Waiting for client".into())),
            Recorder::default(),
        ))
        .unwrap_err();
    assert!(began.elapsed() >= READY_TIMEOUT);
    assert!(matches!(err, SupervisorError::ReadinessTimeout { .. }));

    let server_pid = scope.get(1).and_then(Supervisor::pid).unwrap();
    drop(scope);

    wait_for_process_exit(server_pid);
    wait_for_process_exit(traffic_pid);
}

#[test]
fn dropped_scope_terminates_processes_that_do_not_stop_themselves() {
    let mut scope = Scope::new();
    scope
        .enter(Supervisor::new(
            shell("echo client up; exec sleep 60"),
            SupervisorOptions::new("client").kill_on_stop(false),
            Recorder::default(),
        ))
        .unwrap();
    let pid = scope.get(0).and_then(Supervisor::pid).unwrap();

    drop(scope);
    wait_for_process_exit(pid);
}

#[test]
fn close_reports_first_failure_but_stops_everything() {
    let mut scope = Scope::new();
    scope
        .enter(Supervisor::new(
            shell("echo traffic up; exec sleep 60"),
            SupervisorOptions::new("traffic"),
            Recorder::default(),
        ))
        .unwrap();
    let traffic_pid = scope.get(0).and_then(Supervisor::pid).unwrap();
    scope
        .enter(Supervisor::new(
            shell("echo client broke; exit 4"),
            SupervisorOptions::new("client").kill_on_stop(false),
            Recorder::default(),
        ))
        .unwrap();

    let err = scope.close().unwrap_err();
    assert!(matches!(
        err,
        SupervisorError::Process {
            exit_code: Some(4),
            ..
        }
    ));
    wait_for_process_exit(traffic_pid);
}
