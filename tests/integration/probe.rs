#[path = "common/mod.rs"]
mod common;

use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use common::wait_for_process_exit;
use rdmaprobe::{
    config::RunConfig,
    constants::STOP_TIMEOUT,
    error::ProbeError,
    probe::{Probe, Target},
};
use tempfile::{TempDir, tempdir};

const HEADER: &str =
    " #bytes     #iterations    BW peak[MB/sec]    BW average[MB/sec]   MsgRate[Mpps]";
const ROW: &str = " 65536      10000          11023.45           11020.13             0.176322";

/// Client that reports one result row. `$SEEN` is touched right before the
/// header so traffic samples can be told apart.
fn reporting_client() -> String {
    format!("sleep 0.3\ntouch \"$SEEN\"\necho '{HEADER}'\nsleep 0.5\necho '{ROW}'\nexit 0")
}

/// Shell scripts standing in for mbw and ib_write_bw. Every script appends
/// its pid to `pids`.
struct FakeTools {
    dir: TempDir,
}

impl FakeTools {
    fn new(client: &str) -> Self {
        let tools = Self {
            dir: tempdir().unwrap(),
        };

        // The copy rate jumps from 1 to 9000 once `$SEEN` exists.
        tools.install(
            "mbw",
            r#"i=0
while :; do
  if [ -e "$SEEN" ]; then rate=9000.0; else rate=1.0; fi
  printf '%d\tMethod: MEMCPY\tElapsed: 0.05000\tMiB: 1024.00000\tCopy: %s MiB/s\n' "$i" "$rate"
  i=$((i + 1))
  sleep 0.05
done"#,
        );

        // Only the client passes the host, as its last argument.
        tools.install(
            "ib_write_bw",
            &format!(
                r#"for last; do :; done
if [ "$last" = "localhost" ]; then
{client}
else
  echo '* Waiting for client to connect... *'
  exec sleep 60
fi"#
            ),
        );
        tools
    }

    fn install(&self, name: &str, body: &str) {
        let path = self.dir.path().join(name);
        let script = format!(
            "#!/bin/sh\nSEEN='{}'\necho $$ >> '{}'\n{body}\n",
            self.seen_path().display(),
            self.pids_path().display()
        );
        fs::write(&path, script).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn seen_path(&self) -> PathBuf {
        self.dir.path().join("header-seen")
    }

    fn pids_path(&self) -> PathBuf {
        self.dir.path().join("pids")
    }

    fn pids(&self) -> Vec<u32> {
        read_pids(&self.pids_path())
    }

    fn config(&self) -> RunConfig {
        let mut config = RunConfig {
            duration_secs: 1,
            ..RunConfig::default()
        };
        config.traffic.counters = false;
        config.tools.mbw = self.dir.path().join("mbw").display().to_string();
        config.tools.perftest_dir = Some(self.dir.path().to_path_buf());
        config
    }
}

fn read_pids(path: &Path) -> Vec<u32> {
    fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect()
}

fn not_interrupted() -> Arc<AtomicBool> {
    Arc::new(AtomicBool::new(false))
}

#[test]
fn full_run_measures_both_targets() {
    let tools = FakeTools::new(&reporting_client());
    let mut config = tools.config();
    config.mmap = Some(PathBuf::from("/dev/dax0.0"));

    let report = Probe::new(config, not_interrupted()).run().unwrap();

    assert_eq!(report.baseline.target, Target::SystemMemory);
    let bandwidth = report.baseline.benchmark.bandwidth_mib_s.unwrap();
    assert!((bandwidth - 11020.13 * 1_000_000.0 / (1024.0 * 1024.0)).abs() < 1e-6);
    let traffic = report.baseline.traffic.expect("baseline traffic summary");
    assert!(traffic.rate.count >= 1);

    let mapped = report.mapped.expect("mapped device measured");
    assert_eq!(mapped.target, Target::MappedDevice(PathBuf::from("/dev/dax0.0")));
    assert!(mapped.benchmark.bandwidth_mib_s.is_some());
    assert!(mapped.traffic.is_some_and(|traffic| traffic.rate.count >= 1));

    let pids = tools.pids();
    assert_eq!(pids.len(), 6, "three processes per target");
    for pid in pids {
        wait_for_process_exit(pid);
    }
}

#[test]
fn benchmark_header_discards_earlier_traffic_rates() {
    let tools = FakeTools::new(&reporting_client());

    let report = Probe::new(tools.config(), not_interrupted()).run().unwrap();
    let traffic = report.baseline.traffic.expect("traffic summary");

    assert_eq!(traffic.rate.min, 9000.0);
    assert_eq!(traffic.rate.max, 9000.0);

    // Each iteration copies 1 GiB, read plus written. Discarded samples still
    // count towards the volume.
    let iterations = (traffic.volume_gib / 2.0).round() as usize;
    assert!(iterations > traffic.rate.count + 2);
}

#[test]
fn client_without_result_table_fails_the_run() {
    let tools = FakeTools::new("echo 'connection established'\nexit 0");
    let mut config = tools.config();
    config.traffic.enabled = false;

    let err = Probe::new(config, not_interrupted()).run().unwrap_err();

    match err {
        ProbeError::MissingResult { command } => assert!(command.contains("ib_write_bw")),
        other => panic!("unexpected error: {other:?}"),
    }
    for pid in tools.pids() {
        wait_for_process_exit(pid);
    }
}

#[test]
fn interrupt_while_client_runs_tears_down_every_process() {
    let tools = FakeTools::new(&format!("echo '{HEADER}'\nexec sleep 60"));
    let interrupted = not_interrupted();

    let flag = Arc::clone(&interrupted);
    let pids_path = tools.pids_path();
    let trigger = thread::spawn(move || {
        let deadline = Instant::now() + Duration::from_secs(10);
        while read_pids(&pids_path).len() < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(50));
        }
        thread::sleep(Duration::from_millis(200));
        flag.store(true, Ordering::SeqCst);
    });

    let began = Instant::now();
    let err = Probe::new(tools.config(), interrupted).run().unwrap_err();
    trigger.join().unwrap();

    assert!(matches!(err, ProbeError::Interrupted));
    assert!(began.elapsed() < Duration::from_secs(10) + STOP_TIMEOUT * 3);

    let pids = tools.pids();
    assert_eq!(pids.len(), 3, "traffic, server and client were started");
    for pid in pids {
        wait_for_process_exit(pid);
    }
}
