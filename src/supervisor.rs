//! Supervision of one external process whose output is consumed line by line.
//!
//! The child is attached to a fresh pseudo-terminal so tools that buffer
//! output when writing to a pipe behave as if run interactively. Stdout and
//! stderr share the terminal and therefore arrive merged, in the order the
//! child wrote them. The child runs in its own process group so interrupting
//! it never touches the caller.

use std::{
    any::Any,
    fmt,
    fs::File,
    io::{self, BufRead, BufReader},
    panic::{self, AssertUnwindSafe},
    os::{
        fd::{AsRawFd, OwnedFd},
        unix::process::{CommandExt, ExitStatusExt},
    },
    path::PathBuf,
    process::{Child, Command, ExitStatus, Stdio},
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use nix::{
    errno::Errno,
    pty::openpty,
    sys::signal::{self, Signal},
    unistd::Pid,
};
#[cfg(target_os = "linux")]
use nix::sys::wait::{Id, WaitPidFlag, WaitStatus, waitid};
use regex::Regex;
use tracing::{debug, error, warn};

use crate::{
    constants::{
        EXIT_POLL_INTERVAL, FINAL_JOIN_TIMEOUT, READY_TIMEOUT, START_TIMEOUT,
        STOP_TIMEOUT,
    },
    error::SupervisorError,
    logs::LogSink,
    pipeline::LineStage,
    signal::Latch,
};

/// Executable and arguments of a supervised process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandLine {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Prepends a wrapper command, e.g. a profiler that execs this command.
    pub fn wrapped_by(self, wrapper: CommandLine) -> Self {
        let mut args = wrapper.args;
        args.push(self.program);
        args.extend(self.args);
        Self {
            program: wrapper.program,
            args,
        }
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.chars().any(char::is_whitespace) {
                write!(f, " '{arg}'")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// Line that marks a process as ready for dependents.
#[derive(Debug, Clone)]
pub enum ReadinessMarker {
    /// Ready once a line contains this text.
    Substring(String),
    /// Ready once a line matches this pattern.
    Pattern(Regex),
}

impl ReadinessMarker {
    pub fn matches(&self, line: &str) -> bool {
        match self {
            ReadinessMarker::Substring(text) => line.contains(text.as_str()),
            ReadinessMarker::Pattern(pattern) => pattern.is_match(line),
        }
    }
}

impl fmt::Display for ReadinessMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadinessMarker::Substring(text) => write!(f, "\"{text}\""),
            ReadinessMarker::Pattern(pattern) => write!(f, "/{}/", pattern.as_str()),
        }
    }
}

/// Construction-time configuration of a supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Short name used in logs and diagnostics.
    pub label: String,
    /// Interrupt the process group on `stop()` instead of waiting for exit.
    pub kill_on_stop: bool,
    /// Marker that flips the ready signal.
    pub readiness: Option<ReadinessMarker>,
    /// File receiving every captured line.
    pub log_path: Option<PathBuf>,
}

impl SupervisorOptions {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            kill_on_stop: true,
            readiness: None,
            log_path: None,
        }
    }

    pub fn kill_on_stop(mut self, kill_on_stop: bool) -> Self {
        self.kill_on_stop = kill_on_stop;
        self
    }

    pub fn readiness(mut self, marker: ReadinessMarker) -> Self {
        self.readiness = Some(marker);
        self
    }

    pub fn log_path(mut self, path: Option<PathBuf>) -> Self {
        self.log_path = path;
        self
    }
}

/// How a supervised process ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitReport {
    /// Exit code if the process exited normally.
    pub code: Option<i32>,
    /// Signal number if the process was terminated by a signal.
    pub signal: Option<i32>,
    /// Whether the supervisor signalled the process group.
    pub killed_by_supervisor: bool,
}

impl ExitReport {
    fn from_status(status: ExitStatus, killed_by_supervisor: bool) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
            killed_by_supervisor,
        }
    }

    fn describe(&self) -> String {
        match (self.code, self.signal) {
            (Some(code), _) => format!("exited with status {code}"),
            (None, Some(signal)) => format!("was terminated by signal {signal}"),
            (None, None) => "exited with an unknown status".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Running,
    Stopped,
}

/// State shared between a supervisor and its reader thread.
#[derive(Debug, Default)]
struct Shared {
    output: Mutex<Vec<String>>,
    started: Latch,
    ready: Latch,
    finished: Latch,
    failure: Mutex<Option<io::Error>>,
}

impl Shared {
    fn output(&self) -> Vec<String> {
        self.output
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn output_text(&self) -> String {
        self.output().join("\n")
    }

    fn take_failure(&self) -> Option<io::Error> {
        self.failure
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

/// Owns one external process, its pseudo-terminal and its reader thread.
///
/// A supervisor runs at most once: `start`, then `wait`/`stop`/`terminate`.
/// Dropping a supervisor whose process is still alive kills the whole
/// process group.
pub struct Supervisor {
    command: CommandLine,
    options: SupervisorOptions,
    stage: Option<Box<dyn LineStage>>,
    shared: Arc<Shared>,
    lifecycle: Lifecycle,
    child: Option<Child>,
    reader: Option<thread::JoinHandle<()>>,
    startup_timed_out: bool,
    exit: Option<ExitReport>,
}

impl Supervisor {
    pub fn new(
        command: CommandLine,
        options: SupervisorOptions,
        stage: impl LineStage + 'static,
    ) -> Self {
        Self {
            command,
            options,
            stage: Some(Box::new(stage)),
            shared: Arc::new(Shared::default()),
            lifecycle: Lifecycle::Created,
            child: None,
            reader: None,
            startup_timed_out: false,
            exit: None,
        }
    }

    pub fn label(&self) -> &str {
        &self.options.label
    }

    pub fn command(&self) -> &CommandLine {
        &self.command
    }

    pub fn options(&self) -> &SupervisorOptions {
        &self.options
    }

    /// PID of the running child, which is also its process group id.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    /// Every line captured so far.
    pub fn output(&self) -> Vec<String> {
        self.shared.output()
    }

    /// Captured output joined with newlines.
    pub fn output_text(&self) -> String {
        self.shared.output_text()
    }

    pub fn is_started(&self) -> bool {
        self.shared.started.is_set()
    }

    pub fn is_ready(&self) -> bool {
        self.shared.ready.is_set()
    }

    /// Exit code once the process has been reaped.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit.and_then(|exit| exit.code)
    }

    pub fn exit_report(&self) -> Option<ExitReport> {
        self.exit
    }

    /// Non-blocking check whether the child has exited. The child is left
    /// for `wait`/`stop` to reap.
    pub fn has_exited(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => !matches!(exited_unreaped(child), Ok(false)),
            None => self.lifecycle == Lifecycle::Stopped,
        }
    }

    /// Spawns the child and blocks until it prints its first line.
    ///
    /// Returns early after `START_TIMEOUT` without output; the timeout is then
    /// reported by the following `wait`/`stop`.
    pub fn start(&mut self) -> Result<(), SupervisorError> {
        if self.lifecycle != Lifecycle::Created {
            return Err(SupervisorError::AlreadyStarted {
                label: self.options.label.clone(),
            });
        }
        self.lifecycle = Lifecycle::Stopped;

        let sink = match &self.options.log_path {
            Some(path) => Some(LogSink::create(path).map_err(|source| {
                SupervisorError::LogSink {
                    command: self.command.to_string(),
                    path: path.display().to_string(),
                    source,
                }
            })?),
            None => None,
        };

        let pty = openpty(None, None).map_err(|errno| SupervisorError::Pty {
            command: self.command.to_string(),
            source: io::Error::from(errno),
        })?;
        let (stdout, stderr) = self.terminal_outputs(&pty.master, &pty.slave)?;

        debug!("Starting '{}': `{}`", self.options.label, self.command);

        let mut cmd = Command::new(&self.command.program);
        cmd.args(&self.command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));

        unsafe {
            cmd.pre_exec(|| {
                // Own process group so the interrupt only reaches this tool.
                if libc::setpgid(0, 0) < 0 {
                    return Err(io::Error::last_os_error());
                }

                #[cfg(target_os = "linux")]
                {
                    use libc::{PR_SET_PDEATHSIG, SIGTERM, prctl};
                    if prctl(PR_SET_PDEATHSIG, SIGTERM, 0, 0, 0) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                }

                Ok(())
            });
        }

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                error!("Failed to start '{}': {source}", self.options.label);
                self.shared.started.set();
                self.shared.finished.set();
                return Err(SupervisorError::Spawn {
                    program: self.command.program.clone(),
                    source,
                });
            }
        };

        // The child holds its own copies of the slave; once they are all
        // closed the master reports end-of-stream.
        drop(cmd);
        drop(pty.slave);

        debug!(
            "'{}' running with PID {} (process group {})",
            self.options.label,
            child.id(),
            child.id()
        );
        self.child = Some(child);
        self.lifecycle = Lifecycle::Running;

        let reader = LineReader {
            label: self.options.label.clone(),
            readiness: self.options.readiness.clone(),
            stage: self.stage.take().unwrap_or_else(|| Box::new(crate::pipeline::End)),
            sink,
            shared: self.shared.clone(),
        };
        let master = File::from(pty.master);
        self.reader = Some(thread::spawn(move || reader.run(master)));

        if !self.shared.started.wait_timeout(START_TIMEOUT) {
            warn!(
                "'{}' produced no output within {:?}",
                self.options.label, START_TIMEOUT
            );
            self.startup_timed_out = true;
            return Ok(());
        }

        if let Some(source) = self.shared.take_failure() {
            self.kill_and_reap();
            return Err(SupervisorError::Reader {
                command: self.command.to_string(),
                source,
            });
        }

        Ok(())
    }

    /// Blocks until the readiness marker has been printed.
    ///
    /// Supervisors without a marker are ready as soon as they started.
    pub fn wait_ready(&self) -> Result<(), SupervisorError> {
        let Some(marker) = &self.options.readiness else {
            return Ok(());
        };

        if self.shared.ready.wait_timeout(READY_TIMEOUT) {
            debug!("'{}' is ready", self.options.label);
            return Ok(());
        }

        Err(SupervisorError::ReadinessTimeout {
            label: self.options.label.clone(),
            marker: marker.to_string(),
            command: self.command.to_string(),
            output: self.shared.output_text(),
        })
    }

    /// Waits for the process to exit by itself.
    pub fn wait(&mut self) -> Result<ExitReport, SupervisorError> {
        self.finish(false)
    }

    /// Stops the process, interrupting it first when `kill_on_stop` is set.
    pub fn stop(&mut self) -> Result<ExitReport, SupervisorError> {
        self.finish(self.options.kill_on_stop)
    }

    /// Stops the process, interrupting it regardless of `kill_on_stop`.
    pub fn terminate(&mut self) -> Result<ExitReport, SupervisorError> {
        self.finish(true)
    }

    fn finish(&mut self, interrupt: bool) -> Result<ExitReport, SupervisorError> {
        if self.child.is_none() {
            return Ok(self.exit.unwrap_or_default());
        }

        let interrupt = interrupt || self.startup_timed_out;
        let (status, killed) = self.reap(interrupt)?;
        self.child = None;
        self.lifecycle = Lifecycle::Stopped;
        self.join_reader(STOP_TIMEOUT);

        let report = ExitReport::from_status(status, killed);
        self.exit = Some(report);
        debug!("'{}' {}", self.options.label, report.describe());

        if self.startup_timed_out {
            return Err(SupervisorError::StartupTimeout {
                command: self.command.to_string(),
                output: self.shared.output_text(),
            });
        }

        if !status.success() && !killed {
            return Err(SupervisorError::Process {
                command: self.command.to_string(),
                message: report.describe(),
                exit_code: report.code,
                output: self.shared.output_text(),
            });
        }

        Ok(report)
    }

    /// Waits for the child, interrupting its group first when asked to.
    /// Returns the exit status and whether the supervisor signalled it.
    fn reap(&mut self, interrupt: bool) -> Result<(ExitStatus, bool), SupervisorError> {
        let command = self.command.to_string();
        let label = self.options.label.clone();
        let Some(child) = self.child.as_mut() else {
            return Err(SupervisorError::Wait {
                command,
                source: io::Error::other("process was never spawned"),
            });
        };
        let pid = child.id();
        let wait_err = |source| SupervisorError::Wait {
            command: command.clone(),
            source,
        };

        if !interrupt {
            return Ok((child.wait().map_err(wait_err)?, false));
        }

        if let Some(status) = child.try_wait().map_err(wait_err)? {
            return Ok((status, false));
        }

        debug!("Interrupting process group {pid} of '{label}'");
        signal_group(pid, Signal::SIGINT).map_err(|source| SupervisorError::Signal {
            command: command.clone(),
            source,
        })?;

        if !wait_for_exit(child, STOP_TIMEOUT).map_err(wait_err)? {
            warn!("'{label}' did not exit after SIGINT; sending SIGKILL");
        }

        // Escalates a leader that ignored SIGINT and sweeps background jobs
        // of a shell, which ignore SIGINT and keep the terminal open. On
        // Linux the leader is not reaped yet, so the group id cannot have
        // been reused.
        signal_group(pid, Signal::SIGKILL).map_err(|source| SupervisorError::Signal {
            command: command.clone(),
            source,
        })?;
        Ok((child.wait().map_err(wait_err)?, true))
    }

    fn join_reader(&mut self, timeout: Duration) {
        let Some(handle) = self.reader.take() else {
            return;
        };

        if !self.shared.finished.wait_timeout(timeout) {
            warn!(
                "Output reader of '{}' did not finish within {:?}",
                self.options.label, timeout
            );
            return;
        }

        if handle.join().is_err() {
            error!("Output reader of '{}' panicked", self.options.label);
        }
    }

    fn kill_and_reap(&mut self) {
        if let Some(mut child) = self.child.take() {
            // A reaped leader's pid may already belong to someone else; an
            // unreaped one still holds the group id.
            let reserved = match exited_unreaped(&mut child) {
                Ok(false) => true,
                Ok(true) => cfg!(target_os = "linux"),
                Err(_) => false,
            };
            if reserved {
                let _ = signal_group(child.id(), Signal::SIGKILL);
            }
            let _ = child.wait();
        }
        self.lifecycle = Lifecycle::Stopped;
    }

    /// Marks the pty fds close-on-exec and clones the slave for stdout and stderr.
    fn terminal_outputs(
        &self,
        master: &OwnedFd,
        slave: &OwnedFd,
    ) -> Result<(OwnedFd, OwnedFd), SupervisorError> {
        let pty_err = |source| SupervisorError::Pty {
            command: self.command.to_string(),
            source,
        };

        // Without this, processes spawned concurrently by other supervisors
        // inherit the slave and keep this stream open after the child exits.
        for fd in [master.as_raw_fd(), slave.as_raw_fd()] {
            if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } < 0 {
                return Err(pty_err(io::Error::last_os_error()));
            }
        }

        let stdout = slave.try_clone().map_err(pty_err)?;
        let stderr = slave.try_clone().map_err(pty_err)?;
        Ok((stdout, stderr))
    }
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("label", &self.options.label)
            .field("command", &self.command.to_string())
            .field("lifecycle", &self.lifecycle)
            .field("pid", &self.pid())
            .field("exit", &self.exit)
            .finish()
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if self.child.is_some() {
            warn!(
                "'{}' dropped while running; killing its process group",
                self.options.label
            );
            self.kill_and_reap();
        }
        self.join_reader(FINAL_JOIN_TIMEOUT);
    }
}

/// Reads the master side of the terminal and dispatches every line.
struct LineReader {
    label: String,
    readiness: Option<ReadinessMarker>,
    stage: Box<dyn LineStage>,
    sink: Option<LogSink>,
    shared: Arc<Shared>,
}

impl LineReader {
    fn run(mut self, master: File) {
        let mut reader = BufReader::new(master);
        let mut buf = Vec::new();

        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => self.dispatch(&buf),
                Err(err) => {
                    if !buf.is_empty() {
                        self.dispatch(&buf);
                    }
                    // The master reports EIO once every slave fd is closed.
                    if err.raw_os_error() != Some(libc::EIO) {
                        self.fail(err);
                    }
                    break;
                }
            }
        }

        debug!("Output of '{}' reached end-of-stream", self.label);
        self.shared.started.set();
        self.shared.finished.set();
    }

    fn dispatch(&mut self, raw: &[u8]) {
        let text = String::from_utf8_lossy(raw);
        let line = text.trim_end_matches(['\n', '\r']);

        self.shared
            .output
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(line.to_string());

        if let Some(sink) = self.sink.as_mut()
            && let Err(err) = sink.write_line(line)
        {
            warn!(
                "Failed to write to {}: {err}; disabling log for '{}'",
                sink.path().display(),
                self.label
            );
            self.sink = None;
        }

        self.shared.started.set();

        let stage = &mut self.stage;
        match panic::catch_unwind(AssertUnwindSafe(|| stage.observe(line))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!("Failed to parse output of '{}': {err}: {line:?}", self.label);
            }
            Err(payload) => {
                warn!(
                    "Parser of '{}' panicked on {line:?}: {}",
                    self.label,
                    panic_message(payload.as_ref())
                );
            }
        }

        if let Some(marker) = &self.readiness
            && marker.matches(line)
        {
            self.shared.ready.set();
        }
    }

    fn fail(&self, err: io::Error) {
        if self.shared.started.is_set() {
            warn!("Reading output of '{}' failed: {err}", self.label);
            return;
        }

        *self
            .shared
            .failure
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(err);
    }
}

/// Sends `signal` to the process group led by `pid`. A group that is
/// already gone is not an error.
fn signal_group(pid: u32, signal: Signal) -> Result<(), Errno> {
    match signal::killpg(Pid::from_raw(pid as i32), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(err) => Err(err),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

/// Waits up to `timeout` for the child to exit. Returns `false` on timeout.
fn wait_for_exit(child: &mut Child, timeout: Duration) -> io::Result<bool> {
    let deadline = Instant::now() + timeout;

    loop {
        if exited_unreaped(child)? {
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        thread::sleep(EXIT_POLL_INTERVAL);
    }
}

/// Whether the child has exited, leaving it a zombie so that its pid and
/// process group id stay reserved until `Child::wait`.
#[cfg(target_os = "linux")]
fn exited_unreaped(child: &mut Child) -> io::Result<bool> {
    let flags = WaitPidFlag::WEXITED | WaitPidFlag::WNOHANG | WaitPidFlag::WNOWAIT;
    match waitid(Id::Pid(Pid::from_raw(child.id() as i32)), flags) {
        Ok(WaitStatus::StillAlive) => Ok(false),
        Ok(_) => Ok(true),
        Err(errno) => Err(io::Error::from(errno)),
    }
}

/// Without `WNOWAIT` the child is reaped here, so a group signal sent after
/// an exit can race pid reuse.
#[cfg(not(target_os = "linux"))]
fn exited_unreaped(child: &mut Child) -> io::Result<bool> {
    Ok(child.try_wait()?.is_some())
}
