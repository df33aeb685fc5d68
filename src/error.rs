//! Error handling for rdmaprobe.
use thiserror::Error;

/// Errors raised while supervising a single external process.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Allocating the pseudo-terminal pair failed.
    #[error("Failed to allocate a pseudo-terminal for `{command}`: {source}")]
    Pty {
        /// The command line that was about to be spawned.
        command: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// The log sink for the process could not be created.
    #[error("Failed to open log file {path} for `{command}`: {source}")]
    LogSink {
        /// The supervised command line.
        command: String,
        /// The log file path.
        path: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// The executable could not be found or exec failed.
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        /// The executable that failed to start.
        program: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// The output reader failed before the process produced any output.
    #[error("Failed to read output of `{command}`: {source}")]
    Reader {
        /// The supervised command line.
        command: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// `start()` was called on a supervisor that already ran.
    #[error("Supervisor '{label}' has already been started")]
    AlreadyStarted {
        /// The supervisor label.
        label: String,
    },

    /// The process produced no output within the start timeout.
    #[error("`{command}` produced no output within the startup timeout")]
    StartupTimeout {
        /// The supervised command line.
        command: String,
        /// Output captured before teardown.
        output: String,
    },

    /// The process did not print its readiness marker in time.
    #[error("'{label}' did not report readiness ({marker}) in time: `{command}`")]
    ReadinessTimeout {
        /// The supervisor label.
        label: String,
        /// The marker that was expected.
        marker: String,
        /// The supervised command line.
        command: String,
        /// Output captured so far.
        output: String,
    },

    /// The process exited non-zero without being killed by the supervisor.
    #[error("`{command}` {message}")]
    Process {
        /// The supervised command line.
        command: String,
        /// Diagnostic describing the exit status.
        message: String,
        /// Exit code, if the process exited normally.
        exit_code: Option<i32>,
        /// Full captured output.
        output: String,
    },

    /// Signalling the process group failed.
    #[error("Failed to signal `{command}`: {source}")]
    Signal {
        /// The supervised command line.
        command: String,
        /// The underlying error that occurred.
        #[source]
        source: nix::errno::Errno,
    },

    /// Waiting on the child failed.
    #[error("Failed to wait for `{command}`: {source}")]
    Wait {
        /// The supervised command line.
        command: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },
}

impl SupervisorError {
    /// Output captured from the process, when the error carries it.
    pub fn captured_output(&self) -> Option<&str> {
        match self {
            SupervisorError::StartupTimeout { output, .. }
            | SupervisorError::ReadinessTimeout { output, .. }
            | SupervisorError::Process { output, .. } => Some(output),
            _ => None,
        }
    }
}

/// Errors raised by a pipeline stage while interpreting a single line.
///
/// These are logged by the reader and never abort a run.
#[derive(Debug, Error)]
pub enum StageError {
    /// A field expected to be numeric did not parse.
    #[error("Field '{field}' has non-numeric value '{value}'")]
    InvalidNumber {
        /// The field name.
        field: String,
        /// The raw text that failed to parse.
        value: String,
    },

    /// A memory-bandwidth line named an unknown copy method.
    #[error("Unknown copy method '{0}'")]
    UnknownMethod(String),

    /// A data row did not line up with the preceding header.
    #[error("Data row has {values} values but the header has {columns} columns")]
    ColumnMismatch {
        /// Number of header columns.
        columns: usize,
        /// Number of values in the row.
        values: usize,
    },
}

/// Errors raised when summary statistics are requested.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StatsError {
    /// Fewer than three samples were recorded.
    #[error("At least 3 samples are required for trimmed statistics, found {found}")]
    InsufficientSamples {
        /// Number of samples available before trimming.
        found: usize,
    },
}

/// Errors raised while loading or validating the run configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading the configuration file.
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    /// Error parsing YAML configuration.
    #[error("Invalid YAML format: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A value is out of range or missing.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level error of a probe run.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// A supervised process failed.
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    /// Statistics could not be computed.
    #[error(transparent)]
    Stats(#[from] StatsError),

    /// Configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The benchmark produced no result table.
    #[error("Benchmark `{command}` finished without reporting a result")]
    MissingResult {
        /// The benchmark command line.
        command: String,
    },

    /// The run was interrupted by the user.
    #[error("Interrupted")]
    Interrupted,

    /// Installing the interrupt handler failed.
    #[error("Failed to install interrupt handler: {0}")]
    Handler(#[from] ctrlc::Error),

    /// The report could not be serialized.
    #[error("Failed to serialize report: {0}")]
    Report(#[from] serde_json::Error),
}

impl ProbeError {
    /// Diagnostic output attached to the error, if any.
    pub fn captured_output(&self) -> Option<&str> {
        match self {
            ProbeError::Supervisor(err) => err.captured_output(),
            _ => None,
        }
    }
}
