//! Constants shared by the supervisor, the scope and the tool wrappers.
//!
//! The timeouts below are liveness bounds. They are not meant to be tuned per
//! run and are therefore not exposed through the configuration file.

use std::time::Duration;

// ============================================================================
// Supervisor Timeouts
// ============================================================================

/// Maximum time `start()` blocks waiting for the first line of output.
pub const START_TIMEOUT: Duration = Duration::from_secs(2);

/// Maximum time a caller blocks waiting for a readiness marker.
pub const READY_TIMEOUT: Duration = Duration::from_secs(2);

/// Grace period between the interrupt signal and forced termination, and the
/// bound on joining the reader thread once the child has exited.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on joining the reader thread when a supervisor is dropped.
pub const FINAL_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// How long a benchmark client may overrun its configured duration before
/// it is terminated.
pub const CLIENT_GRACE: Duration = Duration::from_secs(30);

/// Interval between `try_wait` polls while waiting on a child.
pub const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

// ============================================================================
// Tool Output Markers
// ============================================================================

/// Token that opens the column header of perftest result tables.
pub const PERFTEST_HEADER_MARKER: &str = "#bytes";

/// Line a perftest server prints once it listens for a client.
pub const PERFTEST_READY_MARKER: &str = "Waiting for client to connect";

/// Counter reported by the likwid `MEM` group for total DRAM traffic.
pub const LIKWID_MEMORY_VOLUME: &str = "Memory data volume";

/// Counter reported by the likwid `MEM` group for DRAM bandwidth.
pub const LIKWID_MEMORY_BANDWIDTH: &str = "Memory bandwidth";

// ============================================================================
// Unit Conversions
// ============================================================================

/// Bytes in one mebibyte.
pub const MIB: f64 = 1024.0 * 1024.0;

/// Bytes in one gibibyte.
pub const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Bytes in one (decimal) megabyte, the unit perftest reports bandwidth in.
pub const MB: f64 = 1000.0 * 1000.0;
