//! rdmaprobe measures how much RDMA bandwidth a host loses while its memory
//! subsystem is busy. It runs a perftest server and client under a pty-based
//! process supervisor, generates background traffic with mbw (optionally
//! sampled by likwid), and reports trimmed statistics for a system-memory
//! baseline and an optional memory-mapped device region.

/// CLI interface.
pub mod cli;

/// Configuration management.
pub mod config;

/// Shared timeouts, output markers and unit conversions.
pub mod constants;

/// Error handling.
pub mod error;

/// Per-process log files.
pub mod logs;

/// Composable per-line output consumers.
pub mod pipeline;

/// Orchestration of a complete probe.
pub mod probe;

/// Probe results and rendering.
pub mod report;

/// Ordered start and reverse-order stop of several supervised processes.
pub mod scope;

/// Set-once signals shared between threads.
pub mod signal;

/// Trimmed summary statistics.
pub mod stats;

/// Pty-backed supervision of a single external process.
pub mod supervisor;

/// Wrappers for mbw, likwid-perfctr and perftest.
pub mod tools;
