//! Wrappers for the external measurement tools.
//!
//! Each module provides the pipeline stage that understands the tool's
//! output, a shared handle to what the stage accumulated, and a builder for
//! the tool's command line.

/// Hardware performance counters (likwid-perfctr).
pub mod likwid;

/// Background memory traffic (mbw).
pub mod mbw;

/// RDMA transfer benchmarks (perftest).
pub mod perftest;
