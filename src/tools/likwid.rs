//! Hardware performance counters reported by `likwid-perfctr`.
//!
//! The derived-metric table prints one counter per row:
//!
//! ```text
//! |     Memory data volume [GBytes]    |     12.3450 |
//! ```
//!
//! Only two-column rows are read; per-thread and statistics tables with more
//! columns are ignored.

use std::{
    collections::BTreeMap,
    sync::{Arc, LazyLock, Mutex, MutexGuard},
};

use regex::Regex;
use serde::Serialize;

use crate::{error::StageError, pipeline::LineStage, supervisor::CommandLine};

static COUNTER_ROW: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\|\s*([^|\[\]]+?)\s*(?:\[([^\]]*)\])?\s*\|\s*([-+]?[0-9]*\.?[0-9]+(?:[eE][-+]?[0-9]+)?)\s*\|\s*$",
    )
    .expect("counter row pattern is valid")
});

/// Latest reading of one counter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CounterReading {
    pub unit: Option<String>,
    pub value: f64,
}

/// Shared view of the counters a [`CounterStage`] recorded.
#[derive(Debug, Clone, Default)]
pub struct CounterTable {
    counters: Arc<Mutex<BTreeMap<String, CounterReading>>>,
}

impl CounterTable {
    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, CounterReading>> {
        self.counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stores a reading, replacing any earlier one with the same name.
    pub fn record(&self, name: &str, reading: CounterReading) {
        self.lock().insert(name.to_string(), reading);
    }

    pub fn get(&self, name: &str) -> Option<CounterReading> {
        self.lock().get(name).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, CounterReading> {
        self.lock().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Parses counter rows into a [`CounterTable`].
#[derive(Debug, Default)]
pub struct CounterStage {
    table: CounterTable,
}

impl CounterStage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(&self) -> CounterTable {
        self.table.clone()
    }
}

impl LineStage for CounterStage {
    fn observe(&mut self, line: &str) -> Result<(), StageError> {
        let Some(caps) = COUNTER_ROW.captures(line.trim()) else {
            return Ok(());
        };

        let raw_value = &caps[3];
        let value = raw_value
            .parse::<f64>()
            .map_err(|_| StageError::InvalidNumber {
                field: caps[1].to_string(),
                value: raw_value.to_string(),
            })?;
        let unit = caps
            .get(2)
            .map(|unit| unit.as_str().trim().to_string())
            .filter(|unit| !unit.is_empty());

        self.table.record(&caps[1], CounterReading { unit, value });
        Ok(())
    }
}

/// Builds the `likwid-perfctr` wrapper that pins the measured command to
/// `cpus` and samples performance group `group` (e.g. `MEM`).
pub fn command(program: &str, cpus: &str, group: &str) -> CommandLine {
    CommandLine::new(program, ["-C", cpus, "-g", group])
}
