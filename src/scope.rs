//! Scoped acquisition of dependent supervisors.

use tracing::{debug, warn};

use crate::{error::SupervisorError, supervisor::Supervisor};

/// A set of supervisors that are started in declaration order and stopped in
/// reverse order.
///
/// Dropping a scope without calling [`Scope::close`] terminates everything it
/// started, which covers early returns and interrupted runs.
#[derive(Debug, Default)]
pub struct Scope {
    entries: Vec<Supervisor>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts `supervisor`, waits for its readiness marker and keeps it in the
    /// scope. Returns the supervisor's index.
    ///
    /// A supervisor that fails readiness stays in the scope so it is torn
    /// down together with the others.
    pub fn enter(&mut self, mut supervisor: Supervisor) -> Result<usize, SupervisorError> {
        supervisor.start()?;
        let index = self.entries.len();
        self.entries.push(supervisor);
        self.entries[index].wait_ready()?;
        debug!("Entered '{}' into scope", self.entries[index].label());
        Ok(index)
    }

    pub fn get(&self, index: usize) -> Option<&Supervisor> {
        self.entries.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Supervisor> {
        self.entries.get_mut(index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stops every supervisor in reverse order and returns them in
    /// declaration order. Every supervisor is stopped even if an earlier stop
    /// failed; the first failure is returned.
    pub fn close(mut self) -> Result<Vec<Supervisor>, SupervisorError> {
        let mut first_error = None;
        let mut stopped = Vec::with_capacity(self.entries.len());

        while let Some(mut supervisor) = self.entries.pop() {
            debug!("Stopping '{}'", supervisor.label());
            if let Err(err) = supervisor.stop() {
                warn!("Stopping '{}' failed: {err}", supervisor.label());
                first_error.get_or_insert(err);
            }
            stopped.push(supervisor);
        }

        stopped.reverse();
        match first_error {
            Some(err) => Err(err),
            None => Ok(stopped),
        }
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        while let Some(mut supervisor) = self.entries.pop() {
            debug!("Tearing down '{}'", supervisor.label());
            if let Err(err) = supervisor.terminate() {
                warn!("Teardown of '{}' failed: {err}", supervisor.label());
            }
        }
    }
}
