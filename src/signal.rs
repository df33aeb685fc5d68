//! Set-once signals used to synchronise a supervisor with its reader thread.

use std::{
    sync::{Condvar, Mutex},
    time::{Duration, Instant},
};

/// A one-shot flag that threads can block on with a deadline.
///
/// Once set it stays set; repeated `set` calls are no-ops.
#[derive(Debug, Default)]
pub struct Latch {
    state: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    /// Creates an unset latch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the latch and wakes every waiter. Returns `true` on the first call.
    pub fn set(&self) -> bool {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *state {
            return false;
        }
        *state = true;
        self.cond.notify_all();
        true
    }

    /// Returns whether the latch has been set.
    pub fn is_set(&self) -> bool {
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Blocks until the latch is set or `timeout` elapses. Returns `true` if set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        while !*state {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = match self.cond.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }

        true
    }
}
