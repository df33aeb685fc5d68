//! Line-by-line output interpretation.
//!
//! A supervised process hands every captured line to a single [`LineStage`].
//! Stages are composed with [`LineStage::then`]: the composed stage calls the
//! first stage and then the second, whatever the first one returned, so no
//! stage can hide a line from the stages after it.

use tracing::info;

use crate::error::StageError;

/// A unit of output interpretation that observes every line exactly once.
pub trait LineStage: Send {
    /// Observes one line. Failing to match is not an error.
    fn observe(&mut self, line: &str) -> Result<(), StageError>;

    /// Chains `next` after this stage.
    fn then<N>(self, next: N) -> Chained<Self, N>
    where
        Self: Sized,
        N: LineStage,
    {
        Chained { stage: self, next }
    }
}

impl LineStage for Box<dyn LineStage> {
    fn observe(&mut self, line: &str) -> Result<(), StageError> {
        (**self).observe(line)
    }
}

/// Two stages run in order.
#[derive(Debug)]
pub struct Chained<S, N> {
    stage: S,
    next: N,
}

impl<S: LineStage, N: LineStage> LineStage for Chained<S, N> {
    fn observe(&mut self, line: &str) -> Result<(), StageError> {
        let first = self.stage.observe(line);
        let second = self.next.observe(line);
        first.and(second)
    }
}

/// Terminal stage that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct End;

impl LineStage for End {
    fn observe(&mut self, _line: &str) -> Result<(), StageError> {
        Ok(())
    }
}

/// Echoes each line to the tracing subscriber under a label.
#[derive(Debug, Clone)]
pub struct EchoStage {
    label: String,
}

impl EchoStage {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

impl LineStage for EchoStage {
    fn observe(&mut self, line: &str) -> Result<(), StageError> {
        info!("[{}] {line}", self.label);
        Ok(())
    }
}
