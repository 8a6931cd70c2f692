//! Failure reporting
//!
//! Sink for human-readable alerts about conditions that need an operator's
//! attention but are not returned to any caller: corrupted cache values and
//! invalidations that stayed failed after every retry.

use tracing::error;

/// Alert sink
pub trait Reporter: Send + Sync {
    fn report(&self, message: &str);
}

/// Reporter that writes alerts to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn report(&self, message: &str) {
        error!(report = true, "{}", message);
    }
}
