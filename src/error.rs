//! Error types for cachewheel

use std::fmt;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the timing wheel and the cache layers
///
/// Payloads are kept as strings so the enum stays `Clone`: a single shared-call
/// result is handed to every caller waiting on the same key.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Normal absence of a value
    #[error("not found")]
    NotFound,

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Duration parse error
    #[error("Failed to parse duration: {0}")]
    DurationParse(String),

    /// Value could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Key-value backend I/O error
    #[error("Cache backend error: {0}")]
    Backend(String),

    /// Source-of-truth query failed
    #[error("Upstream query failed: {0}")]
    Query(String),

    /// The cluster has no node that can own the key
    #[error("no cache node available")]
    NoCacheNode,

    /// The timing wheel coordinator has been stopped
    #[error("timing wheel is stopped")]
    WheelStopped,

    /// The caller running a shared call went away before producing a result
    #[error("shared call abandoned for key: {0}")]
    SharedCallAbandoned(String),

    /// Several independent failures
    #[error("{0}")]
    Batch(BatchError),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Config(err.to_string())
    }
}

// =============================================================================
// Batch Error
// =============================================================================

/// Accumulates failures from operations fanned out over several targets
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchError {
    errors: Vec<Error>,
}

impl BatchError {
    /// Create an empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure
    pub fn add(&mut self, err: Error) {
        self.errors.push(err);
    }

    /// Number of recorded failures
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Whether no failure was recorded
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Recorded failures, in insertion order
    pub fn errors(&self) -> &[Error] {
        &self.errors
    }

    /// Collapse the batch into a single result
    pub fn err(mut self) -> Result<()> {
        match self.errors.len() {
            0 => Ok(()),
            1 => Err(self.errors.remove(0)),
            _ => Err(Error::Batch(self)),
        }
    }
}

impl fmt::Display for BatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
