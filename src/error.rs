//! Error types for sweepbench.
//!
//! All errors are strongly typed using thiserror so callers can match on
//! the specific failure: a bad sweep declaration, a storage fault, a grid
//! write outside the allocated shape, or a worker that failed at a given
//! coordinate.

use thiserror::Error;

/// Configuration errors raised eagerly while declaring a sweep or parsing
/// run options.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("Sweep variable '{name}' has neither bounds nor an explicit sample set")]
    MissingDomain {
        name: String,
    },

    #[error("Sweep has no input variables, no constants and no title")]
    EmptySweep,

    #[error("Level must be at least 1 (got {level})")]
    InvalidLevel {
        level: u32,
    },

    #[error("Invalid bounds for '{name}': low ({low}) must not exceed high ({high})")]
    InvalidBounds {
        name: String,
        low: f64,
        high: f64,
    },

    #[error("Variable name cannot be empty")]
    EmptyName,

    #[error("Duplicate variable name '{name}'")]
    DuplicateName {
        name: String,
    },

    #[error("Vector result '{name}' must have at least one component")]
    EmptyVector {
        name: String,
    },

    #[error("Invalid option '{option}': {reason}")]
    InvalidOption {
        option: String,
        reason: String,
    },
}

/// Errors raised by the persistent key-value stores.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error on {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupted cache log: {message}")]
    Corrupted {
        message: String,
    },

    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
    },

    #[error("Poisoned lock: {context}")]
    Poisoned {
        context: &'static str,
    },
}

impl StorageError {
    /// Wraps an I/O error with a short description of what was being done.
    #[must_use]
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Errors raised while writing into or reshaping a result grid.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GridError {
    #[error("Index {index:?} is out of range for shape {shape:?}")]
    IndexOutOfRange {
        index: Vec<usize>,
        shape: Vec<usize>,
    },

    #[error("Unknown result variable '{name}'")]
    UnknownVariable {
        name: String,
    },

    #[error("Result '{name}' expects {expected}, got {actual}")]
    ResultTypeMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("Cannot concatenate grids: {reason}")]
    IncompatibleGrids {
        reason: String,
    },
}

/// Error produced by a worker invocation.
///
/// Workers report failures with a message; the error is carried to the
/// caller unchanged apart from the coordinate it occurred at.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct WorkerError {
    message: String,
}

impl WorkerError {
    /// Creates a worker error from a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The worker's failure message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for WorkerError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for WorkerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Failure of a single submitted job.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum JobError {
    #[error("worker failed: {0}")]
    Worker(#[from] WorkerError),

    #[error("failed to store result: {message}")]
    Store {
        message: String,
    },

    #[error("worker pool disconnected")]
    Disconnected,
}

/// Top-level error type for sweepbench.
#[derive(Debug, Error)]
pub enum SweepError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Grid error: {0}")]
    Grid(#[from] GridError),

    #[error("Job failed at {coordinate}: {source}")]
    Job {
        coordinate: String,
        #[source]
        source: JobError,
    },

    #[error("Worker result at {coordinate} is missing '{name}'")]
    MissingResult {
        name: String,
        coordinate: String,
    },

    #[error("No cached result for sweep {hash} and read-only mode was requested")]
    CacheMissRequired {
        hash: String,
    },

    #[error("Failed to start worker pool: {source}")]
    WorkerPool {
        #[source]
        source: std::io::Error,
    },
}

impl SweepError {
    /// Returns true if this is a configuration error.
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Returns true if this is a storage error.
    #[must_use]
    pub const fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }

    /// Returns true if a worker failed.
    #[must_use]
    pub const fn is_worker_failure(&self) -> bool {
        matches!(
            self,
            Self::Job {
                source: JobError::Worker(_),
                ..
            }
        )
    }

    /// The worker error carried by this error, if any.
    #[must_use]
    pub fn worker_error(&self) -> Option<&WorkerError> {
        match self {
            Self::Job {
                source: JobError::Worker(err),
                ..
            } => Some(err),
            _ => None,
        }
    }
}

/// Result type alias for sweepbench operations.
pub type SweepResult<T> = Result<T, SweepError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_domain_message() {
        let err = ConfigError::MissingDomain {
            name: "x".to_string(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("'x'"));
        assert!(msg.contains("neither bounds"));
    }

    #[test]
    fn test_sweep_error_from_config() {
        let err: SweepError = ConfigError::EmptySweep.into();
        assert!(err.is_config());
        assert!(!err.is_storage());
        assert!(!err.is_worker_failure());
    }

    #[test]
    fn test_job_error_reports_coordinate() {
        let err = SweepError::Job {
            coordinate: "x=0.5".to_string(),
            source: JobError::Worker(WorkerError::new("boom")),
        };
        let msg = format!("{err}");
        assert!(msg.contains("x=0.5"));
        assert!(msg.contains("boom"));
        assert!(err.is_worker_failure());
        assert_eq!(err.worker_error().map(WorkerError::message), Some("boom"));
    }

    #[test]
    fn test_storage_error_io_context() {
        let err = StorageError::io(
            "open cache.wal",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        let msg = format!("{err}");
        assert!(msg.contains("open cache.wal"));
        assert!(msg.contains("gone"));
    }

    #[test]
    fn test_grid_error_index() {
        let err = GridError::IndexOutOfRange {
            index: vec![3, 0],
            shape: vec![3, 3],
        };
        assert!(format!("{err}").contains("[3, 0]"));
    }
}
