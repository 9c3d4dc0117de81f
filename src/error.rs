//! Custom error types for the pipeline.
//!
//! This module defines the primary error type, `PipelineError`, shared by every
//! component of the acquisition-to-analysis pipeline. Using the `thiserror` crate, it
//! provides a centralized and consistent way to describe failures, from configuration
//! problems to queue, persistence and scheduler conditions.
//!
//! ## Error Hierarchy
//!
//! - **`Config`** / **`Configuration`**: the configuration could not be loaded, or it
//!   loaded but failed validation. These are start-up errors and propagate to the host.
//! - **`EmptyQueue`** / **`QueueUnavailable`** / **`ReadOnlyQueue`**: queue conditions.
//!   "Empty" is a normal outcome of a read; "unavailable" means the transport itself
//!   could not be reached.
//! - **`Persistence`** / **`TransientPersistence`**: failures reported by the persistence
//!   collaborator. Only the transient flavour is retried by the import loop.
//! - **`Worker`**: an acquisition unit failed to start or crashed.
//! - **`StepFailed`**: an analysis step failed without a failure continuation. This is
//!   the one per-machine fatal condition of the scheduler.
//! - **`Cancelled`**: the ambient cancellation was observed while waiting.
//!
//! By using `#[from]`, `PipelineError` can be created from the underlying error types,
//! so the `?` operator works across the crate.

use thiserror::Error;

/// Convenience alias for results using the pipeline error type.
pub type AppResult<T> = std::result::Result<T, PipelineError>;

/// Errors raised by the pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The configuration file or environment could not be read.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// The configuration was read but is not valid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Filesystem or process I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A record could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A read found no record in the queue.
    #[error("Queue '{queue}' is empty")]
    EmptyQueue {
        /// Queue name
        queue: String,
    },

    /// The queue transport could not be reached.
    #[error("Queue '{queue}' is unavailable: {reason}")]
    QueueUnavailable {
        /// Queue name
        queue: String,
        /// Underlying cause
        reason: String,
    },

    /// An enqueue was attempted on a receive-only queue.
    #[error("Queue '{queue}' is receive-only")]
    ReadOnlyQueue {
        /// Queue name
        queue: String,
    },

    /// The persistence collaborator reported a permanent failure.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// The persistence collaborator reported a failure worth retrying.
    #[error("Transient persistence error: {0}")]
    TransientPersistence(String),

    /// A value key does not match any known field.
    #[error("Unknown field code '{0}'")]
    UnknownField(String),

    /// A value could not be interpreted for its field.
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// An acquisition unit failed.
    #[error("Acquisition unit {unit}: {reason}")]
    Worker {
        /// Unit description (`machine/module`)
        unit: String,
        /// Failure description
        reason: String,
    },

    /// An analysis step failed and the graph has no failure continuation for it.
    #[error("Analysis step '{step}' failed for machine {machine_id}: {reason}")]
    StepFailed {
        /// Machine whose loop failed
        machine_id: u32,
        /// Name of the failing node
        step: String,
        /// Failure description
        reason: String,
    },

    /// Cancellation was requested while the operation was waiting.
    #[error("Operation cancelled")]
    Cancelled,

    /// Shutdown completed but some components reported errors.
    #[error("Shutdown failed with {} error(s)", .0.len())]
    ShutdownFailed(Vec<PipelineError>),
}

impl From<figment::Error> for PipelineError {
    fn from(value: figment::Error) -> Self {
        PipelineError::Config(Box::new(value))
    }
}

impl PipelineError {
    /// Whether the failure is worth retrying on the next cycle.
    ///
    /// Transient failures are converted into skip/retry outcomes at the point of
    /// detection and never cross component boundaries.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PipelineError::TransientPersistence(_)
                | PipelineError::QueueUnavailable { .. }
                | PipelineError::Io(_)
        )
    }

    /// Shorthand for a worker failure on a unit.
    pub fn worker(unit: impl std::fmt::Display, reason: impl Into<String>) -> Self {
        PipelineError::Worker {
            unit: unit.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(PipelineError::TransientPersistence("deadlock".into()).is_transient());
        assert!(PipelineError::QueueUnavailable {
            queue: "SingleAlarm-1".into(),
            reason: "gone".into()
        }
        .is_transient());
        assert!(!PipelineError::Persistence("constraint".into()).is_transient());
        assert!(!PipelineError::EmptyQueue {
            queue: "SingleAlarm-1".into()
        }
        .is_transient());
    }

    #[test]
    fn test_shutdown_failed_message() {
        let err = PipelineError::ShutdownFailed(vec![
            PipelineError::worker("1/0", "kill failed"),
            PipelineError::Cancelled,
        ]);
        assert_eq!(err.to_string(), "Shutdown failed with 2 error(s)");
    }
}
