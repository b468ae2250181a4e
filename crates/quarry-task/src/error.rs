//! Error types for the task layer.

use quarry_model::TaskId;

/// Errors returned by the scheduler, or recorded on a task that ended badly.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// No task with this id exists (never submitted, or already drained).
    #[error("task {0} not found")]
    NotFound(TaskId),

    /// Too many tasks were running when this one started.
    #[error("maximum simultaneous queries quota exceeded ({in_flight} > {limit})")]
    QuotaExceeded { limit: usize, in_flight: usize },

    /// The task was cancelled before it finished.
    #[error("task cancelled")]
    Cancelled,

    /// The task's work returned an error.
    #[error("{0}")]
    Failed(String),

    /// The task's work panicked.
    #[error("task panicked: {0}")]
    Panicked(String),
}
