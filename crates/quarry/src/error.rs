//! Unified error type for Quarry.

use quarry_model::BackendError;
use quarry_project::ProjectError;
use quarry_session::SessionError;
use quarry_task::TaskError;

/// Top-level error that wraps every crate-specific error.
///
/// The `#[from]` conversions let `?` lift sub-crate errors into it.
#[derive(Debug, thiserror::Error)]
pub enum QuarryError {
    /// An external collaborator failed.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// A project or connection lookup failed.
    #[error(transparent)]
    Project(#[from] ProjectError),

    /// An async task failed or was not found.
    #[error(transparent)]
    Task(#[from] TaskError),

    /// A session operation failed.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The hub was built without a required piece.
    #[error("hub misconfigured: {0}")]
    Config(String),
}

impl QuarryError {
    /// `true` for any "no such session / project / connection / task".
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Session(err) => err.is_not_found(),
            Self::Project(
                ProjectError::ProjectNotFound(_)
                | ProjectError::NoDefaultProject
                | ProjectError::ConnectionNotFound(_),
            ) => true,
            Self::Task(TaskError::NotFound(_)) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_model::{SessionId, TaskId};

    #[test]
    fn test_from_backend_error() {
        let err: QuarryError = BackendError::unavailable("security manager", "timeout").into();
        assert!(matches!(err, QuarryError::Backend(_)));
        assert!(err.to_string().contains("timeout"));
    }

    #[test]
    fn test_from_project_error() {
        let err: QuarryError = ProjectError::NoDefaultProject.into();
        assert!(matches!(err, QuarryError::Project(_)));
    }

    #[test]
    fn test_from_task_error() {
        let err: QuarryError = TaskError::QuotaExceeded { limit: 2, in_flight: 3 }.into();
        assert!(matches!(err, QuarryError::Task(_)));
        assert!(err.to_string().contains("quota"));
    }

    #[test]
    fn test_from_session_error() {
        let err: QuarryError = SessionError::NotFound(SessionId::new("s-1")).into();
        assert!(matches!(err, QuarryError::Session(_)));
        assert!(err.is_not_found());
    }

    #[test]
    fn test_is_not_found_covers_nested_errors() {
        assert!(QuarryError::from(TaskError::NotFound(TaskId(7))).is_not_found());
        assert!(QuarryError::from(SessionError::Project(ProjectError::ConnectionNotFound("pg".into()))).is_not_found());
        assert!(!QuarryError::Config("missing runtime".into()).is_not_found());
    }
}
