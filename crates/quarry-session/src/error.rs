//! Error types for the session layer.

use quarry_model::{BackendError, SessionId};
use quarry_project::ProjectError;
use quarry_task::TaskError;

/// Errors returned by session operations.
///
/// Aggregating operations (project load, connection refresh, listener
/// fan-out, credential resolution) never return these; they record their
/// failures as session messages instead.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    /// No session exists with this id (never opened, closed or evicted).
    #[error("session {0} not found")]
    NotFound(SessionId),

    /// The tokens name a different user than the session's, or than each
    /// other. The session's tokens are unchanged.
    #[error("identity conflict: {0}")]
    IdentityConflict(String),

    /// The user lacks the permission the operation requires.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The operation does not apply in the object's current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The session was closed.
    #[error("session {0} is closed")]
    Closed(SessionId),

    /// A project or connection lookup failed.
    #[error(transparent)]
    Project(#[from] ProjectError),

    /// An async task operation failed (unknown id, quota).
    #[error(transparent)]
    Task(#[from] TaskError),

    /// An external collaborator failed.
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl SessionError {
    /// `true` for any flavour of "no such object".
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_)
                | Self::Task(TaskError::NotFound(_))
                | Self::Project(
                    ProjectError::ProjectNotFound(_)
                        | ProjectError::NoDefaultProject
                        | ProjectError::ConnectionNotFound(_)
                )
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_model::TaskId;

    #[test]
    fn test_from_task_error_is_transparent() {
        let err: SessionError = TaskError::QuotaExceeded { limit: 1, in_flight: 2 }.into();

        assert!(matches!(err, SessionError::Task(TaskError::QuotaExceeded { .. })));
        assert_eq!(err.to_string(), "maximum simultaneous queries quota exceeded (2 > 1)");
    }

    #[test]
    fn test_is_not_found_covers_every_layer() {
        assert!(SessionError::NotFound("s".into()).is_not_found());
        assert!(SessionError::from(TaskError::NotFound(TaskId(1))).is_not_found());
        assert!(SessionError::from(ProjectError::ConnectionNotFound("c".into())).is_not_found());
        assert!(!SessionError::PermissionDenied("x".into()).is_not_found());
    }
}
