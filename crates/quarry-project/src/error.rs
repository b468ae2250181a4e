//! Error types for the project layer.

use quarry_model::{BackendError, ConnectionId, ProjectId};

/// Errors that can occur while resolving projects and connections.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProjectError {
    /// The project is not accessible to this session (or does not exist).
    #[error("project '{0}' not found")]
    ProjectNotFound(ProjectId),

    /// No project is loaded yet, so there is no default to fall back to.
    #[error("session has no default project")]
    NoDefaultProject,

    /// The data source does not exist in the project's registry, or the
    /// user may not see it.
    #[error("connection '{0}' not found")]
    ConnectionNotFound(ConnectionId),

    /// The project's registry refused the change.
    #[error(transparent)]
    Backend(#[from] BackendError),
}
