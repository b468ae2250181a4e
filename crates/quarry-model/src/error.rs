//! Error types shared by every layer that talks to an external collaborator.

/// A boxed, thread-safe error. Used where a collaborator (listener,
/// credential provider, task body) can fail in its own terms.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A call into an external collaborator (security manager, resource
/// manager, connection backend, data-source registry) failed.
///
/// Quarry never interprets these beyond logging them and turning them into
/// session messages, so the variants only distinguish "could not reach it"
/// from "it said no".
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    /// The collaborator could not be reached or did not answer.
    #[error("{service} unavailable: {reason}")]
    Unavailable {
        service: &'static str,
        reason: String,
    },

    /// The collaborator answered with a failure.
    #[error("{0}")]
    Failed(String),
}

impl BackendError {
    /// Shorthand for [`BackendError::Failed`].
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }

    /// Shorthand for [`BackendError::Unavailable`].
    pub fn unavailable(service: &'static str, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            service,
            reason: reason.into(),
        }
    }
}
