//! # Quarry
//!
//! Session core for a multi-tenant database web console.
//!
//! Every browser client gets a [`Session`]: who the user is, which projects
//! and connections they can reach, their background queries and a message
//! log. The [`SessionHub`] stores sessions, closes idle ones and tells
//! [`SessionListener`]s about the lifecycle.
//!
//! The server around it supplies the collaborators: a [`SecurityManager`]
//! (users, permissions, grants), a [`ResourceManager`] (projects) and a
//! [`ConnectionBackend`] (physical database connections).
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use quarry::prelude::*;
//!
//! quarry::init_tracing();
//! let hub = SessionHub::builder()
//!     .security(security)
//!     .resources(resources)
//!     .backend(backend)
//!     .build()?;
//! hub.start_reaper();
//!
//! let session = hub.open(TouchInfo::default()).await?;
//! ```

mod error;
mod hub;

pub use error::QuarryError;
pub use hub::{HubConfig, SessionHub, SessionHubBuilder};

pub use quarry_model::{
    BackendError, MessageKind, Permission, PermissionSet, ProjectId, ProviderId, SessionId,
    SessionMessage, TaskId, UserId,
};
pub use quarry_project::{ConnectionBackend, DriverRegistry, ProjectError, ResourceManager};
pub use quarry_session::{
    SecurityManager, Session, SessionConfig, SessionError, SessionListener, TouchInfo,
};
pub use quarry_task::{TaskConfig, TaskError};

/// Installs a `tracing` fmt subscriber filtered by `RUST_LOG` (default
/// `info`). Does nothing if a global subscriber is already set.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if tracing_subscriber::fmt().with_env_filter(filter).try_init().is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

/// Everything a request handler usually needs.
pub mod prelude {
    pub use crate::{HubConfig, QuarryError, SessionHub, init_tracing};
    pub use quarry_model::{ConnectionId, ProjectId, SessionId, TaskId, UserId};
    pub use quarry_project::{
        ConnectionBackend, ConnectionInfo, DataSource, ProjectInfo, ResourceManager, SavedCredentials,
    };
    pub use quarry_session::{
        AttributeKey, AuthResult, AuthToken, SecurityManager, Session, SessionConfig, SessionError,
        SessionListener, TouchInfo, User,
    };
    pub use quarry_task::{TaskOutcome, TaskState};
}
