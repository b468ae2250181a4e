//! Projects and connections as seen by one Quarry session.
//!
//! A session does not own databases; it owns *views* of them:
//!
//! - [`Project`]: a project the resource manager says the user may see,
//!   wrapped with the session's data-source filter and an explicit
//!   ownership tag that decides who disposes it.
//! - [`ConnectionDescriptor`]: a data source plus the session's runtime
//!   state for it (connected, versions, last error, web credentials).
//! - [`ConnectionCache`] / [`ProjectSet`]: the session-scoped maps, each
//!   behind its own lock.
//! - [`AccessGrants`]: which data sources the user may see.
//!
//! The external collaborators are traits: [`ResourceManager`] lists
//! projects, [`DataSourceRegistry`] stores a project's data sources and
//! [`ConnectionBackend`] opens physical connections.

mod access;
mod backend;
mod connection;
mod error;
mod loader;
mod navigator;
mod project;
mod registry;

pub use access::AccessGrants;
pub use backend::{ConnectionBackend, ServerInfo};
pub use connection::{ConnectionCache, ConnectionDescriptor, ConnectionInfo, ConnectionState, SavedCredentials};
pub use error::ProjectError;
pub use loader::{LoadedProjects, load_projects};
pub use navigator::NavigatorModel;
pub use project::{
    Project, ProjectInfo, ProjectKind, ProjectOwnership, ProjectPermission, ProjectRecord,
    ProjectSet, ResourceManager,
};
pub use registry::{
    AUTH_PROP_PASSWORD, AUTH_PROP_USER, AuthModel, ConnectionConfig, DataSource,
    DataSourceRegistry, DriverRegistry, InMemoryRegistry,
};
