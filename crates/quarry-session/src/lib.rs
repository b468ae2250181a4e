//! Per-client session state for Quarry.
//!
//! A [`Session`] is everything the server knows about one browser client:
//!
//! 1. **Identity**: the user, their permissions and the authentication
//!    tokens they logged in with ([`AuthToken`]), all resolving to one user
//! 2. **Working set**: accessible projects and the connection map
//! 3. **Background work**: async tasks and the drainable message log
//! 4. **Lifecycle**: idle expiry, forced reset and idempotent close
//!
//! Sessions live in a [`SessionManager`]. Collaborators (security manager,
//! resource manager, connection backend, drivers, listeners) are injected
//! through [`SessionServices`].
//!
//! # How it fits in the stack
//!
//! ```text
//! quarry (hub)       ← owns the store, reaps idle sessions
//!     ↕
//! quarry-session     ← this crate
//!     ↕
//! quarry-project / quarry-task / quarry-model
//! ```

mod attributes;
mod auth;
mod config;
mod credentials;
mod error;
mod listener;
mod manager;
mod security;
mod services;
mod session;

pub use attributes::{AttributeKey, Attributes};
pub use auth::{AuthSession, AuthToken};
pub use config::SessionConfig;
pub use credentials::CredentialsProvider;
pub use error::SessionError;
pub use listener::{SessionEvent, SessionListener, notify_listeners};
pub use manager::SessionManager;
pub use security::{AuthResult, SecurityManager, SessionParameters, User};
pub use services::{SessionProgressMonitor, SessionServices};
pub use session::{Session, SessionInfo, SessionState, TouchInfo};
