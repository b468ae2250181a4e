//! Shared vocabulary for Quarry.
//!
//! This crate defines the types every other layer speaks:
//!
//! - **Identifiers** ([`SessionId`], [`UserId`], [`ProjectId`],
//!   [`ConnectionId`], [`ProviderId`], [`TaskId`]): newtype wrappers so a
//!   project id can never be passed where a connection id is expected.
//! - **Session messages** ([`SessionMessage`], [`MessageLog`]): the
//!   drainable info/error log each session keeps for its client.
//! - **Progress reporting** ([`ProgressMonitor`]): how long operations
//!   report what they are doing.
//! - **Errors** ([`BackendError`]): failures of external collaborators.
//!
//! ```text
//! Session layer (above)  ← owns a MessageLog, hands out monitors
//!     ↕
//! Model layer (this crate)  ← ids, messages, monitor trait
//! ```

mod error;
mod message;
mod monitor;
mod types;

pub use error::{BackendError, BoxError};
pub use message::{MessageKind, MessageLog, SessionMessage};
pub use monitor::{NullMonitor, ProgressMonitor};
pub use types::{
    ConnectionId, ObjectKind, Permission, PermissionSet, ProjectId,
    ProviderId, SessionId, TaskId, UserId,
};
