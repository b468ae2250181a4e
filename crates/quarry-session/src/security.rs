//! The security-manager boundary and the session's view of its user.

use std::collections::BTreeMap;

use async_trait::async_trait;
use quarry_model::{BackendError, ObjectKind, PermissionSet, SessionId, UserId};
use serde::{Deserialize, Serialize};

/// A user as the security manager describes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    /// Free-form attributes (display name, e-mail, team).
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

impl User {
    pub fn new(id: impl Into<UserId>) -> Self {
        Self {
            id: id.into(),
            meta: BTreeMap::new(),
        }
    }

    pub fn with_meta(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(name.into(), value.into());
        self
    }
}

/// The outcome of a login or anonymous authentication.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthResult {
    /// The security manager's own session record, if it keeps one.
    pub sm_session_id: Option<String>,
    /// `None` for anonymous authentication.
    pub user: Option<User>,
    pub permissions: PermissionSet,
}

/// Client details the security manager stores with its session record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionParameters {
    pub last_remote_address: Option<String>,
    pub last_remote_user_agent: Option<String>,
}

/// Stores users, permissions and grants.
#[async_trait]
pub trait SecurityManager: Send + Sync {
    /// Opens an anonymous security-manager session for `session_id`.
    async fn authenticate_anonymous(
        &self,
        session_id: &SessionId,
        params: &SessionParameters,
    ) -> Result<AuthResult, BackendError>;

    /// Re-reads the permissions of `user` (`None` = anonymous).
    async fn refresh_permissions(&self, user: Option<&UserId>) -> Result<PermissionSet, BackendError>;

    /// Ids of the objects of `kind` that `subject` (a user id or role) was
    /// granted.
    async fn object_grants(&self, subject: &str, kind: ObjectKind) -> Result<Vec<String>, BackendError>;

    /// Updates the stored session record with the latest client details.
    async fn update_session_record(
        &self,
        sm_session_id: &str,
        user: Option<&UserId>,
        params: &SessionParameters,
    ) -> Result<(), BackendError>;
}

// ---------------------------------------------------------------------------
// UserContext
// ---------------------------------------------------------------------------

/// Who the session is acting as.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct UserContext {
    pub sm_session_id: Option<String>,
    pub user: Option<User>,
    pub permissions: PermissionSet,
}

impl UserContext {
    /// Authorized = the security manager knows this session.
    pub fn is_authorized(&self) -> bool {
        self.sm_session_id.is_some()
    }

    pub fn user_id(&self) -> Option<&UserId> {
        self.user.as_ref().map(|u| &u.id)
    }

    /// Applies an auth result. Returns `true` if the user changed.
    pub fn apply(&mut self, result: AuthResult) -> bool {
        let changed = self.user_id() != result.user.as_ref().map(|u| &u.id);
        self.sm_session_id = result.sm_session_id;
        self.user = result.user;
        self.permissions = result.permissions;
        changed
    }

    /// Adopts a user without a security-manager login.
    pub fn set_user(&mut self, user: Option<User>) {
        self.user = user;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
