//! Identifier and permission types.
//!
//! Every id is a newtype. Ids that come from outside Quarry (sessions,
//! users, projects, connections, auth providers) wrap a `String`; task ids
//! are generated here and wrap a `u64`.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// String identifiers
// ---------------------------------------------------------------------------

/// Declares a `String` newtype with the conversions every id needs.
///
/// `#[serde(transparent)]` keeps the JSON form a bare string, so
/// `ProjectId("u_alice")` serializes as `"u_alice"`.
macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Creates an id from anything string-like.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// The raw id.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Opaque session id, assigned by the session store.
    SessionId
);
string_id!(
    /// A user as known to the security manager.
    UserId
);
string_id!(
    /// A project (connection registry + resources) id.
    ProjectId
);
string_id!(
    /// A data-source / connection id, unique within the session.
    ConnectionId
);
string_id!(
    /// An authentication provider ("local", "github", ...).
    ProviderId
);

// ---------------------------------------------------------------------------
// TaskId
// ---------------------------------------------------------------------------

/// Id of an async task. Allocated from a process-wide counter and never
/// reused, so it displays as a plain number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(TaskId)
    }
}

// ---------------------------------------------------------------------------
// Permissions
// ---------------------------------------------------------------------------

/// A server-level permission granted to the session's user.
///
/// Only the permissions the session core itself checks are named; anything
/// else the security manager hands out travels as [`Permission::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Permission {
    /// Full administrator. Implies every other permission.
    Admin,
    /// May administer the resource manager (sees every project as editable).
    RmAdmin,
    /// Any other permission id.
    Other(String),
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Admin => f.write_str("admin"),
            Self::RmAdmin => f.write_str("rm-admin"),
            Self::Other(id) => f.write_str(id),
        }
    }
}

/// The set of permissions held by the session's user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionSet(BTreeSet<Permission>);

impl PermissionSet {
    /// An empty permission set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a permission. Returns `self` for chaining.
    pub fn with(mut self, permission: Permission) -> Self {
        self.0.insert(permission);
        self
    }

    /// `true` if the set holds `permission` directly (no admin implication).
    pub fn contains(&self, permission: &Permission) -> bool {
        self.0.contains(permission)
    }

    /// `true` if the set grants `permission`. Admin implies everything.
    pub fn grants(&self, permission: &Permission) -> bool {
        self.0.contains(&Permission::Admin) || self.0.contains(permission)
    }

    /// `true` if the user is an administrator.
    pub fn is_admin(&self) -> bool {
        self.0.contains(&Permission::Admin)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Permission> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<Permission> for PermissionSet {
    fn from_iter<I: IntoIterator<Item = Permission>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Kinds of securable objects the security manager hands out grants for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ObjectKind {
    DataSource,
    Project,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_id_serializes_transparently() {
        let id = ProjectId::new("u_alice");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"u_alice\"");
        assert_eq!(id.to_string(), "u_alice");
    }

    #[test]
    fn test_task_id_parses_from_display() {
        let id = TaskId(42);
        assert_eq!(id.to_string().parse::<TaskId>().unwrap(), id);
        assert!("x".parse::<TaskId>().is_err());
    }

    #[test]
    fn test_permission_set_admin_grants_everything() {
        let perms = PermissionSet::new().with(Permission::Admin);
        assert!(perms.grants(&Permission::RmAdmin));
        assert!(perms.grants(&Permission::Other("sql-editor".into())));
        assert!(!perms.contains(&Permission::RmAdmin));
    }

    #[test]
    fn test_permission_set_without_admin_grants_only_members() {
        let perms: PermissionSet = [Permission::RmAdmin].into_iter().collect();
        assert!(perms.grants(&Permission::RmAdmin));
        assert!(!perms.grants(&Permission::Admin));
        assert!(!perms.is_admin());
    }
}
