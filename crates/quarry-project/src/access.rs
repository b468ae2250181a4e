use std::collections::HashSet;

use quarry_model::ConnectionId;

use crate::DataSource;

/// Which data sources the session's user may see.
///
/// Re-read from the security manager whenever the user changes. Admins
/// bypass the grant list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessGrants {
    admin: bool,
    granted: HashSet<ConnectionId>,
}

impl AccessGrants {
    /// Grants for a user with explicit per-data-source grants only.
    pub fn new(granted: impl IntoIterator<Item = ConnectionId>) -> Self {
        Self {
            admin: false,
            granted: granted.into_iter().collect(),
        }
    }

    /// Grants for an administrator: everything is visible.
    pub fn admin() -> Self {
        Self {
            admin: true,
            granted: HashSet::new(),
        }
    }

    pub fn is_admin(&self) -> bool {
        self.admin
    }

    pub fn is_granted(&self, id: &ConnectionId) -> bool {
        self.granted.contains(id)
    }

    /// Visible = externally provided, temporary, admin, or explicitly
    /// granted.
    pub fn is_accessible(&self, data_source: &DataSource) -> bool {
        data_source.externally_provided
            || data_source.temporary
            || self.admin
            || self.granted.contains(&data_source.id)
    }

    /// Removes every data source the user cannot see.
    pub fn filter_accessible(&self, data_sources: Vec<DataSource>) -> Vec<DataSource> {
        if self.admin {
            return data_sources;
        }
        data_sources
            .into_iter()
            .filter(|ds| self.is_accessible(ds))
            .collect()
    }
}
