//! Data sources and the registries that hold them.

use std::collections::{BTreeMap, HashSet};

use parking_lot::RwLock;
use quarry_model::{BackendError, ConnectionId, ProjectId};
use serde::{Deserialize, Serialize};

/// Auth property carrying the database user name for the native auth model.
pub const AUTH_PROP_USER: &str = "user";
/// Auth property carrying the database password for the native auth model.
pub const AUTH_PROP_PASSWORD: &str = "password";

// ---------------------------------------------------------------------------
// Connection configuration
// ---------------------------------------------------------------------------

/// How a data source authenticates against its database.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthModel {
    /// User name and password kept in the auth properties.
    #[default]
    Native,
    /// Any other driver-specific model (Kerberos, IAM, ...).
    Other(String),
}

/// Settings used to open a physical connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database: Option<String>,
    pub url: Option<String>,
    pub auth_model: AuthModel,
    pub auth_properties: BTreeMap<String, String>,
    pub user_name: Option<String>,
    pub user_password: Option<String>,
    pub save_password: bool,
}

impl ConnectionConfig {
    pub fn auth_property(&self, name: &str) -> Option<&str> {
        self.auth_properties.get(name).map(String::as_str)
    }

    pub fn set_auth_property(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.auth_properties.insert(name.into(), value.into());
    }
}

/// A stored data source: what to connect to and with which driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSource {
    pub id: ConnectionId,
    pub name: String,
    pub project: ProjectId,
    pub driver_id: String,
    pub folder: Option<String>,
    pub config: ConnectionConfig,
    /// Provided by the environment (e.g. a deployment descriptor) rather
    /// than by a user. Visible to everyone.
    pub externally_provided: bool,
    /// Created for a single use (e.g. connection test). Visible to its
    /// creator and dropped on disconnect.
    pub temporary: bool,
}

impl DataSource {
    pub fn new(
        id: impl Into<ConnectionId>,
        name: impl Into<String>,
        project: impl Into<ProjectId>,
        driver_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            project: project.into(),
            driver_id: driver_id.into(),
            folder: None,
            config: ConnectionConfig::default(),
            externally_provided: false,
            temporary: false,
        }
    }
}

// ---------------------------------------------------------------------------
// DataSourceRegistry
// ---------------------------------------------------------------------------

/// The persistent store of a project's data sources.
///
/// Implementations own persistence; Quarry only reads and edits through
/// this trait. Calls are expected to be quick (in-memory or cached), so
/// the trait is synchronous.
pub trait DataSourceRegistry: Send + Sync {
    /// Every data source in the project, unfiltered.
    fn data_sources(&self) -> Vec<DataSource>;

    fn data_source(&self, id: &ConnectionId) -> Option<DataSource>;

    fn add_data_source(&self, data_source: DataSource) -> Result<(), BackendError>;

    /// Removes a data source, returning it if it existed.
    fn remove_data_source(&self, id: &ConnectionId) -> Result<Option<DataSource>, BackendError>;

    /// The error left by the last load of this registry, if any. The
    /// registry still serves whatever it did load.
    fn last_error(&self) -> Option<BackendError> {
        None
    }
}

/// A registry that lives only in memory. Backs anonymous and other
/// in-memory-only projects.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    sources: RwLock<BTreeMap<ConnectionId, DataSource>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-filled with `sources`.
    pub fn with_sources(sources: impl IntoIterator<Item = DataSource>) -> Self {
        Self {
            sources: RwLock::new(sources.into_iter().map(|ds| (ds.id.clone(), ds)).collect()),
        }
    }
}

impl DataSourceRegistry for InMemoryRegistry {
    fn data_sources(&self) -> Vec<DataSource> {
        self.sources.read().values().cloned().collect()
    }

    fn data_source(&self, id: &ConnectionId) -> Option<DataSource> {
        self.sources.read().get(id).cloned()
    }

    fn add_data_source(&self, data_source: DataSource) -> Result<(), BackendError> {
        self.sources.write().insert(data_source.id.clone(), data_source);
        Ok(())
    }

    fn remove_data_source(&self, id: &ConnectionId) -> Result<Option<DataSource>, BackendError> {
        Ok(self.sources.write().remove(id))
    }
}

// ---------------------------------------------------------------------------
// DriverRegistry
// ---------------------------------------------------------------------------

/// Which database drivers this server allows connections through.
///
/// Constructed once by the application and injected into every session.
#[derive(Debug, Default)]
pub struct DriverRegistry {
    /// `None` allows every driver.
    enabled: RwLock<Option<HashSet<String>>>,
}

impl DriverRegistry {
    /// A registry that allows every driver.
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// A registry that allows only the listed drivers.
    pub fn with_enabled<I, S>(drivers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            enabled: RwLock::new(Some(drivers.into_iter().map(Into::into).collect())),
        }
    }

    pub fn is_enabled(&self, driver_id: &str) -> bool {
        self.enabled
            .read()
            .as_ref()
            .is_none_or(|enabled| enabled.contains(driver_id))
    }

    pub fn enable(&self, driver_id: impl Into<String>) {
        if let Some(enabled) = self.enabled.write().as_mut() {
            enabled.insert(driver_id.into());
        }
    }

    /// Disables a driver. On an allow-all registry this switches to an
    /// explicit (empty) allow list first.
    pub fn disable(&self, driver_id: &str) {
        self.enabled
            .write()
            .get_or_insert_with(HashSet::new)
            .remove(driver_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pg(id: &str) -> DataSource {
        DataSource::new(id, id, "g_global", "postgresql")
    }

    #[test]
    fn test_in_memory_registry_add_lookup_remove() {
        let registry = InMemoryRegistry::new();
        registry.add_data_source(pg("a")).unwrap();

        assert_eq!(registry.data_source(&"a".into()).map(|ds| ds.name), Some("a".into()));
        assert_eq!(registry.data_sources().len(), 1);

        let removed = registry.remove_data_source(&"a".into()).unwrap();
        assert!(removed.is_some());
        assert!(registry.data_sources().is_empty());
        assert!(registry.last_error().is_none());
    }

    #[test]
    fn test_in_memory_registry_lists_in_id_order() {
        let registry = InMemoryRegistry::with_sources([pg("b"), pg("a")]);

        let ids: Vec<_> = registry.data_sources().into_iter().map(|ds| ds.id.0).collect();

        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_driver_registry_allow_all_by_default() {
        let drivers = DriverRegistry::allow_all();
        assert!(drivers.is_enabled("anything"));
    }

    #[test]
    fn test_driver_registry_enable_and_disable() {
        let drivers = DriverRegistry::with_enabled(["postgresql"]);
        assert!(drivers.is_enabled("postgresql"));
        assert!(!drivers.is_enabled("mysql"));

        drivers.enable("mysql");
        drivers.disable("postgresql");

        assert!(drivers.is_enabled("mysql"));
        assert!(!drivers.is_enabled("postgresql"));
    }

    #[test]
    fn test_driver_registry_disable_on_allow_all_switches_to_list() {
        let drivers = DriverRegistry::allow_all();

        drivers.disable("sqlite");

        assert!(!drivers.is_enabled("sqlite"));
        assert!(!drivers.is_enabled("postgresql"));
    }
}
