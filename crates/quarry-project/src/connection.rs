//! Connection descriptors and the session's connection map.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::{Mutex, RwLock};
use quarry_model::{ConnectionId, MessageLog, ProjectId};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::{AccessGrants, ConnectionConfig, DataSource, Project, ProjectError, ServerInfo};

// ---------------------------------------------------------------------------
// Descriptor
// ---------------------------------------------------------------------------

/// Runtime state of a connection inside one session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionState {
    pub connected: bool,
    pub server_version: Option<String>,
    pub client_version: Option<String>,
    pub last_error: Option<String>,
    pub connect_time: Option<DateTime<Utc>>,
}

/// Credentials the user typed in for a single connect attempt.
///
/// Held on the descriptor only while the attempt runs, unless the user
/// asked to save them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SavedCredentials {
    pub auth_properties: BTreeMap<String, String>,
}

impl SavedCredentials {
    pub fn new(auth_properties: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            auth_properties: auth_properties.into_iter().collect(),
        }
    }

    /// Copies the credentials into `config`'s auth properties.
    pub fn apply_to(&self, config: &mut ConnectionConfig) {
        for (name, value) in &self.auth_properties {
            config.set_auth_property(name.clone(), value.clone());
        }
    }
}

/// A data source plus this session's runtime state for it.
///
/// Shared as `Arc<ConnectionDescriptor>`; each part has its own lock so a
/// status read never waits on a configuration update.
#[derive(Debug)]
pub struct ConnectionDescriptor {
    data_source: RwLock<DataSource>,
    state: Mutex<ConnectionState>,
    credentials: Mutex<Option<SavedCredentials>>,
}

impl ConnectionDescriptor {
    pub fn new(data_source: DataSource) -> Self {
        Self {
            data_source: RwLock::new(data_source),
            state: Mutex::new(ConnectionState::default()),
            credentials: Mutex::new(None),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.data_source.read().id.clone()
    }

    pub fn project_id(&self) -> ProjectId {
        self.data_source.read().project.clone()
    }

    /// A copy of the current data source.
    pub fn data_source(&self) -> DataSource {
        self.data_source.read().clone()
    }

    pub fn set_data_source(&self, data_source: DataSource) {
        *self.data_source.write() = data_source;
    }

    pub fn is_temporary(&self) -> bool {
        self.data_source.read().temporary
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub fn state(&self) -> ConnectionState {
        self.state.lock().clone()
    }

    /// Records a successful connect.
    pub fn mark_connected(&self, server: ServerInfo) {
        let mut state = self.state.lock();
        state.connected = true;
        state.server_version = server.server_version;
        state.client_version = server.client_version;
        state.last_error = None;
        state.connect_time = Some(Utc::now());
    }

    pub fn mark_disconnected(&self) {
        self.state.lock().connected = false;
    }

    /// Records a failed connect. The descriptor stays disconnected.
    pub fn set_error(&self, message: impl Into<String>) {
        let mut state = self.state.lock();
        state.connected = false;
        state.last_error = Some(message.into());
    }

    pub fn set_saved_credentials(&self, credentials: SavedCredentials) {
        *self.credentials.lock() = Some(credentials);
    }

    pub fn saved_credentials(&self) -> Option<SavedCredentials> {
        self.credentials.lock().clone()
    }

    pub fn clear_saved_credentials(&self) {
        self.credentials.lock().take();
    }

    pub fn info(&self) -> ConnectionInfo {
        let ds = self.data_source.read().clone();
        let state = self.state.lock().clone();
        ConnectionInfo::from_parts(ds, state)
    }
}

/// Serializable connection snapshot for the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub name: String,
    pub project_id: ProjectId,
    pub driver_id: String,
    pub folder: Option<String>,
    pub connected: bool,
    pub server_version: Option<String>,
    pub client_version: Option<String>,
    pub connect_error: Option<String>,
    pub connect_time: Option<String>,
    pub externally_provided: bool,
    pub temporary: bool,
}

impl ConnectionInfo {
    pub(crate) fn from_parts(ds: DataSource, state: ConnectionState) -> Self {
        Self {
            id: ds.id,
            name: ds.name,
            project_id: ds.project,
            driver_id: ds.driver_id,
            folder: ds.folder,
            connected: state.connected,
            server_version: state.server_version,
            client_version: state.client_version,
            connect_error: state.last_error,
            connect_time: state
                .connect_time
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true)),
            externally_provided: ds.externally_provided,
            temporary: ds.temporary,
        }
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// The session's connection map, keyed by connection id.
#[derive(Debug, Default)]
pub struct ConnectionCache {
    connections: Mutex<HashMap<ConnectionId, Arc<ConnectionDescriptor>>>,
}

impl ConnectionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<ConnectionDescriptor>> {
        self.connections.lock().get(id).cloned()
    }

    /// Inserts a descriptor, returning the one it replaced.
    pub fn insert(&self, descriptor: Arc<ConnectionDescriptor>) -> Option<Arc<ConnectionDescriptor>> {
        self.connections.lock().insert(descriptor.id(), descriptor)
    }

    pub fn remove(&self, id: &ConnectionId) -> Option<Arc<ConnectionDescriptor>> {
        self.connections.lock().remove(id)
    }

    pub fn snapshot(&self) -> Vec<Arc<ConnectionDescriptor>> {
        self.connections.lock().values().cloned().collect()
    }

    pub fn take_all(&self) -> Vec<Arc<ConnectionDescriptor>> {
        self.connections.lock().drain().map(|(_, d)| d).collect()
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }

    /// Returns the cached descriptor, or resolves the data source from
    /// `project` and caches a new one.
    pub fn get_or_create(
        &self,
        project: &Project,
        id: &ConnectionId,
        grants: &AccessGrants,
    ) -> Result<Arc<ConnectionDescriptor>, ProjectError> {
        if let Some(existing) = self.get(id) {
            return Ok(existing);
        }
        let ds = project
            .data_source(id, grants)
            .ok_or_else(|| ProjectError::ConnectionNotFound(id.clone()))?;

        // Another request may have cached it while the registry was read.
        let descriptor = Arc::clone(
            self.connections
                .lock()
                .entry(id.clone())
                .or_insert_with(|| Arc::new(ConnectionDescriptor::new(ds))),
        );
        debug!(project_id = %project.id(), connection_id = %id, "connection descriptor cached");
        Ok(descriptor)
    }

    /// Rebuilds the map from every project's visible data sources.
    ///
    /// Descriptors that survive keep their runtime state. Registry load
    /// errors are recorded in `log`; the refresh completes with whatever
    /// loaded. Returns the descriptors that were dropped.
    pub fn refresh(
        &self,
        projects: &[Arc<Project>],
        grants: &AccessGrants,
        log: &MessageLog,
    ) -> Vec<Arc<ConnectionDescriptor>> {
        let mut loaded = Vec::new();
        for project in projects {
            loaded.extend(project.visible_data_sources(grants));
            if let Some(err) = project.registry().last_error() {
                error!(project_id = %project.id(), error = %err, "error refreshing connections from project");
                log.push_error(&err);
            }
        }

        let mut connections = self.connections.lock();
        let mut previous = std::mem::take(&mut *connections);
        for ds in loaded {
            let descriptor = match previous.remove(&ds.id) {
                Some(existing) => {
                    existing.set_data_source(ds);
                    existing
                }
                None => Arc::new(ConnectionDescriptor::new(ds)),
            };
            connections.insert(descriptor.id(), descriptor);
        }
        debug!(connections = connections.len(), dropped = previous.len(), "connection list refreshed");
        previous.into_values().collect()
    }
}
