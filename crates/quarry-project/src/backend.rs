use async_trait::async_trait;
use quarry_model::{BackendError, ProgressMonitor};
use serde::{Deserialize, Serialize};

use crate::{ConnectionConfig, DataSource};

/// What a successful connect reports about the two ends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub server_version: Option<String>,
    pub client_version: Option<String>,
}

impl ServerInfo {
    pub fn new(server_version: impl Into<String>, client_version: impl Into<String>) -> Self {
        Self {
            server_version: Some(server_version.into()),
            client_version: Some(client_version.into()),
        }
    }
}

/// Opens and closes physical database connections.
///
/// `config` is the data source's configuration after credentials have
/// been resolved for this attempt; it may differ from
/// `data_source.config`.
#[async_trait]
pub trait ConnectionBackend: Send + Sync {
    async fn connect(
        &self,
        data_source: &DataSource,
        config: &ConnectionConfig,
        monitor: &dyn ProgressMonitor,
    ) -> Result<ServerInfo, BackendError>;

    async fn disconnect(
        &self,
        data_source: &DataSource,
        monitor: &dyn ProgressMonitor,
    ) -> Result<(), BackendError>;

    /// Opens a connection only to check it works, then closes it.
    async fn test_connect(
        &self,
        data_source: &DataSource,
        config: &ConnectionConfig,
        monitor: &dyn ProgressMonitor,
    ) -> Result<ServerInfo, BackendError>;
}
