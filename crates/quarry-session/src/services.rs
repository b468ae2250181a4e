use std::fmt;
use std::sync::Arc;

use quarry_model::{MessageLog, ProgressMonitor};
use quarry_project::{ConnectionBackend, DriverRegistry, ResourceManager};
use tokio::runtime::Handle;

use crate::{SecurityManager, SessionListener};

/// The collaborators every session of a store talks to.
///
/// Built once by the application and cloned into each session; there are
/// no process-wide registries.
#[derive(Clone)]
pub struct SessionServices {
    pub security: Arc<dyn SecurityManager>,
    pub resources: Arc<dyn ResourceManager>,
    pub backend: Arc<dyn ConnectionBackend>,
    pub drivers: Arc<DriverRegistry>,
    pub listeners: Vec<Arc<dyn SessionListener>>,
    /// Where async tasks and background disconnects are spawned.
    pub runtime: Handle,
}

impl SessionServices {
    /// Services with every driver enabled and no listeners.
    pub fn new(
        security: Arc<dyn SecurityManager>,
        resources: Arc<dyn ResourceManager>,
        backend: Arc<dyn ConnectionBackend>,
        runtime: Handle,
    ) -> Self {
        Self {
            security,
            resources,
            backend,
            drivers: Arc::new(DriverRegistry::allow_all()),
            listeners: Vec::new(),
            runtime,
        }
    }

    pub fn with_drivers(mut self, drivers: Arc<DriverRegistry>) -> Self {
        self.drivers = drivers;
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn SessionListener>) -> Self {
        self.listeners.push(listener);
        self
    }
}

impl fmt::Debug for SessionServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionServices")
            .field("drivers", &self.drivers)
            .field("listeners", &self.listeners.len())
            .finish_non_exhaustive()
    }
}

/// Progress monitor for session-level operations (connect, test). Every
/// step it is told about becomes an info message in the session log.
#[derive(Clone)]
pub struct SessionProgressMonitor {
    log: Arc<MessageLog>,
}

impl SessionProgressMonitor {
    pub(crate) fn new(log: Arc<MessageLog>) -> Self {
        Self { log }
    }
}

impl ProgressMonitor for SessionProgressMonitor {
    fn begin_task(&self, name: &str) {
        self.log.push_info(name);
    }

    fn sub_task(&self, name: &str) {
        self.log.push_info(name);
    }
}
