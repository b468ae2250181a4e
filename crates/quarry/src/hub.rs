//! `SessionHub`: the session store plus its reaper.
//!
//! Request handlers go through the hub to find their session. The hub owns
//! the [`SessionManager`] behind an async mutex, notifies listeners when
//! sessions open and close, and runs a background task that closes
//! sessions idle past their window.

use std::sync::{Arc, Weak};
use std::time::Duration;

use quarry_model::SessionId;
use quarry_project::{ConnectionBackend, DriverRegistry, ResourceManager};
use quarry_session::{
    SecurityManager, Session, SessionConfig, SessionError, SessionEvent, SessionListener,
    SessionManager, SessionServices, TouchInfo, notify_listeners,
};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::QuarryError;

/// How often the reaper looks for idle sessions unless configured.
const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Hub configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Applied to every session the hub opens.
    pub session: SessionConfig,
    /// Time between reaper passes.
    pub reap_interval: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            reap_interval: DEFAULT_REAP_INTERVAL,
        }
    }
}

impl HubConfig {
    /// Fixes out-of-range values, logging each correction.
    pub fn validated(mut self) -> Self {
        if self.reap_interval.is_zero() {
            warn!(default = ?DEFAULT_REAP_INTERVAL, "reap_interval of 0 would spin the reaper, using default");
            self.reap_interval = DEFAULT_REAP_INTERVAL;
        }
        self.session = self.session.validated();
        self
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for a [`SessionHub`].
///
/// The security manager, resource manager and connection backend are
/// required. The runtime defaults to the one `build` is called from.
#[derive(Default)]
pub struct SessionHubBuilder {
    config: HubConfig,
    security: Option<Arc<dyn SecurityManager>>,
    resources: Option<Arc<dyn ResourceManager>>,
    backend: Option<Arc<dyn ConnectionBackend>>,
    drivers: Option<Arc<DriverRegistry>>,
    listeners: Vec<Arc<dyn SessionListener>>,
    runtime: Option<Handle>,
}

impl SessionHubBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: HubConfig) -> Self {
        self.config = config;
        self
    }

    pub fn session_config(mut self, config: SessionConfig) -> Self {
        self.config.session = config;
        self
    }

    pub fn reap_interval(mut self, interval: Duration) -> Self {
        self.config.reap_interval = interval;
        self
    }

    pub fn security(mut self, security: Arc<dyn SecurityManager>) -> Self {
        self.security = Some(security);
        self
    }

    pub fn resources(mut self, resources: Arc<dyn ResourceManager>) -> Self {
        self.resources = Some(resources);
        self
    }

    pub fn backend(mut self, backend: Arc<dyn ConnectionBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Restricts connections to the enabled drivers. All drivers are
    /// allowed otherwise.
    pub fn drivers(mut self, drivers: Arc<DriverRegistry>) -> Self {
        self.drivers = Some(drivers);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn SessionListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Builds the hub. The reaper is not started; call
    /// [`SessionHub::start_reaper`].
    ///
    /// # Errors
    /// [`QuarryError::Config`] if a required collaborator is missing or no
    /// runtime is available.
    pub fn build(self) -> Result<SessionHub, QuarryError> {
        let security = self
            .security
            .ok_or_else(|| QuarryError::Config("no security manager".into()))?;
        let resources = self
            .resources
            .ok_or_else(|| QuarryError::Config("no resource manager".into()))?;
        let backend = self
            .backend
            .ok_or_else(|| QuarryError::Config("no connection backend".into()))?;
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|e| QuarryError::Config(format!("no tokio runtime: {e}")))?,
        };

        let mut services = SessionServices::new(security, resources, backend, runtime.clone());
        if let Some(drivers) = self.drivers {
            services = services.with_drivers(drivers);
        }
        for listener in self.listeners {
            services = services.with_listener(listener);
        }

        let config = self.config.validated();
        let inner = Arc::new(HubInner {
            sessions: Mutex::new(SessionManager::new(config.session.clone(), services.clone())),
            services,
            config,
        });
        info!(reap_interval = ?inner.config.reap_interval, "session hub ready");
        Ok(SessionHub {
            inner,
            runtime,
            reaper: parking_lot::Mutex::new(None),
        })
    }
}

// ---------------------------------------------------------------------------
// SessionHub
// ---------------------------------------------------------------------------

struct HubInner {
    sessions: Mutex<SessionManager>,
    services: SessionServices,
    config: HubConfig,
}

impl HubInner {
    fn close_session(&self, session: &Session) {
        session.close();
        notify_listeners(&self.services.listeners, session, SessionEvent::Closed);
    }

    async fn reap(&self) -> usize {
        let expired = self.sessions.lock().await.expire_stale();
        for session in &expired {
            self.close_session(session);
        }
        if !expired.is_empty() {
            info!(evicted = expired.len(), "idle sessions reaped");
        }
        expired.len()
    }
}

/// The live session store.
pub struct SessionHub {
    inner: Arc<HubInner>,
    runtime: Handle,
    reaper: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl SessionHub {
    pub fn builder() -> SessionHubBuilder {
        SessionHubBuilder::new()
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    /// Opens a session for a new client.
    ///
    /// The session is touched as a new transport session (authenticating
    /// as anonymous if allowed), its user data is loaded and listeners are
    /// told it opened.
    pub async fn open(&self, touch: TouchInfo) -> Result<Arc<Session>, QuarryError> {
        let session = self.inner.sessions.lock().await.create();
        session
            .touch(TouchInfo {
                transport_new: true,
                ..touch
            })
            .await?;
        session.refresh_user_data().await;
        notify_listeners(&self.inner.services.listeners, &session, SessionEvent::Opened);
        info!(session_id = %session.id(), "session opened");
        Ok(session)
    }

    /// Looks a live session up.
    ///
    /// # Errors
    /// [`SessionError::NotFound`] if the id is unknown.
    pub async fn get(&self, id: &SessionId) -> Result<Arc<Session>, QuarryError> {
        self.inner
            .sessions
            .lock()
            .await
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.clone()).into())
    }

    /// Records a request on a session. A session found idle past its
    /// window is closed on the spot and reported as not found.
    pub async fn touch(&self, id: &SessionId, info: TouchInfo) -> Result<Arc<Session>, QuarryError> {
        let session = self.get(id).await?;
        if !session.is_valid() || session.is_closed() {
            if let Some(session) = self.inner.sessions.lock().await.remove(id) {
                debug!(session_id = %id, "expired session touched");
                self.inner.close_session(&session);
            }
            return Err(SessionError::NotFound(id.clone()).into());
        }
        session.touch(info).await?;
        Ok(session)
    }

    /// Closes a session and removes it from the store.
    pub async fn close(&self, id: &SessionId) -> Result<(), QuarryError> {
        let session = self
            .inner
            .sessions
            .lock()
            .await
            .remove(id)
            .ok_or_else(|| SessionError::NotFound(id.clone()))?;
        self.inner.close_session(&session);
        info!(session_id = %id, "session closed");
        Ok(())
    }

    /// Closes every session idle past its window. Returns how many were
    /// closed.
    pub async fn reap(&self) -> usize {
        self.inner.reap().await
    }

    /// Starts the background reaper. Calling it again restarts it.
    pub fn start_reaper(&self) {
        let interval = self.inner.config.reap_interval;
        let task = self.runtime.spawn(reap_loop(Arc::downgrade(&self.inner), interval));
        if let Some(previous) = self.reaper.lock().replace(task) {
            previous.abort();
        }
        debug!(?interval, "session reaper started");
    }

    /// Stops the reaper and closes every session.
    pub async fn shutdown(&self) {
        if let Some(reaper) = self.reaper.lock().take() {
            reaper.abort();
        }
        let sessions = self.inner.sessions.lock().await.drain();
        for session in &sessions {
            self.inner.close_session(session);
        }
        info!(closed = sessions.len(), "session hub shut down");
    }

    pub async fn len(&self) -> usize {
        self.inner.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.sessions.lock().await.is_empty()
    }

    pub async fn session_ids(&self) -> Vec<SessionId> {
        self.inner.sessions.lock().await.ids()
    }
}

impl Drop for SessionHub {
    fn drop(&mut self) {
        if let Some(reaper) = self.reaper.get_mut().take() {
            reaper.abort();
        }
    }
}

impl std::fmt::Debug for SessionHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHub")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

/// Runs a reap pass every `interval` until the hub is dropped.
async fn reap_loop(hub: Weak<HubInner>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(hub) = hub.upgrade() else {
            debug!("session hub dropped, reaper exiting");
            return;
        };
        hub.reap().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hub_config_default_is_valid() {
        let config = HubConfig::default();
        assert_eq!(config.clone().validated(), config);
    }

    #[test]
    fn test_hub_config_zero_reap_interval_uses_default() {
        let config = HubConfig {
            reap_interval: Duration::ZERO,
            ..HubConfig::default()
        }
        .validated();

        assert_eq!(config.reap_interval, DEFAULT_REAP_INTERVAL);
    }

    #[test]
    fn test_hub_config_partial_json_fills_defaults() {
        let config: HubConfig = serde_json::from_str(r#"{"reap_interval":{"secs":5,"nanos":0}}"#).unwrap();

        assert_eq!(config.reap_interval, Duration::from_secs(5));
        assert_eq!(config.session, SessionConfig::default());
    }

    #[test]
    fn test_build_without_security_is_config_error() {
        let result = SessionHub::builder().build();

        assert!(matches!(result, Err(QuarryError::Config(_))));
    }
}
