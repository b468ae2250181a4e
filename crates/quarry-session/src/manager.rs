//! The session store: every live session, keyed by id.
//!
//! `SessionManager` is not thread-safe by itself; it is a plain `HashMap`.
//! The hub owns it behind an async mutex. Sessions themselves are shared as
//! `Arc<Session>`, so a request keeps working with its session even if the
//! store evicts it meanwhile.
//!
//! ```text
//! create() ──→ [live] ──idle past max_idle──→ expire_stale() ──→ close()
//!                 │
//!                 └──────remove()──────────────────────────────→ close()
//! ```
//!
//! The store never closes sessions itself: whoever takes a session out
//! (the hub's reaper, a logout handler) closes it.

use std::collections::HashMap;
use std::sync::Arc;

use quarry_model::SessionId;
use rand::Rng;
use tracing::info;

use crate::{Session, SessionConfig, SessionServices};

pub struct SessionManager {
    sessions: HashMap<SessionId, Arc<Session>>,
    config: SessionConfig,
    services: SessionServices,
}

impl SessionManager {
    pub fn new(config: SessionConfig, services: SessionServices) -> Self {
        Self {
            sessions: HashMap::new(),
            config: config.validated(),
            services,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Creates and stores a session with a fresh random id.
    pub fn create(&mut self) -> Arc<Session> {
        let mut id = SessionId::new(generate_id());
        while self.sessions.contains_key(&id) {
            id = SessionId::new(generate_id());
        }
        let session = Arc::new(Session::new(id.clone(), self.config.clone(), self.services.clone()));
        self.sessions.insert(id.clone(), Arc::clone(&session));

        info!(session_id = %id, sessions = self.sessions.len(), "session created");
        session
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.get(id).cloned()
    }

    /// Takes a session out of the store. The caller closes it.
    pub fn remove(&mut self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.remove(id)
    }

    /// Removes every session that is no longer valid (idle past its
    /// window, or already closed) and returns them for closing.
    pub fn expire_stale(&mut self) -> Vec<Arc<Session>> {
        let stale: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.is_closed() || !s.is_valid())
            .map(|(id, _)| id.clone())
            .collect();

        let mut expired = Vec::with_capacity(stale.len());
        for id in stale {
            if let Some(session) = self.sessions.remove(&id) {
                info!(session_id = %id, "session expired");
                expired.push(session);
            }
        }
        expired
    }

    /// Takes every session out of the store (shutdown).
    pub fn drain(&mut self) -> Vec<Arc<Session>> {
        self.sessions.drain().map(|(_, s)| s).collect()
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions", &self.sessions.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// 128 random bits as 32 lowercase hex characters.
fn generate_id() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
