use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use quarry_model::{BoxError, SessionMessage};
use tracing::warn;

use crate::Session;

/// A session lifecycle event delivered to [`SessionListener`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Opened,
    AuthChanged,
    Closed,
}

/// Reacts to session lifecycle events (audit logging, cache warm-up,
/// releasing per-user resources).
///
/// Listeners are called synchronously on the thread that caused the event.
/// Errors and panics are logged and recorded in the session's message log;
/// they never reach the caller.
pub trait SessionListener: Send + Sync {
    fn on_session_opened(&self, _session: &Session) -> Result<(), BoxError> {
        Ok(())
    }

    fn on_auth_changed(&self, _session: &Session) -> Result<(), BoxError> {
        Ok(())
    }

    fn on_session_closed(&self, _session: &Session) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Delivers `event` to every listener, isolating each call. A failing
/// listener leaves an error message in the session's log.
pub fn notify_listeners(listeners: &[Arc<dyn SessionListener>], session: &Session, event: SessionEvent) {
    for (idx, listener) in listeners.iter().enumerate() {
        let result = catch_unwind(AssertUnwindSafe(|| match event {
            SessionEvent::Opened => listener.on_session_opened(session),
            SessionEvent::AuthChanged => listener.on_auth_changed(session),
            SessionEvent::Closed => listener.on_session_closed(session),
        }));
        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(session_id = %session.id(), listener = idx, ?event, error = %err, "session listener failed");
                session.add_error(&*err);
            }
            Err(_) => {
                warn!(session_id = %session.id(), listener = idx, ?event, "session listener panicked");
                session
                    .message_log()
                    .push(SessionMessage::error_text(format!("session listener panicked on {event:?}")));
            }
        }
    }
}
