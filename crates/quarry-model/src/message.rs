//! Session messages: the info/error log a client drains on each poll.
//!
//! Any component can append to a session's [`MessageLog`]: a failed
//! project load, a swallowed listener error, a task's progress. The client
//! reads the log and, by default, clears what it read.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Severity of a [`SessionMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Info,
    Error,
}

/// One timestamped log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMessage {
    pub time: DateTime<Utc>,
    pub kind: MessageKind,
    pub message: String,
}

impl SessionMessage {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            time: Utc::now(),
            kind: MessageKind::Info,
            message: message.into(),
        }
    }

    /// Builds an error entry from anything displayable, keeping the
    /// error's source chain in the text.
    pub fn error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut message = err.to_string();
        let mut source = err.source();
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }
        Self {
            time: Utc::now(),
            kind: MessageKind::Error,
            message,
        }
    }

    /// An error entry with no underlying error value (a caught panic).
    pub fn error_text(message: impl Into<String>) -> Self {
        Self {
            time: Utc::now(),
            kind: MessageKind::Error,
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.kind == MessageKind::Error
    }
}

/// The per-session message buffer.
///
/// Guarded by its own lock; every operation holds it only for the copy.
#[derive(Debug, Default)]
pub struct MessageLog {
    entries: Mutex<Vec<SessionMessage>>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message: SessionMessage) {
        self.entries.lock().push(message);
    }

    pub fn push_info(&self, message: impl Into<String>) {
        self.push(SessionMessage::info(message));
    }

    /// Records an error and logs it at `warn` level.
    pub fn push_error(&self, err: &(dyn std::error::Error + 'static)) {
        let message = SessionMessage::error(err);
        tracing::warn!(error = %message.message, "session error recorded");
        self.push(message);
    }

    /// Returns every message in append order and empties the log.
    pub fn drain(&self) -> Vec<SessionMessage> {
        std::mem::take(&mut *self.entries.lock())
    }

    /// Reads up to `max_entries` of the oldest messages (`None` or `0` means
    /// all). With `clear`, exactly the returned messages are removed.
    pub fn read(&self, max_entries: Option<usize>, clear: bool) -> Vec<SessionMessage> {
        let mut entries = self.entries.lock();
        let count = match max_entries {
            Some(n) if n > 0 && n < entries.len() => n,
            _ => entries.len(),
        };
        if clear {
            entries.drain(..count).collect()
        } else {
            entries[..count].to_vec()
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("outer")]
    struct Outer(#[source] Inner);

    #[derive(Debug, thiserror::Error)]
    #[error("inner")]
    struct Inner;

    #[test]
    fn test_drain_returns_messages_in_order_and_empties() {
        let log = MessageLog::new();
        log.push_info("one");
        log.push_info("two");

        let drained = log.drain();

        assert_eq!(
            drained.iter().map(|m| m.message.as_str()).collect::<Vec<_>>(),
            vec!["one", "two"]
        );
        assert!(log.is_empty());
    }

    #[test]
    fn test_drain_twice_returns_only_new_messages() {
        let log = MessageLog::new();
        log.push_info("old");
        log.drain();
        log.push_info("new");

        let drained = log.drain();

        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].message, "new");
    }

    #[test]
    fn test_read_without_clear_keeps_entries() {
        let log = MessageLog::new();
        log.push_info("a");
        log.push_info("b");

        let read = log.read(None, false);

        assert_eq!(read.len(), 2);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_read_partial_with_clear_removes_only_returned() {
        let log = MessageLog::new();
        for text in ["a", "b", "c"] {
            log.push_info(text);
        }

        let read = log.read(Some(2), true);

        assert_eq!(read.len(), 2);
        assert_eq!(read[1].message, "b");
        let rest = log.drain();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].message, "c");
    }

    #[test]
    fn test_read_zero_means_all() {
        let log = MessageLog::new();
        log.push_info("a");
        log.push_info("b");

        assert_eq!(log.read(Some(0), false).len(), 2);
        assert_eq!(log.read(Some(10), false).len(), 2);
    }

    #[test]
    fn test_push_error_keeps_source_chain() {
        let log = MessageLog::new();
        log.push_error(&Outer(Inner));

        let drained = log.drain();

        assert!(drained[0].is_error());
        assert_eq!(drained[0].message, "outer: inner");
    }
}
