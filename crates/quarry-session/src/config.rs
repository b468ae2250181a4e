//! Session configuration.

use std::time::Duration;

use quarry_task::TaskConfig;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Idle window used when none is configured (30 minutes).
const DEFAULT_MAX_IDLE: Duration = Duration::from_secs(30 * 60);

/// Behaviour shared by every session a store creates.
///
/// Individual sessions may still get a different idle window per request
/// through [`TouchInfo`](crate::TouchInfo).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long a session stays valid without being touched.
    pub max_idle: Duration,

    /// Whether sessions without a login authenticate as the anonymous
    /// user.
    pub anonymous_access_enabled: bool,

    /// Initial server setup: the first login is adopted into the session
    /// and session records are not written to the security manager.
    pub configuration_mode: bool,

    /// Subject whose data-source grants apply to anonymous sessions.
    pub anonymous_role: String,

    /// Whether non-admin users may create their own connections.
    pub custom_connections_enabled: bool,

    /// Locale used until the client picks one.
    pub default_locale: String,

    /// Async task limits.
    pub task: TaskConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_idle: DEFAULT_MAX_IDLE,
            anonymous_access_enabled: true,
            configuration_mode: false,
            anonymous_role: "user".to_string(),
            custom_connections_enabled: false,
            default_locale: "en".to_string(),
            task: TaskConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Fixes out-of-range values, logging each correction.
    pub fn validated(mut self) -> Self {
        if self.max_idle.is_zero() {
            warn!(default = ?DEFAULT_MAX_IDLE, "max_idle of 0 would expire sessions at once, using default");
            self.max_idle = DEFAULT_MAX_IDLE;
        }
        if self.default_locale.trim().is_empty() {
            warn!("empty default_locale, using \"en\"");
            self.default_locale = "en".to_string();
        }
        self.task = self.task.validated();
        self
    }
}
