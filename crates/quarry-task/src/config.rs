//! Scheduler configuration.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Limits applied by a [`TaskScheduler`](crate::TaskScheduler).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Maximum number of tasks one session may run at the same time.
    /// A task that would exceed it fails with
    /// [`TaskError::QuotaExceeded`](crate::TaskError::QuotaExceeded)
    /// before its work starts. `None` means unlimited.
    pub query_limit: Option<usize>,
}

impl TaskConfig {
    /// A config with the given concurrent-task quota.
    pub fn with_query_limit(limit: usize) -> Self {
        Self {
            query_limit: Some(limit),
        }
    }

    /// Fixes out-of-range values. A quota of 0 would reject every task, so
    /// it is treated as "no quota".
    pub fn validated(mut self) -> Self {
        if self.query_limit == Some(0) {
            warn!("query_limit of 0 would reject every task, disabling the quota");
            self.query_limit = None;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_has_no_quota() {
        assert_eq!(TaskConfig::default().query_limit, None);
    }

    #[test]
    fn test_validated_zero_quota_becomes_unlimited() {
        let config = TaskConfig::with_query_limit(0).validated();
        assert_eq!(config.query_limit, None);
    }

    #[test]
    fn test_validated_keeps_positive_quota() {
        let config = TaskConfig::with_query_limit(3).validated();
        assert_eq!(config.query_limit, Some(3));
    }
}
