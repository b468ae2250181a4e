//! Credentials for connection attempts.
//!
//! Before a connection is opened or tested, its configuration is filled in
//! from three places, in order:
//!
//! 1. every nested auth session that can supply database credentials
//!    (e.g. a cloud login that maps to database users);
//! 2. credentials the user typed in for this attempt, cached on the
//!    connection descriptor;
//! 3. for the native auth model, the `user`/`password` auth properties,
//!    which override the configuration's user name and password.
//!
//! Resolution never fails the attempt: a provider error is logged, recorded
//! as a session message, and the remaining steps still run.

use std::sync::Arc;

use quarry_model::{BoxError, MessageLog};
use quarry_project::{
    AUTH_PROP_PASSWORD, AUTH_PROP_USER, AuthModel, ConnectionConfig, ConnectionDescriptor, DataSource,
};
use tracing::warn;

use crate::AuthSession;

/// Supplies credentials for a data source.
pub trait CredentialsProvider: Send + Sync {
    /// Writes credentials into `config`. Leaves fields it does not know
    /// about untouched.
    fn provide_auth_parameters(
        &self,
        data_source: &DataSource,
        config: &mut ConnectionConfig,
    ) -> Result<(), BoxError>;
}

/// Fills `config` from every credential source for one attempt.
pub(crate) fn resolve_credentials(
    auth_sessions: &[Arc<dyn AuthSession>],
    descriptor: Option<&ConnectionDescriptor>,
    data_source: &DataSource,
    config: &mut ConnectionConfig,
    log: &MessageLog,
) {
    for session in auth_sessions {
        let Some(provider) = session.credentials_provider() else {
            continue;
        };
        if let Err(err) = provider.provide_auth_parameters(data_source, config) {
            warn!(connection_id = %data_source.id, error = %err, "credentials provider failed");
            log.push_error(&*err);
        }
    }

    if let Some(saved) = descriptor.and_then(ConnectionDescriptor::saved_credentials) {
        saved.apply_to(config);
    }

    if config.auth_model == AuthModel::Native {
        if let Some(user) = config.auth_property(AUTH_PROP_USER).map(str::to_owned) {
            config.user_name = Some(user);
        }
        if let Some(password) = config.auth_property(AUTH_PROP_PASSWORD).map(str::to_owned) {
            config.user_password = Some(password);
        }
    }
}
