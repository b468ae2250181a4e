//! Authentication tokens held by a session.
//!
//! A session can be logged in through several providers at once (say a
//! local password and a GitHub login), but all of them must resolve to the
//! same user. The validation that enforces this lives on
//! [`Session::add_tokens`](crate::Session::add_tokens); this module holds
//! the token list itself and the auth context the nested sub-sessions are
//! attached to.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use quarry_model::{BoxError, ProviderId, UserId};
use tracing::{debug, warn};

use crate::{CredentialsProvider, User};

/// A provider-side session nested inside a Quarry session (an OAuth
/// session, a cloud console login).
pub trait AuthSession: Send + Sync {
    /// A source of database credentials, if this login provides one.
    fn credentials_provider(&self) -> Option<&dyn CredentialsProvider> {
        None
    }

    /// Ends the provider-side session.
    fn close(&self) -> Result<(), BoxError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// AuthToken
// ---------------------------------------------------------------------------

/// The result of authenticating through one provider.
pub struct AuthToken {
    provider: ProviderId,
    user: User,
    principal: String,
    identity_meta: BTreeMap<String, String>,
    sub_session: Option<Arc<dyn AuthSession>>,
    created_at: DateTime<Utc>,
    closed: AtomicBool,
}

impl AuthToken {
    /// A token for `user` whose provider-side name is `principal`.
    pub fn new(provider: impl Into<ProviderId>, user: User, principal: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            user,
            principal: principal.into(),
            identity_meta: BTreeMap::new(),
            sub_session: None,
            created_at: Utc::now(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_sub_session(mut self, session: Arc<dyn AuthSession>) -> Self {
        self.sub_session = Some(session);
        self
    }

    /// Adds a provider-specific identity attribute (e.g. the GitHub login).
    pub fn with_identity_meta(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.identity_meta.insert(name.into(), value.into());
        self
    }

    pub fn provider(&self) -> &ProviderId {
        &self.provider
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn user_id(&self) -> &UserId {
        &self.user.id
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    pub fn identity_meta(&self) -> &BTreeMap<String, String> {
        &self.identity_meta
    }

    pub fn sub_session(&self) -> Option<&Arc<dyn AuthSession>> {
        self.sub_session.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Runs the token's cleanup. Only the first call does anything.
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(session) = &self.sub_session else {
            return;
        };
        match catch_unwind(AssertUnwindSafe(|| session.close())) {
            Ok(Ok(())) => debug!(provider = %self.provider, "auth sub-session closed"),
            Ok(Err(err)) => {
                warn!(provider = %self.provider, error = %err, "error closing auth sub-session");
            }
            Err(_) => warn!(provider = %self.provider, "auth sub-session close panicked"),
        }
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthToken")
            .field("provider", &self.provider)
            .field("user", &self.user.id)
            .field("principal", &self.principal)
            .field("has_sub_session", &self.sub_session.is_some())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// AuthTokens
// ---------------------------------------------------------------------------

/// The session's token list, in the order tokens were added.
#[derive(Debug, Default)]
pub(crate) struct AuthTokens {
    tokens: Mutex<Vec<Arc<AuthToken>>>,
}

impl AuthTokens {
    /// The token of `provider`, or the first token when `provider` is
    /// `None`.
    pub fn get(&self, provider: Option<&ProviderId>) -> Option<Arc<AuthToken>> {
        let tokens = self.tokens.lock();
        match provider {
            Some(provider) => tokens.iter().find(|t| t.provider() == provider).cloned(),
            None => tokens.first().cloned(),
        }
    }

    pub fn snapshot(&self) -> Vec<Arc<AuthToken>> {
        self.tokens.lock().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.lock().is_empty()
    }

    /// Appends `incoming`, removing any token of the same provider first.
    /// Returns the replaced tokens; the caller disposes them.
    pub fn replace(&self, incoming: Vec<Arc<AuthToken>>) -> Vec<Arc<AuthToken>> {
        swap_in(&mut self.tokens.lock(), incoming)
    }

    /// Like [`replace`](Self::replace), but only once `admit` accepts the
    /// tokens currently held. `admit` runs under the token lock, so nothing
    /// can be added between the check and the swap.
    pub fn replace_if<E>(
        &self,
        incoming: Vec<Arc<AuthToken>>,
        admit: impl FnOnce(&[Arc<AuthToken>]) -> Result<(), E>,
    ) -> Result<Vec<Arc<AuthToken>>, E> {
        let mut tokens = self.tokens.lock();
        admit(&tokens)?;
        Ok(swap_in(&mut tokens, incoming))
    }

    pub fn remove(&self, provider: &ProviderId) -> Option<Arc<AuthToken>> {
        let mut tokens = self.tokens.lock();
        let idx = tokens.iter().position(|t| t.provider() == provider)?;
        Some(tokens.remove(idx))
    }

    pub fn take_all(&self) -> Vec<Arc<AuthToken>> {
        std::mem::take(&mut *self.tokens.lock())
    }
}

fn swap_in(tokens: &mut Vec<Arc<AuthToken>>, incoming: Vec<Arc<AuthToken>>) -> Vec<Arc<AuthToken>> {
    let mut replaced = Vec::new();
    for token in incoming {
        if let Some(idx) = tokens.iter().position(|t| t.provider() == token.provider()) {
            replaced.push(tokens.remove(idx));
        }
        tokens.push(token);
    }
    replaced
}

// ---------------------------------------------------------------------------
// AuthContext
// ---------------------------------------------------------------------------

/// The nested auth sessions the session currently acts through.
#[derive(Default)]
pub(crate) struct AuthContext {
    sessions: Mutex<Vec<Arc<dyn AuthSession>>>,
    closed: AtomicBool,
}

impl AuthContext {
    pub fn add(&self, session: Arc<dyn AuthSession>) {
        self.sessions.lock().push(session);
    }

    pub fn remove(&self, session: &Arc<dyn AuthSession>) {
        self.sessions.lock().retain(|s| !Arc::ptr_eq(s, session));
    }

    pub fn sessions(&self) -> Vec<Arc<dyn AuthSession>> {
        self.sessions.lock().clone()
    }

    /// Detaches every sub-session. Closing them is up to their tokens.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.sessions.lock().clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Closes removed tokens and detaches their sub-sessions. Must be called
/// with no token lock held.
pub(crate) fn dispose_tokens(tokens: Vec<Arc<AuthToken>>, context: &AuthContext) {
    for token in tokens {
        if let Some(session) = token.sub_session() {
            context.remove(session);
        }
        token.close();
        debug!(provider = %token.provider(), user_id = %token.user_id(), "auth token removed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingSession {
        closes: AtomicUsize,
    }

    impl AuthSession for CountingSession {
        fn close(&self) -> Result<(), BoxError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct PanickingSession;

    impl AuthSession for PanickingSession {
        fn close(&self) -> Result<(), BoxError> {
            panic!("provider crashed");
        }
    }

    fn token(provider: &str) -> Arc<AuthToken> {
        Arc::new(AuthToken::new(provider, User::new("alice"), "alice"))
    }

    #[test]
    fn test_get_none_returns_first_token() {
        let tokens = AuthTokens::default();
        tokens.replace(vec![token("github"), token("local")]);

        assert_eq!(tokens.get(None).unwrap().provider().as_str(), "github");
        assert_eq!(tokens.get(Some(&"local".into())).unwrap().provider().as_str(), "local");
        assert!(tokens.get(Some(&"ldap".into())).is_none());
    }

    #[test]
    fn test_replace_same_provider_returns_old_token() {
        let tokens = AuthTokens::default();
        let old = token("github");
        tokens.replace(vec![Arc::clone(&old), token("local")]);

        let replaced = tokens.replace(vec![token("github")]);

        assert_eq!(replaced.len(), 1);
        assert!(Arc::ptr_eq(&replaced[0], &old));
        let providers: Vec<_> = tokens.snapshot().iter().map(|t| t.provider().to_string()).collect();
        assert_eq!(providers, vec!["local", "github"]);
    }

    #[test]
    fn test_replace_if_rejected_leaves_tokens_unchanged() {
        let tokens = AuthTokens::default();
        tokens.replace(vec![token("github")]);
        let bob = Arc::new(AuthToken::new("ldap", User::new("bob"), "bob"));

        let result = tokens.replace_if(vec![bob], |held| {
            if held.iter().any(|t| t.user_id().as_str() != "bob") {
                Err("held token of another user")
            } else {
                Ok(())
            }
        });

        assert_eq!(result.unwrap_err(), "held token of another user");
        let providers: Vec<_> = tokens.snapshot().iter().map(|t| t.provider().to_string()).collect();
        assert_eq!(providers, vec!["github"]);
    }

    #[test]
    fn test_close_runs_sub_session_cleanup_once() {
        let session = Arc::new(CountingSession::default());
        let token = AuthToken::new("github", User::new("alice"), "alice").with_sub_session(session.clone());

        token.close();
        token.close();

        assert_eq!(session.closes.load(Ordering::SeqCst), 1);
        assert!(token.is_closed());
    }

    #[test]
    fn test_close_survives_panicking_sub_session() {
        let token = AuthToken::new("github", User::new("alice"), "alice").with_sub_session(Arc::new(PanickingSession));

        token.close();

        assert!(token.is_closed());
    }

    #[test]
    fn test_dispose_tokens_detaches_sub_sessions() {
        let context = AuthContext::default();
        let session: Arc<dyn AuthSession> = Arc::new(CountingSession::default());
        context.add(Arc::clone(&session));
        let token = Arc::new(AuthToken::new("github", User::new("alice"), "alice").with_sub_session(session));

        dispose_tokens(vec![token], &context);

        assert!(context.sessions().is_empty());
    }
}
