//! The session: one client's working state inside the server.
//!
//! Every request handler for a client goes through its [`Session`]. Many
//! requests may use the same session at once, so each collection it owns
//! (tokens, connections, projects, tasks, messages, attributes) sits behind
//! its own lock. Locks are only held for in-memory bookkeeping; calls to
//! the security manager, resource manager or connection backend are
//! awaited with no lock held.
//!
//! # Lifecycle
//!
//! ```text
//! New ──touch──→ Active ──idle > max_idle──→ Expired
//!  │               │                            │
//!  └───────────────┴────────close()─────────────┴──→ Closed
//! ```

use std::collections::BTreeMap;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::{Mutex, RwLock};
use quarry_model::{
    BackendError, BoxError, ConnectionId, MessageLog, NullMonitor, ObjectKind, Permission,
    PermissionSet, ProjectId, ProviderId, SessionId, SessionMessage, TaskId, UserId,
};
use quarry_project::{
    AccessGrants, ConnectionCache, ConnectionConfig, ConnectionDescriptor, ConnectionInfo, DataSource,
    NavigatorModel, Project, ProjectError, ProjectInfo, ProjectKind, ProjectRecord, ProjectSet,
    SavedCredentials, load_projects,
};
use quarry_task::{AsyncTask, TaskInfo, TaskMonitor, TaskOutcome, TaskScheduler};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::auth::{AuthContext, AuthTokens, dispose_tokens};
use crate::credentials::resolve_credentials;
use crate::security::UserContext;
use crate::{
    AuthResult, AuthSession, AuthToken, Attributes, CredentialsProvider, SessionConfig, SessionError,
    SessionEvent, SessionParameters, SessionProgressMonitor, SessionServices, User, notify_listeners,
};

// ---------------------------------------------------------------------------
// Public value types
// ---------------------------------------------------------------------------

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionState {
    /// Created but never touched by a request.
    New,
    /// Touched within its idle window.
    Active,
    /// Idle for longer than its window; the reaper will close it.
    Expired,
    /// Closed. Terminal.
    Closed,
}

/// What a request tells the session about itself.
#[derive(Debug, Clone, Default)]
pub struct TouchInfo {
    pub remote_addr: Option<String>,
    pub user_agent: Option<String>,
    /// New idle window for this session; `None` keeps the current one.
    pub max_idle: Option<Duration>,
    /// The transport (HTTP) session behind this request was just created.
    pub transport_new: bool,
}

/// Serializable session snapshot for the client.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: SessionId,
    pub state: SessionState,
    pub create_time: String,
    pub last_access_time: String,
    pub locale: String,
    pub cache_expired: bool,
    pub valid: bool,
    pub remaining_time_ms: u64,
    pub user_id: Option<UserId>,
    pub permissions: PermissionSet,
    pub auth_providers: Vec<ProviderId>,
}

struct Activity {
    last_access: Instant,
    last_access_at: DateTime<Utc>,
    max_idle: Duration,
    remote_addr: Option<String>,
    user_agent: Option<String>,
    touched: bool,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One client's session.
///
/// Shared as `Arc<Session>` between the session store and every request
/// that uses it. Every collection has its own lock and no guard is held
/// across an `.await`; collaborator calls work on snapshots.
pub struct Session {
    id: SessionId,
    config: SessionConfig,
    services: SessionServices,
    created_at: DateTime<Utc>,
    /// Set once by `close()` before any teardown step runs. Async paths
    /// re-check it after each await that installs state.
    closed: AtomicBool,

    /// Last access, idle window and client details. Written by `touch`.
    activity: Mutex<Activity>,
    locale: RwLock<String>,
    cache_expired: AtomicBool,

    /// User, permissions and security-manager session id.
    user: RwLock<UserContext>,
    /// Data-source grants, re-read whenever the identity changes.
    grants: RwLock<AccessGrants>,
    /// Login tokens. When both are needed, lock this before `user`.
    tokens: AuthTokens,
    /// Nested provider sessions, fed from the tokens.
    auth_context: AuthContext,

    /// Accessible projects and the default. Swapped whole on refresh.
    projects: ProjectSet,
    navigator: Mutex<Option<Arc<NavigatorModel>>>,
    /// Connection id to descriptor, rebuilt from the project registries.
    connections: ConnectionCache,

    tasks: TaskScheduler,
    /// Shared with the task scheduler, which records task failures here.
    log: Arc<MessageLog>,
    attributes: Attributes,
}

impl Session {
    /// Creates a session. Nothing is loaded until the first
    /// [`refresh_user_data`](Self::refresh_user_data).
    pub fn new(id: SessionId, config: SessionConfig, services: SessionServices) -> Self {
        let log = Arc::new(MessageLog::new());
        let tasks = TaskScheduler::new(config.task.clone(), services.runtime.clone(), Arc::clone(&log));
        let now = Utc::now();
        Self {
            activity: Mutex::new(Activity {
                last_access: Instant::now(),
                last_access_at: now,
                max_idle: config.max_idle,
                remote_addr: None,
                user_agent: None,
                touched: false,
            }),
            locale: RwLock::new(config.default_locale.clone()),
            cache_expired: AtomicBool::new(false),
            user: RwLock::new(UserContext::default()),
            grants: RwLock::new(AccessGrants::default()),
            tokens: AuthTokens::default(),
            auth_context: AuthContext::default(),
            projects: ProjectSet::new(),
            navigator: Mutex::new(None),
            connections: ConnectionCache::new(),
            tasks,
            log,
            attributes: Attributes::new(),
            created_at: now,
            closed: AtomicBool::new(false),
            id,
            config,
            services,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn services(&self) -> &SessionServices {
        &self.services
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed(self.id.clone()));
        }
        Ok(())
    }

    fn record_error(&self, context: &str, err: &BackendError) {
        error!(session_id = %self.id, error = %err, "{context}");
        self.log.push_error(err);
    }

    // -----------------------------------------------------------------------
    // Lifecycle and expiry
    // -----------------------------------------------------------------------

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn created_at_iso(&self) -> String {
        self.created_at.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    pub fn last_access_iso(&self) -> String {
        self.activity
            .lock()
            .last_access_at
            .to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    pub fn max_idle(&self) -> Duration {
        self.activity.lock().max_idle
    }

    /// Time left before the session expires; zero once it has.
    pub fn remaining_time(&self) -> Duration {
        let activity = self.activity.lock();
        (activity.last_access + activity.max_idle).saturating_duration_since(Instant::now())
    }

    /// `true` while `last_access + max_idle` is still in the future.
    pub fn is_valid(&self) -> bool {
        !self.remaining_time().is_zero()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn state(&self) -> SessionState {
        if self.is_closed() {
            SessionState::Closed
        } else if !self.is_valid() {
            SessionState::Expired
        } else if self.activity.lock().touched {
            SessionState::Active
        } else {
            SessionState::New
        }
    }

    pub fn locale(&self) -> String {
        self.locale.read().clone()
    }

    /// Sets the client locale; `None` restores the configured default.
    pub fn set_locale(&self, locale: Option<&str>) {
        *self.locale.write() = locale.map_or_else(|| self.config.default_locale.clone(), str::to_owned);
    }

    pub fn is_cache_expired(&self) -> bool {
        self.cache_expired.load(Ordering::Acquire)
    }

    pub fn set_cache_expired(&self, expired: bool) {
        self.cache_expired.store(expired, Ordering::Release);
    }

    /// The last client address and user agent.
    pub fn session_parameters(&self) -> SessionParameters {
        let activity = self.activity.lock();
        SessionParameters {
            last_remote_address: activity.remote_addr.clone(),
            last_remote_user_agent: activity.user_agent.clone(),
        }
    }

    /// Records a request: resets the idle window and updates client
    /// details.
    ///
    /// When the transport session is new, the session is also persisted in
    /// the security manager: an unauthorized session authenticates as
    /// anonymous (if allowed), an authorized one updates its record
    /// (except in configuration mode). Failures become session messages.
    pub async fn touch(&self, info: TouchInfo) -> Result<(), SessionError> {
        self.ensure_open()?;
        {
            let mut activity = self.activity.lock();
            activity.last_access = Instant::now();
            activity.last_access_at = Utc::now();
            activity.remote_addr = info.remote_addr;
            activity.user_agent = info.user_agent;
            if let Some(max_idle) = info.max_idle {
                activity.max_idle = max_idle;
            }
            activity.touched = true;
        }
        self.set_cache_expired(false);

        if info.transport_new {
            self.persist().await;
        }
        Ok(())
    }

    async fn persist(&self) {
        let (authorized, sm_session_id, user_id) = {
            let user = self.user.read();
            (user.is_authorized(), user.sm_session_id.clone(), user.user_id().cloned())
        };
        if !authorized {
            if user_id.is_some() {
                return;
            }
            if let Err(err) = self.auth_as_anonymous().await {
                self.record_error("error persisting session", &err);
            }
        } else if !self.config.configuration_mode {
            let Some(sm_session_id) = sm_session_id else {
                return;
            };
            let params = self.session_parameters();
            let result = self
                .services
                .security
                .update_session_record(&sm_session_id, user_id.as_ref(), &params)
                .await;
            if let Err(err) = result {
                self.record_error("error updating session record", &err);
            }
        }
    }

    /// Clears the login and all transient state, then reloads as an
    /// unauthenticated session. Used for forced logout.
    pub async fn reset_user_state(&self) -> Result<(), SessionError> {
        self.ensure_open()?;
        dispose_tokens(self.tokens.take_all(), &self.auth_context);
        self.user.write().reset();
        let cleared = self.attributes.clear_transient();
        info!(session_id = %self.id, attributes = cleared, "user state reset");
        self.refresh_user_data().await;
        Ok(())
    }

    /// Re-derives permissions and grants, then rebuilds the navigator
    /// view, the project set and the connection map.
    ///
    /// The new projects are loaded first and swapped in together with the
    /// new view, so requests running meanwhile keep seeing the old set. The
    /// replaced view is disposed, and of the replaced projects only those
    /// the session owns. Collaborator failures become session messages;
    /// the refresh completes with whatever loaded.
    ///
    /// If the session closes while the refresh is loading, the freshly
    /// loaded view and projects are disposed instead of installed.
    pub async fn refresh_user_data(&self) {
        if self.is_closed() {
            return;
        }
        self.refresh_session_auth().await;
        self.refresh_grants().await;

        let user_id = self.user.read().user_id().cloned();
        let loaded = load_projects(
            &*self.services.resources,
            user_id.as_ref(),
            self.config.configuration_mode,
            &self.log,
        )
        .await;
        let navigator = Arc::new(NavigatorModel::new(&loaded.projects));
        if self.is_closed() {
            debug!(session_id = %self.id, "session closed during refresh, discarding loaded projects");
            navigator.dispose();
            for project in &loaded.projects {
                project.dispose();
            }
            return;
        }

        let old_navigator = self.navigator.lock().replace(navigator);
        if let Some(old) = old_navigator {
            old.dispose();
        }
        for project in self.projects.replace(loaded.projects, loaded.default) {
            project.dispose();
        }
        // close() may have run between the check above and the swap.
        if self.is_closed() {
            self.discard_views();
            return;
        }

        self.refresh_connections();
    }

    /// Disposes whatever navigator view and projects are installed.
    fn discard_views(&self) {
        let navigator = self.navigator.lock().take();
        if let Some(navigator) = navigator {
            navigator.dispose();
        }
        for project in self.projects.take_all() {
            project.dispose();
        }
    }

    async fn refresh_session_auth(&self) {
        let (authorized, user_id) = {
            let user = self.user.read();
            (user.is_authorized(), user.user_id().cloned())
        };
        // A user adopted in configuration mode is kept even without a
        // security-manager session.
        let result = match user_id {
            Some(user_id) => match self.services.security.refresh_permissions(Some(&user_id)).await {
                Ok(permissions) => {
                    self.user.write().permissions = permissions;
                    Ok(())
                }
                Err(err) => Err(err),
            },
            None if !authorized => self.auth_as_anonymous().await,
            None => Ok(()),
        };
        if let Err(err) = result {
            self.record_error("error reading session permissions", &err);
        }
    }

    async fn auth_as_anonymous(&self) -> Result<(), BackendError> {
        if !self.config.anonymous_access_enabled {
            return Ok(());
        }
        let params = self.session_parameters();
        let result = self
            .services
            .security
            .authenticate_anonymous(&self.id, &params)
            .await?;
        self.user.write().apply(result);
        debug!(session_id = %self.id, "authenticated as anonymous");
        Ok(())
    }

    async fn refresh_grants(&self) {
        let (subject, admin) = {
            let user = self.user.read();
            let subject = user
                .user_id()
                .map_or_else(|| self.config.anonymous_role.clone(), UserId::to_string);
            (subject, user.permissions.is_admin())
        };
        let grants = if admin {
            AccessGrants::admin()
        } else {
            match self
                .services
                .security
                .object_grants(&subject, ObjectKind::DataSource)
                .await
            {
                Ok(ids) => AccessGrants::new(ids.into_iter().map(ConnectionId::from)),
                Err(err) => {
                    self.record_error("error reading connection grants", &err);
                    AccessGrants::default()
                }
            }
        };
        *self.grants.write() = grants;
    }

    /// Closes the session. Idempotent.
    ///
    /// Each cleanup step runs in its own failure boundary, so one failing
    /// step never skips the rest. Live connections are disconnected in the
    /// background and in-flight tasks are asked to cancel.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(session_id = %self.id, "closing session");

        self.guarded("navigator", || {
            if let Some(navigator) = self.navigator.lock().take() {
                navigator.dispose();
            }
        });
        self.guarded("connections", || {
            for descriptor in self.connections.take_all() {
                if descriptor.is_connected() {
                    self.schedule_disconnect(descriptor);
                }
            }
        });
        self.guarded("attributes", || {
            self.attributes.clear_transient();
        });
        self.guarded("auth tokens", || {
            dispose_tokens(self.tokens.take_all(), &self.auth_context);
        });
        self.guarded("auth context", || self.auth_context.close());
        self.guarded("user", || self.user.write().reset());
        self.guarded("projects", || {
            let default = self.projects.default_project();
            self.projects.take_all();
            if let Some(project) = default {
                project.dispose();
            }
        });
        self.guarded("tasks", || self.tasks.cancel_all());
    }

    fn guarded(&self, step: &str, f: impl FnOnce()) {
        if catch_unwind(AssertUnwindSafe(f)).is_err() {
            error!(session_id = %self.id, step, "session close step panicked");
        }
    }

    fn schedule_disconnect(&self, descriptor: Arc<ConnectionDescriptor>) {
        let backend = Arc::clone(&self.services.backend);
        let session_id = self.id.clone();
        self.services.runtime.spawn(async move {
            let data_source = descriptor.data_source();
            if let Err(err) = backend.disconnect(&data_source, &NullMonitor).await {
                warn!(%session_id, connection_id = %data_source.id, error = %err, "background disconnect failed");
            }
            descriptor.mark_disconnected();
        });
    }

    // -----------------------------------------------------------------------
    // User and auth tokens
    // -----------------------------------------------------------------------

    pub fn user(&self) -> Option<User> {
        self.user.read().user.clone()
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.user.read().user_id().cloned()
    }

    /// `true` once the security manager knows this session (anonymous
    /// included).
    pub fn is_authorized(&self) -> bool {
        self.user.read().is_authorized()
    }

    pub fn permissions(&self) -> PermissionSet {
        self.user.read().permissions.clone()
    }

    /// Admin implies every permission.
    pub fn has_permission(&self, permission: &Permission) -> bool {
        self.user.read().permissions.grants(permission)
    }

    pub fn require_admin(&self) -> Result<(), SessionError> {
        if self.has_permission(&Permission::Admin) {
            Ok(())
        } else {
            Err(SessionError::PermissionDenied("admin permissions required".into()))
        }
    }

    /// The data-source grants in force for this session.
    pub fn grants(&self) -> AccessGrants {
        self.grants.read().clone()
    }

    /// Applies a security-manager login result. When the user changed, the
    /// previous user's tokens are disposed and all user data is reloaded.
    pub async fn update_auth_info(&self, result: AuthResult) -> Result<(), SessionError> {
        self.ensure_open()?;
        let changed = self.user.write().apply(result);
        if changed {
            let stale = self.tokens.take_all();
            info!(session_id = %self.id, user_id = ?self.user_id(), dropped_tokens = stale.len(), "session identity changed");
            dispose_tokens(stale, &self.auth_context);
            self.refresh_user_data().await;
        }
        Ok(())
    }

    /// Adds authentication tokens.
    ///
    /// All tokens must name the same user, and that user must be the
    /// session's current one; otherwise nothing changes and
    /// [`SessionError::IdentityConflict`] is returned. In configuration
    /// mode a session with no user adopts the tokens' user instead.
    ///
    /// A token replaces the earlier token of the same provider, which is
    /// disposed. Listeners are told about the change.
    pub async fn add_tokens(&self, tokens: Vec<AuthToken>) -> Result<(), SessionError> {
        self.ensure_open()?;
        let Some(first) = tokens.first() else {
            return Ok(());
        };
        let new_user = first.user().clone();
        if let Some(other) = tokens.iter().find(|t| *t.user_id() != new_user.id) {
            return Err(SessionError::IdentityConflict(format!(
                "different users in auth tokens: '{}' and '{}'",
                new_user.id,
                other.user_id()
            )));
        }

        let current = self.user_id();
        match &current {
            None if self.config.configuration_mode => {
                info!(session_id = %self.id, user_id = %new_user.id, "configuration mode: adopting first login");
                self.user.write().set_user(Some(new_user.clone()));
                self.refresh_user_data().await;
            }
            Some(id) if *id == new_user.id => {}
            _ => {
                let current = current
                    .as_ref()
                    .map_or_else(|| "anonymous".to_string(), UserId::to_string);
                return Err(SessionError::IdentityConflict(format!(
                    "cannot authorize '{}' in a session of '{current}'",
                    new_user.id
                )));
            }
        }

        let tokens: Vec<Arc<AuthToken>> = tokens.into_iter().map(Arc::new).collect();
        let providers: Vec<String> = tokens.iter().map(|t| t.provider().to_string()).collect();
        // Lock order: tokens, then user.
        let replaced = self.tokens.replace_if(tokens.clone(), |held| {
            let current = self.user.read().user_id().cloned();
            if current.as_ref() != Some(&new_user.id) {
                return Err(SessionError::IdentityConflict(format!(
                    "session user changed while authorizing '{}'",
                    new_user.id
                )));
            }
            match held.iter().find(|t| *t.user_id() != new_user.id) {
                Some(stale) => Err(SessionError::IdentityConflict(format!(
                    "session already holds a token of '{}'",
                    stale.user_id()
                ))),
                None => Ok(()),
            }
        })?;
        dispose_tokens(replaced, &self.auth_context);
        for token in &tokens {
            if let Some(sub_session) = token.sub_session() {
                self.auth_context.add(Arc::clone(sub_session));
            }
        }
        info!(session_id = %self.id, user_id = %new_user.id, ?providers, "auth tokens added");

        notify_listeners(&self.services.listeners, self, SessionEvent::AuthChanged);
        Ok(())
    }

    /// Removes the token of `provider`, or every token when `None`. Once no
    /// token is left, the user state is fully reset.
    pub async fn remove_token(&self, provider: Option<&ProviderId>) -> Result<(), SessionError> {
        self.ensure_open()?;
        let removed = match provider {
            None => self.tokens.take_all(),
            Some(provider) => self.tokens.remove(provider).into_iter().collect(),
        };
        dispose_tokens(removed, &self.auth_context);
        if self.tokens.is_empty() {
            self.reset_user_state().await?;
        }
        Ok(())
    }

    /// The first token's principal.
    pub fn principal(&self) -> Option<String> {
        self.tokens.get(None).map(|t| t.principal().to_string())
    }

    /// The token of `provider`, or the first token.
    pub fn auth_info(&self, provider: Option<&ProviderId>) -> Option<Arc<AuthToken>> {
        self.tokens.get(provider)
    }

    pub fn all_auth_info(&self) -> Vec<Arc<AuthToken>> {
        self.tokens.snapshot()
    }

    /// The nested provider sessions the session acts through.
    pub fn auth_sessions(&self) -> Vec<Arc<dyn AuthSession>> {
        self.auth_context.sessions()
    }

    /// The user's meta parameters merged with every token's identity
    /// parameters (later tokens win). Empty without a user.
    pub fn user_meta_parameters(&self) -> BTreeMap<String, String> {
        let Some(user) = self.user() else {
            return BTreeMap::new();
        };
        let mut params = user.meta;
        for token in self.tokens.snapshot() {
            params.extend(token.identity_meta().clone());
        }
        params
    }

    // -----------------------------------------------------------------------
    // Projects
    // -----------------------------------------------------------------------

    /// Looks a project up; `None` means the default project.
    pub fn project(&self, id: Option<&ProjectId>) -> Result<Arc<Project>, SessionError> {
        self.projects.get(id).ok_or_else(|| {
            match id {
                Some(id) => ProjectError::ProjectNotFound(id.clone()),
                None => ProjectError::NoDefaultProject,
            }
            .into()
        })
    }

    pub fn default_project(&self) -> Option<Arc<Project>> {
        self.projects.default_project()
    }

    pub fn accessible_projects(&self) -> Vec<Arc<Project>> {
        self.projects.projects()
    }

    /// Client views of every accessible project.
    pub fn project_infos(&self) -> Vec<ProjectInfo> {
        let rm_admin = self.has_permission(&Permission::RmAdmin);
        self.projects
            .projects()
            .iter()
            .map(|p| p.info(rm_admin))
            .collect()
    }

    /// Adds a project to the session (e.g. one just created in the
    /// resource manager).
    pub fn add_project(&self, record: ProjectRecord) -> Arc<Project> {
        let project = Arc::new(Project::new(record));
        if let Some(previous) = self.projects.add(Arc::clone(&project)) {
            previous.dispose();
        }
        if let Some(navigator) = self.navigator.lock().as_ref() {
            navigator.add_project(project.id().clone());
        }
        debug!(session_id = %self.id, project_id = %project.id(), "project added");
        project
    }

    /// Removes a project and its connections from the session.
    pub fn delete_project(&self, id: &ProjectId) -> Result<(), SessionError> {
        let project = self
            .projects
            .remove(id)
            .ok_or_else(|| ProjectError::ProjectNotFound(id.clone()))?;
        if let Some(navigator) = self.navigator.lock().as_ref() {
            navigator.remove_project(id);
        }
        for descriptor in self.connections.snapshot() {
            if descriptor.project_id() == *id {
                self.connections.remove(&descriptor.id());
                if descriptor.is_connected() {
                    self.schedule_disconnect(descriptor);
                }
            }
        }
        project.dispose();
        debug!(session_id = %self.id, project_id = %id, "project deleted");
        Ok(())
    }

    pub fn navigator(&self) -> Option<Arc<NavigatorModel>> {
        self.navigator.lock().clone()
    }

    // -----------------------------------------------------------------------
    // Connections
    // -----------------------------------------------------------------------

    /// Rebuilds the connection map from every accessible project. Dropped
    /// connections that are still open are disconnected in the background.
    pub fn refresh_connections(&self) {
        let projects = self.projects.projects();
        let grants = self.grants();
        let dropped = self.connections.refresh(&projects, &grants, &self.log);
        for descriptor in dropped {
            if descriptor.is_connected() {
                self.schedule_disconnect(descriptor);
            }
        }
        info!(session_id = %self.id, connections = self.connections.len(), "connections refreshed");
    }

    /// Returns the cached descriptor, or resolves it from the project's
    /// registry and caches it.
    pub fn connection(
        &self,
        project: Option<&ProjectId>,
        id: &ConnectionId,
    ) -> Result<Arc<ConnectionDescriptor>, SessionError> {
        if let Some(existing) = self.connections.get(id) {
            return Ok(existing);
        }
        let project = self.project(project)?;
        let grants = self.grants.read();
        Ok(self.connections.get_or_create(&project, id, &grants)?)
    }

    pub fn find_connection(&self, id: &ConnectionId) -> Option<Arc<ConnectionDescriptor>> {
        self.connections.get(id)
    }

    pub fn connections(&self) -> Vec<Arc<ConnectionDescriptor>> {
        self.connections.snapshot()
    }

    pub fn add_connection(&self, descriptor: Arc<ConnectionDescriptor>) {
        self.connections.insert(descriptor);
    }

    pub fn remove_connection(&self, id: &ConnectionId) -> Option<Arc<ConnectionDescriptor>> {
        self.connections.remove(id)
    }

    /// Keeps only the connections this session's user may see.
    pub fn filter_accessible(&self, connections: Vec<Arc<ConnectionDescriptor>>) -> Vec<Arc<ConnectionDescriptor>> {
        let grants = self.grants.read();
        connections
            .into_iter()
            .filter(|c| grants.is_accessible(&c.data_source()))
            .collect()
    }

    fn check_driver(&self, data_source: &DataSource) -> Result<(), SessionError> {
        if self.services.drivers.is_enabled(&data_source.driver_id) {
            Ok(())
        } else {
            Err(SessionError::PermissionDenied(format!(
                "driver '{}' is disabled",
                data_source.driver_id
            )))
        }
    }

    /// The configuration to connect with, credentials resolved.
    fn connect_config(&self, descriptor: Option<&ConnectionDescriptor>, data_source: &DataSource) -> ConnectionConfig {
        let mut config = data_source.config.clone();
        resolve_credentials(
            &self.auth_context.sessions(),
            descriptor,
            data_source,
            &mut config,
            &self.log,
        );
        config
    }

    /// Opens a connection.
    ///
    /// `credentials` are used for this attempt only, unless
    /// `save_credentials` is set, in which case they are stored with the
    /// data source (never for global projects).
    pub async fn init_connection(
        &self,
        project: Option<&ProjectId>,
        id: &ConnectionId,
        credentials: Option<SavedCredentials>,
        save_credentials: bool,
    ) -> Result<ConnectionInfo, SessionError> {
        self.ensure_open()?;
        let descriptor = self.connection(project, id)?;
        if descriptor.is_connected() {
            return Err(SessionError::InvalidState(format!("connection '{id}' is already connected")));
        }
        let data_source = descriptor.data_source();
        self.check_driver(&data_source)?;

        if let Some(credentials) = &credentials {
            descriptor.set_saved_credentials(credentials.clone());
        }
        let config = self.connect_config(Some(&descriptor), &data_source);
        let monitor = self.progress_monitor();
        let result = self.services.backend.connect(&data_source, &config, &monitor).await;
        descriptor.clear_saved_credentials();

        match result {
            Ok(server) => {
                descriptor.mark_connected(server);
                info!(session_id = %self.id, connection_id = %id, "connection opened");
                if let (true, Some(credentials)) = (save_credentials, credentials) {
                    self.save_credentials(&descriptor, credentials);
                }
                Ok(descriptor.info())
            }
            Err(err) => {
                warn!(session_id = %self.id, connection_id = %id, error = %err, "connect failed");
                descriptor.set_error(err.to_string());
                Err(err.into())
            }
        }
    }

    fn save_credentials(&self, descriptor: &ConnectionDescriptor, credentials: SavedCredentials) {
        let mut data_source = descriptor.data_source();
        credentials.apply_to(&mut data_source.config);
        data_source.config.save_password = true;
        descriptor.set_data_source(data_source.clone());

        match self.projects.get(Some(&data_source.project)) {
            Some(project) if project.kind() != ProjectKind::Global && !project.is_in_memory() => {
                if let Err(err) = project.registry().add_data_source(data_source) {
                    self.record_error("error saving connection credentials", &err);
                }
            }
            _ => debug!(session_id = %self.id, connection_id = %data_source.id, "credentials kept in session only"),
        }
    }

    async fn disconnect_descriptor(&self, descriptor: &ConnectionDescriptor) {
        if !descriptor.is_connected() {
            return;
        }
        let data_source = descriptor.data_source();
        let monitor = self.progress_monitor();
        if let Err(err) = self.services.backend.disconnect(&data_source, &monitor).await {
            warn!(session_id = %self.id, connection_id = %data_source.id, error = %err, "error closing connection");
        }
        descriptor.mark_disconnected();
    }

    /// Closes a connection. A temporary data source is also dropped from
    /// its registry and from the session.
    pub async fn close_connection(
        &self,
        project: Option<&ProjectId>,
        id: &ConnectionId,
    ) -> Result<ConnectionInfo, SessionError> {
        self.ensure_open()?;
        let descriptor = self.connection(project, id)?;
        self.disconnect_descriptor(&descriptor).await;
        descriptor.clear_saved_credentials();

        if descriptor.is_temporary() {
            let data_source = descriptor.data_source();
            if let Some(owner) = self.projects.get(Some(&data_source.project)) {
                if let Err(err) = owner.registry().remove_data_source(id) {
                    self.record_error("error removing temporary connection", &err);
                }
            }
            self.connections.remove(id);
        }
        info!(session_id = %self.id, connection_id = %id, "connection closed");
        Ok(descriptor.info())
    }

    /// Checks that `data_source` can be connected to. Nothing is cached.
    pub async fn test_connection(
        &self,
        project: Option<&ProjectId>,
        mut data_source: DataSource,
    ) -> Result<ConnectionInfo, SessionError> {
        self.ensure_open()?;
        let project = self.project(project)?;
        data_source.project = project.id().clone();
        self.check_driver(&data_source)?;

        let existing = self.connections.get(&data_source.id);
        let config = self.connect_config(existing.as_deref(), &data_source);
        let monitor = self.progress_monitor();
        let server = self
            .services
            .backend
            .test_connect(&data_source, &config, &monitor)
            .await?;

        let probe = ConnectionDescriptor::new(data_source);
        probe.mark_connected(server);
        probe.mark_disconnected();
        Ok(probe.info())
    }

    /// Creates a connection in a project. Requires admin rights unless
    /// custom connections are enabled.
    pub fn create_connection(
        &self,
        project: Option<&ProjectId>,
        mut data_source: DataSource,
    ) -> Result<Arc<ConnectionDescriptor>, SessionError> {
        self.ensure_open()?;
        if !self.config.custom_connections_enabled && !self.has_permission(&Permission::Admin) {
            return Err(SessionError::PermissionDenied("creating connections is not allowed".into()));
        }
        let project = self.project(project)?;
        data_source.project = project.id().clone();
        project.registry().add_data_source(data_source.clone())?;

        let descriptor = Arc::new(ConnectionDescriptor::new(data_source));
        self.connections.insert(Arc::clone(&descriptor));
        info!(session_id = %self.id, project_id = %project.id(), connection_id = %descriptor.id(), "connection created");
        Ok(descriptor)
    }

    /// Deletes a connection from its project. Connections of the global
    /// project, or reached through another project, cannot be deleted by
    /// non-admins.
    pub async fn delete_connection(&self, project: Option<&ProjectId>, id: &ConnectionId) -> Result<(), SessionError> {
        self.ensure_open()?;
        let project = self.project(project)?;
        let descriptor = self.connection(Some(project.id()), id)?;
        let foreign = descriptor.project_id() != *project.id();
        let global = project.kind() == ProjectKind::Global && !self.has_permission(&Permission::Admin);
        if foreign || global {
            return Err(SessionError::PermissionDenied(format!(
                "global connection '{}' cannot be deleted",
                descriptor.data_source().name
            )));
        }

        self.disconnect_descriptor(&descriptor).await;
        project.registry().remove_data_source(id)?;
        self.connections.remove(id);
        info!(session_id = %self.id, project_id = %project.id(), connection_id = %id, "connection deleted");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Async tasks
    // -----------------------------------------------------------------------

    /// Starts `work` in the background. See [`TaskScheduler::submit`].
    pub fn submit_task<F, Fut, E>(&self, name: impl Into<String>, work: F) -> Result<Arc<AsyncTask>, SessionError>
    where
        F: FnOnce(TaskMonitor) -> Fut + Send + 'static,
        Fut: Future<Output = Result<TaskOutcome, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        self.ensure_open()?;
        Ok(self.tasks.submit(name, work))
    }

    pub fn poll_task(&self, id: TaskId, remove_on_finish: bool) -> Result<TaskInfo, SessionError> {
        Ok(self.tasks.poll(id, remove_on_finish)?)
    }

    pub fn cancel_task(&self, id: TaskId) -> Result<(), SessionError> {
        Ok(self.tasks.cancel(id)?)
    }

    pub fn task(&self, id: TaskId) -> Option<Arc<AsyncTask>> {
        self.tasks.task(id)
    }

    pub fn tasks(&self) -> &TaskScheduler {
        &self.tasks
    }

    // -----------------------------------------------------------------------
    // Messages and attributes
    // -----------------------------------------------------------------------

    /// Returns up to `max_entries` messages (all when `None`), oldest
    /// first, removing the returned ones when `clear` is set.
    pub fn read_log(&self, max_entries: Option<usize>, clear: bool) -> Vec<SessionMessage> {
        self.log.read(max_entries, clear)
    }

    /// Returns and clears every pending message.
    pub fn drain_messages(&self) -> Vec<SessionMessage> {
        self.log.drain()
    }

    pub fn add_info(&self, message: impl Into<String>) {
        self.log.push_info(message);
    }

    pub fn add_error(&self, err: &(dyn std::error::Error + 'static)) {
        self.log.push_error(err);
    }

    pub fn message_log(&self) -> &Arc<MessageLog> {
        &self.log
    }

    /// A monitor that turns progress steps into info messages.
    pub fn progress_monitor(&self) -> SessionProgressMonitor {
        SessionProgressMonitor::new(Arc::clone(&self.log))
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn info(&self) -> SessionInfo {
        let user = self.user.read().clone();
        SessionInfo {
            id: self.id.clone(),
            state: self.state(),
            create_time: self.created_at_iso(),
            last_access_time: self.last_access_iso(),
            locale: self.locale(),
            cache_expired: self.is_cache_expired(),
            valid: self.is_valid(),
            remaining_time_ms: u64::try_from(self.remaining_time().as_millis()).unwrap_or(u64::MAX),
            user_id: user.user_id().cloned(),
            permissions: user.permissions,
            auth_providers: self
                .tokens
                .snapshot()
                .iter()
                .map(|t| t.provider().clone())
                .collect(),
        }
    }
}

impl CredentialsProvider for Session {
    /// Resolves credentials for a connection of this session. Never fails.
    fn provide_auth_parameters(&self, data_source: &DataSource, config: &mut ConnectionConfig) -> Result<(), BoxError> {
        let descriptor = self.connections.get(&data_source.id);
        resolve_credentials(
            &self.auth_context.sessions(),
            descriptor.as_deref(),
            data_source,
            config,
            &self.log,
        );
        Ok(())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("user_id", &self.user_id())
            .finish_non_exhaustive()
    }
}
