//! Projects as seen by one session, and the session's project set.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use quarry_model::{BackendError, ConnectionId, ProjectId, UserId};
use serde::{Deserialize, Serialize};

use crate::{AccessGrants, DataSource, DataSourceRegistry, InMemoryRegistry};

/// Id of the synthetic project handed to unauthenticated sessions.
const ANONYMOUS_PROJECT_ID: &str = "anonymous";

// ---------------------------------------------------------------------------
// Project metadata
// ---------------------------------------------------------------------------

/// Where a project lives in the resource manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProjectKind {
    /// The server-wide project. Its data sources are filtered by grants.
    Global,
    /// A team project shared between users.
    Shared,
    /// The user's private project.
    User,
}

impl ProjectKind {
    /// Global and team projects are shared; only user projects are not.
    pub fn is_shared(self) -> bool {
        !matches!(self, Self::User)
    }
}

/// What the user may do inside a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProjectPermission {
    DataSourcesEdit,
    DataSourcesView,
    ResourceEdit,
    ResourceView,
}

/// Who disposes a project.
///
/// Decided when the project is created: the session disposes only the
/// projects it owns, never the platform's shared instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProjectOwnership {
    Session,
    Platform,
}

/// A project as listed by the resource manager.
#[derive(Clone)]
pub struct ProjectRecord {
    pub id: ProjectId,
    pub name: String,
    pub kind: ProjectKind,
    pub permissions: BTreeSet<ProjectPermission>,
    pub ownership: ProjectOwnership,
    pub registry: Arc<dyn DataSourceRegistry>,
}

impl ProjectRecord {
    pub fn new(
        id: impl Into<ProjectId>,
        name: impl Into<String>,
        kind: ProjectKind,
        registry: Arc<dyn DataSourceRegistry>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            permissions: BTreeSet::new(),
            ownership: ProjectOwnership::Session,
            registry,
        }
    }

    pub fn with_permissions(mut self, permissions: impl IntoIterator<Item = ProjectPermission>) -> Self {
        self.permissions.extend(permissions);
        self
    }

    pub fn with_ownership(mut self, ownership: ProjectOwnership) -> Self {
        self.ownership = ownership;
        self
    }

    /// The synthetic project of an unauthenticated session: empty,
    /// in-memory and owned by the session.
    pub fn anonymous() -> Self {
        Self::new(
            ANONYMOUS_PROJECT_ID,
            "Anonymous",
            ProjectKind::User,
            Arc::new(InMemoryRegistry::new()),
        )
        .with_permissions([ProjectPermission::DataSourcesView, ProjectPermission::ResourceView])
    }
}

impl fmt::Debug for ProjectRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProjectRecord")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("permissions", &self.permissions)
            .field("ownership", &self.ownership)
            .finish_non_exhaustive()
    }
}

/// Lists the projects a user may see.
#[async_trait]
pub trait ResourceManager: Send + Sync {
    /// `user` is `None` for an unauthenticated session.
    async fn list_accessible_projects(
        &self,
        user: Option<&UserId>,
    ) -> Result<Vec<ProjectRecord>, BackendError>;
}

// ---------------------------------------------------------------------------
// Project
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DataSourceFilter {
    All,
    Granted,
}

/// A project wrapped for one session.
///
/// Global projects only show data sources the user was granted; every
/// other project shows all of its data sources. Projects the user may not
/// edit are in-memory only: changes are never persisted.
#[derive(Debug)]
pub struct Project {
    record: ProjectRecord,
    filter: DataSourceFilter,
    in_memory: bool,
    disposed: AtomicBool,
}

impl Project {
    pub fn new(record: ProjectRecord) -> Self {
        let filter = match record.kind {
            ProjectKind::Global => DataSourceFilter::Granted,
            ProjectKind::Shared | ProjectKind::User => DataSourceFilter::All,
        };
        let in_memory = !record.permissions.contains(&ProjectPermission::DataSourcesEdit);
        Self {
            record,
            filter,
            in_memory,
            disposed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &ProjectId {
        &self.record.id
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn kind(&self) -> ProjectKind {
        self.record.kind
    }

    pub fn ownership(&self) -> ProjectOwnership {
        self.record.ownership
    }

    pub fn is_shared(&self) -> bool {
        self.record.kind.is_shared()
    }

    pub fn is_in_memory(&self) -> bool {
        self.in_memory
    }

    pub fn has_permission(&self, permission: ProjectPermission) -> bool {
        self.record.permissions.contains(&permission)
    }

    pub fn registry(&self) -> &Arc<dyn DataSourceRegistry> {
        &self.record.registry
    }

    /// The project's data sources after the session filter.
    pub fn visible_data_sources(&self, grants: &AccessGrants) -> Vec<DataSource> {
        let all = self.record.registry.data_sources();
        match self.filter {
            DataSourceFilter::All => all,
            DataSourceFilter::Granted => grants.filter_accessible(all),
        }
    }

    /// A single data source, if it exists and passes the session filter.
    pub fn data_source(&self, id: &ConnectionId, grants: &AccessGrants) -> Option<DataSource> {
        let ds = self.record.registry.data_source(id)?;
        match self.filter {
            DataSourceFilter::Granted if !grants.is_accessible(&ds) => None,
            _ => Some(ds),
        }
    }

    /// Disposes the project if the session owns it. Returns `true` if this
    /// call disposed it; platform-owned projects are left alone.
    pub fn dispose(&self) -> bool {
        if self.record.ownership != ProjectOwnership::Session {
            tracing::debug!(project_id = %self.record.id, "platform project not disposed");
            return false;
        }
        let first = !self.disposed.swap(true, Ordering::AcqRel);
        if first {
            tracing::debug!(project_id = %self.record.id, "project disposed");
        }
        first
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// The client view of this project. Resource-manager admins may do
    /// everything regardless of project permissions.
    pub fn info(&self, rm_admin: bool) -> ProjectInfo {
        let has = |p| rm_admin || self.has_permission(p);
        ProjectInfo {
            id: self.record.id.clone(),
            name: self.record.name.clone(),
            kind: self.record.kind,
            shared: self.is_shared(),
            global: self.record.kind == ProjectKind::Global,
            in_memory: self.in_memory,
            can_edit_data_sources: has(ProjectPermission::DataSourcesEdit),
            can_view_data_sources: has(ProjectPermission::DataSourcesView),
            can_edit_resources: has(ProjectPermission::ResourceEdit),
            can_view_resources: has(ProjectPermission::ResourceView),
        }
    }
}

/// Serializable snapshot of a project for the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectInfo {
    pub id: ProjectId,
    pub name: String,
    pub kind: ProjectKind,
    pub shared: bool,
    pub global: bool,
    pub in_memory: bool,
    pub can_edit_data_sources: bool,
    pub can_view_data_sources: bool,
    pub can_edit_resources: bool,
    pub can_view_resources: bool,
}

// ---------------------------------------------------------------------------
// ProjectSet
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ProjectSetInner {
    projects: Vec<Arc<Project>>,
    default: Option<ProjectId>,
}

/// The session's accessible projects and its default project.
///
/// Removed projects are handed back to the caller so they can be disposed
/// after the lock is released.
#[derive(Default)]
pub struct ProjectSet {
    inner: RwLock<ProjectSetInner>,
}

impl ProjectSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a freshly loaded set. Returns the previous projects.
    pub fn replace(&self, projects: Vec<Arc<Project>>, default: Option<ProjectId>) -> Vec<Arc<Project>> {
        let mut inner = self.inner.write();
        let default = default.filter(|id| projects.iter().any(|p| p.id() == id));
        inner.default = default;
        std::mem::replace(&mut inner.projects, projects)
    }

    /// Empties the set and returns everything it held.
    pub fn take_all(&self) -> Vec<Arc<Project>> {
        let mut inner = self.inner.write();
        inner.default = None;
        std::mem::take(&mut inner.projects)
    }

    /// Adds a project, replacing one with the same id. Becomes the default
    /// if there is none and the project is not shared.
    pub fn add(&self, project: Arc<Project>) -> Option<Arc<Project>> {
        let mut inner = self.inner.write();
        if inner.default.is_none() && !project.is_shared() {
            inner.default = Some(project.id().clone());
        }
        match inner.projects.iter().position(|p| p.id() == project.id()) {
            Some(idx) => Some(std::mem::replace(&mut inner.projects[idx], project)),
            None => {
                inner.projects.push(project);
                None
            }
        }
    }

    /// Removes a project. If it was the default, the first remaining
    /// non-shared project becomes the default.
    pub fn remove(&self, id: &ProjectId) -> Option<Arc<Project>> {
        let mut inner = self.inner.write();
        let idx = inner.projects.iter().position(|p| p.id() == id)?;
        let removed = inner.projects.remove(idx);
        if inner.default.as_ref() == Some(id) {
            inner.default = inner
                .projects
                .iter()
                .find(|p| !p.is_shared())
                .map(|p| p.id().clone());
        }
        Some(removed)
    }

    /// Looks a project up by id; `None` means the default project.
    pub fn get(&self, id: Option<&ProjectId>) -> Option<Arc<Project>> {
        let inner = self.inner.read();
        let id = id.or(inner.default.as_ref())?;
        inner.projects.iter().find(|p| p.id() == id).cloned()
    }

    pub fn default_project(&self) -> Option<Arc<Project>> {
        self.get(None)
    }

    pub fn projects(&self) -> Vec<Arc<Project>> {
        self.inner.read().projects.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().projects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().projects.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, kind: ProjectKind) -> ProjectRecord {
        ProjectRecord::new(id, id, kind, Arc::new(InMemoryRegistry::new()))
    }

    fn project(id: &str, kind: ProjectKind) -> Arc<Project> {
        Arc::new(Project::new(record(id, kind)))
    }

    #[test]
    fn test_project_without_edit_permission_is_in_memory() {
        let read_only = Project::new(record("p", ProjectKind::User));
        let editable = Project::new(
            record("q", ProjectKind::User).with_permissions([ProjectPermission::DataSourcesEdit]),
        );

        assert!(read_only.is_in_memory());
        assert!(!editable.is_in_memory());
    }

    #[test]
    fn test_visible_data_sources_global_filters_by_grants() {
        let registry = Arc::new(InMemoryRegistry::with_sources([
            DataSource::new("a", "a", "g", "pg"),
            DataSource::new("b", "b", "g", "pg"),
        ]));
        let global = Project::new(ProjectRecord::new("g", "g", ProjectKind::Global, registry.clone()));
        let user = Project::new(ProjectRecord::new("u", "u", ProjectKind::User, registry));
        let grants = AccessGrants::new(["a".into()]);

        assert_eq!(global.visible_data_sources(&grants).len(), 1);
        assert!(global.data_source(&"b".into(), &grants).is_none());
        assert_eq!(user.visible_data_sources(&grants).len(), 2);
        assert!(user.data_source(&"b".into(), &grants).is_some());
    }

    #[test]
    fn test_dispose_session_owned_once() {
        let p = Project::new(record("p", ProjectKind::User));

        assert!(p.dispose());
        assert!(!p.dispose());
        assert!(p.is_disposed());
    }

    #[test]
    fn test_dispose_platform_owned_is_noop() {
        let p = Project::new(record("p", ProjectKind::Global).with_ownership(ProjectOwnership::Platform));

        assert!(!p.dispose());
        assert!(!p.is_disposed());
    }

    #[test]
    fn test_info_rm_admin_gets_everything() {
        let p = Project::new(record("p", ProjectKind::Shared));

        let plain = p.info(false);
        let admin = p.info(true);

        assert!(plain.shared);
        assert!(!plain.can_edit_data_sources);
        assert!(admin.can_edit_data_sources && admin.can_view_resources);
    }

    #[test]
    fn test_info_serializes_camel_case() {
        let json = serde_json::to_value(Project::new(record("p", ProjectKind::Global)).info(false)).unwrap();

        assert_eq!(json["global"], true);
        assert_eq!(json["canEditDataSources"], false);
        assert_eq!(json["kind"], "global");
    }

    #[test]
    fn test_project_set_get_none_returns_default() {
        let set = ProjectSet::new();
        set.replace(
            vec![project("g", ProjectKind::Global), project("u", ProjectKind::User)],
            Some("u".into()),
        );

        assert_eq!(set.default_project().map(|p| p.id().clone()), Some("u".into()));
        assert_eq!(set.get(Some(&"g".into())).map(|p| p.id().clone()), Some("g".into()));
        assert!(set.get(Some(&"missing".into())).is_none());
    }

    #[test]
    fn test_project_set_replace_drops_unknown_default() {
        let set = ProjectSet::new();

        set.replace(vec![project("u", ProjectKind::User)], Some("other".into()));

        assert!(set.default_project().is_none());
    }

    #[test]
    fn test_project_set_remove_default_repicks_non_shared() {
        let set = ProjectSet::new();
        set.replace(
            vec![
                project("u1", ProjectKind::User),
                project("s", ProjectKind::Shared),
                project("u2", ProjectKind::User),
            ],
            Some("u1".into()),
        );

        let removed = set.remove(&"u1".into());

        assert!(removed.is_some());
        assert_eq!(set.default_project().map(|p| p.id().clone()), Some("u2".into()));
    }

    #[test]
    fn test_project_set_add_sets_default_when_missing() {
        let set = ProjectSet::new();

        set.add(project("s", ProjectKind::Shared));
        assert!(set.default_project().is_none());
        set.add(project("u", ProjectKind::User));

        assert_eq!(set.default_project().map(|p| p.id().clone()), Some("u".into()));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_project_set_take_all_empties() {
        let set = ProjectSet::new();
        set.replace(vec![project("u", ProjectKind::User)], Some("u".into()));

        let taken = set.take_all();

        assert_eq!(taken.len(), 1);
        assert!(set.is_empty());
        assert!(set.default_project().is_none());
    }
}
