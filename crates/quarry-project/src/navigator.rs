use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use quarry_model::ProjectId;

use crate::Project;

/// The session's navigator view: which projects the client's tree shows.
///
/// Only the project roots are tracked here; the tree itself is built by
/// the navigator service on demand. A view is rebuilt from scratch when
/// the user changes and is disposed exactly once.
#[derive(Debug, Default)]
pub struct NavigatorModel {
    roots: RwLock<Vec<ProjectId>>,
    disposed: AtomicBool,
}

impl NavigatorModel {
    pub fn new(projects: &[Arc<Project>]) -> Self {
        Self {
            roots: RwLock::new(projects.iter().map(|p| p.id().clone()).collect()),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn project_ids(&self) -> Vec<ProjectId> {
        self.roots.read().clone()
    }

    pub fn add_project(&self, id: ProjectId) {
        let mut roots = self.roots.write();
        if !roots.contains(&id) {
            roots.push(id);
        }
    }

    pub fn remove_project(&self, id: &ProjectId) {
        self.roots.write().retain(|p| p != id);
    }

    /// Releases the view. Returns `true` on the first call only.
    pub fn dispose(&self) -> bool {
        let first = !self.disposed.swap(true, Ordering::AcqRel);
        if first {
            self.roots.write().clear();
        }
        first
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InMemoryRegistry, ProjectKind, ProjectRecord};

    #[test]
    fn test_navigator_tracks_roots_and_disposes_once() {
        let project = Arc::new(Project::new(ProjectRecord::new(
            "u",
            "u",
            ProjectKind::User,
            Arc::new(InMemoryRegistry::new()),
        )));
        let nav = NavigatorModel::new(&[project]);
        nav.add_project("g".into());
        nav.add_project("g".into());

        assert_eq!(nav.project_ids(), vec![ProjectId::from("u"), ProjectId::from("g")]);

        nav.remove_project(&"u".into());
        assert_eq!(nav.project_ids().len(), 1);

        assert!(nav.dispose());
        assert!(!nav.dispose());
        assert!(nav.is_disposed());
        assert!(nav.project_ids().is_empty());
    }
}
