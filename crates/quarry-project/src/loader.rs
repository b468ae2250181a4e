use std::sync::Arc;

use quarry_model::{MessageLog, ProjectId, UserId};
use tracing::{error, info};

use crate::{Project, ProjectRecord, ResourceManager};

/// The result of one project load.
#[derive(Debug, Default)]
pub struct LoadedProjects {
    pub projects: Vec<Arc<Project>>,
    pub default: Option<ProjectId>,
}

/// Loads the projects `user` may see and picks the default one.
///
/// The default is the first non-shared project (the first project of any
/// kind in configuration mode). An unauthenticated session also gets the
/// anonymous project, which then becomes the default.
///
/// Loading is best effort: a resource-manager failure is recorded in
/// `log` and the anonymous project (if any) is still returned.
pub async fn load_projects(
    resources: &dyn ResourceManager,
    user: Option<&UserId>,
    configuration_mode: bool,
    log: &MessageLog,
) -> LoadedProjects {
    let mut records = match resources.list_accessible_projects(user).await {
        Ok(records) => records,
        Err(err) => {
            error!(error = %err, "error getting accessible projects list");
            log.push_error(&err);
            Vec::new()
        }
    };
    if user.is_none() {
        records.push(ProjectRecord::anonymous());
    }

    let projects: Vec<Arc<Project>> = records.into_iter().map(|r| Arc::new(Project::new(r))).collect();
    let default = if user.is_none() {
        projects.last()
    } else if configuration_mode {
        projects.first()
    } else {
        projects.iter().find(|p| !p.is_shared())
    }
    .map(|p| p.id().clone());

    info!(
        user = user.map(UserId::as_str),
        projects = projects.len(),
        default = default.as_ref().map(ProjectId::as_str),
        "projects loaded"
    );
    LoadedProjects { projects, default }
}
