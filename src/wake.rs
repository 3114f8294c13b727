//! Wake-on-demand
//!
//! The reverse proxy sends requests here when a project's upstream is down.
//! The first such request flips the project to `starting` and launches the
//! project tool in the background; every request gets the waiting page
//! straight away.

use crate::context::AppContext;
use crate::control::ProjectControl;
use crate::db::{ProjectStatus, Registry};
use crate::error::RegistryError;
use crate::projects::ProjectDirectory;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WakeOutcome {
    /// No project serves the hostname
    UnknownProject,
    /// Another request already started the project
    AlreadyStarting { project: String },
    /// This request started the project
    StartIssued { project: String },
}

pub struct WakeHandler {
    registry: Arc<Registry>,
    control: Arc<dyn ProjectControl>,
    projects: Arc<ProjectDirectory>,
}

impl WakeHandler {
    pub fn new(ctx: &AppContext) -> Self {
        Self {
            registry: ctx.registry.clone(),
            control: ctx.control.clone(),
            projects: ctx.projects.clone(),
        }
    }

    /// Resolve the hostname and start its project unless a start is already
    /// in flight. Never waits for the start to finish.
    pub fn handle(&self, hostname: &str) -> Result<WakeOutcome, RegistryError> {
        let index = self.projects.snapshot();
        let Some(project) = index.project_for_host(hostname) else {
            debug!(hostname, "Wake request for unknown host");
            return Ok(WakeOutcome::UnknownProject);
        };
        let project = project.to_string();

        if !self.registry.begin_starting(&project)? {
            debug!(project = %project, "Project already starting");
            return Ok(WakeOutcome::AlreadyStarting { project });
        }

        info!(project = %project, hostname, "Waking project");
        self.spawn_start(project.clone());

        Ok(WakeOutcome::StartIssued { project })
    }

    fn spawn_start(&self, project: String) -> JoinHandle<()> {
        let registry = self.registry.clone();
        let control = self.control.clone();

        tokio::spawn(async move {
            let status = match control.start(&project).await {
                Ok(()) => ProjectStatus::Running,
                Err(e) => {
                    error!(project = %project, error = %e, "Failed to start project");
                    ProjectStatus::Stopped
                }
            };

            if let Err(e) = registry.set_status(&project, status) {
                error!(project = %project, error = %e, "Failed to record start result");
            }
        })
    }
}
