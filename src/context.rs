use crate::auth::AuthPolicy;
use crate::config::Config;
use crate::control::ProjectControl;
use crate::db::Registry;
use crate::projects::ProjectDirectory;
use crate::templates::Templates;
use std::path::Path;
use std::sync::Arc;

/// Shared dependencies, built once at startup and handed to every component
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    /// Global policy derived from `config.auth`
    pub auth_policy: Arc<AuthPolicy>,
    pub registry: Arc<Registry>,
    pub control: Arc<dyn ProjectControl>,
    pub projects: Arc<ProjectDirectory>,
    pub templates: Arc<Templates>,
}

impl AppContext {
    pub fn new(
        config: Config,
        registry: Arc<Registry>,
        control: Arc<dyn ProjectControl>,
        projects: Arc<ProjectDirectory>,
    ) -> Self {
        let templates = Templates::load(config.templates_dir.as_deref().map(Path::new));
        let auth_policy = config.auth_policy();

        Self {
            config: Arc::new(config),
            auth_policy: Arc::new(auth_policy),
            registry,
            control,
            projects,
            templates: Arc::new(templates),
        }
    }
}
