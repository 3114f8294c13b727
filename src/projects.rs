//! Known projects, their hostnames and per-project overrides
//!
//! The project tool keeps a YAML list of projects (`name → app root`). Each
//! project may carry `.ddev/config.trafic.yaml` overriding the auth policy or
//! the idle timeout. [`ProjectDirectory`] holds an immutable [`ProjectIndex`]
//! built from both and swaps it wholesale whenever the list changes.

use crate::auth::PolicyKind;
use crate::config::parse_duration;
use crate::error::ProjectListError;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Override file, relative to a project's app root
pub const OVERRIDES_FILE: &str = ".ddev/config.trafic.yaml";

/// Quiet period after a file event before reloading
const RELOAD_DEBOUNCE: Duration = Duration::from_millis(200);

/// Per-project idle timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleTimeout {
    /// Never stop the project for inactivity
    Never,
    After(Duration),
}

/// Settings a project may override. Each field is independent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectOverrides {
    pub auth_policy: Option<PolicyKind>,
    pub idle_timeout: Option<IdleTimeout>,
}

impl ProjectOverrides {
    pub fn is_empty(&self) -> bool {
        self.auth_policy.is_none() && self.idle_timeout.is_none()
    }

    pub fn never_stop(&self) -> bool {
        self.idle_timeout == Some(IdleTimeout::Never)
    }

    /// Idle timeout to apply, `None` meaning never
    pub fn effective_idle_timeout(&self, global: Duration) -> Option<Duration> {
        match self.idle_timeout {
            Some(IdleTimeout::Never) => None,
            Some(IdleTimeout::After(d)) => Some(d),
            None => Some(global),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawOverrides {
    auth_policy: Option<String>,
    idle_timeout: Option<serde_yaml::Value>,
}

/// Load `<project_dir>/.ddev/config.trafic.yaml`.
///
/// A missing file means no overrides. Unreadable files and invalid values are
/// logged and ignored.
pub fn load_project_overrides(project_dir: &Path) -> ProjectOverrides {
    let path = project_dir.join(OVERRIDES_FILE);

    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return ProjectOverrides::default(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read project overrides");
            return ProjectOverrides::default();
        }
    };

    if content.trim().is_empty() {
        return ProjectOverrides::default();
    }

    let raw: RawOverrides = match serde_yaml::from_str(&content) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Ignoring malformed project overrides");
            return ProjectOverrides::default();
        }
    };

    let auth_policy = raw.auth_policy.and_then(|policy| match policy.parse::<PolicyKind>() {
        Ok(kind) => Some(kind),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Ignoring auth_policy override");
            None
        }
    });

    let idle_timeout = raw.idle_timeout.and_then(|value| {
        let parsed = parse_idle_timeout(&value);
        if parsed.is_none() {
            warn!(path = %path.display(), value = ?value, "Ignoring idle_timeout override");
        }
        parsed
    });

    ProjectOverrides {
        auth_policy,
        idle_timeout,
    }
}

fn parse_idle_timeout(value: &serde_yaml::Value) -> Option<IdleTimeout> {
    let duration = match value {
        serde_yaml::Value::String(s) if s.trim().eq_ignore_ascii_case("never") => {
            return Some(IdleTimeout::Never);
        }
        serde_yaml::Value::String(s) => parse_duration(s).ok()?,
        serde_yaml::Value::Number(n) => Duration::from_secs(n.as_u64()?),
        _ => return None,
    };

    if duration.is_zero() {
        return None;
    }
    Some(IdleTimeout::After(duration))
}

/// Load the project list: a YAML map of project name to app root.
///
/// Values may be a plain path or a map with an `approot` key. A missing file
/// yields an empty list.
pub fn load_project_list(path: &Path) -> Result<BTreeMap<String, PathBuf>, ProjectListError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "Project list not found");
            return Ok(BTreeMap::new());
        }
        Err(source) => {
            return Err(ProjectListError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    if content.trim().is_empty() {
        return Ok(BTreeMap::new());
    }

    let parsed: serde_yaml::Mapping =
        serde_yaml::from_str(&content).map_err(|source| ProjectListError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

    let mut projects = BTreeMap::new();
    for (key, value) in parsed {
        let Some(name) = key.as_str() else {
            continue;
        };

        let app_root = match &value {
            serde_yaml::Value::String(root) => Some(root.as_str()),
            serde_yaml::Value::Mapping(map) => map.get("approot").and_then(|v| v.as_str()),
            _ => None,
        };

        match app_root {
            Some(root) if !root.trim().is_empty() => {
                projects.insert(name.to_string(), PathBuf::from(root.trim()));
            }
            _ => warn!(project = name, "Project list entry has no app root, skipping"),
        }
    }

    Ok(projects)
}

/// Immutable lookup tables built from one read of the project list
#[derive(Debug, Default)]
pub struct ProjectIndex {
    projects: BTreeMap<String, PathBuf>,
    hostnames: HashMap<String, String>,
    overrides: HashMap<String, ProjectOverrides>,
}

impl ProjectIndex {
    /// Build the index. `loader` reads the overrides for one app root.
    pub fn build<F>(projects: BTreeMap<String, PathBuf>, tld: &str, loader: F) -> Self
    where
        F: Fn(&Path) -> ProjectOverrides,
    {
        let tld = tld.trim().trim_start_matches('.');
        let mut hostnames = HashMap::with_capacity(projects.len());
        let mut overrides = HashMap::new();

        for (name, dir) in &projects {
            hostnames.insert(format!("{}.{}", name, tld).to_ascii_lowercase(), name.clone());

            let project_overrides = loader(dir);
            if !project_overrides.is_empty() {
                debug!(
                    project = %name,
                    auth = ?project_overrides.auth_policy,
                    idle = ?project_overrides.idle_timeout,
                    "Project overrides loaded"
                );
                overrides.insert(name.clone(), project_overrides);
            }
        }

        Self {
            projects,
            hostnames,
            overrides,
        }
    }

    /// Project serving a hostname (`<name>.<tld>`)
    pub fn project_for_host(&self, hostname: &str) -> Option<&str> {
        self.hostnames
            .get(&hostname.trim().to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.projects.contains_key(name)
    }

    pub fn project_dir(&self, name: &str) -> Option<&Path> {
        self.projects.get(name).map(PathBuf::as_path)
    }

    pub fn overrides(&self, name: &str) -> Option<&ProjectOverrides> {
        self.overrides.get(name)
    }

    /// Idle timeout for a project, `None` meaning never
    pub fn idle_timeout(&self, name: &str, global: Duration) -> Option<Duration> {
        match self.overrides.get(name) {
            Some(o) => o.effective_idle_timeout(global),
            None => Some(global),
        }
    }

    /// Smallest idle timeout any project overrides to
    pub fn shortest_idle_override(&self) -> Option<Duration> {
        self.overrides
            .values()
            .filter_map(|o| match o.idle_timeout {
                Some(IdleTimeout::After(d)) => Some(d),
                _ => None,
            })
            .min()
    }

    pub fn projects(&self) -> impl Iterator<Item = (&str, &Path)> {
        self.projects.iter().map(|(n, d)| (n.as_str(), d.as_path()))
    }

    pub fn len(&self) -> usize {
        self.projects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.projects.is_empty()
    }

    pub fn override_count(&self) -> usize {
        self.overrides.len()
    }
}

/// Shared, swappable project index
pub struct ProjectDirectory {
    list_path: PathBuf,
    tld: String,
    index: RwLock<Arc<ProjectIndex>>,
}

impl ProjectDirectory {
    pub fn new(list_path: impl Into<PathBuf>, tld: impl Into<String>) -> Self {
        Self {
            list_path: list_path.into(),
            tld: tld.into(),
            index: RwLock::new(Arc::new(ProjectIndex::default())),
        }
    }

    /// Directory with a fixed index, not backed by a list file
    pub fn with_index(index: ProjectIndex) -> Self {
        Self {
            list_path: PathBuf::new(),
            tld: String::new(),
            index: RwLock::new(Arc::new(index)),
        }
    }

    pub fn list_path(&self) -> &Path {
        &self.list_path
    }

    /// Current index. Readers keep a consistent view while a reload swaps it.
    pub fn snapshot(&self) -> Arc<ProjectIndex> {
        self.index.read().clone()
    }

    pub fn replace(&self, index: ProjectIndex) {
        *self.index.write() = Arc::new(index);
    }

    /// Re-read the project list and every project's overrides
    pub fn reload(&self) -> Result<usize, ProjectListError> {
        let projects = load_project_list(&self.list_path)?;
        let index = ProjectIndex::build(projects, &self.tld, load_project_overrides);
        let count = index.len();

        info!(
            projects = count,
            with_overrides = index.override_count(),
            "Project list loaded"
        );

        self.replace(index);
        Ok(count)
    }
}

/// File-system watch on the project list. Events arrive on `events`; the
/// watch stops when this value is dropped.
pub struct ProjectListWatcher {
    _watcher: RecommendedWatcher,
    pub events: mpsc::Receiver<()>,
}

/// Watch the project list's parent directory for changes to the list file
pub fn watch_project_list(path: &Path) -> Result<ProjectListWatcher, notify::Error> {
    let file_name = path.file_name().map(|n| n.to_os_string());
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };

    // Capacity 1: pending notifications coalesce into one reload
    let (tx, rx) = mpsc::channel(1);

    let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
        let Ok(event) = res else {
            return;
        };

        if !matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
        ) {
            return;
        }

        let touches_list = event
            .paths
            .iter()
            .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
        if touches_list {
            let _ = tx.try_send(());
        }
    })?;

    watcher.watch(&parent, RecursiveMode::NonRecursive)?;
    debug!(dir = %parent.display(), "Watching project list directory");

    Ok(ProjectListWatcher {
        _watcher: watcher,
        events: rx,
    })
}

async fn next_event(watcher: &mut Option<ProjectListWatcher>) -> Option<()> {
    match watcher {
        Some(w) => w.events.recv().await,
        None => std::future::pending().await,
    }
}

/// Single consumer of project list changes: file events and a fixed poll both
/// trigger a reload, one at a time, until shutdown.
pub async fn run_reload_loop(
    directory: Arc<ProjectDirectory>,
    mut watcher: Option<ProjectListWatcher>,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut poll = tokio::time::interval(poll_interval);
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately and the caller has already loaded
    poll.tick().await;

    loop {
        tokio::select! {
            Some(()) = next_event(&mut watcher) => {
                tokio::time::sleep(RELOAD_DEBOUNCE).await;
                if let Some(w) = watcher.as_mut() {
                    while w.events.try_recv().is_ok() {}
                }
                info!("Project list changed, reloading");
                if let Err(e) = directory.reload() {
                    warn!(error = %e, "Failed to reload project list, keeping previous");
                }
            }
            _ = poll.tick() => {
                if let Err(e) = directory.reload() {
                    warn!(error = %e, "Failed to reload project list, keeping previous");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!("Project reload loop shutting down");
                    break;
                }
            }
        }
    }
}
