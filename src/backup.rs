//! Database backups
//!
//! Backups live in date directories under the configured root:
//!
//! ```text
//! /var/backups/trafic/
//!   2024-05-01/
//!     shop.sql.gz
//!     blog.sql.gz
//!     agent-db.sqlite
//!     config.toml
//! ```
//!
//! [`BackupScheduler`] runs a full backup once a day after the configured hour
//! and then prunes date directories past the retention window.

use crate::config::Config;
use crate::context::AppContext;
use crate::control::ProjectControl;
use crate::db::{ProjectStatus, Registry};
use crate::projects::ProjectDirectory;
use chrono::{Days, Local, NaiveDate, NaiveDateTime, Timelike};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// How often the scheduler checks whether a backup is due
const CHECK_INTERVAL: Duration = Duration::from_secs(30 * 60);

const DATE_FORMAT: &str = "%Y-%m-%d";
const DUMP_EXTENSION: &str = ".sql.gz";
const AGENT_DB_FILE: &str = "agent-db.sqlite";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupOutcome {
    Succeeded(PathBuf),
    Skipped(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupResult {
    pub project: String,
    pub outcome: BackupOutcome,
}

impl BackupResult {
    fn new(project: &str, outcome: BackupOutcome) -> Self {
        Self {
            project: project.to_string(),
            outcome,
        }
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, BackupOutcome::Succeeded(_))
    }
}

/// One file in the backup tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupEntry {
    /// Project name, or `agent-db` / `config` for agent data
    pub project: String,
    pub date: String,
    pub path: PathBuf,
    pub size_bytes: u64,
}

pub struct BackupManager {
    config: Arc<Config>,
    registry: Arc<Registry>,
    control: Arc<dyn ProjectControl>,
    projects: Arc<ProjectDirectory>,
    root: PathBuf,
}

impl BackupManager {
    pub fn new(ctx: &AppContext) -> Self {
        Self {
            config: ctx.config.clone(),
            registry: ctx.registry.clone(),
            control: ctx.control.clone(),
            projects: ctx.projects.clone(),
            root: PathBuf::from(&ctx.config.backup.local_dir),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn date_dir(&self, date: NaiveDate) -> std::io::Result<PathBuf> {
        let dir = self.root.join(date.format(DATE_FORMAT).to_string());
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Export one project's database into today's directory.
    ///
    /// Stopped projects are skipped unless `force_start` is set, in which case
    /// they are started first.
    pub async fn backup_project(&self, name: &str, force_start: bool) -> BackupResult {
        self.backup_project_on(name, force_start, today()).await
    }

    async fn backup_project_on(&self, name: &str, force_start: bool, date: NaiveDate) -> BackupResult {
        let index = self.projects.snapshot();
        let Some(project_dir) = index.project_dir(name) else {
            return BackupResult::new(name, BackupOutcome::Failed("project not found".to_string()));
        };

        if !self.control.is_running(name).await {
            if !force_start {
                debug!(project = name, "Project not running, backup skipped");
                return BackupResult::new(name, BackupOutcome::Skipped("project is not running".to_string()));
            }

            info!(project = name, "Starting project for backup");
            if let Err(reason) = self.start_guarded(name).await {
                return BackupResult::new(name, BackupOutcome::Failed(reason));
            }
        }

        let dir = match self.date_dir(date) {
            Ok(dir) => dir,
            Err(e) => {
                return BackupResult::new(
                    name,
                    BackupOutcome::Failed(format!("cannot create backup directory: {}", e)),
                )
            }
        };

        let output = dir.join(format!("{}{}", name, DUMP_EXTENSION));
        match self.control.export_db(name, project_dir, &output).await {
            Ok(()) => {
                info!(project = name, file = %output.display(), "Backup written");
                BackupResult::new(name, BackupOutcome::Succeeded(output))
            }
            Err(e) => BackupResult::new(name, BackupOutcome::Failed(e.to_string())),
        }
    }

    /// Back up every running project, then the registry and the config file
    pub async fn backup_all(&self) -> Vec<BackupResult> {
        self.backup_all_on(today()).await
    }

    async fn backup_all_on(&self, date: NaiveDate) -> Vec<BackupResult> {
        let index = self.projects.snapshot();
        let mut results = Vec::with_capacity(index.len());

        info!(projects = index.len(), root = %self.root.display(), "Backing up projects");

        for (name, _) in index.projects() {
            results.push(self.backup_project_on(name, false, date).await);
        }

        match self.date_dir(date) {
            Ok(dir) => self.backup_agent_data(&dir),
            Err(e) => error!(error = %e, "Cannot create backup directory for agent data"),
        }

        let succeeded = results.iter().filter(|r| r.succeeded()).count();
        let skipped = results
            .iter()
            .filter(|r| matches!(r.outcome, BackupOutcome::Skipped(_)))
            .count();
        let failed = results.len() - succeeded - skipped;
        info!(succeeded, skipped, failed, "Backup complete");

        for result in &results {
            if let BackupOutcome::Failed(reason) = &result.outcome {
                warn!(project = %result.project, reason = %reason, "Backup failed");
            }
        }

        results
    }

    fn backup_agent_data(&self, dir: &Path) {
        let db_dest = dir.join(AGENT_DB_FILE);
        match self.registry.snapshot_to(&db_dest) {
            Ok(()) => debug!(file = %db_dest.display(), "Registry archived"),
            Err(e) => error!(error = %e, "Failed to archive registry"),
        }

        if let Some(source) = &self.config.source_path {
            let config_dest = dir.join(CONFIG_FILE);
            match std::fs::copy(source, &config_dest) {
                Ok(_) => debug!(file = %config_dest.display(), "Config archived"),
                Err(e) => error!(path = %source.display(), error = %e, "Failed to archive config"),
            }
        }
    }

    /// Every backup file, newest date first, then by name
    pub fn list_backups(&self) -> std::io::Result<Vec<BackupEntry>> {
        let mut entries = Vec::new();

        for (date, dir) in self.date_dirs()?.into_iter().rev() {
            let mut files = Vec::new();
            for item in std::fs::read_dir(&dir)? {
                let item = item?;
                let file_name = item.file_name().to_string_lossy().into_owned();
                let Some(project) = backup_project_name(&file_name) else {
                    continue;
                };
                let metadata = item.metadata()?;
                if !metadata.is_file() {
                    continue;
                }
                files.push(BackupEntry {
                    project: project.to_string(),
                    date: date.format(DATE_FORMAT).to_string(),
                    path: item.path(),
                    size_bytes: metadata.len(),
                });
            }
            files.sort_by(|a, b| a.project.cmp(&b.project));
            entries.extend(files);
        }

        Ok(entries)
    }

    /// Remove date directories older than `retain_days` before today
    pub fn clean_old_backups(&self, retain_days: u32) -> std::io::Result<usize> {
        self.clean_old_backups_at(retain_days, today())
    }

    pub fn clean_old_backups_at(&self, retain_days: u32, today: NaiveDate) -> std::io::Result<usize> {
        let Some(cutoff) = today.checked_sub_days(Days::new(u64::from(retain_days))) else {
            return Ok(0);
        };

        let mut removed = 0;
        for (date, dir) in self.date_dirs()? {
            if date < cutoff {
                std::fs::remove_dir_all(&dir)?;
                info!(date = %date, "Removed old backup");
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Import a dump into a project, starting it first if needed
    pub async fn restore_project(&self, name: &str, file: &Path) -> bool {
        let index = self.projects.snapshot();
        let Some(project_dir) = index.project_dir(name) else {
            error!(project = name, "Cannot restore unknown project");
            return false;
        };

        if !self.control.is_running(name).await {
            info!(project = name, "Starting project for restore");
            if let Err(reason) = self.start_guarded(name).await {
                error!(project = name, reason = %reason, "Cannot start project for restore");
                return false;
            }
        }

        match self.control.import_db(name, project_dir, file).await {
            Ok(()) => {
                info!(project = name, file = %file.display(), "Project restored");
                true
            }
            Err(e) => {
                error!(project = name, error = %e, "Restore failed");
                false
            }
        }
    }

    /// Start a project through the same `starting` transition a wake uses,
    /// so a visitor's wake and a backup never both start it.
    async fn start_guarded(&self, name: &str) -> Result<(), String> {
        match self.registry.begin_starting(name) {
            Ok(true) => {}
            Ok(false) => return Err("project is already starting".to_string()),
            Err(e) => return Err(format!("registry error: {}", e)),
        }

        let (status, result) = match self.control.start(name).await {
            Ok(()) => (ProjectStatus::Running, Ok(())),
            Err(e) => (ProjectStatus::Stopped, Err(format!("failed to start: {}", e))),
        };
        if let Err(e) = self.registry.set_status(name, status) {
            warn!(project = name, error = %e, "Failed to record start result");
        }
        result
    }

    /// Dump for a project on `date` (YYYY-MM-DD), or the most recent one
    pub fn find_backup(&self, name: &str, date: Option<&str>) -> Option<PathBuf> {
        let file_name = format!("{}{}", name, DUMP_EXTENSION);

        if let Some(date) = date {
            if parse_date_dir(date).is_none() {
                warn!(date, "Backup date must be YYYY-MM-DD");
                return None;
            }
            let path = self.root.join(date).join(&file_name);
            return path.is_file().then_some(path);
        }

        let dirs = match self.date_dirs() {
            Ok(dirs) => dirs,
            Err(e) => {
                warn!(root = %self.root.display(), error = %e, "Cannot read backup directory");
                return None;
            }
        };

        dirs.into_iter()
            .rev()
            .map(|(_, dir)| dir.join(&file_name))
            .find(|path| path.is_file())
    }

    /// Date directories in ascending date order
    fn date_dirs(&self) -> std::io::Result<Vec<(NaiveDate, PathBuf)>> {
        let read = match std::fs::read_dir(&self.root) {
            Ok(read) => read,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut dirs = Vec::new();
        for item in read {
            let item = item?;
            let name = item.file_name().to_string_lossy().into_owned();
            let Some(date) = parse_date_dir(&name) else {
                continue;
            };
            if item.file_type()?.is_dir() {
                dirs.push((date, item.path()));
            }
        }
        dirs.sort();
        Ok(dirs)
    }
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

fn parse_date_dir(name: &str) -> Option<NaiveDate> {
    if name.len() != 10 {
        return None;
    }
    NaiveDate::parse_from_str(name, DATE_FORMAT).ok()
}

fn backup_project_name(file_name: &str) -> Option<&str> {
    [DUMP_EXTENSION, ".sqlite", ".toml"]
        .iter()
        .find_map(|ext| file_name.strip_suffix(ext))
        .filter(|name| !name.is_empty())
}

/// Runs the daily backup once the local clock passes the scheduled hour
pub struct BackupScheduler {
    manager: Arc<BackupManager>,
    schedule_hour: u32,
    retain_days: u32,
    last_run: Option<NaiveDate>,
}

impl BackupScheduler {
    pub fn new(manager: Arc<BackupManager>, config: &Config) -> Self {
        Self {
            manager,
            schedule_hour: config.backup.schedule_hour,
            retain_days: config.backup.retain_days,
            last_run: None,
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            hour = self.schedule_hour,
            retain_days = self.retain_days,
            dir = %self.manager.root().display(),
            "Backup scheduler started"
        );

        let mut interval = tokio::time::interval(CHECK_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.check_at(Local::now().naive_local()).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("Backup scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Run the daily backup if it is due at `now`. Returns whether it ran.
    pub async fn check_at(&mut self, now: NaiveDateTime) -> bool {
        let date = now.date();
        if now.hour() < self.schedule_hour || self.last_run == Some(date) {
            return false;
        }
        self.last_run = Some(date);

        info!("Starting scheduled backup");
        self.manager.backup_all_on(date).await;

        match self.manager.clean_old_backups_at(self.retain_days, date) {
            Ok(removed) if removed > 0 => info!(removed, "Old backups cleaned"),
            Ok(_) => {}
            Err(e) => error!(error = %e, "Failed to clean old backups"),
        }
        true
    }
}
