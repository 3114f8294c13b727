//! Control adapter for the external project tool
//!
//! Everything the agent does to a project (start, stop, inspect, dump and
//! restore its database) goes through [`ProjectControl`]. The production
//! implementation shells out to `ddev`; tests substitute an in-process fake.

use crate::config::ControlConfig;
use crate::error::ControlError;
use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Project state as reported by the project tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExternalStatus {
    Running,
    Stopped,
    Paused,
    Unhealthy,
    Unknown,
}

impl ExternalStatus {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "running" => ExternalStatus::Running,
            "stopped" | "exited" => ExternalStatus::Stopped,
            "paused" => ExternalStatus::Paused,
            "unhealthy" => ExternalStatus::Unhealthy,
            _ => ExternalStatus::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExternalStatus::Running => "running",
            ExternalStatus::Stopped => "stopped",
            ExternalStatus::Paused => "paused",
            ExternalStatus::Unhealthy => "unhealthy",
            ExternalStatus::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectInfo {
    pub name: String,
    pub status: ExternalStatus,
    pub app_root: Option<PathBuf>,
}

/// Operations on projects managed by the project tool
#[async_trait]
pub trait ProjectControl: Send + Sync {
    async fn start(&self, name: &str) -> Result<(), ControlError>;

    async fn stop(&self, name: &str) -> Result<(), ControlError>;

    /// `Ok(None)` when the tool does not know the project
    async fn describe(&self, name: &str) -> Result<Option<ProjectInfo>, ControlError>;

    /// Dump the project database, gzipped, to `output`
    async fn export_db(&self, name: &str, project_dir: &Path, output: &Path) -> Result<(), ControlError>;

    /// Load a database dump into the project
    async fn import_db(&self, name: &str, project_dir: &Path, input: &Path) -> Result<(), ControlError>;

    /// Whether the tool reports the project as running. Errors count as not running.
    async fn is_running(&self, name: &str) -> bool {
        match self.describe(name).await {
            Ok(Some(info)) => info.status == ExternalStatus::Running,
            Ok(None) => false,
            Err(e) => {
                debug!(project = name, error = %e, "Describe failed");
                false
            }
        }
    }
}

/// [`ProjectControl`] backed by the `ddev` command line
pub struct DdevControl {
    config: ControlConfig,
}

impl DdevControl {
    pub fn new(config: ControlConfig) -> Self {
        Self { config }
    }

    /// Run the tool with a deadline. The child is killed if the deadline passes.
    async fn run(&self, args: &[&str], cwd: Option<&Path>, timeout: Duration) -> Result<String, ControlError> {
        let command = format!("{} {}", self.config.binary, args.join(" "));

        let mut cmd = Command::new(&self.config.binary);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        debug!(command = %command, "Running project tool");

        let child = cmd.spawn().map_err(|source| ControlError::Spawn {
            command: command.clone(),
            source,
        })?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|source| ControlError::Spawn {
                command: command.clone(),
                source,
            })?,
            Err(_) => {
                warn!(command = %command, timeout_secs = timeout.as_secs(), "Project tool timed out, killed");
                return Err(ControlError::Timeout { command, timeout });
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(
                command = %command,
                code = ?output.status.code(),
                stderr = %stderr,
                "Project tool failed"
            );
            return Err(ControlError::Failed {
                command,
                code: output.status.code(),
                stderr,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ProjectControl for DdevControl {
    async fn start(&self, name: &str) -> Result<(), ControlError> {
        info!(project = name, "Starting project");
        self.run(&["start", name], None, self.config.start_timeout()).await?;
        info!(project = name, "Project started");
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<(), ControlError> {
        info!(project = name, "Stopping project");
        self.run(&["stop", name], None, self.config.stop_timeout()).await?;
        info!(project = name, "Project stopped");
        Ok(())
    }

    async fn describe(&self, name: &str) -> Result<Option<ProjectInfo>, ControlError> {
        let stdout = self
            .run(&["describe", name, "-j"], None, self.config.describe_timeout())
            .await?;

        parse_describe_output(name, &stdout).map_err(|message| ControlError::Output {
            command: format!("{} describe {} -j", self.config.binary, name),
            message,
        })
    }

    async fn export_db(&self, name: &str, project_dir: &Path, output: &Path) -> Result<(), ControlError> {
        let file_arg = format!("--file={}", output.display());
        info!(project = name, file = %output.display(), "Exporting database");
        self.run(
            &["export-db", "--gzip", &file_arg],
            Some(project_dir),
            self.config.export_timeout(),
        )
        .await?;
        Ok(())
    }

    async fn import_db(&self, name: &str, project_dir: &Path, input: &Path) -> Result<(), ControlError> {
        let file_arg = format!("--file={}", input.display());
        info!(project = name, file = %input.display(), "Importing database");
        self.run(&["import-db", &file_arg], Some(project_dir), self.config.import_timeout())
            .await?;
        Ok(())
    }
}

/// Parse `ddev describe -j` output.
///
/// The tool prints one JSON log object per line; the project lives under `raw`
/// in one of them.
pub fn parse_describe_output(name: &str, stdout: &str) -> Result<Option<ProjectInfo>, String> {
    let whole = serde_json::from_str::<serde_json::Value>(stdout.trim());
    let documents: Vec<serde_json::Value> = match whole {
        Ok(value) => vec![value],
        Err(_) => stdout
            .lines()
            .filter_map(|line| serde_json::from_str(line.trim()).ok())
            .collect(),
    };

    if documents.is_empty() {
        return Err("no JSON in output".to_string());
    }

    let Some(raw) = documents.iter().rev().find_map(|doc| doc.get("raw")) else {
        return Ok(None);
    };

    let status = raw
        .get("status")
        .and_then(|s| s.as_str())
        .map(ExternalStatus::parse)
        .unwrap_or(ExternalStatus::Unknown);

    Ok(Some(ProjectInfo {
        name: raw
            .get("name")
            .and_then(|n| n.as_str())
            .unwrap_or(name)
            .to_string(),
        status,
        app_root: raw
            .get("approot")
            .and_then(|r| r.as_str())
            .map(PathBuf::from),
    }))
}
