//! Shared helpers for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use trafic_agent::config::Config;
use trafic_agent::context::AppContext;
use trafic_agent::control::{ExternalStatus, ProjectControl, ProjectInfo};
use trafic_agent::db::{ProjectStatus, Registry};
use trafic_agent::error::ControlError;
use trafic_agent::projects::ProjectDirectory;
use trafic_agent::server::FrontDoor;

pub const TLD: &str = "preview.test";

/// In-process project tool: tracks which projects are up
#[derive(Default)]
pub struct StubControl {
    running: Mutex<HashSet<String>>,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub start_delay: Duration,
    /// Simulates a bug in the describe path
    pub panic_on_describe: AtomicBool,
}

impl StubControl {
    pub fn with_start_delay(delay: Duration) -> Self {
        Self {
            start_delay: delay,
            ..Self::default()
        }
    }

    pub fn set_running(&self, name: &str) {
        self.running.lock().insert(name.to_string());
    }

    pub fn is_up(&self, name: &str) -> bool {
        self.running.lock().contains(name)
    }

    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProjectControl for StubControl {
    async fn start(&self, name: &str) -> Result<(), ControlError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }
        self.set_running(name);
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<(), ControlError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.running.lock().remove(name);
        Ok(())
    }

    async fn describe(&self, name: &str) -> Result<Option<ProjectInfo>, ControlError> {
        if self.panic_on_describe.load(Ordering::SeqCst) {
            panic!("describe blew up for {}", name);
        }
        let status = if self.is_up(name) {
            ExternalStatus::Running
        } else {
            ExternalStatus::Stopped
        };
        Ok(Some(ProjectInfo {
            name: name.to_string(),
            status,
            app_root: None,
        }))
    }

    async fn export_db(&self, name: &str, _project_dir: &Path, output: &Path) -> Result<(), ControlError> {
        std::fs::write(output, format!("dump of {}", name)).map_err(|source| ControlError::Spawn {
            command: "export-db".to_string(),
            source,
        })
    }

    async fn import_db(&self, _name: &str, _project_dir: &Path, _input: &Path) -> Result<(), ControlError> {
        Ok(())
    }
}

/// A project to place in the temporary project list
pub struct TestProject {
    pub name: &'static str,
    /// Contents of `.ddev/config.trafic.yaml`, if any
    pub overrides: Option<&'static str>,
}

pub fn project(name: &'static str) -> TestProject {
    TestProject { name, overrides: None }
}

pub fn project_with(name: &'static str, overrides: &'static str) -> TestProject {
    TestProject {
        name,
        overrides: Some(overrides),
    }
}

/// Temporary agent installation: config, project list, project dirs and registry
pub struct Fixture {
    pub dir: TempDir,
    pub ctx: AppContext,
    pub control: Arc<StubControl>,
}

impl Fixture {
    /// `extra` is appended to the generated config; top-level keys must come
    /// before any table.
    pub fn new(extra: &str, projects: &[TestProject], control: StubControl) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        let mut list = String::new();
        for entry in projects {
            let project_dir = root.join("projects").join(entry.name);
            std::fs::create_dir_all(project_dir.join(".ddev")).unwrap();
            if let Some(overrides) = entry.overrides {
                std::fs::write(project_dir.join(".ddev/config.trafic.yaml"), overrides).unwrap();
            }
            list.push_str(&format!("{}: {}\n", entry.name, project_dir.display()));
        }
        let list_path = root.join("project_list.yaml");
        std::fs::write(&list_path, list).unwrap();

        let config_toml = format!(
            "tld = \"{}\"\ndb_path = \"{}\"\nproject_list_path = \"{}\"\n{}\n",
            TLD,
            toml_path(&root.join("db.sqlite")),
            toml_path(&list_path),
            extra,
        );
        let mut config = Config::from_toml(&config_toml).unwrap();
        config.backup.local_dir = toml_path(&root.join("backups"));

        let registry = Arc::new(Registry::open(&config.db_path).unwrap());
        let projects = ProjectDirectory::new(&config.project_list_path, TLD);
        projects.reload().unwrap();

        let control = Arc::new(control);
        let ctx = AppContext::new(config, registry, control.clone(), Arc::new(projects));

        Self { dir, ctx, control }
    }

    pub fn status(&self, name: &str) -> Option<ProjectStatus> {
        self.ctx.registry.get_status(name).unwrap()
    }

    pub async fn wait_for_status(&self, name: &str, want: ProjectStatus) {
        for _ in 0..300 {
            if self.status(name) == Some(want) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} never reached {:?}", name, want);
    }
}

fn toml_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Front door bound to an ephemeral local port
pub struct RunningServer {
    pub addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
}

impl RunningServer {
    pub async fn start(ctx: &AppContext) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let front_door = FrontDoor::new(addr, ctx.clone(), shutdown_rx);
        let handle = tokio::spawn(async move {
            front_door.serve(listener).await.unwrap();
        });

        Self {
            addr,
            shutdown_tx,
            handle,
        }
    }

    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = tokio::time::timeout(Duration::from_secs(5), self.handle).await;
    }
}

#[derive(Debug)]
pub struct RawResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Send one HTTP/1.1 request over a fresh connection and read the whole response
pub async fn http_request(addr: SocketAddr, method: &str, path: &str, headers: &[(&str, &str)]) -> RawResponse {
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let mut request = format!("{} {} HTTP/1.1\r\n", method, path);
    if !headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("host")) {
        request.push_str(&format!("Host: {}\r\n", addr));
    }
    for (name, value) in headers {
        request.push_str(&format!("{}: {}\r\n", name, value));
    }
    request.push_str("Connection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = String::new();
    stream.read_to_string(&mut raw).await.unwrap();
    parse_response(&raw)
}

pub async fn http_get(addr: SocketAddr, path: &str, headers: &[(&str, &str)]) -> RawResponse {
    http_request(addr, "GET", path, headers).await
}

fn parse_response(raw: &str) -> RawResponse {
    let (head, body) = raw.split_once("\r\n\r\n").unwrap_or((raw, ""));
    let mut lines = head.lines();
    let status = lines
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .unwrap_or(0);
    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();

    RawResponse {
        status,
        headers,
        body: body.to_string(),
    }
}

pub fn project_dir(fixture: &Fixture, name: &str) -> PathBuf {
    fixture.dir.path().join("projects").join(name)
}
