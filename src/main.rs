use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use trafic_agent::backup::{BackupManager, BackupOutcome, BackupScheduler};
use trafic_agent::config::{Config, DEFAULT_CONFIG_PATH};
use trafic_agent::context::AppContext;
use trafic_agent::control::{DdevControl, ProjectControl};
use trafic_agent::db::Registry;
use trafic_agent::idle::IdleEvictor;
use trafic_agent::projects::{run_reload_loop, watch_project_list, ProjectDirectory};
use trafic_agent::server::{FrontDoor, PKG_NAME, VERSION};

/// Time allowed for background tasks to finish after the shutdown signal
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

const USAGE: &str = "\
Usage: trafic-agent [command] [options]

Commands:
  start                        Run the agent (default)
  backup [<project>]           Back up one project (starting it if needed) or all projects
  backups                      List backups
  restore <project> [<date>]   Restore a project from a backup (latest if no date)
  version                      Print the version
  help                         Show this message

Options:
  -c, --config <path>          Configuration file (default /etc/trafic/config.toml)
  -p, --port <port>            Override the listen port
";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Start,
    Backup { project: Option<String> },
    Backups,
    Restore { project: String, date: Option<String> },
    Version,
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Cli {
    command: Command,
    config_path: PathBuf,
    port: Option<u16>,
}

fn parse_args<I>(args: I) -> anyhow::Result<Cli>
where
    I: IntoIterator<Item = String>,
{
    let mut config_path = PathBuf::from(DEFAULT_CONFIG_PATH);
    let mut port = None;
    let mut positional = Vec::new();

    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-c" | "--config" => {
                let value = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("{} requires a path", arg))?;
                config_path = PathBuf::from(value);
            }
            "-p" | "--port" => {
                let value = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("{} requires a port", arg))?;
                let parsed = value
                    .parse::<u16>()
                    .ok()
                    .filter(|p| *p > 0)
                    .ok_or_else(|| anyhow::anyhow!("Invalid port: {}", value))?;
                port = Some(parsed);
            }
            "-h" | "--help" => positional.insert(0, "help".to_string()),
            "-V" | "--version" => positional.insert(0, "version".to_string()),
            other if other.starts_with('-') => anyhow::bail!("Unknown option: {}", other),
            _ => positional.push(arg),
        }
    }

    let mut positional = positional.into_iter();
    let command = match positional.next().as_deref() {
        None | Some("start") => Command::Start,
        Some("backup") => Command::Backup {
            project: positional.next(),
        },
        Some("backups") => Command::Backups,
        Some("restore") => {
            let project = positional
                .next()
                .ok_or_else(|| anyhow::anyhow!("restore requires a project name"))?;
            Command::Restore {
                project,
                date: positional.next(),
            }
        }
        Some("version") => Command::Version,
        Some("help") => Command::Help,
        Some(other) => anyhow::bail!("Unknown command: {}", other),
    };

    if let Some(extra) = positional.next() {
        anyhow::bail!("Unexpected argument: {}", extra);
    }

    Ok(Cli {
        command,
        config_path,
        port,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("trafic_agent=info")),
        )
        .init();

    let cli = match parse_args(std::env::args().skip(1)) {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("{}\n\n{}", e, USAGE);
            std::process::exit(2);
        }
    };

    match cli.command {
        Command::Version => {
            println!("{} {}", PKG_NAME, VERSION);
            return Ok(());
        }
        Command::Help => {
            print!("{}", USAGE);
            return Ok(());
        }
        _ => {}
    }

    let mut config = match Config::load(&cli.config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };
    if let Some(port) = cli.port {
        config.port = u32::from(port);
    }

    info!(path = %cli.config_path.display(), "Configuration loaded");

    match cli.command {
        Command::Start => run_agent(config).await,
        Command::Backup { project } => run_backup(config, project).await,
        Command::Backups => list_backups(config).await,
        Command::Restore { project, date } => run_restore(config, &project, date.as_deref()).await,
        Command::Version | Command::Help => Ok(()),
    }
}

/// Open the registry and read the project list
fn build_context(config: Config) -> anyhow::Result<AppContext> {
    let registry = Registry::open(&config.db_path).map_err(|e| {
        error!(path = %config.db_path, error = %e, "Failed to open registry");
        e
    })?;

    let projects = ProjectDirectory::new(&config.project_list_path, config.tld.as_str());
    if let Err(e) = projects.reload() {
        warn!(path = %config.project_list_path, error = %e, "Failed to load project list, starting empty");
    }

    let control: Arc<dyn ProjectControl> = Arc::new(DdevControl::new(config.control.clone()));

    Ok(AppContext::new(
        config,
        Arc::new(registry),
        control,
        Arc::new(projects),
    ))
}

async fn run_agent(config: Config) -> anyhow::Result<()> {
    print_startup_banner(&config);

    let pid_file_path = config.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = write_pid_file(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    let bind_addr: SocketAddr = format!("{}:{}", config.bind, config.port())
        .parse()
        .map_err(|e| {
            error!(bind = %config.bind, port = config.port(), error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let ctx = build_context(config)?;

    let reset = ctx.registry.reset_starting()?;
    if reset > 0 {
        warn!(count = reset, "Reset projects left in starting state by a previous run");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();

    let watcher = match watch_project_list(ctx.projects.list_path()) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            warn!(error = %e, "Project list watch unavailable, relying on polling");
            None
        }
    };
    handles.push(tokio::spawn(run_reload_loop(
        ctx.projects.clone(),
        watcher,
        ctx.config.project_poll_interval(),
        shutdown_rx.clone(),
    )));

    let evictor = IdleEvictor::new(&ctx);
    handles.push(tokio::spawn(evictor.run(shutdown_rx.clone())));

    if ctx.config.backup.enabled {
        let manager = Arc::new(BackupManager::new(&ctx));
        let scheduler = BackupScheduler::new(manager, &ctx.config);
        handles.push(tokio::spawn(scheduler.run(shutdown_rx.clone())));
    } else {
        info!("Scheduled backups disabled");
    }

    let front_door = FrontDoor::new(bind_addr, ctx.clone(), shutdown_rx.clone());
    let mut server_handle = tokio::spawn(async move {
        if let Err(e) = front_door.run().await {
            error!(error = %e, "Front door error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM), or the listener dying
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
            _ = &mut server_handle => {
                error!("Front door stopped unexpectedly, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received Ctrl+C, shutting down...");
            }
            _ = &mut server_handle => {
                error!("Front door stopped unexpectedly, shutting down...");
            }
        }
    }

    let _ = shutdown_tx.send(true);

    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        if !server_handle.is_finished() {
            let _ = server_handle.await;
        }
        for handle in handles {
            let _ = handle.await;
        }
    })
    .await;
    if drained.is_err() {
        warn!(grace_secs = SHUTDOWN_GRACE.as_secs(), "Background tasks did not stop in time");
    }

    // The front door has drained its connections; later writes from stray
    // start tasks fail with a closed registry instead of racing the close.
    if let Err(e) = ctx.registry.close() {
        warn!(error = %e, "Failed to close registry");
    }

    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

async fn run_backup(config: Config, project: Option<String>) -> anyhow::Result<()> {
    let ctx = build_context(config)?;
    let manager = BackupManager::new(&ctx);

    let results = match project {
        Some(name) => vec![manager.backup_project(&name, true).await],
        None => manager.backup_all().await,
    };

    let mut failed = 0;
    for result in &results {
        match &result.outcome {
            BackupOutcome::Succeeded(path) => println!("ok      {}  {}", result.project, path.display()),
            BackupOutcome::Skipped(reason) => println!("skipped {}  {}", result.project, reason),
            BackupOutcome::Failed(reason) => {
                failed += 1;
                println!("failed  {}  {}", result.project, reason);
            }
        }
    }

    ctx.registry.close()?;

    if failed > 0 {
        anyhow::bail!("{} of {} backups failed", failed, results.len());
    }
    Ok(())
}

async fn list_backups(config: Config) -> anyhow::Result<()> {
    let ctx = build_context(config)?;
    let manager = BackupManager::new(&ctx);

    let entries = manager.list_backups()?;
    ctx.registry.close()?;
    if entries.is_empty() {
        println!("No backups in {}", manager.root().display());
        return Ok(());
    }

    for entry in entries {
        println!(
            "{}  {:<24} {:>12}  {}",
            entry.date,
            entry.project,
            entry.size_bytes,
            entry.path.display()
        );
    }
    Ok(())
}

async fn run_restore(config: Config, project: &str, date: Option<&str>) -> anyhow::Result<()> {
    let ctx = build_context(config)?;
    let manager = BackupManager::new(&ctx);

    let Some(file) = manager.find_backup(project, date) else {
        ctx.registry.close()?;
        anyhow::bail!(
            "No backup found for {}{}",
            project,
            date.map(|d| format!(" on {}", d)).unwrap_or_default()
        );
    };

    info!(project, file = %file.display(), "Restoring backup");
    let restored = manager.restore_project(project, &file).await;
    ctx.registry.close()?;
    if !restored {
        anyhow::bail!("Restore of {} from {} failed", project, file.display());
    }

    println!("Restored {} from {}", project, file.display());
    Ok(())
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        use std::os::unix::io::AsRawFd;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        // Truncate only after the lock is held
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another agent is already running (PID file {} is locked)", path.display());
            }
            return Err(err.into());
        }

        file.set_len(0)?;
        writeln!(&file, "{}", std::process::id())?;

        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        let mut file = std::fs::File::create(path)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self)
    }
}

fn write_pid_file(path: &Path) -> anyhow::Result<PidFile> {
    PidFile::create(path)
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting agent");
    info!(
        bind = %config.bind,
        port = config.port(),
        tld = %config.tld,
        db = %config.db_path,
        project_list = %config.project_list_path,
        "Server configuration"
    );
    info!(
        default_policy = %config.auth.default_policy,
        rules = config.auth.rules.len(),
        allowed_ips = config.auth.allowed_ips.len(),
        tokens = config.auth.tokens.len(),
        basic_users = config.auth.basic_auth.len(),
        "Access policy"
    );
    info!(
        idle_timeout_secs = config.idle_timeout().as_secs(),
        check_interval_secs = config.idle_check_interval().as_secs(),
        log_retain_days = config.access_log_retain_days,
        "Idle eviction settings"
    );
    info!(
        enabled = config.backup.enabled,
        hour = config.backup.schedule_hour,
        retain_days = config.backup.retain_days,
        dir = %config.backup.local_dir,
        "Backup settings"
    );
}
