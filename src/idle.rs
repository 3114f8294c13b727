//! Idle eviction
//!
//! Periodically stops projects that have not served a request for longer than
//! their idle timeout, and keeps the registry in line with what the project
//! tool reports.

use crate::context::AppContext;
use crate::control::{ExternalStatus, ProjectControl};
use crate::db::{now_ms, Registry};
use crate::projects::ProjectDirectory;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const DAY_MS: i64 = 86_400_000;

/// What one eviction pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionSummary {
    /// Projects the registry reported as idle
    pub candidates: usize,
    /// Stopped by this pass
    pub stopped: Vec<String>,
    /// Already down according to the project tool; registry corrected
    pub reconciled: Vec<String>,
    /// Pinned with `never` or still within their own timeout
    pub skipped: Vec<String>,
    /// Stop or describe failed; retried next pass
    pub failed: Vec<String>,
    pub logs_pruned: usize,
}

pub struct IdleEvictor {
    registry: Arc<Registry>,
    control: Arc<dyn ProjectControl>,
    projects: Arc<ProjectDirectory>,
    idle_timeout: Duration,
    check_interval: Duration,
    log_retain_days: u32,
}

impl IdleEvictor {
    pub fn new(ctx: &AppContext) -> Self {
        Self {
            registry: ctx.registry.clone(),
            control: ctx.control.clone(),
            projects: ctx.projects.clone(),
            idle_timeout: ctx.config.idle_timeout(),
            check_interval: ctx.config.idle_check_interval(),
            log_retain_days: ctx.config.access_log_retain_days,
        }
    }

    /// Run a pass now and then every check interval until shutdown.
    /// A pass always finishes before the next one begins.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.check_interval.as_secs(),
            idle_timeout_secs = self.idle_timeout.as_secs(),
            "Idle evictor started"
        );

        let mut interval = tokio::time::interval(self.check_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let summary = self.tick().await;
                    if !summary.stopped.is_empty() || !summary.failed.is_empty() {
                        info!(
                            stopped = summary.stopped.len(),
                            reconciled = summary.reconciled.len(),
                            failed = summary.failed.len(),
                            "Idle pass complete"
                        );
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("Idle evictor shutting down");
                        break;
                    }
                }
            }
        }
    }

    pub async fn tick(&self) -> EvictionSummary {
        self.tick_at(now_ms()).await
    }

    /// One eviction pass as of `now` (unix ms)
    pub async fn tick_at(&self, now: i64) -> EvictionSummary {
        let mut summary = EvictionSummary::default();
        let index = self.projects.snapshot();

        // Shorter per-project timeouts must reach the candidate list too
        let query_threshold = index
            .shortest_idle_override()
            .map_or(self.idle_timeout, |d| d.min(self.idle_timeout));

        let candidates = match self.registry.idle_since_at(query_threshold, now) {
            Ok(candidates) => candidates,
            Err(e) => {
                error!(error = %e, "Failed to query idle projects");
                return summary;
            }
        };
        summary.candidates = candidates.len();

        for record in candidates {
            let name = record.name;

            let Some(timeout) = index.idle_timeout(&name, self.idle_timeout) else {
                debug!(project = %name, "Idle timeout is never, skipping");
                summary.skipped.push(name);
                continue;
            };

            let idle_ms = now - record.last_access_at;
            let timeout_ms = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);
            if idle_ms <= timeout_ms {
                summary.skipped.push(name);
                continue;
            }

            match self.control.describe(&name).await {
                Ok(Some(info)) if info.status == ExternalStatus::Running => {}
                Ok(info) => {
                    debug!(
                        project = %name,
                        status = info.map(|i| i.status.as_str()).unwrap_or("missing"),
                        "Project not running, updating registry"
                    );
                    self.mark_stopped(&name);
                    summary.reconciled.push(name);
                    continue;
                }
                Err(e) => {
                    warn!(project = %name, error = %e, "Failed to describe idle project");
                    summary.failed.push(name);
                    continue;
                }
            }

            info!(project = %name, idle_secs = idle_ms / 1000, "Stopping idle project");
            match self.control.stop(&name).await {
                Ok(()) => {
                    self.mark_stopped(&name);
                    summary.stopped.push(name);
                }
                Err(e) => {
                    warn!(project = %name, error = %e, "Failed to stop idle project");
                    summary.failed.push(name);
                }
            }
        }

        let cutoff = now - i64::from(self.log_retain_days) * DAY_MS;
        match self.registry.prune_logs_before(cutoff) {
            Ok(rows) => summary.logs_pruned = rows,
            Err(e) => warn!(error = %e, "Failed to prune access logs"),
        }

        summary
    }

    /// A wake may have moved the row to `starting` while describe or stop
    /// was in flight; that row is left alone.
    fn mark_stopped(&self, name: &str) {
        match self.registry.stop_if_running(name) {
            Ok(true) => {}
            Ok(false) => debug!(project = name, "Status changed during idle pass, leaving it"),
            Err(e) => error!(project = name, error = %e, "Failed to record stopped project"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::control::testing::FakeControl;
    use crate::db::{AccessLogEntry, ProjectStatus};
    use crate::wake::{WakeHandler, WakeOutcome};
    use crate::projects::{IdleTimeout, ProjectIndex, ProjectOverrides};
    use std::collections::{BTreeMap, HashMap};
    use std::path::PathBuf;
    use std::sync::atomic::Ordering;

    const MINUTE_MS: i64 = 60_000;

    fn context(control: Arc<FakeControl>, overrides: HashMap<&str, IdleTimeout>) -> AppContext {
        let mut projects = BTreeMap::new();
        for name in ["a", "b", "c", "d"] {
            projects.insert(name.to_string(), PathBuf::from(format!("/srv/{}", name)));
        }
        let index = ProjectIndex::build(projects, "preview.test", |dir| {
            let name = dir.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            ProjectOverrides {
                auth_policy: None,
                idle_timeout: overrides.get(name).copied(),
            }
        });

        AppContext::new(
            Config::from_toml("tld = \"preview.test\"\nidle_timeout = \"30m\"").unwrap(),
            Arc::new(Registry::open_in_memory().unwrap()),
            control,
            Arc::new(ProjectDirectory::with_index(index)),
        )
    }

    fn evictor(control: Arc<FakeControl>, overrides: HashMap<&str, IdleTimeout>) -> (IdleEvictor, Arc<Registry>) {
        let ctx = context(control, overrides);
        (IdleEvictor::new(&ctx), ctx.registry.clone())
    }

    #[tokio::test]
    async fn test_global_timeout_evicts() {
        let control = Arc::new(FakeControl::new());
        let (evictor, registry) = evictor(control.clone(), HashMap::new());
        let now = now_ms();

        registry.record_access_at("a", now - 40 * MINUTE_MS).unwrap();
        registry.record_access_at("b", now - 10 * MINUTE_MS).unwrap();
        control.set_running("a");
        control.set_running("b");

        let summary = evictor.tick_at(now).await;
        assert_eq!(summary.candidates, 1);
        assert_eq!(summary.stopped, vec!["a".to_string()]);
        assert_eq!(registry.get_status("a").unwrap(), Some(ProjectStatus::Stopped));
        assert_eq!(registry.get_status("b").unwrap(), Some(ProjectStatus::Running));
        assert!(!control.is_up("a"));
        assert!(control.is_up("b"));
    }

    #[tokio::test]
    async fn test_longer_override_protects_project() {
        let control = Arc::new(FakeControl::new());
        let overrides = HashMap::from([("a", IdleTimeout::After(Duration::from_secs(3600)))]);
        let (evictor, registry) = evictor(control.clone(), overrides);
        let now = now_ms();

        registry.record_access_at("a", now - 40 * MINUTE_MS).unwrap();
        control.set_running("a");

        let summary = evictor.tick_at(now).await;
        assert_eq!(summary.skipped, vec!["a".to_string()]);
        assert!(summary.stopped.is_empty());
        assert_eq!(registry.get_status("a").unwrap(), Some(ProjectStatus::Running));
        assert_eq!(control.stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_shorter_override_is_honored() {
        let control = Arc::new(FakeControl::new());
        let overrides = HashMap::from([("a", IdleTimeout::After(Duration::from_secs(5 * 60)))]);
        let (evictor, registry) = evictor(control.clone(), overrides);
        let now = now_ms();

        registry.record_access_at("a", now - 10 * MINUTE_MS).unwrap();
        registry.record_access_at("b", now - 10 * MINUTE_MS).unwrap();
        control.set_running("a");
        control.set_running("b");

        let summary = evictor.tick_at(now).await;
        assert_eq!(summary.stopped, vec!["a".to_string()]);
        assert_eq!(summary.skipped, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_never_is_never_evicted() {
        let control = Arc::new(FakeControl::new());
        let overrides = HashMap::from([("c", IdleTimeout::Never)]);
        let (evictor, registry) = evictor(control.clone(), overrides);
        let now = now_ms();

        registry.record_access_at("c", now - 30 * 24 * 60 * MINUTE_MS).unwrap();
        control.set_running("c");

        for _ in 0..3 {
            let summary = evictor.tick_at(now).await;
            assert_eq!(summary.skipped, vec!["c".to_string()]);
        }
        assert_eq!(registry.get_status("c").unwrap(), Some(ProjectStatus::Running));
        assert_eq!(control.stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_reconciles_projects_already_down() {
        let control = Arc::new(FakeControl::new());
        let (evictor, registry) = evictor(control.clone(), HashMap::new());
        let now = now_ms();

        registry.record_access_at("d", now - 60 * MINUTE_MS).unwrap();

        let summary = evictor.tick_at(now).await;
        assert_eq!(summary.reconciled, vec!["d".to_string()]);
        assert_eq!(registry.get_status("d").unwrap(), Some(ProjectStatus::Stopped));
        assert_eq!(control.stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_stop_retried_next_tick() {
        let control = Arc::new(FakeControl::new());
        control.fail_stop.store(true, Ordering::SeqCst);
        let (evictor, registry) = evictor(control.clone(), HashMap::new());
        let now = now_ms();

        registry.record_access_at("a", now - 60 * MINUTE_MS).unwrap();
        control.set_running("a");

        let summary = evictor.tick_at(now).await;
        assert_eq!(summary.failed, vec!["a".to_string()]);
        assert_eq!(registry.get_status("a").unwrap(), Some(ProjectStatus::Running));

        control.fail_stop.store(false, Ordering::SeqCst);
        let summary = evictor.tick_at(now).await;
        assert_eq!(summary.stopped, vec!["a".to_string()]);
        assert_eq!(registry.get_status("a").unwrap(), Some(ProjectStatus::Stopped));
    }

    #[tokio::test]
    async fn test_tick_prunes_access_logs() {
        let control = Arc::new(FakeControl::new());
        let (evictor, registry) = evictor(control, HashMap::new());
        let now = now_ms();

        let mut old = AccessLogEntry::new("a", "1.2.3.4", "", "/");
        old.timestamp = now - 31 * DAY_MS;
        registry.append_access_log(&old).unwrap();
        registry
            .append_access_log(&AccessLogEntry::new("a", "1.2.3.4", "", "/"))
            .unwrap();

        let summary = evictor.tick_at(now).await;
        assert_eq!(summary.logs_pruned, 1);
        assert_eq!(registry.recent_access_logs("a", 10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_wake_during_pass_is_not_overwritten() {
        let control = Arc::new(FakeControl {
            start_delay: Duration::from_millis(600),
            describe_delay: Duration::from_millis(200),
            ..FakeControl::default()
        });
        let ctx = context(control.clone(), HashMap::new());
        let evictor = Arc::new(IdleEvictor::new(&ctx));
        let wake = WakeHandler::new(&ctx);
        let now = now_ms();

        // Registry says running, the tool says it is down
        ctx.registry.record_access_at("a", now - 60 * MINUTE_MS).unwrap();

        let pass = tokio::spawn({
            let evictor = evictor.clone();
            async move { evictor.tick_at(now).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // A visitor arrives while describe is still running
        assert_eq!(
            wake.handle("a.preview.test").unwrap(),
            WakeOutcome::StartIssued { project: "a".to_string() }
        );

        let summary = pass.await.unwrap();
        assert_eq!(summary.candidates, 1);
        assert_eq!(ctx.registry.get_status("a").unwrap(), Some(ProjectStatus::Starting));

        assert_eq!(
            wake.handle("a.preview.test").unwrap(),
            WakeOutcome::AlreadyStarting { project: "a".to_string() }
        );
        assert_eq!(control.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let control = Arc::new(FakeControl::new());
        let (evictor, _registry) = evictor(control, HashMap::new());
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(evictor.run(rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("evictor should exit on shutdown")
            .unwrap();
    }
}
