//! Supervisor
//!
//! Wires the components together for the CLI commands and the daemon.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use warden_shared::{
    BackupSnapshot, PlatformStatusSnapshot, Result, ServiceCategory, StackAction, WardenError,
};

use crate::api;
use crate::backup::BackupManager;
use crate::config::WardenConfig;
use crate::descriptors::DescriptorStore;
use crate::drift::{self, AlertLog, DriftDetector, DriftGuard, DriftRules, DriftSweep};
use crate::health::{HealthGate, RetryPolicy};
use crate::phases::{PhaseOrchestrator, RunReport};
use crate::probe::{run_command, HostSystem, StackRuntime, SystemProbe};
use crate::process::{log_path, ProcessController, ProcessRecordStore};
use crate::remediation::RemediationEngine;
use crate::stack::{StackAdapter, StackReport};
use crate::status::StatusReporter;

/// A finished run together with the status it produced
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub report: RunReport,
    pub snapshot: PlatformStatusSnapshot,
    #[serde(skip)]
    pub summary: String,
}

/// Result of looking for one external tool
#[derive(Debug, Clone)]
pub struct ToolCheck {
    pub name: String,
    pub found: std::result::Result<String, String>,
}

pub struct Supervisor {
    config: WardenConfig,
    store: Arc<DescriptorStore>,
    stacks: Arc<StackAdapter>,
    orchestrator: PhaseOrchestrator,
    detector: Arc<DriftDetector>,
    engine: Arc<RemediationEngine>,
    backups: BackupManager,
}

impl Supervisor {
    /// Build against the real host
    pub fn from_config(config: WardenConfig, config_path: &Path) -> Result<Self> {
        let host = Arc::new(HostSystem::new(&config.project_root, &config.stacks.docker_bin));
        Self::with_system(config, config_path, host.clone(), host)
    }

    pub fn with_system(
        config: WardenConfig,
        config_path: &Path,
        probe: Arc<dyn SystemProbe>,
        runtime: Arc<dyn StackRuntime>,
    ) -> Result<Self> {
        let store = Arc::new(DescriptorStore::load(config.services.clone())?);
        if store.is_empty() {
            warn!("no services configured; only drift and backup tasks will do anything");
        }
        let state_dir = config.state_dir();

        let processes = Arc::new(ProcessController::new(
            ProcessRecordStore::new(state_dir.join("pids")),
            config.log_dir(),
            &config.project_root,
            probe.clone(),
            &config.process,
        ));
        let stacks = Arc::new(StackAdapter::new(
            runtime,
            probe.clone(),
            Duration::from_millis(config.stacks.grace_ms),
        ));
        let policy = RetryPolicy {
            max_attempts: config.health.max_attempts.max(1),
            interval: config.health.interval(),
        };
        let orchestrator = PhaseOrchestrator::new(
            store.clone(),
            processes,
            stacks.clone(),
            HealthGate::new(config.health.attempt_timeout())?,
            policy,
        );

        let rules = Arc::new(DriftRules::from_config(&config));
        let detector = Arc::new(DriftDetector::new(
            rules.clone(),
            probe.clone(),
            AlertLog::new(config.alert_log()),
        ));
        let backups = BackupManager::from_config(&config, config_path, probe);
        let engine = Arc::new(RemediationEngine::new(rules, state_dir.join("emergency")).with_backups(backups.root()));

        Ok(Self {
            config,
            store,
            stacks,
            orchestrator,
            detector,
            engine,
            backups,
        })
    }

    pub fn config(&self) -> &WardenConfig {
        &self.config
    }

    /// Run every phase, then regenerate the status outputs
    pub async fn start(&self, cancel: &CancellationToken) -> Result<RunOutcome> {
        let report = self.orchestrator.run(cancel).await;
        let (snapshot, summary) =
            StatusReporter::render(self.store.list(), &report.final_results(), Utc::now());
        StatusReporter::write(&self.config.state_dir(), &snapshot, &summary)?;
        Ok(RunOutcome {
            report,
            snapshot,
            summary,
        })
    }

    pub async fn stop(&self) {
        info!("stopping all services");
        self.orchestrator.stop_all().await;
    }

    /// Probe everything once without starting anything
    pub async fn status(&self) -> Result<(PlatformStatusSnapshot, String)> {
        let results = self.orchestrator.verify(&CancellationToken::new()).await;
        let (snapshot, summary) = StatusReporter::render(self.store.list(), &results, Utc::now());
        StatusReporter::write(&self.config.state_dir(), &snapshot, &summary)?;
        Ok((snapshot, summary))
    }

    pub async fn backup(&self) -> Result<BackupSnapshot> {
        self.backups.snapshot().await
    }

    /// Snapshot ids, oldest first, plus the one `latest` points at
    pub fn list_backups(&self) -> Result<(Vec<String>, Option<String>)> {
        Ok((self.backups.list()?, self.backups.latest_id()))
    }

    /// Disaster recovery: restore captured files, then run the start sequence
    pub async fn restore(&self, selector: &str, cancel: &CancellationToken) -> Result<(BackupSnapshot, RunOutcome)> {
        let snapshot = self.backups.restore_files(selector)?;
        info!(snapshot = %snapshot.id, "restarting services after restore");
        let outcome = self.start(cancel).await?;
        Ok((snapshot, outcome))
    }

    pub async fn drift(&self, remediate: bool) -> Result<DriftSweep> {
        drift::sweep(&self.detector, &self.engine, remediate).await
    }

    pub async fn stack_action(&self, name: &str, action: StackAction) -> Result<StackReport> {
        let stack = self
            .store
            .get(name)
            .filter(|d| d.category == ServiceCategory::Stack)
            .and_then(|d| d.stack.as_ref())
            .ok_or_else(|| WardenError::ServiceNotFound(name.to_string()))?;
        self.stacks.apply(name, stack, action).await
    }

    /// Last `lines` lines of each native service's log, or of one service
    pub fn tail_logs(&self, service: Option<&str>, lines: usize) -> Result<Vec<(String, Vec<String>)>> {
        let names: Vec<&str> = match service {
            Some(name) => {
                let desc = self
                    .store
                    .get(name)
                    .ok_or_else(|| WardenError::ServiceNotFound(name.to_string()))?;
                vec![desc.name.as_str()]
            }
            None => self
                .store
                .list()
                .iter()
                .filter(|d| d.category == ServiceCategory::Native)
                .map(|d| d.name.as_str())
                .collect(),
        };

        let log_dir = self.config.log_dir();
        let mut tails = Vec::new();
        for name in names {
            let path = log_path(&log_dir, name);
            let content = match fs::read_to_string(&path) {
                Ok(content) => content,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(WardenError::io(path, e)),
            };
            let all: Vec<&str> = content.lines().collect();
            let tail = all[all.len().saturating_sub(lines)..].iter().map(|l| l.to_string()).collect();
            tails.push((name.to_string(), tail));
        }
        Ok(tails)
    }

    /// Look for the container runtime, git, and every native service command
    pub async fn check_tools(&self) -> Vec<ToolCheck> {
        let root = &self.config.project_root;
        let mut checks = Vec::new();

        let needs_docker = self.store.list().iter().any(|d| d.category == ServiceCategory::Stack);
        let needs_git = self.config.drift.repo.is_some();
        for (tool, needed) in [(self.config.stacks.docker_bin.as_str(), needs_docker), ("git", needs_git)] {
            if !needed {
                continue;
            }
            let found = run_command(tool, &["--version".to_string()], root)
                .await
                .map(|out| out.lines().next().unwrap_or_default().trim().to_string())
                .map_err(|e| e.to_string());
            checks.push(ToolCheck {
                name: tool.to_string(),
                found,
            });
        }

        for desc in self.store.list().iter().filter(|d| d.category == ServiceCategory::Native) {
            let Some(command) = desc.command.as_deref() else { continue };
            let cwd = match &desc.working_dir {
                Some(dir) => self.config.resolve(dir),
                None => root.clone(),
            };
            let found = find_executable(command, &cwd)
                .map(|p| p.display().to_string())
                .ok_or_else(|| "not found".to_string());
            checks.push(ToolCheck {
                name: format!("{} ({})", desc.name, command),
                found,
            });
        }
        checks
    }

    // ========================================================================
    // Daemon
    // ========================================================================

    /// Keep the drift guard and backup schedule running from the first moment,
    /// start everything, then serve the control API until `cancel` fires.
    /// Services are left running on exit.
    pub async fn run_daemon(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let mut tasks = tokio::task::JoinSet::new();

        let guard = DriftGuard::new(
            self.detector.clone(),
            self.engine.clone(),
            Duration::from_secs(self.config.drift.interval_secs),
        );
        tasks.spawn(guard.run(cancel.clone()));

        if let Some(secs) = self.config.backup.interval_secs.filter(|s| *s > 0) {
            tasks.spawn(backup_schedule(self.clone(), Duration::from_secs(secs), cancel.clone()));
        }

        let result = self.clone().start_and_serve(&cancel).await;

        // Whatever ended the daemon, the background tasks stop with it
        cancel.cancel();
        while tasks.join_next().await.is_some() {}
        info!("daemon stopped; services left running");
        result
    }

    async fn start_and_serve(self: Arc<Self>, cancel: &CancellationToken) -> Result<()> {
        let outcome = self.start(cancel).await?;
        info!(
            up = outcome.snapshot.up_count(),
            total = outcome.snapshot.services.len(),
            "startup sequence finished"
        );
        if cancel.is_cancelled() {
            return Ok(());
        }

        let listener = tokio::net::TcpListener::bind(&self.config.api.bind)
            .await
            .map_err(|e| WardenError::Internal(format!("Failed to bind {}: {}", self.config.api.bind, e)))?;
        info!(addr = %self.config.api.bind, "control API listening");

        let shutdown = cancel.clone();
        axum::serve(listener, api::create_router(self.clone()))
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| WardenError::Internal(format!("Control API failed: {}", e)))
    }
}

async fn backup_schedule(supervisor: Arc<Supervisor>, period: Duration, cancel: CancellationToken) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it so startup doesn't snapshot
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match supervisor.backup().await {
                    Ok(snapshot) => info!(snapshot = %snapshot.id, "scheduled backup complete"),
                    Err(e) => error!(error = %e, "scheduled backup failed"),
                }
            }
        }
    }
}

/// Resolve a command the way `exec` would: paths relative to `cwd`, bare names via `PATH`
fn find_executable(command: &str, cwd: &Path) -> Option<PathBuf> {
    if command.contains('/') {
        let path = cwd.join(command);
        return path.is_file().then_some(path);
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(command))
        .find(|candidate| candidate.is_file())
}

/// Resolves on SIGINT or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("signal received, shutting down");
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::{MonitoredFile, FileRole, Replacement, BackupConfig, DriftConfig};
    use crate::health::tests::{dead_url, serve};
    use crate::stack::tests::FakeStack;
    use axum::{routing::get, Router};
    use warden_shared::{Phase, ServiceDescriptor, ServiceState};

    async fn test_config(dir: &Path) -> WardenConfig {
        let base = serve(Router::new().route("/healthz", get(|| async { "ok" }))).await;
        fs::create_dir_all(dir.join("apps")).unwrap();
        fs::write(dir.join("apps/.env"), "API_URL=http://localhost:11000\n").unwrap();

        WardenConfig {
            project_root: dir.to_path_buf(),
            services: vec![
                ServiceDescriptor::native("core-api", Phase::Core, "sleep", &["30"], &format!("{}/healthz", base)),
                ServiceDescriptor::native("aux-tool", Phase::Auxiliary, "sleep", &["30"], &dead_url("/status").await),
            ],
            health: crate::config::HealthConfig {
                max_attempts: 2,
                interval_ms: 50,
                attempt_timeout_ms: 200,
            },
            process: crate::config::ProcessConfig {
                stop_timeout_ms: 2000,
                poll_interval_ms: 20,
                startup_check_ms: 50,
            },
            drift: DriftConfig {
                replacements: vec![Replacement {
                    superseded: "localhost:11001".into(),
                    current: "localhost:11000".into(),
                }],
                files: vec![MonitoredFile {
                    path: PathBuf::from("apps/.env"),
                    role: FileRole::FrontendEnv,
                    required: vec!["API_URL=http://localhost:11000".into()],
                }],
                ..DriftConfig::default()
            },
            backup: BackupConfig {
                settings: vec![PathBuf::from("apps/.env")],
                ..BackupConfig::default()
            },
            ..WardenConfig::default()
        }
    }

    fn build(config: WardenConfig, dir: &Path) -> Supervisor {
        let fake = Arc::new(FakeStack::default());
        Supervisor::with_system(config, &dir.join("warden.toml"), fake.clone(), fake).unwrap()
    }

    async fn supervisor(dir: &Path) -> Supervisor {
        build(test_config(dir).await, dir)
    }

    async fn wait_for(mut ready: impl FnMut() -> bool) {
        for _ in 0..250 {
            if ready() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_degraded_start_still_writes_full_status() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path()).await;

        let outcome = sup.start(&CancellationToken::new()).await.unwrap();
        assert!(outcome.report.completed());
        assert_eq!(outcome.snapshot.get("core-api").unwrap().state, ServiceState::Up);
        assert_eq!(outcome.snapshot.get("aux-tool").unwrap().state, ServiceState::Down);

        let written: PlatformStatusSnapshot =
            serde_json::from_slice(&fs::read(dir.path().join(".warden/status.json")).unwrap()).unwrap();
        assert_eq!(written.services.len(), 2);
        assert!(dir.path().join(".warden/ACCESS.md").is_file());

        sup.stop().await;
    }

    #[tokio::test]
    async fn test_restore_reverts_drift_and_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path()).await;
        let env = dir.path().join("apps/.env");

        let snapshot = sup.backup().await.unwrap();
        fs::write(&env, "API_URL=http://localhost:11001\n").unwrap();
        let sweep = sup.drift(false).await.unwrap();
        assert_eq!(sweep.findings.len(), 2);

        let (restored, outcome) = sup.restore("latest", &CancellationToken::new()).await.unwrap();
        assert_eq!(restored.id, snapshot.id);
        assert_eq!(fs::read_to_string(&env).unwrap(), "API_URL=http://localhost:11000\n");
        assert_eq!(outcome.snapshot.up_count(), 1);
        assert!(sup.drift(false).await.unwrap().findings.is_empty());

        sup.stop().await;
    }

    #[tokio::test]
    async fn test_stack_action_needs_a_stack_service() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path()).await;
        let err = sup.stack_action("core-api", StackAction::Status).await.unwrap_err();
        assert!(matches!(err, WardenError::ServiceNotFound(_)));
    }

    #[tokio::test]
    async fn test_tail_logs_and_tool_check() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path()).await;
        let logs = dir.path().join("logs");
        fs::create_dir_all(&logs).unwrap();
        fs::write(log_path(&logs, "core-api"), "one\ntwo\nthree\n").unwrap();

        let tails = sup.tail_logs(None, 2).unwrap();
        assert_eq!(tails, vec![("core-api".to_string(), vec!["two".to_string(), "three".to_string()])]);
        assert!(sup.tail_logs(Some("ghost"), 2).is_err());

        let checks = sup.check_tools().await;
        assert_eq!(checks.len(), 2);
        assert!(checks.iter().all(|c| c.found.is_ok()));
    }

    #[tokio::test]
    async fn test_backup_schedule_snapshots_until_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let sup = Arc::new(supervisor(dir.path()).await);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(backup_schedule(sup.clone(), Duration::from_millis(100), cancel.clone()));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(sup.list_backups().unwrap().0.is_empty());

        wait_for(|| sup.list_backups().map_or(false, |(ids, _)| !ids.is_empty())).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();

        let (ids, latest) = sup.list_backups().unwrap();
        assert_eq!(latest, ids.last().cloned());
    }

    #[tokio::test]
    async fn test_daemon_guards_drift_while_starting() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path()).await;
        // aux-tool never answers, so startup stays in its health gate for seconds
        config.health.max_attempts = 200;
        config.api.bind = "127.0.0.1:0".into();
        let env = dir.path().join("apps/.env");
        fs::write(&env, "API_URL=http://localhost:11001\n").unwrap();
        let sup = Arc::new(build(config, dir.path()));

        let cancel = CancellationToken::new();
        let daemon = tokio::spawn(sup.clone().run_daemon(cancel.clone()));

        wait_for(|| fs::read_to_string(&env).map_or(false, |c| c == "API_URL=http://localhost:11000\n")).await;
        assert!(dir.path().join(".warden/alerts.jsonl").is_file());
        assert!(!dir.path().join(".warden/status.json").exists());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), daemon)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        sup.stop().await;
    }
}
