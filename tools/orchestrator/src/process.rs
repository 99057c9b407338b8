//! Process Controller
//!
//! Starts and stops native-process services and persists one
//! [`ProcessRecord`] per running service, so repeated runs (and separate
//! `warden stop` invocations) find the instance a previous run started.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};
use warden_shared::fsutil::atomic_write;
use warden_shared::{ProcessRecord, Result, ServiceDescriptor, WardenError};

use crate::config::ProcessConfig;
use crate::probe::SystemProbe;

// ============================================================================
// Record Store
// ============================================================================

/// One JSON file per service under `{state_dir}/pids`
#[derive(Debug, Clone)]
pub struct ProcessRecordStore {
    dir: PathBuf,
}

impl ProcessRecordStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, service: &str) -> PathBuf {
        self.dir.join(format!("{}.json", service))
    }

    pub fn load(&self, service: &str) -> Result<Option<ProcessRecord>> {
        let path = self.path_for(service);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(WardenError::io(path, e)),
        }
    }

    pub fn save(&self, record: &ProcessRecord) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(record)?;
        atomic_write(&self.path_for(&record.service), &bytes)
    }

    pub fn remove(&self, service: &str) -> Result<()> {
        let path = self.path_for(service);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(WardenError::io(path, e)),
        }
    }

    pub fn list(&self) -> Result<Vec<ProcessRecord>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(WardenError::io(&self.dir, e)),
        };

        let mut records = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map_or(false, |ext| ext == "json") {
                let bytes = fs::read(&path).map_err(|e| WardenError::io(&path, e))?;
                records.push(serde_json::from_slice(&bytes)?);
            }
        }
        records.sort_by(|a: &ProcessRecord, b| a.service.cmp(&b.service));
        Ok(records)
    }
}

// ============================================================================
// Controller
// ============================================================================

pub struct ProcessController {
    records: ProcessRecordStore,
    log_dir: PathBuf,
    project_root: PathBuf,
    probe: Arc<dyn SystemProbe>,
    stop_timeout: Duration,
    poll_interval: Duration,
    startup_check: Duration,
    /// Children spawned by this process; kept so exited ones get reaped
    children: Mutex<HashMap<String, Child>>,
}

impl ProcessController {
    pub fn new(
        records: ProcessRecordStore,
        log_dir: impl Into<PathBuf>,
        project_root: impl Into<PathBuf>,
        probe: Arc<dyn SystemProbe>,
        config: &ProcessConfig,
    ) -> Self {
        Self {
            records,
            log_dir: log_dir.into(),
            project_root: project_root.into(),
            probe,
            stop_timeout: Duration::from_millis(config.stop_timeout_ms),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(10)),
            startup_check: Duration::from_millis(config.startup_check_ms),
            children: Mutex::new(HashMap::new()),
        }
    }

    pub fn records(&self) -> &ProcessRecordStore {
        &self.records
    }

    /// Start a native service, first stopping whatever instance a previous record points at
    pub async fn start(&self, descriptor: &ServiceDescriptor) -> Result<ProcessRecord> {
        let name = descriptor.name.as_str();

        if let Some(previous) = self.records.load(name)? {
            if self.is_alive(&previous) {
                info!(service = name, pid = previous.pid, "stopping previous instance before start");
                self.terminate(name, previous.pid).await;
            } else {
                debug!(service = name, pid = previous.pid, "clearing stale process record");
            }
            self.records.remove(name)?;
        }

        let command = descriptor
            .command
            .as_deref()
            .ok_or_else(|| start_failed(name, "no command configured"))?;

        fs::create_dir_all(&self.log_dir).map_err(|e| WardenError::io(&self.log_dir, e))?;
        let log_file = log_path(&self.log_dir, name);
        let stdout = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .map_err(|e| start_failed(name, format!("cannot open {}: {}", log_file.display(), e)))?;
        let stderr = stdout
            .try_clone()
            .map_err(|e| start_failed(name, format!("cannot open {}: {}", log_file.display(), e)))?;

        let working_dir = match &descriptor.working_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => self.project_root.join(dir),
            None => self.project_root.clone(),
        };

        let mut cmd = Command::new(command);
        cmd.args(&descriptor.args)
            .envs(&descriptor.env)
            .current_dir(&working_dir)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Own process group, so stop reaches helpers the service forks
            cmd.process_group(0);
        }

        let mut child = cmd.spawn().map_err(|e| start_failed(name, e.to_string()))?;
        let pid = child.id();

        if !self.startup_check.is_zero() {
            sleep(self.startup_check).await;
            match child.try_wait() {
                Ok(Some(status)) => {
                    return Err(start_failed(name, format!("exited immediately with {}", status)));
                }
                Ok(None) => {}
                Err(e) => warn!(service = name, error = %e, "could not check process status"),
            }
        }

        let record = ProcessRecord {
            service: name.to_string(),
            pid,
            log_file,
            created_at: Utc::now(),
        };
        self.records.save(&record)?;
        self.lock_children().insert(name.to_string(), child);

        info!(service = name, pid, "started");
        Ok(record)
    }

    /// Graceful-then-forceful stop of a recorded service
    pub async fn stop(&self, name: &str) -> Result<()> {
        let record = self
            .records
            .load(name)?
            .ok_or_else(|| WardenError::NotRunning(name.to_string()))?;

        if !self.is_alive(&record) {
            self.records.remove(name)?;
            self.lock_children().remove(name);
            return Err(WardenError::NotRunning(name.to_string()));
        }

        self.terminate(name, record.pid).await;
        self.records.remove(name)?;
        info!(service = name, pid = record.pid, "stopped");
        Ok(())
    }

    pub fn is_alive(&self, record: &ProcessRecord) -> bool {
        if let Some(alive) = self.own_child_alive(&record.service, record.pid) {
            return alive;
        }
        self.probe.process_alive(record.pid)
    }

    /// `Some` when `pid` is a child this controller spawned; reaps it if it exited
    fn own_child_alive(&self, name: &str, pid: u32) -> Option<bool> {
        let mut children = self.lock_children();
        let child = children.get_mut(name).filter(|c| c.id() == pid)?;
        match child.try_wait() {
            Ok(None) => Some(true),
            Ok(Some(_)) => {
                children.remove(name);
                Some(false)
            }
            Err(_) => None,
        }
    }

    fn alive(&self, name: &str, pid: u32) -> bool {
        self.own_child_alive(name, pid)
            .unwrap_or_else(|| self.probe.process_alive(pid))
    }

    /// SIGTERM, wait up to the stop timeout, then SIGKILL
    async fn terminate(&self, name: &str, pid: u32) {
        send_signal(pid, Signal::Terminate);
        if self.wait_for_exit(name, pid, self.stop_timeout).await {
            self.lock_children().remove(name);
            return;
        }

        warn!(service = name, pid, "did not exit after SIGTERM, killing");
        send_signal(pid, Signal::Kill);
        if !self.wait_for_exit(name, pid, Duration::from_secs(2)).await {
            warn!(service = name, pid, "still present after SIGKILL");
        }
        self.lock_children().remove(name);
    }

    async fn wait_for_exit(&self, name: &str, pid: u32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.alive(name, pid) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(self.poll_interval).await;
        }
    }

    fn lock_children(&self) -> std::sync::MutexGuard<'_, HashMap<String, Child>> {
        // A poisoned map only means another task panicked mid-insert; the data is still usable
        self.children.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn start_failed(service: &str, reason: impl Into<String>) -> WardenError {
    WardenError::StartFailed {
        service: service.to_string(),
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Terminate,
    Kill,
}

/// Signal the process group led by `pid`, falling back to the process itself
#[cfg(unix)]
fn send_signal(pid: u32, signal: Signal) {
    let sig = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    let pid = pid as libc::pid_t;
    // SAFETY: plain kill(2) calls; a stale pid yields ESRCH, which is ignored
    unsafe {
        if libc::kill(-pid, sig) != 0 {
            libc::kill(pid, sig);
        }
    }
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, _signal: Signal) {}

/// Log file path a service's output goes to
pub fn log_path(log_dir: &Path, service: &str) -> PathBuf {
    log_dir.join(format!("{}.log", service))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::probe::HostSystem;
    use warden_shared::Phase;

    fn controller(dir: &Path) -> ProcessController {
        let config = ProcessConfig {
            stop_timeout_ms: 2000,
            poll_interval_ms: 20,
            startup_check_ms: 150,
        };
        ProcessController::new(
            ProcessRecordStore::new(dir.join("pids")),
            dir.join("logs"),
            dir,
            Arc::new(HostSystem::new(dir, "docker")),
            &config,
        )
    }

    fn sleeper(name: &str) -> ServiceDescriptor {
        ServiceDescriptor::native(name, Phase::Core, "sleep", &["30"], "http://localhost:11000/healthz")
    }

    #[tokio::test]
    async fn test_start_twice_leaves_one_live_process() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(dir.path());
        let desc = sleeper("core-api");

        let first = ctl.start(&desc).await.unwrap();
        let second = ctl.start(&desc).await.unwrap();

        assert_ne!(first.pid, second.pid);
        assert!(!ctl.is_alive(&first));
        assert!(ctl.is_alive(&second));

        let records = ctl.records().list().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].pid, second.pid);

        ctl.stop("core-api").await.unwrap();
        assert!(ctl.records().load("core-api").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stop_without_record_is_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(dir.path());
        assert!(matches!(ctl.stop("ghost").await, Err(WardenError::NotRunning(_))));
    }

    #[tokio::test]
    async fn test_stale_record_is_cleared_on_stop() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(dir.path());
        // pid far above any default pid_max
        ctl.records()
            .save(&ProcessRecord {
                service: "core-api".into(),
                pid: 2_000_000_000,
                log_file: log_path(&dir.path().join("logs"), "core-api"),
                created_at: Utc::now(),
            })
            .unwrap();

        assert!(matches!(ctl.stop("core-api").await, Err(WardenError::NotRunning(_))));
        assert!(ctl.records().load("core-api").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_immediate_exit_is_start_failed() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(dir.path());
        let desc = ServiceDescriptor::native("flaky", Phase::Core, "false", &[], "http://localhost:1/");
        let err = ctl.start(&desc).await.unwrap_err();
        assert!(matches!(err, WardenError::StartFailed { .. }));
        assert!(ctl.records().load("flaky").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_binary_is_start_failed() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(dir.path());
        let desc = ServiceDescriptor::native("nope", Phase::Core, "/definitely/not/here", &[], "http://localhost:1/");
        assert!(matches!(ctl.start(&desc).await, Err(WardenError::StartFailed { .. })));
    }

    #[tokio::test]
    async fn test_output_is_appended_to_service_log() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(dir.path());
        let log = log_path(&dir.path().join("logs"), "echoer");
        fs::create_dir_all(log.parent().unwrap()).unwrap();
        fs::write(&log, "earlier run\n").unwrap();

        let desc = ServiceDescriptor::native("echoer", Phase::Core, "sh", &["-c", "echo hello; sleep 30"], "http://localhost:1/");
        ctl.start(&desc).await.unwrap();
        ctl.stop("echoer").await.unwrap();

        let content = fs::read_to_string(&log).unwrap();
        assert!(content.starts_with("earlier run\n"));
        assert!(content.contains("hello"));
    }
}
