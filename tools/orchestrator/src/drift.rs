//! Drift Detector
//!
//! Scans the monitored configuration files for superseded values and missing
//! required values, and checks the repository for uncommitted edits or
//! upstream commits. Every finding is appended to the alert log before any
//! remediation decision is made.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use warden_shared::fsutil::append_line;
use warden_shared::{DriftFinding, DriftRule, Result, Severity, WardenError};

use crate::config::{DriftConfig, MonitoredFile, Replacement, WardenConfig};
use crate::probe::SystemProbe;
use crate::remediation::{RemediationEngine, RemediationReport};

// ============================================================================
// Rules
// ============================================================================

/// Drift rules with every path resolved against the project root
#[derive(Debug, Clone, Default)]
pub struct DriftRules {
    pub replacements: Vec<Replacement>,
    pub forbidden: Vec<String>,
    pub files: Vec<MonitoredFile>,
    pub repo: Option<PathBuf>,
    pub upstream: Option<String>,
}

impl DriftRules {
    pub fn new(drift: &DriftConfig, project_root: &Path) -> Self {
        let resolve = |p: &Path| if p.is_absolute() { p.to_path_buf() } else { project_root.join(p) };
        Self {
            replacements: drift.replacements.clone(),
            forbidden: drift.forbidden.clone(),
            files: drift
                .files
                .iter()
                .map(|f| MonitoredFile {
                    path: resolve(&f.path),
                    ..f.clone()
                })
                .collect(),
            repo: drift.repo.as_deref().map(resolve),
            upstream: drift.upstream.clone(),
        }
    }

    pub fn from_config(config: &WardenConfig) -> Self {
        Self::new(&config.drift, &config.project_root)
    }

    /// Superseded values followed by values with no replacement, deduplicated
    pub fn forbidden_values(&self) -> Vec<&str> {
        let mut seen = BTreeSet::new();
        self.replacements
            .iter()
            .map(|r| r.superseded.as_str())
            .chain(self.forbidden.iter().map(String::as_str))
            .filter(|v| !v.is_empty() && seen.insert(*v))
            .collect()
    }

    pub fn file(&self, path: &Path) -> Option<&MonitoredFile> {
        self.files.iter().find(|f| f.path == path)
    }
}

/// Forbidden and required value checks for one file's content
pub fn scan_content(content: &str, file: &MonitoredFile, rules: &DriftRules) -> Vec<DriftFinding> {
    let mut findings = Vec::new();

    for value in rules.forbidden_values() {
        if content.contains(value) {
            let occurrences = content.matches(value).count();
            findings.push(
                DriftFinding::new(&file.path, DriftRule::ForbiddenValuePresent, Some(value.to_string()))
                    .with_detail(format!("{} occurrence(s)", occurrences)),
            );
        }
    }

    for value in &file.required {
        if !content.contains(value.as_str()) {
            findings.push(DriftFinding::new(
                &file.path,
                DriftRule::RequiredValueAbsent,
                Some(value.clone()),
            ));
        }
    }

    findings
}

// ============================================================================
// Alert Log
// ============================================================================

/// Append-only JSON lines, one finding per line
#[derive(Debug, Clone)]
pub struct AlertLog {
    path: PathBuf,
}

impl AlertLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, findings: &[DriftFinding]) -> Result<()> {
        for finding in findings {
            append_line(&self.path, &serde_json::to_string(finding)?)?;
        }
        Ok(())
    }
}

// ============================================================================
// Detector
// ============================================================================

pub struct DriftDetector {
    rules: Arc<DriftRules>,
    probe: Arc<dyn SystemProbe>,
    alerts: AlertLog,
}

impl DriftDetector {
    pub fn new(rules: Arc<DriftRules>, probe: Arc<dyn SystemProbe>, alerts: AlertLog) -> Self {
        Self { rules, probe, alerts }
    }

    pub fn rules(&self) -> &Arc<DriftRules> {
        &self.rules
    }

    /// One full scan; unreadable files are skipped with a warning
    pub async fn scan(&self) -> Vec<DriftFinding> {
        let mut findings = Vec::new();

        for file in &self.rules.files {
            match fs::read_to_string(&file.path) {
                Ok(content) => findings.extend(scan_content(&content, file, &self.rules)),
                Err(e) => warn!(file = %file.path.display(), error = %e, "monitored file unreadable, skipping"),
            }
        }

        if let Some(repo) = &self.rules.repo {
            findings.extend(self.scan_repo(repo).await);
        }

        for finding in &findings {
            let err = WardenError::DriftFound(finding.file.clone());
            warn!(
                file = %finding.file.display(),
                rule = %finding.rule,
                severity = %finding.severity,
                value = finding.value.as_deref().unwrap_or(""),
                code = err.error_code(),
                "drift found"
            );
        }
        debug!(findings = findings.len(), "drift scan complete");
        findings
    }

    async fn scan_repo(&self, repo: &Path) -> Vec<DriftFinding> {
        // Only monitored files inside the repository are version-controlled
        let tracked: Vec<PathBuf> = self
            .rules
            .files
            .iter()
            .filter_map(|f| f.path.strip_prefix(repo).ok().map(Path::to_path_buf))
            .collect();

        let status = match self
            .probe
            .vcs_status(repo, self.rules.upstream.as_deref(), &tracked)
            .await
        {
            Ok(status) => status,
            Err(e) => {
                warn!(repo = %repo.display(), error = %e, "version control status unavailable");
                return Vec::new();
            }
        };

        let mut findings: Vec<DriftFinding> = status
            .modified
            .iter()
            .filter(|p| tracked.contains(p))
            .map(|p| {
                DriftFinding::new(repo.join(p), DriftRule::UncommittedModification, None)
                    .with_detail("uncommitted changes in working tree")
            })
            .collect();

        if let Some(behind) = status.behind.filter(|b| *b > 0) {
            findings.push(
                DriftFinding::new(repo, DriftRule::UnexpectedUpstreamCommits, None)
                    .with_detail(format!("{} commit(s) behind upstream", behind)),
            );
        }
        findings
    }

    pub fn record(&self, findings: &[DriftFinding]) -> Result<()> {
        if findings.is_empty() {
            return Ok(());
        }
        self.alerts.append(findings)?;
        debug!(alerts = %self.alerts.path().display(), findings = findings.len(), "findings recorded");
        Ok(())
    }
}

/// Outcome of one scan, optionally followed by remediation
#[derive(Debug, Clone, Default, Serialize)]
pub struct DriftSweep {
    pub findings: Vec<DriftFinding>,
    pub remediation: Option<RemediationReport>,
}

impl DriftSweep {
    pub fn max_severity(&self) -> Option<Severity> {
        self.findings.iter().map(|f| f.severity).max()
    }
}

/// Scan, record every finding, then remediate when allowed and warranted
pub async fn sweep(
    detector: &DriftDetector,
    engine: &RemediationEngine,
    remediate: bool,
) -> Result<DriftSweep> {
    let findings = detector.scan().await;
    detector.record(&findings)?;

    let needs_remediation = findings.iter().any(|f| f.severity >= Severity::High);
    let remediation = if remediate && needs_remediation {
        let report = engine.remediate(&findings)?;
        detector.record(&report.blocked)?;
        Some(report)
    } else {
        None
    };

    Ok(DriftSweep { findings, remediation })
}

// ============================================================================
// Periodic Guard
// ============================================================================

/// Recurring scan owned by the daemon's scheduler
pub struct DriftGuard {
    detector: Arc<DriftDetector>,
    engine: Arc<RemediationEngine>,
    period: Duration,
}

impl DriftGuard {
    pub fn new(detector: Arc<DriftDetector>, engine: Arc<RemediationEngine>, period: Duration) -> Self {
        Self {
            detector,
            engine,
            period: period.max(Duration::from_secs(1)),
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = self.period.as_secs(), "drift guard started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match sweep(&self.detector, &self.engine, true).await {
                        Ok(result) if result.findings.is_empty() => debug!("no drift"),
                        Ok(result) => info!(
                            findings = result.findings.len(),
                            remediated = result.remediation.as_ref().map_or(0, |r| r.rewritten.len()),
                            "drift sweep finished"
                        ),
                        Err(e) => error!(error = %e, "drift sweep failed"),
                    }
                }
            }
        }
        info!("drift guard stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FileRole;
    use crate::probe::VcsStatus;
    use async_trait::async_trait;
    use warden_shared::{ContainerState, StackRef};

    /// Probe reporting a fixed VCS state
    #[derive(Default)]
    struct FakeVcs {
        status: VcsStatus,
    }

    #[async_trait]
    impl SystemProbe for FakeVcs {
        fn process_alive(&self, _pid: u32) -> bool {
            false
        }

        async fn container_states(&self, _stack: &StackRef) -> Result<Vec<ContainerState>> {
            Ok(Vec::new())
        }

        async fn vcs_status(&self, _repo: &Path, _upstream: Option<&str>, _paths: &[PathBuf]) -> Result<VcsStatus> {
            Ok(self.status.clone())
        }
    }

    fn env_rules(dir: &Path) -> DriftRules {
        let config = DriftConfig {
            replacements: vec![Replacement {
                superseded: "localhost:11001".into(),
                current: "localhost:11000".into(),
            }],
            files: vec![MonitoredFile {
                path: PathBuf::from("apps/frontend/.env"),
                role: FileRole::FrontendEnv,
                required: vec!["API_URL=http://localhost:11000".into()],
            }],
            ..DriftConfig::default()
        };
        DriftRules::new(&config, dir)
    }

    fn detector(dir: &Path, probe: Arc<dyn SystemProbe>) -> DriftDetector {
        DriftDetector::new(
            Arc::new(env_rules(dir)),
            probe,
            AlertLog::new(dir.join(".warden/alerts.jsonl")),
        )
    }

    #[tokio::test]
    async fn test_forbidden_value_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let env = dir.path().join("apps/frontend/.env");
        fs::create_dir_all(env.parent().unwrap()).unwrap();
        fs::write(&env, "API_URL=http://localhost:11000\nTITLE=Platform\n").unwrap();
        let detector = detector(dir.path(), Arc::new(FakeVcs::default()));

        assert!(detector.scan().await.is_empty());

        fs::write(
            &env,
            "API_URL=http://localhost:11000\nTITLE=Platform\nLEGACY=http://localhost:11001\n",
        )
        .unwrap();
        let findings = detector.scan().await;
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].rule, DriftRule::ForbiddenValuePresent);
        assert_eq!(findings[0].severity, Severity::High);
        assert_eq!(findings[0].file, env);

        fs::write(&env, "API_URL=http://localhost:11000\nTITLE=Platform\n").unwrap();
        let findings = detector.scan().await;
        assert!(findings.iter().all(|f| f.rule != DriftRule::ForbiddenValuePresent));
        assert!(findings.is_empty());
    }

    #[test]
    fn test_missing_required_value() {
        let dir = tempfile::tempdir().unwrap();
        let rules = env_rules(dir.path());
        let findings = scan_content("TITLE=Platform\n", &rules.files[0], &rules);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].rule, DriftRule::RequiredValueAbsent);
        assert_eq!(findings[0].value.as_deref(), Some("API_URL=http://localhost:11000"));
    }

    #[tokio::test]
    async fn test_missing_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let detector = detector(dir.path(), Arc::new(FakeVcs::default()));
        assert!(detector.scan().await.is_empty());
    }

    #[tokio::test]
    async fn test_repo_state_findings() {
        let dir = tempfile::tempdir().unwrap();
        let env = dir.path().join("apps/frontend/.env");
        fs::create_dir_all(env.parent().unwrap()).unwrap();
        fs::write(&env, "API_URL=http://localhost:11000\n").unwrap();

        let mut rules = env_rules(dir.path());
        rules.repo = Some(dir.path().to_path_buf());
        let probe = FakeVcs {
            status: VcsStatus {
                modified: vec![PathBuf::from("apps/frontend/.env"), PathBuf::from("README.md")],
                ahead: Some(0),
                behind: Some(2),
            },
        };
        let detector = DriftDetector::new(
            Arc::new(rules),
            Arc::new(probe),
            AlertLog::new(dir.path().join("alerts.jsonl")),
        );

        let findings = detector.scan().await;
        let rules: Vec<_> = findings.iter().map(|f| f.rule).collect();
        assert_eq!(
            rules,
            vec![DriftRule::UncommittedModification, DriftRule::UnexpectedUpstreamCommits]
        );
        assert!(findings.iter().all(|f| f.severity == Severity::Medium));
    }

    #[tokio::test]
    async fn test_findings_recorded_before_remediation() {
        let dir = tempfile::tempdir().unwrap();
        let env = dir.path().join("apps/frontend/.env");
        fs::create_dir_all(env.parent().unwrap()).unwrap();
        fs::write(&env, "API_URL=http://localhost:11001\n").unwrap();

        let detector = detector(dir.path(), Arc::new(FakeVcs::default()));
        let engine = RemediationEngine::new(detector.rules().clone(), dir.path().join(".warden/emergency"));

        let result = sweep(&detector, &engine, false).await.unwrap();
        assert_eq!(result.findings.len(), 2);
        assert!(result.remediation.is_none());

        let log = fs::read_to_string(dir.path().join(".warden/alerts.jsonl")).unwrap();
        let logged: Vec<DriftFinding> = log.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(logged.len(), 2);
        // scan-only leaves the file alone
        assert_eq!(fs::read_to_string(&env).unwrap(), "API_URL=http://localhost:11001\n");
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
    async fn test_guard_records_and_remediates_on_its_own() {
        let dir = tempfile::tempdir().unwrap();
        let env = dir.path().join("apps/frontend/.env");
        fs::create_dir_all(env.parent().unwrap()).unwrap();
        fs::write(&env, "API_URL=http://localhost:11001\n").unwrap();

        let detector = Arc::new(detector(dir.path(), Arc::new(FakeVcs::default())));
        let engine = Arc::new(RemediationEngine::new(
            detector.rules().clone(),
            dir.path().join(".warden/emergency"),
        ));
        let cancel = CancellationToken::new();
        let guard = tokio::spawn(DriftGuard::new(detector, engine, Duration::from_secs(1)).run(cancel.clone()));

        wait_for(|| fs::read_to_string(&env).map_or(false, |c| c == "API_URL=http://localhost:11000\n")).await;

        let log = fs::read_to_string(dir.path().join(".warden/alerts.jsonl")).unwrap();
        let logged: Vec<DriftFinding> = log.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert!(logged
            .iter()
            .any(|f| f.rule == DriftRule::ForbiddenValuePresent && f.file == env));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), guard).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_guard_stops_when_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let detector = Arc::new(detector(dir.path(), Arc::new(FakeVcs::default())));
        let engine = Arc::new(RemediationEngine::new(
            detector.rules().clone(),
            dir.path().join(".warden/emergency"),
        ));
        let cancel = CancellationToken::new();
        let guard = tokio::spawn(DriftGuard::new(detector, engine, Duration::from_secs(3600)).run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!guard.is_finished());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), guard).await.unwrap().unwrap();
    }
}
