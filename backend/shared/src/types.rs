//! Core domain types for Warden

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Service Types
// ============================================================================

/// How the supervisor brings a service up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceCategory {
    /// Long-running native process owned by the supervisor
    Native,
    /// Compose-style container stack, managed as one unit
    Stack,
    /// Started elsewhere; only probed
    External,
}

impl fmt::Display for ServiceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceCategory::Native => write!(f, "native"),
            ServiceCategory::Stack => write!(f, "stack"),
            ServiceCategory::External => write!(f, "external"),
        }
    }
}

/// Startup phases, strictly forward within one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Phase {
    Prereqs,
    Core,
    Auxiliary,
    Containers,
    Verify,
    Done,
}

impl Phase {
    /// Phases a descriptor may declare, in execution order
    pub const DECLARABLE: [Phase; 4] = [Phase::Prereqs, Phase::Core, Phase::Auxiliary, Phase::Containers];

    pub fn ordinal(self) -> u8 {
        match self {
            Phase::Prereqs => 0,
            Phase::Core => 1,
            Phase::Auxiliary => 2,
            Phase::Containers => 3,
            Phase::Verify => 4,
            Phase::Done => 5,
        }
    }

    /// The phase that follows this one; `Done` is terminal
    pub fn next(self) -> Phase {
        match self {
            Phase::Prereqs => Phase::Core,
            Phase::Core => Phase::Auxiliary,
            Phase::Auxiliary => Phase::Containers,
            Phase::Containers => Phase::Verify,
            Phase::Verify | Phase::Done => Phase::Done,
        }
    }
}

impl TryFrom<u8> for Phase {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Phase::Prereqs),
            1 => Ok(Phase::Core),
            2 => Ok(Phase::Auxiliary),
            3 => Ok(Phase::Containers),
            other => Err(format!("phase must be between 0 and 3, got {}", other)),
        }
    }
}

impl From<Phase> for u8 {
    fn from(phase: Phase) -> u8 {
        phase.ordinal()
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Prereqs => "prereqs",
            Phase::Core => "core",
            Phase::Auxiliary => "auxiliary",
            Phase::Containers => "containers",
            Phase::Verify => "verify",
            Phase::Done => "done",
        };
        write!(f, "{}", name)
    }
}

/// Readiness probe target for a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthTarget {
    pub url: String,
    /// Accepted status codes; empty means any 2xx/3xx
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expect_status: Vec<u16>,
}

impl HealthTarget {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            expect_status: Vec::new(),
        }
    }

    /// Whether an HTTP status counts as ready for this target
    pub fn accepts(&self, status: u16) -> bool {
        if self.expect_status.is_empty() {
            (200..400).contains(&status)
        } else {
            self.expect_status.contains(&status)
        }
    }
}

/// Reference to a compose-managed container stack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackRef {
    pub compose_file: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    /// Restrict to these compose services; empty means the whole file
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<String>,
}

/// Static, declarative description of one supervised service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub name: String,
    pub category: ServiceCategory,
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<StackRef>,
    pub health: HealthTarget,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,
    /// Informational; ordering is enforced through `phase`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

impl ServiceDescriptor {
    /// Minimal native-process descriptor; mostly useful for tests and `init`
    pub fn native(name: &str, phase: Phase, command: &str, args: &[&str], health_url: &str) -> Self {
        Self {
            name: name.to_string(),
            category: ServiceCategory::Native,
            phase,
            command: Some(command.to_string()),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: HashMap::new(),
            working_dir: None,
            stack: None,
            health: HealthTarget::new(health_url),
            ports: Vec::new(),
            public_url: None,
            depends_on: Vec::new(),
        }
    }
}

// ============================================================================
// Process Types
// ============================================================================

/// Persisted identity of a running native-process service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub service: String,
    pub pid: u32,
    pub log_file: PathBuf,
    pub created_at: DateTime<Utc>,
}

/// Aggregate state of one container reported by the runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerState {
    pub name: String,
    pub state: String,
}

impl ContainerState {
    pub fn is_running(&self) -> bool {
        self.state.eq_ignore_ascii_case("running")
    }
}

/// Closed set of stack operations exposed over the control API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StackAction {
    Up,
    Down,
    Restart,
    Status,
}

// ============================================================================
// Health Types
// ============================================================================

/// What the last probe attempt observed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ProbeResponse {
    Status(u16),
    Timeout,
    Error(String),
    NotAttempted,
}

impl fmt::Display for ProbeResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeResponse::Status(code) => write!(f, "HTTP {}", code),
            ProbeResponse::Timeout => write!(f, "timeout"),
            ProbeResponse::Error(e) => write!(f, "{}", e),
            ProbeResponse::NotAttempted => write!(f, "not attempted"),
        }
    }
}

/// Outcome of a bounded readiness wait
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub service: String,
    pub attempts: u32,
    pub ready: bool,
    pub last_response: ProbeResponse,
}

// ============================================================================
// Drift Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Integrity rule a finding violates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DriftRule {
    ForbiddenValuePresent,
    RequiredValueAbsent,
    UnexpectedUpstreamCommits,
    UncommittedModification,
    RemediationBlocked,
}

impl DriftRule {
    /// Fixed rule-to-severity mapping
    pub fn severity(self) -> Severity {
        match self {
            DriftRule::ForbiddenValuePresent | DriftRule::RequiredValueAbsent => Severity::High,
            DriftRule::UnexpectedUpstreamCommits | DriftRule::UncommittedModification => Severity::Medium,
            DriftRule::RemediationBlocked => Severity::Critical,
        }
    }
}

impl fmt::Display for DriftRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DriftRule::ForbiddenValuePresent => "forbidden-value-present",
            DriftRule::RequiredValueAbsent => "required-value-absent",
            DriftRule::UnexpectedUpstreamCommits => "unexpected-upstream-commits",
            DriftRule::UncommittedModification => "uncommitted-modification",
            DriftRule::RemediationBlocked => "remediation-blocked",
        };
        write!(f, "{}", name)
    }
}

/// One integrity violation found by a drift scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftFinding {
    pub file: PathBuf,
    pub rule: DriftRule,
    pub severity: Severity,
    /// The offending or missing value, when the rule is value-based
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub detected_at: DateTime<Utc>,
}

impl DriftFinding {
    pub fn new(file: impl Into<PathBuf>, rule: DriftRule, value: Option<String>) -> Self {
        Self {
            file: file.into(),
            rule,
            severity: rule.severity(),
            value,
            detail: None,
            detected_at: Utc::now(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

// ============================================================================
// Backup Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupCategory {
    Proxy,
    Certificate,
    Settings,
}

impl BackupCategory {
    /// Subdirectory of a snapshot holding this category
    pub fn dir_name(self) -> &'static str {
        match self {
            BackupCategory::Proxy => "proxy",
            BackupCategory::Certificate => "certs",
            BackupCategory::Settings => "settings",
        }
    }
}

/// One file captured into a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupEntry {
    pub category: BackupCategory,
    /// Absolute path the file was captured from and is restored to
    pub source: PathBuf,
    /// Path relative to the snapshot root
    pub stored: PathBuf,
    pub mode: u32,
    /// Of the file content, or of the link target for a symlink
    pub sha256: String,
    /// Target of a symbolic link; nothing is stored under `stored` for it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<PathBuf>,
}

/// Result of one inventory command run during a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryOutcome {
    pub name: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Metadata manifest written at the root of every snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub hostname: String,
    pub entries: Vec<BackupEntry>,
    #[serde(default)]
    pub inventory: Vec<InventoryOutcome>,
}

/// A complete, published snapshot on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupSnapshot {
    pub id: String,
    pub root: PathBuf,
    pub manifest: BackupManifest,
}

// ============================================================================
// Status Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Up,
    Down,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceState::Up => write!(f, "up"),
            ServiceState::Down => write!(f, "down"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatusEntry {
    pub name: String,
    pub category: ServiceCategory,
    pub phase: Phase,
    pub ports: Vec<u16>,
    pub state: ServiceState,
    pub local_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Machine-readable platform status, regenerated wholesale on every run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformStatusSnapshot {
    pub generated_at: DateTime<Utc>,
    pub services: Vec<ServiceStatusEntry>,
}

impl PlatformStatusSnapshot {
    pub fn get(&self, name: &str) -> Option<&ServiceStatusEntry> {
        self.services.iter().find(|s| s.name == name)
    }

    pub fn up_count(&self) -> usize {
        self.services.iter().filter(|s| s.state == ServiceState::Up).count()
    }
}

// ============================================================================
// API Response Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<ApiError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ApiError {
                code: code.into(),
                message: message.into(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_ordering_is_forward() {
        let mut phase = Phase::Prereqs;
        let mut seen = vec![phase];
        while phase != Phase::Done {
            phase = phase.next();
            seen.push(phase);
        }
        assert_eq!(
            seen,
            vec![Phase::Prereqs, Phase::Core, Phase::Auxiliary, Phase::Containers, Phase::Verify, Phase::Done]
        );
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_phase_rejects_undeclarable_ordinals() {
        assert_eq!(Phase::try_from(1), Ok(Phase::Core));
        assert!(Phase::try_from(4).is_err());
        assert!(serde_json::from_str::<Phase>("7").is_err());
    }

    #[test]
    fn test_health_target_default_predicate() {
        let target = HealthTarget::new("http://localhost:11000/healthz");
        assert!(target.accepts(200));
        assert!(target.accepts(302));
        assert!(!target.accepts(404));
        assert!(!target.accepts(503));

        let strict = HealthTarget {
            url: target.url.clone(),
            expect_status: vec![204],
        };
        assert!(strict.accepts(204));
        assert!(!strict.accepts(200));
    }

    #[test]
    fn test_severity_mapping() {
        assert_eq!(DriftRule::ForbiddenValuePresent.severity(), Severity::High);
        assert_eq!(DriftRule::RequiredValueAbsent.severity(), Severity::High);
        assert_eq!(DriftRule::UnexpectedUpstreamCommits.severity(), Severity::Medium);
        assert_eq!(DriftRule::RemediationBlocked.severity(), Severity::Critical);
        assert!(Severity::Critical > Severity::High);
    }

    #[test]
    fn test_stack_action_wire_names() {
        let action: StackAction = serde_json::from_str("\"restart\"").unwrap();
        assert_eq!(action, StackAction::Restart);
        assert!(serde_json::from_str::<StackAction>("\"explode\"").is_err());
    }
}
