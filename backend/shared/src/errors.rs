//! Error types for Warden

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for the Warden supervisor
#[derive(Error, Debug)]
pub enum WardenError {
    // Load-time errors
    #[error("Invalid service descriptors: {0}")]
    Load(String),

    #[error("Config error: {0}")]
    Config(String),

    // Process lifecycle errors
    #[error("Failed to start {service}: {reason}")]
    StartFailed { service: String, reason: String },

    #[error("Service not running: {0}")]
    NotRunning(String),

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    // Stack errors
    #[error("Failed to bring up stack {stack}: {reason}")]
    StackStartFailed { stack: String, reason: String },

    #[error("Stack query failed for {stack}: {reason}")]
    StackQuery { stack: String, reason: String },

    // Health errors
    #[error("{service} not ready after {attempts} attempts")]
    HealthTimeout { service: String, attempts: u32 },

    // Drift errors
    #[error("Configuration drift in {0}")]
    DriftFound(PathBuf),

    #[error("No safe rewrite known for {path}: {reason}")]
    RemediationBlocked { path: PathBuf, reason: String },

    // Backup errors
    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("Snapshot {id} is incomplete: {reason}")]
    RestoreIncomplete { id: String, reason: String },

    // External command errors
    #[error("Command `{command}` failed: {reason}")]
    Command { command: String, reason: String },

    // Infrastructure errors
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl WardenError {
    /// Wrap an I/O error together with the path it happened on
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Process exit status when this error ends a CLI command
    pub fn exit_status(&self) -> u8 {
        match self {
            Self::Load(_) | Self::Config(_) => 2,
            _ => 1,
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Self::ServiceNotFound(_) | Self::SnapshotNotFound(_) => 404,
            Self::Load(_) | Self::Config(_) => 400,
            Self::NotRunning(_) => 409,
            Self::RestoreIncomplete { .. } => 422,
            Self::StartFailed { .. }
            | Self::StackStartFailed { .. }
            | Self::StackQuery { .. }
            | Self::Command { .. } => 502,
            Self::HealthTimeout { .. } => 504,
            _ => 500,
        }
    }

    /// Get the error code for API responses and logs
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Load(_) => "LOAD_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            Self::StartFailed { .. } => "START_FAILED",
            Self::NotRunning(_) => "NOT_RUNNING",
            Self::ServiceNotFound(_) => "SERVICE_NOT_FOUND",
            Self::StackStartFailed { .. } => "STACK_START_FAILED",
            Self::StackQuery { .. } => "STACK_QUERY_FAILED",
            Self::HealthTimeout { .. } => "HEALTH_TIMEOUT",
            Self::DriftFound(_) => "DRIFT_FOUND",
            Self::RemediationBlocked { .. } => "REMEDIATION_BLOCKED",
            Self::SnapshotNotFound(_) => "SNAPSHOT_NOT_FOUND",
            Self::RestoreIncomplete { .. } => "RESTORE_INCOMPLETE",
            Self::Command { .. } => "COMMAND_FAILED",
            Self::Io { .. } => "IO_ERROR",
            Self::Json(_) => "JSON_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// Result type alias for Warden operations
pub type Result<T> = std::result::Result<T, WardenError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_status() {
        assert_eq!(WardenError::Load("duplicate name".into()).exit_status(), 2);
        assert_eq!(WardenError::Config("bad toml".into()).exit_status(), 2);
        assert_eq!(
            WardenError::RestoreIncomplete {
                id: "20260101-000000".into(),
                reason: "manifest.json missing".into()
            }
            .exit_status(),
            1
        );
    }

    #[test]
    fn test_error_codes() {
        let err = WardenError::StartFailed {
            service: "core-api".into(),
            reason: "No such file or directory".into(),
        };
        assert_eq!(err.error_code(), "START_FAILED");
        assert_eq!(err.status_code(), 502);
        assert_eq!(err.to_string(), "Failed to start core-api: No such file or directory");
    }
}
