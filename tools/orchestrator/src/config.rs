//! Configuration file model and loading
//!
//! The whole supervisor is driven by one TOML file. Relative paths inside it
//! resolve against `project_root`, which itself resolves against the
//! directory holding the config file.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use warden_shared::{
    HealthTarget, Phase, Result, ServiceCategory, ServiceDescriptor, StackRef, WardenError,
};

pub const DEFAULT_CONFIG_FILE: &str = "warden.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WardenConfig {
    #[serde(default = "default_project_root")]
    pub project_root: PathBuf,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub process: ProcessConfig,
    #[serde(default)]
    pub stacks: StackConfig,
    #[serde(default)]
    pub services: Vec<ServiceDescriptor>,
    #[serde(default)]
    pub drift: DriftConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub max_attempts: u32,
    pub interval_ms: u64,
    pub attempt_timeout_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            interval_ms: 1000,
            attempt_timeout_ms: 2000,
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// How long a stopped process gets between SIGTERM and SIGKILL
    pub stop_timeout_ms: u64,
    pub poll_interval_ms: u64,
    /// Delay after spawn before checking the child did not exit immediately
    pub startup_check_ms: u64,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            stop_timeout_ms: 5000,
            poll_interval_ms: 100,
            startup_check_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    /// Single best-effort wait after issuing `up`
    pub grace_ms: u64,
    pub docker_bin: String,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            grace_ms: 2000,
            docker_bin: "docker".to_string(),
        }
    }
}

/// A superseded value together with the value that replaced it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replacement {
    pub superseded: String,
    pub current: String,
}

/// Role of a monitored file; decides which minimal rewrites are safe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileRole {
    ProxySite,
    AppSettings,
    FrontendEnv,
    StartupScript,
    Dashboard,
    #[serde(other)]
    Unrecognized,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoredFile {
    pub path: PathBuf,
    pub role: FileRole,
    #[serde(default)]
    pub required: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftConfig {
    pub interval_secs: u64,
    /// Repository root to check for uncommitted changes and upstream drift
    pub repo: Option<PathBuf>,
    /// Upstream ref to compare against; defaults to the branch's tracking ref
    pub upstream: Option<String>,
    pub replacements: Vec<Replacement>,
    /// Forbidden values with no known replacement
    pub forbidden: Vec<String>,
    pub files: Vec<MonitoredFile>,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            repo: None,
            upstream: None,
            replacements: Vec::new(),
            forbidden: Vec::new(),
            files: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryCommand {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub root: PathBuf,
    /// Enables the scheduled snapshot task in daemon mode
    pub interval_secs: Option<u64>,
    pub proxy: Vec<PathBuf>,
    pub certs: Vec<PathBuf>,
    pub settings: Vec<PathBuf>,
    pub inventory: Vec<InventoryCommand>,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".warden/backups"),
            interval_secs: None,
            proxy: Vec::new(),
            certs: Vec::new(),
            settings: Vec::new(),
            inventory: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:11099".to_string(),
        }
    }
}

fn default_project_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".warden")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            project_root: default_project_root(),
            state_dir: default_state_dir(),
            log_dir: default_log_dir(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            health: HealthConfig::default(),
            process: ProcessConfig::default(),
            stacks: StackConfig::default(),
            services: Vec::new(),
            drift: DriftConfig::default(),
            backup: BackupConfig::default(),
            api: ApiConfig::default(),
        }
    }
}

impl WardenConfig {
    /// Resolve a configured path against the project root
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_root.join(path)
        }
    }

    pub fn state_dir(&self) -> PathBuf {
        self.resolve(&self.state_dir)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.resolve(&self.log_dir)
    }

    pub fn alert_log(&self) -> PathBuf {
        self.state_dir().join("alerts.jsonl")
    }

    /// Starter configuration written by `warden init`
    pub fn sample() -> Self {
        let mut core_api = ServiceDescriptor::native(
            "core-api",
            Phase::Core,
            "./bin/core-api",
            &["--port", "11000"],
            "http://localhost:11000/healthz",
        );
        core_api.ports = vec![11000];
        core_api.env = HashMap::from([("RUST_LOG".to_string(), "info".to_string())]);
        core_api.depends_on = vec!["ollama".to_string()];

        let mut aux_tool = ServiceDescriptor::native(
            "aux-tool",
            Phase::Auxiliary,
            "python3",
            &["-m", "aux_tool", "--port", "11010"],
            "http://localhost:11010/status",
        );
        aux_tool.working_dir = Some(PathBuf::from("apps/aux-tool"));
        aux_tool.depends_on = vec!["core-api".to_string()];

        let ollama = ServiceDescriptor {
            name: "ollama".to_string(),
            category: ServiceCategory::External,
            phase: Phase::Prereqs,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            stack: None,
            health: HealthTarget::new("http://localhost:11434/api/tags"),
            ports: vec![11434],
            public_url: None,
            depends_on: Vec::new(),
        };

        let search = ServiceDescriptor {
            name: "search".to_string(),
            category: ServiceCategory::Stack,
            phase: Phase::Containers,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            stack: Some(StackRef {
                compose_file: PathBuf::from("stacks/search/docker-compose.yml"),
                project: Some("search".to_string()),
                services: Vec::new(),
            }),
            health: HealthTarget::new("http://localhost:11020/"),
            ports: vec![11020],
            public_url: None,
            depends_on: vec!["core-api".to_string()],
        };

        Self {
            services: vec![ollama, core_api, aux_tool, search],
            drift: DriftConfig {
                replacements: vec![Replacement {
                    superseded: "localhost:11001".to_string(),
                    current: "localhost:11000".to_string(),
                }],
                files: vec![
                    MonitoredFile {
                        path: PathBuf::from("/etc/nginx/sites-enabled/platform"),
                        role: FileRole::ProxySite,
                        required: vec!["proxy_pass http://localhost:11000".to_string()],
                    },
                    MonitoredFile {
                        path: PathBuf::from("apps/frontend/.env"),
                        role: FileRole::FrontendEnv,
                        required: vec!["API_URL=http://localhost:11000".to_string()],
                    },
                ],
                ..DriftConfig::default()
            },
            backup: BackupConfig {
                proxy: vec![PathBuf::from("/etc/nginx/sites-enabled/platform")],
                settings: vec![PathBuf::from("apps/frontend/.env")],
                inventory: vec![InventoryCommand {
                    name: "containers".to_string(),
                    command: "docker".to_string(),
                    args: vec!["ps".to_string(), "-a".to_string()],
                }],
                ..BackupConfig::default()
            },
            ..Self::default()
        }
    }
}

/// Parse a config from TOML text; `base_dir` anchors a relative `project_root`.
///
/// The resulting `project_root` is always absolute, so every path resolved
/// from it (backup sources, process logs, emergency captures) is too.
pub fn parse_config(text: &str, base_dir: &Path) -> Result<WardenConfig> {
    let mut config: WardenConfig =
        toml::from_str(text).map_err(|e| WardenError::Config(format!("Failed to parse config: {}", e)))?;
    let root = base_dir.join(&config.project_root);
    config.project_root = std::path::absolute(&root)
        .map_err(|e| WardenError::Config(format!("Cannot resolve project_root {}: {}", root.display(), e)))?;
    Ok(config)
}

pub fn load_config(path: &Path) -> Result<WardenConfig> {
    let text = fs::read_to_string(path)
        .map_err(|e| WardenError::Config(format!("Failed to read config {}: {}", path.display(), e)))?;
    let base_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    parse_config(&text, base_dir)
}

/// Write the sample config; refuses to clobber an existing file unless `force`
pub fn save_sample(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        return Err(WardenError::Config(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        )));
    }
    let content = toml::to_string_pretty(&WardenConfig::sample())
        .map_err(|e| WardenError::Config(format!("Failed to serialize config: {}", e)))?;
    fs::write(path, content).map_err(|e| WardenError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let text = r#"
            project_root = "platform"

            [health]
            max_attempts = 3

            [[services]]
            name = "core-api"
            category = "native"
            phase = 1
            command = "./core-api"
            health = { url = "http://localhost:11000/healthz" }
        "#;
        let config = parse_config(text, Path::new("/srv")).unwrap();
        assert_eq!(config.project_root, PathBuf::from("/srv/platform"));
        assert_eq!(config.health.max_attempts, 3);
        assert_eq!(config.health.interval_ms, 1000);
        assert_eq!(config.services.len(), 1);
        assert_eq!(config.services[0].phase, Phase::Core);
        assert_eq!(config.state_dir(), PathBuf::from("/srv/platform/.warden"));
    }

    #[test]
    fn test_relative_root_becomes_absolute() {
        let config = parse_config("project_root = \"platform\"\n", Path::new(".")).unwrap();
        assert!(config.project_root.is_absolute());
        assert!(config.project_root.ends_with("platform"));
        assert!(config
            .project_root
            .components()
            .all(|c| c != std::path::Component::CurDir));

        let default_root = parse_config("", Path::new(".")).unwrap();
        assert!(default_root.project_root.is_absolute());
        assert!(default_root.state_dir().is_absolute());
    }

    #[test]
    fn test_unknown_file_role_parses_as_unrecognized() {
        let text = r#"
            [[drift.files]]
            path = "docs/index.html"
            role = "mystery"
            required = ["11000"]
        "#;
        let config = parse_config(text, Path::new("/srv")).unwrap();
        assert_eq!(config.drift.files[0].role, FileRole::Unrecognized);
    }

    #[test]
    fn test_phase_out_of_range_is_a_config_error() {
        let text = r#"
            [[services]]
            name = "late"
            category = "external"
            phase = 9
            health = { url = "http://localhost:1/" }
        "#;
        let err = parse_config(text, Path::new("/srv")).unwrap_err();
        assert!(matches!(err, WardenError::Config(_)));
    }

    #[test]
    fn test_sample_round_trips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        save_sample(&path, false).unwrap();
        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded.services.len(), 4);
        assert!(save_sample(&path, false).is_err());
        save_sample(&path, true).unwrap();
    }
}
