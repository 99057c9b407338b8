//! System probe and container runtime seams
//!
//! Everything the supervisor learns from or does to the host outside its own
//! files goes through these two traits, so orchestration logic never shells
//! out directly and tests can swap in fakes.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;
use warden_shared::{ContainerState, Result, StackRef, WardenError};

/// Working-tree state of the monitored repository
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VcsStatus {
    /// Paths (relative to the repo root) with uncommitted modifications
    pub modified: Vec<PathBuf>,
    /// Commits on the local branch not on upstream; `None` when unknown
    pub ahead: Option<u32>,
    /// Commits on upstream not on the local branch; `None` when unknown
    pub behind: Option<u32>,
}

/// Read-only questions about the host
#[async_trait]
pub trait SystemProbe: Send + Sync {
    /// Whether the OS still recognizes `pid` as a live process.
    ///
    /// A recycled pid belonging to a different process is reported alive.
    fn process_alive(&self, pid: u32) -> bool;

    async fn container_states(&self, stack: &StackRef) -> Result<Vec<ContainerState>>;

    async fn vcs_status(&self, repo: &Path, upstream: Option<&str>, paths: &[PathBuf]) -> Result<VcsStatus>;
}

/// Mutating operations on container stacks
#[async_trait]
pub trait StackRuntime: Send + Sync {
    async fn up(&self, stack: &StackRef) -> Result<()>;
    async fn down(&self, stack: &StackRef) -> Result<()>;
}

/// The real host: `kill(2)` for liveness, the docker CLI for stacks, git for VCS state
#[derive(Debug, Clone)]
pub struct HostSystem {
    project_root: PathBuf,
    docker_bin: String,
    git_bin: String,
}

impl HostSystem {
    pub fn new(project_root: impl Into<PathBuf>, docker_bin: impl Into<String>) -> Self {
        Self {
            project_root: project_root.into(),
            docker_bin: docker_bin.into(),
            git_bin: "git".to_string(),
        }
    }

    fn compose_args(&self, stack: &StackRef) -> Vec<String> {
        let compose_file = if stack.compose_file.is_absolute() {
            stack.compose_file.clone()
        } else {
            self.project_root.join(&stack.compose_file)
        };
        let mut args = vec![
            "compose".to_string(),
            "-f".to_string(),
            compose_file.to_string_lossy().into_owned(),
        ];
        if let Some(project) = &stack.project {
            args.push("-p".to_string());
            args.push(project.clone());
        }
        args
    }
}

#[async_trait]
impl SystemProbe for HostSystem {
    fn process_alive(&self, pid: u32) -> bool {
        pid_alive(pid)
    }

    async fn container_states(&self, stack: &StackRef) -> Result<Vec<ContainerState>> {
        let mut args = self.compose_args(stack);
        args.extend(["ps", "--all", "--format", "json"].map(String::from));
        args.extend(stack.services.iter().cloned());
        let output = run_command(&self.docker_bin, &args, &self.project_root).await?;
        parse_compose_ps(&output)
    }

    async fn vcs_status(&self, repo: &Path, upstream: Option<&str>, paths: &[PathBuf]) -> Result<VcsStatus> {
        let mut args = vec!["status".to_string(), "--porcelain".to_string(), "--".to_string()];
        args.extend(paths.iter().map(|p| p.to_string_lossy().into_owned()));
        let porcelain = run_command(&self.git_bin, &args, repo).await?;

        let upstream = upstream.unwrap_or("@{upstream}");
        let range = format!("HEAD...{}", upstream);
        let counts = run_command(
            &self.git_bin,
            &["rev-list".to_string(), "--left-right".to_string(), "--count".to_string(), range],
            repo,
        )
        .await;

        let (ahead, behind) = match counts {
            Ok(out) => parse_ahead_behind(&out),
            Err(e) => {
                debug!(error = %e, "upstream comparison unavailable");
                (None, None)
            }
        };

        Ok(VcsStatus {
            modified: parse_porcelain(&porcelain),
            ahead,
            behind,
        })
    }
}

#[async_trait]
impl StackRuntime for HostSystem {
    async fn up(&self, stack: &StackRef) -> Result<()> {
        let mut args = self.compose_args(stack);
        args.extend(["up", "-d"].map(String::from));
        args.extend(stack.services.iter().cloned());
        run_command(&self.docker_bin, &args, &self.project_root).await.map(|_| ())
    }

    async fn down(&self, stack: &StackRef) -> Result<()> {
        let mut args = self.compose_args(stack);
        if stack.services.is_empty() {
            args.push("down".to_string());
        } else {
            // `down` ignores service names; stop only the selected ones
            args.push("stop".to_string());
            args.extend(stack.services.iter().cloned());
        }
        run_command(&self.docker_bin, &args, &self.project_root).await.map(|_| ())
    }
}

/// Run a command to completion and return its stdout, or its stderr as the error
pub async fn run_command(program: &str, args: &[String], cwd: &Path) -> Result<String> {
    let rendered = format!("{} {}", program, args.join(" "));
    debug!(command = %rendered, "running");
    let output = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .output()
        .await
        .map_err(|e| WardenError::Command {
            command: rendered.clone(),
            reason: e.to_string(),
        })?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(WardenError::Command {
            command: rendered,
            reason: format!("{}: {}", output.status, stderr.trim()),
        })
    }
}

#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    // SAFETY: signal 0 performs only the existence and permission check
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return !is_zombie(pid);
    }
    // EPERM: the process exists but belongs to someone else
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    false
}

/// Exited-but-unreaped processes still answer `kill(pid, 0)`
#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    std::fs::read_to_string(format!("/proc/{}/stat", pid))
        .ok()
        .and_then(|stat| {
            // The command name may contain spaces or parens; the state follows the last ')'
            let rest = &stat[stat.rfind(')')? + 1..];
            rest.split_whitespace().next().map(|state| state == "Z")
        })
        .unwrap_or(false)
}

#[cfg(all(unix, not(target_os = "linux")))]
fn is_zombie(_pid: u32) -> bool {
    false
}

/// Parse `docker compose ps --format json`, which is either a JSON array
/// (older compose) or one JSON object per line (newer compose)
pub fn parse_compose_ps(output: &str) -> Result<Vec<ContainerState>> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let values: Vec<serde_json::Value> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed)?
    } else {
        trimmed
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(serde_json::from_str)
            .collect::<std::result::Result<_, _>>()?
    };

    Ok(values
        .iter()
        .map(|v| {
            let field = |key: &str| v.get(key).and_then(|x| x.as_str()).unwrap_or_default().to_string();
            let name = Some(field("Name"))
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| field("Service"));
            ContainerState {
                name,
                state: field("State"),
            }
        })
        .collect())
}

/// Paths from `git status --porcelain` (v1); renames report the new path
pub fn parse_porcelain(output: &str) -> Vec<PathBuf> {
    output
        .lines()
        .filter(|l| l.len() > 3)
        .map(|l| {
            let path = &l[3..];
            let path = path.rsplit(" -> ").next().unwrap_or(path);
            PathBuf::from(path.trim_matches('"'))
        })
        .collect()
}

/// Parse `git rev-list --left-right --count HEAD...upstream` output: "<ahead>\t<behind>"
pub fn parse_ahead_behind(output: &str) -> (Option<u32>, Option<u32>) {
    let mut parts = output.split_whitespace().map(|p| p.parse::<u32>().ok());
    let ahead = parts.next().flatten();
    let behind = parts.next().flatten();
    (ahead, behind)
}
