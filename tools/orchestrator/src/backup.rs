//! Backup Manager
//!
//! Snapshots are staged under `.partial-{id}` and renamed into place only
//! once complete; the `latest` pointer moves after that. A snapshot that
//! fails validation is never partially restored.
//!
//! Symbolic links inside a captured directory are recorded as links, never
//! followed, so certificate trees made of links come back as links.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};
use warden_shared::checksum::{sha256_file, sha256_hex};
use warden_shared::fsutil::{
    atomic_symlink, atomic_write, atomic_write_mode, copy_file, file_mode, format_mode, strip_root,
};
use warden_shared::{
    BackupCategory, BackupEntry, BackupManifest, BackupSnapshot, InventoryOutcome, Result, StackRef, WardenError,
};

use crate::config::{InventoryCommand, WardenConfig};
use crate::probe::{run_command, SystemProbe};

const MANIFEST_FILE: &str = "manifest.json";
const RESTORE_SCRIPT: &str = "restore.sh";
const PERMISSIONS_FILE: &str = "certs/PERMISSIONS";
const CONTAINERS_FILE: &str = "containers/status.json";
const LATEST: &str = "latest";
const PARTIAL_PREFIX: &str = ".partial-";

fn inventory_file(name: &str) -> PathBuf {
    PathBuf::from(format!("inventory/{}.txt", name))
}

/// Id the `latest` pointer under `root` references, if that snapshot exists
pub fn latest_snapshot_id(root: &Path) -> Option<String> {
    let latest = root.join(LATEST);
    let id = match fs::read_link(&latest) {
        Ok(target) => target.file_name()?.to_string_lossy().into_owned(),
        Err(_) => fs::read_to_string(&latest).ok()?.trim().to_string(),
    };
    root.join(&id).is_dir().then_some(id)
}

pub struct BackupManager {
    root: PathBuf,
    project_root: PathBuf,
    config_path: PathBuf,
    sources: Vec<(BackupCategory, PathBuf)>,
    inventory: Vec<InventoryCommand>,
    stacks: Vec<(String, StackRef)>,
    probe: Arc<dyn SystemProbe>,
}

impl BackupManager {
    pub fn from_config(config: &WardenConfig, config_path: &Path, probe: Arc<dyn SystemProbe>) -> Self {
        let backup = &config.backup;
        let sources = [
            (BackupCategory::Certificate, &backup.certs),
            (BackupCategory::Proxy, &backup.proxy),
            (BackupCategory::Settings, &backup.settings),
        ]
        .into_iter()
        .flat_map(|(category, paths)| paths.iter().map(move |p| (category, config.resolve(p))))
        .collect();

        let stacks = config
            .services
            .iter()
            .filter_map(|s| s.stack.clone().map(|stack| (s.name.clone(), stack)))
            .collect();

        let config_path = fs::canonicalize(config_path).unwrap_or_else(|_| config_path.to_path_buf());

        Self {
            root: config.resolve(&backup.root),
            project_root: config.project_root.clone(),
            config_path,
            sources,
            inventory: backup.inventory.clone(),
            stacks,
            probe,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // ========================================================================
    // Snapshot
    // ========================================================================

    pub async fn snapshot(&self) -> Result<BackupSnapshot> {
        fs::create_dir_all(&self.root).map_err(|e| WardenError::io(&self.root, e))?;
        let id = self.next_id();
        let staging = self.root.join(format!("{}{}", PARTIAL_PREFIX, id));
        fs::create_dir_all(&staging).map_err(|e| WardenError::io(&staging, e))?;

        let manifest = match self.fill(&staging, &id).await {
            Ok(manifest) => manifest,
            Err(e) => {
                fs::remove_dir_all(&staging).ok();
                return Err(e);
            }
        };

        let published = self.root.join(&id);
        fs::rename(&staging, &published).map_err(|e| WardenError::io(&published, e))?;
        self.point_latest_at(&id)?;

        info!(
            snapshot = %id,
            files = manifest.entries.len(),
            dir = %published.display(),
            "backup snapshot published"
        );
        Ok(BackupSnapshot {
            id,
            root: published,
            manifest,
        })
    }

    fn next_id(&self) -> String {
        let base = Utc::now().format("%Y%m%d-%H%M%S").to_string();
        let taken = |id: &str| {
            self.root.join(id).exists() || self.root.join(format!("{}{}", PARTIAL_PREFIX, id)).exists()
        };
        if !taken(&base) {
            return base;
        }
        let mut n = 1;
        loop {
            let id = format!("{}-{}", base, n);
            if !taken(&id) {
                return id;
            }
            n += 1;
        }
    }

    async fn fill(&self, staging: &Path, id: &str) -> Result<BackupManifest> {
        let mut entries = Vec::new();
        for (category, source) in &self.sources {
            if !source.exists() {
                warn!(category = category.dir_name(), path = %source.display(), "backup source missing, skipping");
                continue;
            }
            for file in collect_files(source)? {
                let stored = Path::new(category.dir_name()).join(strip_root(&file));
                let meta = fs::symlink_metadata(&file).map_err(|e| WardenError::io(&file, e))?;
                if meta.file_type().is_symlink() {
                    let target = fs::read_link(&file).map_err(|e| WardenError::io(&file, e))?;
                    entries.push(BackupEntry {
                        category: *category,
                        mode: 0o777,
                        sha256: sha256_hex(target.to_string_lossy().as_bytes()),
                        source: file,
                        stored,
                        link: Some(target),
                    });
                    continue;
                }

                let target = staging.join(&stored);
                copy_file(&file, &target)?;
                entries.push(BackupEntry {
                    category: *category,
                    mode: file_mode(&file)?,
                    sha256: sha256_file(&target)?,
                    source: file,
                    stored,
                    link: None,
                });
            }
        }

        let permissions: String = entries
            .iter()
            .filter(|e| e.category == BackupCategory::Certificate)
            .map(|e| match &e.link {
                Some(target) => format!("link {} -> {}\n", e.source.display(), target.display()),
                None => format!("{} {}\n", format_mode(e.mode), e.source.display()),
            })
            .collect();
        atomic_write(&staging.join(PERMISSIONS_FILE), permissions.as_bytes())?;

        let mut containers = serde_json::Map::new();
        for (name, stack) in &self.stacks {
            let value = match self.probe.container_states(stack).await {
                Ok(states) => json!({ "containers": states }),
                Err(e) => json!({ "error": e.to_string() }),
            };
            containers.insert(name.clone(), value);
        }
        atomic_write(&staging.join(CONTAINERS_FILE), &serde_json::to_vec_pretty(&containers)?)?;

        let mut inventory = Vec::new();
        for cmd in &self.inventory {
            let outcome = match run_command(&cmd.command, &cmd.args, &self.project_root).await {
                Ok(output) => {
                    atomic_write(&staging.join(inventory_file(&cmd.name)), output.as_bytes())?;
                    InventoryOutcome {
                        name: cmd.name.clone(),
                        ok: true,
                        error: None,
                    }
                }
                Err(e) => {
                    warn!(inventory = %cmd.name, error = %e, "inventory command failed");
                    InventoryOutcome {
                        name: cmd.name.clone(),
                        ok: false,
                        error: Some(e.to_string()),
                    }
                }
            };
            inventory.push(outcome);
        }

        let manifest = BackupManifest {
            id: id.to_string(),
            created_at: Utc::now(),
            hostname: hostname(),
            entries,
            inventory,
        };
        atomic_write(&staging.join(MANIFEST_FILE), &serde_json::to_vec_pretty(&manifest)?)?;
        atomic_write_mode(
            &staging.join(RESTORE_SCRIPT),
            restore_script(&manifest, &self.config_path).as_bytes(),
            Some(0o755),
        )?;
        Ok(manifest)
    }

    /// Swap the `latest` pointer in one rename
    #[cfg(unix)]
    fn point_latest_at(&self, id: &str) -> Result<()> {
        atomic_symlink(Path::new(id), &self.root.join(LATEST))
    }

    #[cfg(not(unix))]
    fn point_latest_at(&self, id: &str) -> Result<()> {
        atomic_write(&self.root.join(LATEST), id.as_bytes())
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    /// Published snapshot ids, oldest first
    pub fn list(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(WardenError::io(&self.root, e)),
        };

        let mut ids: Vec<String> = entries
            .flatten()
            .filter(|e| e.file_type().map_or(false, |t| t.is_dir()))
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| !name.starts_with('.') && name != LATEST)
            .collect();
        ids.sort();
        Ok(ids)
    }

    pub fn latest_id(&self) -> Option<String> {
        latest_snapshot_id(&self.root)
    }

    /// Resolve `latest` or an id and validate the snapshot completely
    pub fn resolve(&self, selector: &str) -> Result<BackupSnapshot> {
        let id = if selector == LATEST {
            self.latest_id()
                .ok_or_else(|| WardenError::SnapshotNotFound(LATEST.to_string()))?
        } else {
            selector.to_string()
        };
        if id.is_empty() || id.starts_with('.') || id.contains(['/', '\\']) {
            return Err(WardenError::SnapshotNotFound(selector.to_string()));
        }

        let root = self.root.join(&id);
        if !root.is_dir() {
            return Err(WardenError::SnapshotNotFound(id));
        }

        let incomplete = |reason: String| WardenError::RestoreIncomplete {
            id: id.clone(),
            reason,
        };

        let manifest_bytes =
            fs::read(root.join(MANIFEST_FILE)).map_err(|e| incomplete(format!("{}: {}", MANIFEST_FILE, e)))?;
        let manifest: BackupManifest = serde_json::from_slice(&manifest_bytes)
            .map_err(|e| incomplete(format!("{} unreadable: {}", MANIFEST_FILE, e)))?;

        let layout = [RESTORE_SCRIPT, PERMISSIONS_FILE, CONTAINERS_FILE]
            .into_iter()
            .map(PathBuf::from)
            .chain(manifest.inventory.iter().filter(|i| i.ok).map(|i| inventory_file(&i.name)));
        for required in layout {
            if !root.join(&required).is_file() {
                return Err(incomplete(format!("{} missing", required.display())));
            }
        }

        for entry in &manifest.entries {
            if let Some(target) = &entry.link {
                if sha256_hex(target.to_string_lossy().as_bytes()) != entry.sha256 {
                    return Err(incomplete(format!("{} link checksum mismatch", entry.source.display())));
                }
                continue;
            }
            let stored = root.join(&entry.stored);
            let actual = sha256_file(&stored).map_err(|_| incomplete(format!("{} missing", entry.stored.display())))?;
            if actual != entry.sha256 {
                return Err(incomplete(format!("{} checksum mismatch", entry.stored.display())));
            }
        }

        Ok(BackupSnapshot { id, root, manifest })
    }

    // ========================================================================
    // Restore
    // ========================================================================

    /// Put every captured file back with its recorded mode; certificates first
    pub fn restore_files(&self, selector: &str) -> Result<BackupSnapshot> {
        let snapshot = self.resolve(selector)?;

        let mut entries: Vec<&BackupEntry> = snapshot.manifest.entries.iter().collect();
        entries.sort_by_key(|e| match e.category {
            BackupCategory::Certificate => 0,
            BackupCategory::Proxy => 1,
            BackupCategory::Settings => 2,
        });

        for entry in entries {
            if let Some(target) = &entry.link {
                atomic_symlink(target, &entry.source)?;
                info!(file = %entry.source.display(), target = %target.display(), "restored link");
                continue;
            }
            let stored = snapshot.root.join(&entry.stored);
            let bytes = fs::read(&stored).map_err(|e| WardenError::io(&stored, e))?;
            atomic_write_mode(&entry.source, &bytes, Some(entry.mode))?;
            info!(file = %entry.source.display(), mode = %format_mode(entry.mode), "restored");
        }

        info!(snapshot = %snapshot.id, files = snapshot.manifest.entries.len(), "files restored");
        Ok(snapshot)
    }
}

/// Files and links at `path` in a stable order. A configured directory is
/// walked even through a link; links found inside it are returned, not descended.
fn collect_files(path: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    if path.is_dir() {
        walk(path, &mut files)?;
    } else {
        files.push(path.to_path_buf());
    }
    Ok(files)
}

fn walk(dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    let mut children: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|e| WardenError::io(dir, e))?
        .flatten()
        .map(|e| e.path())
        .collect();
    children.sort();

    for child in children {
        let meta = fs::symlink_metadata(&child).map_err(|e| WardenError::io(&child, e))?;
        if meta.is_dir() {
            walk(&child, files)?;
        } else {
            files.push(child);
        }
    }
    Ok(())
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Self-contained POSIX restore procedure for one snapshot
fn restore_script(manifest: &BackupManifest, config_path: &Path) -> String {
    let mut script = format!(
        "#!/bin/sh\n# Restore snapshot {} ({}, host {})\nset -eu\n\nSNAPSHOT_DIR=\"$(cd \"$(dirname \"$0\")\" && pwd)\"\n\n",
        manifest.id,
        manifest.created_at.to_rfc3339(),
        manifest.hostname
    );

    for entry in &manifest.entries {
        let target = entry.source.to_string_lossy();
        if let Some(parent) = entry.source.parent() {
            script.push_str(&format!("mkdir -p {}\n", shell_quote(&parent.to_string_lossy())));
        }
        if let Some(link) = &entry.link {
            script.push_str(&format!(
                "ln -sfn {} {}\n",
                shell_quote(&link.to_string_lossy()),
                shell_quote(&target)
            ));
            continue;
        }
        script.push_str(&format!(
            "cp \"$SNAPSHOT_DIR\"/{} {}\n",
            shell_quote(&entry.stored.to_string_lossy()),
            shell_quote(&target)
        ));
        script.push_str(&format!("chmod {} {}\n", format_mode(entry.mode), shell_quote(&target)));
    }

    script.push_str(&format!(
        "\nwarden --config {} start\n",
        shell_quote(&config_path.to_string_lossy())
    ));
    script
}
