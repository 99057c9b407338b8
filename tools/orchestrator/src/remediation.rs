//! Remediation Engine
//!
//! Minimal corrective rewrites for high-severity drift. The bad files are
//! captured first; only the offending values or lines change, and a file whose
//! role has no known safe rewrite is left untouched and reported as blocked.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, warn};
use warden_shared::fsutil::{atomic_write, copy_file, strip_root};
use warden_shared::{DriftFinding, DriftRule, Result, Severity, WardenError};

use crate::backup::latest_snapshot_id;
use crate::config::{FileRole, MonitoredFile};
use crate::drift::{scan_content, DriftRules};

#[derive(Debug, Clone, Default, Serialize)]
pub struct RemediationReport {
    /// Where the pre-remediation copies went; `None` when nothing needed capturing
    pub emergency_dir: Option<PathBuf>,
    /// Latest backup snapshot at the time; restoring it reverts every tracked file
    pub baseline: Option<String>,
    pub rewritten: Vec<PathBuf>,
    pub unchanged: Vec<PathBuf>,
    /// Critical findings for files that could not be fixed safely
    pub blocked: Vec<DriftFinding>,
}

pub struct RemediationEngine {
    rules: Arc<DriftRules>,
    emergency_root: PathBuf,
    backup_root: Option<PathBuf>,
}

impl RemediationEngine {
    pub fn new(rules: Arc<DriftRules>, emergency_root: impl Into<PathBuf>) -> Self {
        Self {
            rules,
            emergency_root: emergency_root.into(),
            backup_root: None,
        }
    }

    /// Report the snapshot `latest` points at under `root` with every remediation
    pub fn with_backups(mut self, root: impl Into<PathBuf>) -> Self {
        self.backup_root = Some(root.into());
        self
    }

    pub fn remediate(&self, findings: &[DriftFinding]) -> Result<RemediationReport> {
        let mut report = RemediationReport::default();
        if !findings.iter().any(|f| f.severity >= Severity::High) {
            return Ok(report);
        }

        let affected: BTreeSet<&Path> = findings
            .iter()
            .filter(|f| f.severity >= Severity::High)
            .filter(|f| matches!(f.rule, DriftRule::ForbiddenValuePresent | DriftRule::RequiredValueAbsent))
            .map(|f| f.file.as_path())
            .collect();
        if affected.is_empty() {
            return Ok(report);
        }

        // Capture failure aborts: nothing is rewritten without a copy of the bad state
        report.emergency_dir = Some(self.capture(&affected)?);
        report.baseline = self.backup_root.as_deref().and_then(latest_snapshot_id);

        for path in affected {
            match self.fix_file(path) {
                Ok(true) => report.rewritten.push(path.to_path_buf()),
                Ok(false) => report.unchanged.push(path.to_path_buf()),
                Err(reason) => {
                    let err = WardenError::RemediationBlocked {
                        path: path.to_path_buf(),
                        reason: reason.clone(),
                    };
                    error!(
                        file = %path.display(),
                        code = err.error_code(),
                        severity = %Severity::Critical,
                        "{}; manual intervention required",
                        err
                    );
                    report
                        .blocked
                        .push(DriftFinding::new(path, DriftRule::RemediationBlocked, None).with_detail(reason));
                }
            }
        }

        info!(
            rewritten = report.rewritten.len(),
            blocked = report.blocked.len(),
            baseline = report.baseline.as_deref().unwrap_or("none"),
            "remediation finished"
        );
        Ok(report)
    }

    /// Copy every affected file under `{emergency_root}/{timestamp}/`, mirroring its path
    fn capture(&self, files: &BTreeSet<&Path>) -> Result<PathBuf> {
        let stamp = Utc::now().format("%Y%m%d-%H%M%S%.3f").to_string();
        let mut dir = self.emergency_root.join(&stamp);
        let mut n = 1;
        while dir.exists() {
            dir = self.emergency_root.join(format!("{}-{}", stamp, n));
            n += 1;
        }
        fs::create_dir_all(&dir).map_err(|e| WardenError::io(&dir, e))?;

        for file in files {
            if file.exists() {
                copy_file(file, &dir.join(strip_root(file)))?;
            }
        }
        info!(dir = %dir.display(), files = files.len(), "captured drifted files");
        Ok(dir)
    }

    /// `Ok(true)` when the file was rewritten
    fn fix_file(&self, path: &Path) -> std::result::Result<bool, String> {
        let file = self
            .rules
            .file(path)
            .ok_or_else(|| "not a monitored file".to_string())?;
        let content = fs::read_to_string(path).map_err(|e| format!("cannot read: {}", e))?;

        match plan_rewrite(&content, file, &self.rules)? {
            None => Ok(false),
            Some(fixed) => {
                atomic_write(path, fixed.as_bytes()).map_err(|e| e.to_string())?;
                info!(
                    file = %path.display(),
                    before = scan_content(&content, file, &self.rules).len(),
                    after = 0,
                    "rewrote drifted values"
                );
                Ok(true)
            }
        }
    }
}

/// Compute the minimal rewrite that satisfies every rule for `file`.
///
/// `Ok(None)` means the content already complies; `Err` carries the reason no
/// safe rewrite exists.
pub fn plan_rewrite(
    content: &str,
    file: &MonitoredFile,
    rules: &DriftRules,
) -> std::result::Result<Option<String>, String> {
    if file.role == FileRole::Unrecognized {
        return Err("unrecognized file role".to_string());
    }

    let mut fixed = content.to_string();
    for replacement in &rules.replacements {
        if !replacement.superseded.is_empty() && fixed.contains(&replacement.superseded) {
            fixed = fixed.replace(&replacement.superseded, &replacement.current);
        }
    }

    for value in &file.required {
        if fixed.contains(value.as_str()) {
            continue;
        }
        fixed = match (file.role, env_key(value), json_key(value)) {
            (FileRole::FrontendEnv | FileRole::AppSettings | FileRole::StartupScript, Some(key), _) => {
                set_env_line(&fixed, key, value)
            }
            (FileRole::AppSettings, None, Some(key)) => set_json_member(&fixed, key, value)
                .ok_or_else(|| format!("no existing {} member to rewrite", key))?,
            _ => return Err(format!("no minimal rewrite for required value '{}'", value)),
        };
    }

    let remaining = scan_content(&fixed, file, rules);
    if let Some(finding) = remaining.first() {
        return Err(format!(
            "rewrite leaves {} for '{}'",
            finding.rule,
            finding.value.as_deref().unwrap_or_default()
        ));
    }

    Ok(if fixed == content { None } else { Some(fixed) })
}

/// `KEY` of a `KEY=VALUE` required value
fn env_key(value: &str) -> Option<&str> {
    let (key, _) = value.split_once('=')?;
    let valid = !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    valid.then_some(key)
}

/// `"key"` of a `"key": value` required value
fn json_key(value: &str) -> Option<&str> {
    let rest = value.strip_prefix('"')?;
    let end = rest.find('"')?;
    rest[end + 1..].trim_start().starts_with(':').then(|| &value[..end + 2])
}

/// Replace every definition of `key` (keeping an `export ` prefix and indentation), or append one
fn set_env_line(content: &str, key: &str, line: &str) -> String {
    let mut out = String::with_capacity(content.len() + line.len() + 1);
    let mut replaced = false;

    for raw in content.split_inclusive('\n') {
        let body = raw.trim_end_matches(['\n', '\r']);
        let ending = &raw[body.len()..];
        let indent_len = body.len() - body.trim_start().len();
        let (indent, rest) = body.split_at(indent_len);
        let (export, assignment) = match rest.strip_prefix("export ") {
            Some(after) => ("export ", after),
            None => ("", rest),
        };

        let defines_key = assignment
            .strip_prefix(key)
            .map_or(false, |after| after.trim_start().starts_with('='));
        if defines_key {
            out.push_str(indent);
            out.push_str(export);
            out.push_str(line);
            out.push_str(ending);
            replaced = true;
        } else {
            out.push_str(raw);
        }
    }

    if !replaced {
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// Rewrite the single-line member `key` in a JSON document, keeping indentation and a trailing comma
fn set_json_member(content: &str, key: &str, member: &str) -> Option<String> {
    let mut out = String::with_capacity(content.len() + member.len());
    let mut replaced = false;

    for raw in content.split_inclusive('\n') {
        let body = raw.trim_end_matches(['\n', '\r']);
        let ending = &raw[body.len()..];
        let trimmed = body.trim_start();
        let is_member = trimmed
            .strip_prefix(key)
            .map_or(false, |after| after.trim_start().starts_with(':'));

        if is_member && !replaced {
            let indent = &body[..body.len() - trimmed.len()];
            let comma = if body.trim_end().ends_with(',') { "," } else { "" };
            out.push_str(indent);
            out.push_str(member);
            out.push_str(comma);
            out.push_str(ending);
            replaced = true;
        } else {
            out.push_str(raw);
        }
    }

    if !replaced {
        warn!(key, "settings member not found; refusing to insert");
        return None;
    }
    Some(out)
}
