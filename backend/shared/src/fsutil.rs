//! Filesystem helpers: atomic replace, permission bits, append-only logs
//!
//! Every file the supervisor rewrites goes through [`atomic_write`] so a
//! concurrent reader sees either the old content or the new one, never a mix.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use uuid::Uuid;

use crate::errors::{Result, WardenError};

/// Sibling temp path in the same directory, so the final rename stays on one filesystem
fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    path.with_file_name(format!(".{}.{}.tmp", name, Uuid::new_v4().simple()))
}

/// Write `contents` to `path` by writing a temp file and renaming it over the target.
///
/// An existing target's permission bits carry over to the new file.
pub fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    atomic_write_mode(path, contents, None)
}

/// Like [`atomic_write`], but with explicit permission bits applied before the rename
pub fn atomic_write_mode(path: &Path, contents: &[u8], mode: Option<u32>) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| WardenError::io(parent, e))?;
        }
    }

    let previous_mode = mode.or_else(|| file_mode(path).ok());
    let tmp = temp_sibling(path);
    let result = (|| {
        let mut file = fs::File::create(&tmp).map_err(|e| WardenError::io(&tmp, e))?;
        file.write_all(contents).map_err(|e| WardenError::io(&tmp, e))?;
        file.sync_all().map_err(|e| WardenError::io(&tmp, e))?;
        if let Some(mode) = previous_mode {
            set_mode(&tmp, mode)?;
        }
        fs::rename(&tmp, path).map_err(|e| WardenError::io(path, e))
    })();

    if result.is_err() {
        fs::remove_file(&tmp).ok();
    }
    result
}

/// Point `path` at `target` by creating a temp symlink and renaming it over `path`
#[cfg(unix)]
pub fn atomic_symlink(target: &Path, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| WardenError::io(parent, e))?;
        }
    }

    let tmp = temp_sibling(path);
    std::os::unix::fs::symlink(target, &tmp).map_err(|e| WardenError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| {
        fs::remove_file(&tmp).ok();
        WardenError::io(path, e)
    })
}

#[cfg(not(unix))]
pub fn atomic_symlink(_target: &Path, path: &Path) -> Result<()> {
    Err(WardenError::io(
        path,
        std::io::Error::new(std::io::ErrorKind::Unsupported, "symbolic links need a unix host"),
    ))
}

/// Append one line to an append-only log file
pub fn append_line(path: &Path, line: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| WardenError::io(parent, e))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| WardenError::io(path, e))?;
    writeln!(file, "{}", line).map_err(|e| WardenError::io(path, e))
}

/// Copy a file, creating the destination's parent directories
pub fn copy_file(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).map_err(|e| WardenError::io(parent, e))?;
    }
    fs::copy(src, dst).map_err(|e| WardenError::io(src, e))?;
    Ok(())
}

/// Drop the root and any `..`/`.` components, so an absolute path can be
/// mirrored under another directory
pub fn strip_root(path: &Path) -> PathBuf {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect()
}

/// Permission bits of a file (the low 12 bits of st_mode)
#[cfg(unix)]
pub fn file_mode(path: &Path) -> Result<u32> {
    use std::os::unix::fs::PermissionsExt;
    let meta = fs::metadata(path).map_err(|e| WardenError::io(path, e))?;
    Ok(meta.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
pub fn file_mode(path: &Path) -> Result<u32> {
    let meta = fs::metadata(path).map_err(|e| WardenError::io(path, e))?;
    Ok(if meta.permissions().readonly() { 0o444 } else { 0o644 })
}

#[cfg(unix)]
pub fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| WardenError::io(path, e))
}

#[cfg(not(unix))]
pub fn set_mode(path: &Path, mode: u32) -> Result<()> {
    let mut perms = fs::metadata(path).map_err(|e| WardenError::io(path, e))?.permissions();
    perms.set_readonly(mode & 0o200 == 0);
    fs::set_permissions(path, perms).map_err(|e| WardenError::io(path, e))
}

/// Render a mode the way `ls`-style listings and `chmod` expect it
pub fn format_mode(mode: u32) -> String {
    format!("{:04o}", mode & 0o7777)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_write_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{\"port\": 11001}").unwrap();

        atomic_write(&path, b"{\"port\": 11000}").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "{\"port\": 11000}");
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_atomic_write_keeps_permission_bits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("privkey.pem");
        fs::write(&path, "old").unwrap();
        set_mode(&path, 0o600).unwrap();

        atomic_write(&path, b"new").unwrap();

        assert_eq!(file_mode(&path).unwrap(), 0o600);
    }

    #[test]
    fn test_append_line_is_append_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/alerts.jsonl");
        append_line(&path, "first").unwrap();
        append_line(&path, "second").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "first\nsecond\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_explicit_mode_wins_over_previous() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fullchain.pem");
        fs::write(&path, "old").unwrap();
        set_mode(&path, 0o644).unwrap();

        atomic_write_mode(&path, b"new", Some(0o600)).unwrap();

        assert_eq!(file_mode(&path).unwrap(), 0o600);
        assert_eq!(fs::read_to_string(&path).unwrap(), "new");
    }

    #[cfg(unix)]
    #[test]
    fn test_atomic_symlink_replaces_existing_link() {
        let dir = tempfile::tempdir().unwrap();
        let link = dir.path().join("live/privkey.pem");
        atomic_symlink(Path::new("../archive/privkey1.pem"), &link).unwrap();
        atomic_symlink(Path::new("../archive/privkey2.pem"), &link).unwrap();
        assert_eq!(fs::read_link(&link).unwrap(), PathBuf::from("../archive/privkey2.pem"));
    }

    #[test]
    fn test_strip_root() {
        assert_eq!(
            strip_root(Path::new("/etc/nginx/sites-enabled/platform")),
            PathBuf::from("etc/nginx/sites-enabled/platform")
        );
        assert_eq!(strip_root(Path::new("../apps/./.env")), PathBuf::from("apps/.env"));
    }

    #[test]
    fn test_format_mode() {
        assert_eq!(format_mode(0o600), "0600");
        assert_eq!(format_mode(0o100644), "0644");
    }
}
