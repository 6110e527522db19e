use anyhow::Result;
use std::path::{Path, PathBuf};

/// Resolve the log folder (absolute path).
///
/// Logs must survive a purge of the installation root, so they never live inside it.
/// Preference order: explicit config value, the per-user data dir, then `/var/tmp`.
pub fn resolve_log_folder(configured: Option<&Path>) -> Result<PathBuf> {
    let dir = match configured {
        Some(p) => absolutize(p)?,
        None => dirs::data_local_dir()
            .map(|d| d.join("stack-installer").join("logs"))
            .unwrap_or_else(|| PathBuf::from("/var/tmp/stack-installer/logs")),
    };
    std::fs::create_dir_all(&dir)
        .map_err(|e| anyhow::anyhow!("Failed to create log folder {:?}: {}", dir, e))?;
    Ok(dir)
}

/// Make a path absolute against the current directory without touching the filesystem.
///
/// Only used once at startup; every later operation receives explicit absolute paths.
pub fn absolutize(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir()
        .map_err(|e| anyhow::anyhow!("Unable to resolve current directory: {}", e))?;
    Ok(cwd.join(path))
}
