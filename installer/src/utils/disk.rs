//! Disk utilities: free-space detection for the installation root.
//!
//! We only *detect* free space; nothing here modifies volumes.

use anyhow::{Context, Result};
use log::{debug, info};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::time::Duration;

/// Free bytes on the filesystem that holds `path`.
///
/// The installation root may not exist yet on a first install, so the nearest existing ancestor
/// is measured instead. Uses `df -Pk` through the shared command runner.
pub async fn free_space_bytes(path: &Path) -> Result<u64> {
    let started = Instant::now();
    let probe = nearest_existing_ancestor(path);
    debug!(
        "[PHASE: validating] [STEP: free_space] free_space_bytes entered (path={:?}, probe={:?})",
        path, probe
    );

    let path_str = probe
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid path: {:?}", probe))?
        .to_string();

    let out = crate::installation::run_cmd_with_timeout(
        "df",
        &["-Pk".to_string(), path_str],
        Duration::from_secs(10),
        "free_space_df",
    )
    .await?;

    if out.exit_code != Some(0) {
        anyhow::bail!("Failed to query free space (exit_code={:?})", out.exit_code);
    }

    let bytes = parse_df_available_bytes(&out.stdout)?;
    info!(
        "[PHASE: validating] [STEP: free_space] free_space_bytes exit (bytes={}, duration_ms={})",
        bytes,
        started.elapsed().as_millis()
    );
    Ok(bytes)
}

fn nearest_existing_ancestor(path: &Path) -> PathBuf {
    let mut current = Some(path);
    while let Some(p) = current {
        if p.exists() {
            return p.to_path_buf();
        }
        current = p.parent();
    }
    PathBuf::from("/")
}

/// Parse POSIX `df -Pk` output and return the "Available" column in bytes.
///
/// Expect:
/// Filesystem 1024-blocks Used Available Capacity Mounted on
/// /dev/sda1  102400      512  101888    1%       /
pub fn parse_df_available_bytes(stdout: &str) -> Result<u64> {
    let mut lines = stdout.lines();
    let _header = lines.next();
    let data = lines
        .next()
        .ok_or_else(|| anyhow::anyhow!("df output missing data row"))?;
    let cols: Vec<&str> = data.split_whitespace().collect();
    if cols.len() < 4 {
        anyhow::bail!("df output parse error");
    }
    let avail_kb: u64 = cols[3]
        .parse()
        .with_context(|| format!("Unable to parse df available KB '{}'", cols[3]))?;
    Ok(avail_kb.saturating_mul(1024))
}
