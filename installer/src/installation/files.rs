//! Filesystem helpers shared by provisioning, backup and restore.
//!
//! Goals:
//! - Async I/O only (tokio)
//! - Retry transient errors, timeout every operation
//! - Preserve unix permissions and symlinks (snapshots must restore byte-for-byte)
//! - Never fail silently (log with context)

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{timeout, Duration};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
}

/// One copied filesystem entry. `path` is relative to the copy base, `/`-separated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    pub kind: EntryKind,
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default)]
    pub mode: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

fn rel_string(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(unix)]
fn mode_of(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_of(_meta: &std::fs::Metadata) -> u32 {
    0
}

/// Set unix permission bits (no-op elsewhere).
pub async fn set_mode(path: &Path, mode: u32) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .await
            .with_context(|| format!("chmod {:o} failed: {:?}", mode, path))?;
    }
    #[cfg(not(unix))]
    {
        let _ = (path, mode);
    }
    Ok(())
}

fn is_transient_fs_error(e: &anyhow::Error) -> bool {
    let msg = format!("{:#}", e).to_ascii_lowercase();
    msg.contains("resource busy")
        || msg.contains("temporarily")
        || msg.contains("temporary")
        || msg.contains("interrupted")
        || msg.contains("timed out")
}

pub async fn ensure_dir_with_retries(path: &Path, label: &str) -> Result<()> {
    let mut last_err: Option<anyhow::Error> = None;
    for attempt in 1..=3 {
        let started = Instant::now();
        match timeout(Duration::from_secs(5), tokio::fs::create_dir_all(path)).await {
            Ok(Ok(())) => {
                debug!(
                    "[PHASE: provisioning] [STEP: fs] {} ok (attempt={}, path={:?}, duration_ms={})",
                    label,
                    attempt,
                    path,
                    started.elapsed().as_millis()
                );
                return Ok(());
            }
            Ok(Err(e)) => {
                warn!(
                    "[PHASE: provisioning] [STEP: fs] {} failed (attempt={}, path={:?}, error={:?})",
                    label, attempt, path, e
                );
                last_err = Some(anyhow::Error::new(e).context(format!("create_dir_all {:?}", path)));
            }
            Err(_) => {
                warn!(
                    "[PHASE: provisioning] [STEP: fs] {} timed out (attempt={}, path={:?})",
                    label, attempt, path
                );
                last_err = Some(anyhow::anyhow!("create_dir_all timed out: {:?}", path));
            }
        }
        let backoff_ms = 50_u64.saturating_mul(1_u64 << ((attempt - 1) as u32));
        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Failed to create directory {:?}", path)))
}

pub async fn write_file_with_retries(path: &Path, bytes: &[u8], label: &str) -> Result<()> {
    let mut last_err: Option<anyhow::Error> = None;
    for attempt in 1..=3 {
        let started = Instant::now();
        match timeout(Duration::from_secs(10), tokio::fs::write(path, bytes)).await {
            Ok(Ok(())) => {
                debug!(
                    "[PHASE: provisioning] [STEP: fs] {} ok (attempt={}, path={:?}, bytes={}, duration_ms={})",
                    label,
                    attempt,
                    path,
                    bytes.len(),
                    started.elapsed().as_millis()
                );
                return Ok(());
            }
            Ok(Err(e)) => {
                warn!(
                    "[PHASE: provisioning] [STEP: fs] {} failed (attempt={}, path={:?}, error={:?})",
                    label, attempt, path, e
                );
                last_err = Some(anyhow::Error::new(e).context(format!("write {:?}", path)));
            }
            Err(_) => {
                warn!(
                    "[PHASE: provisioning] [STEP: fs] {} timed out (attempt={}, path={:?})",
                    label, attempt, path
                );
                last_err = Some(anyhow::anyhow!("write timed out: {:?}", path));
            }
        }

        let backoff_ms = 50_u64.saturating_mul(1_u64 << ((attempt - 1) as u32));
        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Failed to write file {:?}", path)))
}

/// Write a file readable only by the owner (0600).
pub async fn write_private_file(path: &Path, bytes: &[u8], label: &str) -> Result<()> {
    write_file_with_retries(path, bytes, label).await?;
    set_mode(path, 0o600).await
}

/// Remove a file, symlink or directory tree. Absent paths are fine.
pub async fn remove_path(path: &Path) -> Result<()> {
    let meta = match tokio::fs::symlink_metadata(path).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(anyhow::Error::new(e).context(format!("stat {:?}", path))),
    };
    if meta.is_dir() {
        tokio::fs::remove_dir_all(path)
            .await
            .with_context(|| format!("remove_dir_all failed: {:?}", path))?;
    } else {
        tokio::fs::remove_file(path)
            .await
            .with_context(|| format!("remove_file failed: {:?}", path))?;
    }
    Ok(())
}

pub async fn sha256_file(path: &Path) -> Result<(u64, String)> {
    let mut f = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("open failed: {:?}", path))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut total: u64 = 0;
    loop {
        let n = f.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total = total.saturating_add(n as u64);
    }
    Ok((total, hex_digest(hasher)))
}

fn hex_digest(hasher: Sha256) -> String {
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<String>()
}

/// Copy one file with retries + timeout, returning `(bytes_written, sha256_hex)`.
///
/// Caller must create the parent directory. Permission bits are copied.
pub async fn copy_file_with_retries_and_sha256(
    src: &Path,
    dst: &Path,
    label: &str,
) -> Result<(u64, String)> {
    let started = Instant::now();
    debug!(
        "[PHASE: backup] [STEP: files] copy_file_with_retries_and_sha256 entered (label={}, src={:?}, dst={:?})",
        label, src, dst
    );

    let mut last_err: Option<anyhow::Error> = None;
    for attempt in 1..=3 {
        let timeout_dur = match tokio::fs::metadata(src).await {
            Ok(m) => {
                // base 60s + 1s per MiB, capped at 10 minutes
                let mib = (m.len() / (1024 * 1024)).min(10_000);
                Duration::from_secs(60_u64.saturating_add(mib).min(600))
            }
            Err(_) => Duration::from_secs(60),
        };

        match timeout(timeout_dur, copy_file_once_and_sha256(src, dst)).await {
            Ok(Ok((n, sha))) => {
                debug!(
                    "[PHASE: backup] [STEP: files] copy_file_with_retries_and_sha256 exit ok (label={}, bytes={}, attempt={}, duration_ms={})",
                    label,
                    n,
                    attempt,
                    started.elapsed().as_millis()
                );
                return Ok((n, sha));
            }
            Ok(Err(e)) => {
                let transient = is_transient_fs_error(&e);
                warn!(
                    "[PHASE: backup] [STEP: files] copy+sha failed (label={}, attempt={}, transient={}, src={:?}, err={:#})",
                    label, attempt, transient, src, e
                );
                last_err = Some(e);
                if !transient {
                    break;
                }
            }
            Err(_) => {
                warn!(
                    "[PHASE: backup] [STEP: files] copy+sha timeout (label={}, attempt={}, src={:?}, timeout_ms={})",
                    label,
                    attempt,
                    src,
                    timeout_dur.as_millis()
                );
                last_err = Some(anyhow::anyhow!(
                    "copy+sha timed out (timeout_ms={})",
                    timeout_dur.as_millis()
                ));
            }
        }

        let backoff_ms = 200_u64.saturating_mul(1_u64 << ((attempt - 1) as u32));
        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("copy+sha failed")))
}

async fn copy_file_once_and_sha256(src: &Path, dst: &Path) -> Result<(u64, String)> {
    let mut src_f = tokio::fs::File::open(src)
        .await
        .with_context(|| format!("open src failed: {:?}", src))?;
    let mut dst_f = tokio::fs::File::create(dst)
        .await
        .with_context(|| format!("create dst failed: {:?}", dst))?;

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut total: u64 = 0;
    loop {
        let n = src_f.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        dst_f.write_all(&buf[..n]).await?;
        total = total.saturating_add(n as u64);
    }
    dst_f.flush().await?;
    dst_f.sync_all().await?;

    let meta = tokio::fs::metadata(src).await?;
    set_mode(dst, mode_of(&meta)).await?;

    Ok((total, hex_digest(hasher)))
}

async fn read_link_string(path: &Path) -> Result<String> {
    let target = tokio::fs::read_link(path)
        .await
        .with_context(|| format!("read_link failed: {:?}", path))?;
    Ok(target.to_string_lossy().to_string())
}

#[cfg(unix)]
async fn make_symlink(target: &str, link: &Path) -> Result<()> {
    tokio::fs::symlink(target, link)
        .await
        .with_context(|| format!("symlink {:?} -> {} failed", link, target))
}

#[cfg(not(unix))]
async fn make_symlink(target: &str, link: &Path) -> Result<()> {
    anyhow::bail!("symlinks are not supported on this platform ({:?} -> {})", link, target)
}

/// Copy `src_base/rel` to `dst_base/rel` (file, directory tree or symlink), returning one record
/// per entry. Symlinks are recreated, never followed. Directory modes are applied after their
/// contents are written so read-only directories still copy.
pub async fn copy_entry(src_base: &Path, dst_base: &Path, rel: &Path) -> Result<Vec<FileRecord>> {
    let started = Instant::now();
    let mut records = Vec::new();
    let mut dir_modes: Vec<(PathBuf, u32)> = Vec::new();
    let mut stack: Vec<PathBuf> = vec![rel.to_path_buf()];

    while let Some(rel) = stack.pop() {
        let src = src_base.join(&rel);
        let dst = dst_base.join(&rel);
        let meta = tokio::fs::symlink_metadata(&src)
            .await
            .with_context(|| format!("stat failed: {:?}", src))?;
        let mode = mode_of(&meta);
        let ft = meta.file_type();

        if ft.is_symlink() {
            if let Some(parent) = dst.parent() {
                ensure_dir_with_retries(parent, "copy_entry_parent").await?;
            }
            let target = read_link_string(&src).await?;
            make_symlink(&target, &dst).await?;
            records.push(FileRecord {
                path: rel_string(&rel),
                kind: EntryKind::Symlink,
                size: 0,
                sha256: None,
                mode: 0,
                target: Some(target),
            });
        } else if ft.is_dir() {
            ensure_dir_with_retries(&dst, "copy_entry_dir").await?;
            dir_modes.push((dst.clone(), mode));
            records.push(FileRecord {
                path: rel_string(&rel),
                kind: EntryKind::Dir,
                size: 0,
                sha256: None,
                mode,
                target: None,
            });
            let mut rd = tokio::fs::read_dir(&src)
                .await
                .with_context(|| format!("read_dir failed: {:?}", src))?;
            let mut children = Vec::new();
            while let Some(ent) = rd.next_entry().await? {
                children.push(rel.join(ent.file_name()));
            }
            children.sort();
            // reversed so the stack pops in name order
            stack.extend(children.into_iter().rev());
        } else if ft.is_file() {
            if let Some(parent) = dst.parent() {
                ensure_dir_with_retries(parent, "copy_entry_parent").await?;
            }
            let label = rel_string(&rel);
            let (size, sha) = copy_file_with_retries_and_sha256(&src, &dst, &label).await?;
            records.push(FileRecord {
                path: label,
                kind: EntryKind::File,
                size,
                sha256: Some(sha),
                mode,
                target: None,
            });
        } else {
            warn!(
                "[PHASE: backup] [STEP: files] Skipping special file {:?}",
                src
            );
        }
    }

    for (dir, mode) in dir_modes.into_iter().rev() {
        set_mode(&dir, mode).await?;
    }

    info!(
        "[PHASE: backup] [STEP: files] copy_entry exit (entry={:?}, records={}, duration_ms={})",
        rel,
        records.len(),
        started.elapsed().as_millis()
    );
    Ok(records)
}

/// Check `base/record.path` against each record: kind, size, sha256, symlink target.
pub async fn verify_records(base: &Path, records: &[FileRecord]) -> Result<()> {
    for rec in records {
        let path = base.join(&rec.path);
        let meta = tokio::fs::symlink_metadata(&path)
            .await
            .with_context(|| format!("missing entry {}", rec.path))?;
        match rec.kind {
            EntryKind::Dir => {
                if !meta.is_dir() {
                    anyhow::bail!("{} should be a directory", rec.path);
                }
            }
            EntryKind::Symlink => {
                if !meta.file_type().is_symlink() {
                    anyhow::bail!("{} should be a symlink", rec.path);
                }
                let target = read_link_string(&path).await?;
                if Some(&target) != rec.target.as_ref() {
                    anyhow::bail!(
                        "{} symlink target mismatch (expected {:?}, found {})",
                        rec.path,
                        rec.target,
                        target
                    );
                }
            }
            EntryKind::File => {
                if !meta.is_file() {
                    anyhow::bail!("{} should be a regular file", rec.path);
                }
                let (size, sha) = sha256_file(&path).await?;
                if size != rec.size || Some(&sha) != rec.sha256.as_ref() {
                    anyhow::bail!(
                        "{} checksum mismatch (expected {} bytes sha256={:?}, found {} bytes sha256={})",
                        rec.path,
                        rec.size,
                        rec.sha256,
                        size,
                        sha
                    );
                }
            }
        }
    }
    Ok(())
}
