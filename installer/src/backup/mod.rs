//! Backup/restore controller.
//!
//! Snapshot layout under `<root>/backups/<YYYYmmdd-HHMMSS>-<mode>/`:
//! - `tree/`          copied scope entries
//! - `manifest.json`  scope entries (present/absent) + one record per copied file
//! - `metadata.json`  id, mode, scenario, created_at, state; written last, so a snapshot
//!                    without it is incomplete and ignored by `list`.
//!
//! Restore never touches the snapshot directory. It stages a copy inside the root, verifies it,
//! then swaps each scope entry by rename.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::config::{InstallLayout, ADMIN_MARKER, BACKUPS_DIR, CONFIG_DIR, LOCK_FILE, SECRETS_DIR};
use crate::installation::files::{
    copy_entry, ensure_dir_with_retries, remove_path, verify_records, write_file_with_retries,
    FileRecord,
};
use crate::models::request::{BackupMode, Scenario};

pub const METADATA_FILE: &str = "metadata.json";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const TREE_DIR: &str = "tree";

const STAGING_PREFIX: &str = ".restore-staging-";
const DISPLACED_PREFIX: &str = ".restore-displaced-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotState {
    Created,
    /// Consumed by a rollback; deleted by the next successful commit.
    Restored,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    pub id: String,
    pub mode: BackupMode,
    pub scenario: Scenario,
    pub created_at: DateTime<Utc>,
    pub state: SnapshotState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeEntry {
    pub name: String,
    pub present: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotManifest {
    pub scope: Vec<ScopeEntry>,
    pub files: Vec<FileRecord>,
}

impl SnapshotManifest {
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotHandle {
    pub id: String,
    pub dir: PathBuf,
    pub mode: BackupMode,
}

impl SnapshotHandle {
    pub fn metadata_path(&self) -> PathBuf {
        self.dir.join(METADATA_FILE)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE)
    }

    pub fn tree(&self) -> PathBuf {
        self.dir.join(TREE_DIR)
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotInfo {
    pub handle: SnapshotHandle,
    pub metadata: SnapshotMetadata,
}

pub struct BackupController {
    layout: InstallLayout,
}

fn is_internal_entry(name: &str) -> bool {
    name == BACKUPS_DIR
        || name == LOCK_FILE
        || name.starts_with(STAGING_PREFIX)
        || name.starts_with(DISPLACED_PREFIX)
}

impl BackupController {
    pub fn new(layout: InstallLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &InstallLayout {
        &self.layout
    }

    /// Top-level entries covered by a snapshot of `mode`.
    ///
    /// Lean: `config/`, `secrets/` and the admin marker. Full: those plus every other top-level
    /// entry except `backups/` and the lock file.
    pub async fn scope(&self, mode: BackupMode) -> Result<Vec<String>> {
        let mut names: Vec<String> = [CONFIG_DIR, SECRETS_DIR, ADMIN_MARKER]
            .iter()
            .map(|s| s.to_string())
            .collect();
        if mode == BackupMode::Full && self.layout.root.exists() {
            let mut rd = tokio::fs::read_dir(&self.layout.root)
                .await
                .with_context(|| format!("read_dir failed: {:?}", self.layout.root))?;
            while let Some(ent) = rd.next_entry().await? {
                let name = ent.file_name().to_string_lossy().to_string();
                if !is_internal_entry(&name) && !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        names.sort();
        Ok(names)
    }

    async fn allocate_dir(&self, mode: BackupMode) -> Result<(String, PathBuf)> {
        ensure_dir_with_retries(&self.layout.backups_dir, "ensure_backups_dir").await?;
        let base = format!("{}-{}", Utc::now().format("%Y%m%d-%H%M%S"), mode.as_str());
        let mut id = base.clone();
        let mut n = 1;
        while tokio::fs::try_exists(self.layout.backups_dir.join(&id))
            .await
            .unwrap_or(false)
        {
            n += 1;
            id = format!("{}-{}", base, n);
        }
        let dir = self.layout.backups_dir.join(&id);
        ensure_dir_with_retries(&dir.join(TREE_DIR), "create_snapshot_dir").await?;
        Ok((id, dir))
    }

    /// Copy the scope of `mode` into a new snapshot. A partially written snapshot is removed.
    pub async fn snapshot(&self, mode: BackupMode, scenario: Scenario) -> Result<SnapshotHandle> {
        let started = Instant::now();
        let (id, dir) = self.allocate_dir(mode).await?;
        let handle = SnapshotHandle {
            id: id.clone(),
            dir,
            mode,
        };
        info!(
            "[PHASE: backing-up] [STEP: snapshot] Creating {} snapshot {}",
            mode.as_str(),
            id
        );

        match self.write_snapshot(&handle, scenario).await {
            Ok(manifest) => {
                info!(
                    "[PHASE: backing-up] [STEP: snapshot] Snapshot {} complete (files={}, bytes={}, duration_ms={})",
                    id,
                    manifest.files.len(),
                    manifest.total_bytes(),
                    started.elapsed().as_millis()
                );
                Ok(handle)
            }
            Err(e) => {
                error!(
                    "[PHASE: backing-up] [STEP: snapshot] Snapshot {} failed; removing partial copy: {:#}",
                    id, e
                );
                if let Err(cleanup) = remove_path(&handle.dir).await {
                    warn!(
                        "[PHASE: backing-up] [STEP: snapshot] Failed to remove partial snapshot {:?}: {:#}",
                        handle.dir, cleanup
                    );
                }
                Err(e)
            }
        }
    }

    async fn write_snapshot(
        &self,
        handle: &SnapshotHandle,
        scenario: Scenario,
    ) -> Result<SnapshotManifest> {
        let tree = handle.tree();
        let mut scope = Vec::new();
        let mut files = Vec::new();
        for name in self.scope(handle.mode).await? {
            let src = self.layout.root.join(&name);
            let present = tokio::fs::symlink_metadata(&src).await.is_ok();
            if present {
                files.extend(copy_entry(&self.layout.root, &tree, Path::new(&name)).await?);
            }
            scope.push(ScopeEntry { name, present });
        }

        let manifest = SnapshotManifest { scope, files };
        write_file_with_retries(
            &handle.manifest_path(),
            &serde_json::to_vec_pretty(&manifest)?,
            "write_snapshot_manifest",
        )
        .await?;

        let metadata = SnapshotMetadata {
            id: handle.id.clone(),
            mode: handle.mode,
            scenario,
            created_at: Utc::now(),
            state: SnapshotState::Created,
        };
        self.write_metadata(handle, &metadata).await?;
        Ok(manifest)
    }

    async fn write_metadata(&self, handle: &SnapshotHandle, metadata: &SnapshotMetadata) -> Result<()> {
        write_file_with_retries(
            &handle.metadata_path(),
            &serde_json::to_vec_pretty(metadata)?,
            "write_snapshot_metadata",
        )
        .await
    }

    pub async fn read_metadata(&self, handle: &SnapshotHandle) -> Result<SnapshotMetadata> {
        let bytes = tokio::fs::read(handle.metadata_path())
            .await
            .with_context(|| format!("Snapshot {} has no metadata", handle.id))?;
        serde_json::from_slice(&bytes).with_context(|| format!("Snapshot {} metadata is corrupt", handle.id))
    }

    pub async fn read_manifest(&self, handle: &SnapshotHandle) -> Result<SnapshotManifest> {
        let bytes = tokio::fs::read(handle.manifest_path())
            .await
            .with_context(|| format!("Snapshot {} has no manifest", handle.id))?;
        serde_json::from_slice(&bytes).with_context(|| format!("Snapshot {} manifest is corrupt", handle.id))
    }

    /// Bring every scope entry back to its snapshot state.
    pub async fn restore(&self, handle: &SnapshotHandle) -> Result<()> {
        let started = Instant::now();
        info!(
            "[PHASE: rolling-back] [STEP: restore] Restoring snapshot {} into {:?}",
            handle.id, self.layout.root
        );

        let manifest = self.read_manifest(handle).await?;
        verify_records(&handle.tree(), &manifest.files)
            .await
            .with_context(|| format!("Snapshot {} failed integrity check", handle.id))?;

        ensure_dir_with_retries(&self.layout.root, "ensure_install_root").await?;
        let staging = self.layout.root.join(format!("{}{}", STAGING_PREFIX, handle.id));
        let displaced = self.layout.root.join(format!("{}{}", DISPLACED_PREFIX, handle.id));
        remove_path(&staging).await?;
        remove_path(&displaced).await?;

        let staged = self.stage(handle, &manifest, &staging).await;
        if let Err(e) = staged {
            let _ = remove_path(&staging).await;
            return Err(e.context("Failed to stage snapshot content"));
        }

        let entries = match self.restore_entries(handle, &manifest).await {
            Ok(entries) => entries,
            Err(e) => {
                let _ = remove_path(&staging).await;
                return Err(e);
            }
        };

        ensure_dir_with_retries(&displaced, "create_displaced_dir").await?;
        let mut swapped: Vec<(String, bool)> = Vec::new();
        for entry in &entries {
            match swap_entry(&self.layout.root, &staging, &displaced, entry).await {
                Ok(had_current) => swapped.push((entry.name.clone(), had_current)),
                Err(e) => {
                    error!(
                        "[PHASE: rolling-back] [STEP: restore] Swap of {} failed; moving displaced entries back: {:#}",
                        entry.name, e
                    );
                    undo_swaps(&self.layout.root, &displaced, &swapped).await;
                    let _ = remove_path(&staging).await;
                    return Err(e.context(format!("Failed to swap '{}' into place", entry.name)));
                }
            }
        }

        if let Err(e) = remove_path(&displaced).await {
            warn!(
                "[PHASE: rolling-back] [STEP: restore] Failed to remove displaced entries {:?}: {:#}",
                displaced, e
            );
        }
        if let Err(e) = remove_path(&staging).await {
            warn!(
                "[PHASE: rolling-back] [STEP: restore] Failed to remove staging dir {:?}: {:#}",
                staging, e
            );
        }

        info!(
            "[PHASE: rolling-back] [STEP: restore] Snapshot {} restored (entries={}, duration_ms={})",
            handle.id,
            entries.len(),
            started.elapsed().as_millis()
        );
        Ok(())
    }

    /// Entries to swap: the recorded scope, plus (full mode) every top-level entry created since
    /// the snapshot, which is removed.
    async fn restore_entries(
        &self,
        handle: &SnapshotHandle,
        manifest: &SnapshotManifest,
    ) -> Result<Vec<ScopeEntry>> {
        let mut entries = manifest.scope.clone();
        if handle.mode != BackupMode::Full {
            return Ok(entries);
        }
        let mut rd = tokio::fs::read_dir(&self.layout.root)
            .await
            .with_context(|| format!("read_dir failed: {:?}", self.layout.root))?;
        while let Some(ent) = rd.next_entry().await? {
            let name = ent.file_name().to_string_lossy().to_string();
            if is_internal_entry(&name) || entries.iter().any(|e| e.name == name) {
                continue;
            }
            debug!(
                "[PHASE: rolling-back] [STEP: restore] {} did not exist at snapshot time; removing",
                name
            );
            entries.push(ScopeEntry {
                name,
                present: false,
            });
        }
        Ok(entries)
    }

    async fn stage(
        &self,
        handle: &SnapshotHandle,
        manifest: &SnapshotManifest,
        staging: &Path,
    ) -> Result<()> {
        ensure_dir_with_retries(staging, "create_staging_dir").await?;
        for entry in manifest.scope.iter().filter(|e| e.present) {
            copy_entry(&handle.tree(), staging, Path::new(&entry.name)).await?;
        }
        verify_records(staging, &manifest.files)
            .await
            .context("Staged copy does not match the snapshot manifest")
    }

    pub async fn mark_restored(&self, handle: &SnapshotHandle) -> Result<()> {
        let mut metadata = self.read_metadata(handle).await?;
        metadata.state = SnapshotState::Restored;
        self.write_metadata(handle, &metadata).await
    }

    /// Every complete snapshot, newest first.
    pub async fn list(&self) -> Result<Vec<SnapshotInfo>> {
        let mut out = Vec::new();
        if !self.layout.backups_dir.exists() {
            return Ok(out);
        }
        let mut rd = tokio::fs::read_dir(&self.layout.backups_dir)
            .await
            .with_context(|| format!("read_dir failed: {:?}", self.layout.backups_dir))?;
        while let Some(ent) = rd.next_entry().await? {
            if !ent.file_type().await?.is_dir() {
                continue;
            }
            let id = ent.file_name().to_string_lossy().to_string();
            let probe = SnapshotHandle {
                id: id.clone(),
                dir: ent.path(),
                mode: BackupMode::Lean,
            };
            match self.read_metadata(&probe).await {
                Ok(metadata) => out.push(SnapshotInfo {
                    handle: SnapshotHandle {
                        mode: metadata.mode,
                        ..probe
                    },
                    metadata,
                }),
                Err(e) => warn!(
                    "[PHASE: backups] [STEP: list] Ignoring incomplete snapshot {}: {:#}",
                    id, e
                ),
            }
        }
        out.sort_by(|a, b| {
            b.metadata
                .created_at
                .cmp(&a.metadata.created_at)
                .then_with(|| b.handle.id.cmp(&a.handle.id))
        });
        Ok(out)
    }

    async fn delete(&self, handle: &SnapshotHandle) -> Result<()> {
        remove_path(&handle.dir)
            .await
            .with_context(|| format!("Failed to delete snapshot {}", handle.id))?;
        debug!("[PHASE: backups] [STEP: delete] Deleted snapshot {}", handle.id);
        Ok(())
    }

    /// Keep the newest `keep` snapshots; returns the ids removed.
    pub async fn rotate(&self, keep: usize) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        for info in self.list().await?.into_iter().skip(keep) {
            self.delete(&info.handle).await?;
            removed.push(info.handle.id);
        }
        if !removed.is_empty() {
            info!(
                "[PHASE: committing] [STEP: rotate] Rotated out {} snapshot(s): {}",
                removed.len(),
                removed.join(", ")
            );
        }
        Ok(removed)
    }

    /// Post-success cleanup: drop this run's snapshot (unless kept), drop snapshots consumed by
    /// earlier rollbacks, then rotate.
    pub async fn commit(
        &self,
        handle: Option<&SnapshotHandle>,
        keep_successful: bool,
        retention: usize,
    ) -> Result<()> {
        if let Some(h) = handle {
            if keep_successful {
                info!(
                    "[PHASE: committing] [STEP: backups] Keeping snapshot {} (keep_successful_backups)",
                    h.id
                );
            } else {
                self.delete(h).await?;
            }
        }
        for info in self.list().await? {
            if info.metadata.state == SnapshotState::Restored {
                info!(
                    "[PHASE: committing] [STEP: backups] Removing snapshot {} consumed by an earlier rollback",
                    info.handle.id
                );
                self.delete(&info.handle).await?;
            }
        }
        self.rotate(retention).await?;
        Ok(())
    }
}

/// Move the current entry aside (if any) and the staged one (if present) into place.
///
/// Returns whether a current entry was displaced.
async fn swap_entry(
    root: &Path,
    staging: &Path,
    displaced: &Path,
    entry: &ScopeEntry,
) -> Result<bool> {
    let current = root.join(&entry.name);
    let had_current = tokio::fs::symlink_metadata(&current).await.is_ok();
    if had_current {
        tokio::fs::rename(&current, displaced.join(&entry.name))
            .await
            .with_context(|| format!("Failed to move {:?} aside", current))?;
    }
    if entry.present {
        if let Err(e) = tokio::fs::rename(staging.join(&entry.name), &current).await {
            if had_current {
                let _ = tokio::fs::rename(displaced.join(&entry.name), &current).await;
            }
            return Err(anyhow::Error::new(e)
                .context(format!("Failed to move staged {} into place", entry.name)));
        }
    }
    Ok(had_current)
}

async fn undo_swaps(root: &Path, displaced: &Path, swapped: &[(String, bool)]) {
    for (name, had_current) in swapped.iter().rev() {
        let current = root.join(name);
        if let Err(e) = remove_path(&current).await {
            error!(
                "[PHASE: rolling-back] [STEP: restore] Failed to remove restored {:?} during undo: {:#}",
                current, e
            );
            continue;
        }
        if *had_current {
            if let Err(e) = tokio::fs::rename(displaced.join(name), &current).await {
                error!(
                    "[PHASE: rolling-back] [STEP: restore] Failed to move {} back; it remains in {:?}: {}",
                    name, displaced, e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn write(root: &Path, rel: &str, body: &str) {
        let p = root.join(rel);
        std::fs::create_dir_all(p.parent().unwrap()).unwrap();
        std::fs::write(p, body).unwrap();
    }

    /// Relative path -> contents for every regular file under `root`, skipping backups.
    fn tree_contents(root: &Path) -> BTreeMap<String, String> {
        fn walk(base: &Path, dir: &Path, out: &mut BTreeMap<String, String>) {
            for ent in std::fs::read_dir(dir).unwrap() {
                let ent = ent.unwrap();
                let p = ent.path();
                let rel = p.strip_prefix(base).unwrap().to_string_lossy().to_string();
                if rel == BACKUPS_DIR || rel == LOCK_FILE {
                    continue;
                }
                if p.is_dir() {
                    walk(base, &p, out);
                } else {
                    out.insert(rel, std::fs::read_to_string(&p).unwrap());
                }
            }
        }
        let mut out = BTreeMap::new();
        walk(root, root, &mut out);
        out
    }

    fn seeded() -> (tempfile::TempDir, BackupController) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("stack");
        write(&root, "config/docker-compose.yml", "services: {}\n");
        write(&root, "secrets/postgres_password", "pw-1");
        write(&root, ".admin-initialized", "{\"email\":\"ops@example.com\"}");
        write(&root, "data/pg/base", "rows");
        (dir, BackupController::new(InstallLayout::new(&root)))
    }

    #[tokio::test]
    async fn lean_scope_excludes_data() {
        let (_dir, ctl) = seeded();
        let handle = ctl.snapshot(BackupMode::Lean, Scenario::Reinstall).await.unwrap();
        assert!(handle.id.ends_with("-lean"));
        let manifest = ctl.read_manifest(&handle).await.unwrap();
        assert!(manifest.files.iter().any(|f| f.path == "secrets/postgres_password"));
        assert!(!manifest.files.iter().any(|f| f.path.starts_with("data")));
        assert!(handle.tree().join("config/docker-compose.yml").exists());
    }

    #[tokio::test]
    async fn full_scope_includes_everything_but_backups_and_lock() {
        let (_dir, ctl) = seeded();
        std::fs::write(&ctl.layout().lock_file, b"").unwrap();
        let scope = ctl.scope(BackupMode::Full).await.unwrap();
        assert!(scope.contains(&"data".to_string()));
        assert!(!scope.contains(&BACKUPS_DIR.to_string()));
        assert!(!scope.contains(&LOCK_FILE.to_string()));
    }

    #[tokio::test]
    async fn restore_brings_back_exact_lean_state() {
        let (_dir, ctl) = seeded();
        let root = ctl.layout().root.clone();
        let before = tree_contents(&root);
        let handle = ctl.snapshot(BackupMode::Lean, Scenario::Upgrade).await.unwrap();

        // simulate a half-finished upgrade
        std::fs::remove_dir_all(root.join("secrets")).unwrap();
        write(&root, "config/docker-compose.yml", "services: {broken: true}\n");
        write(&root, "config/new-file.yml", "x");
        std::fs::remove_file(root.join(".admin-initialized")).unwrap();

        ctl.restore(&handle).await.unwrap();
        assert_eq!(tree_contents(&root), before);
        // snapshot itself untouched
        assert!(handle.tree().join("secrets/postgres_password").exists());
        // no staging leftovers
        let leftovers: Vec<_> = std::fs::read_dir(&root)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .filter(|n| n.starts_with(".restore-"))
            .collect();
        assert!(leftovers.is_empty(), "{:?}", leftovers);
    }

    #[tokio::test]
    async fn restore_removes_entries_absent_at_snapshot_time() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("stack");
        std::fs::create_dir_all(&root).unwrap();
        let ctl = BackupController::new(InstallLayout::new(&root));
        let handle = ctl.snapshot(BackupMode::Lean, Scenario::Fresh).await.unwrap();

        write(&root, "config/docker-compose.yml", "services: {}\n");
        write(&root, "secrets/redis_password", "pw");

        ctl.restore(&handle).await.unwrap();
        assert!(!root.join("config").exists());
        assert!(!root.join("secrets").exists());
        assert!(root.join(BACKUPS_DIR).exists());
    }

    #[tokio::test]
    async fn full_restore_covers_data() {
        let (_dir, ctl) = seeded();
        let root = ctl.layout().root.clone();
        let before = tree_contents(&root);
        let handle = ctl.snapshot(BackupMode::Full, Scenario::Reinstall).await.unwrap();
        std::fs::remove_dir_all(root.join("data")).unwrap();
        write(&root, "logs/extra.log", "x");

        ctl.restore(&handle).await.unwrap();
        assert_eq!(tree_contents(&root), before);
        // created after the snapshot, so a full restore removes it
        assert!(!root.join("logs").exists());
    }

    #[tokio::test]
    async fn lean_restore_leaves_unscoped_entries_alone() {
        let (_dir, ctl) = seeded();
        let root = ctl.layout().root.clone();
        let handle = ctl.snapshot(BackupMode::Lean, Scenario::Reinstall).await.unwrap();
        write(&root, "logs/extra.log", "x");

        ctl.restore(&handle).await.unwrap();
        assert!(root.join("logs/extra.log").exists());
        assert!(root.join("data/pg/base").exists());
    }

    #[tokio::test]
    async fn corrupted_snapshot_refuses_restore_and_leaves_root_alone() {
        let (_dir, ctl) = seeded();
        let root = ctl.layout().root.clone();
        let handle = ctl.snapshot(BackupMode::Lean, Scenario::Reinstall).await.unwrap();
        write(&root, "secrets/postgres_password", "pw-2");
        std::fs::write(handle.tree().join("secrets/postgres_password"), "tampered").unwrap();

        let err = ctl.restore(&handle).await.unwrap_err();
        assert!(format!("{:#}", err).contains("integrity"), "{:#}", err);
        assert_eq!(
            std::fs::read_to_string(root.join("secrets/postgres_password")).unwrap(),
            "pw-2"
        );
    }

    #[tokio::test]
    async fn rotate_keeps_newest() {
        let (_dir, ctl) = seeded();
        let mut ids = Vec::new();
        for _ in 0..4 {
            ids.push(ctl.snapshot(BackupMode::Lean, Scenario::Upgrade).await.unwrap().id);
        }
        let removed = ctl.rotate(2).await.unwrap();
        assert_eq!(removed.len(), 2);
        let remaining: Vec<String> = ctl.list().await.unwrap().into_iter().map(|s| s.handle.id).collect();
        assert_eq!(remaining.len(), 2);
        for id in &removed {
            assert!(!remaining.contains(id));
        }
    }

    #[tokio::test]
    async fn commit_drops_current_and_restored_snapshots() {
        let (_dir, ctl) = seeded();
        let rolled_back = ctl.snapshot(BackupMode::Lean, Scenario::Upgrade).await.unwrap();
        ctl.mark_restored(&rolled_back).await.unwrap();
        let kept = ctl.snapshot(BackupMode::Lean, Scenario::Upgrade).await.unwrap();
        let current = ctl.snapshot(BackupMode::Lean, Scenario::Upgrade).await.unwrap();

        ctl.commit(Some(&current), false, 5).await.unwrap();
        let ids: Vec<String> = ctl.list().await.unwrap().into_iter().map(|s| s.handle.id).collect();
        assert_eq!(ids, vec![kept.id]);
    }

    #[tokio::test]
    async fn commit_can_keep_successful_snapshot() {
        let (_dir, ctl) = seeded();
        let current = ctl.snapshot(BackupMode::Lean, Scenario::Upgrade).await.unwrap();
        ctl.commit(Some(&current), true, 5).await.unwrap();
        assert_eq!(ctl.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn incomplete_snapshots_are_ignored_by_list() {
        let (_dir, ctl) = seeded();
        std::fs::create_dir_all(ctl.layout().backups_dir.join("20990101-000000-lean/tree")).unwrap();
        assert!(ctl.list().await.unwrap().is_empty());
    }
}
