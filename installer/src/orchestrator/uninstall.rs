//! `uninstall [--purge]`.
//!
//! Without `--purge` the deployment and generated config go away, but secrets, data and backups
//! stay so a later `install` can pick them up. `--purge` removes volumes and the whole root.

use log::{info, warn};
use std::path::PathBuf;
use std::time::Instant;

use crate::config::InstallLayout;
use crate::error::InstallError;
use crate::installation::files::remove_path;
use crate::installation::{ContainerRuntime, TeardownOptions};
use crate::models::request::CacheLevel;

use super::lock::InstallLock;

#[derive(Debug, Default)]
pub struct UninstallReport {
    pub removed: Vec<PathBuf>,
    pub kept: Vec<PathBuf>,
}

pub async fn uninstall(
    layout: &InstallLayout,
    runtime: &dyn ContainerRuntime,
    purge: bool,
) -> Result<UninstallReport, InstallError> {
    let started = Instant::now();
    if !layout.root.exists() || (!purge && !layout.is_installed()) {
        return Err(InstallError::precondition(format!(
            "Nothing is installed at {:?}",
            layout.root
        )));
    }

    let lock = InstallLock::acquire(&layout.lock_file)?;
    info!(
        "[PHASE: uninstall] [STEP: start] Uninstalling from {:?} (purge={})",
        layout.root, purge
    );

    runtime
        .remove_deployment(TeardownOptions {
            remove_volumes: purge,
            cache: CacheLevel::Moderate,
        })
        .await
        .map_err(|source| InstallError::Teardown { source })?;

    let mut report = UninstallReport::default();
    let remove = |path: PathBuf| async move {
        remove_path(&path)
            .await
            .map(|_| path)
            .map_err(|source| InstallError::Teardown { source })
    };

    if layout.config_dir.exists() {
        report.removed.push(remove(layout.config_dir.clone()).await?);
    }

    if purge {
        for path in [
            layout.secrets_dir.clone(),
            layout.data_dir.clone(),
            layout.backups_dir.clone(),
            layout.admin_marker.clone(),
        ] {
            if tokio::fs::symlink_metadata(&path).await.is_ok() {
                report.removed.push(remove(path).await?);
            }
        }
        // The lock file lives inside the root; unlinking it under a held flock is fine.
        report.removed.push(remove(layout.root.clone()).await?);
        drop(lock);
    } else {
        for path in [&layout.secrets_dir, &layout.data_dir, &layout.backups_dir] {
            if path.exists() {
                report.kept.push(path.clone());
            }
        }
        if !report.kept.is_empty() {
            warn!(
                "[PHASE: uninstall] [STEP: keep] Kept {} (use --purge to remove)",
                report
                    .kept
                    .iter()
                    .map(|p| format!("{:?}", p))
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
    }

    info!(
        "[PHASE: uninstall] [STEP: done] Uninstall complete (removed={}, duration_ms={})",
        report.removed.len(),
        started.elapsed().as_millis()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeRuntime;

    fn populated() -> (tempfile::TempDir, InstallLayout) {
        let dir = tempfile::tempdir().unwrap();
        let layout = InstallLayout::new(&dir.path().join("stack"));
        std::fs::create_dir_all(&layout.config_dir).unwrap();
        std::fs::write(&layout.compose_file, "services: {}\n").unwrap();
        std::fs::create_dir_all(&layout.secrets_dir).unwrap();
        std::fs::write(layout.secret_file("postgres_password"), "pw").unwrap();
        std::fs::create_dir_all(layout.data_dir.join("pg")).unwrap();
        std::fs::create_dir_all(layout.backups_dir.join("20260101-000000-lean")).unwrap();
        std::fs::write(&layout.admin_marker, "{}").unwrap();
        (dir, layout)
    }

    #[tokio::test]
    async fn plain_uninstall_keeps_secrets_data_and_backups() {
        let (_dir, layout) = populated();
        let runtime = FakeRuntime::new();
        let report = uninstall(&layout, &runtime, false).await.unwrap();

        assert!(!layout.config_dir.exists());
        assert!(layout.secret_file("postgres_password").exists());
        assert!(layout.data_dir.exists());
        assert!(layout.backups_dir.exists());
        assert_eq!(report.kept.len(), 3);
        assert!(!runtime.teardowns()[0].remove_volumes);
    }

    #[tokio::test]
    async fn purge_removes_everything_including_volumes() {
        let (_dir, layout) = populated();
        let runtime = FakeRuntime::new();
        uninstall(&layout, &runtime, true).await.unwrap();

        assert!(!layout.root.exists());
        assert!(runtime.teardowns()[0].remove_volumes);
    }

    #[tokio::test]
    async fn nothing_installed_is_a_precondition_error() {
        let dir = tempfile::tempdir().unwrap();
        let layout = InstallLayout::new(&dir.path().join("stack"));
        let runtime = FakeRuntime::new();
        let err = uninstall(&layout, &runtime, false).await.unwrap_err();
        assert!(matches!(err, InstallError::Precondition { .. }));
        assert!(runtime.teardowns().is_empty());
    }

    #[tokio::test]
    async fn runtime_failure_leaves_files_in_place() {
        let (_dir, layout) = populated();
        let runtime = FakeRuntime::new();
        runtime.fail_teardown();
        let err = uninstall(&layout, &runtime, true).await.unwrap_err();
        assert!(matches!(err, InstallError::Teardown { .. }));
        assert!(layout.compose_file.exists());
        assert!(layout.secrets_dir.exists());
    }
}
