//! Credential preservation across reinstall/upgrade.
//!
//! Captured before teardown: every file under `secrets/`, the admin marker and the configured
//! secrets-engine entries. Files go back during provisioning; engine entries go back once the
//! engine tier is healthy and unsealed, before any application tier starts.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{InstallLayout, SecretRef, ADMIN_MARKER, SECRETS_DIR};
use crate::installation::files::{
    ensure_dir_with_retries, set_mode, write_file_with_retries, write_private_file,
};
use crate::installation::{EngineInit, SecretsEngine};
use crate::security::secret_protector::SecretProtector;

/// Encrypted copy of a `CredentialSet`, stored next to the snapshot it belongs to.
pub const CREDENTIALS_BLOB: &str = "credentials.enc";

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineEntry {
    pub path: String,
    pub key: String,
    pub value: String,
}

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialSet {
    /// Path relative to the installation root -> contents (base64 on the wire).
    #[serde(with = "b64_map")]
    pub files: BTreeMap<String, Vec<u8>>,
    pub engine: Vec<EngineEntry>,
    #[serde(default, with = "b64_opt")]
    pub admin_marker: Option<Vec<u8>>,
}

impl std::fmt::Debug for CredentialSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialSet")
            .field("files", &self.files.keys().collect::<Vec<_>>())
            .field(
                "engine",
                &self
                    .engine
                    .iter()
                    .map(|e| format!("{}#{}", e.path, e.key))
                    .collect::<Vec<_>>(),
            )
            .field("admin_marker", &self.admin_marker.is_some())
            .finish()
    }
}

impl CredentialSet {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.engine.is_empty() && self.admin_marker.is_none()
    }
}

mod b64_map {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(m: &BTreeMap<String, Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        m.iter()
            .map(|(k, v)| (k.clone(), base64::engine::general_purpose::STANDARD.encode(v)))
            .collect::<BTreeMap<String, String>>()
            .serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<BTreeMap<String, Vec<u8>>, D::Error> {
        BTreeMap::<String, String>::deserialize(d)?
            .into_iter()
            .map(|(k, v)| {
                base64::engine::general_purpose::STANDARD
                    .decode(v)
                    .map(|bytes| (k, bytes))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}

mod b64_opt {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        v.as_ref()
            .map(|b| base64::engine::general_purpose::STANDARD.encode(b))
            .serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(d)?
            .map(|s| {
                base64::engine::general_purpose::STANDARD
                    .decode(s)
                    .map_err(serde::de::Error::custom)
            })
            .transpose()
    }
}

pub async fn read_engine_init(layout: &InstallLayout) -> Result<Option<EngineInit>> {
    let path = layout.engine_init_file();
    if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
        return Ok(None);
    }
    let bytes = tokio::fs::read(&path)
        .await
        .with_context(|| format!("Failed to read {:?}", path))?;
    let init = serde_json::from_slice(&bytes)
        .with_context(|| format!("Secrets engine init file {:?} is corrupt", path))?;
    Ok(Some(init))
}

pub async fn write_engine_init(layout: &InstallLayout, init: &EngineInit) -> Result<()> {
    ensure_dir_with_retries(&layout.secrets_dir, "ensure_secrets_dir").await?;
    write_private_file(
        &layout.engine_init_file(),
        &serde_json::to_vec_pretty(init)?,
        "write_engine_init",
    )
    .await
}

/// Unseal with the stored key shares until the engine reports unsealed.
pub async fn unseal_with(engine: &dyn SecretsEngine, init: &EngineInit) -> Result<()> {
    for (i, key) in init.unseal_keys.iter().enumerate() {
        let sealed = engine
            .unseal(key)
            .await
            .with_context(|| format!("Unseal share {} rejected", i + 1))?;
        if !sealed {
            debug!(
                "[PHASE: starting-tiers] [STEP: engine] Unsealed after {} share(s)",
                i + 1
            );
            return Ok(());
        }
    }
    anyhow::bail!(
        "Secrets engine still sealed after submitting all {} stored key shares",
        init.unseal_keys.len()
    )
}

pub struct CredentialManager {
    layout: InstallLayout,
    engine: Arc<dyn SecretsEngine>,
    preserved: Vec<SecretRef>,
    protector: SecretProtector,
}

impl CredentialManager {
    pub fn new(
        layout: InstallLayout,
        engine: Arc<dyn SecretsEngine>,
        preserved: Vec<SecretRef>,
        protector: SecretProtector,
    ) -> Self {
        Self {
            layout,
            engine,
            preserved,
            protector,
        }
    }

    pub async fn capture(&self) -> Result<CredentialSet> {
        let mut set = CredentialSet::default();
        self.capture_files(&self.layout.secrets_dir, &mut set).await?;

        if tokio::fs::try_exists(&self.layout.admin_marker).await.unwrap_or(false) {
            set.admin_marker = Some(
                tokio::fs::read(&self.layout.admin_marker)
                    .await
                    .with_context(|| format!("Failed to read {:?}", self.layout.admin_marker))?,
            );
        }

        if !self.preserved.is_empty() {
            match read_engine_init(&self.layout).await? {
                Some(init) => set.engine = self.capture_engine(&init).await?,
                None => warn!(
                    "[PHASE: backing-up] [STEP: credentials] No secrets engine init file; engine entries cannot be captured"
                ),
            }
        }

        info!(
            "[PHASE: backing-up] [STEP: credentials] Captured credentials (files={}, engine_entries={}, admin_marker={})",
            set.files.len(),
            set.engine.len(),
            set.admin_marker.is_some()
        );
        Ok(set)
    }

    async fn capture_files(&self, dir: &Path, set: &mut CredentialSet) -> Result<()> {
        if !dir.exists() {
            return Ok(());
        }
        let mut stack = vec![dir.to_path_buf()];
        while let Some(d) = stack.pop() {
            let mut rd = tokio::fs::read_dir(&d)
                .await
                .with_context(|| format!("read_dir failed: {:?}", d))?;
            while let Some(ent) = rd.next_entry().await? {
                let p = ent.path();
                let ft = ent.file_type().await?;
                if ft.is_dir() {
                    stack.push(p);
                } else if ft.is_file() {
                    let rel = relative_key(&self.layout.root, &p)?;
                    let bytes = tokio::fs::read(&p)
                        .await
                        .with_context(|| format!("Failed to read secret {:?}", p))?;
                    set.files.insert(rel, bytes);
                }
            }
        }
        Ok(())
    }

    async fn capture_engine(&self, init: &EngineInit) -> Result<Vec<EngineEntry>> {
        let status = self
            .engine
            .status()
            .await
            .context("Secrets engine must be reachable to capture preserved entries")?;
        if !status.initialized {
            warn!("[PHASE: backing-up] [STEP: credentials] Secrets engine is not initialized; nothing to capture");
            return Ok(Vec::new());
        }
        if status.sealed {
            unseal_with(self.engine.as_ref(), init).await?;
        }

        let mut entries = Vec::new();
        for r in &self.preserved {
            match self.engine.read(&init.root_token, &r.path, &r.key).await? {
                Some(value) => entries.push(EngineEntry {
                    path: r.path.clone(),
                    key: r.key.clone(),
                    value,
                }),
                None => debug!(
                    "[PHASE: backing-up] [STEP: credentials] {}#{} not set; skipping",
                    r.path, r.key
                ),
            }
        }
        Ok(entries)
    }

    /// Write captured files back under the root (secrets 0600 inside a 0700 directory).
    pub async fn reinject_files(&self, set: &CredentialSet) -> Result<()> {
        for (rel, bytes) in &set.files {
            let path = self.layout.root.join(rel);
            if let Some(parent) = path.parent() {
                ensure_dir_with_retries(parent, "ensure_secret_parent").await?;
            }
            write_private_file(&path, bytes, "reinject_secret").await?;
        }
        if self.layout.secrets_dir.exists() {
            set_mode(&self.layout.secrets_dir, 0o700).await?;
        }
        if let Some(marker) = &set.admin_marker {
            write_file_with_retries(&self.layout.admin_marker, marker, "reinject_admin_marker")
                .await?;
        }
        info!(
            "[PHASE: provisioning] [STEP: credentials] Re-injected {} secret file(s)",
            set.files.len()
        );
        Ok(())
    }

    pub async fn reinject_engine(&self, set: &CredentialSet, token: &str) -> Result<()> {
        for e in &set.engine {
            self.engine
                .write(token, &e.path, &e.key, &e.value)
                .await
                .with_context(|| format!("Failed to restore {}#{}", e.path, e.key))?;
        }
        info!(
            "[PHASE: starting-tiers] [STEP: credentials] Restored {} secrets engine entr(ies)",
            set.engine.len()
        );
        Ok(())
    }

    /// Store an encrypted copy of `set` in `dir` (normally the snapshot directory).
    pub async fn store(&self, set: &CredentialSet, dir: &Path) -> Result<PathBuf> {
        let json = serde_json::to_vec(set)?;
        let blob = self.protector.encrypt(&json).await?;
        let path = dir.join(CREDENTIALS_BLOB);
        write_private_file(&path, blob.as_bytes(), "write_credentials_blob").await?;
        Ok(path)
    }

    /// Decrypt the copy stored by `store`; `None` when `dir` holds no blob.
    pub async fn load(&self, dir: &Path) -> Result<Option<CredentialSet>> {
        let path = dir.join(CREDENTIALS_BLOB);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(None);
        }
        let blob = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {:?}", path))?;
        let json = self.protector.decrypt(&blob).await?;
        serde_json::from_slice(&json)
            .map(Some)
            .context("Credential blob payload is corrupt")
    }
}

fn relative_key(root: &Path, path: &Path) -> Result<String> {
    let rel = path
        .strip_prefix(root)
        .with_context(|| format!("{:?} is outside {:?}", path, root))?;
    let key = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join("/");
    if !key.starts_with(SECRETS_DIR) && key != ADMIN_MARKER {
        anyhow::bail!("Refusing to capture {:?} outside secrets/", path);
    }
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::secret_protector::default_key_path;
    use crate::testing::FakeSecretsEngine;

    fn manager(
        root: &Path,
        engine: Arc<FakeSecretsEngine>,
        preserved: Vec<SecretRef>,
    ) -> CredentialManager {
        let layout = InstallLayout::new(root);
        let protector = SecretProtector::new(default_key_path(&layout.backups_dir));
        CredentialManager::new(layout, engine, preserved, protector)
    }

    async fn seed_engine(root: &Path, engine: &FakeSecretsEngine) -> EngineInit {
        let init = engine.init(5, 3).await.unwrap();
        write_engine_init(&InstallLayout::new(root), &init).await.unwrap();
        init
    }

    #[tokio::test]
    async fn capture_and_reinject_round_trip_files_and_marker() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("secrets/nested")).unwrap();
        std::fs::write(root.join("secrets/postgres_password"), b"pw").unwrap();
        std::fs::write(root.join("secrets/nested/token"), b"tok").unwrap();
        std::fs::write(root.join(".admin-initialized"), b"{}").unwrap();

        let m = manager(root, Arc::new(FakeSecretsEngine::new()), Vec::new());
        let set = m.capture().await.unwrap();
        assert_eq!(set.files.len(), 2);
        assert!(set.files.contains_key("secrets/nested/token"));

        std::fs::remove_dir_all(root.join("secrets")).unwrap();
        std::fs::remove_file(root.join(".admin-initialized")).unwrap();
        m.reinject_files(&set).await.unwrap();

        assert_eq!(std::fs::read(root.join("secrets/postgres_password")).unwrap(), b"pw");
        assert_eq!(std::fs::read(root.join("secrets/nested/token")).unwrap(), b"tok");
        assert!(root.join(".admin-initialized").exists());
    }

    #[tokio::test]
    async fn engine_entries_survive_a_reinitialized_engine() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let engine = Arc::new(FakeSecretsEngine::new());
        let init = seed_engine(root, &engine).await;
        engine
            .write(&init.root_token, "secret/data/app", "api_token", "tok-123")
            .await
            .unwrap();

        let preserved = vec![
            SecretRef::new("secret/data/app", "api_token"),
            SecretRef::new("secret/data/app", "unset_key"),
        ];
        let m = manager(root, engine.clone(), preserved);
        let set = m.capture().await.unwrap();
        assert_eq!(set.engine.len(), 1);

        // volumes wiped: brand new engine with a new root token
        engine.reset();
        let new_init = engine.init(5, 3).await.unwrap();
        unseal_with(engine.as_ref(), &new_init).await.unwrap();
        m.reinject_engine(&set, &new_init.root_token).await.unwrap();

        assert_eq!(
            engine
                .read(&new_init.root_token, "secret/data/app", "api_token")
                .await
                .unwrap(),
            Some("tok-123".to_string())
        );
    }

    #[tokio::test]
    async fn capture_unseals_a_sealed_engine() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeSecretsEngine::new());
        let init = seed_engine(dir.path(), &engine).await;
        engine.write(&init.root_token, "kv/app", "k", "v").await.unwrap();
        engine.seal();

        let m = manager(dir.path(), engine.clone(), vec![SecretRef::new("kv/app", "k")]);
        let set = m.capture().await.unwrap();
        assert_eq!(set.engine.len(), 1);
        assert!(!engine.status().await.unwrap().sealed);
    }

    #[tokio::test]
    async fn capture_fails_when_engine_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeSecretsEngine::new());
        seed_engine(dir.path(), &engine).await;
        engine.set_unreachable(true);

        let m = manager(dir.path(), engine, vec![SecretRef::new("kv/app", "k")]);
        assert!(m.capture().await.is_err());
    }

    #[tokio::test]
    async fn store_and_load_encrypted_blob() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = dir.path().join("backups/20260101-000000-lean");
        std::fs::create_dir_all(&snapshot).unwrap();

        let m = manager(dir.path(), Arc::new(FakeSecretsEngine::new()), Vec::new());
        let mut set = CredentialSet::default();
        set.files.insert("secrets/redis_password".to_string(), b"hunter2".to_vec());
        set.engine.push(EngineEntry {
            path: "kv/app".into(),
            key: "k".into(),
            value: "v".into(),
        });

        let path = m.store(&set, &snapshot).await.unwrap();
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("hunter2"));
        assert_eq!(m.load(&snapshot).await.unwrap(), Some(set));
        assert_eq!(m.load(dir.path()).await.unwrap(), None);
    }

    #[test]
    fn debug_output_hides_values() {
        let mut set = CredentialSet::default();
        set.files.insert("secrets/x".into(), b"plaintext-secret".to_vec());
        let dbg = format!("{:?}", set);
        assert!(dbg.contains("secrets/x"));
        assert!(!dbg.contains("plaintext-secret"));
    }
}
