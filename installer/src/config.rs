//! Installer configuration.
//!
//! Built once at startup from (lowest to highest precedence) built-in defaults, an optional TOML
//! file, `STACK_INSTALLER_*` environment variables and finally CLI overrides. The resulting
//! `InstallerConfig` is passed by reference to every component; nothing reads the environment
//! after this point.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::health::registry::HealthSpec;
use crate::models::request::CacheLevel;
use crate::models::tier::{default_tiers, ServiceTier};
use crate::utils::retry::RetryPolicy;

pub const ENV_PREFIX: &str = "STACK_INSTALLER";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallerConfig {
    pub install_root: PathBuf,
    /// Staging directory holding the compose template and build contexts.
    pub source_dir: PathBuf,
    /// Compose template, relative to `source_dir`.
    pub compose_template: PathBuf,
    pub project_name: String,
    pub cache_level: CacheLevel,
    /// Set by provisioning tooling to force the fresh scenario on `install`.
    pub fresh_install: bool,
    pub log_dir: Option<PathBuf>,
    pub backup_retention: usize,
    pub keep_successful_backups: bool,
    pub min_free_disk_mb: u64,
    pub required_tools: Vec<String>,
    pub hostname: String,
    /// Secret files generated under `secrets/` when missing.
    pub generated_secrets: Vec<String>,
    pub secrets_engine: SecretsEngineConfig,
    pub identity: IdentityConfig,
    pub smoke_endpoints: Vec<SmokeEndpoint>,
    pub smoke_policy: RetryPolicy,
    pub tiers: Vec<ServiceTier>,
    /// Per-service health overrides, merged over the built-in table.
    pub health: BTreeMap<String, HealthSpec>,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            install_root: PathBuf::from("/opt/stack"),
            source_dir: PathBuf::from("/usr/share/stack-installer"),
            compose_template: PathBuf::from("compose/docker-compose.template.yml"),
            project_name: "stack".to_string(),
            cache_level: CacheLevel::default(),
            fresh_install: false,
            log_dir: None,
            backup_retention: 5,
            keep_successful_backups: false,
            min_free_disk_mb: 4096,
            required_tools: vec!["docker".to_string(), "openssl".to_string()],
            hostname: "localhost".to_string(),
            generated_secrets: [
                "postgres_password",
                "redis_password",
                "rabbitmq_password",
                "keycloak_admin_password",
                "app_secret_key",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            secrets_engine: SecretsEngineConfig::default(),
            identity: IdentityConfig::default(),
            smoke_endpoints: vec![
                SmokeEndpoint {
                    name: "application".to_string(),
                    url: "http://127.0.0.1:8000/health".to_string(),
                },
                SmokeEndpoint {
                    name: "authentication".to_string(),
                    url: "http://127.0.0.1:8080/realms/stack".to_string(),
                },
            ],
            smoke_policy: RetryPolicy::new(10, Duration::from_secs(3)),
            tiers: default_tiers(),
            health: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretsEngineConfig {
    pub url: String,
    /// Compose service running the engine.
    pub service: String,
    pub key_shares: u8,
    pub key_threshold: u8,
    /// Engine entries that must survive a reinstall.
    pub preserved: Vec<SecretRef>,
}

impl Default for SecretsEngineConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8200".to_string(),
            service: "vault".to_string(),
            key_shares: 5,
            key_threshold: 3,
            preserved: vec![
                SecretRef::new("secret/data/app", "api_token"),
                SecretRef::new("secret/data/app", "signing_key"),
                SecretRef::new("secret/data/integrations", "ai_gateway_token"),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SecretRef {
    pub path: String,
    pub key: String,
}

impl SecretRef {
    pub fn new(path: &str, key: &str) -> Self {
        Self {
            path: path.to_string(),
            key: key.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub url: String,
    pub realm: String,
    pub admin_user: String,
    /// Name of the generated secret holding the identity provider's master admin password.
    pub admin_password_secret: String,
    pub admin_email: Option<String>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8080".to_string(),
            realm: "stack".to_string(),
            admin_user: "admin".to_string(),
            admin_password_secret: "keycloak_admin_password".to_string(),
            admin_email: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmokeEndpoint {
    pub name: String,
    pub url: String,
}

impl InstallerConfig {
    /// Layer defaults, an optional TOML file and `STACK_INSTALLER_*` environment variables.
    ///
    /// Nested keys use a double underscore, e.g. `STACK_INSTALLER_SECRETS_ENGINE__URL`.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("required_tools")
                .with_list_parse_key("generated_secrets"),
        );

        let cfg: InstallerConfig = builder
            .build()
            .context("Failed to read installer configuration")?
            .try_deserialize()
            .context("Invalid installer configuration")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.install_root.is_absolute() {
            anyhow::bail!(
                "install_root must be an absolute path (got {:?})",
                self.install_root
            );
        }
        if self.install_root.parent().is_none() {
            anyhow::bail!("install_root cannot be the filesystem root");
        }
        if self.backup_retention == 0 {
            anyhow::bail!("backup_retention must be at least 1");
        }
        if self.secrets_engine.key_threshold == 0
            || self.secrets_engine.key_threshold > self.secrets_engine.key_shares
        {
            anyhow::bail!(
                "secrets_engine.key_threshold must be between 1 and key_shares ({})",
                self.secrets_engine.key_shares
            );
        }
        crate::models::tier::validate_tiers(&self.tiers)?;
        Ok(())
    }

    pub fn layout(&self) -> InstallLayout {
        InstallLayout::new(&self.install_root)
    }

    pub fn compose_template_path(&self) -> PathBuf {
        self.source_dir.join(&self.compose_template)
    }
}

/// Every path the installer touches, derived from the installation root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallLayout {
    pub root: PathBuf,
    pub config_dir: PathBuf,
    pub secrets_dir: PathBuf,
    pub data_dir: PathBuf,
    pub backups_dir: PathBuf,
    pub certs_dir: PathBuf,
    pub compose_file: PathBuf,
    pub env_file: PathBuf,
    pub install_state: PathBuf,
    pub admin_marker: PathBuf,
    pub lock_file: PathBuf,
}

pub const CONFIG_DIR: &str = "config";
pub const SECRETS_DIR: &str = "secrets";
pub const DATA_DIR: &str = "data";
pub const BACKUPS_DIR: &str = "backups";
pub const ADMIN_MARKER: &str = ".admin-initialized";
pub const LOCK_FILE: &str = ".install.lock";

/// Unseal material and root token written by the secrets-engine bootstrap.
pub const ENGINE_INIT_FILE: &str = "engine-init.json";

impl InstallLayout {
    pub fn new(root: &Path) -> Self {
        let config_dir = root.join(CONFIG_DIR);
        Self {
            root: root.to_path_buf(),
            secrets_dir: root.join(SECRETS_DIR),
            data_dir: root.join(DATA_DIR),
            backups_dir: root.join(BACKUPS_DIR),
            certs_dir: config_dir.join("certs"),
            compose_file: config_dir.join("docker-compose.yml"),
            env_file: config_dir.join(".env"),
            install_state: config_dir.join("install-state.toml"),
            admin_marker: root.join(ADMIN_MARKER),
            lock_file: root.join(LOCK_FILE),
            config_dir,
        }
    }

    /// An installation exists when generated config, secrets or the admin marker are present.
    pub fn is_installed(&self) -> bool {
        self.config_dir.exists() || self.secrets_dir.exists() || self.admin_marker.exists()
    }

    pub fn engine_init_file(&self) -> PathBuf {
        self.secrets_dir.join(ENGINE_INIT_FILE)
    }

    pub fn secret_file(&self, name: &str) -> PathBuf {
        self.secrets_dir.join(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        InstallerConfig::default().validate().unwrap();
    }

    #[test]
    fn relative_root_rejected() {
        let cfg = InstallerConfig {
            install_root: PathBuf::from("opt/stack"),
            ..InstallerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_retention_rejected() {
        let cfg = InstallerConfig {
            backup_retention: 0,
            ..InstallerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn load_reads_toml_file_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("installer.toml");
        std::fs::write(
            &file,
            r#"
install_root = "/srv/stack"
backup_retention = 2
cache_level = "minimal"

[secrets_engine]
url = "http://10.0.0.5:8200"

[health.postgres]
strategy = "runtime-status"
command = ["pg_isready", "-U", "postgres"]
max_attempts = 90
interval = 2000
"#,
        )
        .unwrap();

        let cfg = InstallerConfig::load(Some(&file)).unwrap();
        assert_eq!(cfg.install_root, PathBuf::from("/srv/stack"));
        assert_eq!(cfg.backup_retention, 2);
        assert_eq!(cfg.cache_level, CacheLevel::Minimal);
        assert_eq!(cfg.secrets_engine.url, "http://10.0.0.5:8200");
        // untouched nested defaults survive
        assert_eq!(cfg.secrets_engine.service, "vault");
        assert_eq!(cfg.health["postgres"].max_attempts, 90);
        assert_eq!(cfg.tiers.len(), default_tiers().len());
    }

    #[test]
    fn layout_paths_hang_off_root() {
        let layout = InstallLayout::new(Path::new("/opt/stack"));
        assert_eq!(layout.secrets_dir, PathBuf::from("/opt/stack/secrets"));
        assert_eq!(
            layout.compose_file,
            PathBuf::from("/opt/stack/config/docker-compose.yml")
        );
        assert_eq!(
            layout.engine_init_file(),
            PathBuf::from("/opt/stack/secrets/engine-init.json")
        );
        assert_eq!(layout.lock_file, PathBuf::from("/opt/stack/.install.lock"));
    }

    #[test]
    fn is_installed_detects_marker() {
        let dir = tempfile::tempdir().unwrap();
        let layout = InstallLayout::new(dir.path());
        assert!(!layout.is_installed());
        std::fs::write(&layout.admin_marker, b"{}").unwrap();
        assert!(layout.is_installed());
    }
}
