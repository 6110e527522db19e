// Installation request model
//
// One request is built per CLI invocation and never mutated afterwards.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scenario {
    /// First install, or `install --fresh` over an existing one, which discards every credential.
    Fresh,
    Reinstall,
    Upgrade,
}

impl Scenario {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scenario::Fresh => "fresh",
            Scenario::Reinstall => "reinstall",
            Scenario::Upgrade => "upgrade",
        }
    }

    /// Reinstall and upgrade carry tokens and generated passwords across the rebuild.
    pub fn preserves_credentials(&self) -> bool {
        !matches!(self, Scenario::Fresh)
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How much of the container image/build cache survives teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheLevel {
    /// Remove every image and rebuild without cache.
    Minimal,
    /// Remove the stack's own images, keep base images.
    #[default]
    Moderate,
    /// Keep everything.
    Full,
}

impl CacheLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheLevel::Minimal => "minimal",
            CacheLevel::Moderate => "moderate",
            CacheLevel::Full => "full",
        }
    }
}

impl FromStr for CacheLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "minimal" => Ok(CacheLevel::Minimal),
            "moderate" => Ok(CacheLevel::Moderate),
            "full" => Ok(CacheLevel::Full),
            other => anyhow::bail!(
                "Unknown cache level '{}' (expected minimal|moderate|full)",
                other
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackupMode {
    /// Configuration, generated secrets and identity-provider state references only.
    #[default]
    Lean,
    /// The entire installation tree.
    Full,
}

impl BackupMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupMode::Lean => "lean",
            BackupMode::Full => "full",
        }
    }
}

impl FromStr for BackupMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lean" => Ok(BackupMode::Lean),
            "full" => Ok(BackupMode::Full),
            other => anyhow::bail!("Unknown backup mode '{}' (expected lean|full)", other),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallationRequest {
    pub scenario: Scenario,
    /// `--no-backup`: the operator explicitly waives the pre-teardown snapshot.
    pub skip_backup: bool,
    /// `--fresh` on reinstall: also remove data volumes. Credentials are still carried over.
    pub fresh_wipe: bool,
    pub backup_mode: BackupMode,
    pub cache: CacheLevel,
    pub no_prompt: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_email: Option<String>,
}

impl InstallationRequest {
    pub fn new(scenario: Scenario) -> Self {
        Self {
            scenario,
            skip_backup: false,
            fresh_wipe: false,
            backup_mode: BackupMode::Lean,
            cache: CacheLevel::default(),
            no_prompt: false,
            admin_email: None,
        }
    }

    pub fn removes_volumes(&self) -> bool {
        self.fresh_wipe
    }
}
