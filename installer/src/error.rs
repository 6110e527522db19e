//! Error taxonomy for the installation state machine.
//!
//! Collaborators (container runtime, secrets engine, identity provider, generators) return
//! `anyhow::Result` with context. The state machine wraps those into an `InstallError` variant
//! named after the phase that failed, so it can always decide between abort, rollback and
//! continue.

use std::path::PathBuf;
use thiserror::Error;

use crate::models::outcome::Phase;

#[derive(Error, Debug)]
pub enum InstallError {
    #[error("Precondition failed: {reason}")]
    Precondition { reason: String },

    #[error("Another installer run holds the lock at {path:?}")]
    Lock { path: PathBuf },

    #[error("Backup failed: {source:#}")]
    Backup {
        #[source]
        source: anyhow::Error,
    },

    #[error("Teardown failed: {source:#}")]
    Teardown {
        #[source]
        source: anyhow::Error,
    },

    #[error("Provisioning failed: {source:#}")]
    Provisioning {
        #[source]
        source: anyhow::Error,
    },

    #[error("Tier '{tier}' is unhealthy (services: {})", unhealthy.join(", "))]
    TierHealth { tier: String, unhealthy: Vec<String> },

    #[error("Post-tier step '{hook}' failed: {source:#}")]
    Hook {
        hook: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Final verification failed: {reason}")]
    Verification { reason: String },

    #[error("Restore failed: {source:#}")]
    Restore {
        #[source]
        source: anyhow::Error,
    },

    #[error("Installation cancelled by operator during {phase}")]
    Cancelled { phase: Phase },
}

impl InstallError {
    pub fn precondition(reason: impl Into<String>) -> Self {
        InstallError::Precondition {
            reason: reason.into(),
        }
    }

    /// True when the failure happened before anything on disk or in the runtime was touched.
    pub fn is_pre_mutation(&self) -> bool {
        matches!(
            self,
            InstallError::Precondition { .. } | InstallError::Lock { .. } | InstallError::Backup { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_health_message_lists_services() {
        let e = InstallError::TierHealth {
            tier: "infrastructure".to_string(),
            unhealthy: vec!["postgres".to_string(), "vault".to_string()],
        };
        assert_eq!(
            e.to_string(),
            "Tier 'infrastructure' is unhealthy (services: postgres, vault)"
        );
    }

    #[test]
    fn pre_mutation_classification() {
        assert!(InstallError::precondition("docker missing").is_pre_mutation());
        assert!(InstallError::Backup {
            source: anyhow::anyhow!("disk full")
        }
        .is_pre_mutation());
        assert!(!InstallError::Provisioning {
            source: anyhow::anyhow!("template")
        }
        .is_pre_mutation());
        assert!(!InstallError::Cancelled {
            phase: Phase::StartingTiers
        }
        .is_pre_mutation());
    }
}
