// Service tiers
//
// The tier list is static configuration: a fixed, ordered set of named groups. Services inside
// a tier have no ordering among themselves; tiers are strictly ordered.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TierKind {
    Infrastructure,
    AuthMessaging,
    Application,
    FrontendWorkers,
    Auxiliary,
    Observability,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Criticality {
    /// Any unhealthy member forces a rollback.
    Critical,
    /// Unhealthy members are logged and tolerated.
    Optional,
}

impl TierKind {
    /// Only auxiliary and observability tiers may be downgraded to degraded-but-continue.
    pub fn criticality(&self) -> Criticality {
        match self {
            TierKind::Auxiliary | TierKind::Observability => Criticality::Optional,
            _ => Criticality::Critical,
        }
    }
}

/// Steps the state machine runs once a tier reports healthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TierHook {
    UnsealSecretsEngine,
    RestoreEngineCredentials,
    BootstrapIdentityAdmin,
}

impl TierHook {
    pub fn as_str(&self) -> &'static str {
        match self {
            TierHook::UnsealSecretsEngine => "unseal-secrets-engine",
            TierHook::RestoreEngineCredentials => "restore-engine-credentials",
            TierHook::BootstrapIdentityAdmin => "bootstrap-identity-admin",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceTier {
    pub name: String,
    pub kind: TierKind,
    pub services: Vec<String>,
    #[serde(default)]
    pub hooks: Vec<TierHook>,
}

impl ServiceTier {
    pub fn new(name: &str, kind: TierKind, services: &[&str], hooks: &[TierHook]) -> Self {
        Self {
            name: name.to_string(),
            kind,
            services: services.iter().map(|s| s.to_string()).collect(),
            hooks: hooks.to_vec(),
        }
    }

    pub fn criticality(&self) -> Criticality {
        self.kind.criticality()
    }

    pub fn is_critical(&self) -> bool {
        self.criticality() == Criticality::Critical
    }
}

pub fn default_tiers() -> Vec<ServiceTier> {
    vec![
        ServiceTier::new(
            "infrastructure",
            TierKind::Infrastructure,
            &["postgres", "redis", "vault"],
            &[TierHook::UnsealSecretsEngine, TierHook::RestoreEngineCredentials],
        ),
        ServiceTier::new(
            "auth-messaging",
            TierKind::AuthMessaging,
            &["keycloak", "rabbitmq"],
            &[TierHook::BootstrapIdentityAdmin],
        ),
        ServiceTier::new("application", TierKind::Application, &["api"], &[]),
        ServiceTier::new(
            "frontend-workers",
            TierKind::FrontendWorkers,
            &["frontend", "worker"],
            &[],
        ),
        ServiceTier::new(
            "auxiliary-ai",
            TierKind::Auxiliary,
            &["ollama", "ai-gateway"],
            &[],
        ),
        ServiceTier::new(
            "observability",
            TierKind::Observability,
            &["prometheus", "loki", "grafana"],
            &[],
        ),
    ]
}

/// Reject tier tables the scheduler cannot honour.
pub fn validate_tiers(tiers: &[ServiceTier]) -> anyhow::Result<()> {
    if tiers.is_empty() {
        anyhow::bail!("Tier list is empty");
    }

    let mut seen: HashSet<&str> = HashSet::new();
    for tier in tiers {
        if tier.name.trim().is_empty() {
            anyhow::bail!("Tier with empty name");
        }
        if tier.services.is_empty() {
            anyhow::bail!("Tier '{}' has no services", tier.name);
        }
        for svc in &tier.services {
            crate::utils::validation::validate_service_id(svc)?;
            if !seen.insert(svc.as_str()) {
                anyhow::bail!(
                    "Service '{}' appears in more than one tier (second occurrence in '{}')",
                    svc,
                    tier.name
                );
            }
        }
        if !tier.is_critical() && !tier.hooks.is_empty() {
            // Hooks feed later critical tiers; they cannot hang off a tier that may be skipped.
            anyhow::bail!("Optional tier '{}' cannot carry post-tier hooks", tier.name);
        }
    }
    Ok(())
}
