//! Tier scheduler: start every service of one tier concurrently, then wait for all of them.
//!
//! Tiers themselves run strictly in order; that loop lives in the orchestrator, which only
//! advances when `TierResult::all_healthy` is true.

use futures::future::join_all;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Instant;

use crate::health::registry::{default_spec, HealthRegistry};
use crate::health::strategies::ProcessProbe;
use crate::health::{HealthOutcome, HealthVerifier};
use crate::installation::ContainerRuntime;
use crate::models::tier::ServiceTier;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierResult {
    pub tier: String,
    pub all_healthy: bool,
    pub unhealthy_services: Vec<String>,
    /// Optional tier with failing members that was allowed through.
    pub degraded: bool,
    pub cancelled: bool,
}

pub struct TierScheduler {
    runtime: Arc<dyn ContainerRuntime>,
    registry: Arc<HealthRegistry>,
    verifier: HealthVerifier,
}

impl TierScheduler {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        registry: Arc<HealthRegistry>,
        verifier: HealthVerifier,
    ) -> Self {
        Self {
            runtime,
            registry,
            verifier,
        }
    }

    pub async fn start_tier(&self, tier: &ServiceTier) -> TierResult {
        let started = Instant::now();
        info!(
            "[PHASE: starting-tiers] [STEP: {}] Starting tier (services={}, criticality={:?})",
            tier.name,
            tier.services.join(","),
            tier.criticality()
        );

        let launches = join_all(tier.services.iter().map(|svc| {
            let runtime = self.runtime.clone();
            async move { (svc.clone(), runtime.start_service(svc).await) }
        }))
        .await;

        let mut unhealthy: Vec<String> = Vec::new();
        let mut launched: Vec<String> = Vec::new();
        for (svc, res) in launches {
            match res {
                Ok(()) => launched.push(svc),
                Err(e) => {
                    warn!(
                        "[PHASE: starting-tiers] [STEP: {}] Failed to launch {}: {:#}",
                        tier.name, svc, e
                    );
                    unhealthy.push(svc);
                }
            }
        }

        let outcomes = join_all(launched.iter().map(|svc| {
            let verifier = self.verifier.clone();
            let check = self.registry.lookup(svc).cloned();
            let runtime = self.runtime.clone();
            async move {
                let outcome = match check {
                    Some(check) => verifier.wait(svc, check.strategy.as_ref(), &check.policy).await,
                    None => {
                        let probe = ProcessProbe::new(runtime, svc);
                        verifier.wait(svc, &probe, &default_spec().policy()).await
                    }
                };
                (svc.clone(), outcome)
            }
        }))
        .await;

        let mut cancelled = false;
        for (svc, outcome) in outcomes {
            debug!(
                "[PHASE: starting-tiers] [STEP: {}] {} settled after {} attempt(s) (healthy={})",
                tier.name,
                svc,
                outcome.attempts(),
                outcome.is_healthy()
            );
            match outcome {
                HealthOutcome::Healthy { .. } => {}
                HealthOutcome::Cancelled { .. } => {
                    cancelled = true;
                    unhealthy.push(svc);
                }
                HealthOutcome::TimedOut { .. } => unhealthy.push(svc),
            }
        }
        unhealthy.sort();

        let result = if unhealthy.is_empty() {
            TierResult {
                tier: tier.name.clone(),
                all_healthy: true,
                unhealthy_services: unhealthy,
                degraded: false,
                cancelled,
            }
        } else if tier.is_critical() || cancelled {
            TierResult {
                tier: tier.name.clone(),
                all_healthy: false,
                unhealthy_services: unhealthy,
                degraded: false,
                cancelled,
            }
        } else {
            warn!(
                "[PHASE: starting-tiers] [STEP: {}] Optional tier degraded; continuing without: {}",
                tier.name,
                unhealthy.join(", ")
            );
            TierResult {
                tier: tier.name.clone(),
                all_healthy: true,
                unhealthy_services: unhealthy,
                degraded: true,
                cancelled,
            }
        };

        info!(
            "[PHASE: starting-tiers] [STEP: {}] Tier finished (all_healthy={}, degraded={}, unhealthy=[{}], duration_ms={})",
            tier.name,
            result.all_healthy,
            result.degraded,
            result.unhealthy_services.join(","),
            started.elapsed().as_millis()
        );
        result
    }
}
