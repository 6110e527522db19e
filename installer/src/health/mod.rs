//! Per-service readiness polling.
//!
//! `HealthVerifier::wait` drives one strategy under one `RetryPolicy` and reports a typed outcome.
//! It has no opinion about criticality; the tier scheduler decides what a timeout means.

pub mod registry;
pub mod strategies;

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::utils::retry::RetryPolicy;

#[async_trait]
pub trait HealthStrategy: Send + Sync {
    /// Short human-readable description for logs, e.g. `http GET http://127.0.0.1:8000/health`.
    fn describe(&self) -> String;
    async fn probe(&self) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthOutcome {
    Healthy { attempts: u32 },
    TimedOut { attempts: u32, last_error: String },
    Cancelled { attempts: u32 },
}

impl HealthOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthOutcome::Healthy { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            HealthOutcome::Healthy { attempts }
            | HealthOutcome::TimedOut { attempts, .. }
            | HealthOutcome::Cancelled { attempts } => *attempts,
        }
    }
}

#[derive(Clone)]
pub struct HealthVerifier {
    cancel: CancellationToken,
}

impl HealthVerifier {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    pub async fn wait(
        &self,
        service: &str,
        strategy: &dyn HealthStrategy,
        policy: &RetryPolicy,
    ) -> HealthOutcome {
        let started = Instant::now();
        debug!(
            "[PHASE: starting-tiers] [STEP: health] wait entered (service={}, strategy={}, max_attempts={}, interval_ms={})",
            service,
            strategy.describe(),
            policy.max_attempts,
            policy.interval.as_millis()
        );

        let mut delays = policy.delays();
        let mut attempt: u32 = 0;
        let mut last_error = String::from("no attempt made");

        loop {
            if self.cancel.is_cancelled() {
                return self.cancelled(service, attempt);
            }
            attempt += 1;

            let result = tokio::select! {
                _ = self.cancel.cancelled() => return self.cancelled(service, attempt),
                r = strategy.probe() => r,
            };

            match result {
                Ok(()) => {
                    info!(
                        "[PHASE: starting-tiers] [STEP: health] {} healthy (attempts={}, duration_ms={})",
                        service,
                        attempt,
                        started.elapsed().as_millis()
                    );
                    return HealthOutcome::Healthy { attempts: attempt };
                }
                Err(e) => {
                    last_error = format!("{:#}", e);
                    if policy.should_log_progress(attempt) {
                        info!(
                            "[PHASE: starting-tiers] [STEP: health] still waiting for {} (attempt {}/{}, last_error={})",
                            service, attempt, policy.max_attempts, last_error
                        );
                    } else {
                        debug!(
                            "[PHASE: starting-tiers] [STEP: health] {} not ready (attempt {}/{}): {}",
                            service, attempt, policy.max_attempts, last_error
                        );
                    }
                }
            }

            let Some(delay) = delays.next() else {
                break;
            };
            tokio::select! {
                _ = self.cancel.cancelled() => return self.cancelled(service, attempt),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        warn!(
            "[PHASE: starting-tiers] [STEP: health] {} did not become healthy (attempts={}, duration_ms={}, last_error={})",
            service,
            attempt,
            started.elapsed().as_millis(),
            last_error
        );
        HealthOutcome::TimedOut {
            attempts: attempt,
            last_error,
        }
    }

    fn cancelled(&self, service: &str, attempts: u32) -> HealthOutcome {
        warn!(
            "[PHASE: starting-tiers] [STEP: health] wait for {} cancelled (attempts={})",
            service, attempts
        );
        HealthOutcome::Cancelled { attempts }
    }
}
