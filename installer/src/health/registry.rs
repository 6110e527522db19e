//! Service id -> (strategy, retry policy) lookup table.
//!
//! Built once at startup from a built-in table plus `[health.<service>]` config overrides.
//! Stateful services get budgets in the minutes; stateless ones give up much sooner.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use crate::health::strategies::{HttpProbe, ProcessProbe, RuntimeStatusProbe};
use crate::health::HealthStrategy;
use crate::installation::ContainerRuntime;
use crate::models::tier::ServiceTier;
use crate::utils::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    Http,
    RuntimeStatus,
    Process,
}

/// Declarative health check for one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSpec {
    pub strategy: StrategyKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    pub max_attempts: u32,
    /// Milliseconds between attempts.
    #[serde(with = "crate::utils::retry::duration_millis")]
    pub interval: Duration,
}

impl HealthSpec {
    pub fn http(url: &str, max_attempts: u32, interval_secs: u64) -> Self {
        Self {
            strategy: StrategyKind::Http,
            url: Some(url.to_string()),
            command: Vec::new(),
            max_attempts,
            interval: Duration::from_secs(interval_secs),
        }
    }

    pub fn runtime_status(command: &[&str], max_attempts: u32, interval_secs: u64) -> Self {
        Self {
            strategy: StrategyKind::RuntimeStatus,
            url: None,
            command: command.iter().map(|s| s.to_string()).collect(),
            max_attempts,
            interval: Duration::from_secs(interval_secs),
        }
    }

    pub fn process(max_attempts: u32, interval_secs: u64) -> Self {
        Self {
            strategy: StrategyKind::Process,
            url: None,
            command: Vec::new(),
            max_attempts,
            interval: Duration::from_secs(interval_secs),
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, self.interval)
    }
}

/// Built-in checks for the default stack.
pub fn builtin_spec(service: &str) -> Option<HealthSpec> {
    let spec = match service {
        "postgres" => HealthSpec::runtime_status(&["pg_isready", "-U", "postgres"], 60, 3),
        "redis" => HealthSpec::runtime_status(&["redis-cli", "ping"], 20, 1),
        "vault" => HealthSpec::http(
            "http://127.0.0.1:8200/v1/sys/health?sealedcode=200&uninitcode=200",
            60,
            2,
        ),
        "keycloak" => HealthSpec::http("http://127.0.0.1:8080/realms/master", 90, 2),
        "rabbitmq" => HealthSpec::runtime_status(&["rabbitmq-diagnostics", "-q", "ping"], 40, 3),
        "api" => HealthSpec::http("http://127.0.0.1:8000/health", 30, 2),
        "frontend" => HealthSpec::http("http://127.0.0.1:3000/", 20, 2),
        "worker" => HealthSpec::process(10, 1),
        "ollama" => HealthSpec::http("http://127.0.0.1:11434/api/tags", 30, 2),
        "ai-gateway" => HealthSpec::http("http://127.0.0.1:8100/health", 20, 2),
        "prometheus" => HealthSpec::http("http://127.0.0.1:9090/-/ready", 20, 2),
        "loki" => HealthSpec::http("http://127.0.0.1:3100/ready", 30, 2),
        "grafana" => HealthSpec::http("http://127.0.0.1:3001/api/health", 20, 2),
        _ => return None,
    };
    Some(spec)
}

/// Fallback for services the built-in table does not know: container must be running.
pub fn default_spec() -> HealthSpec {
    HealthSpec::process(5, 1)
}

#[derive(Clone)]
pub struct HealthCheck {
    pub strategy: Arc<dyn HealthStrategy>,
    pub policy: RetryPolicy,
}

#[derive(Clone, Default)]
pub struct HealthRegistry {
    checks: HashMap<String, HealthCheck>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One check per service named in `tiers`: config override, else built-in, else process.
    pub fn from_config(
        tiers: &[ServiceTier],
        overrides: &BTreeMap<String, HealthSpec>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Result<Self> {
        let mut registry = Self::new();
        for service in tiers.iter().flat_map(|t| t.services.iter()) {
            let spec = overrides
                .get(service)
                .cloned()
                .or_else(|| builtin_spec(service))
                .unwrap_or_else(default_spec);
            let strategy = build_strategy(service, &spec, runtime.clone())
                .with_context(|| format!("Invalid health check for service '{}'", service))?;
            registry.register(service, strategy, spec.policy());
        }
        Ok(registry)
    }

    pub fn register(&mut self, service: &str, strategy: Arc<dyn HealthStrategy>, policy: RetryPolicy) {
        self.checks
            .insert(service.to_string(), HealthCheck { strategy, policy });
    }

    pub fn lookup(&self, service: &str) -> Option<&HealthCheck> {
        self.checks.get(service)
    }

    pub fn len(&self) -> usize {
        self.checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }
}

pub fn build_strategy(
    service: &str,
    spec: &HealthSpec,
    runtime: Arc<dyn ContainerRuntime>,
) -> Result<Arc<dyn HealthStrategy>> {
    Ok(match spec.strategy {
        StrategyKind::Http => {
            let url = spec
                .url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("http strategy requires 'url'"))?;
            Arc::new(HttpProbe::new(url)?)
        }
        StrategyKind::RuntimeStatus => {
            if spec.command.is_empty() {
                anyhow::bail!("runtime-status strategy requires 'command'");
            }
            Arc::new(RuntimeStatusProbe::new(runtime, service, spec.command.clone()))
        }
        StrategyKind::Process => Arc::new(ProcessProbe::new(runtime, service)),
    })
}
