// Health strategies: HTTP readiness, in-container status command, container liveness.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::health::HealthStrategy;
use crate::installation::{ContainerRuntime, ServiceState};

/// Ready when `GET url` answers 2xx or 3xx (redirects are not followed).
pub struct HttpProbe {
    url: String,
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(url: &str) -> Result<Self> {
        url::Url::parse(url).with_context(|| format!("Invalid health URL '{}'", url))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("Failed to build health probe HTTP client")?;
        Ok(Self {
            url: url.to_string(),
            client,
        })
    }
}

pub fn is_ready_status(status: reqwest::StatusCode) -> bool {
    status.is_success() || status.is_redirection()
}

#[async_trait]
impl HealthStrategy for HttpProbe {
    fn describe(&self) -> String {
        format!("http GET {}", crate::utils::logging::mask_url_credentials(&self.url))
    }

    async fn probe(&self) -> Result<()> {
        let resp = self
            .client
            .get(&self.url)
            .send()
            .await
            .with_context(|| format!("GET {} failed", self.url))?;
        let status = resp.status();
        if is_ready_status(status) {
            Ok(())
        } else {
            anyhow::bail!("GET {} returned HTTP {}", self.url, status)
        }
    }
}

/// Ready when `command` exits 0 inside the service's container (e.g. `pg_isready`).
pub struct RuntimeStatusProbe {
    runtime: Arc<dyn ContainerRuntime>,
    service: String,
    command: Vec<String>,
}

impl RuntimeStatusProbe {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, service: &str, command: Vec<String>) -> Self {
        Self {
            runtime,
            service: service.to_string(),
            command,
        }
    }
}

#[async_trait]
impl HealthStrategy for RuntimeStatusProbe {
    fn describe(&self) -> String {
        format!("exec {} `{}`", self.service, self.command.join(" "))
    }

    async fn probe(&self) -> Result<()> {
        let out = self.runtime.exec(&self.service, &self.command).await?;
        if out.success() {
            return Ok(());
        }
        let detail = if out.stderr.trim().is_empty() {
            out.stdout.trim().to_string()
        } else {
            out.stderr.trim().to_string()
        };
        anyhow::bail!(
            "`{}` exited with {:?}: {}",
            self.command.join(" "),
            out.exit_code,
            detail
        )
    }
}

/// Ready when the container is running (and not reported unhealthy by its own healthcheck).
pub struct ProcessProbe {
    runtime: Arc<dyn ContainerRuntime>,
    service: String,
}

impl ProcessProbe {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, service: &str) -> Self {
        Self {
            runtime,
            service: service.to_string(),
        }
    }
}

#[async_trait]
impl HealthStrategy for ProcessProbe {
    fn describe(&self) -> String {
        format!("process {}", self.service)
    }

    async fn probe(&self) -> Result<()> {
        match self.runtime.service_state(&self.service).await? {
            s if s.is_alive() => Ok(()),
            ServiceState::Unhealthy => anyhow::bail!("{} reports unhealthy", self.service),
            other => anyhow::bail!("{} is {:?}", self.service, other),
        }
    }
}
