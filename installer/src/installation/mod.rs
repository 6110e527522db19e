// Collaborators of the installation state machine
//
// The orchestrator owns every decision; the collaborators below only execute. Each one is a
// trait so the state machine can be driven against in-memory fakes, with a thin default
// implementation for the real host:
// - ContainerRuntime  -> docker compose (docker.rs)
// - SecretsEngine     -> Vault-compatible HTTP API (secrets_engine.rs)
// - IdentityProvider  -> Keycloak-compatible admin REST API (identity.rs)
// - ConfigGenerator / CertificateIssuer -> template rendering + openssl (generate.rs)
//
// Also hosts the shared external-command runner (timeouts, retries, masked logging).
//
// IMPORTANT:
// - Never log secrets (passwords, tokens, unseal keys).
// - All I/O should be async.

pub mod docker;
pub mod files;
pub mod generate;
pub mod identity;
pub mod secrets_engine;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::{timeout, Duration};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::config::InstallLayout;
use crate::models::request::CacheLevel;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u128,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

// ============================================================================
// Collaborator interfaces
// ============================================================================

/// Observed state of one service's container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Running,
    /// Running and the container's own healthcheck reports healthy.
    Healthy,
    /// Running but the container's own healthcheck reports unhealthy.
    Unhealthy,
    Starting,
    Exited,
    Missing,
}

impl ServiceState {
    pub fn is_alive(&self) -> bool {
        matches!(self, ServiceState::Running | ServiceState::Healthy)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeardownOptions {
    pub remove_volumes: bool,
    pub cache: CacheLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildOptions {
    pub no_cache: bool,
    pub pull: bool,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Runtime daemon reachable.
    async fn ping(&self) -> Result<()>;
    async fn ensure_network(&self) -> Result<()>;
    async fn build(&self, opts: BuildOptions) -> Result<()>;
    /// Launch one service without waiting for it (detached, no dependency start).
    async fn start_service(&self, service: &str) -> Result<()>;
    /// Start the whole deployment described by the current compose file.
    async fn start_all(&self) -> Result<()>;
    /// Stop and remove services, images (per cache level) and optionally volumes.
    async fn remove_deployment(&self, opts: TeardownOptions) -> Result<()>;
    async fn service_state(&self, service: &str) -> Result<ServiceState>;
    async fn exec(&self, service: &str, args: &[String]) -> Result<CommandOutput>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStatus {
    pub initialized: bool,
    pub sealed: bool,
}

#[derive(Clone, serde::Serialize, serde::Deserialize)]
pub struct EngineInit {
    pub unseal_keys: Vec<String>,
    pub root_token: String,
}

impl std::fmt::Debug for EngineInit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineInit")
            .field("unseal_keys", &format!("<{} redacted>", self.unseal_keys.len()))
            .field("root_token", &"***")
            .finish()
    }
}

#[async_trait]
pub trait SecretsEngine: Send + Sync {
    async fn status(&self) -> Result<EngineStatus>;
    async fn init(&self, shares: u8, threshold: u8) -> Result<EngineInit>;
    /// Submit one unseal key share; returns the sealed flag after submission.
    async fn unseal(&self, key: &str) -> Result<bool>;
    async fn read(&self, token: &str, path: &str, key: &str) -> Result<Option<String>>;
    async fn write(&self, token: &str, path: &str, key: &str, value: &str) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: String,
    pub username: String,
    pub email: Option<String>,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn create_identity(&self, username: &str, email: &str) -> Result<String>;
    async fn list_identities(&self) -> Result<Vec<Identity>>;
    async fn delete_identity(&self, id: &str) -> Result<()>;
}

/// Renders runtime configuration (compose file, env file) into `config/`.
#[async_trait]
pub trait ConfigGenerator: Send + Sync {
    async fn generate(&self, layout: &InstallLayout, vars: &BTreeMap<String, String>)
        -> Result<()>;
}

#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    /// Issue a certificate/key pair into `certs_dir` unless one is already present.
    async fn ensure_certificate(&self, certs_dir: &Path, hostname: &str) -> Result<()>;
}

/// Everything the state machine delegates to.
#[derive(Clone)]
pub struct Collaborators {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub secrets: Arc<dyn SecretsEngine>,
    pub identity: Arc<dyn IdentityProvider>,
    pub generator: Arc<dyn ConfigGenerator>,
    pub certificates: Arc<dyn CertificateIssuer>,
}

// ============================================================================
// External command runner
// ============================================================================

fn mask_arg_for_log(arg: &str) -> String {
    // Heuristic masking: treat anything that looks like a secret as sensitive.
    let lower = arg.to_ascii_lowercase();
    if lower.contains("password")
        || lower.contains("secret")
        || lower.contains("token")
        || lower.contains("unseal")
        || lower.contains("apikey")
        || lower.contains("api_key")
    {
        return "***".to_string();
    }

    if lower.contains("://") && arg.contains('@') {
        return crate::utils::logging::mask_url_credentials(arg);
    }

    // Paths and plain words stay readable; long opaque blobs are partially masked.
    if arg.len() > 48 && !arg.contains('/') && !arg.contains(' ') {
        return crate::utils::logging::mask_sensitive(arg);
    }
    arg.to_string()
}

fn is_transient_exec_error(e: &anyhow::Error) -> bool {
    let msg = e.to_string().to_ascii_lowercase();
    msg.contains("temporarily")
        || msg.contains("temporary")
        || msg.contains("busy")
        || msg.contains("resource")
        || msg.contains("i/o")
        || msg.contains("io error")
}

async fn run_cmd_with_timeout_once(
    program: &str,
    args: &[String],
    timeout_dur: Duration,
    operation: &str,
) -> Result<CommandOutput> {
    let started = Instant::now();

    debug!(
        "[PHASE: runtime] [STEP: cmd] run_cmd_with_timeout_once entered (operation={}, program={}, args=[{}], timeout_ms={})",
        operation,
        program,
        args.iter().map(|a| mask_arg_for_log(a)).collect::<Vec<_>>().join(", "),
        timeout_dur.as_millis()
    );

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().with_context(|| {
        format!(
            "Failed to spawn command '{}' (operation={})",
            program, operation
        )
    })?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow::anyhow!("Failed to capture stdout (operation={})", operation))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow::anyhow!("Failed to capture stderr (operation={})", operation))?;

    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stdout.read_to_end(&mut buf).await?;
        Ok::<String, std::io::Error>(String::from_utf8_lossy(&buf).to_string())
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stderr.read_to_end(&mut buf).await?;
        Ok::<String, std::io::Error>(String::from_utf8_lossy(&buf).to_string())
    });

    let status = match timeout(timeout_dur, child.wait()).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            return Err(anyhow::Error::new(e)).with_context(|| {
                format!(
                    "Command wait failed (operation={}, program={})",
                    operation, program
                )
            });
        }
        Err(_) => {
            warn!(
                "[PHASE: runtime] [STEP: cmd] Timeout reached (operation={}, program={}, timeout_ms={}); attempting to kill process",
                operation,
                program,
                timeout_dur.as_millis()
            );

            if let Err(e) = child.kill().await {
                warn!(
                    "[PHASE: runtime] [STEP: cmd] Failed to kill timed-out process (operation={}, program={}): {}",
                    operation, program, e
                );
            }

            // Best-effort reap (avoid zombies)
            let _ = timeout(Duration::from_secs(5), child.wait()).await;

            return Err(anyhow::anyhow!(
                "Command timed out after {}ms (operation={}, program={})",
                timeout_dur.as_millis(),
                operation,
                program
            ));
        }
    };

    let stdout_str = stdout_task
        .await
        .context("stdout join failed")?
        .context("stdout read failed")?;
    let stderr_str = stderr_task
        .await
        .context("stderr join failed")?
        .context("stderr read failed")?;

    let out = CommandOutput {
        exit_code: status.code(),
        stdout: stdout_str,
        stderr: stderr_str,
        duration_ms: started.elapsed().as_millis(),
    };

    debug!(
        "[PHASE: runtime] [STEP: cmd] run_cmd_with_timeout_once exit (operation={}, program={}, exit_code={:?}, duration_ms={}, stdout_len={}, stderr_len={})",
        operation,
        program,
        out.exit_code,
        out.duration_ms,
        out.stdout.len(),
        out.stderr.len()
    );

    Ok(out)
}

/// Run an external command with a timeout and up to 3 retries for transient spawn/I-O failures.
///
/// Timeouts are NOT retried: the commands we run (compose down, image removal) are not safe to
/// repeat blindly. Returns captured stdout/stderr even when exit code is non-zero (caller
/// decides success).
pub async fn run_cmd_with_timeout(
    program: &str,
    args: &[String],
    timeout_dur: Duration,
    operation: &str,
) -> Result<CommandOutput> {
    let started = Instant::now();
    info!(
        "[PHASE: runtime] [STEP: cmd] run_cmd_with_timeout entered (operation={}, program={}, args_count={}, timeout_ms={})",
        operation,
        program,
        args.len(),
        timeout_dur.as_millis()
    );

    let program_owned = program.to_string();
    let args_owned = args.to_vec();
    let operation_owned = operation.to_string();

    let attempt = move || {
        let program = program_owned.clone();
        let args = args_owned.clone();
        let op = operation_owned.clone();
        async move { run_cmd_with_timeout_once(&program, &args, timeout_dur, &op).await }
    };

    let retry_strategy = ExponentialBackoff::from_millis(200)
        .factor(2)
        .max_delay(Duration::from_secs(2))
        .take(3)
        .map(jitter);

    let result = RetryIf::spawn(retry_strategy, attempt, |e: &anyhow::Error| {
        let transient = is_transient_exec_error(e);
        if transient {
            warn!(
                "[PHASE: runtime] [STEP: cmd] Transient command failure detected; will retry (operation={}, program={}, err={})",
                operation,
                program,
                e
            );
        }
        transient
    })
    .await;

    match &result {
        Ok(out) => {
            info!(
                "[PHASE: runtime] [STEP: cmd] run_cmd_with_timeout exit (operation={}, program={}, exit_code={:?}, duration_ms={})",
                operation,
                program,
                out.exit_code,
                started.elapsed().as_millis()
            );
        }
        Err(e) => {
            error!(
                "[PHASE: runtime] [STEP: cmd] run_cmd_with_timeout error (operation={}, program={}, duration_ms={}, err={:?})",
                operation,
                program,
                started.elapsed().as_millis(),
                e
            );
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_arg_for_log_redacts_secretish_values() {
        assert_eq!(mask_arg_for_log("VAULT_TOKEN=s.abcdef"), "***");
        assert_eq!(mask_arg_for_log("--password=hunter2"), "***");
        assert_eq!(mask_arg_for_log("unseal"), "***");
    }

    #[test]
    fn mask_arg_for_log_keeps_paths_readable() {
        assert_eq!(
            mask_arg_for_log("/opt/stack/config/docker-compose.yml"),
            "/opt/stack/config/docker-compose.yml"
        );
        assert_eq!(mask_arg_for_log("up"), "up");
    }

    #[test]
    fn mask_arg_for_log_masks_url_credentials() {
        let masked = mask_arg_for_log("postgres://app:pw123456@db:5432/app");
        assert!(!masked.contains("pw123456"), "{}", masked);
    }

    #[test]
    fn engine_init_debug_is_redacted() {
        let init = EngineInit {
            unseal_keys: vec!["k1".into(), "k2".into()],
            root_token: "root-token-value".into(),
        };
        let dbg = format!("{:?}", init);
        assert!(!dbg.contains("root-token-value"));
        assert!(!dbg.contains("k1"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_cmd_with_timeout_basic_smoke() {
        let out = run_cmd_with_timeout(
            "sh",
            &["-c".to_string(), "echo hello".to_string()],
            Duration::from_secs(5),
            "test_echo",
        )
        .await
        .expect("command should run");
        assert!(out.success());
        assert!(out.stdout.contains("hello"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_cmd_with_timeout_reports_timeout() {
        let err = run_cmd_with_timeout(
            "sh",
            &["-c".to_string(), "sleep 5".to_string()],
            Duration::from_millis(100),
            "test_sleep",
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("timed out"), "{}", err);
    }
}
