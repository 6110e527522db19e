// Docker Compose container runtime.
//
// Wraps `docker compose` (V2 plugin) or `docker-compose` (V1 binary) behind `ContainerRuntime`.
// Every invocation pins the project name so teardown finds the deployment even when the compose
// file has already been regenerated.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::OnceCell;

use crate::installation::{
    run_cmd_with_timeout, BuildOptions, CommandOutput, ContainerRuntime, ServiceState,
    TeardownOptions,
};
use crate::models::request::CacheLevel;
use crate::utils::validation::validate_service_id;

const DOCKER_CMD_TIMEOUT: Duration = Duration::from_secs(120);
const BUILD_TIMEOUT: Duration = Duration::from_secs(3600);
const EXEC_TIMEOUT: Duration = Duration::from_secs(30);

/// Docker version information.
#[derive(Debug, Clone, Default)]
pub struct DockerVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub raw: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComposeInvocation {
    DockerComposeBinary,
    DockerSubcommand,
}

/// Parse docker version output, e.g. "Docker version 24.0.5, build abcdef".
pub fn parse_docker_version(output: &str) -> Option<DockerVersion> {
    let output = output.trim();
    let version_str = match output.to_lowercase().find("docker version ") {
        Some(pos) => &output[pos + "docker version ".len()..],
        None => output,
    };

    let version_part = version_str
        .split(|c: char| c == ',' || c == ' ' || c == '-')
        .next()?;
    let parts: Vec<&str> = version_part.split('.').collect();

    let major: u32 = parts.first().and_then(|s| s.parse().ok()).unwrap_or(0);
    let minor: u32 = parts.get(1).and_then(|s| s.parse().ok()).unwrap_or(0);
    let patch: u32 = parts.get(2).and_then(|s| s.parse().ok()).unwrap_or(0);

    if major == 0 && minor == 0 && patch == 0 && !version_part.starts_with('0') {
        return None;
    }

    Some(DockerVersion {
        major,
        minor,
        patch,
        raw: output.to_string(),
    })
}

/// Detect which compose invocation method is available (V2 preferred).
pub async fn detect_compose_invocation() -> Result<ComposeInvocation> {
    debug!("[PHASE: validating] [STEP: docker] detect_compose_invocation: checking V2 (docker compose)");

    let out = run_cmd_with_timeout(
        "docker",
        &["compose".to_string(), "version".to_string()],
        Duration::from_secs(10),
        "docker_compose_subcommand_version",
    )
    .await;
    if out.as_ref().ok().and_then(|o| o.exit_code) == Some(0) {
        debug!("[PHASE: validating] [STEP: docker] detect_compose_invocation: using docker compose (V2)");
        return Ok(ComposeInvocation::DockerSubcommand);
    }

    let out = run_cmd_with_timeout(
        "docker-compose",
        &["--version".to_string()],
        Duration::from_secs(10),
        "docker_compose_version",
    )
    .await;
    if out.as_ref().ok().and_then(|o| o.exit_code) == Some(0) {
        debug!("[PHASE: validating] [STEP: docker] detect_compose_invocation: using docker-compose (V1)");
        return Ok(ComposeInvocation::DockerComposeBinary);
    }

    anyhow::bail!("Neither 'docker compose' (V2) nor 'docker-compose' (V1) is available. Please install Docker Compose.");
}

/// Build the program + argv for one compose call.
///
/// `compose_file` is optional: V2 can address a project by name alone (used by teardown once the
/// generated file is gone).
pub fn compose_command(
    inv: ComposeInvocation,
    project: &str,
    compose_file: Option<&Path>,
    subcommand: &str,
    extra_args: &[String],
) -> Result<(&'static str, Vec<String>)> {
    let mut args = Vec::new();
    let program = match inv {
        ComposeInvocation::DockerComposeBinary => "docker-compose",
        ComposeInvocation::DockerSubcommand => {
            args.push("compose".to_string());
            "docker"
        }
    };
    args.push("-p".to_string());
    args.push(project.to_string());
    if let Some(file) = compose_file {
        let f = file
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("Invalid compose file path: {:?}", file))?;
        args.push("-f".to_string());
        args.push(f.to_string());
    }
    args.push(subcommand.to_string());
    args.extend(extra_args.iter().cloned());
    Ok((program, args))
}

/// Arguments for `compose down` given the teardown options.
pub fn down_args(opts: TeardownOptions) -> Vec<String> {
    let mut args = vec!["--remove-orphans".to_string()];
    if opts.remove_volumes {
        args.push("--volumes".to_string());
    }
    match opts.cache {
        CacheLevel::Minimal => {
            args.push("--rmi".to_string());
            args.push("all".to_string());
        }
        CacheLevel::Moderate => {
            args.push("--rmi".to_string());
            args.push("local".to_string());
        }
        CacheLevel::Full => {}
    }
    args
}

pub fn build_args(opts: BuildOptions) -> Vec<String> {
    let mut args = Vec::new();
    if opts.no_cache {
        args.push("--no-cache".to_string());
    }
    if opts.pull {
        args.push("--pull".to_string());
    }
    args
}

/// One row of `docker compose ps --format json`.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PsRow {
    #[serde(default)]
    service: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    health: String,
}

/// Parse `docker compose ps --format json` output for one service.
///
/// Compose emits either a JSON array (older V2) or one object per line (newer V2).
pub fn parse_compose_ps_json(stdout: &str, service: &str) -> Result<ServiceState> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(ServiceState::Missing);
    }

    let rows: Vec<PsRow> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed).context("Failed to parse compose ps JSON array")?
    } else {
        trimmed
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str::<PsRow>(l.trim()))
            .collect::<std::result::Result<_, _>>()
            .context("Failed to parse compose ps JSON lines")?
    };

    let row = rows
        .iter()
        .find(|r| r.service == service)
        .or_else(|| if rows.len() == 1 { rows.first() } else { None });

    Ok(match row {
        Some(r) => classify_state(&r.state, &r.health),
        None => ServiceState::Missing,
    })
}

fn classify_state(state: &str, health: &str) -> ServiceState {
    let state = state.to_ascii_lowercase();
    let health = health.to_ascii_lowercase();
    if state.contains("running") || state.starts_with("up") {
        match health.as_str() {
            "healthy" => ServiceState::Healthy,
            "unhealthy" => ServiceState::Unhealthy,
            "starting" => ServiceState::Starting,
            _ => ServiceState::Running,
        }
    } else if state.contains("restarting") || state.contains("created") {
        ServiceState::Starting
    } else if state.contains("exited") || state.contains("dead") {
        ServiceState::Exited
    } else {
        ServiceState::Missing
    }
}

/// Parse table-format `docker-compose ps` output (V1 has no JSON format).
pub fn parse_compose_ps_table(stdout: &str) -> ServiceState {
    let mut in_body = false;
    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("---") {
            continue;
        }
        let upper = line.to_uppercase();
        if upper.contains("NAME") && (upper.contains("STATUS") || upper.contains("STATE")) {
            in_body = true;
            continue;
        }
        if !in_body {
            continue;
        }
        let lower = line.to_lowercase();
        if lower.contains("(unhealthy)") {
            return ServiceState::Unhealthy;
        }
        if lower.contains("(healthy)") {
            return ServiceState::Healthy;
        }
        if lower.contains("starting") || lower.contains("restarting") {
            return ServiceState::Starting;
        }
        if lower.contains("running") || lower.contains(" up") {
            return ServiceState::Running;
        }
        if lower.contains("exit") {
            return ServiceState::Exited;
        }
    }
    ServiceState::Missing
}

/// External network shared by every service of the stack.
pub fn network_name(project: &str) -> String {
    format!("{}-net", project)
}

pub struct DockerRuntime {
    project: String,
    compose_file: PathBuf,
    network: String,
    invocation: OnceCell<ComposeInvocation>,
}

impl DockerRuntime {
    pub fn new(project: &str, compose_file: &Path) -> Self {
        Self {
            project: project.to_string(),
            compose_file: compose_file.to_path_buf(),
            network: network_name(project),
            invocation: OnceCell::new(),
        }
    }

    pub fn network_name(&self) -> &str {
        &self.network
    }

    async fn invocation(&self) -> Result<ComposeInvocation> {
        self.invocation
            .get_or_try_init(detect_compose_invocation)
            .await
            .copied()
    }

    async fn compose(
        &self,
        subcommand: &str,
        extra_args: &[String],
        timeout: Duration,
        label: &str,
    ) -> Result<CommandOutput> {
        let inv = self.invocation().await?;
        let (program, args) = compose_command(
            inv,
            &self.project,
            Some(&self.compose_file),
            subcommand,
            extra_args,
        )?;
        run_cmd_with_timeout(program, &args, timeout, label).await
    }

    async fn compose_checked(
        &self,
        subcommand: &str,
        extra_args: &[String],
        timeout: Duration,
        label: &str,
    ) -> Result<()> {
        let out = self.compose(subcommand, extra_args, timeout, label).await?;
        if out.success() {
            return Ok(());
        }
        warn!(
            "[PHASE: runtime] [STEP: docker] compose {} failed (exit_code={:?}): {}",
            subcommand,
            out.exit_code,
            out.stderr.trim()
        );
        anyhow::bail!("compose {} failed: {}", subcommand, out.stderr.trim());
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<()> {
        let out = run_cmd_with_timeout(
            "docker",
            &["version".to_string(), "--format".to_string(), "{{.Server.Version}}".to_string()],
            Duration::from_secs(15),
            "docker_version",
        )
        .await
        .context("Docker CLI is not available")?;

        if !out.success() {
            if out.stderr.to_lowercase().contains("permission denied") {
                anyhow::bail!(
                    "Docker daemon is not accessible (permission denied). Run as root or add the user to the docker group."
                );
            }
            anyhow::bail!("Docker daemon is not running: {}", out.stderr.trim());
        }
        match parse_docker_version(&out.stdout) {
            Some(v) if v.major < 20 => warn!(
                "[PHASE: validating] [STEP: docker] Docker server {} is older than 20.10; compose V2 may be unavailable",
                v.raw
            ),
            Some(v) => debug!(
                "[PHASE: validating] [STEP: docker] Docker server version {}.{}.{}",
                v.major, v.minor, v.patch
            ),
            None => warn!(
                "[PHASE: validating] [STEP: docker] Could not parse Docker server version from {:?}",
                out.stdout.trim()
            ),
        }
        self.invocation().await?;
        Ok(())
    }

    async fn ensure_network(&self) -> Result<()> {
        let inspect = run_cmd_with_timeout(
            "docker",
            &["network".to_string(), "inspect".to_string(), self.network.clone()],
            Duration::from_secs(15),
            "docker_network_inspect",
        )
        .await?;
        if inspect.success() {
            debug!(
                "[PHASE: provisioning] [STEP: network] Network {} already exists",
                self.network
            );
            return Ok(());
        }

        info!(
            "[PHASE: provisioning] [STEP: network] Creating network {}",
            self.network
        );
        let out = run_cmd_with_timeout(
            "docker",
            &["network".to_string(), "create".to_string(), self.network.clone()],
            Duration::from_secs(30),
            "docker_network_create",
        )
        .await?;
        if !out.success() {
            anyhow::bail!(
                "Failed to create network {}: {}",
                self.network,
                out.stderr.trim()
            );
        }
        Ok(())
    }

    async fn build(&self, opts: BuildOptions) -> Result<()> {
        info!(
            "[PHASE: provisioning] [STEP: build] Building images (no_cache={}, pull={})",
            opts.no_cache, opts.pull
        );
        self.compose_checked("build", &build_args(opts), BUILD_TIMEOUT, "compose_build")
            .await
    }

    async fn start_service(&self, service: &str) -> Result<()> {
        validate_service_id(service)?;
        self.compose_checked(
            "up",
            &["-d".to_string(), "--no-deps".to_string(), service.to_string()],
            DOCKER_CMD_TIMEOUT,
            "compose_up_service",
        )
        .await
        .with_context(|| format!("Failed to start service '{}'", service))
    }

    async fn start_all(&self) -> Result<()> {
        self.compose_checked("up", &["-d".to_string()], DOCKER_CMD_TIMEOUT, "compose_up")
            .await
    }

    async fn remove_deployment(&self, opts: TeardownOptions) -> Result<()> {
        let inv = self.invocation().await?;
        let file = if self.compose_file.exists() {
            Some(self.compose_file.as_path())
        } else {
            None
        };

        if file.is_none() && inv == ComposeInvocation::DockerComposeBinary {
            warn!(
                "[PHASE: tearing-down] [STEP: docker] No compose file at {:?}; docker-compose V1 cannot address the project by name, skipping",
                self.compose_file
            );
            return Ok(());
        }

        info!(
            "[PHASE: tearing-down] [STEP: docker] Removing deployment (project={}, volumes={}, cache={:?})",
            self.project, opts.remove_volumes, opts.cache
        );
        let (program, args) = compose_command(inv, &self.project, file, "down", &down_args(opts))?;
        let out = run_cmd_with_timeout(program, &args, DOCKER_CMD_TIMEOUT, "compose_down").await?;
        if !out.success() {
            anyhow::bail!("compose down failed: {}", out.stderr.trim());
        }
        Ok(())
    }

    async fn service_state(&self, service: &str) -> Result<ServiceState> {
        validate_service_id(service)?;
        match self.invocation().await? {
            ComposeInvocation::DockerSubcommand => {
                let out = self
                    .compose(
                        "ps",
                        &[
                            "--all".to_string(),
                            "--format".to_string(),
                            "json".to_string(),
                            service.to_string(),
                        ],
                        EXEC_TIMEOUT,
                        "compose_ps",
                    )
                    .await?;
                if !out.success() {
                    anyhow::bail!("compose ps failed: {}", out.stderr.trim());
                }
                parse_compose_ps_json(&out.stdout, service)
            }
            ComposeInvocation::DockerComposeBinary => {
                let out = self
                    .compose("ps", &[service.to_string()], EXEC_TIMEOUT, "compose_ps")
                    .await?;
                if !out.success() {
                    anyhow::bail!("compose ps failed: {}", out.stderr.trim());
                }
                Ok(parse_compose_ps_table(&out.stdout))
            }
        }
    }

    async fn exec(&self, service: &str, args: &[String]) -> Result<CommandOutput> {
        validate_service_id(service)?;
        let mut full = vec!["-T".to_string(), service.to_string()];
        full.extend(args.iter().cloned());
        self.compose("exec", &full, EXEC_TIMEOUT, "compose_exec").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_docker_version_standard_format() {
        let v = parse_docker_version("Docker version 24.0.5, build ced0996").unwrap();
        assert_eq!((v.major, v.minor, v.patch), (24, 0, 5));
    }

    #[test]
    fn parse_docker_version_bare_server_version() {
        let v = parse_docker_version("26.1.4\n").unwrap();
        assert_eq!((v.major, v.minor, v.patch), (26, 1, 4));
    }

    #[test]
    fn parse_docker_version_invalid_returns_none() {
        assert!(parse_docker_version("not a docker version").is_none());
        assert!(parse_docker_version("").is_none());
    }

    #[test]
    fn compose_command_v2_pins_project_and_file() {
        let (program, args) = compose_command(
            ComposeInvocation::DockerSubcommand,
            "stack",
            Some(Path::new("/opt/stack/config/docker-compose.yml")),
            "up",
            &["-d".to_string()],
        )
        .unwrap();
        assert_eq!(program, "docker");
        assert_eq!(
            args,
            vec![
                "compose",
                "-p",
                "stack",
                "-f",
                "/opt/stack/config/docker-compose.yml",
                "up",
                "-d"
            ]
        );
    }

    #[test]
    fn compose_command_v1_without_file() {
        let (program, args) = compose_command(
            ComposeInvocation::DockerComposeBinary,
            "stack",
            None,
            "down",
            &[],
        )
        .unwrap();
        assert_eq!(program, "docker-compose");
        assert_eq!(args, vec!["-p", "stack", "down"]);
    }

    #[test]
    fn down_args_follow_cache_level_and_volumes() {
        let minimal = down_args(TeardownOptions {
            remove_volumes: true,
            cache: CacheLevel::Minimal,
        });
        assert!(minimal.contains(&"--volumes".to_string()));
        assert!(minimal.windows(2).any(|w| w == ["--rmi", "all"]));

        let full = down_args(TeardownOptions {
            remove_volumes: false,
            cache: CacheLevel::Full,
        });
        assert_eq!(full, vec!["--remove-orphans"]);
    }

    #[test]
    fn build_args_flags() {
        assert!(build_args(BuildOptions { no_cache: false, pull: false }).is_empty());
        assert_eq!(
            build_args(BuildOptions { no_cache: true, pull: true }),
            vec!["--no-cache", "--pull"]
        );
    }

    #[test]
    fn parse_ps_json_lines() {
        let out = r#"{"Service":"postgres","State":"running","Health":"healthy"}
{"Service":"redis","State":"running","Health":""}"#;
        assert_eq!(parse_compose_ps_json(out, "postgres").unwrap(), ServiceState::Healthy);
        assert_eq!(parse_compose_ps_json(out, "redis").unwrap(), ServiceState::Running);
        assert_eq!(parse_compose_ps_json(out, "vault").unwrap(), ServiceState::Missing);
    }

    #[test]
    fn parse_ps_json_array() {
        let out = r#"[{"Service":"api","State":"exited","Health":""}]"#;
        assert_eq!(parse_compose_ps_json(out, "api").unwrap(), ServiceState::Exited);
    }

    #[test]
    fn parse_ps_json_empty_is_missing() {
        assert_eq!(parse_compose_ps_json("  \n", "api").unwrap(), ServiceState::Missing);
    }

    #[test]
    fn parse_ps_table_v1() {
        let out = "      Name                    Command               State    Ports\n\
                   ---------------------------------------------------------------\n\
                   stack_api_1   uvicorn main:app   Up (healthy)   8000/tcp\n";
        assert_eq!(parse_compose_ps_table(out), ServiceState::Healthy);

        let exited = "Name   Command   State   Ports\n----\nstack_worker_1   run   Exit 1\n";
        assert_eq!(parse_compose_ps_table(exited), ServiceState::Exited);
        assert_eq!(parse_compose_ps_table(""), ServiceState::Missing);
    }
}
