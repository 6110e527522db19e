//! Installation state machine.
//!
//! `validating -> backing-up -> tearing-down -> provisioning -> starting-tiers -> verifying ->
//! {committing | rolling-back}`. Everything before `tearing-down` is read-only apart from the
//! snapshot itself, so failures and cancels there abort and drop the snapshot. Any failure (or
//! operator cancel) once teardown has begun rolls back from the snapshot, or ends
//! `unrecoverable` when there is nothing to restore. When the failed run had already removed
//! data volumes, rollback also brings the secrets engine back in line with the restored files.

pub mod lock;
pub mod uninstall;

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backup::{BackupController, SnapshotHandle};
use crate::config::{InstallLayout, InstallerConfig};
use crate::credentials::{
    read_engine_init, unseal_with, write_engine_init, CredentialManager, CredentialSet,
};
use crate::error::InstallError;
use crate::health::registry::HealthRegistry;
use crate::health::strategies::HttpProbe;
use crate::health::{HealthOutcome, HealthStrategy, HealthVerifier};
use crate::installation::docker::network_name;
use crate::installation::files::{
    ensure_dir_with_retries, remove_path, set_mode, write_file_with_retries,
};
use crate::installation::generate::{ensure_secret_files, CERT_FILE, KEY_FILE};
use crate::installation::{BuildOptions, Collaborators, EngineInit, TeardownOptions};
use crate::models::outcome::{InstallationOutcome, Phase};
use crate::models::progress::{ProgressEmitter, ProgressPayload};
use crate::models::request::{CacheLevel, InstallationRequest, Scenario};
use crate::models::tier::TierHook;
use crate::scheduler::TierScheduler;
use crate::security::secret_protector::{default_key_path, SecretProtector};
use crate::utils::retry::RetryPolicy;

use self::lock::InstallLock;

/// End-to-end check run after every tier is up.
#[derive(Clone)]
pub struct SmokeCheck {
    pub name: String,
    pub strategy: Arc<dyn HealthStrategy>,
    pub policy: RetryPolicy,
}

/// Written to `config/install-state.toml` on success.
#[derive(Debug, Serialize)]
struct InstallState {
    scenario: String,
    completed_at: String,
    installer_version: String,
    correlation_id: String,
    project: String,
    backup_mode: String,
    cache: String,
    degraded_tiers: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retained_snapshot: Option<String>,
}

/// Contents of the admin marker file.
#[derive(Debug, Serialize)]
struct AdminMarker<'a> {
    identity_id: String,
    email: &'a str,
    created_at: String,
}

struct RunState {
    started: Instant,
    snapshot: Option<SnapshotHandle>,
    captured: Option<CredentialSet>,
    /// Unseal material the engine was prepared with during this run.
    engine_init: Option<EngineInit>,
    degraded: Vec<String>,
    /// Set right before teardown; until then nothing outside `backups/` has changed.
    mutated: bool,
    volumes_removed: bool,
}

pub struct Installer {
    config: InstallerConfig,
    layout: InstallLayout,
    collab: Collaborators,
    registry: Arc<HealthRegistry>,
    smoke: Vec<SmokeCheck>,
    backups: BackupController,
    credentials: CredentialManager,
    cancel: CancellationToken,
    emit: ProgressEmitter,
    correlation_id: String,
}

impl Installer {
    pub fn new(
        config: InstallerConfig,
        collab: Collaborators,
        cancel: CancellationToken,
        emit: ProgressEmitter,
    ) -> Result<Self> {
        let layout = config.layout();
        let registry =
            HealthRegistry::from_config(&config.tiers, &config.health, collab.runtime.clone())?;
        let smoke = config
            .smoke_endpoints
            .iter()
            .map(|ep| {
                let probe = HttpProbe::new(&ep.url)
                    .with_context(|| format!("Invalid smoke endpoint '{}'", ep.name))?;
                Ok(SmokeCheck {
                    name: ep.name.clone(),
                    strategy: Arc::new(probe),
                    policy: config.smoke_policy.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let credentials = CredentialManager::new(
            layout.clone(),
            collab.secrets.clone(),
            config.secrets_engine.preserved.clone(),
            SecretProtector::new(default_key_path(&layout.backups_dir)),
        );

        Ok(Self {
            backups: BackupController::new(layout.clone()),
            registry: Arc::new(registry),
            correlation_id: uuid::Uuid::new_v4().to_string(),
            config,
            layout,
            collab,
            smoke,
            credentials,
            cancel,
            emit,
        })
    }

    pub fn with_registry(mut self, registry: HealthRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn with_smoke_checks(mut self, checks: Vec<SmokeCheck>) -> Self {
        self.smoke = checks;
        self
    }

    pub fn layout(&self) -> &InstallLayout {
        &self.layout
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub async fn run(&self, req: &InstallationRequest) -> InstallationOutcome {
        let mut state = RunState {
            started: Instant::now(),
            snapshot: None,
            captured: None,
            engine_init: None,
            degraded: Vec::new(),
            mutated: false,
            volumes_removed: false,
        };
        info!(
            "[PHASE: validating] [STEP: start] Installer run {} (scenario={}, root={:?}, backup={}, cache={})",
            self.correlation_id,
            req.scenario,
            self.layout.root,
            if req.skip_backup { "none" } else { req.backup_mode.as_str() },
            req.cache.as_str()
        );
        self.progress(&state, Phase::Validating, "start", "info", 1, "Starting installer run...");

        let _lock = match InstallLock::acquire(&self.layout.lock_file) {
            Ok(lock) => lock,
            Err(e) => return self.abort(&state, Phase::Validating, e),
        };

        if let Err(e) = self.validate(req).await {
            return self.abort(&state, Phase::Validating, e);
        }
        if let Err(e) = self.check_cancel(Phase::Validating) {
            return self.abort(&state, Phase::Validating, e);
        }

        if let Err(e) = self.back_up(req, &mut state).await {
            return self.abort(&state, Phase::BackingUp, e);
        }
        if let Err(e) = self.check_cancel(Phase::BackingUp) {
            self.discard_snapshot(&mut state).await;
            return self.abort(&state, Phase::BackingUp, e);
        }

        let mut phase = Phase::TearingDown;
        match self.mutate(req, &mut state, &mut phase).await {
            Ok(()) => self.commit(req, &state).await,
            Err(e) => self.roll_back(&mut state, phase, e).await,
        }
    }

    // ------------------------------------------------------------------------
    // validating
    // ------------------------------------------------------------------------

    async fn validate(&self, req: &InstallationRequest) -> Result<(), InstallError> {
        let started = Instant::now();
        self.config
            .validate()
            .map_err(|e| InstallError::precondition(format!("{:#}", e)))?;

        if let Some(email) = self.admin_email(req) {
            crate::utils::validation::validate_admin_email(email)
                .map_err(|e| InstallError::precondition(format!("{:#}", e)))?;
        }

        let installed = self.layout.is_installed();
        match req.scenario {
            Scenario::Reinstall | Scenario::Upgrade if !installed => {
                return Err(InstallError::precondition(format!(
                    "No existing installation at {:?}; run `install` first",
                    self.layout.root
                )));
            }
            Scenario::Fresh if installed && !req.fresh_wipe && !self.config.fresh_install => {
                return Err(InstallError::precondition(format!(
                    "An installation already exists at {:?}; use `reinstall` or `upgrade`, or `install --fresh` to discard it",
                    self.layout.root
                )));
            }
            _ => {}
        }

        let template = self.config.compose_template_path();
        if !template.is_file() {
            return Err(InstallError::precondition(format!(
                "Compose template not found at {:?} (check --source)",
                template
            )));
        }

        for tool in &self.config.required_tools {
            which::which(tool).map_err(|_| {
                InstallError::precondition(format!("Required tool '{}' was not found on PATH", tool))
            })?;
        }

        if self.config.min_free_disk_mb > 0 {
            let free = crate::utils::disk::free_space_bytes(&self.layout.root)
                .await
                .map_err(|e| InstallError::precondition(format!("{:#}", e)))?;
            let needed = self.config.min_free_disk_mb.saturating_mul(1024 * 1024);
            if free < needed {
                return Err(InstallError::precondition(format!(
                    "Insufficient free disk space at {:?}: {} MiB available, {} MiB required",
                    self.layout.root,
                    free / (1024 * 1024),
                    self.config.min_free_disk_mb
                )));
            }
        }

        self.collab.runtime.ping().await.map_err(|e| {
            InstallError::precondition(format!("Container runtime is not reachable: {:#}", e))
        })?;

        info!(
            "[PHASE: validating] [STEP: preconditions] All preconditions met (installed={}, duration_ms={})",
            installed,
            started.elapsed().as_millis()
        );
        Ok(())
    }

    // ------------------------------------------------------------------------
    // backing-up
    // ------------------------------------------------------------------------

    async fn back_up(
        &self,
        req: &InstallationRequest,
        state: &mut RunState,
    ) -> Result<(), InstallError> {
        if req.scenario.preserves_credentials() && self.layout.is_installed() {
            self.progress(state, Phase::BackingUp, "credentials", "info", 8, "Capturing credentials...");
            let set = self
                .credentials
                .capture()
                .await
                .map_err(|source| InstallError::Backup { source })?;
            state.captured = Some(set);
            self.check_cancel(Phase::BackingUp)?;
        }

        if req.skip_backup {
            warn!(
                "[PHASE: backing-up] [STEP: snapshot] --no-backup given; continuing without a snapshot. A failure from here on cannot be rolled back."
            );
            self.progress(
                state,
                Phase::BackingUp,
                "snapshot",
                "warn",
                12,
                "Backup skipped (--no-backup)",
            );
            return Ok(());
        }

        self.progress(
            state,
            Phase::BackingUp,
            "snapshot",
            "info",
            12,
            format!("Creating {} backup...", req.backup_mode.as_str()),
        );
        let handle = self
            .backups
            .snapshot(req.backup_mode, req.scenario)
            .await
            .map_err(|source| InstallError::Backup { source })?;

        if let Some(set) = state.captured.as_ref().filter(|s| !s.is_empty()) {
            if let Err(e) = self.credentials.store(set, &handle.dir).await {
                if let Err(cleanup) = remove_path(&handle.dir).await {
                    warn!(
                        "[PHASE: backing-up] [STEP: snapshot] Could not remove incomplete snapshot {:?}: {:#}",
                        handle.dir, cleanup
                    );
                }
                return Err(InstallError::Backup {
                    source: e.context("Failed to store encrypted credentials with the snapshot"),
                });
            }
        }

        info!(
            "[PHASE: backing-up] [STEP: snapshot] Backup ready at {:?}",
            handle.dir
        );
        state.snapshot = Some(handle);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // mutation: tearing-down -> provisioning -> starting-tiers -> verifying
    // ------------------------------------------------------------------------

    async fn mutate(
        &self,
        req: &InstallationRequest,
        state: &mut RunState,
        phase: &mut Phase,
    ) -> Result<(), InstallError> {
        *phase = Phase::TearingDown;
        self.check_cancel(*phase)?;
        self.progress(state, *phase, "teardown", "info", 20, "Removing previous deployment...");
        state.mutated = true;
        state.volumes_removed = req.scenario == Scenario::Fresh || req.removes_volumes();
        self.tear_down(req)
            .await
            .map_err(|source| InstallError::Teardown { source })?;

        *phase = Phase::Provisioning;
        self.check_cancel(*phase)?;
        self.provision(req, state)
            .await
            .map_err(|source| InstallError::Provisioning { source })?;

        *phase = Phase::StartingTiers;
        self.check_cancel(*phase)?;
        self.start_tiers(req, state).await?;

        *phase = Phase::Verifying;
        self.check_cancel(*phase)?;
        self.verify(state).await
    }

    async fn tear_down(&self, req: &InstallationRequest) -> Result<()> {
        let started = Instant::now();
        let opts = TeardownOptions {
            remove_volumes: req.scenario == Scenario::Fresh || req.removes_volumes(),
            cache: req.cache,
        };
        self.collab
            .runtime
            .remove_deployment(opts)
            .await
            .context("Failed to remove the previous deployment")?;

        let fresh = req.scenario == Scenario::Fresh;
        if fresh {
            remove_path(&self.layout.secrets_dir).await?;
            remove_path(&self.layout.admin_marker).await?;
            info!("[PHASE: tearing-down] [STEP: credentials] Purged secrets and admin marker");
        }

        // Generated config is rebuilt during provisioning; certificates survive unless fresh.
        if self.layout.config_dir.exists() {
            let mut rd = tokio::fs::read_dir(&self.layout.config_dir)
                .await
                .with_context(|| format!("read_dir failed: {:?}", self.layout.config_dir))?;
            while let Some(ent) = rd.next_entry().await? {
                let path = ent.path();
                if !fresh && path == self.layout.certs_dir {
                    continue;
                }
                remove_path(&path).await?;
            }
        }

        info!(
            "[PHASE: tearing-down] [STEP: teardown] Previous deployment removed (volumes={}, cache={}, duration_ms={})",
            opts.remove_volumes,
            opts.cache.as_str(),
            started.elapsed().as_millis()
        );
        Ok(())
    }

    async fn provision(&self, req: &InstallationRequest, state: &RunState) -> Result<()> {
        let layout = &self.layout;
        self.progress(state, Phase::Provisioning, "layout", "info", 25, "Preparing installation directories...");
        ensure_dir_with_retries(&layout.config_dir, "ensure_config_dir").await?;
        ensure_dir_with_retries(&layout.secrets_dir, "ensure_secrets_dir").await?;
        set_mode(&layout.secrets_dir, 0o700).await?;
        ensure_dir_with_retries(&layout.data_dir, "ensure_data_dir").await?;

        if let Some(set) = &state.captured {
            self.credentials.reinject_files(set).await?;
        }
        ensure_secret_files(&layout.secrets_dir, &self.config.generated_secrets).await?;

        self.progress(state, Phase::Provisioning, "certificates", "info", 28, "Checking TLS certificates...");
        self.collab
            .certificates
            .ensure_certificate(&layout.certs_dir, &self.config.hostname)
            .await?;

        self.progress(state, Phase::Provisioning, "config", "info", 31, "Rendering configuration...");
        let vars = self.template_vars();
        self.collab.generator.generate(layout, &vars).await?;

        self.progress(state, Phase::Provisioning, "images", "info", 34, "Building images...");
        self.collab.runtime.ensure_network().await?;
        self.collab
            .runtime
            .build(BuildOptions {
                no_cache: req.cache == CacheLevel::Minimal,
                pull: req.scenario == Scenario::Upgrade,
            })
            .await?;

        info!("[PHASE: provisioning] [STEP: done] Provisioning complete");
        Ok(())
    }

    fn template_vars(&self) -> BTreeMap<String, String> {
        let path = |p: &std::path::Path| p.to_string_lossy().to_string();
        let layout = &self.layout;
        let mut vars = BTreeMap::new();
        vars.insert("PROJECT_NAME".to_string(), self.config.project_name.clone());
        vars.insert("NETWORK_NAME".to_string(), network_name(&self.config.project_name));
        vars.insert("INSTALL_ROOT".to_string(), path(&layout.root));
        vars.insert("CONFIG_DIR".to_string(), path(&layout.config_dir));
        vars.insert("SECRETS_DIR".to_string(), path(&layout.secrets_dir));
        vars.insert("DATA_DIR".to_string(), path(&layout.data_dir));
        vars.insert("CERTS_DIR".to_string(), path(&layout.certs_dir));
        vars.insert("TLS_CERT_FILE".to_string(), path(&layout.certs_dir.join(CERT_FILE)));
        vars.insert("TLS_KEY_FILE".to_string(), path(&layout.certs_dir.join(KEY_FILE)));
        vars.insert("HOSTNAME".to_string(), self.config.hostname.clone());
        vars.insert("SECRETS_ENGINE_URL".to_string(), self.config.secrets_engine.url.clone());
        vars.insert("IDENTITY_URL".to_string(), self.config.identity.url.clone());
        vars.insert("IDENTITY_REALM".to_string(), self.config.identity.realm.clone());
        vars
    }

    async fn start_tiers(
        &self,
        req: &InstallationRequest,
        state: &mut RunState,
    ) -> Result<(), InstallError> {
        let scheduler = TierScheduler::new(
            self.collab.runtime.clone(),
            self.registry.clone(),
            HealthVerifier::new(self.cancel.clone()),
        );
        let total = self.config.tiers.len().max(1);

        for (i, tier) in self.config.tiers.iter().enumerate() {
            self.check_cancel(Phase::StartingTiers)?;
            let percent = 40 + (45 * i / total) as i32;
            self.progress(
                state,
                Phase::StartingTiers,
                &tier.name,
                "info",
                percent,
                format!("Starting {} ({})...", tier.name, tier.services.join(", ")),
            );

            let result = scheduler.start_tier(tier).await;
            if result.cancelled {
                return Err(InstallError::Cancelled {
                    phase: Phase::StartingTiers,
                });
            }
            if !result.all_healthy {
                return Err(InstallError::TierHealth {
                    tier: result.tier,
                    unhealthy: result.unhealthy_services,
                });
            }
            if result.degraded {
                state.degraded.push(tier.name.clone());
                self.progress(
                    state,
                    Phase::StartingTiers,
                    &tier.name,
                    "warn",
                    percent,
                    format!(
                        "{} degraded (unhealthy: {}); continuing",
                        tier.name,
                        result.unhealthy_services.join(", ")
                    ),
                );
            }

            for hook in &tier.hooks {
                self.check_cancel(Phase::StartingTiers)?;
                self.run_hook(*hook, req, state)
                    .await
                    .map_err(|source| InstallError::Hook {
                        hook: hook.as_str().to_string(),
                        source,
                    })?;
            }
        }
        Ok(())
    }

    async fn run_hook(
        &self,
        hook: TierHook,
        req: &InstallationRequest,
        state: &mut RunState,
    ) -> Result<()> {
        let started = Instant::now();
        match hook {
            TierHook::UnsealSecretsEngine => self.prepare_secrets_engine(state).await?,
            TierHook::RestoreEngineCredentials => self.restore_engine_credentials(state).await?,
            TierHook::BootstrapIdentityAdmin => self.bootstrap_identity_admin(req).await?,
        }
        info!(
            "[PHASE: starting-tiers] [STEP: {}] Done (duration_ms={})",
            hook.as_str(),
            started.elapsed().as_millis()
        );
        Ok(())
    }

    async fn prepare_secrets_engine(&self, state: &mut RunState) -> Result<()> {
        let engine = self.collab.secrets.as_ref();
        let status = engine
            .status()
            .await
            .context("Secrets engine status check failed")?;

        let init = if status.initialized {
            read_engine_init(&self.layout).await?.ok_or_else(|| {
                anyhow::anyhow!(
                    "Secrets engine is initialized but no unseal material exists at {:?}",
                    self.layout.engine_init_file()
                )
            })?
        } else {
            let cfg = &self.config.secrets_engine;
            let init = engine
                .init(cfg.key_shares, cfg.key_threshold)
                .await
                .context("Secrets engine initialization failed")?;
            write_engine_init(&self.layout, &init).await?;
            info!(
                "[PHASE: starting-tiers] [STEP: unseal-secrets-engine] Initialized secrets engine ({} shares, threshold {})",
                cfg.key_shares, cfg.key_threshold
            );
            init
        };

        if engine.status().await?.sealed {
            unseal_with(engine, &init).await?;
        } else {
            debug!("[PHASE: starting-tiers] [STEP: unseal-secrets-engine] Engine already unsealed");
        }
        state.engine_init = Some(init);
        Ok(())
    }

    async fn restore_engine_credentials(&self, state: &RunState) -> Result<()> {
        let Some(set) = state.captured.as_ref().filter(|s| !s.engine.is_empty()) else {
            debug!("[PHASE: starting-tiers] [STEP: restore-engine-credentials] No engine entries to restore");
            return Ok(());
        };
        let token = match &state.engine_init {
            Some(init) => init.root_token.clone(),
            None => read_engine_init(&self.layout)
                .await?
                .map(|i| i.root_token)
                .ok_or_else(|| anyhow::anyhow!("No secrets engine token available"))?,
        };
        self.credentials.reinject_engine(set, &token).await
    }

    async fn bootstrap_identity_admin(&self, req: &InstallationRequest) -> Result<()> {
        if tokio::fs::try_exists(&self.layout.admin_marker)
            .await
            .unwrap_or(false)
        {
            info!("[PHASE: starting-tiers] [STEP: bootstrap-identity-admin] Admin already initialized; skipping");
            return Ok(());
        }
        let Some(email) = self.admin_email(req) else {
            warn!(
                "[PHASE: starting-tiers] [STEP: bootstrap-identity-admin] No admin email configured; skipping admin creation (pass --admin-email)"
            );
            return Ok(());
        };

        let identity_id = self
            .collab
            .identity
            .create_identity(email, email)
            .await
            .context("Failed to create the admin identity")?;
        let marker = AdminMarker {
            identity_id,
            email,
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        write_file_with_retries(
            &self.layout.admin_marker,
            &serde_json::to_vec_pretty(&marker)?,
            "write_admin_marker",
        )
        .await?;
        info!(
            "[PHASE: starting-tiers] [STEP: bootstrap-identity-admin] Admin identity created for {}",
            crate::utils::logging::mask_sensitive(email)
        );
        Ok(())
    }

    async fn verify(&self, state: &RunState) -> Result<(), InstallError> {
        self.progress(state, Phase::Verifying, "smoke", "info", 88, "Running end-to-end checks...");
        let verifier = HealthVerifier::new(self.cancel.clone());
        for check in &self.smoke {
            match verifier
                .wait(&check.name, check.strategy.as_ref(), &check.policy)
                .await
            {
                HealthOutcome::Healthy { .. } => {}
                HealthOutcome::Cancelled { .. } => {
                    return Err(InstallError::Cancelled {
                        phase: Phase::Verifying,
                    })
                }
                HealthOutcome::TimedOut {
                    attempts,
                    last_error,
                } => {
                    return Err(InstallError::Verification {
                        reason: format!(
                            "smoke check '{}' ({}) did not pass after {} attempt(s): {}",
                            check.name,
                            check.strategy.describe(),
                            attempts,
                            last_error
                        ),
                    })
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // terminal states
    // ------------------------------------------------------------------------

    async fn commit(&self, req: &InstallationRequest, state: &RunState) -> InstallationOutcome {
        self.progress(state, Phase::Committing, "commit", "info", 95, "Finalizing installation...");
        let keep = self.config.keep_successful_backups;
        let retained = if keep {
            state.snapshot.as_ref().map(|h| h.dir.clone())
        } else {
            None
        };

        // The stack is up and verified; bookkeeping failures below only warrant a warning.
        let record = InstallState {
            scenario: req.scenario.as_str().to_string(),
            completed_at: chrono::Utc::now().to_rfc3339(),
            installer_version: env!("CARGO_PKG_VERSION").to_string(),
            correlation_id: self.correlation_id.clone(),
            project: self.config.project_name.clone(),
            backup_mode: if req.skip_backup {
                "none".to_string()
            } else {
                req.backup_mode.as_str().to_string()
            },
            cache: req.cache.as_str().to_string(),
            degraded_tiers: state.degraded.clone(),
            retained_snapshot: retained.as_ref().map(|p| p.to_string_lossy().to_string()),
        };
        if let Err(e) = self.write_install_state(&record).await {
            warn!(
                "[PHASE: committing] [STEP: state] Could not write {:?}: {:#}",
                self.layout.install_state, e
            );
        }
        if let Err(e) = self
            .backups
            .commit(
                state.snapshot.as_ref(),
                keep,
                self.config.backup_retention,
            )
            .await
        {
            warn!("[PHASE: committing] [STEP: backups] Backup cleanup failed: {:#}", e);
        }

        info!(
            "[PHASE: committing] [STEP: done] Installation succeeded (degraded_tiers=[{}], duration_ms={})",
            state.degraded.join(","),
            state.started.elapsed().as_millis()
        );
        self.progress(state, Phase::Committing, "done", "info", 100, "Installation complete.");
        InstallationOutcome::Success {
            snapshot: retained,
            degraded_tiers: state.degraded.clone(),
        }
    }

    async fn write_install_state(&self, record: &InstallState) -> Result<()> {
        let body = toml::to_string_pretty(record).context("Failed to serialize install state")?;
        write_file_with_retries(&self.layout.install_state, body.as_bytes(), "write_install_state")
            .await
    }

    /// Drop this run's snapshot when the run stops before touching anything.
    async fn discard_snapshot(&self, state: &mut RunState) {
        let Some(handle) = state.snapshot.take() else {
            return;
        };
        match remove_path(&handle.dir).await {
            Ok(()) => debug!(
                "[PHASE: backing-up] [STEP: snapshot] Removed unused snapshot {}",
                handle.id
            ),
            Err(e) => warn!(
                "[PHASE: backing-up] [STEP: snapshot] Could not remove unused snapshot {:?}: {:#}",
                handle.dir, e
            ),
        }
    }

    fn abort(&self, state: &RunState, phase: Phase, err: InstallError) -> InstallationOutcome {
        error!(
            "[PHASE: {}] [STEP: abort] Aborting before any change: {}",
            phase, err
        );
        self.progress(state, phase, "abort", "error", 100, err.to_string());
        InstallationOutcome::Aborted {
            phase,
            error: err.to_string(),
        }
    }

    async fn roll_back(
        &self,
        state: &mut RunState,
        phase: Phase,
        err: InstallError,
    ) -> InstallationOutcome {
        if !state.mutated {
            self.discard_snapshot(state).await;
            return self.abort(state, phase, err);
        }
        let error_text = err.to_string();
        error!(
            "[PHASE: rolling-back] [STEP: start] {} failed: {}; rolling back",
            phase, error_text
        );
        self.progress(
            state,
            Phase::RollingBack,
            "start",
            "warn",
            90,
            format!("{} failed; rolling back...", phase),
        );

        // Half-built containers go; volumes and images stay so the restored deployment can reuse them.
        if let Err(e) = self
            .collab
            .runtime
            .remove_deployment(TeardownOptions {
                remove_volumes: false,
                cache: CacheLevel::Full,
            })
            .await
        {
            warn!(
                "[PHASE: rolling-back] [STEP: teardown] Could not remove the partial deployment: {:#}",
                e
            );
        }

        let Some(snapshot) = state.snapshot.as_ref() else {
            let restore_error = "No backup snapshot exists for this run (--no-backup was given); the previous installation cannot be restored".to_string();
            error!("[PHASE: rolling-back] [STEP: restore] {}", restore_error);
            self.progress(state, Phase::RollingBack, "restore", "error", 100, restore_error.clone());
            return InstallationOutcome::Unrecoverable {
                phase,
                error: error_text,
                restore_error,
                snapshot: None,
            };
        };

        if let Err(source) = self.backups.restore(snapshot).await {
            let restore_error = InstallError::Restore { source }.to_string();
            error!(
                "[PHASE: rolling-back] [STEP: restore] {} (snapshot kept at {:?})",
                restore_error, snapshot.dir
            );
            self.progress(state, Phase::RollingBack, "restore", "error", 100, restore_error.clone());
            return InstallationOutcome::Unrecoverable {
                phase,
                error: error_text,
                restore_error,
                snapshot: Some(snapshot.dir.clone()),
            };
        }

        if let Err(e) = self.backups.mark_restored(snapshot).await {
            warn!(
                "[PHASE: rolling-back] [STEP: restore] Could not mark snapshot {} as restored: {:#}",
                snapshot.id, e
            );
        }

        if self.layout.compose_file.exists() {
            self.progress(state, Phase::RollingBack, "restart", "info", 95, "Restarting previous deployment...");
            if let Err(e) = self.collab.runtime.start_all().await {
                warn!(
                    "[PHASE: rolling-back] [STEP: restart] Previous deployment did not restart cleanly: {:#}. Start it manually.",
                    e
                );
            }
        }

        // Volumes are not part of any snapshot. The restored unseal material belongs to an engine
        // whose storage is gone, so the engine is brought back under this run's material instead.
        if state.volumes_removed && self.layout.engine_init_file().exists() {
            warn!(
                "[PHASE: rolling-back] [STEP: volumes] Data volumes were removed before the failure and cannot be restored from {:?}",
                snapshot.dir
            );
            if let Err(e) = self.reestablish_secrets_engine(state, snapshot).await {
                let restore_error = format!(
                    "Files were restored, but the secrets engine could not be re-established after its volumes were removed: {:#}",
                    e
                );
                error!("[PHASE: rolling-back] [STEP: secrets-engine] {}", restore_error);
                self.progress(state, Phase::RollingBack, "secrets-engine", "error", 100, restore_error.clone());
                return InstallationOutcome::Unrecoverable {
                    phase,
                    error: error_text,
                    restore_error,
                    snapshot: Some(snapshot.dir.clone()),
                };
            }
        }

        info!(
            "[PHASE: rolling-back] [STEP: done] Restored snapshot {} (duration_ms={})",
            snapshot.id,
            state.started.elapsed().as_millis()
        );
        self.progress(state, Phase::RollingBack, "done", "warn", 100, "Previous installation restored.");
        InstallationOutcome::RolledBack {
            phase,
            error: error_text,
            snapshot: snapshot.dir.clone(),
        }
    }

    /// Initialize (or reuse this run's) engine material, unseal, and write back the entries
    /// captured before teardown.
    async fn reestablish_secrets_engine(
        &self,
        state: &RunState,
        snapshot: &SnapshotHandle,
    ) -> Result<()> {
        let engine = self.collab.secrets.as_ref();
        let policy = self
            .registry
            .lookup(&self.config.secrets_engine.service)
            .map(|check| check.policy)
            .unwrap_or_else(RetryPolicy::once);
        let status = policy
            .retry(|| engine.status())
            .await
            .context("Secrets engine did not come back after the restart")?;

        let init = match (&state.engine_init, status.initialized) {
            (_, false) => {
                let cfg = &self.config.secrets_engine;
                engine
                    .init(cfg.key_shares, cfg.key_threshold)
                    .await
                    .context("Secrets engine initialization failed")?
            }
            (Some(init), true) => init.clone(),
            (None, true) => anyhow::bail!(
                "Secrets engine is initialized but this run holds no unseal material for it"
            ),
        };
        write_engine_init(&self.layout, &init).await?;
        if engine.status().await?.sealed {
            unseal_with(engine, &init).await?;
        }

        let set = match self.credentials.load(&snapshot.dir).await? {
            Some(set) => set,
            None => state.captured.clone().unwrap_or_default(),
        };
        if !set.engine.is_empty() {
            self.credentials.reinject_engine(&set, &init.root_token).await?;
        }
        info!(
            "[PHASE: rolling-back] [STEP: secrets-engine] Secrets engine re-established (entries={})",
            set.engine.len()
        );
        Ok(())
    }

    // ------------------------------------------------------------------------
    // helpers
    // ------------------------------------------------------------------------

    fn admin_email<'a>(&'a self, req: &'a InstallationRequest) -> Option<&'a str> {
        req.admin_email
            .as_deref()
            .or(self.config.identity.admin_email.as_deref())
    }

    fn check_cancel(&self, phase: Phase) -> Result<(), InstallError> {
        if self.cancel.is_cancelled() {
            return Err(InstallError::Cancelled { phase });
        }
        Ok(())
    }

    fn progress(
        &self,
        state: &RunState,
        phase: Phase,
        step: &str,
        severity: &str,
        percent: i32,
        message: impl Into<String>,
    ) {
        (self.emit)(ProgressPayload {
            correlation_id: self.correlation_id.clone(),
            step: step.to_string(),
            severity: severity.to_string(),
            phase: phase.as_str().to_string(),
            percent,
            message: message.into(),
            elapsed_ms: Some(state.started.elapsed().as_millis()),
        });
    }
}
