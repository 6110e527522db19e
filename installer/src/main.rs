use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use std::io::{BufRead, IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use stack_installer::backup::BackupController;
use stack_installer::config::InstallerConfig;
use stack_installer::models::outcome::InstallationOutcome;
use stack_installer::models::progress::ProgressEmitter;
use stack_installer::models::request::{BackupMode, CacheLevel, InstallationRequest, Scenario};
use stack_installer::orchestrator::lock::InstallLock;
use stack_installer::orchestrator::uninstall::uninstall;
use stack_installer::orchestrator::Installer;
use stack_installer::utils::logging::init_logging;
use stack_installer::utils::path_resolver::{absolutize, resolve_log_folder};

#[derive(Parser)]
#[command(name = "stack-installer")]
#[command(version, about = "Install, upgrade and remove the application stack on this host", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true, env = "STACK_INSTALLER_CONFIG")]
    config: Option<PathBuf>,

    /// Installation root (overrides config)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Source/staging directory holding the compose template (overrides config)
    #[arg(long, global = true)]
    source: Option<PathBuf>,

    /// Show debug logs on the terminal
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install the stack
    Install {
        /// Discard an existing installation, its credentials and data volumes
        #[arg(long)]
        fresh: bool,

        /// Do not ask for confirmation
        #[arg(long)]
        no_prompt: bool,

        /// Email of the initial admin identity
        #[arg(long)]
        admin_email: Option<String>,

        /// Skip the pre-teardown backup (a failure cannot be rolled back)
        #[arg(long)]
        no_backup: bool,

        /// Back up the whole installation root instead of config and secrets only
        #[arg(long)]
        full_backup: bool,
    },

    /// Rebuild the stack, keeping credentials
    Reinstall {
        /// Also remove data volumes. Credentials are kept: secret files are carried over and
        /// secrets-engine entries are written back into the re-initialized engine
        #[arg(long)]
        fresh: bool,

        #[arg(long)]
        no_backup: bool,

        #[arg(long)]
        full_backup: bool,

        /// How much image/build cache survives (minimal|moderate|full)
        #[arg(long)]
        cache: Option<CacheLevel>,

        #[arg(long)]
        admin_email: Option<String>,

        #[arg(long)]
        no_prompt: bool,
    },

    /// Pull newer images and rebuild, keeping credentials and data
    Upgrade {
        #[arg(long)]
        no_backup: bool,

        #[arg(long)]
        full_backup: bool,

        #[arg(long)]
        cache: Option<CacheLevel>,

        #[arg(long)]
        no_prompt: bool,
    },

    /// Remove the stack
    Uninstall {
        /// Also remove volumes, secrets, data, backups and the installation root
        #[arg(long)]
        purge: bool,

        #[arg(long)]
        no_prompt: bool,
    },

    /// Inspect or prune backup snapshots
    #[command(subcommand)]
    Backups(BackupCommands),
}

#[derive(Subcommand)]
enum BackupCommands {
    /// List snapshots, newest first
    List,

    /// Delete all but the newest snapshots
    Prune {
        /// Snapshots to keep (default: backup_retention)
        #[arg(long)]
        keep: Option<usize>,
    },
}

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("[PHASE: cli] [STEP: fatal] {:#}", e);
            eprintln!("Error: {:#}", e);
            1
        }
    };
    log::logger().flush();
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let mut config = InstallerConfig::load(cli.config.as_deref())?;
    if let Some(root) = &cli.root {
        config.install_root = absolutize(root)?;
    }
    if let Some(source) = &cli.source {
        config.source_dir = absolutize(source)?;
    }
    config.validate()?;

    let log_dir = resolve_log_folder(config.log_dir.as_deref())?;
    let terminal_level = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Warn
    };
    let log_file = init_logging(&log_dir, terminal_level)?;
    info!(
        "[PHASE: initialization] [STEP: start] stack-installer {} (root={:?}, log={:?})",
        env!("CARGO_PKG_VERSION"),
        config.install_root,
        log_file
    );

    let layout = config.layout();
    let code = match cli.command {
        Commands::Install {
            fresh,
            no_prompt,
            admin_email,
            no_backup,
            full_backup,
        } => {
            let mut req = InstallationRequest::new(Scenario::Fresh);
            req.fresh_wipe = fresh || config.fresh_install;
            req.skip_backup = no_backup;
            req.backup_mode = backup_mode(full_backup);
            req.cache = config.cache_level;
            req.no_prompt = no_prompt;
            req.admin_email = admin_email;
            if req.fresh_wipe
                && layout.is_installed()
                && !confirm(
                    &format!(
                        "This discards the installation at {:?}, including its credentials and data volumes.",
                        layout.root
                    ),
                    no_prompt,
                )
                .await?
            {
                return Ok(1);
            }
            run_installer(config, req, &log_file).await?
        }
        Commands::Reinstall {
            fresh,
            no_backup,
            full_backup,
            cache,
            admin_email,
            no_prompt,
        } => {
            let mut req = InstallationRequest::new(Scenario::Reinstall);
            req.fresh_wipe = fresh;
            req.skip_backup = no_backup;
            req.backup_mode = backup_mode(full_backup);
            req.cache = cache.unwrap_or(config.cache_level);
            req.no_prompt = no_prompt;
            req.admin_email = admin_email;
            let warning = if fresh {
                "The running stack will be rebuilt and its data volumes removed. Credentials are kept."
            } else {
                "The running stack will be stopped and rebuilt."
            };
            if !confirm(warning, no_prompt).await? {
                return Ok(1);
            }
            run_installer(config, req, &log_file).await?
        }
        Commands::Upgrade {
            no_backup,
            full_backup,
            cache,
            no_prompt,
        } => {
            let mut req = InstallationRequest::new(Scenario::Upgrade);
            req.skip_backup = no_backup;
            req.backup_mode = backup_mode(full_backup);
            req.cache = cache.unwrap_or(config.cache_level);
            req.no_prompt = no_prompt;
            if !confirm("The running stack will be stopped, updated and restarted.", no_prompt)
                .await?
            {
                return Ok(1);
            }
            run_installer(config, req, &log_file).await?
        }
        Commands::Uninstall { purge, no_prompt } => {
            let warning = if purge {
                format!(
                    "This permanently deletes {:?}, every volume, secret and backup.",
                    layout.root
                )
            } else {
                "The stack will be stopped and removed; secrets, data and backups are kept."
                    .to_string()
            };
            if !confirm(&warning, no_prompt).await? {
                return Ok(1);
            }
            let collab = stack_installer::host_collaborators(&config)?;
            match uninstall(&layout, collab.runtime.as_ref(), purge).await {
                Ok(report) => {
                    println!("Uninstall complete.");
                    for p in &report.kept {
                        println!("Kept: {}", p.display());
                    }
                    0
                }
                Err(e) => {
                    error!("[PHASE: uninstall] [STEP: failed] {}", e);
                    eprintln!("Uninstall failed: {}", e);
                    1
                }
            }
        }
        Commands::Backups(BackupCommands::List) => {
            let backups = BackupController::new(layout);
            let snapshots = backups.list().await?;
            if snapshots.is_empty() {
                println!("No backups under {}", backups.layout().backups_dir.display());
            }
            for s in snapshots {
                let size = backups
                    .read_manifest(&s.handle)
                    .await
                    .map(|m| format!("{} bytes", m.total_bytes()))
                    .unwrap_or_else(|_| "?".to_string());
                println!(
                    "{:<28} {:<5} {:<10} {:<9} {}  {}",
                    s.handle.id,
                    s.metadata.mode.as_str(),
                    s.metadata.scenario.as_str(),
                    format!("{:?}", s.metadata.state).to_ascii_lowercase(),
                    s.metadata.created_at.to_rfc3339(),
                    size
                );
            }
            0
        }
        Commands::Backups(BackupCommands::Prune { keep }) => {
            let keep = keep.unwrap_or(config.backup_retention);
            let _lock = InstallLock::acquire(&layout.lock_file)?;
            let removed = BackupController::new(layout).rotate(keep).await?;
            println!("Removed {} snapshot(s), kept at most {}.", removed.len(), keep);
            0
        }
    };
    Ok(code)
}

fn backup_mode(full: bool) -> BackupMode {
    if full {
        BackupMode::Full
    } else {
        BackupMode::Lean
    }
}

/// Ask before a destructive operation. Non-interactive runs must pass `--no-prompt`.
async fn confirm(warning: &str, no_prompt: bool) -> Result<bool> {
    if no_prompt {
        return Ok(true);
    }
    if !std::io::stdin().is_terminal() {
        anyhow::bail!("{} Refusing to continue without --no-prompt in a non-interactive session.", warning);
    }
    let warning = warning.to_string();
    tokio::task::spawn_blocking(move || -> Result<bool> {
        print!("{}\nContinue? [y/N] ", warning);
        std::io::stdout().flush()?;
        let mut answer = String::new();
        std::io::stdin().lock().read_line(&mut answer)?;
        let yes = matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes");
        if !yes {
            println!("Cancelled; nothing was changed.");
        }
        Ok(yes)
    })
    .await
    .context("Confirmation prompt failed")?
}

async fn run_installer(
    config: InstallerConfig,
    req: InstallationRequest,
    log_file: &std::path::Path,
) -> Result<i32> {
    let cancel = CancellationToken::new();
    let interrupt = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("[PHASE: signal] [STEP: ctrl-c] Interrupt received; stopping at the next safe point");
                cancel.cancel();
            }
        }
    });

    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::with_template("{spinner} [{elapsed_precise}] [{bar:30}] {pos:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );
    let emit: ProgressEmitter = {
        let bar = bar.clone();
        Arc::new(move |p| {
            bar.set_position(p.percent.clamp(0, 100) as u64);
            bar.set_message(format!("{}: {}", p.phase, p.message));
            if p.severity != "info" {
                bar.println(format!("[{}] {}", p.severity, p.message));
            }
        })
    };

    let collab = stack_installer::host_collaborators(&config)?;
    let installer = Installer::new(config, collab, cancel, emit)?;
    info!(
        "[PHASE: initialization] [STEP: request] {} (correlation_id={})",
        serde_json::to_string(&req).unwrap_or_default(),
        installer.correlation_id()
    );
    let outcome = installer.run(&req).await;
    bar.finish_and_clear();
    interrupt.abort();

    match &outcome {
        InstallationOutcome::Success { .. } => println!("{}", outcome.render()),
        _ => eprintln!("{}", outcome.render()),
    }
    println!("Logs: {}", log_file.display());
    Ok(outcome.exit_code())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn reinstall_fresh_help_says_credentials_are_kept() {
        let cmd = Cli::command();
        let reinstall = cmd.find_subcommand("reinstall").unwrap();
        let fresh = reinstall
            .get_arguments()
            .find(|a| a.get_id() == "fresh")
            .unwrap();
        let help = fresh.get_help().unwrap().to_string();
        assert!(help.contains("remove data volumes"), "{}", help);
        assert!(help.contains("Credentials are kept"), "{}", help);

        let install = cmd.find_subcommand("install").unwrap();
        let discard = install
            .get_arguments()
            .find(|a| a.get_id() == "fresh")
            .unwrap();
        assert!(discard.get_help().unwrap().to_string().contains("credentials"));
    }

    #[test]
    fn reinstall_fresh_parses() {
        let cli = Cli::try_parse_from(["stack-installer", "reinstall", "--fresh", "--no-prompt"]).unwrap();
        assert!(matches!(cli.command, Commands::Reinstall { fresh: true, .. }));
    }
}
