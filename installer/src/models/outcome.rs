// Terminal results of an installer run

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

/// States of the installation state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Validating,
    BackingUp,
    TearingDown,
    Provisioning,
    StartingTiers,
    Verifying,
    Committing,
    RollingBack,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Validating => "validating",
            Phase::BackingUp => "backing-up",
            Phase::TearingDown => "tearing-down",
            Phase::Provisioning => "provisioning",
            Phase::StartingTiers => "starting-tiers",
            Phase::Verifying => "verifying",
            Phase::Committing => "committing",
            Phase::RollingBack => "rolling-back",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase", tag = "outcome")]
pub enum InstallationOutcome {
    Success {
        #[serde(skip_serializing_if = "Option::is_none")]
        snapshot: Option<PathBuf>,
        degraded_tiers: Vec<String>,
    },
    /// Failed before anything was changed.
    Aborted { phase: Phase, error: String },
    /// Failed after mutation; the pre-operation state was restored.
    RolledBack {
        phase: Phase,
        error: String,
        snapshot: PathBuf,
    },
    /// Failed after mutation and the restore path failed too (or had nothing to restore).
    Unrecoverable {
        phase: Phase,
        error: String,
        restore_error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        snapshot: Option<PathBuf>,
    },
}

impl InstallationOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            InstallationOutcome::Success { .. } => 0,
            InstallationOutcome::Aborted { .. } => 1,
            InstallationOutcome::RolledBack { .. } => 2,
            InstallationOutcome::Unrecoverable { .. } => 3,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, InstallationOutcome::Success { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            InstallationOutcome::Success { .. } => "success",
            InstallationOutcome::Aborted { .. } => "aborted",
            InstallationOutcome::RolledBack { .. } => "rolled-back",
            InstallationOutcome::Unrecoverable { .. } => "unrecoverable",
        }
    }

    /// Operator-facing summary: what happened, where the snapshot is, what to do next.
    pub fn render(&self) -> String {
        match self {
            InstallationOutcome::Success {
                snapshot,
                degraded_tiers,
            } => {
                let mut out = String::from("Installation complete. The stack is safe to use.");
                if !degraded_tiers.is_empty() {
                    out.push_str(&format!(
                        "\nDegraded optional tiers: {}. Check their logs; core functionality is unaffected.",
                        degraded_tiers.join(", ")
                    ));
                }
                if let Some(p) = snapshot {
                    out.push_str(&format!("\nBackup retained at: {}", p.display()));
                }
                out
            }
            InstallationOutcome::Aborted { phase, error } => format!(
                "Installation aborted during {phase}: {error}\n\
                 Nothing was changed. Fix the problem above and retry."
            ),
            InstallationOutcome::RolledBack {
                phase,
                error,
                snapshot,
            } => format!(
                "Installation failed during {phase}: {error}\n\
                 The previous installation was restored from the backup at: {}\n\
                 Review the logs, then retry the operation.",
                snapshot.display()
            ),
            InstallationOutcome::Unrecoverable {
                phase,
                error,
                restore_error,
                snapshot,
            } => {
                let location = match snapshot {
                    Some(p) => format!(
                        "Backup snapshot (left untouched): {}\n\
                         Restore manually by copying its 'tree/' contents over the installation root.",
                        p.display()
                    ),
                    None => "No backup snapshot exists for this run; manual reinstallation is required.".to_string(),
                };
                format!(
                    "UNRECOVERABLE: installation failed during {phase}: {error}\n\
                     Rollback also failed: {restore_error}\n\
                     {location}\n\
                     Manual intervention is required before the stack can be used."
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_distinguish_terminal_states() {
        let ok = InstallationOutcome::Success {
            snapshot: None,
            degraded_tiers: vec![],
        };
        let rb = InstallationOutcome::RolledBack {
            phase: Phase::StartingTiers,
            error: "x".into(),
            snapshot: PathBuf::from("/b"),
        };
        let un = InstallationOutcome::Unrecoverable {
            phase: Phase::Provisioning,
            error: "x".into(),
            restore_error: "y".into(),
            snapshot: None,
        };
        assert_eq!(ok.exit_code(), 0);
        assert_eq!(rb.exit_code(), 2);
        assert_eq!(un.exit_code(), 3);
    }

    #[test]
    fn unrecoverable_render_names_snapshot_location() {
        let un = InstallationOutcome::Unrecoverable {
            phase: Phase::StartingTiers,
            error: "tier failed".into(),
            restore_error: "rename failed".into(),
            snapshot: Some(PathBuf::from("/opt/stack/backups/20250101-000000-lean")),
        };
        let text = un.render();
        assert!(text.contains("/opt/stack/backups/20250101-000000-lean"));
        assert!(text.contains("Manual intervention"));
    }

    #[test]
    fn outcome_serializes_with_tag() {
        let v = serde_json::to_value(InstallationOutcome::Aborted {
            phase: Phase::Validating,
            error: "docker unreachable".into(),
        })
        .unwrap();
        assert_eq!(v["outcome"], "aborted");
        assert_eq!(v["phase"], "validating");
    }
}
