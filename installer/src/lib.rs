// Stack installer library entry point
//
// The binary (main.rs) parses the CLI, loads `InstallerConfig`, wires the real collaborators
// below and hands an `InstallationRequest` to `orchestrator::Installer`.

pub mod backup;
pub mod config;
pub mod credentials;
pub mod error;
pub mod health;
pub mod installation;
pub mod models;
pub mod orchestrator;
pub mod scheduler;
pub mod security;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

use anyhow::Result;
use std::sync::Arc;

use config::InstallerConfig;
use installation::docker::DockerRuntime;
use installation::generate::{OpensslIssuer, TemplateConfigGenerator};
use installation::identity::KeycloakAdmin;
use installation::secrets_engine::HttpSecretsEngine;
use installation::Collaborators;

/// Host implementations: docker compose, Vault-compatible HTTP, Keycloak admin REST, openssl.
pub fn host_collaborators(config: &InstallerConfig) -> Result<Collaborators> {
    let layout = config.layout();
    let password_file = layout.secret_file(&config.identity.admin_password_secret);
    Ok(Collaborators {
        runtime: Arc::new(DockerRuntime::new(&config.project_name, &layout.compose_file)),
        secrets: Arc::new(HttpSecretsEngine::new(&config.secrets_engine.url)?),
        identity: Arc::new(KeycloakAdmin::new(&config.identity, password_file)?),
        generator: Arc::new(TemplateConfigGenerator::new(&config.compose_template_path())),
        certificates: Arc::new(OpensslIssuer),
    })
}
