// Provisioning helpers: template rendering, generated secrets and self-signed certificates.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use log::{debug, info};
use ring::rand::SecureRandom;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::InstallLayout;
use crate::installation::files::{set_mode, write_file_with_retries, write_private_file};
use crate::installation::{run_cmd_with_timeout, CertificateIssuer, ConfigGenerator};

/// Renders the compose template (`{{KEY}}` placeholders) and an env file into `config/`.
pub struct TemplateConfigGenerator {
    template: PathBuf,
}

impl TemplateConfigGenerator {
    pub fn new(template: &Path) -> Self {
        Self {
            template: template.to_path_buf(),
        }
    }
}

#[async_trait]
impl ConfigGenerator for TemplateConfigGenerator {
    async fn generate(
        &self,
        layout: &InstallLayout,
        vars: &BTreeMap<String, String>,
    ) -> Result<()> {
        info!(
            "[PHASE: provisioning] [STEP: config] Rendering configuration (template={:?}, var_count={})",
            self.template,
            vars.len()
        );

        let template = tokio::fs::read_to_string(&self.template)
            .await
            .with_context(|| format!("Failed to read compose template: {:?}", self.template))?;
        let rendered = render_compose(&template, vars)?;
        write_file_with_retries(&layout.compose_file, rendered.as_bytes(), "write_compose_file")
            .await?;
        write_private_file(&layout.env_file, render_env_file(vars).as_bytes(), "write_env_file")
            .await?;
        Ok(())
    }
}

/// Substitute `{{VAR}}` placeholders in a string with values from a map.
pub fn substitute_placeholders(template: &str, variables: &BTreeMap<String, String>) -> String {
    let mut result = template.to_string();
    for (key, value) in variables {
        let placeholder = format!("{{{{{}}}}}", key);
        result = result.replace(&placeholder, value);
    }
    result
}

/// First unresolved `{{...}}` placeholder name, if any.
pub fn find_unresolved_placeholder(content: &str) -> Option<String> {
    let mut chars = content.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '{' && chars.peek() == Some(&'{') {
            chars.next();
            let mut name = String::new();
            while let Some(&ch) = chars.peek() {
                if ch == '}' {
                    chars.next();
                    if chars.peek() == Some(&'}') {
                        chars.next();
                        if !name.is_empty() {
                            return Some(name);
                        }
                    }
                    break;
                }
                name.push(ch);
                chars.next();
            }
        }
    }
    None
}

pub fn render_compose(template: &str, vars: &BTreeMap<String, String>) -> Result<String> {
    let out = substitute_placeholders(template, vars);
    if let Some(unresolved) = find_unresolved_placeholder(&out) {
        anyhow::bail!(
            "Unresolved placeholder '{}' in compose template. Ensure all required variables are provided.",
            unresolved
        );
    }
    if out.trim().is_empty() {
        anyhow::bail!("Generated compose file is empty");
    }
    if !out.contains("services:") {
        anyhow::bail!("Generated compose file does not contain 'services:' section");
    }
    Ok(out)
}

pub fn render_env_file(vars: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (k, v) in vars {
        if v.contains(char::is_whitespace) || v.contains('#') {
            out.push_str(&format!("{}=\"{}\"\n", k, v.replace('"', "\\\"")));
        } else {
            out.push_str(&format!("{}={}\n", k, v));
        }
    }
    out
}

/// 32 random bytes from the OS CSPRNG, URL-safe base64 without padding.
pub fn random_secret() -> Result<String> {
    let rng = ring::rand::SystemRandom::new();
    let mut bytes = [0u8; 32];
    rng.fill(&mut bytes)
        .map_err(|_| anyhow::anyhow!("Failed to generate random secret"))?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
}

/// Create each named secret under `secrets_dir` when absent. Existing files are never rewritten.
///
/// Returns the names that were generated.
pub async fn ensure_secret_files(secrets_dir: &Path, names: &[String]) -> Result<Vec<String>> {
    let mut created = Vec::new();
    for name in names {
        crate::utils::validation::validate_service_id(name)
            .with_context(|| format!("Invalid secret name '{}'", name))?;
        let path = secrets_dir.join(name);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            debug!(
                "[PHASE: provisioning] [STEP: secrets] Keeping existing secret {}",
                name
            );
            continue;
        }
        write_private_file(&path, random_secret()?.as_bytes(), "generate_secret").await?;
        created.push(name.clone());
    }
    if !created.is_empty() {
        info!(
            "[PHASE: provisioning] [STEP: secrets] Generated secrets: {}",
            created.join(", ")
        );
    }
    Ok(created)
}

pub const CERT_FILE: &str = "tls.crt";
pub const KEY_FILE: &str = "tls.key";

/// Self-signed certificate issuance through the `openssl` CLI.
pub struct OpensslIssuer;

pub fn openssl_args(cert: &Path, key: &Path, hostname: &str) -> Result<Vec<String>> {
    let cert = cert
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid certificate path: {:?}", cert))?;
    let key = key
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid key path: {:?}", key))?;
    Ok(vec![
        "req".to_string(),
        "-x509".to_string(),
        "-newkey".to_string(),
        "rsa:2048".to_string(),
        "-nodes".to_string(),
        "-keyout".to_string(),
        key.to_string(),
        "-out".to_string(),
        cert.to_string(),
        "-days".to_string(),
        "825".to_string(),
        "-subj".to_string(),
        format!("/CN={}", hostname),
        "-addext".to_string(),
        format!("subjectAltName=DNS:{}", hostname),
    ])
}

#[async_trait]
impl CertificateIssuer for OpensslIssuer {
    async fn ensure_certificate(&self, certs_dir: &Path, hostname: &str) -> Result<()> {
        let cert = certs_dir.join(CERT_FILE);
        let key = certs_dir.join(KEY_FILE);
        if cert.exists() && key.exists() {
            debug!(
                "[PHASE: provisioning] [STEP: certs] Certificate already present in {:?}",
                certs_dir
            );
            return Ok(());
        }

        info!(
            "[PHASE: provisioning] [STEP: certs] Issuing self-signed certificate for {}",
            hostname
        );
        let out = run_cmd_with_timeout(
            "openssl",
            &openssl_args(&cert, &key, hostname)?,
            Duration::from_secs(60),
            "openssl_req",
        )
        .await?;
        if !out.success() {
            anyhow::bail!("openssl failed to issue certificate: {}", out.stderr.trim());
        }
        set_mode(&key, 0o600).await?;
        Ok(())
    }
}
