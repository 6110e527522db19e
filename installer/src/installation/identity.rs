// Keycloak-compatible identity provider admin client.
//
// Authenticates against the master realm with the generated admin password (read from
// `secrets/` on every call, since the file only exists after provisioning) and manages users in
// the application realm.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::IdentityConfig;
use crate::installation::{Identity, IdentityProvider};

pub struct KeycloakAdmin {
    base: String,
    realm: String,
    admin_user: String,
    password_file: PathBuf,
    client: reqwest::Client,
}

#[derive(Debug, serde::Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, serde::Deserialize)]
struct UserRepresentation {
    id: String,
    username: String,
    #[serde(default)]
    email: Option<String>,
}

impl KeycloakAdmin {
    pub fn new(cfg: &IdentityConfig, password_file: PathBuf) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .context("Failed to build identity provider HTTP client")?;
        Ok(Self {
            base: cfg.url.trim_end_matches('/').to_string(),
            realm: cfg.realm.clone(),
            admin_user: cfg.admin_user.clone(),
            password_file,
            client,
        })
    }

    fn users_url(&self) -> String {
        format!("{}/admin/realms/{}/users", self.base, self.realm)
    }

    async fn admin_token(&self) -> Result<String> {
        let password = tokio::fs::read_to_string(&self.password_file)
            .await
            .with_context(|| {
                format!(
                    "Failed to read identity admin password from {:?}",
                    self.password_file
                )
            })?;
        let url = format!(
            "{}/realms/master/protocol/openid-connect/token",
            self.base
        );
        let resp = self
            .client
            .post(&url)
            .form(&[
                ("grant_type", "password"),
                ("client_id", "admin-cli"),
                ("username", self.admin_user.as_str()),
                ("password", password.trim()),
            ])
            .send()
            .await
            .context("identity provider token request failed")?;
        if !resp.status().is_success() {
            anyhow::bail!("identity provider token endpoint returned HTTP {}", resp.status());
        }
        let token: TokenResponse = resp.json().await.context("invalid token response")?;
        Ok(token.access_token)
    }

    async fn find_by_username(&self, token: &str, username: &str) -> Result<Option<Identity>> {
        let resp = self
            .client
            .get(self.users_url())
            .bearer_auth(token)
            .query(&[("username", username), ("exact", "true")])
            .send()
            .await
            .context("identity lookup failed")?;
        if !resp.status().is_success() {
            anyhow::bail!("identity lookup returned HTTP {}", resp.status());
        }
        let users: Vec<UserRepresentation> = resp.json().await.context("invalid user list")?;
        Ok(users.into_iter().find(|u| u.username == username).map(Into::into))
    }
}

impl From<UserRepresentation> for Identity {
    fn from(u: UserRepresentation) -> Self {
        Identity {
            id: u.id,
            username: u.username,
            email: u.email,
        }
    }
}

/// Keycloak returns the new user's id only in the `Location` header.
pub fn id_from_location(location: &str) -> Option<String> {
    let id = location.trim_end_matches('/').rsplit('/').next()?;
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

#[async_trait]
impl IdentityProvider for KeycloakAdmin {
    async fn create_identity(&self, username: &str, email: &str) -> Result<String> {
        let token = self.admin_token().await?;
        let resp = self
            .client
            .post(self.users_url())
            .bearer_auth(&token)
            .json(&json!({
                "username": username,
                "email": email,
                "enabled": true,
                "emailVerified": false,
                "requiredActions": ["UPDATE_PASSWORD", "VERIFY_EMAIL"],
            }))
            .send()
            .await
            .context("identity create request failed")?;

        if resp.status() == reqwest::StatusCode::CONFLICT {
            info!(
                "[PHASE: starting-tiers] [STEP: identity] Identity '{}' already exists; reusing it",
                username
            );
            let existing = self
                .find_by_username(&token, username)
                .await?
                .ok_or_else(|| anyhow::anyhow!("identity '{}' reported as existing but not found", username))?;
            return Ok(existing.id);
        }
        if !resp.status().is_success() {
            anyhow::bail!("identity create returned HTTP {}", resp.status());
        }

        let location = resp
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        match location.as_deref().and_then(id_from_location) {
            Some(id) => Ok(id),
            None => {
                debug!("[PHASE: starting-tiers] [STEP: identity] No Location header; looking up id");
                self.find_by_username(&token, username)
                    .await?
                    .map(|i| i.id)
                    .ok_or_else(|| anyhow::anyhow!("created identity '{}' not found", username))
            }
        }
    }

    async fn list_identities(&self) -> Result<Vec<Identity>> {
        let token = self.admin_token().await?;
        let resp = self
            .client
            .get(self.users_url())
            .bearer_auth(&token)
            .query(&[("max", "1000")])
            .send()
            .await
            .context("identity list request failed")?;
        if !resp.status().is_success() {
            anyhow::bail!("identity list returned HTTP {}", resp.status());
        }
        let users: Vec<UserRepresentation> = resp.json().await.context("invalid user list")?;
        Ok(users.into_iter().map(Into::into).collect())
    }

    async fn delete_identity(&self, id: &str) -> Result<()> {
        let token = self.admin_token().await?;
        let resp = self
            .client
            .delete(format!("{}/{}", self.users_url(), id))
            .bearer_auth(&token)
            .send()
            .await
            .context("identity delete request failed")?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        if !resp.status().is_success() {
            anyhow::bail!("identity delete returned HTTP {}", resp.status());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_from_location_takes_last_segment() {
        assert_eq!(
            id_from_location("http://kc:8080/admin/realms/stack/users/5f1c-42"),
            Some("5f1c-42".to_string())
        );
        assert_eq!(id_from_location("http://kc/users/abc/"), Some("abc".to_string()));
        assert_eq!(id_from_location(""), None);
    }

    #[test]
    fn users_url_targets_realm() {
        let cfg = IdentityConfig::default();
        let kc = KeycloakAdmin::new(&cfg, PathBuf::from("/nonexistent")).unwrap();
        assert_eq!(kc.users_url(), "http://127.0.0.1:8080/admin/realms/stack/users");
    }

    #[tokio::test]
    async fn admin_token_requires_password_file() {
        let cfg = IdentityConfig::default();
        let kc = KeycloakAdmin::new(&cfg, PathBuf::from("/nonexistent/pw")).unwrap();
        let err = kc.admin_token().await.unwrap_err();
        assert!(err.to_string().contains("admin password"), "{}", err);
    }
}
