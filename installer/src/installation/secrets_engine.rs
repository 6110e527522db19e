// Vault-compatible secrets engine client (HTTP API).
//
// Only the handful of endpoints the installer needs: seal status, init, unseal and KV reads and
// writes. KV v2 paths (`<mount>/data/<name>`) are detected by their `/data/` segment.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use serde_json::{json, Map, Value};
use std::time::Duration;

use crate::installation::{EngineInit, EngineStatus, SecretsEngine};

const TOKEN_HEADER: &str = "X-Vault-Token";

pub struct HttpSecretsEngine {
    base: String,
    client: reqwest::Client,
}

impl HttpSecretsEngine {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build secrets engine HTTP client")?;
        Ok(Self {
            base: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.base, path.trim_start_matches('/'))
    }

    async fn read_object(&self, token: &str, path: &str) -> Result<Option<Map<String, Value>>> {
        let resp = self
            .client
            .get(self.url(path))
            .header(TOKEN_HEADER, token)
            .send()
            .await
            .with_context(|| format!("secrets engine read failed (path={})", path))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            anyhow::bail!("secrets engine read {} returned HTTP {}", path, resp.status());
        }
        let body: Value = resp.json().await.context("invalid secrets engine JSON")?;
        Ok(extract_kv_data(&body, is_kv2(path)))
    }
}

fn is_kv2(path: &str) -> bool {
    path.contains("/data/")
}

/// KV v1 responses carry the secret in `data`; KV v2 nests it in `data.data`.
pub fn extract_kv_data(body: &Value, kv2: bool) -> Option<Map<String, Value>> {
    let data = body.get("data")?;
    let data = if kv2 { data.get("data")? } else { data };
    data.as_object().cloned()
}

#[derive(Debug, serde::Deserialize)]
struct SealStatus {
    initialized: bool,
    sealed: bool,
}

#[derive(Debug, serde::Deserialize)]
struct InitResponse {
    #[serde(default)]
    keys: Vec<String>,
    #[serde(default)]
    keys_base64: Vec<String>,
    root_token: String,
}

#[async_trait]
impl SecretsEngine for HttpSecretsEngine {
    async fn status(&self) -> Result<EngineStatus> {
        let resp = self
            .client
            .get(self.url("sys/seal-status"))
            .send()
            .await
            .context("secrets engine unreachable")?;
        if !resp.status().is_success() {
            anyhow::bail!("seal-status returned HTTP {}", resp.status());
        }
        let s: SealStatus = resp.json().await.context("invalid seal-status JSON")?;
        debug!(
            "[PHASE: starting-tiers] [STEP: engine] seal-status (initialized={}, sealed={})",
            s.initialized, s.sealed
        );
        Ok(EngineStatus {
            initialized: s.initialized,
            sealed: s.sealed,
        })
    }

    async fn init(&self, shares: u8, threshold: u8) -> Result<EngineInit> {
        info!(
            "[PHASE: starting-tiers] [STEP: engine] Initializing secrets engine (shares={}, threshold={})",
            shares, threshold
        );
        let resp = self
            .client
            .put(self.url("sys/init"))
            .json(&json!({ "secret_shares": shares, "secret_threshold": threshold }))
            .send()
            .await
            .context("secrets engine init request failed")?;
        if !resp.status().is_success() {
            anyhow::bail!("sys/init returned HTTP {}", resp.status());
        }
        let parsed: InitResponse = resp.json().await.context("invalid sys/init JSON")?;
        let keys = if parsed.keys.is_empty() {
            parsed.keys_base64
        } else {
            parsed.keys
        };
        if keys.len() < threshold as usize {
            anyhow::bail!(
                "sys/init returned {} keys, fewer than the threshold {}",
                keys.len(),
                threshold
            );
        }
        Ok(EngineInit {
            unseal_keys: keys,
            root_token: parsed.root_token,
        })
    }

    async fn unseal(&self, key: &str) -> Result<bool> {
        let resp = self
            .client
            .put(self.url("sys/unseal"))
            .json(&json!({ "key": key }))
            .send()
            .await
            .context("secrets engine unseal request failed")?;
        if !resp.status().is_success() {
            anyhow::bail!("sys/unseal returned HTTP {}", resp.status());
        }
        let s: SealStatus = resp.json().await.context("invalid sys/unseal JSON")?;
        Ok(s.sealed)
    }

    async fn read(&self, token: &str, path: &str, key: &str) -> Result<Option<String>> {
        let obj = self.read_object(token, path).await?;
        Ok(obj.and_then(|m| m.get(key).map(value_to_string)))
    }

    async fn write(&self, token: &str, path: &str, key: &str, value: &str) -> Result<()> {
        // read-modify-write keeps sibling keys of the same secret
        let mut obj = self.read_object(token, path).await?.unwrap_or_default();
        obj.insert(key.to_string(), Value::String(value.to_string()));
        let body = if is_kv2(path) {
            json!({ "data": obj })
        } else {
            Value::Object(obj)
        };

        let resp = self
            .client
            .post(self.url(path))
            .header(TOKEN_HEADER, token)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("secrets engine write failed (path={})", path))?;
        if !resp.status().is_success() {
            anyhow::bail!("secrets engine write {} returned HTTP {}", path, resp.status());
        }
        Ok(())
    }
}

fn value_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
