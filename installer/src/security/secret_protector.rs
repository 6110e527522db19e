// Encryption at rest for captured credentials.
//
// - Deterministic "is encrypted?" detection via a prefix
// - Authenticated encryption using AES-256-GCM
// - Lazy, file-backed master key (base64, mode 0600) kept under `backups/`, which no restore or
//   teardown ever touches
//
// The key sits on the same host as the blobs it protects; this keeps credentials out of plain
// copies of the snapshot tree, not away from root.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{Context, Result};
use base64::Engine;
use log::debug;
use ring::rand::{SecureRandom, SystemRandom};
use std::path::{Path, PathBuf};
use tokio::sync::OnceCell;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

const ENC_PREFIX: &str = "ENCv1:";
const KEY_BYTES: usize = 32;
const NONCE_BYTES: usize = 12;

pub const KEY_FILE: &str = "credentials.key";

#[derive(Debug)]
pub struct SecretProtector {
    key_path: PathBuf,
    key: OnceCell<[u8; KEY_BYTES]>,
}

impl SecretProtector {
    pub fn new(key_path: PathBuf) -> Self {
        Self {
            key_path,
            key: OnceCell::new(),
        }
    }

    pub fn is_encrypted(&self, value: &str) -> bool {
        value.starts_with(ENC_PREFIX)
    }

    pub async fn encrypt(&self, plaintext: &[u8]) -> Result<String> {
        let key = *self.get_or_init_key().await?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|_| anyhow::anyhow!("Internal error: invalid AES-256 key length"))?;

        let mut nonce_bytes = [0u8; NONCE_BYTES];
        SystemRandom::new()
            .fill(&mut nonce_bytes)
            .map_err(|_| anyhow::anyhow!("Failed to generate nonce"))?;

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| anyhow::anyhow!("Credential encryption failed"))?;

        // nonce || ciphertext (ciphertext includes the GCM tag)
        let mut blob = Vec::with_capacity(NONCE_BYTES + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);

        Ok(format!(
            "{}{}",
            ENC_PREFIX,
            base64::engine::general_purpose::STANDARD.encode(blob)
        ))
    }

    pub async fn decrypt(&self, value: &str) -> Result<Vec<u8>> {
        let encoded = value
            .trim()
            .strip_prefix(ENC_PREFIX)
            .ok_or_else(|| anyhow::anyhow!("Value is not an {} blob", ENC_PREFIX))?;

        let blob = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .context("Failed to base64-decode encrypted credentials")?;
        if blob.len() < NONCE_BYTES {
            anyhow::bail!("Encrypted credential blob is too short");
        }

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_BYTES);
        let key = *self.get_or_init_key().await?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|_| anyhow::anyhow!("Internal error: invalid AES-256 key length"))?;

        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| anyhow::anyhow!("Credential decryption failed (wrong key or corrupted blob)"))
    }

    async fn load_key(&self) -> Result<[u8; KEY_BYTES]> {
        let bytes = tokio::fs::read(&self.key_path)
            .await
            .with_context(|| format!("Failed to read credential key file: {:?}", self.key_path))?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(String::from_utf8_lossy(&bytes).trim())
            .context("Failed to decode credential key file (base64)")?;
        if decoded.len() != KEY_BYTES {
            anyhow::bail!("Credential key file has invalid length (expected {KEY_BYTES} bytes)");
        }
        let mut key = [0u8; KEY_BYTES];
        key.copy_from_slice(&decoded);
        Ok(key)
    }

    async fn get_or_init_key(&self) -> Result<&[u8; KEY_BYTES]> {
        self.key
            .get_or_try_init(|| async {
                if tokio::fs::try_exists(&self.key_path).await.unwrap_or(false) {
                    return self.load_key().await;
                }

                if let Some(parent) = self.key_path.parent() {
                    tokio::fs::create_dir_all(parent).await.with_context(|| {
                        format!("Failed to create credential key directory: {:?}", parent)
                    })?;
                }

                let mut key_bytes = [0u8; KEY_BYTES];
                SystemRandom::new()
                    .fill(&mut key_bytes)
                    .map_err(|_| anyhow::anyhow!("Failed to generate credential key"))?;

                let encoded = base64::engine::general_purpose::STANDARD.encode(key_bytes);
                let write_action = || async {
                    let mut opts = tokio::fs::OpenOptions::new();
                    opts.write(true).create_new(true);
                    #[cfg(unix)]
                    opts.mode(0o600);
                    let mut file = opts.open(&self.key_path).await.with_context(|| {
                        format!("Failed to create credential key file: {:?}", self.key_path)
                    })?;
                    use tokio::io::AsyncWriteExt;
                    file.write_all(encoded.as_bytes()).await?;
                    file.flush().await?;
                    Ok::<(), anyhow::Error>(())
                };

                let retry_strategy = ExponentialBackoff::from_millis(50)
                    .factor(2)
                    .max_delay(std::time::Duration::from_millis(750))
                    .take(3)
                    .map(jitter);

                if let Err(e) =
                    RetryIf::spawn(retry_strategy, write_action, is_transient_io_error).await
                {
                    // Lost a create race: the other writer's key wins.
                    if tokio::fs::try_exists(&self.key_path).await.unwrap_or(false) {
                        debug!(
                            "[PHASE: backing-up] [STEP: credentials] Key file appeared concurrently; reloading ({:#})",
                            e
                        );
                        return self.load_key().await;
                    }
                    return Err(e);
                }
                Ok(key_bytes)
            })
            .await
    }
}

fn is_transient_io_error(err: &anyhow::Error) -> bool {
    let msg = format!("{:#}", err).to_ascii_lowercase();
    msg.contains("resource busy") || msg.contains("interrupted") || msg.contains("temporarily")
}

/// Key path for an installation: `<root>/backups/credentials.key`.
pub fn default_key_path(backups_dir: &Path) -> PathBuf {
    backups_dir.join(KEY_FILE)
}
