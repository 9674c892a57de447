//! Key-encryption-key providers.
//!
//! A KEK never touches payload data: it only wraps and unwraps 256-bit DEKs.
//! Three adapters share the same surface so the cipher is indifferent to
//! where the root key material lives.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::RngCore;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::{Config, KekProviderKind};
use crate::error::{Error, Result};

pub const KEK_KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

#[async_trait]
pub trait KekProvider: Send + Sync {
    async fn encrypt_dek(&self, plaintext_dek: &[u8]) -> Result<Vec<u8>>;

    async fn decrypt_dek(&self, encrypted_dek: &[u8]) -> Result<Vec<u8>>;

    fn name(&self) -> &'static str;
}

/// Build the configured KEK adapter. Misconfiguration was already rejected
/// by `Config::from_env`, so missing fields here are internal errors.
pub fn kek_from_config(config: &Config) -> Result<Arc<dyn KekProvider>> {
    match config.encryption_kek_provider {
        KekProviderKind::Local => {
            let kek = LocalKek::from_config(
                config.encryption_kek_local_key.as_deref(),
                config.encryption_kek_local_key_file.as_deref(),
            )?;
            Ok(Arc::new(kek))
        }
        KekProviderKind::GcpKms => {
            let key_name = config
                .encryption_gcp_kms_key_name
                .clone()
                .ok_or_else(|| Error::Kek("GCP KMS key name missing".into()))?;
            Ok(Arc::new(GcpKmsKek::new(key_name)))
        }
        KekProviderKind::AwsKms => {
            let key_id = config
                .encryption_aws_kms_key_id
                .clone()
                .ok_or_else(|| Error::Kek("AWS KMS key id missing".into()))?;
            Ok(Arc::new(AwsKmsKek::new(key_id)))
        }
    }
}

// =============================================================================
// Local KEK
// =============================================================================

/// KEK from a base64-encoded 256-bit key in the environment or a key file.
/// Suitable for development and single-server deployments.
pub struct LocalKek {
    cipher: ChaCha20Poly1305,
}

impl LocalKek {
    pub fn new(key_bytes: &[u8]) -> Result<Self> {
        if key_bytes.len() != KEK_KEY_LEN {
            return Err(Error::Kek(format!(
                "local KEK must be {} bytes, got {}",
                KEK_KEY_LEN,
                key_bytes.len()
            )));
        }
        Ok(Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key_bytes)),
        })
    }

    pub fn from_config(key: Option<&str>, key_file: Option<&str>) -> Result<Self> {
        let encoded = match (key, key_file) {
            (Some(key), _) => key.trim().to_string(),
            (None, Some(path)) => std::fs::read_to_string(path)
                .map_err(|e| Error::Kek(format!("cannot read KEK key file {}: {}", path, e)))?
                .trim()
                .to_string(),
            (None, None) => {
                return Err(Error::Kek(
                    "ENCRYPTION_KEK_LOCAL_KEY or ENCRYPTION_KEK_LOCAL_KEY_FILE must be set"
                        .into(),
                ))
            }
        };
        let key_bytes = BASE64
            .decode(encoded)
            .map_err(|e| Error::Kek(format!("local KEK is not valid base64: {}", e)))?;
        Self::new(&key_bytes)
    }

    /// Generate a fresh base64-encoded local KEK, for operator bootstrap.
    pub fn generate_key() -> String {
        let mut key = [0u8; KEK_KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut key);
        BASE64.encode(key)
    }
}

#[async_trait]
impl KekProvider for LocalKek {
    async fn encrypt_dek(&self, plaintext_dek: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext_dek)
            .map_err(|_| Error::Kek("local KEK encryption failed".into()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    async fn decrypt_dek(&self, encrypted_dek: &[u8]) -> Result<Vec<u8>> {
        if encrypted_dek.len() <= NONCE_LEN {
            return Err(Error::Kek("encrypted DEK too short".into()));
        }
        let (nonce_bytes, ciphertext) = encrypted_dek.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| Error::Kek("local KEK decryption failed".into()))
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

// =============================================================================
// GCP KMS
// =============================================================================

const GCP_KMS_BASE: &str = "https://cloudkms.googleapis.com/v1";
const GCP_METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

#[derive(Debug, Deserialize)]
struct GcpAccessToken {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct GcpEncryptResponse {
    ciphertext: String,
}

#[derive(Debug, Deserialize)]
struct GcpDecryptResponse {
    plaintext: String,
}

/// KEK via Google Cloud KMS (REST), authenticated with the instance
/// metadata-server token.
pub struct GcpKmsKek {
    key_name: String,
    http: reqwest::Client,
    token: tokio::sync::Mutex<Option<(String, Instant)>>,
}

impl GcpKmsKek {
    pub fn new(key_name: String) -> Self {
        Self {
            key_name,
            http: reqwest::Client::new(),
            token: tokio::sync::Mutex::new(None),
        }
    }

    async fn access_token(&self) -> Result<String> {
        let mut cached = self.token.lock().await;
        if let Some((token, deadline)) = cached.as_ref() {
            if *deadline > Instant::now() {
                return Ok(token.clone());
            }
        }

        let response = self
            .http
            .get(GCP_METADATA_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| Error::Kek(format!("metadata token fetch failed: {}", e)))?;
        let token: GcpAccessToken = response
            .error_for_status()
            .map_err(|e| Error::Kek(format!("metadata token fetch failed: {}", e)))?
            .json()
            .await
            .map_err(|e| Error::Kek(format!("metadata token parse failed: {}", e)))?;

        // Refresh one minute before the advertised expiry.
        let deadline = Instant::now() + Duration::from_secs(token.expires_in.saturating_sub(60));
        debug!("refreshed GCP metadata access token");
        *cached = Some((token.access_token.clone(), deadline));
        Ok(token.access_token)
    }

    async fn call(&self, action: &str, body: serde_json::Value) -> Result<serde_json::Value> {
        let token = self.access_token().await?;
        let url = format!("{}/{}:{}", GCP_KMS_BASE, self.key_name, action);
        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Kek(format!("GCP KMS {} failed: {}", action, e)))?;
        response
            .error_for_status()
            .map_err(|e| Error::Kek(format!("GCP KMS {} failed: {}", action, e)))?
            .json()
            .await
            .map_err(|e| Error::Kek(format!("GCP KMS {} parse failed: {}", action, e)))
    }
}

#[async_trait]
impl KekProvider for GcpKmsKek {
    async fn encrypt_dek(&self, plaintext_dek: &[u8]) -> Result<Vec<u8>> {
        let body = serde_json::json!({ "plaintext": BASE64.encode(plaintext_dek) });
        let value = self.call("encrypt", body).await?;
        let response: GcpEncryptResponse = serde_json::from_value(value)
            .map_err(|e| Error::Kek(format!("GCP KMS encrypt parse failed: {}", e)))?;
        BASE64
            .decode(response.ciphertext)
            .map_err(|e| Error::Kek(format!("GCP KMS returned bad ciphertext: {}", e)))
    }

    async fn decrypt_dek(&self, encrypted_dek: &[u8]) -> Result<Vec<u8>> {
        let body = serde_json::json!({ "ciphertext": BASE64.encode(encrypted_dek) });
        let value = self.call("decrypt", body).await?;
        let response: GcpDecryptResponse = serde_json::from_value(value)
            .map_err(|e| Error::Kek(format!("GCP KMS decrypt parse failed: {}", e)))?;
        BASE64
            .decode(response.plaintext)
            .map_err(|e| Error::Kek(format!("GCP KMS returned bad plaintext: {}", e)))
    }

    fn name(&self) -> &'static str {
        "gcp_kms"
    }
}

// =============================================================================
// AWS KMS
// =============================================================================

/// KEK via AWS KMS. Credentials come from the ambient AWS environment
/// (instance profile, env vars, shared config).
pub struct AwsKmsKek {
    key_id: String,
    client: tokio::sync::OnceCell<aws_sdk_kms::Client>,
}

impl AwsKmsKek {
    pub fn new(key_id: String) -> Self {
        Self {
            key_id,
            client: tokio::sync::OnceCell::new(),
        }
    }

    async fn client(&self) -> &aws_sdk_kms::Client {
        self.client
            .get_or_init(|| async {
                let config =
                    aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
                aws_sdk_kms::Client::new(&config)
            })
            .await
    }
}

#[async_trait]
impl KekProvider for AwsKmsKek {
    async fn encrypt_dek(&self, plaintext_dek: &[u8]) -> Result<Vec<u8>> {
        let response = self
            .client()
            .await
            .encrypt()
            .key_id(&self.key_id)
            .plaintext(aws_sdk_kms::primitives::Blob::new(plaintext_dek))
            .send()
            .await
            .map_err(|e| Error::Kek(format!("AWS KMS encrypt failed: {}", e)))?;
        let blob = response
            .ciphertext_blob()
            .ok_or_else(|| Error::Kek("AWS KMS encrypt returned no ciphertext".into()))?;
        Ok(blob.as_ref().to_vec())
    }

    async fn decrypt_dek(&self, encrypted_dek: &[u8]) -> Result<Vec<u8>> {
        let response = self
            .client()
            .await
            .decrypt()
            .key_id(&self.key_id)
            .ciphertext_blob(aws_sdk_kms::primitives::Blob::new(encrypted_dek))
            .send()
            .await
            .map_err(|e| Error::Kek(format!("AWS KMS decrypt failed: {}", e)))?;
        let blob = response
            .plaintext()
            .ok_or_else(|| Error::Kek("AWS KMS decrypt returned no plaintext".into()))?;
        Ok(blob.as_ref().to_vec())
    }

    fn name(&self) -> &'static str {
        "aws_kms"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_kek_round_trip() {
        let encoded = LocalKek::generate_key();
        let key_bytes = BASE64.decode(&encoded).unwrap();
        let kek = LocalKek::new(&key_bytes).unwrap();

        let dek = [7u8; 32];
        let wrapped = kek.encrypt_dek(&dek).await.unwrap();
        assert_ne!(wrapped.as_slice(), dek.as_slice());

        let unwrapped = kek.decrypt_dek(&wrapped).await.unwrap();
        assert_eq!(unwrapped.as_slice(), dek.as_slice());
    }

    #[tokio::test]
    async fn local_kek_rejects_wrong_key() {
        let kek_a = LocalKek::new(&[1u8; 32]).unwrap();
        let kek_b = LocalKek::new(&[2u8; 32]).unwrap();

        let wrapped = kek_a.encrypt_dek(&[9u8; 32]).await.unwrap();
        assert!(kek_b.decrypt_dek(&wrapped).await.is_err());
    }

    #[test]
    fn local_kek_requires_256_bits() {
        assert!(LocalKek::new(&[0u8; 16]).is_err());
        assert!(LocalKek::new(&[0u8; 32]).is_ok());
    }
}
