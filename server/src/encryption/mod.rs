//! Envelope encryption: short strings are AEAD-encrypted under per-record
//! DEKs, which are themselves stored wrapped by the process KEK.
//!
//! DEK unwrapping is amortized with an in-process cache. The cache is
//! best-effort: a miss or a racing double-unwrap only costs an extra KEK
//! round-trip, never correctness.

pub mod kek;

pub use kek::{kek_from_config, AwsKmsKek, GcpKmsKek, KekProvider, LocalKek};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use moka::sync::Cache;
use rand::RngCore;
use std::sync::Arc;
use std::time::Duration;
use zeroize::Zeroizing;

use crate::error::{Error, Result};

pub const DEK_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const DEK_CACHE_TTL: Duration = Duration::from_secs(300);
const DEK_CACHE_CAPACITY: u64 = 128;

pub struct EnvelopeCipher {
    kek: Arc<dyn KekProvider>,
    /// encrypted-DEK bytes -> plaintext DEK. Entries zeroize on eviction.
    dek_cache: Cache<Vec<u8>, Zeroizing<[u8; DEK_LEN]>>,
}

impl EnvelopeCipher {
    pub fn new(kek: Arc<dyn KekProvider>) -> Self {
        Self {
            kek,
            dek_cache: Cache::builder()
                .time_to_live(DEK_CACHE_TTL)
                .max_capacity(DEK_CACHE_CAPACITY)
                .build(),
        }
    }

    pub fn kek_name(&self) -> &'static str {
        self.kek.name()
    }

    /// Produce a fresh 256-bit DEK: the wrapped form goes to the database,
    /// the plaintext stays cached for immediate use.
    pub async fn generate_dek(&self) -> Result<(Vec<u8>, Zeroizing<[u8; DEK_LEN]>)> {
        let mut dek = Zeroizing::new([0u8; DEK_LEN]);
        rand::rngs::OsRng.fill_bytes(&mut *dek);

        let encrypted_dek = self.kek.encrypt_dek(&dek[..]).await?;
        self.dek_cache.insert(encrypted_dek.clone(), dek.clone());
        Ok((encrypted_dek, dek))
    }

    async fn plaintext_dek(&self, encrypted_dek: &[u8]) -> Result<Zeroizing<[u8; DEK_LEN]>> {
        if let Some(dek) = self.dek_cache.get(encrypted_dek) {
            return Ok(dek);
        }

        let unwrapped = self.kek.decrypt_dek(encrypted_dek).await?;
        let dek: [u8; DEK_LEN] = unwrapped
            .as_slice()
            .try_into()
            .map_err(|_| Error::Kek(format!("unwrapped DEK is {} bytes", unwrapped.len())))?;
        let dek = Zeroizing::new(dek);
        self.dek_cache.insert(encrypted_dek.to_vec(), dek.clone());
        Ok(dek)
    }

    /// AEAD-encrypt `plaintext` under the DEK; returns base64(nonce || ct).
    /// There is no in-band version tag; scheme changes get a new DEK record.
    pub async fn encrypt(&self, plaintext: &str, encrypted_dek: &[u8]) -> Result<String> {
        let dek = self.plaintext_dek(encrypted_dek).await?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&dek[..]));

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|_| Error::Kek("AEAD encryption failed".into()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(out))
    }

    /// Reverse of [`encrypt`]. Any malformed or unauthentic input surfaces
    /// as `Error::CipherTampered` so the caller can alert.
    pub async fn decrypt(&self, ciphertext: &str, encrypted_dek: &[u8]) -> Result<String> {
        let raw = BASE64
            .decode(ciphertext)
            .map_err(|_| Error::CipherTampered)?;
        if raw.len() <= NONCE_LEN {
            return Err(Error::CipherTampered);
        }
        let (nonce_bytes, body) = raw.split_at(NONCE_LEN);

        let dek = self.plaintext_dek(encrypted_dek).await?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&dek[..]));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), body)
            .map_err(|_| Error::CipherTampered)?;

        String::from_utf8(plaintext).map_err(|_| Error::CipherTampered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Local KEK wrapper that counts unwrap calls, to observe the cache.
    struct CountingKek {
        inner: LocalKek,
        decrypts: AtomicUsize,
    }

    impl CountingKek {
        fn new() -> Self {
            Self {
                inner: LocalKek::new(&[42u8; 32]).unwrap(),
                decrypts: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl KekProvider for CountingKek {
        async fn encrypt_dek(&self, plaintext_dek: &[u8]) -> Result<Vec<u8>> {
            self.inner.encrypt_dek(plaintext_dek).await
        }

        async fn decrypt_dek(&self, encrypted_dek: &[u8]) -> Result<Vec<u8>> {
            self.decrypts.fetch_add(1, Ordering::SeqCst);
            self.inner.decrypt_dek(encrypted_dek).await
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    #[tokio::test]
    async fn encrypt_decrypt_round_trip() {
        let cipher = EnvelopeCipher::new(Arc::new(LocalKek::new(&[1u8; 32]).unwrap()));
        let (encrypted_dek, _) = cipher.generate_dek().await.unwrap();

        let ciphertext = cipher.encrypt("ghp_abc123", &encrypted_dek).await.unwrap();
        assert_ne!(ciphertext, "ghp_abc123");

        let plaintext = cipher.decrypt(&ciphertext, &encrypted_dek).await.unwrap();
        assert_eq!(plaintext, "ghp_abc123");
    }

    #[tokio::test]
    async fn fresh_nonce_per_encryption() {
        let cipher = EnvelopeCipher::new(Arc::new(LocalKek::new(&[1u8; 32]).unwrap()));
        let (encrypted_dek, _) = cipher.generate_dek().await.unwrap();

        let a = cipher.encrypt("same input", &encrypted_dek).await.unwrap();
        let b = cipher.encrypt("same input", &encrypted_dek).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn tampered_ciphertext_is_detected() {
        let cipher = EnvelopeCipher::new(Arc::new(LocalKek::new(&[1u8; 32]).unwrap()));
        let (encrypted_dek, _) = cipher.generate_dek().await.unwrap();

        let ciphertext = cipher.encrypt("secret", &encrypted_dek).await.unwrap();
        let mut raw = BASE64.decode(&ciphertext).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let tampered = BASE64.encode(raw);

        match cipher.decrypt(&tampered, &encrypted_dek).await {
            Err(Error::CipherTampered) => {}
            other => panic!("expected CipherTampered, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn garbage_ciphertext_is_tampered_not_a_panic() {
        let cipher = EnvelopeCipher::new(Arc::new(LocalKek::new(&[1u8; 32]).unwrap()));
        let (encrypted_dek, _) = cipher.generate_dek().await.unwrap();

        for bad in ["", "AA", "not base64 at all!!"] {
            assert!(matches!(
                cipher.decrypt(bad, &encrypted_dek).await,
                Err(Error::CipherTampered)
            ));
        }
    }

    #[tokio::test]
    async fn dek_cache_amortizes_kek_calls() {
        let kek = Arc::new(CountingKek::new());
        let cipher = EnvelopeCipher::new(kek.clone());

        // Wrap a DEK through a second cipher so this one has a cold cache.
        let other = EnvelopeCipher::new(kek.clone());
        let (encrypted_dek, _) = other.generate_dek().await.unwrap();

        let ct = cipher.encrypt("x", &encrypted_dek).await.unwrap();
        cipher.decrypt(&ct, &encrypted_dek).await.unwrap();
        cipher.encrypt("y", &encrypted_dek).await.unwrap();

        // One cold miss; everything after hits the cache.
        assert_eq!(kek.decrypts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wrong_dek_fails_authentication() {
        let cipher = EnvelopeCipher::new(Arc::new(LocalKek::new(&[1u8; 32]).unwrap()));
        let (dek_a, _) = cipher.generate_dek().await.unwrap();
        let (dek_b, _) = cipher.generate_dek().await.unwrap();

        let ciphertext = cipher.encrypt("secret", &dek_a).await.unwrap();
        assert!(matches!(
            cipher.decrypt(&ciphertext, &dek_b).await,
            Err(Error::CipherTampered)
        ));
    }
}
