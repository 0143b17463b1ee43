//! Reversible encryption for credential secrets
//!
//! Secrets are stored AES-256-GCM encrypted with a random 96-bit nonce
//! per encryption. The key-encryption-key is provided out of band (env
//! var or key file) and is never written next to the data. Encryption
//! must be reversible — the plaintext is recovered on demand at
//! selection time — so one-way hashing is not an option here.
//!
//! Blob format: `v1:` + base64(nonce ‖ ciphertext). The version prefix
//! allows a future KEK rotation to re-encrypt lazily.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use common::Secret;

use crate::error::{Error, Result};

/// Environment variable holding the base64-encoded 32-byte KEK.
pub const KEK_ENV_VAR: &str = "CREDENTIAL_KEK_BASE64";

const BLOB_PREFIX: &str = "v1:";
const NONCE_LEN: usize = 12;

/// AES-256-GCM cipher for credential secrets.
pub struct SecretCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretCipher")
            .field("cipher", &"<redacted>")
            .finish()
    }
}

impl SecretCipher {
    /// Build a cipher from a raw 32-byte key.
    pub fn from_key(key: [u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new_from_slice(&key).expect("32-byte key is always valid"),
        }
    }

    /// Build a cipher from a base64-encoded 32-byte key.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let raw = BASE64
            .decode(encoded.trim())
            .map_err(|e| Error::KeyInvalid(format!("key is not valid base64: {e}")))?;
        if raw.len() != 32 {
            return Err(Error::KeyInvalid(format!(
                "key must decode to exactly 32 bytes, got {}",
                raw.len()
            )));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&raw);
        Ok(Self::from_key(key))
    }

    /// Build a cipher from the `CREDENTIAL_KEK_BASE64` environment variable.
    pub fn from_env() -> Result<Self> {
        let encoded = std::env::var(KEK_ENV_VAR)
            .map_err(|_| Error::KeyInvalid(format!("missing {KEK_ENV_VAR}")))?;
        Self::from_base64(&encoded)
    }

    /// Encrypt a plaintext secret into a storable blob.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| Error::KeyInvalid("encryption failed".into()))?;

        let mut raw = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        raw.extend_from_slice(nonce.as_slice());
        raw.extend_from_slice(&ciphertext);
        Ok(format!("{BLOB_PREFIX}{}", BASE64.encode(raw)))
    }

    /// Decrypt a stored blob back into the plaintext secret.
    ///
    /// Any failure — wrong key, truncated blob, unknown version — maps
    /// to `NotDecryptable` so callers can surface it as a distinct
    /// condition instead of crashing.
    pub fn decrypt(&self, blob: &str) -> Result<Secret<String>> {
        let encoded = blob
            .strip_prefix(BLOB_PREFIX)
            .ok_or_else(|| Error::NotDecryptable("unknown blob version".into()))?;
        let raw = BASE64
            .decode(encoded)
            .map_err(|e| Error::NotDecryptable(format!("blob is not valid base64: {e}")))?;
        if raw.len() <= NONCE_LEN {
            return Err(Error::NotDecryptable("blob too short".into()));
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::NotDecryptable("decryption failed (wrong key?)".into()))?;
        let plaintext = String::from_utf8(plaintext)
            .map_err(|_| Error::NotDecryptable("decrypted secret is not valid UTF-8".into()))?;
        Ok(Secret::new(plaintext))
    }
}
