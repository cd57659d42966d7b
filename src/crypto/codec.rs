//! Symmetric encryption and keyed integrity tags.
//!
//! # Algorithms
//!
//! - **Key Derivation**: Argon2id over the session key, random salt per blob
//! - **Encryption**: ChaCha20-Poly1305
//! - **Integrity Tag**: HMAC-SHA256 keyed with the password hash, hex encoded
//!
//! # Formats
//!
//! Ciphertext is `base64(salt ‖ nonce ‖ sealed)`. A tagged blob is the
//! 64-character hex tag followed by the ciphertext. The tag length does not
//! depend on the ciphertext length, so the split is always at a fixed offset.

use argon2::{Algorithm, Argon2, Params, Version};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, Key, KeyInit, Nonce};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::types::{Result, WalletError};

use super::session::SessionKey;

type HmacSha256 = Hmac<Sha256>;

// =============================================================================
// Constants
// =============================================================================

/// Argon2id memory cost in KiB (64 MB)
pub const ARGON2_MEMORY_KB: u32 = 65536;

/// Argon2id iteration count
pub const ARGON2_ITERATIONS: u32 = 3;

/// Argon2id parallelism (threads)
pub const ARGON2_PARALLELISM: u32 = 4;

/// Salt length for key derivation (16 bytes)
pub const SALT_LEN: usize = 16;

/// Nonce length for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_LEN: usize = 12;

/// ChaCha20-Poly1305 auth tag length (16 bytes)
pub const AUTH_TAG_LEN: usize = 16;

/// Length of the hex HMAC-SHA256 prefix on a tagged blob
pub const INTEGRITY_TAG_LEN: usize = 64;

// =============================================================================
// Parameters
// =============================================================================

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecParams {
    pub memory_kb: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl CodecParams {
    pub fn new(memory_kb: u32, iterations: u32, parallelism: u32) -> Self {
        Self {
            memory_kb,
            iterations,
            parallelism,
        }
    }
}

impl Default for CodecParams {
    fn default() -> Self {
        Self::new(ARGON2_MEMORY_KB, ARGON2_ITERATIONS, ARGON2_PARALLELISM)
    }
}

// =============================================================================
// Codec
// =============================================================================

/// Stateless encryption/tagging primitive. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct CryptoCodec {
    params: CodecParams,
}

impl CryptoCodec {
    pub fn new(params: CodecParams) -> Self {
        Self { params }
    }

    /// Encrypt UTF-8 plaintext under the given key.
    ///
    /// A fresh salt and nonce are drawn for every call, so encrypting the
    /// same plaintext twice yields different ciphertexts.
    pub fn encrypt(&self, plaintext: &str, key: &SessionKey) -> Result<String> {
        let salt: [u8; SALT_LEN] = generate_random_bytes();
        let nonce: [u8; NONCE_LEN] = generate_random_bytes();
        let encryption_key = self.derive_encryption_key(key, &salt)?;

        let cipher = ChaCha20Poly1305::new(Key::from_slice(encryption_key.as_slice()));
        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|e| WalletError::Crypto(format!("Encryption failed: {e}")))?;

        let mut out = Vec::with_capacity(SALT_LEN + NONCE_LEN + sealed.len());
        out.extend_from_slice(&salt);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(BASE64.encode(out))
    }

    /// Decrypt a ciphertext produced by [`CryptoCodec::encrypt`].
    ///
    /// Does not look at integrity tags; callers that hold a tagged blob use
    /// [`CryptoCodec::open`].
    pub fn decrypt(&self, ciphertext: &str, key: &SessionKey) -> Result<String> {
        let raw = BASE64
            .decode(ciphertext)
            .map_err(|e| WalletError::Crypto(format!("Invalid ciphertext encoding: {e}")))?;

        if raw.len() < SALT_LEN + NONCE_LEN + AUTH_TAG_LEN {
            return Err(WalletError::Crypto(format!(
                "Ciphertext too short: {} bytes",
                raw.len()
            )));
        }

        let (salt, rest) = raw.split_at(SALT_LEN);
        let (nonce, sealed) = rest.split_at(NONCE_LEN);
        let encryption_key = self.derive_encryption_key(key, salt)?;

        let cipher = ChaCha20Poly1305::new(Key::from_slice(encryption_key.as_slice()));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| WalletError::Crypto("Failed to decrypt (wrong password?)".into()))?;

        String::from_utf8(plaintext)
            .map_err(|e| WalletError::Crypto(format!("Decrypted payload is not UTF-8: {e}")))
    }

    /// Compute the hex HMAC-SHA256 tag of a ciphertext.
    pub fn tag(&self, ciphertext: &str, key: &SessionKey) -> Result<String> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(key.as_bytes())
            .map_err(|e| WalletError::Crypto(format!("HMAC key init failed: {e}")))?;
        mac.update(ciphertext.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Check that a tagged blob was produced under `key`.
    ///
    /// Fails closed: malformed input, a short blob or a mismatching tag all
    /// return `false`. The comparison is constant time.
    pub fn authentic(&self, tagged: &str, key: &SessionKey) -> bool {
        let Some((tag, ciphertext)) = split_tag(tagged) else {
            return false;
        };
        let Ok(expected) = hex::decode(tag) else {
            return false;
        };
        let Ok(mut mac) = <HmacSha256 as Mac>::new_from_slice(key.as_bytes()) else {
            return false;
        };
        mac.update(ciphertext.as_bytes());
        mac.verify_slice(&expected).is_ok()
    }

    /// Encrypt then prefix the integrity tag.
    pub fn seal(&self, plaintext: &str, key: &SessionKey) -> Result<String> {
        let ciphertext = self.encrypt(plaintext, key)?;
        let tag = self.tag(&ciphertext, key)?;
        Ok(format!("{tag}{ciphertext}"))
    }

    /// Authenticate a tagged blob, then decrypt its payload.
    pub fn open(&self, tagged: &str, key: &SessionKey) -> Result<String> {
        if !self.authentic(tagged, key) {
            return Err(WalletError::Authentication(
                "Integrity check failed (wrong password or tampered data)".into(),
            ));
        }
        let (_, ciphertext) = split_tag(tagged)
            .ok_or_else(|| WalletError::Crypto("Tagged blob too short".into()))?;
        self.decrypt(ciphertext, key)
    }

    fn derive_encryption_key(&self, key: &SessionKey, salt: &[u8]) -> Result<Zeroizing<[u8; 32]>> {
        let params = Params::new(
            self.params.memory_kb,
            self.params.iterations,
            self.params.parallelism,
            Some(32),
        )
        .map_err(|e| WalletError::Crypto(format!("Invalid Argon2 params: {e}")))?;

        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut derived = Zeroizing::new([0u8; 32]);
        argon2
            .hash_password_into(key.as_bytes(), salt, &mut *derived)
            .map_err(|e| WalletError::Crypto(format!("Key derivation failed: {e}")))?;

        Ok(derived)
    }
}

/// Split a tagged blob into `(tag, ciphertext)` at the fixed tag offset.
pub fn split_tag(tagged: &str) -> Option<(&str, &str)> {
    let tag = tagged.get(..INTEGRITY_TAG_LEN)?;
    let ciphertext = tagged.get(INTEGRITY_TAG_LEN..)?;
    Some((tag, ciphertext))
}

/// Generate cryptographically secure random bytes.
pub fn generate_random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

// =============================================================================
// Tests
// =============================================================================
