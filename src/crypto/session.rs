//! Ephemeral session key.
//!
//! Derived from the user password at unlock time and held only in memory
//! while the wallet is unlocked. The bytes are zeroized when the last
//! reference is dropped.

use std::fmt;

use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Session key length (SHA-256 output)
pub const SESSION_KEY_LEN: usize = 32;

/// Password-derived secret used for sealing and integrity tags.
///
/// Deliberately not `Clone`: share it through `Arc<SessionKey>` so there is
/// exactly one copy of the material per unlock.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKey {
    bytes: [u8; SESSION_KEY_LEN],
}

impl SessionKey {
    /// Derive the key from a password (SHA-256 of the UTF-8 bytes).
    pub fn derive(password: &str) -> Self {
        let digest = Sha256::digest(password.as_bytes());
        let mut bytes = [0u8; SESSION_KEY_LEN];
        bytes.copy_from_slice(&digest);
        Self { bytes }
    }

    /// Raw key bytes. Never log or persist these.
    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_LEN] {
        &self.bytes
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(<redacted>)")
    }
}
