//! Identity creation strategies.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::generate_random_bytes;
use crate::types::{Result, WalletError};

/// Domain separator for secrets derived from a wallet signature.
const INTEREP_DOMAIN: &[u8] = b"keystead:interep-identity:v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityStrategy {
    /// Fresh random secret
    Random,
    /// Secret derived from a wallet signature over a fixed message, so the
    /// same wallet always recreates the same identity
    Interep,
}

/// Hex encoded identity secret. Zeroized on drop.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct IdentitySecret(String);

impl IdentitySecret {
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Public commitment for this secret.
    pub fn commitment(&self) -> String {
        hex::encode(Sha256::digest(self.0.as_bytes()))
    }
}

impl fmt::Debug for IdentitySecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("IdentitySecret(..)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityMetadata {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    pub strategy: IdentityStrategy,
}

/// Options accepted by `create-identity`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityOptions {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateIdentityRequest {
    pub strategy: IdentityStrategy,
    #[serde(default)]
    pub message_signature: Option<String>,
    #[serde(default)]
    pub options: IdentityOptions,
}

/// Build a secret for `request`.
pub fn generate_secret(request: &CreateIdentityRequest) -> Result<IdentitySecret> {
    match request.strategy {
        IdentityStrategy::Random => {
            let mut bytes = generate_random_bytes::<32>();
            let secret = IdentitySecret(hex::encode(bytes));
            bytes.zeroize();
            Ok(secret)
        }
        IdentityStrategy::Interep => {
            let signature = request
                .message_signature
                .as_deref()
                .filter(|s| !s.is_empty())
                .ok_or_else(|| {
                    WalletError::BadRequest("messageSignature is required for interep identities".into())
                })?;
            let mut hasher = Sha256::new();
            hasher.update(INTEREP_DOMAIN);
            hasher.update(signature.as_bytes());
            Ok(IdentitySecret(hex::encode(hasher.finalize())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(strategy: IdentityStrategy, signature: Option<&str>) -> CreateIdentityRequest {
        CreateIdentityRequest {
            strategy,
            message_signature: signature.map(str::to_string),
            options: IdentityOptions::default(),
        }
    }

    #[test]
    fn test_random_secrets_differ() {
        let a = generate_secret(&request(IdentityStrategy::Random, None)).unwrap();
        let b = generate_secret(&request(IdentityStrategy::Random, None)).unwrap();
        assert_ne!(a.commitment(), b.commitment());
        assert_eq!(a.expose().len(), 64);
    }

    #[test]
    fn test_interep_is_deterministic() {
        let a = generate_secret(&request(IdentityStrategy::Interep, Some("0xsig"))).unwrap();
        let b = generate_secret(&request(IdentityStrategy::Interep, Some("0xsig"))).unwrap();
        assert_eq!(a.commitment(), b.commitment());

        let err = generate_secret(&request(IdentityStrategy::Interep, None)).unwrap_err();
        assert!(matches!(err, WalletError::BadRequest(_)));
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let secret = generate_secret(&request(IdentityStrategy::Random, None)).unwrap();
        assert!(!format!("{secret:?}").contains(secret.expose()));
    }
}
