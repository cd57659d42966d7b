//! Typed access to a slot whose contents are sealed with a session key.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::crypto::{CryptoCodec, SessionKey};
use crate::types::{Result, WalletError};

use super::EncryptedStore;

/// A slot plus the codec used to seal it. Shared by every component that
/// keeps an encrypted JSON document (vault, approvals, history).
pub struct SealedSlot {
    store: Arc<dyn EncryptedStore>,
    codec: CryptoCodec,
}

impl SealedSlot {
    pub fn new(store: Arc<dyn EncryptedStore>, codec: CryptoCodec) -> Self {
        Self { store, codec }
    }

    /// Load and authenticate the document. An empty slot yields `T::default()`.
    pub async fn load<T>(&self, key: &SessionKey) -> Result<T>
    where
        T: DeserializeOwned + Default,
    {
        match self.store.get().await? {
            Some(blob) => {
                let plaintext = self.codec.open(&blob, key)?;
                serde_json::from_str(&plaintext)
                    .map_err(|e| WalletError::Storage(format!("Stored document is invalid: {e}")))
            }
            None => Ok(T::default()),
        }
    }

    pub async fn save<T: Serialize>(&self, value: &T, key: &SessionKey) -> Result<()> {
        let plaintext = serde_json::to_string(value)?;
        let blob = self.codec.seal(&plaintext, key)?;
        self.store.set(blob).await
    }

    pub async fn clear(&self) -> Result<()> {
        self.store.clear().await
    }

    /// Produce the backup form of this slot: the stored blob itself when it
    /// authenticates under `backup_key`, or a freshly sealed empty document
    /// when nothing was ever stored.
    pub async fn export<T>(&self, backup_key: &SessionKey) -> Result<String>
    where
        T: Serialize + Default,
    {
        match self.store.get().await? {
            Some(blob) if self.codec.authentic(&blob, backup_key) => Ok(blob),
            Some(_) => Err(WalletError::Authentication("Incorrect password".into())),
            None => {
                let empty = serde_json::to_string(&T::default())?;
                self.codec.seal(&empty, backup_key)
            }
        }
    }

    /// Authenticate and decode a backup blob.
    pub fn open_backup<T: DeserializeOwned>(&self, content: &str, backup_key: &SessionKey) -> Result<T> {
        let plaintext = self
            .codec
            .open(content, backup_key)
            .map_err(|_| WalletError::Authentication("Incorrect backup password".into()))?;
        serde_json::from_str(&plaintext)
            .map_err(|e| WalletError::CorruptedBackup(format!("component payload is invalid: {e}")))
    }
}
