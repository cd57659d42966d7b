//! Identity vault.
//!
//! The vault document (every identity plus the active pointer) lives sealed
//! in the `wallet` slot. It is decrypted once on unlock and cached until
//! lock. Every operation holds the cache mutex for its whole duration, so
//! mutations of the slot never interleave and a lock waits for in-flight
//! writes to finish with the key they captured.

pub mod factory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::backup::{Backupable, RestoreKeys};
use crate::crypto::SessionKey;
use crate::lock::LockSubscriber;
use crate::store::SealedSlot;
use crate::types::{Result, WalletError};

pub use factory::{
    generate_secret, CreateIdentityRequest, IdentityMetadata, IdentityOptions, IdentitySecret,
    IdentityStrategy,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub commitment: String,
    pub secret: IdentitySecret,
    pub metadata: IdentityMetadata,
}

impl Identity {
    pub fn new(secret: IdentitySecret, metadata: IdentityMetadata) -> Self {
        Self {
            commitment: secret.commitment(),
            secret,
            metadata,
        }
    }

    /// Form handed to the proof engine.
    pub fn serialize(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| WalletError::Internal(e.to_string()))
    }

    pub fn view(&self) -> IdentityView {
        IdentityView {
            commitment: self.commitment.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

/// Identity without its secret, safe to return to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityView {
    pub commitment: String,
    pub metadata: IdentityMetadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct VaultState {
    identities: Vec<Identity>,
    #[serde(default)]
    active: Option<String>,
}

impl VaultState {
    fn position(&self, commitment: &str) -> Option<usize> {
        self.identities.iter().position(|i| i.commitment == commitment)
    }

    fn get_mut(&mut self, commitment: &str) -> Result<&mut Identity> {
        self.identities
            .iter_mut()
            .find(|i| i.commitment == commitment)
            .ok_or_else(|| WalletError::NotFound(format!("identity {commitment}")))
    }

    /// Insert or overwrite the metadata of an existing commitment.
    fn merge(&mut self, identity: Identity) {
        match self.position(&identity.commitment) {
            Some(index) => self.identities[index].metadata = identity.metadata,
            None => self.identities.push(identity),
        }
    }
}

pub struct IdentityVault {
    slot: SealedSlot,
    cache: Mutex<Option<VaultState>>,
}

impl IdentityVault {
    pub fn new(slot: SealedSlot) -> Self {
        Self {
            slot,
            cache: Mutex::new(None),
        }
    }

    /// Create a new identity, make it active if none is, and persist.
    pub async fn create(&self, request: &CreateIdentityRequest, key: &SessionKey) -> Result<IdentityView> {
        let secret = generate_secret(request)?;
        let view = self
            .mutate(key, |state| {
                let name = request
                    .options
                    .name
                    .clone()
                    .filter(|n| !n.trim().is_empty())
                    .unwrap_or_else(|| format!("Account # {}", state.identities.len()));
                let identity = Identity::new(
                    secret,
                    IdentityMetadata {
                        name,
                        host: request.options.host.clone(),
                        strategy: request.strategy,
                    },
                );
                if state.position(&identity.commitment).is_some() {
                    return Err(WalletError::InvalidState("Identity already exists".into()));
                }

                let view = identity.view();
                state.identities.push(identity);
                state.active.get_or_insert_with(|| view.commitment.clone());
                Ok(view)
            })
            .await?;

        info!(commitment = %view.commitment, strategy = ?request.strategy, "Identity created");
        Ok(view)
    }

    /// Insert an existing identity. Returns `false` if the commitment is
    /// already present.
    pub async fn insert(&self, identity: Identity, key: &SessionKey) -> Result<bool> {
        let mut cache = self.cache.lock().await;
        if loaded(&cache)?.position(&identity.commitment).is_some() {
            return Ok(false);
        }
        let mut next = loaded(&cache)?.clone();
        next.active.get_or_insert_with(|| identity.commitment.clone());
        next.identities.push(identity);
        self.persist(&next, key).await?;
        *cache = Some(next);
        Ok(true)
    }

    pub async fn identities(&self) -> Result<Vec<IdentityView>> {
        let cache = self.cache.lock().await;
        Ok(loaded(&cache)?.identities.iter().map(Identity::view).collect())
    }

    pub async fn commitments(&self) -> Result<Vec<String>> {
        let cache = self.cache.lock().await;
        Ok(loaded(&cache)?
            .identities
            .iter()
            .map(|i| i.commitment.clone())
            .collect())
    }

    /// The active identity including its secret.
    pub async fn active(&self) -> Result<Option<Identity>> {
        let cache = self.cache.lock().await;
        let state = loaded(&cache)?;
        Ok(state
            .active
            .as_deref()
            .and_then(|c| state.identities.iter().find(|i| i.commitment == c))
            .cloned())
    }

    pub async fn set_active(&self, commitment: &str, key: &SessionKey) -> Result<()> {
        self.mutate(key, |state| {
            if state.position(commitment).is_none() {
                return Err(WalletError::NotFound(format!("identity {commitment}")));
            }
            state.active = Some(commitment.to_string());
            Ok(())
        })
        .await?;
        debug!(commitment, "Active identity changed");
        Ok(())
    }

    pub async fn set_name(&self, commitment: &str, name: &str, key: &SessionKey) -> Result<()> {
        if name.trim().is_empty() {
            return Err(WalletError::BadRequest("Identity name must not be empty".into()));
        }
        self.mutate(key, |state| {
            state.get_mut(commitment)?.metadata.name = name.to_string();
            Ok(())
        })
        .await
    }

    /// Remove one identity. Clears the active pointer if it pointed there.
    pub async fn delete(&self, commitment: &str, key: &SessionKey) -> Result<IdentityView> {
        let removed = self
            .mutate(key, |state| {
                let index = state
                    .position(commitment)
                    .ok_or_else(|| WalletError::NotFound(format!("identity {commitment}")))?;
                let removed = state.identities.remove(index);
                if state.active.as_deref() == Some(commitment) {
                    state.active = None;
                }
                Ok(removed)
            })
            .await?;
        info!(commitment, "Identity deleted");
        Ok(removed.view())
    }

    /// Remove every identity. Returns how many were removed.
    pub async fn delete_all(&self, key: &SessionKey) -> Result<usize> {
        let count = self
            .mutate(key, |state| {
                let count = state.identities.len();
                state.identities.clear();
                state.active = None;
                Ok(count)
            })
            .await?;
        info!(count, "All identities deleted");
        Ok(count)
    }

    /// Apply `change` to a copy of the cached document, persist the copy and
    /// only then publish it. A failed write leaves the cache untouched.
    async fn mutate<T>(
        &self,
        key: &SessionKey,
        change: impl FnOnce(&mut VaultState) -> Result<T>,
    ) -> Result<T> {
        let mut cache = self.cache.lock().await;
        let mut next = loaded(&cache)?.clone();
        let out = change(&mut next)?;
        self.persist(&next, key).await?;
        *cache = Some(next);
        Ok(out)
    }

    async fn persist(&self, state: &VaultState, key: &SessionKey) -> Result<()> {
        self.slot.save(state, key).await
    }
}

fn loaded(cache: &Option<VaultState>) -> Result<&VaultState> {
    cache.as_ref().ok_or(WalletError::Locked)
}

#[async_trait]
impl LockSubscriber for IdentityVault {
    fn name(&self) -> &'static str {
        "identity_vault"
    }

    async fn on_unlocked(&self, key: &SessionKey) -> Result<()> {
        let state: VaultState = self.slot.load(key).await?;
        debug!(identities = state.identities.len(), "Vault decrypted");
        *self.cache.lock().await = Some(state);
        Ok(())
    }

    async fn on_locked(&self) {
        *self.cache.lock().await = None;
    }
}

#[async_trait]
impl Backupable for IdentityVault {
    async fn export_backup(&self, backup_key: &SessionKey) -> Result<Option<String>> {
        let _cache = self.cache.lock().await;
        self.slot.export::<VaultState>(backup_key).await.map(Some)
    }

    fn check_backup(&self, content: &str, backup_key: &SessionKey) -> Result<()> {
        self.slot.open_backup::<VaultState>(content, backup_key).map(|_| ())
    }

    async fn import_backup(&self, content: &str, keys: &RestoreKeys) -> Result<()> {
        let uploaded: VaultState = self.slot.open_backup(content, &keys.backup)?;

        let mut cache = self.cache.lock().await;
        let mut merged = match cache.as_ref() {
            Some(state) => state.clone(),
            None => self.slot.load(&keys.target).await?,
        };
        let count = uploaded.identities.len();
        for identity in uploaded.identities {
            merged.merge(identity);
        }
        if merged.active.is_none() {
            merged.active = uploaded
                .active
                .filter(|c| merged.position(c).is_some());
        }

        self.persist(&merged, &keys.target).await?;
        if cache.is_some() {
            *cache = Some(merged);
        }
        info!(restored = count, "Vault restored from backup");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CodecParams, CryptoCodec};
    use crate::store::testing::FlakyStore;
    use crate::store::InMemoryStore;
    use std::sync::Arc;

    fn vault() -> IdentityVault {
        IdentityVault::new(SealedSlot::new(
            Arc::new(InMemoryStore::new()),
            CryptoCodec::new(CodecParams::new(8, 1, 1)),
        ))
    }

    fn random(name: Option<&str>) -> CreateIdentityRequest {
        CreateIdentityRequest {
            strategy: IdentityStrategy::Random,
            message_signature: None,
            options: IdentityOptions {
                name: name.map(str::to_string),
                host: None,
            },
        }
    }

    async fn unlocked(key: &SessionKey) -> IdentityVault {
        let vault = vault();
        vault.on_unlocked(key).await.unwrap();
        vault
    }

    #[tokio::test]
    async fn test_locked_vault_refuses_reads() {
        let vault = vault();
        assert!(matches!(vault.identities().await, Err(WalletError::Locked)));
    }

    #[tokio::test]
    async fn test_create_names_and_activates() {
        let key = SessionKey::derive("pw");
        let vault = unlocked(&key).await;

        let first = vault.create(&random(None), &key).await.unwrap();
        let second = vault.create(&random(Some("Work")), &key).await.unwrap();

        assert_eq!(first.metadata.name, "Account # 0");
        assert_eq!(second.metadata.name, "Work");
        let active = vault.active().await.unwrap().unwrap();
        assert_eq!(active.commitment, first.commitment);
        assert_eq!(vault.commitments().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_state_survives_lock_cycle() {
        let key = SessionKey::derive("pw");
        let vault = unlocked(&key).await;
        let created = vault.create(&random(Some("Alpha")), &key).await.unwrap();

        vault.on_locked().await;
        assert!(vault.commitments().await.is_err());

        vault.on_unlocked(&key).await.unwrap();
        assert_eq!(vault.commitments().await.unwrap(), vec![created.commitment]);

        vault.on_locked().await;
        let err = vault.on_unlocked(&SessionKey::derive("other")).await.unwrap_err();
        assert!(matches!(err, WalletError::Authentication(_)));
    }

    #[tokio::test]
    async fn test_rename_delete_and_active_pointer() {
        let key = SessionKey::derive("pw");
        let vault = unlocked(&key).await;
        let a = vault.create(&random(None), &key).await.unwrap();
        let b = vault.create(&random(None), &key).await.unwrap();

        vault.set_name(&b.commitment, "Renamed", &key).await.unwrap();
        vault.set_active(&b.commitment, &key).await.unwrap();
        assert!(vault.set_active("missing", &key).await.is_err());

        vault.delete(&b.commitment, &key).await.unwrap();
        assert!(vault.active().await.unwrap().is_none());
        assert_eq!(vault.commitments().await.unwrap(), vec![a.commitment]);

        assert_eq!(vault.delete_all(&key).await.unwrap(), 1);
        assert!(vault.identities().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_insert_is_unique_by_commitment() {
        let key = SessionKey::derive("pw");
        let vault = unlocked(&key).await;
        let secret = generate_secret(&random(None)).unwrap();
        let identity = Identity::new(
            secret,
            IdentityMetadata {
                name: "Imported".into(),
                host: Some("https://app.example".into()),
                strategy: IdentityStrategy::Random,
            },
        );

        assert!(vault.insert(identity.clone(), &key).await.unwrap());
        assert!(!vault.insert(identity, &key).await.unwrap());
        assert_eq!(vault.identities().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_backup_merge_overwrites_metadata() {
        let key = SessionKey::derive("pw");
        let vault = unlocked(&key).await;
        let created = vault.create(&random(Some("Alpha")), &key).await.unwrap();
        let blob = vault.export_backup(&key).await.unwrap().unwrap();

        vault.set_name(&created.commitment, "Beta", &key).await.unwrap();
        let keys = RestoreKeys::new(SessionKey::derive("pw"), SessionKey::derive("pw"));
        vault.import_backup(&blob, &keys).await.unwrap();
        vault.import_backup(&blob, &keys).await.unwrap();

        let identities = vault.identities().await.unwrap();
        assert_eq!(identities.len(), 1);
        assert_eq!(identities[0].metadata.name, "Alpha");
    }

    #[tokio::test]
    async fn test_serialize_carries_secret() {
        let key = SessionKey::derive("pw");
        let vault = unlocked(&key).await;
        vault.create(&random(None), &key).await.unwrap();

        let active = vault.active().await.unwrap().unwrap();
        let json: serde_json::Value = serde_json::from_str(&active.serialize().unwrap()).unwrap();
        assert_eq!(json["secret"], active.secret.expose());
        assert_eq!(json["commitment"], active.commitment);
    }

    #[tokio::test]
    async fn test_failed_write_leaves_cache_matching_disk() {
        let key = SessionKey::derive("pw");
        let store = Arc::new(FlakyStore::default());
        let vault = IdentityVault::new(SealedSlot::new(
            store.clone(),
            CryptoCodec::new(CodecParams::new(8, 1, 1)),
        ));
        vault.on_unlocked(&key).await.unwrap();
        let kept = vault.create(&random(Some("Kept")), &key).await.unwrap();

        store.fail(true);
        let err = vault.create(&random(Some("Lost")), &key).await.unwrap_err();
        assert!(matches!(err, WalletError::Storage(_)));
        assert!(vault.set_name(&kept.commitment, "Other", &key).await.is_err());
        assert!(vault.delete(&kept.commitment, &key).await.is_err());
        assert!(vault.delete_all(&key).await.is_err());

        assert_eq!(vault.identities().await.unwrap(), vec![kept.clone()]);
        assert_eq!(
            vault.active().await.unwrap().map(|i| i.commitment),
            Some(kept.commitment.clone())
        );

        store.fail(false);
        vault.on_locked().await;
        vault.on_unlocked(&key).await.unwrap();
        assert_eq!(vault.identities().await.unwrap(), vec![kept]);
    }
}
