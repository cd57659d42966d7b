//! Operation history.
//!
//! A sealed, append-only log of user-visible operations (identity
//! lifecycle, backups). Only kept while unlocked.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::backup::{Backupable, RestoreKeys};
use crate::crypto::SessionKey;
use crate::identity::IdentityView;
use crate::lock::LockSubscriber;
use crate::store::SealedSlot;
use crate::types::{Result, WalletError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    CreateIdentity,
    DeleteIdentity,
    DeleteAllIdentities,
    DownloadBackup,
    UploadBackup,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: OperationType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commitment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub struct OperationHistory {
    slot: SealedSlot,
    /// `None` while locked
    operations: Mutex<Option<Vec<Operation>>>,
}

impl OperationHistory {
    pub fn new(slot: SealedSlot) -> Self {
        Self {
            slot,
            operations: Mutex::new(None),
        }
    }

    /// Append an entry. Skipped while locked.
    pub async fn track(
        &self,
        kind: OperationType,
        identity: Option<&IdentityView>,
        key: &SessionKey,
    ) -> Result<()> {
        let mut guard = self.operations.lock().await;
        let Some(operations) = guard.as_ref() else {
            debug!(?kind, "History is locked, operation not tracked");
            return Ok(());
        };

        let mut next = operations.clone();
        next.push(Operation {
            id: Uuid::new_v4().to_string(),
            kind,
            commitment: identity.map(|i| i.commitment.clone()),
            name: identity.map(|i| i.metadata.name.clone()),
            created_at: Utc::now(),
        });
        self.slot.save(&next, key).await?;
        *guard = Some(next);
        Ok(())
    }

    /// Newest first, optionally restricted to one type.
    pub async fn operations(&self, kind: Option<OperationType>) -> Result<Vec<Operation>> {
        let guard = self.operations.lock().await;
        let operations = guard.as_ref().ok_or(WalletError::Locked)?;
        let mut selected: Vec<_> = operations
            .iter()
            .rev()
            .filter(|op| kind.map_or(true, |k| op.kind == k))
            .cloned()
            .collect();
        selected.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(selected)
    }

    pub async fn remove(&self, id: &str, key: &SessionKey) -> Result<()> {
        let mut guard = self.operations.lock().await;
        let operations = guard.as_ref().ok_or(WalletError::Locked)?;
        let next: Vec<_> = operations.iter().filter(|op| op.id != id).cloned().collect();
        if next.len() == operations.len() {
            return Err(WalletError::NotFound(format!("operation {id}")));
        }
        self.slot.save(&next, key).await?;
        *guard = Some(next);
        Ok(())
    }

    pub async fn clear(&self, key: &SessionKey) -> Result<()> {
        let mut guard = self.operations.lock().await;
        if guard.is_none() {
            return Err(WalletError::Locked);
        }
        let next = Vec::new();
        self.slot.save(&next, key).await?;
        *guard = Some(next);
        info!("History cleared");
        Ok(())
    }
}

#[async_trait]
impl LockSubscriber for OperationHistory {
    fn name(&self) -> &'static str {
        "operation_history"
    }

    async fn on_unlocked(&self, key: &SessionKey) -> Result<()> {
        let operations: Vec<Operation> = self.slot.load(key).await?;
        *self.operations.lock().await = Some(operations);
        Ok(())
    }

    async fn on_locked(&self) {
        *self.operations.lock().await = None;
    }
}

#[async_trait]
impl Backupable for OperationHistory {
    async fn export_backup(&self, backup_key: &SessionKey) -> Result<Option<String>> {
        let _guard = self.operations.lock().await;
        self.slot.export::<Vec<Operation>>(backup_key).await.map(Some)
    }

    fn check_backup(&self, content: &str, backup_key: &SessionKey) -> Result<()> {
        self.slot
            .open_backup::<Vec<Operation>>(content, backup_key)
            .map(|_| ())
    }

    async fn import_backup(&self, content: &str, keys: &RestoreKeys) -> Result<()> {
        let uploaded: Vec<Operation> = self.slot.open_backup(content, &keys.backup)?;

        let mut guard = self.operations.lock().await;
        let mut merged = match guard.as_ref() {
            Some(current) => current.clone(),
            None => self.slot.load(&keys.target).await?,
        };
        for op in uploaded {
            if !merged.iter().any(|existing| existing.id == op.id) {
                merged.push(op);
            }
        }
        self.slot.save(&merged, &keys.target).await?;
        if guard.is_some() {
            *guard = Some(merged);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CodecParams, CryptoCodec};
    use crate::identity::{IdentityMetadata, IdentityStrategy};
    use crate::store::testing::FlakyStore;
    use crate::store::InMemoryStore;
    use std::sync::Arc;

    fn history() -> OperationHistory {
        OperationHistory::new(SealedSlot::new(
            Arc::new(InMemoryStore::new()),
            CryptoCodec::new(CodecParams::new(8, 1, 1)),
        ))
    }

    fn view(name: &str) -> IdentityView {
        IdentityView {
            commitment: format!("c-{name}"),
            metadata: IdentityMetadata {
                name: name.into(),
                host: None,
                strategy: IdentityStrategy::Random,
            },
        }
    }

    #[tokio::test]
    async fn test_tracking_skipped_while_locked() {
        let history = history();
        let key = SessionKey::derive("pw");
        history
            .track(OperationType::DownloadBackup, None, &key)
            .await
            .unwrap();

        history.on_unlocked(&key).await.unwrap();
        assert!(history.operations(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_filter_remove_clear() {
        let history = history();
        let key = SessionKey::derive("pw");
        history.on_unlocked(&key).await.unwrap();

        history
            .track(OperationType::CreateIdentity, Some(&view("a")), &key)
            .await
            .unwrap();
        history
            .track(OperationType::DownloadBackup, None, &key)
            .await
            .unwrap();

        let created = history
            .operations(Some(OperationType::CreateIdentity))
            .await
            .unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].name.as_deref(), Some("a"));

        history.remove(&created[0].id, &key).await.unwrap();
        assert!(history.remove(&created[0].id, &key).await.is_err());
        assert_eq!(history.operations(None).await.unwrap().len(), 1);

        // persisted across a lock cycle
        history.on_locked().await;
        history.on_unlocked(&key).await.unwrap();
        assert_eq!(history.operations(None).await.unwrap().len(), 1);

        history.clear(&key).await.unwrap();
        assert!(history.operations(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_backup_merge_by_id() {
        let history = history();
        let key = SessionKey::derive("pw");
        history.on_unlocked(&key).await.unwrap();
        history
            .track(OperationType::CreateIdentity, Some(&view("a")), &key)
            .await
            .unwrap();
        let blob = history.export_backup(&key).await.unwrap().unwrap();

        let keys = RestoreKeys::new(SessionKey::derive("pw"), SessionKey::derive("pw"));
        history.import_backup(&blob, &keys).await.unwrap();
        history.import_backup(&blob, &keys).await.unwrap();
        assert_eq!(history.operations(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_write_is_not_remembered() {
        let key = SessionKey::derive("pw");
        let store = Arc::new(FlakyStore::default());
        let history = OperationHistory::new(SealedSlot::new(
            store.clone(),
            CryptoCodec::new(CodecParams::new(8, 1, 1)),
        ));
        history.on_unlocked(&key).await.unwrap();
        history
            .track(OperationType::DownloadBackup, None, &key)
            .await
            .unwrap();
        let kept = history.operations(None).await.unwrap();

        store.fail(true);
        assert!(history
            .track(OperationType::UploadBackup, None, &key)
            .await
            .is_err());
        assert!(history.remove(&kept[0].id, &key).await.is_err());
        assert!(history.clear(&key).await.is_err());
        assert_eq!(history.operations(None).await.unwrap(), kept);

        store.fail(false);
        history.on_locked().await;
        history.on_unlocked(&key).await.unwrap();
        assert_eq!(history.operations(None).await.unwrap(), kept);
    }
}
