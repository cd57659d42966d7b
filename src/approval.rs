//! Per-origin permissions.
//!
//! Reads go straight to the concurrent map. Mutations are serialised by
//! `write`, sealed under the session key and only applied to the map once
//! the write succeeded.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::backup::{Backupable, RestoreKeys};
use crate::crypto::SessionKey;
use crate::lock::LockSubscriber;
use crate::store::SealedSlot;
use crate::types::{Result, WalletError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRecord {
    pub host: String,
    pub approved: bool,
    pub can_skip_approve: bool,
}

impl PermissionRecord {
    fn absent(host: &str) -> Self {
        Self {
            host: host.to_string(),
            approved: false,
            can_skip_approve: false,
        }
    }
}

/// Partial update for [`ApprovalRegistry::set_permission`]. Unset fields
/// are left alone.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionPatch {
    #[serde(default)]
    pub approved: Option<bool>,
    #[serde(default)]
    pub can_skip_approve: Option<bool>,
}

pub struct ApprovalRegistry {
    slot: SealedSlot,
    records: DashMap<String, PermissionRecord>,
    /// Set while the records reflect the decrypted slot
    loaded: AtomicBool,
    write: Mutex<()>,
}

impl ApprovalRegistry {
    pub fn new(slot: SealedSlot) -> Self {
        Self {
            slot,
            records: DashMap::new(),
            loaded: AtomicBool::new(false),
            write: Mutex::new(()),
        }
    }

    /// Approve `host`. Upserts, so repeated calls only update the flag.
    pub async fn add(&self, host: &str, can_skip_approve: bool, key: &SessionKey) -> Result<PermissionRecord> {
        validate_host(host)?;
        let _write = self.write.lock().await;
        self.ensure_loaded()?;
        let record = PermissionRecord {
            host: host.to_string(),
            approved: true,
            can_skip_approve,
        };
        let mut next = self.records();
        upsert(&mut next, record.clone());
        self.commit(next, key).await?;
        info!(host, can_skip_approve, "Host approved");
        Ok(record)
    }

    pub fn is_approved(&self, host: &str) -> bool {
        self.records.get(host).map(|r| r.approved).unwrap_or(false)
    }

    /// Record for `host`, or an unapproved default when there is none.
    pub fn get_permission(&self, host: &str) -> PermissionRecord {
        self.records
            .get(host)
            .map(|r| r.value().clone())
            .unwrap_or_else(|| PermissionRecord::absent(host))
    }

    pub async fn set_permission(
        &self,
        host: &str,
        patch: PermissionPatch,
        key: &SessionKey,
    ) -> Result<PermissionRecord> {
        validate_host(host)?;
        let _write = self.write.lock().await;
        self.ensure_loaded()?;
        let mut record = self.get_permission(host);
        if let Some(approved) = patch.approved {
            record.approved = approved;
        }
        if let Some(can_skip) = patch.can_skip_approve {
            record.can_skip_approve = can_skip;
        }
        let mut next = self.records();
        upsert(&mut next, record.clone());
        self.commit(next, key).await?;
        debug!(host, ?record, "Host permission updated");
        Ok(record)
    }

    /// Forget `host`. Returns whether it was known.
    pub async fn remove(&self, host: &str, key: &SessionKey) -> Result<bool> {
        let _write = self.write.lock().await;
        self.ensure_loaded()?;
        if !self.records.contains_key(host) {
            return Ok(false);
        }
        let next = self.records().into_iter().filter(|r| r.host != host).collect();
        self.commit(next, key).await?;
        info!(host, "Host removed");
        Ok(true)
    }

    /// Wipe every record. Only reachable through dev-mode methods.
    pub async fn clear(&self, key: &SessionKey) -> Result<()> {
        let _write = self.write.lock().await;
        self.ensure_loaded()?;
        self.commit(Vec::new(), key).await?;
        info!("All host approvals cleared");
        Ok(())
    }

    /// Snapshot sorted by host.
    pub fn records(&self) -> Vec<PermissionRecord> {
        let mut records: Vec<_> = self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.host.cmp(&b.host));
        records
    }

    fn ensure_loaded(&self) -> Result<()> {
        if self.loaded.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(WalletError::Locked)
        }
    }

    /// Persist `next` and then make it the visible record set.
    async fn commit(&self, next: Vec<PermissionRecord>, key: &SessionKey) -> Result<()> {
        self.slot.save(&next, key).await?;
        self.records.retain(|host, _| next.iter().any(|r| &r.host == host));
        for record in next {
            self.records.insert(record.host.clone(), record);
        }
        Ok(())
    }
}

fn upsert(records: &mut Vec<PermissionRecord>, record: PermissionRecord) {
    match records.iter_mut().find(|r| r.host == record.host) {
        Some(existing) => *existing = record,
        None => records.push(record),
    }
}

fn validate_host(host: &str) -> Result<()> {
    if host.trim().is_empty() {
        return Err(WalletError::BadRequest("host must not be empty".into()));
    }
    Ok(())
}

#[async_trait]
impl LockSubscriber for ApprovalRegistry {
    fn name(&self) -> &'static str {
        "approval_registry"
    }

    async fn on_unlocked(&self, key: &SessionKey) -> Result<()> {
        let stored: Vec<PermissionRecord> = self.slot.load(key).await?;
        let _write = self.write.lock().await;
        self.records.clear();
        for record in stored {
            self.records.insert(record.host.clone(), record);
        }
        self.loaded.store(true, Ordering::Release);
        debug!(hosts = self.records.len(), "Approvals loaded");
        Ok(())
    }

    async fn on_locked(&self) {
        let _write = self.write.lock().await;
        self.loaded.store(false, Ordering::Release);
        self.records.clear();
    }
}

#[async_trait]
impl Backupable for ApprovalRegistry {
    async fn export_backup(&self, backup_key: &SessionKey) -> Result<Option<String>> {
        let _write = self.write.lock().await;
        self.slot
            .export::<Vec<PermissionRecord>>(backup_key)
            .await
            .map(Some)
    }

    fn check_backup(&self, content: &str, backup_key: &SessionKey) -> Result<()> {
        self.slot
            .open_backup::<Vec<PermissionRecord>>(content, backup_key)
            .map(|_| ())
    }

    async fn import_backup(&self, content: &str, keys: &RestoreKeys) -> Result<()> {
        let uploaded: Vec<PermissionRecord> = self.slot.open_backup(content, &keys.backup)?;

        let _write = self.write.lock().await;
        let mut stored: Vec<PermissionRecord> = if self.loaded.load(Ordering::Acquire) {
            self.records()
        } else {
            self.slot.load(&keys.target).await?
        };
        for record in uploaded {
            upsert(&mut stored, record);
        }
        stored.sort_by(|a, b| a.host.cmp(&b.host));
        self.slot.save(&stored, &keys.target).await?;

        if self.loaded.load(Ordering::Acquire) {
            for record in &stored {
                self.records.insert(record.host.clone(), record.clone());
            }
        }
        info!(hosts = stored.len(), "Approvals restored from backup");
        Ok(())
    }
}
