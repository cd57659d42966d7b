//! Portable encrypted backups.
//!
//! A backup is a JSON manifest mapping component keys to sealed blobs:
//!
//! ```json
//! { "lock": "<tag><ciphertext>", "wallet": "<tag><ciphertext>", "approval": null }
//! ```
//!
//! `lock` and `wallet` are mandatory. Every blob is sealed under the
//! password that was active when the backup was taken (the backup
//! password); restore re-seals under the current wallet password.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::crypto::{CryptoCodec, SessionKey};
use crate::lock::LockController;
use crate::onboarding::{InitializationStep, InitializationTracker};
use crate::store::keys;
use crate::types::{Result, WalletError};

/// Manifest as written to a backup file.
pub type BackupManifest = BTreeMap<String, Option<String>>;

/// Keys needed to restore one component.
pub struct RestoreKeys {
    /// Opens the uploaded blobs
    pub backup: SessionKey,
    /// Seals whatever ends up persisted locally
    pub target: SessionKey,
}

impl RestoreKeys {
    pub fn new(backup: SessionKey, target: SessionKey) -> Self {
        Self { backup, target }
    }
}

/// A component that takes part in backups.
#[async_trait]
pub trait Backupable: Send + Sync {
    /// Sealed snapshot under `backup_key`, or `None` when there is nothing
    /// to export.
    async fn export_backup(&self, backup_key: &SessionKey) -> Result<Option<String>>;

    /// Decode a sealed snapshot without touching local state. Upload runs
    /// this for every component before the first import.
    fn check_backup(&self, content: &str, backup_key: &SessionKey) -> Result<()>;

    /// Merge a sealed snapshot into local state.
    async fn import_backup(&self, content: &str, keys: &RestoreKeys) -> Result<()>;
}

pub struct BackupCoordinator {
    lock: Arc<LockController>,
    initialization: Arc<InitializationTracker>,
    codec: CryptoCodec,
    components: BTreeMap<String, Arc<dyn Backupable>>,
}

impl BackupCoordinator {
    /// The lock marker is always part of the backup under `lock`.
    pub fn new(
        lock: Arc<LockController>,
        initialization: Arc<InitializationTracker>,
        codec: CryptoCodec,
    ) -> Self {
        let mut components: BTreeMap<String, Arc<dyn Backupable>> = BTreeMap::new();
        components.insert(keys::LOCK.to_string(), Arc::clone(&lock) as Arc<dyn Backupable>);
        Self {
            lock,
            initialization,
            codec,
            components,
        }
    }

    /// Add a component under `key`. Each key may only be registered once.
    pub fn register(&mut self, key: &str, component: Arc<dyn Backupable>) -> Result<()> {
        if self.components.contains_key(key) {
            return Err(WalletError::DuplicateMethod(format!("backup component {key}")));
        }
        self.components.insert(key.to_string(), component);
        Ok(())
    }

    pub fn component_keys(&self) -> impl Iterator<Item = &str> {
        self.components.keys().map(String::as_str)
    }

    /// Authenticate `password`, then export every component in parallel.
    pub async fn download(&self, password: &str) -> Result<BackupManifest> {
        self.lock.is_authentic_password(password).await?;
        let key = SessionKey::derive(password);

        let exports = self.components.iter().map(|(name, component)| {
            let key = &key;
            async move {
                let blob = component.export_backup(key).await?;
                debug!(component = %name, present = blob.is_some(), "Component exported");
                Ok::<_, WalletError>((name.clone(), blob))
            }
        });
        let manifest: BackupManifest = try_join_all(exports).await?.into_iter().collect();

        info!(components = manifest.len(), "Backup downloaded");
        Ok(manifest)
    }

    /// Same as [`download`](Self::download), rendered as the backup file body.
    pub async fn download_json(&self, password: &str) -> Result<String> {
        let manifest = self.download(password).await?;
        serde_json::to_string_pretty(&manifest).map_err(|e| WalletError::Internal(e.to_string()))
    }

    /// Restore a backup file.
    ///
    /// `password` is the current wallet password (ignored on a fresh
    /// install); `backup_password` is the password the backup was taken
    /// under. Nothing is mutated unless the manifest is complete and every
    /// blob authenticates and decodes under `backup_password`.
    pub async fn upload(&self, content: &str, password: &str, backup_password: &str) -> Result<bool> {
        let manifest = parse_manifest(content)?;
        let ordered = [keys::LOCK, keys::WALLET]
            .into_iter()
            .map(|name| self.component(name).map(|component| (name, component)))
            .collect::<Result<Vec<_>>>()?;

        let step = self.initialization.step().await?;
        let fresh = step <= InitializationStep::New && !self.lock.is_initialized();
        if !fresh {
            self.lock.is_authentic_password(password).await?;
        }

        let backup_key = SessionKey::derive(backup_password);
        for (name, blob) in &manifest {
            if !self.codec.authentic(blob, &backup_key) {
                warn!(component = %name, "Backup blob failed authentication");
                return Err(WalletError::Authentication("Incorrect backup password".into()));
            }
        }
        for (name, blob) in &manifest {
            if let Some(component) = self.components.get(name) {
                component.check_backup(blob, &backup_key)?;
            }
        }

        // After the lock marker is adopted on a fresh install the backup
        // password becomes the wallet password.
        let target = if fresh {
            SessionKey::derive(backup_password)
        } else {
            SessionKey::derive(password)
        };
        let restore = RestoreKeys::new(backup_key, target);

        for (name, component) in ordered {
            component.import_backup(&manifest[name], &restore).await?;
            debug!(component = name, "Component restored");
        }

        let rest = manifest
            .iter()
            .filter(|(name, _)| name.as_str() != keys::LOCK && name.as_str() != keys::WALLET)
            .filter_map(|(name, blob)| match self.components.get(name) {
                Some(component) => Some((name, blob, component)),
                None => {
                    warn!(component = %name, "Skipping unknown backup component");
                    None
                }
            })
            .map(|(name, blob, component)| {
                let restore = &restore;
                async move {
                    component.import_backup(blob, restore).await?;
                    debug!(component = %name, "Component restored");
                    Ok::<_, WalletError>(())
                }
            });
        try_join_all(rest).await?;

        self.initialization.advance_to(InitializationStep::Done).await?;
        info!(fresh, components = manifest.len(), "Backup uploaded");
        Ok(true)
    }

    fn component(&self, name: &str) -> Result<&Arc<dyn Backupable>> {
        self.components
            .get(name)
            .ok_or_else(|| WalletError::Internal(format!("backup component {name} is not registered")))
    }
}

/// Parse a backup file into its non-null entries. Both reserved keys must be
/// present with a non-empty blob.
fn parse_manifest(content: &str) -> Result<BTreeMap<String, String>> {
    let raw: serde_json::Map<String, Value> = serde_json::from_str(content)
        .map_err(|_| WalletError::CorruptedBackup("content is not a JSON object".into()))?;

    let mut entries = BTreeMap::new();
    for (name, value) in raw {
        match value {
            Value::Null => {}
            Value::String(blob) if !blob.is_empty() => {
                entries.insert(name, blob);
            }
            Value::String(_) => {}
            _ => {
                return Err(WalletError::CorruptedBackup(format!(
                    "entry {name} is not a string"
                )))
            }
        }
    }

    for reserved in [keys::LOCK, keys::WALLET] {
        if !entries.contains_key(reserved) {
            return Err(WalletError::CorruptedBackup(format!("missing {reserved} entry")));
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CodecParams;
    use crate::store::InMemoryStore;
    use tokio::sync::Mutex;

    fn codec() -> CryptoCodec {
        CryptoCodec::new(CodecParams::new(8, 1, 1))
    }

    /// Stores one plaintext string; restore replaces it.
    #[derive(Default)]
    struct Note {
        text: Mutex<Option<String>>,
    }

    #[async_trait]
    impl Backupable for Note {
        async fn export_backup(&self, backup_key: &SessionKey) -> Result<Option<String>> {
            match self.text.lock().await.as_deref() {
                Some(text) => codec().seal(text, backup_key).map(Some),
                None => Ok(None),
            }
        }

        fn check_backup(&self, content: &str, backup_key: &SessionKey) -> Result<()> {
            codec().open(content, backup_key).map(|_| ())
        }

        async fn import_backup(&self, content: &str, keys: &RestoreKeys) -> Result<()> {
            let text = codec().open(content, &keys.backup)?;
            *self.text.lock().await = Some(text);
            Ok(())
        }
    }

    async fn coordinator(note: Arc<Note>) -> (BackupCoordinator, Arc<LockController>) {
        let lock = Arc::new(
            LockController::open(Arc::new(InMemoryStore::new()), codec(), vec![])
                .await
                .unwrap(),
        );
        let tracker = Arc::new(InitializationTracker::new(Arc::new(InMemoryStore::new())));
        let mut backup = BackupCoordinator::new(Arc::clone(&lock), tracker, codec());
        backup.register(keys::WALLET, note).unwrap();
        (backup, lock)
    }

    #[test]
    fn test_manifest_requires_reserved_keys() {
        let err = parse_manifest(r#"{"lock":"abc"}"#).unwrap_err();
        assert!(matches!(err, WalletError::CorruptedBackup(_)));

        let err = parse_manifest(r#"{"lock":"abc","wallet":""}"#).unwrap_err();
        assert!(matches!(err, WalletError::CorruptedBackup(_)));

        let err = parse_manifest("not json").unwrap_err();
        assert!(matches!(err, WalletError::CorruptedBackup(_)));

        let entries = parse_manifest(r#"{"lock":"a","wallet":"b","history":null}"#).unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_component_rejected() {
        let (mut backup, _) = coordinator(Arc::new(Note::default())).await;
        let err = backup
            .register(keys::WALLET, Arc::new(Note::default()))
            .unwrap_err();
        assert!(matches!(err, WalletError::DuplicateMethod(_)));
    }

    #[tokio::test]
    async fn test_download_wrong_password_exports_nothing() {
        let (backup, lock) = coordinator(Arc::new(Note::default())).await;
        lock.setup_password("pw").await.unwrap();

        let err = backup.download("nope").await.unwrap_err();
        assert!(matches!(err, WalletError::Authentication(_)));
    }

    #[tokio::test]
    async fn test_restore_into_fresh_install() {
        let source_note = Arc::new(Note::default());
        *source_note.text.lock().await = Some("hello".into());
        let (source, source_lock) = coordinator(Arc::clone(&source_note)).await;
        source_lock.setup_password("pw").await.unwrap();
        let content = source.download_json("pw").await.unwrap();

        let target_note = Arc::new(Note::default());
        let (target, target_lock) = coordinator(Arc::clone(&target_note)).await;

        // wrong backup password leaves the fresh install untouched
        let err = target.upload(&content, "", "nope").await.unwrap_err();
        assert!(matches!(err, WalletError::Authentication(_)));
        assert!(!target_lock.is_initialized());

        assert!(target.upload(&content, "", "pw").await.unwrap());
        assert!(target_lock.is_initialized());
        target_lock.is_authentic_password("pw").await.unwrap();
        assert_eq!(target_note.text.lock().await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_upload_requires_current_password_once_set_up() {
        let note = Arc::new(Note::default());
        *note.text.lock().await = Some("hello".into());
        let (backup, lock) = coordinator(Arc::clone(&note)).await;
        lock.setup_password("pw").await.unwrap();
        let content = backup.download_json("pw").await.unwrap();

        let err = backup.upload(&content, "wrong", "pw").await.unwrap_err();
        assert!(matches!(err, WalletError::Authentication(_)));
        assert!(backup.upload(&content, "pw", "pw").await.unwrap());
    }
}
