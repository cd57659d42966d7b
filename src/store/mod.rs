//! Persisted key/value slots.
//!
//! A slot holds one opaque string (normally a sealed blob). There is no
//! business logic here: every component that owns a slot decides how to
//! seal, authenticate and merge what it writes.
//!
//! ## Backends
//!
//! - [`InMemoryStore`]: process-local, used by tests and ephemeral hosts
//! - [`FileStore`]: one file per slot under a data directory

use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::types::{Result, WalletError};

pub mod sealed;

pub use sealed::SealedSlot;

/// Well-known slot names. `lock` and `wallet` double as the reserved
/// backup manifest keys.
pub mod keys {
    pub const LOCK: &str = "lock";
    pub const WALLET: &str = "wallet";
    pub const APPROVAL: &str = "approval";
    pub const HISTORY: &str = "history";
    pub const INITIALIZATION: &str = "initialization";
}

/// A single persisted slot.
#[async_trait]
pub trait EncryptedStore: Send + Sync {
    /// Read the slot. `None` when nothing was ever written or it was cleared.
    async fn get(&self) -> Result<Option<String>>;

    /// Replace the slot contents.
    async fn set(&self, blob: String) -> Result<()>;

    /// Remove the slot contents.
    async fn clear(&self) -> Result<()>;
}

// =============================================================================
// In-memory backend
// =============================================================================

#[derive(Default)]
pub struct InMemoryStore {
    value: RwLock<Option<String>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EncryptedStore for InMemoryStore {
    async fn get(&self) -> Result<Option<String>> {
        Ok(self.value.read().await.clone())
    }

    async fn set(&self, blob: String) -> Result<()> {
        *self.value.write().await = Some(blob);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        *self.value.write().await = None;
        Ok(())
    }
}

// =============================================================================
// File backend
// =============================================================================

/// Slot persisted as a single file. Writes go to a sibling temp file first
/// and are renamed into place, so a crash never leaves a torn blob.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn temp_path(&self) -> PathBuf {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        PathBuf::from(tmp)
    }
}

#[async_trait]
impl EncryptedStore for FileStore {
    async fn get(&self) -> Result<Option<String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(WalletError::Storage(format!(
                "Failed to read {}: {e}",
                self.path.display()
            ))),
        }
    }

    async fn set(&self, blob: String) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.temp_path();
        tokio::fs::write(&tmp, blob.as_bytes()).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), "Slot written");
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// =============================================================================
// Slot provider
// =============================================================================

/// Hands out one slot per well-known key.
#[derive(Debug, Clone)]
pub enum SlotProvider {
    Memory,
    Directory(PathBuf),
}

impl SlotProvider {
    pub fn from_data_dir(data_dir: Option<PathBuf>) -> Self {
        match data_dir {
            Some(dir) => Self::Directory(dir),
            None => Self::Memory,
        }
    }

    pub fn slot(&self, key: &str) -> Arc<dyn EncryptedStore> {
        match self {
            Self::Memory => Arc::new(InMemoryStore::new()),
            Self::Directory(dir) => Arc::new(FileStore::new(dir.join(format!("{key}.slot")))),
        }
    }
}
