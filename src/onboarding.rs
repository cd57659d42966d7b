//! First-run progress tracking.
//!
//! Stored in its own slot as plain JSON: it holds no secret and has to be
//! readable while the wallet is locked (backup upload consults it before any
//! password is known).

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::store::EncryptedStore;
use crate::types::{Result, WalletError};

/// How far the installation has progressed through first-run setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum InitializationStep {
    /// Nothing set up yet
    #[default]
    New = 0,
    /// Password chosen, onboarding not finished
    Password = 1,
    /// Onboarding finished (or restored from backup)
    Done = 2,
}

pub struct InitializationTracker {
    store: Arc<dyn EncryptedStore>,
}

impl InitializationTracker {
    pub fn new(store: Arc<dyn EncryptedStore>) -> Self {
        Self { store }
    }

    pub async fn step(&self) -> Result<InitializationStep> {
        match self.store.get().await? {
            Some(raw) => serde_json::from_str(&raw).map_err(|e| {
                WalletError::Storage(format!("Invalid initialization record: {e}"))
            }),
            None => Ok(InitializationStep::New),
        }
    }

    /// Move forward to `step`. Never moves backwards.
    pub async fn advance_to(&self, step: InitializationStep) -> Result<InitializationStep> {
        let current = self.step().await?;
        if step <= current {
            return Ok(current);
        }
        self.store.set(serde_json::to_string(&step)?).await?;
        debug!(from = ?current, to = ?step, "Initialization step advanced");
        Ok(step)
    }
}
