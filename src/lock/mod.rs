//! Session lock state machine.
//!
//! ```text
//! Uninitialized ──setup_password──▶ Locked ◀──lock── Unlocked
//!                                     │                 ▲
//!                                     └─────unlock──────┘
//! ```
//!
//! The controller owns the only live [`SessionKey`]. Handlers capture it
//! once through [`LockController::session_key`] and keep using that
//! `Arc` until they finish, even if the wallet locks underneath them.

pub mod auto_lock;

use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::backup::{Backupable, RestoreKeys};
use crate::crypto::{CryptoCodec, SessionKey};
use crate::store::EncryptedStore;
use crate::types::{Result, WalletError};

pub use auto_lock::spawn_auto_lock_task;

/// Plaintext sealed into the lock marker.
const MARKER_PLAINTEXT: &str = "keystead:lock-marker:v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    Uninitialized,
    Locked,
    Unlocked,
}

/// Status reported by `get-status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockStatus {
    pub initialized: bool,
    pub unlocked: bool,
}

/// Component notified on lock transitions. Unlock subscribers run one at a
/// time in the order they were handed to [`LockController::open`].
#[async_trait]
pub trait LockSubscriber: Send + Sync {
    fn name(&self) -> &'static str;

    async fn on_unlocked(&self, key: &SessionKey) -> Result<()>;

    async fn on_locked(&self) {}
}

struct Session {
    state: LockState,
    key: Option<Arc<SessionKey>>,
    last_activity: Instant,
}

pub struct LockController {
    store: Arc<dyn EncryptedStore>,
    codec: CryptoCodec,
    session: RwLock<Session>,
    subscribers: Vec<Arc<dyn LockSubscriber>>,
    state_tx: watch::Sender<LockState>,
    /// Serialises setup/unlock/lock/restore so transitions never interleave
    transition: Mutex<()>,
}

impl LockController {
    /// Build the controller and derive the initial state from the marker
    /// slot.
    pub async fn open(
        store: Arc<dyn EncryptedStore>,
        codec: CryptoCodec,
        subscribers: Vec<Arc<dyn LockSubscriber>>,
    ) -> Result<Self> {
        let state = match store.get().await? {
            Some(_) => LockState::Locked,
            None => LockState::Uninitialized,
        };
        let (state_tx, _) = watch::channel(state);

        debug!(
            ?state,
            subscribers = subscribers.len(),
            "Lock controller opened"
        );

        Ok(Self {
            store,
            codec,
            session: RwLock::new(Session {
                state,
                key: None,
                last_activity: Instant::now(),
            }),
            subscribers,
            state_tx,
            transition: Mutex::new(()),
        })
    }

    pub fn state(&self) -> LockState {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .state
    }

    pub fn status(&self) -> LockStatus {
        let state = self.state();
        LockStatus {
            initialized: state != LockState::Uninitialized,
            unlocked: state == LockState::Unlocked,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.state() != LockState::Uninitialized
    }

    /// Guard for sensitive handlers. No side effects.
    pub fn ensure(&self) -> Result<()> {
        match self.state() {
            LockState::Unlocked => Ok(()),
            _ => Err(WalletError::Locked),
        }
    }

    /// Capture the current session key.
    pub fn session_key(&self) -> Result<Arc<SessionKey>> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .key
            .clone()
            .ok_or(WalletError::Locked)
    }

    /// Record caller activity (resets the auto-lock idle clock).
    pub fn touch(&self) {
        let mut session = self.session.write().unwrap_or_else(PoisonError::into_inner);
        session.last_activity = Instant::now();
    }

    /// How long the session has been idle. `None` unless unlocked.
    pub fn idle_for(&self) -> Option<Duration> {
        let session = self.session.read().unwrap_or_else(PoisonError::into_inner);
        (session.state == LockState::Unlocked).then(|| session.last_activity.elapsed())
    }

    /// Resolve once the wallet is unlocked.
    pub async fn wait_unlocked(&self) -> Result<()> {
        let mut rx = self.state_tx.subscribe();
        rx.wait_for(|state| *state == LockState::Unlocked)
            .await
            .map(|_| ())
            .map_err(|_| WalletError::Internal("Lock state channel closed".into()))
    }

    /// Choose the wallet password. Only valid before any password exists.
    pub async fn setup_password(&self, password: &str) -> Result<()> {
        let _guard = self.transition.lock().await;

        if self.state() != LockState::Uninitialized {
            return Err(WalletError::InvalidState("Password is already set".into()));
        }
        if password.is_empty() {
            return Err(WalletError::BadRequest("Password must not be empty".into()));
        }

        let key = SessionKey::derive(password);
        let marker = self.codec.seal(MARKER_PLAINTEXT, &key)?;
        self.store.set(marker).await?;

        self.set_state(LockState::Locked, None);
        info!("Password set up, wallet locked");
        Ok(())
    }

    /// Check a password against the stored marker without changing state.
    pub async fn is_authentic_password(&self, password: &str) -> Result<()> {
        let marker = self
            .store
            .get()
            .await?
            .ok_or_else(|| WalletError::InvalidState("Password has not been set up".into()))?;

        if self.codec.authentic(&marker, &SessionKey::derive(password)) {
            Ok(())
        } else {
            Err(WalletError::Authentication("Incorrect password".into()))
        }
    }

    /// Unlock with the wallet password and run every unlock subscriber.
    ///
    /// If a subscriber fails the controller stays Locked and the session
    /// key is dropped.
    pub async fn unlock(&self, password: &str) -> Result<()> {
        let _guard = self.transition.lock().await;

        match self.state() {
            LockState::Locked => {}
            LockState::Uninitialized => {
                return Err(WalletError::InvalidState(
                    "Password has not been set up".into(),
                ))
            }
            LockState::Unlocked => {
                return Err(WalletError::InvalidState("Already unlocked".into()))
            }
        }

        self.is_authentic_password(password).await?;
        let key = Arc::new(SessionKey::derive(password));

        for (index, subscriber) in self.subscribers.iter().enumerate() {
            if let Err(e) = subscriber.on_unlocked(&key).await {
                warn!(
                    subscriber = subscriber.name(),
                    error = %e,
                    "Unlock subscriber failed, staying locked"
                );
                for done in self.subscribers[..index].iter().rev() {
                    done.on_locked().await;
                }
                return Err(e);
            }
            debug!(subscriber = subscriber.name(), "Unlock subscriber completed");
        }

        self.set_state(LockState::Unlocked, Some(key));
        info!("Wallet unlocked");
        Ok(())
    }

    /// Drop the session key. Idempotent when already locked.
    pub async fn lock(&self) -> Result<()> {
        let _guard = self.transition.lock().await;

        if self.state() != LockState::Unlocked {
            return Ok(());
        }

        self.set_state(LockState::Locked, None);
        for subscriber in self.subscribers.iter().rev() {
            subscriber.on_locked().await;
        }
        info!("Wallet locked");
        Ok(())
    }

    fn set_state(&self, state: LockState, key: Option<Arc<SessionKey>>) {
        {
            let mut session = self.session.write().unwrap_or_else(PoisonError::into_inner);
            session.state = state;
            session.key = key;
            session.last_activity = Instant::now();
        }
        self.state_tx.send_replace(state);
    }
}

#[async_trait]
impl Backupable for LockController {
    async fn export_backup(&self, backup_key: &SessionKey) -> Result<Option<String>> {
        let Some(marker) = self.store.get().await? else {
            return Ok(None);
        };
        if !self.codec.authentic(&marker, backup_key) {
            return Err(WalletError::Authentication("Incorrect password".into()));
        }
        Ok(Some(marker))
    }

    fn check_backup(&self, content: &str, backup_key: &SessionKey) -> Result<()> {
        let plaintext = self
            .codec
            .open(content, backup_key)
            .map_err(|_| WalletError::Authentication("Incorrect backup password".into()))?;
        if plaintext != MARKER_PLAINTEXT {
            return Err(WalletError::CorruptedBackup(
                "lock marker has unexpected contents".into(),
            ));
        }
        Ok(())
    }

    async fn import_backup(&self, content: &str, keys: &RestoreKeys) -> Result<()> {
        self.check_backup(content, &keys.backup)?;

        let _guard = self.transition.lock().await;
        if self.state() == LockState::Uninitialized {
            self.store.set(content.to_string()).await?;
            self.set_state(LockState::Locked, None);
            info!("Adopted lock marker from backup");
        } else {
            debug!("Backup lock marker verified, keeping current password");
        }
        Ok(())
    }
}
