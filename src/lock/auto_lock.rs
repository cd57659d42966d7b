//! Idle auto-lock timer.
//!
//! Runs independently of request handling. A handler that already captured
//! the session key finishes with it; the timer only drops the controller's
//! copy.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use super::LockController;

/// Spawn a background task that locks the wallet after `idle_timeout` of
/// inactivity, checking every `check_interval`.
pub fn spawn_auto_lock_task(
    lock: Arc<LockController>,
    idle_timeout: Duration,
    check_interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(check_interval);
        loop {
            ticker.tick().await;
            let Some(idle) = lock.idle_for() else {
                continue;
            };
            if idle < idle_timeout {
                continue;
            }
            match lock.lock().await {
                Ok(()) => info!(idle_secs = idle.as_secs(), "Auto-locked after inactivity"),
                Err(e) => warn!(error = %e, "Auto-lock failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CodecParams, CryptoCodec};
    use crate::identity::{CreateIdentityRequest, IdentityOptions, IdentityStrategy, IdentityVault};
    use crate::lock::{LockState, LockSubscriber};
    use crate::store::testing::GatedStore;
    use crate::store::{InMemoryStore, SealedSlot};

    fn codec() -> CryptoCodec {
        CryptoCodec::new(CodecParams::new(8, 1, 1))
    }

    #[tokio::test]
    async fn test_locks_after_idle_timeout() {
        let lock = Arc::new(
            LockController::open(Arc::new(InMemoryStore::new()), codec(), vec![])
            .await
            .unwrap(),
        );
        lock.setup_password("pw").await.unwrap();
        lock.unlock("pw").await.unwrap();
        let captured = lock.session_key().unwrap();

        let handle = spawn_auto_lock_task(
            Arc::clone(&lock),
            Duration::from_millis(20),
            Duration::from_millis(5),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(lock.state(), LockState::Locked);
        // the captured key is unaffected
        assert_eq!(captured.as_bytes().len(), 32);

        handle.abort();
    }

    #[tokio::test]
    async fn test_in_flight_write_finishes_across_auto_lock() {
        let wallet_store = Arc::new(GatedStore::default());
        let vault = Arc::new(IdentityVault::new(SealedSlot::new(wallet_store.clone(), codec())));
        let subscribers = vec![Arc::clone(&vault) as Arc<dyn LockSubscriber>];
        let lock = Arc::new(
            LockController::open(Arc::new(InMemoryStore::new()), codec(), subscribers)
                .await
                .unwrap(),
        );
        lock.setup_password("pw").await.unwrap();
        lock.unlock("pw").await.unwrap();
        let captured = lock.session_key().unwrap();

        // park the vault write halfway through
        wallet_store.hold();
        let create = {
            let vault = Arc::clone(&vault);
            tokio::spawn(async move {
                let request = CreateIdentityRequest {
                    strategy: IdentityStrategy::Random,
                    message_signature: None,
                    options: IdentityOptions {
                        name: Some("Late".into()),
                        host: None,
                    },
                };
                vault.create(&request, &captured).await
            })
        };
        wallet_store.entered.notified().await;

        let timer = spawn_auto_lock_task(
            Arc::clone(&lock),
            Duration::from_millis(10),
            Duration::from_millis(2),
        );
        tokio::time::timeout(Duration::from_secs(5), async {
            while lock.state() != LockState::Locked {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("auto-lock fired");
        assert!(lock.session_key().is_err());

        wallet_store.release();
        let created = create.await.unwrap().unwrap();
        assert_eq!(created.metadata.name, "Late");
        timer.abort();

        lock.unlock("pw").await.unwrap();
        assert_eq!(vault.identities().await.unwrap(), vec![created]);
    }
}
