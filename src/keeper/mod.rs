//! The keeper context.
//!
//! [`Keeper::start`] builds every component from a [`KeeperConfig`], wires
//! the lock subscribers and backup components, registers the method table
//! and starts the auto-lock timer. Nothing is global: two keepers in one
//! process share no state.

pub mod methods;
pub mod proof;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::actions::{ActionRegistry, CallerMeta, RpcRequest, RpcResponse};
use crate::approval::ApprovalRegistry;
use crate::backup::BackupCoordinator;
use crate::channel::RpcHandler;
use crate::config::KeeperConfig;
use crate::crypto::CryptoCodec;
use crate::history::OperationHistory;
use crate::identity::IdentityVault;
use crate::lock::{spawn_auto_lock_task, LockController, LockSubscriber};
use crate::onboarding::InitializationTracker;
use crate::requests::{ConsentSurface, RequestBroker};
use crate::store::{keys, SealedSlot};
use crate::types::Result;

/// Shared handles passed to every method handler.
#[derive(Clone)]
pub struct Services {
    pub lock: Arc<LockController>,
    pub vault: Arc<IdentityVault>,
    pub approvals: Arc<ApprovalRegistry>,
    pub history: Arc<OperationHistory>,
    pub broker: Arc<RequestBroker>,
    pub backup: Arc<BackupCoordinator>,
    pub initialization: Arc<InitializationTracker>,
    pub proof_artifacts_dir: Arc<str>,
}

pub struct Keeper {
    services: Services,
    registry: ActionRegistry,
    /// Methods whose success resets the idle clock
    activity: HashSet<&'static str>,
    auto_lock: Mutex<Option<JoinHandle<()>>>,
}

impl Keeper {
    pub async fn start(config: KeeperConfig, surface: Arc<dyn ConsentSurface>) -> Result<Self> {
        config.validate()?;
        let codec = CryptoCodec::new(config.codec);
        let sealed = |key: &str| SealedSlot::new(config.slots.slot(key), codec.clone());

        let vault = Arc::new(IdentityVault::new(sealed(keys::WALLET)));
        let approvals = Arc::new(ApprovalRegistry::new(sealed(keys::APPROVAL)));
        let history = Arc::new(OperationHistory::new(sealed(keys::HISTORY)));

        // Unlock order: vault first, the rest depend on nothing else.
        let subscribers: Vec<Arc<dyn LockSubscriber>> = vec![
            Arc::clone(&vault) as Arc<dyn LockSubscriber>,
            Arc::clone(&approvals) as Arc<dyn LockSubscriber>,
            Arc::clone(&history) as Arc<dyn LockSubscriber>,
        ];
        let lock = Arc::new(
            LockController::open(config.slots.slot(keys::LOCK), codec.clone(), subscribers).await?,
        );
        let initialization = Arc::new(InitializationTracker::new(
            config.slots.slot(keys::INITIALIZATION),
        ));

        let mut backup = BackupCoordinator::new(
            Arc::clone(&lock),
            Arc::clone(&initialization),
            codec.clone(),
        );
        backup.register(keys::WALLET, Arc::clone(&vault) as _)?;
        backup.register(keys::APPROVAL, Arc::clone(&approvals) as _)?;
        backup.register(keys::HISTORY, Arc::clone(&history) as _)?;
        debug!(
            components = ?backup.component_keys().collect::<Vec<_>>(),
            "Backup components registered"
        );

        let services = Services {
            lock: Arc::clone(&lock),
            vault,
            approvals,
            history,
            broker: Arc::new(RequestBroker::new(surface, config.consent_timeout)),
            backup: Arc::new(backup),
            initialization,
            proof_artifacts_dir: Arc::from(config.proof_artifacts_dir.as_str()),
        };
        let methods::MethodTable { registry, activity } =
            methods::register_all(&services, config.dev_mode)?;

        let auto_lock = config.auto_lock.map(|auto_lock| {
            spawn_auto_lock_task(Arc::clone(&lock), auto_lock.idle, auto_lock.check_interval)
        });

        info!(
            dev_mode = config.dev_mode,
            methods = registry.methods().count(),
            activity_methods = activity.len(),
            auto_lock = auto_lock.is_some(),
            lock_state = ?lock.state(),
            "Keeper started"
        );

        Ok(Self {
            services,
            registry,
            activity,
            auto_lock: Mutex::new(auto_lock),
        })
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    /// Dispatch one call. A successful user-facing mutation resets the
    /// auto-lock idle clock; reads and page calls leave it alone.
    pub async fn call(&self, method: &str, payload: Value, meta: CallerMeta) -> RpcResponse {
        let response = self.registry.dispatch(method, payload, meta).await;
        if response.is_ok() && self.activity.contains(method) {
            self.services.lock.touch();
        }
        response
    }

    /// Whether a successful `method` call counts as user activity.
    pub fn is_activity(&self, method: &str) -> bool {
        self.activity.contains(method)
    }

    /// Stop the timer and lock.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.auto_lock.lock().await.take() {
            handle.abort();
        }
        if let Err(e) = self.services.lock.lock().await {
            warn!(error = %e, "Failed to lock during shutdown");
        }
        info!("Keeper stopped");
    }
}

#[async_trait]
impl RpcHandler for Keeper {
    async fn handle(&self, request: RpcRequest) -> RpcResponse {
        self.call(&request.method, request.payload, request.meta)
            .await
    }
}
