//! Shared harness for integration tests
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use keystead::requests::{ChannelConsentSurface, SurfaceEvent};
use keystead::{CallerMeta, Keeper, KeeperConfig};

pub const APP: &str = "https://app.example";

pub struct Harness {
    pub keeper: Arc<Keeper>,
    pub events: mpsc::UnboundedReceiver<SurfaceEvent>,
}

impl Harness {
    pub async fn start(config: KeeperConfig) -> Self {
        let (surface, events) = ChannelConsentSurface::new();
        let keeper = Keeper::start(config, Arc::new(surface))
            .await
            .expect("keeper starts");
        Self {
            keeper: Arc::new(keeper),
            events,
        }
    }

    /// Fresh in-memory keeper with `password` set up and unlocked.
    pub async fn unlocked(password: &str) -> Self {
        let harness = Self::start(KeeperConfig::ephemeral()).await;
        harness.setup_and_unlock(password).await;
        harness
    }

    pub async fn setup_and_unlock(&self, password: &str) {
        self.call("setup-password", json!({ "password": password }))
            .await
            .expect("setup-password");
        self.call("unlock", json!({ "password": password }))
            .await
            .expect("unlock");
    }

    pub async fn call(&self, method: &str, payload: Value) -> Result<Value, String> {
        self.call_from(APP, method, payload).await
    }

    pub async fn call_from(&self, origin: &str, method: &str, payload: Value) -> Result<Value, String> {
        self.keeper
            .call(method, payload, CallerMeta::new(origin))
            .await
            .into_result()
    }

    pub async fn create_identity(&self, name: &str) -> String {
        let created = self
            .call(
                "create-identity",
                json!({ "strategy": "random", "options": { "name": name } }),
            )
            .await
            .expect("create-identity");
        created["commitment"].as_str().expect("commitment").to_string()
    }

    /// `(commitment, name)` pairs in vault order.
    pub async fn identities(&self) -> Vec<(String, String)> {
        let identities = self
            .call("get-identities", Value::Null)
            .await
            .expect("get-identities");
        identities
            .as_array()
            .expect("array")
            .iter()
            .map(|i| {
                (
                    i["commitment"].as_str().unwrap_or_default().to_string(),
                    i["metadata"]["name"].as_str().unwrap_or_default().to_string(),
                )
            })
            .collect()
    }

    pub async fn wait_for_pending(&self, count: usize) -> Vec<Value> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let pending = self
                    .call("get-pending-requests", Value::Null)
                    .await
                    .expect("get-pending-requests");
                let pending = pending.as_array().cloned().unwrap_or_default();
                if pending.len() >= count {
                    return pending;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("requests queued in time")
    }

    pub async fn next_event(&mut self) -> SurfaceEvent {
        tokio::time::timeout(Duration::from_secs(5), self.events.recv())
            .await
            .expect("surface event in time")
            .expect("surface channel open")
    }
}

pub fn semaphore_request() -> Value {
    json!({
        "protocol": "semaphore",
        "externalNullifier": "1",
        "signal": "0x0000000000000000000000000000000000000000000000000000000000000001",
        "merkleStorageAddress": "http://localhost:8090/merkle"
    })
}
