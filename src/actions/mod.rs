//! Named method dispatch.
//!
//! Every method is an ordered chain of steps. A step receives the payload
//! produced by the previous step (guards pass it through unchanged) and the
//! caller metadata. The first error aborts the chain.
//!
//! [`ActionRegistry::dispatch`] is the boundary towards untrusted callers:
//! it always returns an [`RpcResponse`] tuple. Errors and panics inside a
//! chain are logged and turned into the error half of the tuple.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error};

use crate::types::{Result, WalletError};

/// Who is calling. Supplied by the transport, never trusted for secrets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerMeta {
    #[serde(default)]
    pub origin: String,
}

impl CallerMeta {
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
        }
    }
}

/// Inbound envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub meta: CallerMeta,
}

impl RpcRequest {
    pub fn new(method: impl Into<String>, payload: Value, meta: CallerMeta) -> Self {
        Self {
            method: method.into(),
            payload,
            meta,
        }
    }
}

/// Outbound `[error, result]` tuple. Exactly one half is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse(pub Option<String>, pub Option<Value>);

impl RpcResponse {
    pub fn ok(value: Value) -> Self {
        Self(None, Some(value))
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self(Some(message.into()), None)
    }

    pub fn is_ok(&self) -> bool {
        self.0.is_none()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.0.as_deref()
    }

    pub fn into_result(self) -> std::result::Result<Value, String> {
        match self {
            Self(Some(message), _) => Err(message),
            Self(None, value) => Ok(value.unwrap_or(Value::Null)),
        }
    }
}

pub type StepFuture = BoxFuture<'static, Result<Value>>;

/// One link of a method chain.
pub type Step = Arc<dyn Fn(Value, CallerMeta) -> StepFuture + Send + Sync>;

/// Wrap a synchronous check as a pass-through step.
pub fn guard<F>(check: F) -> Step
where
    F: Fn(&Value, &CallerMeta) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(move |payload, meta| {
        let outcome = check(&payload, &meta).map(|()| payload);
        async move { outcome }.boxed()
    })
}

/// Wrap an async function as a step.
pub fn handler<F, Fut>(f: F) -> Step
where
    F: Fn(Value, CallerMeta) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(move |payload, meta| f(payload, meta).boxed())
}

/// Decode a payload into a typed request.
pub fn parse<T: DeserializeOwned>(payload: Value) -> Result<T> {
    serde_json::from_value(payload).map_err(|e| WalletError::BadRequest(format!("Invalid payload: {e}")))
}

/// Encode a handler result.
pub fn reply<T: Serialize>(value: T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| WalletError::Internal(e.to_string()))
}

#[derive(Default)]
pub struct ActionRegistry {
    methods: HashMap<String, Vec<Step>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `method` to `chain`. A name can only be registered once.
    pub fn register(&mut self, method: &str, chain: Vec<Step>) -> Result<()> {
        if chain.is_empty() {
            return Err(WalletError::Config(format!("{method} has an empty chain")));
        }
        if self.methods.contains_key(method) {
            return Err(WalletError::DuplicateMethod(method.to_string()));
        }
        self.methods.insert(method.to_string(), chain);
        Ok(())
    }

    pub fn contains(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    pub async fn dispatch(&self, method: &str, payload: Value, meta: CallerMeta) -> RpcResponse {
        let Some(chain) = self.methods.get(method) else {
            debug!(method, origin = %meta.origin, "Unknown method");
            return RpcResponse::error(WalletError::UnknownMethod(method.to_string()).to_string());
        };

        let mut value = payload;
        for (index, step) in chain.iter().enumerate() {
            let step = Arc::clone(step);
            let caller = meta.clone();
            let call = AssertUnwindSafe(async move { step(value, caller).await }).catch_unwind();
            match call.await {
                Ok(Ok(next)) => value = next,
                Ok(Err(e)) => {
                    debug!(
                        method,
                        step = index,
                        origin = %meta.origin,
                        kind = e.kind(),
                        recoverable = e.is_recoverable(),
                        error = %e,
                        "Method failed"
                    );
                    return RpcResponse::error(e.to_string());
                }
                Err(_) => {
                    error!(method, step = index, origin = %meta.origin, "Method panicked");
                    return RpcResponse::error(WalletError::Internal("handler panicked".into()).to_string());
                }
            }
        }
        RpcResponse::ok(value)
    }
}
