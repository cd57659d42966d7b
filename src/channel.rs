//! Bounded in-process RPC channel
//!
//! Callers hold an [`RpcClient`]; the host runs one [`RpcServer`]. Every call
//! carries a correlation id and gets its response back on its own oneshot.
//! The server spawns a task per call, so a call parked on a consent decision
//! never holds up other callers.
//!
//! Back-pressure comes from the channel capacity: when it is full, `call`
//! waits for a free slot.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::actions::{ActionRegistry, RpcRequest, RpcResponse};

/// Anything that can answer an envelope.
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    async fn handle(&self, request: RpcRequest) -> RpcResponse;
}

#[async_trait]
impl RpcHandler for ActionRegistry {
    async fn handle(&self, request: RpcRequest) -> RpcResponse {
        self.dispatch(&request.method, request.payload, request.meta)
            .await
    }
}

/// Request travelling to the server
struct Envelope {
    id: Uuid,
    request: RpcRequest,
    reply_tx: oneshot::Sender<RpcReply>,
}

/// Response correlated with its request
#[derive(Debug, Clone)]
pub struct RpcReply {
    pub id: Uuid,
    pub response: RpcResponse,
}

pub struct RpcChannel;

impl RpcChannel {
    /// `timeout` of `None` lets calls wait as long as the handler takes
    /// (including an open-ended consent prompt).
    pub fn new(capacity: usize, timeout: Option<Duration>) -> (RpcClient, RpcServer) {
        let (request_tx, request_rx) = mpsc::channel(capacity.max(1));
        (
            RpcClient {
                request_tx,
                timeout,
            },
            RpcServer { request_rx },
        )
    }
}

#[derive(Clone)]
pub struct RpcClient {
    request_tx: mpsc::Sender<Envelope>,
    timeout: Option<Duration>,
}

impl RpcClient {
    /// Send a request and wait for its reply. Transport failures come back
    /// as error tuples like any other fault.
    pub async fn call(&self, request: RpcRequest) -> RpcReply {
        let id = Uuid::new_v4();
        let (reply_tx, reply_rx) = oneshot::channel();
        let envelope = Envelope {
            id,
            request,
            reply_tx,
        };

        if self.request_tx.send(envelope).await.is_err() {
            return RpcReply {
                id,
                response: RpcResponse::error("Keystead is not running"),
            };
        }

        let received = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, reply_rx).await {
                Ok(received) => received,
                Err(_) => {
                    warn!(request_id = %id, "RPC call timed out");
                    return RpcReply {
                        id,
                        response: RpcResponse::error("Request timed out"),
                    };
                }
            },
            None => reply_rx.await,
        };

        received.unwrap_or_else(|_| RpcReply {
            id,
            response: RpcResponse::error("Response channel closed"),
        })
    }
}

pub struct RpcServer {
    request_rx: mpsc::Receiver<Envelope>,
}

impl RpcServer {
    /// Serve until every client is dropped.
    pub fn spawn<H: RpcHandler>(mut self, handler: Arc<H>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("RPC server started");
            while let Some(envelope) = self.request_rx.recv().await {
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    let Envelope {
                        id,
                        request,
                        reply_tx,
                    } = envelope;
                    debug!(request_id = %id, method = %request.method, "RPC call received");
                    let response = handler.handle(request).await;
                    if reply_tx.send(RpcReply { id, response }).is_err() {
                        debug!(request_id = %id, "Caller went away before the reply");
                    }
                });
            }
            info!("RPC server stopped (all clients dropped)");
        })
    }
}
