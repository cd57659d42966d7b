//! Consent request queue.
//!
//! Requests are served strictly first in, first out and only the head of
//! the queue is ever presented. The consent surface is opened when the
//! queue goes from empty to non-empty and closed when it drains, so at most
//! one surface exists at a time no matter how many callers are waiting.
//!
//! Each time the surface opens a new generation starts. Closing the surface
//! without a decision rejects every request of the current generation.

pub mod surface;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::types::{Result, WalletError};

pub use surface::{ChannelConsentSurface, ConsentSurface, SurfaceEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    Connect,
    SemaphoreProof,
    RlnProof,
    Dummy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestDecision {
    Approved,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRequest {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: RequestType,
    pub payload: Value,
    pub origin: String,
    pub created_at: DateTime<Utc>,
}

/// What the waiting caller receives.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestOutcome {
    pub decision: RequestDecision,
    pub data: Option<Value>,
}

impl RequestOutcome {
    fn rejected() -> Self {
        Self {
            decision: RequestDecision::Rejected,
            data: None,
        }
    }
}

struct QueueEntry {
    request: PendingRequest,
    generation: u64,
    responder: oneshot::Sender<RequestOutcome>,
}

#[derive(Default)]
struct BrokerState {
    queue: VecDeque<QueueEntry>,
    surface_open: bool,
    generation: u64,
    shut_down: bool,
}

pub struct RequestBroker {
    state: Mutex<BrokerState>,
    surface: Arc<dyn ConsentSurface>,
    consent_timeout: Option<Duration>,
}

impl RequestBroker {
    /// `consent_timeout` of `None` waits for a decision indefinitely.
    pub fn new(surface: Arc<dyn ConsentSurface>, consent_timeout: Option<Duration>) -> Self {
        Self {
            state: Mutex::new(BrokerState::default()),
            surface,
            consent_timeout,
        }
    }

    /// Queue a request and wait for the user's decision.
    pub async fn new_request(
        &self,
        kind: RequestType,
        payload: Value,
        origin: &str,
    ) -> Result<RequestOutcome> {
        let (id, mut rx) = self.enqueue(kind, payload, origin);
        match self.consent_timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut rx).await {
                Ok(received) => received.map_err(|_| dropped()),
                Err(_) => self.settle_expired(&id, &mut rx),
            },
            None => rx.await.map_err(|_| dropped()),
        }
    }

    fn enqueue(
        &self,
        kind: RequestType,
        payload: Value,
        origin: &str,
    ) -> (String, oneshot::Receiver<RequestOutcome>) {
        let (tx, rx) = oneshot::channel();
        let request = PendingRequest {
            id: Uuid::new_v4().to_string(),
            kind,
            payload,
            origin: origin.to_string(),
            created_at: Utc::now(),
        };
        let id = request.id.clone();

        {
            let mut state = self.state();
            if state.shut_down {
                debug!(request_id = %id, "Broker shut down, request rejected");
                let _ = tx.send(RequestOutcome::rejected());
                return (id, rx);
            }
            let was_empty = state.queue.is_empty();
            if was_empty {
                state.generation += 1;
            }
            let generation = state.generation;
            state.queue.push_back(QueueEntry {
                request: request.clone(),
                generation,
                responder: tx,
            });
            if was_empty {
                if !state.surface_open {
                    state.surface_open = true;
                    self.surface.open();
                }
                self.surface.present(&request);
            }
            debug!(
                request_id = %id,
                ?kind,
                origin,
                position = state.queue.len(),
                "Consent request queued"
            );
        }
        (id, rx)
    }

    /// The wait ran out. If the entry already left the queue a decision was
    /// sent under the lock before we got here, so that decision wins.
    fn settle_expired(&self, id: &str, rx: &mut oneshot::Receiver<RequestOutcome>) -> Result<RequestOutcome> {
        if self.expire(id) {
            return Err(WalletError::Rejected("Consent request timed out".into()));
        }
        debug!(request_id = %id, "Consent decision arrived at the deadline");
        rx.try_recv().map_err(|_| dropped())
    }

    /// Queue a request and fail unless it is approved. Returns the data the
    /// user attached to the approval.
    pub async fn request_approval(
        &self,
        kind: RequestType,
        payload: Value,
        origin: &str,
    ) -> Result<Option<Value>> {
        let outcome = self.new_request(kind, payload, origin).await?;
        match outcome.decision {
            RequestDecision::Approved => Ok(outcome.data),
            RequestDecision::Rejected => Err(WalletError::Rejected("Request rejected by user".into())),
        }
    }

    /// Resolve the head request. Any other id fails and leaves the queue
    /// untouched.
    pub fn finalize_request(&self, id: &str, decision: RequestDecision, data: Option<Value>) -> Result<()> {
        let mut state = self.state();
        let head = state
            .queue
            .front()
            .ok_or_else(|| WalletError::NotFound("No pending requests".into()))?;
        if head.request.id != id {
            return Err(WalletError::InvalidState(format!(
                "Request {id} is not the current request"
            )));
        }

        let Some(entry) = state.queue.pop_front() else {
            return Err(WalletError::NotFound("No pending requests".into()));
        };
        if entry.responder.send(RequestOutcome { decision, data }).is_err() {
            debug!(request_id = %id, "Requester stopped waiting");
        }
        info!(request_id = %id, ?decision, "Consent request finalized");

        self.advance(&mut state);
        Ok(())
    }

    /// The user dismissed the surface. Rejects every request that belongs
    /// to it and returns how many were rejected.
    pub fn surface_closed(&self) -> usize {
        let mut state = self.state();
        if !state.surface_open {
            return 0;
        }

        let generation = state.generation;
        let mut rejected = 0;
        let mut remaining = VecDeque::with_capacity(state.queue.len());
        for entry in state.queue.drain(..) {
            if entry.generation == generation {
                let _ = entry.responder.send(RequestOutcome::rejected());
                rejected += 1;
            } else {
                remaining.push_back(entry);
            }
        }
        state.queue = remaining;
        state.surface_open = false;
        info!(rejected, "Consent surface closed by user");

        if let Some(head) = state.queue.front() {
            let request = head.request.clone();
            state.generation += 1;
            let generation = state.generation;
            for entry in state.queue.iter_mut() {
                entry.generation = generation;
            }
            state.surface_open = true;
            self.surface.open();
            self.surface.present(&request);
        }
        rejected
    }

    /// Reject everything still queued, close the surface and reject every
    /// later request on arrival. Used when the host shuts down.
    pub fn shut_down(&self) -> usize {
        let mut state = self.state();
        state.shut_down = true;
        let rejected = state.queue.len();
        for entry in state.queue.drain(..) {
            let _ = entry.responder.send(RequestOutcome::rejected());
        }
        if state.surface_open {
            state.surface_open = false;
            self.surface.close();
        }
        if rejected > 0 {
            info!(rejected, "Pending consent requests rejected");
        }
        rejected
    }

    /// Snapshot of the queue, head first.
    pub fn pending(&self) -> Vec<PendingRequest> {
        self.state().queue.iter().map(|e| e.request.clone()).collect()
    }

    pub fn is_surface_open(&self) -> bool {
        self.state().surface_open
    }

    /// Ask the surface to show itself without queueing a request (used to
    /// prompt for unlock).
    pub fn prompt(&self) {
        let mut state = self.state();
        if !state.surface_open {
            state.surface_open = true;
            state.generation += 1;
            self.surface.open();
        }
    }

    /// Close a surface opened by [`prompt`](Self::prompt) when no request
    /// ended up being queued on it.
    pub fn release_prompt(&self) {
        let mut state = self.state();
        if state.surface_open && state.queue.is_empty() {
            debug!("Unlock prompt released");
            self.advance(&mut state);
        }
    }

    /// Drop an entry whose requester gave up waiting. Returns false when the
    /// entry was already resolved.
    fn expire(&self, id: &str) -> bool {
        let mut state = self.state();
        let Some(index) = state.queue.iter().position(|e| e.request.id == id) else {
            return false;
        };
        warn!(request_id = %id, "Consent request timed out");
        state.queue.remove(index);
        if index == 0 {
            self.advance(&mut state);
        }
        true
    }

    /// Present the new head or close the surface once the queue drained.
    fn advance(&self, state: &mut BrokerState) {
        match state.queue.front() {
            Some(next) => self.surface.present(&next.request),
            None => {
                state.surface_open = false;
                self.surface.close();
            }
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn dropped() -> WalletError {
    WalletError::Internal("Consent request was dropped".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn broker(timeout: Option<Duration>) -> (Arc<RequestBroker>, mpsc::UnboundedReceiver<SurfaceEvent>) {
        let (surface, events) = ChannelConsentSurface::new();
        (Arc::new(RequestBroker::new(Arc::new(surface), timeout)), events)
    }

    async fn wait_for_pending(broker: &RequestBroker, count: usize) {
        while broker.pending().len() < count {
            tokio::task::yield_now().await;
        }
    }

    fn spawn_request(
        broker: &Arc<RequestBroker>,
        origin: &'static str,
    ) -> tokio::task::JoinHandle<Result<RequestOutcome>> {
        let broker = Arc::clone(broker);
        tokio::spawn(async move {
            broker
                .new_request(RequestType::SemaphoreProof, json!({ "origin": origin }), origin)
                .await
        })
    }

    #[tokio::test]
    async fn test_fifo_with_single_surface() {
        let (broker, mut events) = broker(None);

        let first = spawn_request(&broker, "https://a.example");
        wait_for_pending(&broker, 1).await;
        let second = spawn_request(&broker, "https://b.example");
        wait_for_pending(&broker, 2).await;

        assert_eq!(events.recv().await, Some(SurfaceEvent::Open));
        let pending = broker.pending();
        assert!(matches!(events.recv().await, Some(SurfaceEvent::Present(r)) if r.id == pending[0].id));
        // second request did not open another surface
        assert!(events.try_recv().is_err());

        // only the head can be finalized
        let err = broker
            .finalize_request(&pending[1].id, RequestDecision::Approved, None)
            .unwrap_err();
        assert!(matches!(err, WalletError::InvalidState(_)));
        assert_eq!(broker.pending().len(), 2);
        assert!(!second.is_finished());

        broker
            .finalize_request(&pending[0].id, RequestDecision::Approved, Some(json!(1)))
            .unwrap();
        let outcome = first.await.unwrap().unwrap();
        assert_eq!(outcome.decision, RequestDecision::Approved);
        assert_eq!(outcome.data, Some(json!(1)));
        assert!(matches!(events.recv().await, Some(SurfaceEvent::Present(r)) if r.id == pending[1].id));

        broker
            .finalize_request(&pending[1].id, RequestDecision::Rejected, None)
            .unwrap();
        assert_eq!(
            second.await.unwrap().unwrap().decision,
            RequestDecision::Rejected
        );
        assert_eq!(events.recv().await, Some(SurfaceEvent::Close));
        assert!(!broker.is_surface_open());
    }

    #[tokio::test]
    async fn test_finalize_empty_queue() {
        let (broker, _events) = broker(None);
        let err = broker
            .finalize_request("nope", RequestDecision::Approved, None)
            .unwrap_err();
        assert!(matches!(err, WalletError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_surface_close_rejects_everything_pending() {
        let (broker, _events) = broker(None);

        let first = spawn_request(&broker, "https://a.example");
        let second = spawn_request(&broker, "https://b.example");
        wait_for_pending(&broker, 2).await;

        assert_eq!(broker.surface_closed(), 2);
        assert_eq!(first.await.unwrap().unwrap().decision, RequestDecision::Rejected);
        assert_eq!(second.await.unwrap().unwrap().decision, RequestDecision::Rejected);
        assert!(broker.pending().is_empty());
        assert!(!broker.is_surface_open());

        // closing again is a no-op
        assert_eq!(broker.surface_closed(), 0);
    }

    #[tokio::test]
    async fn test_request_approval_maps_rejection() {
        let (broker, _events) = broker(None);
        let waiter = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move {
                broker
                    .request_approval(RequestType::Connect, json!({}), "https://a.example")
                    .await
            })
        };
        wait_for_pending(&broker, 1).await;
        let id = broker.pending()[0].id.clone();
        broker
            .finalize_request(&id, RequestDecision::Rejected, None)
            .unwrap();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, WalletError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_timeout_removes_entry_and_closes_surface() {
        let (broker, mut events) = broker(Some(Duration::from_millis(20)));

        let err = broker
            .new_request(RequestType::Dummy, json!(null), "https://a.example")
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::Rejected(_)));
        assert!(broker.pending().is_empty());

        assert_eq!(events.recv().await, Some(SurfaceEvent::Open));
        assert!(matches!(events.recv().await, Some(SurfaceEvent::Present(_))));
        assert_eq!(events.recv().await, Some(SurfaceEvent::Close));
    }

    #[tokio::test]
    async fn test_decision_at_deadline_is_kept() {
        let (broker, _events) = broker(Some(Duration::from_millis(20)));

        let (id, mut rx) = broker.enqueue(RequestType::Dummy, json!(null), "https://a.example");
        broker
            .finalize_request(&id, RequestDecision::Approved, Some(json!("ok")))
            .unwrap();

        let outcome = broker.settle_expired(&id, &mut rx).unwrap();
        assert_eq!(outcome.decision, RequestDecision::Approved);
        assert_eq!(outcome.data, Some(json!("ok")));
    }

    #[tokio::test]
    async fn test_expired_without_decision_is_rejected() {
        let (broker, mut events) = broker(None);

        let (id, mut rx) = broker.enqueue(RequestType::Dummy, json!(null), "https://a.example");
        let err = broker.settle_expired(&id, &mut rx).unwrap_err();
        assert!(matches!(err, WalletError::Rejected(_)));
        assert!(broker.pending().is_empty());
        assert!(!broker.is_surface_open());

        assert_eq!(events.recv().await, Some(SurfaceEvent::Open));
        assert!(matches!(events.recv().await, Some(SurfaceEvent::Present(_))));
        assert_eq!(events.recv().await, Some(SurfaceEvent::Close));
    }

    #[tokio::test]
    async fn test_release_prompt_closes_idle_surface() {
        let (broker, mut events) = broker(None);

        broker.prompt();
        assert!(broker.is_surface_open());
        broker.release_prompt();
        assert!(!broker.is_surface_open());
        assert_eq!(events.recv().await, Some(SurfaceEvent::Open));
        assert_eq!(events.recv().await, Some(SurfaceEvent::Close));

        // a surface with queued work stays up
        let waiter = spawn_request(&broker, "https://a.example");
        wait_for_pending(&broker, 1).await;
        broker.release_prompt();
        assert!(broker.is_surface_open());
        assert_eq!(broker.shut_down(), 1);
        assert_eq!(waiter.await.unwrap().unwrap().decision, RequestDecision::Rejected);
        assert!(!broker.is_surface_open());
    }

    #[tokio::test]
    async fn test_requests_after_shut_down_are_rejected() {
        let (broker, mut events) = broker(None);
        assert_eq!(broker.shut_down(), 0);

        let outcome = broker
            .new_request(RequestType::Dummy, json!(null), "https://a.example")
            .await
            .unwrap();
        assert_eq!(outcome.decision, RequestDecision::Rejected);
        assert!(broker.pending().is_empty());
        assert!(events.try_recv().is_err());
    }
}
