//! Consent surface seam.
//!
//! The broker never renders anything. It tells a [`ConsentSurface`] when to
//! open, which request to present and when to close; the host decides what
//! that means (a popup, a terminal prompt, a channel to a UI process).

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use super::PendingRequest;

pub trait ConsentSurface: Send + Sync {
    fn open(&self);

    fn present(&self, request: &PendingRequest);

    fn close(&self);
}

/// Event emitted by [`ChannelConsentSurface`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "request", rename_all = "snake_case")]
pub enum SurfaceEvent {
    Open,
    Present(PendingRequest),
    Close,
}

/// Forwards surface commands over an unbounded channel. The broker emits
/// while holding its queue lock, so sending must never wait, and a dropped
/// `Close` would leave the host showing a stale surface.
pub struct ChannelConsentSurface {
    tx: mpsc::UnboundedSender<SurfaceEvent>,
}

impl ChannelConsentSurface {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SurfaceEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn emit(&self, event: SurfaceEvent) {
        if self.tx.send(event).is_err() {
            debug!("Consent surface receiver gone");
        }
    }
}

impl ConsentSurface for ChannelConsentSurface {
    fn open(&self) {
        self.emit(SurfaceEvent::Open);
    }

    fn present(&self, request: &PendingRequest) {
        self.emit(SurfaceEvent::Present(request.clone()));
    }

    fn close(&self) {
        self.emit(SurfaceEvent::Close);
    }
}
