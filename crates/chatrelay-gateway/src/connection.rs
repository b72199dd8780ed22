//! Per-connection state and the bounded outbound queue
//!
//! The queue has two ends. [`Outbound`] is cloned into the hub (fan-out) and
//! kept by the read pump (notices). [`OutboundReceiver`] belongs to the write
//! pump. Closing is a separate signal from dropping senders so the hub can
//! close a queue the read pump still holds.

use crate::auth::AuthState;
use bytes::Bytes;
use chatrelay_core::{ConnectionId, Identity, Notice};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PushError {
    #[error("outbound queue full")]
    Full,
    #[error("outbound queue closed")]
    Closed,
}

/// Sending half of a connection's outbound queue.
#[derive(Clone, Debug)]
pub struct Outbound {
    tx: mpsc::Sender<Bytes>,
    closed: CancellationToken,
}

impl Outbound {
    pub fn channel(capacity: usize) -> (Outbound, OutboundReceiver) {
        let (tx, rx) = mpsc::channel(capacity);
        let closed = CancellationToken::new();
        (
            Outbound {
                tx,
                closed: closed.clone(),
            },
            OutboundReceiver { rx, closed },
        )
    }

    /// Enqueue without waiting. Used by the hub during fan-out.
    pub fn try_push(&self, payload: Bytes) -> Result<(), PushError> {
        if self.closed.is_cancelled() {
            return Err(PushError::Closed);
        }
        self.tx.try_send(payload).map_err(|e| match e {
            TrySendError::Full(_) => PushError::Full,
            TrySendError::Closed(_) => PushError::Closed,
        })
    }

    /// Enqueue, waiting for room unless the queue is closed meanwhile.
    pub async fn push(&self, payload: Bytes) -> Result<(), PushError> {
        if self.closed.is_cancelled() {
            return Err(PushError::Closed);
        }
        tokio::select! {
            sent = self.tx.send(payload) => sent.map_err(|_| PushError::Closed),
            _ = self.closed.cancelled() => Err(PushError::Closed),
        }
    }

    /// Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

/// Receiving half, drained by the write pump.
#[derive(Debug)]
pub struct OutboundReceiver {
    rx: mpsc::Receiver<Bytes>,
    closed: CancellationToken,
}

impl OutboundReceiver {
    /// Next queued payload. Payloads queued before the close are still
    /// delivered; `None` means closed and drained.
    pub async fn recv(&mut self) -> Option<Bytes> {
        tokio::select! {
            biased;
            payload = self.rx.recv() => payload,
            _ = self.closed.cancelled() => self.rx.try_recv().ok(),
        }
    }

    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }
}

/// One client's live session.
pub struct Connection {
    id: ConnectionId,
    outbound: Outbound,
    state: AuthState,
}

impl Connection {
    pub fn new(queue_capacity: usize) -> (Connection, OutboundReceiver) {
        let (outbound, rx) = Outbound::channel(queue_capacity);
        let conn = Connection {
            id: ConnectionId::new(),
            outbound,
            state: AuthState::Unauthenticated,
        };
        (conn, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn outbound(&self) -> &Outbound {
        &self.outbound
    }

    pub fn state(&self) -> &AuthState {
        &self.state
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.is_authenticated()
    }

    pub fn authenticate(&mut self, identity: Identity) {
        self.state = AuthState::Authenticated(identity);
    }

    /// Queue a notice for this connection only.
    pub async fn notify(&self, notice: Notice) {
        if let Err(e) = self.outbound.push(Bytes::from_static(notice.as_bytes())).await {
            debug!(conn = %self.id, %notice, error = %e, "notice not queued");
        }
    }
}
