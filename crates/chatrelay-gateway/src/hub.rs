//! Connection hub
//!
//! A single task owns the member set. Register, unregister and broadcast are
//! requests on one channel, so membership is never mutated concurrently and
//! no lock is needed.

use crate::connection::{Connection, Outbound, PushError};
use bytes::Bytes;
use chatrelay_core::ConnectionId;
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

const REQUEST_CAPACITY: usize = 1024;

enum Request {
    Register(ConnectionId, Outbound),
    Unregister(ConnectionId, Outbound),
    Broadcast(Bytes),
    MemberCount(oneshot::Sender<usize>),
}

pub struct Hub {
    members: HashMap<ConnectionId, Outbound>,
    requests: mpsc::Receiver<Request>,
}

/// Cheap, cloneable way to submit requests to the hub task.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<Request>,
}

impl Hub {
    pub fn new() -> (Hub, HubHandle) {
        let (tx, requests) = mpsc::channel(REQUEST_CAPACITY);
        let hub = Hub {
            members: HashMap::new(),
            requests,
        };
        (hub, HubHandle { tx })
    }

    /// Start the hub on its own task.
    pub fn spawn() -> HubHandle {
        let (hub, handle) = Self::new();
        tokio::spawn(hub.run());
        handle
    }

    /// Runs until every handle has been dropped.
    pub async fn run(mut self) {
        while let Some(request) = self.requests.recv().await {
            match request {
                Request::Register(id, outbound) => self.register(id, outbound),
                Request::Unregister(id, outbound) => self.unregister(id, &outbound),
                Request::Broadcast(payload) => self.broadcast(payload),
                Request::MemberCount(reply) => {
                    let _ = reply.send(self.members.len());
                }
            }
        }
        info!(members = self.members.len(), "hub stopped");
    }

    fn register(&mut self, id: ConnectionId, outbound: Outbound) {
        self.members.insert(id, outbound);
        debug!(conn = %id, members = self.members.len(), "registered");
    }

    fn unregister(&mut self, id: ConnectionId, outbound: &Outbound) {
        if self.members.remove(&id).is_some() {
            debug!(conn = %id, members = self.members.len(), "unregistered");
        }
        outbound.close();
    }

    fn broadcast(&mut self, payload: Bytes) {
        let mut dropped = Vec::new();
        for (id, outbound) in &self.members {
            match outbound.try_push(payload.clone()) {
                Ok(()) => {}
                Err(PushError::Full) => {
                    warn!(conn = %id, "outbound queue full, disconnecting slow client");
                    dropped.push(*id);
                }
                Err(PushError::Closed) => {
                    debug!(conn = %id, "outbound queue already closed");
                    dropped.push(*id);
                }
            }
        }
        for id in dropped {
            if let Some(outbound) = self.members.remove(&id) {
                outbound.close();
            }
        }
    }
}

impl HubHandle {
    pub async fn register(&self, conn: &Connection) {
        self.submit(Request::Register(conn.id(), conn.outbound().clone()))
            .await;
    }

    /// Removes the connection if present and closes its outbound queue.
    pub async fn unregister(&self, conn: &Connection) {
        self.submit(Request::Unregister(conn.id(), conn.outbound().clone()))
            .await;
    }

    pub async fn broadcast(&self, payload: Bytes) {
        self.submit(Request::Broadcast(payload)).await;
    }

    /// `None` if the hub task is gone.
    pub async fn member_count(&self) -> Option<usize> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Request::MemberCount(reply)).await.ok()?;
        rx.await.ok()
    }

    async fn submit(&self, request: Request) {
        if self.tx.send(request).await.is_err() {
            warn!("hub stopped, request dropped");
        }
    }
}
