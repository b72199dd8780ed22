//! WebSocket connection handling: one read pump and one write pump per client
//!
//! The read pump owns the receive half and the connection's auth state. The
//! write pump owns the send half, flushes the outbound queue and pings the
//! peer. A per-connection cancellation token stands for "transport closed":
//! whichever pump exits first cancels it and the other one follows.

use crate::auth::{AuthGate, AuthState};
use crate::connection::{Connection, OutboundReceiver};
use crate::hub::HubHandle;
use crate::server::GatewayState;
use axum::extract::ws::{Message, WebSocket};
use bytes::{BufMut, Bytes, BytesMut};
use chatrelay_core::{Action, ConnectionId, ConnectionLimits, Envelope, Notice};
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{self, error::ProtocolError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Serve one upgraded socket until both pumps have exited.
pub async fn handle_connection(socket: WebSocket, state: Arc<GatewayState>) {
    let (conn, outbound_rx) = Connection::new(state.limits.queue_capacity);
    let id = conn.id();
    state.hub.register(&conn).await;
    info!(conn = %id, "client connected");

    let (sink, stream) = socket.split();
    let transport = CancellationToken::new();

    let writer = WritePump::new(id, outbound_rx, &state.limits);
    let writer = tokio::spawn(writer.run(sink, transport.clone()));

    ReadPump::new(conn, &state).run(stream, transport).await;

    if let Err(e) = writer.await {
        warn!(conn = %id, error = %e, "write pump panicked");
    }
    info!(conn = %id, "client disconnected");
}

// ---------------------------------------------------------------------------
// Read pump
// ---------------------------------------------------------------------------

pub struct ReadPump {
    conn: Connection,
    gate: Arc<AuthGate>,
    hub: HubHandle,
    pong_wait: Duration,
    strict_decoding: bool,
}

impl ReadPump {
    pub fn new(conn: Connection, state: &GatewayState) -> Self {
        Self {
            conn,
            gate: state.gate.clone(),
            hub: state.hub.clone(),
            pong_wait: state.limits.pong_wait,
            strict_decoding: state.strict_decoding,
        }
    }

    /// Receive until the transport fails or closes, then unregister from the
    /// hub and close the transport, in that order.
    pub async fn run<S, E>(mut self, mut stream: S, transport: CancellationToken)
    where
        S: Stream<Item = Result<Message, E>> + Unpin,
        E: ReadError,
    {
        let _close_transport = transport.clone().drop_guard();
        self.receive(&mut stream, &transport).await;
        self.hub.unregister(&self.conn).await;
    }

    async fn receive<S, E>(&mut self, stream: &mut S, transport: &CancellationToken)
    where
        S: Stream<Item = Result<Message, E>> + Unpin,
        E: ReadError,
    {
        let id = self.conn.id();
        let mut deadline = Instant::now() + self.pong_wait;
        loop {
            let next = tokio::select! {
                _ = transport.cancelled() => {
                    debug!(conn = %id, "transport closed by writer");
                    return;
                }
                next = tokio::time::timeout_at(deadline, stream.next()) => next,
            };
            let message = match next {
                Err(_) => {
                    info!(conn = %id, pong_wait = ?self.pong_wait, "peer missed pong deadline");
                    return;
                }
                Ok(None) => return,
                Ok(Some(Err(e))) if e.is_peer_gone() => {
                    debug!(conn = %id, error = %e, "peer went away without closing");
                    return;
                }
                Ok(Some(Err(e))) => {
                    warn!(conn = %id, error = %e, "read error");
                    return;
                }
                Ok(Some(Ok(message))) => message,
            };
            match message {
                Message::Text(text) => self.handle_frame(text.as_bytes()).await,
                Message::Binary(data) => self.handle_frame(&data).await,
                Message::Pong(_) => deadline = Instant::now() + self.pong_wait,
                // Pings are answered by the protocol layer.
                Message::Ping(_) => {}
                Message::Close(frame) => {
                    debug!(conn = %id, ?frame, "peer closed");
                    return;
                }
            }
        }
    }

    async fn handle_frame(&mut self, data: &[u8]) {
        let mut envelope = match Envelope::decode(data) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(conn = %self.conn.id(), error = %e, "undecodable frame");
                if self.strict_decoding {
                    self.conn.notify(Notice::Undecodable).await;
                    return;
                }
                Envelope::default()
            }
        };

        let nickname = match self.conn.state() {
            AuthState::Authenticated(identity) => identity.display_name.clone(),
            AuthState::Unauthenticated => {
                if envelope.action == Action::Login {
                    self.login(envelope.token.as_deref()).await;
                } else {
                    self.conn.notify(Notice::AuthRequired).await;
                }
                return;
            }
        };

        match envelope.action {
            Action::Message => {
                envelope.stamp(&nickname, chrono::Utc::now().timestamp());
                match envelope.encode() {
                    Ok(payload) => self.hub.broadcast(Bytes::from(payload)).await,
                    Err(e) => {
                        warn!(conn = %self.conn.id(), error = %e, "dropping message that failed to encode")
                    }
                }
            }
            Action::Login | Action::Unknown => self.conn.notify(Notice::InvalidAction).await,
        }
    }

    async fn login(&mut self, token: Option<&str>) {
        let id = self.conn.id();
        let subject = match self.gate.verify(token) {
            Ok(subject) => subject,
            Err(e) => {
                info!(conn = %id, error = %e, "login rejected");
                self.conn.notify(Notice::TokenInvalid).await;
                return;
            }
        };
        self.conn.notify(Notice::TokenValid).await;

        let token = token.unwrap_or_default();
        match self.gate.resolve(&subject, token).await {
            Ok(identity) => {
                info!(conn = %id, subject = %identity.subject_id, nickname = %identity.display_name, "client authenticated");
                self.conn.authenticate(identity);
                self.conn.notify(Notice::Connected).await;
            }
            Err(e) => {
                if e.is_recoverable() {
                    info!(conn = %id, subject = %subject, error = %e, "identity lookup failed");
                } else {
                    warn!(conn = %id, subject = %subject, error = %e, "identity lookup failed");
                }
                self.conn.notify(Notice::LoginUnsuccessful).await;
            }
        }
    }
}

/// Error yielded by the receive half of a transport.
pub trait ReadError: Display {
    /// The peer dropped the connection, with or without a closing
    /// handshake. Not worth more than a debug line.
    fn is_peer_gone(&self) -> bool;
}

impl ReadError for axum::Error {
    fn is_peer_gone(&self) -> bool {
        peer_gone(self)
    }
}

impl ReadError for std::io::Error {
    fn is_peer_gone(&self) -> bool {
        io_peer_gone(self)
    }
}

fn peer_gone(mut err: &(dyn std::error::Error + 'static)) -> bool {
    loop {
        if let Some(e) = err.downcast_ref::<tungstenite::Error>() {
            return match e {
                tungstenite::Error::ConnectionClosed
                | tungstenite::Error::AlreadyClosed
                | tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake) => true,
                tungstenite::Error::Io(io) => io_peer_gone(io),
                _ => false,
            };
        }
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            return io_peer_gone(io);
        }
        match err.source() {
            Some(source) => err = source,
            None => return false,
        }
    }
}

fn io_peer_gone(err: &std::io::Error) -> bool {
    use std::io::ErrorKind::*;
    matches!(
        err.kind(),
        ConnectionReset | ConnectionAborted | BrokenPipe | UnexpectedEof
    )
}

// ---------------------------------------------------------------------------
// Write pump
// ---------------------------------------------------------------------------

pub struct WritePump {
    id: ConnectionId,
    outbound: OutboundReceiver,
    write_wait: Duration,
    ping_period: Duration,
    max_batch: usize,
}

impl WritePump {
    pub fn new(id: ConnectionId, outbound: OutboundReceiver, limits: &ConnectionLimits) -> Self {
        Self {
            id,
            outbound,
            write_wait: limits.write_wait,
            ping_period: limits.ping_period,
            max_batch: limits.queue_capacity,
        }
    }

    /// Flush and ping until the queue closes, a write fails, or the read
    /// pump goes away. The transport is closed on every exit path.
    ///
    /// The queue is polled first: the read pump closes it before cancelling
    /// the transport, so a closed queue is always drained and answered with
    /// a close frame.
    pub async fn run<S>(mut self, mut sink: S, transport: CancellationToken)
    where
        S: Sink<Message> + Unpin,
        S::Error: Display,
    {
        let _close_transport = transport.clone().drop_guard();
        if let Err(e) = self.pump(&mut sink, &transport).await {
            debug!(conn = %self.id, error = %e, "write failed");
        }
        let _ = tokio::time::timeout(self.write_wait, sink.close()).await;
    }

    async fn pump<S>(&mut self, sink: &mut S, transport: &CancellationToken) -> Result<(), String>
    where
        S: Sink<Message> + Unpin,
        S::Error: Display,
    {
        let mut ticker =
            tokio::time::interval_at(Instant::now() + self.ping_period, self.ping_period);
        loop {
            tokio::select! {
                biased;
                payload = self.outbound.recv() => {
                    let Some(first) = payload else {
                        debug!(conn = %self.id, "outbound closed, sending close frame");
                        return self.write(sink, Message::Close(None)).await;
                    };
                    let frame = self.coalesce(first);
                    self.write(sink, Message::Text(frame)).await?;
                }
                _ = ticker.tick() => {
                    self.write(sink, Message::Ping(Vec::new())).await?;
                }
                _ = transport.cancelled() => return Ok(()),
            }
        }
    }

    /// Joins whatever is already queued behind `first` into one frame.
    fn coalesce(&mut self, first: Bytes) -> String {
        let mut frame = BytesMut::from(&first[..]);
        for _ in 1..self.max_batch {
            let Some(next) = self.outbound.try_recv() else {
                break;
            };
            frame.put_u8(b'\n');
            frame.extend_from_slice(&next);
        }
        String::from_utf8_lossy(&frame).into_owned()
    }

    async fn write<S>(&self, sink: &mut S, message: Message) -> Result<(), String>
    where
        S: Sink<Message> + Unpin,
        S::Error: Display,
    {
        match tokio::time::timeout(self.write_wait, sink.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("write deadline of {:?} exceeded", self.write_wait)),
        }
    }
}
