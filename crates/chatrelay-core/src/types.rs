//! Core types for Chatrelay

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Identifies one live connection for the lifetime of the process.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity resolved for an authenticated connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub subject_id: String,
    pub display_name: String,
}

impl Identity {
    pub fn new(subject_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            display_name: display_name.into(),
        }
    }
}

/// Per-connection timing and sizing limits.
#[derive(Clone, Debug)]
pub struct ConnectionLimits {
    /// Time allowed to write one frame to the peer.
    pub write_wait: Duration,
    /// Time allowed between pongs before the peer is considered gone.
    pub pong_wait: Duration,
    /// Ping interval. Must be shorter than `pong_wait`.
    pub ping_period: Duration,
    /// Largest inbound message accepted, in bytes.
    pub max_message_size: usize,
    /// Outbound queue capacity per connection.
    pub queue_capacity: usize,
    /// Upper bound on one identity provider round trip.
    pub identity_timeout: Duration,
}

impl ConnectionLimits {
    /// Sets the pong wait and derives the ping period as 90% of it.
    pub fn with_pong_wait(mut self, pong_wait: Duration) -> Self {
        self.pong_wait = pong_wait;
        self.ping_period = pong_wait * 9 / 10;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.ping_period.is_zero() || self.ping_period >= self.pong_wait {
            return Err(Error::config(format!(
                "ping period {:?} must be non-zero and shorter than pong wait {:?}",
                self.ping_period, self.pong_wait
            )));
        }
        if self.write_wait.is_zero() {
            return Err(Error::config("write wait must be non-zero"));
        }
        if self.queue_capacity == 0 {
            return Err(Error::config("queue capacity must be at least 1"));
        }
        if self.max_message_size == 0 {
            return Err(Error::config("max message size must be at least 1"));
        }
        Ok(())
    }
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            write_wait: Duration::from_secs(10),
            pong_wait: Duration::from_secs(60),
            ping_period: Duration::from_secs(54),
            max_message_size: 2048,
            queue_capacity: 256,
            identity_timeout: Duration::from_secs(10),
        }
    }
}

/// Buffer sizing handed to the WebSocket upgrade.
#[derive(Clone, Debug)]
pub struct TransportConfig {
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    pub max_write_buffer_size: usize,
    pub max_frame_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 2048,
            write_buffer_size: 2048,
            max_write_buffer_size: usize::MAX,
            max_frame_size: 2048,
        }
    }
}

/// Gateway configuration
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub listen: SocketAddr,
    /// Environment profile name; selects the `.<profile>` env file.
    pub profile: String,
    /// Base URL of the identity provider.
    pub identity_url: String,
    pub public_key_path: PathBuf,
    pub limits: ConnectionLimits,
    pub transport: TransportConfig,
    /// Answer undecodable frames with an explicit notice.
    pub strict_decoding: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            profile: "dev".to_string(),
            identity_url: String::new(),
            public_key_path: PathBuf::from("pub.pem"),
            limits: ConnectionLimits::default(),
            transport: TransportConfig::default(),
            strict_decoding: false,
        }
    }
}
