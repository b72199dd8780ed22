//! WebSocket protocol — chat envelopes and server notices
//!
//! Wire format:
//!
//! Client → Server (envelope):
//!   { "action": "login", "token": "<jwt>" }
//!   { "action": "message", "message": "hi", "channel": "general" }
//!
//! Server → Client (fan-out, stamped by the server):
//!   { "action": "message", "message": "hi", "channel": "general", "timestamp": 1700000000, "nickname": "alice" }
//!
//! Server → Client (notice, sent to the originating connection only):
//!   { "error": "access token is invalid" }
//!   { "tokenValid": true, "info": "fetching username" }
//!   { "info": "connected" }

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize};

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// What the client wants the server to do with an envelope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Login,
    Message,
    /// Missing, empty or unrecognised action.
    #[default]
    #[serde(other)]
    Unknown,
}

/// The unit of client/server communication.
///
/// Every field is optional on the wire and `null` reads as absent.
/// `timestamp` and `nickname` are assigned by the server and whatever the
/// sender supplied is discarded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, deserialize_with = "null_as_default")]
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub message: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub channel: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub timestamp: i64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub nickname: String,
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl Envelope {
    pub fn decode(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| Error::InvalidMessage(e.to_string()))
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Overwrite the server-assigned fields before fan-out. The sender's
    /// token never leaves the connection it arrived on.
    pub fn stamp(&mut self, nickname: &str, timestamp: i64) {
        self.nickname = nickname.to_string();
        self.timestamp = timestamp;
        self.token = None;
    }
}

// ---------------------------------------------------------------------------
// Notices
// ---------------------------------------------------------------------------

/// Structured notice sent back to the originating connection only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    /// Non-login envelope from an unauthenticated connection.
    AuthRequired,
    /// Authenticated connection sent something other than a message.
    InvalidAction,
    TokenInvalid,
    /// Signature checked out; the identity lookup is about to run.
    TokenValid,
    LoginUnsuccessful,
    Connected,
    /// Only emitted when strict decoding is enabled.
    Undecodable,
}

impl Notice {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Notice::AuthRequired => r#"{"error":"you need to authenticate first"}"#,
            Notice::InvalidAction => r#"{"error":"valid action need to be choosen"}"#,
            Notice::TokenInvalid => r#"{"error":"access token is invalid"}"#,
            Notice::TokenValid => r#"{"tokenValid":true,"info":"fetching username"}"#,
            Notice::LoginUnsuccessful => {
                r#"{"error":"failed fetching username, login unsuccessful"}"#
            }
            Notice::Connected => r#"{"info":"connected"}"#,
            Notice::Undecodable => r#"{"error":"message could not be decoded"}"#,
        }
    }

    pub const fn as_bytes(&self) -> &'static [u8] {
        self.as_str().as_bytes()
    }
}

impl std::fmt::Display for Notice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
