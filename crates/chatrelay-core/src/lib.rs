//! Chatrelay Core - Envelope protocol, identity and configuration types, errors

pub mod error;
pub mod protocol;
pub mod types;

pub use error::{Error, Result};
pub use protocol::*;
pub use types::*;
