//! Chatrelay Gateway - authenticated WebSocket chat relay

pub mod auth;
pub mod connection;
pub mod hub;
pub mod identity;
pub mod server;
pub mod ws;

pub use server::{router, serve, start_gateway, GatewayState};
