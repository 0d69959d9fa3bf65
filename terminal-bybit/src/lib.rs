//! Bybit integration for the Trading Terminal
//!
//! This crate provides a signed client for the Bybit v5 REST API (linear
//! perpetuals) and a streaming transport for the public ticker feed.

pub mod auth;
pub mod client;
pub mod types;
pub mod websocket;

pub use auth::Credentials;
pub use client::{BybitClient, BybitClientConfig};
pub use websocket::{BybitStreamConfig, ReconnectPolicy, StreamEvent, StreamTransport};
