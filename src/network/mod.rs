//! Network layer for Betamax
//!
//! Accepts client connections with bounded concurrency and forwards
//! unreplayed requests to the upstream.

mod client;
mod handler;
mod http;

pub use client::HttpForwarder;
pub use handler::NetworkHandler;
pub use http::HttpHandler;

/// Graceful shutdown timeout
pub const SHUTDOWN_TIMEOUT_MS: u64 = 5000;
