//! Network layer for recproxy
//!
//! Provides the async HTTP/1.1 server, control routing and the upstream client.

mod client;
mod connection_pool;
mod http;
mod server;

pub use client::{upstream_uri, ForwardedResponse, HttpClient};
pub use connection_pool::{ConnectionGuard, ConnectionPool};
pub use http::HttpHandler;
pub use server::ProxyServer;

/// Maximum number of concurrent connections
pub const MAX_CONNECTIONS: usize = 4096;

/// Graceful shutdown timeout
pub const SHUTDOWN_TIMEOUT_MS: u64 = 5000;
