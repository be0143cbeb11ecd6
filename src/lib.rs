//! Workergate - a reverse proxy that supervises one worker process per
//! application
//!
//! This library provides:
//! - Host-header routing of HTTP/1.1 and HTTP/2 traffic to local workers
//! - On-demand worker start with a free-port search and a readiness probe
//! - Crash recycling behind a rapid-fail circuit breaker
//! - Graceful worker shutdown: HTTP shutdown call, interrupt, then kill
//! - A per-request forwarding state machine with WebSocket relay

pub mod channel;
pub mod config;
pub mod error;
pub mod headers;
pub mod host;
pub mod launcher;
pub mod port;
pub mod probe;
pub mod process;
pub mod procfs;
pub mod proxy;
pub mod session;
pub mod supervisor;
pub mod websocket;

#[cfg(test)]
mod testing;

pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
