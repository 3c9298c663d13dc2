//! Triproxy core — single-port forward proxy engine
//!
//! Accepts client connections on one listening socket and bridges them to
//! arbitrary upstream TCP endpoints using one of three client-selected
//! dialects: plain HTTP forwarding, HTTPS via the HTTP `CONNECT` method, and
//! SOCKS version 5.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐   peek 1 byte    ┌───────────────┐
//! │  TcpListener│ ───────────────▶│  dispatcher   │
//! └────────────┘                  └──────┬────────┘
//!                           0x05  ┌───────┴────────┐  else
//!                                 ▼                 ▼
//!                          ┌────────────┐   ┌───────────────┐
//!                          │ socks5     │   │ http / connect│
//!                          └─────┬──────┘   └───────┬───────┘
//!                                └─────────┬─────────┘
//!                                          ▼
//!                                  ┌───────────────┐
//!                                  │ bidirectional │
//!                                  │     pump      │
//!                                  └───────────────┘
//! ```
//!
//! This crate implements only the per-connection engine. Process bootstrap,
//! the command surface, and logging initialization live in `triproxy-cli`.

mod auth;
mod config;
mod dispatcher;
mod error;
mod http;
mod pump;
mod socks5;
mod stats;

pub use auth::{AuthError, Authenticator};
pub use config::{AuthConfig, ConfigError, LogLevel, Protocol, ProxyConfig};
pub use dispatcher::Server;
pub use error::ProxyError;
pub use stats::{ConnectionRecord, Dialect, Stats, Status};
