//! # goixy
//!
//! A local forwarding proxy. Clients speak SOCKS5 or HTTP/HTTPS-proxy on a
//! single listening port; traffic is relayed to one of two upstream relays
//! over an encrypted, length-framed protocol. Destination hosts matching a
//! whitelist of regular expressions go to the primary relay, everything
//! else goes to the direct relay.
//!
//! ```text
//! ┌────────────┐  SOCKS5 / HTTP  ┌────────────┐  u16-framed AEAD  ┌──────────┐
//! │  browser,  │ ──────────────► │   goixy    │ ────────────────► │ upstream │
//! │  curl, ... │ ◄────────────── │  (local)   │ ◄──────────────── │  relay   │
//! └────────────┘                 └────────────┘                   └──────────┘
//! ```
//!
//! The proxy never resolves or dials the destination itself; the upstream
//! relay does, after validating an encrypted check token.

pub mod config;
pub mod crypto;
pub mod proxy;
pub mod router;
pub mod server;
pub mod stats;
pub mod tunnel;

use std::time::Duration;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Client reads are capped at this size so a sealed chunk always fits the
/// u16 frame length on the wire.
pub const CHUNK_SIZE: usize = 8192;

/// A tunnel with no traffic in either direction for this long is torn down.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// How often the reporter walks the accounting registry.
pub const REPORT_INTERVAL: Duration = Duration::from_secs(600);

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("{0}")]
    Proxy(#[from] proxy::ProxyError),

    #[error("{0}")]
    Tunnel(#[from] tunnel::TunnelError),
}
