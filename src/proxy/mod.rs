//! Ingress parsing.
//!
//! Two client protocols share one listening port. The first byte decides:
//! SOCKS5 greetings start with the version byte `0x05`, while every HTTP
//! method keyword starts with an ASCII uppercase letter, which sorts
//! strictly above it.

mod http;
mod socks5;

use std::fmt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

/// Ingress errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported protocol (first byte {0:#04x})")]
    UnknownProtocol(u8),

    #[error("invalid SOCKS version: {0}")]
    InvalidVersion(u8),

    #[error("client offers no supported auth method")]
    NoAuthMethod,

    #[error("unsupported command: {0}")]
    UnsupportedCommand(u8),

    #[error("IPv6 destinations are not supported")]
    Ipv6Unsupported,

    #[error("unsupported address type: {0}")]
    UnsupportedAddressType(u8),

    #[error("invalid request line")]
    InvalidRequestLine,

    #[error("invalid target URL: {0}")]
    InvalidTarget(String),
}

/// Where the client wants to go. `host` is a DNS name or a dotted quad,
/// never an IPv6 literal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// What ingress parsing yields: the destination, plus any bytes owed to
/// either side once the upstream handshake is done.
#[derive(Debug)]
pub struct Ingress {
    pub destination: Destination,
    /// Written to the client after the upstream handshake
    /// (the HTTP CONNECT `200 OK`).
    pub client_reply: Option<Vec<u8>>,
    /// Plaintext request head relayed to the upstream as the first frame
    /// (the rewritten non-CONNECT HTTP head).
    pub upstream_preamble: Option<Vec<u8>>,
}

/// Read one byte from the client and dispatch to the matching parser.
pub async fn accept<S>(stream: &mut S) -> Result<Ingress, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut first = [0u8; 1];
    stream.read_exact(&mut first).await?;

    match first[0] {
        0x05 => socks5::accept(stream).await,
        b if b > 0x05 => http::accept(stream, b).await,
        b => Err(ProxyError::UnknownProtocol(b)),
    }
}
