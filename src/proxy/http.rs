//! HTTP-proxy ingress: CONNECT tunnels and absolute-form requests.
//!
//! Parsing is deliberately shallow. Only the request line matters: the
//! target token between the method and ` HTTP/` names the destination,
//! and for plain-HTTP requests the absolute-form target is rewritten to
//! origin-form before the head is relayed upstream.

use super::{Destination, Ingress, ProxyError};
use regex::bytes::Regex;
use std::sync::LazyLock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tracing::{debug, trace};
use url::Url;

/// Reply owed to a CONNECT client once the upstream handshake is done.
const CONNECT_REPLY: &[u8] = b"HTTP/1.0 200 OK\r\n\r\n";

/// Target token: first space through ` HTTP/` on the request line.
static TARGET: LazyLock<Regex> = LazyLock::new(|| Regex::new(r" .* HTTP/").unwrap());

/// Absolute-form request lines rewritten to origin-form. Only GET and
/// HEAD; other methods pass through with the absolute URI intact.
static REWRITE_GET: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^GET https?://[^/]+/").unwrap());
static REWRITE_HEAD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^HEAD https?://[^/]+/").unwrap());

/// Parse the request head. The dispatcher already consumed the first
/// byte, which is passed back in via `first`.
pub(super) async fn accept<S>(stream: &mut S, first: u8) -> Result<Ingress, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; crate::CHUNK_SIZE];
    buf[0] = first;
    let n = stream.read(&mut buf[1..]).await?;
    let head = &buf[..n + 1];
    trace!("request head:\n{}", String::from_utf8_lossy(head));

    let parsed = parse_head(head)?;
    debug!(
        "http {} destination {}",
        if parsed.connect { "connect" } else { "forward" },
        parsed.destination
    );

    let client_reply = parsed.connect.then(|| CONNECT_REPLY.to_vec());
    Ok(Ingress {
        destination: parsed.destination,
        client_reply,
        upstream_preamble: parsed.rewritten,
    })
}

#[derive(Debug)]
struct RequestHead {
    destination: Destination,
    connect: bool,
    /// Origin-form head to relay upstream; `None` for CONNECT, whose
    /// client resends everything once the tunnel is up.
    rewritten: Option<Vec<u8>>,
}

fn parse_head(head: &[u8]) -> Result<RequestHead, ProxyError> {
    let connect = head.starts_with(b"CONNECT");

    let target = TARGET
        .find(head)
        .ok_or(ProxyError::InvalidRequestLine)?
        .as_bytes();
    let target = &target[1..target.len() - b" HTTP/".len()];
    let target = String::from_utf8_lossy(target);

    // Default the scheme so one URL parser handles both target forms.
    let with_scheme = if target.starts_with("http://") || target.starts_with("https://") {
        target.to_string()
    } else {
        format!("http://{target}")
    };
    let url = Url::parse(&with_scheme)
        .map_err(|e| ProxyError::InvalidTarget(format!("{with_scheme}: {e}")))?;

    let host = match url.host() {
        Some(url::Host::Domain(domain)) => domain.to_string(),
        Some(url::Host::Ipv4(ip)) => ip.to_string(),
        Some(url::Host::Ipv6(_)) => return Err(ProxyError::Ipv6Unsupported),
        None => return Err(ProxyError::InvalidTarget(with_scheme)),
    };
    let port = url.port().unwrap_or(80);

    let rewritten = if connect {
        None
    } else {
        let head = REWRITE_GET.replace(head, &b"GET /"[..]);
        let head = REWRITE_HEAD.replace(&head, &b"HEAD /"[..]);
        Some(head.into_owned())
    };

    Ok(RequestHead {
        destination: Destination { host, port },
        connect,
        rewritten,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_head() {
        let parsed = parse_head(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n").unwrap();
        assert!(parsed.connect);
        assert_eq!(parsed.destination.host, "example.com");
        assert_eq!(parsed.destination.port, 443);
        assert!(parsed.rewritten.is_none());
    }

    #[test]
    fn test_get_rewritten_to_origin_form() {
        let parsed =
            parse_head(b"GET http://example.com/path HTTP/1.1\r\nHost: example.com\r\n\r\n")
                .unwrap();
        assert!(!parsed.connect);
        assert_eq!(parsed.destination.host, "example.com");
        assert_eq!(parsed.destination.port, 80);

        let head = parsed.rewritten.unwrap();
        assert!(head.starts_with(b"GET /path HTTP/1.1\r\n"));
    }

    #[test]
    fn test_head_rewritten_to_origin_form() {
        let parsed = parse_head(b"HEAD https://example.com/x/y HTTP/1.1\r\n\r\n").unwrap();
        let head = parsed.rewritten.unwrap();
        assert!(head.starts_with(b"HEAD /x/y HTTP/1.1\r\n"));
    }

    #[test]
    fn test_post_passes_through_unchanged() {
        let input = b"POST http://example.com/submit HTTP/1.1\r\n\r\nbody";
        let parsed = parse_head(input).unwrap();
        assert_eq!(parsed.rewritten.unwrap(), input.to_vec());
    }

    #[test]
    fn test_explicit_port_kept() {
        let parsed = parse_head(b"GET http://example.com:8080/ HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(parsed.destination.port, 8080);
    }

    #[test]
    fn test_port_defaults_to_80() {
        let parsed = parse_head(b"GET http://example.com/ HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(parsed.destination.port, 80);
    }

    #[test]
    fn test_ipv4_literal_target() {
        let parsed = parse_head(b"CONNECT 192.168.0.7:8443 HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(parsed.destination.host, "192.168.0.7");
        assert_eq!(parsed.destination.port, 8443);
    }

    #[test]
    fn test_bracketed_ipv6_rejected() {
        let result = parse_head(b"CONNECT [::1]:443 HTTP/1.1\r\n\r\n");
        assert!(matches!(result, Err(ProxyError::Ipv6Unsupported)));
    }

    #[test]
    fn test_missing_http_marker_rejected() {
        let result = parse_head(b"GET example.com\r\n\r\n");
        assert!(matches!(result, Err(ProxyError::InvalidRequestLine)));
    }
}
