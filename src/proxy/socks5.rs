//! SOCKS5 ingress (RFC 1928 subset: no-auth, CONNECT/BIND, IPv4/domain).

use super::{Destination, Ingress, ProxyError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// SOCKS5 version
const SOCKS_VERSION: u8 = 0x05;

const METHOD_NO_AUTH: u8 = 0x00;

const CMD_CONNECT: u8 = 0x01;
const CMD_BIND: u8 = 0x02;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Fixed success reply: an IPv4 null bind address. The relay never binds,
/// so there is no real address to report.
const REPLY_OK: [u8; 10] = [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];

/// Parse the SOCKS5 handshake. The version byte has already been consumed
/// by the dispatcher.
pub(super) async fn accept<S>(stream: &mut S) -> Result<Ingress, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; 256];

    // Greeting: nmethods, then the method list. Only "no auth" works.
    stream.read_exact(&mut buf[..1]).await?;
    let nmethods = buf[0] as usize;
    stream.read_exact(&mut buf[..nmethods]).await?;
    if !buf[..nmethods].contains(&METHOD_NO_AUTH) {
        return Err(ProxyError::NoAuthMethod);
    }

    stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;

    // Request: ver, cmd, rsv, atyp.
    stream.read_exact(&mut buf[..4]).await?;
    let (ver, cmd, atyp) = (buf[0], buf[1], buf[3]);
    if ver != SOCKS_VERSION {
        return Err(ProxyError::InvalidVersion(ver));
    }
    // BIND is acknowledged like CONNECT; the relay never actually binds.
    if cmd != CMD_CONNECT && cmd != CMD_BIND {
        return Err(ProxyError::UnsupportedCommand(cmd));
    }

    let host = match atyp {
        ATYP_IPV4 => {
            stream.read_exact(&mut buf[..4]).await?;
            format!("{}.{}.{}.{}", buf[0], buf[1], buf[2], buf[3])
        }
        ATYP_DOMAIN => {
            stream.read_exact(&mut buf[..1]).await?;
            let len = buf[0] as usize;
            stream.read_exact(&mut buf[..len]).await?;
            String::from_utf8_lossy(&buf[..len]).into_owned()
        }
        ATYP_IPV6 => return Err(ProxyError::Ipv6Unsupported),
        other => return Err(ProxyError::UnsupportedAddressType(other)),
    };

    stream.read_exact(&mut buf[..2]).await?;
    let port = u16::from_be_bytes([buf[0], buf[1]]);
    debug!("socks5 destination {host}:{port}");

    stream.write_all(&REPLY_OK).await?;

    // The client sends its own data once it sees the reply; nothing is
    // deferred on either side.
    Ok(Ingress {
        destination: Destination { host, port },
        client_reply: None,
        upstream_preamble: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    /// Runs the parser against scripted client bytes; returns the parsed
    /// ingress and everything written back to the client.
    async fn drive(input: &[u8]) -> (Result<Ingress, ProxyError>, Vec<u8>) {
        let (mut client, mut server) = duplex(1024);
        client.write_all(input).await.unwrap();
        client.shutdown().await.unwrap();

        // The dispatcher consumes the version byte before handing off.
        let mut version = [0u8; 1];
        server.read_exact(&mut version).await.unwrap();
        assert_eq!(version[0], SOCKS_VERSION);

        let result = accept(&mut server).await;
        drop(server);

        let mut replies = Vec::new();
        client.read_to_end(&mut replies).await.unwrap();
        (result, replies)
    }

    #[tokio::test]
    async fn test_connect_ipv4() {
        let (result, replies) = drive(&[
            0x05, 0x01, 0x00, // greeting: one method, no-auth
            0x05, 0x01, 0x00, 0x01, 0x7F, 0x00, 0x00, 0x01, 0x00, 0x50,
        ])
        .await;

        let ingress = result.unwrap();
        assert_eq!(ingress.destination.host, "127.0.0.1");
        assert_eq!(ingress.destination.port, 80);
        assert!(ingress.client_reply.is_none());
        assert!(ingress.upstream_preamble.is_none());

        let mut expected = vec![0x05, 0x00];
        expected.extend_from_slice(&REPLY_OK);
        assert_eq!(replies, expected);
    }

    #[tokio::test]
    async fn test_connect_domain() {
        let mut input = vec![0x05, 0x01, 0x00, 0x05, 0x01, 0x00, 0x03, 0x09];
        input.extend_from_slice(b"localhost");
        input.extend_from_slice(&[0x00, 0x50]);

        let (result, replies) = drive(&input).await;
        let ingress = result.unwrap();
        assert_eq!(ingress.destination.host, "localhost");
        assert_eq!(ingress.destination.port, 80);
        assert_eq!(replies.len(), 2 + REPLY_OK.len());
    }

    #[tokio::test]
    async fn test_ipv6_rejected_before_reply() {
        let mut input = vec![0x05, 0x01, 0x00, 0x05, 0x01, 0x00, 0x04];
        input.extend_from_slice(&[0u8; 18]);

        let (result, replies) = drive(&input).await;
        assert!(matches!(result, Err(ProxyError::Ipv6Unsupported)));
        // Only the method reply was sent, never the success reply.
        assert_eq!(replies, vec![0x05, 0x00]);
    }

    #[tokio::test]
    async fn test_bind_acknowledged() {
        let (result, _) = drive(&[
            0x05, 0x01, 0x00, 0x05, 0x02, 0x00, 0x01, 0x0A, 0x00, 0x00, 0x02, 0x1F, 0x90,
        ])
        .await;
        let ingress = result.unwrap();
        assert_eq!(ingress.destination.host, "10.0.0.2");
        assert_eq!(ingress.destination.port, 8080);
    }

    #[tokio::test]
    async fn test_no_auth_method_rejected() {
        // Client only offers username/password.
        let (result, replies) = drive(&[0x05, 0x01, 0x02]).await;
        assert!(matches!(result, Err(ProxyError::NoAuthMethod)));
        assert!(replies.is_empty());
    }
}
