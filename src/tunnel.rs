//! The upstream handshake and the framed relay loop.
//!
//! Wire format toward the relay, all integers big-endian:
//!
//! ```text
//! handshake:  len u8 | check token     (encrypt(key[8..16], key))
//!             len u8 | dest host       (encrypt(host, key))
//!             port u16                 (plaintext)
//! then:       len u16 | ciphertext     (one frame per client chunk)
//! ```
//!
//! Frames flow both ways after the handshake. The relay loop multiplexes
//! three event sources: decrypted frames from the upstream, raw chunks
//! from the client, and an idle timer that tears the tunnel down after
//! 60 seconds of silence.

use crate::config::Upstream;
use crate::crypto::{Cipher, KEY_LEN};
use crate::proxy::{Destination, Ingress};
use crate::stats::Registry;
use crate::{Result, CHUNK_SIZE, IDLE_TIMEOUT};
use bytes::Bytes;
use std::io::ErrorKind;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, error, trace};

/// Tunnel errors
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("cannot connect to upstream {0}: {1}")]
    Connect(String, std::io::Error),
}

/// What the upstream reader hands to the relay loop.
enum UpstreamMessage {
    /// One whole frame of ciphertext, length prefix already stripped.
    Frame(Vec<u8>),
    /// Clean EOF, including EOF in the middle of a frame.
    Closed,
    Error(std::io::Error),
}

/// What the client reader hands to the relay loop.
enum ClientMessage {
    Chunk(Bytes),
    Closed,
    Error(std::io::Error),
}

/// Run one tunnel to completion: dial the chosen upstream, handshake,
/// flush deferred bytes, then relay until either side ends or the idle
/// timer fires. The registry entry lives exactly as long as the call.
pub async fn run(
    client: TcpStream,
    ingress: Ingress,
    upstream: &Upstream,
    registry: &Registry,
) -> Result<()> {
    let addr = upstream.addr();
    let remote = TcpStream::connect(&addr)
        .await
        .map_err(|e| TunnelError::Connect(addr.clone(), e))?;
    remote.set_nodelay(true).ok();
    client.set_nodelay(true).ok();
    debug!("connected to upstream {addr}");

    let cipher = Cipher::new(&upstream.key)?;
    let dest_key = ingress.destination.to_string();

    let (remote_read, mut remote_write) = remote.into_split();
    let (client_read, mut client_write) = client.into_split();

    registry.open(&dest_key);
    let result = async {
        handshake(&mut remote_write, &cipher, &upstream.key, &ingress.destination).await?;

        // Bytes owed once the handshake is on the wire.
        if let Some(reply) = &ingress.client_reply {
            client_write.write_all(reply).await?;
        }
        if let Some(preamble) = &ingress.upstream_preamble {
            write_frame(&mut remote_write, &cipher, preamble).await?;
        }

        relay(
            client_read,
            client_write,
            remote_read,
            remote_write,
            &cipher,
            registry,
            &dest_key,
        )
        .await
    }
    .await;
    registry.close(&dest_key);
    debug!("closed tunnel for {dest_key}");
    result
}

/// Check token, destination host, destination port, written back-to-back.
async fn handshake(
    remote: &mut OwnedWriteHalf,
    cipher: &Cipher,
    key: &[u8; KEY_LEN],
    destination: &Destination,
) -> Result<()> {
    let token = cipher.encrypt(&key[8..16])?;
    let host = cipher.encrypt(destination.host.as_bytes())?;

    let mut wire = Vec::with_capacity(1 + token.len() + 1 + host.len() + 2);
    wire.push(token.len() as u8);
    wire.extend_from_slice(&token);
    wire.push(host.len() as u8);
    wire.extend_from_slice(&host);
    wire.extend_from_slice(&destination.port.to_be_bytes());
    remote.write_all(&wire).await?;
    Ok(())
}

/// Seal a chunk and emit one frame. Length prefix and ciphertext go out
/// in a single write, so a frame is never half-emitted.
async fn write_frame(remote: &mut OwnedWriteHalf, cipher: &Cipher, plaintext: &[u8]) -> Result<()> {
    let sealed = cipher.encrypt(plaintext)?;
    let mut wire = Vec::with_capacity(2 + sealed.len());
    wire.extend_from_slice(&(sealed.len() as u16).to_be_bytes());
    wire.extend_from_slice(&sealed);
    remote.write_all(&wire).await?;
    Ok(())
}

async fn relay(
    client_read: OwnedReadHalf,
    mut client_write: OwnedWriteHalf,
    remote_read: OwnedReadHalf,
    mut remote_write: OwnedWriteHalf,
    cipher: &Cipher,
    registry: &Registry,
    dest_key: &str,
) -> Result<()> {
    let (frame_tx, mut frame_rx) = mpsc::channel::<UpstreamMessage>(16);
    let (chunk_tx, mut chunk_rx) = mpsc::channel::<ClientMessage>(16);

    let upstream_reader = tokio::spawn(read_upstream(remote_read, frame_tx));
    let client_reader = tokio::spawn(read_client(client_read, chunk_tx));

    let result = loop {
        tokio::select! {
            msg = frame_rx.recv() => match msg {
                Some(UpstreamMessage::Frame(sealed)) => {
                    let data = match cipher.decrypt(&sealed) {
                        Ok(data) => data,
                        Err(e) => {
                            error!("cannot decrypt frame from upstream for {dest_key}");
                            break Err(e.into());
                        }
                    };
                    // Wire-level accounting: the ciphertext length.
                    registry.record(dest_key, sealed.len() as i64);
                    trace!("upstream: {}", String::from_utf8_lossy(&data));
                    if let Err(e) = client_write.write_all(&data).await {
                        break Err(e.into());
                    }
                }
                Some(UpstreamMessage::Closed) | None => break Ok(()),
                Some(UpstreamMessage::Error(e)) => break Err(e.into()),
            },
            msg = chunk_rx.recv() => match msg {
                Some(ClientMessage::Chunk(data)) => {
                    trace!("client: {}", String::from_utf8_lossy(&data));
                    if let Err(e) = write_frame(&mut remote_write, cipher, &data).await {
                        break Err(e);
                    }
                }
                Some(ClientMessage::Closed) | None => break Ok(()),
                Some(ClientMessage::Error(e)) => break Err(e.into()),
            },
            _ = sleep(IDLE_TIMEOUT) => {
                debug!("timeout on {dest_key}");
                break Ok(());
            }
        }
    };

    // The readers may be parked inside a socket read; cut them loose so
    // their read halves drop and both sockets fully close.
    upstream_reader.abort();
    client_reader.abort();
    result
}

/// Read whole frames off the upstream socket and hand them over.
async fn read_upstream(mut remote: OwnedReadHalf, tx: mpsc::Sender<UpstreamMessage>) {
    loop {
        let mut len_buf = [0u8; 2];
        if let Err(e) = remote.read_exact(&mut len_buf).await {
            let _ = tx.send(eof_or_error(e)).await;
            return;
        }
        let len = u16::from_be_bytes(len_buf) as usize;

        let mut sealed = vec![0u8; len];
        if let Err(e) = remote.read_exact(&mut sealed).await {
            let _ = tx.send(eof_or_error(e)).await;
            return;
        }
        debug!("received {len} byte frame from upstream");

        if tx.send(UpstreamMessage::Frame(sealed)).await.is_err() {
            return;
        }
    }
}

fn eof_or_error(e: std::io::Error) -> UpstreamMessage {
    if e.kind() == ErrorKind::UnexpectedEof {
        UpstreamMessage::Closed
    } else {
        UpstreamMessage::Error(e)
    }
}

/// Read raw client chunks and hand them over.
async fn read_client(mut client: OwnedReadHalf, tx: mpsc::Sender<ClientMessage>) {
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        match client.read(&mut buf).await {
            Ok(0) => {
                let _ = tx.send(ClientMessage::Closed).await;
                return;
            }
            Ok(n) => {
                debug!("received {n} bytes from client");
                let chunk = Bytes::copy_from_slice(&buf[..n]);
                if tx.send(ClientMessage::Chunk(chunk)).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                let _ = tx.send(ClientMessage::Error(e)).await;
                return;
            }
        }
    }
}
