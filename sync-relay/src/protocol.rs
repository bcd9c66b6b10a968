//! Wire framing and the TCP accept loop.
//!
//! Every frame is a 4-byte big-endian length followed by a MessagePack
//! [`RelayMessage`].

use crate::error::{ProtocolError, ProtocolResult};
use crate::server::SignalRelay;
use crate::session::Session;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use sync_types::{decode_frame_len, encode_frame, RelayMessage, FRAME_HEADER_LEN};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Read one message. Returns `Ok(None)` on a clean EOF between frames.
pub async fn read_message<R>(reader: &mut R, limit: usize) -> ProtocolResult<Option<RelayMessage>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = decode_frame_len(header, limit)?;

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;

    RelayMessage::from_bytes(&body)
        .map(Some)
        .map_err(ProtocolError::from)
}

/// Write one length-prefixed message and flush.
pub async fn write_message<W>(writer: &mut W, message: &RelayMessage) -> ProtocolResult<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = message.to_bytes()?;
    writer.write_all(&encode_frame(&bytes)).await?;
    writer.flush().await?;
    Ok(())
}

/// Accept connections until `shutdown` fires, one [`Session`] task each.
pub async fn serve(
    listener: TcpListener,
    relay: Arc<SignalRelay>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    tracing::info!("Signaling relay listening on {}", listener.local_addr()?);

    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!("Accept failed: {}", e);
                    continue;
                }
            },
        };

        // Rate limit check: prevent connection flooding from a single address
        if let Err(e) = relay.rate_limits().check_connection(&peer.ip()) {
            tracing::warn!("Connection rate limited for {}: {}", peer, e);
            relay.metrics().rate_limit_hits.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        let max = relay.config().limits.max_connections as u64;
        if relay.active_connections() >= max {
            tracing::warn!(
                "Connection limit reached ({}/{}), rejecting {}",
                relay.active_connections(),
                max,
                peer
            );
            continue;
        }

        relay.metrics().connections_total.fetch_add(1, Ordering::Relaxed);
        let _ = stream.set_nodelay(true);

        let session = Session::new(relay.clone(), peer.to_string());
        let token = shutdown.child_token();
        // Spawn session handler - don't block the accept loop
        tokio::spawn(async move {
            if let Err(e) = session.run(stream, token).await {
                tracing::debug!("Session {} ended with error: {}", peer, e);
            }
        });
    }

    tracing::info!("Signaling relay stopped accepting connections");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_types::{DeviceId, Join};

    #[tokio::test]
    async fn message_roundtrips_through_frames() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let msg = RelayMessage::Join(Join {
            version: 1,
            device_id: DeviceId::new("abc123"),
        });

        write_message(&mut client, &msg).await.unwrap();
        let decoded = read_message(&mut server, 1024).await.unwrap();
        assert_eq!(decoded, Some(msg));
    }

    #[tokio::test]
    async fn clean_eof_reads_none() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        assert!(read_message(&mut server, 1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversize_header_is_rejected_before_body() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&(100_000u32).to_be_bytes()).await.unwrap();

        let err = read_message(&mut server, 65_536).await.unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { size: 100_000, .. }));
    }

    #[tokio::test]
    async fn garbage_body_is_invalid_message() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&encode_frame(&[0xc1])).await.unwrap();

        let err = read_message(&mut server, 1024).await.unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidMessage { .. }));
        assert!(!err.is_fatal());
    }
}
