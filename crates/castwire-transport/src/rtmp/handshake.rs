//! Client side of the RTMP C0/C1/S0/S1/S2/C2 exchange.

use rml_rtmp::handshake::{Handshake, HandshakeProcessResult, PeerType};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::error::{ProtocolError, TransportError};
use crate::TransportResult;

pub const RTMP_VERSION: u8 = 3;

/// Runs the handshake and returns any bytes the server sent past S2.
pub async fn perform<S>(stream: &mut S) -> TransportResult<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut handshake = Handshake::new(PeerType::Client);
    let c0_c1 = handshake.generate_outbound_p0_and_p1().map_err(|e| {
        TransportError::Protocol(ProtocolError::HandshakeRejected(format!(
            "could not build C0/C1: {:?}",
            e
        )))
    })?;
    stream.write_all(&c0_c1).await?;

    let mut buf = vec![0u8; 4096];
    let mut version_checked = false;
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(TransportError::ConnectionLost(
                "Connection closed during handshake".to_string(),
            ));
        }
        trace!(bytes = n, "Handshake bytes received");

        if !version_checked {
            if buf[0] != RTMP_VERSION {
                return Err(ProtocolError::HandshakeRejected(format!(
                    "server answered with version {}",
                    buf[0]
                ))
                .into());
            }
            version_checked = true;
        }

        match handshake.process_bytes(&buf[..n]) {
            Ok(HandshakeProcessResult::InProgress { response_bytes }) => {
                if !response_bytes.is_empty() {
                    stream.write_all(&response_bytes).await?;
                }
            }
            Ok(HandshakeProcessResult::Completed {
                response_bytes,
                remaining_bytes,
            }) => {
                if !response_bytes.is_empty() {
                    stream.write_all(&response_bytes).await?;
                }
                debug!(leftover = remaining_bytes.len(), "Handshake complete");
                return Ok(remaining_bytes);
            }
            Err(e) => {
                return Err(ProtocolError::HandshakeRejected(format!("{:?}", e)).into());
            }
        }
    }
}
