//! SRT caller handshake: induction, then conclusion.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, info, trace};

use super::packet::{
    handshake_type, Control, ControlPacket, Handshake, HandshakeExtension, Packet,
    EXT_FLAG_CONFIG, EXT_FLAG_HSREQ, INDUCTION_EXTENSION, INDUCTION_VERSION, MAX_SEQUENCE,
    SRT_FLAGS, SRT_LIBRARY_VERSION, SRT_MAGIC, SRT_VERSION,
};
use crate::endpoint::SrtEndpoint;
use crate::error::{ProtocolError, TransportError};
use crate::TransportResult;

const MTU: u32 = 1500;
const FLOW_WINDOW: u32 = 8192;
const RETRY_INTERVAL: Duration = Duration::from_millis(250);
const MAX_DATAGRAM: usize = 1500;

/// An SRT connection after the handshake.
#[derive(Debug)]
pub(crate) struct SrtConnection {
    pub socket: Arc<UdpSocket>,
    pub peer: SocketAddr,
    pub socket_id: u32,
    pub peer_socket_id: u32,
    pub initial_sequence: u32,
    pub latency_ms: u16,
    pub start: Instant,
}

impl SrtConnection {
    /// Microseconds since the connection started, as carried in packet headers.
    pub fn timestamp(start: Instant) -> u32 {
        start.elapsed().as_micros() as u32
    }
}

/// Resolve the listener and bind a UDP socket connected to it.
pub(crate) async fn open(endpoint: &SrtEndpoint) -> TransportResult<(UdpSocket, SocketAddr)> {
    let peer = lookup_host((endpoint.host.as_str(), endpoint.port))
        .await
        .map_err(|e| TransportError::Unreachable(format!("{}: {}", endpoint.host, e)))?
        .next()
        .ok_or_else(|| {
            TransportError::Unreachable(format!("{} did not resolve", endpoint.host))
        })?;
    let bind: SocketAddr = if peer.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        ([0u16; 8], 0).into()
    };
    let socket = UdpSocket::bind(bind).await?;
    socket
        .connect(peer)
        .await
        .map_err(|e| TransportError::Unreachable(format!("{}: {}", peer, e)))?;
    debug!(peer = %peer, "UDP socket connected");
    Ok((socket, peer))
}

/// Run the caller handshake, induction then conclusion, over an opened socket.
pub(crate) async fn handshake(
    socket: UdpSocket,
    peer: SocketAddr,
    endpoint: &SrtEndpoint,
    latency_ms: u16,
) -> TransportResult<SrtConnection> {
    info!(peer = %peer, "Starting SRT handshake");

    let socket_id = rand::random::<u32>() & 0x3FFF_FFFF | 1;
    let initial_sequence = rand::random::<u32>() & MAX_SEQUENCE;
    let start = Instant::now();

    let induction = Handshake {
        version: INDUCTION_VERSION,
        encryption: 0,
        extension_field: INDUCTION_EXTENSION,
        initial_sequence,
        mtu: MTU,
        flow_window: FLOW_WINDOW,
        handshake_type: handshake_type::INDUCTION,
        socket_id,
        cookie: 0,
        peer_ip: peer_ip(peer),
        extensions: Vec::new(),
    };
    let response = exchange(&socket, start, induction.clone()).await?;
    if response.version != SRT_VERSION || response.extension_field != SRT_MAGIC {
        return Err(ProtocolError::HandshakeRejected(format!(
            "listener answered induction with version {} and magic {:#06x}",
            response.version, response.extension_field
        ))
        .into());
    }
    debug!(cookie = response.cookie, "Induction complete");

    let mut extensions = vec![HandshakeExtension::Srt {
        response: false,
        version: SRT_LIBRARY_VERSION,
        flags: SRT_FLAGS,
        receive_latency_ms: latency_ms,
        send_latency_ms: latency_ms,
    }];
    if let Some(stream_id) = &endpoint.stream_id {
        extensions.push(HandshakeExtension::StreamId(stream_id.clone()));
    }
    let conclusion = Handshake {
        version: SRT_VERSION,
        extension_field: EXT_FLAG_HSREQ | EXT_FLAG_CONFIG,
        handshake_type: handshake_type::CONCLUSION,
        cookie: response.cookie,
        extensions,
        ..induction
    };
    let response = exchange(&socket, start, conclusion).await?;
    if response.handshake_type != handshake_type::CONCLUSION {
        return Err(ProtocolError::HandshakeRejected(format!(
            "unexpected handshake type {:#x}",
            response.handshake_type
        ))
        .into());
    }

    let latency_ms = response
        .extensions
        .iter()
        .find_map(|ext| match ext {
            HandshakeExtension::Srt {
                receive_latency_ms, ..
            } => Some(latency_ms.max(*receive_latency_ms)),
            _ => None,
        })
        .unwrap_or(latency_ms);
    info!(
        peer_socket_id = response.socket_id,
        latency_ms, "SRT connection established"
    );

    Ok(SrtConnection {
        socket: Arc::new(socket),
        peer,
        socket_id,
        peer_socket_id: response.socket_id,
        initial_sequence,
        latency_ms,
        start,
    })
}

/// Send a handshake until the listener answers, and check the answer for a rejection.
async fn exchange(socket: &UdpSocket, start: Instant, request: Handshake) -> TransportResult<Handshake> {
    let stage = request.handshake_type;
    let packet = Packet::Control(ControlPacket::new(
        Control::Handshake(request),
        SrtConnection::timestamp(start),
        0,
    ))
    .encode();

    loop {
        socket
            .send(&packet)
            .await
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;
        trace!(stage, "Sent handshake");
        match timeout(RETRY_INTERVAL, receive_handshake(socket)).await {
            Ok(response) => {
                let response = response?;
                if let Some(code) = response.rejection() {
                    return Err(ProtocolError::HandshakeRejected(format!(
                        "listener rejected the connection with code {}",
                        code
                    ))
                    .into());
                }
                return Ok(response);
            }
            Err(_) => trace!(stage, "No handshake response, retrying"),
        }
    }
}

async fn receive_handshake(socket: &UdpSocket) -> TransportResult<Handshake> {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let n = socket
            .recv(&mut buf)
            .await
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;
        match Packet::decode(Bytes::copy_from_slice(&buf[..n])) {
            Ok(Packet::Control(ControlPacket {
                body: Control::Handshake(handshake),
                ..
            })) => return Ok(handshake),
            Ok(other) => trace!(?other, "Ignoring packet during handshake"),
            Err(e) => debug!(error = %e, "Ignoring malformed packet during handshake"),
        }
    }
}

/// Peer address in the handshake's 128-bit IP field.
fn peer_ip(peer: SocketAddr) -> [u8; 16] {
    let mut ip = [0u8; 16];
    match peer {
        // IPv4 goes in the first word, little-endian like libsrt writes it
        SocketAddr::V4(v4) => {
            let octets = v4.ip().octets();
            ip[..4].copy_from_slice(&[octets[3], octets[2], octets[1], octets[0]]);
        }
        SocketAddr::V6(v6) => ip = v6.ip().octets(),
    }
    ip
}
