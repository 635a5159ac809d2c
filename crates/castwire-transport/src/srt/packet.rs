//! SRT packet formats.
//!
//! Every packet starts with a 16-byte header. The top bit of the first word
//! tells data (0) from control (1) packets.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

pub const HEADER_LEN: usize = 16;
const HANDSHAKE_CIF_LEN: usize = 48;

pub const MAX_SEQUENCE: u32 = 0x7FFF_FFFF;
const MAX_MESSAGE_NUMBER: u32 = 0x03FF_FFFF;

/// PP = 11: the packet carries a whole message.
const POSITION_SOLO: u32 = 0b11 << 30;
const RETRANSMITTED: u32 = 1 << 26;

pub mod control_type {
    pub const HANDSHAKE: u16 = 0;
    pub const KEEPALIVE: u16 = 1;
    pub const ACK: u16 = 2;
    pub const NAK: u16 = 3;
    pub const SHUTDOWN: u16 = 5;
    pub const ACKACK: u16 = 6;
}

pub mod handshake_type {
    pub const INDUCTION: u32 = 1;
    pub const CONCLUSION: u32 = 0xFFFF_FFFF;
    /// Values from here on are rejection reasons.
    pub const REJECTION_BASE: u32 = 1000;
}

pub const INDUCTION_VERSION: u32 = 4;
pub const SRT_VERSION: u32 = 5;
/// Extension field of the caller's induction request (UDT datagram socket).
pub const INDUCTION_EXTENSION: u16 = 2;
/// Extension field of the listener's induction response.
pub const SRT_MAGIC: u16 = 0x4A17;

pub const EXT_FLAG_HSREQ: u16 = 0x1;
pub const EXT_FLAG_CONFIG: u16 = 0x4;

const EXT_TYPE_HSREQ: u16 = 1;
const EXT_TYPE_HSRSP: u16 = 2;
const EXT_TYPE_SID: u16 = 5;

/// SRT library version announced in HSREQ (1.5.0).
pub const SRT_LIBRARY_VERSION: u32 = 0x0001_0500;
/// TSBPD send/receive, too-late drop, NAK reports, retransmission flag.
pub const SRT_FLAGS: u32 = 0x3B;

/// `a + n` in 31-bit sequence space.
pub fn seq_add(a: u32, n: u32) -> u32 {
    a.wrapping_add(n) & MAX_SEQUENCE
}

/// Whether `a` comes before `b`, allowing for wrap-around.
pub fn seq_before(a: u32, b: u32) -> bool {
    let distance = b.wrapping_sub(a) & MAX_SEQUENCE;
    distance != 0 && distance < (1 << 30)
}

pub fn next_message_number(n: u32) -> u32 {
    match (n + 1) & MAX_MESSAGE_NUMBER {
        0 => 1,
        next => next,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Data(DataPacket),
    Control(ControlPacket),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    pub sequence: u32,
    pub message_number: u32,
    pub retransmitted: bool,
    pub timestamp: u32,
    pub dest_socket: u32,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPacket {
    pub timestamp: u32,
    pub dest_socket: u32,
    pub body: Control,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    Handshake(Handshake),
    KeepAlive,
    /// `last_acknowledged` is the sequence number after the last one received.
    Ack {
        ack_number: u32,
        last_acknowledged: u32,
    },
    /// Lost sequence numbers as inclusive ranges.
    Nak(Vec<(u32, u32)>),
    Shutdown,
    AckAck(u32),
    Other(u16),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub version: u32,
    pub encryption: u16,
    pub extension_field: u16,
    pub initial_sequence: u32,
    pub mtu: u32,
    pub flow_window: u32,
    pub handshake_type: u32,
    pub socket_id: u32,
    pub cookie: u32,
    pub peer_ip: [u8; 16],
    pub extensions: Vec<HandshakeExtension>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeExtension {
    /// HSREQ from the caller, HSRSP from the listener.
    Srt {
        response: bool,
        version: u32,
        flags: u32,
        receive_latency_ms: u16,
        send_latency_ms: u16,
    },
    StreamId(String),
    Other { kind: u16, data: Bytes },
}

impl Packet {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + 64);
        match self {
            Self::Data(data) => data.encode_into(&mut buf),
            Self::Control(control) => control.encode_into(&mut buf),
        }
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, ProtocolError> {
        if buf.len() < HEADER_LEN {
            return Err(ProtocolError::Malformed(format!(
                "SRT packet of {} bytes",
                buf.len()
            )));
        }
        let first = buf.get_u32();
        let second = buf.get_u32();
        let timestamp = buf.get_u32();
        let dest_socket = buf.get_u32();

        if first & 0x8000_0000 == 0 {
            return Ok(Self::Data(DataPacket {
                sequence: first,
                message_number: second & MAX_MESSAGE_NUMBER,
                retransmitted: second & RETRANSMITTED != 0,
                timestamp,
                dest_socket,
                payload: buf,
            }));
        }

        let kind = ((first >> 16) & 0x7FFF) as u16;
        let body = match kind {
            control_type::HANDSHAKE => Control::Handshake(Handshake::decode(&mut buf)?),
            control_type::KEEPALIVE => Control::KeepAlive,
            control_type::ACK => {
                if buf.len() < 4 {
                    return Err(ProtocolError::Malformed("ACK without CIF".to_string()));
                }
                Control::Ack {
                    ack_number: second,
                    last_acknowledged: buf.get_u32() & MAX_SEQUENCE,
                }
            }
            control_type::NAK => Control::Nak(decode_loss_list(&mut buf)?),
            control_type::SHUTDOWN => Control::Shutdown,
            control_type::ACKACK => Control::AckAck(second),
            other => Control::Other(other),
        };
        Ok(Self::Control(ControlPacket {
            timestamp,
            dest_socket,
            body,
        }))
    }
}

impl DataPacket {
    fn encode_into(&self, buf: &mut BytesMut) {
        let mut second = POSITION_SOLO | (self.message_number & MAX_MESSAGE_NUMBER);
        if self.retransmitted {
            second |= RETRANSMITTED;
        }
        buf.put_u32(self.sequence & MAX_SEQUENCE);
        buf.put_u32(second);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.dest_socket);
        buf.put_slice(&self.payload);
    }
}

impl ControlPacket {
    pub fn new(body: Control, timestamp: u32, dest_socket: u32) -> Self {
        Self {
            timestamp,
            dest_socket,
            body,
        }
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        let (kind, info) = match &self.body {
            Control::Handshake(_) => (control_type::HANDSHAKE, 0),
            Control::KeepAlive => (control_type::KEEPALIVE, 0),
            Control::Ack { ack_number, .. } => (control_type::ACK, *ack_number),
            Control::Nak(_) => (control_type::NAK, 0),
            Control::Shutdown => (control_type::SHUTDOWN, 0),
            Control::AckAck(ack_number) => (control_type::ACKACK, *ack_number),
            Control::Other(kind) => (*kind, 0),
        };
        buf.put_u32(0x8000_0000 | (kind as u32) << 16);
        buf.put_u32(info);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.dest_socket);

        match &self.body {
            Control::Handshake(handshake) => handshake.encode_into(buf),
            Control::Ack {
                last_acknowledged, ..
            } => buf.put_u32(*last_acknowledged),
            Control::Nak(ranges) => {
                for &(first, last) in ranges {
                    if first == last {
                        buf.put_u32(first);
                    } else {
                        buf.put_u32(first | 0x8000_0000);
                        buf.put_u32(last);
                    }
                }
            }
            // keepalive, shutdown and ACKACK carry one padding word
            Control::KeepAlive | Control::Shutdown | Control::AckAck(_) => buf.put_u32(0),
            Control::Other(_) => {}
        }
    }
}

fn decode_loss_list(buf: &mut Bytes) -> Result<Vec<(u32, u32)>, ProtocolError> {
    let mut ranges = Vec::new();
    while buf.remaining() >= 4 {
        let first = buf.get_u32();
        if first & 0x8000_0000 != 0 {
            if buf.remaining() < 4 {
                return Err(ProtocolError::Malformed(
                    "NAK range without an end".to_string(),
                ));
            }
            ranges.push((first & MAX_SEQUENCE, buf.get_u32() & MAX_SEQUENCE));
        } else {
            ranges.push((first, first));
        }
    }
    Ok(ranges)
}

impl Handshake {
    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u32(self.version);
        buf.put_u16(self.encryption);
        buf.put_u16(self.extension_field);
        buf.put_u32(self.initial_sequence);
        buf.put_u32(self.mtu);
        buf.put_u32(self.flow_window);
        buf.put_u32(self.handshake_type);
        buf.put_u32(self.socket_id);
        buf.put_u32(self.cookie);
        buf.put_slice(&self.peer_ip);
        for extension in &self.extensions {
            extension.encode_into(buf);
        }
    }

    fn decode(buf: &mut Bytes) -> Result<Self, ProtocolError> {
        if buf.len() < HANDSHAKE_CIF_LEN {
            return Err(ProtocolError::Malformed(format!(
                "handshake CIF of {} bytes",
                buf.len()
            )));
        }
        let mut handshake = Self {
            version: buf.get_u32(),
            encryption: buf.get_u16(),
            extension_field: buf.get_u16(),
            initial_sequence: buf.get_u32(),
            mtu: buf.get_u32(),
            flow_window: buf.get_u32(),
            handshake_type: buf.get_u32(),
            socket_id: buf.get_u32(),
            cookie: buf.get_u32(),
            peer_ip: [0; 16],
            extensions: Vec::new(),
        };
        buf.copy_to_slice(&mut handshake.peer_ip);

        while buf.remaining() >= 4 {
            let kind = buf.get_u16();
            let len = buf.get_u16() as usize * 4;
            if buf.remaining() < len {
                return Err(ProtocolError::Malformed(format!(
                    "handshake extension {} truncated",
                    kind
                )));
            }
            let data = buf.split_to(len);
            handshake
                .extensions
                .push(HandshakeExtension::decode(kind, data)?);
        }
        Ok(handshake)
    }

    /// Rejection reason code, if the listener refused us.
    pub fn rejection(&self) -> Option<u32> {
        let kind = self.handshake_type;
        (REJECTION_RANGE.contains(&kind)).then_some(kind)
    }

    pub fn stream_id(&self) -> Option<&str> {
        self.extensions.iter().find_map(|ext| match ext {
            HandshakeExtension::StreamId(id) => Some(id.as_str()),
            _ => None,
        })
    }
}

const REJECTION_RANGE: std::ops::Range<u32> = handshake_type::REJECTION_BASE..0xFFFF_0000;

impl HandshakeExtension {
    fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            Self::Srt {
                response,
                version,
                flags,
                receive_latency_ms,
                send_latency_ms,
            } => {
                buf.put_u16(if *response { EXT_TYPE_HSRSP } else { EXT_TYPE_HSREQ });
                buf.put_u16(3);
                buf.put_u32(*version);
                buf.put_u32(*flags);
                buf.put_u16(*receive_latency_ms);
                buf.put_u16(*send_latency_ms);
            }
            Self::StreamId(id) => {
                let mut padded = id.as_bytes().to_vec();
                padded.resize(id.len().div_ceil(4) * 4, 0);
                buf.put_u16(EXT_TYPE_SID);
                buf.put_u16((padded.len() / 4) as u16);
                // each 32-bit word goes out byte-reversed
                for word in padded.chunks_exact(4) {
                    buf.put_slice(&[word[3], word[2], word[1], word[0]]);
                }
            }
            Self::Other { kind, data } => {
                buf.put_u16(*kind);
                buf.put_u16((data.len() / 4) as u16);
                buf.put_slice(data);
            }
        }
    }

    fn decode(kind: u16, mut data: Bytes) -> Result<Self, ProtocolError> {
        match kind {
            EXT_TYPE_HSREQ | EXT_TYPE_HSRSP if data.len() >= 12 => Ok(Self::Srt {
                response: kind == EXT_TYPE_HSRSP,
                version: data.get_u32(),
                flags: data.get_u32(),
                receive_latency_ms: data.get_u16(),
                send_latency_ms: data.get_u16(),
            }),
            EXT_TYPE_SID => {
                let mut bytes = Vec::with_capacity(data.len());
                for word in data.chunks_exact(4) {
                    bytes.extend_from_slice(&[word[3], word[2], word[1], word[0]]);
                }
                while bytes.last() == Some(&0) {
                    bytes.pop();
                }
                String::from_utf8(bytes)
                    .map(Self::StreamId)
                    .map_err(|_| ProtocolError::Malformed("stream id is not UTF-8".to_string()))
            }
            _ => Ok(Self::Other { kind, data }),
        }
    }
}
