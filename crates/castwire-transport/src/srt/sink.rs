//! Sending half of an SRT connection.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, trace, warn};

use super::handshake::SrtConnection;
use super::packet::{
    next_message_number, seq_add, seq_before, Control, ControlPacket, DataPacket, Packet,
};
use crate::error::TransportError;
use crate::mux::MuxedPacket;
use crate::pipeline::PacketSink;
use crate::TransportResult;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);
const PEER_IDLE_TIMEOUT: Duration = Duration::from_secs(5);
const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Sent packets kept until the receiver acknowledges them.
#[derive(Debug)]
pub(crate) struct RetransmitBuffer {
    packets: VecDeque<DataPacket>,
    capacity: usize,
}

impl RetransmitBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            packets: VecDeque::with_capacity(capacity.min(4096)),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn push(&mut self, packet: DataPacket) {
        if self.packets.len() >= self.capacity {
            self.packets.pop_front();
        }
        self.packets.push_back(packet);
    }

    /// Forget everything before `next_expected`.
    pub fn acknowledge(&mut self, next_expected: u32) {
        while let Some(front) = self.packets.front() {
            if !seq_before(front.sequence, next_expected) {
                break;
            }
            self.packets.pop_front();
        }
    }

    /// Copies of the lost packets still held, flagged as retransmissions.
    pub fn lost(&self, ranges: &[(u32, u32)]) -> Vec<DataPacket> {
        self.packets
            .iter()
            .filter(|packet| {
                ranges.iter().any(|&(first, last)| {
                    !seq_before(packet.sequence, first) && !seq_before(last, packet.sequence)
                })
            })
            .map(|packet| DataPacket {
                retransmitted: true,
                ..packet.clone()
            })
            .collect()
    }
}

#[derive(Debug)]
enum SrtEvent {
    /// Bytes the reader task put on the wire.
    Sent(usize),
    Lost(String),
}

pub(crate) struct SrtSink {
    socket: Arc<UdpSocket>,
    peer_socket_id: u32,
    start: Instant,
    next_sequence: u32,
    message_number: u32,
    payload_size: usize,
    buffer: Arc<Mutex<RetransmitBuffer>>,
    events: mpsc::Receiver<SrtEvent>,
    control_bytes: usize,
    reader: JoinHandle<()>,
}

impl SrtSink {
    pub fn start(connection: SrtConnection, payload_size: usize, retransmit_capacity: usize) -> Self {
        debug!(
            peer = %connection.peer,
            socket_id = connection.socket_id,
            latency_ms = connection.latency_ms,
            payload_size,
            "Starting SRT sender"
        );
        let buffer = Arc::new(Mutex::new(RetransmitBuffer::new(retransmit_capacity)));
        let (tx, events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let reader = tokio::spawn(read_loop(
            Arc::clone(&connection.socket),
            connection.peer_socket_id,
            connection.start,
            Arc::clone(&buffer),
            tx,
        ));

        Self {
            socket: connection.socket,
            peer_socket_id: connection.peer_socket_id,
            start: connection.start,
            next_sequence: connection.initial_sequence,
            message_number: 1,
            payload_size: payload_size.max(1),
            buffer,
            events,
            control_bytes: 0,
            reader,
        }
    }
}

impl Drop for SrtSink {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl PacketSink for SrtSink {
    async fn write_packet(&mut self, packet: &MuxedPacket) -> TransportResult<usize> {
        let mut written = 0;
        for chunk in packet.data.chunks(self.payload_size) {
            let data = DataPacket {
                sequence: self.next_sequence,
                message_number: self.message_number,
                retransmitted: false,
                timestamp: SrtConnection::timestamp(self.start),
                dest_socket: self.peer_socket_id,
                payload: Bytes::copy_from_slice(chunk),
            };
            let bytes = Packet::Data(data.clone()).encode();
            self.socket.send(&bytes).await?;
            written += bytes.len();

            self.buffer.lock().push(data);
            self.next_sequence = seq_add(self.next_sequence, 1);
            self.message_number = next_message_number(self.message_number);
        }
        trace!(kind = ?packet.kind, bytes = written, "Wrote SRT packets");
        Ok(written)
    }

    async fn poll_control(&mut self) -> TransportResult<()> {
        match self.events.recv().await {
            Some(SrtEvent::Sent(bytes)) => {
                self.control_bytes += bytes;
                Ok(())
            }
            Some(SrtEvent::Lost(reason)) => Err(TransportError::ConnectionLost(reason)),
            None => std::future::pending().await,
        }
    }

    async fn flush_control(&mut self) -> TransportResult<usize> {
        Ok(std::mem::take(&mut self.control_bytes))
    }

    async fn close(&mut self) -> TransportResult<()> {
        debug!(peer_socket_id = self.peer_socket_id, "Sending SRT shutdown");
        self.reader.abort();
        let shutdown = Packet::Control(ControlPacket::new(
            Control::Shutdown,
            SrtConnection::timestamp(self.start),
            self.peer_socket_id,
        ));
        self.socket.send(&shutdown.encode()).await?;
        Ok(())
    }
}

async fn read_loop(
    socket: Arc<UdpSocket>,
    peer_socket_id: u32,
    start: Instant,
    buffer: Arc<Mutex<RetransmitBuffer>>,
    tx: mpsc::Sender<SrtEvent>,
) {
    let mut keepalive = interval(KEEPALIVE_INTERVAL);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_heard = Instant::now();
    let mut buf = vec![0u8; 1500];

    let reason = loop {
        tokio::select! {
            received = socket.recv(&mut buf) => {
                let n = match received {
                    Ok(n) => n,
                    Err(e) => break e.to_string(),
                };
                last_heard = Instant::now();
                let packet = match Packet::decode(Bytes::copy_from_slice(&buf[..n])) {
                    Ok(Packet::Control(control)) => control,
                    Ok(Packet::Data(_)) => continue,
                    Err(e) => {
                        debug!(error = %e, "Ignoring malformed SRT packet");
                        continue;
                    }
                };
                let replies = match packet.body {
                    Control::Ack { ack_number, last_acknowledged } => {
                        buffer.lock().acknowledge(last_acknowledged);
                        trace!(ack_number, last_acknowledged, "ACK");
                        vec![Packet::Control(ControlPacket::new(
                            Control::AckAck(ack_number),
                            SrtConnection::timestamp(start),
                            peer_socket_id,
                        ))]
                    }
                    Control::Nak(ranges) => {
                        let lost = buffer.lock().lost(&ranges);
                        debug!(?ranges, resent = lost.len(), "NAK");
                        lost.into_iter().map(Packet::Data).collect()
                    }
                    Control::Shutdown => break "Peer shut the connection down".to_string(),
                    Control::KeepAlive => {
                        trace!("Keepalive from peer");
                        continue;
                    }
                    other => {
                        trace!(?other, "Ignoring control packet");
                        continue;
                    }
                };

                let mut sent = 0;
                for reply in replies {
                    match socket.send(&reply.encode()).await {
                        Ok(n) => sent += n,
                        Err(e) => {
                            warn!(error = %e, "Failed to answer SRT control packet");
                        }
                    }
                }
                if sent > 0 && tx.send(SrtEvent::Sent(sent)).await.is_err() {
                    return;
                }
            }
            _ = keepalive.tick() => {
                if last_heard.elapsed() > PEER_IDLE_TIMEOUT {
                    break "Peer stopped responding".to_string();
                }
                let packet = Packet::Control(ControlPacket::new(
                    Control::KeepAlive,
                    SrtConnection::timestamp(start),
                    peer_socket_id,
                ));
                if let Err(e) = socket.send(&packet.encode()).await {
                    break e.to_string();
                }
            }
        }
    };
    let _ = tx.send(SrtEvent::Lost(reason)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::srt::packet::MAX_SEQUENCE;

    fn data(sequence: u32) -> DataPacket {
        DataPacket {
            sequence,
            message_number: 1,
            retransmitted: false,
            timestamp: 0,
            dest_socket: 1,
            payload: Bytes::new(),
        }
    }

    #[test]
    fn test_retransmit_buffer_bounded() {
        let mut buffer = RetransmitBuffer::new(3);
        for seq in 0..5 {
            buffer.push(data(seq));
        }
        assert_eq!(buffer.len(), 3);
        assert!(buffer.lost(&[(0, 1)]).is_empty());
    }

    #[test]
    fn test_ack_and_nak_across_wrap() {
        let mut buffer = RetransmitBuffer::new(16);
        let first = MAX_SEQUENCE - 2;
        for i in 0..6 {
            buffer.push(data(seq_add(first, i)));
        }

        let lost = buffer.lost(&[(MAX_SEQUENCE, 1)]);
        let sequences: Vec<u32> = lost.iter().map(|p| p.sequence).collect();
        assert_eq!(sequences, vec![MAX_SEQUENCE, 0, 1]);
        assert!(lost.iter().all(|p| p.retransmitted));

        buffer.acknowledge(1);
        assert_eq!(buffer.len(), 2);
    }
}
