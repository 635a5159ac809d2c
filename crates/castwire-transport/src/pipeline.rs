//! The sender task: queue → muxer → packet sink.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use castwire_ipc::{ClientEvent, ConnectionState, FailureReason};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::error::TransportError;
use crate::mux::{MuxedPacket, Muxer};
use crate::queue::QueueItem;
use crate::session::Session;
use crate::TransportResult;

const BITRATE_INTERVAL: Duration = Duration::from_secs(1);

/// Where muxed packets go: the RTMP chunk stream or SRT datagrams.
#[async_trait]
pub(crate) trait PacketSink: Send {
    /// Write one packet, returning the bytes put on the wire.
    async fn write_packet(&mut self, packet: &MuxedPacket) -> TransportResult<usize>;

    /// Wait for inbound control traffic.
    ///
    /// Must be cancel safe: it only receives, replies go out in
    /// [`flush_control`](Self::flush_control). An error ends the session.
    async fn poll_control(&mut self) -> TransportResult<()>;

    /// Write replies gathered by `poll_control`.
    async fn flush_control(&mut self) -> TransportResult<usize> {
        Ok(0)
    }

    /// Say goodbye to the server and close the transport.
    async fn close(&mut self) -> TransportResult<()>;
}

/// Drives one session until the queue is closed and drained or the session ends.
pub(crate) async fn run_sender(
    session: Arc<Session>,
    mut sink: Box<dyn PacketSink>,
    mut muxer: Box<dyn Muxer>,
    opening: Vec<MuxedPacket>,
) {
    let mut shutdown = session.shutdown_signal();
    if *shutdown.borrow() {
        return;
    }
    let mut sender = Sender {
        session: Arc::clone(&session),
        streaming: false,
    };

    if let Err(e) = sender.write_all(sink.as_mut(), &opening).await {
        sender.lost(e);
        return;
    }

    let mut bitrate = interval(BITRATE_INTERVAL);
    bitrate.set_missed_tick_behavior(MissedTickBehavior::Delay);
    bitrate.tick().await;
    let mut bytes_at_tick = session.bytes_sent();

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!("Sender stopped by shutdown signal");
                    if session.state() == ConnectionState::Closing {
                        if let Err(e) = sink.close().await {
                            warn!(error = %e, "Error while closing transport");
                        }
                    }
                    return;
                }
            }
            control = sink.poll_control() => {
                let flushed = match control {
                    Ok(()) => sink.flush_control().await,
                    Err(e) => Err(e),
                };
                match flushed {
                    Ok(bytes) => session.record_control_bytes(bytes),
                    Err(e) => {
                        sender.lost(e);
                        return;
                    }
                }
            }
            _ = bitrate.tick() => {
                let total = session.bytes_sent();
                let bits_per_second = (total - bytes_at_tick) * 8;
                bytes_at_tick = total;
                trace!(bits_per_second, "Bitrate");
                session.emit(ClientEvent::NewBitrate { bits_per_second });
            }
            entry = session.queue().pop() => {
                let Some(entry) = entry else {
                    debug!("Send queue drained, closing transport");
                    if let Err(e) = sink.close().await {
                        warn!(error = %e, "Error while closing transport");
                    }
                    return;
                };
                trace!(waited_us = entry.admitted.elapsed().as_micros() as u64, "Dequeued");

                let packets = match entry.item {
                    QueueItem::Frame(frame) => {
                        let kind = frame.kind;
                        match muxer.packetize(frame) {
                            Ok(packets) => packets,
                            Err(e) => {
                                warn!(muxer = muxer.name(), error = %e, ?kind, "Dropping frame");
                                session.record_dropped(kind);
                                continue;
                            }
                        }
                    }
                    QueueItem::Reconfigure { kind, info } => match muxer.reconfigure(&info) {
                        Ok(packets) => {
                            info!(?kind, "Stream reconfigured");
                            packets
                        }
                        Err(e) => {
                            warn!(muxer = muxer.name(), error = %e, "Reconfiguration rejected");
                            continue;
                        }
                    },
                };
                session.set_timestamp_anomalies(muxer.timestamp_anomalies());

                if let Err(e) = sender.write_all(sink.as_mut(), &packets).await {
                    sender.lost(e);
                    return;
                }
            }
        }
    }
}

struct Sender {
    session: Arc<Session>,
    streaming: bool,
}

impl Sender {
    async fn write_all(
        &mut self,
        sink: &mut dyn PacketSink,
        packets: &[MuxedPacket],
    ) -> TransportResult<()> {
        for packet in packets {
            let bytes = sink.write_packet(packet).await?;
            self.session.record_written(packet, bytes);

            if packet.is_config() {
                continue;
            }
            if !self.streaming {
                self.streaming = true;
                if self.session.state() == ConnectionState::Ready {
                    if let Err(e) = self.session.transition(ConnectionState::Streaming) {
                        debug!(error = %e, "Could not mark session as streaming");
                    }
                }
            }
            if let Some(timestamp_us) = packet.source_timestamp_us {
                self.session.emit(ClientEvent::NewTimestamp { timestamp_us });
            }
        }
        Ok(())
    }

    fn lost(&self, error: TransportError) {
        self.session.fail(FailureReason::ConnectionLost {
            message: error.to_string(),
        });
        self.session.discard_queue();
    }
}
