//! Publishing half of an RTMP session.
//!
//! The client session is shared with a reader task that feeds it server
//! bytes; replies it produces (acknowledgements, ping responses) are handed
//! back to the sink and written between media packets.

use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rml_amf0::Amf0Value;
use rml_rtmp::sessions::{
    ClientSession, ClientSessionEvent, ClientSessionResult, StreamMetadata,
};
use rml_rtmp::time::RtmpTimestamp;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::connection::{session_error, RtmpConnection};
use super::status::error_status;
use crate::error::{ProtocolError, TransportError};
use crate::mux::{MuxedPacket, PacketKind};
use crate::pipeline::PacketSink;
use crate::TransportResult;

const CONTROL_CHANNEL_CAPACITY: usize = 32;

/// Sent from the reader task to the sink.
#[derive(Debug)]
enum ControlEvent {
    Reply(Bytes),
    Lost(String),
}

pub(crate) struct RtmpSink {
    writer: OwnedWriteHalf,
    session: Arc<Mutex<ClientSession>>,
    stream_name: String,
    control: mpsc::Receiver<ControlEvent>,
    pending: Vec<Bytes>,
    reader: JoinHandle<()>,
}

impl RtmpSink {
    /// Split the connection and start answering the server in the background.
    pub fn start(connection: RtmpConnection, stream_name: String) -> Self {
        let (stream, session) = connection.into_parts();
        let (read, writer) = stream.into_split();
        let session = Arc::new(Mutex::new(session));
        let (tx, control) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
        let reader = tokio::spawn(read_loop(read, Arc::clone(&session), tx));

        Self {
            writer,
            session,
            stream_name,
            control,
            pending: Vec::new(),
            reader,
        }
    }

    async fn write_results(&mut self, results: Vec<ClientSessionResult>) -> TransportResult<usize> {
        let mut written = 0;
        for result in results {
            if let ClientSessionResult::OutboundResponse(packet) = result {
                self.writer.write_all(&packet.bytes).await?;
                written += packet.bytes.len();
            }
        }
        Ok(written)
    }

    /// Hand one muxed packet to the client session.
    fn publish(&self, packet: &MuxedPacket) -> TransportResult<Option<ClientSessionResult>> {
        let timestamp = RtmpTimestamp::new(packet.timestamp_ms);
        let mut session = self.session.lock();
        let result = match packet.kind {
            PacketKind::Metadata => session.publish_metadata(&stream_metadata(&packet.data)?),
            PacketKind::VideoConfig => {
                session.publish_video_data(packet.data.clone(), timestamp, false)
            }
            PacketKind::Video { keyframe } => {
                session.publish_video_data(packet.data.clone(), timestamp, !keyframe)
            }
            PacketKind::AudioConfig | PacketKind::Audio => {
                session.publish_audio_data(packet.data.clone(), timestamp, false)
            }
            PacketKind::Psi => return Ok(None),
        };
        result.map(Some).map_err(session_error)
    }
}

impl Drop for RtmpSink {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl PacketSink for RtmpSink {
    async fn write_packet(&mut self, packet: &MuxedPacket) -> TransportResult<usize> {
        let result = match self.publish(packet)? {
            Some(result) => result,
            None => return Ok(0),
        };

        let written = self.write_results(vec![result]).await?;
        trace!(
            kind = ?packet.kind,
            timestamp_ms = packet.timestamp_ms,
            bytes = written,
            "Wrote RTMP packet"
        );
        Ok(written)
    }

    async fn poll_control(&mut self) -> TransportResult<()> {
        match self.control.recv().await {
            Some(ControlEvent::Reply(bytes)) => {
                self.pending.push(bytes);
                Ok(())
            }
            Some(ControlEvent::Lost(reason)) => Err(TransportError::ConnectionLost(reason)),
            None => std::future::pending().await,
        }
    }

    async fn flush_control(&mut self) -> TransportResult<usize> {
        let mut written = 0;
        for bytes in std::mem::take(&mut self.pending) {
            self.writer.write_all(&bytes).await?;
            written += bytes.len();
        }
        Ok(written)
    }

    async fn close(&mut self) -> TransportResult<()> {
        debug!(stream = %self.stream_name, "Unpublishing");
        self.reader.abort();
        let stopped = self.session.lock().stop_publishing();
        let results = stopped.map_err(session_error)?;
        self.write_results(results).await?;
        self.writer.shutdown().await?;
        Ok(())
    }
}

async fn read_loop(
    mut read: OwnedReadHalf,
    session: Arc<Mutex<ClientSession>>,
    tx: mpsc::Sender<ControlEvent>,
) {
    let mut buf = vec![0u8; 8192];
    let reason = loop {
        let n = match read.read(&mut buf).await {
            Ok(0) => break "Server closed the connection".to_string(),
            Ok(n) => n,
            Err(e) => break e.to_string(),
        };
        let handled = session.lock().handle_input(&buf[..n]);
        let results = match handled {
            Ok(results) => results,
            Err(e) => break format!("RTMP session: {:?}", e),
        };
        for result in results {
            let event = match result {
                ClientSessionResult::OutboundResponse(packet) => {
                    ControlEvent::Reply(Bytes::from(packet.bytes))
                }
                ClientSessionResult::RaisedEvent(event) => match server_error(event) {
                    Some(reason) => ControlEvent::Lost(reason),
                    None => continue,
                },
                ClientSessionResult::UnhandleableMessageReceived(_) => continue,
            };
            let lost = matches!(event, ControlEvent::Lost(_));
            if tx.send(event).await.is_err() || lost {
                return;
            }
        }
    };
    let _ = tx.send(ControlEvent::Lost(reason)).await;
}

/// A server event that ends the session, as a reason.
fn server_error(event: ClientSessionEvent) -> Option<String> {
    match event {
        ClientSessionEvent::UnhandleableAmf0Command {
            command_name,
            additional_values,
            ..
        } => match error_status(&command_name, &additional_values) {
            Some(code) => {
                warn!(command = %command_name, code = %code, "Server reported an error");
                Some(format!("server error: {}", code))
            }
            None => {
                debug!(command = %command_name, "Server command");
                None
            }
        },
        other => {
            trace!("Ignoring server event: {:?}", other);
            None
        }
    }
}

/// Session metadata from an FLV `@setDataFrame onMetaData` body.
fn stream_metadata(body: &Bytes) -> TransportResult<StreamMetadata> {
    let values = rml_amf0::deserialize(&mut Cursor::new(body.as_ref()))
        .map_err(|e| ProtocolError::Malformed(format!("onMetaData: {:?}", e)))?;
    let properties = values
        .into_iter()
        .find_map(Amf0Value::get_object_properties)
        .unwrap_or_default();
    let number = |key: &str| match properties.get(key) {
        Some(Amf0Value::Number(value)) => Some(*value),
        _ => None,
    };

    let mut metadata = StreamMetadata::new();
    metadata.video_width = number("width").map(|v| v as u32);
    metadata.video_height = number("height").map(|v| v as u32);
    metadata.audio_sample_rate = number("audiosamplerate").map(|v| v as u32);
    metadata.audio_channels = number("audiochannels").map(|v| v as u32);
    metadata.audio_is_stereo = match properties.get("stereo") {
        Some(Amf0Value::Boolean(stereo)) => Some(*stereo),
        _ => None,
    };
    metadata.encoder = match properties.get("encoder") {
        Some(Amf0Value::Utf8String(encoder)) => Some(encoder.clone()),
        _ => None,
    };
    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::{FlvMuxer, Muxer};
    use castwire_codec::{AudioCodec, AudioInfo, StreamInfo};

    #[test]
    fn test_metadata_from_flv_body() {
        let info = StreamInfo {
            video: None,
            audio: Some(AudioInfo::new(AudioCodec::Aac, 48000, 2).unwrap()),
        };
        let packets = FlvMuxer::new(false).begin_stream(&info).unwrap();
        assert_eq!(packets[0].kind, PacketKind::Metadata);

        let metadata = stream_metadata(&packets[0].data).unwrap();
        assert_eq!(metadata.video_width, None);
        assert_eq!(metadata.audio_sample_rate, Some(48000));
        assert_eq!(metadata.audio_channels, Some(2));
        assert_eq!(metadata.audio_is_stereo, Some(true));
        assert!(metadata.encoder.unwrap().starts_with("castwire/"));
    }

    #[test]
    fn test_metadata_rejects_garbage() {
        let err = stream_metadata(&Bytes::from_static(&[0x02, 0xFF])).unwrap_err();
        assert!(matches!(
            err,
            TransportError::Protocol(ProtocolError::Malformed(_))
        ));
    }
}
