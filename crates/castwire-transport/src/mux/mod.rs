//! Frame-to-container packetization.

mod flv;
mod ts;

pub use flv::FlvMuxer;
pub use ts::{TsMuxer, TS_PACKET_SIZE};

use bytes::Bytes;
use castwire_codec::{MediaFrame, MediaKind, StreamInfo};
use tracing::warn;

use crate::error::MuxError;

/// What a muxed payload carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// Stream metadata (FLV onMetaData).
    Metadata,
    /// Video decoder configuration.
    VideoConfig,
    /// Audio decoder configuration.
    AudioConfig,
    /// Program tables (MPEG-TS PAT/PMT).
    Psi,
    Video { keyframe: bool },
    Audio,
}

/// One container payload ready for a packet sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxedPacket {
    pub kind: PacketKind,
    /// Container timestamp in milliseconds, relative to the first frame.
    pub timestamp_ms: u32,
    /// Source frame timestamp in microseconds, for media packets.
    pub source_timestamp_us: Option<u64>,
    pub data: Bytes,
}

impl MuxedPacket {
    pub(crate) fn config(kind: PacketKind, timestamp_ms: u32, data: Bytes) -> Self {
        Self {
            kind,
            timestamp_ms,
            source_timestamp_us: None,
            data,
        }
    }

    pub fn is_config(&self) -> bool {
        matches!(
            self.kind,
            PacketKind::Metadata | PacketKind::VideoConfig | PacketKind::AudioConfig | PacketKind::Psi
        )
    }

    pub fn media_kind(&self) -> Option<MediaKind> {
        match self.kind {
            PacketKind::Video { .. } | PacketKind::VideoConfig => Some(MediaKind::Video),
            PacketKind::Audio | PacketKind::AudioConfig => Some(MediaKind::Audio),
            PacketKind::Metadata | PacketKind::Psi => None,
        }
    }
}

/// A container format.
pub trait Muxer: Send {
    /// Container name for logs and errors.
    fn name(&self) -> &'static str;

    /// Validate codecs and return the packets that open the stream.
    fn begin_stream(&mut self, info: &StreamInfo) -> Result<Vec<MuxedPacket>, MuxError>;

    /// Wrap one encoded frame.
    fn packetize(&mut self, frame: MediaFrame) -> Result<Vec<MuxedPacket>, MuxError>;

    /// Re-signal a changed stream description inline.
    fn reconfigure(&mut self, info: &StreamInfo) -> Result<Vec<MuxedPacket>, MuxError>;

    /// Frames seen with a timestamp lower than their predecessor.
    fn timestamp_anomalies(&self) -> u64;
}

/// Tracks the stream epoch and per-kind timestamp order.
#[derive(Debug, Default)]
pub(crate) struct TimestampTracker {
    base_us: Option<u64>,
    last_video_us: Option<u64>,
    last_audio_us: Option<u64>,
    anomalies: u64,
}

impl TimestampTracker {
    /// Record a frame timestamp; warns when it goes backwards.
    pub fn observe(&mut self, kind: MediaKind, timestamp_us: u64) {
        self.base_us.get_or_insert(timestamp_us);
        let last = match kind {
            MediaKind::Video => &mut self.last_video_us,
            MediaKind::Audio => &mut self.last_audio_us,
        };
        if let Some(previous) = *last {
            if timestamp_us < previous {
                self.anomalies += 1;
                warn!(
                    ?kind,
                    previous_us = previous,
                    timestamp_us,
                    "Timestamp went backwards"
                );
            }
        }
        *last = Some(timestamp_us);
    }

    /// Microseconds since the first observed frame, clamped at zero.
    pub fn relative_us(&self, timestamp_us: u64) -> u64 {
        timestamp_us.saturating_sub(self.base_us.unwrap_or(timestamp_us))
    }

    /// Milliseconds since the first observed frame, wrapping like FLV timestamps.
    pub fn relative_ms(&self, timestamp_us: u64) -> u32 {
        (self.relative_us(timestamp_us) / 1000) as u32
    }

    /// Latest relative timestamp across both kinds, in milliseconds.
    pub fn last_ms(&self) -> u32 {
        let latest = self.last_video_us.max(self.last_audio_us);
        latest.map(|ts| self.relative_ms(ts)).unwrap_or(0)
    }

    pub fn anomalies(&self) -> u64 {
        self.anomalies
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_counts_regressions_per_kind() {
        let mut tracker = TimestampTracker::default();
        tracker.observe(MediaKind::Video, 1_000_000);
        tracker.observe(MediaKind::Audio, 990_000);
        tracker.observe(MediaKind::Video, 1_033_000);
        assert_eq!(tracker.anomalies(), 0);

        tracker.observe(MediaKind::Video, 1_020_000);
        assert_eq!(tracker.anomalies(), 1);

        assert_eq!(tracker.relative_ms(1_033_000), 33);
        assert_eq!(tracker.relative_ms(990_000), 0);
        assert_eq!(tracker.last_ms(), 20);
    }
}
