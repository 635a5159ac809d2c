//! Common types shared with the application.

use serde::{Deserialize, Serialize};

/// Counters for one streaming session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportStatistics {
    /// Bytes written to the socket, protocol framing included.
    pub bytes_sent: u64,

    /// Video frames written.
    pub video_frames_sent: u64,

    /// Audio frames written.
    pub audio_frames_sent: u64,

    /// Video frames evicted from the send queue or dropped while idle.
    pub dropped_video_frames: u64,

    /// Audio frames evicted from the send queue or dropped while idle.
    pub dropped_audio_frames: u64,

    /// Frames whose timestamp went backwards.
    pub timestamp_anomalies: u64,

    /// Entries waiting in the send queue.
    pub queued: usize,
}

impl TransportStatistics {
    /// Total frames dropped for any reason.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_video_frames + self.dropped_audio_frames
    }
}
