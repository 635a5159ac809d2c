//! Encoded media frames as handed over by an encoder.

use std::fmt;

use bytes::Bytes;

/// Media kind of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Video,
    Audio,
}

/// Supported video codecs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    /// H.264 / AVC.
    Avc,
    /// H.265 / HEVC.
    Hevc,
    /// AV1.
    Av1,
}

impl fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Avc => "H.264",
            Self::Hevc => "H.265",
            Self::Av1 => "AV1",
        })
    }
}

/// Supported audio codecs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodec {
    /// AAC-LC.
    Aac,
    Opus,
    /// G.711 A-law.
    G711Alaw,
    /// G.711 mu-law.
    G711Ulaw,
}

impl fmt::Display for AudioCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Aac => "AAC",
            Self::Opus => "Opus",
            Self::G711Alaw => "G.711 A-law",
            Self::G711Ulaw => "G.711 mu-law",
        })
    }
}

/// An encoded frame with timing metadata.
///
/// Once built a frame is never mutated; it moves from the producer into the
/// send queue and from there to the sender task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFrame {
    /// Video or audio.
    pub kind: MediaKind,

    /// Encoded payload. Video may be Annex B or length-prefixed.
    pub payload: Bytes,

    /// Decode timestamp in microseconds, stream relative.
    pub timestamp_us: u64,

    /// Whether this frame can be decoded on its own (video only).
    pub is_keyframe: bool,

    /// Presentation minus decode time in microseconds (zero without B-frames).
    pub composition_offset_us: i64,
}

impl MediaFrame {
    /// Create a video frame.
    pub fn video(payload: impl Into<Bytes>, timestamp_us: u64, is_keyframe: bool) -> Self {
        Self {
            kind: MediaKind::Video,
            payload: payload.into(),
            timestamp_us,
            is_keyframe,
            composition_offset_us: 0,
        }
    }

    /// Create an audio frame.
    pub fn audio(payload: impl Into<Bytes>, timestamp_us: u64) -> Self {
        Self {
            kind: MediaKind::Audio,
            payload: payload.into(),
            timestamp_us,
            is_keyframe: false,
            composition_offset_us: 0,
        }
    }

    /// Set the composition offset.
    pub fn with_composition_offset(mut self, offset_us: i64) -> Self {
        self.composition_offset_us = offset_us;
        self
    }

    pub fn is_video(&self) -> bool {
        self.kind == MediaKind::Video
    }

    /// Presentation timestamp in microseconds.
    pub fn pts_us(&self) -> u64 {
        self.timestamp_us.saturating_add_signed(self.composition_offset_us)
    }
}
