//! Codec-side building blocks for live streaming.
//!
//! This crate contains everything the transport needs to know about encoded
//! media without touching a socket:
//! - fixed-width integer encoding, MD5 digests and hex/base64 rendering
//! - NAL unit splitting for Annex B and length-prefixed streams
//! - decoder configuration records for AVC, HEVC and AV1
//! - AAC, ADTS and Opus headers
//! - the [`MediaFrame`] and [`StreamInfo`] types handed over by encoders

mod aac;
mod av1;
mod avc;
mod bits;
mod error;
mod frame;
mod hevc;
mod info;
pub mod nal;
pub mod primitives;

pub use aac::{adts_header, opus_head, strip_adts, AudioSpecificConfig, AAC_SAMPLE_RATES};
pub use av1::Av1CodecConfigurationRecord;
pub use avc::{parse_avc_sps, AvcDecoderConfigurationRecord, AvcSpsInfo};
pub use bits::{remove_emulation_prevention, BitReader};
pub use error::FormatError;
pub use frame::{AudioCodec, MediaFrame, MediaKind, VideoCodec};
pub use hevc::{parse_hevc_sps, HevcDecoderConfigurationRecord, HevcNalArray, HevcSpsInfo};
pub use info::{AudioInfo, DecoderConfigurationRecord, StreamInfo, VideoInfo};

/// Result type for codec operations.
pub type FormatResult<T> = Result<T, FormatError>;

/// Size of the NAL unit length prefix written into configuration records.
pub const NAL_LENGTH_SIZE: usize = 4;
