//! Stream description handed to muxers.

use bytes::Bytes;

use crate::aac::AudioSpecificConfig;
use crate::av1::Av1CodecConfigurationRecord;
use crate::avc::AvcDecoderConfigurationRecord;
use crate::error::FormatError;
use crate::frame::{AudioCodec, VideoCodec};
use crate::hevc::HevcDecoderConfigurationRecord;
use crate::FormatResult;

/// A decoder configuration record, keyed by codec family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecoderConfigurationRecord {
    Avc(AvcDecoderConfigurationRecord),
    Hevc(HevcDecoderConfigurationRecord),
    Av1(Av1CodecConfigurationRecord),
}

impl DecoderConfigurationRecord {
    /// Build the record for `codec` from raw parameter sets.
    pub fn build(codec: VideoCodec, parameter_sets: &[Bytes]) -> FormatResult<Self> {
        if parameter_sets.iter().all(|set| set.is_empty()) {
            return Err(FormatError::MalformedParameterSet(
                "no parameter sets given".into(),
            ));
        }
        Ok(match codec {
            VideoCodec::Avc => {
                Self::Avc(AvcDecoderConfigurationRecord::from_parameter_sets(parameter_sets)?)
            }
            VideoCodec::Hevc => {
                Self::Hevc(HevcDecoderConfigurationRecord::from_parameter_sets(parameter_sets)?)
            }
            VideoCodec::Av1 => {
                Self::Av1(Av1CodecConfigurationRecord::from_parameter_sets(parameter_sets)?)
            }
        })
    }

    /// Parse serialized record bytes for `codec`.
    pub fn parse(codec: VideoCodec, data: &[u8]) -> FormatResult<Self> {
        Ok(match codec {
            VideoCodec::Avc => Self::Avc(AvcDecoderConfigurationRecord::parse(data)?),
            VideoCodec::Hevc => Self::Hevc(HevcDecoderConfigurationRecord::parse(data)?),
            VideoCodec::Av1 => Self::Av1(Av1CodecConfigurationRecord::parse(data)?),
        })
    }

    pub fn codec(&self) -> VideoCodec {
        match self {
            Self::Avc(_) => VideoCodec::Avc,
            Self::Hevc(_) => VideoCodec::Hevc,
            Self::Av1(_) => VideoCodec::Av1,
        }
    }

    pub fn to_bytes(&self) -> FormatResult<Bytes> {
        match self {
            Self::Avc(record) => record.to_bytes(),
            Self::Hevc(record) => record.to_bytes(),
            Self::Av1(record) => record.to_bytes(),
        }
    }

    /// Parameter sets in the order a decoder needs them.
    pub fn parameter_sets(&self) -> Vec<Bytes> {
        match self {
            Self::Avc(record) => record.sps.iter().chain(&record.pps).cloned().collect(),
            Self::Hevc(record) => record.parameter_sets(),
            Self::Av1(record) => record.parameter_sets(),
        }
    }

    /// Picture width and height, or zeros when the SPS could not be read.
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            Self::Avc(record) => record.dimensions(),
            Self::Hevc(record) => record.dimensions(),
            Self::Av1(record) => Some((record.width, record.height)),
        }
        .unwrap_or((0, 0))
    }
}

/// Video parameters known once the encoder has produced its headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoInfo {
    pub codec: VideoCodec,
    pub record: DecoderConfigurationRecord,
    /// Serialized `record`, cached so every re-emission is byte-identical.
    pub record_bytes: Bytes,
}

impl VideoInfo {
    /// Validate parameter sets and pre-build the configuration record.
    pub fn new(codec: VideoCodec, parameter_sets: &[Bytes]) -> FormatResult<Self> {
        let record = DecoderConfigurationRecord::build(codec, parameter_sets)?;
        let record_bytes = record.to_bytes()?;
        Ok(Self {
            codec,
            record,
            record_bytes,
        })
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.record.dimensions()
    }
}

/// Audio parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioInfo {
    pub codec: AudioCodec,
    pub sample_rate: u32,
    pub channels: u8,
}

impl AudioInfo {
    pub fn new(codec: AudioCodec, sample_rate: u32, channels: u8) -> FormatResult<Self> {
        match codec {
            AudioCodec::Aac => {
                AudioSpecificConfig::new(sample_rate, channels)?;
            }
            AudioCodec::Opus => {
                if channels == 0 || channels > 2 {
                    return Err(FormatError::UnsupportedCodec(format!(
                        "Opus channel count {channels}"
                    )));
                }
            }
            AudioCodec::G711Alaw | AudioCodec::G711Ulaw => {
                if sample_rate != 8000 || channels != 1 {
                    return Err(FormatError::UnsupportedCodec(
                        "G.711 must be 8000 Hz mono".into(),
                    ));
                }
            }
        }
        Ok(Self {
            codec,
            sample_rate,
            channels,
        })
    }

    /// AAC `AudioSpecificConfig`, when the codec is AAC.
    pub fn aac_config(&self) -> Option<AudioSpecificConfig> {
        match self.codec {
            AudioCodec::Aac => AudioSpecificConfig::new(self.sample_rate, self.channels).ok(),
            _ => None,
        }
    }
}

/// Everything a muxer needs to describe the stream.
///
/// Kept as an immutable snapshot; a change replaces the whole value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamInfo {
    pub video: Option<VideoInfo>,
    pub audio: Option<AudioInfo>,
}
