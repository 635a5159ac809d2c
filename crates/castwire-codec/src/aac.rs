//! AAC and Opus header helpers.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::FormatError;
use crate::FormatResult;

/// Sampling frequencies indexed by `sampling_frequency_index`.
pub const AAC_SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// AAC Low Complexity.
const AAC_LC: u8 = 2;

/// Two-byte MPEG-4 `AudioSpecificConfig` for AAC-LC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioSpecificConfig {
    pub object_type: u8,
    pub sample_rate_index: u8,
    pub channel_config: u8,
}

impl AudioSpecificConfig {
    pub fn new(sample_rate: u32, channels: u8) -> FormatResult<Self> {
        let sample_rate_index = AAC_SAMPLE_RATES
            .iter()
            .position(|rate| *rate == sample_rate)
            .ok_or_else(|| {
                FormatError::UnsupportedCodec(format!("AAC does not support {sample_rate} Hz"))
            })? as u8;
        if channels == 0 || channels > 7 {
            return Err(FormatError::UnsupportedCodec(format!(
                "AAC channel count {channels}"
            )));
        }
        Ok(Self {
            object_type: AAC_LC,
            sample_rate_index,
            channel_config: channels,
        })
    }

    pub fn to_bytes(&self) -> [u8; 2] {
        [
            (self.object_type << 3) | (self.sample_rate_index >> 1),
            ((self.sample_rate_index & 0x01) << 7) | (self.channel_config << 3),
        ]
    }

    pub fn parse(data: &[u8]) -> FormatResult<Self> {
        if data.len() < 2 {
            return Err(FormatError::Truncated("AudioSpecificConfig".into()));
        }
        Ok(Self {
            object_type: data[0] >> 3,
            sample_rate_index: ((data[0] & 0x07) << 1) | (data[1] >> 7),
            channel_config: (data[1] >> 3) & 0x0F,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        AAC_SAMPLE_RATES
            .get(self.sample_rate_index as usize)
            .copied()
            .unwrap_or(0)
    }
}

/// Seven-byte ADTS header (no CRC) for a raw AAC frame of `payload_len` bytes.
pub fn adts_header(config: &AudioSpecificConfig, payload_len: usize) -> [u8; 7] {
    let frame_len = (payload_len + 7) as u32;
    let profile = config.object_type.saturating_sub(1) & 0x03;
    [
        0xFF,
        0xF1, // MPEG-4, layer 0, no CRC
        (profile << 6) | (config.sample_rate_index << 2) | ((config.channel_config >> 2) & 0x01),
        ((config.channel_config & 0x03) << 6) | ((frame_len >> 11) & 0x03) as u8,
        ((frame_len >> 3) & 0xFF) as u8,
        (((frame_len & 0x07) << 5) as u8) | 0x1F,
        0xFC,
    ]
}

/// Strip an ADTS header if the frame carries one.
pub fn strip_adts(frame: &Bytes) -> Bytes {
    if frame.len() >= 7 && frame[0] == 0xFF && frame[1] & 0xF0 == 0xF0 {
        let header_len = if frame[1] & 0x01 == 0 { 9 } else { 7 };
        if frame.len() >= header_len {
            return frame.slice(header_len..);
        }
    }
    frame.clone()
}

/// Opus identification header (RFC 7845, section 5.1), mapping family 0.
pub fn opus_head(channels: u8, sample_rate: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(19);
    buf.put_slice(b"OpusHead");
    buf.put_u8(1);
    buf.put_u8(channels);
    buf.put_u16_le(0); // pre-skip
    buf.put_u32_le(sample_rate);
    buf.put_i16_le(0); // output gain
    buf.put_u8(0);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_audio_specific_config() {
        let config = AudioSpecificConfig::new(44100, 2).unwrap();
        assert_eq!(config.to_bytes(), [0x12, 0x10]);

        let config = AudioSpecificConfig::new(48000, 1).unwrap();
        assert_eq!(config.to_bytes(), [0x11, 0x88]);
        assert_eq!(AudioSpecificConfig::parse(&config.to_bytes()).unwrap(), config);
        assert_eq!(config.sample_rate(), 48000);
    }

    #[test]
    fn test_unsupported_sample_rate() {
        assert!(matches!(
            AudioSpecificConfig::new(44000, 2),
            Err(FormatError::UnsupportedCodec(_))
        ));
    }

    #[test]
    fn test_adts_header() {
        let config = AudioSpecificConfig::new(44100, 2).unwrap();
        let header = adts_header(&config, 100);
        assert_eq!(header, [0xFF, 0xF1, 0x50, 0x80, 0x0D, 0x7F, 0xFC]);
    }

    #[test]
    fn test_strip_adts() {
        let config = AudioSpecificConfig::new(44100, 2).unwrap();
        let mut frame = adts_header(&config, 3).to_vec();
        frame.extend_from_slice(&[0x21, 0x10, 0x04]);
        assert_eq!(strip_adts(&Bytes::from(frame)).as_ref(), &[0x21, 0x10, 0x04]);

        let raw = Bytes::from_static(&[0x21, 0x10, 0x04]);
        assert_eq!(strip_adts(&raw), raw);
    }

    #[test]
    fn test_opus_head() {
        let head = opus_head(2, 48000);
        assert_eq!(head.len(), 19);
        assert_eq!(&head[..8], b"OpusHead");
        assert_eq!(&head[12..16], &48000u32.to_le_bytes());
    }
}
