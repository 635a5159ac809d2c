//! AV1 codec configuration record (AV1-ISOBMFF, section 2.3).
//!
//! Four fixed bytes summarizing the sequence header, followed by the
//! sequence header OBU itself as `configOBUs`.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::bits::{read_leb128, BitReader};
use crate::error::FormatError;
use crate::FormatResult;

const OBU_SEQUENCE_HEADER: u8 = 1;

/// Parsed or built AV1 configuration record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Av1CodecConfigurationRecord {
    pub seq_profile: u8,
    pub seq_level_idx_0: u8,
    pub seq_tier_0: bool,
    pub high_bitdepth: bool,
    pub twelve_bit: bool,
    pub monochrome: bool,
    pub chroma_subsampling_x: bool,
    pub chroma_subsampling_y: bool,
    pub chroma_sample_position: u8,
    pub config_obus: Bytes,
    pub width: u32,
    pub height: u32,
}

impl Av1CodecConfigurationRecord {
    /// Build a record from a buffer holding a sequence header OBU.
    ///
    /// The buffer may be a whole temporal unit; other OBUs are skipped.
    pub fn from_parameter_sets(parameter_sets: &[Bytes]) -> FormatResult<Self> {
        let obu = parameter_sets
            .iter()
            .find_map(|data| find_sequence_header(data).transpose())
            .transpose()?
            .ok_or_else(|| {
                FormatError::MalformedParameterSet("AV1 requires a sequence header OBU".into())
            })?;

        let mut record = parse_sequence_header(&obu.payload)?;
        record.config_obus = obu.whole;
        debug!(
            profile = record.seq_profile,
            level = record.seq_level_idx_0,
            "Built AV1 codec configuration record"
        );
        Ok(record)
    }

    /// Serialize the record.
    pub fn to_bytes(&self) -> FormatResult<Bytes> {
        let mut buf = BytesMut::with_capacity(4 + self.config_obus.len());
        buf.put_u8(0x81); // marker + version 1
        buf.put_u8((self.seq_profile & 0x07) << 5 | (self.seq_level_idx_0 & 0x1F));
        buf.put_u8(
            (self.seq_tier_0 as u8) << 7
                | (self.high_bitdepth as u8) << 6
                | (self.twelve_bit as u8) << 5
                | (self.monochrome as u8) << 4
                | (self.chroma_subsampling_x as u8) << 3
                | (self.chroma_subsampling_y as u8) << 2
                | (self.chroma_sample_position & 0x03),
        );
        buf.put_u8(0x00); // no initial_presentation_delay
        buf.put_slice(&self.config_obus);
        Ok(buf.freeze())
    }

    /// Parse a serialized record.
    pub fn parse(data: &[u8]) -> FormatResult<Self> {
        if data.len() < 4 {
            return Err(FormatError::Truncated("AV1 record header".into()));
        }
        if data[0] != 0x81 {
            return Err(FormatError::MalformedParameterSet(format!(
                "bad AV1 record marker 0x{:02x}",
                data[0]
            )));
        }

        let config_obus = Bytes::copy_from_slice(&data[4..]);
        let (width, height) = match find_sequence_header(&config_obus)? {
            Some(obu) => parse_sequence_header(&obu.payload)
                .map(|r| (r.width, r.height))
                .unwrap_or((0, 0)),
            None => (0, 0),
        };

        Ok(Self {
            seq_profile: data[1] >> 5,
            seq_level_idx_0: data[1] & 0x1F,
            seq_tier_0: data[2] & 0x80 != 0,
            high_bitdepth: data[2] & 0x40 != 0,
            twelve_bit: data[2] & 0x20 != 0,
            monochrome: data[2] & 0x10 != 0,
            chroma_subsampling_x: data[2] & 0x08 != 0,
            chroma_subsampling_y: data[2] & 0x04 != 0,
            chroma_sample_position: data[2] & 0x03,
            config_obus,
            width,
            height,
        })
    }

    pub fn parameter_sets(&self) -> Vec<Bytes> {
        vec![self.config_obus.clone()]
    }
}

struct Obu {
    whole: Bytes,
    payload: Bytes,
}

/// Walk the OBUs in `data` and return the first sequence header.
fn find_sequence_header(data: &[u8]) -> FormatResult<Option<Obu>> {
    let mut offset = 0;
    while offset < data.len() {
        let header = data[offset];
        let obu_type = (header >> 3) & 0x0F;
        let has_extension = header & 0x04 != 0;
        let has_size = header & 0x02 != 0;

        let mut cursor = offset + 1 + has_extension as usize;
        let payload_len = if has_size {
            let rest = data
                .get(cursor..)
                .ok_or_else(|| FormatError::Truncated("OBU header".into()))?;
            let (size, used) = read_leb128(rest)?;
            cursor += used;
            size as usize
        } else {
            data.len().saturating_sub(cursor)
        };

        let end = cursor
            .checked_add(payload_len)
            .filter(|end| *end <= data.len())
            .ok_or_else(|| FormatError::Truncated("OBU payload".into()))?;

        if obu_type == OBU_SEQUENCE_HEADER {
            return Ok(Some(Obu {
                whole: Bytes::copy_from_slice(&data[offset..end]),
                payload: Bytes::copy_from_slice(&data[cursor..end]),
            }));
        }
        offset = end;
    }
    Ok(None)
}

fn parse_sequence_header(payload: &[u8]) -> FormatResult<Av1CodecConfigurationRecord> {
    let mut r = BitReader::new(payload);

    let seq_profile = r.read_bits(3)? as u8;
    r.skip_bits(1)?; // still_picture
    let reduced_still_picture_header = r.read_bit()?;

    let mut seq_level_idx_0 = 0u8;
    let mut seq_tier_0 = false;

    if reduced_still_picture_header {
        seq_level_idx_0 = r.read_bits(5)? as u8;
    } else {
        let mut decoder_model_info_present = false;
        let mut buffer_delay_length = 0;

        if r.read_bit()? {
            // timing_info
            r.skip_bits(64)?;
            if r.read_bit()? {
                r.read_uvlc()?;
            }
            decoder_model_info_present = r.read_bit()?;
            if decoder_model_info_present {
                buffer_delay_length = r.read_bits(5)? + 1;
                r.skip_bits(32 + 5 + 5)?;
            }
        }

        let initial_display_delay_present = r.read_bit()?;
        let operating_points = r.read_bits(5)? + 1;
        for i in 0..operating_points {
            r.skip_bits(12)?; // operating_point_idc
            let level = r.read_bits(5)? as u8;
            let tier = level > 7 && r.read_bit()?;
            if i == 0 {
                seq_level_idx_0 = level;
                seq_tier_0 = tier;
            }
            if decoder_model_info_present && r.read_bit()? {
                r.skip_bits(buffer_delay_length * 2 + 1)?;
            }
            if initial_display_delay_present && r.read_bit()? {
                r.skip_bits(4)?;
            }
        }
    }

    let width_bits = r.read_bits(4)? + 1;
    let height_bits = r.read_bits(4)? + 1;
    let width = r.read_bits(width_bits)? + 1;
    let height = r.read_bits(height_bits)? + 1;

    if !reduced_still_picture_header && r.read_bit()? {
        r.skip_bits(4 + 3)?; // frame id lengths
    }
    r.skip_bits(3)?; // 128x128 superblock, filter intra, intra edge filter

    if !reduced_still_picture_header {
        r.skip_bits(4)?; // interintra, masked, warped motion, dual filter
        let enable_order_hint = r.read_bit()?;
        if enable_order_hint {
            r.skip_bits(2)?; // jnt comp, ref frame mvs
        }
        let force_screen_content_tools = if r.read_bit()? { 2 } else { r.read_bits(1)? };
        if force_screen_content_tools > 0 && !r.read_bit()? {
            r.skip_bits(1)?; // seq_force_integer_mv
        }
        if enable_order_hint {
            r.skip_bits(3)?; // order_hint_bits_minus_1
        }
    }
    r.skip_bits(3)?; // superres, cdef, restoration

    // color_config()
    let high_bitdepth = r.read_bit()?;
    let twelve_bit = seq_profile == 2 && high_bitdepth && r.read_bit()?;
    let monochrome = seq_profile != 1 && r.read_bit()?;

    let (mut color_primaries, mut transfer, mut matrix) = (2, 2, 2);
    if r.read_bit()? {
        color_primaries = r.read_bits(8)?;
        transfer = r.read_bits(8)?;
        matrix = r.read_bits(8)?;
    }

    let (subsampling_x, subsampling_y, chroma_sample_position) = if monochrome {
        r.skip_bits(1)?; // color_range
        (true, true, 0)
    } else if color_primaries == 1 && transfer == 13 && matrix == 0 {
        (false, false, 0)
    } else {
        r.skip_bits(1)?; // color_range
        let (x, y) = match seq_profile {
            0 => (true, true),
            1 => (false, false),
            _ if twelve_bit => {
                let x = r.read_bit()?;
                let y = x && r.read_bit()?;
                (x, y)
            }
            _ => (true, false),
        };
        let position = if x && y { r.read_bits(2)? as u8 } else { 0 };
        (x, y, position)
    };

    Ok(Av1CodecConfigurationRecord {
        seq_profile,
        seq_level_idx_0,
        seq_tier_0,
        high_bitdepth,
        twelve_bit,
        monochrome,
        chroma_subsampling_x: subsampling_x,
        chroma_subsampling_y: subsampling_y,
        chroma_sample_position,
        config_obus: Bytes::new(),
        width,
        height,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Main profile, level 4.0, 1280x720, 4:2:0, with a size field.
    const SEQUENCE_HEADER: &[u8] = &[
        0x0A, 0x0B, 0x00, 0x00, 0x00, 0x42, 0xA6, 0x7F, 0xD9, 0xE6, 0x13, 0xCC, 0x02,
    ];

    #[test]
    fn test_record_from_sequence_header() {
        let record =
            Av1CodecConfigurationRecord::from_parameter_sets(&[Bytes::from_static(SEQUENCE_HEADER)])
                .unwrap();
        assert_eq!(record.seq_profile, 0);
        assert_eq!(record.seq_level_idx_0, 8);
        assert!(!record.seq_tier_0);
        assert!(record.chroma_subsampling_x && record.chroma_subsampling_y);
        assert_eq!((record.width, record.height), (1280, 720));

        let bytes = record.to_bytes().unwrap();
        assert_eq!(&bytes[..4], &[0x81, 0x08, 0x0C, 0x00]);
        assert_eq!(&bytes[4..], SEQUENCE_HEADER);
    }

    #[test]
    fn test_sequence_header_inside_temporal_unit() {
        // Temporal delimiter OBU, then the sequence header.
        let mut unit = vec![0x12, 0x00];
        unit.extend_from_slice(SEQUENCE_HEADER);
        let record =
            Av1CodecConfigurationRecord::from_parameter_sets(&[Bytes::from(unit)]).unwrap();
        assert_eq!(record.config_obus.as_ref(), SEQUENCE_HEADER);
    }

    #[test]
    fn test_missing_sequence_header() {
        let err = Av1CodecConfigurationRecord::from_parameter_sets(&[Bytes::from_static(&[
            0x12, 0x00,
        ])])
        .unwrap_err();
        assert!(matches!(err, FormatError::MalformedParameterSet(_)));
    }

    #[test]
    fn test_parse_round_trip() {
        let record =
            Av1CodecConfigurationRecord::from_parameter_sets(&[Bytes::from_static(SEQUENCE_HEADER)])
                .unwrap();
        let parsed = Av1CodecConfigurationRecord::parse(&record.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, record);
        assert_eq!(parsed.parameter_sets(), vec![Bytes::from_static(SEQUENCE_HEADER)]);
    }
}
