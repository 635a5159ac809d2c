//! HEVC decoder configuration record (ISO/IEC 14496-15, 8.3.3.1).
//!
//! Unlike AVC, the profile/tier/level fields cannot be copied out of fixed
//! SPS bytes; they come from the `profile_tier_level()` structure, which has
//! to be read bit by bit after removing emulation prevention bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::avc::{put_length_prefixed, read_units};
use crate::bits::{remove_emulation_prevention, BitReader};
use crate::error::FormatError;
use crate::nal::{hevc_nal_type_value, split_nal_units, HevcNalType};
use crate::{FormatResult, NAL_LENGTH_SIZE};

/// One `[completeness|type, count, units]` group of the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HevcNalArray {
    pub array_completeness: bool,
    pub nal_unit_type: u8,
    pub nalus: Vec<Bytes>,
}

/// Parsed or built HEVC decoder configuration record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HevcDecoderConfigurationRecord {
    pub general_profile_space: u8,
    pub general_tier_flag: bool,
    pub general_profile_idc: u8,
    pub general_profile_compatibility_flags: u32,
    /// 48 bits.
    pub general_constraint_indicator_flags: u64,
    pub general_level_idc: u8,
    pub min_spatial_segmentation_idc: u16,
    pub parallelism_type: u8,
    pub chroma_format_idc: u8,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub avg_frame_rate: u16,
    pub constant_frame_rate: u8,
    pub num_temporal_layers: u8,
    pub temporal_id_nested: bool,
    pub length_size_minus_one: u8,
    pub arrays: Vec<HevcNalArray>,
}

impl HevcDecoderConfigurationRecord {
    /// Build a record from VPS, SPS and PPS units.
    pub fn from_parameter_sets(parameter_sets: &[Bytes]) -> FormatResult<Self> {
        let mut vps = Vec::new();
        let mut sps = Vec::new();
        let mut pps = Vec::new();

        for unit in parameter_sets.iter().flat_map(split_nal_units) {
            match HevcNalType::from(unit[0]) {
                HevcNalType::Vps => vps.push(unit),
                HevcNalType::Sps => sps.push(unit),
                HevcNalType::Pps => pps.push(unit),
                other => debug!(?other, "Ignoring non parameter set NAL unit"),
            }
        }

        for (name, units) in [("VPS", &vps), ("SPS", &sps), ("PPS", &pps)] {
            if units.is_empty() {
                return Err(FormatError::MalformedParameterSet(format!(
                    "HEVC requires a {name}"
                )));
            }
        }

        let info = parse_hevc_sps(&sps[0])?;

        let arrays = [(HevcNalType::Vps, vps), (HevcNalType::Sps, sps), (HevcNalType::Pps, pps)]
            .into_iter()
            .map(|(nal_type, nalus)| HevcNalArray {
                array_completeness: true,
                nal_unit_type: nal_type as u8,
                nalus,
            })
            .collect();

        Ok(Self {
            general_profile_space: info.general_profile_space,
            general_tier_flag: info.general_tier_flag,
            general_profile_idc: info.general_profile_idc,
            general_profile_compatibility_flags: info.general_profile_compatibility_flags,
            general_constraint_indicator_flags: info.general_constraint_indicator_flags,
            general_level_idc: info.general_level_idc,
            min_spatial_segmentation_idc: 0,
            parallelism_type: 0,
            chroma_format_idc: info.chroma_format_idc,
            bit_depth_luma_minus8: info.bit_depth_luma_minus8,
            bit_depth_chroma_minus8: info.bit_depth_chroma_minus8,
            avg_frame_rate: 0,
            constant_frame_rate: 0,
            num_temporal_layers: info.max_sub_layers_minus1 + 1,
            temporal_id_nested: info.temporal_id_nesting,
            length_size_minus_one: (NAL_LENGTH_SIZE - 1) as u8,
            arrays,
        })
    }

    /// Serialize the record.
    pub fn to_bytes(&self) -> FormatResult<Bytes> {
        if self.arrays.len() > 0xFF {
            return Err(FormatError::MalformedParameterSet(
                "too many NAL arrays for an 8-bit count".into(),
            ));
        }

        let body: usize = self
            .arrays
            .iter()
            .map(|a| 3 + a.nalus.iter().map(|n| n.len() + 2).sum::<usize>())
            .sum();
        let mut buf = BytesMut::with_capacity(23 + body);

        buf.put_u8(0x01);
        buf.put_u8(
            (self.general_profile_space & 0x03) << 6
                | (self.general_tier_flag as u8) << 5
                | (self.general_profile_idc & 0x1F),
        );
        buf.put_u32(self.general_profile_compatibility_flags);
        buf.put_uint(self.general_constraint_indicator_flags & 0xFFFF_FFFF_FFFF, 6);
        buf.put_u8(self.general_level_idc);
        buf.put_u16(0xF000 | (self.min_spatial_segmentation_idc & 0x0FFF));
        buf.put_u8(0xFC | (self.parallelism_type & 0x03));
        buf.put_u8(0xFC | (self.chroma_format_idc & 0x03));
        buf.put_u8(0xF8 | (self.bit_depth_luma_minus8 & 0x07));
        buf.put_u8(0xF8 | (self.bit_depth_chroma_minus8 & 0x07));
        buf.put_u16(self.avg_frame_rate);
        buf.put_u8(
            (self.constant_frame_rate & 0x03) << 6
                | (self.num_temporal_layers & 0x07) << 3
                | (self.temporal_id_nested as u8) << 2
                | (self.length_size_minus_one & 0x03),
        );

        buf.put_u8(self.arrays.len() as u8);
        for array in &self.arrays {
            let count = u16::try_from(array.nalus.len()).map_err(|_| {
                FormatError::MalformedParameterSet("too many NAL units in one array".into())
            })?;
            buf.put_u8((array.array_completeness as u8) << 7 | (array.nal_unit_type & 0x3F));
            buf.put_u16(count);
            for nalu in &array.nalus {
                put_length_prefixed(&mut buf, nalu)?;
            }
        }

        debug!(
            profile = self.general_profile_idc,
            level = self.general_level_idc,
            total_len = buf.len(),
            "Built HEVC decoder configuration record"
        );

        Ok(buf.freeze())
    }

    /// Parse a serialized record.
    pub fn parse(data: &[u8]) -> FormatResult<Self> {
        let mut buf = data;
        if buf.remaining() < 23 {
            return Err(FormatError::Truncated("HEVC record header".into()));
        }

        let version = buf.get_u8();
        if version != 1 {
            return Err(FormatError::MalformedParameterSet(format!(
                "unknown HEVC record version {version}"
            )));
        }
        let ptl = buf.get_u8();
        let general_profile_compatibility_flags = buf.get_u32();
        let general_constraint_indicator_flags = buf.get_uint(6);
        let general_level_idc = buf.get_u8();
        let min_spatial_segmentation_idc = buf.get_u16() & 0x0FFF;
        let parallelism_type = buf.get_u8() & 0x03;
        let chroma_format_idc = buf.get_u8() & 0x03;
        let bit_depth_luma_minus8 = buf.get_u8() & 0x07;
        let bit_depth_chroma_minus8 = buf.get_u8() & 0x07;
        let avg_frame_rate = buf.get_u16();
        let misc = buf.get_u8();
        let num_arrays = buf.get_u8() as usize;

        let mut arrays = Vec::with_capacity(num_arrays);
        for _ in 0..num_arrays {
            if buf.remaining() < 3 {
                return Err(FormatError::Truncated("HEVC NAL array header".into()));
            }
            let header = buf.get_u8();
            let count = buf.get_u16() as usize;
            let nalus = read_units(&mut buf, count)?;
            arrays.push(HevcNalArray {
                array_completeness: header & 0x80 != 0,
                nal_unit_type: header & 0x3F,
                nalus,
            });
        }

        Ok(Self {
            general_profile_space: ptl >> 6,
            general_tier_flag: ptl & 0x20 != 0,
            general_profile_idc: ptl & 0x1F,
            general_profile_compatibility_flags,
            general_constraint_indicator_flags,
            general_level_idc,
            min_spatial_segmentation_idc,
            parallelism_type,
            chroma_format_idc,
            bit_depth_luma_minus8,
            bit_depth_chroma_minus8,
            avg_frame_rate,
            constant_frame_rate: misc >> 6,
            num_temporal_layers: (misc >> 3) & 0x07,
            temporal_id_nested: misc & 0x04 != 0,
            length_size_minus_one: misc & 0x03,
            arrays,
        })
    }

    /// All parameter sets in record order.
    pub fn parameter_sets(&self) -> Vec<Bytes> {
        self.arrays.iter().flat_map(|a| a.nalus.iter().cloned()).collect()
    }

    /// Picture dimensions from the first SPS, if it parses.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        let sps = self
            .arrays
            .iter()
            .filter(|a| a.nal_unit_type == HevcNalType::Sps as u8)
            .flat_map(|a| a.nalus.first())
            .next()?;
        parse_hevc_sps(sps).ok().map(|info| (info.width, info.height))
    }
}

/// Fields of an H.265 SPS needed for the configuration record and metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HevcSpsInfo {
    pub max_sub_layers_minus1: u8,
    pub temporal_id_nesting: bool,
    pub general_profile_space: u8,
    pub general_tier_flag: bool,
    pub general_profile_idc: u8,
    pub general_profile_compatibility_flags: u32,
    pub general_constraint_indicator_flags: u64,
    pub general_level_idc: u8,
    pub chroma_format_idc: u8,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub width: u32,
    pub height: u32,
}

/// Parse an H.265 SPS NAL unit (2-byte header included).
pub fn parse_hevc_sps(sps: &[u8]) -> FormatResult<HevcSpsInfo> {
    if sps.len() < 3 || hevc_nal_type_value(sps[0]) != HevcNalType::Sps as u8 {
        return Err(FormatError::MalformedParameterSet("not an HEVC SPS".into()));
    }
    let rbsp = remove_emulation_prevention(&sps[2..]);
    let mut r = BitReader::new(&rbsp);

    r.skip_bits(4)?; // sps_video_parameter_set_id
    let max_sub_layers_minus1 = r.read_bits(3)? as u8;
    let temporal_id_nesting = r.read_bit()?;

    // profile_tier_level(1, max_sub_layers_minus1)
    let general_profile_space = r.read_bits(2)? as u8;
    let general_tier_flag = r.read_bit()?;
    let general_profile_idc = r.read_bits(5)? as u8;
    let general_profile_compatibility_flags = r.read_bits(32)?;
    let general_constraint_indicator_flags = r.read_bits_u64(48)?;
    let general_level_idc = r.read_bits(8)? as u8;

    let mut sub_layer_flags = Vec::with_capacity(max_sub_layers_minus1 as usize);
    for _ in 0..max_sub_layers_minus1 {
        let profile_present = r.read_bit()?;
        let level_present = r.read_bit()?;
        sub_layer_flags.push((profile_present, level_present));
    }
    if max_sub_layers_minus1 > 0 {
        for _ in max_sub_layers_minus1..8 {
            r.skip_bits(2)?;
        }
    }
    for (profile_present, level_present) in sub_layer_flags {
        if profile_present {
            r.skip_bits(88)?;
        }
        if level_present {
            r.skip_bits(8)?;
        }
    }

    r.read_golomb()?; // sps_seq_parameter_set_id
    let chroma_format_idc = r.read_golomb()?;
    let mut separate_colour_plane = false;
    if chroma_format_idc == 3 {
        separate_colour_plane = r.read_bit()?;
    }
    let mut width = r.read_golomb()?;
    let mut height = r.read_golomb()?;

    if r.read_bit()? {
        let left = r.read_golomb()?;
        let right = r.read_golomb()?;
        let top = r.read_golomb()?;
        let bottom = r.read_golomb()?;
        let (sub_width, sub_height) = match (chroma_format_idc, separate_colour_plane) {
            (1, _) => (2, 2),
            (2, _) => (2, 1),
            _ => (1, 1),
        };
        width = width.saturating_sub((left + right) * sub_width);
        height = height.saturating_sub((top + bottom) * sub_height);
    }

    let bit_depth_luma_minus8 = r.read_golomb()? as u8;
    let bit_depth_chroma_minus8 = r.read_golomb()? as u8;

    Ok(HevcSpsInfo {
        max_sub_layers_minus1,
        temporal_id_nesting,
        general_profile_space,
        general_tier_flag,
        general_profile_idc,
        general_profile_compatibility_flags,
        general_constraint_indicator_flags,
        general_level_idc,
        chroma_format_idc: chroma_format_idc as u8,
        bit_depth_luma_minus8,
        bit_depth_chroma_minus8,
        width,
        height,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use quickcheck_macros::quickcheck;

    fn signed(values: &[i16]) -> Bytes {
        Bytes::from(values.iter().map(|v| *v as u8).collect::<Vec<u8>>())
    }

    fn vps() -> Bytes {
        signed(&[
            64, 1, 12, 1, -1, -1, 1, 96, 0, 0, 3, 0, 0, 3, 0, 0, 3, 0, 0, 3, 0, -103, 44, 9,
        ])
    }

    fn sps() -> Bytes {
        signed(&[
            66, 1, 1, 1, 96, 0, 0, 3, 0, 0, 3, 0, 0, 3, 0, 0, 3, 0, -103, -96, 15, 8, 2, -127,
            104, -76, -82, -55, 46, -26, -96, -64, -64, -64, 16,
        ])
    }

    fn pps() -> Bytes {
        signed(&[68, 1, -64, 102, 124, 12, -58, 64])
    }

    #[test]
    fn test_sps_fields() {
        let info = parse_hevc_sps(&sps()).unwrap();
        assert_eq!(info.general_profile_idc, 1);
        assert_eq!(info.general_profile_compatibility_flags, 0x6000_0000);
        assert_eq!(info.general_constraint_indicator_flags, 0);
        assert_eq!(info.general_level_idc, 153);
        assert_eq!(info.chroma_format_idc, 1);
        assert!(info.temporal_id_nesting);
        assert_eq!((info.width, info.height), (480, 640));
    }

    #[test]
    fn test_record_bytes() {
        let record =
            HevcDecoderConfigurationRecord::from_parameter_sets(&[sps(), pps(), vps()]).unwrap();
        let bytes = record.to_bytes().unwrap();

        let header: [u8; 23] = [
            0x01, 0x01, 0x60, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x99, 0xF0,
            0x00, 0xFC, 0xFD, 0xF8, 0xF8, 0x00, 0x00, 0x0F, 0x03,
        ];
        assert_eq!(&bytes[..23], &header);
        assert_eq!(bytes.len(), 105);

        // VPS array comes first regardless of input order.
        assert_eq!(&bytes[23..28], &[0xA0, 0x00, 0x01, 0x00, 24]);
        assert_eq!(&bytes[28..52], vps().as_ref());
    }

    #[test]
    fn test_record_is_deterministic() {
        let a = HevcDecoderConfigurationRecord::from_parameter_sets(&[vps(), sps(), pps()])
            .unwrap()
            .to_bytes()
            .unwrap();
        let b = HevcDecoderConfigurationRecord::from_parameter_sets(&[pps(), vps(), sps()])
            .unwrap()
            .to_bytes()
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_record_requires_vps() {
        let err =
            HevcDecoderConfigurationRecord::from_parameter_sets(&[sps(), pps()]).unwrap_err();
        assert_eq!(
            err,
            FormatError::MalformedParameterSet("HEVC requires a VPS".into())
        );
    }

    #[test]
    fn test_parse_round_trip() {
        let record =
            HevcDecoderConfigurationRecord::from_parameter_sets(&[vps(), sps(), pps()]).unwrap();
        let parsed = HevcDecoderConfigurationRecord::parse(&record.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, record);
        assert_eq!(parsed.parameter_sets(), vec![vps(), sps(), pps()]);
        assert_eq!(parsed.dimensions(), Some((480, 640)));
    }

    #[quickcheck]
    fn prop_parameter_sets_round_trip(payloads: Vec<Vec<u8>>) -> bool {
        let nalus: Vec<Bytes> = payloads
            .into_iter()
            .take(8)
            .map(|mut p| {
                p.truncate(512);
                p.insert(0, 0x44);
                Bytes::from(p)
            })
            .collect();
        let mut record =
            HevcDecoderConfigurationRecord::from_parameter_sets(&[vps(), sps(), pps()]).unwrap();
        record.arrays[2].nalus.extend(nalus);

        let parsed = HevcDecoderConfigurationRecord::parse(&record.to_bytes().unwrap()).unwrap();
        parsed.parameter_sets() == record.parameter_sets()
    }
}
