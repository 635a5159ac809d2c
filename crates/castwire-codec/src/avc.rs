//! AVC decoder configuration record (ISO/IEC 14496-15, 5.3.3.1).
//!
//! This is the "sequence header" that FLV carries before any H.264 frame:
//! - configurationVersion: 1 byte (always 0x01)
//! - AVCProfileIndication, profile_compatibility, AVCLevelIndication: SPS bytes 1..4
//! - lengthSizeMinusOne: 1 byte (0xFF, 4-byte NAL lengths, upper 6 bits reserved)
//! - numOfSequenceParameterSets: 1 byte (upper 3 bits reserved as 1s)
//! - per SPS: 16-bit length, NAL unit
//! - numOfPictureParameterSets: 1 byte
//! - per PPS: 16-bit length, NAL unit

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::bits::{remove_emulation_prevention, BitReader};
use crate::error::FormatError;
use crate::nal::{split_nal_units, AvcNalType};
use crate::{FormatResult, NAL_LENGTH_SIZE};

/// Parsed or built AVC decoder configuration record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvcDecoderConfigurationRecord {
    pub profile_indication: u8,
    pub profile_compatibility: u8,
    pub level_indication: u8,
    pub length_size_minus_one: u8,
    pub sps: Vec<Bytes>,
    pub pps: Vec<Bytes>,
}

impl AvcDecoderConfigurationRecord {
    /// Build a record from encoder parameter sets.
    ///
    /// Each entry may be a single raw NAL unit or a framed buffer holding
    /// several; SPS and PPS units are picked out by type.
    pub fn from_parameter_sets(parameter_sets: &[Bytes]) -> FormatResult<Self> {
        let mut sps = Vec::new();
        let mut pps = Vec::new();

        for unit in parameter_sets.iter().flat_map(split_nal_units) {
            match AvcNalType::from(unit[0]) {
                AvcNalType::Sps => sps.push(unit),
                AvcNalType::Pps => pps.push(unit),
                other => debug!(?other, "Ignoring non parameter set NAL unit"),
            }
        }

        let first = sps
            .first()
            .ok_or_else(|| FormatError::MalformedParameterSet("AVC requires an SPS".into()))?;
        if pps.is_empty() {
            return Err(FormatError::MalformedParameterSet("AVC requires a PPS".into()));
        }
        if first.len() < 4 {
            return Err(FormatError::MalformedParameterSet(format!(
                "SPS too short: {} bytes",
                first.len()
            )));
        }

        Ok(Self {
            profile_indication: first[1],
            profile_compatibility: first[2],
            level_indication: first[3],
            length_size_minus_one: (NAL_LENGTH_SIZE - 1) as u8,
            sps,
            pps,
        })
    }

    /// Serialize the record.
    pub fn to_bytes(&self) -> FormatResult<Bytes> {
        if self.sps.len() > 0x1F {
            return Err(FormatError::MalformedParameterSet(format!(
                "{} SPS units do not fit a 5-bit count",
                self.sps.len()
            )));
        }
        if self.pps.len() > 0xFF {
            return Err(FormatError::MalformedParameterSet(format!(
                "{} PPS units do not fit an 8-bit count",
                self.pps.len()
            )));
        }

        let body: usize = self.sps.iter().chain(&self.pps).map(|u| u.len() + 2).sum();
        let mut buf = BytesMut::with_capacity(7 + body);

        buf.put_u8(0x01);
        buf.put_u8(self.profile_indication);
        buf.put_u8(self.profile_compatibility);
        buf.put_u8(self.level_indication);
        buf.put_u8(0xFC | (self.length_size_minus_one & 0x03));

        buf.put_u8(0xE0 | self.sps.len() as u8);
        for sps in &self.sps {
            put_length_prefixed(&mut buf, sps)?;
        }

        buf.put_u8(self.pps.len() as u8);
        for pps in &self.pps {
            put_length_prefixed(&mut buf, pps)?;
        }

        debug!(
            sps_count = self.sps.len(),
            pps_count = self.pps.len(),
            total_len = buf.len(),
            "Built AVC decoder configuration record"
        );

        Ok(buf.freeze())
    }

    /// Parse a serialized record.
    pub fn parse(data: &[u8]) -> FormatResult<Self> {
        let mut buf = data;
        if buf.remaining() < 6 {
            return Err(FormatError::Truncated("AVC record header".into()));
        }

        let version = buf.get_u8();
        if version != 1 {
            return Err(FormatError::MalformedParameterSet(format!(
                "unknown AVC record version {version}"
            )));
        }
        let profile_indication = buf.get_u8();
        let profile_compatibility = buf.get_u8();
        let level_indication = buf.get_u8();
        let length_size_minus_one = buf.get_u8() & 0x03;

        let sps_count = (buf.get_u8() & 0x1F) as usize;
        let sps = read_units(&mut buf, sps_count)?;

        if !buf.has_remaining() {
            return Err(FormatError::Truncated("AVC record PPS count".into()));
        }
        let pps_count = buf.get_u8() as usize;
        let pps = read_units(&mut buf, pps_count)?;

        Ok(Self {
            profile_indication,
            profile_compatibility,
            level_indication,
            length_size_minus_one,
            sps,
            pps,
        })
    }

    /// Picture dimensions from the first SPS, if it parses.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        let sps = self.sps.first()?;
        parse_avc_sps(sps).ok().map(|info| (info.width, info.height))
    }
}

pub(crate) fn put_length_prefixed(buf: &mut BytesMut, unit: &[u8]) -> FormatResult<()> {
    let len = u16::try_from(unit.len()).map_err(|_| {
        FormatError::MalformedParameterSet(format!(
            "parameter set of {} bytes overflows a 16-bit length",
            unit.len()
        ))
    })?;
    if len == 0 {
        return Err(FormatError::MalformedParameterSet("empty parameter set".into()));
    }
    buf.put_u16(len);
    buf.put_slice(unit);
    Ok(())
}

pub(crate) fn read_units(buf: &mut &[u8], count: usize) -> FormatResult<Vec<Bytes>> {
    let mut units = Vec::with_capacity(count);
    for _ in 0..count {
        if buf.remaining() < 2 {
            return Err(FormatError::Truncated("parameter set length".into()));
        }
        let len = buf.get_u16() as usize;
        if buf.remaining() < len {
            return Err(FormatError::Truncated(format!(
                "parameter set of {len} bytes, {} left",
                buf.remaining()
            )));
        }
        units.push(Bytes::copy_from_slice(&buf[..len]));
        buf.advance(len);
    }
    Ok(units)
}

/// Fields of an H.264 SPS needed for stream metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvcSpsInfo {
    pub profile_idc: u8,
    pub level_idc: u8,
    pub chroma_format_idc: u32,
    pub width: u32,
    pub height: u32,
}

/// Parse an H.264 SPS NAL unit (header byte included).
pub fn parse_avc_sps(sps: &[u8]) -> FormatResult<AvcSpsInfo> {
    if sps.len() < 4 {
        return Err(FormatError::Truncated("SPS".into()));
    }
    let rbsp = remove_emulation_prevention(&sps[1..]);
    let mut r = BitReader::new(&rbsp);

    let profile_idc = r.read_bits(8)? as u8;
    r.skip_bits(8)?;
    let level_idc = r.read_bits(8)? as u8;
    r.read_golomb()?; // seq_parameter_set_id

    let mut chroma_format_idc = 1;
    let mut separate_colour_plane = false;
    if matches!(
        profile_idc,
        100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
    ) {
        chroma_format_idc = r.read_golomb()?;
        if chroma_format_idc == 3 {
            separate_colour_plane = r.read_bit()?;
        }
        r.read_golomb()?; // bit_depth_luma_minus8
        r.read_golomb()?; // bit_depth_chroma_minus8
        r.skip_bits(1)?; // qpprime_y_zero_transform_bypass_flag
        if r.read_bit()? {
            let lists = if chroma_format_idc == 3 { 12 } else { 8 };
            for i in 0..lists {
                if r.read_bit()? {
                    skip_scaling_list(&mut r, if i < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    r.read_golomb()?; // log2_max_frame_num_minus4
    match r.read_golomb()? {
        0 => {
            r.read_golomb()?; // log2_max_pic_order_cnt_lsb_minus4
        }
        1 => {
            r.skip_bits(1)?;
            r.read_signed_golomb()?;
            r.read_signed_golomb()?;
            let cycle = r.read_golomb()?;
            for _ in 0..cycle {
                r.read_signed_golomb()?;
            }
        }
        _ => {}
    }
    r.read_golomb()?; // max_num_ref_frames
    r.skip_bits(1)?; // gaps_in_frame_num_value_allowed_flag

    let width_mbs = r.read_golomb()? + 1;
    let height_map_units = r.read_golomb()? + 1;
    let frame_mbs_only = r.read_bit()?;
    if !frame_mbs_only {
        r.skip_bits(1)?; // mb_adaptive_frame_field_flag
    }
    r.skip_bits(1)?; // direct_8x8_inference_flag

    let (mut crop_left, mut crop_right, mut crop_top, mut crop_bottom) = (0, 0, 0, 0);
    if r.read_bit()? {
        crop_left = r.read_golomb()?;
        crop_right = r.read_golomb()?;
        crop_top = r.read_golomb()?;
        crop_bottom = r.read_golomb()?;
    }

    let frame_height_factor = if frame_mbs_only { 1 } else { 2 };
    let (crop_unit_x, crop_unit_y) = if chroma_format_idc == 0 || separate_colour_plane {
        (1, frame_height_factor)
    } else {
        let sub_width = if chroma_format_idc == 3 { 1 } else { 2 };
        let sub_height = if chroma_format_idc == 1 { 2 } else { 1 };
        (sub_width, sub_height * frame_height_factor)
    };

    let width = (width_mbs * 16).saturating_sub((crop_left + crop_right) * crop_unit_x);
    let height = (height_map_units * 16 * frame_height_factor)
        .saturating_sub((crop_top + crop_bottom) * crop_unit_y);

    Ok(AvcSpsInfo {
        profile_idc,
        level_idc,
        chroma_format_idc,
        width,
        height,
    })
}

fn skip_scaling_list(r: &mut BitReader<'_>, size: usize) -> FormatResult<()> {
    let mut last_scale = 8i32;
    let mut next_scale = 8i32;
    for _ in 0..size {
        if next_scale != 0 {
            let delta = r.read_signed_golomb()?;
            next_scale = (last_scale + delta + 256) % 256;
        }
        if next_scale != 0 {
            last_scale = next_scale;
        }
    }
    Ok(())
}
