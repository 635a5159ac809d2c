//! NAL unit splitting and framing conversion.
//!
//! Encoders hand out H.264/H.265 data in one of three shapes:
//! - **Annex B**: start codes (0x000001 or 0x00000001) between NAL units.
//! - **Length-prefixed** (AVCC/HVCC): a 4-byte big-endian size before each unit.
//! - **Raw**: a single NAL unit with no framing at all.
//!
//! FLV wants length-prefixed units and MPEG-TS wants Annex B, so the muxers
//! normalize through [`split_nal_units`].

use bytes::{BufMut, Bytes, BytesMut};

/// H.264 NAL unit types the transport cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AvcNalType {
    /// Non-IDR slice (P/B frame).
    NonIdrSlice = 1,
    /// IDR slice (keyframe).
    IdrSlice = 5,
    /// Supplemental Enhancement Information.
    Sei = 6,
    /// Sequence Parameter Set.
    Sps = 7,
    /// Picture Parameter Set.
    Pps = 8,
    /// Access Unit Delimiter.
    Aud = 9,
    /// Other/unknown NAL type.
    Other = 0,
}

impl From<u8> for AvcNalType {
    fn from(header: u8) -> Self {
        match header & 0x1F {
            1 => Self::NonIdrSlice,
            5 => Self::IdrSlice,
            6 => Self::Sei,
            7 => Self::Sps,
            8 => Self::Pps,
            9 => Self::Aud,
            _ => Self::Other,
        }
    }
}

/// H.265 NAL unit types the transport cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HevcNalType {
    /// Video Parameter Set.
    Vps = 32,
    /// Sequence Parameter Set.
    Sps = 33,
    /// Picture Parameter Set.
    Pps = 34,
    /// Access Unit Delimiter.
    Aud = 35,
    /// IRAP picture (BLA, IDR or CRA).
    Irap = 16,
    /// Anything else.
    Other = 0,
}

impl From<u8> for HevcNalType {
    fn from(header: u8) -> Self {
        match (header >> 1) & 0x3F {
            32 => Self::Vps,
            33 => Self::Sps,
            34 => Self::Pps,
            35 => Self::Aud,
            16..=21 => Self::Irap,
            _ => Self::Other,
        }
    }
}

/// Raw `nal_unit_type` of an H.265 NAL header byte.
pub fn hevc_nal_type_value(header: u8) -> u8 {
    (header >> 1) & 0x3F
}

/// Split a buffer into NAL units, stripping whatever framing it carries.
///
/// Length prefixes win when they tile the buffer exactly: a 256 to 511 byte
/// unit has a prefix that also reads as a 3-byte start code.
///
/// The returned slices share the input's storage.
pub fn split_nal_units(data: &Bytes) -> Vec<Bytes> {
    if let Some(units) = split_length_prefixed(data) {
        return units;
    }
    if starts_with_start_code(data) {
        return split_annex_b(data);
    }
    if data.is_empty() {
        Vec::new()
    } else {
        vec![data.clone()]
    }
}

fn starts_with_start_code(data: &[u8]) -> bool {
    data.starts_with(&[0, 0, 1]) || data.starts_with(&[0, 0, 0, 1])
}

/// Split an Annex B byte stream at its start codes.
pub fn split_annex_b(data: &Bytes) -> Vec<Bytes> {
    let mut units = Vec::new();
    let len = data.len();
    let mut i = 0;
    let mut nal_start: Option<usize> = None;

    while i + 2 < len {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            if let Some(start) = nal_start {
                push_trimmed(&mut units, data, start, i);
            }
            i += 3;
            nal_start = Some(i);
        } else {
            i += 1;
        }
    }

    if let Some(start) = nal_start {
        push_trimmed(&mut units, data, start, len);
    }

    units
}

/// Push `data[start..end]` minus trailing zero bytes (the leading zero of a
/// 4-byte start code belongs to the next unit's prefix).
fn push_trimmed(units: &mut Vec<Bytes>, data: &Bytes, start: usize, mut end: usize) {
    while end > start && data[end - 1] == 0 {
        end -= 1;
    }
    if end > start {
        units.push(data.slice(start..end));
    }
}

/// Split a buffer of 4-byte length-prefixed units.
///
/// Returns `None` unless the prefixes tile the buffer exactly.
pub fn split_length_prefixed(data: &Bytes) -> Option<Vec<Bytes>> {
    let mut units = Vec::new();
    let mut offset = 0usize;

    while offset < data.len() {
        let header = data.get(offset..offset + 4)?;
        let size = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if size == 0 {
            return None;
        }
        let end = offset.checked_add(4)?.checked_add(size)?;
        if end > data.len() {
            return None;
        }
        units.push(data.slice(offset + 4..end));
        offset = end;
    }

    if units.is_empty() {
        None
    } else {
        Some(units)
    }
}

/// Write units with 4-byte big-endian length prefixes.
pub fn to_length_prefixed(units: &[Bytes]) -> Bytes {
    let total: usize = units.iter().map(|u| u.len() + 4).sum();
    let mut buf = BytesMut::with_capacity(total);
    for unit in units {
        buf.put_u32(unit.len() as u32);
        buf.put_slice(unit);
    }
    buf.freeze()
}

/// Write units with 4-byte start codes.
pub fn to_annex_b(units: &[Bytes]) -> Bytes {
    let total: usize = units.iter().map(|u| u.len() + 4).sum();
    let mut buf = BytesMut::with_capacity(total);
    for unit in units {
        buf.put_slice(&[0, 0, 0, 1]);
        buf.put_slice(unit);
    }
    buf.freeze()
}

/// Drop H.264 parameter sets and delimiters from a frame's units.
///
/// Those travel in the configuration record, not inside frames.
pub fn filter_avc_parameter_sets(units: Vec<Bytes>) -> Vec<Bytes> {
    units
        .into_iter()
        .filter(|unit| {
            !matches!(
                AvcNalType::from(unit[0]),
                AvcNalType::Sps | AvcNalType::Pps | AvcNalType::Aud
            )
        })
        .collect()
}

/// Drop H.265 parameter sets and delimiters from a frame's units.
pub fn filter_hevc_parameter_sets(units: Vec<Bytes>) -> Vec<Bytes> {
    units
        .into_iter()
        .filter(|unit| {
            !matches!(
                HevcNalType::from(unit[0]),
                HevcNalType::Vps | HevcNalType::Sps | HevcNalType::Pps | HevcNalType::Aud
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_split_annex_b_3byte_start_code() {
        let data = Bytes::from_static(&[0x00, 0x00, 0x01, 0x67, 0x42, 0x00, 0x1E]);
        let units = split_nal_units(&data);
        assert_eq!(units.len(), 1);
        assert_eq!(AvcNalType::from(units[0][0]), AvcNalType::Sps);
        assert_eq!(units[0].as_ref(), &[0x67, 0x42, 0x00, 0x1E]);
    }

    #[test]
    fn test_split_annex_b_mixed_start_codes() {
        let data = Bytes::from_static(&[
            0x00, 0x00, 0x00, 0x01, 0x67, 0x42, 0x00, 0x1E, // SPS
            0x00, 0x00, 0x01, 0x68, 0xCE, 0x3C, 0x80, // PPS
            0x00, 0x00, 0x00, 0x01, 0x65, 0x88, 0x84, // IDR
        ]);
        let units = split_nal_units(&data);
        assert_eq!(units.len(), 3);
        assert_eq!(units[0].as_ref(), &[0x67, 0x42, 0x00, 0x1E]);
        assert_eq!(units[1].as_ref(), &[0x68, 0xCE, 0x3C, 0x80]);
        assert_eq!(units[2].as_ref(), &[0x65, 0x88, 0x84]);
    }

    #[test]
    fn test_split_length_prefixed() {
        let data = Bytes::from_static(&[
            0x00, 0x00, 0x00, 0x02, 0x68, 0xCE, // PPS
            0x00, 0x00, 0x00, 0x03, 0x65, 0x88, 0x84, // IDR
        ]);
        let units = split_nal_units(&data);
        assert_eq!(units.len(), 2);
        assert_eq!(units[1].as_ref(), &[0x65, 0x88, 0x84]);
    }

    #[test]
    fn test_length_prefix_that_looks_like_start_code() {
        let mut nal = vec![0x65];
        nal.extend(std::iter::repeat(0xAB).take(299));
        let mut data = vec![0x00, 0x00, 0x01, 0x2C];
        data.extend_from_slice(&nal);

        let units = split_nal_units(&Bytes::from(data));
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].len(), 300);
        assert_eq!(units[0][0], 0x65);
        assert_eq!(units[0].as_ref(), nal.as_slice());
    }

    #[test]
    fn test_split_raw_unit() {
        let data = Bytes::from_static(&[0x68, 0xCE, 0x3C, 0x80]);
        let units = split_nal_units(&data);
        assert_eq!(units, vec![data]);
    }

    #[test]
    fn test_framing_conversions() {
        let units = vec![
            Bytes::from_static(&[0x67, 0x42]),
            Bytes::from_static(&[0x65, 0x88, 0x84]),
        ];
        let prefixed = to_length_prefixed(&units);
        assert_eq!(
            prefixed.as_ref(),
            &[0, 0, 0, 2, 0x67, 0x42, 0, 0, 0, 3, 0x65, 0x88, 0x84]
        );
        assert_eq!(split_nal_units(&to_annex_b(&units)), units);
    }

    #[test]
    fn test_hevc_nal_types() {
        assert_eq!(HevcNalType::from(0x40), HevcNalType::Vps);
        assert_eq!(HevcNalType::from(0x42), HevcNalType::Sps);
        assert_eq!(HevcNalType::from(0x44), HevcNalType::Pps);
        assert_eq!(HevcNalType::from(0x26), HevcNalType::Irap);
        assert_eq!(hevc_nal_type_value(0x26), 19);
    }

    #[test]
    fn test_filter_parameter_sets() {
        let units = vec![
            Bytes::from_static(&[0x09, 0xF0]),
            Bytes::from_static(&[0x67]),
            Bytes::from_static(&[0x68]),
            Bytes::from_static(&[0x65]),
        ];
        let filtered = filter_avc_parameter_sets(units);
        assert_eq!(filtered, vec![Bytes::from_static(&[0x65])]);

        let units = vec![Bytes::from_static(&[0x40, 0x01]), Bytes::from_static(&[0x26, 0x01])];
        assert_eq!(filter_hevc_parameter_sets(units).len(), 1);
    }
}
