//! Bit-level reading for parameter set parsing.

use crate::error::FormatError;
use crate::FormatResult;

/// Reads bits MSB-first from a byte slice.
///
/// Supports the Exp-Golomb codes (`ue(v)`, `se(v)`) used by H.264/H.265
/// parameter sets, plus the LEB128 and `uvlc` codes of AV1 headers.
pub struct BitReader<'a> {
    data: &'a [u8],
    byte_offset: usize,
    bit_offset: u8,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            byte_offset: 0,
            bit_offset: 0,
        }
    }

    /// Read one bit.
    pub fn read_bit(&mut self) -> FormatResult<bool> {
        let byte = self
            .data
            .get(self.byte_offset)
            .ok_or_else(|| FormatError::Truncated("bit reader reached end of data".into()))?;

        let bit = (byte >> (7 - self.bit_offset)) & 1;
        self.bit_offset += 1;
        if self.bit_offset == 8 {
            self.bit_offset = 0;
            self.byte_offset += 1;
        }

        Ok(bit == 1)
    }

    /// Read up to 32 bits as a big-endian number.
    pub fn read_bits(&mut self, n: u32) -> FormatResult<u32> {
        if n > 32 {
            return Err(FormatError::Truncated(format!("cannot read {n} bits at once")));
        }

        let mut value = 0u32;
        for _ in 0..n {
            value = (value << 1) | self.read_bit()? as u32;
        }
        Ok(value)
    }

    /// Read up to 64 bits as a big-endian number.
    pub fn read_bits_u64(&mut self, n: u32) -> FormatResult<u64> {
        if n > 64 {
            return Err(FormatError::Truncated(format!("cannot read {n} bits at once")));
        }

        let mut value = 0u64;
        for _ in 0..n {
            value = (value << 1) | self.read_bit()? as u64;
        }
        Ok(value)
    }

    /// Read an unsigned Exp-Golomb code, `ue(v)`.
    pub fn read_golomb(&mut self) -> FormatResult<u32> {
        let mut leading_zeros = 0;
        while !self.read_bit()? {
            leading_zeros += 1;
            if leading_zeros > 31 {
                return Err(FormatError::MalformedParameterSet(
                    "Exp-Golomb code longer than 32 bits".into(),
                ));
            }
        }

        if leading_zeros == 0 {
            return Ok(0);
        }

        let info = self.read_bits(leading_zeros)?;
        Ok((1u32 << leading_zeros) - 1 + info)
    }

    /// Read a signed Exp-Golomb code, `se(v)`.
    pub fn read_signed_golomb(&mut self) -> FormatResult<i32> {
        let k = self.read_golomb()?;
        let magnitude = k.div_ceil(2) as i32;
        Ok(if k & 1 == 1 { magnitude } else { -magnitude })
    }

    /// Read an AV1 `uvlc()` value.
    pub fn read_uvlc(&mut self) -> FormatResult<u32> {
        let mut leading_zeros = 0u32;
        while !self.read_bit()? {
            leading_zeros += 1;
        }
        if leading_zeros >= 32 {
            return Ok(u32::MAX);
        }
        let value = self.read_bits(leading_zeros)?;
        Ok(value + ((1u64 << leading_zeros) - 1) as u32)
    }

    pub fn skip_bits(&mut self, n: u32) -> FormatResult<()> {
        for _ in 0..n {
            self.read_bit()?;
        }
        Ok(())
    }

    /// Skip to the next byte boundary.
    pub fn align_byte(&mut self) {
        if self.bit_offset != 0 {
            self.bit_offset = 0;
            self.byte_offset += 1;
        }
    }

    /// Bits left to read.
    pub fn available_bits(&self) -> usize {
        (self.data.len().saturating_sub(self.byte_offset)) * 8 - self.bit_offset as usize
    }
}

/// Remove `0x000003` emulation prevention bytes from a NAL unit payload.
pub fn remove_emulation_prevention(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut zeros = 0usize;

    for &byte in data {
        if zeros >= 2 && byte == 0x03 {
            zeros = 0;
            continue;
        }
        zeros = if byte == 0 { zeros + 1 } else { 0 };
        out.push(byte);
    }

    out
}

/// Read an AV1 `leb128()` value from the start of `data`.
///
/// Returns the value and the number of bytes consumed.
pub(crate) fn read_leb128(data: &[u8]) -> FormatResult<(u64, usize)> {
    let mut value = 0u64;
    for (i, byte) in data.iter().take(8).enumerate() {
        value |= ((byte & 0x7F) as u64) << (i * 7);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(FormatError::Truncated("unterminated leb128".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn test_read_bits() {
        let data = [0b1011_0011];
        let mut reader = BitReader::new(&data);
        assert!(reader.read_bit().unwrap());
        assert_eq!(reader.read_bits(3).unwrap(), 0b011);
        assert_eq!(reader.available_bits(), 4);
        assert_eq!(reader.read_bits(4).unwrap(), 0b0011);
        assert!(reader.read_bit().is_err());
    }

    #[test]
    fn test_read_golomb() {
        // 1 | 010 | 011 | 00100 | 00101
        let data = [0b1010_0110, 0b0100_0010, 0b1000_0000];
        let mut reader = BitReader::new(&data);
        assert_eq!(reader.read_golomb().unwrap(), 0);
        assert_eq!(reader.read_golomb().unwrap(), 1);
        assert_eq!(reader.read_golomb().unwrap(), 2);
        assert_eq!(reader.read_golomb().unwrap(), 3);
        assert_eq!(reader.read_golomb().unwrap(), 4);
    }

    #[test]
    fn test_read_signed_golomb() {
        // ue 1 -> +1, ue 2 -> -1, ue 3 -> +2, ue 4 -> -2
        let data = [0b0100_1100, 0b1000_0101, 0b0000_0000];
        let mut reader = BitReader::new(&data);
        assert_eq!(reader.read_signed_golomb().unwrap(), 1);
        assert_eq!(reader.read_signed_golomb().unwrap(), -1);
        assert_eq!(reader.read_signed_golomb().unwrap(), 2);
        assert_eq!(reader.read_signed_golomb().unwrap(), -2);
    }

    #[test]
    fn test_align_byte() {
        let data = [0xFF, 0x0F];
        let mut reader = BitReader::new(&data);
        reader.skip_bits(3).unwrap();
        reader.align_byte();
        assert_eq!(reader.read_bits(8).unwrap(), 0x0F);
    }

    #[test]
    fn test_remove_emulation_prevention() {
        let data = [0x00, 0x00, 0x03, 0x01, 0x00, 0x00, 0x03, 0x00, 0x03];
        assert_eq!(
            remove_emulation_prevention(&data),
            vec![0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x03]
        );
    }

    #[test]
    fn test_leb128() {
        assert_eq!(read_leb128(&[0x0A]).unwrap(), (10, 1));
        assert_eq!(read_leb128(&[0xE5, 0x8E, 0x26]).unwrap(), (624_485, 3));
        assert!(read_leb128(&[0x80]).is_err());
    }

    #[quickcheck]
    fn prop_bytes_read_back(data: Vec<u8>) -> bool {
        let mut reader = BitReader::new(&data);
        data.iter().all(|b| reader.read_bits(8).ok() == Some(*b as u32))
    }
}
