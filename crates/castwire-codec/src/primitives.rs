//! Fixed-width integer encoding, MD5 digests and hex/base64 rendering.
//!
//! Every function here is total. Wire writers elsewhere in the workspace use
//! `BufMut` directly; these helpers exist for the places where a fixed array
//! is handier, such as RTMP message headers and auth digests.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use md5::{Digest, Md5};

/// Encode a 16-bit value big-endian.
pub fn u16_to_be(value: u16) -> [u8; 2] {
    value.to_be_bytes()
}

/// Encode a 16-bit value little-endian.
pub fn u16_to_le(value: u16) -> [u8; 2] {
    value.to_le_bytes()
}

/// Encode the low 24 bits of `value` big-endian.
pub fn u24_to_be(value: u32) -> [u8; 3] {
    [(value >> 16) as u8, (value >> 8) as u8, value as u8]
}

/// Encode the low 24 bits of `value` little-endian.
pub fn u24_to_le(value: u32) -> [u8; 3] {
    [value as u8, (value >> 8) as u8, (value >> 16) as u8]
}

/// Encode a 32-bit value big-endian.
pub fn u32_to_be(value: u32) -> [u8; 4] {
    value.to_be_bytes()
}

/// Encode a 32-bit value little-endian.
pub fn u32_to_le(value: u32) -> [u8; 4] {
    value.to_le_bytes()
}

/// Decode a big-endian 16-bit value.
pub fn u16_from_be(bytes: [u8; 2]) -> u16 {
    u16::from_be_bytes(bytes)
}

/// Decode a little-endian 16-bit value.
pub fn u16_from_le(bytes: [u8; 2]) -> u16 {
    u16::from_le_bytes(bytes)
}

/// Decode a big-endian 24-bit value.
pub fn u24_from_be(bytes: [u8; 3]) -> u32 {
    (bytes[0] as u32) << 16 | (bytes[1] as u32) << 8 | bytes[2] as u32
}

/// Decode a little-endian 24-bit value.
pub fn u24_from_le(bytes: [u8; 3]) -> u32 {
    (bytes[2] as u32) << 16 | (bytes[1] as u32) << 8 | bytes[0] as u32
}

/// Decode a big-endian 32-bit value.
pub fn u32_from_be(bytes: [u8; 4]) -> u32 {
    u32::from_be_bytes(bytes)
}

/// Decode a little-endian 32-bit value.
pub fn u32_from_le(bytes: [u8; 4]) -> u32 {
    u32::from_le_bytes(bytes)
}

/// Render bytes as lowercase hex, two digits per byte.
pub fn to_hex(bytes: &[u8]) -> String {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(DIGITS[(byte >> 4) as usize] as char);
        out.push(DIGITS[(byte & 0x0F) as usize] as char);
    }
    out
}

/// Raw MD5 digest.
pub fn md5(input: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(input);
    let mut digest = [0u8; 16];
    digest.copy_from_slice(&hasher.finalize());
    digest
}

/// MD5 digest rendered as lowercase hex.
pub fn md5_hex(input: &[u8]) -> String {
    to_hex(&md5(input))
}

/// MD5 digest rendered as standard padded base64.
pub fn md5_base64(input: &[u8]) -> String {
    STANDARD.encode(md5(input))
}
