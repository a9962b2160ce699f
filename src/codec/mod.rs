//! MQTT Packet Codec
//!
//! Encoding and decoding of the client-side MQTT v3.1.1 and v5.0 packets.
//! Both directions are implemented so the same codec can stand in for a
//! broker in tests.

mod decode;
mod encode;


pub use decode::Decoder;
pub use encode::Encoder;

use bytes::{BufMut, BytesMut};

use crate::protocol::{DecodeError, EncodeError};

/// Largest value a variable byte integer can carry
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Decode a variable byte integer, returning the value and its width
pub fn read_variable_int(buf: &[u8]) -> Result<(u32, usize), DecodeError> {
    let mut value = 0u32;
    for (i, &byte) in buf.iter().take(4).enumerate() {
        value |= u32::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    if buf.len() < 4 {
        Err(DecodeError::InsufficientData)
    } else {
        // A fifth continuation byte is never valid
        Err(DecodeError::InvalidRemainingLength)
    }
}

pub fn write_variable_int(buf: &mut BytesMut, value: u32) -> Result<(), EncodeError> {
    if value as usize > MAX_REMAINING_LENGTH {
        return Err(EncodeError::PacketTooLarge);
    }
    let mut rest = value;
    loop {
        let digit = (rest & 0x7F) as u8;
        rest >>= 7;
        if rest == 0 {
            buf.put_u8(digit);
            return Ok(());
        }
        buf.put_u8(digit | 0x80);
    }
}

/// Width of `value` as a variable byte integer
pub fn variable_int_len(value: u32) -> usize {
    match value {
        0..=0x7F => 1,
        0x80..=0x3FFF => 2,
        0x4000..=0x1F_FFFF => 3,
        _ => 4,
    }
}

pub fn read_u16(buf: &[u8]) -> Result<u16, DecodeError> {
    match buf {
        [a, b, ..] => Ok(u16::from_be_bytes([*a, *b])),
        _ => Err(DecodeError::InsufficientData),
    }
}

pub fn read_u32(buf: &[u8]) -> Result<u32, DecodeError> {
    match buf {
        [a, b, c, d, ..] => Ok(u32::from_be_bytes([*a, *b, *c, *d])),
        _ => Err(DecodeError::InsufficientData),
    }
}

/// Length-prefixed byte field, returning the data and the bytes consumed
pub fn read_binary(buf: &[u8]) -> Result<(&[u8], usize), DecodeError> {
    let len = read_u16(buf)? as usize;
    let data = buf
        .get(2..2 + len)
        .ok_or(DecodeError::InsufficientData)?;
    Ok((data, 2 + len))
}

/// Length-prefixed UTF-8 string. NUL characters are not allowed.
pub fn read_string(buf: &[u8]) -> Result<(&str, usize), DecodeError> {
    let (data, consumed) = read_binary(buf)?;
    let s = std::str::from_utf8(data).map_err(|_| DecodeError::InvalidUtf8)?;
    if s.contains('\0') {
        return Err(DecodeError::MalformedPacket("string contains NUL"));
    }
    Ok((s, consumed))
}

pub fn write_binary(buf: &mut BytesMut, data: &[u8]) -> Result<(), EncodeError> {
    let len = u16::try_from(data.len()).map_err(|_| EncodeError::StringTooLong)?;
    buf.put_u16(len);
    buf.put_slice(data);
    Ok(())
}

pub fn write_string(buf: &mut BytesMut, s: &str) -> Result<(), EncodeError> {
    write_binary(buf, s.as_bytes())
}
