//! Primitive wire types shared by all packet kinds.
//!
//! Reads take `&mut impl Buf` with cursor semantics and fail with a [`CodecError`] instead of
//!  panicking on truncated input. Writes go through `impl BufMut`; multi-byte integers are
//!  big-endian on the wire (`put_u16` & friends), the packed integers below are the one
//!  exception. The `*_len` helpers let callers pre-size their buffers.

use crate::error::CodecError;
use bytes::{Buf, BufMut, Bytes};
use std::net::Ipv4Addr;

/// A single tagged record, any number of which are multiplexed into one NORMAL, RELIABLE or
///  DISCONNECT packet: `[length u16][tag u8][payload]`. The length covers the payload only.
///
/// Payloads are zero-copy slices of the datagram they arrived in; copy them if they are kept
///  past the dispatch callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HazelMessage {
    pub tag: u8,
    pub payload: Bytes,
}

impl HazelMessage {
    pub fn new(tag: u8, payload: impl Into<Bytes>) -> HazelMessage {
        HazelMessage {
            tag,
            payload: payload.into(),
        }
    }

    pub fn serialized_len(&self) -> usize {
        2 + 1 + self.payload.len()
    }
}

fn ensure(buf: &impl Buf, len: usize) -> Result<(), CodecError> {
    if buf.remaining() < len {
        return Err(CodecError::UnexpectedEnd);
    }
    Ok(())
}

pub fn read_u8(buf: &mut impl Buf) -> Result<u8, CodecError> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

pub fn read_i8(buf: &mut impl Buf) -> Result<i8, CodecError> {
    ensure(buf, 1)?;
    Ok(buf.get_i8())
}

pub fn read_u16(buf: &mut impl Buf) -> Result<u16, CodecError> {
    ensure(buf, 2)?;
    Ok(buf.get_u16())
}

pub fn read_i16(buf: &mut impl Buf) -> Result<i16, CodecError> {
    ensure(buf, 2)?;
    Ok(buf.get_i16())
}

pub fn read_u32(buf: &mut impl Buf) -> Result<u32, CodecError> {
    ensure(buf, 4)?;
    Ok(buf.get_u32())
}

pub fn read_i32(buf: &mut impl Buf) -> Result<i32, CodecError> {
    ensure(buf, 4)?;
    Ok(buf.get_i32())
}

pub fn read_bool(buf: &mut impl Buf) -> Result<bool, CodecError> {
    Ok(read_u8(buf)? != 0)
}

pub fn write_bool(value: bool, buf: &mut impl BufMut) {
    buf.put_u8(value as u8);
}

pub fn read_ipv4(buf: &mut impl Buf) -> Result<Ipv4Addr, CodecError> {
    ensure(buf, 4)?;
    let mut octets = [0u8; 4];
    buf.copy_to_slice(&mut octets);
    Ok(Ipv4Addr::from(octets))
}

pub fn write_ipv4(addr: Ipv4Addr, buf: &mut impl BufMut) {
    buf.put_slice(&addr.octets());
}

/// Reads a little-endian base-128 integer: 7 payload bits per byte, MSB set iff more bytes
///  follow. At most 5 bytes; a value whose continuation bit survives the fifth byte is
///  rejected, as is a buffer that ends mid-value.
pub fn read_packed_u32(buf: &mut impl Buf) -> Result<u32, CodecError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        if shift > 28 {
            return Err(CodecError::PackedIntTooLong);
        }
        if !buf.has_remaining() {
            return Err(CodecError::UnexpectedEnd);
        }
        let byte = buf.get_u8();
        value |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(value as u32);
        }
        shift += 7;
    }
}

pub fn write_packed_u32(mut value: u32, buf: &mut impl BufMut) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            buf.put_u8(byte);
            return;
        }
        buf.put_u8(byte | 0x80);
    }
}

/// Encoded size of `value` as a packed integer, without encoding it.
pub fn packed_u32_len(value: u32) -> usize {
    let mut len = 1;
    let mut rest = value >> 7;
    while rest != 0 {
        len += 1;
        rest >>= 7;
    }
    len
}

/// Signed packed integers interleave the sign: `n >= 0` encodes as `2n`, `n < 0` as `-2n - 1`.
pub fn read_packed_i32(buf: &mut impl Buf) -> Result<i32, CodecError> {
    let zigzag = read_packed_u32(buf)?;
    Ok(((zigzag >> 1) as i32) ^ -((zigzag & 1) as i32))
}

pub fn write_packed_i32(value: i32, buf: &mut impl BufMut) {
    write_packed_u32(((value << 1) ^ (value >> 31)) as u32, buf);
}

pub fn packed_i32_len(value: i32) -> usize {
    packed_u32_len(((value << 1) ^ (value >> 31)) as u32)
}

/// Strings are UTF-8 bytes prefixed with their byte length as a packed u32.
pub fn read_string(buf: &mut impl Buf) -> Result<String, CodecError> {
    let len = read_packed_u32(buf)? as usize;
    ensure(buf, len)?;
    let raw = buf.copy_to_bytes(len);
    String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidUtf8)
}

pub fn write_string(value: &str, buf: &mut impl BufMut) {
    write_packed_u32(
        value
            .len()
            .try_into()
            .expect("string length exceeds the u32 range"),
        buf,
    );
    buf.put_slice(value.as_bytes());
}

pub fn string_len(value: &str) -> usize {
    packed_u32_len(value.len() as u32) + value.len()
}

pub fn read_hazel_message(buf: &mut impl Buf) -> Result<HazelMessage, CodecError> {
    let len = read_u16(buf)? as usize;
    let tag = read_u8(buf)?;
    ensure(buf, len)?;
    let payload = buf.copy_to_bytes(len);
    Ok(HazelMessage { tag, payload })
}

pub fn write_hazel_message(message: &HazelMessage, buf: &mut impl BufMut) {
    let len: u16 = message
        .payload
        .len()
        .try_into()
        .expect("record payload exceeds the u16 length prefix");
    buf.put_u16(len);
    buf.put_u8(message.tag);
    buf.put_slice(&message.payload);
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    #[rstest]
    #[case(0, vec![0x00])]
    #[case(1, vec![0x01])]
    #[case(0x7F, vec![0x7F])]
    #[case(0x80, vec![0x80, 0x01])]
    #[case(0x3FFF, vec![0xFF, 0x7F])]
    #[case(0x4000, vec![0x80, 0x80, 0x01])]
    #[case(0x1F_FFFF, vec![0xFF, 0xFF, 0x7F])]
    #[case(0xFFF_FFFF, vec![0xFF, 0xFF, 0xFF, 0x7F])]
    #[case(u32::MAX, vec![0xFF, 0xFF, 0xFF, 0xFF, 0x0F])]
    fn test_packed_u32(#[case] value: u32, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        write_packed_u32(value, &mut buf);
        assert_eq!(buf.as_ref(), expected.as_slice());
        assert_eq!(packed_u32_len(value), expected.len());

        let mut read_buf: &[u8] = &buf;
        assert_eq!(read_packed_u32(&mut read_buf), Ok(value));
        assert!(read_buf.is_empty());
    }

    #[rstest]
    #[case(0, vec![0x00])]
    #[case(-1, vec![0x01])]
    #[case(1, vec![0x02])]
    #[case(-2, vec![0x03])]
    #[case(63, vec![0x7E])]
    #[case(-64, vec![0x7F])]
    #[case(64, vec![0x80, 0x01])]
    #[case(i32::MAX, vec![0xFE, 0xFF, 0xFF, 0xFF, 0x0F])]
    #[case(i32::MIN, vec![0xFF, 0xFF, 0xFF, 0xFF, 0x0F])]
    fn test_packed_i32(#[case] value: i32, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        write_packed_i32(value, &mut buf);
        assert_eq!(buf.as_ref(), expected.as_slice());
        assert_eq!(packed_i32_len(value), expected.len());

        let mut read_buf: &[u8] = &buf;
        assert_eq!(read_packed_i32(&mut read_buf), Ok(value));
        assert!(read_buf.is_empty());
    }

    #[test]
    fn test_packed_u32_never_terminating_is_a_range_error() {
        let mut buf: &[u8] = &[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF];
        assert_eq!(read_packed_u32(&mut buf), Err(CodecError::PackedIntTooLong));
    }

    #[rstest]
    #[case(vec![])]
    #[case(vec![0x80])]
    #[case(vec![0xFF, 0xFF])]
    fn test_packed_u32_truncated(#[case] bytes: Vec<u8>) {
        let mut buf: &[u8] = &bytes;
        assert_eq!(read_packed_u32(&mut buf), Err(CodecError::UnexpectedEnd));
    }

    #[test]
    fn test_bool() {
        let mut buf = BytesMut::new();
        write_bool(true, &mut buf);
        write_bool(false, &mut buf);
        assert_eq!(buf.as_ref(), &[1, 0]);

        let mut read_buf: &[u8] = &buf;
        assert_eq!(read_bool(&mut read_buf), Ok(true));
        assert_eq!(read_bool(&mut read_buf), Ok(false));
        assert_eq!(read_bool(&mut read_buf), Err(CodecError::UnexpectedEnd));
    }

    #[test]
    fn test_ipv4() {
        let mut buf = BytesMut::new();
        write_ipv4(Ipv4Addr::new(192, 168, 1, 2), &mut buf);
        assert_eq!(buf.as_ref(), &[0xC0, 0xA8, 0x01, 0x02]);

        let mut read_buf: &[u8] = &buf;
        assert_eq!(read_ipv4(&mut read_buf), Ok(Ipv4Addr::new(192, 168, 1, 2)));
    }

    #[rstest]
    #[case("")]
    #[case("bye")]
    #[case("päck")]
    fn test_string_round_trip(#[case] value: &str) {
        let mut buf = BytesMut::new();
        write_string(value, &mut buf);
        assert_eq!(buf.len(), string_len(value));

        let mut read_buf: &[u8] = &buf;
        assert_eq!(read_string(&mut read_buf).as_deref(), Ok(value));
        assert!(read_buf.is_empty());
    }

    #[test]
    fn test_string_invalid_utf8() {
        let mut buf: &[u8] = &[0x02, 0xC3, 0x28];
        assert_eq!(read_string(&mut buf), Err(CodecError::InvalidUtf8));
    }

    #[rstest]
    #[case(HazelMessage::new(7, &b"ab"[..]), vec![0x00, 0x02, 0x07, 0x61, 0x62])]
    #[case(HazelMessage::new(9, &b""[..]), vec![0x00, 0x00, 0x09])]
    fn test_hazel_message(#[case] message: HazelMessage, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        write_hazel_message(&message, &mut buf);
        assert_eq!(buf.as_ref(), expected.as_slice());
        assert_eq!(message.serialized_len(), expected.len());

        let mut read_buf: &[u8] = &buf;
        assert_eq!(read_hazel_message(&mut read_buf), Ok(message));
        assert!(read_buf.is_empty());
    }

    #[test]
    fn test_hazel_message_truncated_payload() {
        // header declares 4 payload bytes, only 2 present
        let mut buf: &[u8] = &[0x00, 0x04, 0x07, 0x61, 0x62];
        assert_eq!(
            read_hazel_message(&mut buf),
            Err(CodecError::UnexpectedEnd)
        );
    }

    #[test]
    fn test_fixed_width_reads() {
        let mut buf: &[u8] = &[0x01, 0xFF, 0x00, 0x02, 0xFF, 0xFE, 0x00, 0x00, 0x00, 0x03];
        assert_eq!(read_u8(&mut buf), Ok(1));
        assert_eq!(read_i8(&mut buf), Ok(-1));
        assert_eq!(read_u16(&mut buf), Ok(2));
        assert_eq!(read_i16(&mut buf), Ok(-2));
        assert_eq!(read_u32(&mut buf), Ok(3));
        assert_eq!(read_u32(&mut buf), Err(CodecError::UnexpectedEnd));
    }
}
