//! Unsigned LEB128 varints
//!
//! Collection ids are prefixed onto keys as unsigned LEB128 when the
//! connection runs in collection-aware mode.

use bytes::{Buf, BufMut, BytesMut};

/// Append `value` to `buf` as an unsigned LEB128 varint.
pub fn write_uleb128(buf: &mut BytesMut, mut value: u32) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if value == 0 {
            break;
        }
    }
}

/// Read an unsigned LEB128 varint from the front of `buf`.
///
/// Returns `None` on truncated input or a varint wider than 32 bits.
pub fn read_uleb128(buf: &mut impl Buf) -> Option<u32> {
    let mut value: u32 = 0;
    let mut shift = 0;
    loop {
        if !buf.has_remaining() || shift > 28 {
            return None;
        }
        let byte = buf.get_u8();
        value |= u32::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some(value);
        }
        shift += 7;
    }
}

/// Encoded width in bytes of `value` as unsigned LEB128.
pub fn uleb128_len(mut value: u32) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: u32) -> u32 {
        let mut buf = BytesMut::new();
        write_uleb128(&mut buf, value);
        assert_eq!(buf.len(), uleb128_len(value));
        let mut frozen = buf.freeze();
        read_uleb128(&mut frozen).unwrap()
    }

    #[test]
    fn test_roundtrip_boundaries() {
        for value in [0, 1, 0x7f, 0x80, 0x3fff, 0x4000, 0xffff, u32::MAX] {
            assert_eq!(roundtrip(value), value);
        }
    }

    #[test]
    fn test_known_encodings() {
        let mut buf = BytesMut::new();
        write_uleb128(&mut buf, 0x1234);
        assert_eq!(&buf[..], &[0xb4, 0x24]);

        let mut buf = BytesMut::new();
        write_uleb128(&mut buf, 0x00);
        assert_eq!(&buf[..], &[0x00]);
    }

    #[test]
    fn test_truncated_input() {
        let mut buf = bytes::Bytes::from_static(&[0x80, 0x80]);
        assert!(read_uleb128(&mut buf).is_none());
    }
}
