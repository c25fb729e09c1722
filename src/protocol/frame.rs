//! Wire frame assembly and disassembly
//!
//! A [`WireFrame`] exists only for the duration of one encode or decode
//! call; nothing above the codec holds onto one.

use super::Magic;
use crate::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Fixed header size in bytes
pub const HEADER_SIZE: usize = 24;

/// One decoded (or to-be-encoded) frame.
#[derive(Debug, Clone)]
pub struct WireFrame {
    pub magic: Magic,
    pub opcode: u8,
    pub datatype: u8,
    /// Shard index on requests, status code on responses
    pub shard_or_status: u16,
    pub opaque: u32,
    pub cas: u64,
    pub framing_extras: Bytes,
    pub extras: Bytes,
    pub key: Bytes,
    pub value: Bytes,
}

impl WireFrame {
    /// Serialize the frame, header first, body segments in wire order.
    pub fn encode(&self) -> Result<Bytes> {
        if !self.magic.is_flexible() && !self.framing_extras.is_empty() {
            return Err(Error::ProtocolDecode(
                "framing extras require a flexible magic".into(),
            ));
        }

        let body_len = self.framing_extras.len() + self.extras.len() + self.key.len() + self.value.len();
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + body_len);

        buf.put_u8(self.magic as u8);
        buf.put_u8(self.opcode);
        if self.magic.is_flexible() {
            if self.framing_extras.len() > u8::MAX as usize || self.key.len() > u8::MAX as usize {
                return Err(Error::RequestTooBig);
            }
            buf.put_u8(self.framing_extras.len() as u8);
            buf.put_u8(self.key.len() as u8);
        } else {
            if self.key.len() > u16::MAX as usize {
                return Err(Error::RequestTooBig);
            }
            buf.put_u16(self.key.len() as u16);
        }
        if self.extras.len() > u8::MAX as usize {
            return Err(Error::RequestTooBig);
        }
        buf.put_u8(self.extras.len() as u8);
        buf.put_u8(self.datatype);
        buf.put_u16(self.shard_or_status);
        buf.put_u32(body_len as u32);
        buf.put_u32(self.opaque);
        buf.put_u64(self.cas);

        buf.put_slice(&self.framing_extras);
        buf.put_slice(&self.extras);
        buf.put_slice(&self.key);
        buf.put_slice(&self.value);

        Ok(buf.freeze())
    }

    /// Parse one complete frame. The caller has already framed the stream,
    /// so a length mismatch here means the peer is speaking garbage.
    pub fn decode(mut buf: Bytes) -> Result<WireFrame> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::ProtocolDecode(format!(
                "header truncated: {} of {} bytes",
                buf.len(),
                HEADER_SIZE
            )));
        }

        let magic_byte = buf.get_u8();
        let magic = Magic::from_u8(magic_byte)
            .ok_or_else(|| Error::ProtocolDecode(format!("unknown magic 0x{:02x}", magic_byte)))?;
        let opcode = buf.get_u8();

        let (framing_len, key_len) = if magic.is_flexible() {
            (buf.get_u8() as usize, buf.get_u8() as usize)
        } else {
            (0, buf.get_u16() as usize)
        };
        let extras_len = buf.get_u8() as usize;
        let datatype = buf.get_u8();
        let shard_or_status = buf.get_u16();
        let body_len = buf.get_u32() as usize;
        let opaque = buf.get_u32();
        let cas = buf.get_u64();

        if buf.remaining() != body_len {
            return Err(Error::ProtocolDecode(format!(
                "body length mismatch: header says {}, got {}",
                body_len,
                buf.remaining()
            )));
        }
        if framing_len + extras_len + key_len > body_len {
            return Err(Error::ProtocolDecode(
                "declared segments exceed body length".into(),
            ));
        }

        let framing_extras = buf.split_to(framing_len);
        let extras = buf.split_to(extras_len);
        let key = buf.split_to(key_len);
        let value = buf;

        Ok(WireFrame {
            magic,
            opcode,
            datatype,
            shard_or_status,
            opaque,
            cas,
            framing_extras,
            extras,
            key,
            value,
        })
    }

    /// Total body length as it will appear on the wire.
    pub fn body_len(&self) -> usize {
        self.framing_extras.len() + self.extras.len() + self.key.len() + self.value.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frame(magic: Magic) -> WireFrame {
        WireFrame {
            magic,
            opcode: 0x01,
            datatype: 0,
            shard_or_status: 0x0123,
            opaque: 0xdead_beef,
            cas: 0x1122_3344_5566_7788,
            framing_extras: Bytes::new(),
            extras: Bytes::from_static(&[0, 0, 0, 1, 0, 0, 0, 0]),
            key: Bytes::from_static(b"airline_10"),
            value: Bytes::from_static(b"{}"),
        }
    }

    #[test]
    fn test_header_layout() {
        let bytes = sample_frame(Magic::Request).encode().unwrap();
        assert_eq!(bytes[0], 0x80);
        assert_eq!(bytes[1], 0x01);
        // key length big-endian at bytes 2..4
        assert_eq!(u16::from_be_bytes([bytes[2], bytes[3]]), 10);
        assert_eq!(bytes[4], 8); // extras len
        assert_eq!(u16::from_be_bytes([bytes[6], bytes[7]]), 0x0123);
        assert_eq!(
            u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize,
            8 + 10 + 2
        );
        assert_eq!(bytes.len(), HEADER_SIZE + 8 + 10 + 2);
    }

    #[test]
    fn test_roundtrip_normal() {
        let frame = sample_frame(Magic::Request);
        let decoded = WireFrame::decode(frame.encode().unwrap()).unwrap();
        assert_eq!(decoded.opaque, 0xdead_beef);
        assert_eq!(decoded.cas, 0x1122_3344_5566_7788);
        assert_eq!(decoded.shard_or_status, 0x0123);
        assert_eq!(&decoded.key[..], b"airline_10");
        assert_eq!(&decoded.value[..], b"{}");
    }

    #[test]
    fn test_roundtrip_flexible() {
        let mut frame = sample_frame(Magic::FlexibleRequest);
        frame.framing_extras = Bytes::from_static(&[0x13, 0x01, 0x03, 0xe8]);
        let decoded = WireFrame::decode(frame.encode().unwrap()).unwrap();
        assert_eq!(&decoded.framing_extras[..], &[0x13, 0x01, 0x03, 0xe8]);
        assert_eq!(&decoded.key[..], b"airline_10");
    }

    #[test]
    fn test_framing_extras_need_flexible_magic() {
        let mut frame = sample_frame(Magic::Request);
        frame.framing_extras = Bytes::from_static(&[0x10, 0x01]);
        assert!(frame.encode().is_err());
    }

    #[test]
    fn test_decode_truncated_header() {
        let err = WireFrame::decode(Bytes::from_static(&[0x80, 0x00])).unwrap_err();
        assert!(matches!(err, Error::ProtocolDecode(_)));
    }

    #[test]
    fn test_decode_body_length_mismatch() {
        let mut bytes = BytesMut::from(&sample_frame(Magic::Request).encode().unwrap()[..]);
        bytes.truncate(bytes.len() - 1);
        let err = WireFrame::decode(bytes.freeze()).unwrap_err();
        assert!(matches!(err, Error::ProtocolDecode(_)));
    }
}
