//! Request encoding and response decoding
//!
//! `encode_request` turns a typed [`Operation`] into one wire frame;
//! `decode_response` turns a received frame back into an [`Outcome`].
//! Extras layouts are fixed per opcode and match the server exactly.

use super::frame::WireFrame;
use super::leb128::write_uleb128;
use super::{ChannelContext, Magic, Opcode, Status};
use crate::durability::{sync_replication_framing, MutationToken};
use crate::operation::{Operation, Outcome, SubdocMutationSpec};
use crate::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};

/// Sentinel expiry for counter operations without an initial value: the
/// server fails the operation instead of seeding the counter.
pub const COUNTER_NOT_EXISTS_EXPIRY: u32 = 0xffff_ffff;

/// Encode `op` into a complete request frame.
///
/// `shard` is the routing target stamped into the header. Durability on a
/// channel that never negotiated sync replication is refused here, before
/// any bytes exist to send.
pub fn encode_request(
    op: &Operation,
    opaque: u32,
    shard: u16,
    ctx: &ChannelContext,
) -> Result<Bytes> {
    let opcode = op
        .opcode()
        .ok_or_else(|| Error::InvalidArgument("operation is resolved locally".into()))?;
    let opctx = op.context();

    let framing_extras = match &opctx.durability {
        Some(requirement) => {
            if !opcode.is_mutation() {
                return Err(Error::InvalidArgument(
                    "durability only applies to mutations".into(),
                ));
            }
            if !ctx.sync_replication {
                return Err(Error::DurabilityNotAvailable(requirement.level));
            }
            sync_replication_framing(requirement, opctx.timeout)
        }
        None => Bytes::new(),
    };

    let key = match op {
        Operation::GetClusterConfig { .. } => Bytes::new(),
        // the path IS the key here, never collection-prefixed
        Operation::GetCollectionId { path, .. } => Bytes::copy_from_slice(path.as_bytes()),
        _ => encode_key(&opctx.key, opctx.collection_id, ctx),
    };

    let extras = encode_extras(op);
    let value = encode_value(op);

    let frame = WireFrame {
        magic: if framing_extras.is_empty() {
            Magic::Request
        } else {
            Magic::FlexibleRequest
        },
        opcode: opcode as u8,
        datatype: 0,
        shard_or_status: shard,
        opaque,
        cas: opctx.cas,
        framing_extras,
        extras,
        key,
        value,
    };
    frame.encode()
}

/// Prefix the key with its LEB128 collection id when the channel runs in
/// collection-aware mode. The default collection is id 0.
fn encode_key(key: &Bytes, collection_id: Option<u32>, ctx: &ChannelContext) -> Bytes {
    if !ctx.collections {
        return key.clone();
    }
    let mut buf = BytesMut::with_capacity(key.len() + 5);
    write_uleb128(&mut buf, collection_id.unwrap_or(0));
    buf.put_slice(key);
    buf.freeze()
}

fn encode_extras(op: &Operation) -> Bytes {
    match op {
        Operation::Upsert { flags, expiry, .. }
        | Operation::Insert { flags, expiry, .. }
        | Operation::Replace { flags, expiry, .. } => {
            let mut extras = BytesMut::with_capacity(8);
            extras.put_u32(*flags);
            extras.put_u32(*expiry);
            extras.freeze()
        }
        Operation::Increment {
            delta,
            initial,
            expiry,
            ..
        }
        | Operation::Decrement {
            delta,
            initial,
            expiry,
            ..
        } => {
            let mut extras = BytesMut::with_capacity(20);
            extras.put_u64(*delta);
            match initial {
                Some(seed) => {
                    extras.put_u64(*seed);
                    extras.put_u32(*expiry);
                }
                None => {
                    // No initial: sentinel expiry makes the server fail on
                    // a missing key instead of creating it.
                    extras.put_u64(0);
                    extras.put_u32(COUNTER_NOT_EXISTS_EXPIRY);
                }
            }
            extras.freeze()
        }
        Operation::SubdocMutate { expiry, .. } if *expiry != 0 => {
            let mut extras = BytesMut::with_capacity(4);
            extras.put_u32(*expiry);
            extras.freeze()
        }
        _ => Bytes::new(),
    }
}

fn encode_value(op: &Operation) -> Bytes {
    match op {
        Operation::Upsert { value, .. }
        | Operation::Insert { value, .. }
        | Operation::Replace { value, .. }
        | Operation::Append { value, .. }
        | Operation::Prepend { value, .. } => value.clone(),
        Operation::SubdocMutate { specs, .. } => encode_subdoc_specs(specs),
        _ => Bytes::new(),
    }
}

/// Subdoc multi-mutation body: per spec entry, opcode(1) flags(1)
/// path-len(2) value-len(4) path value.
fn encode_subdoc_specs(specs: &[SubdocMutationSpec]) -> Bytes {
    let mut buf = BytesMut::new();
    for spec in specs {
        buf.put_u8(spec.opcode);
        buf.put_u8(spec.flags);
        buf.put_u16(spec.path.len() as u16);
        buf.put_u32(spec.value.len() as u32);
        buf.put_slice(&spec.path);
        buf.put_slice(&spec.value);
    }
    buf.freeze()
}

/// Decode a response frame into an [`Outcome`].
///
/// `opcode` and `shard` come from the original request the frame correlates
/// with; the bucket comes from the channel. Unknown status codes decode to
/// [`Status::Unknown`] — classification is the caller's job, not ours.
pub fn decode_response(
    frame: &WireFrame,
    opcode: Opcode,
    shard: u16,
    ctx: &ChannelContext,
) -> Result<Outcome> {
    if frame.magic.is_request() {
        return Err(Error::ProtocolDecode(
            "request magic on the response path".into(),
        ));
    }

    let status = Status::from_u16(frame.shard_or_status);

    let mutation_token = if ctx.mutation_tokens && status.is_success() && opcode.is_mutation() {
        MutationToken::from_extras(&frame.extras, shard, &ctx.bucket)
    } else {
        None
    };

    Ok(Outcome {
        status,
        cas: frame.cas,
        value: frame.value.clone(),
        extras: frame.extras.clone(),
        datatype: frame.datatype,
        mutation_token,
    })
}

/// Classify a decoded outcome: successes pass through, everything else maps
/// to the typed error taxonomy.
///
/// `KeyExists` means "already exists" for an insert and a CAS conflict for
/// everything else; the conflict is terminal and never retried upstream.
pub fn outcome_into_result(outcome: Outcome, opcode: Opcode, shard: u16) -> Result<Outcome> {
    match outcome.status {
        Status::Success => Ok(outcome),
        Status::KeyNotFound => Err(Error::DocumentNotFound),
        Status::KeyExists => {
            if opcode == Opcode::Insert {
                Err(Error::DocumentAlreadyExists)
            } else {
                Err(Error::CasConflict)
            }
        }
        Status::TooBig => Err(Error::RequestTooBig),
        Status::NotStored => Err(Error::NotStored),
        Status::NotMyShard => Err(Error::StaleShardOwnership(shard)),
        Status::Locked => Err(Error::Locked),
        Status::OutOfMemory => Err(Error::OutOfMemory),
        Status::ServerBusy => Err(Error::ServerBusy),
        Status::TemporaryFailure => Err(Error::TemporaryFailure),
        Status::Unknown(code) => Err(Error::UnexpectedStatus {
            code,
            opcode: opcode as u8,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OperationContext;
    use std::time::Duration;

    fn channel() -> ChannelContext {
        ChannelContext::new("travel")
    }

    fn opctx(key: &'static [u8]) -> OperationContext {
        OperationContext::new(Bytes::from_static(key), Duration::from_millis(2500))
    }

    #[test]
    fn test_get_frame_shape() {
        let op = Operation::Get { ctx: opctx(b"k1") };
        let bytes = encode_request(&op, 7, 99, &channel()).unwrap();
        let frame = WireFrame::decode(bytes).unwrap();
        assert_eq!(frame.magic, Magic::Request);
        assert_eq!(frame.opcode, Opcode::Get as u8);
        assert_eq!(frame.shard_or_status, 99);
        assert_eq!(frame.opaque, 7);
        // default collection id 0 prefixes the key
        assert_eq!(&frame.key[..], &[0x00, b'k', b'1']);
        assert!(frame.extras.is_empty());
    }

    #[test]
    fn test_collections_disabled_leaves_key_bare() {
        let mut ctx = channel();
        ctx.collections = false;
        let op = Operation::Get { ctx: opctx(b"k1") };
        let frame = WireFrame::decode(encode_request(&op, 0, 0, &ctx).unwrap()).unwrap();
        assert_eq!(&frame.key[..], b"k1");
    }

    #[test]
    fn test_increment_extras_without_initial() {
        let op = Operation::Increment {
            ctx: opctx(b"counter"),
            delta: 5,
            initial: None,
            expiry: 0,
        };
        let frame = WireFrame::decode(encode_request(&op, 0, 0, &channel()).unwrap()).unwrap();
        assert_eq!(frame.extras.len(), 20);
        assert_eq!(&frame.extras[0..8], &5u64.to_be_bytes());
        assert_eq!(&frame.extras[8..16], &0u64.to_be_bytes());
        assert_eq!(&frame.extras[16..20], &COUNTER_NOT_EXISTS_EXPIRY.to_be_bytes());
    }

    #[test]
    fn test_increment_extras_with_initial() {
        let op = Operation::Increment {
            ctx: opctx(b"counter"),
            delta: 1,
            initial: Some(100),
            expiry: 30,
        };
        let frame = WireFrame::decode(encode_request(&op, 0, 0, &channel()).unwrap()).unwrap();
        assert_eq!(&frame.extras[8..16], &100u64.to_be_bytes());
        assert_eq!(&frame.extras[16..20], &30u32.to_be_bytes());
    }

    #[test]
    fn test_durability_unnegotiated_is_refused() {
        use crate::durability::{DurabilityLevel, DurabilityRequirement};
        let mut ctx = channel();
        ctx.sync_replication = false;
        let op = Operation::Upsert {
            ctx: opctx(b"doc")
                .with_durability(DurabilityRequirement::new(DurabilityLevel::Majority)),
            value: Bytes::from_static(b"{}"),
            flags: 0,
            expiry: 0,
        };
        let err = encode_request(&op, 0, 0, &ctx).unwrap_err();
        assert!(matches!(err, Error::DurabilityNotAvailable(_)));
    }

    #[test]
    fn test_durability_negotiated_emits_flexible_frame() {
        use crate::durability::{DurabilityLevel, DurabilityRequirement};
        let op = Operation::Upsert {
            ctx: opctx(b"doc")
                .with_durability(DurabilityRequirement::new(DurabilityLevel::Majority)),
            value: Bytes::from_static(b"{}"),
            flags: 0,
            expiry: 0,
        };
        let frame = WireFrame::decode(encode_request(&op, 0, 0, &channel()).unwrap()).unwrap();
        assert_eq!(frame.magic, Magic::FlexibleRequest);
        assert_eq!(frame.framing_extras.len(), 4);
        assert_eq!(frame.framing_extras[0], 0x13);
    }

    #[test]
    fn test_decode_unknown_status_is_not_an_error() {
        let frame = WireFrame {
            magic: Magic::Response,
            opcode: Opcode::Get as u8,
            datatype: 0,
            shard_or_status: 0x0142,
            opaque: 1,
            cas: 0,
            framing_extras: Bytes::new(),
            extras: Bytes::new(),
            key: Bytes::new(),
            value: Bytes::new(),
        };
        let outcome = decode_response(&frame, Opcode::Get, 0, &channel()).unwrap();
        assert_eq!(outcome.status, Status::Unknown(0x0142));

        let err = outcome_into_result(outcome, Opcode::Get, 0).unwrap_err();
        assert!(matches!(err, Error::UnexpectedStatus { code: 0x0142, .. }));
    }

    #[test]
    fn test_mutation_token_extraction() {
        let mut extras = BytesMut::new();
        extras.put_u64(0xabcd);
        extras.put_u64(17);
        let frame = WireFrame {
            magic: Magic::Response,
            opcode: Opcode::Upsert as u8,
            datatype: 0,
            shard_or_status: 0,
            opaque: 1,
            cas: 42,
            framing_extras: Bytes::new(),
            extras: extras.freeze(),
            key: Bytes::new(),
            value: Bytes::new(),
        };
        let outcome = decode_response(&frame, Opcode::Upsert, 313, &channel()).unwrap();
        let token = outcome.mutation_token.unwrap();
        assert_eq!(token.shard_id, 313);
        assert_eq!(token.shard_incarnation, 0xabcd);
        assert_eq!(token.sequence_number, 17);
        assert_eq!(token.bucket, "travel");
    }

    #[test]
    fn test_no_token_when_unnegotiated() {
        let mut ctx = channel();
        ctx.mutation_tokens = false;
        let mut extras = BytesMut::new();
        extras.put_u64(1);
        extras.put_u64(1);
        let frame = WireFrame {
            magic: Magic::Response,
            opcode: Opcode::Upsert as u8,
            datatype: 0,
            shard_or_status: 0,
            opaque: 1,
            cas: 1,
            framing_extras: Bytes::new(),
            extras: extras.freeze(),
            key: Bytes::new(),
            value: Bytes::new(),
        };
        let outcome = decode_response(&frame, Opcode::Upsert, 0, &ctx).unwrap();
        assert!(outcome.mutation_token.is_none());
    }

    #[test]
    fn test_collection_id_path_travels_in_key() {
        let op = Operation::GetCollectionId {
            ctx: opctx(b""),
            path: "inventory.hotels".into(),
        };
        let frame = WireFrame::decode(encode_request(&op, 9, 0, &channel()).unwrap()).unwrap();
        assert_eq!(&frame.key[..], b"inventory.hotels");
        assert!(frame.value.is_empty());
        assert!(frame.extras.is_empty());
    }

    #[test]
    fn test_collection_id_from_extras() {
        let mut extras = BytesMut::new();
        extras.put_u64(3); // manifest revision
        extras.put_u32(0x0000_0457);
        let frame = WireFrame {
            magic: Magic::Response,
            opcode: Opcode::GetCollectionId as u8,
            datatype: 0,
            shard_or_status: 0,
            opaque: 1,
            cas: 0,
            framing_extras: Bytes::new(),
            extras: extras.freeze(),
            key: Bytes::new(),
            value: Bytes::new(),
        };
        let outcome = decode_response(&frame, Opcode::GetCollectionId, 0, &channel()).unwrap();
        assert_eq!(outcome.collection_id(), Some(0x457));
    }

    #[test]
    fn test_cas_conflict_classification() {
        let outcome = Outcome {
            status: Status::KeyExists,
            cas: 0,
            value: Bytes::new(),
            extras: Bytes::new(),
            datatype: 0,
            mutation_token: None,
        };
        assert!(matches!(
            outcome_into_result(outcome.clone(), Opcode::Replace, 0).unwrap_err(),
            Error::CasConflict
        ));
        assert!(matches!(
            outcome_into_result(outcome, Opcode::Insert, 0).unwrap_err(),
            Error::DocumentAlreadyExists
        ));
    }

    #[test]
    fn test_subdoc_body_layout() {
        let op = Operation::SubdocMutate {
            ctx: opctx(b"doc"),
            specs: vec![SubdocMutationSpec {
                opcode: 0xc8,
                flags: 0x01,
                path: Bytes::from_static(b"a.b"),
                value: Bytes::from_static(b"1"),
            }],
            expiry: 0,
        };
        let frame = WireFrame::decode(encode_request(&op, 0, 0, &channel()).unwrap()).unwrap();
        let body = &frame.value[..];
        assert_eq!(body[0], 0xc8);
        assert_eq!(body[1], 0x01);
        assert_eq!(u16::from_be_bytes([body[2], body[3]]), 3);
        assert_eq!(u32::from_be_bytes([body[4], body[5], body[6], body[7]]), 1);
        assert_eq!(&body[8..11], b"a.b");
        assert_eq!(&body[11..12], b"1");
    }
}
