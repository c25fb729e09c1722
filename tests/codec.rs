//! Codec integration tests: full encode → decode round trips

use bytes::Bytes;
use reefkv::durability::{DurabilityLevel, DurabilityRequirement};
use reefkv::operation::{Operation, OperationContext, Outcome};
use reefkv::protocol::codec::{decode_response, encode_request, outcome_into_result};
use reefkv::protocol::{ChannelContext, Magic, Opcode, Status, WireFrame};
use reefkv::Error;
use std::time::Duration;

fn channel() -> ChannelContext {
    ChannelContext::new("travel")
}

fn opctx(key: &'static [u8]) -> OperationContext {
    OperationContext::new(Bytes::from_static(key), Duration::from_millis(2500))
}

/// Build the response a server would send for a decoded request.
fn response_for(request: &WireFrame, status: Status, cas: u64, value: &[u8]) -> WireFrame {
    WireFrame {
        magic: Magic::Response,
        opcode: request.opcode,
        datatype: 0,
        shard_or_status: status.to_u16(),
        opaque: request.opaque,
        cas,
        framing_extras: Bytes::new(),
        extras: Bytes::new(),
        key: Bytes::new(),
        value: Bytes::copy_from_slice(value),
    }
}

#[test]
fn round_trip_preserves_correlation_status_cas_value() {
    let op = Operation::Upsert {
        ctx: opctx(b"airline_10"),
        value: Bytes::from_static(b"{\"name\":\"40-Mile Air\"}"),
        flags: 0x0200_0000,
        expiry: 60,
    };
    let encoded = encode_request(&op, 0xcafe_f00d, 421, &channel()).unwrap();
    let request = WireFrame::decode(encoded).unwrap();
    assert_eq!(request.opaque, 0xcafe_f00d);
    assert_eq!(request.shard_or_status, 421);

    let response = response_for(&request, Status::Success, 0x99, b"stored");
    let decoded = WireFrame::decode(response.encode().unwrap()).unwrap();
    assert_eq!(decoded.opaque, 0xcafe_f00d);

    let outcome = decode_response(&decoded, Opcode::Upsert, 421, &channel()).unwrap();
    assert_eq!(outcome.status, Status::Success);
    assert_eq!(outcome.cas, 0x99);
    assert_eq!(&outcome.value[..], b"stored");
}

#[test]
fn counter_without_initial_maps_missing_key_to_not_found() {
    let op = Operation::Increment {
        ctx: opctx(b"visits"),
        delta: 1,
        initial: None,
        expiry: 0,
    };
    let request = WireFrame::decode(encode_request(&op, 1, 0, &channel()).unwrap()).unwrap();
    // sentinel expiry tells the server to fail instead of seeding
    assert_eq!(&request.extras[16..20], &[0xff, 0xff, 0xff, 0xff]);

    let response = response_for(&request, Status::KeyNotFound, 0, b"");
    let outcome = decode_response(&response, Opcode::Increment, 0, &channel()).unwrap();
    let err = outcome_into_result(outcome, Opcode::Increment, 0).unwrap_err();
    assert!(matches!(err, Error::DocumentNotFound));
}

#[test]
fn counter_with_initial_returns_seed_value() {
    let op = Operation::Increment {
        ctx: opctx(b"visits"),
        delta: 1,
        initial: Some(100),
        expiry: 0,
    };
    let request = WireFrame::decode(encode_request(&op, 2, 0, &channel()).unwrap()).unwrap();
    assert_eq!(&request.extras[8..16], &100u64.to_be_bytes());

    // server seeds the counter and answers with the initial value
    let response = response_for(&request, Status::Success, 7, &100u64.to_be_bytes());
    let outcome = decode_response(&response, Opcode::Increment, 0, &channel()).unwrap();
    let outcome: Outcome = outcome_into_result(outcome, Opcode::Increment, 0).unwrap();
    assert_eq!(outcome.counter_value(), Some(100));
}

#[test]
fn durable_remove_round_trips_with_flexible_framing() {
    let op = Operation::Remove {
        ctx: opctx(b"doc").with_durability(DurabilityRequirement {
            level: DurabilityLevel::PersistToMajority,
            timeout: Some(Duration::from_millis(900)),
        }),
    };
    let request = WireFrame::decode(encode_request(&op, 3, 12, &channel()).unwrap()).unwrap();
    assert_eq!(request.magic, Magic::FlexibleRequest);
    assert_eq!(&request.framing_extras[..], &[0x13, 0x03, 0x03, 0x84]);
    assert_eq!(request.opcode, Opcode::Remove as u8);
}

#[test]
fn mutation_token_combines_request_shard_and_channel_bucket() {
    let op = Operation::Remove { ctx: opctx(b"doc") };
    let request = WireFrame::decode(encode_request(&op, 4, 777, &channel()).unwrap()).unwrap();

    let mut token_extras = Vec::new();
    token_extras.extend_from_slice(&0xaaaa_bbbb_cccc_ddddu64.to_be_bytes());
    token_extras.extend_from_slice(&3u64.to_be_bytes());
    let mut response = response_for(&request, Status::Success, 11, b"");
    response.extras = Bytes::from(token_extras);

    let outcome = decode_response(&response, Opcode::Remove, 777, &channel()).unwrap();
    let token = outcome.mutation_token.expect("token negotiated");
    assert_eq!(token.bucket, "travel");
    assert_eq!(token.shard_id, 777);
    assert_eq!(token.shard_incarnation, 0xaaaa_bbbb_cccc_dddd);
    assert_eq!(token.sequence_number, 3);
}

#[test]
fn stale_shard_status_surfaces_the_contacted_shard() {
    let op = Operation::Get { ctx: opctx(b"k") };
    let request = WireFrame::decode(encode_request(&op, 5, 300, &channel()).unwrap()).unwrap();
    let response = response_for(&request, Status::NotMyShard, 0, b"");
    let outcome = decode_response(&response, Opcode::Get, 300, &channel()).unwrap();
    match outcome_into_result(outcome, Opcode::Get, 300).unwrap_err() {
        Error::StaleShardOwnership(shard) => assert_eq!(shard, 300),
        other => panic!("unexpected {other:?}"),
    }
}
