//! Integration test: wire codec.
//!
//! Validates:
//! - FindResult keeps total and lookup map in both encodings, also nested
//! - framing over a real byte stream, including truncated and oversized frames
//! - malformed requests are protocol errors

use std::io::Cursor;

use proptest::prelude::*;
use serde_json::{json, Map, Value};

use txsync::codec::{
    decode_request, decode_response, encode_request, encode_response, read_frame, write_frame, ReqId,
    MAX_FRAME_SIZE,
};
use txsync::model::{DomainResult, FindResult};
use txsync::{Doc, Request, Response, SyncError};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn doc(id: &str, title: &str) -> Doc {
    let mut d = Doc::new(id, "task:class:Task", "space-1");
    d.set("title", json!(title));
    d
}

fn through_response(result: Value, binary: bool) -> Response {
    let response = Response::ok(Some(ReqId::Num(7)), result);
    let bytes = encode_response(&response, binary).unwrap();
    decode_response(&bytes, binary).unwrap()
}

fn arb_find_result() -> impl Strategy<Value = FindResult<Doc>> {
    let titles = prop::collection::vec("[a-z ]{0,12}", 0..8);
    let total = prop_oneof![Just(-1i64), 0i64..10_000];
    let lookup = prop::option::of(prop::collection::btree_map("[a-z]{1,6}", "[a-z0-9]{0,6}", 0..4));
    (titles, total, lookup).prop_map(|(titles, total, lookup)| {
        let docs = titles
            .iter()
            .enumerate()
            .map(|(i, t)| doc(&format!("d{}", i), t))
            .collect();
        let mut result = FindResult::new(docs, total);
        result.lookup_map = lookup.map(|m| {
            m.into_iter()
                .map(|(k, v)| (k, Value::String(v)))
                .collect::<Map<String, Value>>()
        });
        result
    })
}

// ---------------------------------------------------------------------------
// FindResult representation
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn find_result_survives_both_encodings(result in arb_find_result(), binary in any::<bool>()) {
        let decoded: FindResult<Doc> = through_response(serde_json::to_value(&result).unwrap(), binary)
            .result_as()
            .unwrap();
        prop_assert_eq!(decoded, result);
    }

    #[test]
    fn nested_find_result_keeps_total(result in arb_find_result(), binary in any::<bool>()) {
        let wrapped = DomainResult { domain: "task".to_string(), value: result.clone() };
        let decoded: DomainResult<FindResult<Doc>> =
            through_response(serde_json::to_value(&wrapped).unwrap(), binary)
                .result_as()
                .unwrap();
        prop_assert_eq!(decoded.value.total, result.total);
        prop_assert_eq!(decoded.value.lookup_map, result.lookup_map);
    }
}

#[test]
fn plain_array_reads_as_find_result() {
    let decoded: FindResult<Doc> = serde_json::from_value(json!([{ "_id": "a" }, { "_id": "b" }])).unwrap();
    assert_eq!(decoded.len(), 2);
    assert_eq!(decoded.total, 2);
    assert!(decoded.lookup_map.is_none());
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

#[test]
fn frames_over_a_stream() {
    let requests = [
        Request::new(1, "hello", vec![json!({ "workspace": "ws", "account": "alice" })]),
        Request::new("abc", "findAll", vec![json!("task:class:Task"), json!({}), Value::Null]),
        Request::new(3, "ping", vec![]),
    ];

    let mut stream = Vec::new();
    for (i, request) in requests.iter().enumerate() {
        // alternate encodings frame by frame
        write_frame(&mut stream, &encode_request(request, i % 2 == 1).unwrap()).unwrap();
    }

    let mut reader = Cursor::new(stream);
    for (i, expected) in requests.iter().enumerate() {
        let frame = read_frame(&mut reader).unwrap().unwrap();
        assert_eq!(&decode_request(&frame, i % 2 == 1).unwrap(), expected);
    }
    assert!(read_frame(&mut reader).unwrap().is_none());
}

#[test]
fn truncated_frame_is_an_error() {
    let mut stream = Vec::new();
    write_frame(&mut stream, b"{\"method\":\"ping\"}").unwrap();
    stream.truncate(stream.len() - 3);
    assert!(read_frame(&mut Cursor::new(stream)).is_err());
}

#[test]
fn oversized_frame_rejected_before_read() {
    let len = (MAX_FRAME_SIZE as u32) + 1;
    let mut stream = len.to_be_bytes().to_vec();
    stream.extend_from_slice(b"no payload follows");

    let err = read_frame(&mut Cursor::new(stream)).unwrap_err();
    assert!(matches!(err, SyncError::FrameTooLarge(n) if n == len as usize));
    assert!(err.is_fatal());
}

// ---------------------------------------------------------------------------
// Malformed input
// ---------------------------------------------------------------------------

#[test]
fn malformed_requests_are_protocol_errors() {
    let cases: [&[u8]; 3] = [b"not json", br#"{"id":1,"method":42}"#, br#"{"id":1,"params":{}}"#];
    for text in cases {
        let err = decode_request(text, false).unwrap_err();
        assert_eq!(err.code(), "platform:status:BadRequest");
        assert!(err.is_fatal());
    }
}

#[test]
fn error_response_keeps_request_id() {
    let err = SyncError::UnknownMethod("frobnicate".to_string());
    for binary in [false, true] {
        let bytes = encode_response(&Response::error(Some(ReqId::Num(9)), &err), binary).unwrap();
        let decoded = decode_response(&bytes, binary).unwrap();
        assert_eq!(decoded.id, Some(ReqId::Num(9)));
        let status = decoded.error.unwrap();
        assert_eq!(status.code, "platform:status:UnknownMethod");
        assert!(status.message().unwrap().contains("frobnicate"));
    }
}
