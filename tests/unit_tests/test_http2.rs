use std::sync::Arc;

use anyhow::Result;
use sigscope_rs::{
    dict::Dictionary,
    proto::{
        http2::Http2Decoder,
        ident::IdentifierKind,
        message::{Direction, MessageDetail, Outcome, Protocol},
        registry::Decoder,
    },
};

use super::link;

fn decoder() -> Http2Decoder {
    Http2Decoder::new(Arc::new(Dictionary::new()))
}

fn frame(frame_type: u8, stream: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(9 + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes()[1..]);
    out.push(frame_type);
    out.push(0x04); // END_HEADERS
    out.extend_from_slice(&stream.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Literal header field without indexing, plain (non-Huffman) strings.
fn literal(name: &str, value: &str) -> Vec<u8> {
    let mut out = vec![0x00];
    out.push(name.len() as u8);
    out.extend_from_slice(name.as_bytes());
    out.push(value.len() as u8);
    out.extend_from_slice(value.as_bytes());
    out
}

#[test]
fn test_sbi_request_classification() -> Result<()> {
    let mut hpack = vec![0x83]; // indexed :method POST
    hpack.extend_from_slice(&literal(
        ":path",
        "/namf-comm/v1/ue-contexts/imsi-234150999999999",
    ));
    hpack.extend_from_slice(&literal("3gpp-sbi-message-priority", "10"));
    let bytes = frame(0x1, 3, &hpack);

    let link = link([10, 4, 0, 1], 7777, [10, 4, 0, 2], 8080);
    let dec = decoder();
    assert!(dec.can_decode(&bytes, &link));

    let msg = dec.decode(&bytes, &link)?;
    assert_eq!(msg.protocol, Protocol::Http2);
    assert_eq!(msg.message_name, "POST namf-comm");
    assert_eq!(msg.direction, Direction::Request);
    assert_eq!(msg.outcome, Outcome::Pending);
    assert_eq!(msg.transaction_id, Some(3));
    assert!(
        msg.identifiers
            .iter()
            .any(|i| i.kind == IdentifierKind::Imsi && i.value == "234150999999999")
    );
    match &msg.detail {
        MessageDetail::Http2 {
            method,
            sbi_service,
            ..
        } => {
            assert_eq!(method.as_deref(), Some("POST"));
            assert_eq!(sbi_service.as_deref(), Some("namf-comm"));
        },
        other => panic!("wrong detail variant: {other:?}"),
    }
    Ok(())
}

#[test]
fn test_response_status_grades_outcome() -> Result<()> {
    // Indexed :status 200 from the static table.
    let bytes = frame(0x1, 3, &[0x88]);
    let link = link([10, 4, 0, 2], 8080, [10, 4, 0, 1], 7777);

    let msg = decoder().decode(&bytes, &link)?;
    assert_eq!(msg.message_name, "HTTP2-200");
    assert_eq!(msg.direction, Direction::Response);
    assert_eq!(msg.outcome, Outcome::Success);

    // Literal :status 503 fails the exchange.
    let hpack = literal(":status", "503");
    let bytes = frame(0x1, 3, &hpack);
    let msg = decoder().decode(&bytes, &link)?;
    assert_eq!(msg.outcome, Outcome::Failure);
    assert_eq!(msg.cause, Some(503));
    assert_eq!(msg.cause_text.as_deref(), Some("Service unavailable"));
    Ok(())
}

#[test]
fn test_data_frames_count_bytes() -> Result<()> {
    let mut bytes = frame(0x1, 5, &[0x83]);
    bytes.extend_from_slice(&frame(0x0, 5, &[0u8; 48]));
    let link = link([10, 4, 0, 1], 7777, [10, 4, 0, 2], 8080);

    let msg = decoder().decode(&bytes, &link)?;
    assert_eq!(msg.bytes_up, Some(48));
    Ok(())
}

#[test]
fn test_huffman_value_is_skipped_not_fatal() -> Result<()> {
    // Literal with a Huffman-coded value: the field is dropped, the
    // message survives.
    let mut hpack = vec![0x00];
    hpack.push(5);
    hpack.extend_from_slice(b":path");
    hpack.push(0x80 | 3); // Huffman flag, 3 bytes
    hpack.extend_from_slice(&[0xAA, 0xBB, 0xCC]);
    let bytes = frame(0x1, 7, &hpack);
    let link = link([10, 4, 0, 1], 7777, [10, 4, 0, 2], 8080);

    let msg = decoder().decode(&bytes, &link)?;
    assert_eq!(msg.message_name, "HTTP2");
    match &msg.detail {
        MessageDetail::Http2 { path, .. } => assert!(path.is_none()),
        other => panic!("wrong detail variant: {other:?}"),
    }
    Ok(())
}
