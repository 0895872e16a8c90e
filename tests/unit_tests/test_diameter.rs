use std::sync::Arc;

use anyhow::Result;
use sigscope_rs::{
    dict::Dictionary,
    proto::{
        diameter::{DIAMETER_HEADER_LEN, DiameterDecoder},
        ident::IdentifierKind,
        message::{Direction, MessageDetail, Outcome, Protocol},
        registry::{DecodeError, Decoder},
    },
};

use super::{link, load_fixture};

fn decoder() -> DiameterDecoder {
    DiameterDecoder::new(Arc::new(Dictionary::new()))
}

#[test]
fn test_ulr_decodes() -> Result<()> {
    let bytes = load_fixture("tests/fixtures/diameter_ulr.hex")?;
    let link = link([10, 0, 0, 1], 3868, [10, 0, 0, 2], 3868);

    let dec = decoder();
    assert!(dec.can_decode(&bytes, &link), "sniff must accept a ULR");

    let msg = dec.decode(&bytes, &link)?;
    assert_eq!(msg.protocol, Protocol::Diameter);
    assert_eq!(msg.message_name, "ULR");
    assert_eq!(msg.direction, Direction::Request);
    assert_eq!(msg.outcome, Outcome::Pending);
    assert_eq!(msg.transaction_id, Some(0x1111));
    assert_eq!(msg.source.fqdn.as_deref(), Some("mme.op"));
    assert_eq!(msg.source.realm.as_deref(), Some("op"));
    assert_eq!(msg.destination.realm.as_deref(), Some("op"));

    let imsi = msg
        .identifiers
        .iter()
        .find(|i| i.kind == IdentifierKind::Imsi)
        .expect("ULR carries the IMSI in User-Name");
    assert_eq!(imsi.value, "234150123456789");
    assert!(
        msg.identifiers
            .iter()
            .any(|i| i.kind == IdentifierKind::DiameterSessionId
                && i.value == "mme.op;1;1")
    );

    match &msg.detail {
        MessageDetail::Diameter {
            command_code,
            application_id,
            unknown_avps,
            ..
        } => {
            assert_eq!(*command_code, 316);
            assert_eq!(*application_id, 16777251);
            assert!(unknown_avps.is_empty());
        },
        other => panic!("wrong detail variant: {other:?}"),
    }
    Ok(())
}

#[test]
fn test_ula_result_code_2001_is_success() -> Result<()> {
    let bytes = load_fixture("tests/fixtures/diameter_ula_success.hex")?;
    let link = link([10, 0, 0, 2], 3868, [10, 0, 0, 1], 3868);

    let msg = decoder().decode(&bytes, &link)?;
    assert_eq!(msg.message_name, "ULA");
    assert_eq!(msg.direction, Direction::Response);
    assert_eq!(msg.outcome, Outcome::Success);
    assert_eq!(msg.cause, None);
    assert_eq!(msg.transaction_id, Some(0x1111));
    Ok(())
}

#[test]
fn test_ula_result_code_5001_is_failure_with_text() -> Result<()> {
    let bytes = load_fixture("tests/fixtures/diameter_ula_user_unknown.hex")?;
    let link = link([10, 0, 0, 2], 3868, [10, 0, 0, 1], 3868);

    let msg = decoder().decode(&bytes, &link)?;
    assert_eq!(msg.outcome, Outcome::Failure);
    assert_eq!(msg.cause, Some(5001));
    assert_eq!(msg.cause_text.as_deref(), Some("DIAMETER_ERROR_USER_UNKNOWN"));
    Ok(())
}

#[test]
fn test_short_buffer_is_insufficient_data() {
    let link = link([10, 0, 0, 1], 3868, [10, 0, 0, 2], 3868);
    let short = vec![0x01u8; DIAMETER_HEADER_LEN - 1];

    let dec = decoder();
    assert!(!dec.can_decode(&short, &link));
    match dec.decode(&short, &link) {
        Err(DecodeError::InsufficientData(_)) => {},
        other => panic!("expected InsufficientData, got {other:?}"),
    }
}

#[test]
fn test_truncated_avp_is_malformed() -> Result<()> {
    let mut bytes = load_fixture("tests/fixtures/diameter_ulr.hex")?;
    // Claim an AVP length reaching past the end of the message.
    bytes[DIAMETER_HEADER_LEN + 7] = 0xFF;
    let link = link([10, 0, 0, 1], 3868, [10, 0, 0, 2], 3868);

    match decoder().decode(&bytes, &link) {
        Err(DecodeError::Malformed(_)) => {},
        other => panic!("expected Malformed, got {other:?}"),
    }
    Ok(())
}

#[test]
fn test_unknown_vendor_avp_kept_opaque() -> Result<()> {
    let mut bytes = load_fixture("tests/fixtures/diameter_ula_success.hex")?;
    // Append a vendor AVP the dictionary does not know:
    // code 9999, flags V|M, length 16, vendor 4242, data deadbeef.
    let avp: [u8; 16] = [
        0x00, 0x00, 0x27, 0x0F, 0xC0, 0x00, 0x00, 0x10, 0x00, 0x00, 0x10, 0x92,
        0xDE, 0xAD, 0xBE, 0xEF,
    ];
    bytes.extend_from_slice(&avp);
    let new_len = bytes.len() as u32;
    bytes[1..4].copy_from_slice(&new_len.to_be_bytes()[1..]);

    let link = link([10, 0, 0, 2], 3868, [10, 0, 0, 1], 3868);
    let msg = decoder().decode(&bytes, &link)?;

    // Still a successful answer; the stranger rides along opaquely.
    assert_eq!(msg.outcome, Outcome::Success);
    match &msg.detail {
        MessageDetail::Diameter { unknown_avps, .. } => {
            assert_eq!(unknown_avps.len(), 1);
            assert_eq!(unknown_avps[0].vendor, 4242);
            assert_eq!(unknown_avps[0].code, 9999);
            assert_eq!(unknown_avps[0].data, vec![0xDE, 0xAD, 0xBE, 0xEF]);
        },
        other => panic!("wrong detail variant: {other:?}"),
    }
    Ok(())
}
