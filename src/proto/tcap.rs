// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! SS7 TCAP framing for the MAP, CAP and INAP application parts.
//!
//! A TCAP message is a BER-encoded APPLICATION-class constructed value
//! (begin/continue/end/abort) holding transaction ids and a component
//! portion; each component is an invoke, returnResult, returnError or
//! reject with a local operation code. Which application part a component
//! belongs to is not visible in the framing, so three thin decoders share
//! this module and claim a buffer by checking the operation code against
//! their own dictionary table. A result component without an operation
//! code goes to whichever of the three sniffs first.

use std::sync::Arc;

use crate::{
    dict::Dictionary,
    proto::{
        ident::{Identifier, IdentifierKind},
        message::{
            Direction, LinkMeta, Message, MessageDetail, Outcome, Protocol,
            TcapComponent,
        },
        registry::{DecodeError, Decoder},
    },
    utils::decode_tbcd,
};

// TCAP message-type tags (APPLICATION class, constructed).
const TAG_UNIDIRECTIONAL: u8 = 0x61;
const TAG_BEGIN: u8 = 0x62;
const TAG_END: u8 = 0x64;
const TAG_CONTINUE: u8 = 0x65;
const TAG_ABORT: u8 = 0x67;

const TAG_OTID: u8 = 0x48;
const TAG_DTID: u8 = 0x49;
const TAG_COMPONENT_PORTION: u8 = 0x6C;

const TAG_INVOKE: u8 = 0xA1;
const TAG_RETURN_RESULT_LAST: u8 = 0xA2;
const TAG_RETURN_ERROR: u8 = 0xA3;
const TAG_REJECT: u8 = 0xA4;

const TAG_INTEGER: u8 = 0x02;
const TAG_OCTET_STRING: u8 = 0x04;
const TAG_SEQUENCE: u8 = 0x30;

/// One BER TLV borrowed from the input.
#[derive(Debug, Clone, Copy)]
pub struct Tlv<'a> {
    pub tag: u8,
    pub data: &'a [u8],
}

/// Reads consecutive TLVs; definite-length forms only, which is what TCAP
/// peers emit in practice.
pub struct BerReader<'a> {
    rest: &'a [u8],
}

impl<'a> BerReader<'a> {
    pub fn new(rest: &'a [u8]) -> Self {
        Self { rest }
    }

    pub fn next_tlv(&mut self) -> Result<Option<Tlv<'a>>, DecodeError> {
        if self.rest.is_empty() {
            return Ok(None);
        }
        if self.rest.len() < 2 {
            return Err(DecodeError::InsufficientData("BER TLV"));
        }
        let tag = self.rest[0];
        if tag & 0x1F == 0x1F {
            return Err(DecodeError::Malformed(
                "multi-byte BER tags are not used by TCAP".to_string(),
            ));
        }

        let (len, header) = match self.rest[1] {
            l if l < 0x80 => (l as usize, 2),
            0x81 => {
                if self.rest.len() < 3 {
                    return Err(DecodeError::InsufficientData("BER long length"));
                }
                (self.rest[2] as usize, 3)
            },
            0x82 => {
                if self.rest.len() < 4 {
                    return Err(DecodeError::InsufficientData("BER long length"));
                }
                (
                    u16::from_be_bytes([self.rest[2], self.rest[3]]) as usize,
                    4,
                )
            },
            other => {
                return Err(DecodeError::Malformed(format!(
                    "unsupported BER length form {other:#04x}"
                )));
            },
        };

        if self.rest.len() < header + len {
            return Err(DecodeError::Malformed(format!(
                "TLV {tag:#04x} length {len} exceeds remaining buffer"
            )));
        }
        let data = &self.rest[header..header + len];
        self.rest = &self.rest[header + len..];
        Ok(Some(Tlv { tag, data }))
    }
}

fn tlv_u32(data: &[u8]) -> Option<u32> {
    if data.is_empty() || data.len() > 4 {
        return None;
    }
    let mut v: u32 = 0;
    for &b in data {
        v = (v << 8) | u32::from(b);
    }
    Some(v)
}

fn tlv_i32(data: &[u8]) -> Option<i32> {
    if data.is_empty() || data.len() > 4 {
        return None;
    }
    let mut v: i32 = if data[0] & 0x80 != 0 { -1 } else { 0 };
    for &b in data {
        v = (v << 8) | i32::from(b);
    }
    Some(v)
}

/// The distilled content of one TCAP message.
struct TcapPdu {
    message_kind: &'static str,
    otid: Option<u32>,
    dtid: Option<u32>,
    component: TcapComponent,
    opcode: Option<i32>,
    error_code: Option<i32>,
    /// First octet-string parameter of the component, for identifier hints.
    first_param: Option<Vec<u8>>,
}

fn parse_tcap(bytes: &[u8]) -> Result<TcapPdu, DecodeError> {
    let mut outer = BerReader::new(bytes);
    let msg = outer
        .next_tlv()?
        .ok_or_else(|| DecodeError::InsufficientData("TCAP message"))?;

    let message_kind = match msg.tag {
        TAG_BEGIN => "begin",
        TAG_END => "end",
        TAG_CONTINUE => "continue",
        TAG_ABORT => "abort",
        TAG_UNIDIRECTIONAL => "unidirectional",
        other => {
            return Err(DecodeError::Malformed(format!(
                "not a TCAP message type: {other:#04x}"
            )));
        },
    };

    let mut pdu = TcapPdu {
        message_kind,
        otid: None,
        dtid: None,
        component: TcapComponent::None,
        opcode: None,
        error_code: None,
        first_param: None,
    };

    let mut inner = BerReader::new(msg.data);
    while let Some(tlv) = inner.next_tlv()? {
        match tlv.tag {
            TAG_OTID => pdu.otid = tlv_u32(tlv.data),
            TAG_DTID => pdu.dtid = tlv_u32(tlv.data),
            TAG_COMPONENT_PORTION => parse_components(tlv.data, &mut pdu)?,
            // Dialogue portion and anything else is not our concern.
            _ => {},
        }
    }

    Ok(pdu)
}

fn parse_components(data: &[u8], pdu: &mut TcapPdu) -> Result<(), DecodeError> {
    let mut reader = BerReader::new(data);
    // Only the first component decides the message semantics; follow-on
    // components of a batched continue are rare and carry the same dialogue.
    let Some(comp) = reader.next_tlv()? else {
        return Ok(());
    };

    pdu.component = match comp.tag {
        TAG_INVOKE => TcapComponent::Invoke,
        TAG_RETURN_RESULT_LAST => TcapComponent::ReturnResult,
        TAG_RETURN_ERROR => TcapComponent::ReturnError,
        TAG_REJECT => TcapComponent::Reject,
        _ => return Ok(()),
    };

    let mut fields = BerReader::new(comp.data);
    // invokeID comes first in every component type.
    let _invoke_id = fields.next_tlv()?;

    match pdu.component {
        TcapComponent::Invoke => {
            while let Some(tlv) = fields.next_tlv()? {
                match tlv.tag {
                    TAG_INTEGER if pdu.opcode.is_none() => {
                        pdu.opcode = tlv_i32(tlv.data);
                    },
                    TAG_OCTET_STRING if pdu.first_param.is_none() => {
                        pdu.first_param = Some(tlv.data.to_vec());
                    },
                    TAG_SEQUENCE if pdu.first_param.is_none() => {
                        // Parameter sequence: remember its first octet string.
                        let mut params = BerReader::new(tlv.data);
                        while let Some(p) = params.next_tlv()? {
                            if p.tag == TAG_OCTET_STRING {
                                pdu.first_param = Some(p.data.to_vec());
                                break;
                            }
                        }
                    },
                    _ => {},
                }
            }
        },
        TcapComponent::ReturnResult => {
            // Optional SEQUENCE { operationCode, parameter }.
            if let Some(tlv) = fields.next_tlv()?
                && tlv.tag == TAG_SEQUENCE
            {
                let mut seq = BerReader::new(tlv.data);
                if let Some(op) = seq.next_tlv()?
                    && op.tag == TAG_INTEGER
                {
                    pdu.opcode = tlv_i32(op.data);
                }
            }
        },
        TcapComponent::ReturnError => {
            if let Some(tlv) = fields.next_tlv()?
                && tlv.tag == TAG_INTEGER
            {
                pdu.error_code = tlv_i32(tlv.data);
            }
        },
        _ => {},
    }

    Ok(())
}

fn sniff_tcap(bytes: &[u8]) -> bool {
    if bytes.len() < 4 {
        return false;
    }
    matches!(
        bytes[0],
        TAG_BEGIN | TAG_END | TAG_CONTINUE | TAG_ABORT | TAG_UNIDIRECTIONAL
    )
}

/// Shared decode path for the three application parts.
fn decode_application_part(
    dict: &Dictionary,
    protocol: Protocol,
    bytes: &[u8],
    link: &LinkMeta,
) -> Result<Message, DecodeError> {
    let pdu = parse_tcap(bytes)?;
    let mut msg = Message::from_link(protocol, link);

    let op_entry = pdu.opcode.and_then(|op| dict.ss7_operation(protocol, op));

    msg.message_name = match (&pdu.component, op_entry) {
        (TcapComponent::Invoke, Some(entry)) => entry.name.to_string(),
        (TcapComponent::ReturnResult, Some(entry)) => format!("{}-Result", entry.name),
        (TcapComponent::ReturnResult, None) => "ReturnResult".to_string(),
        (TcapComponent::ReturnError, _) => "ReturnError".to_string(),
        (TcapComponent::Reject, _) => "Reject".to_string(),
        _ => format!("Tcap-{}", pdu.message_kind),
    };

    msg.direction = match pdu.component {
        TcapComponent::Invoke => Direction::Request,
        TcapComponent::ReturnResult
        | TcapComponent::ReturnError
        | TcapComponent::Reject => Direction::Response,
        TcapComponent::None => Direction::Unknown,
    };

    msg.outcome = match pdu.component {
        TcapComponent::Invoke => Outcome::Pending,
        TcapComponent::ReturnResult => Outcome::Success,
        TcapComponent::ReturnError | TcapComponent::Reject => {
            msg.cause = pdu.error_code.map(|c| c as u32);
            msg.cause_text = msg
                .cause
                .and_then(|c| dict.error_of(protocol, c))
                .map(str::to_string);
            Outcome::Failure
        },
        TcapComponent::None => Outcome::Unknown,
    };

    // Transaction ids pair invokes with results across the dialogue.
    msg.transaction_id = pdu
        .otid
        .or(pdu.dtid)
        .map(u64::from);

    if let (Some(entry), Some(param)) = (op_entry, &pdu.first_param)
        && let Some(kind) = entry.param_identifier
    {
        let digits = decode_tbcd(param);
        if !digits.is_empty() {
            msg.identifiers.push(Identifier::new(kind, digits));
        }
    }

    msg.detail = MessageDetail::Tcap {
        originating_tid: pdu.otid,
        destination_tid: pdu.dtid,
        opcode: pdu.opcode,
        component: pdu.component,
    };
    Ok(msg)
}

/// Accept when the TCAP framing parses and the operation code (if any)
/// belongs to this application part's table.
fn sniff_application_part(dict: &Dictionary, protocol: Protocol, bytes: &[u8]) -> bool {
    if !sniff_tcap(bytes) {
        return false;
    }
    match parse_tcap(bytes) {
        Ok(pdu) => match pdu.opcode {
            Some(op) => dict.ss7_operation(protocol, op).is_some(),
            // No opcode (bare results, aborts): first decoder in registry
            // order takes it.
            None => true,
        },
        Err(_) => false,
    }
}

macro_rules! ss7_decoder {
    ($name:ident, $protocol:expr) => {
        #[derive(Debug)]
        pub struct $name {
            dict: Arc<Dictionary>,
        }

        impl $name {
            pub fn new(dict: Arc<Dictionary>) -> Self {
                Self { dict }
            }
        }

        impl Decoder for $name {
            fn protocol(&self) -> Protocol {
                $protocol
            }

            fn can_decode(&self, bytes: &[u8], _link: &LinkMeta) -> bool {
                sniff_application_part(&self.dict, $protocol, bytes)
            }

            fn decode(
                &self,
                bytes: &[u8],
                link: &LinkMeta,
            ) -> Result<Message, DecodeError> {
                decode_application_part(&self.dict, $protocol, bytes, link)
            }
        }
    };
}

ss7_decoder!(MapDecoder, Protocol::Map);
ss7_decoder!(CapDecoder, Protocol::Cap);
ss7_decoder!(InapDecoder, Protocol::Inap);
