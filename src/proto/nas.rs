// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! NAS decoding for EPS (TS 24.301) and 5GS (TS 24.501).
//!
//! NAS usually reaches us piggy-backed inside an S1AP or NGAP transport
//! IE; the RAN decoders call [`parse_nas`] to lift identifiers onto their
//! own message. A standalone decoder also registers for captures that
//! deliver NAS PDUs as their own records.
//!
//! The security header decides how much we can see: integrity-protected
//! messages still expose the inner plain PDU, ciphered ones only their
//! header.

use std::sync::Arc;

use crate::{
    dict::Dictionary,
    proto::{
        ident::{Identifier, IdentifierKind},
        message::{
            Direction, LinkMeta, Message, MessageDetail, Outcome, Protocol,
        },
        registry::{DecodeError, Decoder},
    },
    utils::decode_tbcd,
};

// Protocol discriminators.
const PD_EMM: u8 = 0x07;
const PD_ESM: u8 = 0x02;
const PD_5GMM: u8 = 0x7E;
const PD_5GSM: u8 = 0x2E;

// Security header types (EPS high nibble / 5GS second octet).
const SEC_PLAIN: u8 = 0x00;
const SEC_INTEGRITY: u8 = 0x01;
const SEC_INTEGRITY_CIPHERED: u8 = 0x02;
const SEC_INTEGRITY_NEW_CTX: u8 = 0x03;
const SEC_INTEGRITY_CIPHERED_NEW_CTX: u8 = 0x04;

// Mobile identity types (low three bits of the first identity octet).
const IDENT_IMSI: u8 = 0x01;
const IDENT_IMEI: u8 = 0x03;
const IDENT_SUCI: u8 = 0x01;

/// What a NAS PDU contributes to the carrying message.
pub struct NasInfo {
    pub protocol_discriminator: u8,
    pub message_type: u8,
    pub security_protected: bool,
    pub name: String,
    pub outcome: Outcome,
    pub cause: Option<u32>,
    pub identifiers: Vec<Identifier>,
}

/// Parses a NAS PDU, unwrapping one level of security header when the
/// payload is not ciphered.
pub fn parse_nas(dict: &Dictionary, bytes: &[u8]) -> Result<NasInfo, DecodeError> {
    let first = *bytes
        .first()
        .ok_or(DecodeError::InsufficientData("NAS header"))?;

    if first == PD_5GMM || first == PD_5GSM {
        return parse_5gs(dict, bytes);
    }
    parse_eps(dict, bytes)
}

fn parse_eps(dict: &Dictionary, bytes: &[u8]) -> Result<NasInfo, DecodeError> {
    let first = bytes[0];
    let pd = first & 0x0F;
    let sec = first >> 4;

    match sec {
        SEC_PLAIN => {},
        SEC_INTEGRITY | SEC_INTEGRITY_NEW_CTX => {
            // 6-byte security header, plain NAS inside.
            if bytes.len() < 7 {
                return Err(DecodeError::InsufficientData("EPS security header"));
            }
            let mut info = parse_eps(dict, &bytes[6..])?;
            info.security_protected = true;
            return Ok(info);
        },
        SEC_INTEGRITY_CIPHERED | SEC_INTEGRITY_CIPHERED_NEW_CTX => {
            return Ok(NasInfo {
                protocol_discriminator: pd,
                message_type: 0,
                security_protected: true,
                name: "NAS-Ciphered".to_string(),
                outcome: Outcome::Unknown,
                cause: None,
                identifiers: Vec::new(),
            });
        },
        other => {
            return Err(DecodeError::Malformed(format!(
                "unknown EPS security header type {other:#x}"
            )));
        },
    }

    if pd != PD_EMM && pd != PD_ESM {
        return Err(DecodeError::Malformed(format!(
            "unexpected NAS protocol discriminator {pd:#x}"
        )));
    }
    let message_type = *bytes
        .get(1)
        .ok_or(DecodeError::InsufficientData("EPS message type"))?;

    let name = dict
        .nas_message(pd, message_type)
        .map(str::to_string)
        .unwrap_or_else(|| format!("NAS-{message_type:#04x}"));

    let mut info = NasInfo {
        protocol_discriminator: pd,
        message_type,
        security_protected: false,
        name,
        outcome: Outcome::Unknown,
        cause: None,
        identifiers: Vec::new(),
    };

    match (pd, message_type) {
        // Attach Request: NAS KSI + attach type octet, then EPS mobile
        // identity (length-prefixed).
        (PD_EMM, 0x41) => {
            info.outcome = Outcome::Pending;
            if bytes.len() > 3
                && let Some(id) = read_mobile_identity(&bytes[3..])
            {
                info.identifiers.push(id);
            }
        },
        // Attach Accept / Complete.
        (PD_EMM, 0x42) | (PD_EMM, 0x43) => info.outcome = Outcome::Success,
        // Attach Reject: EMM cause follows the message type.
        (PD_EMM, 0x44) => {
            info.outcome = Outcome::Failure;
            info.cause = bytes.get(2).map(|&c| u32::from(c));
        },
        // Detach Request / Accept close the session.
        (PD_EMM, 0x45) | (PD_EMM, 0x46) => info.outcome = Outcome::Success,
        // TAU Reject, Service Reject.
        (PD_EMM, 0x4B) | (PD_EMM, 0x4E) => {
            info.outcome = Outcome::Failure;
            info.cause = bytes.get(2).map(|&c| u32::from(c));
        },
        // Identity Response carries a mobile identity.
        (PD_EMM, 0x56) => {
            if let Some(id) = read_mobile_identity(&bytes[2..]) {
                info.identifiers.push(id);
            }
        },
        _ => {},
    }

    Ok(info)
}

fn parse_5gs(dict: &Dictionary, bytes: &[u8]) -> Result<NasInfo, DecodeError> {
    if bytes.len() < 3 {
        return Err(DecodeError::InsufficientData("5GS NAS header"));
    }
    let pd = bytes[0];
    let sec = bytes[1] & 0x0F;

    if sec != SEC_PLAIN {
        if sec == SEC_INTEGRITY || sec == SEC_INTEGRITY_NEW_CTX {
            // 7-byte security header: PD, type, MAC (4), sequence.
            if bytes.len() < 8 {
                return Err(DecodeError::InsufficientData("5GS security header"));
            }
            let mut info = parse_5gs(dict, &bytes[7..])?;
            info.security_protected = true;
            return Ok(info);
        }
        return Ok(NasInfo {
            protocol_discriminator: pd,
            message_type: 0,
            security_protected: true,
            name: "NAS-Ciphered".to_string(),
            outcome: Outcome::Unknown,
            cause: None,
            identifiers: Vec::new(),
        });
    }

    let message_type = bytes[2];
    let name = dict
        .nas_message(pd, message_type)
        .map(str::to_string)
        .unwrap_or_else(|| format!("NAS5G-{message_type:#04x}"));

    let mut info = NasInfo {
        protocol_discriminator: pd,
        message_type,
        security_protected: false,
        name,
        outcome: Outcome::Unknown,
        cause: None,
        identifiers: Vec::new(),
    };

    match (pd, message_type) {
        // Registration Request: 5GS registration type + KSI, then 5GS
        // mobile identity with a 2-byte length.
        (PD_5GMM, 0x41) => {
            info.outcome = Outcome::Pending;
            if bytes.len() > 6 {
                let id_len =
                    u16::from_be_bytes([bytes[4], bytes[5]]) as usize;
                if bytes.len() >= 6 + id_len
                    && let Some(id) = read_5gs_identity(&bytes[6..6 + id_len])
                {
                    info.identifiers.push(id);
                }
            }
        },
        (PD_5GMM, 0x42) | (PD_5GMM, 0x43) => info.outcome = Outcome::Success,
        (PD_5GMM, 0x44) => {
            info.outcome = Outcome::Failure;
            info.cause = bytes.get(3).map(|&c| u32::from(c));
        },
        // Deregistration.
        (PD_5GMM, 0x45) | (PD_5GMM, 0x46) => info.outcome = Outcome::Success,
        _ => {},
    }

    Ok(info)
}

/// EPS mobile identity IE (length octet first): type in the low three bits
/// of the first identity octet, digits in TBCD with the odd/even flag.
fn read_mobile_identity(data: &[u8]) -> Option<Identifier> {
    let (&len, rest) = data.split_first()?;
    let len = len as usize;
    if len == 0 || rest.len() < len {
        return None;
    }
    let body = &rest[..len];
    let kind = match body[0] & 0x07 {
        IDENT_IMSI => IdentifierKind::Imsi,
        IDENT_IMEI => IdentifierKind::Imei,
        _ => return None,
    };

    // First digit rides the high nibble of the type octet.
    let mut digits = String::with_capacity(len * 2);
    let first_digit = body[0] >> 4;
    if first_digit <= 9 {
        digits.push(char::from(b'0' + first_digit));
    }
    digits.push_str(&decode_tbcd(&body[1..]));
    (!digits.is_empty()).then(|| Identifier::new(kind, digits))
}

/// 5GS mobile identity: only a null-scheme IMSI SUCI is readable here.
fn read_5gs_identity(body: &[u8]) -> Option<Identifier> {
    let first = *body.first()?;
    let id_type = first & 0x07;
    if id_type != IDENT_SUCI {
        return None;
    }
    // SUPI format in bits 4-6; 0 means IMSI.
    if (first >> 4) & 0x07 != 0 {
        return None;
    }
    if body.len() < 8 {
        return None;
    }
    let (mcc, mnc) = crate::proto::gtp::decode_plmn(&body[1..4]);
    // Routing indicator (2 bytes), protection scheme, home network key.
    let scheme = body[6] & 0x0F;
    if scheme != 0 {
        return None;
    }
    let msin = decode_tbcd(&body[8..]);
    if msin.is_empty() {
        return None;
    }
    Some(Identifier::new(
        IdentifierKind::Imsi,
        format!("{mcc:03}{mnc:02}{msin}"),
    ))
}

#[derive(Debug)]
pub struct NasDecoder {
    dict: Arc<Dictionary>,
}

impl NasDecoder {
    pub fn new(dict: Arc<Dictionary>) -> Self {
        Self { dict }
    }
}

impl Decoder for NasDecoder {
    fn protocol(&self) -> Protocol {
        Protocol::Nas
    }

    fn can_decode(&self, bytes: &[u8], _link: &LinkMeta) -> bool {
        let Some(&first) = bytes.first() else {
            return false;
        };
        if first == PD_5GMM || first == PD_5GSM {
            return bytes.len() >= 3;
        }
        bytes.len() >= 2 && matches!(first & 0x0F, PD_EMM | PD_ESM)
    }

    fn decode(&self, bytes: &[u8], link: &LinkMeta) -> Result<Message, DecodeError> {
        let info = parse_nas(&self.dict, bytes)?;
        let mut msg = Message::from_link(Protocol::Nas, link);

        msg.message_name = info.name.clone();
        msg.direction = match info.outcome {
            Outcome::Pending => Direction::Request,
            Outcome::Success | Outcome::Failure => Direction::Response,
            Outcome::Unknown => Direction::Unknown,
        };
        msg.outcome = info.outcome;
        msg.cause = info.cause;
        msg.cause_text = info
            .cause
            .and_then(|c| self.dict.error_of(Protocol::Nas, c))
            .map(str::to_string);
        msg.identifiers = info.identifiers;
        msg.detail = MessageDetail::Nas {
            protocol_discriminator: info.protocol_discriminator,
            message_type: info.message_type,
            security_protected: info.security_protected,
        };
        Ok(msg)
    }
}
