// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! GTPv2-C (TS 29.274) and GTP-U (TS 29.281) decoding.
//!
//! GTPv2-C is the 4G control plane between MME/SGW/PGW; its TLV IEs carry
//! the subscriber identifiers (IMSI, MSISDN, F-TEID) the correlator lives
//! on. GTP-U is sampled only for byte accounting; a G-PDU contributes its
//! payload length and its tunnel TEID, nothing more.

use std::{net::IpAddr, sync::Arc};

use crate::{
    dict::Dictionary,
    proto::{
        ident::{Identifier, IdentifierKind},
        message::{
            Direction, LinkMeta, Location, Message, MessageDetail, Outcome, Protocol,
        },
        registry::{DecodeError, Decoder},
    },
    utils::decode_tbcd,
};

pub const GTPV2_MIN_HEADER_LEN: usize = 8;
pub const GTPU_MIN_HEADER_LEN: usize = 8;

const GTPV2_FLAG_TEID: u8 = 0x08;
const GTPU_MSG_GPDU: u8 = 0xFF;

// GTPv2 IE types consumed by correlation.
const IE_IMSI: u8 = 1;
const IE_CAUSE: u8 = 2;
const IE_APN: u8 = 71;
const IE_MEI: u8 = 75;
const IE_MSISDN: u8 = 76;
const IE_PAA: u8 = 79;
const IE_ULI: u8 = 86;
const IE_FTEID: u8 = 87;
const IE_BEARER_CONTEXT: u8 = 93;

// Cause values below this are acceptances (TS 29.274 § 8.4).
const CAUSE_REJECTION_FLOOR: u8 = 64;

/// Order-independent node-pair scope for TEID index keys; a TEID is only
/// unique between the two nodes exchanging it.
pub fn teid_scope(link: &LinkMeta) -> String {
    let (lo, hi) = if link.src_ip <= link.dst_ip {
        (link.src_ip, link.dst_ip)
    } else {
        (link.dst_ip, link.src_ip)
    };
    format!("{lo}|{hi}")
}

/// One GTPv2 TLV information element.
struct Ie<'a> {
    ie_type: u8,
    instance: u8,
    data: &'a [u8],
}

struct IeWalker<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for IeWalker<'a> {
    type Item = Result<Ie<'a>, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }
        if self.rest.len() < 4 {
            self.rest = &[];
            return Some(Err(DecodeError::InsufficientData("GTPv2 IE header")));
        }
        let ie_type = self.rest[0];
        let len = u16::from_be_bytes([self.rest[1], self.rest[2]]) as usize;
        let instance = self.rest[3] & 0x0F;
        if self.rest.len() < 4 + len {
            self.rest = &[];
            return Some(Err(DecodeError::Malformed(format!(
                "IE {ie_type} length {len} exceeds remaining buffer"
            ))));
        }
        let data = &self.rest[4..4 + len];
        self.rest = &self.rest[4 + len..];
        Some(Ok(Ie {
            ie_type,
            instance,
            data,
        }))
    }
}

#[derive(Debug)]
pub struct Gtpv2Decoder {
    dict: Arc<Dictionary>,
}

impl Gtpv2Decoder {
    pub fn new(dict: Arc<Dictionary>) -> Self {
        Self { dict }
    }

    fn apply_ie(&self, ie: &Ie<'_>, msg: &mut Message, link: &LinkMeta) {
        match ie.ie_type {
            IE_IMSI => {
                let digits = decode_tbcd(ie.data);
                if !digits.is_empty() {
                    msg.identifiers
                        .push(Identifier::new(IdentifierKind::Imsi, digits));
                }
            },
            IE_MSISDN => {
                let digits = decode_tbcd(ie.data);
                if !digits.is_empty() {
                    msg.identifiers
                        .push(Identifier::new(IdentifierKind::Msisdn, digits));
                }
            },
            IE_MEI => {
                let digits = decode_tbcd(ie.data);
                if !digits.is_empty() {
                    msg.identifiers
                        .push(Identifier::new(IdentifierKind::Imei, digits));
                }
            },
            IE_CAUSE => {
                if let Some(&value) = ie.data.first() {
                    if value < CAUSE_REJECTION_FLOOR {
                        msg.outcome = Outcome::Success;
                    } else {
                        msg.outcome = Outcome::Failure;
                        msg.cause = Some(u32::from(value));
                        msg.cause_text = self
                            .dict
                            .error_of(Protocol::Gtpv2C, u32::from(value))
                            .map(str::to_string);
                    }
                }
            },
            IE_APN => {
                let apn = decode_apn(ie.data);
                if !apn.is_empty() {
                    msg.identifiers
                        .push(Identifier::new(IdentifierKind::Apn, apn));
                }
            },
            IE_PAA => {
                // PDN type in the low 3 bits of the first octet; IPv4 address
                // occupies the last 4 bytes for types 1 (v4) and 3 (v4v6).
                if let Some(ip) = decode_paa(ie.data) {
                    msg.identifiers
                        .push(Identifier::new(IdentifierKind::IpUe, ip.to_string()));
                }
            },
            IE_ULI => {
                if let Some(loc) = decode_uli(ie.data) {
                    msg.location = Some(loc);
                }
            },
            IE_FTEID => {
                if ie.data.len() >= 5 {
                    let teid = u32::from_be_bytes([
                        ie.data[1], ie.data[2], ie.data[3], ie.data[4],
                    ]);
                    msg.identifiers.push(Identifier::scoped(
                        IdentifierKind::Teid,
                        format!("{teid:#010x}"),
                        teid_scope(link),
                    ));
                }
            },
            IE_BEARER_CONTEXT => {
                // Bearer contexts nest their own F-TEIDs.
                let mut walker = IeWalker { rest: ie.data };
                for sub in walker.by_ref().flatten() {
                    if sub.ie_type == IE_FTEID {
                        self.apply_ie(&sub, msg, link);
                    }
                }
            },
            _ => {},
        }
        let _ = ie.instance;
    }
}

impl Decoder for Gtpv2Decoder {
    fn protocol(&self) -> Protocol {
        Protocol::Gtpv2C
    }

    fn can_decode(&self, bytes: &[u8], _link: &LinkMeta) -> bool {
        if bytes.len() < GTPV2_MIN_HEADER_LEN {
            return false;
        }
        let version = bytes[0] >> 5;
        if version != 2 {
            return false;
        }
        let len = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
        len + 4 <= bytes.len()
    }

    fn decode(&self, bytes: &[u8], link: &LinkMeta) -> Result<Message, DecodeError> {
        if bytes.len() < GTPV2_MIN_HEADER_LEN {
            return Err(DecodeError::InsufficientData("GTPv2 header"));
        }
        let version = bytes[0] >> 5;
        if version != 2 {
            return Err(DecodeError::UnsupportedVersion(version));
        }

        let has_teid = bytes[0] & GTPV2_FLAG_TEID != 0;
        let message_type = bytes[1];
        let body_len = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
        let total = body_len + 4;
        if total > bytes.len() {
            return Err(DecodeError::InsufficientData("GTPv2 body"));
        }

        let (teid, sequence, ie_offset) = if has_teid {
            if total < 12 {
                return Err(DecodeError::Malformed(
                    "TEID flag set on a header shorter than 12 bytes".to_string(),
                ));
            }
            let teid =
                u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
            let seq = u32::from_be_bytes([0, bytes[8], bytes[9], bytes[10]]);
            (Some(teid), seq, 12)
        } else {
            let seq = u32::from_be_bytes([0, bytes[4], bytes[5], bytes[6]]);
            (None, seq, 8)
        };

        let mut msg = Message::from_link(Protocol::Gtpv2C, link);
        let (name, direction) = self
            .dict
            .gtpv2_message(message_type)
            .unwrap_or(("GTPv2-Unknown", Direction::Unknown));
        msg.message_name = name.to_string();
        msg.direction = direction;
        msg.transaction_id = Some(u64::from(sequence));
        msg.outcome = match direction {
            Direction::Request => Outcome::Pending,
            _ => Outcome::Unknown,
        };

        if let Some(teid) = teid
            && teid != 0
        {
            msg.identifiers.push(Identifier::scoped(
                IdentifierKind::Teid,
                format!("{teid:#010x}"),
                teid_scope(link),
            ));
        }

        let walker = IeWalker {
            rest: &bytes[ie_offset..total],
        };
        for ie in walker {
            let ie = ie?;
            self.apply_ie(&ie, &mut msg, link);
        }

        msg.detail = MessageDetail::Gtpv2 {
            message_type,
            teid,
            sequence,
        };
        Ok(msg)
    }
}

/// GTP-U sampler: byte accounting only, one record per G-PDU.
#[derive(Debug, Default)]
pub struct GtpUDecoder;

impl GtpUDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for GtpUDecoder {
    fn protocol(&self) -> Protocol {
        Protocol::GtpU
    }

    fn can_decode(&self, bytes: &[u8], _link: &LinkMeta) -> bool {
        bytes.len() >= GTPU_MIN_HEADER_LEN
            && bytes[0] >> 5 == 1
            && bytes[0] & 0x10 != 0
            && bytes[1] == GTPU_MSG_GPDU
    }

    fn decode(&self, bytes: &[u8], link: &LinkMeta) -> Result<Message, DecodeError> {
        if bytes.len() < GTPU_MIN_HEADER_LEN {
            return Err(DecodeError::InsufficientData("GTP-U header"));
        }
        let payload_len = u16::from_be_bytes([bytes[2], bytes[3]]);
        let teid = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);

        let mut msg = Message::from_link(Protocol::GtpU, link);
        msg.message_name = "G-PDU".to_string();
        msg.direction = Direction::Notification;
        msg.outcome = Outcome::Success;
        msg.identifiers.push(Identifier::scoped(
            IdentifierKind::Teid,
            format!("{teid:#010x}"),
            teid_scope(link),
        ));

        // The capture interface tag decides uplink vs downlink; untagged
        // captures count as uplink.
        match link.interface.as_deref() {
            Some("dl") | Some("downlink") => msg.bytes_down = Some(u64::from(payload_len)),
            _ => msg.bytes_up = Some(u64::from(payload_len)),
        }

        msg.detail = MessageDetail::GtpU {
            teid,
            payload_len: u32::from(payload_len),
        };
        Ok(msg)
    }
}

/// APN label encoding (length-prefixed DNS-style labels) to dotted form.
fn decode_apn(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len());
    let mut rest = data;
    while let Some((&len, tail)) = rest.split_first() {
        let len = len as usize;
        if len == 0 || len > tail.len() {
            break;
        }
        if !out.is_empty() {
            out.push('.');
        }
        out.push_str(&String::from_utf8_lossy(&tail[..len]));
        rest = &tail[len..];
    }
    out
}

/// PDN Address Allocation to the UE IP, when IPv4 is present.
fn decode_paa(data: &[u8]) -> Option<IpAddr> {
    let pdn_type = data.first()? & 0x07;
    match pdn_type {
        // IPv4
        1 if data.len() >= 5 => {
            let arr: [u8; 4] = data[1..5].try_into().ok()?;
            Some(IpAddr::from(arr))
        },
        // IPv4v6: 16 bytes v6 then 4 bytes v4
        3 if data.len() >= 21 => {
            let arr: [u8; 4] = data[17..21].try_into().ok()?;
            Some(IpAddr::from(arr))
        },
        _ => None,
    }
}

/// User Location Information: flags octet, then the present location parts.
/// Only TAI + ECGI (the common 4G combination) are interpreted.
fn decode_uli(data: &[u8]) -> Option<Location> {
    let flags = *data.first()?;
    let has_tai = flags & 0x08 != 0;
    let has_ecgi = flags & 0x10 != 0;
    let mut rest = &data[1..];

    let mut loc: Option<Location> = None;
    if has_tai {
        if rest.len() < 5 {
            return loc;
        }
        let (mcc, mnc) = decode_plmn(&rest[..3]);
        let tac = u16::from_be_bytes([rest[3], rest[4]]);
        loc = Some(Location {
            mcc,
            mnc,
            tac: Some(u32::from(tac)),
            cell_id: None,
        });
        rest = &rest[5..];
    }
    if has_ecgi {
        if rest.len() < 7 {
            return loc;
        }
        let (mcc, mnc) = decode_plmn(&rest[..3]);
        let eci = u32::from_be_bytes([rest[3] & 0x0F, rest[4], rest[5], rest[6]]);
        let mut l = loc.unwrap_or(Location {
            mcc,
            mnc,
            tac: None,
            cell_id: None,
        });
        l.cell_id = Some(u64::from(eci));
        loc = Some(l);
    }
    loc
}

pub(crate) fn decode_plmn(data: &[u8]) -> (u16, u16) {
    let d = |b: u8| (b & 0x0F) as u16;
    let h = |b: u8| (b >> 4) as u16;
    let mcc = d(data[0]) * 100 + h(data[0]) * 10 + d(data[1]);
    let mnc_digit3 = h(data[1]);
    let mnc = if mnc_digit3 == 0xF {
        d(data[2]) * 10 + h(data[2])
    } else {
        d(data[2]) * 100 + h(data[2]) * 10 + mnc_digit3
    };
    (mcc, mnc)
}
