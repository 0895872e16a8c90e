// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Diameter base-protocol decoding (RFC 6733).
//!
//! Header layout:
//!
//! ```text
//!  0                   1                   2                   3
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |    Version    |                 Message Length                |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! | Command Flags |                  Command Code                 |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                         Application-ID                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                      Hop-by-Hop Identifier                    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                      End-to-End Identifier                    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! AVPs follow, each 4-byte aligned; the V flag inserts a Vendor-Id word
//! between the AVP header and its data.

use std::sync::Arc;

use bitflags::bitflags;
use zerocopy::{BigEndian, FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, U32};

use crate::{
    dict::Dictionary,
    proto::{
        ident::{Identifier, IdentifierKind},
        message::{
            Direction, ElementRole, LinkMeta, Location, Message, MessageDetail,
            OpaqueIe, Outcome, Protocol,
        },
        registry::{DecodeError, Decoder},
    },
    utils::decode_tbcd,
};

pub const DIAMETER_HEADER_LEN: usize = 20;
pub const DIAMETER_VERSION: u8 = 0x01;

bitflags! {
    /// Command-flags octet of the Diameter header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CommandFlags: u8 {
        const REQUEST      = 0x80;
        const PROXIABLE    = 0x40;
        const ERROR        = 0x20;
        const RETRANSMIT   = 0x10;
    }
}

bitflags! {
    /// Flags octet of an AVP header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AvpFlags: u8 {
        const VENDOR    = 0x80;
        const MANDATORY = 0x40;
        const PROTECTED = 0x20;
    }
}

/// Wire image of the 20-byte Diameter header.
#[repr(C)]
#[derive(Debug, Default, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct DiameterHeader {
    pub version: u8,
    pub length: [u8; 3],
    pub flags: u8,
    pub command_code: [u8; 3],
    pub application_id: U32<BigEndian>,
    pub hop_by_hop_id: U32<BigEndian>,
    pub end_to_end_id: U32<BigEndian>,
}

impl DiameterHeader {
    pub fn from_bytes(buf: &[u8]) -> Result<&Self, DecodeError> {
        let (hdr, _) = Self::ref_from_prefix(buf)
            .map_err(|_| DecodeError::InsufficientData("Diameter header"))?;
        Ok(hdr)
    }

    #[inline]
    pub fn message_length(&self) -> usize {
        u32::from_be_bytes([0, self.length[0], self.length[1], self.length[2]]) as usize
    }

    #[inline]
    pub fn command_code(&self) -> u32 {
        u32::from_be_bytes([
            0,
            self.command_code[0],
            self.command_code[1],
            self.command_code[2],
        ])
    }

    #[inline]
    pub fn command_flags(&self) -> CommandFlags {
        CommandFlags::from_bits_truncate(self.flags)
    }

    #[inline]
    pub fn is_request(&self) -> bool {
        self.command_flags().contains(CommandFlags::REQUEST)
    }
}

/// One decoded AVP, borrowed from the input buffer.
#[derive(Debug)]
pub struct Avp<'a> {
    pub code: u32,
    pub flags: AvpFlags,
    pub vendor_id: Option<u32>,
    pub data: &'a [u8],
}

impl<'a> Avp<'a> {
    pub fn as_u32(&self) -> Option<u32> {
        let arr: [u8; 4] = self.data.try_into().ok()?;
        Some(u32::from_be_bytes(arr))
    }

    pub fn as_utf8(&self) -> Option<&'a str> {
        std::str::from_utf8(self.data).ok()
    }

    /// Walks the data portion as a grouped AVP.
    pub fn grouped(&self) -> AvpWalker<'a> {
        AvpWalker { rest: self.data }
    }
}

/// Iterator over a run of AVPs with 4-byte alignment padding.
pub struct AvpWalker<'a> {
    rest: &'a [u8],
}

impl<'a> AvpWalker<'a> {
    pub fn new(rest: &'a [u8]) -> Self {
        Self { rest }
    }
}

impl<'a> Iterator for AvpWalker<'a> {
    type Item = Result<Avp<'a>, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }
        if self.rest.len() < 8 {
            self.rest = &[];
            return Some(Err(DecodeError::InsufficientData("AVP header")));
        }

        let code = u32::from_be_bytes([
            self.rest[0],
            self.rest[1],
            self.rest[2],
            self.rest[3],
        ]);
        let flags = AvpFlags::from_bits_truncate(self.rest[4]);
        let avp_len = u32::from_be_bytes([0, self.rest[5], self.rest[6], self.rest[7]])
            as usize;

        let header_len = if flags.contains(AvpFlags::VENDOR) { 12 } else { 8 };
        let remaining = self.rest.len();
        if avp_len < header_len || avp_len > remaining {
            self.rest = &[];
            return Some(Err(DecodeError::Malformed(format!(
                "AVP {code} length {avp_len} exceeds remaining {remaining}"
            ))));
        }

        let vendor_id = flags.contains(AvpFlags::VENDOR).then(|| {
            u32::from_be_bytes([
                self.rest[8],
                self.rest[9],
                self.rest[10],
                self.rest[11],
            ])
        });

        let data = &self.rest[header_len..avp_len];
        let padded = avp_len + ((4 - (avp_len % 4)) % 4);
        self.rest = &self.rest[padded.min(self.rest.len())..];

        Some(Ok(Avp {
            code,
            flags,
            vendor_id,
            data,
        }))
    }
}

// Base-protocol and 3GPP AVP codes the correlation path consumes.
const AVP_USER_NAME: u32 = 1;
const AVP_RESULT_CODE: u32 = 268;
const AVP_SESSION_ID: u32 = 263;
const AVP_ORIGIN_HOST: u32 = 264;
const AVP_ORIGIN_REALM: u32 = 296;
const AVP_DESTINATION_HOST: u32 = 293;
const AVP_DESTINATION_REALM: u32 = 283;
const AVP_EXPERIMENTAL_RESULT: u32 = 297;
const AVP_EXPERIMENTAL_RESULT_CODE: u32 = 298;
const AVP_SUBSCRIPTION_ID: u32 = 443;
const AVP_SUBSCRIPTION_ID_DATA: u32 = 444;
const AVP_SUBSCRIPTION_ID_TYPE: u32 = 450;

const VENDOR_3GPP: u32 = 10415;
const AVP_3GPP_MSISDN: u32 = 701;
const AVP_3GPP_VISITED_PLMN_ID: u32 = 1407;

const SUB_ID_TYPE_E164: u32 = 0;
const SUB_ID_TYPE_IMSI: u32 = 1;

#[derive(Debug)]
pub struct DiameterDecoder {
    dict: Arc<Dictionary>,
}

impl DiameterDecoder {
    pub fn new(dict: Arc<Dictionary>) -> Self {
        Self { dict }
    }

    fn apply_avp(&self, avp: &Avp<'_>, msg: &mut Message, unknown: &mut Vec<OpaqueIe>) {
        match (avp.vendor_id, avp.code) {
            (None, AVP_USER_NAME) => {
                if let Some(name) = avp.as_utf8() {
                    // S6a/S6d carry the bare IMSI in User-Name.
                    if name.len() >= 6 && name.chars().all(|c| c.is_ascii_digit()) {
                        msg.identifiers
                            .push(Identifier::new(IdentifierKind::Imsi, name));
                    }
                }
            },
            (None, AVP_SESSION_ID) => {
                if let Some(sid) = avp.as_utf8() {
                    msg.identifiers
                        .push(Identifier::new(IdentifierKind::DiameterSessionId, sid));
                }
            },
            (None, AVP_ORIGIN_HOST) => {
                msg.source.fqdn = avp.as_utf8().map(str::to_string);
            },
            (None, AVP_ORIGIN_REALM) => {
                msg.source.realm = avp.as_utf8().map(str::to_string);
            },
            (None, AVP_DESTINATION_HOST) => {
                msg.destination.fqdn = avp.as_utf8().map(str::to_string);
            },
            (None, AVP_DESTINATION_REALM) => {
                msg.destination.realm = avp.as_utf8().map(str::to_string);
            },
            (None, AVP_RESULT_CODE) => {
                if let Some(code) = avp.as_u32() {
                    self.apply_result_code(code, msg);
                }
            },
            (None, AVP_EXPERIMENTAL_RESULT) => {
                for sub in avp.grouped().flatten() {
                    if sub.vendor_id.is_none()
                        && sub.code == AVP_EXPERIMENTAL_RESULT_CODE
                        && let Some(code) = sub.as_u32()
                    {
                        self.apply_result_code(code, msg);
                    }
                }
            },
            (None, AVP_SUBSCRIPTION_ID) => {
                let mut sub_type = None;
                let mut sub_data = None;
                for sub in avp.grouped().flatten() {
                    match sub.code {
                        AVP_SUBSCRIPTION_ID_TYPE => sub_type = sub.as_u32(),
                        AVP_SUBSCRIPTION_ID_DATA => {
                            sub_data = sub.as_utf8().map(str::to_string)
                        },
                        _ => {},
                    }
                }
                if let Some(data) = sub_data {
                    match sub_type {
                        Some(SUB_ID_TYPE_E164) => msg
                            .identifiers
                            .push(Identifier::new(IdentifierKind::Msisdn, data)),
                        Some(SUB_ID_TYPE_IMSI) => msg
                            .identifiers
                            .push(Identifier::new(IdentifierKind::Imsi, data)),
                        _ => {},
                    }
                }
            },
            (Some(VENDOR_3GPP), AVP_3GPP_MSISDN) => {
                let digits = decode_tbcd(avp.data);
                if !digits.is_empty() {
                    msg.identifiers
                        .push(Identifier::new(IdentifierKind::Msisdn, digits));
                }
            },
            (Some(VENDOR_3GPP), AVP_3GPP_VISITED_PLMN_ID) => {
                if let Some(loc) = plmn_to_location(avp.data) {
                    msg.location = Some(loc);
                }
            },
            (Some(vendor), code) => {
                // Vendor extension outside the dictionary: keep it opaque,
                // never fail the message.
                if self.dict.avp_of(code, Some(vendor)).is_none() {
                    unknown.push(OpaqueIe {
                        vendor,
                        code,
                        data: avp.data.to_vec(),
                    });
                }
            },
            _ => {},
        }
    }

    fn apply_result_code(&self, code: u32, msg: &mut Message) {
        if (2000..3000).contains(&code) {
            msg.outcome = Outcome::Success;
        } else {
            msg.outcome = Outcome::Failure;
            msg.cause = Some(code);
            msg.cause_text = self
                .dict
                .error_of(Protocol::Diameter, code)
                .map(str::to_string);
        }
    }
}

impl Decoder for DiameterDecoder {
    fn protocol(&self) -> Protocol {
        Protocol::Diameter
    }

    fn can_decode(&self, bytes: &[u8], _link: &LinkMeta) -> bool {
        if bytes.len() < DIAMETER_HEADER_LEN || bytes[0] != DIAMETER_VERSION {
            return false;
        }
        let len =
            u32::from_be_bytes([0, bytes[1], bytes[2], bytes[3]]) as usize;
        len >= DIAMETER_HEADER_LEN && len <= bytes.len()
    }

    fn decode(&self, bytes: &[u8], link: &LinkMeta) -> Result<Message, DecodeError> {
        let hdr = DiameterHeader::from_bytes(bytes)?;
        if hdr.version != DIAMETER_VERSION {
            return Err(DecodeError::UnsupportedVersion(hdr.version));
        }
        let total = hdr.message_length();
        if total < DIAMETER_HEADER_LEN {
            return Err(DecodeError::Malformed(format!(
                "message length {total} below header size"
            )));
        }
        if total > bytes.len() {
            return Err(DecodeError::InsufficientData("Diameter body"));
        }

        let mut msg = Message::from_link(Protocol::Diameter, link);
        let is_request = hdr.is_request();
        msg.direction = if is_request {
            Direction::Request
        } else {
            Direction::Response
        };
        msg.message_name = self
            .dict
            .command_name(hdr.command_code(), is_request)
            .map(str::to_string)
            .unwrap_or_else(|| format!("Diameter-{}", hdr.command_code()));
        msg.transaction_id = Some(u64::from(hdr.hop_by_hop_id.get()));
        msg.outcome = if is_request {
            Outcome::Pending
        } else {
            // Answers without a Result-Code stay Unknown.
            Outcome::Unknown
        };

        let mut unknown = Vec::new();
        for avp in AvpWalker::new(&bytes[DIAMETER_HEADER_LEN..total]) {
            let avp = avp?;
            self.apply_avp(&avp, &mut msg, &mut unknown);
        }

        if let Some((from, to)) =
            roles_for_application(hdr.application_id.get(), is_request)
        {
            msg.source.role = Some(from);
            msg.destination.role = Some(to);
        }

        msg.detail = MessageDetail::Diameter {
            command_code: hdr.command_code(),
            application_id: hdr.application_id.get(),
            hop_by_hop: hdr.hop_by_hop_id.get(),
            end_to_end: hdr.end_to_end_id.get(),
            unknown_avps: unknown,
        };

        Ok(msg)
    }
}

/// Element roles implied by the Diameter application, request direction.
fn roles_for_application(
    app_id: u32,
    is_request: bool,
) -> Option<(ElementRole, ElementRole)> {
    let (from, to) = match app_id {
        // S6a/S6d
        16777251 => (ElementRole::Mme, ElementRole::Hss),
        // Gx
        16777238 => (ElementRole::Pgw, ElementRole::Pcrf),
        _ => return None,
    };
    Some(if is_request { (from, to) } else { (to, from) })
}

/// 3-byte PLMN id (TBCD MCC/MNC) to a location stub.
fn plmn_to_location(data: &[u8]) -> Option<Location> {
    if data.len() < 3 {
        return None;
    }
    let (mcc, mnc) = crate::proto::gtp::decode_plmn(&data[..3]);
    Some(Location {
        mcc,
        mnc,
        tac: None,
        cell_id: None,
    })
}
