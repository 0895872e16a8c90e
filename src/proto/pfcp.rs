// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! PFCP decoding (TS 29.244), the N4/Sxb control plane between SMF and UPF.
//!
//! Session-scoped messages carry the recipient's SEID in the header; each
//! side announces its own SEID in an F-SEID IE during establishment. A SEID
//! is therefore indexed under the node that owns it: header SEIDs under the
//! destination address, F-SEID IEs under the address embedded in the IE.

use std::{net::IpAddr, sync::Arc};

use crate::{
    dict::Dictionary,
    proto::{
        ident::{Identifier, IdentifierKind},
        message::{Direction, LinkMeta, Message, MessageDetail, Outcome, Protocol},
        registry::{DecodeError, Decoder},
    },
};

pub const PFCP_MIN_HEADER_LEN: usize = 8;

const PFCP_FLAG_SEID: u8 = 0x01;

const IE_CAUSE: u16 = 19;
const IE_NODE_ID: u16 = 60;
const IE_FSEID: u16 = 57;
const IE_UE_IP_ADDRESS: u16 = 93;

// Cause 1 is "Request accepted"; 64 and above are rejections.
const CAUSE_ACCEPTED: u8 = 1;

struct Ie<'a> {
    ie_type: u16,
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
            return Some(Err(DecodeError::InsufficientData("PFCP IE header")));
        }
        let ie_type = u16::from_be_bytes([self.rest[0], self.rest[1]]);
        let len = u16::from_be_bytes([self.rest[2], self.rest[3]]) as usize;
        if self.rest.len() < 4 + len {
            self.rest = &[];
            return Some(Err(DecodeError::Malformed(format!(
                "IE {ie_type} length {len} exceeds remaining buffer"
            ))));
        }
        let data = &self.rest[4..4 + len];
        self.rest = &self.rest[4 + len..];
        Some(Ok(Ie { ie_type, data }))
    }
}

#[derive(Debug)]
pub struct PfcpDecoder {
    dict: Arc<Dictionary>,
}

impl PfcpDecoder {
    pub fn new(dict: Arc<Dictionary>) -> Self {
        Self { dict }
    }

    fn apply_ie(&self, ie: &Ie<'_>, msg: &mut Message) {
        match ie.ie_type {
            IE_CAUSE => {
                if let Some(&value) = ie.data.first() {
                    if value == CAUSE_ACCEPTED {
                        msg.outcome = Outcome::Success;
                    } else if value >= 64 {
                        msg.outcome = Outcome::Failure;
                        msg.cause = Some(u32::from(value));
                        msg.cause_text = self
                            .dict
                            .error_of(Protocol::Pfcp, u32::from(value))
                            .map(str::to_string);
                    }
                }
            },
            IE_NODE_ID => {
                if let Some(node) = decode_node_id(ie.data) {
                    msg.source.fqdn = Some(node);
                }
            },
            IE_FSEID => {
                // flags octet, 8-byte SEID, then v4 and/or v6 address.
                if ie.data.len() >= 9 {
                    let seid = u64::from_be_bytes([
                        ie.data[1], ie.data[2], ie.data[3], ie.data[4], ie.data[5],
                        ie.data[6], ie.data[7], ie.data[8],
                    ]);
                    let has_v4 = ie.data[0] & 0x02 != 0;
                    let scope = if has_v4 && ie.data.len() >= 13 {
                        let arr: [u8; 4] = match ie.data[9..13].try_into() {
                            Ok(a) => a,
                            Err(_) => return,
                        };
                        IpAddr::from(arr).to_string()
                    } else {
                        msg.source.ip.to_string()
                    };
                    msg.identifiers.push(Identifier::scoped(
                        IdentifierKind::Seid,
                        format!("{seid:#018x}"),
                        scope,
                    ));
                }
            },
            IE_UE_IP_ADDRESS => {
                // flags octet: V4 0x02, V6 0x01.
                if ie.data.first().map(|f| f & 0x02 != 0) == Some(true)
                    && ie.data.len() >= 5
                {
                    if let Ok(arr) = <[u8; 4]>::try_from(&ie.data[1..5]) {
                        msg.identifiers.push(Identifier::new(
                            IdentifierKind::IpUe,
                            IpAddr::from(arr).to_string(),
                        ));
                    }
                }
            },
            _ => {},
        }
    }
}

impl Decoder for PfcpDecoder {
    fn protocol(&self) -> Protocol {
        Protocol::Pfcp
    }

    fn can_decode(&self, bytes: &[u8], _link: &LinkMeta) -> bool {
        if bytes.len() < PFCP_MIN_HEADER_LEN {
            return false;
        }
        let version = bytes[0] >> 5;
        if version != 1 {
            return false;
        }
        let len = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
        len + 4 <= bytes.len()
    }

    fn decode(&self, bytes: &[u8], link: &LinkMeta) -> Result<Message, DecodeError> {
        if bytes.len() < PFCP_MIN_HEADER_LEN {
            return Err(DecodeError::InsufficientData("PFCP header"));
        }
        let version = bytes[0] >> 5;
        if version != 1 {
            return Err(DecodeError::UnsupportedVersion(version));
        }

        let has_seid = bytes[0] & PFCP_FLAG_SEID != 0;
        let message_type = bytes[1];
        let body_len = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
        let total = body_len + 4;
        if total > bytes.len() {
            return Err(DecodeError::InsufficientData("PFCP body"));
        }

        let (seid, sequence, ie_offset) = if has_seid {
            if total < 16 {
                return Err(DecodeError::Malformed(
                    "S flag set on a header shorter than 16 bytes".to_string(),
                ));
            }
            let seid = u64::from_be_bytes([
                bytes[4], bytes[5], bytes[6], bytes[7], bytes[8], bytes[9], bytes[10],
                bytes[11],
            ]);
            let seq = u32::from_be_bytes([0, bytes[12], bytes[13], bytes[14]]);
            (Some(seid), seq, 16)
        } else {
            let seq = u32::from_be_bytes([0, bytes[4], bytes[5], bytes[6]]);
            (None, seq, 8)
        };

        let mut msg = Message::from_link(Protocol::Pfcp, link);
        let (name, direction) = self
            .dict
            .pfcp_message(message_type)
            .unwrap_or(("PFCP-Unknown", Direction::Unknown));
        msg.message_name = name.to_string();
        msg.direction = direction;
        msg.transaction_id = Some(u64::from(sequence));
        msg.outcome = match direction {
            Direction::Request => Outcome::Pending,
            _ => Outcome::Unknown,
        };

        if let Some(seid) = seid
            && seid != 0
        {
            // Header SEID belongs to the node being addressed.
            msg.identifiers.push(Identifier::scoped(
                IdentifierKind::Seid,
                format!("{seid:#018x}"),
                link.dst_ip.to_string(),
            ));
        }

        let walker = IeWalker {
            rest: &bytes[ie_offset..total],
        };
        for ie in walker {
            let ie = ie?;
            self.apply_ie(&ie, &mut msg);
        }

        msg.detail = MessageDetail::Pfcp {
            message_type,
            seid,
            sequence,
        };
        Ok(msg)
    }
}

/// Node ID IE: type octet then IPv4/IPv6/FQDN.
fn decode_node_id(data: &[u8]) -> Option<String> {
    let (kind, rest) = data.split_first()?;
    match kind & 0x0F {
        0 if rest.len() >= 4 => {
            let arr: [u8; 4] = rest[..4].try_into().ok()?;
            Some(IpAddr::from(arr).to_string())
        },
        1 if rest.len() >= 16 => {
            let arr: [u8; 16] = rest[..16].try_into().ok()?;
            Some(IpAddr::from(arr).to_string())
        },
        2 => Some(String::from_utf8_lossy(rest).into_owned()),
        _ => None,
    }
}
