// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! HTTP/2 decoding for the 5G service-based interface.
//!
//! One capture record holds one or more complete frames (the intake has
//! already stream-reassembled). Classification wants very little from the
//! connection: the `:path` pseudo-header names the NF service
//! (`/namf-comm/v1/...`), `:status` grades a response, and `3gpp-Sbi-*`
//! headers ride along for diagnostics. The HPACK reader below therefore
//! covers indexed fields against the static table and plain literals;
//! Huffman-coded strings are skipped rather than decoded, which loses
//! nothing classification needs when peers follow the 3GPP profile.

use std::{collections::HashMap, sync::Arc};

use once_cell::sync::Lazy;

use crate::{
    dict::Dictionary,
    proto::{
        ident::{Identifier, IdentifierKind},
        message::{
            Direction, ElementRole, LinkMeta, Message, MessageDetail, Outcome,
            Protocol,
        },
        registry::{DecodeError, Decoder},
    },
};

pub const FRAME_HEADER_LEN: usize = 9;
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

const FRAME_DATA: u8 = 0x0;
const FRAME_HEADERS: u8 = 0x1;
const FRAME_MAX_KNOWN: u8 = 0x9;

/// Static-table entries HPACK indexing may reference (RFC 7541 appendix A,
/// the slice classification cares about). Built once at first use.
static STATIC_TABLE: Lazy<HashMap<usize, (&'static str, &'static str)>> =
    Lazy::new(|| {
        HashMap::from([
            (1, (":authority", "")),
            (2, (":method", "GET")),
            (3, (":method", "POST")),
            (4, (":path", "/")),
            (5, (":path", "/index.html")),
            (6, (":scheme", "http")),
            (7, (":scheme", "https")),
            (8, (":status", "200")),
            (9, (":status", "204")),
            (10, (":status", "206")),
            (11, (":status", "304")),
            (12, (":status", "400")),
            (13, (":status", "404")),
            (14, (":status", "500")),
            (31, ("content-type", "")),
        ])
    });

fn static_entry(index: usize) -> Option<(&'static str, &'static str)> {
    STATIC_TABLE.get(&index).copied()
}

/// HPACK prefixed integer (RFC 7541 § 5.1). Returns (value, consumed).
fn read_prefixed_int(buf: &[u8], prefix_bits: u8) -> Option<(usize, usize)> {
    let mask = (1u16 << prefix_bits) as usize - 1;
    let first = *buf.first()? as usize & mask;
    if first < mask {
        return Some((first, 1));
    }
    let mut value = mask;
    let mut shift = 0u32;
    for (i, &b) in buf[1..].iter().enumerate() {
        value += ((b & 0x7F) as usize) << shift;
        if b & 0x80 == 0 {
            return Some((value, i + 2));
        }
        shift += 7;
        if shift > 28 {
            return None;
        }
    }
    None
}

/// HPACK string literal; Huffman payloads are skipped, not decoded.
fn read_string(buf: &[u8]) -> Option<(Option<String>, usize)> {
    let huffman = *buf.first()? & 0x80 != 0;
    let (len, consumed) = read_prefixed_int(buf, 7)?;
    let total = consumed + len;
    if buf.len() < total {
        return None;
    }
    if huffman {
        return Some((None, total));
    }
    let s = String::from_utf8_lossy(&buf[consumed..total]).into_owned();
    Some((Some(s), total))
}

/// Decoded header list of one HEADERS frame.
fn decode_hpack(mut buf: &[u8]) -> Vec<(String, String)> {
    let mut out = Vec::new();
    while !buf.is_empty() {
        let first = buf[0];
        if first & 0x80 != 0 {
            // Indexed header field.
            let Some((index, used)) = read_prefixed_int(buf, 7) else { break };
            if let Some((name, value)) = static_entry(index) {
                out.push((name.to_string(), value.to_string()));
            }
            buf = &buf[used..];
        } else if first & 0xE0 == 0x20 {
            // Dynamic table size update.
            let Some((_, used)) = read_prefixed_int(buf, 5) else { break };
            buf = &buf[used..];
        } else {
            // Literal field; prefix width depends on the indexing flavour.
            let prefix = if first & 0x40 != 0 { 6 } else { 4 };
            let Some((name_index, used)) = read_prefixed_int(buf, prefix) else {
                break;
            };
            buf = &buf[used..];

            let name = if name_index == 0 {
                let Some((n, used)) = read_string(buf) else { break };
                buf = &buf[used..];
                n
            } else {
                static_entry(name_index).map(|(n, _)| n.to_string())
            };

            let Some((value, used)) = read_string(buf) else { break };
            buf = &buf[used..];

            if let (Some(name), Some(value)) = (name, value) {
                out.push((name.to_ascii_lowercase(), value));
            }
        }
    }
    out
}

/// `/namf-comm/v1/...` → `namf-comm`.
fn service_of_path(path: &str) -> Option<String> {
    let first = path.strip_prefix('/')?.split('/').next()?;
    (!first.is_empty() && first.starts_with('n')).then(|| first.to_string())
}

/// SUPI/GPSI path segments such as `imsi-234150999999999`.
fn identifiers_of_path(path: &str) -> Vec<Identifier> {
    let mut out = Vec::new();
    for segment in path.split(['/', '?', '&', '=']) {
        if let Some(digits) = segment.strip_prefix("imsi-") {
            if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
                out.push(Identifier::new(IdentifierKind::Imsi, digits));
            }
        } else if let Some(digits) = segment.strip_prefix("msisdn-") {
            if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
                out.push(Identifier::new(IdentifierKind::Msisdn, digits));
            }
        }
    }
    out
}

fn role_of_service(service: &str) -> Option<ElementRole> {
    let nf = service.split('-').next()?;
    Some(match nf {
        "namf" => ElementRole::Amf,
        "nsmf" => ElementRole::Smf,
        "nudm" => ElementRole::Udm,
        "nnrf" => ElementRole::Scp,
        _ => return None,
    })
}

#[derive(Debug)]
pub struct Http2Decoder {
    dict: Arc<Dictionary>,
}

impl Http2Decoder {
    pub fn new(dict: Arc<Dictionary>) -> Self {
        Self { dict }
    }
}

impl Decoder for Http2Decoder {
    fn protocol(&self) -> Protocol {
        Protocol::Http2
    }

    fn can_decode(&self, bytes: &[u8], _link: &LinkMeta) -> bool {
        if bytes.starts_with(CONNECTION_PREFACE) {
            return true;
        }
        if bytes.len() < FRAME_HEADER_LEN {
            return false;
        }
        let len = u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]) as usize;
        bytes[3] <= FRAME_MAX_KNOWN && FRAME_HEADER_LEN + len <= bytes.len()
    }

    fn decode(&self, bytes: &[u8], link: &LinkMeta) -> Result<Message, DecodeError> {
        let mut rest = bytes;
        if let Some(after) = rest.strip_prefix(CONNECTION_PREFACE) {
            rest = after;
        }

        let mut msg = Message::from_link(Protocol::Http2, link);
        msg.message_name = "HTTP2".to_string();

        let mut headers: Vec<(String, String)> = Vec::new();
        let mut stream_id = 0u32;
        let mut data_bytes = 0u64;

        while rest.len() >= FRAME_HEADER_LEN {
            let len =
                u32::from_be_bytes([0, rest[0], rest[1], rest[2]]) as usize;
            let frame_type = rest[3];
            let sid = u32::from_be_bytes([rest[5], rest[6], rest[7], rest[8]])
                & 0x7FFF_FFFF;
            if rest.len() < FRAME_HEADER_LEN + len {
                return Err(DecodeError::InsufficientData("HTTP/2 frame"));
            }
            let payload = &rest[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len];

            match frame_type {
                FRAME_HEADERS if headers.is_empty() => {
                    stream_id = sid;
                    headers = decode_hpack(payload);
                },
                FRAME_DATA => data_bytes += len as u64,
                _ => {},
            }
            rest = &rest[FRAME_HEADER_LEN + len..];
        }

        let mut method = None;
        let mut path = None;
        let mut status = None;
        for (name, value) in &headers {
            match name.as_str() {
                ":method" => method = Some(value.clone()),
                ":path" => path = Some(value.clone()),
                ":status" => status = value.parse::<u16>().ok(),
                _ => {},
            }
        }

        let sbi_service = path.as_deref().and_then(service_of_path);

        if let Some(status) = status {
            msg.direction = Direction::Response;
            msg.message_name = format!("HTTP2-{status}");
            if (200..300).contains(&status) {
                msg.outcome = Outcome::Success;
            } else if status >= 400 {
                msg.outcome = Outcome::Failure;
                msg.cause = Some(u32::from(status));
                msg.cause_text = self
                    .dict
                    .error_of(Protocol::Http2, u32::from(status))
                    .map(str::to_string);
            }
        } else if let (Some(method), Some(path)) = (&method, &path) {
            msg.direction = Direction::Request;
            msg.outcome = Outcome::Pending;
            msg.message_name = match &sbi_service {
                Some(service) => format!("{method} {service}"),
                None => format!("{method} {path}"),
            };
            msg.identifiers.extend(identifiers_of_path(path));
            if let Some(role) = sbi_service.as_deref().and_then(role_of_service) {
                msg.destination.role = Some(role);
            }
        }

        if data_bytes > 0 {
            msg.bytes_up = Some(data_bytes);
        }
        msg.transaction_id = (stream_id != 0).then(|| u64::from(stream_id));
        msg.detail = MessageDetail::Http2 {
            method,
            path,
            status,
            sbi_service,
        };
        Ok(msg)
    }
}
