// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The normalised output of every decoder.
//!
//! Whatever the wire format, a decoder reduces one application PDU to a
//! [`Message`]: shared attributes (timestamps, endpoints, identifiers,
//! outcome) at the top level, protocol-specific leftovers in a
//! [`MessageDetail`] variant tagged by protocol. Everything downstream of the
//! decoder registry (correlation, KPI, sinks) works on this record alone and
//! never looks at raw bytes again.

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr},
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::proto::ident::Identifier;

/// Signalling protocols the monitor understands.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    #[serde(rename = "MAP")]
    Map,
    #[serde(rename = "CAP")]
    Cap,
    #[serde(rename = "INAP")]
    Inap,
    Diameter,
    #[serde(rename = "GTPv2-C")]
    Gtpv2C,
    #[serde(rename = "GTP-U")]
    GtpU,
    #[serde(rename = "PFCP")]
    Pfcp,
    #[serde(rename = "HTTP2")]
    Http2,
    #[serde(rename = "NGAP")]
    Ngap,
    #[serde(rename = "S1AP")]
    S1ap,
    #[serde(rename = "NAS")]
    Nas,
    Other,
}

impl Protocol {
    /// Stable lowercase token used in file names and index keys.
    pub fn token(self) -> &'static str {
        match self {
            Protocol::Map => "map",
            Protocol::Cap => "cap",
            Protocol::Inap => "inap",
            Protocol::Diameter => "diameter",
            Protocol::Gtpv2C => "gtpv2c",
            Protocol::GtpU => "gtpu",
            Protocol::Pfcp => "pfcp",
            Protocol::Http2 => "http2",
            Protocol::Ngap => "ngap",
            Protocol::S1ap => "s1ap",
            Protocol::Nas => "nas",
            Protocol::Other => "other",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Map => "MAP",
            Protocol::Cap => "CAP",
            Protocol::Inap => "INAP",
            Protocol::Diameter => "Diameter",
            Protocol::Gtpv2C => "GTPv2-C",
            Protocol::GtpU => "GTP-U",
            Protocol::Pfcp => "PFCP",
            Protocol::Http2 => "HTTP2",
            Protocol::Ngap => "NGAP",
            Protocol::S1ap => "S1AP",
            Protocol::Nas => "NAS",
            Protocol::Other => "Other",
        })
    }
}

/// Direction of a message within its transaction.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    Request,
    Response,
    Notification,
    #[default]
    Unknown,
}

/// Per-message outcome as seen by the decoder.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Outcome {
    Success,
    Failure,
    Pending,
    #[default]
    Unknown,
}

/// Roles a network element can play in the procedures we follow.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementRole {
    Mme,
    Amf,
    Hss,
    Udm,
    Sgw,
    Pgw,
    Smf,
    Upf,
    Enb,
    Gnb,
    Msc,
    Hlr,
    Pcrf,
    Scp,
    Unknown,
}

/// One endpoint of a decoded message.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct NetworkElement {
    pub ip: IpAddr,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fqdn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realm: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<ElementRole>,
}

impl NetworkElement {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self {
            ip,
            port,
            fqdn: None,
            realm: None,
            role: None,
        }
    }

    pub fn with_role(mut self, role: ElementRole) -> Self {
        self.role = Some(role);
        self
    }
}

impl Default for NetworkElement {
    fn default() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    }
}

/// Radio location attached to a message, when the protocol carries one.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub mcc: u16,
    pub mnc: u16,
    /// LAC for 2G/3G, TAC for 4G/5G.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tac: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cell_id: Option<u64>,
}

/// Transport carrying the PDU, as reported by the capture collaborator.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transport {
    Sctp,
    Tcp,
    #[default]
    Udp,
}

/// Link-level metadata accompanying every PDU handed to the registry.
///
/// The capture collaborator has already done SCTP/TCP reassembly; what
/// arrives here is one aligned application PDU plus its five-tuple.
#[derive(Debug, Clone)]
pub struct LinkMeta {
    pub captured_at: DateTime<Utc>,
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
    pub transport: Transport,
    pub interface: Option<String>,
}

impl LinkMeta {
    pub fn source(&self) -> NetworkElement {
        NetworkElement::new(self.src_ip, self.src_port)
    }

    pub fn destination(&self) -> NetworkElement {
        NetworkElement::new(self.dst_ip, self.dst_port)
    }

    /// Order-independent transport key, used by the fallback correlation
    /// index so both directions of one flow land on the same entry.
    pub fn flow_key(&self) -> String {
        let a = (self.src_ip, self.src_port);
        let b = (self.dst_ip, self.dst_port);
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        format!("{}:{}-{}:{}", lo.0, lo.1, hi.0, hi.1)
    }
}

/// Protocol-specific remainder of a decoded message.
///
/// Only what correlation or diagnostics actually consume survives decoding;
/// anything else stays in the raw buffer when the sink retains it.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub enum MessageDetail {
    Diameter {
        command_code: u32,
        application_id: u32,
        hop_by_hop: u32,
        end_to_end: u32,
        /// AVPs the dictionary could not resolve, kept opaque.
        unknown_avps: Vec<OpaqueIe>,
    },
    Gtpv2 {
        message_type: u8,
        teid: Option<u32>,
        sequence: u32,
    },
    GtpU {
        teid: u32,
        payload_len: u32,
    },
    Pfcp {
        message_type: u8,
        seid: Option<u64>,
        sequence: u32,
    },
    Tcap {
        originating_tid: Option<u32>,
        destination_tid: Option<u32>,
        opcode: Option<i32>,
        component: TcapComponent,
    },
    S1ap {
        procedure_code: u8,
        pdu_kind: RanPduKind,
    },
    Ngap {
        procedure_code: u8,
        pdu_kind: RanPduKind,
    },
    Nas {
        protocol_discriminator: u8,
        message_type: u8,
        security_protected: bool,
    },
    Http2 {
        method: Option<String>,
        path: Option<String>,
        status: Option<u16>,
        sbi_service: Option<String>,
    },
    Other,
}

/// TCAP component type carried by an SS7 message.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcapComponent {
    Invoke,
    ReturnResult,
    ReturnError,
    Reject,
    None,
}

/// Discriminator of an S1AP/NGAP PDU choice.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RanPduKind {
    InitiatingMessage,
    SuccessfulOutcome,
    UnsuccessfulOutcome,
}

/// An information element we could not interpret, preserved as-is.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct OpaqueIe {
    pub vendor: u32,
    pub code: u32,
    #[serde(with = "serde_hex_bytes")]
    pub data: Vec<u8>,
}

/// Normalised decoder output; one per application PDU.
#[derive(Serialize, Debug, Clone)]
pub struct Message {
    /// Opaque unique id, assigned at decode time.
    pub id: String,
    pub captured_at: DateTime<Utc>,
    pub processed_at: DateTime<Utc>,
    pub protocol: Protocol,
    pub direction: Direction,
    /// Protocol-level symbolic name, e.g. `"ULR"` or `"CreateSessionRequest"`.
    pub message_name: String,
    pub source: NetworkElement,
    pub destination: NetworkElement,
    pub identifiers: Vec<Identifier>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause_text: Option<String>,
    /// Protocol transaction id used for request/response latency pairing
    /// (Diameter hop-by-hop, GTP sequence, S1AP/NGAP UE transaction).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_up: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_down: Option<u64>,
    pub decode_latency_us: u64,
    pub detail: MessageDetail,
    /// Original buffer; populated only when the sink asks for raw retention.
    #[serde(skip)]
    pub raw: Option<Bytes>,
}

impl Message {
    /// Skeleton with endpoints and timestamps taken from link metadata; the
    /// decoder fills in everything protocol-specific.
    pub fn from_link(protocol: Protocol, link: &LinkMeta) -> Self {
        Self {
            id: crate::utils::generate_message_id(),
            captured_at: link.captured_at,
            processed_at: Utc::now(),
            protocol,
            direction: Direction::Unknown,
            message_name: String::new(),
            source: link.source(),
            destination: link.destination(),
            identifiers: Vec::new(),
            location: None,
            outcome: Outcome::Unknown,
            cause: None,
            cause_text: None,
            transaction_id: None,
            bytes_up: None,
            bytes_down: None,
            decode_latency_us: 0,
            detail: MessageDetail::Other,
            raw: None,
        }
    }

    pub fn is_request(&self) -> bool {
        self.direction == Direction::Request
    }

    pub fn is_response(&self) -> bool {
        self.direction == Direction::Response
    }
}

/// Serde helper rendering opaque bytes as a hex string.
mod serde_hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(v))
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(d)?;
        hex::decode(&raw).map_err(serde::de::Error::custom)
    }
}
