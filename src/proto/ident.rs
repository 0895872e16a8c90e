// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Subscriber/transaction identifiers and their index keys.
//!
//! Correlation hinges on typed `(kind, value)` pairs extracted by the
//! decoders. Some kinds are globally unique (IMSI, Diameter Session-Id),
//! others only within a scope: a GTP TEID means nothing without the node
//! pair it was allocated between, an F-SEID carries its own node id. The
//! scope therefore travels with the identifier and becomes part of the
//! index key.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Every identifier kind the correlation index recognises.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentifierKind {
    #[serde(rename = "IMSI")]
    Imsi,
    #[serde(rename = "MSISDN")]
    Msisdn,
    #[serde(rename = "IMEI")]
    Imei,
    #[serde(rename = "TEID")]
    Teid,
    #[serde(rename = "SEID")]
    Seid,
    #[serde(rename = "IP-UE")]
    IpUe,
    #[serde(rename = "APN")]
    Apn,
    #[serde(rename = "MME_UE_ID")]
    MmeUeId,
    #[serde(rename = "ENB_UE_ID")]
    EnbUeId,
    #[serde(rename = "AMF_UE_ID")]
    AmfUeId,
    #[serde(rename = "RAN_UE_ID")]
    RanUeId,
    #[serde(rename = "DiameterSessionID")]
    DiameterSessionId,
    #[serde(rename = "SIP-Call-ID")]
    SipCallId,
    #[serde(rename = "GUAMI")]
    Guami,
    #[serde(rename = "5G-S-TMSI")]
    FiveGSTmsi,
    /// Transport five-tuple fallback for messages carrying nothing better.
    #[serde(rename = "Flow")]
    Flow,
}

impl IdentifierKind {
    /// Whether values of this kind are meaningful only inside a scope.
    pub fn is_scoped(self) -> bool {
        matches!(self, IdentifierKind::Teid | IdentifierKind::Seid)
    }

    /// Default lookup priority, high to low, used when the configuration
    /// does not override it.
    pub fn default_priority() -> Vec<IdentifierKind> {
        vec![
            IdentifierKind::Imsi,
            IdentifierKind::Msisdn,
            IdentifierKind::Imei,
            IdentifierKind::DiameterSessionId,
            IdentifierKind::Teid,
            IdentifierKind::Seid,
            IdentifierKind::MmeUeId,
            IdentifierKind::EnbUeId,
            IdentifierKind::AmfUeId,
            IdentifierKind::RanUeId,
            IdentifierKind::IpUe,
            IdentifierKind::Flow,
        ]
    }
}

impl fmt::Display for IdentifierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IdentifierKind::Imsi => "IMSI",
            IdentifierKind::Msisdn => "MSISDN",
            IdentifierKind::Imei => "IMEI",
            IdentifierKind::Teid => "TEID",
            IdentifierKind::Seid => "SEID",
            IdentifierKind::IpUe => "IP-UE",
            IdentifierKind::Apn => "APN",
            IdentifierKind::MmeUeId => "MME_UE_ID",
            IdentifierKind::EnbUeId => "ENB_UE_ID",
            IdentifierKind::AmfUeId => "AMF_UE_ID",
            IdentifierKind::RanUeId => "RAN_UE_ID",
            IdentifierKind::DiameterSessionId => "DiameterSessionID",
            IdentifierKind::SipCallId => "SIP-Call-ID",
            IdentifierKind::Guami => "GUAMI",
            IdentifierKind::FiveGSTmsi => "5G-S-TMSI",
            IdentifierKind::Flow => "Flow",
        })
    }
}

/// A typed identifier extracted from one message.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identifier {
    pub kind: IdentifierKind,
    pub value: String,
    /// Node-pair or node-id scope for kinds that need one; `None` otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl Identifier {
    pub fn new(kind: IdentifierKind, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
            scope: None,
        }
    }

    pub fn scoped(
        kind: IdentifierKind,
        value: impl Into<String>,
        scope: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            value: value.into(),
            scope: Some(scope.into()),
        }
    }

    /// Key this identifier occupies in the per-kind index.
    pub fn index_key(&self) -> IndexKey {
        IndexKey {
            kind: self.kind,
            scope: self.scope.clone().unwrap_or_default(),
            value: self.value.clone(),
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            Some(scope) => write!(f, "{}:{}@{}", self.kind, self.value, scope),
            None => write!(f, "{}:{}", self.kind, self.value),
        }
    }
}

/// Composite key of the identifier index: `(kind, scope, value)`.
///
/// Unscoped kinds use the empty scope, so one map type serves every kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IndexKey {
    pub kind: IdentifierKind,
    pub scope: String,
    pub value: String,
}

/// Stable shard routing hash for a decoded message: the highest-priority
/// identifier present, then an explicit flow identifier, then the raw
/// flow key.
///
/// The same FNV-1a over the same key on every intake source keeps a
/// subscriber's messages on one shard regardless of capture interface.
pub fn shard_hash(priority: &[IdentifierKind], ids: &[Identifier], flow_key: &str) -> u64 {
    for kind in priority {
        if let Some(id) = ids.iter().find(|i| i.kind == *kind) {
            return hash_identifier(id);
        }
    }
    if let Some(id) = ids.iter().find(|i| i.kind == IdentifierKind::Flow) {
        return hash_identifier(id);
    }
    fnv1a(b"Flow", flow_key.as_bytes())
}

/// Routing hash of a single identifier, consistent with [`shard_hash`].
pub fn hash_identifier(id: &Identifier) -> u64 {
    fnv1a(id.kind.to_string().as_bytes(), id.value.as_bytes())
}

fn fnv1a(kind: &[u8], value: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut h = OFFSET;
    for b in kind.iter().chain(value) {
        h ^= u64::from(*b);
        h = h.wrapping_mul(PRIME);
    }
    h
}
