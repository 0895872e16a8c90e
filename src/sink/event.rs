// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The event stream: one structured line per decoded message.
//!
//! Records carry enough to rebuild a session offline (identifiers,
//! outcome, transaction id, byte counters), which is what the replay
//! harness and the subscriber-timeline query feed on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::proto::{
    ident::Identifier,
    message::{Direction, Message, Outcome, Protocol},
};

/// One line of the event file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub ts: DateTime<Utc>,
    pub protocol: Protocol,
    pub msg_name: String,
    pub direction: Direction,
    /// Empty for records that never reached correlation (malformed input).
    #[serde(default)]
    pub session_id: String,
    pub ids: Vec<Identifier>,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<u32>,
    pub latency_us: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_up: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_down: Option<u64>,
    /// Original buffer as hex, only when raw retention is on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
}

impl EventRecord {
    /// Event view of a message after correlation assigned its session.
    pub fn from_message(msg: &Message, session_id: &str) -> Self {
        Self {
            ts: msg.captured_at,
            protocol: msg.protocol,
            msg_name: msg.message_name.clone(),
            direction: msg.direction,
            session_id: session_id.to_string(),
            ids: msg.identifiers.clone(),
            outcome: msg.outcome,
            cause: msg.cause,
            latency_us: msg.decode_latency_us,
            transaction_id: msg.transaction_id,
            bytes_up: msg.bytes_up,
            bytes_down: msg.bytes_down,
            raw: msg.raw.as_ref().map(hex::encode),
        }
    }

    /// Diagnostic record for a buffer that never decoded; keeps the
    /// pipeline's bookkeeping complete without creating a session.
    pub fn undecodable(
        ts: DateTime<Utc>,
        protocol: Protocol,
        reason: &str,
        raw: Option<&[u8]>,
    ) -> Self {
        Self {
            ts,
            protocol,
            msg_name: reason.to_string(),
            direction: Direction::Unknown,
            session_id: String::new(),
            ids: Vec::new(),
            outcome: Outcome::Unknown,
            cause: None,
            latency_us: 0,
            transaction_id: None,
            bytes_up: None,
            bytes_down: None,
            raw: raw.map(hex::encode),
        }
    }
}
