// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! CDR emission: one delimited row per terminated or evicted session,
//! written under a per-protocol subdirectory.

use std::collections::HashMap;

use anyhow::Result;
use serde::Serialize;

use crate::{
    cfg::{config::SinkConfig, enums::Compression},
    correlate::session::{Session, SessionState},
    proto::{ident::IdentifierKind, message::Protocol},
    sink::rotate::{RotatingWriter, RotationPolicy},
};

pub const CDR_HEADER: &str = "session_id|start_at|end_at|duration_ms|imsi|msisdn|\
procedure|protocols|state|outcome|cause|bytes_up|bytes_down|location|avg_latency_ms";

/// Ranking used to pick the directory a multi-protocol session files
/// under: the control-plane protocol that says most about the procedure.
const PROTOCOL_RANK: &[Protocol] = &[
    Protocol::Diameter,
    Protocol::Gtpv2C,
    Protocol::Pfcp,
    Protocol::Ngap,
    Protocol::S1ap,
    Protocol::Nas,
    Protocol::Http2,
    Protocol::Map,
    Protocol::Cap,
    Protocol::Inap,
    Protocol::GtpU,
    Protocol::Other,
];

pub fn primary_protocol(session: &Session) -> Protocol {
    PROTOCOL_RANK
        .iter()
        .copied()
        .find(|p| session.protocols_seen.contains(p))
        .unwrap_or(Protocol::Other)
}

/// The flattened row handed to the database collaborator alongside the
/// file write. Delivery is at-least-once; `session_id` is the idempotency
/// key.
#[derive(Debug, Clone, Serialize)]
pub struct CdrRow {
    pub session_id: String,
    pub start_at: String,
    pub end_at: String,
    pub duration_ms: i64,
    pub imsi: String,
    pub msisdn: String,
    pub procedure: String,
    pub protocols: String,
    pub state: SessionState,
    pub outcome: String,
    pub cause: String,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub location: String,
    pub avg_latency_ms: String,
    /// Ids of the messages retained in-session, for cross-referencing the
    /// event store.
    pub message_ids: Vec<String>,
}

impl CdrRow {
    pub fn from_session(session: &Session) -> Self {
        let first_of = |kind: IdentifierKind| {
            session
                .identifiers
                .iter()
                .filter(|i| i.kind == kind)
                .map(|i| i.value.clone())
                .min()
                .unwrap_or_default()
        };

        let mut protocols: Vec<&str> = session
            .protocols_seen
            .iter()
            .map(|p| p.token())
            .collect();
        protocols.sort_unstable();

        let summary = session.latency_summary();
        let avg_latency_ms = if summary.count > 0 {
            format!("{:.3}", summary.sum_ms / summary.count as f64)
        } else {
            String::new()
        };

        let location = session
            .location_history
            .last()
            .map(|l| {
                format!(
                    "{}-{}-{}-{}",
                    l.mcc,
                    l.mnc,
                    l.tac.map(|t| t.to_string()).unwrap_or_default(),
                    l.cell_id.map(|c| c.to_string()).unwrap_or_default()
                )
            })
            .unwrap_or_default();

        Self {
            session_id: session.session_id.clone(),
            start_at: session.start_at.to_rfc3339(),
            end_at: session
                .end_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_default(),
            duration_ms: session.duration_ms(),
            imsi: first_of(IdentifierKind::Imsi),
            msisdn: first_of(IdentifierKind::Msisdn),
            procedure: session.procedure.unwrap_or("Unknown").to_string(),
            protocols: protocols.join("+"),
            state: session.state,
            outcome: session.cdr_outcome().to_string(),
            cause: session
                .cause
                .map(|c| c.to_string())
                .unwrap_or_default(),
            bytes_up: session.bytes_up_total,
            bytes_down: session.bytes_down_total,
            location,
            avg_latency_ms,
            message_ids: session.messages.iter().map(|m| m.id.clone()).collect(),
        }
    }

    /// Pipe-delimited rendering matching [`CDR_HEADER`].
    pub fn to_line(&self) -> String {
        let state = match self.state {
            SessionState::Active => "Active",
            SessionState::Closing => "Closing",
            SessionState::Terminated => "Terminated",
            SessionState::Evicted => "Evicted",
        };
        format!(
            "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}",
            self.session_id,
            self.start_at,
            self.end_at,
            self.duration_ms,
            self.imsi,
            self.msisdn,
            self.procedure,
            self.protocols,
            state,
            self.outcome,
            self.cause,
            self.bytes_up,
            self.bytes_down,
            self.location,
            self.avg_latency_ms,
        )
    }
}

/// One rotating writer per protocol subdirectory, opened lazily.
pub struct CdrWriters {
    root: String,
    max_bytes: u64,
    compression: Compression,
    writers: HashMap<Protocol, RotatingWriter>,
}

impl CdrWriters {
    pub fn new(cfg: &SinkConfig) -> Self {
        Self {
            root: cfg.output_dir.clone(),
            max_bytes: cfg.cdr_rotation_size_mb * 1024 * 1024,
            compression: cfg.compression,
            writers: HashMap::new(),
        }
    }

    pub async fn write(&mut self, session: &Session) -> Result<CdrRow> {
        let protocol = primary_protocol(session);
        let writer = self.writers.entry(protocol).or_insert_with(|| {
            RotatingWriter::new(
                format!("{}/cdr/{}", self.root, protocol.token()),
                protocol.token(),
                "cdr",
                RotationPolicy {
                    max_bytes: self.max_bytes,
                    max_age: None,
                    compression: self.compression,
                },
                Some(CDR_HEADER.to_string()),
            )
        });

        let row = CdrRow::from_session(session);
        writer.write_line(&row.to_line()).await?;
        Ok(row)
    }

    pub async fn flush(&mut self) -> Result<()> {
        for writer in self.writers.values_mut() {
            writer.flush().await?;
        }
        Ok(())
    }

    pub async fn close(&mut self) -> Result<()> {
        for writer in self.writers.values_mut() {
            writer.close().await?;
        }
        Ok(())
    }
}
