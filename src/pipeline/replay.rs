// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Offline replay: re-correlate an event stream without the live
//! pipeline.
//!
//! Event records keep everything correlation consumes (identifiers,
//! outcome, transaction id, byte counters), so feeding a produced event
//! file back through this harness reconstructs the same sessions. The
//! shards run synchronously here and claims resolve inline, which makes
//! the result deterministic for a given input order.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;

use crate::{
    cfg::config::Config,
    correlate::{
        session::Session,
        shard::{ClaimRequest, Shard, ShardEvent},
    },
    dict::Dictionary,
    proto::{
        ident::shard_hash,
        message::{Message, MessageDetail},
    },
    sink::event::EventRecord,
};

/// Rebuilds the decoder-facing view of one event record.
fn message_of_record(record: &EventRecord) -> Message {
    Message {
        id: crate::utils::generate_message_id(),
        captured_at: record.ts,
        processed_at: Utc::now(),
        protocol: record.protocol,
        direction: record.direction,
        message_name: record.msg_name.clone(),
        source: Default::default(),
        destination: Default::default(),
        identifiers: record.ids.clone(),
        location: None,
        outcome: record.outcome,
        cause: record.cause,
        cause_text: None,
        transaction_id: record.transaction_id,
        bytes_up: record.bytes_up,
        bytes_down: record.bytes_down,
        decode_latency_us: record.latency_us,
        detail: MessageDetail::Other,
        raw: None,
    }
}

/// Replays parsed event records through fresh correlation state and
/// returns every resulting session, closed.
pub fn replay_records(
    cfg: &Arc<Config>,
    dict: &Arc<Dictionary>,
    records: &[EventRecord],
) -> Vec<Session> {
    let shard_count = cfg.correlator.shards.max(1);
    let mut shards: Vec<Shard> = (0..shard_count)
        .map(|id| Shard::new(id, Arc::clone(cfg), Arc::clone(dict)))
        .collect();

    let mut events: Vec<ShardEvent> = Vec::new();
    let mut claims: Vec<ClaimRequest> = Vec::new();

    for record in records {
        // Records that never joined a session (malformed input) carry no
        // correlation state worth replaying.
        if record.session_id.is_empty() {
            continue;
        }
        let msg = message_of_record(record);
        let flow_key = String::new();
        let target = (shard_hash(
            &cfg.correlator.identifier_priority,
            &msg.identifiers,
            &flow_key,
        ) % shard_count as u64) as usize;

        shards[target].correlate(msg, &mut events, &mut claims);

        // Claims resolve inline: extract from the peer, merge here.
        for claim in claims.drain(..) {
            if claim.target_shard >= shards.len()
                || claim.target_shard == claim.from_shard
            {
                continue;
            }
            let extracted = shards[claim.target_shard].handle_claim(&claim.identifiers);
            if !extracted.is_empty() {
                shards[claim.from_shard].absorb_claimed(extracted);
            }
        }
    }

    let now = records.last().map(|r| r.ts).unwrap_or_else(Utc::now);
    for shard in &mut shards {
        shard.close_all(now, &mut events);
    }

    events
        .into_iter()
        .filter_map(|event| match event {
            ShardEvent::Closed(session) => Some(*session),
            _ => None,
        })
        .collect()
}

/// Parses one newline-delimited event file.
pub fn parse_event_lines(content: &str) -> Result<Vec<EventRecord>> {
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|line| {
            serde_json::from_str::<EventRecord>(line)
                .with_context(|| format!("bad event line: {line:.80}"))
        })
        .collect()
}
