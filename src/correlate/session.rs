// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The correlated session record and its merge semantics.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::proto::{
    ident::Identifier,
    message::{Location, Message, Outcome, Protocol},
};

/// Arena key of a session within its shard. Index entries store these, not
/// references, so eviction is a single-step removal.
pub type SessionKey = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Active,
    Closing,
    Terminated,
    Evicted,
}

/// Compact in-session record of one message; the full record lives in the
/// event sink.
#[derive(Debug, Clone, Serialize)]
pub struct MessageEntry {
    pub id: String,
    pub name: String,
    pub captured_at: DateTime<Utc>,
    pub outcome: Outcome,
}

/// Latency summary computed on read; raw observations stay ordered.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LatencySummary {
    pub count: usize,
    pub min_ms: f64,
    pub max_ms: f64,
    pub sum_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

const MAX_LOCATION_HISTORY: usize = 16;

/// A correlated set of messages believed to belong to one subscriber
/// procedure instance.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub session_id: String,
    pub start_at: DateTime<Utc>,
    pub last_at: DateTime<Utc>,
    pub end_at: Option<DateTime<Utc>>,
    pub state: SessionState,
    /// Best-guess procedure label; `None` until a message maps to one.
    pub procedure: Option<&'static str>,
    pub identifiers: HashSet<Identifier>,
    pub protocols_seen: HashSet<Protocol>,
    pub message_count: u64,
    pub error_count: u64,
    pub retransmit_count: u64,
    pub timeout_count: u64,
    pub bytes_up_total: u64,
    pub bytes_down_total: u64,
    /// Per-exchange response latencies, in capture order.
    pub latencies_ms: Vec<f64>,
    pub location_history: Vec<Location>,
    pub final_outcome: Outcome,
    pub cause: Option<u32>,
    pub cause_text: Option<String>,
    /// Set when correlation hit an ambiguity (orphan response, merge race).
    pub conflict: bool,
    /// Recent messages, bounded; older entries are only in the event sink.
    pub messages: VecDeque<MessageEntry>,
    /// Outstanding requests awaiting their response, by protocol
    /// transaction id.
    #[serde(skip)]
    pub pending_requests: HashMap<(Protocol, u64), DateTime<Utc>>,
    /// Quiescence deadline once the session entered Closing.
    #[serde(skip)]
    pub closing_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(session_id: String, start_at: DateTime<Utc>) -> Self {
        Self {
            session_id,
            start_at,
            last_at: start_at,
            end_at: None,
            state: SessionState::Active,
            procedure: None,
            identifiers: HashSet::new(),
            protocols_seen: HashSet::new(),
            message_count: 0,
            error_count: 0,
            retransmit_count: 0,
            timeout_count: 0,
            bytes_up_total: 0,
            bytes_down_total: 0,
            latencies_ms: Vec::new(),
            location_history: Vec::new(),
            final_outcome: Outcome::Pending,
            cause: None,
            cause_text: None,
            conflict: false,
            messages: VecDeque::new(),
            pending_requests: HashMap::new(),
            closing_at: None,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self.state, SessionState::Active | SessionState::Closing)
    }

    /// Records one message; bounded log overflow returns the flushed entry.
    pub fn push_message(&mut self, msg: &Message, max_messages: usize) -> Option<MessageEntry> {
        self.message_count += 1;
        self.protocols_seen.insert(msg.protocol);
        if msg.captured_at > self.last_at {
            self.last_at = msg.captured_at;
        }
        if msg.outcome == Outcome::Failure {
            self.error_count += 1;
        }
        if let Some(up) = msg.bytes_up {
            self.bytes_up_total += up;
        }
        if let Some(down) = msg.bytes_down {
            self.bytes_down_total += down;
        }
        if let Some(loc) = &msg.location
            && self.location_history.last() != Some(loc)
            && self.location_history.len() < MAX_LOCATION_HISTORY
        {
            self.location_history.push(loc.clone());
        }

        self.messages.push_back(MessageEntry {
            id: msg.id.clone(),
            name: msg.message_name.clone(),
            captured_at: msg.captured_at,
            outcome: msg.outcome,
        });
        if self.messages.len() > max_messages {
            self.messages.pop_front()
        } else {
            None
        }
    }

    /// Message names in capture order, for flow conformance.
    pub fn message_names(&self) -> Vec<String> {
        self.messages.iter().map(|m| m.name.clone()).collect()
    }

    /// Duration from first to last message (or to `end_at` when closed).
    pub fn duration_ms(&self) -> i64 {
        let end = self.end_at.unwrap_or(self.last_at);
        (end - self.start_at).num_milliseconds()
    }

    pub fn latency_summary(&self) -> LatencySummary {
        summarize(&self.latencies_ms)
    }

    /// Outcome string for the CDR row: an evicted session that only ever
    /// waited on unanswered requests reports `Timeout`.
    pub fn cdr_outcome(&self) -> &'static str {
        match self.final_outcome {
            Outcome::Success => "Success",
            Outcome::Failure => "Failure",
            Outcome::Pending if self.timeout_count > 0 => "Timeout",
            Outcome::Pending => "Pending",
            Outcome::Unknown => "Unknown",
        }
    }

    /// Absorbs `other` into `self` (the survivor): union of identifiers,
    /// messages and counters; earliest start; latest activity.
    pub fn absorb(&mut self, other: Session, max_messages: usize) {
        debug_assert!(self.start_at <= other.start_at);

        self.identifiers.extend(other.identifiers);
        self.protocols_seen.extend(other.protocols_seen);
        self.message_count += other.message_count;
        self.error_count += other.error_count;
        self.retransmit_count += other.retransmit_count;
        self.timeout_count += other.timeout_count;
        self.bytes_up_total += other.bytes_up_total;
        self.bytes_down_total += other.bytes_down_total;
        self.latencies_ms.extend(other.latencies_ms);
        if other.last_at > self.last_at {
            self.last_at = other.last_at;
        }

        for loc in other.location_history {
            if self.location_history.last() != Some(&loc)
                && self.location_history.len() < MAX_LOCATION_HISTORY
            {
                self.location_history.push(loc);
            }
        }

        // Interleave the bounded logs by capture time.
        let mut merged: Vec<MessageEntry> = self
            .messages
            .drain(..)
            .chain(other.messages)
            .collect();
        merged.sort_by_key(|m| m.captured_at);
        if merged.len() > max_messages {
            merged.drain(..merged.len() - max_messages);
        }
        self.messages = merged.into();

        for (txn, at) in other.pending_requests {
            // The earlier request wins so latency never shrinks.
            self.pending_requests
                .entry(txn)
                .and_modify(|existing| {
                    if at < *existing {
                        *existing = at;
                    }
                })
                .or_insert(at);
        }

        // A determined outcome beats a pending one; the earlier failure
        // cause stands.
        if matches!(self.final_outcome, Outcome::Pending | Outcome::Unknown)
            && !matches!(other.final_outcome, Outcome::Pending | Outcome::Unknown)
        {
            self.final_outcome = other.final_outcome;
            self.cause = other.cause;
            self.cause_text = other.cause_text;
        }
        if self.procedure.is_none() {
            self.procedure = other.procedure;
        }
        self.conflict |= other.conflict;
    }
}

/// Nearest-rank percentiles over a scratch copy; the raw vector keeps its
/// capture order.
pub fn summarize(latencies: &[f64]) -> LatencySummary {
    if latencies.is_empty() {
        return LatencySummary::default();
    }
    let mut sorted = latencies.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let rank = |p: f64| -> f64 {
        let idx = ((p * sorted.len() as f64).ceil() as usize).max(1) - 1;
        sorted[idx.min(sorted.len() - 1)]
    };

    LatencySummary {
        count: sorted.len(),
        min_ms: sorted[0],
        max_ms: sorted[sorted.len() - 1],
        sum_ms: sorted.iter().sum(),
        p95_ms: rank(0.95),
        p99_ms: rank(0.99),
    }
}
