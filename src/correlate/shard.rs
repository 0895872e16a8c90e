// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! One correlator shard: the serial owner of a slice of the session space.
//!
//! Everything here is synchronous; the driving task calls
//! [`Shard::correlate`] and [`Shard::tick`] and forwards the emitted
//! events downstream. Because a shard is only ever touched by its own
//! task, the index ↔ arena invariants hold without locks, and the audit
//! can verify them between batches.

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::{
    cfg::config::Config,
    correlate::{
        index::IdentifierIndex,
        lru::LruTracker,
        session::{Session, SessionKey, SessionState},
    },
    dict::Dictionary,
    proto::{
        ident::{Identifier, hash_identifier},
        message::{Message, Outcome},
    },
    sink::event::EventRecord,
    utils::generate_session_id,
};

/// What a shard hands downstream after absorbing input.
#[derive(Debug)]
pub enum ShardEvent {
    /// One correlated message, bound for the event sink.
    Event(EventRecord),
    /// Live-session progress, for the KPI engine.
    Update(SessionUpdate),
    /// A session left the shard; CDR emission and final KPI accounting.
    Closed(Box<Session>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    Created,
    Mutated,
}

/// Incremental KPI feed for one correlate/tick step.
#[derive(Debug)]
pub struct SessionUpdate {
    pub kind: UpdateKind,
    pub session_id: String,
    pub procedure: Option<&'static str>,
    /// Latencies newly observed in this step, milliseconds.
    pub new_latencies_ms: Vec<f64>,
    /// Request timeouts newly counted in this step.
    pub timeouts_added: u64,
}

/// A cross-shard merge claim: "if any of these identifiers resolve to a
/// session you own, extract it and send it to me".
#[derive(Debug)]
pub struct ClaimRequest {
    pub target_shard: usize,
    pub from_shard: usize,
    pub identifiers: Vec<Identifier>,
}

/// Plain counters surfaced through the metrics snapshot.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShardMetrics {
    pub sessions_created: u64,
    pub sessions_merged: u64,
    pub evicted_lru: u64,
    pub evicted_idle: u64,
    pub closed_terminal: u64,
    pub orphan_responses: u64,
    pub retransmits: u64,
    pub index_conflicts: u64,
    pub claims_published: u64,
    pub claims_absorbed: u64,
    /// Backpressure drops, counted per downstream queue.
    pub events_dropped: u64,
    pub kpi_dropped: u64,
    pub closed_dropped: u64,
}

pub struct Shard {
    shard_id: usize,
    shard_count: usize,
    cfg: Arc<Config>,
    dict: Arc<Dictionary>,
    sessions: HashMap<SessionKey, Session>,
    index: IdentifierIndex,
    lru: LruTracker,
    next_key: SessionKey,
    pub metrics: ShardMetrics,
}

impl Shard {
    pub fn new(shard_id: usize, cfg: Arc<Config>, dict: Arc<Dictionary>) -> Self {
        let shard_count = cfg.correlator.shards;
        Self {
            shard_id,
            shard_count,
            cfg,
            dict,
            sessions: HashMap::new(),
            index: IdentifierIndex::new(),
            lru: LruTracker::new(),
            next_key: 1,
            metrics: ShardMetrics::default(),
        }
    }

    pub fn live_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// The Correlate(msg) step: resolve or create a session, fold the
    /// message in, progress outcome and close state.
    pub fn correlate(
        &mut self,
        msg: Message,
        events: &mut Vec<ShardEvent>,
        claims: &mut Vec<ClaimRequest>,
    ) {
        // 1. Lookup in identifier priority order, collecting distinct hits.
        let mut hits: Vec<SessionKey> = Vec::new();
        for kind in &self.cfg.correlator.identifier_priority {
            for id in msg.identifiers.iter().filter(|i| i.kind == *kind) {
                if let Some(key) = self.index.lookup(id)
                    && !hits.contains(&key)
                {
                    hits.push(key);
                }
            }
        }

        // 2. Resolve.
        let (key, created) = match hits.len() {
            0 => (self.create_session(msg.captured_at, events), true),
            1 => (hits[0], false),
            _ => (self.merge_sessions(hits), false),
        };

        let max_messages = self.cfg.correlator.max_messages_in_session;
        let response_timeout = self.cfg.response_timeout(msg.protocol);

        let mut update = SessionUpdate {
            kind: if created {
                UpdateKind::Created
            } else {
                UpdateKind::Mutated
            },
            session_id: String::new(),
            procedure: None,
            new_latencies_ms: Vec::new(),
            timeouts_added: 0,
        };

        let mut close_now = false;
        let mut new_identifiers: Vec<Identifier> = Vec::new();
        {
            let Some(session) = self.sessions.get_mut(&key) else {
                warn!(shard = self.shard_id, "resolved session vanished");
                return;
            };
            update.session_id = session.session_id.clone();

            // 3. Fold the message in. Overflowed log entries are already in
            // the event sink, so the returned entry is dropped.
            let _ = session.push_message(&msg, max_messages);
            for id in &msg.identifiers {
                if session.identifiers.insert(id.clone()) {
                    new_identifiers.push(id.clone());
                    if self.index.insert(id, key).is_some() {
                        // Should have been a lookup hit; flag and keep going.
                        session.conflict = true;
                        self.metrics.index_conflicts += 1;
                    }
                }
            }

            // 4. Request/response latency bookkeeping.
            if let Some(txn) = msg.transaction_id {
                let txn_key = (msg.protocol, txn);
                if msg.is_request() {
                    if session
                        .pending_requests
                        .insert(txn_key, msg.captured_at)
                        .is_some()
                    {
                        session.retransmit_count += 1;
                        self.metrics.retransmits += 1;
                    }
                } else if msg.is_response() {
                    match session.pending_requests.remove(&txn_key) {
                        Some(requested_at) => {
                            let elapsed = msg.captured_at - requested_at;
                            let timeout =
                                chrono::Duration::from_std(response_timeout)
                                    .unwrap_or_else(|_| {
                                        chrono::Duration::milliseconds(0)
                                    });
                            if elapsed >= timeout {
                                session.timeout_count += 1;
                                update.timeouts_added += 1;
                            } else {
                                let ms = elapsed.num_microseconds().unwrap_or(0)
                                    as f64
                                    / 1_000.0;
                                session.latencies_ms.push(ms);
                                update.new_latencies_ms.push(ms);
                            }
                        },
                        None => {
                            session.conflict = true;
                            self.metrics.orphan_responses += 1;
                        },
                    }
                }
            }

            // 5. Procedure inference.
            if session.procedure.is_none() {
                session.procedure =
                    self.dict.procedure_for_message(&msg.message_name);
            }
            update.procedure = session.procedure;

            // 6. Outcome progression.
            let template = session
                .procedure
                .and_then(|label| self.dict.expected_flow(label));
            match msg.outcome {
                Outcome::Success => {
                    let terminal = template
                        .map(|t| t.is_terminal(&msg.message_name))
                        .unwrap_or(false);
                    if terminal {
                        session.final_outcome = Outcome::Success;
                        close_now = true;
                    }
                },
                Outcome::Failure => {
                    let mandatory = template
                        .map(|t| t.is_mandatory(&msg.message_name) || t.is_terminal(&msg.message_name))
                        .unwrap_or(true);
                    if mandatory && session.final_outcome != Outcome::Failure {
                        session.final_outcome = Outcome::Failure;
                        session.cause = msg.cause;
                        session.cause_text = msg.cause_text.clone();
                    }
                    if mandatory {
                        close_now = true;
                    }
                },
                _ => {},
            }

            // 7. Close conditions: terminal outcome or an explicit release.
            if close_now || self.dict.is_release(&msg.message_name) {
                if session.state == SessionState::Active {
                    session.state = SessionState::Closing;
                }
                let quiescence =
                    chrono::Duration::from_std(self.cfg.correlator.quiescence)
                        .unwrap_or_else(|_| chrono::Duration::seconds(2));
                session.closing_at = Some(msg.captured_at + quiescence);
            }

            self.lru.touch(key);

            events.push(ShardEvent::Event(EventRecord::from_message(
                &msg,
                &session.session_id,
            )));
        }

        events.push(ShardEvent::Update(update));

        // Cross-shard stubs: identifiers this message introduced may have
        // keyed a provisional session on the shard they route to (the
        // late-IMSI case). Claim those sessions for a serial merge here.
        if self.shard_count > 1 {
            let mut by_target: HashMap<usize, Vec<Identifier>> = HashMap::new();
            for id in new_identifiers {
                let target =
                    (hash_identifier(&id) % self.shard_count as u64) as usize;
                if target != self.shard_id {
                    by_target.entry(target).or_default().push(id);
                }
            }
            for (target_shard, identifiers) in by_target {
                self.metrics.claims_published += 1;
                claims.push(ClaimRequest {
                    target_shard,
                    from_shard: self.shard_id,
                    identifiers,
                });
            }
        }
    }

    /// Time-driven transitions: Closing → Terminated after quiescence,
    /// request timeouts, idle eviction.
    pub fn tick(&mut self, now: DateTime<Utc>, events: &mut Vec<ShardEvent>) {
        let cfg = Arc::clone(&self.cfg);
        let mut to_terminate: Vec<SessionKey> = Vec::new();
        let mut to_evict: Vec<SessionKey> = Vec::new();

        for (&key, session) in &mut self.sessions {
            if !session.is_live() {
                continue;
            }

            // Expire unanswered requests.
            let mut timeouts_added = 0u64;
            session.pending_requests.retain(|(protocol, _), requested_at| {
                let timeout = cfg.response_timeout(*protocol);
                let deadline = *requested_at
                    + chrono::Duration::from_std(timeout)
                        .unwrap_or_else(|_| chrono::Duration::seconds(10));
                if now >= deadline {
                    timeouts_added += 1;
                    false
                } else {
                    true
                }
            });
            if timeouts_added > 0 {
                session.timeout_count += timeouts_added;
                events.push(ShardEvent::Update(SessionUpdate {
                    kind: UpdateKind::Mutated,
                    session_id: session.session_id.clone(),
                    procedure: session.procedure,
                    new_latencies_ms: Vec::new(),
                    timeouts_added,
                }));
            }

            match session.state {
                SessionState::Closing => {
                    if session.closing_at.is_some_and(|at| now >= at) {
                        to_terminate.push(key);
                    }
                },
                SessionState::Active => {
                    // The most patient protocol on the session decides the
                    // idle horizon.
                    let idle = session
                        .protocols_seen
                        .iter()
                        .map(|&p| cfg.idle_timeout(p))
                        .max()
                        .unwrap_or(cfg.correlator.idle_timeout_default);
                    let idle = chrono::Duration::from_std(idle)
                        .unwrap_or_else(|_| chrono::Duration::seconds(30));
                    if now - session.last_at > idle {
                        to_evict.push(key);
                    }
                },
                _ => {},
            }
        }

        for key in to_terminate {
            self.close(key, SessionState::Terminated, None, events);
            self.metrics.closed_terminal += 1;
        }
        for key in to_evict {
            // Idle sessions get the graceful path: Closing now, Terminated
            // once the quiescence window passes.
            if let Some(session) = self.sessions.get_mut(&key) {
                debug!(
                    shard = self.shard_id,
                    session_id = %session.session_id,
                    "idle timeout"
                );
                session.state = SessionState::Closing;
                session.end_at = Some(now);
                session.closing_at = Some(now);
                self.metrics.evicted_idle += 1;
            }
        }
    }

    /// Terminates every live session; shutdown and the replay harness use
    /// this to drain state deterministically.
    pub fn close_all(&mut self, now: DateTime<Utc>, events: &mut Vec<ShardEvent>) {
        let keys: Vec<SessionKey> = self.sessions.keys().copied().collect();
        for key in keys {
            self.close(key, SessionState::Terminated, Some(now), events);
        }
    }

    /// Extracts every live session matching one of `identifiers`, for a
    /// cross-shard claim. The sessions stay live; the claiming shard merges
    /// them.
    pub fn handle_claim(&mut self, identifiers: &[Identifier]) -> Vec<Session> {
        let mut keys: Vec<SessionKey> = Vec::new();
        for id in identifiers {
            if let Some(key) = self.index.lookup(id)
                && !keys.contains(&key)
            {
                keys.push(key);
            }
        }

        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(session) = self.sessions.remove(&key) {
                self.index.remove_session(session.identifiers.iter(), key);
                self.lru.remove(key);
                out.push(session);
            }
        }
        out
    }

    /// Folds sessions extracted from another shard into their local owner.
    pub fn absorb_claimed(&mut self, sessions: Vec<Session>) {
        let max_messages = self.cfg.correlator.max_messages_in_session;
        for incoming in sessions {
            self.metrics.claims_absorbed += 1;

            // Find the local session any of the incoming identifiers maps to.
            let target = incoming
                .identifiers
                .iter()
                .find_map(|id| self.index.lookup(id));

            match target {
                Some(key) => {
                    let Some(mut local) = self.sessions.remove(&key) else {
                        continue;
                    };
                    // Survivor rules still apply: earliest start wins the
                    // identity, the union lands in local storage either way.
                    let merged = if incoming.start_at < local.start_at
                        || (incoming.start_at == local.start_at
                            && incoming.message_count > local.message_count)
                    {
                        let mut survivor = incoming;
                        survivor.absorb(local, max_messages);
                        survivor
                    } else {
                        local.absorb(incoming, max_messages);
                        local
                    };
                    for id in &merged.identifiers {
                        let _ = self.index.insert(id, key);
                    }
                    self.sessions.insert(key, merged);
                    self.lru.touch(key);
                    self.metrics.sessions_merged += 1;
                },
                None => {
                    // No local owner (evicted in between): adopt it as-is.
                    let key = self.next_key;
                    self.next_key += 1;
                    for id in &incoming.identifiers {
                        let _ = self.index.insert(id, key);
                    }
                    self.lru.touch(key);
                    self.sessions.insert(key, incoming);
                },
            }
        }
    }

    /// Looks a session up by exact id, for the query surface.
    pub fn get_session(&self, session_id: &str) -> Option<&Session> {
        self.sessions
            .values()
            .find(|s| s.session_id == session_id)
    }

    /// Resolves one identifier to its owning session id.
    pub fn lookup_session(&self, id: &Identifier) -> Option<&Session> {
        let key = self.index.lookup(id)?;
        self.sessions.get(&key)
    }

    /// Verifies index ↔ arena consistency. An inconsistency here is fatal
    /// for the shard; the supervisor restarts it.
    pub fn audit(&self) -> Result<(), String> {
        for (index_key, &key) in self.index.iter() {
            let Some(session) = self.sessions.get(&key) else {
                return Err(format!(
                    "index entry {index_key:?} points at missing session {key}"
                ));
            };
            if !session
                .identifiers
                .iter()
                .any(|id| id.index_key() == *index_key)
            {
                return Err(format!(
                    "index entry {index_key:?} not present in session {}",
                    session.session_id
                ));
            }
        }
        for (&key, session) in &self.sessions {
            for id in &session.identifiers {
                if self.index.lookup(id) != Some(key) {
                    return Err(format!(
                        "identifier {id} of session {} missing from index",
                        session.session_id
                    ));
                }
            }
        }
        Ok(())
    }

    fn create_session(
        &mut self,
        captured_at: DateTime<Utc>,
        events: &mut Vec<ShardEvent>,
    ) -> SessionKey {
        // LRU pressure: make room before admitting the newcomer.
        while self.sessions.len() >= self.cfg.correlator.max_sessions_per_shard {
            let Some(victim) = self.lru.oldest() else { break };
            self.close(victim, SessionState::Evicted, Some(captured_at), events);
            self.metrics.evicted_lru += 1;
        }

        let key = self.next_key;
        self.next_key += 1;
        let session = Session::new(generate_session_id(), captured_at);
        self.sessions.insert(key, session);
        self.lru.touch(key);
        self.metrics.sessions_created += 1;
        key
    }

    /// Merges the hit set; the survivor is the earliest-started session
    /// (ties: larger message count, then smallest session id). Absorbed
    /// sessions never surface as independent CDRs.
    fn merge_sessions(&mut self, mut hits: Vec<SessionKey>) -> SessionKey {
        let survivor_key = hits
            .iter()
            .copied()
            .filter(|k| self.sessions.contains_key(k))
            .min_by(|&a, &b| {
                let sa = &self.sessions[&a];
                let sb = &self.sessions[&b];
                sa.start_at
                    .cmp(&sb.start_at)
                    .then(sb.message_count.cmp(&sa.message_count))
                    .then(sa.session_id.cmp(&sb.session_id))
            })
            .unwrap_or(hits[0]);
        hits.retain(|&k| k != survivor_key);

        let max_messages = self.cfg.correlator.max_messages_in_session;
        for key in hits {
            let Some(absorbed) = self.sessions.remove(&key) else {
                continue;
            };
            debug!(
                shard = self.shard_id,
                absorbed = %absorbed.session_id,
                "merging sessions"
            );
            self.index.redirect(key, survivor_key);
            self.lru.remove(key);
            if let Some(survivor) = self.sessions.get_mut(&survivor_key) {
                survivor.absorb(absorbed, max_messages);
            }
            self.metrics.sessions_merged += 1;
        }
        survivor_key
    }

    fn close(
        &mut self,
        key: SessionKey,
        state: SessionState,
        end_at: Option<DateTime<Utc>>,
        events: &mut Vec<ShardEvent>,
    ) {
        let Some(mut session) = self.sessions.remove(&key) else {
            return;
        };
        self.index.remove_session(session.identifiers.iter(), key);
        self.lru.remove(key);

        session.state = state;
        if session.end_at.is_none() {
            session.end_at = Some(end_at.unwrap_or(session.last_at));
        }
        // Whatever was still pending at close is a timeout.
        let unanswered = session.pending_requests.len() as u64;
        if state == SessionState::Evicted || state == SessionState::Terminated {
            session.timeout_count += unanswered;
            session.pending_requests.clear();
        }

        events.push(ShardEvent::Closed(Box::new(session)));
    }
}
