// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The sharded correlation engine: task-per-shard ownership, message
//! routing, cross-shard claims and the read path.
//!
//! Each shard runs in its own task and owns its state outright; the engine
//! only routes. Cross-shard traffic has its own bounded per-target queue,
//! so claim/answer ordering holds per target and a merge storm cannot
//! crowd out message intake. A claim answer that cannot be delivered
//! within the backpressure budget is folded back into the answering shard
//! instead of being dropped; the merge opportunity is lost, the sessions
//! are not.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::{
    select,
    sync::{
        mpsc::{self, error::SendTimeoutError},
        oneshot,
    },
    task::JoinHandle,
    time::{interval, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    cfg::config::Config,
    correlate::{
        reorder::ReorderBuffer,
        session::Session,
        shard::{ClaimRequest, Shard, ShardEvent, ShardMetrics, SessionUpdate},
    },
    dict::Dictionary,
    proto::{
        ident::{Identifier, hash_identifier, shard_hash},
        message::Message,
    },
    sink::event::EventRecord,
};

const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// KPI-facing view of a closed session.
#[derive(Debug, Clone)]
pub struct ClosedSummary {
    pub session_id: String,
    pub procedure: Option<&'static str>,
    pub outcome: &'static str,
    pub cause: Option<u32>,
}

/// Events the engine pushes to the analytics worker.
#[derive(Debug)]
pub enum KpiEvent {
    Update(SessionUpdate),
    Closed(ClosedSummary),
}

/// Downstream queues every shard writes into.
#[derive(Clone)]
pub struct ShardOutputs {
    pub kpi: mpsc::Sender<KpiEvent>,
    /// Terminated/Evicted sessions bound for the CDR sink.
    pub closed: mpsc::Sender<Box<Session>>,
    /// Correlated per-message records bound for the event sink.
    pub events: mpsc::Sender<EventRecord>,
}

pub enum ShardInput {
    Message(Box<Message>),
    GetSession {
        session_id: String,
        reply: oneshot::Sender<Option<Session>>,
    },
    Lookup {
        identifier: Identifier,
        reply: oneshot::Sender<Option<Session>>,
    },
    Metrics {
        reply: oneshot::Sender<(usize, ShardMetrics)>,
    },
    /// Force-terminate every live session and acknowledge.
    CloseAll {
        reply: oneshot::Sender<()>,
    },
}

/// Cross-shard traffic rides its own bounded per-target queue, sized by
/// `max_pending_claims`, so a merge storm cannot starve message intake
/// and claim/answer ordering is preserved per target.
pub enum ClaimMsg {
    Claim(ClaimRequest),
    Absorb(Vec<Session>),
}

pub struct CorrelationEngine {
    cfg: Arc<Config>,
    inputs: Vec<mpsc::Sender<ShardInput>>,
    handles: Vec<JoinHandle<()>>,
}

impl CorrelationEngine {
    /// Spawns one supervised task per shard.
    pub fn spawn(
        cfg: Arc<Config>,
        dict: Arc<Dictionary>,
        outputs: ShardOutputs,
        cancel: CancellationToken,
    ) -> Self {
        let shard_count = cfg.correlator.shards;
        let mut inputs = Vec::with_capacity(shard_count);
        let mut receivers = Vec::with_capacity(shard_count);
        let mut claim_inputs = Vec::with_capacity(shard_count);
        let mut claim_receivers = Vec::with_capacity(shard_count);
        for _ in 0..shard_count {
            let (tx, rx) = mpsc::channel(cfg.pipeline.queue_capacity);
            inputs.push(tx);
            receivers.push(rx);
            let (ctx, crx) = mpsc::channel(cfg.correlator.max_pending_claims);
            claim_inputs.push(ctx);
            claim_receivers.push(crx);
        }

        let mut handles = Vec::with_capacity(shard_count);
        for (shard_id, (rx, claim_rx)) in receivers
            .into_iter()
            .zip(claim_receivers)
            .enumerate()
        {
            let cfg = Arc::clone(&cfg);
            let dict = Arc::clone(&dict);
            let outputs = outputs.clone();
            let peers = claim_inputs.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                supervise_shard(
                    shard_id, cfg, dict, rx, claim_rx, peers, outputs, cancel,
                )
                .await;
            }));
        }

        Self {
            cfg,
            inputs,
            handles,
        }
    }

    pub fn shard_count(&self) -> usize {
        self.inputs.len()
    }

    fn shard_of(&self, msg: &Message) -> usize {
        let flow_key = format!(
            "{}:{}-{}:{}",
            msg.source.ip, msg.source.port, msg.destination.ip, msg.destination.port
        );
        (shard_hash(
            &self.cfg.correlator.identifier_priority,
            &msg.identifiers,
            &flow_key,
        ) % self.inputs.len() as u64) as usize
    }

    /// Routes a decoded message to its shard, honouring the backpressure
    /// budget. `Ok(false)` means the message was dropped.
    pub async fn submit(&self, msg: Message) -> Result<bool> {
        let shard = self.shard_of(&msg);
        let sent = timeout(
            self.cfg.pipeline.backpressure_timeout,
            self.inputs[shard].send(ShardInput::Message(Box::new(msg))),
        )
        .await;
        match sent {
            Ok(Ok(())) => Ok(true),
            Ok(Err(_)) => Err(anyhow::anyhow!("shard {shard} input closed")),
            Err(_) => Ok(false),
        }
    }

    /// Exact-id lookup across shards.
    pub async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        for input in &self.inputs {
            let (tx, rx) = oneshot::channel();
            input
                .send(ShardInput::GetSession {
                    session_id: session_id.to_string(),
                    reply: tx,
                })
                .await
                .ok()
                .context("shard input closed")?;
            if let Some(found) = rx.await.context("shard reply dropped")? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    /// Identifier lookup; tried first on the shard the identifier hashes
    /// to, then swept across the rest (merge survivors can live anywhere).
    pub async fn lookup_session(
        &self,
        identifier: Identifier,
    ) -> Result<Option<Session>> {
        let primary = (hash_identifier(&identifier) % self.inputs.len() as u64) as usize;
        let order = std::iter::once(primary)
            .chain((0..self.inputs.len()).filter(|&i| i != primary));
        for shard in order {
            let (tx, rx) = oneshot::channel();
            self.inputs[shard]
                .send(ShardInput::Lookup {
                    identifier: identifier.clone(),
                    reply: tx,
                })
                .await
                .ok()
                .context("shard input closed")?;
            if let Some(found) = rx.await.context("shard reply dropped")? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    /// Per-shard live-session counts and counters.
    pub async fn metrics(&self) -> Result<Vec<(usize, ShardMetrics)>> {
        let mut out = Vec::with_capacity(self.inputs.len());
        for input in &self.inputs {
            let (tx, rx) = oneshot::channel();
            input
                .send(ShardInput::Metrics { reply: tx })
                .await
                .ok()
                .context("shard input closed")?;
            out.push(rx.await.context("shard reply dropped")?);
        }
        Ok(out)
    }

    /// Terminates every live session on every shard and waits for the
    /// emissions to be queued downstream.
    pub async fn close_all(&self) -> Result<()> {
        for input in &self.inputs {
            let (tx, rx) = oneshot::channel();
            input
                .send(ShardInput::CloseAll { reply: tx })
                .await
                .ok()
                .context("shard input closed")?;
            rx.await.context("shard reply dropped")?;
        }
        Ok(())
    }

    /// Drops the senders and waits for the shard tasks to drain out.
    pub async fn join(self) {
        drop(self.inputs);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

/// Restarts the shard loop with fresh state when an audit failure kills
/// it; in-memory sessions are lost, persisted CDRs are not.
#[allow(clippy::too_many_arguments)]
async fn supervise_shard(
    shard_id: usize,
    cfg: Arc<Config>,
    dict: Arc<Dictionary>,
    mut rx: mpsc::Receiver<ShardInput>,
    mut claim_rx: mpsc::Receiver<ClaimMsg>,
    peers: Vec<mpsc::Sender<ClaimMsg>>,
    outputs: ShardOutputs,
    cancel: CancellationToken,
) {
    loop {
        let shard = Shard::new(shard_id, Arc::clone(&cfg), Arc::clone(&dict));
        let exit = run_shard(
            shard,
            &cfg,
            &mut rx,
            &mut claim_rx,
            &peers,
            &outputs,
            &cancel,
        )
        .await;
        match exit {
            ShardExit::Shutdown => {
                info!(shard = shard_id, "correlator shard stopped");
                return;
            },
            ShardExit::AuditFailure(reason) => {
                error!(shard = shard_id, %reason, "shard state diverged; restarting");
            },
        }
    }
}

enum ShardExit {
    Shutdown,
    AuditFailure(String),
}

#[allow(clippy::too_many_arguments)]
async fn run_shard(
    mut shard: Shard,
    cfg: &Config,
    rx: &mut mpsc::Receiver<ShardInput>,
    claim_rx: &mut mpsc::Receiver<ClaimMsg>,
    peers: &[mpsc::Sender<ClaimMsg>],
    outputs: &ShardOutputs,
    cancel: &CancellationToken,
) -> ShardExit {
    let backpressure = cfg.pipeline.backpressure_timeout;
    let reorder_window = chrono::Duration::from_std(cfg.correlator.reorder_window)
        .unwrap_or_else(|_| chrono::Duration::milliseconds(500));
    let mut reorder = ReorderBuffer::new(cfg.correlator.reorder_window);
    let mut ticker = interval(TICK_INTERVAL);
    let mut auditor = interval(cfg.pipeline.audit_interval);
    let mut events: Vec<ShardEvent> = Vec::new();
    let mut claims: Vec<ClaimRequest> = Vec::new();
    let mut absorbs: Vec<(usize, Vec<Session>)> = Vec::new();

    loop {
        select! {
            biased;

            _ = cancel.cancelled() => {
                // Drain already-queued input, then close out. Claimed
                // sessions still awaiting delivery fold back in so their
                // CDRs are not lost.
                while let Ok(input) = rx.try_recv() {
                    apply_input(
                        &mut shard, input, &mut reorder,
                        &mut events, &mut claims,
                    );
                }
                while let Ok(claim_msg) = claim_rx.try_recv() {
                    apply_claim(&mut shard, claim_msg, &mut absorbs);
                }
                for (_, sessions) in absorbs.drain(..) {
                    shard.absorb_claimed(sessions);
                }
                for msg in reorder.flush() {
                    shard.correlate(msg, &mut events, &mut claims);
                }
                shard.close_all(Utc::now(), &mut events);
                emit(outputs, &mut events, backpressure, &mut shard.metrics).await;
                return ShardExit::Shutdown;
            },

            maybe = rx.recv() => {
                let Some(input) = maybe else {
                    for (_, sessions) in absorbs.drain(..) {
                        shard.absorb_claimed(sessions);
                    }
                    for msg in reorder.flush() {
                        shard.correlate(msg, &mut events, &mut claims);
                    }
                    shard.close_all(Utc::now(), &mut events);
                    emit(outputs, &mut events, backpressure, &mut shard.metrics).await;
                    return ShardExit::Shutdown;
                };
                apply_input(
                    &mut shard, input, &mut reorder,
                    &mut events, &mut claims,
                );
                publish_claims(&mut claims, peers);
                publish_absorbs(&mut shard, &mut absorbs, peers, backpressure).await;
                emit(outputs, &mut events, backpressure, &mut shard.metrics).await;
            },

            maybe = claim_rx.recv() => {
                if let Some(claim_msg) = maybe {
                    apply_claim(&mut shard, claim_msg, &mut absorbs);
                    publish_absorbs(&mut shard, &mut absorbs, peers, backpressure).await;
                    emit(outputs, &mut events, backpressure, &mut shard.metrics).await;
                }
            },

            _ = ticker.tick() => {
                // A traffic lull must not park reordered messages.
                for msg in reorder.release_up_to(Utc::now() - reorder_window) {
                    shard.correlate(msg, &mut events, &mut claims);
                }
                shard.tick(Utc::now(), &mut events);
                publish_claims(&mut claims, peers);
                emit(outputs, &mut events, backpressure, &mut shard.metrics).await;
            },

            _ = auditor.tick() => {
                if let Err(reason) = shard.audit() {
                    return ShardExit::AuditFailure(reason);
                }
            },
        }
    }
}

fn apply_input(
    shard: &mut Shard,
    input: ShardInput,
    reorder: &mut ReorderBuffer,
    events: &mut Vec<ShardEvent>,
    claims: &mut Vec<ClaimRequest>,
) {
    match input {
        ShardInput::Message(msg) => {
            for released in reorder.push(*msg) {
                shard.correlate(released, events, claims);
            }
        },
        ShardInput::GetSession { session_id, reply } => {
            let _ = reply.send(shard.get_session(&session_id).cloned());
        },
        ShardInput::Lookup { identifier, reply } => {
            let _ = reply.send(shard.lookup_session(&identifier).cloned());
        },
        ShardInput::Metrics { reply } => {
            let _ = reply.send((shard.live_sessions(), shard.metrics));
        },
        ShardInput::CloseAll { reply } => {
            for msg in reorder.flush() {
                shard.correlate(msg, events, claims);
            }
            shard.close_all(Utc::now(), events);
            let _ = reply.send(());
        },
    }
}

fn apply_claim(
    shard: &mut Shard,
    claim_msg: ClaimMsg,
    absorbs: &mut Vec<(usize, Vec<Session>)>,
) {
    match claim_msg {
        ClaimMsg::Claim(claim) => {
            let extracted = shard.handle_claim(&claim.identifiers);
            if !extracted.is_empty() {
                absorbs.push((claim.from_shard, extracted));
            }
        },
        ClaimMsg::Absorb(sessions) => shard.absorb_claimed(sessions),
    }
}

/// Claims are fire-and-forget: a full peer queue just loses the merge
/// opportunity, never data.
fn publish_claims(claims: &mut Vec<ClaimRequest>, peers: &[mpsc::Sender<ClaimMsg>]) {
    for claim in claims.drain(..) {
        let target = claim.target_shard;
        if target >= peers.len() {
            continue;
        }
        if peers[target].try_send(ClaimMsg::Claim(claim)).is_err() {
            warn!(shard = target, "claim dropped: peer queue full");
        }
    }
}

/// Claim answers carry extracted sessions and must not be lost; on
/// delivery failure they are folded back into the answering shard.
async fn publish_absorbs(
    shard: &mut Shard,
    absorbs: &mut Vec<(usize, Vec<Session>)>,
    peers: &[mpsc::Sender<ClaimMsg>],
    backpressure: Duration,
) {
    for (target, sessions) in absorbs.drain(..) {
        if target >= peers.len() {
            shard.absorb_claimed(sessions);
            continue;
        }
        match peers[target]
            .send_timeout(ClaimMsg::Absorb(sessions), backpressure)
            .await
        {
            Ok(()) => {},
            Err(SendTimeoutError::Timeout(returned))
            | Err(SendTimeoutError::Closed(returned)) => {
                warn!(shard = target, "absorb folded back: peer unavailable");
                if let ClaimMsg::Absorb(sessions) = returned {
                    shard.absorb_claimed(sessions);
                }
            },
        }
    }
}

async fn emit(
    outputs: &ShardOutputs,
    events: &mut Vec<ShardEvent>,
    backpressure: Duration,
    metrics: &mut ShardMetrics,
) {
    for event in events.drain(..) {
        match event {
            ShardEvent::Event(record) => {
                if timeout(backpressure, outputs.events.send(record))
                    .await
                    .is_err()
                {
                    metrics.events_dropped += 1;
                    warn!(
                        total = metrics.events_dropped,
                        "event queue full: record dropped"
                    );
                }
            },
            ShardEvent::Update(update) => {
                if timeout(backpressure, outputs.kpi.send(KpiEvent::Update(update)))
                    .await
                    .is_err()
                {
                    metrics.kpi_dropped += 1;
                    warn!(
                        total = metrics.kpi_dropped,
                        "kpi queue full: update dropped"
                    );
                }
            },
            ShardEvent::Closed(session) => {
                let summary = ClosedSummary {
                    session_id: session.session_id.clone(),
                    procedure: session.procedure,
                    outcome: session.cdr_outcome(),
                    cause: session.cause,
                };
                if timeout(backpressure, outputs.kpi.send(KpiEvent::Closed(summary)))
                    .await
                    .is_err()
                {
                    metrics.kpi_dropped += 1;
                    warn!(
                        total = metrics.kpi_dropped,
                        "kpi queue full: close dropped"
                    );
                }
                if timeout(backpressure, outputs.closed.send(session))
                    .await
                    .is_err()
                {
                    metrics.closed_dropped += 1;
                    warn!(
                        total = metrics.closed_dropped,
                        "cdr queue full: session dropped"
                    );
                }
            },
        }
    }
}
