// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The analytics worker: consumes session updates, maintains windowed KPI
//! state, grades it against SLA thresholds and emits issue records.
//!
//! Writers never contend with readers for long: one lock guards the
//! bucketed store, every mutation is a short fold, and snapshots copy the
//! aggregation out before any percentile math happens.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::{
    select,
    sync::{Mutex, mpsc},
    time::interval,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    cfg::config::Config,
    correlate::engine::KpiEvent,
    dict::Dictionary,
    kpi::window::{KpiStore, ProcedureSnapshot},
};

const EVAL_INTERVAL: Duration = Duration::from_secs(10);
const ISSUE_FEED_CAPACITY: usize = 1024;
const UNKNOWN_PROCEDURE: &str = "Unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum IssueKind {
    FailureRate,
    P95Latency,
}

/// One SLA breach, enriched with the dictionary's suggested diagnostic.
#[derive(Debug, Clone, Serialize)]
pub struct Issue {
    pub at: DateTime<Utc>,
    pub procedure: String,
    pub kind: IssueKind,
    pub value: f64,
    pub threshold: f64,
    pub window_secs: u64,
    /// Dominant cause inside the window, when one exists.
    pub top_cause: Option<u32>,
    pub reference: Option<&'static str>,
    pub likely_causes: Option<&'static str>,
}

pub struct KpiEngine {
    cfg: Arc<Config>,
    dict: Arc<Dictionary>,
    store: Mutex<KpiStore>,
    issues: Mutex<VecDeque<Issue>>,
    /// Last emission per (procedure, kind), for cooldown.
    cooldowns: Mutex<HashMap<(String, IssueKind), DateTime<Utc>>>,
    issue_sink: mpsc::Sender<Issue>,
}

impl KpiEngine {
    pub fn new(
        cfg: Arc<Config>,
        dict: Arc<Dictionary>,
        issue_sink: mpsc::Sender<Issue>,
    ) -> Self {
        let max_window = cfg
            .kpi
            .windows
            .iter()
            .copied()
            .max()
            .unwrap_or(Duration::from_secs(86_400));
        Self {
            cfg,
            dict,
            store: Mutex::new(KpiStore::new(max_window)),
            issues: Mutex::new(VecDeque::with_capacity(ISSUE_FEED_CAPACITY)),
            cooldowns: Mutex::new(HashMap::new()),
            issue_sink,
        }
    }

    /// Event-consuming worker; runs until cancellation, then drains.
    pub async fn run(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<KpiEvent>,
        cancel: CancellationToken,
    ) {
        let mut evaluator = interval(EVAL_INTERVAL);
        loop {
            select! {
                biased;

                _ = cancel.cancelled() => {
                    while let Ok(event) = rx.try_recv() {
                        self.apply(event).await;
                    }
                    info!("kpi engine stopped");
                    return;
                },

                maybe = rx.recv() => {
                    let Some(event) = maybe else {
                        info!("kpi engine input closed");
                        return;
                    };
                    self.apply(event).await;
                },

                _ = evaluator.tick() => {
                    self.evaluate(Utc::now()).await;
                },
            }
        }
    }

    pub async fn apply(&self, event: KpiEvent) {
        let now = Utc::now();
        let mut store = self.store.lock().await;
        match event {
            KpiEvent::Update(update) => {
                let procedure = update.procedure.unwrap_or(UNKNOWN_PROCEDURE);
                if !update.new_latencies_ms.is_empty() {
                    store.record_latencies(procedure, &update.new_latencies_ms, now);
                }
                if update.timeouts_added > 0 {
                    store.record_exchange_timeouts(
                        procedure,
                        update.timeouts_added,
                        now,
                    );
                }
            },
            KpiEvent::Closed(closed) => {
                let procedure = closed.procedure.unwrap_or(UNKNOWN_PROCEDURE);
                store.record_close(procedure, closed.outcome, closed.cause, now);
            },
        }
    }

    /// Copy-on-read aggregation over `window`.
    pub async fn snapshot(
        &self,
        window: Duration,
        now: DateTime<Utc>,
    ) -> HashMap<String, ProcedureSnapshot> {
        let store = self.store.lock().await;
        store.snapshot(window, self.cfg.kpi.top_causes, now)
    }

    /// Issues emitted since `since`, newest last.
    pub async fn issue_feed(&self, since: DateTime<Utc>) -> Vec<Issue> {
        let issues = self.issues.lock().await;
        issues.iter().filter(|i| i.at > since).cloned().collect()
    }

    /// Grades the shortest window against the configured thresholds.
    pub async fn evaluate(&self, now: DateTime<Utc>) {
        let Some(window) = self.cfg.kpi.windows.iter().copied().min() else {
            return;
        };
        let snapshot = self.snapshot(window, now).await;

        for (procedure, snap) in snapshot {
            if snap.total > 0
                && snap.failure_rate() > self.cfg.kpi.failure_rate_threshold
            {
                self.raise(
                    &procedure,
                    IssueKind::FailureRate,
                    snap.failure_rate(),
                    self.cfg.kpi.failure_rate_threshold,
                    window,
                    &snap,
                    now,
                )
                .await;
            }

            let p95_threshold =
                self.cfg.kpi.p95_latency_threshold.as_secs_f64() * 1_000.0;
            if snap.latency.count > 0 && snap.latency.p95_ms > p95_threshold {
                self.raise(
                    &procedure,
                    IssueKind::P95Latency,
                    snap.latency.p95_ms,
                    p95_threshold,
                    window,
                    &snap,
                    now,
                )
                .await;
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn raise(
        &self,
        procedure: &str,
        kind: IssueKind,
        value: f64,
        threshold: f64,
        window: Duration,
        snap: &ProcedureSnapshot,
        now: DateTime<Utc>,
    ) {
        // One issue per window length per (procedure, kind).
        {
            let mut cooldowns = self.cooldowns.lock().await;
            let key = (procedure.to_string(), kind);
            let window_chrono = chrono::Duration::from_std(window)
                .unwrap_or_else(|_| chrono::Duration::minutes(1));
            if let Some(&last) = cooldowns.get(&key)
                && now - last < window_chrono
            {
                return;
            }
            cooldowns.insert(key, now);
        }

        let diagnosis = self.dict.diagnosis_of(procedure);
        let issue = Issue {
            at: now,
            procedure: procedure.to_string(),
            kind,
            value,
            threshold,
            window_secs: window.as_secs(),
            top_cause: snap.top_causes.first().map(|&(c, _)| c),
            reference: diagnosis.map(|d| d.reference),
            likely_causes: diagnosis.map(|d| d.likely_causes),
        };
        debug!(procedure, ?kind, value, "sla threshold breached");

        {
            let mut issues = self.issues.lock().await;
            if issues.len() == ISSUE_FEED_CAPACITY {
                issues.pop_front();
            }
            issues.push_back(issue.clone());
        }
        // The sink write is best-effort; the in-memory feed is the record.
        let _ = self.issue_sink.try_send(issue);
    }
}
