// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Time-bucketed KPI accumulation.
//!
//! One shared store of fixed-width buckets serves every configured
//! window: a snapshot for a window sums the buckets it spans. Buckets
//! older than the longest window are pruned as time advances.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;

use crate::kpi::sketch::{QuantileSketch, SketchSummary};

pub const BUCKET_SECS: i64 = 10;

/// Per-procedure accumulation inside one time bucket.
#[derive(Debug, Default, Clone)]
pub struct ProcedureStats {
    pub total: u64,
    pub success: u64,
    pub failure: u64,
    pub timeout: u64,
    pub pending: u64,
    pub exchange_timeouts: u64,
    pub causes: HashMap<u32, u64>,
    pub latency: QuantileSketch,
}

#[derive(Debug)]
struct Bucket {
    start: DateTime<Utc>,
    per_procedure: HashMap<String, ProcedureStats>,
}

/// The rolling store all windows read from.
#[derive(Debug)]
pub struct KpiStore {
    buckets: VecDeque<Bucket>,
    retention: ChronoDuration,
}

impl KpiStore {
    pub fn new(max_window: std::time::Duration) -> Self {
        let retention = ChronoDuration::from_std(max_window)
            .unwrap_or_else(|_| ChronoDuration::hours(24))
            + ChronoDuration::seconds(BUCKET_SECS);
        Self {
            buckets: VecDeque::new(),
            retention,
        }
    }

    /// Records response latencies observed for a live session.
    pub fn record_latencies(
        &mut self,
        procedure: &str,
        latencies_ms: &[f64],
        at: DateTime<Utc>,
    ) {
        let stats = self.stats_mut(procedure, at);
        for &ms in latencies_ms {
            stats.latency.add(ms);
        }
    }

    /// Records per-exchange request timeouts.
    pub fn record_exchange_timeouts(
        &mut self,
        procedure: &str,
        count: u64,
        at: DateTime<Utc>,
    ) {
        self.stats_mut(procedure, at).exchange_timeouts += count;
    }

    /// Records a closed session under its final outcome.
    pub fn record_close(
        &mut self,
        procedure: &str,
        outcome: &str,
        cause: Option<u32>,
        at: DateTime<Utc>,
    ) {
        let stats = self.stats_mut(procedure, at);
        stats.total += 1;
        match outcome {
            "Success" => stats.success += 1,
            "Failure" => stats.failure += 1,
            "Timeout" => stats.timeout += 1,
            _ => stats.pending += 1,
        }
        if let Some(cause) = cause {
            *stats.causes.entry(cause).or_insert(0) += 1;
        }
    }

    /// Point-in-time aggregation of the buckets a window spans.
    pub fn snapshot(
        &self,
        window: std::time::Duration,
        top_causes: usize,
        now: DateTime<Utc>,
    ) -> HashMap<String, ProcedureSnapshot> {
        let span = ChronoDuration::from_std(window)
            .unwrap_or_else(|_| ChronoDuration::minutes(1));
        let from = now - span;

        let mut merged: HashMap<String, ProcedureStats> = HashMap::new();
        for bucket in self.buckets.iter().filter(|b| b.start >= from) {
            for (procedure, stats) in &bucket.per_procedure {
                let acc = merged.entry(procedure.clone()).or_default();
                acc.total += stats.total;
                acc.success += stats.success;
                acc.failure += stats.failure;
                acc.timeout += stats.timeout;
                acc.pending += stats.pending;
                acc.exchange_timeouts += stats.exchange_timeouts;
                for (&cause, &n) in &stats.causes {
                    *acc.causes.entry(cause).or_insert(0) += n;
                }
                acc.latency.merge(&stats.latency);
            }
        }

        merged
            .into_iter()
            .map(|(procedure, stats)| {
                let mut causes: Vec<(u32, u64)> =
                    stats.causes.iter().map(|(&c, &n)| (c, n)).collect();
                causes.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
                causes.truncate(top_causes);

                (procedure, ProcedureSnapshot {
                    total: stats.total,
                    success: stats.success,
                    failure: stats.failure,
                    timeout: stats.timeout,
                    pending: stats.pending,
                    exchange_timeouts: stats.exchange_timeouts,
                    latency: stats.latency.summary(),
                    top_causes: causes,
                })
            })
            .collect()
    }

    fn stats_mut(&mut self, procedure: &str, at: DateTime<Utc>) -> &mut ProcedureStats {
        let start = bucket_start(at);
        self.prune(at);

        let missing = self
            .buckets
            .back()
            .map(|b| b.start != start)
            .unwrap_or(true);
        if missing {
            // Out-of-order arrivals within retention reuse their bucket.
            if let Some(pos) = self.buckets.iter().position(|b| b.start == start) {
                return self.buckets[pos]
                    .per_procedure
                    .entry(procedure.to_string())
                    .or_default();
            }
            let bucket = Bucket {
                start,
                per_procedure: HashMap::new(),
            };
            let insert_at = self
                .buckets
                .iter()
                .position(|b| b.start > start)
                .unwrap_or(self.buckets.len());
            self.buckets.insert(insert_at, bucket);
            return self.buckets[insert_at]
                .per_procedure
                .entry(procedure.to_string())
                .or_default();
        }

        self.buckets
            .back_mut()
            .map(|b| {
                b.per_procedure
                    .entry(procedure.to_string())
                    .or_default()
            })
            .expect("bucket just checked")
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let horizon = now - self.retention;
        while self
            .buckets
            .front()
            .is_some_and(|b| b.start < horizon)
        {
            self.buckets.pop_front();
        }
    }
}

fn bucket_start(at: DateTime<Utc>) -> DateTime<Utc> {
    let secs = at.timestamp();
    let aligned = secs - secs.rem_euclid(BUCKET_SECS);
    DateTime::from_timestamp(aligned, 0).unwrap_or(at)
}

/// Read-only aggregation of one procedure over one window.
#[derive(Debug, Clone, Serialize)]
pub struct ProcedureSnapshot {
    pub total: u64,
    pub success: u64,
    pub failure: u64,
    pub timeout: u64,
    pub pending: u64,
    pub exchange_timeouts: u64,
    pub latency: SketchSummary,
    pub top_causes: Vec<(u32, u64)>,
}

impl ProcedureSnapshot {
    pub fn failure_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.failure as f64 / self.total as f64
    }
}
