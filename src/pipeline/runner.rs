// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Pipeline assembly: intake → decoder pool → correlator shards →
//! {analytics, sinks}, all joined by bounded queues.
//!
//! Decoding is pure and embarrassingly parallel, so the decode stage is
//! a pool of identical workers pulling from one shared queue. Everything
//! stateful lives behind it in the shard tasks.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use anyhow::Result;
use dashmap::DashMap;
use tokio::{sync::{Mutex, mpsc}, task::JoinHandle, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    cfg::config::Config,
    correlate::engine::{CorrelationEngine, KpiEvent, ShardOutputs},
    dict::Dictionary,
    kpi::engine::KpiEngine,
    proto::{
        ident::{Identifier, IdentifierKind},
        registry::DecoderRegistry,
    },
    sink::{self, CdrConsumer, SinkHandles, event::EventRecord},
    pipeline::intake::{CaptureRecord, SourceHandle},
};

/// Cross-stage counters, all monotone.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    pub received: AtomicU64,
    pub decoded: AtomicU64,
    pub undecoded: AtomicU64,
    pub malformed: AtomicU64,
    pub dropped_backpressure: AtomicU64,
}

impl PipelineMetrics {
    pub fn snapshot(&self) -> PipelineSnapshot {
        PipelineSnapshot {
            received: self.received.load(Ordering::Relaxed),
            decoded: self.decoded.load(Ordering::Relaxed),
            undecoded: self.undecoded.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            dropped_backpressure: self.dropped_backpressure.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineSnapshot {
    pub received: u64,
    pub decoded: u64,
    pub undecoded: u64,
    pub malformed: u64,
    pub dropped_backpressure: u64,
}

/// The assembled, running pipeline.
pub struct Pipeline {
    cfg: Arc<Config>,
    cancel: CancellationToken,
    intake_tx: mpsc::Sender<CaptureRecord>,
    /// Per-source intake drop counters, keyed by source name.
    source_drops: Arc<DashMap<String, Arc<AtomicU64>>>,
    pub engine: Arc<CorrelationEngine>,
    pub kpi: Arc<KpiEngine>,
    pub metrics: Arc<PipelineMetrics>,
    sink: Option<SinkHandles>,
    decode_workers: Vec<JoinHandle<()>>,
    kpi_worker: JoinHandle<()>,
}

impl Pipeline {
    /// Boots every stage. The returned handle owns the worker tasks.
    pub fn spawn(
        cfg: Arc<Config>,
        dict: Arc<Dictionary>,
        consumer: Option<Arc<dyn CdrConsumer>>,
    ) -> Result<Self> {
        let cancel = CancellationToken::new();
        let metrics = Arc::new(PipelineMetrics::default());

        let sink = sink::spawn(&cfg.sink, consumer, cancel.clone());

        let (kpi_tx, kpi_rx) = mpsc::channel::<KpiEvent>(cfg.pipeline.queue_capacity);
        let kpi = Arc::new(KpiEngine::new(
            Arc::clone(&cfg),
            Arc::clone(&dict),
            sink.issues.clone(),
        ));
        let kpi_worker =
            tokio::spawn(Arc::clone(&kpi).run(kpi_rx, cancel.clone()));

        let outputs = ShardOutputs {
            kpi: kpi_tx,
            closed: sink.closed.clone(),
            events: sink.events.clone(),
        };
        let engine = Arc::new(CorrelationEngine::spawn(
            Arc::clone(&cfg),
            Arc::clone(&dict),
            outputs,
            cancel.clone(),
        ));

        let registry = Arc::new(DecoderRegistry::with_defaults(
            Arc::clone(&dict),
            cfg.sink.retain_raw,
        ));

        let (intake_tx, intake_rx) =
            mpsc::channel::<CaptureRecord>(cfg.pipeline.queue_capacity);
        let intake_rx = Arc::new(Mutex::new(intake_rx));

        let mut decode_workers = Vec::with_capacity(cfg.pipeline.decode_workers);
        for worker in 0..cfg.pipeline.decode_workers {
            decode_workers.push(tokio::spawn(decode_worker(
                worker,
                Arc::clone(&cfg),
                Arc::clone(&registry),
                Arc::clone(&intake_rx),
                Arc::clone(&engine),
                sink.events.clone(),
                Arc::clone(&metrics),
                cancel.clone(),
            )));
        }

        info!(
            shards = engine.shard_count(),
            decoders = registry.decoder_count(),
            workers = cfg.pipeline.decode_workers,
            "pipeline started"
        );

        Ok(Self {
            cfg,
            cancel,
            intake_tx,
            source_drops: Arc::new(DashMap::new()),
            engine,
            kpi,
            metrics,
            sink: Some(sink),
            decode_workers,
            kpi_worker,
        })
    }

    /// Registers a capture source and returns its intake handle. Each
    /// source keeps its own drop counter so operators can tell which
    /// capture interface is being shed.
    pub fn register_source(&self, name: &str) -> SourceHandle {
        let dropped = Arc::clone(
            &self
                .source_drops
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(AtomicU64::new(0))),
        );
        SourceHandle::new(
            name,
            self.intake_tx.clone(),
            self.cfg.pipeline.backpressure_timeout,
            dropped,
        )
    }

    /// Intake drops per registered source.
    pub fn source_drops(&self) -> Vec<(String, u64)> {
        self.source_drops
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect()
    }

    /// Sink health as last reported by the writer tasks.
    pub fn sink_healthy(&self) -> bool {
        self.sink
            .as_ref()
            .map(|s| *s.health.borrow())
            .unwrap_or(false)
    }

    /// Graceful shutdown: stop intake, drain every stage up to the grace
    /// deadline, flush sinks.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("pipeline shutting down");
        self.cancel.cancel();

        let grace = self.cfg.pipeline.shutdown_grace;
        for worker in self.decode_workers.drain(..) {
            if timeout(grace, worker).await.is_err() {
                warn!("decode worker exceeded shutdown grace");
            }
        }

        // Dropping the engine's senders lets shard tasks drain and exit.
        match Arc::try_unwrap(self.engine) {
            Ok(engine) => {
                if timeout(grace, engine.join()).await.is_err() {
                    warn!("correlator exceeded shutdown grace");
                }
            },
            Err(_) => warn!("engine still referenced at shutdown"),
        }

        if timeout(grace, self.kpi_worker).await.is_err() {
            warn!("kpi worker exceeded shutdown grace");
        }

        if let Some(sink) = self.sink.take()
            && timeout(grace, sink.join()).await.is_err()
        {
            warn!("sink exceeded shutdown grace");
        }
        info!("pipeline stopped");
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
async fn decode_worker(
    worker: usize,
    cfg: Arc<Config>,
    registry: Arc<DecoderRegistry>,
    intake: Arc<Mutex<mpsc::Receiver<CaptureRecord>>>,
    engine: Arc<CorrelationEngine>,
    events: mpsc::Sender<EventRecord>,
    metrics: Arc<PipelineMetrics>,
    cancel: CancellationToken,
) {
    loop {
        let record = {
            let mut rx = intake.lock().await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    // Keep draining whatever intake already accepted.
                    match rx.try_recv() {
                        Ok(record) => Some(record),
                        Err(_) => None,
                    }
                },
                maybe = rx.recv() => maybe,
            }
        };
        let Some(record) = record else {
            info!(worker, "decode worker stopped");
            return;
        };

        metrics.received.fetch_add(1, Ordering::Relaxed);
        let link = record.link_meta();

        match registry.dispatch(&record.bytes, &link) {
            Ok(mut msg) => {
                metrics.decoded.fetch_add(1, Ordering::Relaxed);
                if msg.protocol == crate::proto::message::Protocol::Other {
                    metrics.undecoded.fetch_add(1, Ordering::Relaxed);
                }
                if msg.identifiers.is_empty() {
                    // Fallback transport key so bearer-coupled messages
                    // still correlate until a subscriber id shows up.
                    msg.identifiers.push(Identifier::new(
                        IdentifierKind::Flow,
                        link.flow_key(),
                    ));
                }
                match engine.submit(msg).await {
                    Ok(true) => {},
                    Ok(false) => {
                        metrics
                            .dropped_backpressure
                            .fetch_add(1, Ordering::Relaxed);
                    },
                    Err(err) => {
                        warn!(%err, "correlator unavailable");
                        return;
                    },
                }
            },
            Err(failure) => {
                // Malformed input is a metric and an event, never a stop.
                metrics.malformed.fetch_add(1, Ordering::Relaxed);
                let reason = format!("{}", failure.error);
                let record = EventRecord::undecodable(
                    link.captured_at,
                    failure.protocol,
                    &reason,
                    Some(&record.bytes),
                );
                if events.try_send(record).is_err() {
                    metrics
                        .dropped_backpressure
                        .fetch_add(1, Ordering::Relaxed);
                }
            },
        }
    }
}
