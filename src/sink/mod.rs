// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The sink layer: append-only event, CDR and issue streams.
//!
//! One writer task owns each file family, so writes never interleave.
//! I/O errors are retried with exponential backoff; when the disk stays
//! broken past the retry budget the sink marks itself unhealthy and drops
//! records while continuing to drain its queue, keeping capture live.

pub mod cdr;
pub mod event;
pub mod rotate;

use std::{sync::Arc, time::Duration};

use tokio::{
    select,
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{interval, sleep},
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    cfg::config::SinkConfig,
    correlate::session::Session,
    kpi::engine::Issue,
    sink::{
        cdr::{CdrRow, CdrWriters},
        event::EventRecord,
        rotate::{RotatingWriter, RotationPolicy},
    },
};

const MAX_RETRIES: u32 = 5;
const RETRY_BASE: Duration = Duration::from_millis(100);

/// Push contract towards the database collaborator: at-least-once, keyed
/// by `session_id`.
pub trait CdrConsumer: Send + Sync {
    fn accept(&self, row: &CdrRow);
}

/// Queue endpoints the rest of the pipeline writes into.
pub struct SinkHandles {
    pub events: mpsc::Sender<EventRecord>,
    pub closed: mpsc::Sender<Box<Session>>,
    pub issues: mpsc::Sender<Issue>,
    /// `false` while the sink is failing writes and shedding records.
    pub health: watch::Receiver<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SinkHandles {
    /// Drops this handle's queue endpoints and waits for the writer tasks
    /// to drain and close their files. Every record accepted before the
    /// last sender dropped is on disk when this returns.
    pub async fn join(self) {
        let SinkHandles {
            events,
            closed,
            issues,
            health,
            tasks,
        } = self;
        drop(events);
        drop(closed);
        drop(issues);
        drop(health);
        for task in tasks {
            let _ = task.await;
        }
    }
}

/// Spawns the three writer tasks and returns their queue endpoints.
pub fn spawn(
    cfg: &SinkConfig,
    consumer: Option<Arc<dyn CdrConsumer>>,
    cancel: CancellationToken,
) -> SinkHandles {
    let (event_tx, event_rx) = mpsc::channel(cfg.buffer_records);
    let (closed_tx, closed_rx) = mpsc::channel(cfg.buffer_records);
    let (issue_tx, issue_rx) = mpsc::channel(cfg.buffer_records);
    let (health_tx, health_rx) = watch::channel(true);
    let health_tx = Arc::new(health_tx);

    let event_writer = RotatingWriter::new(
        format!("{}/events", cfg.output_dir),
        "events",
        "ndjson",
        RotationPolicy {
            max_bytes: cfg.event_rotation_size_mb * 1024 * 1024,
            max_age: Some(Duration::from_secs(cfg.event_rotation_hours * 3600)),
            compression: cfg.compression,
        },
        None,
    );
    let issue_writer = RotatingWriter::new(
        format!("{}/issues", cfg.output_dir),
        "issues",
        "ndjson",
        RotationPolicy {
            max_bytes: cfg.event_rotation_size_mb * 1024 * 1024,
            max_age: Some(Duration::from_secs(cfg.event_rotation_hours * 3600)),
            compression: cfg.compression,
        },
        None,
    );
    let cdr_writers = CdrWriters::new(cfg);

    let tasks = vec![
        tokio::spawn(run_event_task(event_rx, event_writer, Arc::clone(&health_tx))),
        tokio::spawn(run_cdr_task(
            closed_rx,
            cdr_writers,
            consumer,
            Arc::clone(&health_tx),
        )),
        tokio::spawn(run_issue_task(issue_rx, issue_writer, cancel)),
    ];

    SinkHandles {
        events: event_tx,
        closed: closed_tx,
        issues: issue_tx,
        health: health_rx,
        tasks,
    }
}

/// Retries one write with exponential backoff; `Ok(false)` means the
/// record was shed after the budget ran out.
async fn write_with_backoff(
    writer: &mut RotatingWriter,
    line: &str,
    health: &watch::Sender<bool>,
) -> bool {
    let mut attempt = 0u32;
    loop {
        match writer.write_line(line).await {
            Ok(()) => {
                let _ = health.send(true);
                return true;
            },
            Err(err) if attempt < MAX_RETRIES => {
                warn!(%err, attempt, "sink write failed; retrying");
                sleep(RETRY_BASE * 2u32.saturating_pow(attempt)).await;
                attempt += 1;
            },
            Err(err) => {
                warn!(%err, "sink write failed; shedding record");
                let _ = health.send(false);
                return false;
            },
        }
    }
}

const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

// Writer tasks drain until every sender is gone; upstream stages drop
// their endpoints as they stop, so shutdown cannot race a final record.
async fn run_event_task(
    mut rx: mpsc::Receiver<EventRecord>,
    mut writer: RotatingWriter,
    health: Arc<watch::Sender<bool>>,
) {
    let mut flusher = interval(FLUSH_INTERVAL);
    loop {
        select! {
            maybe = rx.recv() => {
                let Some(record) = maybe else { break };
                write_event(&mut writer, &record, &health).await;
            },
            _ = flusher.tick() => {
                if let Err(err) = writer.flush().await {
                    warn!(%err, "event sink flush failed");
                }
            },
        }
    }
    if let Err(err) = writer.close().await {
        warn!(%err, "event sink close failed");
    }
    info!("event sink stopped");
}

async fn write_event(
    writer: &mut RotatingWriter,
    record: &EventRecord,
    health: &watch::Sender<bool>,
) {
    match serde_json::to_string(record) {
        Ok(line) => {
            write_with_backoff(writer, &line, health).await;
        },
        Err(err) => warn!(%err, "event record serialisation failed"),
    }
}

async fn run_cdr_task(
    mut rx: mpsc::Receiver<Box<Session>>,
    mut writers: CdrWriters,
    consumer: Option<Arc<dyn CdrConsumer>>,
    health: Arc<watch::Sender<bool>>,
) {
    let mut flusher = interval(FLUSH_INTERVAL);
    loop {
        select! {
            maybe = rx.recv() => {
                let Some(session) = maybe else { break };
                write_cdr(&mut writers, &session, consumer.as_deref(), &health).await;
            },
            _ = flusher.tick() => {
                if let Err(err) = writers.flush().await {
                    warn!(%err, "cdr sink flush failed");
                }
            },
        }
    }
    if let Err(err) = writers.close().await {
        warn!(%err, "cdr sink close failed");
    }
    info!("cdr sink stopped");
}

async fn write_cdr(
    writers: &mut CdrWriters,
    session: &Session,
    consumer: Option<&dyn CdrConsumer>,
    health: &watch::Sender<bool>,
) {
    let mut attempt = 0u32;
    loop {
        match writers.write(session).await {
            Ok(row) => {
                let _ = health.send(true);
                if let Some(consumer) = consumer {
                    consumer.accept(&row);
                }
                return;
            },
            Err(err) if attempt < MAX_RETRIES => {
                warn!(%err, attempt, "cdr write failed; retrying");
                sleep(RETRY_BASE * 2u32.saturating_pow(attempt)).await;
                attempt += 1;
            },
            Err(err) => {
                warn!(%err, session_id = %session.session_id, "cdr shed");
                let _ = health.send(false);
                return;
            },
        }
    }
}

async fn run_issue_task(
    mut rx: mpsc::Receiver<Issue>,
    mut writer: RotatingWriter,
    cancel: CancellationToken,
) {
    loop {
        select! {
            biased;

            _ = cancel.cancelled() => {
                while let Ok(issue) = rx.try_recv() {
                    write_issue(&mut writer, &issue).await;
                }
                break;
            },

            maybe = rx.recv() => {
                let Some(issue) = maybe else { break };
                write_issue(&mut writer, &issue).await;
            },
        }
    }
    if let Err(err) = writer.close().await {
        warn!(%err, "issue sink close failed");
    }
    info!("issue sink stopped");
}

async fn write_issue(writer: &mut RotatingWriter, issue: &Issue) {
    match serde_json::to_string(issue) {
        Ok(line) => {
            if let Err(err) = writer.write_line(&line).await {
                warn!(%err, "issue write failed");
            }
        },
        Err(err) => warn!(%err, "issue serialisation failed"),
    }
}

/// A do-nothing consumer for deployments without the database
/// collaborator attached.
pub struct NullCdrConsumer;

impl CdrConsumer for NullCdrConsumer {
    fn accept(&self, _row: &CdrRow) {}
}

/// Convenience used by tests and the replay harness.
pub fn null_consumer() -> Arc<dyn CdrConsumer> {
    Arc::new(NullCdrConsumer)
}
