// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The read-only query surface exposed to the API collaborator.
//!
//! Live state comes from the correlator shards and the KPI engine;
//! subscriber timelines come from the sink's persistent event store, so
//! long-gone sessions stay answerable. Only structured errors leave this
//! layer.

use std::{collections::HashMap, path::Path, time::Duration};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::{fs, io::AsyncBufReadExt};
use tracing::debug;

use crate::{
    correlate::{engine::CorrelationEngine, session::Session},
    kpi::{engine::Issue, engine::KpiEngine, window::ProcedureSnapshot},
    proto::ident::{Identifier, IdentifierKind},
    sink::event::EventRecord,
};

/// Structured error codes; nothing internal leaks past this enum.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("not_found")]
    NotFound,
    #[error("unavailable")]
    Unavailable,
    #[error("bad_request: {0}")]
    BadRequest(String),
}

/// Digest of one session reconstructed from the event store.
#[derive(Debug, Clone, Serialize)]
pub struct TimelineEntry {
    pub session_id: String,
    pub first_at: DateTime<Utc>,
    pub last_at: DateTime<Utc>,
    pub message_count: u64,
    pub protocols: Vec<String>,
    pub outcomes: HashMap<String, u64>,
}

pub struct QueryService {
    engine: Arc<CorrelationEngine>,
    kpi: Arc<KpiEngine>,
    event_dir: String,
}

impl QueryService {
    pub fn new(engine: Arc<CorrelationEngine>, kpi: Arc<KpiEngine>, output_dir: &str) -> Self {
        Self {
            engine,
            kpi,
            event_dir: format!("{output_dir}/events"),
        }
    }

    /// Live session by exact id.
    pub async fn get_session(&self, session_id: &str) -> Result<Session, QueryError> {
        self.engine
            .get_session(session_id)
            .await
            .map_err(|_| QueryError::Unavailable)?
            .ok_or(QueryError::NotFound)
    }

    /// Live session owning `(kind, value)`.
    pub async fn lookup_session(
        &self,
        kind: IdentifierKind,
        value: &str,
    ) -> Result<Session, QueryError> {
        if value.is_empty() {
            return Err(QueryError::BadRequest("empty identifier value".into()));
        }
        self.engine
            .lookup_session(Identifier::new(kind, value))
            .await
            .map_err(|_| QueryError::Unavailable)?
            .ok_or(QueryError::NotFound)
    }

    /// Point-in-time KPI aggregation over `window`.
    pub async fn kpi_snapshot(
        &self,
        window: Duration,
    ) -> Result<HashMap<String, ProcedureSnapshot>, QueryError> {
        Ok(self.kpi.snapshot(window, Utc::now()).await)
    }

    /// Issues raised after `since`.
    pub async fn issue_feed(&self, since: DateTime<Utc>) -> Result<Vec<Issue>, QueryError> {
        Ok(self.kpi.issue_feed(since).await)
    }

    /// Sessions a subscriber participated in, served from the persistent
    /// event store rather than live memory.
    pub async fn subscriber_timeline(
        &self,
        imsi: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TimelineEntry>, QueryError> {
        if imsi.is_empty() || !imsi.chars().all(|c| c.is_ascii_digit()) {
            return Err(QueryError::BadRequest("imsi must be digits".into()));
        }
        if from > to {
            return Err(QueryError::BadRequest("from after to".into()));
        }

        let mut per_session: HashMap<String, TimelineEntry> = HashMap::new();

        let mut dir = match fs::read_dir(&self.event_dir).await {
            Ok(dir) => dir,
            // No events written yet is an empty timeline, not an error.
            Err(_) => return Ok(Vec::new()),
        };
        while let Ok(Some(entry)) = dir.next_entry().await {
            let path = entry.path();
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default();
            // Plain files only; compressed archives belong to cold storage.
            if !name.contains("events") || name.ends_with(".gz") {
                continue;
            }
            scan_event_file(&path, imsi, from, to, &mut per_session).await;
        }

        let mut out: Vec<TimelineEntry> = per_session.into_values().collect();
        out.sort_by_key(|e| e.first_at);
        Ok(out)
    }
}

async fn scan_event_file(
    path: &Path,
    imsi: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    per_session: &mut HashMap<String, TimelineEntry>,
) {
    let Ok(file) = fs::File::open(path).await else {
        return;
    };
    let mut lines = tokio::io::BufReader::new(file).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let Ok(record) = serde_json::from_str::<EventRecord>(&line) else {
            debug!(path = %path.display(), "skipping unparseable event line");
            continue;
        };
        if record.ts < from || record.ts > to || record.session_id.is_empty() {
            continue;
        }
        // A session joins the timeline on its first IMSI hit; after that,
        // all of its records extend the entry.
        let hit = record
            .ids
            .iter()
            .any(|id| id.kind == IdentifierKind::Imsi && id.value == imsi);
        if !hit && !per_session.contains_key(&record.session_id) {
            continue;
        }

        let entry = per_session
            .entry(record.session_id.clone())
            .or_insert_with(|| TimelineEntry {
                session_id: record.session_id.clone(),
                first_at: record.ts,
                last_at: record.ts,
                message_count: 0,
                protocols: Vec::new(),
                outcomes: HashMap::new(),
            });
        entry.first_at = entry.first_at.min(record.ts);
        entry.last_at = entry.last_at.max(record.ts);
        entry.message_count += 1;
        let token = record.protocol.token().to_string();
        if !entry.protocols.contains(&token) {
            entry.protocols.push(token);
        }
        *entry
            .outcomes
            .entry(format!("{:?}", record.outcome))
            .or_insert(0) += 1;
    }
}
