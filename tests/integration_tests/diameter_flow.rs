// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use serial_test::serial;
use sigscope_rs::{
    dict::Dictionary,
    pipeline::{query::QueryService, runner::Pipeline},
    proto::{
        ident::{Identifier, IdentifierKind},
        message::{Outcome, Protocol},
    },
};
use tokio::time::sleep;

use super::common::{
    avp_u32, avp_utf8, diameter, fast_config, read_sink_lines, record, scratch_dir,
};

const IMSI: &str = "234150123456789";

/// Counting stand-in for the database collaborator.
#[derive(Default)]
struct CountingConsumer {
    rows: std::sync::atomic::AtomicU64,
    last_session: std::sync::Mutex<String>,
}

impl sigscope_rs::sink::CdrConsumer for CountingConsumer {
    fn accept(&self, row: &sigscope_rs::sink::cdr::CdrRow) {
        self.rows
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        if let Ok(mut last) = self.last_session.lock() {
            *last = row.session_id.clone();
        }
    }
}

fn ulr(hop_by_hop: u32) -> Vec<u8> {
    diameter(316, true, hop_by_hop, &[
        avp_utf8(263, "mme.op;1;1"),
        avp_utf8(1, IMSI),
        avp_utf8(264, "mme.op"),
        avp_utf8(296, "op"),
        avp_utf8(283, "op"),
    ])
}

fn ula(hop_by_hop: u32, result_code: u32) -> Vec<u8> {
    diameter(316, false, hop_by_hop, &[
        avp_utf8(263, "mme.op;1;1"),
        avp_u32(268, result_code),
    ])
}

#[tokio::test]
#[serial]
async fn test_ulr_ula_success_end_to_end() {
    let dir = scratch_dir("ulr-success");
    let cfg = Arc::new(fast_config(&dir));
    let consumer = Arc::new(CountingConsumer::default());
    let pipeline = Pipeline::spawn(
        Arc::clone(&cfg),
        Arc::new(Dictionary::new()),
        Some(Arc::clone(&consumer) as Arc<dyn sigscope_rs::sink::CdrConsumer>),
    )
    .expect("pipeline boots");
    let source = pipeline.register_source("s6a");

    let t0 = Utc::now();
    assert!(
        source
            .offer(record(ulr(0x1111), t0, [10, 0, 0, 1], 3868, [10, 0, 0, 2], 3868))
            .await
    );
    assert!(
        source
            .offer(record(
                ula(0x1111, 2001),
                t0 + chrono::Duration::milliseconds(120),
                [10, 0, 0, 2],
                3868,
                [10, 0, 0, 1],
                3868,
            ))
            .await
    );

    // Reorder window + shard tick need a moment.
    sleep(Duration::from_millis(600)).await;

    // Nothing was shed on the way in.
    assert_eq!(source.dropped(), 0);
    assert_eq!(pipeline.source_drops(), vec![("s6a".to_string(), 0)]);

    let session = pipeline
        .engine
        .lookup_session(Identifier::new(IdentifierKind::Imsi, IMSI))
        .await
        .expect("engine reachable")
        .expect("session correlated and still in quiescence");

    assert_eq!(session.procedure, Some("S6a_UpdateLocation"));
    assert_eq!(session.final_outcome, Outcome::Success);
    assert_eq!(session.message_count, 2);
    assert!(session.protocols_seen.contains(&Protocol::Diameter));
    assert_eq!(session.latencies_ms.len(), 1);
    assert!(
        (session.latencies_ms[0] - 120.0).abs() < 1.0,
        "answer landed 120ms after the request: {:?}",
        session.latencies_ms
    );
    assert!(
        session
            .identifiers
            .contains(&Identifier::new(IdentifierKind::Imsi, IMSI))
    );

    // lookup_session right after a correlate returns the owning session.
    let by_sid = pipeline
        .engine
        .lookup_session(Identifier::new(
            IdentifierKind::DiameterSessionId,
            "mme.op;1;1",
        ))
        .await
        .expect("engine reachable")
        .expect("session-id indexed");
    assert_eq!(by_sid.session_id, session.session_id);

    // The query surface resolves the same state for the API collaborator.
    let query = QueryService::new(
        Arc::clone(&pipeline.engine),
        Arc::clone(&pipeline.kpi),
        &cfg.sink.output_dir,
    );
    let via_query = query
        .get_session(&session.session_id)
        .await
        .expect("session queryable by id");
    assert_eq!(via_query.message_count, 2);
    let via_lookup = query
        .lookup_session(IdentifierKind::Imsi, IMSI)
        .await
        .expect("session queryable by identifier");
    assert_eq!(via_lookup.session_id, session.session_id);

    pipeline.shutdown().await.expect("clean shutdown");

    // Timelines come from the persistent event store, so they outlive the
    // live session state.
    let timeline = query
        .subscriber_timeline(
            IMSI,
            t0 - chrono::Duration::minutes(1),
            Utc::now() + chrono::Duration::minutes(1),
        )
        .await
        .expect("timeline served from sink files");
    assert_eq!(timeline.len(), 1);
    assert_eq!(timeline[0].message_count, 2);
    assert!(timeline[0].protocols.contains(&"diameter".to_string()));

    // Shutdown force-closes the session; its CDR and both events are on
    // disk before shutdown returns.
    let events = read_sink_lines(&dir.join("events"));
    assert_eq!(events.len(), 2, "one event line per decoded message");

    let cdrs = read_sink_lines(&dir.join("cdr"));
    let rows: Vec<&String> = cdrs.iter().filter(|l| l.starts_with("s-")).collect();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].contains(IMSI));
    assert!(rows[0].contains("S6a_UpdateLocation"));
    assert!(rows[0].contains("|Success|"));

    // The database collaborator received the same row, keyed by id.
    assert_eq!(
        consumer.rows.load(std::sync::atomic::Ordering::Relaxed),
        1
    );
    assert_eq!(
        consumer
            .last_session
            .lock()
            .expect("consumer mutex")
            .as_str(),
        session.session_id
    );
}

#[tokio::test]
#[serial]
async fn test_ulr_failure_raises_kpi_issue() {
    let mut dir = scratch_dir("ulr-failure");
    let mut cfg = fast_config(&dir);
    // Close fast so the KPI close-accounting runs inside the test.
    cfg.correlator.quiescence = Duration::from_millis(100);
    let cfg = Arc::new(cfg);

    let pipeline =
        Pipeline::spawn(Arc::clone(&cfg), Arc::new(Dictionary::new()), None)
            .expect("pipeline boots");
    let source = pipeline.register_source("s6a");

    let t0 = Utc::now();
    source
        .offer(record(ulr(0x2222), t0, [10, 0, 0, 1], 3868, [10, 0, 0, 2], 3868))
        .await;
    source
        .offer(record(
            ula(0x2222, 5001),
            t0 + chrono::Duration::milliseconds(80),
            [10, 0, 0, 2],
            3868,
            [10, 0, 0, 1],
            3868,
        ))
        .await;

    // Let the session close and reach the analytics engine.
    sleep(Duration::from_millis(900)).await;

    let snapshot = pipeline
        .kpi
        .snapshot(Duration::from_secs(60), Utc::now())
        .await;
    let proc = snapshot
        .get("S6a_UpdateLocation")
        .expect("closed session accounted");
    assert_eq!(proc.total, 1);
    assert_eq!(proc.failure, 1);
    assert_eq!(proc.top_causes.first(), Some(&(5001, 1)));

    // A 100% failure rate breaches the 5% threshold.
    pipeline.kpi.evaluate(Utc::now()).await;
    let issues = pipeline
        .kpi
        .issue_feed(t0 - chrono::Duration::minutes(1))
        .await;
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].procedure, "S6a_UpdateLocation");
    assert_eq!(issues[0].top_cause, Some(5001));
    assert!(issues[0].reference.is_some(), "diagnosis attached");

    pipeline.shutdown().await.expect("clean shutdown");
    dir.push("issues");
    let issue_lines = read_sink_lines(&dir);
    assert_eq!(issue_lines.len(), 1, "issue record persisted");
}
