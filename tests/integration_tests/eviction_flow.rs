// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use serial_test::serial;
use sigscope_rs::{
    dict::Dictionary,
    pipeline::runner::Pipeline,
    proto::ident::{Identifier, IdentifierKind},
};
use tokio::time::sleep;

use super::common::{avp_utf8, diameter, fast_config, read_sink_lines, record, scratch_dir};

fn ulr_for(imsi: &str, hop_by_hop: u32) -> Vec<u8> {
    diameter(316, true, hop_by_hop, &[
        avp_utf8(263, &format!("mme.op;{hop_by_hop};1")),
        avp_utf8(1, imsi),
    ])
}

/// An unanswered request runs through the full decay: per-exchange
/// timeout, idle close, a CDR graded `Timeout`.
#[tokio::test]
#[serial]
async fn test_unanswered_request_becomes_timeout_cdr() {
    let dir = scratch_dir("timeout");
    let mut cfg = fast_config(&dir);
    cfg.correlator.response_timeout_default = Duration::from_millis(200);
    cfg.correlator.idle_timeout_default = Duration::from_millis(400);
    cfg.correlator.quiescence = Duration::from_millis(100);
    let cfg = Arc::new(cfg);

    let pipeline =
        Pipeline::spawn(Arc::clone(&cfg), Arc::new(Dictionary::new()), None)
            .expect("pipeline boots");
    let source = pipeline.register_source("s6a");

    source
        .offer(record(
            ulr_for("234150123456789", 0x0F0F),
            Utc::now(),
            [10, 0, 0, 1],
            3868,
            [10, 0, 0, 2],
            3868,
        ))
        .await;

    // Enough wall time for: reorder release, response timeout, idle close,
    // quiescence, emission.
    sleep(Duration::from_millis(1_500)).await;

    let gone = pipeline
        .engine
        .lookup_session(Identifier::new(
            IdentifierKind::Imsi,
            "234150123456789",
        ))
        .await
        .expect("engine reachable");
    assert!(gone.is_none(), "idle session left live memory");

    pipeline.shutdown().await.expect("clean shutdown");

    let cdrs = read_sink_lines(&dir.join("cdr"));
    let rows: Vec<&String> = cdrs.iter().filter(|l| l.starts_with("s-")).collect();
    assert_eq!(rows.len(), 1);
    assert!(
        rows[0].contains("|Timeout|"),
        "unanswered request grades the CDR as Timeout: {}",
        rows[0]
    );
    assert!(rows[0].contains("|Terminated|"));
}

/// LRU pressure: with four slots and eight subscribers, the four oldest
/// sessions leave as `Evicted` CDRs and four stay live.
#[tokio::test]
#[serial]
async fn test_lru_pressure_evicts_in_order() {
    let dir = scratch_dir("lru");
    let mut cfg = fast_config(&dir);
    cfg.correlator.max_sessions_per_shard = 4;
    let cfg = Arc::new(cfg);

    let pipeline =
        Pipeline::spawn(Arc::clone(&cfg), Arc::new(Dictionary::new()), None)
            .expect("pipeline boots");
    let source = pipeline.register_source("s6a");

    let t0 = Utc::now();
    for i in 0..8u32 {
        source
            .offer(record(
                ulr_for(&format!("2341500000000{i:02}"), 0x1000 + i),
                t0 + chrono::Duration::milliseconds(i64::from(i) * 120),
                [10, 0, 0, 1],
                3868,
                [10, 0, 0, 2],
                3868,
            ))
            .await;
        // Keep arrival order stable across the decode pool.
        sleep(Duration::from_millis(30)).await;
    }

    sleep(Duration::from_millis(600)).await;

    let metrics = pipeline.engine.metrics().await.expect("metrics");
    let live: usize = metrics.iter().map(|(live, _)| live).sum();
    assert_eq!(live, 4, "shard holds exactly its configured capacity");

    // Every emission fit its downstream queue; the drop counters stay
    // untouched in this scenario.
    let dropped: u64 = metrics
        .iter()
        .map(|(_, m)| m.events_dropped + m.kpi_dropped + m.closed_dropped)
        .sum();
    assert_eq!(dropped, 0);

    // The four earliest subscribers were evicted, the four latest are live.
    for i in 0..4u32 {
        let hit = pipeline
            .engine
            .lookup_session(Identifier::new(
                IdentifierKind::Imsi,
                &format!("2341500000000{i:02}"),
            ))
            .await
            .expect("engine reachable");
        assert!(hit.is_none(), "subscriber {i} should have been evicted");
    }
    for i in 4..8u32 {
        let hit = pipeline
            .engine
            .lookup_session(Identifier::new(
                IdentifierKind::Imsi,
                &format!("2341500000000{i:02}"),
            ))
            .await
            .expect("engine reachable");
        assert!(hit.is_some(), "subscriber {i} should be live");
    }

    pipeline.shutdown().await.expect("clean shutdown");

    let cdrs = read_sink_lines(&dir.join("cdr"));
    let evicted = cdrs.iter().filter(|l| l.contains("|Evicted|")).count();
    let terminated = cdrs.iter().filter(|l| l.contains("|Terminated|")).count();
    assert_eq!(evicted, 4, "four CDRs graded Evicted");
    assert_eq!(terminated, 4, "shutdown closed the remaining four");
}
