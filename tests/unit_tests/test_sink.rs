use std::{collections::HashSet, fs, path::PathBuf};

use anyhow::Result;
use serial_test::serial;
use sigscope_rs::{
    cfg::enums::Compression,
    correlate::session::{Session, SessionState},
    proto::{
        ident::{Identifier, IdentifierKind},
        message::Protocol,
    },
    sink::{
        cdr::{CDR_HEADER, CdrRow, primary_protocol},
        event::EventRecord,
        rotate::{RotatingWriter, RotationPolicy},
    },
};

use super::at;

fn scratch_dir(name: &str) -> PathBuf {
    let dir = PathBuf::from(format!("target/test-sink/{name}-{}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    dir
}

fn policy(max_bytes: u64) -> RotationPolicy {
    RotationPolicy {
        max_bytes,
        max_age: None,
        compression: Compression::None,
    }
}

#[tokio::test]
#[serial]
async fn test_writer_appends_and_publishes_on_close() -> Result<()> {
    let dir = scratch_dir("events");
    let mut writer =
        RotatingWriter::new(dir.clone(), "events", "ndjson", policy(1024 * 1024), None);

    writer.write_line(r#"{"a":1}"#).await?;
    writer.write_line(r#"{"b":2}"#).await?;
    writer.close().await?;

    let names: Vec<String> = fs::read_dir(&dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names.len(), 1);
    assert!(
        names[0].starts_with("events_") && names[0].ends_with(".ndjson"),
        "published under the final name: {names:?}"
    );
    assert!(
        !names[0].contains(".part"),
        "no temp artefacts after close"
    );

    let content = fs::read_to_string(dir.join(&names[0]))?;
    assert_eq!(content, "{\"a\":1}\n{\"b\":2}\n");
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_writer_rotates_on_size() -> Result<()> {
    let dir = scratch_dir("rotation");
    let mut writer = RotatingWriter::new(dir.clone(), "cdr", "cdr", policy(64), None);

    for i in 0..8 {
        writer
            .write_line(&format!("row-{i}-{}", "x".repeat(24)))
            .await?;
    }
    writer.close().await?;

    let published = fs::read_dir(&dir)?
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_name().to_string_lossy().starts_with("cdr_")
        })
        .count();
    assert!(published >= 2, "64-byte cap must force rotations");
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_writer_repeats_header_per_file() -> Result<()> {
    let dir = scratch_dir("header");
    let mut writer = RotatingWriter::new(
        dir.clone(),
        "diameter",
        "cdr",
        policy(96),
        Some(CDR_HEADER.to_string()),
    );
    for i in 0..4 {
        writer
            .write_line(&format!("row-{i}-{}", "y".repeat(64)))
            .await?;
    }
    writer.close().await?;

    for entry in fs::read_dir(&dir)? {
        let entry = entry?;
        let content = fs::read_to_string(entry.path())?;
        assert!(
            content.starts_with(CDR_HEADER),
            "every published file opens with the header"
        );
    }
    Ok(())
}

fn sample_session() -> Session {
    let mut session = Session::new("s-00deadbeef000000".to_string(), at(0));
    session.identifiers.insert(Identifier::new(IdentifierKind::Imsi, "234150123456789"));
    session
        .identifiers
        .insert(Identifier::new(IdentifierKind::Msisdn, "447700900123"));
    session.protocols_seen.insert(Protocol::Diameter);
    session.procedure = Some("S6a_UpdateLocation");
    session.message_count = 2;
    session.latencies_ms.push(120.0);
    session.state = SessionState::Terminated;
    session.end_at = Some(at(1_120));
    session.last_at = at(120);
    session.final_outcome = sigscope_rs::proto::message::Outcome::Success;
    session
}

#[test]
fn test_cdr_row_fields() {
    let session = sample_session();
    let row = CdrRow::from_session(&session);

    assert_eq!(row.session_id, "s-00deadbeef000000");
    assert_eq!(row.imsi, "234150123456789");
    assert_eq!(row.msisdn, "447700900123");
    assert_eq!(row.procedure, "S6a_UpdateLocation");
    assert_eq!(row.protocols, "diameter");
    assert_eq!(row.outcome, "Success");
    assert_eq!(row.avg_latency_ms, "120.000");
    assert_eq!(row.duration_ms, 1_120);

    let line = row.to_line();
    assert_eq!(
        line.split('|').count(),
        CDR_HEADER.split('|').count(),
        "row arity matches the header"
    );
    assert!(line.starts_with("s-00deadbeef000000|"));
}

#[test]
fn test_primary_protocol_prefers_control_plane() {
    let mut session = sample_session();
    session.protocols_seen.insert(Protocol::GtpU);
    session.protocols_seen.insert(Protocol::S1ap);
    assert_eq!(primary_protocol(&session), Protocol::Diameter);
}

#[test]
fn test_event_record_round_trips() -> Result<()> {
    let record = EventRecord {
        ts: at(42),
        protocol: Protocol::Gtpv2C,
        msg_name: "CreateSessionRequest".to_string(),
        direction: sigscope_rs::proto::message::Direction::Request,
        session_id: "s-0011223344556677".to_string(),
        ids: vec![
            Identifier::new(IdentifierKind::Imsi, "234150111111111"),
            Identifier::scoped(IdentifierKind::Teid, "0x12345678", "10.0.0.3|10.0.0.4"),
        ],
        outcome: sigscope_rs::proto::message::Outcome::Pending,
        cause: None,
        latency_us: 17,
        transaction_id: Some(1),
        bytes_up: None,
        bytes_down: None,
        raw: None,
    };

    let line = serde_json::to_string(&record)?;
    let back: EventRecord = serde_json::from_str(&line)?;
    assert_eq!(back.session_id, record.session_id);
    assert_eq!(back.ids, record.ids);
    assert_eq!(back.protocol, Protocol::Gtpv2C);
    assert_eq!(back.transaction_id, Some(1));

    let kinds: HashSet<IdentifierKind> = back.ids.iter().map(|i| i.kind).collect();
    assert!(kinds.contains(&IdentifierKind::Teid));
    Ok(())
}
