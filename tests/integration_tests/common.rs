// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Shared scaffolding for the end-to-end scenarios: a pipeline on fast
//! timers, a scratch sink directory, and builders for the wire buffers
//! the scenarios feed in.

use std::{
    collections::HashMap,
    fs,
    net::{IpAddr, Ipv4Addr},
    path::{Path, PathBuf},
    time::Duration,
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use sigscope_rs::{
    cfg::{
        config::{
            Config, CorrelatorConfig, KpiConfig, PipelineConfig, SinkConfig,
        },
        enums::Compression,
    },
    pipeline::intake::CaptureRecord,
    proto::{ident::IdentifierKind, message::Transport},
};

pub fn scratch_dir(name: &str) -> PathBuf {
    let dir = PathBuf::from(format!(
        "target/test-e2e/{name}-{}",
        std::process::id()
    ));
    let _ = fs::remove_dir_all(&dir);
    dir
}

/// A config tuned so scenarios complete in about a second of wall time.
pub fn fast_config(output_dir: &Path) -> Config {
    let mut cfg = Config {
        correlator: CorrelatorConfig {
            shards: 1,
            max_sessions_per_shard: 1000,
            max_messages_in_session: 32,
            max_pending_claims: 64,
            reorder_window: Duration::from_millis(50),
            idle_timeout_default: Duration::from_secs(60),
            idle_timeout: HashMap::new(),
            response_timeout_default: Duration::from_secs(10),
            response_timeout: HashMap::new(),
            identifier_priority: IdentifierKind::default_priority(),
            quiescence: Duration::from_secs(30),
        },
        kpi: KpiConfig {
            windows: vec![Duration::from_secs(60), Duration::from_secs(3600)],
            failure_rate_threshold: 0.05,
            p95_latency_threshold: Duration::from_millis(1500),
            top_causes: 5,
        },
        sink: SinkConfig {
            output_dir: output_dir.to_string_lossy().into_owned(),
            event_rotation_size_mb: 16,
            event_rotation_hours: 1,
            cdr_rotation_size_mb: 16,
            compression: Compression::None,
            retain_raw: false,
            buffer_records: 256,
        },
        pipeline: PipelineConfig {
            decode_workers: 2,
            queue_capacity: 256,
            backpressure_timeout: Duration::from_millis(200),
            shutdown_grace: Duration::from_secs(5),
            audit_interval: Duration::from_secs(1),
        },
    };
    cfg.validate_and_normalize().expect("test config is valid");
    cfg
}

pub fn record(
    bytes: Vec<u8>,
    captured_at: DateTime<Utc>,
    src: [u8; 4],
    src_port: u16,
    dst: [u8; 4],
    dst_port: u16,
) -> CaptureRecord {
    CaptureRecord {
        bytes: Bytes::from(bytes),
        captured_at,
        src_ip: IpAddr::V4(Ipv4Addr::from(src)),
        src_port,
        dst_ip: IpAddr::V4(Ipv4Addr::from(dst)),
        dst_port,
        transport: Transport::Sctp,
        interface: None,
    }
}

/// Gathers every line of every published + in-flight file under a sink
/// subdirectory tree.
pub fn read_sink_lines(root: &Path) -> Vec<String> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = fs::read_dir(&dir) else { continue };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if let Ok(content) = fs::read_to_string(&path) {
                out.extend(content.lines().map(str::to_string));
            }
        }
    }
    out
}

// ── wire builders ───────────────────────────────────────────────────────

/// Minimal Diameter PDU with the given command, flags and AVPs.
pub fn diameter(
    command: u32,
    is_request: bool,
    hop_by_hop: u32,
    avps: &[(u32, Vec<u8>)],
) -> Vec<u8> {
    let mut body = Vec::new();
    for (code, data) in avps {
        let avp_len = 8 + data.len();
        body.extend_from_slice(&code.to_be_bytes());
        body.push(0x40);
        body.extend_from_slice(&(avp_len as u32).to_be_bytes()[1..]);
        body.extend_from_slice(data);
        for _ in 0..((4 - (avp_len % 4)) % 4) {
            body.push(0);
        }
    }

    let total = 20 + body.len();
    let mut out = Vec::with_capacity(total);
    out.push(0x01);
    out.extend_from_slice(&(total as u32).to_be_bytes()[1..]);
    out.push(if is_request { 0xC0 } else { 0x00 });
    out.extend_from_slice(&command.to_be_bytes()[1..]);
    out.extend_from_slice(&16777251u32.to_be_bytes());
    out.extend_from_slice(&hop_by_hop.to_be_bytes());
    out.extend_from_slice(&0x5555u32.to_be_bytes());
    out.extend_from_slice(&body);
    out
}

pub fn avp_utf8(code: u32, value: &str) -> (u32, Vec<u8>) {
    (code, value.as_bytes().to_vec())
}

pub fn avp_u32(code: u32, value: u32) -> (u32, Vec<u8>) {
    (code, value.to_be_bytes().to_vec())
}

/// GTPv2 message with TEID header and TLV IEs.
pub fn gtpv2(message_type: u8, teid: u32, seq: u32, ies: &[(u8, Vec<u8>)]) -> Vec<u8> {
    let mut buf = vec![0x48, message_type, 0x00, 0x00];
    buf.extend_from_slice(&teid.to_be_bytes());
    buf.extend_from_slice(&seq.to_be_bytes()[1..]);
    buf.push(0x00);
    for (ie_type, data) in ies {
        buf.push(*ie_type);
        buf.extend_from_slice(&(data.len() as u16).to_be_bytes());
        buf.push(0x00);
        buf.extend_from_slice(data);
    }
    let body_len = (buf.len() - 4) as u16;
    buf[2..4].copy_from_slice(&body_len.to_be_bytes());
    buf
}

/// S1AP-style PDU in the registry's wire layout.
pub fn ran_pdu(choice: u8, procedure: u8, ies: &[(u16, Vec<u8>)]) -> Vec<u8> {
    let mut body = vec![0x00];
    body.extend_from_slice(&(ies.len() as u16).to_be_bytes());
    for (id, value) in ies {
        body.extend_from_slice(&id.to_be_bytes());
        body.push(0x40);
        assert!(value.len() < 0x80);
        body.push(value.len() as u8);
        body.extend_from_slice(value);
    }
    let mut out = vec![choice, procedure, 0x40];
    if body.len() < 0x80 {
        out.push(body.len() as u8);
    } else {
        out.push(0x80 | ((body.len() >> 8) as u8));
        out.push((body.len() & 0xFF) as u8);
    }
    out.extend_from_slice(&body);
    out
}

/// NAS EPS Attach Request for IMSI 234150111111111.
pub fn nas_attach_request() -> Vec<u8> {
    let mut nas = vec![0x07, 0x41, 0x71, 0x08, 0x29];
    nas.extend_from_slice(&[0x43, 0x51, 0x10, 0x11, 0x11, 0x11, 0x11]);
    nas
}

// IMSI 234150111111111 in TBCD, for GTPv2 IMSI IEs.
pub const IMSI_TBCD: [u8; 8] = [0x32, 0x14, 0x05, 0x11, 0x11, 0x11, 0x11, 0xF1];
