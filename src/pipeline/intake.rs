// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The capture intake contract.
//!
//! The capture collaborator owns SCTP/TCP reassembly and delivers one
//! aligned application PDU per record. Each registered source gets its
//! own handle into the shared decode queue; a full queue blocks the
//! source up to the backpressure budget, then drops with an accounted
//! counter, so slow consumers never stall capture hardware.

use std::{
    net::IpAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::{sync::mpsc, time::timeout};
use tracing::warn;

use crate::proto::message::{LinkMeta, Transport};

/// One record from a capture source.
#[derive(Debug, Clone)]
pub struct CaptureRecord {
    pub bytes: Bytes,
    pub captured_at: DateTime<Utc>,
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
    pub transport: Transport,
    pub interface: Option<String>,
}

impl CaptureRecord {
    pub fn link_meta(&self) -> LinkMeta {
        LinkMeta {
            captured_at: self.captured_at,
            src_ip: self.src_ip,
            src_port: self.src_port,
            dst_ip: self.dst_ip,
            dst_port: self.dst_port,
            transport: self.transport,
            interface: self.interface.clone(),
        }
    }
}

/// Per-source handle feeding the decode queue.
#[derive(Clone)]
pub struct SourceHandle {
    name: Arc<str>,
    tx: mpsc::Sender<CaptureRecord>,
    backpressure: Duration,
    dropped: Arc<AtomicU64>,
}

impl SourceHandle {
    pub(crate) fn new(
        name: &str,
        tx: mpsc::Sender<CaptureRecord>,
        backpressure: Duration,
        dropped: Arc<AtomicU64>,
    ) -> Self {
        Self {
            name: Arc::from(name),
            tx,
            backpressure,
            dropped,
        }
    }

    /// Offers one record; `false` means it was dropped after the
    /// backpressure budget expired.
    pub async fn offer(&self, record: CaptureRecord) -> bool {
        match timeout(self.backpressure, self.tx.send(record)).await {
            Ok(Ok(())) => true,
            _ => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if total.is_power_of_two() {
                    warn!(source = %self.name, total, "intake dropping records");
                }
                false
            },
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
