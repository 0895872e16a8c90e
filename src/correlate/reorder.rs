// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Bounded capture-time reorder buffer.
//!
//! Sources deliver in their own capture order, but nothing orders records
//! across sources. The buffer holds messages until the high-water capture
//! time has advanced past them by the configured window, then releases
//! them in timestamp order. Arrival order breaks timestamp ties so the
//! release sequence is stable.

use std::{
    cmp::{Ordering, Reverse},
    collections::BinaryHeap,
    time::Duration,
};

use chrono::{DateTime, Utc};

use crate::proto::message::Message;

struct Held {
    captured_at: DateTime<Utc>,
    seq: u64,
    msg: Message,
}

impl PartialEq for Held {
    fn eq(&self, other: &Self) -> bool {
        self.captured_at == other.captured_at && self.seq == other.seq
    }
}
impl Eq for Held {}
impl PartialOrd for Held {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Held {
    fn cmp(&self, other: &Self) -> Ordering {
        self.captured_at
            .cmp(&other.captured_at)
            .then(self.seq.cmp(&other.seq))
    }
}

pub struct ReorderBuffer {
    heap: BinaryHeap<Reverse<Held>>,
    window: Duration,
    high_water: Option<DateTime<Utc>>,
    seq: u64,
}

impl ReorderBuffer {
    pub fn new(window: Duration) -> Self {
        Self {
            heap: BinaryHeap::new(),
            window,
            high_water: None,
            seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Accepts one message and returns everything now old enough to leave.
    pub fn push(&mut self, msg: Message) -> Vec<Message> {
        let at = msg.captured_at;
        self.heap.push(Reverse(Held {
            captured_at: at,
            seq: self.seq,
            msg,
        }));
        self.seq += 1;

        if self.high_water.is_none_or(|hw| at > hw) {
            self.high_water = Some(at);
        }
        self.release()
    }

    /// Releases everything captured at or before `cutoff`; the driving
    /// task calls this on its tick so lulls in traffic cannot park
    /// messages indefinitely.
    pub fn release_up_to(&mut self, cutoff: chrono::DateTime<Utc>) -> Vec<Message> {
        let mut out = Vec::new();
        while let Some(Reverse(held)) = self.heap.peek() {
            if held.captured_at > cutoff {
                break;
            }
            if let Some(Reverse(held)) = self.heap.pop() {
                out.push(held.msg);
            }
        }
        out
    }

    /// Drains regardless of the window; used at shutdown.
    pub fn flush(&mut self) -> Vec<Message> {
        let mut out = Vec::with_capacity(self.heap.len());
        while let Some(Reverse(held)) = self.heap.pop() {
            out.push(held.msg);
        }
        out
    }

    fn release(&mut self) -> Vec<Message> {
        let Some(high_water) = self.high_water else {
            return Vec::new();
        };
        let window = chrono::Duration::from_std(self.window)
            .unwrap_or_else(|_| chrono::Duration::milliseconds(500));
        self.release_up_to(high_water - window)
    }
}
