// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::{
    cfg::enums::Compression,
    proto::{ident::IdentifierKind, message::Protocol},
};

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// Correlation engine sizing and timeout knobs.
    pub correlator: CorrelatorConfig,
    /// KPI window and SLA threshold settings.
    pub kpi: KpiConfig,
    /// Event/CDR sink rotation settings.
    pub sink: SinkConfig,
    /// Queue sizing and worker counts outside the protocol layer.
    pub pipeline: PipelineConfig,
}

/// Sizing and timeout parameters of the correlation engine (one set shared by
/// every shard).
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct CorrelatorConfig {
    /// Number of correlator shards. 0 means "one per hardware thread".
    #[serde(default)]
    pub shards: usize,

    /// Upper bound on live sessions per shard; beyond it the engine evicts
    /// the least-recently-updated session.
    pub max_sessions_per_shard: usize,

    /// Messages retained inside a session before older entries are flushed
    /// to the event sink.
    pub max_messages_in_session: usize,

    /// Upper bound on queued cross-shard merge claims per shard.
    pub max_pending_claims: usize,

    /// Capture-time reorder window applied before correlation.
    #[serde(with = "serde_millis")]
    pub reorder_window: Duration,

    /// Per-protocol idle timeout; a session with no traffic for this long is
    /// evicted. The default entry applies to protocols not listed.
    #[serde(with = "serde_millis")]
    pub idle_timeout_default: Duration,
    #[serde(default, with = "serde_millis_map")]
    pub idle_timeout: HashMap<Protocol, Duration>,

    /// Per-protocol request/response pairing timeout.
    #[serde(with = "serde_millis")]
    pub response_timeout_default: Duration,
    #[serde(default, with = "serde_millis_map")]
    pub response_timeout: HashMap<Protocol, Duration>,

    /// Identifier kinds in lookup priority order (high to low).
    pub identifier_priority: Vec<IdentifierKind>,

    /// Quiescence window between Closing and Terminated so out-of-order
    /// stragglers still fold in.
    #[serde(default = "default_quiescence", with = "serde_millis")]
    pub quiescence: Duration,
}

fn default_quiescence() -> Duration {
    Duration::from_millis(2_000)
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct KpiConfig {
    /// Rolling window lengths tracked per procedure, in seconds.
    #[serde(with = "serde_secs_vec")]
    pub windows: Vec<Duration>,

    /// failure / total ratio above which an Issue record is emitted.
    pub failure_rate_threshold: f64,

    /// p95 latency above which an Issue record is emitted.
    #[serde(with = "serde_millis")]
    pub p95_latency_threshold: Duration,

    /// How many cause codes the per-procedure cause distribution keeps.
    #[serde(default = "default_top_causes")]
    pub top_causes: usize,
}

fn default_top_causes() -> usize {
    10
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SinkConfig {
    /// Root directory for event and CDR files.
    pub output_dir: String,

    /// Event file rotation thresholds.
    pub event_rotation_size_mb: u64,
    pub event_rotation_hours: u64,

    /// CDR file rotation threshold.
    pub cdr_rotation_size_mb: u64,

    /// Post-rotation compression of closed files.
    pub compression: Compression,

    /// Whether decoded messages keep their raw buffer in the event record.
    #[serde(default)]
    pub retain_raw: bool,

    /// In-memory buffer per stream before the producer starts blocking.
    #[serde(default = "default_sink_buffer")]
    pub buffer_records: usize,
}

fn default_sink_buffer() -> usize {
    8_192
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct PipelineConfig {
    /// Decoder worker count. 0 means "one per hardware thread".
    #[serde(default)]
    pub decode_workers: usize,

    /// Bound of every inter-stage queue, in records.
    pub queue_capacity: usize,

    /// How long a producer blocks on a full downstream queue before dropping.
    #[serde(with = "serde_millis")]
    pub backpressure_timeout: Duration,

    /// Grace deadline honoured by every worker on shutdown.
    #[serde(default = "default_shutdown_grace", with = "serde_millis")]
    pub shutdown_grace: Duration,

    /// Interval of the per-shard index/sessions consistency audit.
    #[serde(default = "default_audit_interval", with = "serde_millis")]
    pub audit_interval: Duration,
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(10)
}

fn default_audit_interval() -> Duration {
    Duration::from_secs(60)
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: Config =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Resolves a monitor config path given on the command line (relative
    /// paths are anchored at the working directory) and loads it. The
    /// canonicalized location goes into the error chain so a misdeployed
    /// config is obvious from the log alone.
    pub fn resolve_and_load(rel: &str) -> Result<Self> {
        let path = Self::resolve_path(rel)?;
        Self::load_from_file(&path)
            .with_context(|| format!("loading monitor config {path:?}"))
    }

    fn resolve_path(rel: &str) -> Result<PathBuf> {
        let p = Path::new(rel);
        let abs = if p.is_absolute() {
            p.to_path_buf()
        } else {
            std::env::current_dir()
                .context("cannot get current working dir")?
                .join(p)
        };
        abs.canonicalize()
            .with_context(|| format!("no monitor config at {abs:?}"))
    }

    /// Validates invariants and normalizes derived fields.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        if self.correlator.shards == 0 {
            self.correlator.shards = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
        }
        if self.pipeline.decode_workers == 0 {
            self.pipeline.decode_workers = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
        }

        ensure!(
            self.correlator.max_sessions_per_shard >= 1,
            "max_sessions_per_shard must be >= 1"
        );
        ensure!(
            self.correlator.max_messages_in_session >= 1,
            "max_messages_in_session must be >= 1"
        );
        ensure!(
            self.correlator.max_pending_claims >= 1,
            "max_pending_claims must be >= 1"
        );
        ensure!(
            !self.correlator.identifier_priority.is_empty(),
            "identifier_priority must not be empty"
        );

        // Duplicate priority entries would make the index walk ambiguous.
        let mut seen = Vec::with_capacity(self.correlator.identifier_priority.len());
        for kind in &self.correlator.identifier_priority {
            ensure!(
                !seen.contains(kind),
                "identifier_priority lists {kind:?} twice"
            );
            seen.push(*kind);
        }

        ensure!(!self.kpi.windows.is_empty(), "kpi windows must not be empty");
        ensure!(
            (0.0..=1.0).contains(&self.kpi.failure_rate_threshold),
            "failure_rate_threshold must be within [0, 1]"
        );
        ensure!(self.kpi.top_causes >= 1, "top_causes must be >= 1");

        ensure!(
            self.sink.event_rotation_size_mb >= 1,
            "event_rotation_size_mb must be >= 1"
        );
        ensure!(
            self.sink.event_rotation_hours >= 1,
            "event_rotation_hours must be >= 1"
        );
        ensure!(
            self.sink.cdr_rotation_size_mb >= 1,
            "cdr_rotation_size_mb must be >= 1"
        );
        ensure!(!self.sink.output_dir.is_empty(), "output_dir must be set");

        ensure!(
            self.pipeline.queue_capacity >= 1,
            "queue_capacity must be >= 1"
        );

        Ok(())
    }

    /// Idle timeout for `protocol`, falling back to the default entry.
    pub fn idle_timeout(&self, protocol: Protocol) -> Duration {
        self.correlator
            .idle_timeout
            .get(&protocol)
            .copied()
            .unwrap_or(self.correlator.idle_timeout_default)
    }

    /// Request/response pairing timeout for `protocol`.
    pub fn response_timeout(&self, protocol: Protocol) -> Duration {
        self.correlator
            .response_timeout
            .get(&protocol)
            .copied()
            .unwrap_or(self.correlator.response_timeout_default)
    }
}

/// Serde helpers for representing `Duration` as a number of milliseconds.
pub(crate) mod serde_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

/// Same as [`serde_millis`] but for per-protocol maps.
mod serde_millis_map {
    use std::{collections::HashMap, time::Duration};

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use crate::proto::message::Protocol;

    pub fn serialize<S: Serializer>(
        m: &HashMap<Protocol, Duration>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        let raw: HashMap<&Protocol, u64> =
            m.iter().map(|(k, v)| (k, v.as_millis() as u64)).collect();
        raw.serialize(s)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<HashMap<Protocol, Duration>, D::Error> {
        let raw = HashMap::<Protocol, u64>::deserialize(d)?;
        Ok(raw
            .into_iter()
            .map(|(k, v)| (k, Duration::from_millis(v)))
            .collect())
    }
}

/// Serde helpers for lists of `Duration` expressed in seconds.
mod serde_secs_vec {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(v: &[Duration], s: S) -> Result<S::Ok, S::Error> {
        let raw: Vec<u64> = v.iter().map(|d| d.as_secs()).collect();
        raw.serialize(s)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Vec<Duration>, D::Error> {
        let raw = Vec::<u64>::deserialize(d)?;
        Ok(raw.into_iter().map(Duration::from_secs).collect())
    }
}
