// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Rotating append-only file writer.
//!
//! The active file is written under a temporary name; rotation flushes it
//! and renames to `<prefix>_<yyyyMMdd_HHmmss>.<ext>`, so a final name only
//! ever refers to a complete file. Compression of closed files happens in
//! a blocking task after the rename and never stalls the writer.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use flate2::{Compression as GzLevel, write::GzEncoder};
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
};
use tracing::{debug, warn};

use crate::cfg::enums::Compression;

#[derive(Debug, Clone)]
pub struct RotationPolicy {
    pub max_bytes: u64,
    /// Age-based rotation; `None` rotates on size alone.
    pub max_age: Option<std::time::Duration>,
    pub compression: Compression,
}

pub struct RotatingWriter {
    dir: PathBuf,
    prefix: String,
    ext: String,
    policy: RotationPolicy,
    /// First line of every new file, for delimited formats.
    header: Option<String>,
    file: Option<BufWriter<File>>,
    written: u64,
    opened_at: DateTime<Utc>,
}

impl RotatingWriter {
    pub fn new(
        dir: impl Into<PathBuf>,
        prefix: impl Into<String>,
        ext: impl Into<String>,
        policy: RotationPolicy,
        header: Option<String>,
    ) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
            ext: ext.into(),
            policy,
            header,
            file: None,
            written: 0,
            opened_at: Utc::now(),
        }
    }

    fn temp_path(&self) -> PathBuf {
        self.dir.join(format!(".{}.{}.part", self.prefix, self.ext))
    }

    fn final_path(&self) -> PathBuf {
        let stamp = self.opened_at.format("%Y%m%d_%H%M%S");
        self.dir
            .join(format!("{}_{stamp}.{}", self.prefix, self.ext))
    }

    /// Appends one line, rotating first when a threshold is crossed.
    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        if self.should_rotate(line.len() as u64) {
            self.rotate().await?;
        }
        if self.file.is_none() {
            self.open().await?;
        }
        let file = self
            .file
            .as_mut()
            .context("writer has no open file after open()")?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        self.written += line.len() as u64 + 1;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.flush().await?;
        }
        Ok(())
    }

    /// Flushes and publishes the active file under its final name.
    pub async fn rotate(&mut self) -> Result<()> {
        let Some(mut file) = self.file.take() else {
            return Ok(());
        };
        file.flush().await?;
        // The BufWriter owns the handle; closing it before rename keeps the
        // rename atomic on every platform we run on.
        drop(file);

        let from = self.temp_path();
        let mut to = self.final_path();
        // Same-second rotations must not overwrite a published file.
        let mut n = 1u32;
        while fs::try_exists(&to).await.unwrap_or(false) {
            let stamp = self.opened_at.format("%Y%m%d_%H%M%S");
            to = self
                .dir
                .join(format!("{}_{stamp}_{n}.{}", self.prefix, self.ext));
            n += 1;
        }
        fs::rename(&from, &to)
            .await
            .with_context(|| format!("rename {from:?} -> {to:?}"))?;
        debug!(path = %to.display(), bytes = self.written, "rotated");

        if self.policy.compression.is_enabled() {
            spawn_compress(to);
        }
        self.written = 0;
        Ok(())
    }

    /// Rotation on shutdown: publish whatever was written.
    pub async fn close(&mut self) -> Result<()> {
        if self.written > 0 || self.file.is_some() {
            self.rotate().await?;
        }
        Ok(())
    }

    fn should_rotate(&self, incoming: u64) -> bool {
        if self.file.is_none() {
            return false;
        }
        if self.written + incoming > self.policy.max_bytes {
            return true;
        }
        if let Some(max_age) = self.policy.max_age {
            let age = Utc::now() - self.opened_at;
            if age
                >= chrono::Duration::from_std(max_age)
                    .unwrap_or_else(|_| chrono::Duration::hours(1))
            {
                return true;
            }
        }
        false
    }

    async fn open(&mut self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("create sink dir {:?}", self.dir))?;
        self.opened_at = Utc::now();
        let path = self.temp_path();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await
            .with_context(|| format!("open {path:?}"))?;
        let mut file = BufWriter::new(file);
        self.written = 0;

        if let Some(header) = &self.header {
            file.write_all(header.as_bytes()).await?;
            file.write_all(b"\n").await?;
            self.written = header.len() as u64 + 1;
        }
        self.file = Some(file);
        Ok(())
    }
}

/// Gzip a closed file and drop the original; best-effort by design.
fn spawn_compress(path: PathBuf) {
    tokio::task::spawn_blocking(move || {
        if let Err(err) = compress_file(&path) {
            warn!(path = %path.display(), %err, "compression failed; original kept");
        }
    });
}

fn compress_file(path: &Path) -> Result<()> {
    use std::io::{BufReader, copy};

    let gz_path = {
        let mut os = path.as_os_str().to_owned();
        os.push(".gz");
        PathBuf::from(os)
    };
    let input = std::fs::File::open(path)?;
    let output = std::fs::File::create(&gz_path)?;
    let mut encoder = GzEncoder::new(output, GzLevel::default());
    copy(&mut BufReader::new(input), &mut encoder)?;
    encoder.finish()?;
    std::fs::remove_file(path)?;
    Ok(())
}
