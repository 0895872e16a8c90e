// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use anyhow::{Context, Result};
use sigscope_rs::{
    cfg::{config::Config, logger::init_logger},
    dict::Dictionary,
    pipeline::runner::Pipeline,
    sink::null_consumer,
};
use tokio::signal;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let _init_logger = init_logger("config/logger.yaml")?;

    let cfg = Config::resolve_and_load("config/sigscope.yaml")
        .context("failed to resolve or load config")?;
    let cfg = Arc::new(cfg);
    let dict = Arc::new(Dictionary::new());

    let pipeline = Pipeline::spawn(
        Arc::clone(&cfg),
        Arc::clone(&dict),
        Some(null_consumer()),
    )?;

    // Capture collaborators attach here; each source feeds reassembled
    // application PDUs through its own handle. The API collaborator
    // builds its QueryService against pipeline.engine / pipeline.kpi.
    let _source = pipeline.register_source("default");

    info!("monitor running; ctrl-c to stop");
    signal::ctrl_c().await.context("failed to listen for ctrl-c")?;

    pipeline.shutdown().await?;
    Ok(())
}
