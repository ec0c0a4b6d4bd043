/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - CHATVAULT Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use chatvault_core::config::{resolve_config_path, MirrorConfig};
use chatvault_core::fixture_source::FixtureSource;
use chatvault_core::runtime::Engine;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

struct Args {
    config: Option<PathBuf>,
    fixture: PathBuf,
    listen_secs: u64,
}

fn parse_args() -> Result<Args> {
    let mut config = None;
    let mut fixture = None;
    let mut listen_secs = 3;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => config = Some(PathBuf::from(args.next().context("--config requires a path")?)),
            "--fixture" => fixture = Some(PathBuf::from(args.next().context("--fixture requires a path")?)),
            "--listen-secs" => {
                let v = args.next().context("--listen-secs requires a number")?;
                listen_secs = v.parse().with_context(|| format!("--listen-secs {v:?}"))?;
            }
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(Args {
        config,
        fixture: fixture.context("--fixture <path> is required")?,
        listen_secs,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().context("log directive")?),
        )
        .init();

    let args = parse_args()?;
    let cfg_path = resolve_config_path(args.config)?;
    info!("config: {}", cfg_path.display());
    let cfg = MirrorConfig::load(Some(&cfg_path))?;
    let source = Arc::new(FixtureSource::from_path(&args.fixture)?);
    let engine = Arc::new(Engine::build(&cfg, source)?);
    let mut changes = engine.subscribe_changes();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let summary = engine.crawl_once(shutdown_rx.clone()).await?;

    // Fixture events were queued for the first subscriber.
    let listener = tokio::spawn(engine.listener().clone().run(shutdown_rx));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    tokio::select! {
        _ = &mut ctrl_c => info!("shutdown requested"),
        _ = tokio::time::sleep(Duration::from_secs(args.listen_secs)) => {}
    }
    let _ = shutdown_tx.send(true);
    match listener.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("listener ended with error: {e:#}"),
        Err(e) => warn!("listener task failed: {e}"),
    }

    let mut change_count = 0u64;
    while changes.try_recv().is_ok() {
        change_count += 1;
    }
    let stats = engine.db().run(|db| db.calculate_and_store_statistics()).await?;
    let out = serde_json::json!({
        "crawl": summary,
        "guard": engine.guard().stats(),
        "change_events": change_count,
        "statistics": stats,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
