/********************************************************************************
 * Copyright (c) 2026 Contributors to the Eclipse Foundation
 *
 * See the NOTICE file(s) distributed with this work for additional
 * information regarding copyright ownership.
 *
 * This program and the accompanying materials are made available under the
 * terms of the Apache License Version 2.0 which is available at
 * https://www.apache.org/licenses/LICENSE-2.0
 *
 * SPDX-License-Identifier: Apache-2.0
 ********************************************************************************/

//! forestd: config-driven forest node daemon.
//!
//! Brings up the embedded bus, loads the declarative component config,
//! serves the loopback management API and the webhook surface, and drains
//! everything on SIGINT/SIGTERM. Exit code 0 on graceful shutdown,
//! non-zero on startup failure.

use anyhow::Context;
use clap::Parser;
use forest_runtime::{Forest, ForestOptions};
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "forestd", about = "Forest orchestration runtime node")]
struct Args {
    /// Declarative component config (JSON5).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Node descriptor file; absent file means standalone.
    #[arg(long, default_value = "node.json5")]
    node: PathBuf,

    /// Bus data directory (streams and state bucket).
    #[arg(long, default_value = "./forest-data")]
    data_dir: PathBuf,

    /// Base directory for script and prompt artifacts.
    #[arg(long, default_value = "./artifacts")]
    artifact_dir: PathBuf,

    /// Management API bind address. Loopback; there is no auth.
    #[arg(long, default_value = "127.0.0.1:7400")]
    management_bind: String,

    /// Webhook server bind address, distinct from management.
    #[arg(long, default_value = "127.0.0.1:7410")]
    webhook_bind: String,

    /// Conductor tempo in beats per second.
    #[arg(long, default_value_t = 10.0)]
    tempo_hz: f64,

    /// Disable the conductor on this node.
    #[arg(long)]
    no_conduct: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut options = ForestOptions::new(&args.data_dir, &args.artifact_dir);
    options.node_descriptor = Some(args.node.clone());
    options.config_path = args.config.clone();
    options.tempo_hz = args.tempo_hz;
    options.conduct = !args.no_conduct;

    let forest = Forest::start(options)
        .await
        .context("forest startup failed")?;

    let management_listener = tokio::net::TcpListener::bind(&args.management_bind)
        .await
        .with_context(|| format!("unable to bind management API on {}", args.management_bind))?;
    info!("management API on {}", args.management_bind);
    let management = tokio::spawn({
        let router = forest.management_router();
        async move {
            if let Err(err) = axum::serve(management_listener, router).await {
                error!("management server failed: {err}");
            }
        }
    });

    let webhook_listener = tokio::net::TcpListener::bind(&args.webhook_bind)
        .await
        .with_context(|| format!("unable to bind webhook server on {}", args.webhook_bind))?;
    info!("webhook server on {}", args.webhook_bind);
    let webhooks = tokio::spawn({
        let router = forest.webhook_router();
        async move {
            if let Err(err) = axum::serve(webhook_listener, router).await {
                error!("webhook server failed: {err}");
            }
        }
    });

    wait_for_termination().await;
    info!("termination signal received, draining");

    forest.shutdown().await;
    management.abort();
    webhooks.abort();
    Ok(())
}

#[cfg(unix)]
async fn wait_for_termination() {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() {
    let _ = tokio::signal::ctrl_c().await;
}
