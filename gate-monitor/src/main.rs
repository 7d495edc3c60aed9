// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Stake-gate daemon
//!
//! Wires the gate library together: loads the group configuration,
//! registers contract handles, starts one event watcher and one periodic
//! sweep per group, and serves Prometheus metrics.

use anyhow::{anyhow, Context};
use axum::extract::State;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use prometheus::Registry;
use stakegate::admin::TelegramGroupAdmin;
use stakegate::config::GateConfig;
use stakegate::engine::ReconciliationEngine;
use stakegate::error::GateError;
use stakegate::metrics::GateMetrics;
use stakegate::oracle::{EthLedgerOracle, LedgerOracle};
use stakegate::store::IdentityStore;
use stakegate::watcher::start_group_watcher;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

#[derive(Parser)]
#[clap(rename_all = "kebab-case", author, version)]
struct Args {
    /// Path to the gate configuration YAML
    #[clap(env, long)]
    config: PathBuf,
    #[clap(env, long, default_value = "0.0.0.0:9184")]
    metrics_address: SocketAddr,
    /// Overrides the configured ledger RPC endpoint
    #[clap(env, long)]
    rpc_url: Option<Url>,
}

fn to_anyhow(error: GateError) -> anyhow::Error {
    anyhow!("{:?}", error)
}

async fn start_metrics_server(
    addr: SocketAddr,
    registry: Registry,
    cancel: CancellationToken,
) -> anyhow::Result<JoinHandle<()>> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(|| async { "OK" }))
        .with_state(registry);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind metrics address")?;
    tracing::info!("Metrics server listening on {}", addr);

    Ok(tokio::spawn(async move {
        let serve = axum::serve(listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await });
        if let Err(e) = serve.await {
            tracing::error!("Metrics server error: {:?}", e);
        }
    }))
}

async fn metrics_handler(State(registry): State<Registry>) -> String {
    let metric_families = registry.gather();
    prometheus::TextEncoder::new()
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let cancel = CancellationToken::new();

    let mut config = GateConfig::from_file(&args.config)?;
    if let Some(rpc_url) = &args.rpc_url {
        config.rpc_url = rpc_url.to_string();
    }

    let registry = Registry::new_custom(Some("gate".into()), None)
        .context("Failed to create Prometheus registry")?;
    let metrics = Arc::new(GateMetrics::new(&registry));

    let store =
        Arc::new(IdentityStore::open(config.state_file.clone()).map_err(to_anyhow)?);
    let oracle = Arc::new(EthLedgerOracle::new(&config.rpc_url).map_err(to_anyhow)?);

    // Group entries are the admin action that creates/updates Group
    // records; load them into the store and the oracle registry
    for settings in &config.groups {
        let group = settings.to_group();
        store.upsert_group(group.clone()).await.map_err(to_anyhow)?;
        oracle.register_group(&group).await.map_err(to_anyhow)?;
    }
    tracing::info!("Loaded {} group(s)", config.groups.len());

    let admin_config = config.telegram.to_admin_config();
    if !admin_config.is_configured() {
        tracing::warn!("Telegram bot token not configured; membership actions will fail");
    }
    let admin = Arc::new(TelegramGroupAdmin::new(admin_config));

    let oracle_dyn: Arc<dyn LedgerOracle> = oracle.clone();
    let engine = Arc::new(ReconciliationEngine::new(
        store.clone(),
        oracle_dyn.clone(),
        admin,
        metrics.clone(),
    ));

    let mut handles = Vec::new();
    for settings in &config.groups {
        handles.extend(start_group_watcher(
            settings.group_id.clone(),
            settings.watcher_config(&config),
            engine.clone(),
            oracle_dyn.clone(),
            store.clone(),
            metrics.clone(),
            cancel.clone(),
        ));
    }

    handles.push(start_metrics_server(args.metrics_address, registry, cancel.clone()).await?);

    // Graceful stop on ctrl-c
    let cancel_on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received shutdown signal");
            cancel_on_signal.cancel();
        }
    });

    tracing::info!("Waiting for {} tasks to complete", handles.len());
    let _ = futures::future::join_all(handles).await;
    cancel.cancel();
    tracing::warn!("All services stopped");
    Ok(())
}
