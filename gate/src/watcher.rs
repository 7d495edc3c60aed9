// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Event watcher and periodic sweep
//!
//! Bridges the ledger's raw event stream into reconcile calls, one
//! supervised loop per group:
//!
//! ```text
//!   ┌──────────────┐  Deposit/Withdraw   ┌──────────────────────┐
//!   │  event loop   │ ───────────────────▶ resolve address      │
//!   │ (poll + retry)│                     │  -> reconcile        │
//!   └──────────────┘                     └──────────────────────┘
//!   ┌──────────────┐  every sweep tick    ┌──────────────────────┐
//!   │  sweep loop   │ ───────────────────▶ reconcile every link │
//!   └──────────────┘                     └──────────────────────┘
//! ```
//!
//! Delivery is at-least-once and unordered across addresses; the engine's
//! idempotence makes redundant deliveries harmless, so no de-duplication
//! happens here. The sweep is the correctness backstop for events lost
//! during a disconnect window. Poll failures back off exponentially and
//! never terminate the loop; only a store fault or cancellation does.

use crate::engine::ReconciliationEngine;
use crate::error::GateError;
use crate::metrics::GateMetrics;
use crate::oracle::LedgerOracle;
use crate::store::IdentityStore;
use crate::types::StakeEvent;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Per-group watcher configuration
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub poll_interval: Duration,
    pub sweep_interval: Duration,
    /// Block to start polling from; None starts at the current head
    pub start_block: Option<u64>,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(1800),
            start_block: None,
        }
    }
}

fn reconnect_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: Duration::from_secs(1),
        randomization_factor: 0.1,
        multiplier: 2.0,
        max_interval: Duration::from_secs(60),
        max_elapsed_time: None,
        ..Default::default()
    }
}

/// Spawn the event and sweep loops for one group
pub fn start_group_watcher(
    group_id: String,
    config: WatcherConfig,
    engine: Arc<ReconciliationEngine>,
    oracle: Arc<dyn LedgerOracle>,
    store: Arc<IdentityStore>,
    metrics: Arc<GateMetrics>,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let event_handle = tokio::spawn(run_event_loop(
        group_id.clone(),
        config.clone(),
        engine.clone(),
        oracle,
        store.clone(),
        metrics.clone(),
        cancel.clone(),
    ));
    let sweep_handle = tokio::spawn(run_sweep_loop(
        group_id,
        config.sweep_interval,
        engine,
        store,
        metrics,
        cancel,
    ));
    vec![event_handle, sweep_handle]
}

async fn run_event_loop(
    group_id: String,
    config: WatcherConfig,
    engine: Arc<ReconciliationEngine>,
    oracle: Arc<dyn LedgerOracle>,
    store: Arc<IdentityStore>,
    metrics: Arc<GateMetrics>,
    cancel: CancellationToken,
) {
    info!("[Watcher] Starting event loop for group {}", group_id);

    let mut backoff = reconnect_backoff();

    // Establish the starting cursor; without an explicit start block we
    // only care about events from now on
    let mut next_block = match config.start_block {
        Some(block) => block,
        None => loop {
            match oracle.head_block(&group_id).await {
                Ok(head) => break head + 1,
                Err(e) => {
                    warn!(
                        "[Watcher] Failed to fetch head block for group {}: {:?}",
                        group_id, e
                    );
                    let delay = backoff
                        .next_backoff()
                        .unwrap_or(Duration::from_secs(60));
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        },
    };
    backoff.reset();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("[Watcher] Event loop for group {} cancelled", group_id);
                return;
            }
            _ = tokio::time::sleep(config.poll_interval) => {}
        }

        match oracle.poll_events(&group_id, next_block).await {
            Ok((events, next)) => {
                backoff.reset();
                next_block = next;
                for event in events {
                    if cancel.is_cancelled() {
                        return;
                    }
                    handle_stake_event(&engine, &store, &metrics, &cancel, &group_id, event).await;
                }
            }
            Err(e) => {
                metrics
                    .poll_failures
                    .with_label_values(&[&group_id])
                    .inc();
                let delay = backoff
                    .next_backoff()
                    .unwrap_or(Duration::from_secs(60));
                warn!(
                    "[Watcher] Event poll for group {} failed ({:?}), retrying in {:?}",
                    group_id, e, delay
                );
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

async fn handle_stake_event(
    engine: &ReconciliationEngine,
    store: &IdentityStore,
    metrics: &GateMetrics,
    cancel: &CancellationToken,
    group_id: &str,
    event: StakeEvent,
) {
    metrics
        .events_received
        .with_label_values(&[group_id, event.kind.name()])
        .inc();

    // Events carry addresses; an address nobody linked is not ours to manage
    let Some(identity_id) = store.resolve_address(&event.address, group_id).await else {
        metrics.events_ignored.inc();
        debug!(
            "[Watcher] {} event for unmanaged address {} in group {}, ignoring",
            event.kind.name(),
            event.address,
            group_id
        );
        return;
    };

    info!(
        "[Watcher] {} event for {} ({}) in group {} at block {}",
        event.kind.name(),
        identity_id,
        event.address,
        group_id,
        event.block_number
    );

    match engine.reconcile(&identity_id, group_id).await {
        Ok(_) => {}
        Err(GateError::StoreFault(e)) => {
            error!(
                "[Watcher] Store fault while reconciling {} in {}: {} - shutting down",
                identity_id, group_id, e
            );
            cancel.cancel();
        }
        // Transient; the engine already recorded it and the sweep retries
        Err(_) => {}
    }
}

async fn run_sweep_loop(
    group_id: String,
    interval: Duration,
    engine: Arc<ReconciliationEngine>,
    store: Arc<IdentityStore>,
    metrics: Arc<GateMetrics>,
    cancel: CancellationToken,
) {
    info!(
        "[Sweep] Starting sweep loop for group {} (interval {:?})",
        group_id, interval
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("[Sweep] Sweep loop for group {} cancelled", group_id);
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        let started = std::time::Instant::now();
        let identities = store.list_linked(&group_id).await;
        metrics
            .linked_identities
            .with_label_values(&[&group_id])
            .set(identities.len() as i64);
        debug!(
            "[Sweep] Reconciling {} linked identities in group {}",
            identities.len(),
            group_id
        );

        for identity_id in identities {
            if cancel.is_cancelled() {
                return;
            }
            match engine.reconcile(&identity_id, &group_id).await {
                Ok(_) => {}
                Err(GateError::StoreFault(e)) => {
                    error!(
                        "[Sweep] Store fault while reconciling {} in {}: {} - shutting down",
                        identity_id, group_id, e
                    );
                    cancel.cancel();
                    return;
                }
                Err(_) => {}
            }
        }

        metrics.sweep_runs.with_label_values(&[&group_id]).inc();
        metrics
            .sweep_duration
            .with_label_values(&[&group_id])
            .observe(started.elapsed().as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Group;
    use crate::test_utils::{MockGroupAdmin, MockLedgerOracle};
    use crate::types::StakeEventKind;
    use tempfile::TempDir;
    use tokio::time::timeout;

    const GROUP: &str = "-1001";
    const ALICE: &str = "42";
    const ALICE_ADDR: &str = "0xaaaa";

    struct Harness {
        _dir: TempDir,
        store: Arc<IdentityStore>,
        oracle: Arc<MockLedgerOracle>,
        admin: Arc<MockGroupAdmin>,
        engine: Arc<ReconciliationEngine>,
        metrics: Arc<GateMetrics>,
    }

    async fn setup() -> Harness {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let dir = TempDir::new().unwrap();
        let store = Arc::new(IdentityStore::open(dir.path().join("state.json")).unwrap());
        store
            .upsert_group(Group {
                group_id: GROUP.to_string(),
                pool_address: "0x00000000000000000000000000000000000000aa".to_string(),
                token_address: "0x00000000000000000000000000000000000000bb".to_string(),
                thresholds: vec![1000, 100, 10],
            })
            .await
            .unwrap();

        let oracle = Arc::new(MockLedgerOracle::new());
        oracle.set_thresholds(GROUP, vec![1000, 100, 10]).await;
        let admin = Arc::new(MockGroupAdmin::new());
        let metrics = Arc::new(GateMetrics::new_for_testing());
        let engine = Arc::new(ReconciliationEngine::new(
            store.clone(),
            oracle.clone(),
            admin.clone(),
            metrics.clone(),
        ));

        Harness {
            _dir: dir,
            store,
            oracle,
            admin,
            engine,
            metrics,
        }
    }

    fn fast_config() -> WatcherConfig {
        WatcherConfig {
            poll_interval: Duration::from_millis(10),
            sweep_interval: Duration::from_millis(50),
            start_block: Some(1),
        }
    }

    fn withdraw_event(address: &str) -> StakeEvent {
        StakeEvent {
            kind: StakeEventKind::Withdraw,
            address: address.to_string(),
            amount: 100,
            block_number: 7,
        }
    }

    async fn wait_until<F, Fut>(mut condition: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        timeout(Duration::from_secs(30), async {
            loop {
                if condition().await {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test(start_paused = true)]
    async fn test_withdraw_event_triggers_removal() {
        let h = setup().await;
        h.store
            .link_identity(ALICE, ALICE_ADDR, GROUP)
            .await
            .unwrap();
        h.oracle.set_balance(ALICE_ADDR, 0).await;
        h.oracle.push_events(vec![withdraw_event(ALICE_ADDR)]).await;

        let cancel = CancellationToken::new();
        let handles = start_group_watcher(
            GROUP.to_string(),
            fast_config(),
            h.engine.clone(),
            h.oracle.clone(),
            h.store.clone(),
            h.metrics.clone(),
            cancel.clone(),
        );

        let store = h.store.clone();
        wait_until(|| {
            let store = store.clone();
            async move { store.resolve_identity(ALICE, GROUP).await.is_none() }
        })
        .await;

        assert_eq!(h.admin.evictions().await.len(), 1);
        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_for_unmanaged_address_is_ignored() {
        let h = setup().await;
        h.oracle.push_events(vec![withdraw_event("0xdead")]).await;

        let cancel = CancellationToken::new();
        let handles = start_group_watcher(
            GROUP.to_string(),
            fast_config(),
            h.engine.clone(),
            h.oracle.clone(),
            h.store.clone(),
            h.metrics.clone(),
            cancel.clone(),
        );

        let metrics = h.metrics.clone();
        wait_until(|| {
            let metrics = metrics.clone();
            async move { metrics.events_ignored.get() >= 1 }
        })
        .await;

        assert_eq!(h.admin.call_count(), 0);
        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_event_delivery_is_idempotent() {
        let h = setup().await;
        h.store
            .link_identity(ALICE, ALICE_ADDR, GROUP)
            .await
            .unwrap();
        h.oracle.set_balance(ALICE_ADDR, 0).await;
        // At-least-once delivery: the same event arrives in two batches
        h.oracle.push_events(vec![withdraw_event(ALICE_ADDR)]).await;
        h.oracle.push_events(vec![withdraw_event(ALICE_ADDR)]).await;

        let cancel = CancellationToken::new();
        let handles = start_group_watcher(
            GROUP.to_string(),
            fast_config(),
            h.engine.clone(),
            h.oracle.clone(),
            h.store.clone(),
            h.metrics.clone(),
            cancel.clone(),
        );

        let metrics = h.metrics.clone();
        wait_until(|| {
            let metrics = metrics.clone();
            async move {
                metrics
                    .events_received
                    .with_label_values(&[GROUP, "Withdraw"])
                    .get()
                    >= 2
            }
        })
        .await;

        // Redundant delivery produced at most a redundant no-op
        assert_eq!(h.admin.evictions().await.len(), 1);
        assert_eq!(h.store.resolve_identity(ALICE, GROUP).await, None);
        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_is_a_backstop_without_events() {
        let h = setup().await;
        h.store
            .link_identity(ALICE, ALICE_ADDR, GROUP)
            .await
            .unwrap();
        h.oracle.set_balance(ALICE_ADDR, 3).await;
        // No events at all: only the sweep can notice the stale member

        let cancel = CancellationToken::new();
        let handles = start_group_watcher(
            GROUP.to_string(),
            fast_config(),
            h.engine.clone(),
            h.oracle.clone(),
            h.store.clone(),
            h.metrics.clone(),
            cancel.clone(),
        );

        let store = h.store.clone();
        wait_until(|| {
            let store = store.clone();
            async move { store.resolve_identity(ALICE, GROUP).await.is_none() }
        })
        .await;

        assert_eq!(h.admin.evictions().await.len(), 1);
        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_failures_do_not_kill_the_loop() {
        let h = setup().await;
        h.store
            .link_identity(ALICE, ALICE_ADDR, GROUP)
            .await
            .unwrap();
        h.oracle.set_balance(ALICE_ADDR, 0).await;
        h.oracle.fail_polls(true);

        let cancel = CancellationToken::new();
        let handles = start_group_watcher(
            GROUP.to_string(),
            fast_config(),
            h.engine.clone(),
            h.oracle.clone(),
            h.store.clone(),
            h.metrics.clone(),
            cancel.clone(),
        );

        let metrics = h.metrics.clone();
        wait_until(|| {
            let metrics = metrics.clone();
            async move {
                metrics
                    .poll_failures
                    .with_label_values(&[GROUP])
                    .get()
                    >= 2
            }
        })
        .await;

        // Recovery: the loop is still alive and processes the next batch
        h.oracle.fail_polls(false);
        h.oracle.push_events(vec![withdraw_event(ALICE_ADDR)]).await;

        let store = h.store.clone();
        wait_until(|| {
            let store = store.clone();
            async move { store.resolve_identity(ALICE, GROUP).await.is_none() }
        })
        .await;

        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_both_loops() {
        let h = setup().await;
        let cancel = CancellationToken::new();
        let handles = start_group_watcher(
            GROUP.to_string(),
            fast_config(),
            h.engine.clone(),
            h.oracle.clone(),
            h.store.clone(),
            h.metrics.clone(),
            cancel.clone(),
        );

        cancel.cancel();
        for handle in handles {
            timeout(Duration::from_secs(5), handle)
                .await
                .expect("loop did not stop after cancellation")
                .unwrap();
        }
    }
}
