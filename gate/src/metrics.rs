// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_vec_with_registry, HistogramVec,
    IntCounter, IntCounterVec, IntGaugeVec, Registry,
};

const SWEEP_LATENCY_SEC_BUCKETS: &[f64] = &[
    0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10., 20., 30., 60., 120., 300., 600.,
];

#[derive(Clone, Debug)]
pub struct GateMetrics {
    pub(crate) reconcile_outcomes: IntCounterVec,
    pub(crate) reconcile_failures: IntCounterVec,
    pub(crate) events_received: IntCounterVec,
    pub(crate) events_ignored: IntCounter,
    pub(crate) poll_failures: IntCounterVec,
    pub(crate) sweep_runs: IntCounterVec,
    pub(crate) sweep_duration: HistogramVec,
    pub(crate) linked_identities: IntGaugeVec,
}

impl GateMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            reconcile_outcomes: register_int_counter_vec_with_registry!(
                "gate_reconcile_outcomes",
                "Reconciliation outcomes by group and outcome kind",
                &["group", "outcome"],
                registry,
            )
            .unwrap(),
            reconcile_failures: register_int_counter_vec_with_registry!(
                "gate_reconcile_failures",
                "Failed reconciliation invocations by group and error type",
                &["group", "error_type"],
                registry,
            )
            .unwrap(),
            events_received: register_int_counter_vec_with_registry!(
                "gate_events_received",
                "Ledger events observed by group and event kind",
                &["group", "kind"],
                registry,
            )
            .unwrap(),
            events_ignored: register_int_counter_with_registry!(
                "gate_events_ignored",
                "Ledger events for addresses with no identity link",
                registry,
            )
            .unwrap(),
            poll_failures: register_int_counter_vec_with_registry!(
                "gate_poll_failures",
                "Event poll failures by group",
                &["group"],
                registry,
            )
            .unwrap(),
            sweep_runs: register_int_counter_vec_with_registry!(
                "gate_sweep_runs",
                "Completed periodic sweeps by group",
                &["group"],
                registry,
            )
            .unwrap(),
            sweep_duration: register_histogram_vec_with_registry!(
                "gate_sweep_duration_seconds",
                "Duration of a full periodic sweep",
                &["group"],
                SWEEP_LATENCY_SEC_BUCKETS.to_vec(),
                registry,
            )
            .unwrap(),
            linked_identities: register_int_gauge_vec_with_registry!(
                "gate_linked_identities",
                "Currently linked identities by group",
                &["group"],
                registry,
            )
            .unwrap(),
        }
    }

    pub fn new_for_testing() -> Self {
        let registry = Registry::new();
        Self::new(&registry)
    }
}
