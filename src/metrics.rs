// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use prometheus::{
    register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, IntCounter, IntCounterVec, IntGauge, Registry,
};
use std::sync::Arc;

#[derive(Clone, Debug)]
pub struct WatcherMetrics {
    pub(crate) latest_finalized_height: IntGauge,
    pub(crate) buffered_blocks: IntGauge,
    pub(crate) epochs_emitted: IntCounter,
    pub(crate) monitor_votes_emitted: IntCounter,
    pub(crate) collect_rounds: IntCounter,
    pub(crate) collected_transfers: IntCounter,
    pub(crate) mainnet_rpc_queries: IntCounterVec,
    pub(crate) mainnet_rpc_errors: IntCounterVec,
}

impl WatcherMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            latest_finalized_height: register_int_gauge_with_registry!(
                "watcher_latest_finalized_height",
                "Latest mainchain height consumed past the finalization depth",
                registry,
            )
            .unwrap(),
            buffered_blocks: register_int_gauge_with_registry!(
                "watcher_buffered_blocks",
                "Finalized blocks currently held in the finalization buffer",
                registry,
            )
            .unwrap(),
            epochs_emitted: register_int_counter_with_registry!(
                "watcher_epochs_emitted",
                "Total number of epochs published on the epoch channel",
                registry,
            )
            .unwrap(),
            monitor_votes_emitted: register_int_counter_with_registry!(
                "watcher_monitor_votes_emitted",
                "Total number of monitor-vote records published",
                registry,
            )
            .unwrap(),
            collect_rounds: register_int_counter_with_registry!(
                "watcher_collect_rounds",
                "Completed cross-chain UTXO collection rounds",
                registry,
            )
            .unwrap(),
            collected_transfers: register_int_counter_with_registry!(
                "watcher_collected_transfers",
                "Total cross-chain transfers handed to the executor",
                registry,
            )
            .unwrap(),
            mainnet_rpc_queries: register_int_counter_vec_with_registry!(
                "watcher_mainnet_rpc_queries",
                "Total number of mainchain RPC queries by method",
                &["method"],
                registry,
            )
            .unwrap(),
            mainnet_rpc_errors: register_int_counter_vec_with_registry!(
                "watcher_mainnet_rpc_errors",
                "Total number of failed mainchain RPC queries by method",
                &["method"],
                registry,
            )
            .unwrap(),
        }
    }

    pub fn new_for_testing() -> Arc<Self> {
        Arc::new(Self::new(&Registry::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_once() {
        let registry = Registry::new();
        let metrics = WatcherMetrics::new(&registry);
        metrics.epochs_emitted.inc();
        metrics.latest_finalized_height.set(42);
        metrics
            .mainnet_rpc_queries
            .with_label_values(&["getblockcount"])
            .inc();

        let families = registry.gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "watcher_epochs_emitted"));
        assert!(families
            .iter()
            .any(|f| f.get_name() == "watcher_latest_finalized_height"));
    }
}
