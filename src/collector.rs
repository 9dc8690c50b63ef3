// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Cross-chain UTXO collector.
//!
//! Polls an externally supplied rescan window, snapshots the finalized
//! mainchain block infos inside it, runs the transfer parser over them and
//! publishes the result to the executor as one atomic message. Skipped
//! iterations are silent; the loop re-checks in one second.

use crate::rpc_client::RpcFacade;
use crate::types::{
    CcTransferInfo, CollectionResult, CovenantAddress, MainchainBlockInfo, UtxoCollectParam,
};
use crate::watcher::Watcher;
use futures::future::join_all;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

/// How often the wait-for-finality loop re-reads the mainchain tip.
const FINALITY_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Supplies the current rescan window. `None` means no rescan is pending.
/// Implementations acquire and release their context inside this call
/// (scoped, RAII); it is always invoked outside the executor's lock.
pub trait ContextGetter: Send + Sync {
    fn utxo_collect_param(&self) -> Option<UtxoCollectParam>;
}

/// Extracts cross-chain transfers from mainchain blocks. The history-backed
/// implementation lives with the node; tests install a stub.
pub trait CcTxParser: Send {
    /// Point the parser at the covenant address pair of the window about to
    /// be scanned.
    fn refresh(&mut self, prev_covenant: CovenantAddress, current_covenant: CovenantAddress);

    fn extract_transfers(&self, block_info: &MainchainBlockInfo) -> Vec<CcTransferInfo>;
}

/// Collector task body. Runs for the process lifetime with a one second
/// tick between iterations.
pub(crate) async fn collect_cc_transfers(watcher: Arc<Watcher>, rpc: RpcFacade) {
    let mut last_end_height: i64 = 0;
    let collect_interval = Duration::from_secs(1);
    loop {
        sleep(collect_interval).await;
        collect_round(&watcher, &rpc, &mut last_end_height).await;
    }
}

/// One collector iteration. Returns whether a collection was published so
/// tests can drive the loop deterministically.
pub(crate) async fn collect_round(
    watcher: &Watcher,
    rpc: &RpcFacade,
    last_end_height: &mut i64,
) -> bool {
    if watcher.latest_finalized_height() < watcher.config().start_mainnet_height_for_cc {
        return false;
    }
    let Some(executor) = watcher.executor_handle() else {
        return false;
    };
    let Some(getter) = watcher.context_getter_handle() else {
        return false;
    };
    let Some(param) = getter.utxo_collect_param() else {
        return false;
    };
    if param.end_height == *last_end_height || param.begin_height == 0 {
        return false;
    }
    info!(
        begin_height = param.begin_height,
        end_height = param.end_height,
        "new collect round"
    );
    *last_end_height = param.end_height;

    let Some(block_infos) = finalized_block_infos(
        rpc,
        watcher.config().parallelism,
        watcher.config().finalize_depth,
        param.begin_height,
        param.end_height,
    )
    .await
    else {
        return false;
    };

    let Some(infos) = watcher.with_parser(|parser| {
        parser.refresh(param.prev_covenant_address, param.current_covenant_address);
        let mut infos = Vec::new();
        for block_info in &block_infos {
            infos.extend(parser.extract_transfers(block_info));
        }
        infos
    }) else {
        warn!("collector has no transfer parser installed, skipping round");
        return false;
    };
    debug!(
        begin_height = param.begin_height,
        end_height = param.end_height,
        count = infos.len(),
        "collected cross-chain transfers"
    );

    watcher.metrics().collect_rounds.inc();
    watcher
        .metrics()
        .collected_transfers
        .inc_by(infos.len() as u64);
    executor
        .apply(CollectionResult {
            infos,
            last_end_rescan_block: param.end_height as u64,
        })
        .await;
    true
}

/// Block infos for the half-open window `(start_height, end_height]`, taken
/// only once the mainchain tip has moved `finalize_depth` past the window
/// end. `None` when the window is empty or inverted.
pub(crate) async fn finalized_block_infos(
    rpc: &RpcFacade,
    parallelism: usize,
    finalize_depth: i64,
    start_height: i64,
    end_height: i64,
) -> Option<Vec<MainchainBlockInfo>> {
    if start_height >= end_height {
        debug!(start_height, end_height, "empty rescan window");
        return None;
    }
    let mut latest_height = rpc.latest_height(true).await;
    while latest_height < end_height + finalize_depth {
        sleep(FINALITY_POLL_INTERVAL).await;
        latest_height = rpc.latest_height(true).await;
    }
    Some(block_infos_in_range(rpc, parallelism, start_height, end_height).await)
}

/// Parallel fetch of `(start_height, end_height]` by shared index; the
/// result at offset `i` is the block at height `start_height + 1 + i`.
async fn block_infos_in_range(
    rpc: &RpcFacade,
    parallelism: usize,
    start_height: i64,
    end_height: i64,
) -> Vec<MainchainBlockInfo> {
    let total = (end_height - start_height) as usize;
    let shared_idx = Arc::new(AtomicI64::new(start_height));

    let mut workers = Vec::with_capacity(parallelism);
    for _ in 0..parallelism {
        let rpc = rpc.clone();
        let shared_idx = shared_idx.clone();
        workers.push(tokio::spawn(async move {
            let mut fetched = Vec::new();
            loop {
                let height = shared_idx.fetch_add(1, Ordering::SeqCst) + 1;
                if height > end_height {
                    break;
                }
                if let Some(info) = rpc.block_info_by_height(height, true).await {
                    fetched.push(((height - start_height - 1) as usize, info));
                }
            }
            fetched
        }));
    }

    let mut block_infos: Vec<Option<MainchainBlockInfo>> = vec![None; total];
    for worker in join_all(workers).await {
        match worker {
            Ok(fetched) => {
                for (offset, info) in fetched {
                    block_infos[offset] = Some(info);
                }
            }
            Err(err) => warn!("block info fetch worker failed: {:?}", err),
        }
    }
    block_infos.into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WatcherConfig;
    use crate::executor::CcExecutor;
    use crate::metrics::WatcherMetrics;
    use crate::test_utils::{make_block_info, MockRpc};
    use crate::types::TransferKind;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    struct StubGetter {
        param: Mutex<Option<UtxoCollectParam>>,
    }

    impl StubGetter {
        fn new(param: Option<UtxoCollectParam>) -> Arc<Self> {
            Arc::new(Self {
                param: Mutex::new(param),
            })
        }

        fn set_param(&self, param: Option<UtxoCollectParam>) {
            *self.param.lock().unwrap() = param;
        }
    }

    impl ContextGetter for StubGetter {
        fn utxo_collect_param(&self) -> Option<UtxoCollectParam> {
            *self.param.lock().unwrap()
        }
    }

    #[derive(Default)]
    struct StubParser {
        refresh_calls: Arc<AtomicUsize>,
        current_covenant: CovenantAddress,
    }

    impl CcTxParser for StubParser {
        fn refresh(&mut self, _prev: CovenantAddress, current: CovenantAddress) {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            self.current_covenant = current;
        }

        fn extract_transfers(&self, block_info: &MainchainBlockInfo) -> Vec<CcTransferInfo> {
            vec![CcTransferInfo {
                kind: TransferKind::Transfer,
                txid: [0u8; 32],
                vout: 0,
                amount: block_info.height,
                sender_pubkey_hash: [0u8; 20],
                receiver: [0u8; 20],
                covenant_address: self.current_covenant,
            }]
        }
    }

    fn collect_param(begin_height: i64, end_height: i64) -> UtxoCollectParam {
        UtxoCollectParam {
            begin_height,
            end_height,
            current_covenant_address: [7u8; 20],
            prev_covenant_address: [8u8; 20],
        }
    }

    fn collector_fixture(
        mock: Arc<MockRpc>,
        getter: Arc<StubGetter>,
    ) -> (Arc<Watcher>, Arc<CcExecutor>, RpcFacade, Arc<AtomicUsize>) {
        let config = WatcherConfig::for_testing();
        let (mut watcher, _outputs) =
            Watcher::new(config, 10, 0, WatcherMetrics::new_for_testing());
        watcher.set_rpc_client(mock.clone());

        let executor = Arc::new(CcExecutor::new());
        watcher.set_executor(executor.clone());
        watcher.set_context_getter(getter);

        let refresh_calls = Arc::new(AtomicUsize::new(0));
        watcher.set_parser(Box::new(StubParser {
            refresh_calls: refresh_calls.clone(),
            current_covenant: [0u8; 20],
        }));

        let facade = RpcFacade::new(mock).with_retry_timing(
            Duration::from_millis(5),
            Duration::from_millis(20),
        );
        (Arc::new(watcher), executor, facade, refresh_calls)
    }

    #[tokio::test]
    async fn test_collect_round_publishes_window() {
        let mock = Arc::new(MockRpc::new());
        mock.set_latest_height(4); // end 3 + finalize depth 1
        mock.add_block_info(make_block_info(2));
        mock.add_block_info(make_block_info(3));

        let getter = StubGetter::new(Some(collect_param(1, 3)));
        let (watcher, executor, facade, refresh_calls) = collector_fixture(mock, getter);

        let mut last_end_height = 0;
        assert!(collect_round(&watcher, &facade, &mut last_end_height).await);

        let (infos, last_end) = executor.snapshot().await;
        // Half-open window (1, 3]: blocks 2 and 3, in order
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].amount, 2);
        assert_eq!(infos[1].amount, 3);
        assert_eq!(infos[0].covenant_address, [7u8; 20]);
        assert_eq!(last_end, 3);
        assert_eq!(refresh_calls.load(Ordering::SeqCst), 1);
        assert!(executor.init_collect_done().is_set());
    }

    #[tokio::test]
    async fn test_collect_round_is_idempotent_for_unchanged_window() {
        let mock = Arc::new(MockRpc::new());
        mock.set_latest_height(4);
        mock.add_block_info(make_block_info(2));
        mock.add_block_info(make_block_info(3));

        let getter = StubGetter::new(Some(collect_param(1, 3)));
        let (watcher, _executor, facade, refresh_calls) = collector_fixture(mock, getter);

        let mut last_end_height = 0;
        assert!(collect_round(&watcher, &facade, &mut last_end_height).await);
        assert!(!collect_round(&watcher, &facade, &mut last_end_height).await);
        assert_eq!(refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_collect_round_skips_without_pending_rescan() {
        let mock = Arc::new(MockRpc::new());
        mock.set_latest_height(4);

        let getter = StubGetter::new(None);
        let (watcher, executor, facade, _refresh_calls) =
            collector_fixture(mock, getter.clone());

        let mut last_end_height = 0;
        assert!(!collect_round(&watcher, &facade, &mut last_end_height).await);
        assert!(!executor.init_collect_done().is_set());

        // A zero begin height is also a skip
        getter.set_param(Some(collect_param(0, 3)));
        assert!(!collect_round(&watcher, &facade, &mut last_end_height).await);
        assert!(!executor.init_collect_done().is_set());
    }

    #[tokio::test]
    async fn test_collect_round_gated_by_cc_start_height() {
        let mock = Arc::new(MockRpc::new());
        mock.set_latest_height(4);

        let getter = StubGetter::new(Some(collect_param(1, 3)));
        let mut config = WatcherConfig::for_testing();
        config.start_mainnet_height_for_cc = 100;
        // latest finalized is 10, below the threshold
        let (mut watcher, _outputs) =
            Watcher::new(config, 10, 0, WatcherMetrics::new_for_testing());
        watcher.set_rpc_client(mock.clone());
        watcher.set_executor(Arc::new(CcExecutor::new()));
        watcher.set_context_getter(getter);
        let facade = RpcFacade::new(mock);

        let mut last_end_height = 0;
        assert!(!collect_round(&watcher, &facade, &mut last_end_height).await);
    }

    #[tokio::test]
    async fn test_finalized_block_infos_rejects_inverted_window() {
        let mock = Arc::new(MockRpc::new());
        mock.set_latest_height(100);
        let facade = RpcFacade::new(mock);

        assert!(finalized_block_infos(&facade, 10, 1, 5, 5).await.is_none());
        assert!(finalized_block_infos(&facade, 10, 1, 6, 5).await.is_none());
    }

    #[tokio::test]
    async fn test_block_infos_in_range_orders_by_height() {
        let mock = Arc::new(MockRpc::new());
        mock.set_latest_height(100);
        for height in 11..=20 {
            mock.add_block_info(make_block_info(height));
        }
        let facade = RpcFacade::new(mock);

        let infos = block_infos_in_range(&facade, 10, 10, 20).await;
        assert_eq!(infos.len(), 10);
        let heights: Vec<i64> = infos.iter().map(|info| info.height).collect();
        assert_eq!(heights, (11..=20).collect::<Vec<i64>>());
    }
}
