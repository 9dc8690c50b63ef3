// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The watcher supervisor.
//!
//! Watches the blocks generated on the mainchain past the finalization
//! depth, folds fixed-length windows of them into epoch and monitor-vote
//! records, and publishes those on two buffered channels. A consumer that
//! stalls past the channel capacity blocks the pipeline; epochs are never
//! dropped.

use crate::buffer::FinalizationBuffer;
use crate::collector::{self, CcTxParser, ContextGetter};
use crate::config::WatcherConfig;
use crate::executor::CcExecutor;
use crate::latch::Latch;
use crate::metrics::WatcherMetrics;
use crate::rpc_client::{HttpRpcClient, RpcFacade, WatcherRpc};
use crate::types::{
    merge_monitor_nominations, merge_nominations, Epoch, MainchainBlock, MonitorVoteInfo,
    Nomination, VoteInfoRecord,
};
use futures::future::join_all;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

/// Receivers for the watcher's two output streams. Consumers must drain
/// them or the pipeline stalls once the buffers fill.
pub struct WatcherOutputs {
    pub epochs: mpsc::Receiver<Epoch>,
    pub monitor_votes: mpsc::Receiver<MonitorVoteInfo>,
}

/// State owned by the pipeline task. Accessors take read locks and may
/// observe values one block stale; that is acceptable for telemetry and RPC
/// responses.
#[derive(Debug, Default)]
struct WatcherState {
    buffer: FinalizationBuffer,
    vote_info_list: Vec<VoteInfoRecord>,
    last_epoch_end_height: i64,
}

pub struct Watcher {
    config: WatcherConfig,
    num_blocks_in_epoch: i64,
    waiting_block_delay_time: u64,
    last_known_epoch_num: i64,

    mainnet: Option<RpcFacade>,
    sidechain: Option<RpcFacade>,

    state: RwLock<WatcherState>,
    latest_finalized_height: AtomicI64,
    current_mainnet_block_timestamp: AtomicI64,

    catchup: Latch,
    epoch_tx: mpsc::Sender<Epoch>,
    monitor_vote_tx: mpsc::Sender<MonitorVoteInfo>,

    executor: StdRwLock<Option<Arc<CcExecutor>>>,
    context_getter: StdRwLock<Option<Arc<dyn ContextGetter>>>,
    parser: StdMutex<Option<Box<dyn CcTxParser + Send>>>,

    metrics: Arc<WatcherMetrics>,
}

impl Watcher {
    /// `last_height` and `last_known_epoch_num` come from the caller's
    /// persisted chain state; the watcher rebuilds everything else from the
    /// mainchain.
    pub fn new(
        config: WatcherConfig,
        last_height: i64,
        last_known_epoch_num: i64,
        metrics: Arc<WatcherMetrics>,
    ) -> (Self, WatcherOutputs) {
        let mainnet = (!config.mainnet_rpc_url.is_empty()).then(|| {
            RpcFacade::new(Arc::new(HttpRpcClient::new(
                &config.mainnet_rpc_url,
                &config.mainnet_rpc_username,
                &config.mainnet_rpc_password,
            )))
            .with_metrics(metrics.clone())
        });
        let sidechain = (!config.sidechain_rpc_url.is_empty()).then(|| {
            RpcFacade::new(Arc::new(HttpRpcClient::new(&config.sidechain_rpc_url, "", "")))
                .with_metrics(metrics.clone())
        });

        let (epoch_tx, epoch_rx) = mpsc::channel(config.epoch_channel_size);
        let (monitor_vote_tx, monitor_vote_rx) = mpsc::channel(config.monitor_vote_channel_size);

        let watcher = Self {
            num_blocks_in_epoch: config.num_blocks_in_epoch,
            waiting_block_delay_time: config.waiting_block_delay_time,
            last_known_epoch_num,
            mainnet,
            sidechain,
            state: RwLock::new(WatcherState {
                buffer: FinalizationBuffer::new(),
                vote_info_list: Vec::new(),
                last_epoch_end_height: last_height,
            }),
            latest_finalized_height: AtomicI64::new(last_height),
            // Big enough for single-node startup with no mainchain node
            // connected; updated as soon as a block finalizes.
            current_mainnet_block_timestamp: AtomicI64::new(i64::MAX - 14 * 24 * 3600),
            catchup: Latch::new("catchup"),
            epoch_tx,
            monitor_vote_tx,
            executor: StdRwLock::new(None),
            context_getter: StdRwLock::new(None),
            parser: StdMutex::new(None),
            metrics,
            config,
        };
        (
            watcher,
            WatcherOutputs {
                epochs: epoch_rx,
                monitor_votes: monitor_vote_rx,
            },
        )
    }

    /// Replace the mainchain endpoint, used by tests.
    pub fn set_rpc_client(&mut self, client: Arc<dyn WatcherRpc>) {
        self.mainnet = Some(RpcFacade::new(client).with_metrics(self.metrics.clone()));
    }

    /// Replace the sidechain endpoint, used by tests.
    pub fn set_sidechain_rpc_client(&mut self, client: Arc<dyn WatcherRpc>) {
        self.sidechain = Some(RpcFacade::new(client).with_metrics(self.metrics.clone()));
    }

    pub fn set_num_blocks_in_epoch(&mut self, n: i64) {
        self.num_blocks_in_epoch = n;
    }

    pub fn set_waiting_block_delay_time(&mut self, seconds: u64) {
        self.waiting_block_delay_time = seconds;
    }

    pub fn set_executor(&self, executor: Arc<CcExecutor>) {
        *self.executor.write().unwrap() = Some(executor);
    }

    pub fn set_context_getter(&self, getter: Arc<dyn ContextGetter>) {
        *self.context_getter.write().unwrap() = Some(getter);
    }

    pub fn set_parser(&self, parser: Box<dyn CcTxParser + Send>) {
        *self.parser.lock().unwrap() = Some(parser);
    }

    pub fn config(&self) -> &WatcherConfig {
        &self.config
    }

    pub fn num_blocks_in_epoch(&self) -> i64 {
        self.num_blocks_in_epoch
    }

    pub(crate) fn metrics(&self) -> &Arc<WatcherMetrics> {
        &self.metrics
    }

    pub(crate) fn executor_handle(&self) -> Option<Arc<CcExecutor>> {
        self.executor.read().unwrap().clone()
    }

    pub(crate) fn context_getter_handle(&self) -> Option<Arc<dyn ContextGetter>> {
        self.context_getter.read().unwrap().clone()
    }

    pub(crate) fn with_parser<R>(
        &self,
        f: impl FnOnce(&mut (dyn CcTxParser + Send)) -> R,
    ) -> Option<R> {
        let mut guard = self.parser.lock().unwrap();
        guard.as_mut().map(|parser| f(parser.as_mut()))
    }

    /// Block until the pipeline has reached the mainchain tip once.
    pub async fn wait_catchup(&self) {
        self.catchup.wait().await;
    }

    /// Subscribe to the one-shot catch-up signal.
    pub fn catchup_subscriber(&self) -> watch::Receiver<bool> {
        self.catchup.subscribe()
    }

    pub fn latest_finalized_height(&self) -> i64 {
        self.latest_finalized_height.load(Ordering::SeqCst)
    }

    pub fn current_mainnet_block_timestamp(&self) -> i64 {
        self.current_mainnet_block_timestamp.load(Ordering::SeqCst)
    }

    /// The still-open epoch, built on demand from the buffered window.
    pub async fn current_epoch(&self) -> Epoch {
        let state = self.state.read().await;
        self.build_epoch_locked(&state, self.latest_finalized_height())
    }

    /// History epochs with the in-progress epoch appended.
    pub async fn epoch_list(&self) -> Vec<Epoch> {
        let state = self.state.read().await;
        let mut epochs: Vec<Epoch> = state
            .vote_info_list
            .iter()
            .map(|record| record.epoch.clone())
            .collect();
        epochs.push(self.build_epoch_locked(&state, self.latest_finalized_height()));
        epochs
    }

    /// Full vote-info history with the in-progress record appended.
    pub async fn vote_info_list(&self) -> Vec<VoteInfoRecord> {
        let state = self.state.read().await;
        let mut records = state.vote_info_list.clone();
        records.push(VoteInfoRecord {
            epoch: self.build_epoch_locked(&state, self.latest_finalized_height()),
            monitor_vote: MonitorVoteInfo::default(),
        });
        records
    }

    /// One probe fetch against the mainchain. Panics when the endpoint is
    /// unhealthy; invoked from startup code before the node commits to
    /// running.
    pub async fn check_sanity(&self, skip_check: bool) {
        if skip_check {
            return;
        }
        let Some(rpc) = &self.mainnet else {
            panic!("sanity check requires a configured mainchain RPC client");
        };
        let latest_height = rpc.latest_height(false).await;
        if latest_height <= 0 {
            panic!("mainchain height probe failed in sanity check");
        }
        if rpc.block_by_height(latest_height, false).await.is_none() {
            panic!(
                "mainchain block probe failed in sanity check at height {}",
                latest_height
            );
        }
    }

    /// The main entry point. Must be spawned as a task; runs for the process
    /// lifetime.
    pub async fn run(self: Arc<Self>) {
        let Some(mainnet) = self.mainnet.clone() else {
            // No endpoint configured: unit-test path
            self.catchup.set();
            return;
        };
        self.speedup().await;
        if !self.config.is_amber {
            tokio::spawn(collector::collect_cc_transfers(
                self.clone(),
                mainnet.clone(),
            ));
        }
        self.fetch_blocks(&mainnet).await;
    }

    /// Catch-up pipeline: one parallel range fetch at startup, then a serial
    /// tail fetch forever. Blocks reach the aggregator in strictly ascending
    /// height order regardless of phase.
    async fn fetch_blocks(&self, rpc: &RpcFacade) {
        let mut caught_up = false;
        let finalize_depth = self.config.finalize_depth;
        let mut latest_mainnet_height = rpc.latest_height(true).await;
        let mut height_wanted = self.latest_finalized_height() + 1;

        if height_wanted + finalize_depth + self.config.parallelism as i64 <= latest_mainnet_height
        {
            debug!(
                latest_finalized_height = self.latest_finalized_height(),
                latest_mainnet_height, "entering parallel fetch phase"
            );
            self.parallel_fetch_blocks(rpc, height_wanted, latest_mainnet_height - finalize_depth)
                .await;
            height_wanted = self.latest_finalized_height() + 1;
        }

        loop {
            latest_mainnet_height = rpc.latest_height(true).await;
            while height_wanted + finalize_depth <= latest_mainnet_height {
                if let Some(block) = rpc.block_by_height(height_wanted, true).await {
                    self.add_finalized_block(block).await;
                }
                height_wanted += 1;
                latest_mainnet_height = rpc.latest_height(true).await;
            }
            if caught_up {
                debug!(
                    height = latest_mainnet_height,
                    "waiting for the mainchain to advance"
                );
                sleep(Duration::from_secs(self.waiting_block_delay_time)).await;
            } else {
                debug!("caught up with the mainchain tip");
                caught_up = true;
                self.catchup.set();
            }
        }
    }

    /// Fetch `[height_start, height_end]` with a pool of workers pulling
    /// heights off a shared index, then drain the results in height order so
    /// aggregator updates stay monotonic.
    async fn parallel_fetch_blocks(&self, rpc: &RpcFacade, height_start: i64, height_end: i64) {
        let total = (height_end - height_start + 1) as usize;
        let shared_idx = Arc::new(AtomicI64::new(-1));

        let mut workers = Vec::with_capacity(self.config.parallelism);
        for _ in 0..self.config.parallelism {
            let rpc = rpc.clone();
            let shared_idx = shared_idx.clone();
            workers.push(tokio::spawn(async move {
                let mut fetched = Vec::new();
                loop {
                    let index = shared_idx.fetch_add(1, Ordering::SeqCst) + 1;
                    if height_start + index > height_end {
                        break;
                    }
                    if let Some(block) = rpc.block_by_height(height_start + index, true).await {
                        fetched.push((index as usize, block));
                    }
                }
                fetched
            }));
        }

        // Completion barrier before any result is consumed
        let mut block_set: Vec<Option<MainchainBlock>> = vec![None; total];
        for worker in join_all(workers).await {
            match worker {
                Ok(fetched) => {
                    for (index, block) in fetched {
                        block_set[index] = Some(block);
                    }
                }
                Err(err) => warn!("parallel fetch worker failed: {:?}", err),
            }
        }
        for block in block_set.into_iter().flatten() {
            self.add_finalized_block(block).await;
        }
        debug!(
            latest_finalized_height = self.latest_finalized_height(),
            "parallel fetch phase complete"
        );
    }

    /// Fast-sync primer: pull already-known epochs from our own sidechain in
    /// batches of 100 so the pipeline can skip replaying their mainchain
    /// blocks. Trusts local sidechain state.
    async fn speedup(&self) {
        if !self.config.speedup {
            return;
        }
        let Some(sidechain) = self.sidechain.clone() else {
            warn!("speedup enabled but no sidechain RPC endpoint configured");
            return;
        };

        let mut start = self.last_known_epoch_num as u64 + 1;
        loop {
            let infos = sidechain.vote_info_by_epoch_number(start, start + 100).await;
            if infos.is_empty() {
                break;
            }
            self.state
                .write()
                .await
                .vote_info_list
                .extend(infos.iter().cloned());
            for record in &infos {
                if record.epoch.end_time != 0 {
                    let _ = self.epoch_tx.send(record.epoch.clone()).await;
                }
                if !self.config.is_amber && record.monitor_vote.end_time != 0 {
                    let _ = self.monitor_vote_tx.send(record.monitor_vote.clone()).await;
                }
            }
            let batch_len = infos.len();
            self.latest_finalized_height
                .fetch_add(batch_len as i64 * self.num_blocks_in_epoch, Ordering::SeqCst);
            start += batch_len as u64;
        }

        let latest = self.latest_finalized_height();
        self.state.write().await.last_epoch_end_height = latest;
        self.metrics.latest_finalized_height.set(latest);
        debug!(latest_finalized_height = latest, "fast-sync complete");
    }

    /// Record a new finalized block; when it completes an epoch window,
    /// publish the epoch and its monitor vote.
    pub(crate) async fn add_finalized_block(&self, block: MainchainBlock) {
        let window_closed = {
            let mut state = self.state.write().await;
            debug_assert_eq!(
                block.height,
                self.latest_finalized_height() + 1,
                "finalized block heights must be consecutive"
            );
            let timestamp = block.timestamp;
            state.buffer.insert(block);
            let latest = self.latest_finalized_height.fetch_add(1, Ordering::SeqCst) + 1;
            self.current_mainnet_block_timestamp
                .store(timestamp, Ordering::SeqCst);
            self.metrics.latest_finalized_height.set(latest);
            self.metrics.buffered_blocks.set(state.buffer.len() as i64);
            latest - state.last_epoch_end_height == self.num_blocks_in_epoch
        };
        if window_closed {
            self.generate_new_epoch().await;
        }
    }

    /// Close the current window: build both records, publish them, then
    /// append to history and garbage-collect. The channel sends happen
    /// without the state lock held; backpressure from a slow consumer stalls
    /// the pipeline here on purpose.
    async fn generate_new_epoch(&self) {
        let (epoch, monitor_vote) = {
            let state = self.state.read().await;
            let latest = self.latest_finalized_height();
            (
                self.build_epoch_locked(&state, latest),
                self.build_monitor_vote_info_locked(&state, latest),
            )
        };
        debug!(
            start_height = epoch.start_height,
            end_time = epoch.end_time,
            "generated new epoch"
        );

        self.metrics.epochs_emitted.inc();
        let _ = self.epoch_tx.send(epoch.clone()).await;
        if let Some(info) = &monitor_vote {
            self.metrics.monitor_votes_emitted.inc();
            let _ = self.monitor_vote_tx.send(info.clone()).await;
        }

        let mut state = self.state.write().await;
        state.vote_info_list.push(VoteInfoRecord {
            epoch,
            monitor_vote: monitor_vote.unwrap_or_default(),
        });
        state.last_epoch_end_height = self.latest_finalized_height();
        self.clear_old_data(&mut state);
        self.metrics.buffered_blocks.set(state.buffer.len() as i64);
    }

    fn build_epoch_locked(&self, state: &WatcherState, latest_finalized_height: i64) -> Epoch {
        let start_height = state.last_epoch_end_height + 1;
        let mut epoch = Epoch {
            number: 0,
            start_height,
            end_time: 0,
            nominations: Vec::new(),
        };
        let mut window_nominations: Vec<&Nomination> = Vec::new();
        for height in start_height..=latest_finalized_height {
            let block = state.buffer.get(height).unwrap_or_else(|| {
                panic!(
                    "finalized block {} missing from buffer while building epoch starting at {}",
                    height, start_height
                )
            });
            // Mainchain timestamps are not always linearly increasing
            if epoch.end_time < block.timestamp {
                epoch.end_time = block.timestamp;
            }
            window_nominations.extend(block.nominations.iter());
        }
        epoch.nominations = merge_nominations(window_nominations);
        epoch
    }

    fn build_monitor_vote_info_locked(
        &self,
        state: &WatcherState,
        latest_finalized_height: i64,
    ) -> Option<MonitorVoteInfo> {
        let start_height = state.last_epoch_end_height + 1;
        if start_height < self.config.start_mainnet_height_for_cc {
            return None;
        }
        let mut window_nominations = Vec::new();
        for height in start_height..=latest_finalized_height {
            let block = state.buffer.get(height).unwrap_or_else(|| {
                panic!(
                    "finalized block {} missing from buffer while building monitor vote starting at {}",
                    height, start_height
                )
            });
            window_nominations.extend(block.cc_nominations.iter());
        }
        Some(MonitorVoteInfo {
            start_height,
            end_time: 0,
            nominations: merge_monitor_nominations(window_nominations),
        })
    }

    /// Drop buffered blocks more than five windows old and cap the vote-info
    /// history.
    fn clear_old_data(&self, state: &mut WatcherState) {
        if state.vote_info_list.is_empty() {
            return;
        }
        let height = state.last_epoch_end_height - 5 * self.num_blocks_in_epoch;
        if height > 0 {
            state.buffer.gc_from(height);
        }
        let threshold = self.config.monitor_info_clean_threshold;
        if state.vote_info_list.len() > threshold {
            let excess = state.vote_info_list.len() - threshold;
            state.vote_info_list.drain(..excess);
        }
    }
}
