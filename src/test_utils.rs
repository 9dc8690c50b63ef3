// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! A mock implementation of the watcher RPC seam, plus small fixture
//! builders shared across the unit tests.

use crate::rpc_client::WatcherRpc;
use crate::types::{
    MainchainBlock, MainchainBlockInfo, MonitorNomination, MonitorPubkey, MonitorVoteInfo,
    Nomination, ValidatorPubkey, VoteInfoRecord,
};
use anyhow::anyhow;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Mutex, Once};

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

// Mock endpoint used in test environments. Responses are pre-populated by
// the test before the watcher runs.
#[derive(Debug, Default)]
pub struct MockRpc {
    latest_height: AtomicI64,
    fail_rpc: AtomicBool,
    blocks: Mutex<HashMap<i64, MainchainBlock>>,
    block_infos: Mutex<HashMap<i64, MainchainBlockInfo>>,
    vote_records: Mutex<HashMap<u64, VoteInfoRecord>>,
    block_fetches: Mutex<HashMap<i64, usize>>,
}

impl MockRpc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_latest_height(&self, height: i64) {
        self.latest_height.store(height, Ordering::SeqCst);
    }

    /// Make every call return an error, for probing failure paths.
    pub fn set_fail_rpc(&self, fail: bool) {
        self.fail_rpc.store(fail, Ordering::SeqCst);
    }

    pub fn add_block(&self, block: MainchainBlock) {
        self.blocks.lock().unwrap().insert(block.height, block);
    }

    pub fn add_block_info(&self, info: MainchainBlockInfo) {
        self.block_infos.lock().unwrap().insert(info.height, info);
    }

    pub fn add_vote_record(&self, epoch_number: u64, record: VoteInfoRecord) {
        self.vote_records.lock().unwrap().insert(epoch_number, record);
    }

    /// How many times a full block at `height` was requested.
    pub fn block_fetch_count(&self, height: i64) -> usize {
        self.block_fetches
            .lock()
            .unwrap()
            .get(&height)
            .copied()
            .unwrap_or(0)
    }

    fn check_available(&self) -> anyhow::Result<()> {
        if self.fail_rpc.load(Ordering::SeqCst) {
            return Err(anyhow!("mock rpc failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl WatcherRpc for MockRpc {
    async fn get_latest_height(&self) -> anyhow::Result<i64> {
        self.check_available()?;
        Ok(self.latest_height.load(Ordering::SeqCst))
    }

    async fn get_block_by_height(&self, height: i64) -> anyhow::Result<Option<MainchainBlock>> {
        self.check_available()?;
        *self
            .block_fetches
            .lock()
            .unwrap()
            .entry(height)
            .or_insert(0) += 1;
        Ok(self.blocks.lock().unwrap().get(&height).cloned())
    }

    async fn get_block_info_by_height(
        &self,
        height: i64,
    ) -> anyhow::Result<Option<MainchainBlockInfo>> {
        self.check_available()?;
        Ok(self.block_infos.lock().unwrap().get(&height).cloned())
    }

    async fn get_vote_info_by_epoch_number(
        &self,
        start: u64,
        end: u64,
    ) -> anyhow::Result<Vec<VoteInfoRecord>> {
        self.check_available()?;
        let records = self.vote_records.lock().unwrap();
        let mut batch = Vec::new();
        for epoch_number in start..end {
            match records.get(&epoch_number) {
                Some(record) => batch.push(record.clone()),
                None => break,
            }
        }
        Ok(batch)
    }
}

pub fn validator_pubkey(byte: u8) -> ValidatorPubkey {
    let mut pubkey = [0u8; 32];
    pubkey[31] = byte;
    pubkey
}

pub fn monitor_pubkey(byte: u8) -> MonitorPubkey {
    let mut pubkey = [0u8; 33];
    pubkey[32] = byte;
    pubkey
}

pub fn make_block(height: i64, timestamp: i64, nominations: Vec<Nomination>) -> MainchainBlock {
    MainchainBlock {
        height,
        timestamp,
        nominations,
        cc_nominations: vec![],
    }
}

pub fn make_block_with_cc(
    height: i64,
    timestamp: i64,
    nominations: Vec<Nomination>,
    cc_nominations: Vec<MonitorNomination>,
) -> MainchainBlock {
    MainchainBlock {
        height,
        timestamp,
        nominations,
        cc_nominations,
    }
}

pub fn make_block_info(height: i64) -> MainchainBlockInfo {
    MainchainBlockInfo {
        height,
        hash: format!("blockhash{:08}", height),
        transactions: vec![],
    }
}

/// A fully populated vote record as the sidechain would return it during
/// fast sync.
pub fn make_vote_record(epoch_number: i64, num_blocks_in_epoch: i64) -> VoteInfoRecord {
    let start_height = (epoch_number - 1) * num_blocks_in_epoch + 1;
    VoteInfoRecord {
        epoch: crate::types::Epoch {
            number: epoch_number,
            start_height,
            end_time: 1_000 + epoch_number,
            nominations: vec![],
        },
        monitor_vote: MonitorVoteInfo {
            start_height,
            end_time: 1_000 + epoch_number,
            nominations: vec![],
        },
    }
}
