// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Watcher configuration
//!
//! All tunables of the watcher live here, including the constants the
//! original deployment compiled in (finalize depth, history cap) so tests
//! can vary them without process-global state.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WatcherConfig {
    /// Rpc url for the mainchain fullnode, used for height and block queries.
    #[serde(default)]
    pub mainnet_rpc_url: String,

    /// Basic-auth username for the mainchain RPC.
    #[serde(default)]
    pub mainnet_rpc_username: String,

    /// Basic-auth password for the mainchain RPC.
    #[serde(default)]
    pub mainnet_rpc_password: String,

    /// Rpc url of our own sidechain node, used by the fast-sync primer.
    #[serde(default)]
    pub sidechain_rpc_url: String,

    /// Enable the fast-sync primer at startup.
    #[serde(default)]
    pub speedup: bool,

    /// Number of consecutive finalized blocks folded into one epoch.
    #[serde(default = "default_num_blocks_in_epoch")]
    pub num_blocks_in_epoch: i64,

    /// Seconds to sleep between tip polls once caught up.
    #[serde(default = "default_waiting_block_delay_time")]
    pub waiting_block_delay_time: u64,

    /// Worker count for the catch-up and collector range fetches.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// Monitor votes are suppressed for windows starting below this height.
    #[serde(default)]
    pub start_mainnet_height_for_cc: i64,

    /// Blocks to lag behind the mainchain tip before treating a block as
    /// immutable. 1 in tests, 9 or more in production.
    #[serde(default = "default_finalize_depth")]
    pub finalize_depth: i64,

    /// Amber test variant: the UTXO collector is not started.
    #[serde(default)]
    pub is_amber: bool,

    /// Vote-info history entries retained after trimming.
    #[serde(default = "default_monitor_info_clean_threshold")]
    pub monitor_info_clean_threshold: usize,

    /// Buffering of the epoch output channel.
    #[serde(default = "default_epoch_channel_size")]
    pub epoch_channel_size: usize,

    /// Buffering of the monitor-vote output channel.
    #[serde(default = "default_monitor_vote_channel_size")]
    pub monitor_vote_channel_size: usize,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            mainnet_rpc_url: String::new(),
            mainnet_rpc_username: String::new(),
            mainnet_rpc_password: String::new(),
            sidechain_rpc_url: String::new(),
            speedup: false,
            num_blocks_in_epoch: default_num_blocks_in_epoch(),
            waiting_block_delay_time: default_waiting_block_delay_time(),
            parallelism: default_parallelism(),
            start_mainnet_height_for_cc: 0,
            finalize_depth: default_finalize_depth(),
            is_amber: false,
            monitor_info_clean_threshold: default_monitor_info_clean_threshold(),
            epoch_channel_size: default_epoch_channel_size(),
            monitor_vote_channel_size: default_monitor_vote_channel_size(),
        }
    }
}

fn default_num_blocks_in_epoch() -> i64 {
    2016
}

fn default_waiting_block_delay_time() -> u64 {
    2
}

fn default_parallelism() -> usize {
    10
}

fn default_finalize_depth() -> i64 {
    9
}

fn default_monitor_info_clean_threshold() -> usize {
    5
}

fn default_epoch_channel_size() -> usize {
    10_000
}

fn default_monitor_vote_channel_size() -> usize {
    5_000
}

impl WatcherConfig {
    /// Config used by unit tests: finality lag of one block and no real
    /// endpoints configured.
    pub fn for_testing() -> Self {
        Self {
            finalize_depth: 1,
            ..Default::default()
        }
    }
}
