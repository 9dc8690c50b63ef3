// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Data model shared between the watcher, its output channels and the
//! cross-chain collector.
//!
//! These types are pure data and can be consumed by business logic without
//! tight coupling to the watcher implementation.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Compressed validator public key contributed by mainchain coinbase votes.
pub type ValidatorPubkey = [u8; 32];

/// Compressed secp256k1 key identifying a cross-chain monitor.
pub type MonitorPubkey = [u8; 33];

/// A 20-byte covenant (custody) address on the mainchain.
pub type CovenantAddress = [u8; 20];

/// A (pubkey, count) pair contributed by one mainchain block; merged across
/// an epoch window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nomination {
    pub pubkey: ValidatorPubkey,
    pub nominated_count: i64,
}

/// Cross-chain analog of [`Nomination`], governing the monitor set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorNomination {
    #[serde(with = "monitor_pubkey_serde")]
    pub pubkey: MonitorPubkey,
    pub nominated_count: i64,
}

/// A finalized mainchain block, immutable once buffered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MainchainBlock {
    pub height: i64,
    /// Unix seconds. Mainchain timestamps are not monotonic across
    /// adjacent blocks.
    pub timestamp: i64,
    #[serde(default)]
    pub nominations: Vec<Nomination>,
    #[serde(default)]
    pub cc_nominations: Vec<MonitorNomination>,
}

/// Lighter block variant handed to the UTXO parser; carries the raw
/// transactions instead of the derived nominations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MainchainBlockInfo {
    pub height: i64,
    pub hash: String,
    #[serde(default)]
    pub transactions: Vec<serde_json::Value>,
}

/// A fixed-length window of finalized mainchain blocks folded into one
/// staking directive. `number` is assigned by the consumer, not here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Epoch {
    pub number: i64,
    pub start_height: i64,
    /// Maximum timestamp of any block in the window, not the last block's.
    pub end_time: i64,
    pub nominations: Vec<Nomination>,
}

/// Monitor-set directive paired with an epoch. A zero `end_time` marks a
/// locally built (or suppressed) record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorVoteInfo {
    pub start_height: i64,
    pub end_time: i64,
    pub nominations: Vec<MonitorNomination>,
}

/// Retained history pair; a suppressed monitor vote is stored as the empty
/// default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteInfoRecord {
    pub epoch: Epoch,
    #[serde(default)]
    pub monitor_vote: MonitorVoteInfo,
}

/// Rescan window handed to the collector by the context getter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UtxoCollectParam {
    pub begin_height: i64,
    pub end_height: i64,
    pub current_covenant_address: CovenantAddress,
    pub prev_covenant_address: CovenantAddress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferKind {
    Transfer,
    Convert,
    RedeemOrLostAndFound,
}

/// One cross-chain UTXO transfer extracted by the parser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CcTransferInfo {
    pub kind: TransferKind,
    pub txid: [u8; 32],
    pub vout: u32,
    pub amount: i64,
    pub sender_pubkey_hash: CovenantAddress,
    pub receiver: CovenantAddress,
    pub covenant_address: CovenantAddress,
}

/// Everything the collector publishes to the executor in one message. The
/// executor applies the whole tuple atomically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionResult {
    pub infos: Vec<CcTransferInfo>,
    pub last_end_rescan_block: u64,
}

// Sort by pubkey (small to big) first; then stable-sort by nomination count,
// so equal counts keep the smaller pubkey in front.
pub fn sort_nominations(nominations: &mut [Nomination]) {
    nominations.sort_unstable_by(|a, b| a.pubkey.cmp(&b.pubkey));
    nominations.sort_by(|a, b| b.nominated_count.cmp(&a.nominated_count));
}

pub fn sort_monitor_nominations(nominations: &mut [MonitorNomination]) {
    nominations.sort_unstable_by(|a, b| a.pubkey.as_slice().cmp(b.pubkey.as_slice()));
    nominations.sort_by(|a, b| b.nominated_count.cmp(&a.nominated_count));
}

/// Accumulate nomination counts by pubkey and return the deterministically
/// sorted result.
pub fn merge_nominations<'a, I>(nominations: I) -> Vec<Nomination>
where
    I: IntoIterator<Item = &'a Nomination>,
{
    let mut by_pubkey: HashMap<ValidatorPubkey, i64> = HashMap::new();
    for nomination in nominations {
        *by_pubkey.entry(nomination.pubkey).or_insert(0) += nomination.nominated_count;
    }
    let mut merged: Vec<Nomination> = by_pubkey
        .into_iter()
        .map(|(pubkey, nominated_count)| Nomination {
            pubkey,
            nominated_count,
        })
        .collect();
    sort_nominations(&mut merged);
    merged
}

pub fn merge_monitor_nominations<'a, I>(nominations: I) -> Vec<MonitorNomination>
where
    I: IntoIterator<Item = &'a MonitorNomination>,
{
    let mut by_pubkey: HashMap<MonitorPubkey, i64> = HashMap::new();
    for nomination in nominations {
        *by_pubkey.entry(nomination.pubkey).or_insert(0) += nomination.nominated_count;
    }
    let mut merged: Vec<MonitorNomination> = by_pubkey
        .into_iter()
        .map(|(pubkey, nominated_count)| MonitorNomination {
            pubkey,
            nominated_count,
        })
        .collect();
    sort_monitor_nominations(&mut merged);
    merged
}

// serde does not derive for [u8; 33]; keep the wire shape a plain byte
// sequence.
mod monitor_pubkey_serde {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(pubkey: &[u8; 33], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(pubkey)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 33], D::Error> {
        let bytes = <Vec<u8>>::deserialize(deserializer)?;
        bytes
            .try_into()
            .map_err(|_| D::Error::custom("monitor pubkey must be 33 bytes"))
    }
}
