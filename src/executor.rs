// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Watcher-facing surface of the cross-chain contract executor.
//!
//! The collector hands the executor one [`CollectionResult`] message per
//! rescan window; the executor applies the whole `{infos, last_end}` tuple
//! under its own mutex, so readers never observe a partial write, and closes
//! its derived init latch after the first application.

use crate::latch::Latch;
use crate::types::{CcTransferInfo, CollectionResult};
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct ExecutorState {
    infos: Vec<CcTransferInfo>,
    last_end_rescan_block: u64,
}

#[derive(Debug)]
pub struct CcExecutor {
    state: Mutex<ExecutorState>,
    init_collect_done: Latch,
}

impl CcExecutor {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ExecutorState::default()),
            init_collect_done: Latch::new("executor-init-collect"),
        }
    }

    /// Apply a collection result atomically. Safe to call with an unchanged
    /// window; the assignment is a full replacement either way.
    pub async fn apply(&self, result: CollectionResult) {
        {
            let mut state = self.state.lock().await;
            state.infos = result.infos;
            state.last_end_rescan_block = result.last_end_rescan_block;
        }
        self.init_collect_done.set();
    }

    /// Copy of the current transfer set and rescan watermark, taken under
    /// the same mutex the collector writes with.
    pub async fn snapshot(&self) -> (Vec<CcTransferInfo>, u64) {
        let state = self.state.lock().await;
        (state.infos.clone(), state.last_end_rescan_block)
    }

    /// One-shot latch closed after the first collection round.
    pub fn init_collect_done(&self) -> &Latch {
        &self.init_collect_done
    }
}

impl Default for CcExecutor {
    fn default() -> Self {
        Self::new()
    }
}
