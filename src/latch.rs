// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! One-shot latch used for the catch-up signal and the executor's first
//! collection round. Setting is idempotent; waiters observe the transition
//! at most once.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug)]
pub struct Latch {
    name: &'static str,
    set: AtomicBool,
    sender: watch::Sender<bool>,
    receiver: watch::Receiver<bool>,
}

impl Latch {
    pub fn new(name: &'static str) -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            name,
            set: AtomicBool::new(false),
            sender,
            receiver,
        }
    }

    /// Set the latch. Only the first call has any effect.
    pub fn set(&self) {
        if !self.set.swap(true, Ordering::SeqCst) {
            debug!(latch = self.name, "latch set");
            let _ = self.sender.send(true);
        }
    }

    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::SeqCst)
    }

    /// Wait until the latch is set. Returns immediately if it already is.
    pub async fn wait(&self) {
        let mut receiver = self.receiver.clone();
        while !*receiver.borrow() {
            if receiver.changed().await.is_err() {
                return;
            }
        }
    }

    /// Subscribe to latch transitions
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.receiver.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_initial_state() {
        let latch = Latch::new("test");
        assert!(!latch.is_set());
        assert!(!*latch.subscribe().borrow());
    }

    #[test]
    fn test_set_is_idempotent() {
        let latch = Latch::new("test");
        latch.set();
        latch.set();
        latch.set();
        assert!(latch.is_set());
        assert!(*latch.subscribe().borrow());
    }

    #[tokio::test]
    async fn test_wait_completes_after_set() {
        let latch = Arc::new(Latch::new("test"));
        let latch_clone = latch.clone();

        let wait_handle = tokio::spawn(async move {
            latch_clone.wait().await;
        });

        latch.set();
        tokio::time::timeout(std::time::Duration::from_secs(1), wait_handle)
            .await
            .expect("Timeout waiting for latch")
            .expect("Task panicked");
    }

    #[tokio::test]
    async fn test_wait_returns_immediately_when_already_set() {
        let latch = Latch::new("test");
        latch.set();
        tokio::time::timeout(std::time::Duration::from_millis(100), latch.wait())
            .await
            .expect("Should complete immediately when already set");
    }
}
