// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Mainnet watcher: observes finalized blocks of an external proof-of-work
//! mainchain and derives the epoch and monitor-vote inputs that drive a
//! sidechain's validator-set and monitor-set rotation.

pub mod buffer;
pub mod collector;
pub mod config;
pub mod error;
pub mod executor;
pub mod latch;
pub mod metrics;
pub mod rpc_client;
pub mod types;
pub mod watcher;

#[cfg(test)]
pub mod test_utils;

#[macro_export]
macro_rules! retry_with_max_elapsed_time {
    ($func:expr, $max_elapsed_time:expr) => {{
        // Jittered delays of roughly 0.4s, 0.8s, 1.6s, ... capped at 120s,
        // until max_elapsed_time runs out
        let backoff = backoff::ExponentialBackoff {
            initial_interval: std::time::Duration::from_millis(400),
            randomization_factor: 0.1,
            multiplier: 2.0,
            max_interval: std::time::Duration::from_secs(120),
            max_elapsed_time: Some($max_elapsed_time),
            ..Default::default()
        };
        backoff::future::retry(backoff, || {
            let fut = async {
                let result = $func.await;
                match result {
                    Ok(_) => {
                        return Ok(result);
                    }
                    Err(e) => {
                        // Every error counts as transient here; the elapsed-time
                        // cap is the only thing that stops the retries
                        tracing::debug!("Retrying due to error: {:?}", e);
                        return Err(backoff::Error::transient(e));
                    }
                }
            };
            std::boxed::Box::pin(fut)
        })
        .await
    }};
}
