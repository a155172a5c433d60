//! Poll loop: runs one dispatch cycle per interval until shut down.
//!
//! Cycles never overlap; the next one starts only after the previous one
//! returned. Run a single poller per platform.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use super::dispatch::DispatchEngine;
use crate::error::Result;

/// Configuration for the poll loop.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Time between the start of consecutive cycles.
    pub interval: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}

pub struct Poller {
    engine: Arc<DispatchEngine>,
    config: PollerConfig,
    shutdown: Arc<Notify>,
}

impl Clone for Poller {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            config: self.config.clone(),
            shutdown: Arc::clone(&self.shutdown),
        }
    }
}

impl Poller {
    pub fn new(engine: Arc<DispatchEngine>, config: PollerConfig) -> Self {
        Self {
            engine,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Signal the loop to stop after the current cycle.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Run cycles until shutdown. A failed cycle is logged and the loop
    /// carries on; its untouched markers are retried next time.
    pub async fn run(&self) -> Result<()> {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval = ?self.config.interval, limit = self.engine.limit(), "poller started");

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("poller shutting down");
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.engine.run_cycle().await {
                error!("dispatch cycle failed: {e}");
            }
        }
    }
}
