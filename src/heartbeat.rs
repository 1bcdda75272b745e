//! Node registration
//!
//! A node is schedulable only while its `mx:` record exists. The record is
//! rewritten periodically with an expiry, so a crashed node drops out of
//! placement once its last registration expires.

use crate::config::HeartbeatConfig;
use crate::error::StoreResult;
use crate::tables::{Endpoint, NodeRecord, Tables};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Upper bound of the random delay added to each interval
pub const MAX_JITTER: Duration = Duration::from_secs(2);

pub struct Heartbeat {
    tables: Arc<Tables>,
    node: Endpoint,
    interval: Duration,
    ttl: Duration,
    started_at: i64,
}

impl Heartbeat {
    pub fn new(tables: Arc<Tables>, node: Endpoint, config: &HeartbeatConfig) -> Self {
        Self {
            tables,
            node,
            interval: config.interval(),
            ttl: config.ttl(),
            started_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Write this node's registration with a fresh expiry
    pub fn register(&self) -> StoreResult<()> {
        let record = NodeRecord {
            host: self.node.host.clone(),
            port: self.node.port,
            started_at: self.started_at,
            last_heartbeat: chrono::Utc::now().timestamp(),
        };
        self.tables.register_node(&record, self.ttl)?;
        debug!(node = %self.node, "Registered node");
        Ok(())
    }

    pub fn deregister(&self) -> StoreResult<()> {
        self.tables.deregister_node(&self.node)?;
        info!(node = %self.node, "Deregistered node");
        Ok(())
    }

    fn next_delay(&self) -> Duration {
        let jitter_ms = rand::thread_rng().gen_range(0..=MAX_JITTER.as_millis() as u64);
        self.interval + Duration::from_millis(jitter_ms)
    }

    /// Register now and then periodically until shutdown, then deregister
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        if let Err(e) = self.register() {
            warn!(node = %self.node, error = %e, "Failed to register node");
        }

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.next_delay()) => {
                    if let Err(e) = self.register() {
                        warn!(node = %self.node, error = %e, "Failed to refresh node registration");
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        if let Err(e) = self.deregister() {
            warn!(node = %self.node, error = %e, "Failed to deregister node");
        }
    }
}
