//! Answers "where should this request go"
//!
//! The answer comes from, in order: an existing process record, the
//! scheduler's choice of a remote node, or a backend started here. Starting a
//! backend happens under the pool's distributed lock, and the process record
//! is checked again once the lock is held, so that at most one backend runs
//! per pool across the cluster.

use crate::config::ControllerConfig;
use crate::error::StoreResult;
use crate::lock::DistributedLock;
use crate::scheduler::Scheduler;
use crate::spawner::{BackendSpawner, Spawner};
use crate::tables::{Endpoint, ProcessRecord, Tables};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Where to send a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// Serve here, through the backend at this endpoint
    Local(Endpoint),
    /// Forward to the gateway node at this endpoint
    Remote(Endpoint),
    /// No backend is available
    NotFound,
}

pub struct Controller<S = Spawner> {
    tables: Arc<Tables>,
    scheduler: Scheduler,
    spawner: Arc<S>,
    node: Endpoint,
    lock_timeout: Duration,
    lock_poll: Duration,
    lock_wait: Duration,
}

fn destination_for(node: &Endpoint, record: &ProcessRecord) -> Destination {
    if record.mux_endpoint() == *node {
        Destination::Local(record.backend_endpoint())
    } else {
        Destination::Remote(record.mux_endpoint())
    }
}

impl<S: BackendSpawner + 'static> Controller<S> {
    /// `node` is this gateway's advertised endpoint, as registered by the heartbeat
    pub fn new(tables: Arc<Tables>, spawner: S, node: Endpoint, config: &ControllerConfig) -> Self {
        Self {
            scheduler: Scheduler::new(tables.clone()),
            tables,
            spawner: Arc::new(spawner),
            node,
            lock_timeout: config.lock_timeout(),
            lock_poll: config.lock_poll(),
            lock_wait: config.lock_wait(),
        }
    }

    pub fn node(&self) -> &Endpoint {
        &self.node
    }

    pub fn tables(&self) -> &Arc<Tables> {
        &self.tables
    }

    /// Route a request identified by `host` or, failing that, `access_key_id`.
    ///
    /// Returns the destination and the pool id when one was resolved. A
    /// routing miss is `(NotFound, None)`; a failed start is
    /// `(NotFound, Some(pool_id))`. Store failures are returned as errors.
    ///
    /// Dropping the returned future does not abandon a start in progress:
    /// the locked section runs on its own task until the lock is released.
    pub async fn route_request(
        &self,
        trace_id: Option<&str>,
        host: Option<&str>,
        access_key_id: Option<&str>,
    ) -> StoreResult<(Destination, Option<String>)> {
        let trace = trace_id.unwrap_or("-");

        let Some(pool_id) = self.tables.resolve_pool(host, access_key_id)? else {
            debug!(
                trace_id = trace,
                host = host.unwrap_or("-"),
                access_key_id = access_key_id.unwrap_or("-"),
                "No pool for request"
            );
            return Ok((Destination::NotFound, None));
        };

        if let Some(record) = self.tables.get_process(&pool_id)? {
            let destination = destination_for(&self.node, &record);
            debug!(trace_id = trace, pool_id = %pool_id, destination = ?destination, "Pool is running");
            return Ok((destination, Some(pool_id)));
        }

        if let Some(node) = self.scheduler.schedule(&pool_id)? {
            if node != self.node {
                debug!(trace_id = trace, pool_id = %pool_id, node = %node, "Pool placed on another node");
                return Ok((Destination::Remote(node), Some(pool_id)));
            }
        }

        let start = StartTask {
            tables: Arc::clone(&self.tables),
            spawner: Arc::clone(&self.spawner),
            node: self.node.clone(),
            lock_timeout: self.lock_timeout,
            lock_poll: self.lock_poll,
            lock_wait: self.lock_wait,
            trace_id: trace_id.map(String::from),
            pool_id: pool_id.clone(),
            host: host.map(String::from),
            access_key_id: access_key_id.map(String::from),
        };

        let destination = match tokio::spawn(start.run()).await {
            Ok(result) => result?,
            Err(e) => {
                error!(trace_id = trace, pool_id = %pool_id, error = %e, "Start task failed");
                Destination::NotFound
            }
        };
        Ok((destination, Some(pool_id)))
    }
}

/// The locked part of starting a backend, owned so it can outlive the request
struct StartTask<S> {
    tables: Arc<Tables>,
    spawner: Arc<S>,
    node: Endpoint,
    lock_timeout: Duration,
    lock_poll: Duration,
    lock_wait: Duration,
    trace_id: Option<String>,
    pool_id: String,
    host: Option<String>,
    access_key_id: Option<String>,
}

impl<S: BackendSpawner> StartTask<S> {
    async fn run(self) -> StoreResult<Destination> {
        let trace = self.trace_id.as_deref().unwrap_or("-");
        let pool_id = self.pool_id.as_str();
        let locker = DistributedLock::new(
            self.tables.store().clone(),
            format!("{}/{}", self.node, uuid::Uuid::new_v4()),
        )
        .with_poll_interval(self.lock_poll);

        let guard = match tokio::time::timeout(
            self.lock_wait,
            locker.acquire(pool_id, self.lock_timeout),
        )
        .await
        {
            Ok(guard) => guard?,
            Err(_) => {
                warn!(
                    trace_id = trace,
                    pool_id = %pool_id,
                    waited_secs = self.lock_wait.as_secs(),
                    "Gave up waiting for the pool lock"
                );
                return Ok(Destination::NotFound);
            }
        };

        // someone may have started it while we waited
        if let Some(record) = self.tables.get_process(pool_id)? {
            let destination = destination_for(&self.node, &record);
            debug!(trace_id = trace, pool_id = %pool_id, destination = ?destination, "Pool started by another request");
            guard.release()?;
            return Ok(destination);
        }

        let started = self
            .spawner
            .start_spawner(self.trace_id.as_deref(), pool_id)
            .await;

        // the pool may have been removed or rerouted during the start
        let record = match self
            .tables
            .resolve_pool(self.host.as_deref(), self.access_key_id.as_deref())?
        {
            Some(current) if current == pool_id => self.tables.get_process(pool_id)?,
            _ => None,
        };
        guard.release()?;

        match (started, record) {
            (_, Some(record)) => Ok(destination_for(&self.node, &record)),
            (None, None) => Ok(Destination::NotFound),
            (Some(endpoint), None) => {
                // can happen when the backend is torn down right after starting
                info!(
                    trace_id = trace,
                    pool_id = %pool_id,
                    endpoint = %endpoint,
                    "Reached end of the procedure without a process record"
                );
                Ok(Destination::NotFound)
            }
        }
    }
}
