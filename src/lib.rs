//! poolmux - a multi-tenant gateway for per-pool storage backends
//!
//! Every pool of buckets is served by its own backend process. The gateway:
//! - Resolves a request's pool from its Host header or access key
//! - Forwards to the node already running that pool's backend
//! - Otherwise places the backend on the least loaded node
//! - Starts it there under a cluster-wide lock, so each pool has at most one
//!   backend at a time
//!
//! Nodes coordinate only through a shared table store.

pub mod admin;
pub mod config;
pub mod controller;
pub mod error;
pub mod heartbeat;
pub mod lock;
#[cfg(unix)]
pub mod manager;
pub mod pool;
pub mod proxy;
pub mod scheduler;
pub mod spawner;
pub mod store;
pub mod tables;
