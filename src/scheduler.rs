//! Least-loaded placement of new backends

use crate::error::StoreResult;
use crate::tables::{Endpoint, NodeRecord, ProcessRecord, Tables};
use std::sync::Arc;
use tracing::debug;

/// Picks the gateway node that should host a new backend.
///
/// Stateless: every call reads a fresh snapshot of the node registry and the
/// process census.
pub struct Scheduler {
    tables: Arc<Tables>,
}

impl Scheduler {
    pub fn new(tables: Arc<Tables>) -> Self {
        Self { tables }
    }

    /// Choose a node for `pool_id`.
    ///
    /// `None` means no node is registered and the caller should use itself.
    /// The pool id does not influence placement.
    pub fn schedule(&self, pool_id: &str) -> StoreResult<Option<Endpoint>> {
        let nodes = self.tables.list_nodes()?;
        let processes = self.tables.list_processes()?;
        let chosen = least_loaded(&nodes, &processes);
        debug!(
            pool_id = %pool_id,
            nodes = nodes.len(),
            processes = processes.len(),
            chosen = ?chosen.as_ref().map(|ep| ep.to_string()),
            "Scheduled"
        );
        Ok(chosen)
    }
}

/// The registered node with the fewest running backends.
///
/// Every registered node starts with one unit of load so that idle nodes are
/// counted at all; each process record adds one unit to its hosting node.
/// Records for unregistered nodes are ignored. Ties go to the node tallied
/// first: nodes hosting backends in census order, then idle nodes in
/// endpoint order.
pub fn least_loaded(nodes: &[NodeRecord], processes: &[(String, ProcessRecord)]) -> Option<Endpoint> {
    let mut registered: Vec<Endpoint> = nodes.iter().map(NodeRecord::endpoint).collect();
    registered.sort();
    registered.dedup();
    if registered.is_empty() {
        return None;
    }

    let mut tally: Vec<(Endpoint, usize)> = Vec::with_capacity(registered.len());
    let mut count = |node: Endpoint| match tally.iter_mut().find(|(ep, _)| *ep == node) {
        Some((_, load)) => *load += 1,
        None => tally.push((node, 1)),
    };

    for (_, process) in processes {
        let node = process.mux_endpoint();
        if registered.binary_search(&node).is_ok() {
            count(node);
        }
    }
    for node in registered {
        count(node);
    }

    // min_by_key keeps the first of equal minima
    tally
        .into_iter()
        .min_by_key(|(_, load)| *load)
        .map(|(node, _)| node)
}
