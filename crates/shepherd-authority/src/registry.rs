//! Cluster-wide placement truth: which node owns a file's lock state.
//!
//! The registry stands in for the metadata service a deployed cluster
//! would consult (the transport collaborator's concern). It answers one
//! question (who is the authority for this file, at which epoch) and
//! brokers the two-step transfer protocol. It never holds lock state
//! itself.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::Serialize;

use shepherd_error::{LockError, Result};
use shepherd_types::{AuthorityEpoch, FileId, NodeId};

/// Where a file's authority currently is, and whether it is moving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlacementView {
    pub node: NodeId,
    pub epoch: AuthorityEpoch,
    pub transferring: bool,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Stable,
    Transferring { from: NodeId, to: NodeId },
}

#[derive(Debug, Clone, Copy)]
struct Placement {
    node: NodeId,
    epoch: AuthorityEpoch,
    phase: Phase,
}

/// The single source of authority placement for a set of nodes.
///
/// Placements are created lazily at epoch zero, spread deterministically
/// over the registered nodes.
pub struct AuthorityRegistry {
    nodes: Vec<NodeId>,
    placements: Mutex<HashMap<FileId, Placement>>,
}

impl AuthorityRegistry {
    /// Create a registry over `nodes`.
    ///
    /// # Panics
    ///
    /// Panics if `nodes` is empty or contains duplicates.
    #[must_use]
    pub fn new(nodes: Vec<NodeId>) -> Self {
        assert!(!nodes.is_empty(), "registry needs at least one node");
        let mut seen = nodes.clone();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), nodes.len(), "duplicate node ids");
        Self {
            nodes,
            placements: Mutex::new(HashMap::new()),
        }
    }

    /// The registered node set, in registration order.
    #[must_use]
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    fn default_node(&self, file: FileId) -> NodeId {
        self.nodes[(file.get() as usize) % self.nodes.len()]
    }

    fn placement_entry(&self, map: &mut HashMap<FileId, Placement>, file: FileId) -> Placement {
        *map.entry(file).or_insert_with(|| Placement {
            node: self.default_node(file),
            epoch: AuthorityEpoch::ZERO,
            phase: Phase::Stable,
        })
    }

    /// Current placement of `file` (created lazily at epoch zero).
    #[must_use]
    pub fn placement(&self, file: FileId) -> PlacementView {
        let mut map = self.placements.lock();
        let placement = self.placement_entry(&mut map, file);
        PlacementView {
            node: placement.node,
            epoch: placement.epoch,
            transferring: matches!(placement.phase, Phase::Transferring { .. }),
        }
    }

    /// The node currently authoritative for `file`.
    #[must_use]
    pub fn authority_of(&self, file: FileId) -> NodeId {
        self.placement(file).node
    }

    /// Validate that `node` may serve requests for `file` right now.
    ///
    /// Returns the placement epoch for the caller's fencing check.
    pub fn check(&self, file: FileId, node: NodeId) -> Result<AuthorityEpoch> {
        let mut map = self.placements.lock();
        let placement = self.placement_entry(&mut map, file);
        if matches!(placement.phase, Phase::Transferring { .. }) {
            return Err(LockError::AuthorityTransferring { file: file.get() });
        }
        if placement.node != node {
            return Err(LockError::NotAuthoritative {
                file: file.get(),
                node: node.get(),
            });
        }
        Ok(placement.epoch)
    }

    /// Step one of a handoff: mark the file transferring so no instance
    /// accepts operations until the transfer commits or aborts.
    pub fn begin_transfer(&self, file: FileId, from: NodeId, to: NodeId) -> Result<()> {
        if !self.nodes.contains(&to) {
            return Err(LockError::invalid_argument(format!(
                "unknown transfer target {to}"
            )));
        }
        if from == to {
            return Err(LockError::invalid_argument(
                "transfer source and target are the same node",
            ));
        }
        let mut map = self.placements.lock();
        let placement = self.placement_entry(&mut map, file);
        if matches!(placement.phase, Phase::Transferring { .. }) {
            return Err(LockError::AuthorityTransferring { file: file.get() });
        }
        if placement.node != from {
            return Err(LockError::NotAuthoritative {
                file: file.get(),
                node: from.get(),
            });
        }
        let entry = map.get_mut(&file).expect("placement inserted above");
        entry.phase = Phase::Transferring { from, to };
        tracing::info!(%file, %from, %to, "authority transfer begun");
        Ok(())
    }

    /// Final step of a handoff: the new node is authoritative at the next
    /// epoch.
    pub fn commit_transfer(&self, file: FileId) -> Result<AuthorityEpoch> {
        let mut map = self.placements.lock();
        let Some(entry) = map.get_mut(&file) else {
            return Err(LockError::invalid_argument("no placement for file"));
        };
        let Phase::Transferring { to, .. } = entry.phase else {
            return Err(LockError::invalid_argument("no transfer in progress"));
        };
        entry.node = to;
        entry.epoch = entry.epoch.next();
        entry.phase = Phase::Stable;
        tracing::info!(%file, node = %entry.node, epoch = %entry.epoch, "authority transfer committed");
        Ok(entry.epoch)
    }

    /// Abort an in-flight handoff, restoring the source as authority at
    /// the unchanged epoch.
    pub fn abort_transfer(&self, file: FileId) -> Result<()> {
        let mut map = self.placements.lock();
        let Some(entry) = map.get_mut(&file) else {
            return Err(LockError::invalid_argument("no placement for file"));
        };
        let Phase::Transferring { from, .. } = entry.phase else {
            return Err(LockError::invalid_argument("no transfer in progress"));
        };
        entry.node = from;
        entry.phase = Phase::Stable;
        tracing::warn!(%file, node = %from, "authority transfer aborted");
        Ok(())
    }
}

impl std::fmt::Debug for AuthorityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorityRegistry")
            .field("nodes", &self.nodes)
            .field("placements", &self.placements.lock().len())
            .finish()
    }
}
