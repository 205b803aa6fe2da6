//! In-process stand-in for a cluster of authority nodes.
//!
//! A deployed client reaches remote authorities through the transport
//! layer; here every authority instance lives in the same process and
//! `route` hands back a direct reference. Rebalancing is driven through
//! [`Cluster::transfer`].

use std::collections::HashMap;
use std::sync::Arc;

use shepherd_authority::{AuthorityInstance, AuthorityRegistry, transfer_authority};
use shepherd_error::{LockError, Result};
use shepherd_observability::LockObserver;
use shepherd_types::{AuthorityEpoch, FileId, NodeId};

/// A registry plus one authority instance per node.
pub struct Cluster {
    registry: Arc<AuthorityRegistry>,
    instances: HashMap<NodeId, Arc<AuthorityInstance>>,
}

impl Cluster {
    /// Build a cluster of `node_count` nodes with ids `0..node_count`.
    ///
    /// # Panics
    ///
    /// Panics if `node_count` is zero.
    #[must_use]
    pub fn new(node_count: u32) -> Self {
        Self::build(node_count, None)
    }

    /// Same as [`Cluster::new`] with one observer shared by every node.
    #[must_use]
    pub fn with_observer(node_count: u32, observer: Arc<dyn LockObserver>) -> Self {
        Self::build(node_count, Some(observer))
    }

    fn build(node_count: u32, observer: Option<Arc<dyn LockObserver>>) -> Self {
        assert!(node_count > 0, "cluster needs at least one node");
        let nodes: Vec<NodeId> = (0..node_count).map(NodeId::new).collect();
        let registry = Arc::new(AuthorityRegistry::new(nodes.clone()));
        let instances = nodes
            .into_iter()
            .map(|node| {
                let instance = match &observer {
                    Some(observer) => AuthorityInstance::with_observer(
                        node,
                        Arc::clone(&registry),
                        Arc::clone(observer),
                    ),
                    None => AuthorityInstance::new(node, Arc::clone(&registry)),
                };
                (node, Arc::new(instance))
            })
            .collect();
        Self {
            registry,
            instances,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<AuthorityRegistry> {
        &self.registry
    }

    /// The instance serving `node`, if it exists.
    #[must_use]
    pub fn instance(&self, node: NodeId) -> Option<&Arc<AuthorityInstance>> {
        self.instances.get(&node)
    }

    /// The instance currently authoritative for `file`.
    #[must_use]
    pub fn route(&self, file: FileId) -> Arc<AuthorityInstance> {
        let node = self.registry.authority_of(file);
        Arc::clone(
            self.instances
                .get(&node)
                .expect("registry only places files on registered nodes"),
        )
    }

    /// Move the authority for `file` onto `to`.
    pub fn transfer(&self, file: FileId, to: NodeId) -> Result<AuthorityEpoch> {
        let target = self
            .instances
            .get(&to)
            .ok_or_else(|| LockError::invalid_argument(format!("unknown node {to}")))?;
        let source = self.route(file);
        transfer_authority(file, &source, target)
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("nodes", &self.instances.len())
            .finish()
    }
}
