//! One node's authoritative lock service.
//!
//! An instance wraps a [`LockTable`] and refuses any operation the
//! registry has not placed on its node. The per-file epoch view is the
//! fencing token: if the registry's epoch for a file ever disagrees with
//! what this instance recorded, a handoff happened behind its back and
//! the instance must treat itself as a zombie for that file rather than
//! serve stale state.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use shepherd_core::LockTable;
use shepherd_error::{LockError, Result};
use shepherd_observability::LockObserver;
use shepherd_types::{AuthorityEpoch, FileId, LockRequest, NodeId, OwnerToken};

use crate::registry::AuthorityRegistry;

/// The authoritative lock service for one node.
pub struct AuthorityInstance {
    node: NodeId,
    registry: Arc<AuthorityRegistry>,
    table: LockTable,
    /// Epoch at which this instance last served each file.
    epochs: Mutex<HashMap<FileId, AuthorityEpoch>>,
}

impl AuthorityInstance {
    #[must_use]
    pub fn new(node: NodeId, registry: Arc<AuthorityRegistry>) -> Self {
        Self {
            node,
            registry,
            table: LockTable::new(),
            epochs: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn with_observer(
        node: NodeId,
        registry: Arc<AuthorityRegistry>,
        observer: Arc<dyn LockObserver>,
    ) -> Self {
        Self {
            node,
            registry,
            table: LockTable::with_observer(observer),
            epochs: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn node(&self) -> NodeId {
        self.node
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<AuthorityRegistry> {
        &self.registry
    }

    /// The underlying table, for introspection and the handoff protocol.
    #[must_use]
    pub fn table(&self) -> &LockTable {
        &self.table
    }

    /// Refuse the request unless this node is the file's stable authority
    /// at the epoch this instance believes in.
    fn check_authority(&self, file: FileId) -> Result<()> {
        let registry_epoch = self.registry.check(file, self.node)?;
        let local = {
            let mut epochs = self.epochs.lock();
            *epochs.entry(file).or_insert(registry_epoch)
        };
        if local != registry_epoch {
            // The registry moved authority away and back (or reassigned
            // it) without this instance participating: its state for the
            // file cannot be trusted.
            let err = LockError::SplitBrain { file: file.get() };
            tracing::error!(
                %file,
                node = %self.node,
                %local,
                registry = %registry_epoch,
                "epoch fence tripped; refusing to serve stale lock state"
            );
            self.table.fail_file(file, err.clone());
            return Err(err);
        }
        Ok(())
    }

    /// Serve a lock request routed to this node.
    pub fn lock(&self, request: &LockRequest) -> Result<()> {
        self.check_authority(request.file)?;
        self.table
            .lock(request.file, request.owner, request.mode, request.wait)
    }

    /// Serve an unlock routed to this node.
    pub fn unlock(&self, file: FileId, owner: OwnerToken) -> Result<()> {
        self.check_authority(file)?;
        self.table.unlock(file, owner)
    }

    /// Cancel `owner`'s queued waits on `file`, waking them with `error`.
    pub fn cancel_waits(
        &self,
        file: FileId,
        owner: OwnerToken,
        error: LockError,
    ) -> Result<usize> {
        self.check_authority(file)?;
        Ok(self.table.cancel_waits(file, owner, error))
    }

    pub(crate) fn record_epoch(&self, file: FileId, epoch: AuthorityEpoch) {
        self.epochs.lock().insert(file, epoch);
    }

    pub(crate) fn forget_epoch(&self, file: FileId) {
        self.epochs.lock().remove(&file);
    }
}

impl std::fmt::Debug for AuthorityInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorityInstance")
            .field("node", &self.node)
            .field("files", &self.table.file_count())
            .finish()
    }
}
