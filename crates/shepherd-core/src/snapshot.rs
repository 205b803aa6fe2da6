//! Transferable image of one file's lock state.
//!
//! This is the unit an authority handoff moves: holders plus the wait
//! queue in arrival order. It is serializable because in a deployed
//! cluster it crosses the wire between the old and new authority.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use shepherd_error::LockError;
use shepherd_types::{LockMode, OwnerToken};

/// One queued request inside a [`FileStateSnapshot`], in arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedRequest {
    pub owner: OwnerToken,
    pub mode: LockMode,
}

/// Complete lock state of one file at the moment of export.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileStateSnapshot {
    pub exclusive: Option<OwnerToken>,
    pub shared: SmallVec<[OwnerToken; 4]>,
    pub waiters: Vec<QueuedRequest>,
}

impl FileStateSnapshot {
    /// Whether the snapshot carries no holders and no waiters.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.exclusive.is_none() && self.shared.is_empty() && self.waiters.is_empty()
    }

    /// Validate the holder invariants before installing the snapshot.
    pub fn verify(&self) -> Result<(), LockError> {
        if self.exclusive.is_some() && !self.shared.is_empty() {
            return Err(LockError::corrupt(
                "snapshot carries both exclusive and shared holders",
            ));
        }
        if self
            .waiters
            .iter()
            .any(|request| !request.mode.is_hold())
        {
            return Err(LockError::corrupt("snapshot queues an unlock request"));
        }
        Ok(())
    }
}
