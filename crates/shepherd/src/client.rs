//! The client-facing lock surface: open, lock, unlock, close.
//!
//! A [`LockClient`] is what a mount session embeds. It keeps the handle
//! registry (one entry per open-file-description) and routes every lock
//! operation to the file's current authority, retrying transparently when
//! a request lands mid-handoff or on a node that just lost the file.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use shepherd_authority::AuthorityInstance;
use shepherd_error::{LockError, Result};
use shepherd_types::{FileId, HandleId, LockMode, LockRequest, OwnerToken, WaitPolicy};

use crate::cluster::Cluster;
use crate::config::ClientConfig;

/// An open-file-description as seen by lock callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileHandle {
    id: HandleId,
}

impl FileHandle {
    #[must_use]
    pub fn id(&self) -> HandleId {
        self.id
    }
}

struct HandleState {
    file: FileId,
    /// Owners that have issued lock traffic through this handle; close
    /// releases each of them.
    owners: HashSet<OwnerToken>,
}

/// Client entry point for whole-file advisory locking.
pub struct LockClient {
    cluster: Arc<Cluster>,
    config: ClientConfig,
    handles: Mutex<HashMap<HandleId, HandleState>>,
    next_handle: AtomicU64,
}

impl LockClient {
    #[must_use]
    pub fn new(cluster: Arc<Cluster>) -> Self {
        Self::with_config(cluster, ClientConfig::default())
    }

    #[must_use]
    pub fn with_config(cluster: Arc<Cluster>, config: ClientConfig) -> Self {
        Self {
            cluster,
            config,
            handles: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Open `file`, returning a fresh handle.
    ///
    /// Two opens of the same file yield independent handles; locks taken
    /// through one are invisible to `close` of the other.
    pub fn open(&self, file: FileId) -> FileHandle {
        let id = HandleId::new(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.handles.lock().insert(
            id,
            HandleState {
                file,
                owners: HashSet::new(),
            },
        );
        tracing::debug!(%file, handle = %id, "file opened");
        FileHandle { id }
    }

    /// Apply `mode` for `owner` on the file behind `handle`.
    ///
    /// `Shared`/`Exclusive` follow `wait`; `Unlock` never blocks and is
    /// always permitted, mirroring the single-verb lock call of the
    /// classic interface.
    pub fn lock(
        &self,
        handle: FileHandle,
        owner: OwnerToken,
        mode: LockMode,
        wait: WaitPolicy,
    ) -> Result<()> {
        let file = {
            let mut handles = self.handles.lock();
            let state = handles
                .get_mut(&handle.id)
                .ok_or(LockError::InvalidHandle {
                    handle: handle.id.get(),
                })?;
            state.owners.insert(owner);
            state.file
        };
        if mode == LockMode::Unlock {
            return self.route_with_retry(file, |instance| instance.unlock(file, owner));
        }
        let request = LockRequest::new(file, owner, mode, wait);
        self.route_with_retry(file, |instance| instance.lock(&request))
    }

    /// Drop whatever `owner` holds on the file behind `handle`.
    pub fn unlock(&self, handle: FileHandle, owner: OwnerToken) -> Result<()> {
        let file = self.file_of(handle)?;
        self.route_with_retry(file, |instance| instance.unlock(file, owner))
    }

    /// Close `handle`: cancel every pending wait and release every hold
    /// its owners have on the file, then forget the handle.
    pub fn close(&self, handle: FileHandle) -> Result<()> {
        let state = self
            .handles
            .lock()
            .remove(&handle.id)
            .ok_or(LockError::InvalidHandle {
                handle: handle.id.get(),
            })?;
        for owner in state.owners {
            let cancel = self.route_with_retry(state.file, |instance| {
                instance.cancel_waits(
                    state.file,
                    owner,
                    LockError::HandleClosed {
                        handle: handle.id.get(),
                    },
                )
            });
            if let Err(err) = cancel {
                tracing::warn!(file = %state.file, %owner, %err, "wait cancellation failed during close");
            }
            let unlock =
                self.route_with_retry(state.file, |instance| instance.unlock(state.file, owner));
            if let Err(err) = unlock {
                // A poisoned or unreachable file must not make close fail;
                // the handle is gone either way.
                tracing::warn!(file = %state.file, %owner, %err, "unlock failed during close");
            }
        }
        tracing::debug!(file = %state.file, handle = %handle.id, "file closed");
        Ok(())
    }

    /// The file a handle refers to, for callers that track identity.
    pub fn file_of(&self, handle: FileHandle) -> Result<FileId> {
        self.handles
            .lock()
            .get(&handle.id)
            .map(|state| state.file)
            .ok_or(LockError::InvalidHandle {
                handle: handle.id.get(),
            })
    }

    /// Number of currently open handles.
    #[must_use]
    pub fn open_handles(&self) -> usize {
        self.handles.lock().len()
    }

    /// Route `op` to the file's authority, re-routing with backoff while
    /// the placement is in flux. This retry loop is the contract the
    /// transport layer honors in a deployed cluster.
    fn route_with_retry<T>(
        &self,
        file: FileId,
        op: impl Fn(&AuthorityInstance) -> Result<T>,
    ) -> Result<T> {
        let mut attempt = 0_u32;
        loop {
            let instance = self.cluster.route(file);
            match op(&instance) {
                Err(err) if err.is_transient() && attempt < self.config.max_route_retries => {
                    let backoff = self.config.backoff_for(attempt);
                    attempt += 1;
                    tracing::debug!(%file, %err, attempt, ?backoff, "re-routing lock request");
                    std::thread::sleep(backoff);
                }
                other => return other,
            }
        }
    }
}

impl std::fmt::Debug for LockClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockClient")
            .field("open_handles", &self.open_handles())
            .finish()
    }
}
