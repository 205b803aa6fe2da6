//! Advisory whole-file locking for a distributed filesystem client.
//!
//! BSD-style semantics (shared, exclusive, unlock) arbitrated by a
//! single authority per file so every thread, process, and host observes
//! one lock state. The crates underneath split the work the way the
//! system is layered:
//!
//! - [`shepherd_core`]: the per-file state machine, wait queue, and
//!   sharded lock table (the arbitration engine).
//! - [`shepherd_authority`]: placement, epoch fencing, and handoff.
//! - this crate: the handle-level client surface and routing.
//!
//! ```
//! use std::sync::Arc;
//! use shepherd::{Cluster, FileId, LockClient, LockError, LockMode, OwnerToken, WaitPolicy};
//!
//! let cluster = Arc::new(Cluster::new(2));
//! let client = LockClient::new(cluster);
//!
//! let handle = client.open(FileId::new(7));
//! let owner = OwnerToken::new(42);
//! client.lock(handle, owner, LockMode::Exclusive, WaitPolicy::NonBlocking)?;
//! client.unlock(handle, owner)?;
//! client.close(handle)?;
//! # Ok::<(), LockError>(())
//! ```

pub mod client;
pub mod cluster;
pub mod config;

pub use client::{FileHandle, LockClient};
pub use cluster::Cluster;
pub use config::ClientConfig;

pub use shepherd_error::{ErrorCode, LockError};
pub use shepherd_types::{FileId, HandleId, LockMode, NodeId, OwnerToken, WaitPolicy};
