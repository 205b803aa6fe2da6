//! Per-file lock arbitration engine.
//!
//! This crate is the authoritative state for whole-file advisory locks:
//! the holder state machine with its shared/exclusive compatibility rules
//! ([`lock_state`]), the arrival-ordered wait queue and grant pass
//! ([`wait_queue`]), and the sharded per-file table that ties them to
//! blocking callers ([`lock_table`]). Cross-node placement and routing
//! live above this crate; transfer of a file's state between tables moves
//! through [`snapshot::FileStateSnapshot`].

pub mod lock_state;
pub mod lock_table;
pub mod snapshot;
pub mod wait_queue;

pub use lock_state::{ApplyOutcome, LockState, Transition};
pub use lock_table::{HoldersView, LOCK_TABLE_SHARDS, LockTable};
pub use snapshot::{FileStateSnapshot, QueuedRequest};
pub use wait_queue::{GrantedWait, Ticket, WaitKind, WaitQueue, grant_satisfiable};
