//! Arrival-ordered wait queue for one file, and the grant pass that
//! re-evaluates it whenever the holder state changes.
//!
//! Entries come in two flavors. An *active* entry has a suspended local
//! caller behind it; the caller learns its fate through a settlement the
//! lock table records under the file's critical section. A *reserved*
//! entry is a queue position preserved across an authority handoff: the
//! owner's re-routed request binds to it instead of the tail, so a
//! transfer never costs a waiter its place in line.

use std::collections::VecDeque;

use shepherd_types::{LockMode, OwnerToken};

use crate::lock_state::LockState;

/// Identifies one wait entry within its file's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Ticket(u64);

impl Ticket {
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

/// Whether an entry has a suspended caller or is a handoff placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitKind {
    Active,
    Reserved,
}

#[derive(Debug, Clone, Copy)]
pub struct WaitEntry {
    pub ticket: Ticket,
    pub owner: OwnerToken,
    pub mode: LockMode,
    pub kind: WaitKind,
}

/// A grant produced by [`grant_satisfiable`].
#[derive(Debug, Clone, Copy)]
pub struct GrantedWait {
    pub ticket: Ticket,
    pub owner: OwnerToken,
    pub mode: LockMode,
    pub kind: WaitKind,
}

/// FIFO queue of blocked requests for one file.
#[derive(Debug, Default)]
pub struct WaitQueue {
    entries: VecDeque<WaitEntry>,
    next_ticket: u64,
}

impl WaitQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append an active entry at the tail, returning its ticket.
    pub fn enqueue(&mut self, owner: OwnerToken, mode: LockMode) -> Ticket {
        self.push(owner, mode, WaitKind::Active)
    }

    /// Append a reserved (handoff-preserved) entry at the tail.
    pub fn enqueue_reserved(&mut self, owner: OwnerToken, mode: LockMode) -> Ticket {
        self.push(owner, mode, WaitKind::Reserved)
    }

    fn push(&mut self, owner: OwnerToken, mode: LockMode, kind: WaitKind) -> Ticket {
        debug_assert!(mode.is_hold(), "unlock requests are never queued");
        let ticket = Ticket(self.next_ticket);
        self.next_ticket += 1;
        self.entries.push_back(WaitEntry {
            ticket,
            owner,
            mode,
            kind,
        });
        ticket
    }

    /// Bind a re-routed request to its reserved position, if one exists.
    ///
    /// The earliest reserved entry matching `(owner, mode)` becomes active
    /// and its ticket is returned; the caller then waits on it exactly as
    /// if it had enqueued normally.
    pub fn activate_reserved(&mut self, owner: OwnerToken, mode: LockMode) -> Option<Ticket> {
        let entry = self.entries.iter_mut().find(|entry| {
            entry.kind == WaitKind::Reserved && entry.owner == owner && entry.mode == mode
        })?;
        entry.kind = WaitKind::Active;
        Some(entry.ticket)
    }

    /// Remove the entry with `ticket`. Returns `false` if it is gone
    /// already (granted or previously removed).
    pub fn remove(&mut self, ticket: Ticket) -> bool {
        if let Some(pos) = self.entries.iter().position(|entry| entry.ticket == ticket) {
            self.entries.remove(pos);
            true
        } else {
            false
        }
    }

    /// Remove every entry belonging to `owner`, returning the removed
    /// entries in queue order.
    pub fn remove_owner(&mut self, owner: OwnerToken) -> Vec<WaitEntry> {
        let mut removed = Vec::new();
        self.entries.retain(|entry| {
            if entry.owner == owner {
                removed.push(*entry);
                false
            } else {
                true
            }
        });
        removed
    }

    /// Drain the whole queue in order (fatal abort, export).
    pub fn drain_all(&mut self) -> Vec<WaitEntry> {
        self.entries.drain(..).collect()
    }

    /// Entries in queue order, for snapshots and introspection.
    pub fn iter(&self) -> impl Iterator<Item = &WaitEntry> {
        self.entries.iter()
    }
}

/// Grant every waiter the new holder state can satisfy, in arrival order.
///
/// Scans from the front: each satisfiable entry is applied to `state`,
/// popped, and reported; the first unsatisfiable entry stops the pass.
/// Stopping at the first conflict is what keeps an exclusive waiter from
/// being overtaken by shared waiters that arrived after it, and since a
/// run of shared entries at the front are mutually compatible, one release
/// can wake several of them in the same pass.
///
/// The caller runs this inside the file's critical section whenever the
/// state may have become more permissive: unlock, downgrade, cancellation,
/// or snapshot import. Grants for reserved entries simply apply; the
/// owner's re-issued request will land as an idempotent re-lock.
pub fn grant_satisfiable(state: &mut LockState, queue: &mut WaitQueue) -> Vec<GrantedWait> {
    let mut granted = Vec::new();
    while let Some(front) = queue.entries.front() {
        if !state.try_apply(front.owner, front.mode).is_applied() {
            break;
        }
        let entry = queue
            .entries
            .pop_front()
            .expect("front observed above; queue cannot be empty");
        tracing::debug!(
            owner = %entry.owner,
            mode = %entry.mode,
            kind = ?entry.kind,
            "queued request granted"
        );
        granted.push(GrantedWait {
            ticket: entry.ticket,
            owner: entry.owner,
            mode: entry.mode,
            kind: entry.kind,
        });
    }
    granted
}
