//! Sharded `FileId -> lock state` table with per-file critical sections.
//!
//! Each file gets its own `Mutex + Condvar` pair, so arbitration for one
//! file never contends with another. Entries are created lazily on first
//! use and garbage-collected once holders, waiters, and in-flight
//! operations are all gone. A file whose state has been declared fatal
//! stays resident so later callers fail fast instead of re-creating a
//! clean-looking entry over corrupt history.
//!
//! Blocking discipline: a conflicting blocking request enqueues an entry
//! and suspends on the file's condvar. Grants are applied by whichever
//! thread made the state more permissive (unlock, downgrade, cancellation,
//! import), inside the critical section, so a waiter is granted at the
//! release that satisfies it, and a fresh request arriving a moment later
//! finds the lock already taken rather than barging past the queue. The
//! suspended thread wakes to find a settlement recorded for its ticket;
//! wakes without a settlement are spurious and it simply keeps waiting.
//!
//! Deadlocks among owners are not detected: two shared holders that both
//! issue blocking upgrades will wait on each other forever, exactly like
//! the classic whole-file lock they model. Deadlines are the escape hatch.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;

use shepherd_error::{LockError, Result};
use shepherd_observability::{LockEvent, LockObserver, NoOpObserver};
use shepherd_types::{FileId, LockMode, OwnerToken, WaitPolicy};

use crate::lock_state::LockState;
use crate::snapshot::{FileStateSnapshot, QueuedRequest};
use crate::wait_queue::{GrantedWait, WaitKind, WaitQueue, grant_satisfiable};

/// Number of shards in the table (power of 2 for mask indexing).
pub const LOCK_TABLE_SHARDS: usize = 64;

/// How a settled wait ended, recorded under the file's critical section
/// for the suspended caller to consume.
#[derive(Debug, Clone)]
enum WaitOutcome {
    Granted,
    Aborted(LockError),
}

struct FileInner {
    state: LockState,
    queue: WaitQueue,
    /// Outcomes for settled tickets, consumed by their waiters on wake.
    settled: HashMap<u64, WaitOutcome>,
    /// Set once; afterwards every operation on the file fails with it.
    fatal: Option<LockError>,
    /// The entry was exported to another authority; late arrivals that
    /// pinned it before eviction must re-route instead of enqueueing on a
    /// ghost.
    evicted: bool,
}

impl FileInner {
    fn new() -> Self {
        Self {
            state: LockState::new(),
            queue: WaitQueue::new(),
            settled: HashMap::new(),
            fatal: None,
            evicted: false,
        }
    }

    fn is_idle(&self) -> bool {
        self.state.is_unlocked()
            && self.queue.is_empty()
            && self.settled.is_empty()
            && self.fatal.is_none()
            && !self.evicted
    }
}

struct FileEntry {
    /// In-flight operations referencing this entry; incremented under the
    /// shard lock, so GC (also under the shard lock) never races a new
    /// arrival.
    pins: AtomicUsize,
    inner: Mutex<FileInner>,
    retry: Condvar,
}

impl FileEntry {
    fn new() -> Self {
        Self {
            pins: AtomicUsize::new(0),
            inner: Mutex::new(FileInner::new()),
            retry: Condvar::new(),
        }
    }
}

/// Current holders of one file, for introspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HoldersView {
    pub exclusive: Option<OwnerToken>,
    pub shared: Vec<OwnerToken>,
}

/// The per-file lock arbitration table.
pub struct LockTable {
    shards: Box<[Mutex<HashMap<FileId, Arc<FileEntry>>>; LOCK_TABLE_SHARDS]>,
    observer: Arc<dyn LockObserver>,
}

impl LockTable {
    #[must_use]
    pub fn new() -> Self {
        Self::with_observer(Arc::new(NoOpObserver))
    }

    #[must_use]
    pub fn with_observer(observer: Arc<dyn LockObserver>) -> Self {
        Self {
            shards: Box::new(std::array::from_fn(|_| Mutex::new(HashMap::new()))),
            observer,
        }
    }

    /// The observer wired into this table.
    #[must_use]
    pub fn observer(&self) -> &Arc<dyn LockObserver> {
        &self.observer
    }

    fn shard_index(file: FileId) -> usize {
        // File ids are already well distributed; mask the low bits.
        (file.get() as usize) & (LOCK_TABLE_SHARDS - 1)
    }

    fn pin_entry(&self, file: FileId) -> Arc<FileEntry> {
        let shard = &self.shards[Self::shard_index(file)];
        let mut map = shard.lock();
        let entry = Arc::clone(
            map.entry(file)
                .or_insert_with(|| Arc::new(FileEntry::new())),
        );
        entry.pins.fetch_add(1, Ordering::Relaxed);
        entry
    }

    fn peek_entry(&self, file: FileId) -> Option<Arc<FileEntry>> {
        let shard = &self.shards[Self::shard_index(file)];
        let map = shard.lock();
        map.get(&file).map(Arc::clone)
    }

    fn unpin_entry(&self, file: FileId, entry: &Arc<FileEntry>) {
        let shard = &self.shards[Self::shard_index(file)];
        let mut map = shard.lock();
        if entry.pins.fetch_sub(1, Ordering::Relaxed) != 1 {
            return;
        }
        // Last pin just dropped; pins cannot grow back while we hold the
        // shard lock. Collect the entry if it is still mapped and idle.
        let still_mapped = map
            .get(&file)
            .is_some_and(|current| Arc::ptr_eq(current, entry));
        if still_mapped && entry.pins.load(Ordering::Relaxed) == 0 && entry.inner.lock().is_idle() {
            map.remove(&file);
            tracing::debug!(%file, "idle lock entry collected");
        }
    }

    // -----------------------------------------------------------------------
    // lock / unlock
    // -----------------------------------------------------------------------

    /// Apply a lock request for `owner` on `file`.
    ///
    /// `Shared`/`Exclusive` follow the wait policy; `Unlock` never blocks
    /// and always succeeds (whether or not the owner held anything).
    pub fn lock(
        &self,
        file: FileId,
        owner: OwnerToken,
        mode: LockMode,
        wait: WaitPolicy,
    ) -> Result<()> {
        if mode == LockMode::Unlock {
            return self.unlock(file, owner);
        }
        let entry = self.pin_entry(file);
        let result = self.lock_pinned(&entry, file, owner, mode, wait);
        self.unpin_entry(file, &entry);
        result
    }

    fn lock_pinned(
        &self,
        entry: &Arc<FileEntry>,
        file: FileId,
        owner: OwnerToken,
        mode: LockMode,
        wait: WaitPolicy,
    ) -> Result<()> {
        let mut inner = entry.inner.lock();
        if let Some(err) = &inner.fatal {
            return Err(err.clone());
        }
        if inner.evicted {
            return Err(LockError::AuthorityTransferring { file: file.get() });
        }

        let WaitPolicy::Blocking { deadline } = wait else {
            // Non-blocking: one attempt, no queue entry, no mutation on
            // conflict.
            if inner.state.try_apply(owner, mode).is_applied() {
                self.after_state_change(entry, file, &mut inner)?;
                self.observer.on_event(&LockEvent::Granted {
                    file,
                    owner,
                    mode,
                    waited_ns: 0,
                });
                return Ok(());
            }
            self.observer.on_event(&LockEvent::Contention {
                file,
                owner,
                mode,
                holders: inner.state.holder_count(),
            });
            tracing::debug!(%file, %owner, %mode, "non-blocking conflict");
            return Err(LockError::WouldBlock);
        };

        // A request re-routed after an authority handoff binds to the queue
        // position the transfer preserved for it; everyone else tries the
        // state directly first.
        let ticket = match inner.queue.activate_reserved(owner, mode) {
            Some(ticket) => ticket,
            None => {
                if inner.state.try_apply(owner, mode).is_applied() {
                    self.after_state_change(entry, file, &mut inner)?;
                    self.observer.on_event(&LockEvent::Granted {
                        file,
                        owner,
                        mode,
                        waited_ns: 0,
                    });
                    return Ok(());
                }
                self.observer.on_event(&LockEvent::Contention {
                    file,
                    owner,
                    mode,
                    holders: inner.state.holder_count(),
                });
                inner.queue.enqueue(owner, mode)
            }
        };

        let started = Instant::now();
        tracing::debug!(%file, %owner, %mode, ticket = ticket.get(), "lock wait begins");

        loop {
            if let Some(outcome) = inner.settled.remove(&ticket.get()) {
                return self.finish_wait(file, owner, mode, started, outcome);
            }

            let timed_out = match deadline {
                Some(deadline) => entry.retry.wait_until(&mut inner, deadline).timed_out(),
                None => {
                    entry.retry.wait(&mut inner);
                    false
                }
            };

            if timed_out {
                // The grant may have landed while we were timing out; the
                // settlement check after re-entry decides which side won.
                if let Some(outcome) = inner.settled.remove(&ticket.get()) {
                    return self.finish_wait(file, owner, mode, started, outcome);
                }
                let removed = inner.queue.remove(ticket);
                debug_assert!(removed, "unsettled ticket must still be queued");
                // Removing a queue entry can unblock everything behind it.
                self.after_state_change(entry, file, &mut inner)?;
                self.observer
                    .on_event(&LockEvent::TimedOut { file, owner, mode });
                tracing::debug!(%file, %owner, %mode, "lock wait timed out");
                return Err(LockError::TimedOut);
            }
        }
    }

    fn finish_wait(
        &self,
        file: FileId,
        owner: OwnerToken,
        mode: LockMode,
        started: Instant,
        outcome: WaitOutcome,
    ) -> Result<()> {
        match outcome {
            WaitOutcome::Granted => {
                let waited_ns =
                    u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX);
                self.observer.on_event(&LockEvent::Granted {
                    file,
                    owner,
                    mode,
                    waited_ns,
                });
                tracing::debug!(%file, %owner, %mode, waited_ns, "lock wait granted");
                Ok(())
            }
            WaitOutcome::Aborted(err) => Err(err),
        }
    }

    /// Drop whatever `owner` holds on `file`. Success even if it held
    /// nothing.
    pub fn unlock(&self, file: FileId, owner: OwnerToken) -> Result<()> {
        let entry = self.pin_entry(file);
        let result = (|| {
            let mut inner = entry.inner.lock();
            if let Some(err) = &inner.fatal {
                return Err(err.clone());
            }
            if inner.evicted {
                return Err(LockError::AuthorityTransferring { file: file.get() });
            }
            // Permissive unlock always applies.
            let applied = inner.state.try_apply(owner, LockMode::Unlock).is_applied();
            debug_assert!(applied, "unlock never conflicts");
            self.after_state_change(&entry, file, &mut inner)
        })();
        self.unpin_entry(file, &entry);
        result
    }

    /// Re-evaluate the wait queue after the state may have become more
    /// permissive, settling and waking every waiter that can be granted.
    /// Converts an invariant violation into the fatal path instead of
    /// proceeding on corrupt state.
    fn after_state_change(
        &self,
        entry: &Arc<FileEntry>,
        file: FileId,
        inner: &mut FileInner,
    ) -> Result<()> {
        let granted = grant_satisfiable(&mut inner.state, &mut inner.queue);
        if let Err(violation) = inner.state.verify() {
            let err = LockError::corrupt(violation);
            self.fail_locked(entry, file, inner, err.clone());
            return Err(err);
        }
        if !granted.is_empty() {
            self.settle_grants(inner, &granted);
            entry.retry.notify_all();
        }
        Ok(())
    }

    fn settle_grants(&self, inner: &mut FileInner, granted: &[GrantedWait]) {
        for grant in granted {
            match grant.kind {
                WaitKind::Active => {
                    inner
                        .settled
                        .insert(grant.ticket.get(), WaitOutcome::Granted);
                }
                // A reserved grant has no suspended caller; the hold is
                // applied and the owner's re-issued request will land as an
                // idempotent re-lock.
                WaitKind::Reserved => {}
            }
        }
    }

    // -----------------------------------------------------------------------
    // Cancellation and fatal paths
    // -----------------------------------------------------------------------

    /// Remove every queued wait `owner` has on `file`, waking the waiters
    /// with `error`. Returns how many entries were removed.
    pub fn cancel_waits(&self, file: FileId, owner: OwnerToken, error: LockError) -> usize {
        let Some(entry) = self.peek_entry(file) else {
            return 0;
        };
        let mut inner = entry.inner.lock();
        let removed = inner.queue.remove_owner(owner);
        for cancelled in &removed {
            if cancelled.kind == WaitKind::Active {
                inner
                    .settled
                    .insert(cancelled.ticket.get(), WaitOutcome::Aborted(error.clone()));
            }
            self.observer
                .on_event(&LockEvent::WaitCancelled { file, owner });
        }
        if !removed.is_empty() {
            // The cancelled entries may have been blocking the rest.
            let inner = &mut *inner;
            let granted = grant_satisfiable(&mut inner.state, &mut inner.queue);
            self.settle_grants(inner, &granted);
            entry.retry.notify_all();
            tracing::debug!(%file, %owner, cancelled = removed.len(), "lock waits cancelled");
        }
        removed.len()
    }

    /// Declare `file`'s lock state unusable: every queued waiter is woken
    /// with `error`, and every later operation fails fast with it. Returns
    /// the number of waiters aborted.
    pub fn fail_file(&self, file: FileId, error: LockError) -> usize {
        let entry = self.pin_entry(file);
        let aborted = {
            let mut inner = entry.inner.lock();
            self.fail_locked(&entry, file, &mut inner, error)
        };
        self.unpin_entry(file, &entry);
        aborted
    }

    fn fail_locked(
        &self,
        entry: &Arc<FileEntry>,
        file: FileId,
        inner: &mut FileInner,
        error: LockError,
    ) -> usize {
        let drained = inner.queue.drain_all();
        let mut aborted = 0;
        for waiter in &drained {
            if waiter.kind == WaitKind::Active {
                inner
                    .settled
                    .insert(waiter.ticket.get(), WaitOutcome::Aborted(error.clone()));
                aborted += 1;
            }
        }
        if inner.fatal.is_none() {
            inner.fatal = Some(error.clone());
        }
        self.observer.on_event(&LockEvent::FatalAborted {
            file,
            waiters: aborted,
        });
        entry.retry.notify_all();
        tracing::error!(%file, %error, waiters = aborted, "file lock state declared fatal");
        aborted
    }

    // -----------------------------------------------------------------------
    // Authority handoff support
    // -----------------------------------------------------------------------

    /// Extract the file's complete lock state for transfer to another
    /// authority, atomically with evicting it here.
    ///
    /// Local suspended waiters are woken with `AuthorityTransferring`
    /// (their routing layer re-issues the request against the new
    /// authority); their queue positions travel in the snapshot so the
    /// re-issued requests keep their place in line.
    pub fn export_file(&self, file: FileId) -> Result<FileStateSnapshot> {
        // Materialize the entry even for an untouched file: the tombstone
        // left behind is what turns late arrivals away.
        let entry = self.pin_entry(file);
        let result = self.export_pinned(&entry, file);
        self.unpin_entry(file, &entry);
        result
    }

    fn export_pinned(&self, entry: &Arc<FileEntry>, file: FileId) -> Result<FileStateSnapshot> {
        let snapshot = {
            let mut inner = entry.inner.lock();
            if let Some(err) = &inner.fatal {
                return Err(err.clone());
            }
            let mut shared: SmallVec<[OwnerToken; 4]> = inner.state.shared_holders().into();
            shared.sort_unstable();
            let waiters: Vec<QueuedRequest> = inner
                .queue
                .iter()
                .map(|waiter| QueuedRequest {
                    owner: waiter.owner,
                    mode: waiter.mode,
                })
                .collect();
            let snapshot = FileStateSnapshot {
                exclusive: inner.state.exclusive_holder(),
                shared,
                waiters,
            };

            for waiter in inner.queue.drain_all() {
                if waiter.kind == WaitKind::Active {
                    inner.settled.insert(
                        waiter.ticket.get(),
                        WaitOutcome::Aborted(LockError::AuthorityTransferring {
                            file: file.get(),
                        }),
                    );
                }
            }
            inner.state = LockState::new();
            // The entry stays in the map as a tombstone: a request that
            // validated against the old placement but reached the table
            // after the export must be turned away, not served from a
            // fresh-looking entry. Import clears the tombstone if the
            // authority ever comes back.
            inner.evicted = true;
            entry.retry.notify_all();
            snapshot
        };

        tracing::info!(
            %file,
            holders = snapshot.shared.len() + usize::from(snapshot.exclusive.is_some()),
            waiters = snapshot.waiters.len(),
            "file lock state exported"
        );
        Ok(snapshot)
    }

    /// Install a transferred snapshot for `file`.
    ///
    /// Live local state for the file means two authorities produced state
    /// independently; that is refused rather than merged.
    pub fn import_file(&self, file: FileId, snapshot: &FileStateSnapshot) -> Result<()> {
        snapshot.verify()?;
        let entry = self.pin_entry(file);
        let result = (|| {
            let mut inner = entry.inner.lock();
            if let Some(err) = &inner.fatal {
                return Err(err.clone());
            }
            if !inner.state.is_unlocked() || !inner.queue.is_empty() {
                return Err(LockError::SplitBrain { file: file.get() });
            }
            let mut state = LockState::new();
            for owner in &snapshot.shared {
                let applied = state.try_apply(*owner, LockMode::Shared).is_applied();
                debug_assert!(applied, "verified snapshot holders must apply");
            }
            if let Some(owner) = snapshot.exclusive {
                if !state.try_apply(owner, LockMode::Exclusive).is_applied() {
                    return Err(LockError::corrupt(
                        "snapshot exclusive holder conflicts with shared holders",
                    ));
                }
            }
            inner.state = state;
            inner.evicted = false;
            for waiter in &snapshot.waiters {
                inner.queue.enqueue_reserved(waiter.owner, waiter.mode);
            }
            // The transferred state may already satisfy the head of the
            // transferred queue.
            self.after_state_change(&entry, file, &mut inner)?;
            tracing::info!(
                %file,
                waiters = snapshot.waiters.len(),
                "file lock state imported"
            );
            Ok(())
        })();
        self.unpin_entry(file, &entry);
        result
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    /// Current holders of `file`, if this table has live state for it.
    ///
    /// An exported (tombstoned) entry reports nothing: the live state is
    /// wherever the authority went.
    #[must_use]
    pub fn holders(&self, file: FileId) -> Option<HoldersView> {
        let entry = self.peek_entry(file)?;
        let inner = entry.inner.lock();
        if inner.evicted {
            return None;
        }
        let mut shared = inner.state.shared_holders();
        shared.sort_unstable();
        Some(HoldersView {
            exclusive: inner.state.exclusive_holder(),
            shared,
        })
    }

    /// The mode `owner` currently holds on `file`, if any.
    #[must_use]
    pub fn holds(&self, file: FileId, owner: OwnerToken) -> Option<LockMode> {
        let entry = self.peek_entry(file)?;
        let inner = entry.inner.lock();
        if inner.evicted {
            return None;
        }
        inner.state.holds(owner)
    }

    /// Number of queued waiters on `file`.
    #[must_use]
    pub fn waiter_count(&self, file: FileId) -> usize {
        self.peek_entry(file).map_or(0, |entry| {
            let inner = entry.inner.lock();
            if inner.evicted { 0 } else { inner.queue.len() }
        })
    }

    /// Number of files with live table entries.
    #[must_use]
    pub fn file_count(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    /// Live entries per shard, for contention diagnostics.
    #[must_use]
    pub fn shard_distribution(&self) -> Vec<usize> {
        self.shards.iter().map(|shard| shard.lock().len()).collect()
    }
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LockTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockTable")
            .field("file_count", &self.file_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::sync::mpsc;
    use std::time::Duration;

    use shepherd_observability::LockMetrics;

    const F: FileId = FileId::new(100);
    const X: OwnerToken = OwnerToken::new(42);
    const Y: OwnerToken = OwnerToken::new(43);
    const Z: OwnerToken = OwnerToken::new(44);
    const W: OwnerToken = OwnerToken::new(45);

    fn nb() -> WaitPolicy {
        WaitPolicy::NonBlocking
    }

    #[test]
    fn exclusive_then_exclusive_would_block() {
        let table = LockTable::new();
        table.lock(F, X, LockMode::Exclusive, nb()).unwrap();
        assert_eq!(
            table.lock(F, Y, LockMode::Exclusive, nb()),
            Err(LockError::WouldBlock)
        );
        table.unlock(F, X).unwrap();
        table.lock(F, Y, LockMode::Exclusive, nb()).unwrap();
        table.unlock(F, Y).unwrap();
    }

    #[test]
    fn shared_holders_block_exclusive_until_last_leaves() {
        let table = LockTable::new();
        table.lock(F, X, LockMode::Shared, nb()).unwrap();
        table.lock(F, Y, LockMode::Shared, nb()).unwrap();
        table.lock(F, Z, LockMode::Shared, nb()).unwrap();

        assert_eq!(
            table.lock(F, W, LockMode::Exclusive, nb()),
            Err(LockError::WouldBlock)
        );
        table.unlock(F, X).unwrap();
        table.unlock(F, Y).unwrap();
        assert_eq!(
            table.lock(F, W, LockMode::Exclusive, nb()),
            Err(LockError::WouldBlock)
        );
        table.unlock(F, Z).unwrap();
        table.lock(F, W, LockMode::Exclusive, nb()).unwrap();
        table.unlock(F, W).unwrap();
    }

    #[test]
    fn nonblocking_conflict_leaves_no_trace() {
        let table = LockTable::new();
        table.lock(F, X, LockMode::Exclusive, nb()).unwrap();
        assert_eq!(
            table.lock(F, Y, LockMode::Shared, nb()),
            Err(LockError::WouldBlock)
        );
        assert_eq!(table.waiter_count(F), 0);
        assert_eq!(table.holds(F, Y), None);
        let holders = table.holders(F).unwrap();
        assert_eq!(holders.exclusive, Some(X));
        assert!(holders.shared.is_empty());
    }

    #[test]
    fn upgrade_and_downgrade_through_the_table() {
        let table = LockTable::new();
        table.lock(F, X, LockMode::Shared, nb()).unwrap();
        table.lock(F, X, LockMode::Exclusive, nb()).unwrap();
        assert_eq!(table.holds(F, X), Some(LockMode::Exclusive));
        table.lock(F, X, LockMode::Shared, nb()).unwrap();
        assert_eq!(table.holds(F, X), Some(LockMode::Shared));
        table.lock(F, Y, LockMode::Shared, nb()).unwrap();
        table.unlock(F, X).unwrap();
        table.unlock(F, Y).unwrap();
    }

    #[test]
    fn unlock_mode_routes_to_unlock() {
        let table = LockTable::new();
        table.lock(F, X, LockMode::Exclusive, nb()).unwrap();
        table.lock(F, X, LockMode::Unlock, nb()).unwrap();
        assert_eq!(table.holds(F, X), None);
        // Unlock of nothing is success.
        table.lock(F, X, LockMode::Unlock, nb()).unwrap();
    }

    #[test]
    fn idle_entries_are_collected() {
        let table = LockTable::new();
        table.lock(F, X, LockMode::Exclusive, nb()).unwrap();
        assert_eq!(table.file_count(), 1);
        table.unlock(F, X).unwrap();
        assert_eq!(table.file_count(), 0, "empty entry must be collected");

        // Untouched files never materialize entries.
        assert_eq!(table.holders(FileId::new(999)), None);
        assert_eq!(table.file_count(), 0);
    }

    #[test]
    fn distinct_files_do_not_interfere() {
        let table = LockTable::new();
        let g = FileId::new(101);
        table.lock(F, X, LockMode::Exclusive, nb()).unwrap();
        table.lock(g, Y, LockMode::Exclusive, nb()).unwrap();
        assert_eq!(table.file_count(), 2);
        table.unlock(F, X).unwrap();
        table.unlock(g, Y).unwrap();
    }

    #[test]
    fn shard_distribution_covers_all_shards() {
        let table = LockTable::new();
        for i in 0..128_u64 {
            table
                .lock(FileId::new(i), X, LockMode::Shared, nb())
                .unwrap();
        }
        let dist = table.shard_distribution();
        assert_eq!(dist.len(), LOCK_TABLE_SHARDS);
        for &count in &dist {
            assert_eq!(count, 2, "sequential ids spread evenly");
        }
    }

    #[test]
    fn blocking_wait_is_granted_on_release() {
        let table = Arc::new(LockTable::new());
        table.lock(F, X, LockMode::Exclusive, nb()).unwrap();

        let (tx, rx) = mpsc::channel();
        let table2 = Arc::clone(&table);
        let waiter = std::thread::spawn(move || {
            tx.send(()).unwrap();
            table2.lock(F, Y, LockMode::Exclusive, WaitPolicy::WAIT)
        });

        rx.recv().unwrap();
        while table.waiter_count(F) == 0 {
            std::thread::yield_now();
        }
        table.unlock(F, X).unwrap();

        waiter.join().unwrap().unwrap();
        assert_eq!(table.holds(F, Y), Some(LockMode::Exclusive));
        table.unlock(F, Y).unwrap();
    }

    #[test]
    fn release_grants_atomically_no_barging() {
        // The grant happens inside X's unlock; by the time unlock returns,
        // Y already holds the lock even if its thread has not woken yet.
        let table = Arc::new(LockTable::new());
        table.lock(F, X, LockMode::Exclusive, nb()).unwrap();

        let table2 = Arc::clone(&table);
        let waiter =
            std::thread::spawn(move || table2.lock(F, Y, LockMode::Exclusive, WaitPolicy::WAIT));
        while table.waiter_count(F) == 0 {
            std::thread::yield_now();
        }

        table.unlock(F, X).unwrap();
        assert_eq!(
            table.lock(F, Z, LockMode::Exclusive, nb()),
            Err(LockError::WouldBlock),
            "the queued waiter owns the lock the moment the release completes"
        );
        waiter.join().unwrap().unwrap();
        table.unlock(F, Y).unwrap();
    }

    #[test]
    fn fifo_exclusive_before_later_shared() {
        let table = Arc::new(LockTable::new());
        table.lock(F, X, LockMode::Exclusive, nb()).unwrap();

        let table_y = Arc::clone(&table);
        let y_wait =
            std::thread::spawn(move || table_y.lock(F, Y, LockMode::Exclusive, WaitPolicy::WAIT));
        while table.waiter_count(F) < 1 {
            std::thread::yield_now();
        }

        let table_z = Arc::clone(&table);
        let z_wait =
            std::thread::spawn(move || table_z.lock(F, Z, LockMode::Shared, WaitPolicy::WAIT));
        while table.waiter_count(F) < 2 {
            std::thread::yield_now();
        }

        table.unlock(F, X).unwrap();
        y_wait.join().unwrap().unwrap();
        assert_eq!(table.holds(F, Y), Some(LockMode::Exclusive));
        // Z stays queued behind Y's hold.
        assert_eq!(table.holds(F, Z), None);
        assert_eq!(table.waiter_count(F), 1);

        table.unlock(F, Y).unwrap();
        z_wait.join().unwrap().unwrap();
        assert_eq!(table.holds(F, Z), Some(LockMode::Shared));
        table.unlock(F, Z).unwrap();
    }

    #[test]
    fn deadline_expiry_returns_timed_out() {
        let table = Arc::new(LockTable::new());
        table.lock(F, X, LockMode::Exclusive, nb()).unwrap();

        let deadline = Instant::now() + Duration::from_millis(50);
        let result = table.lock(F, Y, LockMode::Exclusive, WaitPolicy::until(deadline));
        assert_eq!(result, Err(LockError::TimedOut));
        assert_eq!(table.waiter_count(F), 0, "timed-out entry must be removed");

        // The holder is untouched and can release normally.
        table.unlock(F, X).unwrap();
        table.lock(F, Y, LockMode::Exclusive, nb()).unwrap();
        table.unlock(F, Y).unwrap();
    }

    #[test]
    fn timeout_of_head_unblocks_followers() {
        let table = Arc::new(LockTable::new());
        table.lock(F, X, LockMode::Exclusive, nb()).unwrap();

        // Y and Z queue while X holds exclusively.
        let table_y = Arc::clone(&table);
        let y_wait = std::thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_millis(400);
            table_y.lock(F, Y, LockMode::Exclusive, WaitPolicy::until(deadline))
        });
        while table.waiter_count(F) < 1 {
            std::thread::yield_now();
        }

        let table_z = Arc::clone(&table);
        let z_wait =
            std::thread::spawn(move || table_z.lock(F, Z, LockMode::Shared, WaitPolicy::WAIT));
        while table.waiter_count(F) < 2 {
            std::thread::yield_now();
        }

        // X downgrades: Y still cannot have exclusivity, and Z sits behind
        // Y even though shared would now be compatible.
        table.lock(F, X, LockMode::Shared, nb()).unwrap();
        assert_eq!(table.holds(F, Z), None);

        // Y gives up at its deadline; removing the stuck head must let Z
        // through alongside X's shared hold.
        assert_eq!(y_wait.join().unwrap(), Err(LockError::TimedOut));
        z_wait.join().unwrap().unwrap();
        assert_eq!(table.holds(F, Z), Some(LockMode::Shared));
        table.unlock(F, X).unwrap();
        table.unlock(F, Z).unwrap();
    }

    #[test]
    fn cancel_waits_wakes_with_supplied_error() {
        let table = Arc::new(LockTable::new());
        table.lock(F, X, LockMode::Exclusive, nb()).unwrap();

        let table2 = Arc::clone(&table);
        let waiter =
            std::thread::spawn(move || table2.lock(F, Y, LockMode::Shared, WaitPolicy::WAIT));
        while table.waiter_count(F) == 0 {
            std::thread::yield_now();
        }

        let cancelled = table.cancel_waits(F, Y, LockError::HandleClosed { handle: 7 });
        assert_eq!(cancelled, 1);
        assert_eq!(
            waiter.join().unwrap(),
            Err(LockError::HandleClosed { handle: 7 })
        );
        table.unlock(F, X).unwrap();
    }

    #[test]
    fn fail_file_aborts_all_waiters_and_poisons_entry() {
        let table = Arc::new(LockTable::new());
        table.lock(F, X, LockMode::Exclusive, nb()).unwrap();

        let barrier = Arc::new(Barrier::new(3));
        let mut waiters = Vec::new();
        for owner in [Y, Z] {
            let table2 = Arc::clone(&table);
            let barrier2 = Arc::clone(&barrier);
            waiters.push(std::thread::spawn(move || {
                barrier2.wait();
                table2.lock(F, owner, LockMode::Exclusive, WaitPolicy::WAIT)
            }));
        }
        barrier.wait();
        while table.waiter_count(F) < 2 {
            std::thread::yield_now();
        }

        let aborted = table.fail_file(F, LockError::SplitBrain { file: F.get() });
        assert_eq!(aborted, 2);
        for waiter in waiters {
            assert_eq!(
                waiter.join().unwrap(),
                Err(LockError::SplitBrain { file: F.get() })
            );
        }

        // Every later operation fails fast with the same error.
        assert_eq!(
            table.lock(F, W, LockMode::Shared, nb()),
            Err(LockError::SplitBrain { file: F.get() })
        );
        assert_eq!(
            table.unlock(F, X),
            Err(LockError::SplitBrain { file: F.get() })
        );
        // And the poisoned entry is not collected.
        assert_eq!(table.file_count(), 1);
    }

    #[test]
    fn export_import_preserves_holders_and_queue_order() {
        let source = Arc::new(LockTable::new());
        source.lock(F, X, LockMode::Exclusive, nb()).unwrap();

        let source_y = Arc::clone(&source);
        let y_wait =
            std::thread::spawn(move || source_y.lock(F, Y, LockMode::Exclusive, WaitPolicy::WAIT));
        while source.waiter_count(F) < 1 {
            std::thread::yield_now();
        }
        let source_z = Arc::clone(&source);
        let z_wait =
            std::thread::spawn(move || source_z.lock(F, Z, LockMode::Shared, WaitPolicy::WAIT));
        while source.waiter_count(F) < 2 {
            std::thread::yield_now();
        }

        let snapshot = source.export_file(F).unwrap();
        assert_eq!(snapshot.exclusive, Some(X));
        assert_eq!(snapshot.waiters.len(), 2);
        assert_eq!(snapshot.waiters[0].owner, Y);
        assert_eq!(snapshot.waiters[1].owner, Z);

        // Displaced waiters are told to re-route.
        assert_eq!(
            y_wait.join().unwrap(),
            Err(LockError::AuthorityTransferring { file: F.get() })
        );
        assert_eq!(
            z_wait.join().unwrap(),
            Err(LockError::AuthorityTransferring { file: F.get() })
        );
        assert_eq!(source.holders(F), None);

        let target = LockTable::new();
        target.import_file(F, &snapshot).unwrap();
        assert_eq!(target.holds(F, X), Some(LockMode::Exclusive));
        assert_eq!(target.waiter_count(F), 2);

        // X releases on the new authority: the transferred queue drains in
        // the original order.
        target.unlock(F, X).unwrap();
        assert_eq!(target.holds(F, Y), Some(LockMode::Exclusive));
        assert_eq!(target.waiter_count(F), 1);
        // Y's re-issued request lands as an idempotent re-lock.
        target.lock(F, Y, LockMode::Exclusive, nb()).unwrap();
        target.unlock(F, Y).unwrap();
        assert_eq!(target.holds(F, Z), Some(LockMode::Shared));
        target.unlock(F, Z).unwrap();
    }

    #[test]
    fn rerouted_waiter_binds_to_reserved_position() {
        let source = Arc::new(LockTable::new());
        source.lock(F, X, LockMode::Exclusive, nb()).unwrap();

        let source_y = Arc::clone(&source);
        let y_wait =
            std::thread::spawn(move || source_y.lock(F, Y, LockMode::Exclusive, WaitPolicy::WAIT));
        while source.waiter_count(F) < 1 {
            std::thread::yield_now();
        }

        let snapshot = source.export_file(F).unwrap();
        assert_eq!(
            y_wait.join().unwrap(),
            Err(LockError::AuthorityTransferring { file: F.get() })
        );

        let target = Arc::new(LockTable::new());
        target.import_file(F, &snapshot).unwrap();

        // Y re-issues its blocking request on the new authority and keeps
        // waiting in its old position.
        let target_y = Arc::clone(&target);
        let y_retry =
            std::thread::spawn(move || target_y.lock(F, Y, LockMode::Exclusive, WaitPolicy::WAIT));
        // The reserved entry is bound, not duplicated.
        while target.waiter_count(F) != 1 {
            std::thread::yield_now();
        }

        target.unlock(F, X).unwrap();
        y_retry.join().unwrap().unwrap();
        assert_eq!(target.holds(F, Y), Some(LockMode::Exclusive));
        target.unlock(F, Y).unwrap();
    }

    #[test]
    fn exported_entry_turns_late_arrivals_away() {
        let table = LockTable::new();
        table.lock(F, X, LockMode::Shared, nb()).unwrap();
        let _snapshot = table.export_file(F).unwrap();

        // The tombstone reports no state and rejects every operation; a
        // request that validated against the old placement cannot land on
        // a fresh-looking entry here.
        assert_eq!(table.holders(F), None);
        assert_eq!(table.waiter_count(F), 0);
        assert_eq!(
            table.lock(F, Y, LockMode::Shared, nb()),
            Err(LockError::AuthorityTransferring { file: F.get() })
        );
        assert_eq!(
            table.unlock(F, X),
            Err(LockError::AuthorityTransferring { file: F.get() })
        );

        // If the authority comes back, import clears the tombstone.
        let snapshot = FileStateSnapshot::default();
        table.import_file(F, &snapshot).unwrap();
        table.lock(F, Y, LockMode::Shared, nb()).unwrap();
        table.unlock(F, Y).unwrap();
    }

    #[test]
    fn import_over_live_state_is_split_brain() {
        let table = LockTable::new();
        table.lock(F, X, LockMode::Shared, nb()).unwrap();

        let snapshot = FileStateSnapshot {
            exclusive: Some(Y),
            shared: SmallVec::new(),
            waiters: Vec::new(),
        };
        assert_eq!(
            table.import_file(F, &snapshot),
            Err(LockError::SplitBrain { file: F.get() })
        );
        // Local state untouched by the refused import.
        assert_eq!(table.holds(F, X), Some(LockMode::Shared));
        table.unlock(F, X).unwrap();
    }

    #[test]
    fn import_rejects_corrupt_snapshot() {
        let table = LockTable::new();
        let snapshot = FileStateSnapshot {
            exclusive: Some(X),
            shared: SmallVec::from_slice(&[Y]),
            waiters: Vec::new(),
        };
        assert!(matches!(
            table.import_file(F, &snapshot),
            Err(LockError::StateCorrupt { .. })
        ));
        assert_eq!(table.file_count(), 0);
    }

    #[test]
    fn export_of_untouched_file_is_empty() {
        let table = LockTable::new();
        let snapshot = table.export_file(F).unwrap();
        assert!(snapshot.is_empty());
    }

    #[test]
    fn metrics_observer_sees_the_traffic() {
        let metrics = Arc::new(LockMetrics::new());
        let observer: Arc<LockMetrics> = Arc::clone(&metrics);
        let table = LockTable::with_observer(observer);

        table.lock(F, X, LockMode::Exclusive, nb()).unwrap();
        assert_eq!(
            table.lock(F, Y, LockMode::Exclusive, nb()),
            Err(LockError::WouldBlock)
        );
        table.unlock(F, X).unwrap();

        let snap = metrics.snapshot();
        assert_eq!(snap.grants_total, 1);
        assert_eq!(snap.contentions_total, 1);
    }

    #[test]
    fn many_owners_hammer_one_file() {
        // Exclusive holders must never overlap even under heavy contention.
        let table = Arc::new(LockTable::new());
        let in_critical = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for owner in 0..8_u64 {
            let table2 = Arc::clone(&table);
            let in_critical2 = Arc::clone(&in_critical);
            handles.push(std::thread::spawn(move || {
                let owner = OwnerToken::new(owner);
                for _ in 0..25 {
                    table2
                        .lock(F, owner, LockMode::Exclusive, WaitPolicy::WAIT)
                        .unwrap();
                    let now = in_critical2.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(now, 0, "two exclusive holders at once");
                    std::thread::yield_now();
                    in_critical2.fetch_sub(1, Ordering::SeqCst);
                    table2.unlock(F, owner).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(
            table.file_count(),
            0,
            "all entries collected after the storm"
        );
    }
}
