//! Lock event observation and metrics.
//!
//! All observation is opt-in via the [`LockObserver`] trait; when no
//! observer is registered the default [`NoOpObserver`] is inlined away.
//! Observers are called inside the per-file critical section, so they MUST
//! be non-blocking and must not call back into the lock manager.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use shepherd_types::{FileId, LockMode, NodeId, OwnerToken};

// ---------------------------------------------------------------------------
// LockEvent
// ---------------------------------------------------------------------------

/// A single event emitted by the lock arbitration engine.
///
/// Each variant carries enough context to reconstruct what happened without
/// access to internal lock state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum LockEvent {
    /// A request was granted (immediately or after waiting).
    Granted {
        file: FileId,
        owner: OwnerToken,
        mode: LockMode,
        /// Nanoseconds spent queued; 0 for an immediate grant.
        waited_ns: u64,
    },

    /// A request conflicted with the current holders.
    Contention {
        file: FileId,
        owner: OwnerToken,
        mode: LockMode,
        /// Number of holders at the time of the conflict.
        holders: usize,
    },

    /// A queued request gave up at its deadline.
    TimedOut {
        file: FileId,
        owner: OwnerToken,
        mode: LockMode,
    },

    /// A queued request was cancelled (its handle closed).
    WaitCancelled { file: FileId, owner: OwnerToken },

    /// Authority handoff for a file began.
    HandoffStarted {
        file: FileId,
        from: NodeId,
        to: NodeId,
    },

    /// Authority handoff completed; the new epoch is live.
    HandoffCompleted {
        file: FileId,
        to: NodeId,
        epoch: u64,
    },

    /// A fatal condition aborted every waiter on a file.
    FatalAborted { file: FileId, waiters: usize },
}

impl LockEvent {
    /// Whether this event represents contention or failure (as opposed to
    /// a grant or a completed handoff).
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        !matches!(
            self,
            Self::Granted { .. } | Self::HandoffStarted { .. } | Self::HandoffCompleted { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// LockObserver
// ---------------------------------------------------------------------------

/// Observer trait for lock events.
///
/// Called on the hot path inside the per-file critical section; expensive
/// work must be deferred.
pub trait LockObserver: Send + Sync {
    fn on_event(&self, event: &LockEvent);
}

/// No-op observer, the default when observability is not configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpObserver;

impl LockObserver for NoOpObserver {
    #[inline(always)]
    fn on_event(&self, _event: &LockEvent) {}
}

// ---------------------------------------------------------------------------
// EventRingBuffer
// ---------------------------------------------------------------------------

/// Fixed-capacity ring buffer of recent lock events.
///
/// When full, the oldest event is overwritten. Thread-safe via an internal
/// mutex; reads happen off the hot path (diagnostics only).
pub struct EventRingBuffer {
    events: Mutex<RingBuf>,
}

struct RingBuf {
    buf: Vec<LockEvent>,
    capacity: usize,
    head: usize,
    len: usize,
}

impl RingBuf {
    fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            capacity,
            head: 0,
            len: 0,
        }
    }

    fn push(&mut self, event: LockEvent) {
        if self.capacity == 0 {
            return;
        }
        let idx = (self.head + self.len) % self.capacity;
        if self.buf.len() < self.capacity {
            self.buf.push(event);
        } else {
            self.buf[idx] = event;
        }
        if self.len == self.capacity {
            self.head = (self.head + 1) % self.capacity;
        } else {
            self.len += 1;
        }
    }

    fn snapshot_ordered(&self) -> Vec<LockEvent> {
        let mut result = Vec::with_capacity(self.len);
        for i in 0..self.len {
            let idx = (self.head + i) % self.capacity;
            result.push(self.buf[idx].clone());
        }
        result
    }
}

impl EventRingBuffer {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(RingBuf::new(capacity)),
        }
    }

    pub fn push(&self, event: LockEvent) {
        self.events.lock().push(event);
    }

    /// All stored events in chronological order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<LockEvent> {
        self.events.lock().snapshot_ordered()
    }

    pub fn clear(&self) {
        let mut guard = self.events.lock();
        guard.buf.clear();
        guard.head = 0;
        guard.len = 0;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LockObserver for EventRingBuffer {
    fn on_event(&self, event: &LockEvent) {
        self.push(event.clone());
    }
}

// ---------------------------------------------------------------------------
// LockMetrics
// ---------------------------------------------------------------------------

/// Aggregated lock statistics.
///
/// All counters are atomic for lock-free updates from the hot path.
#[derive(Debug, Default)]
pub struct LockMetrics {
    pub grants_total: AtomicU64,
    pub grants_after_wait: AtomicU64,
    pub contentions_total: AtomicU64,
    pub timeouts_total: AtomicU64,
    pub waits_cancelled: AtomicU64,
    pub handoffs_total: AtomicU64,
    pub fatal_aborts_total: AtomicU64,
}

/// Point-in-time copy of [`LockMetrics`], serializable for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub grants_total: u64,
    pub grants_after_wait: u64,
    pub contentions_total: u64,
    pub timeouts_total: u64,
    pub waits_cancelled: u64,
    pub handoffs_total: u64,
    pub fatal_aborts_total: u64,
}

impl LockMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            grants_total: self.grants_total.load(Ordering::Relaxed),
            grants_after_wait: self.grants_after_wait.load(Ordering::Relaxed),
            contentions_total: self.contentions_total.load(Ordering::Relaxed),
            timeouts_total: self.timeouts_total.load(Ordering::Relaxed),
            waits_cancelled: self.waits_cancelled.load(Ordering::Relaxed),
            handoffs_total: self.handoffs_total.load(Ordering::Relaxed),
            fatal_aborts_total: self.fatal_aborts_total.load(Ordering::Relaxed),
        }
    }
}

impl LockObserver for LockMetrics {
    fn on_event(&self, event: &LockEvent) {
        match event {
            LockEvent::Granted { waited_ns, .. } => {
                self.grants_total.fetch_add(1, Ordering::Relaxed);
                if *waited_ns > 0 {
                    self.grants_after_wait.fetch_add(1, Ordering::Relaxed);
                }
            }
            LockEvent::Contention { .. } => {
                self.contentions_total.fetch_add(1, Ordering::Relaxed);
            }
            LockEvent::TimedOut { .. } => {
                self.timeouts_total.fetch_add(1, Ordering::Relaxed);
            }
            LockEvent::WaitCancelled { .. } => {
                self.waits_cancelled.fetch_add(1, Ordering::Relaxed);
            }
            LockEvent::HandoffCompleted { .. } => {
                self.handoffs_total.fetch_add(1, Ordering::Relaxed);
            }
            LockEvent::HandoffStarted { .. } => {}
            LockEvent::FatalAborted { .. } => {
                self.fatal_aborts_total.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}
