//! Per-file holder record and the shared/exclusive compatibility rules.
//!
//! [`LockState`] is the pure state machine: it knows nothing about waiting,
//! wakeups, or authority placement. All mutation happens through
//! [`LockState::try_apply`], which either applies the requested mode as one
//! atomic transition or reports a conflict without touching anything.

use std::collections::HashSet;

use shepherd_types::{LockMode, OwnerToken};

/// What a successful apply did to the holder record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Owner now holds a lock it did not hold before.
    Acquired,
    /// Owner re-requested the mode it already holds; no-op.
    Reacquired,
    /// Sole shared holder moved to exclusive in one step.
    Upgraded,
    /// Exclusive holder moved to shared in one step.
    Downgraded,
    /// Owner's hold was dropped.
    Released,
    /// Unlock by an owner holding nothing; success, nothing changed.
    AlreadyUnlocked,
}

/// Result of a [`LockState::try_apply`] attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The request was applied as one atomic transition.
    Applied(Transition),
    /// The request conflicts with current holders; state untouched.
    Conflict,
}

impl ApplyOutcome {
    #[must_use]
    pub const fn is_applied(self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// Current holders of one file's lock.
///
/// Invariants:
/// - a present exclusive holder implies an empty shared set (and vice
///   versa);
/// - an owner appears in at most one holder collection (a re-lock by the
///   same owner replaces its hold, never adds a second one).
#[derive(Debug, Clone, Default)]
pub struct LockState {
    exclusive: Option<OwnerToken>,
    shared: HashSet<OwnerToken>,
}

impl LockState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether no owner holds anything.
    #[must_use]
    pub fn is_unlocked(&self) -> bool {
        self.exclusive.is_none() && self.shared.is_empty()
    }

    /// Number of current holders (0 or 1 exclusive, any number shared).
    #[must_use]
    pub fn holder_count(&self) -> usize {
        usize::from(self.exclusive.is_some()) + self.shared.len()
    }

    /// The exclusive holder, if any.
    #[must_use]
    pub fn exclusive_holder(&self) -> Option<OwnerToken> {
        self.exclusive
    }

    /// Current shared holders, in arbitrary order.
    #[must_use]
    pub fn shared_holders(&self) -> Vec<OwnerToken> {
        self.shared.iter().copied().collect()
    }

    /// The mode `owner` currently holds, if any.
    #[must_use]
    pub fn holds(&self, owner: OwnerToken) -> Option<LockMode> {
        if self.exclusive == Some(owner) {
            Some(LockMode::Exclusive)
        } else if self.shared.contains(&owner) {
            Some(LockMode::Shared)
        } else {
            None
        }
    }

    /// Whether applying `mode` for `owner` would succeed right now.
    ///
    /// Same-owner transitions count as compatible: the holder of the
    /// exclusive lock may take it shared (downgrade), and the sole shared
    /// holder may take it exclusive (upgrade).
    #[must_use]
    pub fn compatible(&self, owner: OwnerToken, mode: LockMode) -> bool {
        match mode {
            LockMode::Unlock => true,
            LockMode::Shared => self.exclusive.is_none_or(|holder| holder == owner),
            LockMode::Exclusive => {
                self.exclusive.is_none_or(|holder| holder == owner)
                    && self.shared.iter().all(|holder| *holder == owner)
            }
        }
    }

    /// Apply `mode` for `owner` as one atomic transition, or report a
    /// conflict leaving the record untouched.
    ///
    /// Upgrade and downgrade replace the owner's hold in the same step;
    /// there is never an intermediate unlocked state another owner could
    /// observe or steal.
    pub fn try_apply(&mut self, owner: OwnerToken, mode: LockMode) -> ApplyOutcome {
        if !self.compatible(owner, mode) {
            return ApplyOutcome::Conflict;
        }

        let transition = match mode {
            LockMode::Shared => {
                let downgraded = self.exclusive.take().is_some();
                let transition = if downgraded {
                    Transition::Downgraded
                } else if self.shared.contains(&owner) {
                    Transition::Reacquired
                } else {
                    Transition::Acquired
                };
                self.shared.insert(owner);
                transition
            }
            LockMode::Exclusive => {
                let transition = if self.exclusive == Some(owner) {
                    Transition::Reacquired
                } else if self.shared.contains(&owner) {
                    Transition::Upgraded
                } else {
                    Transition::Acquired
                };
                self.shared.clear();
                self.exclusive = Some(owner);
                transition
            }
            LockMode::Unlock => {
                let dropped_shared = self.shared.remove(&owner);
                let dropped_exclusive = self.exclusive == Some(owner);
                if dropped_exclusive {
                    self.exclusive = None;
                }
                if dropped_shared || dropped_exclusive {
                    Transition::Released
                } else {
                    Transition::AlreadyUnlocked
                }
            }
        };

        tracing::debug!(%owner, %mode, ?transition, "lock state transition");
        ApplyOutcome::Applied(transition)
    }

    /// Check the holder invariants, reporting the violation instead of
    /// proceeding on corrupt state.
    pub fn verify(&self) -> Result<(), String> {
        if let Some(holder) = self.exclusive {
            if !self.shared.is_empty() {
                return Err(format!(
                    "exclusive holder {holder} coexists with {} shared holder(s)",
                    self.shared.len()
                ));
            }
        }
        Ok(())
    }
}
