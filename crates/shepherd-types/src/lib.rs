//! Core identifier and request types shared across the shepherd crates.
//!
//! Everything here is a plain value: identifiers are `Copy` newtypes whose
//! only required semantic operation is equality, and the request vocabulary
//! (`LockMode`, `WaitPolicy`, `LockRequest`) is transient data that is never
//! stored beyond the processing of a single call.

use std::fmt;
use std::time::Instant;

/// Opaque identifier of a locking context.
///
/// An owner token is scoped to one open-file-description: distinct threads,
/// processes, and remote clients normally present distinct tokens, but the
/// manager compares tokens by value only and never inspects what a token
/// "is". In particular an owner is *not* a thread id or a pid.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct OwnerToken(u64);

impl OwnerToken {
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw u64 value.
    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for OwnerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "owner#{}", self.0)
    }
}

impl From<u64> for OwnerToken {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// Stable identity of one file as seen by every client of the filesystem.
///
/// Produced by the namespace layer (an inode-like number); two handles on
/// the same file carry the same `FileId` no matter which host opened them.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct FileId(u64);

impl FileId {
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "file#{}", self.0)
    }
}

impl From<u64> for FileId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// Identity of one open-file-description handed out by [`open`].
///
/// Handles are process-local; the same file opened twice yields two
/// distinct handles over one `FileId`.
///
/// [`open`]: https://pubs.opengroup.org/onlinepubs/9699919799/functions/open.html
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct HandleId(u64);

impl HandleId {
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handle#{}", self.0)
    }
}

/// Identity of one client/authority instance (one per process or host).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct NodeId(u32);

impl NodeId {
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// Fencing epoch for authority placement.
///
/// Bumped exactly once per completed authority handoff for a file. An
/// instance whose local view of a file's epoch lags the registry is stale
/// and must not serve requests for that file.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct AuthorityEpoch(u64);

impl AuthorityEpoch {
    pub const ZERO: Self = Self(0);

    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for AuthorityEpoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "epoch#{}", self.0)
    }
}

/// Requested lock operation, mirroring the classic whole-file lock verbs.
///
/// `Unlock` is a first-class mode on the same request path (not a separate
/// API verb only): unlocking something you do not hold succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum LockMode {
    /// Non-exclusive hold; any number of owners may share it.
    Shared,
    /// Single-owner hold excluding all other shared and exclusive holders.
    Exclusive,
    /// Drop whatever the owner holds on the file.
    Unlock,
}

impl LockMode {
    /// Whether this mode takes (rather than drops) a hold.
    #[must_use]
    pub const fn is_hold(self) -> bool {
        matches!(self, Self::Shared | Self::Exclusive)
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Shared => "shared",
            Self::Exclusive => "exclusive",
            Self::Unlock => "unlock",
        };
        f.write_str(label)
    }
}

/// How long a request is willing to wait for a conflicting hold to clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPolicy {
    /// Return `WouldBlock` immediately on conflict.
    NonBlocking,
    /// Suspend until satisfiable; `deadline` bounds the wait, `None` waits
    /// indefinitely.
    Blocking { deadline: Option<Instant> },
}

impl WaitPolicy {
    /// Blocking wait with no deadline.
    pub const WAIT: Self = Self::Blocking { deadline: None };

    /// Blocking wait that gives up at `deadline`.
    #[must_use]
    pub const fn until(deadline: Instant) -> Self {
        Self::Blocking {
            deadline: Some(deadline),
        }
    }

    #[must_use]
    pub const fn is_blocking(self) -> bool {
        matches!(self, Self::Blocking { .. })
    }
}

/// One lock request as it travels from the client surface to the
/// arbitration engine. Transient; never stored beyond its processing.
#[derive(Debug, Clone, Copy)]
pub struct LockRequest {
    pub file: FileId,
    pub owner: OwnerToken,
    pub mode: LockMode,
    pub wait: WaitPolicy,
}

impl LockRequest {
    #[must_use]
    pub const fn new(file: FileId, owner: OwnerToken, mode: LockMode, wait: WaitPolicy) -> Self {
        Self {
            file,
            owner,
            mode,
            wait,
        }
    }
}
