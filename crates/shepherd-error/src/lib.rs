use thiserror::Error;

/// Primary error type for shepherd lock operations.
///
/// Variants carry raw identifier values (not the newtypes from
/// `shepherd-types`) so this crate stays dependency-free and usable from
/// every layer. Callers that need the typed ids already have them.
///
/// Note what is *not* here: unlocking a file the owner does not hold is
/// success, never an error; the manager mirrors permissive unlock
/// semantics.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    // === Expected control flow ===
    /// Non-blocking request conflicts with current holders.
    #[error("resource temporarily unavailable")]
    WouldBlock,

    /// Deadline elapsed while the request was queued.
    #[error("lock wait timed out")]
    TimedOut,

    // === Caller mistakes ===
    /// Operation named a handle this client never issued (or already closed).
    #[error("unknown file handle {handle}")]
    InvalidHandle { handle: u64 },

    /// The handle was closed while this lock wait was still queued.
    #[error("handle {handle} closed during lock wait")]
    HandleClosed { handle: u64 },

    /// Other argument misuse.
    #[error("invalid argument: {detail}")]
    InvalidArgument { detail: String },

    // === Authority routing (transient; the transport retries) ===
    /// Request reached a node that is not the file's authority.
    #[error("node {node} is not the lock authority for file {file}")]
    NotAuthoritative { file: u64, node: u32 },

    /// Authority handoff for the file is in flight.
    #[error("lock authority for file {file} is transferring")]
    AuthorityTransferring { file: u64 },

    // === Fatal (all waiters on the file are aborted) ===
    /// Two live authorities were detected for one file.
    #[error("split-brain: multiple lock authorities for file {file}")]
    SplitBrain { file: u64 },

    /// A holder-set invariant was violated; the file's lock state is
    /// unusable until remount.
    #[error("lock state corrupt: {detail}")]
    StateCorrupt { detail: String },
}

/// POSIX-style result codes surfaced at the client boundary.
///
/// The numeric values are the errno constants the original file-lock
/// surface reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    /// Successful result.
    Ok = 0,
    /// EAGAIN/EWOULDBLOCK: the request could not be satisfied immediately.
    WouldBlock = 11,
    /// EINVAL: bad handle, owner, or mode.
    InvalidArgument = 22,
    /// ENOLCK: the lock authority is unreachable or mid-handoff; retry.
    Unavailable = 37,
    /// ETIMEDOUT: the wait deadline elapsed.
    TimedOut = 110,
    /// ENOTRECOVERABLE: lock state lost to an invariant violation.
    Fatal = 131,
}

impl LockError {
    /// Map this error to the code reported at the client boundary.
    #[must_use]
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::WouldBlock => ErrorCode::WouldBlock,
            Self::TimedOut => ErrorCode::TimedOut,
            Self::InvalidHandle { .. }
            | Self::HandleClosed { .. }
            | Self::InvalidArgument { .. } => ErrorCode::InvalidArgument,
            Self::NotAuthoritative { .. } | Self::AuthorityTransferring { .. } => {
                ErrorCode::Unavailable
            }
            Self::SplitBrain { .. } | Self::StateCorrupt { .. } => ErrorCode::Fatal,
        }
    }

    /// The errno value for this error (negative form is what the classic
    /// C surface returns).
    #[must_use]
    pub const fn errno(&self) -> i32 {
        self.error_code() as i32
    }

    /// Whether a retry (after re-routing or backoff) may succeed.
    ///
    /// `WouldBlock` and `TimedOut` are deliberate caller decisions, not
    /// transient infrastructure states, so they are excluded.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NotAuthoritative { .. } | Self::AuthorityTransferring { .. }
        )
    }

    /// Whether this error abandons all pending waiters on the file.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::SplitBrain { .. } | Self::StateCorrupt { .. })
    }

    /// Create an `InvalidArgument` error.
    pub fn invalid_argument(detail: impl Into<String>) -> Self {
        Self::InvalidArgument {
            detail: detail.into(),
        }
    }

    /// Create a `StateCorrupt` error.
    pub fn corrupt(detail: impl Into<String>) -> Self {
        Self::StateCorrupt {
            detail: detail.into(),
        }
    }
}

/// Result type alias using `LockError`.
pub type Result<T> = std::result::Result<T, LockError>;
