//! The crate's single error type.
//!
//! Every fallible operation in `tagged-transport` returns `Result<T, TransportError>`.
//! There is no type erasure at the public API boundary: callers can match on
//! the variant directly instead of downcasting.

use thiserror::Error;

/// Errors surfaced by the transport core.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The wire backend did not grant the thread-mode the context required.
    ///
    /// Fatal at context construction; there is no way to recover within the
    /// same backend instance.
    #[error("backend granted thread-mode {granted:?}, but {required:?} was required")]
    Configuration {
        /// The thread-mode the context asked the backend for.
        required: crate::backend::ThreadMode,
        /// The thread-mode the backend actually granted.
        granted: crate::backend::ThreadMode,
    },

    /// The backend rejected a `send`/`recv` submission.
    #[error("submission of {op} to rank {peer} (tag {tag}) failed: {reason}")]
    Submission {
        /// `"send"` or `"recv"`.
        op: &'static str,
        /// The peer rank the operation targeted.
        peer: usize,
        /// The user tag of the failed operation.
        tag: u32,
        /// Backend-reported reason.
        reason: String,
    },

    /// A caller-level precondition was violated (tag out of range, `dst`/`src`
    /// out of `0..size`, a borrowed message passed to `send_multi`, …).
    #[error("usage error: {0}")]
    Usage(String),

    /// `connect(rank)` or `connect(uuid)` found no address-database entry for the peer.
    #[error("no address known for peer {0}")]
    PeerUnknown(String),

    /// A receive was cancelled after the backend had already started matching it;
    /// the data, if any, was delivered to the callback rather than discarded.
    #[error("receive from rank {peer} (tag {tag}) was cancelled after partial match")]
    CancelledOrMismatched {
        /// The peer rank the receive was posted against.
        peer: usize,
        /// The user tag of the cancelled receive.
        tag: u32,
    },

    /// The context is being torn down; no further operations may be submitted.
    #[error("context is shutting down")]
    Shutdown,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TransportError>;
