//! The Backend Contract (§6.1): the dynamic-dispatch boundary between the
//! core and a wire implementation.
//!
//! The source this crate is modeled on selects a backend (MPI, UCX, …) with
//! heavy compile-time templating. The core here instead depends on a single
//! trait object, [`Backend`], fixed once at [`crate::context::Context`]
//! construction. A concrete backend owns its own worker/endpoint/request
//! representations behind the opaque handle types below; the core never
//! inspects them.

#[cfg(feature = "loopback")]
pub mod loopback;

use crate::error::Result;

/// Thread-mode a worker is created with, mirroring the MPI/UCX vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadMode {
    /// Single calling thread; no internal locking.
    Single,
    /// Any thread may call in, serialized by the backend (or the core's own lock).
    Serialized,
}

/// Parameters a backend is initialized with (§6.1).
#[derive(Debug, Clone)]
pub struct InitParams {
    /// Size, in bytes, the core reserves per request; `0` lets the backend choose.
    pub request_size: usize,
    /// Mask the backend should treat as "core does its own sender extraction".
    pub tag_sender_mask: u64,
    /// Whether a thread-mode of [`ThreadMode::Serialized`] must be supported.
    pub mt_workers_shared: bool,
    /// Upper bound on the number of endpoints this run is expected to create.
    pub estimated_num_eps: u32,
}

/// What the backend actually granted, which may differ from what was asked for.
#[derive(Debug, Clone, Copy)]
pub struct InitGrant {
    /// The backend's own internal per-request reservation, in bytes.
    pub request_size: usize,
    /// The thread-mode the backend actually supports.
    pub thread_mode: ThreadMode,
}

/// Status of an in-flight backend request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    /// The operation has completed successfully.
    Ok,
    /// The operation has not yet completed.
    InProgress,
    /// The operation failed; the string is attached at the call site.
    Error,
}

/// An opaque, backend-owned worker handle.
///
/// The core is generic over backends through `Box<dyn Backend>`, so handles
/// need a stable, type-erased representation; each backend packs whatever it
/// needs (an index into an internal table, a raw pointer, …) into the `u64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerHandle(pub u64);

/// An opaque, backend-owned endpoint handle (one per connected peer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointHandle(pub u64);

/// An opaque, backend-owned in-flight request handle.
///
/// `None` is the "inline completion" / "ready-null" state described in §4.5:
/// the operation finished before the submitting call returned, so there is no
/// request left to poll or free.
pub type RequestHandle = Option<u64>;

/// The Backend Contract (§6.1): the minimal set of operations the core needs
/// from a wire implementation.
///
/// Implementors are expected to be cheap to clone (an `Arc`-wrapped handle to
/// shared backend state is typical) since the core hands out one reference
/// per [`crate::context::Context`] and keeps it for the run's duration.
pub trait Backend: Send + Sync {
    /// One-time setup; returns what the backend actually granted.
    fn init(&self, params: &InitParams) -> Result<InitGrant>;

    /// Tears down the backend. Called only after every worker has been
    /// destroyed (§5, Context teardown order).
    fn finalize(&self);

    /// Creates a worker with the requested thread-mode, returning its handle
    /// and its serialized Address bytes.
    fn worker_create(&self, mode: ThreadMode) -> Result<(WorkerHandle, Vec<u8>)>;

    /// Destroys a worker. The caller (the core's `Worker`) has already closed
    /// every endpoint it cached.
    fn worker_destroy(&self, worker: WorkerHandle);

    /// Connects `worker` to a peer given its serialized Address.
    fn endpoint_connect(&self, worker: WorkerHandle, address: &[u8]) -> Result<EndpointHandle>;

    /// Closes an endpoint in flush mode (lets in-flight sends finish first).
    fn endpoint_close(&self, endpoint: EndpointHandle);

    /// Posts a non-blocking tagged send. `Ok(None)` means the send completed
    /// inline; `Ok(Some(handle))` means it is in progress.
    fn tag_send_nb(
        &self,
        endpoint: EndpointHandle,
        buf: &[u8],
        wire_tag: u64,
    ) -> Result<RequestHandle>;

    /// Posts a non-blocking tagged receive into `buf`, matching `wire_tag`
    /// under `mask`. `Ok(None)` means a buffered message already matched and
    /// was copied in inline.
    fn tag_recv_nb(
        &self,
        worker: WorkerHandle,
        buf: &mut [u8],
        wire_tag: u64,
        mask: u64,
    ) -> Result<RequestHandle>;

    /// Polls an in-flight request without advancing the backend's progress engine.
    fn request_check_status(&self, request: u64) -> RequestStatus;

    /// Releases backend-side resources for a completed (or cancelled) request.
    fn request_free(&self, request: u64);

    /// Attempts to cancel an in-flight request. Returns `true` if the backend
    /// confirms it was unmatched at the time of cancellation (§9, Open
    /// Question 4); a request that had already started matching returns
    /// `false` and is left to complete normally.
    fn request_cancel(&self, request: u64) -> bool;

    /// Advances the backend's internal progress engine by one unit of work.
    fn worker_progress(&self, worker: WorkerHandle);

    /// Posts a non-blocking flush, used during graceful worker shutdown.
    fn worker_flush_nb(&self, worker: WorkerHandle) -> Result<RequestHandle>;
}
