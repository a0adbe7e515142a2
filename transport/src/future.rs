//! Futures and requests (C6): the non-blocking completion handle returned by
//! every `send`/`recv` that isn't routed through a continuation (§4.4).
//!
//! Grounded on the `future_ref<T>`/`future<T>` split in `ucx2/future.hpp`:
//! a request starts out either already complete (the backend's inline fast
//! path) or pending on a backend request handle, and `wait`/`ready` poll the
//! backend's progress engine until it settles. There is no OS-level blocking
//! anywhere in this crate (§4.4, Non-goals): `wait` spins, calling
//! `worker_progress` between checks.
//!
//! §4.5's `wait()` is a two-phase algorithm tuned by the "other worker"
//! relationship: because matching progress requires *some* worker to be
//! progressed, and the posting worker and its complement (the process's
//! other local worker — recv-side for a send, send-side for a receive) may
//! differ, a `Future` keeps a pointer to both. `Worker::lock` already
//! resolves to a no-op for a thread-private worker and a real lock for the
//! shared one, so locking `worker` unconditionally here gets both cases
//! right without this module needing to know which kind it has.

use std::sync::Arc;

use crate::backend::RequestStatus;
use crate::error::{Result, TransportError};
use crate::worker::Worker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Completed before the submitting call returned; nothing left to poll.
    Ready,
    /// Still outstanding on the backend.
    Pending(u64),
    /// `get`/`wait` already consumed this request.
    Consumed,
}

/// A handle to a single outstanding (or already-complete) send/recv.
///
/// `T` is the payload the operation produced: the sent buffer for a send,
/// the received buffer for a `recv`. A `Future` that is already `Ready`
/// carries its value immediately; `ready()`/`wait()` return it without ever
/// touching the backend.
pub struct Future<T> {
    state: State,
    /// The worker this operation was posted on.
    worker: Arc<Worker>,
    /// The communicator's complementary local worker (§4.4: `other =
    /// recv_worker` for a send, the send worker for a receive), when the two
    /// don't collapse onto the same worker. Progressed opportunistically by
    /// `wait()`'s second phase.
    other: Option<Arc<Worker>>,
    value: Option<T>,
}

impl<T> Future<T> {
    /// Wraps a value that completed inline, with no backend request to poll.
    pub fn ready(value: T, worker: Arc<Worker>, other: Option<Arc<Worker>>) -> Self {
        Future { state: State::Ready, worker, other, value: Some(value) }
    }

    /// Wraps a backend request that has not completed yet, together with the
    /// value it will resolve to once it has (the send buffer, for a send; the
    /// target buffer, for a recv). The value is kept alive by the `Future`
    /// itself for as long as the request is outstanding, rather than handed
    /// back early, since the backend may still be reading from or writing
    /// into it on the wire.
    pub fn pending(request: u64, worker: Arc<Worker>, other: Option<Arc<Worker>>, value: T) -> Self {
        Future { state: State::Pending(request), worker, other, value: Some(value) }
    }

    /// True if the operation has completed. Never touches the backend or any
    /// lock — pairs with an external progress loop (§4.4).
    pub fn test_only(&mut self) -> bool {
        match self.state {
            State::Ready | State::Consumed => true,
            State::Pending(req) => {
                if self.worker.backend().request_check_status(req) == RequestStatus::Ok {
                    self.worker.backend().request_free(req);
                    self.state = State::Ready;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Non-blocking probe (§4.5, "ready() algorithm, thread-safe variant"):
    /// try-locks the worker; if contended, reports not-ready rather than
    /// waiting for it. If acquired, advances progress once and tests status.
    pub fn ready(&mut self) -> bool {
        if matches!(self.state, State::Ready | State::Consumed) {
            return true;
        }
        let State::Pending(req) = self.state else { unreachable!() };
        let Some(_guard) = self.worker.try_lock() else { return false };
        let backend = self.worker.backend();
        backend.worker_progress(self.worker.backend_handle());
        if backend.request_check_status(req) == RequestStatus::Ok {
            backend.request_free(req);
            self.state = State::Ready;
            true
        } else {
            false
        }
    }

    /// One iteration of the two-phase wait algorithm (§4.5): lock (blocking)
    /// and progress the own worker a few times, then — if still pending —
    /// opportunistically try-lock and progress the complementary worker
    /// once. Returns true once the request is observed complete.
    fn poll_once(&mut self) -> bool {
        if matches!(self.state, State::Ready | State::Consumed) {
            return true;
        }
        let State::Pending(req) = self.state else { unreachable!() };
        let backend = self.worker.backend();

        {
            let _guard = self.worker.lock();
            for _ in 0..3 {
                backend.worker_progress(self.worker.backend_handle());
                if backend.request_check_status(req) == RequestStatus::Ok {
                    backend.request_free(req);
                    self.state = State::Ready;
                    return true;
                }
            }
        }

        if let Some(other) = self.other.as_ref() {
            if let Some(_guard) = other.try_lock() {
                backend.worker_progress(other.backend_handle());
                if backend.request_check_status(req) == RequestStatus::Ok {
                    backend.request_free(req);
                    self.state = State::Ready;
                    return true;
                }
            }
        }
        false
    }

    /// Spins, running the two-phase poll between checks, until the operation
    /// completes, then returns its value.
    ///
    /// # Panics
    /// Panics if called after the future has already yielded its value.
    pub fn wait(mut self) -> T {
        while !self.poll_once() {
            std::hint::spin_loop();
        }
        self.state = State::Consumed;
        self.value.take().expect("future polled for a value twice")
    }

    /// Attempts to cancel the underlying request.
    ///
    /// Returns `true` only if the backend confirms the request was unmatched
    /// at the moment of cancellation; a request that had already started
    /// matching on the wire returns `false`, and the caller should continue
    /// to `wait()` it to completion normally rather than discard it (§9,
    /// Open Question 4).
    pub fn cancel(&mut self) -> Result<bool> {
        match self.state {
            State::Ready | State::Consumed => Ok(false),
            State::Pending(req) => {
                let backend = self.worker.backend();
                let cancelled = backend.request_cancel(req);
                if cancelled {
                    backend.request_free(req);
                    self.state = State::Consumed;
                    self.value = None;
                    Ok(true)
                } else if backend.request_check_status(req) == RequestStatus::Ok {
                    backend.request_free(req);
                    self.state = State::Ready;
                    Ok(false)
                } else {
                    Err(TransportError::CancelledOrMismatched { peer: 0, tag: 0 })
                }
            }
        }
    }
}

impl<T> Drop for Future<T> {
    /// Cancels (and frees) a still-outstanding backend request before the
    /// held buffer is dropped.
    ///
    /// A backend may retain a raw pointer into that buffer for as long as
    /// the request is pending (the same contract a real RDMA/MPI backend
    /// relies on); dropping a `Future` without first retiring its request
    /// would free the buffer out from under it. A caller that wants to know
    /// whether the drop found anything still pending should call
    /// `wait()`/`cancel()` explicitly instead of relying on this.
    fn drop(&mut self) {
        if let State::Pending(req) = self.state {
            let backend = self.worker.backend();
            let _ = backend.request_cancel(req);
            backend.request_free(req);
        }
    }
}
