//! The reference loopback backend (§6.5): a real, in-process implementation
//! of the [`Backend`] contract used for tests and single-machine runs.
//!
//! Every rank's inbound traffic lives in one [`crossbeam_queue::SegQueue`] of
//! framed records (wire tag + payload bytes). A `recv` scans its own queue
//! under the rank's matching lock; anything that doesn't match the requested
//! (tag, mask) is held on a side buffer so later, more specific receives can
//! still find it. There is no actual network: `endpoint_connect` just looks
//! up the peer's queue handle in a registry shared by every worker created
//! from the same [`LoopbackFabric`].
//!
//! A `recv` that finds no match at post time registers a pending descriptor
//! pointing at the caller's buffer; a later `send` that matches it writes
//! directly into that buffer and marks the request complete, the same way a
//! real network backend completes a receive asynchronously from whatever
//! thread happens to be driving its progress engine.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_queue::SegQueue;
use parking_lot::Mutex;

use super::{
    Backend, EndpointHandle, InitGrant, InitParams, RequestHandle, RequestStatus, ThreadMode,
    WorkerHandle,
};
use crate::error::{Result, TransportError};

struct Record {
    wire_tag: u64,
    payload: Vec<u8>,
}

/// A raw pointer into a caller-owned buffer that a pending receive will
/// write into once a matching send arrives.
///
/// # Safety
/// The same contract a real RDMA/MPI backend relies on: the caller must keep
/// the buffer alive and must not move or alias it until the request
/// completes or is cancelled. `Communicator`/`Future` uphold this by owning
/// the buffer for the request's entire lifetime.
struct RawBuf {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: `RawBuf` is only ever dereferenced while holding `FabricInner`'s
// lock, and the pointed-to buffer is guaranteed live by the caller contract
// documented on `RawBuf`.
unsafe impl Send for RawBuf {}

struct PendingRecv {
    buf: RawBuf,
    wire_tag: u64,
    mask: u64,
}

struct Inbox {
    queue: SegQueue<Record>,
    /// Records pulled off `queue` that didn't match some earlier receive;
    /// held here so a later, differently-tagged receive can still see them.
    unmatched: Mutex<VecDeque<Record>>,
    /// Receives posted with no match yet, keyed by request id.
    pending: Mutex<HashMap<u64, PendingRecv>>,
}

impl Inbox {
    fn new() -> Self {
        Inbox {
            queue: SegQueue::new(),
            unmatched: Mutex::new(VecDeque::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Scans `unmatched` then `queue` for a record matching `wire_tag` under
    /// `mask`, copies it into `buf`, and reports the actual wire tag it
    /// matched (the caller needs this to recover the sender rank for
    /// any-source receives).
    fn try_recv(&self, buf: &mut [u8], wire_tag: u64, mask: u64) -> Option<u64> {
        let mut held = self.unmatched.lock();
        if let Some(pos) = held.iter().position(|r| r.wire_tag & mask == wire_tag & mask) {
            let record = held.remove(pos).unwrap();
            let n = record.payload.len().min(buf.len());
            buf[..n].copy_from_slice(&record.payload[..n]);
            return Some(record.wire_tag);
        }
        drop(held);

        while let Some(record) = self.queue.pop() {
            if record.wire_tag & mask == wire_tag & mask {
                let n = record.payload.len().min(buf.len());
                buf[..n].copy_from_slice(&record.payload[..n]);
                return Some(record.wire_tag);
            }
            self.unmatched.lock().push_back(record);
        }
        None
    }

    /// Delivers an incoming record: if it matches a pending receive's
    /// (tag, mask), writes straight into that receive's buffer and reports
    /// its request id as newly completed; otherwise queues it normally.
    fn deliver(&self, record: Record) -> Option<u64> {
        let mut pending = self.pending.lock();
        let hit = pending
            .iter()
            .find(|(_, p)| record.wire_tag & p.mask == p.wire_tag & p.mask)
            .map(|(id, _)| *id);
        if let Some(id) = hit {
            let entry = pending.remove(&id).unwrap();
            let n = record.payload.len().min(entry.buf.len);
            // SAFETY: see `RawBuf`; the buffer is still live for the
            // duration of the request and we hold the exclusive slot for it.
            unsafe {
                std::ptr::copy_nonoverlapping(record.payload.as_ptr(), entry.buf.ptr, n);
            }
            Some(id)
        } else {
            self.queue.push(record);
            None
        }
    }

    fn register_pending(&self, id: u64, entry: PendingRecv) {
        self.pending.lock().insert(id, entry);
    }

    fn is_completed(&self, id: u64) -> bool {
        !self.pending.lock().contains_key(&id)
    }

    fn cancel_pending(&self, id: u64) -> bool {
        self.pending.lock().remove(&id).is_some()
    }
}

/// A fabric of in-process workers that can address each other by index.
///
/// Create one `LoopbackFabric`, clone one [`LoopbackBackend`] handle per
/// simulated rank, and call [`LoopbackBackend::worker_create`] on each: their
/// serialized Address is just the rank index, so `endpoint_connect` can
/// resolve it directly against the shared registry.
#[derive(Clone)]
pub struct LoopbackFabric {
    inner: Arc<FabricInner>,
}

struct FabricInner {
    workers: Mutex<Vec<Arc<Inbox>>>,
    next_request: AtomicU64,
    /// Maps a request id back to the inbox it was registered against, so
    /// `request_check_status`/`request_free`/`request_cancel` don't need
    /// the worker handle repeated at every call site.
    owners: Mutex<HashMap<u64, Arc<Inbox>>>,
}

impl LoopbackFabric {
    /// Creates an empty fabric. `size` is a capacity hint, not a hard limit.
    pub fn new(size: usize) -> Self {
        LoopbackFabric {
            inner: Arc::new(FabricInner {
                workers: Mutex::new(Vec::with_capacity(size)),
                next_request: AtomicU64::new(1),
                owners: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Creates a [`LoopbackBackend`] bound to this fabric.
    pub fn backend(&self) -> LoopbackBackend {
        LoopbackBackend { fabric: self.clone() }
    }
}

/// A [`Backend`] implementation backed by a shared [`LoopbackFabric`].
///
/// Not a stub: this is the backend the crate's own integration tests run
/// against, and is suitable for development or single-process simulation
/// without a real network transport.
#[derive(Clone)]
pub struct LoopbackBackend {
    fabric: LoopbackFabric,
}

impl LoopbackBackend {
    /// Builds a standalone backend with its own single-worker fabric.
    pub fn standalone() -> Self {
        LoopbackFabric::new(1).backend()
    }
}

fn handle_index(h: WorkerHandle) -> usize {
    h.0 as usize
}

impl Backend for LoopbackBackend {
    fn init(&self, params: &InitParams) -> Result<InitGrant> {
        let thread_mode =
            if params.mt_workers_shared { ThreadMode::Serialized } else { ThreadMode::Single };
        Ok(InitGrant { request_size: params.request_size.max(8), thread_mode })
    }

    fn finalize(&self) {}

    fn worker_create(&self, _mode: ThreadMode) -> Result<(WorkerHandle, Vec<u8>)> {
        let mut workers = self.fabric.inner.workers.lock();
        let index = workers.len();
        workers.push(Arc::new(Inbox::new()));
        let address = (index as u64).to_le_bytes().to_vec();
        Ok((WorkerHandle(index as u64), address))
    }

    fn worker_destroy(&self, _worker: WorkerHandle) {}

    fn endpoint_connect(&self, _worker: WorkerHandle, address: &[u8]) -> Result<EndpointHandle> {
        if address.len() != 8 {
            return Err(TransportError::Usage(format!(
                "loopback address must be 8 bytes, got {}",
                address.len()
            )));
        }
        let mut raw = [0u8; 8];
        raw.copy_from_slice(address);
        let peer_index = u64::from_le_bytes(raw) as usize;
        let workers = self.fabric.inner.workers.lock();
        if peer_index >= workers.len() {
            return Err(TransportError::PeerUnknown(format!("loopback rank {peer_index}")));
        }
        Ok(EndpointHandle(peer_index as u64))
    }

    fn endpoint_close(&self, _endpoint: EndpointHandle) {}

    fn tag_send_nb(
        &self,
        endpoint: EndpointHandle,
        buf: &[u8],
        wire_tag: u64,
    ) -> Result<RequestHandle> {
        let workers = self.fabric.inner.workers.lock();
        let inbox = workers
            .get(handle_index(WorkerHandle(endpoint.0)))
            .ok_or_else(|| TransportError::PeerUnknown(format!("loopback rank {}", endpoint.0)))?
            .clone();
        drop(workers);
        inbox.deliver(Record { wire_tag, payload: buf.to_vec() });
        Ok(None)
    }

    fn tag_recv_nb(
        &self,
        worker: WorkerHandle,
        buf: &mut [u8],
        wire_tag: u64,
        mask: u64,
    ) -> Result<RequestHandle> {
        let workers = self.fabric.inner.workers.lock();
        let inbox = workers
            .get(handle_index(worker))
            .ok_or_else(|| TransportError::PeerUnknown(format!("loopback rank {}", worker.0)))?
            .clone();
        drop(workers);
        match inbox.try_recv(buf, wire_tag, mask) {
            Some(_matched_tag) => Ok(None),
            None => {
                let id = self.fabric.inner.next_request.fetch_add(1, Ordering::Relaxed);
                let entry = PendingRecv {
                    buf: RawBuf { ptr: buf.as_mut_ptr(), len: buf.len() },
                    wire_tag,
                    mask,
                };
                inbox.register_pending(id, entry);
                self.fabric.inner.owners.lock().insert(id, inbox);
                Ok(Some(id))
            }
        }
    }

    fn request_check_status(&self, request: u64) -> RequestStatus {
        let owners = self.fabric.inner.owners.lock();
        match owners.get(&request) {
            Some(inbox) if inbox.is_completed(request) => RequestStatus::Ok,
            Some(_) => RequestStatus::InProgress,
            None => RequestStatus::Ok,
        }
    }

    fn request_free(&self, request: u64) {
        self.fabric.inner.owners.lock().remove(&request);
    }

    fn request_cancel(&self, request: u64) -> bool {
        match self.fabric.inner.owners.lock().get(&request) {
            Some(inbox) => inbox.cancel_pending(request),
            None => false,
        }
    }

    fn worker_progress(&self, _worker: WorkerHandle) {}

    fn worker_flush_nb(&self, _worker: WorkerHandle) -> Result<RequestHandle> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_then_recv_round_trips_payload() {
        let fabric = LoopbackFabric::new(2);
        let backend = fabric.backend();
        let (w0, addr0) = backend.worker_create(ThreadMode::Single).unwrap();
        let (w1, addr1) = backend.worker_create(ThreadMode::Single).unwrap();

        let ep_to_1 = backend.endpoint_connect(w0, &addr1).unwrap();
        let _ep_to_0 = backend.endpoint_connect(w1, &addr0).unwrap();

        let payload = b"hello";
        backend.tag_send_nb(ep_to_1, payload, 42).unwrap();

        let mut buf = [0u8; 5];
        let req = backend.tag_recv_nb(w1, &mut buf, 42, crate::tag::EXACT_MASK);
        assert!(matches!(req, Ok(None)));
        assert_eq!(&buf, payload);
    }

    #[test]
    fn unmatched_tag_is_held_for_a_later_receive() {
        let fabric = LoopbackFabric::new(2);
        let backend = fabric.backend();
        let (w0, addr0) = backend.worker_create(ThreadMode::Single).unwrap();
        let (w1, addr1) = backend.worker_create(ThreadMode::Single).unwrap();
        let ep_to_1 = backend.endpoint_connect(w0, &addr1).unwrap();
        let _ = addr0;

        backend.tag_send_nb(ep_to_1, b"first", 1).unwrap();
        backend.tag_send_nb(ep_to_1, b"second", 2).unwrap();

        let mut buf = [0u8; 6];
        let req = backend.tag_recv_nb(w1, &mut buf, 2, crate::tag::EXACT_MASK);
        assert!(matches!(req, Ok(None)));
        assert_eq!(&buf, b"second");

        let mut buf2 = [0u8; 5];
        let req2 = backend.tag_recv_nb(w1, &mut buf2, 1, crate::tag::EXACT_MASK);
        assert!(matches!(req2, Ok(None)));
        assert_eq!(&buf2, b"first");
    }

    #[test]
    fn recv_with_no_match_returns_pending_handle() {
        let fabric = LoopbackFabric::new(1);
        let backend = fabric.backend();
        let (w0, _addr0) = backend.worker_create(ThreadMode::Single).unwrap();
        let mut buf = [0u8; 4];
        let req = backend.tag_recv_nb(w0, &mut buf, 99, crate::tag::EXACT_MASK);
        assert!(matches!(req, Ok(Some(_))));
        assert_eq!(backend.request_check_status(req.unwrap()), RequestStatus::InProgress);
    }

    #[test]
    fn a_send_after_the_matching_recv_completes_it_asynchronously() {
        let fabric = LoopbackFabric::new(2);
        let backend = fabric.backend();
        let (w0, addr0) = backend.worker_create(ThreadMode::Single).unwrap();
        let (w1, addr1) = backend.worker_create(ThreadMode::Single).unwrap();
        let ep_to_1 = backend.endpoint_connect(w0, &addr1).unwrap();
        let _ = addr0;

        let mut buf = [0u8; 3];
        let req = backend.tag_recv_nb(w1, &mut buf, 77, crate::tag::EXACT_MASK).unwrap().unwrap();
        assert_eq!(backend.request_check_status(req), RequestStatus::InProgress);

        backend.tag_send_nb(ep_to_1, &[1, 2, 3], 77).unwrap();
        assert_eq!(backend.request_check_status(req), RequestStatus::Ok);
        assert_eq!(buf, [1, 2, 3]);
        backend.request_free(req);
    }

    #[test]
    fn cancel_removes_an_unmatched_pending_receive() {
        let fabric = LoopbackFabric::new(1);
        let backend = fabric.backend();
        let (w0, _addr0) = backend.worker_create(ThreadMode::Single).unwrap();
        let mut buf = [0u8; 2];
        let req = backend.tag_recv_nb(w0, &mut buf, 1, crate::tag::EXACT_MASK).unwrap().unwrap();
        assert!(backend.request_cancel(req));
        assert!(!backend.request_cancel(req), "cancelling twice reports no match the second time");
    }
}
