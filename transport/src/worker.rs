//! Workers (C4): the per-thread (or per-process, for the shared worker)
//! handle that owns a continuation communicator and its connected endpoints.
//!
//! A [`crate::context::Context`] creates exactly one *shared* worker at
//! startup and, in the thread-private Configuration, one additional worker
//! per thread (§3, §4.1). Every worker is independent: its own backend
//! worker handle, its own endpoint cache, its own
//! [`ContinuationCommunicator`]. Connecting the same peer from two different
//! workers yields two distinct [`Endpoint`]s.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::addr_db::AddressDb;
use crate::address::{Address, EndpointInfo};
use crate::backend::{Backend, EndpointHandle, ThreadMode, WorkerHandle};
use crate::continuation::ContinuationCommunicator;
use crate::error::{Result, TransportError};
use tagged_transport_logging::{StateEvent, WorkerSetup};
use tracing::{debug, trace};
use crate::uuid::Uuid;

/// A connection to a single peer, as seen from one worker.
#[derive(Debug, Clone, Copy)]
pub struct Endpoint {
    rank: usize,
    handle: EndpointHandle,
}

/// The guard returned by [`Worker::lock`]/[`Worker::try_lock`].
///
/// `Private` holds nothing — a thread-private worker has no contention to
/// guard against, so there is no mutex to acquire. `Shared` holds the real
/// `parking_lot` guard for the process's shared worker.
pub enum LockGuard<'a> {
    Private,
    Shared(parking_lot::MutexGuard<'a, ()>),
}

impl Endpoint {
    /// The rank this endpoint is connected to.
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub(crate) fn handle(&self) -> EndpointHandle {
        self.handle
    }
}

/// One participant in the transport: a backend worker, its address, and the
/// continuation communicator that dispatches its completions.
///
/// `index` is `0` for the shared worker and `1..` for thread-private workers
/// created after it (§4.1); `shared` distinguishes the two since a
/// thread-private worker with index 0 would otherwise be ambiguous with the
/// shared worker on a single-worker run.
pub struct Worker {
    index: usize,
    shared: bool,
    rank: usize,
    size: usize,
    uuid: Uuid,
    handle: WorkerHandle,
    address: Address,
    backend: Arc<dyn Backend>,
    db: Arc<dyn AddressDb>,
    endpoints: Mutex<HashMap<usize, Endpoint>>,
    continuation: ContinuationCommunicator,
    access: Mutex<()>,
}

impl Worker {
    /// Creates a worker bound to `backend`, publishing its address in `db`
    /// under `uuid`. `mode` is the thread-mode requested from the backend;
    /// the context has already validated what the backend actually granted.
    pub fn create(
        index: usize,
        shared: bool,
        rank: usize,
        size: usize,
        uuid: Uuid,
        mode: ThreadMode,
        backend: Arc<dyn Backend>,
        db: Arc<dyn AddressDb>,
    ) -> Result<Self> {
        let (handle, address_bytes) = backend.worker_create(mode)?;
        let address = Address::from_bytes(address_bytes);
        db.insert(EndpointInfo::new(rank, uuid, address.clone()));
        let continuation = ContinuationCommunicator::new();
        debug!(
            setup = ?WorkerSetup { shared, index, rank },
            "worker created",
        );
        Ok(Worker {
            index,
            shared,
            rank,
            size,
            uuid,
            handle,
            address,
            backend,
            db,
            endpoints: Mutex::new(HashMap::new()),
            continuation,
            access: Mutex::new(()),
        })
    }

    /// This worker's slot index.
    pub fn index(&self) -> usize {
        self.index
    }

    /// True if this is the context's shared worker.
    pub fn is_shared(&self) -> bool {
        self.shared
    }

    /// The owning process's rank.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Total number of ranks in the run.
    pub fn size(&self) -> usize {
        self.size
    }

    /// This worker's identity.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// This worker's published address.
    pub fn address(&self) -> &Address {
        &self.address
    }

    pub(crate) fn backend_handle(&self) -> WorkerHandle {
        self.handle
    }

    pub(crate) fn continuation(&self) -> &ContinuationCommunicator {
        &self.continuation
    }

    pub(crate) fn backend(&self) -> Arc<dyn Backend> {
        self.backend.clone()
    }

    /// Acquires this worker's access lock (§4.3): a no-op guard for a
    /// thread-private worker (nothing else can ever contend for it), or the
    /// real `access` mutex, blocking until acquired, for the shared worker.
    /// Every `ContinuationCommunicator` call and every `_ts`-suffixed
    /// `Communicator` method routes through this so the no-op-vs-real-lock
    /// distinction only has to be made once, here.
    pub fn lock(&self) -> LockGuard<'_> {
        if self.shared {
            LockGuard::Shared(self.access.lock())
        } else {
            LockGuard::Private
        }
    }

    /// Non-blocking `lock`: for a shared worker, returns `None` if another
    /// thread currently holds it; for a private worker, always succeeds.
    pub fn try_lock(&self) -> Option<LockGuard<'_>> {
        if self.shared {
            self.access.try_lock().map(LockGuard::Shared)
        } else {
            Some(LockGuard::Private)
        }
    }

    /// Connects this worker to `rank`'s shared worker, caching the result so
    /// later calls for the same rank are free. Requires a prior
    /// `AddressDb::synchronize` on the context for `rank`'s address to be
    /// visible.
    pub fn connect(&self, rank: usize) -> Result<Endpoint> {
        let mut cache = self.endpoints.lock();
        if let Some(ep) = cache.get(&rank) {
            return Ok(*ep);
        }
        let info = self
            .db
            .find_rank(rank)
            .ok_or_else(|| TransportError::PeerUnknown(format!("rank {rank}")))?;
        let handle = self.backend.endpoint_connect(self.handle, info.address.as_bytes())?;
        let endpoint = Endpoint { rank, handle };
        cache.insert(rank, endpoint);
        trace!(
            event = ?StateEvent { worker_index: self.index, remote: Some(rank), start: true },
            "endpoint connected",
        );
        Ok(endpoint)
    }

    /// Connects this worker to a specific worker identified by `uuid`,
    /// bypassing the rank-level cache (used to reach a peer's thread-private
    /// worker rather than its shared one).
    pub fn connect_uuid(&self, uuid: Uuid) -> Result<Endpoint> {
        let info = self
            .db
            .find(uuid)
            .ok_or_else(|| TransportError::PeerUnknown(format!("uuid {:x}", uuid.as_raw())))?;
        let handle = self.backend.endpoint_connect(self.handle, info.address.as_bytes())?;
        Ok(Endpoint { rank: info.rank, handle })
    }

    /// Connects directly from an `EndpointInfo` the caller already has in
    /// hand, without consulting the address database at all. Used against a
    /// [`crate::addr_db::SimpleDb`], whose remote lookups otherwise always
    /// fail: the caller exchanges `EndpointInfo` out-of-band and connects
    /// with it directly (§4.3).
    pub fn connect_info(&self, info: &EndpointInfo) -> Result<Endpoint> {
        let mut cache = self.endpoints.lock();
        if let Some(ep) = cache.get(&info.rank) {
            return Ok(*ep);
        }
        let handle = self.backend.endpoint_connect(self.handle, info.address.as_bytes())?;
        let endpoint = Endpoint { rank: info.rank, handle };
        cache.insert(info.rank, endpoint);
        Ok(endpoint)
    }

    /// Advances this worker's continuation communicator by one pass,
    /// running any callbacks whose operation has completed since the last call.
    pub fn progress(&self) -> crate::continuation::ProgressReport {
        self.continuation.progress(self)
    }

    /// Closes every cached endpoint and destroys the backend worker.
    /// Called by the owning context as part of its teardown order (§5).
    ///
    /// Drains the continuation communicator's outstanding elements
    /// best-effort first (§9, Open Question 2): its `Drop` impl can only log,
    /// since it holds no backend/worker state of its own to post through
    /// (§4.6) once it's falling out of scope.
    pub fn shutdown(&self) {
        let abandoned = self.continuation.drain_best_effort(self);
        if abandoned > 0 {
            debug!(abandoned, "worker shutting down with outstanding continuation elements");
        }
        let mut cache = self.endpoints.lock();
        for (_, endpoint) in cache.drain() {
            self.backend.endpoint_close(endpoint.handle);
        }
        self.db.erase(self.uuid);
        self.backend.worker_destroy(self.handle);
        debug!(
            event = ?StateEvent { worker_index: self.index, remote: None, start: false },
            "worker shut down",
        );
    }
}
