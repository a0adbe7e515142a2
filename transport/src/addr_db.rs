//! Address databases (C2): how a rank's worker addresses reach its peers.
//!
//! Grounded on the type-erased `endpoint_db_t` used throughout the source
//! this crate is modeled on (`context.hpp`'s `make_communicator` takes one by
//! value and never names a concrete type), and on the simple-DB reference
//! implementation (`endpoint_db_mpi_simple.hpp`), which does no real
//! collective communication and exists purely so single-process or
//! test-only builds don't need a real out-of-band channel.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::address::EndpointInfo;
use crate::error::{Result, TransportError};
use crate::uuid::Uuid;

/// The contract a Context needs from its address database (§4.2).
///
/// Implementors own however they actually move addresses between ranks
/// (MPI allgather, a shared filesystem path, a coordination service, …); the
/// core only needs `insert`/`find`/`synchronize`.
pub trait AddressDb: Send + Sync {
    /// Publishes `entry` under its own uuid, making it visible to later
    /// `find` calls on this rank (and, after the next `synchronize`, on
    /// every other rank).
    fn insert(&self, entry: EndpointInfo);

    /// Looks up a previously published entry by uuid. `None` means either
    /// the owner hasn't published it yet or a `synchronize` hasn't happened
    /// since it did.
    fn find(&self, uuid: Uuid) -> Option<EndpointInfo>;

    /// Looks up the entry a rank published for its *shared* worker, if any
    /// — the common case of "connect to rank N" rather than "connect to
    /// this specific uuid".
    fn find_rank(&self, rank: usize) -> Option<EndpointInfo>;

    /// Removes a previously inserted entry; called when the owning worker
    /// is destroyed so a later `synchronize` doesn't republish a stale
    /// address (§5, Worker teardown).
    fn erase(&self, uuid: Uuid);

    /// Marks `uuid` as the shared-worker address for `rank`, so later
    /// `find_rank(rank)` calls can resolve it. Implementations that have no
    /// concept of a distinguished shared worker can leave this a no-op.
    fn mark_shared(&self, _rank: usize, _uuid: Uuid) {}

    /// Exchanges every entry inserted since the last call with every other
    /// participant, blocking until all have arrived. A collective
    /// operation: every rank in the run must call it the same number of
    /// times.
    fn synchronize(&self) -> Result<()>;

    /// The number of participating ranks.
    fn size(&self) -> usize;

    /// This process's rank.
    fn rank(&self) -> usize;

    /// An upper bound on the number of entries this database will ever hold,
    /// used by a backend to pre-size its own endpoint hash-tables. Defaults
    /// to `size()`; a database that expects several workers per rank should
    /// override it with a tighter estimate.
    fn est_size(&self) -> usize {
        self.size()
    }
}

/// An `AddressDb` over an already-collected, in-memory snapshot.
///
/// Used by the loopback backend and by single-process tests: since every
/// worker in the run lives in the same address space, `synchronize` is a
/// no-op and every rank's entries are visible to every other rank the moment
/// they're inserted. Mirrors the semantics of `endpoint_db_mpi_simple.hpp`.
pub struct SimpleDb {
    rank: usize,
    size: usize,
    by_uuid: RwLock<HashMap<Uuid, EndpointInfo>>,
    by_rank_shared: RwLock<HashMap<usize, Uuid>>,
}

impl SimpleDb {
    /// Creates a database for a `size`-rank run, identifying this process as `rank`.
    pub fn new(rank: usize, size: usize) -> Self {
        SimpleDb {
            rank,
            size,
            by_uuid: RwLock::new(HashMap::new()),
            by_rank_shared: RwLock::new(HashMap::new()),
        }
    }
}

impl AddressDb for SimpleDb {
    fn insert(&self, entry: EndpointInfo) {
        self.by_uuid.write().insert(entry.uuid, entry);
    }

    fn find(&self, uuid: Uuid) -> Option<EndpointInfo> {
        self.by_uuid.read().get(&uuid).cloned()
    }

    fn find_rank(&self, rank: usize) -> Option<EndpointInfo> {
        let uuid = *self.by_rank_shared.read().get(&rank)?;
        self.find(uuid)
    }

    fn erase(&self, uuid: Uuid) {
        self.by_uuid.write().remove(&uuid);
        self.by_rank_shared.write().retain(|_, v| *v != uuid);
    }

    fn mark_shared(&self, rank: usize, uuid: Uuid) {
        self.by_rank_shared.write().insert(rank, uuid);
    }

    fn synchronize(&self) -> Result<()> {
        // Every insert is already visible process-wide; there is nothing to
        // exchange out-of-band.
        Ok(())
    }

    fn size(&self) -> usize {
        self.size
    }

    fn rank(&self) -> usize {
        self.rank
    }
}

/// An `AddressDb` that collects entries across threads of one process and
/// merges them with peers reachable only through a real collective channel.
///
/// Used for the multi-process Configuration (§6.2): within a process, inserts
/// are visible immediately like [`SimpleDb`]; `synchronize` additionally
/// drains a pending buffer through `exchange` to reach the other processes.
pub struct CollectiveDb<F> {
    inner: SimpleDb,
    pending: RwLock<Vec<EndpointInfo>>,
    exchange: F,
}

impl<F> CollectiveDb<F>
where
    F: Fn(Vec<EndpointInfo>) -> Result<Vec<EndpointInfo>> + Send + Sync,
{
    /// Creates a database whose `synchronize` calls `exchange` with every
    /// entry inserted (on this process) since the previous call, and expects
    /// back the union of every participant's newly inserted entries.
    pub fn new(rank: usize, size: usize, exchange: F) -> Self {
        CollectiveDb { inner: SimpleDb::new(rank, size), pending: RwLock::new(Vec::new()), exchange }
    }
}

impl<F> AddressDb for CollectiveDb<F>
where
    F: Fn(Vec<EndpointInfo>) -> Result<Vec<EndpointInfo>> + Send + Sync,
{
    fn insert(&self, entry: EndpointInfo) {
        self.pending.write().push(entry.clone());
        self.inner.insert(entry);
    }

    fn find(&self, uuid: Uuid) -> Option<EndpointInfo> {
        self.inner.find(uuid)
    }

    fn find_rank(&self, rank: usize) -> Option<EndpointInfo> {
        self.inner.find_rank(rank)
    }

    fn erase(&self, uuid: Uuid) {
        self.inner.erase(uuid);
    }

    fn synchronize(&self) -> Result<()> {
        let outgoing = std::mem::take(&mut *self.pending.write());
        let incoming = (self.exchange)(outgoing)
            .map_err(|e| TransportError::Usage(format!("address exchange failed: {e}")))?;
        for entry in incoming {
            self.inner.insert(entry);
        }
        Ok(())
    }

    fn size(&self) -> usize {
        self.inner.size()
    }

    fn rank(&self) -> usize {
        self.inner.rank()
    }
}
