//! Worker addresses (C1): the opaque byte blob a backend hands out for a
//! worker and that a peer needs to `connect` to it.
//!
//! The core never looks inside an `Address`; it is produced by
//! [`crate::backend::Backend::worker_create`] and consumed by
//! [`crate::backend::Backend::endpoint_connect`]. Everything else —
//! publishing it so other ranks can find it, matching it to a rank or
//! [`crate::uuid::Uuid`] — is the address database's job (§4.2).

use crate::uuid::Uuid;

/// An opaque, backend-serialized worker address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address(Vec<u8>);

impl Address {
    /// Wraps raw bytes produced by a backend.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Address(bytes)
    }

    /// The raw bytes, as handed to `endpoint_connect`.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// An address together with the identity its owner publishes it under.
///
/// This is the unit the address database stores and exchanges during
/// `synchronize` (§4.2): a rank, the [`Uuid`] of the worker that owns the
/// address, and the address itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointInfo {
    /// The rank that owns this address.
    pub rank: usize,
    /// The id of the specific worker the address names.
    pub uuid: Uuid,
    /// The serialized address itself.
    pub address: Address,
}

impl EndpointInfo {
    /// Builds an entry for publishing through an address database.
    pub fn new(rank: usize, uuid: Uuid, address: Address) -> Self {
        EndpointInfo { rank, uuid, address }
    }
}
