//! Message ownership (C7): the payload variants a send or receive can move.
//!
//! The source this crate is modeled on used a reference-counted byte buffer
//! (`Rc`-based, single-threaded) so a send could hand out a buffer without
//! copying it. Because continuations here run on whatever thread calls
//! `progress()` (§4.3), that ownership has to be `Send + Sync`-safe, so
//! `SharedBuffer` is `Arc`-based rather than `Rc`-based. `RefMessage`
//! corresponds to the original's `ref_message<T>`: a borrow the caller
//! promises outlives the operation, usable only for the blocking/`Future`
//! paths that can't outlive their own stack frame (§9, Open Question 3).

use std::sync::Arc;

/// A message this crate owns outright; dropped when the operation (and any
/// copies the backend made of it) are done with it.
#[derive(Debug, Clone)]
pub struct OwnedBuffer<T> {
    data: Vec<T>,
}

impl<T> OwnedBuffer<T> {
    /// Takes ownership of `data`.
    pub fn new(data: Vec<T>) -> Self {
        OwnedBuffer { data }
    }

    /// The number of elements.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True if there are no elements.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Borrows the underlying elements.
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    /// Borrows the underlying elements mutably, for a receive to fill in.
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Unwraps back to a plain `Vec`.
    pub fn into_vec(self) -> Vec<T> {
        self.data
    }
}

/// A message shared by reference count, so the same payload can be handed
/// to `send_multi` (§4.6) without cloning it once per destination.
///
/// Grounded on `shared_message<Message>` in the source this is modeled on,
/// generalized from a single wrapped `Message` type to any `T`, and `Arc`-
/// rather than `Rc`-backed since completions may run on any thread.
#[derive(Debug, Clone)]
pub struct SharedBuffer<T> {
    data: Arc<Vec<T>>,
}

impl<T> SharedBuffer<T> {
    /// Wraps `data` for fan-out sends.
    pub fn new(data: Vec<T>) -> Self {
        SharedBuffer { data: Arc::new(data) }
    }

    /// Wraps an already-shared payload, e.g. one just handed back by another `SharedBuffer`.
    pub fn from_arc(data: Arc<Vec<T>>) -> Self {
        SharedBuffer { data }
    }

    /// The number of elements.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True if there are no elements.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Borrows the underlying elements.
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    /// The number of outstanding clones of this buffer, including this one.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.data)
    }
}

/// A message borrowed for the duration of a single operation.
///
/// Corresponds to the original's `ref_message<T>`. Usable anywhere the core
/// accepts an lvalue submission (§4.4's lvalue/rvalue convention, §4.6's
/// submission table): a plain `send`/`recv` keeps the borrow alive for the
/// `Future`'s own lifetime, so the type system enforces the promise; the
/// callback-driven `send_ref_cb`/`recv_ref_cb` erase the lifetime to cross
/// into the continuation queue and so must re-assert the promise with
/// `unsafe` (`send_multi` still refuses it outright, §9 Open Question 3,
/// since one borrow can't soundly back an unbounded fan-out).
#[derive(Debug)]
pub struct RefMessage<'a, T> {
    data: &'a [T],
}

impl<'a, T> RefMessage<'a, T> {
    /// Borrows `data` for the lifetime of the operation it's passed to.
    pub fn new(data: &'a [T]) -> Self {
        RefMessage { data }
    }

    /// The number of elements.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True if there are no elements.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The borrowed slice.
    pub fn as_slice(&self) -> &'a [T] {
        self.data
    }
}

impl<'a> RefMessage<'a, u8> {
    /// Erases this borrow's lifetime so it can be carried through the
    /// continuation queue as an [`AnyMessage::Ref`] (§4.6's lvalue submission
    /// row: "a RefMessage recording pointer + length").
    ///
    /// # Safety
    /// The caller must guarantee the borrowed data stays valid and is not
    /// mutated until the posted callback has run. The continuation
    /// dispatcher cannot enforce this itself once the lifetime is gone — an
    /// element may sit in the queue for an arbitrary number of `progress()`
    /// calls before its callback fires.
    pub unsafe fn into_any_unchecked(self) -> AnyMessage {
        AnyMessage::Ref(RefSlice { ptr: self.data.as_ptr() as *mut u8, len: self.data.len() })
    }
}

/// A type-erased, raw-pointer view into a borrow whose lifetime has already
/// been asserted away by whoever constructed it.
///
/// Mirrors `backend::loopback::RawBuf`'s contract: valid only because the
/// caller of `send_ref_cb`/`recv_ref_cb` promised to keep the backing memory
/// alive (and, for a receive, exclusively borrowed) until the callback runs.
struct RefSlice {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: dereferenced only while the caller-supplied promise documented on
// `RefSlice` still holds; the pointer itself carries no thread affinity.
unsafe impl Send for RefSlice {}

impl std::fmt::Debug for RefSlice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefSlice").field("len", &self.len).finish()
    }
}

/// A type-erased byte payload, used internally once a message has been
/// handed to the backend and its original element type no longer matters.
///
/// Corresponds to the original's `any_message` (an interface/holder pair
/// doing virtual dispatch over the wrapped type); a Rust enum over the
/// ownership variants is sufficient since there are exactly three (owned,
/// shared, borrowed).
#[derive(Debug)]
pub enum AnyMessage {
    /// An owned byte buffer.
    Owned(Vec<u8>),
    /// A reference-counted byte buffer.
    Shared(Arc<Vec<u8>>),
    /// A borrowed buffer, lifetime already asserted away by whoever built it
    /// (see [`RefMessage::into_any_unchecked`]).
    Ref(RefSlice),
}

impl AnyMessage {
    /// Borrows the bytes regardless of which variant this is.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            AnyMessage::Owned(v) => v.as_slice(),
            AnyMessage::Shared(v) => v.as_slice(),
            // SAFETY: the promise backing this pointer was established when
            // the `RefSlice` was built; see `RefMessage::into_any_unchecked`.
            AnyMessage::Ref(r) => unsafe { std::slice::from_raw_parts(r.ptr, r.len) },
        }
    }

    /// The number of bytes.
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    /// True if there are no bytes.
    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

/// Anything [`crate::continuation::ContinuationCommunicator::recv`] can post
/// a receive into: an owned buffer (allocates) or a borrowed slice whose
/// lifetime the caller already promised to uphold (§4.6's lvalue/rvalue
/// split for receives).
pub trait RecvTarget: Send + 'static {
    /// Mutable access to the bytes the backend should fill.
    fn as_mut_bytes(&mut self) -> &mut [u8];
    /// Converts into the type-erased form handed to the callback.
    fn into_any(self) -> AnyMessage;
}

impl RecvTarget for OwnedBuffer<u8> {
    fn as_mut_bytes(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }

    fn into_any(self) -> AnyMessage {
        self.into()
    }
}

/// A borrowed receive target built from a `&mut [u8]` by
/// `Communicator::recv_ref_cb`.
///
/// # Safety
/// Constructing one asserts the referenced memory stays valid and
/// exclusively borrowed until the posted callback has run.
pub(crate) struct BorrowedRecv {
    pub(crate) ptr: *mut u8,
    pub(crate) len: usize,
}

// SAFETY: see `BorrowedRecv`'s safety contract, established by its caller.
unsafe impl Send for BorrowedRecv {}

impl RecvTarget for BorrowedRecv {
    fn as_mut_bytes(&mut self) -> &mut [u8] {
        // SAFETY: see `BorrowedRecv`'s safety contract.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    fn into_any(self) -> AnyMessage {
        AnyMessage::Ref(RefSlice { ptr: self.ptr, len: self.len })
    }
}

impl From<OwnedBuffer<u8>> for AnyMessage {
    fn from(buf: OwnedBuffer<u8>) -> Self {
        AnyMessage::Owned(buf.into_vec())
    }
}

impl From<SharedBuffer<u8>> for AnyMessage {
    fn from(buf: SharedBuffer<u8>) -> Self {
        AnyMessage::Shared(buf.data)
    }
}
