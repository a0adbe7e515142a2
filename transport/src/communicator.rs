//! The communicator (C5): the value type application code actually calls
//! `send`/`recv` on.
//!
//! A `Communicator` is a thin, cheaply-cloned handle around up to two
//! [`Worker`]s (§3's send_worker/recv_worker split, §4.4): `worker` posts
//! sends, `recv_worker` posts receives. The common case — one worker per
//! rank — collapses them onto the same `Arc`; [`Self::with_recv_worker`]
//! keeps them distinct when the caller created a separate thread-private
//! send worker and shared recv worker. Each `send`/`recv`'s `Future`
//! remembers both, so `wait()` can opportunistically progress the
//! complementary worker (§4.5).
//!
//! Two flavors of `send` are exposed, mirroring the plain/`_ts` split common
//! in MPI-style APIs the source this is modeled on draws from: the plain
//! form assumes the caller already has exclusive access to the worker (the
//! common case — one thread per worker); `send_ts` takes the worker's own
//! lock first, so it's safe to call from a thread that shares the worker
//! with others — primarily so a continuation callback running on a progress
//! thread can itself submit a send (§4.4). `recv` has no such split: every
//! receive always locks its recv worker (§4.4), since an unlocked variant
//! would be unsound to call from more than one thread and nothing in this
//! crate can promise a receiver ever has that exclusivity the way a private
//! send worker does.

use std::sync::Arc;

use crate::backend::Backend;
use crate::continuation::{MultiSendPayload, ProgressReport};
use crate::error::Result;
use crate::future::Future as TransportFuture;
use crate::message::{AnyMessage, OwnedBuffer, RefMessage};
use crate::tag;
use crate::worker::{Endpoint, Worker};

/// A handle through which application code submits sends and receives.
#[derive(Clone)]
pub struct Communicator {
    worker: Arc<Worker>,
    recv_worker: Arc<Worker>,
}

impl Communicator {
    /// Wraps `worker` for use as a communicator whose sends and receives
    /// both post through the same worker (the common single-worker-per-rank
    /// case).
    pub fn new(worker: Arc<Worker>) -> Self {
        Communicator { recv_worker: worker.clone(), worker }
    }

    /// Builds a communicator whose sends and receives post through distinct
    /// local workers (§3's uncollapsed three-worker model): `worker` issues
    /// sends, `recv_worker` posts receives and is the "other" worker a
    /// send's `Future` opportunistically progresses (and vice versa).
    pub fn with_recv_worker(worker: Arc<Worker>, recv_worker: Arc<Worker>) -> Self {
        Communicator { worker, recv_worker }
    }

    /// This process's rank.
    pub fn rank(&self) -> usize {
        self.worker.rank()
    }

    /// Total ranks in the run.
    pub fn size(&self) -> usize {
        self.worker.size()
    }

    /// Connects to `rank`'s shared worker, caching the endpoint.
    pub fn connect(&self, rank: usize) -> Result<Endpoint> {
        self.worker.connect(rank)
    }

    /// The other local worker relative to `from`, or `None` if they collapse
    /// onto the same one (§4.5's "other worker" relationship).
    fn other_of(&self, from: &Arc<Worker>) -> Option<Arc<Worker>> {
        if Arc::ptr_eq(from, &self.worker) {
            (!Arc::ptr_eq(&self.worker, &self.recv_worker)).then(|| self.recv_worker.clone())
        } else {
            (!Arc::ptr_eq(&self.worker, &self.recv_worker)).then(|| self.worker.clone())
        }
    }

    /// Sends `message` to `dst` under `tag`, returning a [`Future`] that
    /// resolves to `message` itself once the backend reports completion —
    /// the buffer is kept alive by the `Future` for as long as the backend
    /// might still be reading from it, and handed back so the caller can
    /// reuse its allocation for the next send.
    ///
    /// Assumes the calling thread already has exclusive use of this
    /// communicator's worker; call [`Self::send_ts`] instead from a thread
    /// that shares the worker with others.
    pub fn send(
        &self,
        message: OwnedBuffer<u8>,
        dst: usize,
        tag: u32,
    ) -> Result<TransportFuture<OwnedBuffer<u8>>> {
        let endpoint = self.worker.connect(dst)?;
        self.send_on(endpoint, message, tag)
    }

    /// Thread-safe `send`: takes the worker's access lock for the duration
    /// of the submission.
    pub fn send_ts(
        &self,
        message: OwnedBuffer<u8>,
        dst: usize,
        tag: u32,
    ) -> Result<TransportFuture<OwnedBuffer<u8>>> {
        let _guard = self.worker.lock();
        self.send(message, dst, tag)
    }

    fn send_on(
        &self,
        endpoint: Endpoint,
        message: OwnedBuffer<u8>,
        tag: u32,
    ) -> Result<TransportFuture<OwnedBuffer<u8>>> {
        let wire_tag = tag::encode(tag, self.worker.rank());
        let backend: Arc<dyn Backend> = self.worker.backend();
        let request = backend.tag_send_nb(endpoint.handle(), message.as_slice(), wire_tag)?;
        let other = self.other_of(&self.worker);
        Ok(match request {
            None => TransportFuture::ready(message, self.worker.clone(), other),
            Some(req) => TransportFuture::pending(req, self.worker.clone(), other, message),
        })
    }

    /// Posts a receive matching `tag` from `src` (or
    /// [`crate::tag::ANY_SOURCE`]), returning a [`Future`] that resolves to
    /// the filled buffer. Always posts under the recv worker's lock (§4.4) —
    /// a no-op when that worker is thread-private, a real lock when it's
    /// shared.
    pub fn recv(
        &self,
        mut buffer: OwnedBuffer<u8>,
        src: usize,
        tag: u32,
    ) -> Result<TransportFuture<OwnedBuffer<u8>>> {
        let _guard = self.recv_worker.lock();
        let wire_tag = tag::encode(tag, src);
        let mask = tag::mask_for(src);
        let backend: Arc<dyn Backend> = self.recv_worker.backend();
        let request = backend.tag_recv_nb(
            self.recv_worker.backend_handle(),
            buffer.as_mut_slice(),
            wire_tag,
            mask,
        )?;
        let other = self.other_of(&self.recv_worker);
        Ok(match request {
            None => TransportFuture::ready(buffer, self.recv_worker.clone(), other),
            Some(req) => TransportFuture::pending(req, self.recv_worker.clone(), other, buffer),
        })
    }

    /// Sends `message` to `dst` under `tag`, invoking `callback` on
    /// completion rather than returning a `Future` (§4.6).
    pub fn send_cb(
        &self,
        message: OwnedBuffer<u8>,
        dst: usize,
        tag: u32,
        callback: impl FnOnce(u32, usize, AnyMessage) + Send + 'static,
    ) -> Result<()> {
        let endpoint = self.worker.connect(dst)?;
        self.worker.continuation().send(&self.worker, endpoint.handle(), message.into(), dst, tag, callback)
    }

    /// Sends a borrowed buffer under `tag`, invoking `callback` with an
    /// [`AnyMessage::Ref`] on completion (§4.6's lvalue submission path).
    ///
    /// # Safety
    /// The caller must guarantee the data behind `message` stays valid and
    /// unmutated until `callback` has run — the continuation dispatcher has
    /// no way to enforce this once the borrow checker's view of this call
    /// ends.
    pub unsafe fn send_ref_cb<'a>(
        &self,
        message: RefMessage<'a, u8>,
        dst: usize,
        tag: u32,
        callback: impl FnOnce(u32, usize, AnyMessage) + Send + 'static,
    ) -> Result<()> {
        let endpoint = self.worker.connect(dst)?;
        self.worker.continuation().send_ref(&self.worker, endpoint.handle(), message, dst, tag, callback)
    }

    /// Posts a callback-driven receive (§4.6).
    pub fn recv_cb(
        &self,
        buffer: OwnedBuffer<u8>,
        src: usize,
        tag: u32,
        callback: impl FnOnce(u32, usize, AnyMessage) + Send + 'static,
    ) -> Result<()> {
        self.recv_worker.continuation().recv(&self.recv_worker, buffer, src, tag, callback)
    }

    /// Posts a callback-driven receive into a borrowed buffer (§4.6's lvalue
    /// submission path), avoiding the allocation an [`OwnedBuffer`] would
    /// need.
    ///
    /// # Safety
    /// `buffer` must stay valid and exclusively borrowed until `callback` has
    /// run.
    pub unsafe fn recv_ref_cb(
        &self,
        buffer: &mut [u8],
        src: usize,
        tag: u32,
        callback: impl FnOnce(u32, usize, AnyMessage) + Send + 'static,
    ) -> Result<()> {
        self.recv_worker.continuation().recv_ref(&self.recv_worker, buffer, src, tag, callback)
    }

    /// Fans `message` out to every rank in `dsts` under `tag` (§4.6).
    pub fn send_multi(
        &self,
        dsts: &[usize],
        message: impl MultiSendPayload,
        tag: u32,
        callback: impl Fn(u32, usize) + Send + Sync + 'static,
    ) -> Result<()> {
        let mut endpoints = Vec::with_capacity(dsts.len());
        for &dst in dsts {
            endpoints.push((dst, self.worker.connect(dst)?.handle()));
        }
        self.worker.continuation().send_multi(&self.worker, &endpoints, message, tag, callback)
    }

    /// Advances this communicator's worker(s) by one progress pass each
    /// (§4.4). When sends and receives share one worker, that worker is
    /// progressed once; when they're distinct, both are.
    pub fn progress(&self) -> ProgressReport {
        let mut report = self.worker.progress();
        if !Arc::ptr_eq(&self.worker, &self.recv_worker) {
            let recv_report = self.recv_worker.progress();
            report.completed += recv_report.completed;
            report.early += recv_report.early;
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr_db::{AddressDb, SimpleDb};
    use crate::backend::loopback::LoopbackFabric;
    use crate::backend::ThreadMode;
    use crate::uuid::UuidSource;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn two_ranks() -> (Communicator, Communicator) {
        let fabric = LoopbackFabric::new(2);
        let db: Arc<dyn AddressDb> = Arc::new(SimpleDb::new(0, 2));
        let uuids = UuidSource::new(0);

        let backend0: Arc<dyn Backend> = Arc::new(fabric.backend());
        let backend1: Arc<dyn Backend> = Arc::new(fabric.backend());

        let uuid0 = uuids.next();
        let uuid1 = uuids.next();
        let worker0 =
            Worker::create(0, true, 0, 2, uuid0, ThreadMode::Single, backend0, db.clone()).unwrap();
        let worker1 =
            Worker::create(0, true, 1, 2, uuid1, ThreadMode::Single, backend1, db.clone()).unwrap();
        db.mark_shared(0, uuid0);
        db.mark_shared(1, uuid1);

        (Communicator::new(Arc::new(worker0)), Communicator::new(Arc::new(worker1)))
    }

    #[test]
    fn future_based_send_recv_round_trips() {
        let (comm0, comm1) = two_ranks();
        let send_future = comm0.send(OwnedBuffer::new(vec![1, 2, 3, 4]), 1, 11).unwrap();
        let recv_future = comm1.recv(OwnedBuffer::new(vec![0u8; 4]), 0, 11).unwrap();

        let sent_back = send_future.wait();
        assert_eq!(sent_back.as_slice(), &[1, 2, 3, 4]);
        let received = recv_future.wait();
        assert_eq!(received.as_slice(), &[1, 2, 3, 4]);
    }

    #[test]
    fn callback_based_send_recv_round_trips() {
        let (comm0, comm1) = two_ranks();
        let got = Arc::new(AtomicUsize::new(0));
        let got_clone = got.clone();
        comm1
            .recv_cb(OwnedBuffer::new(vec![0u8; 2]), 0, 22, move |_t, _d, msg| {
                assert_eq!(msg.as_bytes(), &[7, 8]);
                got_clone.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        comm0.send_cb(OwnedBuffer::new(vec![7, 8]), 1, 22, |_, _, _| {}).unwrap();
        comm1.progress();
        assert_eq!(got.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn any_source_recv_matches_regardless_of_sender_rank() {
        let (comm0, comm1) = two_ranks();
        let recv_future = comm1.recv(OwnedBuffer::new(vec![0u8; 1]), crate::tag::ANY_SOURCE, 5).unwrap();
        comm0.send(OwnedBuffer::new(vec![42]), 1, 5).unwrap();
        assert_eq!(recv_future.wait().as_slice(), &[42]);
    }

    #[test]
    fn ref_based_send_recv_round_trips() {
        let (comm0, comm1) = two_ranks();
        let mut recv_buf = [0u8; 3];
        let got = Arc::new(AtomicUsize::new(0));
        let got_clone = got.clone();
        // SAFETY: `recv_buf` outlives the call (loopback completes inline).
        unsafe {
            comm1
                .recv_ref_cb(&mut recv_buf, 0, 9, move |_t, _d, msg| {
                    assert_eq!(msg.as_bytes(), &[4, 5, 6]);
                    got_clone.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        let data = vec![4u8, 5, 6];
        // SAFETY: `data` outlives the call (loopback completes inline).
        unsafe {
            comm0.send_ref_cb(RefMessage::new(&data), 1, 9, |_, _, _| {}).unwrap();
        }
        assert_eq!(got.load(Ordering::SeqCst), 1);
        assert_eq!(recv_buf, [4, 5, 6]);
    }

    #[test]
    fn distinct_send_and_recv_workers_both_progress() {
        let fabric = LoopbackFabric::new(2);
        let db: Arc<dyn AddressDb> = Arc::new(SimpleDb::new(0, 2));
        let uuids = UuidSource::new(0);
        let send_backend: Arc<dyn Backend> = Arc::new(fabric.backend());
        let recv_backend: Arc<dyn Backend> = Arc::new(fabric.backend());
        let peer_backend: Arc<dyn Backend> = Arc::new(fabric.backend());

        let send_worker =
            Arc::new(Worker::create(1, false, 0, 2, uuids.next(), ThreadMode::Single, send_backend, db.clone()).unwrap());
        let recv_worker =
            Arc::new(Worker::create(0, true, 0, 2, uuids.next(), ThreadMode::Single, recv_backend, db.clone()).unwrap());
        let peer = Worker::create(0, true, 1, 2, uuids.next(), ThreadMode::Single, peer_backend, db.clone()).unwrap();
        db.mark_shared(0, recv_worker.uuid());
        db.mark_shared(1, peer.uuid());

        let comm = Communicator::with_recv_worker(send_worker, recv_worker);
        let peer_comm = Communicator::new(Arc::new(peer));

        let recv_future = comm.recv(OwnedBuffer::new(vec![0u8; 2]), 1, 1).unwrap();
        peer_comm.send(OwnedBuffer::new(vec![1, 2]), 0, 1).unwrap();
        assert_eq!(recv_future.wait().as_slice(), &[1, 2]);

        let report = comm.progress();
        assert_eq!(report.completed, 0, "loopback completes inline; nothing left for progress to drain");
    }
}
