//! End-to-end scenarios over the loopback backend (§8).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tagged_transport::addr_db::{AddressDb, SimpleDb};
use tagged_transport::backend::loopback::LoopbackFabric;
use tagged_transport::backend::{Backend, ThreadMode};
use tagged_transport::communicator::Communicator;
use tagged_transport::message::{OwnedBuffer, SharedBuffer};
use tagged_transport::tag::ANY_SOURCE;
use tagged_transport::uuid::UuidSource;
use tagged_transport::worker::Worker;

/// Builds `size` communicators sharing one loopback fabric and one address
/// database, with every rank's shared-worker address already published.
fn ring(size: usize) -> Vec<Communicator> {
    let fabric = LoopbackFabric::new(size);
    let db: Arc<dyn AddressDb> = Arc::new(SimpleDb::new(0, size));
    let uuids = UuidSource::new(0);

    let mut comms = Vec::with_capacity(size);
    for rank in 0..size {
        let backend: Arc<dyn Backend> = Arc::new(fabric.backend());
        let uuid = uuids.next();
        let worker =
            Worker::create(0, true, rank, size, uuid, ThreadMode::Serialized, backend, db.clone())
                .unwrap();
        db.mark_shared(rank, uuid);
        comms.push(Communicator::new(Arc::new(worker)));
    }
    comms
}

/// Scenario 1: bi-directional ring, one thread.
#[test]
fn bidirectional_ring_delivers_peer_and_tag() {
    let comms = ring(2);
    let payload = |peer: u32| {
        let mut buf = vec![0u8; 8];
        buf[0..4].copy_from_slice(&peer.to_le_bytes());
        buf[4..8].copy_from_slice(&0u32.to_le_bytes());
        buf
    };

    let send0 = comms[0].send(OwnedBuffer::new(payload(1)), 1, 0).unwrap();
    let send1 = comms[1].send(OwnedBuffer::new(payload(0)), 0, 0).unwrap();
    let recv0 = comms[0].recv(OwnedBuffer::new(vec![0u8; 8]), 1, 0).unwrap();
    let recv1 = comms[1].recv(OwnedBuffer::new(vec![0u8; 8]), 0, 0).unwrap();

    send0.wait();
    send1.wait();
    let buf0 = recv0.wait();
    let buf1 = recv1.wait();

    assert_eq!(&buf0.as_slice()[0..4], &1u32.to_le_bytes());
    assert_eq!(&buf0.as_slice()[4..8], &0u32.to_le_bytes());
    assert_eq!(&buf1.as_slice()[0..4], &0u32.to_le_bytes());
    assert_eq!(&buf1.as_slice()[4..8], &0u32.to_le_bytes());
}

/// Scenario 2: multi-threaded ring. Each of N threads posts a receive from
/// its left neighbor and a send to its right neighbor, tagged with its own
/// thread id; each receive buffer should contain (left_rank, thread_id).
#[test]
fn multi_threaded_ring_tags_isolate_each_thread() {
    const N: usize = 3;
    let comms = ring(N);

    let handles: Vec<_> = (0..N)
        .map(|rank| {
            let comms = comms.clone();
            std::thread::spawn(move || {
                let left = (rank + N - 1) % N;
                let right = (rank + 1) % N;
                let tag = rank as u32;

                let recv = comms[rank]
                    .recv(OwnedBuffer::new(vec![0u8; 8]), left, tag)
                    .unwrap();
                let mut payload = vec![0u8; 8];
                payload[0..4].copy_from_slice(&(rank as u32).to_le_bytes());
                payload[4..8].copy_from_slice(&tag.to_le_bytes());
                comms[right].send_ts(OwnedBuffer::new(payload), right, tag).unwrap();

                let buf = recv.wait();
                assert_eq!(&buf.as_slice()[0..4], &(left as u32).to_le_bytes());
                assert_eq!(&buf.as_slice()[4..8], &tag.to_le_bytes());
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
}

/// Scenario 3 (simplified to one broadcasting thread): `send_multi` fans a
/// shared buffer out to every peer and reposts under a new tag once every
/// destination's callback has fired.
#[test]
fn send_multi_broadcast_with_repost_reaches_every_peer_twice() {
    const PEERS: usize = 3;
    let comms = ring(PEERS + 1);
    let dsts: Vec<usize> = (1..=PEERS).collect();

    let first_tag = 10u32;
    let second_tag = 20u32;

    let mut first_recvs = Vec::new();
    let mut second_recvs = Vec::new();
    for &dst in &dsts {
        first_recvs.push(comms[dst].recv(OwnedBuffer::new(vec![0u8; 4]), 0, first_tag).unwrap());
        second_recvs.push(comms[dst].recv(OwnedBuffer::new(vec![0u8; 4]), 0, second_tag).unwrap());
    }

    let completions = Arc::new(AtomicUsize::new(0));
    let completions_clone = completions.clone();
    comms[0]
        .send_multi(&dsts, SharedBuffer::new(first_tag.to_le_bytes().to_vec()), first_tag, move |_t, _d| {
            completions_clone.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    assert_eq!(completions.load(Ordering::SeqCst), PEERS, "loopback sends always complete inline");

    comms[0]
        .send_multi(&dsts, SharedBuffer::new(second_tag.to_le_bytes().to_vec()), second_tag, |_, _| {})
        .unwrap();

    for recv in first_recvs {
        assert_eq!(recv.wait().as_slice(), &first_tag.to_le_bytes());
    }
    for recv in second_recvs {
        assert_eq!(recv.wait().as_slice(), &second_tag.to_le_bytes());
    }
}

/// Scenario 4: inline completion fast path. A loopback send-then-recv pair
/// (the recv posted after the data already arrived) completes entirely
/// within the submission calls, before any `progress()` call, and
/// `progress()` afterward finds nothing left to report.
#[test]
fn inline_completion_is_ready_without_progress() {
    let comms = ring(1);
    let mut send_future = comms[0].send(OwnedBuffer::new(vec![42]), 0, 2).unwrap();
    assert!(send_future.ready(), "loopback send must be ready before any progress() call");

    let mut recv_future = comms[0].recv(OwnedBuffer::new(vec![0u8; 1]), ANY_SOURCE, 2).unwrap();
    assert!(recv_future.ready(), "the matching data was already buffered when recv was posted");
    assert_eq!(recv_future.wait().as_slice(), &[42]);

    assert_eq!(comms[0].progress().completed, 0, "inline completions are not re-reported by progress()");
}

/// Scenario 5: cancel after submission. A receive with no matching send
/// stays pending, cancels cleanly, and driving `progress()` afterward never
/// resurfaces it (it is gone from the worker's outstanding set).
#[test]
fn cancel_after_submission_is_final() {
    let comms = ring(1);
    let mut recv_future = comms[0].recv(OwnedBuffer::new(vec![0u8; 4]), ANY_SOURCE, 999).unwrap();
    assert!(!recv_future.ready(), "nothing has been sent yet");

    assert!(recv_future.cancel().unwrap());
    // A second cancel on an already-cancelled future is a no-op, not a panic.
    assert!(!recv_future.cancel().unwrap());
    drop(recv_future);

    for _ in 0..10_000 {
        comms[0].progress();
    }
    assert_eq!(comms[0].progress().completed, 0);
}

/// Scenario 6: backpressure under an inflight limit. Only resubmit a shared
/// buffer once every prior clone of it has been dropped by its callback.
#[test]
fn backpressure_bounds_outstanding_shared_buffers() {
    const INFLIGHT: usize = 8;
    const NITER: usize = 64;

    let comms = ring(2);
    let completed = Arc::new(AtomicUsize::new(0));

    let mut submitted = 0usize;
    while submitted < NITER {
        for _ in 0..INFLIGHT.min(NITER - submitted) {
            let buf = SharedBuffer::new(vec![submitted as u8]);
            let completed_clone = completed.clone();
            comms[0]
                .send_multi(&[1], buf, submitted as u32, move |_t, _d| {
                    completed_clone.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            submitted += 1;
        }
        comms[0].progress();
    }

    assert_eq!(submitted, NITER);
    assert_eq!(completed.load(Ordering::SeqCst), NITER, "every send completes inline over loopback");
}
