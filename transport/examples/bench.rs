//! Bandwidth/latency-style benchmark driving the core end to end over the
//! bundled loopback backend (§6.3): `cargo run --example bench -- <iterations>
//! <message_bytes> <inflight_count>`, with `-w/-p/-n/-h/-r` selecting the
//! thread/process layout exactly as `Configuration::from_args` parses them
//! for any other binary built on this crate.
//!
//! There is no real MPI/UCX backend in this crate, so this example always
//! runs over `backend::loopback`; a deployment wiring in a real backend would
//! swap only the `Arc<dyn Backend>` constructed below.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tagged_transport::addr_db::{AddressDb, SimpleDb};
use tagged_transport::backend::loopback::LoopbackFabric;
use tagged_transport::backend::{Backend, ThreadMode};
use tagged_transport::communicator::Communicator;
use tagged_transport::message::OwnedBuffer;
use tagged_transport::worker::Worker;
use tagged_transport::{Configuration, TransportError};

fn main() {
    tracing_subscriber::fmt::init();

    if let Err(e) = run() {
        eprintln!("bench: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), TransportError> {
    let (config, positional) = Configuration::from_args(std::env::args())?;
    if !matches!(config, Configuration::Thread) {
        eprintln!("bench: only -w/-p/-n are parsed for illustration; this example always runs two ranks in-process");
    }

    let iterations: usize = positional
        .first()
        .map(|s| s.parse())
        .transpose()
        .map_err(|_| TransportError::Usage("iterations must be a positive integer".into()))?
        .unwrap_or(1_000);
    let message_bytes: usize = positional
        .get(1)
        .map(|s| s.parse())
        .transpose()
        .map_err(|_| TransportError::Usage("message_bytes must be a positive integer".into()))?
        .unwrap_or(64);
    let inflight_count: usize = positional
        .get(2)
        .map(|s| s.parse())
        .transpose()
        .map_err(|_| TransportError::Usage("inflight_count must be a positive integer".into()))?
        .unwrap_or(8);

    let fabric = LoopbackFabric::new(2);
    let db: Arc<dyn AddressDb> = Arc::new(SimpleDb::new(0, 2));
    let backend0: Arc<dyn Backend> = Arc::new(fabric.backend());
    let backend1: Arc<dyn Backend> = Arc::new(fabric.backend());

    let w0 = Worker::create(0, true, 0, 2, tagged_transport::uuid::UuidSource::new(0).next(), ThreadMode::Single, backend0, db.clone())?;
    let w1 = Worker::create(0, true, 1, 2, tagged_transport::uuid::UuidSource::new(1).next(), ThreadMode::Single, backend1, db.clone())?;
    db.mark_shared(0, w0.uuid());
    db.mark_shared(1, w1.uuid());

    let sender = Communicator::new(Arc::new(w0));
    let receiver = Communicator::new(Arc::new(w1));

    let completed = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    let mut submitted = 0usize;
    while submitted < iterations {
        let batch = inflight_count.min(iterations - submitted);
        for i in 0..batch {
            let tag = (submitted + i) as u32;
            let completed = completed.clone();
            receiver
                .recv_cb(OwnedBuffer::new(vec![0u8; message_bytes]), 0, tag, move |_t, _d, _m| {
                    completed.fetch_add(1, Ordering::SeqCst);
                })
                .map_err(|e| TransportError::Usage(format!("recv_cb failed: {e}")))?;
            sender
                .send_cb(OwnedBuffer::new(vec![0xABu8; message_bytes]), 1, tag, |_, _, _| {})
                .map_err(|e| TransportError::Usage(format!("send_cb failed: {e}")))?;
        }
        receiver.progress();
        submitted += batch;
    }

    let elapsed = start.elapsed();
    let done = completed.load(Ordering::SeqCst);
    println!(
        "bench: {done}/{iterations} messages of {message_bytes} bytes completed in {elapsed:?} (inflight={inflight_count})"
    );
    Ok(())
}
