//! The context (C3): process-wide setup, configuration parsing, and worker
//! lifecycle (§3, §5, §6.2-§6.3).
//!
//! `Configuration` and `initialize`/`initialize_from` mirror the shape the
//! source this crate is modeled on uses for its own `timely_communication::
//! initialize::Configuration`: a small enum selects thread-only,
//! single-process-multi-thread, or multi-process-cluster operation, parsed
//! either programmatically or from `std::env::args()` through `getopts`.
//! What differs is what gets built underneath it — a [`Context`] wrapping a
//! [`Backend`] and an [`AddressDb`], not a dataflow allocator.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::addr_db::AddressDb;
use crate::backend::{Backend, InitParams, ThreadMode};
use crate::error::{Result, TransportError};
use crate::uuid::UuidSource;
use crate::worker::Worker;

/// How a run is laid out across threads and processes (§6.2).
#[derive(Debug, Clone)]
pub enum Configuration {
    /// A single worker, single thread, single process. Useful for tests.
    Thread,
    /// `threads` thread-private workers in one process, plus the shared worker.
    Process {
        /// Number of thread-private workers to create in addition to the shared one.
        threads: usize,
    },
    /// A multi-process run. `process` is this process's index into `addresses`,
    /// which lists every process's rendezvous address for the backend's
    /// out-of-band address exchange.
    Cluster {
        /// Thread-private workers per process, in addition to the shared one.
        threads: usize,
        /// This process's index.
        process: usize,
        /// Total number of processes.
        processes: usize,
        /// Rendezvous hostfile path, if the backend needs one to bootstrap.
        hostfile: Option<String>,
        /// Whether to report per-worker timing to stderr on shutdown.
        report: bool,
    },
}

impl Configuration {
    /// Parses a `Configuration` from command-line arguments the way the
    /// source this is modeled on parses its own: `-w/--threads`,
    /// `-p/--process`, `-n/--processes`, `-h/--hostfile`, `-r/--report`.
    /// Returns the unconsumed positional arguments alongside the configuration.
    pub fn from_args<I: Iterator<Item = String>>(mut args: I) -> Result<(Self, Vec<String>)> {
        let mut opts = getopts::Options::new();
        opts.optopt("w", "threads", "number of thread-private workers", "THREADS");
        opts.optopt("p", "process", "this process's index", "PROCESS");
        opts.optopt("n", "processes", "total number of processes", "PROCESSES");
        opts.optopt("h", "hostfile", "rendezvous hostfile", "HOSTFILE");
        opts.optflag("r", "report", "report timing on shutdown");

        let _argv0 = args.next();
        let rest: Vec<String> = args.collect();
        let matches = opts
            .parse(&rest)
            .map_err(|e| TransportError::Usage(format!("argument parsing failed: {e}")))?;

        let threads: usize = match matches.opt_str("w") {
            Some(s) => s
                .parse()
                .map_err(|_| TransportError::Usage(format!("invalid --threads value {s:?}")))?,
            None => 0,
        };
        let processes: usize = match matches.opt_str("n") {
            Some(s) => s
                .parse()
                .map_err(|_| TransportError::Usage(format!("invalid --processes value {s:?}")))?,
            None => 1,
        };

        let config = if processes > 1 {
            let process: usize = match matches.opt_str("p") {
                Some(s) => s.parse().map_err(|_| {
                    TransportError::Usage(format!("invalid --process value {s:?}"))
                })?,
                None => 0,
            };
            Configuration::Cluster {
                threads,
                process,
                processes,
                hostfile: matches.opt_str("h"),
                report: matches.opt_present("r"),
            }
        } else if threads > 0 {
            Configuration::Process { threads }
        } else {
            Configuration::Thread
        };

        Ok((config, matches.free))
    }
}

/// Handles to every thread a multi-threaded [`initialize`] spawned, and the
/// join results they eventually produce.
///
/// Mirrors `WorkerGuards<T>` in the crate this is modeled on: dropping it
/// without calling [`WorkerGuards::join`] detaches the threads rather than
/// blocking, since `Context` teardown (not thread-join) is what's required
/// for correctness (§5).
pub struct WorkerGuards<T> {
    handles: Vec<JoinHandle<T>>,
}

impl<T> WorkerGuards<T> {
    /// Blocks until every spawned thread has returned, collecting their results.
    ///
    /// # Panics
    /// Panics if a spawned thread itself panicked, after printing its payload,
    /// matching `std::thread::JoinHandle::join`'s default propagation.
    pub fn join(self) -> Vec<T> {
        self.handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
            .collect()
    }
}

/// Process-wide transport state: one backend, one address database, and the
/// shared worker every thread of this process can reach (§3).
pub struct Context {
    rank: usize,
    size: usize,
    backend: Arc<dyn Backend>,
    db: Arc<dyn AddressDb>,
    uuids: UuidSource,
    shared: Arc<Worker>,
    next_index: AtomicUsize,
}

impl Context {
    /// Builds a context for a `size`-rank run, identifying this process as
    /// `rank`, over `backend`, creating and publishing the shared worker.
    pub fn new(
        rank: usize,
        size: usize,
        mode: ThreadMode,
        backend: Arc<dyn Backend>,
        db: Arc<dyn AddressDb>,
    ) -> Result<Self> {
        let grant = backend.init(&InitParams {
            request_size: 0,
            tag_sender_mask: crate::tag::EXACT_MASK,
            mt_workers_shared: matches!(mode, ThreadMode::Serialized),
            estimated_num_eps: size as u32,
        })?;
        if mode == ThreadMode::Serialized && grant.thread_mode != ThreadMode::Serialized {
            return Err(TransportError::Configuration { required: mode, granted: grant.thread_mode });
        }

        let uuids = UuidSource::new(rank);
        let shared_uuid = uuids.next();
        let shared = Worker::create(0, true, rank, size, shared_uuid, mode, backend.clone(), db.clone())?;
        db.mark_shared(rank, shared_uuid);

        Ok(Context {
            rank,
            size,
            backend,
            db,
            uuids,
            shared: Arc::new(shared),
            next_index: AtomicUsize::new(1),
        })
    }

    /// This process's rank.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Total ranks in the run.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The process-wide shared worker.
    pub fn shared_worker(&self) -> &Arc<Worker> {
        &self.shared
    }

    /// Creates an additional, thread-private worker. Callers typically do
    /// this once per spawned thread in a `Process`/`Cluster` Configuration.
    pub fn create_worker(&self, mode: ThreadMode) -> Result<Worker> {
        let index = self.next_index.fetch_add(1, Ordering::Relaxed);
        let uuid = self.uuids.next();
        Worker::create(index, false, self.rank, self.size, uuid, mode, self.backend.clone(), self.db.clone())
    }

    /// Exchanges all addresses inserted since the last call across every
    /// rank. Must be called the same number of times, in the same relative
    /// order, by every rank in the run (§4.2).
    pub fn synchronize(&self) -> Result<()> {
        self.db.synchronize()
    }

    /// Tears down the shared worker and finalizes the backend. Thread-private
    /// workers must already have been shut down by their owning threads.
    pub fn shutdown(&self) {
        self.shared.shutdown();
        self.backend.finalize();
    }
}

/// Builds a [`Context`] per `config` over `backend`/`db`, spawns one thread
/// per worker it calls for, and runs `func` on each with that worker.
///
/// Thread 0 always runs on the context's shared worker; any further threads
/// a `Process`/`Cluster` Configuration asks for each get their own
/// thread-private worker, created before the thread is spawned (so a
/// creation failure surfaces here rather than inside the thread).
pub fn initialize<T, F>(
    config: Configuration,
    backend: Arc<dyn Backend>,
    db: Arc<dyn AddressDb>,
    func: F,
) -> Result<WorkerGuards<T>>
where
    F: Fn(Arc<Context>, Arc<Worker>) -> T + Send + Sync + 'static,
    T: Send + 'static,
{
    let (rank, size, thread_count, mode) = match &config {
        Configuration::Thread => (0, 1, 1, ThreadMode::Single),
        Configuration::Process { threads } => (0, 1, (*threads).max(1), ThreadMode::Serialized),
        Configuration::Cluster { threads, process, processes, .. } => {
            (*process, *processes, (*threads).max(1), ThreadMode::Serialized)
        }
    };

    let context = Arc::new(Context::new(rank, size, mode, backend, db)?);
    let func = Arc::new(func);

    let mut handles = Vec::with_capacity(thread_count);
    for i in 0..thread_count {
        let worker = if i == 0 {
            context.shared_worker().clone()
        } else {
            Arc::new(context.create_worker(mode)?)
        };
        let context = context.clone();
        let func = func.clone();
        let handle = std::thread::Builder::new()
            .name(format!("transport-worker-{i}"))
            .spawn(move || func(context, worker))
            .map_err(|e| TransportError::Usage(format!("failed to spawn worker thread: {e}")))?;
        handles.push(handle);
    }
    Ok(WorkerGuards { handles })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_args_with_no_flags_is_thread_mode() {
        let args = vec!["prog".to_string()];
        let (config, free) = Configuration::from_args(args.into_iter()).unwrap();
        assert!(matches!(config, Configuration::Thread));
        assert!(free.is_empty());
    }

    #[test]
    fn from_args_with_threads_flag_is_process_mode() {
        let args = vec!["prog".to_string(), "-w".to_string(), "4".to_string()];
        let (config, _) = Configuration::from_args(args.into_iter()).unwrap();
        match config {
            Configuration::Process { threads } => assert_eq!(threads, 4),
            other => panic!("expected Process, got {other:?}"),
        }
    }

    #[test]
    fn from_args_with_processes_flag_is_cluster_mode() {
        let args = vec![
            "prog".to_string(),
            "-n".to_string(),
            "3".to_string(),
            "-p".to_string(),
            "1".to_string(),
            "100".to_string(),
        ];
        let (config, free) = Configuration::from_args(args.into_iter()).unwrap();
        match config {
            Configuration::Cluster { processes, process, .. } => {
                assert_eq!(processes, 3);
                assert_eq!(process, 1);
            }
            other => panic!("expected Cluster, got {other:?}"),
        }
        assert_eq!(free, vec!["100".to_string()]);
    }
}
