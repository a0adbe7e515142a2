//! A tagged point-to-point transport layer for HPC-style workloads.
//!
//! Application code talks to a [`Communicator`], obtained from a
//! [`Worker`], obtained from a [`Context`]. Everything below that is a
//! pluggable [`Backend`] (a real wire implementation, or the bundled
//! [`backend::loopback`] reference backend) reached only through the
//! [`backend::Backend`] trait object — the rest of the crate never assumes
//! a specific wire protocol.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tagged_transport::addr_db::{AddressDb, SimpleDb};
//! use tagged_transport::backend::loopback::LoopbackFabric;
//! use tagged_transport::backend::{Backend, ThreadMode};
//! use tagged_transport::context::Context;
//! use tagged_transport::communicator::Communicator;
//! use tagged_transport::message::OwnedBuffer;
//!
//! let fabric = LoopbackFabric::new(2);
//! let db: Arc<dyn AddressDb> = Arc::new(SimpleDb::new(0, 2));
//! let backend: Arc<dyn Backend> = Arc::new(fabric.backend());
//! let ctx = Context::new(0, 2, ThreadMode::Single, backend, db).unwrap();
//! let comm = Communicator::new(ctx.shared_worker().clone());
//! let _ = comm.send(OwnedBuffer::new(vec![1, 2, 3]), 1, 0);
//! ```

pub mod addr_db;
pub mod address;
pub mod backend;
pub mod communicator;
pub mod context;
pub mod continuation;
pub mod error;
pub mod future;
pub mod message;
pub mod tag;
pub mod uuid;
pub mod worker;

pub use communicator::Communicator;
pub use context::{Configuration, Context, WorkerGuards};
pub use error::{Result, TransportError};
pub use future::Future;
pub use worker::Worker;
