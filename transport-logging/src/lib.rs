//! Event payload types for tagged-transport's structured logging.
//!
//! These are plain, serde-derivable structs describing the events a worker,
//! endpoint, or continuation dispatcher may want to report. They carry no
//! logging infrastructure of their own: callers pass them to `tracing::event!`
//! at the call site. Keeping them in their own crate lets other tools (a
//! log analyzer, a replay harness) depend on the event shapes without
//! depending on the transport implementation itself.

use serde::{Deserialize, Serialize};

/// Identifies the kind of worker a log record originates from.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, Serialize, Deserialize)]
pub struct WorkerSetup {
    /// True for the shared (process-wide) worker, false for a thread-private worker.
    pub shared: bool,
    /// The worker's slot index (0 for the shared worker).
    pub index: usize,
    /// The owning rank.
    pub rank: usize,
}

/// A worker or endpoint lifecycle transition.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, Serialize, Deserialize)]
pub struct StateEvent {
    /// The worker this event concerns.
    pub worker_index: usize,
    /// The remote rank, if this event concerns a specific peer.
    pub remote: Option<usize>,
    /// True if this is a start/create event, false for a stop/destroy event.
    pub start: bool,
}

/// An observed send or receive submission.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, Serialize, Deserialize)]
pub struct MessageEvent {
    /// True for a send event, false for a receive event.
    pub is_send: bool,
    /// The peer rank.
    pub peer: usize,
    /// The user-visible tag.
    pub tag: u32,
    /// The wire tag, after encoding (see `tagged_transport::tag`).
    pub wire_tag: u64,
    /// Number of bytes carried by the message.
    pub length: usize,
    /// True if the operation completed inline (the early-complete fast path).
    pub inline: bool,
}

/// A continuation-communicator progress tick.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, Serialize, Deserialize)]
pub struct ContinuationEvent {
    /// Number of callbacks invoked during this `progress()` call.
    pub completed: usize,
    /// Number of those completions that took the early-complete fast path.
    pub early: usize,
}

/// The union of event kinds this crate defines, for callers that want a
/// single type to match on (e.g. a trace subscriber layer).
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, Serialize, Deserialize)]
pub enum TransportEvent {
    /// A worker or endpoint state transition.
    State(StateEvent),
    /// A send or receive submission.
    Message(MessageEvent),
    /// A continuation-communicator progress tick.
    Continuation(ContinuationEvent),
}

impl From<StateEvent> for TransportEvent {
    fn from(v: StateEvent) -> Self { TransportEvent::State(v) }
}
impl From<MessageEvent> for TransportEvent {
    fn from(v: MessageEvent) -> Self { TransportEvent::Message(v) }
}
impl From<ContinuationEvent> for TransportEvent {
    fn from(v: ContinuationEvent) -> Self { TransportEvent::Continuation(v) }
}
