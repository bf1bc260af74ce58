//! The event-encoding core of a runtime tracing agent.
//!
//! An instrumentation layer calls into an [`EventDispatcher`] whenever a
//! traced thread enters or leaves a method, throws or propagates an
//! exception, or drops a marker. The dispatcher gives method signatures,
//! exception classes and threads small integer ids, announces each id with a
//! mapping event before its first use, stamps events with a time offset and
//! a global sequence number, and writes every event into a buffer from a
//! [`BufferPool`] using a [`MessageProtocol`].
//!
//! [`QueuedBufferPool`] together with [`writer::spawn_writer`] is a ready-made
//! transport that streams buffers into any `io::Write`.

pub mod buffer;
mod dispatcher;
mod error;
mod intern;
mod message;
mod sequencer;
pub mod testing;
mod thread_local;
pub mod writer;

pub use buffer::{BufferReceiver, DataBuffer, QueuedBufferPool, QueuedBufferPoolBuilder};
pub use dispatcher::{DispatcherBuilder, EventDispatcher};
pub use error::{DispatchError, Result, TransportError};
pub use intern::{Interner, PLACEHOLDER};
pub use message::{
    BufferPool, EventBuffer, ExceptionId, MessageProtocol, MethodId, Stamp, ThreadId, Timestamp,
};
pub use sequencer::Sequencer;
pub use thread_local::{StdThreadNames, ThreadNameSource, ThreadTracker};
pub use writer::FlushGuard;
