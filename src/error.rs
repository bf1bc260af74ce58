use std::io;

use thiserror::Error;

/// Failures reported by a [`BufferPool`](crate::BufferPool).
#[derive(Debug, Error)]
pub enum TransportError {
    /// Nobody is left to receive filled buffers.
    #[error("transport disconnected")]
    Disconnected,

    /// The pool failed to hand out a buffer for a reason other than lack of
    /// capacity.
    #[error("failed to obtain buffer: {0}")]
    Obtain(String),
}

/// Failures surfaced by the emission operations of
/// [`EventDispatcher`](crate::EventDispatcher).
///
/// A pool without free buffers is not an error: the event is dropped and the
/// call returns `Ok`.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("could not obtain a buffer")]
    Obtain(#[source] TransportError),

    /// The encoder gave up mid-write. The buffer was emptied and handed back
    /// to the pool before this was returned.
    #[error("could not encode event")]
    Encode(#[source] io::Error),

    #[error("could not send buffer")]
    Send(#[source] TransportError),
}

pub type Result<T, E = DispatchError> = std::result::Result<T, E>;
