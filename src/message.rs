//! The seams between the dispatcher and the collaborators that move bytes:
//! a pool handing out transmission buffers and a protocol encoding events
//! into them.

use std::io;

use crate::error::TransportError;

pub type ThreadId = u32;
pub type MethodId = u32;
pub type ExceptionId = u32;

/// Milliseconds since the dispatcher was created.
pub type Timestamp = i32;

/// When a sequenced event happened and where it falls in the global order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stamp {
    pub timestamp: Timestamp,
    pub sequence: u32,
}

/// A transmission buffer.
pub trait EventBuffer {
    /// Discards anything written so far.
    fn reset(&mut self);
}

/// Supplies buffers and ships them once written.
///
/// Every buffer returned by `obtain` is handed back through `send` exactly
/// once, whether or not anything was written to it.
pub trait BufferPool: Send + Sync {
    type Buffer: EventBuffer;

    /// `Ok(None)` means no buffer is available right now; the caller drops
    /// the event.
    fn obtain(&self) -> Result<Option<Self::Buffer>, TransportError>;

    fn send(&self, buffer: Self::Buffer) -> Result<(), TransportError>;
}

/// Encodes one event per call into a buffer.
///
/// A failing write may leave partial output behind; the dispatcher resets
/// the buffer in that case.
pub trait MessageProtocol<B>: Send + Sync {
    fn write_map_method_signature(
        &self,
        buffer: &mut B,
        id: MethodId,
        signature: &str,
    ) -> io::Result<()>;

    fn write_map_exception(&self, buffer: &mut B, id: ExceptionId, exception: &str)
        -> io::Result<()>;

    fn write_map_thread_name(
        &self,
        buffer: &mut B,
        id: ThreadId,
        timestamp: Timestamp,
        name: &str,
    ) -> io::Result<()>;

    fn write_method_entry(
        &self,
        buffer: &mut B,
        stamp: Stamp,
        method: MethodId,
        thread: ThreadId,
    ) -> io::Result<()>;

    fn write_method_exit(
        &self,
        buffer: &mut B,
        stamp: Stamp,
        method: MethodId,
        source_line: i32,
        thread: ThreadId,
    ) -> io::Result<()>;

    fn write_exception(
        &self,
        buffer: &mut B,
        stamp: Stamp,
        method: MethodId,
        exception: ExceptionId,
        source_line: i32,
        thread: ThreadId,
    ) -> io::Result<()>;

    fn write_exception_bubble(
        &self,
        buffer: &mut B,
        stamp: Stamp,
        method: MethodId,
        exception: ExceptionId,
        thread: ThreadId,
    ) -> io::Result<()>;

    fn write_marker(&self, buffer: &mut B, stamp: Stamp, key: &str, value: &str)
        -> io::Result<()>;
}
