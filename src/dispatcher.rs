use std::{io, time::Instant};

use tracing::{trace, warn};

use crate::{
    error::{DispatchError, Result, TransportError},
    intern::Interner,
    message::{
        BufferPool, EventBuffer, ExceptionId, MessageProtocol, MethodId, Stamp, ThreadId,
        Timestamp,
    },
    sequencer::Sequencer,
    thread_local::{StdThreadNames, ThreadNameSource, ThreadTracker},
};

/// Turns execution events into encoded messages.
///
/// Ids for method signatures, exception classes and threads are assigned on
/// first use; the matching mapping event is emitted before the first event
/// that refers to the id. Every event is written to its own buffer obtained
/// from `P` and encoded by `E`. When the pool has no buffer to spare the
/// event is dropped silently.
pub struct EventDispatcher<P, E> {
    pool: P,
    protocol: E,
    started_at: Instant,
    sequencer: Sequencer,
    method_ids: Interner<str>,
    exception_ids: Interner<str>,
    threads: ThreadTracker,
}

pub struct DispatcherBuilder<P, E> {
    pool: P,
    protocol: E,
    thread_names: Box<dyn ThreadNameSource>,
}

impl<P, E> DispatcherBuilder<P, E>
where
    P: BufferPool,
    E: MessageProtocol<P::Buffer>,
{
    pub fn new(pool: P, protocol: E) -> Self {
        DispatcherBuilder {
            pool,
            protocol,
            thread_names: Box::new(StdThreadNames),
        }
    }

    /// Set where thread names come from.
    ///
    /// Defaults to the name each `std::thread` was spawned with.
    pub fn thread_names<N: ThreadNameSource + 'static>(mut self, names: N) -> Self {
        self.thread_names = Box::new(names);
        self
    }

    pub fn build(self) -> EventDispatcher<P, E> {
        EventDispatcher {
            pool: self.pool,
            protocol: self.protocol,
            started_at: Instant::now(),
            sequencer: Sequencer::new(),
            method_ids: Interner::new(),
            exception_ids: Interner::new(),
            threads: ThreadTracker::new(self.thread_names),
        }
    }
}

impl<P, E> EventDispatcher<P, E>
where
    P: BufferPool,
    E: MessageProtocol<P::Buffer>,
{
    pub fn new(pool: P, protocol: E) -> Self {
        Self::builder(pool, protocol).build()
    }

    pub fn builder(pool: P, protocol: E) -> DispatcherBuilder<P, E> {
        DispatcherBuilder::new(pool, protocol)
    }

    pub fn pool(&self) -> &P {
        &self.pool
    }

    pub fn protocol(&self) -> &E {
        &self.protocol
    }

    /// Milliseconds since this dispatcher was created, truncated to 32 bits.
    pub fn time_offset(&self) -> Timestamp {
        self.started_at.elapsed().as_millis() as Timestamp
    }

    /// The sequence number the next sequenced event will get.
    pub fn current_sequence(&self) -> u32 {
        self.sequencer.peek()
    }

    /// Pairs a timestamp taken when the event was reported with the next
    /// sequence number. Only called once a buffer is in hand, so dropped
    /// events consume no sequence number.
    fn stamp(&self, timestamp: Timestamp) -> Stamp {
        Stamp {
            timestamp,
            sequence: self.sequencer.next(),
        }
    }

    pub fn map_method_signature(&self, signature: &str, id: MethodId) -> Result<()> {
        self.dispatch(|protocol, buffer| {
            protocol.write_map_method_signature(buffer, id, signature)
        })
    }

    pub fn map_exception(&self, exception: &str, id: ExceptionId) -> Result<()> {
        self.dispatch(|protocol, buffer| protocol.write_map_exception(buffer, id, exception))
    }

    pub fn map_thread_name(&self, name: &str, id: ThreadId) -> Result<()> {
        self.dispatch(|protocol, buffer| {
            protocol.write_map_thread_name(buffer, id, self.time_offset(), name)
        })
    }

    pub fn method_entry(&self, signature: &str) -> Result<()> {
        let timestamp = self.time_offset();
        let thread = self.current_thread()?;
        let method = self.method_id(signature)?;
        self.dispatch(|protocol, buffer| {
            protocol.write_method_entry(buffer, self.stamp(timestamp), method, thread)
        })
    }

    pub fn method_exit(&self, signature: &str, source_line: i32) -> Result<()> {
        let timestamp = self.time_offset();
        let thread = self.current_thread()?;
        let method = self.method_id(signature)?;
        self.dispatch(|protocol, buffer| {
            protocol.write_method_exit(buffer, self.stamp(timestamp), method, source_line, thread)
        })
    }

    pub fn exception(&self, exception: &str, signature: &str, source_line: i32) -> Result<()> {
        let timestamp = self.time_offset();
        let thread = self.current_thread()?;
        let method = self.method_id(signature)?;
        let exception = self.exception_id(exception)?;
        self.dispatch(|protocol, buffer| {
            protocol.write_exception(
                buffer,
                self.stamp(timestamp),
                method,
                exception,
                source_line,
                thread,
            )
        })
    }

    pub fn exception_bubble(&self, exception: &str, signature: &str) -> Result<()> {
        let timestamp = self.time_offset();
        let thread = self.current_thread()?;
        let method = self.method_id(signature)?;
        let exception = self.exception_id(exception)?;
        self.dispatch(|protocol, buffer| {
            protocol.write_exception_bubble(buffer, self.stamp(timestamp), method, exception, thread)
        })
    }

    pub fn marker(&self, key: &str, value: &str) -> Result<()> {
        let timestamp = self.time_offset();
        self.dispatch(|protocol, buffer| {
            protocol.write_marker(buffer, self.stamp(timestamp), key, value)
        })
    }

    fn current_thread(&self) -> Result<ThreadId> {
        self.threads.current(|id, name| {
            trace!(id, name, "announcing thread");
            self.map_thread_name(name, id)
        })
    }

    fn method_id(&self, signature: &str) -> Result<MethodId> {
        self.method_ids.resolve(signature, |signature, id| {
            trace!(id, signature, "announcing method");
            self.map_method_signature(signature, id)
        })
    }

    fn exception_id(&self, exception: &str) -> Result<ExceptionId> {
        self.exception_ids.resolve(exception, |exception, id| {
            trace!(id, exception, "announcing exception");
            self.map_exception(exception, id)
        })
    }

    /// Obtains a buffer, runs `write` on it and sends it back to the pool.
    ///
    /// The buffer goes back on every path. If `write` fails the buffer is
    /// reset first, so no half-written event reaches the transport.
    fn dispatch<W>(&self, write: W) -> Result<()>
    where
        W: FnOnce(&E, &mut P::Buffer) -> io::Result<()>,
    {
        let buffer = match self.pool.obtain().map_err(DispatchError::Obtain)? {
            Some(buffer) => buffer,
            None => {
                trace!("no buffer available, dropping event");
                return Ok(());
            }
        };

        let mut lease = BufferLease::new(&self.pool, buffer);
        let written = lease.with(|buffer| write(&self.protocol, buffer));

        match written {
            Ok(()) => lease.send().map_err(DispatchError::Send),
            Err(encode_err) => {
                warn!(error = %encode_err, "failed to encode event, discarding buffer");
                if let Err(send_err) = lease.discard() {
                    warn!(error = %send_err, "failed to send discarded buffer");
                }
                Err(DispatchError::Encode(encode_err))
            }
        }
    }
}

/// A buffer borrowed from a pool.
///
/// Consumed by `send` or `discard`. A lease dropped any other way, which
/// only happens while unwinding, resets its buffer and sends it anyway.
struct BufferLease<'p, P: BufferPool> {
    pool: &'p P,
    buffer: Option<P::Buffer>,
}

impl<'p, P: BufferPool> BufferLease<'p, P> {
    fn new(pool: &'p P, buffer: P::Buffer) -> Self {
        BufferLease {
            pool,
            buffer: Some(buffer),
        }
    }

    fn with<R>(&mut self, f: impl FnOnce(&mut P::Buffer) -> R) -> R {
        // Only `send`/`discard`/`drop` take the buffer out, and they consume
        // the lease.
        let buffer = self
            .buffer
            .as_mut()
            .unwrap_or_else(|| unreachable!("lease used after release"));
        f(buffer)
    }

    fn send(mut self) -> std::result::Result<(), TransportError> {
        match self.buffer.take() {
            Some(buffer) => self.pool.send(buffer),
            None => Ok(()),
        }
    }

    fn discard(mut self) -> std::result::Result<(), TransportError> {
        match self.buffer.take() {
            Some(mut buffer) => {
                buffer.reset();
                self.pool.send(buffer)
            }
            None => Ok(()),
        }
    }
}

impl<'p, P: BufferPool> Drop for BufferLease<'p, P> {
    fn drop(&mut self) {
        if let Some(mut buffer) = self.buffer.take() {
            buffer.reset();
            if let Err(err) = self.pool.send(buffer) {
                warn!(error = %err, "failed to send buffer while unwinding");
            }
        }
    }
}

// Make sure that `EventDispatcher` can be shared between traced threads
fn _assert_bounds() {
    use crate::testing::{RecordingPool, RecordingProtocol};
    fn assert_bounds_inner<S: Sized + Send + Sync + 'static>() {}
    assert_bounds_inner::<EventDispatcher<RecordingPool, RecordingProtocol>>();
}
