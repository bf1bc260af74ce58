//! Collaborators for tests and benchmarks: a pool that records every buffer
//! it gets back, a protocol that records events as values instead of bytes,
//! and a protocol that writes one readable line per event.

use std::{
    io::{self, Write},
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
    thread,
};

use crossbeam_utils::atomic::AtomicCell;
use dashmap::DashMap;

use crate::{
    error::TransportError,
    message::{
        BufferPool, EventBuffer, ExceptionId, MessageProtocol, MethodId, Stamp, ThreadId,
        Timestamp,
    },
    thread_local::ThreadNameSource,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedEvent {
    MapMethodSignature {
        id: MethodId,
        signature: String,
    },
    MapException {
        id: ExceptionId,
        exception: String,
    },
    MapThreadName {
        id: ThreadId,
        timestamp: Timestamp,
        name: String,
    },
    MethodEntry {
        stamp: Stamp,
        method: MethodId,
        thread: ThreadId,
    },
    MethodExit {
        stamp: Stamp,
        method: MethodId,
        source_line: i32,
        thread: ThreadId,
    },
    Exception {
        stamp: Stamp,
        method: MethodId,
        exception: ExceptionId,
        source_line: i32,
        thread: ThreadId,
    },
    ExceptionBubble {
        stamp: Stamp,
        method: MethodId,
        exception: ExceptionId,
        thread: ThreadId,
    },
    Marker {
        stamp: Stamp,
        key: String,
        value: String,
    },
    /// What an injected failure leaves behind before it errors out.
    Partial(FailPoint),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecordingBuffer {
    pub events: Vec<RecordedEvent>,
}

impl EventBuffer for RecordingBuffer {
    fn reset(&mut self) {
        self.events.clear();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Hands out fresh buffers without limit and keeps everything sent back.
#[derive(Debug, Default)]
pub struct RecordingPool {
    sent: Mutex<Vec<RecordingBuffer>>,
    refuse: AtomicU32,
    outstanding: AtomicUsize,
    fail_obtains: AtomicBool,
    fail_sends: AtomicBool,
}

impl RecordingPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` calls to `obtain` come back empty-handed.
    pub fn refuse_next(&self, count: u32) {
        self.refuse.store(count, Ordering::SeqCst);
    }

    pub fn fail_obtains(&self, fail: bool) {
        self.fail_obtains.store(fail, Ordering::SeqCst);
    }

    /// While set, `send` swallows the buffer and reports a disconnect.
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// All events from delivered buffers, in the order they were sent.
    pub fn sent_events(&self) -> Vec<RecordedEvent> {
        lock(&self.sent)
            .iter()
            .flat_map(|buffer| buffer.events.iter().cloned())
            .collect()
    }

    pub fn sent_buffers(&self) -> usize {
        lock(&self.sent).len()
    }

    /// Delivered buffers that carried nothing.
    pub fn empty_buffers(&self) -> usize {
        lock(&self.sent)
            .iter()
            .filter(|buffer| buffer.events.is_empty())
            .count()
    }

    /// Buffers obtained but not yet handed back.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }
}

impl BufferPool for RecordingPool {
    type Buffer = RecordingBuffer;

    fn obtain(&self) -> Result<Option<RecordingBuffer>, TransportError> {
        if self.fail_obtains.load(Ordering::SeqCst) {
            return Err(TransportError::Obtain("injected failure".to_owned()));
        }
        let refused = self
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Ok(None);
        }
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        Ok(Some(RecordingBuffer::default()))
    }

    fn send(&self, buffer: RecordingBuffer) -> Result<(), TransportError> {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected);
        }
        lock(&self.sent).push(buffer);
        Ok(())
    }
}

/// Selects which write a [`RecordingProtocol`] sabotages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    MapMethodSignature,
    MapException,
    MapThreadName,
    MethodEntry,
    MethodExit,
    Exception,
    ExceptionBubble,
    Marker,
    /// Panic in whichever write comes next.
    Panic,
}

/// Stores events as [`RecordedEvent`] values.
#[derive(Debug, Default)]
pub struct RecordingProtocol {
    fail_next: AtomicCell<Option<FailPoint>>,
}

impl RecordingProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next write of the given kind leaves a partial record in the
    /// buffer and fails.
    pub fn fail_next(&self, point: FailPoint) {
        self.fail_next.store(Some(point));
    }

    fn record(
        &self,
        buffer: &mut RecordingBuffer,
        point: FailPoint,
        event: RecordedEvent,
    ) -> io::Result<()> {
        match self.fail_next.load() {
            Some(FailPoint::Panic) => {
                self.fail_next.store(None);
                buffer.events.push(RecordedEvent::Partial(point));
                panic!("injected panic while writing {point:?}");
            }
            Some(armed) if armed == point => {
                self.fail_next.store(None);
                buffer.events.push(RecordedEvent::Partial(point));
                Err(io::Error::new(io::ErrorKind::Other, "injected failure"))
            }
            _ => {
                buffer.events.push(event);
                Ok(())
            }
        }
    }
}

impl MessageProtocol<RecordingBuffer> for RecordingProtocol {
    fn write_map_method_signature(
        &self,
        buffer: &mut RecordingBuffer,
        id: MethodId,
        signature: &str,
    ) -> io::Result<()> {
        let event = RecordedEvent::MapMethodSignature {
            id,
            signature: signature.to_owned(),
        };
        self.record(buffer, FailPoint::MapMethodSignature, event)
    }

    fn write_map_exception(
        &self,
        buffer: &mut RecordingBuffer,
        id: ExceptionId,
        exception: &str,
    ) -> io::Result<()> {
        let event = RecordedEvent::MapException {
            id,
            exception: exception.to_owned(),
        };
        self.record(buffer, FailPoint::MapException, event)
    }

    fn write_map_thread_name(
        &self,
        buffer: &mut RecordingBuffer,
        id: ThreadId,
        timestamp: Timestamp,
        name: &str,
    ) -> io::Result<()> {
        let event = RecordedEvent::MapThreadName {
            id,
            timestamp,
            name: name.to_owned(),
        };
        self.record(buffer, FailPoint::MapThreadName, event)
    }

    fn write_method_entry(
        &self,
        buffer: &mut RecordingBuffer,
        stamp: Stamp,
        method: MethodId,
        thread: ThreadId,
    ) -> io::Result<()> {
        let event = RecordedEvent::MethodEntry {
            stamp,
            method,
            thread,
        };
        self.record(buffer, FailPoint::MethodEntry, event)
    }

    fn write_method_exit(
        &self,
        buffer: &mut RecordingBuffer,
        stamp: Stamp,
        method: MethodId,
        source_line: i32,
        thread: ThreadId,
    ) -> io::Result<()> {
        let event = RecordedEvent::MethodExit {
            stamp,
            method,
            source_line,
            thread,
        };
        self.record(buffer, FailPoint::MethodExit, event)
    }

    fn write_exception(
        &self,
        buffer: &mut RecordingBuffer,
        stamp: Stamp,
        method: MethodId,
        exception: ExceptionId,
        source_line: i32,
        thread: ThreadId,
    ) -> io::Result<()> {
        let event = RecordedEvent::Exception {
            stamp,
            method,
            exception,
            source_line,
            thread,
        };
        self.record(buffer, FailPoint::Exception, event)
    }

    fn write_exception_bubble(
        &self,
        buffer: &mut RecordingBuffer,
        stamp: Stamp,
        method: MethodId,
        exception: ExceptionId,
        thread: ThreadId,
    ) -> io::Result<()> {
        let event = RecordedEvent::ExceptionBubble {
            stamp,
            method,
            exception,
            thread,
        };
        self.record(buffer, FailPoint::ExceptionBubble, event)
    }

    fn write_marker(
        &self,
        buffer: &mut RecordingBuffer,
        stamp: Stamp,
        key: &str,
        value: &str,
    ) -> io::Result<()> {
        let event = RecordedEvent::Marker {
            stamp,
            key: key.to_owned(),
            value: value.to_owned(),
        };
        self.record(buffer, FailPoint::Marker, event)
    }
}

/// Thread names that tests can change at will. Threads without a scripted
/// name have none.
#[derive(Debug, Default)]
pub struct ScriptedThreadNames {
    names: DashMap<thread::ThreadId, String>,
}

impl ScriptedThreadNames {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rename the calling thread.
    pub fn set_current(&self, name: &str) {
        self.names.insert(thread::current().id(), name.to_owned());
    }
}

impl ThreadNameSource for ScriptedThreadNames {
    fn current_name(&self) -> Option<String> {
        self.names
            .get(&thread::current().id())
            .map(|name| name.value().clone())
    }
}

/// Writes one line per event. Meant for eyeballing a stream, not for a
/// collector.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextProtocol;

impl<B: Write> MessageProtocol<B> for TextProtocol {
    fn write_map_method_signature(
        &self,
        buffer: &mut B,
        id: MethodId,
        signature: &str,
    ) -> io::Result<()> {
        writeln!(buffer, "map-method {id} {signature}")
    }

    fn write_map_exception(
        &self,
        buffer: &mut B,
        id: ExceptionId,
        exception: &str,
    ) -> io::Result<()> {
        writeln!(buffer, "map-exception {id} {exception}")
    }

    fn write_map_thread_name(
        &self,
        buffer: &mut B,
        id: ThreadId,
        timestamp: Timestamp,
        name: &str,
    ) -> io::Result<()> {
        writeln!(buffer, "map-thread {id} @{timestamp} {name}")
    }

    fn write_method_entry(
        &self,
        buffer: &mut B,
        stamp: Stamp,
        method: MethodId,
        thread: ThreadId,
    ) -> io::Result<()> {
        writeln!(
            buffer,
            "#{} @{} entry method={method} thread={thread}",
            stamp.sequence, stamp.timestamp
        )
    }

    fn write_method_exit(
        &self,
        buffer: &mut B,
        stamp: Stamp,
        method: MethodId,
        source_line: i32,
        thread: ThreadId,
    ) -> io::Result<()> {
        writeln!(
            buffer,
            "#{} @{} exit method={method} line={source_line} thread={thread}",
            stamp.sequence, stamp.timestamp
        )
    }

    fn write_exception(
        &self,
        buffer: &mut B,
        stamp: Stamp,
        method: MethodId,
        exception: ExceptionId,
        source_line: i32,
        thread: ThreadId,
    ) -> io::Result<()> {
        writeln!(
            buffer,
            "#{} @{} exception method={method} exception={exception} line={source_line} thread={thread}",
            stamp.sequence, stamp.timestamp
        )
    }

    fn write_exception_bubble(
        &self,
        buffer: &mut B,
        stamp: Stamp,
        method: MethodId,
        exception: ExceptionId,
        thread: ThreadId,
    ) -> io::Result<()> {
        writeln!(
            buffer,
            "#{} @{} bubble method={method} exception={exception} thread={thread}",
            stamp.sequence, stamp.timestamp
        )
    }

    fn write_marker(&self, buffer: &mut B, stamp: Stamp, key: &str, value: &str) -> io::Result<()> {
        writeln!(
            buffer,
            "#{} @{} marker {key}={value}",
            stamp.sequence, stamp.timestamp
        )
    }
}
