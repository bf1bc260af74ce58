use std::{
    io,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use crossbeam_channel::{Receiver, Sender};
use crossbeam_queue::ArrayQueue;
use tracing::{debug, trace};

use crate::{
    error::TransportError,
    message::{BufferPool, EventBuffer},
};

/// A growable byte buffer.
#[derive(Debug, Default, Clone)]
pub struct DataBuffer {
    data: Vec<u8>,
}

impl DataBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        DataBuffer {
            data: Vec::with_capacity(capacity),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl EventBuffer for DataBuffer {
    fn reset(&mut self) {
        self.data.clear();
    }
}

impl io::Write for DataBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.data.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsRef<[u8]> for DataBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

pub enum Filled<B> {
    Buf(B),
    StopWriterThread,
}

/// A fixed set of buffers that circulate between event producers and a
/// consumer.
///
/// Free buffers wait in a lock-free queue. `obtain` never blocks: when the
/// queue is empty it reports a miss and the producer drops its event. Sent
/// buffers travel over a channel to the [`BufferReceiver`], which recycles
/// them once their contents are consumed.
pub struct QueuedBufferPool<B> {
    free: Arc<ArrayQueue<B>>,
    filled: Sender<Filled<B>>,
    misses: AtomicU64,
}

/// The consuming end of a [`QueuedBufferPool`].
pub struct BufferReceiver<B> {
    filled: Receiver<Filled<B>>,
    free: Arc<ArrayQueue<B>>,
}

pub struct QueuedBufferPoolBuilder {
    buffers: usize,
    buffer_capacity: usize,
}

impl QueuedBufferPoolBuilder {
    pub fn new() -> Self {
        QueuedBufferPoolBuilder {
            buffers: 256,
            buffer_capacity: 128,
        }
    }

    /// Number of buffers in circulation. Defaults to 256.
    pub fn buffers(mut self, buffers: usize) -> Self {
        self.buffers = buffers;
        self
    }

    /// Bytes preallocated per buffer. Buffers grow past this if needed.
    /// Defaults to 128.
    pub fn buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    pub fn build(self) -> (QueuedBufferPool<DataBuffer>, BufferReceiver<DataBuffer>) {
        let capacity = self.buffer_capacity;
        QueuedBufferPool::from_fn(self.buffers, || DataBuffer::with_capacity(capacity))
    }
}

impl Default for QueuedBufferPoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl QueuedBufferPool<DataBuffer> {
    pub fn builder() -> QueuedBufferPoolBuilder {
        QueuedBufferPoolBuilder::new()
    }
}

impl<B: EventBuffer + Send> QueuedBufferPool<B> {
    /// Creates a pool of `count` buffers made by `make`.
    ///
    /// A pool of zero buffers is valid and drops every event.
    pub fn from_fn<F>(count: usize, mut make: F) -> (Self, BufferReceiver<B>)
    where
        F: FnMut() -> B,
    {
        // `ArrayQueue` needs room for at least one slot.
        let free = Arc::new(ArrayQueue::new(count.max(1)));
        for _ in 0..count {
            // Can't fail, the queue was sized for exactly this many.
            let _ = free.push(make());
        }
        let (send, recv) = crossbeam_channel::unbounded();
        debug!(buffers = count, "buffer pool created");

        (
            QueuedBufferPool {
                free: free.clone(),
                filled: send,
                misses: AtomicU64::new(0),
            },
            BufferReceiver {
                filled: recv,
                free,
            },
        )
    }

    /// Buffers currently available to producers.
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// How many times `obtain` found no free buffer.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub(crate) fn stopper(&self) -> Sender<Filled<B>> {
        self.filled.clone()
    }
}

impl<B: EventBuffer + Send> BufferPool for QueuedBufferPool<B> {
    type Buffer = B;

    fn obtain(&self) -> Result<Option<B>, TransportError> {
        match self.free.pop() {
            Some(buffer) => Ok(Some(buffer)),
            None => {
                let misses = self.misses.fetch_add(1, Ordering::Relaxed) + 1;
                trace!(misses, "buffer pool exhausted");
                Ok(None)
            }
        }
    }

    fn send(&self, buffer: B) -> Result<(), TransportError> {
        self.filled
            .send(Filled::Buf(buffer))
            .map_err(|_| TransportError::Disconnected)
    }
}

impl<B: EventBuffer> BufferReceiver<B> {
    /// Blocks until the next filled buffer arrives. `None` once every sender
    /// is gone or the writer was told to stop.
    pub fn recv(&self) -> Option<Filled<B>> {
        self.filled.recv().ok()
    }

    /// Returns a consumed buffer to the free queue.
    pub fn recycle(&self, mut buffer: B) {
        buffer.reset();
        // The queue holds every buffer of the pool, so there is always room.
        let _ = self.free.push(buffer);
    }

    /// Filled buffers waiting to be consumed, without blocking.
    pub fn try_iter(&self) -> impl Iterator<Item = Filled<B>> + '_ {
        self.filled.try_iter()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn take_buf(filled: Option<Filled<DataBuffer>>) -> DataBuffer {
        match filled {
            Some(Filled::Buf(buffer)) => buffer,
            _ => panic!("expected a buffer"),
        }
    }

    #[test]
    fn exhausted_pool_reports_misses() {
        let (pool, _receiver) = QueuedBufferPool::builder().buffers(2).build();
        let a = pool.obtain().unwrap();
        let b = pool.obtain().unwrap();
        assert!(a.is_some() && b.is_some());
        assert!(pool.obtain().unwrap().is_none());
        assert!(pool.obtain().unwrap().is_none());
        assert_eq!(pool.misses(), 2);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn zero_buffer_pool_always_misses() {
        let (pool, _receiver) = QueuedBufferPool::builder().buffers(0).build();
        assert_eq!(pool.available(), 0);
        for _ in 0..3 {
            assert!(pool.obtain().unwrap().is_none());
        }
        assert_eq!(pool.misses(), 3);
    }

    #[test]
    fn recycled_buffers_come_back_empty() {
        let (pool, receiver) = QueuedBufferPool::builder().buffers(1).build();
        let mut buffer = pool.obtain().unwrap().unwrap();
        buffer.write_all(b"hello").unwrap();
        pool.send(buffer).unwrap();
        assert!(pool.obtain().unwrap().is_none());

        let buffer = take_buf(receiver.recv());
        assert_eq!(buffer.as_bytes(), b"hello");
        receiver.recycle(buffer);

        let buffer = pool.obtain().unwrap().unwrap();
        assert!(buffer.is_empty());
    }

    #[test]
    fn send_after_receiver_dropped_fails() {
        let (pool, receiver) = QueuedBufferPool::builder().buffers(1).build();
        let buffer = pool.obtain().unwrap().unwrap();
        drop(receiver);
        assert!(matches!(
            pool.send(buffer),
            Err(TransportError::Disconnected)
        ));
    }

    #[test]
    fn reset_discards_partial_writes() {
        let mut buffer = DataBuffer::with_capacity(16);
        buffer.write_all(b"half an ev").unwrap();
        buffer.reset();
        assert!(buffer.is_empty());
        assert_eq!(buffer.len(), 0);
    }
}
