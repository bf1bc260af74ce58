use std::{
    io::{self, Write},
    thread::JoinHandle,
};

use crossbeam_channel::Sender;
use tracing::{debug, warn};

use crate::{
    buffer::{BufferReceiver, Filled, QueuedBufferPool},
    message::EventBuffer,
};

/// Stops the writer thread when dropped, after it has written every buffer
/// sent so far.
pub struct FlushGuard<B> {
    handle: Option<JoinHandle<io::Result<()>>>, // An option, so we can `take`
    sender: Sender<Filled<B>>,
}

/// Spawns a thread that writes every filled buffer of `pool` to `sink` and
/// hands the buffer back for reuse.
pub fn spawn_writer<B, W>(
    pool: &QueuedBufferPool<B>,
    receiver: BufferReceiver<B>,
    sink: W,
) -> io::Result<FlushGuard<B>>
where
    B: EventBuffer + AsRef<[u8]> + Send + 'static,
    W: Write + Send + 'static,
{
    let handle = std::thread::Builder::new()
        .name("bytefrog-writer".to_owned())
        .spawn(move || writer_thread(receiver, sink))?;

    Ok(FlushGuard {
        handle: Some(handle),
        sender: pool.stopper(),
    })
}

pub fn writer_thread<B, W>(receiver: BufferReceiver<B>, mut sink: W) -> io::Result<()>
where
    B: EventBuffer + AsRef<[u8]>,
    W: Write,
{
    debug!("writer thread started");
    let mut written = 0u64;

    while let Some(filled) = receiver.recv() {
        match filled {
            Filled::Buf(buffer) => {
                written += write_buffer(&mut sink, &receiver, buffer)?;
            }
            Filled::StopWriterThread => {
                // Whatever was queued before the stop request still goes out.
                // Anything sent after it is left behind.
                for filled in receiver.try_iter() {
                    if let Filled::Buf(buffer) = filled {
                        written += write_buffer(&mut sink, &receiver, buffer)?;
                    }
                }
                break;
            }
        }
    }

    sink.flush()?;
    debug!(bytes = written, "writer thread finished");
    Ok(())
}

fn write_buffer<B, W>(sink: &mut W, receiver: &BufferReceiver<B>, buffer: B) -> io::Result<u64>
where
    B: EventBuffer + AsRef<[u8]>,
    W: Write,
{
    let bytes = buffer.as_ref();
    // Discarded buffers come back empty.
    if !bytes.is_empty() {
        sink.write_all(bytes)?;
    }
    let len = bytes.len() as u64;
    receiver.recycle(buffer);
    Ok(len)
}

impl<B> Drop for FlushGuard<B> {
    fn drop(&mut self) {
        // Tell writer thread to stop. Sending will fail if thread is already
        // stopped. We can ignore that case.
        let _ignore_err = self.sender.send(Filled::StopWriterThread);
        if let Some(handle) = self.handle.take() {
            match handle.join() {
                Ok(Ok(())) => (),
                Ok(Err(io_err)) => warn!(error = %io_err, "writer thread had an I/O error"),
                Err(_join_err) => warn!("writer thread panicked"),
            }
        }
    }
}
