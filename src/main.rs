use std::{
    io,
    thread::{self, ScopedJoinHandle},
    time::{Duration, Instant},
};

use bytefrog_dispatch::{testing::TextProtocol, writer, EventDispatcher, QueuedBufferPool};
use tracing::info;

fn main() -> io::Result<()> {
    tracing_subscriber::fmt().with_writer(io::stderr).init();

    let threads = 20_usize;
    let rounds = 100_000;

    bench_dispatch(threads, rounds, 64)?;
    bench_dispatch(threads, rounds, 4096)?;
    Ok(())
}

fn bench_dispatch(threads: usize, rounds: usize, buffers: usize) -> io::Result<()> {
    let (pool, receiver) = QueuedBufferPool::builder().buffers(buffers).build();
    let guard = writer::spawn_writer(&pool, receiver, io::sink())?;
    let dispatcher = EventDispatcher::new(pool, TextProtocol);

    thread::scope(|s| {
        let handles: Vec<ScopedJoinHandle<(usize, Duration)>> = (0..threads)
            .map(|id| {
                let dispatcher = &dispatcher;
                thread::Builder::new()
                    .name(format!("bench-{id}"))
                    .spawn_scoped(s, move || {
                        let sig = format!("Bench{}.run()V", id % 4);
                        let t = Instant::now();
                        for i in 0..rounds {
                            let _ = dispatcher.method_entry(&sig);
                            let _ = dispatcher.method_exit(&sig, i as i32);
                        }
                        (id, t.elapsed())
                    })
                    .expect("failed to spawn bench thread")
            })
            .collect::<Vec<_>>();
        for h in handles {
            let (id, elapsed) = h.join().expect("bench thread panicked");
            info!(
                thread = id,
                ?elapsed,
                events_per_sec = (2 * rounds) as f64 / elapsed.as_secs_f64(),
                "done"
            );
        }
    });

    drop(guard);
    info!(
        buffers,
        events = dispatcher.current_sequence(),
        dropped = dispatcher.pool().misses(),
        "bench finished"
    );
    Ok(())
}
