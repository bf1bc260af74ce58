use std::sync::atomic::{AtomicU32, Ordering};

/// Hands out the order position of each sequenced event.
///
/// The counter wraps at `u32::MAX`; nothing corrects for that.
#[derive(Debug, Default)]
pub struct Sequencer {
    sequence: AtomicU32,
}

impl Sequencer {
    pub fn new() -> Self {
        Sequencer {
            sequence: AtomicU32::new(0),
        }
    }

    #[cfg(test)]
    fn starting_at(value: u32) -> Self {
        Sequencer {
            sequence: AtomicU32::new(value),
        }
    }

    /// Returns the current value and advances the counter.
    #[inline]
    pub fn next(&self) -> u32 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Returns the value the next call to `next` will hand out.
    #[inline]
    pub fn peek(&self) -> u32 {
        self.sequence.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::Sequencer;
    use std::thread;

    #[test]
    fn peek_does_not_advance() {
        let seq = Sequencer::new();
        assert_eq!(seq.peek(), 0);
        assert_eq!(seq.peek(), 0);
        assert_eq!(seq.next(), 0);
        assert_eq!(seq.peek(), 1);
        assert_eq!(seq.next(), 1);
    }

    #[test]
    fn concurrent_values_are_contiguous() {
        let threads = 8;
        let rounds = 10_000;
        let seq = Sequencer::new();

        let mut all: Vec<u32> = thread::scope(|s| {
            let handles = (0..threads)
                .map(|_| {
                    let seq = &seq;
                    s.spawn(move || (0..rounds).map(|_| seq.next()).collect::<Vec<_>>())
                })
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect()
        });

        all.sort_unstable();
        let expected: Vec<u32> = (0..(threads * rounds) as u32).collect();
        assert_eq!(all, expected);
        assert_eq!(seq.peek(), (threads * rounds) as u32);
    }

    #[test]
    fn wraps_at_width() {
        let seq = Sequencer::starting_at(u32::MAX);
        assert_eq!(seq.next(), u32::MAX);
        assert_eq!(seq.next(), 0);
    }
}
