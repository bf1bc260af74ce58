use std::{
    cell::RefCell,
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
};

use rustc_hash::FxHashMap;

/// Where the tracker learns the observable name of the calling thread.
///
/// Names may change over a thread's lifetime; every change is announced
/// again.
pub trait ThreadNameSource: Send + Sync {
    fn current_name(&self) -> Option<String>;
}

/// Reads the name the thread was spawned with.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdThreadNames;

impl ThreadNameSource for StdThreadNames {
    fn current_name(&self) -> Option<String> {
        std::thread::current().name().map(str::to_owned)
    }
}

impl<T: ThreadNameSource + ?Sized> ThreadNameSource for std::sync::Arc<T> {
    fn current_name(&self) -> Option<String> {
        (**self).current_name()
    }
}

#[derive(Debug)]
struct ThreadRecord {
    id: u32,
    announced: bool,
    name: String,
}

/// Tells trackers apart, so two dispatchers in one process never share a
/// thread's record.
static NEXT_TRACKER: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static RECORDS: RefCell<FxHashMap<u64, ThreadRecord>> = RefCell::new(FxHashMap::default());
}

/// Gives every traced thread a stable id and re-announces it whenever the
/// thread's name changes.
///
/// Records live in one per-thread map shared by all trackers, keyed by
/// tracker. Dropping a tracker only clears the dropping thread's record.
/// Every other thread that used it keeps a small stale entry until that
/// thread exits, so a long-lived thread that sees many short-lived
/// dispatchers accumulates one entry per dispatcher.
pub struct ThreadTracker {
    key: u64,
    next_thread_id: AtomicU32,
    names: Box<dyn ThreadNameSource>,
}

impl ThreadTracker {
    pub fn new(names: Box<dyn ThreadNameSource>) -> Self {
        ThreadTracker {
            key: NEXT_TRACKER.fetch_add(1, Ordering::Relaxed),
            next_thread_id: AtomicU32::new(0),
            names,
        }
    }

    /// Returns the id of the calling thread.
    ///
    /// `announce` runs before this returns whenever the thread is new or has
    /// been renamed since its last announcement. If it fails, the thread is
    /// left unannounced and the next call tries again.
    pub fn current<F, E>(&self, announce: F) -> Result<u32, E>
    where
        F: FnOnce(u32, &str) -> Result<(), E>,
    {
        let name = self.names.current_name().unwrap_or_default();

        // Don't hold the borrow across `announce`.
        let (id, stale) = RECORDS.with(|records| {
            let mut records = records.borrow_mut();
            let record = records.entry(self.key).or_insert_with(|| ThreadRecord {
                id: self.next_thread_id.fetch_add(1, Ordering::Relaxed),
                announced: false,
                name: String::new(),
            });
            (record.id, !record.announced || record.name != name)
        });

        if stale {
            announce(id, &name)?;
            RECORDS.with(|records| {
                if let Some(record) = records.borrow_mut().get_mut(&self.key) {
                    record.announced = true;
                    record.name = name;
                }
            });
        }

        Ok(id)
    }
}

impl Drop for ThreadTracker {
    fn drop(&mut self) {
        // Only the dropping thread's record can be reached; other threads
        // abandon theirs when they exit.
        let _ = RECORDS.try_with(|records| records.borrow_mut().remove(&self.key));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedThreadNames;
    use std::{sync::Arc, thread};

    fn tracker_with(names: Arc<ScriptedThreadNames>) -> ThreadTracker {
        ThreadTracker::new(Box::new(names))
    }

    #[test]
    fn first_call_announces_once() {
        let tracker = ThreadTracker::new(Box::new(StdThreadNames));
        let mut announced = Vec::new();
        for _ in 0..3 {
            let id = tracker
                .current(|id, name| {
                    announced.push((id, name.to_owned()));
                    Ok::<_, ()>(())
                })
                .unwrap();
            assert_eq!(id, 0);
        }
        assert_eq!(announced.len(), 1);
        assert_eq!(announced[0].0, 0);
    }

    #[test]
    fn rename_announces_again() {
        let names = Arc::new(ScriptedThreadNames::new());
        let tracker = tracker_with(names.clone());
        let mut announced = Vec::new();
        let mut record = |id: u32, name: &str| {
            announced.push((id, name.to_owned()));
            Ok::<_, ()>(())
        };

        names.set_current("main");
        tracker.current(&mut record).unwrap();
        tracker.current(&mut record).unwrap();
        names.set_current("worker-1");
        tracker.current(&mut record).unwrap();
        tracker.current(&mut record).unwrap();

        assert_eq!(
            announced,
            vec![(0, "main".to_owned()), (0, "worker-1".to_owned())]
        );
    }

    #[test]
    fn missing_name_is_empty() {
        let names = Arc::new(ScriptedThreadNames::new());
        let tracker = tracker_with(names);
        let mut seen = None;
        tracker
            .current(|_, name| {
                seen = Some(name.to_owned());
                Ok::<_, ()>(())
            })
            .unwrap();
        assert_eq!(seen.as_deref(), Some(""));
    }

    #[test]
    fn failed_announce_retries() {
        let tracker = ThreadTracker::new(Box::new(StdThreadNames));
        assert_eq!(tracker.current(|_, _| Err("full")), Err("full"));
        let mut calls = 0;
        let id = tracker
            .current(|_, _| {
                calls += 1;
                Ok::<_, &str>(())
            })
            .unwrap();
        assert_eq!(id, 0);
        assert_eq!(calls, 1);
    }

    #[test]
    fn threads_get_distinct_ids() {
        let tracker = ThreadTracker::new(Box::new(StdThreadNames));
        let mut ids: Vec<u32> = thread::scope(|s| {
            let handles = (0..6)
                .map(|_| {
                    let tracker = &tracker;
                    s.spawn(move || {
                        let first = tracker.current(|_, _| Ok::<_, ()>(())).unwrap();
                        let second = tracker.current(|_, _| Ok::<_, ()>(())).unwrap();
                        assert_eq!(first, second);
                        first
                    })
                })
                .collect::<Vec<_>>();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn trackers_do_not_share_records() {
        let a = ThreadTracker::new(Box::new(StdThreadNames));
        let b = ThreadTracker::new(Box::new(StdThreadNames));
        let mut announcements = 0;
        a.current(|_, _| {
            announcements += 1;
            Ok::<_, ()>(())
        })
        .unwrap();
        b.current(|_, _| {
            announcements += 1;
            Ok::<_, ()>(())
        })
        .unwrap();
        assert_eq!(announcements, 2);
    }

    #[test]
    fn dropped_tracker_releases_current_thread_record() {
        let before = RECORDS.with(|records| records.borrow().len());
        let tracker = ThreadTracker::new(Box::new(StdThreadNames));
        tracker.current(|_, _| Ok::<_, ()>(())).unwrap();
        assert_eq!(RECORDS.with(|records| records.borrow().len()), before + 1);

        drop(tracker);
        assert_eq!(RECORDS.with(|records| records.borrow().len()), before);
    }
}
