use std::{
    borrow::Borrow,
    hash::Hash,
    sync::atomic::{AtomicU32, Ordering},
};

use dashmap::{mapref::entry::Entry, DashMap};

/// Marks a key whose registration is in progress. Never handed out as an id.
pub const PLACEHOLDER: u32 = 0;

/// Assigns each distinct key a small positive id for the lifetime of the
/// table.
///
/// The first thread to see a key claims it by inserting [`PLACEHOLDER`],
/// draws a fresh id and swaps it in. Only the thread whose swap succeeds runs
/// the `announce` callback. No table lock is held while `announce` runs, so
/// the id is readable by other threads as soon as it is swapped in, possibly
/// before its announcement has been emitted. Callers that need the mapping to
/// precede every use must order that themselves.
///
/// A thread that finds the placeholder still in place also draws an id and
/// races for the swap. Its id is simply lost when the swap fails, so ids may
/// have gaps.
pub struct Interner<K>
where
    K: ?Sized + ToOwned,
    K::Owned: Eq + Hash,
{
    ids: DashMap<K::Owned, u32>,
    next_id: AtomicU32,
}

impl<K> Interner<K>
where
    K: ?Sized + ToOwned + Eq + Hash,
    K::Owned: Eq + Hash + Borrow<K>,
{
    pub fn new() -> Self {
        Interner {
            ids: DashMap::new(),
            next_id: AtomicU32::new(1),
        }
    }

    /// Returns the id of `key`, registering it first if it has never been
    /// seen. `announce` is called at most once per key, with the id that ends
    /// up in the table.
    pub fn resolve<F, E>(&self, key: &K, announce: F) -> Result<u32, E>
    where
        F: FnOnce(&K, u32) -> Result<(), E>,
    {
        // The read guard must be gone before `entry` locks the same shard.
        let known = self.ids.get(key).map(|id| *id);
        if let Some(id) = known {
            if id != PLACEHOLDER {
                return Ok(id);
            }
        }

        let previous = match self.ids.entry(key.to_owned()) {
            Entry::Occupied(entry) => Some(*entry.get()),
            Entry::Vacant(entry) => {
                entry.insert(PLACEHOLDER);
                None
            }
        };

        let mut fallback = previous.unwrap_or(PLACEHOLDER);
        if previous.map_or(true, |id| id == PLACEHOLDER) {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            fallback = id;
            let swapped = match self.ids.get_mut(key) {
                Some(mut slot) if *slot == PLACEHOLDER => {
                    *slot = id;
                    true
                }
                _ => false,
            };
            if swapped {
                announce(key, id)?;
            }
        }

        Ok(self.ids.get(key).map(|id| *id).unwrap_or(fallback))
    }

    /// Looks `key` up without registering it. A key whose registration is
    /// still in progress reads as absent.
    pub fn get(&self, key: &K) -> Option<u32> {
        self.ids
            .get(key)
            .map(|id| *id)
            .filter(|id| *id != PLACEHOLDER)
    }

    /// Number of keys registered or claimed so far.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

impl<K> Default for Interner<K>
where
    K: ?Sized + ToOwned + Eq + Hash,
    K::Owned: Eq + Hash + Borrow<K>,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        collections::HashSet,
        sync::{Barrier, Mutex},
        thread,
    };

    fn no_announce(_: &str, _: u32) -> Result<(), ()> {
        Ok(())
    }

    #[test]
    fn same_key_same_id() {
        let table: Interner<str> = Interner::new();
        let a = table.resolve("Foo.bar()V", no_announce).unwrap();
        let b = table.resolve("Foo.baz()V", no_announce).unwrap();
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_eq!(table.resolve("Foo.bar()V", no_announce).unwrap(), 1);
        assert_eq!(table.get("Foo.baz()V"), Some(2));
        assert_eq!(table.get("Foo.qux()V"), None);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn announces_once_per_key() {
        let table: Interner<str> = Interner::new();
        let mut announced = Vec::new();
        for key in ["a", "b", "a", "c", "b", "a"] {
            table
                .resolve(key, |k, id| {
                    announced.push((k.to_owned(), id));
                    Ok::<_, ()>(())
                })
                .unwrap();
        }
        assert_eq!(
            announced,
            vec![
                ("a".to_owned(), 1),
                ("b".to_owned(), 2),
                ("c".to_owned(), 3)
            ]
        );
    }

    #[test]
    fn announce_error_propagates_but_keeps_id() {
        let table: Interner<str> = Interner::new();
        let res = table.resolve("java.lang.Error", |_, _| Err("no buffer"));
        assert_eq!(res, Err("no buffer"));
        // The id is stored even though nobody heard about it.
        let mut calls = 0;
        let id = table
            .resolve("java.lang.Error", |_, _| {
                calls += 1;
                Ok::<_, &str>(())
            })
            .unwrap();
        assert_eq!(id, 1);
        assert_eq!(calls, 0);
    }

    #[test]
    fn concurrent_resolve_is_consistent() {
        let table: Interner<str> = Interner::new();
        let announced = Mutex::new(Vec::new());
        let keys: Vec<String> = (0..64).map(|i| format!("Class{i}.method()V")).collect();

        let results: Vec<Vec<(String, u32)>> = thread::scope(|s| {
            let handles = (0..8)
                .map(|_| {
                    let table = &table;
                    let announced = &announced;
                    let keys = &keys;
                    s.spawn(move || {
                        keys.iter()
                            .map(|k| {
                                let id = table
                                    .resolve(k.as_str(), |k, id| {
                                        announced.lock().unwrap().push((k.to_owned(), id));
                                        Ok::<_, ()>(())
                                    })
                                    .unwrap();
                                (k.clone(), id)
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect::<Vec<_>>();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        for (key, id) in results.iter().flatten() {
            assert_ne!(*id, PLACEHOLDER);
            assert_eq!(table.get(key.as_str()), Some(*id));
        }

        let distinct: HashSet<u32> = keys.iter().filter_map(|k| table.get(k.as_str())).collect();
        assert_eq!(distinct.len(), keys.len());

        // Every final id was announced under its own key.
        let announced = announced.into_inner().unwrap();
        for key in &keys {
            let id = table.get(key.as_str()).unwrap();
            assert!(announced.contains(&(key.clone(), id)));
        }
    }

    #[test]
    fn id_is_visible_while_announcing() {
        let table: Interner<str> = Interner::new();
        let swapped = Barrier::new(2);
        let looked_up = Barrier::new(2);
        let announcements = Mutex::new(0);

        thread::scope(|s| {
            s.spawn(|| {
                table
                    .resolve("K", |_, _| {
                        *announcements.lock().unwrap() += 1;
                        swapped.wait();
                        looked_up.wait();
                        Ok::<_, ()>(())
                    })
                    .unwrap()
            });

            swapped.wait();
            // The announcement above has not returned yet.
            let id = table
                .resolve("K", |_, _| {
                    *announcements.lock().unwrap() += 1;
                    Ok::<_, ()>(())
                })
                .unwrap();
            assert_eq!(id, 1);
            assert_eq!(table.get("K"), Some(1));
            looked_up.wait();
        });

        assert_eq!(announcements.into_inner().unwrap(), 1);
    }
}
