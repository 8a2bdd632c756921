//! Per-entry locks
//!
//! Replays touching different entries run in parallel; two updates of the
//! same entry are serialised here. Keys are entryUUIDs in text form, or
//! `dn:` plus a normalised DN for a name being taken or freed.
//!
//! A key is held exclusively, or shared by any number of holders. Shared
//! holds are for parents: adding two children of one entry does not
//! conflict, deleting or moving that entry does. A [`LockSet`] is taken
//! all at once and released when the guard drops, so two callers can never
//! hold halves of each other's set.

use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeSet, HashMap};

/// Keys one operation needs
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LockSet {
    exclusive: BTreeSet<String>,
    shared: BTreeSet<String>,
}

impl LockSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exclusive(&mut self, key: impl Into<String>) {
        let key = key.into();
        self.shared.remove(&key);
        self.exclusive.insert(key);
    }

    pub fn shared(&mut self, key: impl Into<String>) {
        let key = key.into();
        if !self.exclusive.contains(&key) {
            self.shared.insert(key);
        }
    }

    /// Does holding `held` grant everything in `self`?
    pub fn is_subset(&self, held: &LockSet) -> bool {
        self.exclusive.is_subset(&held.exclusive)
            && self
                .shared
                .iter()
                .all(|k| held.shared.contains(k) || held.exclusive.contains(k))
    }

    pub fn extend(&mut self, other: LockSet) {
        for key in other.exclusive {
            self.exclusive(key);
        }
        for key in other.shared {
            self.shared(key);
        }
    }
}

#[derive(Debug)]
enum Hold {
    Exclusive,
    Shared(usize),
}

#[derive(Debug, Default)]
pub struct EntryLocks {
    held: Mutex<HashMap<String, Hold>>,
    released: Condvar,
}

impl EntryLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until every key is free, then take them all exclusively
    pub fn acquire<I, S>(&self, keys: I) -> EntryLockGuard<'_>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = LockSet::new();
        for key in keys {
            set.exclusive(key);
        }
        self.acquire_set(set)
    }

    /// Block until `keys` can be granted, then take them all at once
    pub fn acquire_set(&self, keys: LockSet) -> EntryLockGuard<'_> {
        let mut held = self.held.lock();
        while !Self::grantable(&held, &keys) {
            self.released.wait(&mut held);
        }
        for key in &keys.exclusive {
            held.insert(key.clone(), Hold::Exclusive);
        }
        for key in &keys.shared {
            if let Hold::Shared(n) = held.entry(key.clone()).or_insert(Hold::Shared(0)) {
                *n += 1;
            }
        }
        EntryLockGuard { locks: self, keys }
    }

    fn grantable(held: &HashMap<String, Hold>, keys: &LockSet) -> bool {
        keys.exclusive.iter().all(|k| !held.contains_key(k))
            && keys
                .shared
                .iter()
                .all(|k| !matches!(held.get(k), Some(Hold::Exclusive)))
    }

    pub fn is_locked(&self, key: &str) -> bool {
        self.held.lock().contains_key(key)
    }
}

#[must_use]
pub struct EntryLockGuard<'a> {
    locks: &'a EntryLocks,
    keys: LockSet,
}

impl Drop for EntryLockGuard<'_> {
    fn drop(&mut self) {
        let mut held = self.locks.held.lock();
        for key in &self.keys.exclusive {
            held.remove(key);
        }
        for key in &self.keys.shared {
            if let Some(Hold::Shared(n)) = held.get_mut(key) {
                *n -= 1;
                if *n == 0 {
                    held.remove(key);
                }
            }
        }
        self.locks.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_guard_releases() {
        let locks = EntryLocks::new();
        {
            let _guard = locks.acquire(["a", "b"]);
            assert!(locks.is_locked("a"));
            assert!(locks.is_locked("b"));
        }
        assert!(!locks.is_locked("a"));
    }

    #[test]
    fn test_overlapping_sets_serialize() {
        let locks = Arc::new(EntryLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let locks = locks.clone();
                let inside = inside.clone();
                thread::spawn(move || {
                    let keys = if i % 2 == 0 { vec!["shared", "x"] } else { vec!["y", "shared"] };
                    for _ in 0..50 {
                        let _guard = locks.acquire(keys.clone());
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
    }

    fn child_of(parent: &str, child: &str) -> LockSet {
        let mut set = LockSet::new();
        set.shared(parent);
        set.exclusive(child);
        set
    }

    #[test]
    fn test_shared_holds_coexist() {
        let locks = EntryLocks::new();
        let first = locks.acquire_set(child_of("parent", "a"));
        let second = locks.acquire_set(child_of("parent", "b"));
        assert!(locks.is_locked("parent"));

        drop(first);
        assert!(locks.is_locked("parent"), "still shared by the second holder");
        drop(second);
        assert!(!locks.is_locked("parent"));
    }

    #[test]
    fn test_exclusive_waits_for_shared() {
        let locks = Arc::new(EntryLocks::new());
        let child = locks.acquire_set(child_of("parent", "a"));

        let (tx, rx) = mpsc::channel();
        let waiter = {
            let locks = locks.clone();
            thread::spawn(move || {
                let _parent = locks.acquire(["parent"]);
                tx.send(()).unwrap();
            })
        };

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        drop(child);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        waiter.join().unwrap();
    }

    #[test]
    fn test_lock_set_subset() {
        let mut held = LockSet::new();
        held.exclusive("a");
        held.shared("p");

        assert!(child_of("p", "a").is_subset(&held));
        assert!(!child_of("a", "p").is_subset(&held), "shared does not grant exclusive");

        let mut wider = child_of("a", "b");
        assert!(!wider.is_subset(&held));
        wider.extend(held.clone());
        assert!(held.is_subset(&wider));
    }
}
