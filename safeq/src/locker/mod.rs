//! A group of named boolean predicates sharing one condition variable.
//!
//! All predicates true is the quiescent state. [`Locker::do_func`] blocks
//! until at least one predicate is false, which is how a worker learns that
//! something needs its attention.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::trace;

use crate::subject::Subject;

#[derive(Default)]
struct Wake {
    lock: Mutex<()>,
    cond: Condvar,
}

pub struct Locker<K> {
    wake: Arc<Wake>,
    subjects: RwLock<HashMap<K, Arc<Subject<bool>>>>,
}

impl<K> Locker<K>
    where K: Eq + Hash + Copy + Debug + Send + Sync + 'static,
{
    pub fn new() -> Locker<K> {
        Locker {
            wake: Arc::new(Wake::default()),
            subjects: RwLock::new(HashMap::new()),
        }
    }

    /// Registers (or replaces) the predicate `key` with an initial value.
    ///
    /// Every change of the predicate wakes the waiters of [`Locker::do_func`]:
    /// all of them if `broadcast` is set, one of them otherwise.
    pub fn set_subject(&self, key: K, value: bool, broadcast: bool) {
        let subject = Subject::new(value);
        let wake = self.wake.clone();
        subject.set_observer(move |value: &bool| {
            let _guard = wake.lock.lock();
            trace!(?key, value, broadcast, "predicate changed");
            if broadcast {
                wake.cond.notify_all();
            } else {
                wake.cond.notify_one();
            }
        });
        self.subjects.write().insert(key, Arc::new(subject));
    }

    /// Returns false if `key` was never registered.
    pub fn change_value(&self, key: K, value: bool) -> bool {
        let subject = self.subjects.read().get(&key).cloned();
        match subject {
            Some(subject) => {
                subject.set(value);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, key: K) -> Option<bool> {
        let subject = self.subjects.read().get(&key).cloned();
        subject.map(|s| s.get())
    }

    /// Waits until at least one predicate is false, then calls `f` with a
    /// snapshot of every predicate and returns its result.
    ///
    /// `f` runs without any locker lock held. A locker with no predicates
    /// never wakes up.
    pub fn do_func<F>(&self, f: F) -> bool
        where F: FnOnce(&HashMap<K, bool>) -> bool,
    {
        let mut guard = self.wake.lock.lock();
        let snapshot = loop {
            let (snapshot, has_false) = self.has_false();
            if has_false {
                break snapshot;
            }
            self.wake.cond.wait(&mut guard);
        };
        drop(guard);
        f(&snapshot)
    }

    fn has_false(&self) -> (HashMap<K, bool>, bool) {
        let snapshot: HashMap<K, bool> = self
            .subjects
            .read()
            .iter()
            .map(|(key, subject)| (*key, subject.get()))
            .collect();
        let has_false = snapshot.values().any(|value| !value);
        (snapshot, has_false)
    }
}

impl<K> Default for Locker<K>
    where K: Eq + Hash + Copy + Debug + Send + Sync + 'static,
{
    fn default() -> Self {
        Locker::new()
    }
}
