//! Observable state.
//!
//! A [`Subject`] owns a value and a list of [`Observer`]s. Every change of the
//! value is followed by a synchronous notification of every observer attached
//! at that time, each observer running as its own task.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use parking_lot::RwLock;
use tracing::warn;

use crate::errors::panic_message;

pub trait Observer<T>: Send + Sync {
    /// Reacts to a new state. Returns false if the notification could not be
    /// delivered.
    fn notify(&self, change: &T) -> bool;
}

/// An observer backed by a closure.
pub struct ReactiveObserver<F> {
    event: F,
}

impl<F> ReactiveObserver<F> {
    pub fn new(event: F) -> ReactiveObserver<F> {
        ReactiveObserver { event }
    }
}

impl<T, F> Observer<T> for ReactiveObserver<F>
    where F: Fn(&T) + Send + Sync,
{
    fn notify(&self, change: &T) -> bool {
        (self.event)(change);
        true
    }
}

pub struct Subject<T> {
    state: RwLock<T>,
    observers: RwLock<Vec<Arc<dyn Observer<T>>>>,
}

impl<T> Subject<T>
    where T: Clone + Send + Sync,
{
    pub fn new(state: T) -> Subject<T> {
        Subject {
            state: RwLock::new(state),
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn attach(&self, observer: Arc<dyn Observer<T>>) {
        self.observers.write().push(observer);
    }

    /// Attaches a closure as an observer.
    pub fn set_observer<F>(&self, action: F)
        where F: Fn(&T) + Send + Sync + 'static,
    {
        self.attach(Arc::new(ReactiveObserver::new(action)));
    }

    pub fn observer_count(&self) -> usize {
        self.observers.read().len()
    }

    pub fn get(&self) -> T {
        self.state.read().clone()
    }

    /// Runs `f` on a snapshot of the state, outside of the lock.
    pub fn do_read<R, F>(&self, f: F) -> R
        where F: FnOnce(&T) -> R,
    {
        let value = self.get();
        f(&value)
    }

    /// Replaces the state and notifies. Returns true if every observer was notified.
    pub fn set(&self, state: T) -> bool {
        *self.state.write() = state.clone();
        self.notify_with(&state) == 0
    }

    /// Reads the state, computes `f(state)` and writes it back, then notifies.
    ///
    /// The read and the write are two separate critical sections: concurrent
    /// callers may interleave, so callers needing an atomic read-modify-write
    /// must serialize among themselves.
    pub fn modify_state<F>(&self, f: F) -> bool
        where F: FnOnce(&T) -> T,
    {
        let current = self.get();
        let next = f(&current);
        *self.state.write() = next.clone();
        self.notify_with(&next) == 0
    }

    /// Notifies every observer of the current state and waits for all of them.
    ///
    /// Returns the number of observers that failed, either by returning false
    /// or by panicking.
    pub fn notify_all(&self) -> usize {
        let state = self.get();
        self.notify_with(&state)
    }

    // Concurrent writers may have replaced the state since `state` was written;
    // observers still get the value this call produced.
    fn notify_with(&self, state: &T) -> usize {
        let observers: Vec<Arc<dyn Observer<T>>> = self.observers.read().clone();

        match observers.len() {
            0 => 0,
            // A lone observer runs on the caller's thread.
            1 => usize::from(!notify_one(observers[0].as_ref(), state)),
            _ => thread::scope(|scope| {
                let handles: Vec<_> = observers
                    .iter()
                    .map(|observer| scope.spawn(move || observer.notify(state)))
                    .collect();
                handles
                    .into_iter()
                    .map(|handle| match handle.join() {
                        Ok(delivered) => !delivered,
                        Err(payload) => {
                            warn!(panic = %panic_message(payload.as_ref()), "observer panicked");
                            true
                        }
                    })
                    .filter(|failed| *failed)
                    .count()
            }),
        }
    }

    /// A new subject with the same state and no observers. Observers must be
    /// reattached explicitly.
    pub fn copy(&self) -> Subject<T> {
        Subject::new(self.get())
    }
}

fn notify_one<T>(observer: &dyn Observer<T>, state: &T) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(|| observer.notify(state))) {
        Ok(delivered) => delivered,
        Err(payload) => {
            warn!(panic = %panic_message(payload.as_ref()), "observer panicked");
            false
        }
    }
}

impl<T> fmt::Debug for Subject<T>
    where T: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subject")
            .field("state", &*self.state.read())
            .field("observers", &self.observers.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct Refusing;

    impl Observer<i32> for Refusing {
        fn notify(&self, _: &i32) -> bool {
            false
        }
    }

    #[test]
    fn set_notifies_every_observer_with_new_state() {
        let subject = Subject::new(0);
        let seen = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..3 {
            let seen = seen.clone();
            subject.set_observer(move |v: &i32| seen.lock().unwrap().push(*v));
        }

        assert!(subject.set(7));
        assert_eq!(subject.get(), 7);
        assert_eq!(*seen.lock().unwrap(), vec![7, 7, 7]);
    }

    #[test]
    fn modify_state_applies_function_then_notifies() {
        let subject = Subject::new(10);
        let last = Arc::new(AtomicUsize::new(0));
        let observed = last.clone();
        subject.set_observer(move |v: &i32| observed.store(*v as usize, Ordering::SeqCst));

        assert!(subject.modify_state(|v| v * 3));
        assert_eq!(subject.get(), 30);
        assert_eq!(last.load(Ordering::SeqCst), 30);
    }

    #[test]
    fn notify_all_counts_failed_observers() {
        let subject = Subject::new(1);
        subject.attach(Arc::new(Refusing));
        subject.set_observer(|_: &i32| {});
        subject.set_observer(|_: &i32| panic!("observer blew up"));

        assert_eq!(subject.notify_all(), 2);
        assert!(!subject.set(2));
    }

    #[test]
    fn lone_panicking_observer_is_a_failure() {
        let subject = Subject::new(1);
        subject.set_observer(|_: &i32| panic!("observer blew up"));
        assert_eq!(subject.notify_all(), 1);
    }

    #[test]
    fn each_set_delivers_its_own_value() {
        let subject = Arc::new(Subject::new(0usize));
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            subject.set_observer(move |v: &usize| seen.lock().unwrap().push(*v));
        }

        let writers: Vec<_> = (1..=4)
            .map(|w| {
                let subject = subject.clone();
                thread::spawn(move || {
                    for i in 0..100 {
                        subject.set(w * 1000 + i);
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let mut seen = seen.lock().unwrap().clone();
        seen.sort_unstable();
        let mut expected: Vec<usize> = (1..=4).flat_map(|w| (0..100).map(move |i| w * 1000 + i)).collect();
        expected.sort_unstable();
        assert_eq!(seen, expected);
    }

    #[test]
    fn no_observers_means_no_failures() {
        let subject = Subject::new("idle");
        assert_eq!(subject.notify_all(), 0);
        assert!(subject.set("busy"));
    }

    #[test]
    fn copy_keeps_state_but_drops_observers() {
        let subject = Subject::new(5);
        subject.set_observer(|_: &i32| {});
        let copy = subject.copy();

        assert_eq!(copy.get(), 5);
        assert_eq!(copy.observer_count(), 0);
        assert_eq!(subject.observer_count(), 1);
    }

    #[test]
    fn do_read_sees_current_state() {
        let subject = Subject::new(vec![1, 2, 3]);
        assert_eq!(subject.do_read(|v| v.len()), 3);
    }
}
