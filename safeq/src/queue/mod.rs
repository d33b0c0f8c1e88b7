//! Unbounded, thread-safe FIFO built on a singly-linked node chain.
//!
//! Mutations take the write lock, reads take the read lock. The number of
//! queued values is published through a [`Subject`], so other components can
//! react to the queue becoming empty or non-empty without polling.

use std::fmt;
use std::mem;
use std::ptr::NonNull;

use parking_lot::RwLock;

use crate::subject::Subject;

struct Node<T> {
    value: T,
    next: Option<Box<Node<T>>>,
}

// `back` points into the chain owned through `front`; it is None iff the chain is empty.
struct Chain<T> {
    front: Option<Box<Node<T>>>,
    back: Option<NonNull<Node<T>>>,
    len: usize,
}

// The raw back pointer never escapes the chain and is only touched under the queue lock.
unsafe impl<T: Send> Send for Chain<T> {}
unsafe impl<T: Sync> Sync for Chain<T> {}

impl<T> Chain<T> {
    fn new() -> Chain<T> {
        Chain {
            front: None,
            back: None,
            len: 0,
        }
    }

    fn push_back(&mut self, value: T) {
        let mut node = Box::new(Node { value, next: None });
        let ptr = NonNull::from(node.as_mut());
        match self.back {
            None => self.front = Some(node),
            Some(mut back) => unsafe { back.as_mut().next = Some(node) },
        }
        self.back = Some(ptr);
        self.len += 1;
    }

    fn push_front(&mut self, value: T) {
        let mut node = Box::new(Node {
            value,
            next: self.front.take(),
        });
        if self.back.is_none() {
            self.back = Some(NonNull::from(node.as_mut()));
        }
        self.front = Some(node);
        self.len += 1;
    }

    fn pop_front(&mut self) -> Option<T> {
        self.front.take().map(|node| {
            let Node { value, next } = *node;
            self.front = next;
            if self.front.is_none() {
                self.back = None;
            }
            self.len -= 1;
            value
        })
    }

    fn iter(&self) -> impl Iterator<Item = &T> {
        let mut cursor = self.front.as_deref();
        std::iter::from_fn(move || {
            let node = cursor?;
            cursor = node.next.as_deref();
            Some(&node.value)
        })
    }
}

impl<T> Drop for Chain<T> {
    fn drop(&mut self) {
        // Unlink iteratively, a recursive Box drop overflows the stack on long chains.
        let mut cursor = self.front.take();
        while let Some(mut node) = cursor {
            cursor = node.next.take();
        }
    }
}

/// Result of [`SafeQueue::dequeue_with`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Handoff {
    /// Nothing was queued.
    Empty,
    /// The front value was taken.
    Accepted,
    /// The front value was handed back and is still at the front.
    Refused,
}

pub struct SafeQueue<T> {
    chain: RwLock<Chain<T>>,
    size: Subject<usize>,
}

impl<T> SafeQueue<T>
    where T: Send + Sync,
{
    pub fn new() -> SafeQueue<T> {
        SafeQueue {
            chain: RwLock::new(Chain::new()),
            size: Subject::new(0),
        }
    }

    /// Appends at the back. Always succeeds.
    pub fn enqueue(&self, value: T) -> bool {
        let mut chain = self.chain.write();
        chain.push_back(value);
        self.size.set(chain.len);
        true
    }

    /// Enqueues every value in order and returns how many were enqueued.
    pub fn enqueue_many<I>(&self, values: I) -> usize
        where I: IntoIterator<Item = T>,
    {
        let mut count = 0;
        for value in values {
            if !self.enqueue(value) {
                break;
            }
            count += 1;
        }
        count
    }

    pub fn dequeue(&self) -> Option<T> {
        let mut chain = self.chain.write();
        let value = chain.pop_front()?;
        self.size.set(chain.len);
        Some(value)
    }

    /// Hands the front value to `f`. If `f` gives it back, the value is put back
    /// at the front and the size is not touched, so observers see no change.
    pub fn dequeue_with<F>(&self, f: F) -> Handoff
        where F: FnOnce(T) -> Result<(), T>,
    {
        let mut chain = self.chain.write();
        let value = match chain.pop_front() {
            Some(value) => value,
            None => return Handoff::Empty,
        };
        match f(value) {
            Ok(()) => {
                self.size.set(chain.len);
                Handoff::Accepted
            }
            Err(value) => {
                chain.push_front(value);
                Handoff::Refused
            }
        }
    }

    pub fn peek_with<R, F>(&self, f: F) -> Option<R>
        where F: FnOnce(&T) -> R,
    {
        let chain = self.chain.read();
        chain.front.as_deref().map(|node| f(&node.value))
    }

    pub fn is_empty(&self) -> bool {
        self.chain.read().front.is_none()
    }

    pub fn size(&self) -> usize {
        let _chain = self.chain.read();
        self.size.get()
    }

    /// Always None: the queue is unbounded.
    pub fn capacity(&self) -> Option<usize> {
        None
    }

    pub fn is_full(&self) -> bool {
        false
    }

    /// Detaches the whole chain. The detached nodes are freed after the lock is released.
    pub fn clear(&self) {
        let detached = {
            let mut chain = self.chain.write();
            if chain.front.is_none() {
                return;
            }
            let detached = mem::replace(&mut *chain, Chain::new());
            self.size.set(0);
            detached
        };
        drop(detached);
    }

    /// Registers `f` to be called with the new size after every change.
    pub fn observe_size<F>(&self, f: F)
        where F: Fn(&usize) + Send + Sync + 'static,
    {
        self.size.set_observer(f);
    }
}

impl<T> SafeQueue<T>
    where T: Clone + Send + Sync,
{
    pub fn peek(&self) -> Option<T> {
        self.peek_with(T::clone)
    }

    /// Values from front to back.
    pub fn to_vec(&self) -> Vec<T> {
        let chain = self.chain.read();
        chain.iter().cloned().collect()
    }
}

impl<T> Default for SafeQueue<T>
    where T: Send + Sync,
{
    fn default() -> Self {
        SafeQueue::new()
    }
}

/// Deep copy of the chain. The copy gets a fresh size observable with no observers.
impl<T> Clone for SafeQueue<T>
    where T: Clone + Send + Sync,
{
    fn clone(&self) -> Self {
        let chain = self.chain.read();
        let mut copy = Chain::new();
        for value in chain.iter() {
            copy.push_back(value.clone());
        }
        SafeQueue {
            size: Subject::new(copy.len),
            chain: RwLock::new(copy),
        }
    }
}

impl<T> fmt::Debug for SafeQueue<T>
    where T: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let chain = self.chain.read();
        let values: Vec<String> = chain.iter().map(|v| format!("{:?}", v)).collect();
        write!(f, "SafeQueue{{size={}, values=[← {}]}}", chain.len, values.join(", "))
    }
}
