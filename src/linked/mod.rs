//! Unbounded queues of individually allocated nodes (Vyukov).
//!
//! The queue always holds one node more than it has elements: the consumer node is a stub
//! whose value was already taken. Producers append behind the producer node, and the
//! consumer moves the value out of the stub's successor, which then becomes the new stub.
//!
//! A producer leaves the chain broken for a moment, between installing its node as the
//! producer node and linking it from its predecessor. Only that producer can repair the link,
//! so a consumer that knows an element is coming (the producer node is not the stub) waits
//! for it. Retired stubs are self-linked and handed to `crossbeam-epoch`, which keeps them
//! alive for a concurrent `size()` walk.

use core::{cell::UnsafeCell, mem::MaybeUninit, ptr::NonNull, sync::atomic::Ordering};

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use crossbeam_utils::{Backoff, CachePadded};

use crate::util::spin;

mod mpsc;
mod spsc;

pub use mpsc::{mpsc_linked, MpscLinkedQueue};
pub use spsc::{spsc_linked, SpscLinkedQueue};

struct Node<T> {
    value: UnsafeCell<MaybeUninit<T>>,
    next: Atomic<Node<T>>,
}

unsafe impl<T: Send> Send for Node<T> {}
unsafe impl<T: Send> Sync for Node<T> {}

impl<T> Node<T> {
    fn stub() -> Self {
        Self {
            value: UnsafeCell::new(MaybeUninit::uninit()),
            next: Atomic::null(),
        }
    }

    fn with_value(value: T) -> Self {
        Self {
            value: UnsafeCell::new(MaybeUninit::new(value)),
            next: Atomic::null(),
        }
    }

    /// Allocates a node nobody else can see yet.
    fn alloc<'g>(value: T) -> Shared<'g, Node<T>> {
        // SAFETY: the node is private until linked, so no guard is needed to hold it.
        Owned::new(Node::with_value(value)).into_shared(unsafe { epoch::unprotected() })
    }

    fn wait_next<'g>(&self, guard: &'g Guard) -> Shared<'g, Node<T>> {
        let backoff = Backoff::new();
        loop {
            let next = self.next.load(Ordering::Acquire, guard);
            if !next.is_null() {
                return next;
            }
            spin(&backoff);
        }
    }
}

/// Node chain plus the two ends; `exclusive` on the producer methods picks a plain store over
/// an exchange when there is a single producer.
pub(crate) struct LinkedCore<T> {
    producer_node: CachePadded<Atomic<Node<T>>>,
    consumer_node: CachePadded<Atomic<Node<T>>>,
}

impl<T: Send> LinkedCore<T> {
    fn new() -> Self {
        let stub: *const Node<T> = Box::into_raw(Box::new(Node::stub()));
        Self {
            producer_node: CachePadded::new(Atomic::from(stub)),
            consumer_node: CachePadded::new(Atomic::from(stub)),
        }
    }

    /// Publishes the private chain `head..=tail` after the producer node.
    ///
    /// SAFETY: with `exclusive`, the caller is the only producer.
    unsafe fn push_chain<'g>(
        &self,
        head: Shared<'g, Node<T>>,
        tail: Shared<'g, Node<T>>,
        exclusive: bool,
    ) {
        // The predecessor cannot be retired before its `next` is written below, so it needs
        // no pinning.
        let guard = epoch::unprotected();
        let prev = if exclusive {
            let prev = self.producer_node.load(Ordering::Relaxed, guard);
            self.producer_node.store(tail, Ordering::Release);
            prev
        } else {
            self.producer_node.swap(tail, Ordering::AcqRel, guard)
        };
        prev.deref().next.store(head, Ordering::Release);
    }

    unsafe fn offer(&self, e: T, exclusive: bool) {
        let node = Node::alloc(e);
        self.push_chain(node, node, exclusive);
    }

    /// Links `limit` nodes privately, then publishes them with one exchange.
    unsafe fn fill(
        &self,
        mut supplier: impl FnMut() -> T,
        limit: usize,
        exclusive: bool,
    ) -> usize {
        if limit == 0 {
            return 0;
        }
        let head = Node::alloc(supplier());
        let mut tail = head;
        for _ in 1..limit {
            let node = Node::alloc(supplier());
            tail.deref().next.store(node, Ordering::Relaxed);
            tail = node;
        }
        self.push_chain(head, tail, exclusive);
        limit
    }

    /// Successor of the stub, waiting out a broken link when strict and an element is
    /// known to be coming.
    fn head<'g>(
        &self,
        strict: bool,
        guard: &'g Guard,
    ) -> Option<(Shared<'g, Node<T>>, Shared<'g, Node<T>>)> {
        let current = self.consumer_node.load(Ordering::Relaxed, guard);
        let stub = unsafe { current.deref() };
        let next = stub.next.load(Ordering::Acquire, guard);
        if !next.is_null() {
            return Some((current, next));
        }
        if !strict || self.producer_node.load(Ordering::Acquire, guard) == current {
            return None;
        }
        Some((current, stub.wait_next(guard)))
    }

    /// SAFETY: single consumer.
    unsafe fn poll(&self, strict: bool) -> Option<T> {
        let guard = &epoch::pin();
        let (current, next) = self.head(strict, guard)?;
        let value = (*next.deref().value.get()).assume_init_read();
        // Self-link: tells a concurrent `size()` that this node has been consumed.
        current.deref().next.store(current, Ordering::Release);
        self.consumer_node.store(next, Ordering::Release);
        guard.defer_destroy(current);
        Some(value)
    }

    /// SAFETY: single consumer. The pointer is valid until the next poll.
    unsafe fn peek(&self, strict: bool) -> Option<NonNull<T>> {
        let guard = &epoch::pin();
        let (_, next) = self.head(strict, guard)?;
        Some(NonNull::new_unchecked((*next.deref().value.get()).as_mut_ptr()))
    }

    /// Exact count at the moment of each step of the walk; O(n).
    fn size(&self) -> usize {
        let guard = &epoch::pin();
        let mut chaser = self.consumer_node.load(Ordering::Acquire, guard);
        let producer = self.producer_node.load(Ordering::Acquire, guard);
        let mut size = 0;
        while chaser != producer && !chaser.is_null() {
            let next = unsafe { chaser.deref() }.next.load(Ordering::Acquire, guard);
            if next == chaser {
                // Consumed while we were walking.
                break;
            }
            chaser = next;
            size += 1;
        }
        size
    }

    fn is_empty(&self) -> bool {
        // SAFETY: only the pointer values are compared.
        let guard = unsafe { epoch::unprotected() };
        self.consumer_node.load(Ordering::Acquire, guard)
            == self.producer_node.load(Ordering::Acquire, guard)
    }
}

impl<T> Drop for LinkedCore<T> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` excludes every other access. The stub holds no value, every
        // node after it holds one.
        unsafe {
            let guard = epoch::unprotected();
            let stub = self.consumer_node.load(Ordering::Relaxed, guard);
            let mut node = stub.deref().next.load(Ordering::Relaxed, guard);
            drop(stub.into_owned());
            while !node.is_null() {
                let next = node.deref().next.load(Ordering::Relaxed, guard);
                let mut owned = node.into_owned();
                owned.value.get_mut().assume_init_drop();
                node = next;
            }
        }
    }
}
