//! Queues that grow by linking new backing arrays instead of copying.
//!
//! A producer that finds its chunk exhausted allocates a successor, publishes its element
//! there, links the old chunk to the new one and leaves a `JUMP` marker in the old chunk at
//! the position the element would have taken. The consumer follows the marker and frees the
//! chunk behind it: by then every producer has moved on, so that is the last access anyone
//! makes to the old chunk.

use core::{ptr, sync::atomic::Ordering};

use crossbeam_utils::Backoff;

use crate::loom_exports::sync::atomic::AtomicPtr;
use crate::slot::Slot;
use crate::util::spin;

mod mpsc;
mod spsc;

pub use mpsc::{mpsc_chunked, MpscLinkedArrayQueue};
pub use spsc::{spsc_chunked, SpscLinkedArrayQueue};

pub(crate) struct Chunk<T> {
    slots: Box<[Slot<T>]>,
    next: AtomicPtr<Chunk<T>>,
}

impl<T> Chunk<T> {
    /// Heap-allocates a chunk of `capacity` empty slots.
    pub(crate) fn alloc(capacity: usize) -> *mut Chunk<T> {
        Box::into_raw(Box::new(Chunk {
            slots: Slot::boxed_slice(capacity),
            next: AtomicPtr::new(ptr::null_mut()),
        }))
    }

    /// Frees a chunk, dropping any element still stored in it. Does not follow `next`.
    ///
    /// SAFETY: `chunk` came from [`Chunk::alloc`] and no other thread will touch it again.
    pub(crate) unsafe fn free(chunk: *mut Chunk<T>) {
        drop(Box::from_raw(chunk));
    }

    #[inline(always)]
    pub(crate) fn slot(&self, offset: usize) -> &Slot<T> {
        &self.slots[offset]
    }

    #[inline(always)]
    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub(crate) fn link(&self, next: *mut Chunk<T>) {
        self.next.store(next, Ordering::Release);
    }

    /// Successor of a chunk whose `JUMP` marker the caller has already seen.
    #[inline]
    pub(crate) fn wait_next(&self) -> *mut Chunk<T> {
        let backoff = Backoff::new();
        loop {
            let next = self.next.load(Ordering::Acquire);
            if !next.is_null() {
                return next;
            }
            spin(&backoff);
        }
    }

    /// Frees `head` and every chunk linked after it.
    ///
    /// SAFETY: as for [`Chunk::free`], for the whole chain.
    pub(crate) unsafe fn free_chain(mut head: *mut Chunk<T>) {
        while !head.is_null() {
            let next = (*head).next.load(Ordering::Relaxed);
            Chunk::free(head);
            head = next;
        }
    }
}

impl<T> Drop for Chunk<T> {
    fn drop(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.drop_in_place();
        }
    }
}
