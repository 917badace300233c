use core::sync::atomic::Ordering;

use crossbeam_epoch::{Atomic, Guard, Shared};
use crossbeam_utils::Backoff;

use crate::loom_exports::sync::atomic::AtomicI64;
use crate::slot::Slot;
use crate::util::spin;

/// Chunk index of a pooled chunk that was never linked.
pub(crate) const NOT_USED: i64 = -1;

/// One segment of a fetch-and-add queue.
///
/// Pooled chunks are reused under different chunk indices over time. When consumers race
/// (MPMC), a slot of a reused chunk may still hold an element of the previous generation
/// that its consumer has claimed but not moved out yet, so pooled MPMC chunks carry one
/// sequence per slot: the chunk index the slot's current element was written for.
pub(crate) struct XaddChunk<T> {
    index: AtomicI64,
    prev: Atomic<XaddChunk<T>>,
    next: Atomic<XaddChunk<T>>,
    slots: Box<[Slot<T>]>,
    sequences: Option<Box<[AtomicI64]>>,
    pooled: bool,
}

impl<T> XaddChunk<T> {
    pub(crate) fn new(index: i64, capacity: usize, pooled: bool, sequenced: bool) -> Self {
        Self {
            index: AtomicI64::new(index),
            prev: Atomic::null(),
            next: Atomic::null(),
            slots: Slot::boxed_slice(capacity),
            sequences: (pooled && sequenced)
                .then(|| (0..capacity).map(|_| AtomicI64::new(NOT_USED)).collect()),
            pooled,
        }
    }

    #[inline(always)]
    pub(crate) fn index(&self) -> i64 {
        self.index.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_index(&self, index: i64) {
        self.index.store(index, Ordering::Release);
    }

    #[inline(always)]
    pub(crate) fn is_pooled(&self) -> bool {
        self.pooled
    }

    #[inline(always)]
    pub(crate) fn is_sequenced(&self) -> bool {
        self.sequences.is_some()
    }

    #[inline(always)]
    pub(crate) fn slot(&self, offset: usize) -> &Slot<T> {
        &self.slots[offset]
    }

    #[inline]
    pub(crate) fn prev<'g>(&self, guard: &'g Guard) -> Shared<'g, XaddChunk<T>> {
        self.prev.load(Ordering::Acquire, guard)
    }

    #[inline]
    pub(crate) fn set_prev(&self, prev: Shared<'_, XaddChunk<T>>) {
        self.prev.store(prev, Ordering::Release);
    }

    #[inline]
    pub(crate) fn next<'g>(&self, guard: &'g Guard) -> Shared<'g, XaddChunk<T>> {
        self.next.load(Ordering::Acquire, guard)
    }

    #[inline]
    pub(crate) fn set_next(&self, next: Shared<'_, XaddChunk<T>>) {
        self.next.store(next, Ordering::Release);
    }

    /// Waits for the producer appending the next chunk to link it.
    pub(crate) fn spin_for_next<'g>(&self, guard: &'g Guard) -> Shared<'g, XaddChunk<T>> {
        let backoff = Backoff::new();
        loop {
            let next = self.next(guard);
            if !next.is_null() {
                return next;
            }
            spin(&backoff);
        }
    }

    /// Sequence of a slot; `NOT_USED` on chunks without sequences.
    #[inline]
    pub(crate) fn sequence(&self, offset: usize) -> i64 {
        match &self.sequences {
            Some(sequences) => sequences[offset].load(Ordering::Acquire),
            None => NOT_USED,
        }
    }

    #[inline]
    pub(crate) fn set_sequence(&self, offset: usize, chunk_index: i64) {
        if let Some(sequences) = &self.sequences {
            sequences[offset].store(chunk_index, Ordering::Release);
        }
    }

    pub(crate) fn spin_for_sequence(&self, offset: usize, chunk_index: i64) {
        let backoff = Backoff::new();
        while self.sequence(offset) != chunk_index {
            spin(&backoff);
        }
    }
}

impl<T> Drop for XaddChunk<T> {
    fn drop(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.drop_in_place();
        }
    }
}
