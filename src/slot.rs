use core::{mem::MaybeUninit, ptr::NonNull, sync::atomic::Ordering};

use crossbeam_utils::Backoff;

use crate::loom_exports::cell::UnsafeCell;
use crate::loom_exports::sync::atomic::{AtomicU64, AtomicU8};
use crate::util::spin;

/// Nothing stored; a producer may write.
pub(crate) const EMPTY: u8 = 0;
/// An element is published and may be consumed.
pub(crate) const FULL: u8 = 1;
/// No element; the consumer must follow the chunk's `next` link.
pub(crate) const JUMP: u8 = 2;

/// An element cell guarded by a state byte.
///
/// The state byte stands in for the null-or-element check of a reference array: the value
/// is written first and the state is then release-stored, so an acquire load observing
/// `FULL` also observes the value.
pub(crate) struct Slot<T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Slot<T> {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    pub(crate) fn boxed_slice(len: usize) -> Box<[Slot<T>]> {
        (0..len).map(|_| Slot::new()).collect()
    }

    #[inline(always)]
    pub(crate) fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub(crate) fn is_empty(&self) -> bool {
        self.state() == EMPTY
    }

    /// Writes `value` and marks the slot `FULL`.
    ///
    /// SAFETY: the caller has exclusive write access to this slot (it claimed the index) and
    /// the slot is `EMPTY`.
    #[inline(always)]
    pub(crate) unsafe fn publish(&self, value: T) {
        self.value.with_mut(|cell| (*cell).write(value));
        self.state.store(FULL, Ordering::Release);
    }

    /// Marks the slot as a link to the next chunk.
    #[inline(always)]
    pub(crate) fn publish_jump(&self) {
        self.state.store(JUMP, Ordering::Release);
    }

    /// Moves the value out and marks the slot `EMPTY`.
    ///
    /// SAFETY: the caller has observed `FULL` and holds the exclusive right to consume it.
    #[inline(always)]
    pub(crate) unsafe fn take(&self) -> T {
        let value = self.value.with_mut(|cell| (*cell).assume_init_read());
        self.state.store(EMPTY, Ordering::Release);
        value
    }

    /// SAFETY: same as [`Slot::take`]; the pointer is valid until the slot is consumed.
    #[inline(always)]
    pub(crate) unsafe fn value_ptr(&self) -> NonNull<T> {
        self.value
            .with_mut(|cell| NonNull::new_unchecked((*cell).as_mut_ptr()))
    }

    /// Copies the raw bytes of the value without asserting it is initialized.
    ///
    /// This is the read side of a seqlock: the copy may race a producer writing the next lap,
    /// which the Rust memory model counts as a data race even for `Copy` data. Callers must
    /// validate the copy against an index read after an acquire fence and discard it when the
    /// element was claimed in between; a torn copy is never returned.
    #[inline(always)]
    pub(crate) fn read_volatile(&self) -> MaybeUninit<T>
    where
        T: Copy,
    {
        self.value.with(|cell| unsafe { core::ptr::read_volatile(cell) })
    }

    /// Clears a `JUMP` (or consumed) marker.
    #[inline(always)]
    pub(crate) fn clear(&self) {
        self.state.store(EMPTY, Ordering::Release);
    }

    /// Spins while the slot is `EMPTY` and returns the state that ended the wait.
    #[inline]
    pub(crate) fn spin_until_published(&self) -> u8 {
        let backoff = Backoff::new();
        loop {
            let state = self.state();
            if state != EMPTY {
                return state;
            }
            spin(&backoff);
        }
    }

    /// Spins until a slow consumer has evacuated the slot.
    #[inline]
    pub(crate) fn spin_until_empty(&self) {
        let backoff = Backoff::new();
        while !self.is_empty() {
            spin(&backoff);
        }
    }

    /// Drops a value still stored in the slot. Only used while tearing the queue down.
    pub(crate) fn drop_in_place(&mut self) {
        if self.state.load(Ordering::Relaxed) == FULL {
            self.state.store(EMPTY, Ordering::Relaxed);
            self.value.with_mut(|cell| unsafe { (*cell).assume_init_drop() });
        }
    }
}

/// An element cell whose readiness is tracked by a lap sequence number (Vyukov).
///
/// For index `i`, sequence `i` means writable by the producer claiming `i`, `i + 1` means
/// readable by the consumer claiming `i`, and `i + capacity` hands it to the next lap.
pub(crate) struct SeqSlot<T> {
    sequence: AtomicU64,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> SeqSlot<T> {
    pub(crate) fn new(sequence: u64) -> Self {
        Self {
            sequence: AtomicU64::new(sequence),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    #[inline(always)]
    pub(crate) fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub(crate) fn set_sequence(&self, sequence: u64) {
        self.sequence.store(sequence, Ordering::Release);
    }

    /// SAFETY: the caller won the producer index CAS for this slot's lap.
    #[inline(always)]
    pub(crate) unsafe fn write(&self, value: T) {
        self.value.with_mut(|cell| (*cell).write(value));
    }

    /// SAFETY: the caller won the consumer index CAS for this slot's lap.
    #[inline(always)]
    pub(crate) unsafe fn read(&self) -> T {
        self.value.with_mut(|cell| (*cell).assume_init_read())
    }

    /// Seqlock read; see [`Slot::read_volatile`]. Valid only if the sequence still matches
    /// after the copy.
    #[inline(always)]
    pub(crate) fn read_volatile(&self) -> MaybeUninit<T>
    where
        T: Copy,
    {
        self.value.with(|cell| unsafe { core::ptr::read_volatile(cell) })
    }

    /// SAFETY: the slot holds an initialized value nobody else will read.
    pub(crate) unsafe fn drop_in_place(&mut self) {
        self.value.with_mut(|cell| (*cell).assume_init_drop());
    }
}

unsafe impl<T: Send> Send for Slot<T> {}
unsafe impl<T: Send> Sync for Slot<T> {}
unsafe impl<T: Send> Send for SeqSlot<T> {}
unsafe impl<T: Send> Sync for SeqSlot<T> {}

#[cfg(all(test, not(loom)))]
mod test {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_publish_take() {
        let slot = Slot::new();
        assert!(slot.is_empty());

        unsafe { slot.publish(String::from("a")) };
        assert_eq!(slot.state(), FULL);
        assert_eq!(unsafe { slot.take() }, "a");
        assert!(slot.is_empty());

        slot.publish_jump();
        assert_eq!(slot.spin_until_published(), JUMP);
        slot.clear();
        assert!(slot.is_empty());
    }

    #[test]
    fn test_drop_in_place() {
        let marker = Arc::new(());
        let mut slot = Slot::new();
        unsafe { slot.publish(marker.clone()) };
        assert_eq!(Arc::strong_count(&marker), 2);
        slot.drop_in_place();
        assert_eq!(Arc::strong_count(&marker), 1);
        // A second call is a no-op on an empty slot.
        slot.drop_in_place();
        assert_eq!(Arc::strong_count(&marker), 1);
    }
}
