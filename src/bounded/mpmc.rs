use core::sync::atomic::Ordering;

use crossbeam_utils::{Backoff, CachePadded};

use crate::error::{Error, Result};
use crate::handle::{Producer, SharedConsumer};
use crate::loom_exports::sync::{
    atomic::{fence, AtomicU64},
    Arc,
};
use crate::queue::{MultiConsumer, MultiProducer, RawQueue};
use crate::slot::SeqSlot;
use crate::util::{self, circular_offset, index_distance, round_to_power_of_two, spin, IndexedQueue};

const MIN_CAPACITY: usize = 2;

/// Bounded multi-producer multi-consumer ring after Dmitry Vyukov's design.
///
/// Each slot carries a sequence number telling which lap and which side may use it next, so
/// both producers and consumers can decide locally whether their claimed index is ready.
/// Capacity must be at least 2: with a single slot the "written" sequence of one lap equals
/// the "writable" sequence of the next.
pub struct MpmcArrayQueue<T> {
    producer_index: CachePadded<AtomicU64>,
    consumer_index: CachePadded<AtomicU64>,
    buffer: Box<[SeqSlot<T>]>,
    mask: u64,
}

/// Creates a bounded MPMC queue holding at least `capacity` elements (rounded up to a power
/// of two). Fails for capacities below 2.
pub fn mpmc<T: Send>(
    capacity: usize,
) -> Result<(Producer<MpmcArrayQueue<T>>, SharedConsumer<MpmcArrayQueue<T>>)> {
    let queue = Arc::new(MpmcArrayQueue::with_capacity(capacity)?);
    Ok((Producer::new(queue.clone()), SharedConsumer::new(queue)))
}

impl<T> MpmcArrayQueue<T> {
    fn with_capacity(capacity: usize) -> Result<Self> {
        if capacity < MIN_CAPACITY {
            return Err(Error::InvalidCapacity {
                requested: capacity,
                minimum: MIN_CAPACITY,
            });
        }
        let capacity = round_to_power_of_two(capacity)?;
        tracing::trace!(capacity, "mpmc array queue created");

        Ok(Self {
            producer_index: CachePadded::new(AtomicU64::new(0)),
            consumer_index: CachePadded::new(AtomicU64::new(0)),
            buffer: (0..capacity as u64).map(SeqSlot::new).collect(),
            mask: capacity as u64 - 1,
        })
    }

    #[inline(always)]
    fn slot(&self, index: u64) -> &SeqSlot<T> {
        &self.buffer[circular_offset(index, self.mask)]
    }

    #[inline(always)]
    fn capacity_u64(&self) -> u64 {
        self.mask + 1
    }

    /// Claims one producer index. With `strict` unset, gives up as soon as the slot still
    /// belongs to the previous lap instead of checking the consumer index.
    fn claim_producer(&self, strict: bool) -> Option<u64> {
        let capacity = self.capacity_u64() as i64;
        let mut consumer_index_cache = 0;
        let backoff = Backoff::new();
        loop {
            let index = self.producer_index.load(Ordering::Acquire);
            let diff = index_distance(index, self.slot(index).sequence());
            if diff < 0 {
                // The slot still holds the element of `index - capacity`.
                if !strict {
                    return None;
                }
                if index_distance(consumer_index_cache, index) >= capacity {
                    consumer_index_cache = self.consumer_index.load(Ordering::Acquire);
                    if index_distance(consumer_index_cache, index) >= capacity {
                        return None;
                    }
                }
                // A consumer claimed it and is about to release it.
            } else if diff == 0
                && self
                    .producer_index
                    .compare_exchange_weak(index, index + 1, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            {
                return Some(index);
            }
            spin(&backoff);
        }
    }

    /// Claims one consumer index; see [`Self::claim_producer`] for `strict`.
    fn claim_consumer(&self, strict: bool) -> Option<u64> {
        let mut producer_index_cache = 0;
        let backoff = Backoff::new();
        loop {
            let index = self.consumer_index.load(Ordering::Acquire);
            let diff = index_distance(index + 1, self.slot(index).sequence());
            if diff < 0 {
                // Not written for this lap yet.
                if !strict {
                    return None;
                }
                if index_distance(index, producer_index_cache) <= 0 {
                    producer_index_cache = self.producer_index.load(Ordering::Acquire);
                    if producer_index_cache == index {
                        return None;
                    }
                }
                // A producer claimed it and is about to publish.
            } else if diff == 0
                && self
                    .consumer_index
                    .compare_exchange_weak(index, index + 1, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            {
                return Some(index);
            }
            spin(&backoff);
        }
    }

    /// SAFETY: `index` was claimed by [`Self::claim_producer`].
    #[inline(always)]
    unsafe fn write(&self, index: u64, e: T) {
        let slot = self.slot(index);
        slot.write(e);
        slot.set_sequence(index + 1);
    }

    /// SAFETY: `index` was claimed by [`Self::claim_consumer`].
    #[inline(always)]
    unsafe fn read(&self, index: u64) -> T {
        let slot = self.slot(index);
        let e = slot.read();
        slot.set_sequence(index + self.capacity_u64());
        e
    }

    fn peek_copy(&self, strict: bool) -> Option<T>
    where
        T: Copy,
    {
        let backoff = Backoff::new();
        loop {
            let index = self.consumer_index.load(Ordering::Acquire);
            let slot = self.slot(index);
            let diff = index_distance(index + 1, slot.sequence());
            if diff < 0 {
                if !strict || self.producer_index.load(Ordering::Acquire) == index {
                    return None;
                }
            } else if diff == 0 {
                // Seqlock read; a copy racing a later write is discarded below.
                let value = slot.read_volatile();
                fence(Ordering::Acquire);
                if self.consumer_index.load(Ordering::Relaxed) == index {
                    // SAFETY: the sequence said written and nobody claimed `index` while we
                    // copied it.
                    return Some(unsafe { value.assume_init() });
                }
            }
            spin(&backoff);
        }
    }
}

impl<T> IndexedQueue for MpmcArrayQueue<T> {
    fn lv_producer_index(&self) -> u64 {
        self.producer_index.load(Ordering::Acquire)
    }

    fn lv_consumer_index(&self) -> u64 {
        self.consumer_index.load(Ordering::Acquire)
    }

    fn capacity(&self) -> usize {
        self.buffer.len()
    }
}

unsafe impl<T: Send> RawQueue for MpmcArrayQueue<T> {
    type Item = T;

    fn capacity(&self) -> usize {
        self.buffer.len()
    }

    fn size(&self) -> usize {
        util::size(self, 0)
    }

    fn is_empty(&self) -> bool {
        util::is_empty(self, 0)
    }

    unsafe fn offer(&self, e: T) -> core::result::Result<(), T> {
        match self.claim_producer(true) {
            Some(index) => {
                self.write(index, e);
                Ok(())
            }
            None => Err(e),
        }
    }

    unsafe fn relaxed_offer(&self, e: T) -> core::result::Result<(), T> {
        match self.claim_producer(false) {
            Some(index) => {
                self.write(index, e);
                Ok(())
            }
            None => Err(e),
        }
    }

    unsafe fn fill<F>(&self, mut supplier: F, limit: usize) -> usize
    where
        F: FnMut() -> T,
    {
        for i in 0..limit {
            match self.claim_producer(false) {
                Some(index) => self.write(index, supplier()),
                None => return i,
            }
        }
        limit
    }

    unsafe fn poll(&self) -> Option<T> {
        let index = self.claim_consumer(true)?;
        Some(self.read(index))
    }

    unsafe fn relaxed_poll(&self) -> Option<T> {
        let index = self.claim_consumer(false)?;
        Some(self.read(index))
    }
}

unsafe impl<T: Send> MultiProducer for MpmcArrayQueue<T> {}

unsafe impl<T: Send> MultiConsumer for MpmcArrayQueue<T> {
    fn peek(&self) -> Option<T>
    where
        T: Copy,
    {
        self.peek_copy(true)
    }

    fn relaxed_peek(&self) -> Option<T>
    where
        T: Copy,
    {
        self.peek_copy(false)
    }
}

impl<T> Drop for MpmcArrayQueue<T> {
    fn drop(&mut self) {
        let producer_index = self.producer_index.load(Ordering::Relaxed);
        let mut index = self.consumer_index.load(Ordering::Relaxed);
        let mask = self.mask;
        while index != producer_index {
            // SAFETY: every claimed index was written before its producer returned, and
            // `&mut self` rules out anyone still running.
            unsafe { self.buffer[circular_offset(index, mask)].drop_in_place() };
            index += 1;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[cfg(not(loom))]
    #[test]
    fn test_capacity_validation() {
        assert_eq!(
            mpmc::<u8>(1).err(),
            Some(Error::InvalidCapacity { requested: 1, minimum: 2 })
        );
        assert!(mpmc::<u8>(0).is_err());
        let (tx, _rx) = mpmc::<u8>(3).unwrap();
        assert_eq!(tx.capacity(), 4);
    }

    #[cfg(not(loom))]
    #[test]
    fn test_two_slot_scenario() {
        let (tx, rx) = mpmc(2).unwrap();
        assert_eq!(tx.offer(1), Ok(()));
        assert_eq!(tx.offer(2), Ok(()));
        assert_eq!(tx.offer(3), Err(3));
        assert_eq!(rx.poll(), Some(1));
        assert_eq!(rx.poll(), Some(2));
        assert_eq!(rx.poll(), None);
    }

    #[cfg(not(loom))]
    #[test]
    fn test_drain_with_waits_for_producer() {
        const COUNT: usize = 10_000;
        let (tx, rx) = mpmc(16).unwrap();
        let producer = std::thread::spawn(move || {
            for i in 0..COUNT {
                let mut e = i;
                while let Err(back) = tx.offer(e) {
                    e = back;
                    std::hint::spin_loop();
                }
            }
        });

        let received = std::cell::RefCell::new(Vec::new());
        rx.drain_with(
            |e| received.borrow_mut().push(e),
            crate::queue::BackoffWait::new(),
            || received.borrow().len() < COUNT,
        );
        producer.join().unwrap();
        assert_eq!(received.into_inner(), (0..COUNT).collect::<Vec<_>>());
        assert_eq!(rx.poll(), None);
    }

    #[cfg(not(loom))]
    #[test]
    fn test_relaxed_ops_and_peek() {
        let (tx, rx) = mpmc(4).unwrap();
        assert_eq!(rx.relaxed_poll(), None);
        assert_eq!(rx.relaxed_peek(), None);
        assert_eq!(rx.peek(), None);

        for i in 0..4 {
            tx.relaxed_offer(i).unwrap();
        }
        assert_eq!(tx.relaxed_offer(4), Err(4));
        assert_eq!(rx.peek(), Some(0));
        assert_eq!(rx.relaxed_peek(), Some(0));
        assert_eq!(rx.size(), 4);
        assert_eq!(rx.relaxed_poll(), Some(0));
        assert_eq!(rx.peek(), Some(1));
    }

    #[cfg(not(loom))]
    #[test]
    fn test_fill_and_drain_across_laps() {
        let (tx, rx) = mpmc(8).unwrap();
        let mut next = 0u32;
        let mut expected = 0u32;
        for _ in 0..50 {
            let filled = tx.fill(|| { next += 1; next }, 5);
            assert!(filled > 0);
            rx.drain(
                |e| {
                    expected += 1;
                    assert_eq!(e, expected);
                },
                3,
            );
        }
        rx.drain_all(|e| {
            expected += 1;
            assert_eq!(e, expected);
        });
        assert_eq!(expected, next);
        assert!(rx.is_empty());
    }

    #[cfg(not(loom))]
    #[test]
    fn test_drops_remaining_elements() {
        let marker = std::sync::Arc::new(());
        {
            let (tx, rx) = mpmc(4).unwrap();
            for _ in 0..4 {
                tx.offer(marker.clone()).unwrap();
            }
            drop(rx.poll());
            tx.offer(marker.clone()).unwrap();
            assert_eq!(std::sync::Arc::strong_count(&marker), 5);
        }
        assert_eq!(std::sync::Arc::strong_count(&marker), 1);
    }

    #[cfg(not(loom))]
    #[test]
    fn test_threaded_no_loss_no_duplicates() {
        use std::sync::atomic::{AtomicBool, AtomicUsize};

        const PRODUCERS: usize = 3;
        const CONSUMERS: usize = 3;
        const PER_PRODUCER: usize = 30_000;
        const TOTAL: usize = PRODUCERS * PER_PRODUCER;
        let (tx, rx) = mpmc(64).unwrap();
        let seen: std::sync::Arc<Vec<AtomicBool>> =
            std::sync::Arc::new((0..TOTAL).map(|_| AtomicBool::new(false)).collect());
        let received = std::sync::Arc::new(AtomicUsize::new(0));

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let tx = tx.clone();
                std::thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        let mut e = p * PER_PRODUCER + i;
                        while let Err(back) = tx.offer(e) {
                            e = back;
                            std::hint::spin_loop();
                        }
                    }
                })
            })
            .collect();
        let consumers: Vec<_> = (0..CONSUMERS)
            .map(|_| {
                let rx = rx.clone();
                let seen = seen.clone();
                let received = received.clone();
                std::thread::spawn(move || {
                    while received.load(Ordering::Relaxed) < TOTAL {
                        if let Some(e) = rx.poll() {
                            assert!(!seen[e].swap(true, Ordering::Relaxed), "duplicate {}", e);
                            received.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                })
            })
            .collect();

        for handle in producers.into_iter().chain(consumers) {
            handle.join().unwrap();
        }
        assert!(seen.iter().all(|s| s.load(Ordering::Relaxed)));
        assert_eq!(rx.poll(), None);
    }

    #[cfg(loom)]
    #[test]
    fn test_mpmc_loom() {
        loom::model(|| {
            let (tx, rx) = mpmc(2).unwrap();

            let producer = {
                let tx = tx.clone();
                loom::thread::spawn(move || {
                    while tx.offer(1).is_err() {
                        loom::thread::yield_now();
                    }
                })
            };
            let consumer = {
                let rx = rx.clone();
                loom::thread::spawn(move || rx.poll())
            };

            while tx.offer(2).is_err() {
                loom::thread::yield_now();
            }
            producer.join().unwrap();
            let mut total = consumer.join().unwrap().unwrap_or(0);
            while let Some(e) = rx.poll() {
                total += e;
            }
            assert_eq!(total, 3);
        });
    }
}
