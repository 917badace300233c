use core::{ptr::NonNull, sync::atomic::Ordering};

use crossbeam_utils::{Backoff, CachePadded};

use crate::error::Result;
use crate::handle::{Consumer, Producer};
use crate::loom_exports::sync::{atomic::AtomicU64, Arc};
use crate::queue::{MultiProducer, RawQueue, SingleConsumer};
use crate::slot::{Slot, FULL};
use crate::util::{self, circular_offset, IndexedQueue};

use super::ring_capacity;

/// Producer-shared state. `limit` caches `consumer_index + capacity` so producers only go to
/// the real consumer index when the cache says the ring might be full.
struct ProducerState {
    index: AtomicU64,
    limit: AtomicU64,
}

/// Bounded multi-producer single-consumer ring.
///
/// Producers CAS the producer index to claim a slot and then publish into it, so the index
/// runs ahead of the published elements. A consumer finding an empty slot below the producer
/// index is looking at an in-flight write and waits for it rather than reporting empty.
pub struct MpscArrayQueue<T> {
    producer: CachePadded<ProducerState>,
    consumer_index: CachePadded<AtomicU64>,
    buffer: Box<[Slot<T>]>,
    mask: u64,
}

/// Creates a bounded MPSC queue holding at least `capacity` elements (rounded up to a power
/// of two, minimum 2).
pub fn mpsc<T: Send>(
    capacity: usize,
) -> Result<(Producer<MpscArrayQueue<T>>, Consumer<MpscArrayQueue<T>>)> {
    let queue = Arc::new(MpscArrayQueue::with_capacity(capacity)?);
    Ok((Producer::new(queue.clone()), Consumer::new(queue)))
}

impl<T> MpscArrayQueue<T> {
    pub(crate) fn with_capacity(capacity: usize) -> Result<Self> {
        let capacity = ring_capacity(capacity)?;
        tracing::trace!(capacity, "mpsc array queue created");

        Ok(Self {
            producer: CachePadded::new(ProducerState {
                index: AtomicU64::new(0),
                limit: AtomicU64::new(capacity as u64),
            }),
            consumer_index: CachePadded::new(AtomicU64::new(0)),
            buffer: Slot::boxed_slice(capacity),
            mask: capacity as u64 - 1,
        })
    }

    #[inline(always)]
    fn slot(&self, index: u64) -> &Slot<T> {
        &self.buffer[circular_offset(index, self.mask)]
    }

    /// Claims up to `wanted` consecutive indices, returning the first one and how many were
    /// claimed, or `None` when the ring is full (or the size is at `threshold`).
    fn claim(&self, wanted: u64, threshold: u64) -> Option<(u64, u64)> {
        let capacity = self.mask + 1;
        let mut limit = self.producer.limit.load(Ordering::Acquire);
        let backoff = Backoff::new();
        loop {
            let index = self.producer.index.load(Ordering::Acquire);
            let mut available = limit.saturating_sub(index);
            if available == 0 || capacity.saturating_sub(available) >= threshold {
                let consumer_index = self.consumer_index.load(Ordering::Acquire);
                limit = consumer_index + capacity;
                available = limit.saturating_sub(index);
                if available == 0 || capacity.saturating_sub(available) >= threshold {
                    return None;
                }
                self.producer.limit.store(limit, Ordering::Release);
            }

            let claimed = available.min(wanted);
            match self.producer.index.compare_exchange_weak(
                index,
                index + claimed,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some((index, claimed)),
                Err(_) => backoff.spin(),
            }
            #[cfg(loom)]
            loom::hint::spin_loop();
        }
    }

    fn offer_if_below_threshold(&self, e: T, threshold: usize) -> core::result::Result<(), T> {
        match self.claim(1, threshold as u64) {
            Some((index, _)) => {
                unsafe { self.slot(index).publish(e) };
                Ok(())
            }
            None => Err(e),
        }
    }

    /// Index and slot of the next element, waiting out an in-flight producer if the index
    /// says an element exists. `None` iff empty.
    #[inline]
    fn head_slot(&self, index: u64) -> Option<&Slot<T>> {
        let slot = self.slot(index);
        if slot.state() != FULL {
            if index == self.producer.index.load(Ordering::Acquire) {
                return None;
            }
            slot.spin_until_published();
        }
        Some(slot)
    }
}

impl<T: Send> Producer<MpscArrayQueue<T>> {
    /// Offers `e` only if fewer than `threshold` elements appear to be queued.
    ///
    /// Useful as back-pressure: producers can keep part of the ring free for more urgent
    /// traffic without a second queue.
    pub fn offer_if_below_threshold(&self, e: T, threshold: usize) -> core::result::Result<(), T> {
        self.queue().offer_if_below_threshold(e, threshold)
    }
}

impl<T> IndexedQueue for MpscArrayQueue<T> {
    fn lv_producer_index(&self) -> u64 {
        self.producer.index.load(Ordering::Acquire)
    }

    fn lv_consumer_index(&self) -> u64 {
        self.consumer_index.load(Ordering::Acquire)
    }

    fn capacity(&self) -> usize {
        self.buffer.len()
    }
}

unsafe impl<T: Send> RawQueue for MpscArrayQueue<T> {
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
        match self.claim(1, u64::MAX) {
            Some((index, _)) => {
                // Index visible before element; the consumer spins over the gap.
                self.slot(index).publish(e);
                Ok(())
            }
            None => Err(e),
        }
    }

    unsafe fn fill<F>(&self, mut supplier: F, limit: usize) -> usize
    where
        F: FnMut() -> T,
    {
        let Some((index, claimed)) = self.claim(limit as u64, u64::MAX) else {
            return 0;
        };
        for i in 0..claimed {
            self.slot(index + i).publish(supplier());
        }
        claimed as usize
    }

    unsafe fn poll(&self) -> Option<T> {
        let index = self.consumer_index.load(Ordering::Relaxed);
        let e = self.head_slot(index)?.take();
        self.consumer_index.store(index + 1, Ordering::Release);
        Some(e)
    }

    unsafe fn relaxed_poll(&self) -> Option<T> {
        let index = self.consumer_index.load(Ordering::Relaxed);
        let slot = self.slot(index);
        if slot.state() != FULL {
            return None;
        }
        let e = slot.take();
        self.consumer_index.store(index + 1, Ordering::Release);
        Some(e)
    }

    unsafe fn drain<F>(&self, mut consumer: F, limit: usize) -> usize
    where
        F: FnMut(T),
    {
        let mut index = self.consumer_index.load(Ordering::Relaxed);
        for i in 0..limit {
            let slot = self.slot(index);
            if slot.state() != FULL {
                return i;
            }
            let e = slot.take();
            index += 1;
            self.consumer_index.store(index, Ordering::Release);
            consumer(e);
        }
        limit
    }
}

unsafe impl<T: Send> MultiProducer for MpscArrayQueue<T> {}

unsafe impl<T: Send> SingleConsumer for MpscArrayQueue<T> {
    unsafe fn peek(&self) -> Option<NonNull<T>> {
        let index = self.consumer_index.load(Ordering::Relaxed);
        Some(self.head_slot(index)?.value_ptr())
    }

    unsafe fn relaxed_peek(&self) -> Option<NonNull<T>> {
        let slot = self.slot(self.consumer_index.load(Ordering::Relaxed));
        if slot.state() != FULL {
            return None;
        }
        Some(slot.value_ptr())
    }
}

impl<T> Drop for MpscArrayQueue<T> {
    fn drop(&mut self) {
        for slot in self.buffer.iter_mut() {
            slot.drop_in_place();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[cfg(not(loom))]
    #[test]
    fn test_capacity_rounding() {
        assert!(mpsc::<u32>(0).is_err());
        let (tx, _rx) = mpsc::<u32>(1).unwrap();
        assert_eq!(tx.capacity(), 2);
        let (tx, _rx) = mpsc::<u32>(100).unwrap();
        assert_eq!(tx.capacity(), 128);
    }

    #[cfg(not(loom))]
    #[test]
    fn test_full_and_empty() {
        let (tx, mut rx) = mpsc(4).unwrap();
        assert_eq!(rx.poll(), None);
        for i in 0..4 {
            tx.offer(i).unwrap();
        }
        assert_eq!(tx.offer(4), Err(4));
        assert_eq!(rx.peek(), Some(&0));
        assert_eq!(rx.poll(), Some(0));
        // The cached limit is stale now; the producer must refresh it.
        tx.offer(4).unwrap();
        let mut out = Vec::new();
        assert_eq!(rx.drain_all(|e| out.push(e)), 4);
        assert_eq!(out, [1, 2, 3, 4]);
        assert!(rx.is_empty());
    }

    #[cfg(not(loom))]
    #[test]
    fn test_offer_if_below_threshold() {
        let (tx, rx) = mpsc(8).unwrap();
        for i in 0..3 {
            tx.offer_if_below_threshold(i, 3).unwrap();
        }
        assert_eq!(tx.offer_if_below_threshold(3, 3), Err(3));
        assert_eq!(rx.poll(), Some(0));
        tx.offer_if_below_threshold(3, 3).unwrap();
        assert_eq!(rx.size(), 3);
    }

    #[cfg(not(loom))]
    #[test]
    fn test_fill_claims_only_free_slots() {
        let (tx, rx) = mpsc(8).unwrap();
        tx.offer(0).unwrap();
        let mut next = 1;
        assert_eq!(tx.fill(|| { let e = next; next += 1; e }, 100), 7);
        assert_eq!(tx.fill(|| unreachable!(), 1), 0);

        let mut out = Vec::new();
        rx.drain(|e| out.push(e), 100);
        assert_eq!(out, (0..8).collect::<Vec<_>>());
    }

    #[cfg(not(loom))]
    #[test]
    fn test_threaded_no_loss_no_duplicates() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 25_000;
        let (tx, rx) = mpsc(128).unwrap();

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

        let mut seen = vec![false; PRODUCERS * PER_PRODUCER];
        let mut last_per_producer = vec![None; PRODUCERS];
        let mut received = 0;
        while received < PRODUCERS * PER_PRODUCER {
            if let Some(e) = rx.poll() {
                assert!(!seen[e], "duplicate {}", e);
                seen[e] = true;
                // Per-producer order is preserved.
                let p = e / PER_PRODUCER;
                assert!(last_per_producer[p].map_or(true, |last| last < e));
                last_per_producer[p] = Some(e);
                received += 1;
            }
        }
        for producer in producers {
            producer.join().unwrap();
        }
        assert_eq!(rx.poll(), None);
    }

    #[cfg(loom)]
    #[test]
    fn test_mpsc_loom() {
        loom::model(|| {
            let (tx, rx) = mpsc(2).unwrap();

            let producers: Vec<_> = (0..2)
                .map(|p| {
                    let tx = tx.clone();
                    loom::thread::spawn(move || {
                        while tx.offer(p).is_err() {
                            loom::thread::yield_now();
                        }
                    })
                })
                .collect();

            let mut received = Vec::new();
            while received.len() < 2 {
                match rx.poll() {
                    Some(e) => received.push(e),
                    None => loom::thread::yield_now(),
                }
            }
            for producer in producers {
                producer.join().unwrap();
            }
            received.sort();
            assert_eq!(received, [0, 1]);
        });
    }
}
