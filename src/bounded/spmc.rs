use core::sync::atomic::Ordering;

use crossbeam_utils::{Backoff, CachePadded};

use crate::error::Result;
use crate::handle::{Producer, SharedConsumer};
use crate::loom_exports::sync::{
    atomic::{fence, AtomicU64},
    Arc,
};
use crate::queue::{MultiConsumer, RawQueue};
use crate::slot::{Slot, FULL};
use crate::util::{self, circular_offset, spin, IndexedQueue};

use super::ring_capacity;

/// Consumer-shared state. `producer_index_cache` is a hint that never runs ahead of the real
/// producer index; consumers only reload the real one when they catch up with the hint.
/// The hint is released and acquired like the index it copies: a consumer claiming through it
/// must see the slot states the producer saw when it advanced that far.
struct ConsumerState {
    index: AtomicU64,
    producer_index_cache: AtomicU64,
}

/// Bounded single-producer multi-consumer ring.
///
/// The mirror image of [`super::MpscArrayQueue`]: consumers CAS the consumer index and then
/// evacuate the slot, so the producer may find a slot whose index was already claimed but
/// whose element has not been moved out yet. It waits for that consumer instead of reporting
/// full.
pub struct SpmcArrayQueue<T> {
    producer_index: CachePadded<AtomicU64>,
    consumer: CachePadded<ConsumerState>,
    buffer: Box<[Slot<T>]>,
    mask: u64,
}

/// Creates a bounded SPMC queue holding at least `capacity` elements (rounded up to a power
/// of two, minimum 2).
pub fn spmc<T: Send>(
    capacity: usize,
) -> Result<(Producer<SpmcArrayQueue<T>>, SharedConsumer<SpmcArrayQueue<T>>)> {
    let queue = Arc::new(SpmcArrayQueue::with_capacity(capacity)?);
    Ok((Producer::new(queue.clone()), SharedConsumer::new(queue)))
}

impl<T> SpmcArrayQueue<T> {
    fn with_capacity(capacity: usize) -> Result<Self> {
        let capacity = ring_capacity(capacity)?;
        tracing::trace!(capacity, "spmc array queue created");

        Ok(Self {
            producer_index: CachePadded::new(AtomicU64::new(0)),
            consumer: CachePadded::new(ConsumerState {
                index: AtomicU64::new(0),
                producer_index_cache: AtomicU64::new(0),
            }),
            buffer: Slot::boxed_slice(capacity),
            mask: capacity as u64 - 1,
        })
    }

    #[inline(always)]
    fn slot(&self, index: u64) -> &Slot<T> {
        &self.buffer[circular_offset(index, self.mask)]
    }

    /// Consumer index and the producer index it is known to be below, or `None` when empty.
    fn next_readable(&self, producer_index_cache: &mut u64) -> Option<u64> {
        let index = self.consumer.index.load(Ordering::Acquire);
        if index >= *producer_index_cache {
            let producer_index = self.producer_index.load(Ordering::Acquire);
            if index >= producer_index {
                return None;
            }
            *producer_index_cache = producer_index;
            self.consumer
                .producer_index_cache
                .store(producer_index, Ordering::Release);
        }
        Some(index)
    }

    /// Claims up to `wanted` published indices.
    fn claim(&self, wanted: u64) -> Option<(u64, u64)> {
        let mut producer_index_cache = self.consumer.producer_index_cache.load(Ordering::Acquire);
        let backoff = Backoff::new();
        loop {
            let index = self.next_readable(&mut producer_index_cache)?;
            let claimed = (producer_index_cache - index).min(wanted);
            match self.consumer.index.compare_exchange_weak(
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

    /// SAFETY: `index` was claimed by the caller.
    #[inline]
    unsafe fn remove_element(&self, index: u64) -> T {
        let slot = self.slot(index);
        // The producer publishes before it advances its index, but the write may not have
        // reached this core yet.
        slot.spin_until_published();
        slot.take()
    }

    /// SAFETY: single producer.
    #[inline(always)]
    unsafe fn write(&self, index: u64, e: T) {
        self.slot(index).publish(e);
        self.producer_index.store(index + 1, Ordering::Release);
    }
}

impl<T> IndexedQueue for SpmcArrayQueue<T> {
    fn lv_producer_index(&self) -> u64 {
        self.producer_index.load(Ordering::Acquire)
    }

    fn lv_consumer_index(&self) -> u64 {
        self.consumer.index.load(Ordering::Acquire)
    }

    fn capacity(&self) -> usize {
        self.buffer.len()
    }
}

unsafe impl<T: Send> RawQueue for SpmcArrayQueue<T> {
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
        let index = self.producer_index.load(Ordering::Relaxed);
        let slot = self.slot(index);
        if !slot.is_empty() {
            let size = index - self.consumer.index.load(Ordering::Acquire);
            if size > self.mask {
                return Err(e);
            }
            // Claimed by a consumer that has not evacuated it yet.
            slot.spin_until_empty();
        }
        self.write(index, e);
        Ok(())
    }

    unsafe fn fill<F>(&self, mut supplier: F, limit: usize) -> usize
    where
        F: FnMut() -> T,
    {
        let index = self.producer_index.load(Ordering::Relaxed);
        for i in 0..limit as u64 {
            if !self.slot(index + i).is_empty() {
                return i as usize;
            }
            self.write(index + i, supplier());
        }
        limit
    }

    unsafe fn poll(&self) -> Option<T> {
        let (index, _) = self.claim(1)?;
        Some(self.remove_element(index))
    }

    unsafe fn drain<F>(&self, mut consumer: F, limit: usize) -> usize
    where
        F: FnMut(T),
    {
        let Some((index, claimed)) = self.claim(limit as u64) else {
            return 0;
        };
        for i in 0..claimed {
            consumer(self.remove_element(index + i));
        }
        claimed as usize
    }
}

unsafe impl<T: Send> MultiConsumer for SpmcArrayQueue<T> {
    fn peek(&self) -> Option<T>
    where
        T: Copy,
    {
        let mut producer_index_cache = self.consumer.producer_index_cache.load(Ordering::Acquire);
        let backoff = Backoff::new();
        loop {
            let index = self.next_readable(&mut producer_index_cache)?;
            let slot = self.slot(index);
            if slot.state() == FULL {
                // Seqlock read: the copy may race the next lap's write and is only kept
                // when the consumer index shows the slot was still unclaimed.
                let value = slot.read_volatile();
                fence(Ordering::Acquire);
                if self.consumer.index.load(Ordering::Relaxed) == index {
                    // SAFETY: nobody claimed `index` while we copied it, so the copy is the
                    // published element.
                    return Some(unsafe { value.assume_init() });
                }
            }
            spin(&backoff);
        }
    }
}

impl<T> Drop for SpmcArrayQueue<T> {
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
    fn test_full_and_empty() {
        let (tx, rx) = spmc(2).unwrap();
        assert_eq!(rx.poll(), None);
        assert_eq!(rx.peek(), None);

        tx.offer(1).unwrap();
        tx.offer(2).unwrap();
        assert_eq!(tx.offer(3), Err(3));
        assert_eq!(rx.peek(), Some(1));
        assert_eq!(rx.size(), 2);

        assert_eq!(rx.poll(), Some(1));
        tx.offer(3).unwrap();
        assert_eq!(rx.poll(), Some(2));
        assert_eq!(rx.poll(), Some(3));
        assert_eq!(rx.poll(), None);
        assert!(rx.is_empty());
    }

    #[cfg(not(loom))]
    #[test]
    fn test_fill_and_batched_drain() {
        let (tx, rx) = spmc(8).unwrap();
        let mut next = 0;
        assert_eq!(tx.fill(|| { next += 1; next }, 20), 8);

        let mut out = Vec::new();
        assert_eq!(rx.drain(|e| out.push(e), 3), 3);
        assert_eq!(rx.drain_all(|e| out.push(e)), 5);
        assert_eq!(out, (1..=8).collect::<Vec<_>>());
    }

    #[cfg(not(loom))]
    #[test]
    fn test_threaded_no_loss_no_duplicates() {
        use std::sync::atomic::{AtomicBool, AtomicUsize};

        const CONSUMERS: usize = 4;
        const COUNT: usize = 100_000;
        let (tx, rx) = spmc(64).unwrap();
        let seen: std::sync::Arc<Vec<AtomicBool>> =
            std::sync::Arc::new((0..COUNT).map(|_| AtomicBool::new(false)).collect());
        let received = std::sync::Arc::new(AtomicUsize::new(0));

        let consumers: Vec<_> = (0..CONSUMERS)
            .map(|_| {
                let rx = rx.clone();
                let seen = seen.clone();
                let received = received.clone();
                std::thread::spawn(move || {
                    let mut last = None;
                    while received.load(Ordering::Relaxed) < COUNT {
                        if let Some(e) = rx.poll() {
                            let e: usize = e;
                            assert!(!seen[e].swap(true, Ordering::Relaxed), "duplicate {}", e);
                            // A single consumer sees elements in producer order.
                            assert!(last.map_or(true, |last| last < e));
                            last = Some(e);
                            received.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                })
            })
            .collect();

        for i in 0..COUNT {
            let mut e = i;
            while let Err(back) = tx.offer(e) {
                e = back;
                std::hint::spin_loop();
            }
        }
        for consumer in consumers {
            consumer.join().unwrap();
        }
        assert!(seen.iter().all(|s| s.load(Ordering::Relaxed)));
        assert_eq!(rx.poll(), None);
    }

    #[cfg(loom)]
    #[test]
    fn test_spmc_loom() {
        use loom::sync::atomic::AtomicUsize;

        loom::model(|| {
            let (tx, rx) = spmc(2).unwrap();
            let total = Arc::new(AtomicUsize::new(0));

            let consumers: Vec<_> = (0..2)
                .map(|_| {
                    let rx = rx.clone();
                    let total = total.clone();
                    loom::thread::spawn(move || {
                        if let Some(e) = rx.poll() {
                            total.fetch_add(e, Ordering::Relaxed);
                        }
                    })
                })
                .collect();

            tx.offer(1).unwrap();
            tx.offer(2).unwrap();
            for consumer in consumers {
                consumer.join().unwrap();
            }
            while let Some(e) = rx.poll() {
                total.fetch_add(e, Ordering::Relaxed);
            }
            assert_eq!(total.load(Ordering::Relaxed), 3);
        });
    }

    // A consumer that claims through the cached producer index must still see the slot
    // emptied by the consumer of the previous lap before the producer refills it.
    #[cfg(loom)]
    #[test]
    fn test_spmc_cached_claim_after_lap_loom() {
        let mut builder = loom::model::Builder::new();
        builder.preemption_bound = Some(3);
        builder.check(|| {
            let (tx, rx) = spmc(2).unwrap();
            tx.offer(0usize).unwrap();
            tx.offer(1).unwrap();

            let consumers: Vec<_> = [2, 1, 1]
                .into_iter()
                .map(|polls| {
                    let rx = rx.clone();
                    loom::thread::spawn(move || {
                        (0..polls).filter_map(|_| rx.poll()).collect::<Vec<usize>>()
                    })
                })
                .collect();

            let refilled = tx.offer(2).is_ok();
            let mut taken: Vec<usize> = consumers
                .into_iter()
                .flat_map(|consumer| consumer.join().unwrap())
                .collect();
            while let Some(e) = rx.poll() {
                taken.push(e);
            }
            taken.sort_unstable();

            let expected = if refilled { vec![0, 1, 2] } else { vec![0, 1] };
            assert_eq!(taken, expected);
        });
    }
}
