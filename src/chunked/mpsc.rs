use core::{ptr::NonNull, sync::atomic::Ordering};

use crossbeam_utils::{Backoff, CachePadded};

use crate::config::{ChunkLayout, Growth, GrowthPolicy};
use crate::error::Result;
use crate::handle::{Consumer, Producer};
use crate::loom_exports::sync::{
    atomic::{AtomicPtr, AtomicU64},
    Arc,
};
use crate::queue::{MultiProducer, RawQueue, SingleConsumer, UNBOUNDED_CAPACITY};
use crate::slot::{Slot, EMPTY, FULL, JUMP};
use crate::util::{self, index_distance, modified_circular_offset, spin, IndexedQueue};

use super::Chunk;

/// Outcome of an offer that ran into the cached producer limit.
enum SlowPath {
    /// The limit was refreshed; go on and CAS the producer index.
    Continue,
    /// Lost a race; start over.
    Retry,
    Full,
    /// This producer holds the resize flag and must link a new chunk.
    Resize,
}

/// Restores the producer index to `unflagged` when dropped, releasing the resize flag.
struct ResizeFlag<'a> {
    index: &'a AtomicU64,
    unflagged: u64,
}

impl Drop for ResizeFlag<'_> {
    fn drop(&mut self) {
        self.index.store(self.unflagged, Ordering::Release);
    }
}

struct ProducerState {
    /// Advances by 2 per element. An odd value means a resize is in progress.
    index: AtomicU64,
    /// Producers may claim indices below this without looking at the consumer.
    limit: AtomicU64,
}

/// Current producer chunk. Only the producer holding the resize flag writes these, and other
/// producers only dereference what they read after winning the index CAS.
struct ProducerChunk<T> {
    chunk: AtomicPtr<Chunk<T>>,
    mask: AtomicU64,
}

/// Owned by the single consumer; atomics only so the struct can be shared.
struct ConsumerState<T> {
    index: AtomicU64,
    chunk: AtomicPtr<Chunk<T>>,
    mask: AtomicU64,
}

/// Multi-producer single-consumer queue made of linked array chunks.
///
/// Each chunk is used as a ring until it is full, at which point one producer takes the
/// resize flag (the low bit of the producer index) and links a successor according to the
/// queue's [`GrowthPolicy`]. Indices live in a doubled space so the flag bit never collides
/// with an element index; `mask` is `(chunk_capacity - 1) << 1`.
pub struct MpscLinkedArrayQueue<T> {
    producer: CachePadded<ProducerState>,
    producer_chunk: CachePadded<ProducerChunk<T>>,
    consumer: CachePadded<ConsumerState<T>>,
    growth: Growth,
    /// Twice the element bound, or `u64::MAX` when unbounded.
    max_queue_capacity: u64,
}

/// Creates a chunk-linked MPSC queue.
pub fn mpsc_chunked<T: Send>(
    policy: GrowthPolicy,
) -> Result<(Producer<MpscLinkedArrayQueue<T>>, Consumer<MpscLinkedArrayQueue<T>>)> {
    let queue = Arc::new(MpscLinkedArrayQueue::with_layout(policy.mpsc_layout()?));
    Ok((Producer::new(queue.clone()), Consumer::new(queue)))
}

#[inline(always)]
fn chunk_mask(capacity: usize) -> u64 {
    ((capacity - 1) as u64) << 1
}

impl<T> MpscLinkedArrayQueue<T> {
    fn with_layout(layout: ChunkLayout) -> Self {
        tracing::trace!(
            chunk_capacity = layout.chunk_capacity,
            max_capacity = ?layout.max_capacity,
            growth = ?layout.growth,
            "chunk-linked mpsc queue created"
        );
        let chunk = Chunk::alloc(layout.chunk_capacity);
        let mask = chunk_mask(layout.chunk_capacity);

        Self {
            producer: CachePadded::new(ProducerState {
                index: AtomicU64::new(0),
                limit: AtomicU64::new(mask),
            }),
            producer_chunk: CachePadded::new(ProducerChunk {
                chunk: AtomicPtr::new(chunk),
                mask: AtomicU64::new(mask),
            }),
            consumer: CachePadded::new(ConsumerState {
                index: AtomicU64::new(0),
                chunk: AtomicPtr::new(chunk),
                mask: AtomicU64::new(mask),
            }),
            growth: layout.growth,
            max_queue_capacity: layout.max_capacity.map_or(u64::MAX, |max| (max as u64) << 1),
        }
    }

    /// Index span a chunk with `mask` may hold before it has to be replaced.
    #[inline]
    fn current_buffer_capacity(&self, mask: u64) -> u64 {
        if self.growth == Growth::Growable && mask + 2 == self.max_queue_capacity {
            self.max_queue_capacity
        } else {
            mask
        }
    }

    #[inline]
    fn available_in_queue(&self, producer_index: u64, consumer_index: u64) -> i64 {
        match self.growth {
            Growth::Unbounded => i64::MAX,
            Growth::Chunked | Growth::Growable => {
                self.max_queue_capacity as i64 - index_distance(consumer_index, producer_index)
            }
        }
    }

    #[inline]
    fn next_chunk_capacity(&self, capacity: usize) -> usize {
        match self.growth {
            Growth::Growable => {
                let max = (self.max_queue_capacity >> 1) as usize;
                debug_assert!(capacity < max);
                (capacity * 2).min(max)
            }
            Growth::Unbounded | Growth::Chunked => capacity,
        }
    }

    /// Producer index, chunk and mask, spinning past a resize in progress.
    #[inline]
    fn producer_snapshot(&self, backoff: &Backoff) -> (u64, u64, *mut Chunk<T>, u64) {
        loop {
            let limit = self.producer.limit.load(Ordering::Acquire);
            let index = self.producer.index.load(Ordering::Acquire);
            if index & 1 == 1 {
                spin(backoff);
                continue;
            }
            // Only trusted once the index CAS succeeds.
            let mask = self.producer_chunk.mask.load(Ordering::Acquire);
            let chunk = self.producer_chunk.chunk.load(Ordering::Acquire);
            return (limit, index, chunk, mask);
        }
    }

    fn offer_slow_path(&self, mask: u64, index: u64, limit: u64) -> SlowPath {
        let consumer_index = self.consumer.index.load(Ordering::Acquire);
        let buffer_capacity = self.current_buffer_capacity(mask);
        if consumer_index + buffer_capacity > index {
            match self.producer.limit.compare_exchange(
                limit,
                consumer_index + buffer_capacity,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => SlowPath::Continue,
                Err(_) => SlowPath::Retry,
            }
        } else if self.available_in_queue(index, consumer_index) <= 0 {
            SlowPath::Full
        } else if self
            .producer
            .index
            .compare_exchange(index, index + 1, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            SlowPath::Resize
        } else {
            SlowPath::Retry
        }
    }

    /// Links a new chunk holding `e` at `index` and releases the resize flag.
    ///
    /// SAFETY: the caller holds the resize flag for `index` and `old_chunk`/`old_mask` are the
    /// producer chunk it read before taking it.
    unsafe fn resize(&self, old_mask: u64, old_chunk: *mut Chunk<T>, index: u64, e: T) {
        let old = &*old_chunk;
        let new_capacity = self.next_chunk_capacity(old.capacity());
        tracing::trace!(new_capacity, index = index >> 1, "linking new chunk");

        let new_chunk = Chunk::alloc(new_capacity);
        let new_mask = chunk_mask(new_capacity);
        self.producer_chunk.chunk.store(new_chunk, Ordering::Release);
        self.producer_chunk.mask.store(new_mask, Ordering::Release);

        (*new_chunk)
            .slot(modified_circular_offset(index, new_mask))
            .publish(e);
        old.link(new_chunk);

        let consumer_index = self.consumer.index.load(Ordering::Acquire);
        let available = self.available_in_queue(index, consumer_index);
        assert!(available > 0, "no space left in queue while resizing: {}", available);

        // Never let the limit run past the end of the new chunk.
        self.producer
            .limit
            .store(index + new_mask.min(available as u64), Ordering::Release);
        self.producer.index.store(index + 2, Ordering::Release);
        // Index visible before element, as everywhere else.
        old.slot(modified_circular_offset(index, old_mask)).publish_jump();
    }

    /// Moves the consumer past a `JUMP` in `old` and frees `old`. Returns the slot of `index`
    /// in the new chunk, which must hold the element the resizing producer placed there.
    ///
    /// SAFETY: single consumer; `old` is the consumer chunk and its slot for `index` is `JUMP`.
    unsafe fn follow_jump(&self, old: *mut Chunk<T>, index: u64) -> &Slot<T> {
        let next = (*old).wait_next();
        let next_mask = chunk_mask((*next).capacity());
        self.consumer.chunk.store(next, Ordering::Relaxed);
        self.consumer.mask.store(next_mask, Ordering::Relaxed);
        Chunk::free(old);

        let slot = (*next).slot(modified_circular_offset(index, next_mask));
        assert!(slot.state() == FULL, "new chunk must contain at least one element");
        slot
    }

    /// Slot holding the next element, or `None` when empty. With `strict`, spins over an
    /// in-flight producer instead of reporting empty.
    ///
    /// SAFETY: single consumer.
    unsafe fn head_slot(&self, index: u64, strict: bool) -> Option<&Slot<T>> {
        let chunk = self.consumer.chunk.load(Ordering::Relaxed);
        let mask = self.consumer.mask.load(Ordering::Relaxed);
        let slot = (*chunk).slot(modified_circular_offset(index, mask));
        let mut state = slot.state();
        if state == EMPTY {
            if !strict || index >> 1 == self.producer.index.load(Ordering::Acquire) >> 1 {
                return None;
            }
            state = slot.spin_until_published();
        }
        if state == JUMP {
            return Some(self.follow_jump(chunk, index));
        }
        Some(slot)
    }

    unsafe fn poll_inner(&self, strict: bool) -> Option<T> {
        let index = self.consumer.index.load(Ordering::Relaxed);
        let e = self.head_slot(index, strict)?.take();
        self.consumer.index.store(index + 2, Ordering::Release);
        Some(e)
    }
}

impl<T: Send> IndexedQueue for MpscLinkedArrayQueue<T> {
    fn lv_producer_index(&self) -> u64 {
        self.producer.index.load(Ordering::Acquire)
    }

    fn lv_consumer_index(&self) -> u64 {
        self.consumer.index.load(Ordering::Acquire)
    }

    fn capacity(&self) -> usize {
        RawQueue::capacity(self)
    }
}

unsafe impl<T: Send> RawQueue for MpscLinkedArrayQueue<T> {
    type Item = T;

    fn capacity(&self) -> usize {
        match self.growth {
            Growth::Unbounded => UNBOUNDED_CAPACITY,
            Growth::Chunked | Growth::Growable => (self.max_queue_capacity >> 1) as usize,
        }
    }

    fn size(&self) -> usize {
        util::size(self, 1)
    }

    fn is_empty(&self) -> bool {
        util::is_empty(self, 1)
    }

    unsafe fn offer(&self, e: T) -> core::result::Result<(), T> {
        let backoff = Backoff::new();
        let (index, chunk, mask) = loop {
            let (limit, index, chunk, mask) = self.producer_snapshot(&backoff);
            if limit <= index {
                match self.offer_slow_path(mask, index, limit) {
                    SlowPath::Continue => {}
                    SlowPath::Retry => {
                        spin(&backoff);
                        continue;
                    }
                    SlowPath::Full => return Err(e),
                    SlowPath::Resize => {
                        self.resize(mask, chunk, index, e);
                        return Ok(());
                    }
                }
            }
            if self
                .producer
                .index
                .compare_exchange(index, index + 2, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                break (index, chunk, mask);
            }
            spin(&backoff);
        };
        // Index visible before element; the consumer spins over the gap.
        (*chunk).slot(modified_circular_offset(index, mask)).publish(e);
        Ok(())
    }

    unsafe fn fill<F>(&self, mut supplier: F, limit: usize) -> usize
    where
        F: FnMut() -> T,
    {
        let backoff = Backoff::new();
        let wanted = (limit as u64).saturating_mul(2);
        let (index, chunk, mask, claimed) = loop {
            let (producer_limit, index, chunk, mask) = self.producer_snapshot(&backoff);
            let batch_index = producer_limit.min(index.saturating_add(wanted));
            if index >= producer_limit {
                match self.offer_slow_path(mask, index, producer_limit) {
                    // The batch end was computed from the stale limit.
                    SlowPath::Continue | SlowPath::Retry => {
                        spin(&backoff);
                        continue;
                    }
                    SlowPath::Full => return 0,
                    SlowPath::Resize => {
                        // Other producers spin on the flag; give it back if `supplier` unwinds.
                        let flag = ResizeFlag {
                            index: &self.producer.index,
                            unflagged: index,
                        };
                        let e = supplier();
                        core::mem::forget(flag);
                        self.resize(mask, chunk, index, e);
                        return 1;
                    }
                }
            }
            if self
                .producer
                .index
                .compare_exchange(index, batch_index, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                break (index, chunk, mask, (batch_index - index) / 2);
            }
            spin(&backoff);
        };
        for i in 0..claimed {
            (*chunk)
                .slot(modified_circular_offset(index + 2 * i, mask))
                .publish(supplier());
        }
        claimed as usize
    }

    unsafe fn poll(&self) -> Option<T> {
        self.poll_inner(true)
    }

    unsafe fn relaxed_poll(&self) -> Option<T> {
        self.poll_inner(false)
    }
}

unsafe impl<T: Send> MultiProducer for MpscLinkedArrayQueue<T> {}

unsafe impl<T: Send> SingleConsumer for MpscLinkedArrayQueue<T> {
    unsafe fn peek(&self) -> Option<NonNull<T>> {
        let index = self.consumer.index.load(Ordering::Relaxed);
        Some(self.head_slot(index, true)?.value_ptr())
    }

    unsafe fn relaxed_peek(&self) -> Option<NonNull<T>> {
        let index = self.consumer.index.load(Ordering::Relaxed);
        Some(self.head_slot(index, false)?.value_ptr())
    }
}

impl<T> Drop for MpscLinkedArrayQueue<T> {
    fn drop(&mut self) {
        // The producer chunk is always reachable from the consumer chunk.
        unsafe { Chunk::free_chain(self.consumer.chunk.load(Ordering::Relaxed)) };
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[cfg(not(loom))]
    #[test]
    fn test_unbounded_crosses_chunks() {
        let (tx, mut rx) = mpsc_chunked(GrowthPolicy::Unbounded { chunk_size: 2 }).unwrap();
        assert_eq!(tx.capacity(), UNBOUNDED_CAPACITY);
        assert_eq!(rx.poll(), None);

        tx.offer(1).unwrap();
        // Does not fit in the first chunk: leaves a jump behind.
        tx.offer(2).unwrap();
        assert_eq!(rx.poll(), Some(1));
        assert_eq!(rx.peek(), Some(&2));
        assert_eq!(rx.poll(), Some(2));
        assert_eq!(rx.poll(), None);

        for i in 0..1000 {
            tx.offer(i).unwrap();
        }
        assert_eq!(rx.size(), 1000);
        for i in 0..1000 {
            assert_eq!(rx.poll(), Some(i));
        }
        assert!(rx.is_empty());
    }

    #[cfg(not(loom))]
    #[test]
    fn test_drain_with_stops_on_exit() {
        let (tx, rx) = mpsc_chunked(GrowthPolicy::Unbounded { chunk_size: 4 }).unwrap();
        for i in 0..20 {
            tx.offer(i).unwrap();
        }

        let mut out = Vec::new();
        let mut idle_rounds = 0;
        let mut rounds = 0;
        rx.drain_with(
            |e| out.push(e),
            |idle_counter| {
                idle_rounds += 1;
                idle_counter + 1
            },
            || {
                rounds += 1;
                rounds <= 10
            },
        );
        // Stopped halfway, past several chunk boundaries, without ever idling.
        assert_eq!(out, (0..10).collect::<Vec<_>>());
        assert_eq!(idle_rounds, 0);
        assert_eq!(rx.size(), 10);

        out.clear();
        assert_eq!(rx.drain_all(|e| out.push(e)), 10);
        assert_eq!(out, (10..20).collect::<Vec<_>>());
    }

    #[cfg(not(loom))]
    #[test]
    fn test_panicking_supplier_releases_resize_flag() {
        let (tx, rx) = mpsc_chunked(GrowthPolicy::Unbounded { chunk_size: 2 }).unwrap();
        tx.offer(1).unwrap();

        // The next element needs a new chunk, so the supplier runs under the resize flag.
        let unwound = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            tx.fill(|| -> i32 { panic!("supplier failed") }, 1)
        }));
        assert!(unwound.is_err());

        tx.offer(2).unwrap();
        assert_eq!(rx.poll(), Some(1));
        assert_eq!(rx.poll(), Some(2));
        assert_eq!(rx.poll(), None);
    }

    #[cfg(not(loom))]
    #[test]
    fn test_chunked_bound() {
        let (tx, rx) =
            mpsc_chunked(GrowthPolicy::Chunked { chunk_size: 4, max_capacity: 16 }).unwrap();
        assert_eq!(tx.capacity(), 16);
        for i in 0..16 {
            assert_eq!(tx.offer(i), Ok(()));
        }
        assert_eq!(tx.offer(16), Err(16));
        assert_eq!(rx.size(), 16);

        assert_eq!(rx.poll(), Some(0));
        tx.offer(16).unwrap();
        for i in 1..=16 {
            assert_eq!(rx.poll(), Some(i));
        }
        assert_eq!(rx.poll(), None);
        assert_eq!(rx.size(), 0);
    }

    #[cfg(not(loom))]
    #[test]
    fn test_growable_bound() {
        let (tx, rx) =
            mpsc_chunked(GrowthPolicy::Growable { initial_capacity: 2, max_capacity: 16 }).unwrap();
        for i in 0..16 {
            assert_eq!(tx.offer(i), Ok(()));
        }
        assert_eq!(tx.offer(16), Err(16));

        // The largest chunk is a plain ring from here on.
        let mut expected = 0;
        let mut next = 16;
        for _ in 0..100 {
            assert_eq!(rx.poll(), Some(expected));
            expected += 1;
            tx.offer(next).unwrap();
            next += 1;
        }
        let mut out = Vec::new();
        rx.drain_all(|e| out.push(e));
        assert_eq!(out, (expected..next).collect::<Vec<_>>());
    }

    #[cfg(not(loom))]
    #[test]
    fn test_fill_stops_at_chunk_then_resizes() {
        let (tx, rx) =
            mpsc_chunked(GrowthPolicy::Chunked { chunk_size: 4, max_capacity: 16 }).unwrap();
        let mut next = 0;
        let mut total = 0;
        loop {
            let n = tx.fill(|| { next += 1; next }, 100);
            if n == 0 {
                break;
            }
            total += n;
        }
        assert_eq!(total, 16);
        assert_eq!(rx.relaxed_poll(), Some(1));

        let mut out = Vec::new();
        assert_eq!(rx.drain(|e| out.push(e), 100), 15);
        assert_eq!(out, (2..=16).collect::<Vec<_>>());
    }

    #[cfg(not(loom))]
    #[test]
    fn test_drop_frees_elements_in_every_chunk() {
        let marker = std::sync::Arc::new(());
        {
            let (tx, rx) = mpsc_chunked(GrowthPolicy::Unbounded { chunk_size: 4 }).unwrap();
            for _ in 0..20 {
                tx.offer(marker.clone()).unwrap();
            }
            for _ in 0..5 {
                drop(rx.poll());
            }
            assert_eq!(std::sync::Arc::strong_count(&marker), 16);
        }
        assert_eq!(std::sync::Arc::strong_count(&marker), 1);
    }

    #[cfg(not(loom))]
    #[test]
    fn test_threaded_no_loss_no_duplicates() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 25_000;
        let (tx, rx) =
            mpsc_chunked(GrowthPolicy::Growable { initial_capacity: 4, max_capacity: 256 })
                .unwrap();

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
    fn test_resize_race_loom() {
        loom::model(|| {
            let (tx, rx) = mpsc_chunked(GrowthPolicy::Unbounded { chunk_size: 2 }).unwrap();

            let producers: Vec<_> = (0..2)
                .map(|p| {
                    let tx = tx.clone();
                    loom::thread::spawn(move || tx.offer(p).unwrap())
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
