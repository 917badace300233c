use core::{cell::UnsafeCell, ptr::NonNull, sync::atomic::Ordering};

use crossbeam_utils::CachePadded;

use crate::config::{ChunkLayout, Growth, GrowthPolicy};
use crate::error::Result;
use crate::handle::{Consumer, Producer};
use crate::loom_exports::sync::{atomic::AtomicU64, Arc};
use crate::queue::{RawQueue, SingleConsumer, UNBOUNDED_CAPACITY};
use crate::slot::{Slot, EMPTY, FULL};
use crate::util::{self, circular_offset, IndexedQueue, MAX_LOOK_AHEAD_STEP};

use super::Chunk;

/// What the producer does with the element it is holding.
enum Reserve {
    Write,
    /// Link a chunk of this many slots and put the element there.
    Link(usize),
    Full,
}

/// State only the producer thread touches.
struct ProducerLocal<T> {
    chunk: *mut Chunk<T>,
    mask: u64,
    /// Every index below this maps to a free slot of `chunk`.
    buffer_limit: u64,
    look_ahead_step: u64,
    /// Chunked: cached `consumer_index + max_capacity`.
    queue_limit: u64,
    /// Growable: first index written to the largest chunk, while older chunks may still hold
    /// elements and the element count has to be checked against the consumer index.
    settling_from: Option<u64>,
}

struct ProducerState<T> {
    index: AtomicU64,
    local: UnsafeCell<ProducerLocal<T>>,
}

struct ConsumerLocal<T> {
    chunk: *mut Chunk<T>,
    mask: u64,
}

struct ConsumerState<T> {
    index: AtomicU64,
    local: UnsafeCell<ConsumerLocal<T>>,
}

/// Single-producer single-consumer queue made of linked array chunks.
///
/// Like [`crate::SpscArrayQueue`], fullness of a chunk is decided by looking at slots rather
/// than at the consumer index. The producer always keeps one slot of its chunk free: when the
/// slot after the one it is about to write is still occupied, the element goes to a fresh
/// chunk and the free slot receives the `JUMP` marker.
pub struct SpscLinkedArrayQueue<T> {
    producer: CachePadded<ProducerState<T>>,
    consumer: CachePadded<ConsumerState<T>>,
    growth: Growth,
    /// Element bound, or `u64::MAX` when unbounded.
    max_capacity: u64,
}

unsafe impl<T: Send> Send for SpscLinkedArrayQueue<T> {}
unsafe impl<T: Send> Sync for SpscLinkedArrayQueue<T> {}

/// Creates a chunk-linked SPSC queue.
pub fn spsc_chunked<T: Send>(
    policy: GrowthPolicy,
) -> Result<(Producer<SpscLinkedArrayQueue<T>>, Consumer<SpscLinkedArrayQueue<T>>)> {
    let queue = Arc::new(SpscLinkedArrayQueue::with_layout(policy.spsc_layout()?));
    Ok((Producer::new(queue.clone()), Consumer::new(queue)))
}

fn look_ahead_step(capacity: usize) -> u64 {
    (capacity / 4).min(MAX_LOOK_AHEAD_STEP) as u64
}

impl<T> SpscLinkedArrayQueue<T> {
    fn with_layout(layout: ChunkLayout) -> Self {
        tracing::trace!(
            chunk_capacity = layout.chunk_capacity,
            max_capacity = ?layout.max_capacity,
            growth = ?layout.growth,
            "chunk-linked spsc queue created"
        );
        let chunk = Chunk::alloc(layout.chunk_capacity);
        let mask = layout.chunk_capacity as u64 - 1;
        let max_capacity = layout.max_capacity.map_or(u64::MAX, |max| max as u64);

        Self {
            producer: CachePadded::new(ProducerState {
                index: AtomicU64::new(0),
                local: UnsafeCell::new(ProducerLocal {
                    chunk,
                    mask,
                    buffer_limit: mask - 1,
                    look_ahead_step: look_ahead_step(layout.chunk_capacity),
                    queue_limit: max_capacity,
                    settling_from: None,
                }),
            }),
            consumer: CachePadded::new(ConsumerState {
                index: AtomicU64::new(0),
                local: UnsafeCell::new(ConsumerLocal { chunk, mask }),
            }),
            growth: layout.growth,
            max_capacity,
        }
    }

    /// Decides whether `index` can be written, and where.
    ///
    /// SAFETY: single producer.
    unsafe fn reserve(&self, local: &mut ProducerLocal<T>, index: u64) -> Reserve {
        if index < local.buffer_limit {
            return Reserve::Write;
        }
        let chunk = &*local.chunk;
        let mask = local.mask;
        let slot = |i: u64| chunk.slot(circular_offset(i, mask));

        match self.growth {
            Growth::Unbounded => {
                let look_ahead = index + local.look_ahead_step;
                if slot(look_ahead).is_empty() {
                    local.buffer_limit = look_ahead - 1;
                    Reserve::Write
                } else if slot(index + 1).is_empty() {
                    Reserve::Write
                } else {
                    Reserve::Link(chunk.capacity())
                }
            }
            Growth::Chunked => {
                if index >= local.queue_limit {
                    // The cached limit may be stale.
                    local.queue_limit =
                        self.consumer.index.load(Ordering::Acquire) + self.max_capacity;
                    if index >= local.queue_limit {
                        return Reserve::Full;
                    }
                }
                let look_ahead = (index + local.look_ahead_step).min(local.queue_limit);
                if look_ahead > index + 1 && slot(look_ahead).is_empty() {
                    local.buffer_limit = look_ahead - 1;
                    Reserve::Write
                } else if slot(index + 1).is_empty() {
                    Reserve::Write
                } else {
                    Reserve::Link(chunk.capacity())
                }
            }
            Growth::Growable => {
                if let Some(first) = local.settling_from {
                    let consumer_index = self.consumer.index.load(Ordering::Acquire);
                    if index - consumer_index >= self.max_capacity {
                        return Reserve::Full;
                    }
                    if consumer_index >= first {
                        // Only the largest chunk is left; plain ring from here on.
                        local.settling_from = None;
                        local.look_ahead_step = look_ahead_step(chunk.capacity());
                    } else {
                        local.buffer_limit = consumer_index + self.max_capacity;
                    }
                    return Reserve::Write;
                }

                let look_ahead = index + local.look_ahead_step;
                if slot(look_ahead).is_empty() {
                    local.buffer_limit = look_ahead - 1;
                    Reserve::Write
                } else if chunk.capacity() as u64 == self.max_capacity {
                    // Never linked again, so the last free slot may be used too.
                    if slot(index).is_empty() {
                        Reserve::Write
                    } else {
                        Reserve::Full
                    }
                } else if slot(index + 1).is_empty() {
                    Reserve::Write
                } else {
                    Reserve::Link(chunk.capacity() * 2)
                }
            }
        }
    }

    /// SAFETY: single producer; `reserve` returned `Write` for `index`.
    #[inline(always)]
    unsafe fn write(&self, local: &ProducerLocal<T>, index: u64, e: T) {
        (*local.chunk).slot(circular_offset(index, local.mask)).publish(e);
        self.producer.index.store(index + 1, Ordering::Release);
    }

    /// Publishes `e` in a new chunk of `capacity` slots and leaves a `JUMP` in the old one.
    ///
    /// SAFETY: single producer; `reserve` returned `Link(capacity)` for `index`.
    unsafe fn link_new_chunk(&self, local: &mut ProducerLocal<T>, index: u64, capacity: usize, e: T) {
        tracing::trace!(capacity, index, "linking new chunk");
        let old = local.chunk;
        let old_mask = local.mask;
        let new_chunk = Chunk::alloc(capacity);
        let new_mask = capacity as u64 - 1;

        (*new_chunk).slot(circular_offset(index, new_mask)).publish(e);
        (*old).link(new_chunk);
        // `old` may be freed by the consumer from here on.
        (*old).slot(circular_offset(index, old_mask)).publish_jump();
        self.producer.index.store(index + 1, Ordering::Release);

        local.chunk = new_chunk;
        local.mask = new_mask;
        match self.growth {
            Growth::Growable if capacity as u64 == self.max_capacity => {
                let consumer_index = self.consumer.index.load(Ordering::Acquire);
                local.settling_from = Some(index);
                local.buffer_limit = consumer_index + self.max_capacity;
            }
            Growth::Growable => {
                local.buffer_limit = index + new_mask - 1;
                local.look_ahead_step = look_ahead_step(capacity);
            }
            Growth::Unbounded => local.buffer_limit = index + new_mask - 1,
            // The queue limit still applies; go through `reserve` again.
            Growth::Chunked => {}
        }
    }

    /// Slot of the element at `index`, moving to the next chunk when it holds a `JUMP`.
    ///
    /// SAFETY: single consumer.
    unsafe fn head_slot(&self, index: u64) -> Option<&Slot<T>> {
        let local = &mut *self.consumer.local.get();
        let slot = (*local.chunk).slot(circular_offset(index, local.mask));
        match slot.state() {
            EMPTY => None,
            FULL => Some(slot),
            _ => {
                let old = local.chunk;
                let next = (*old).wait_next();
                local.chunk = next;
                local.mask = (*next).capacity() as u64 - 1;
                Chunk::free(old);

                let slot = (*next).slot(circular_offset(index, local.mask));
                assert!(slot.state() == FULL, "new chunk must contain at least one element");
                Some(slot)
            }
        }
    }
}

impl<T: Send> IndexedQueue for SpscLinkedArrayQueue<T> {
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

unsafe impl<T: Send> RawQueue for SpscLinkedArrayQueue<T> {
    type Item = T;

    fn capacity(&self) -> usize {
        match self.growth {
            Growth::Unbounded => UNBOUNDED_CAPACITY,
            Growth::Chunked | Growth::Growable => self.max_capacity as usize,
        }
    }

    fn size(&self) -> usize {
        util::size(self, 0)
    }

    fn is_empty(&self) -> bool {
        util::is_empty(self, 0)
    }

    unsafe fn offer(&self, e: T) -> core::result::Result<(), T> {
        let local = &mut *self.producer.local.get();
        let index = self.producer.index.load(Ordering::Relaxed);
        match self.reserve(local, index) {
            Reserve::Write => self.write(local, index, e),
            Reserve::Link(capacity) => self.link_new_chunk(local, index, capacity, e),
            Reserve::Full => return Err(e),
        }
        Ok(())
    }

    unsafe fn fill<F>(&self, mut supplier: F, limit: usize) -> usize
    where
        F: FnMut() -> T,
    {
        let local = &mut *self.producer.local.get();
        let mut index = self.producer.index.load(Ordering::Relaxed);
        for i in 0..limit {
            match self.reserve(local, index) {
                Reserve::Write => self.write(local, index, supplier()),
                Reserve::Link(capacity) => self.link_new_chunk(local, index, capacity, supplier()),
                Reserve::Full => return i,
            }
            index += 1;
        }
        limit
    }

    unsafe fn poll(&self) -> Option<T> {
        let index = self.consumer.index.load(Ordering::Relaxed);
        let e = self.head_slot(index)?.take();
        self.consumer.index.store(index + 1, Ordering::Release);
        Some(e)
    }
}

unsafe impl<T: Send> SingleConsumer for SpscLinkedArrayQueue<T> {
    unsafe fn peek(&self) -> Option<NonNull<T>> {
        let index = self.consumer.index.load(Ordering::Relaxed);
        Some(self.head_slot(index)?.value_ptr())
    }
}

impl<T> Drop for SpscLinkedArrayQueue<T> {
    fn drop(&mut self) {
        unsafe { Chunk::free_chain(self.consumer.local.get_mut().chunk) };
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[cfg(not(loom))]
    #[test]
    fn test_unbounded_peek_follows_jumps() {
        let (tx, mut rx) = spsc_chunked(GrowthPolicy::Unbounded { chunk_size: 16 }).unwrap();
        assert_eq!(tx.capacity(), UNBOUNDED_CAPACITY);
        assert_eq!(rx.peek(), None);

        for i in 0..100 {
            tx.offer(i).unwrap();
        }
        assert_eq!(rx.size(), 100);
        for i in 0..100 {
            assert_eq!(rx.peek(), Some(&i));
            assert_eq!(rx.poll(), Some(i));
        }
        assert_eq!(rx.poll(), None);
        assert!(rx.is_empty());
    }

    #[cfg(not(loom))]
    #[test]
    fn test_chunked_bound() {
        let (tx, rx) =
            spsc_chunked(GrowthPolicy::Chunked { chunk_size: 16, max_capacity: 64 }).unwrap();
        assert_eq!(tx.capacity(), 64);
        let mut next = 0;
        assert_eq!(tx.fill(|| { next += 1; next }, 100), 64);
        assert_eq!(tx.offer(0), Err(0));

        assert_eq!(rx.poll(), Some(1));
        tx.offer(65).unwrap();
        let mut out = Vec::new();
        assert_eq!(rx.drain_all(|e| out.push(e)), 64);
        assert_eq!(out, (2..=65).collect::<Vec<_>>());
    }

    #[cfg(not(loom))]
    #[test]
    fn test_growable_settles_into_largest_chunk() {
        let (tx, rx) =
            spsc_chunked(GrowthPolicy::Growable { initial_capacity: 8, max_capacity: 64 }).unwrap();
        for i in 0..64 {
            assert_eq!(tx.offer(i), Ok(()));
        }
        assert_eq!(tx.offer(64), Err(64));

        let mut expected = 0;
        let mut next = 64;
        for _ in 0..300 {
            assert_eq!(rx.poll(), Some(expected));
            expected += 1;
            assert_eq!(tx.offer(next), Ok(()));
            next += 1;
            assert_eq!(tx.size(), 64);
        }
        while let Some(e) = rx.poll() {
            assert_eq!(e, expected);
            expected += 1;
        }
        assert_eq!(expected, next);
    }

    #[cfg(not(loom))]
    #[test]
    fn test_drop_frees_elements_in_every_chunk() {
        let marker = std::sync::Arc::new(());
        {
            let (tx, rx) = spsc_chunked(GrowthPolicy::Unbounded { chunk_size: 16 }).unwrap();
            for _ in 0..50 {
                tx.offer(marker.clone()).unwrap();
            }
            for _ in 0..20 {
                drop(rx.poll());
            }
            assert_eq!(std::sync::Arc::strong_count(&marker), 31);
        }
        assert_eq!(std::sync::Arc::strong_count(&marker), 1);
    }

    #[cfg(not(loom))]
    #[test]
    fn test_threaded_fifo() {
        const COUNT: u64 = 200_000;
        let (tx, rx) =
            spsc_chunked(GrowthPolicy::Growable { initial_capacity: 8, max_capacity: 1024 })
                .unwrap();

        let producer = std::thread::spawn(move || {
            for i in 0..COUNT {
                let mut e = i;
                while let Err(back) = tx.offer(e) {
                    e = back;
                    std::hint::spin_loop();
                }
            }
        });

        let mut expected = 0;
        while expected < COUNT {
            if let Some(e) = rx.poll() {
                assert_eq!(e, expected);
                expected += 1;
            }
        }
        producer.join().unwrap();
        assert!(rx.is_empty());
    }

    #[cfg(loom)]
    #[test]
    fn test_link_loom() {
        let mut builder = loom::model::Builder::new();
        builder.preemption_bound = Some(3);
        builder.check(|| {
            let (tx, rx) =
                spsc_chunked(GrowthPolicy::Growable { initial_capacity: 8, max_capacity: 16 })
                    .unwrap();

            // The eighth element does not fit in the first chunk.
            let producer = loom::thread::spawn(move || {
                for i in 0..9 {
                    tx.offer(i).unwrap();
                }
            });

            let mut expected = 0;
            while expected < 9 {
                match rx.poll() {
                    Some(e) => {
                        assert_eq!(e, expected);
                        expected += 1;
                    }
                    None => loom::thread::yield_now(),
                }
            }
            producer.join().unwrap();
        });
    }
}
