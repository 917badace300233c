//! Unbounded queues whose producers claim slots with a single fetch-and-add.
//!
//! A producer index splits into a chunk index (high bits) and an offset within that chunk
//! (low bits). Producers never retry the claim itself; they only have to find the chunk. One
//! that lands past the last linked chunk appends the missing chunks, and appends are
//! serialized by swapping the producer chunk index to `ROTATION`. One that lands behind the
//! current producer chunk walks `prev` links back to its chunk.
//!
//! A lagging producer may still read a chunk the consumer has already moved past, so drained
//! chunks are either handed to a small pool that lives as long as the queue, or retired
//! through `crossbeam-epoch` once every pinned thread has let go of them.

use core::{ptr::NonNull, sync::atomic::Ordering};

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use crossbeam_utils::{Backoff, CachePadded};

use crate::bounded::SpscArrayQueue;
use crate::config::XaddConfig;
use crate::error::Result;
use crate::loom_exports::sync::atomic::{AtomicI64, AtomicU64};
use crate::queue::{RawQueue, UNBOUNDED_CAPACITY};
use crate::util::{spin, IndexedQueue};

mod chunk;
mod mpmc;
mod mpsc;

pub use mpmc::{mpmc_xadd, MpmcUnboundedXaddArrayQueue};
pub use mpsc::{mpsc_xadd, MpscUnboundedXaddArrayQueue};

use chunk::{XaddChunk, NOT_USED};

/// Producer chunk index while a producer is appending chunks.
const ROTATION: i64 = -2;

/// A drained chunk waiting in the pool. The pool owns it until an appending producer takes
/// it back out.
struct PooledChunk<T>(NonNull<XaddChunk<T>>);

unsafe impl<T> Send for PooledChunk<T> {}

struct ProducerChunk<T> {
    chunk: Atomic<XaddChunk<T>>,
    /// Index of `chunk`, or `ROTATION` while chunks are being appended.
    chunk_index: AtomicI64,
}

/// State and producer logic shared by the MPSC and MPMC variants.
pub(crate) struct XaddCore<T> {
    producer_index: CachePadded<AtomicU64>,
    producer: CachePadded<ProducerChunk<T>>,
    consumer_index: CachePadded<AtomicU64>,
    consumer_chunk: CachePadded<Atomic<XaddChunk<T>>>,
    chunk_mask: u64,
    chunk_shift: u32,
    /// `None` when pooling is disabled.
    pool: Option<SpscArrayQueue<PooledChunk<T>>>,
}

impl<T: Send> XaddCore<T> {
    /// `sequenced` gives pooled chunks per-slot sequences, which racing consumers need.
    pub(crate) fn new(config: XaddConfig, sequenced: bool) -> Result<Self> {
        let chunk_size = config.validated_chunk_size()?;
        let pooling = config.max_pooled_chunks > 0;
        tracing::trace!(
            chunk_size,
            max_pooled_chunks = config.max_pooled_chunks,
            sequenced,
            "xadd queue created"
        );

        let pool = if pooling {
            let pool = SpscArrayQueue::with_capacity(config.max_pooled_chunks)?;
            // The first chunk counts against the pool budget.
            for _ in 1..config.max_pooled_chunks {
                let chunk = Box::new(XaddChunk::new(NOT_USED, chunk_size, true, sequenced));
                // SAFETY: nothing else can reach the pool yet, and it has room for every
                // pooled chunk.
                let pooled = unsafe { pool.offer(PooledChunk(NonNull::from(Box::leak(chunk)))) };
                debug_assert!(pooled.is_ok());
            }
            Some(pool)
        } else {
            None
        };

        let first: *const XaddChunk<T> =
            Box::into_raw(Box::new(XaddChunk::new(0, chunk_size, pooling, sequenced)));

        Ok(Self {
            producer_index: CachePadded::new(AtomicU64::new(0)),
            producer: CachePadded::new(ProducerChunk {
                chunk: Atomic::from(first),
                chunk_index: AtomicI64::new(0),
            }),
            consumer_index: CachePadded::new(AtomicU64::new(0)),
            consumer_chunk: CachePadded::new(Atomic::from(first)),
            chunk_mask: chunk_size as u64 - 1,
            chunk_shift: chunk_size.trailing_zeros(),
            pool,
        })
    }

    /// Offset within its chunk and chunk index of a queue index.
    #[inline(always)]
    fn position(&self, index: u64) -> (usize, i64) {
        ((index & self.chunk_mask) as usize, (index >> self.chunk_shift) as i64)
    }

    /// Claims one index and publishes `e` there. Never fails.
    pub(crate) fn offer(&self, e: T) {
        let guard = &epoch::pin();
        let index = self.producer_index.fetch_add(1, Ordering::AcqRel);
        let (offset, chunk_index) = self.position(index);

        let mut chunk = self.producer.chunk.load(Ordering::Acquire, guard);
        // SAFETY: every chunk a producer can reach is either pooled, and so lives as long as
        // the queue, or retired through the epoch this thread is pinned in.
        if unsafe { chunk.deref() }.index() != chunk_index {
            chunk = self.producer_chunk_for_index(chunk, chunk_index, guard);
        }
        unsafe { publish(chunk.deref(), offset, chunk_index, e) };
    }

    /// Claims `limit` consecutive indices with one fetch-and-add and fills them in order.
    pub(crate) fn fill(&self, mut supplier: impl FnMut() -> T, limit: usize) -> usize {
        let guard = &epoch::pin();
        let mut index = self.producer_index.fetch_add(limit as u64, Ordering::AcqRel);
        let mut chunk: Shared<'_, XaddChunk<T>> = Shared::null();
        for _ in 0..limit {
            let (offset, chunk_index) = self.position(index);
            if chunk.is_null() || unsafe { chunk.deref() }.index() != chunk_index {
                chunk = self.producer_chunk_for_index(chunk, chunk_index, guard);
            }
            unsafe { publish(chunk.deref(), offset, chunk_index, supplier()) };
            index += 1;
        }
        limit
    }

    /// Finds the chunk with index `required`, appending chunks when it does not exist yet.
    fn producer_chunk_for_index<'g>(
        &self,
        initial: Shared<'g, XaddChunk<T>>,
        required: i64,
        guard: &'g Guard,
    ) -> Shared<'g, XaddChunk<T>> {
        let backoff = Backoff::new();
        let mut current = initial;
        let jump_backward = loop {
            if current.is_null() {
                current = self.producer.chunk.load(Ordering::Acquire, guard);
            }
            let current_index = unsafe { current.deref() }.index();
            debug_assert_ne!(current_index, NOT_USED);

            let jump_backward = current_index - required;
            if jump_backward >= 0 {
                break jump_backward;
            }
            // Only a chunk that is still the frontier can be appended to.
            if self.producer.chunk_index.load(Ordering::Acquire) == current_index {
                current = self.append_next_chunks(current, current_index, -jump_backward, guard);
            } else {
                current = Shared::null();
            }
            if current.is_null() {
                spin(&backoff);
            }
        };

        for _ in 0..jump_backward {
            // The consumer only unlinks `prev` after consuming the element at `required`,
            // which has not been written yet.
            current = unsafe { current.deref() }.prev(guard);
            assert!(!current.is_null(), "xadd chunk chain broken behind the producer");
        }
        debug_assert_eq!(unsafe { current.deref() }.index(), required);
        current
    }

    /// Links `count` chunks after `current`, returning the last one, or null if another
    /// thread is already appending.
    fn append_next_chunks<'g>(
        &self,
        current: Shared<'g, XaddChunk<T>>,
        current_index: i64,
        count: i64,
        guard: &'g Guard,
    ) -> Shared<'g, XaddChunk<T>> {
        if self
            .producer
            .chunk_index
            .compare_exchange(current_index, ROTATION, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return Shared::null();
        }

        let mut current = current;
        for i in 1..=count {
            let next = self.new_or_pooled_chunk(current, current_index + i, guard);
            self.producer.chunk.store(next, Ordering::Release);
            // Linked last: the consumer treats a non-null `next` as a finished chunk.
            unsafe { current.deref() }.set_next(next);
            current = next;
        }
        self.producer.chunk_index.store(current_index + count, Ordering::Release);
        current
    }

    fn new_or_pooled_chunk<'g>(
        &self,
        prev: Shared<'g, XaddChunk<T>>,
        index: i64,
        guard: &'g Guard,
    ) -> Shared<'g, XaddChunk<T>> {
        if let Some(pool) = &self.pool {
            // SAFETY: pool polls only happen while holding `ROTATION`.
            if let Some(PooledChunk(chunk)) = unsafe { pool.poll() } {
                let chunk: Shared<'g, XaddChunk<T>> = Shared::from(chunk.as_ptr() as *const _);
                let reused = unsafe { chunk.deref() };
                debug_assert!(reused.index() < unsafe { prev.deref() }.index());
                reused.set_prev(prev);
                // Publishes `prev` to producers that find this chunk by index.
                reused.set_index(index);
                return chunk;
            }
            tracing::trace!(index, "chunk pool empty, allocating");
        }

        let capacity = self.chunk_mask as usize + 1;
        let chunk = XaddChunk::new(index, capacity, false, false);
        chunk.set_prev(prev);
        Owned::new(chunk).into_shared(guard)
    }

    /// Unlinks the drained `current` chunk and makes `next` the consumer chunk.
    ///
    /// SAFETY: the caller is the consumer that claimed the first index of `next`.
    unsafe fn move_to_next_consumer_chunk<'g>(
        &self,
        current: Shared<'g, XaddChunk<T>>,
        next: Shared<'g, XaddChunk<T>>,
        guard: &'g Guard,
    ) {
        let chunk = current.deref();
        chunk.set_next(Shared::null());
        next.deref().set_prev(Shared::null());

        // Pool offers are serialized by the consumer chunk hand-over.
        let recycled = match &self.pool {
            Some(pool) if chunk.is_pooled() => pool
                .offer(PooledChunk(NonNull::new_unchecked(current.as_raw() as *mut _)))
                .is_ok(),
            _ => false,
        };
        self.consumer_chunk.store(next, Ordering::Release);
        if !recycled {
            guard.defer_destroy(current);
        }
    }

    #[inline]
    fn claim_consumer_index(&self, index: u64) -> bool {
        self.consumer_index
            .compare_exchange(index, index + 1, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }
}

/// Writes `e` into a claimed slot.
///
/// SAFETY: the caller claimed the queue index mapping to `offset` of chunk `chunk_index`.
#[inline]
unsafe fn publish<T>(chunk: &XaddChunk<T>, offset: usize, chunk_index: i64, e: T) {
    let slot = chunk.slot(offset);
    if chunk.is_sequenced() {
        // A consumer from the chunk's previous life may still be moving its element out.
        slot.spin_until_empty();
        slot.publish(e);
        chunk.set_sequence(offset, chunk_index);
    } else {
        slot.publish(e);
    }
}

impl<T> IndexedQueue for XaddCore<T> {
    fn lv_producer_index(&self) -> u64 {
        self.producer_index.load(Ordering::Acquire)
    }

    fn lv_consumer_index(&self) -> u64 {
        self.consumer_index.load(Ordering::Acquire)
    }

    fn capacity(&self) -> usize {
        UNBOUNDED_CAPACITY
    }
}

impl<T> Drop for XaddCore<T> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` means no thread is inside an operation. Linked chunks and pooled
        // chunks are disjoint; retired chunks belong to the epoch collector.
        unsafe {
            let guard = epoch::unprotected();
            let mut chunk = self.consumer_chunk.load(Ordering::Relaxed, guard);
            while !chunk.is_null() {
                let next = chunk.deref().next(guard);
                drop(chunk.into_owned());
                chunk = next;
            }
            if let Some(pool) = &self.pool {
                while let Some(PooledChunk(chunk)) = pool.poll() {
                    drop(Box::from_raw(chunk.as_ptr()));
                }
            }
        }
    }
}
