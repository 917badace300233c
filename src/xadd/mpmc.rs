use core::sync::atomic::Ordering;

use crossbeam_epoch::{self as epoch, Guard, Shared};
use crossbeam_utils::Backoff;

use crate::config::XaddConfig;
use crate::error::Result;
use crate::handle::{Producer, SharedConsumer};
use crate::loom_exports::sync::{atomic::fence, Arc};
use crate::queue::{MultiConsumer, MultiProducer, RawQueue, UNBOUNDED_CAPACITY};
use crate::slot::FULL;
use crate::util::{self, spin};

use super::chunk::XaddChunk;
use super::XaddCore;

/// Unbounded multi-producer multi-consumer queue.
///
/// Producers claim with a fetch-and-add, consumers with a CAS on the consumer index. The
/// consumer that claims the first index of a chunk also moves the consumer chunk forward,
/// appending the chunk itself if no producer has done so yet.
pub struct MpmcUnboundedXaddArrayQueue<T> {
    core: XaddCore<T>,
}

/// Creates a fetch-and-add MPMC queue.
pub fn mpmc_xadd<T: Send>(
    config: XaddConfig,
) -> Result<(
    Producer<MpmcUnboundedXaddArrayQueue<T>>,
    SharedConsumer<MpmcUnboundedXaddArrayQueue<T>>,
)> {
    let queue = Arc::new(MpmcUnboundedXaddArrayQueue {
        core: XaddCore::new(config, true)?,
    });
    Ok((Producer::new(queue.clone()), SharedConsumer::new(queue)))
}

/// Whether the element for `chunk_index` is published at `offset` of `chunk`.
///
/// Pooled chunks answer through the slot sequence, since their slot state may still belong to
/// a previous life of the chunk.
#[inline]
fn is_published<T>(chunk: &XaddChunk<T>, offset: usize, chunk_index: i64) -> bool {
    if chunk.is_sequenced() {
        chunk.sequence(offset) == chunk_index
    } else {
        chunk.index() == chunk_index && chunk.slot(offset).state() == FULL
    }
}

impl<T: Send> MpmcUnboundedXaddArrayQueue<T> {
    /// Strict emptiness check against a cached producer index, refreshed only when the
    /// consumer index has caught up with the cache.
    #[inline]
    fn is_drained(&self, index: u64, producer_index: &mut u64) -> bool {
        if index < *producer_index {
            return false;
        }
        *producer_index = self.core.producer_index.load(Ordering::Acquire);
        index == *producer_index
    }

    /// Moves the consumer onto the chunk after `current` and takes its first element. The
    /// caller has claimed that element's index.
    unsafe fn rotate_and_take<'g>(
        &self,
        current: Shared<'g, XaddChunk<T>>,
        next: Shared<'g, XaddChunk<T>>,
        chunk_index: i64,
        guard: &'g Guard,
    ) -> T {
        let core = &self.core;
        let chunk = current.deref();
        let mut next = next;
        if next.is_null()
            && core.producer.chunk_index.load(Ordering::Acquire) == chunk_index - 1
        {
            next = core.append_next_chunks(current, chunk_index - 1, 1, guard);
        }
        if next.is_null() {
            next = chunk.spin_for_next(guard);
        }

        let successor = next.deref();
        let slot = successor.slot(0);
        if successor.is_sequenced() {
            successor.spin_for_sequence(0, chunk_index);
        } else {
            slot.spin_until_published();
        }
        let e = slot.take();
        core.move_to_next_consumer_chunk(current, next, guard);
        e
    }

    fn peek_copy(&self, strict: bool) -> Option<T>
    where
        T: Copy,
    {
        let core = &self.core;
        let guard = &epoch::pin();
        let backoff = Backoff::new();
        loop {
            let index = core.consumer_index.load(Ordering::Acquire);
            let (offset, chunk_index) = core.position(index);
            let current = core.consumer_chunk.load(Ordering::Acquire, guard);
            let mut chunk = unsafe { current.deref() };

            if offset == 0 && index != 0 {
                if chunk.index() != chunk_index - 1 {
                    spin(&backoff);
                    continue;
                }
                let next = chunk.next(guard);
                if next.is_null() {
                    if !strict || core.producer_index.load(Ordering::Acquire) == index {
                        return None;
                    }
                    spin(&backoff);
                    continue;
                }
                chunk = unsafe { next.deref() };
            }

            if is_published(chunk, offset, chunk_index) {
                // Seqlock read: a pooled chunk may be refilled under the copy.
                let value = chunk.slot(offset).read_volatile();
                fence(Ordering::Acquire);
                // Still unclaimed, so the copy was taken from a live element.
                if core.consumer_index.load(Ordering::Relaxed) == index {
                    return Some(unsafe { value.assume_init() });
                }
            } else if !strict || core.producer_index.load(Ordering::Acquire) == index {
                return None;
            }
            spin(&backoff);
        }
    }
}

unsafe impl<T: Send> RawQueue for MpmcUnboundedXaddArrayQueue<T> {
    type Item = T;

    fn capacity(&self) -> usize {
        UNBOUNDED_CAPACITY
    }

    fn size(&self) -> usize {
        util::size(&self.core, 0)
    }

    fn is_empty(&self) -> bool {
        util::is_empty(&self.core, 0)
    }

    unsafe fn offer(&self, e: T) -> core::result::Result<(), T> {
        self.core.offer(e);
        Ok(())
    }

    unsafe fn fill<F>(&self, supplier: F, limit: usize) -> usize
    where
        F: FnMut() -> T,
    {
        self.core.fill(supplier, limit)
    }

    unsafe fn poll(&self) -> Option<T> {
        let core = &self.core;
        let guard = &epoch::pin();
        let backoff = Backoff::new();
        let mut producer_index = 0;
        loop {
            let index = core.consumer_index.load(Ordering::Acquire);
            let current = core.consumer_chunk.load(Ordering::Acquire, guard);
            let chunk = current.deref();
            let (offset, chunk_index) = core.position(index);

            if offset == 0 && index != 0 {
                // Anything but the predecessor means a stale view of the consumer chunk.
                if chunk.index() == chunk_index - 1 {
                    let next = chunk.next(guard);
                    if next.is_null() && self.is_drained(index, &mut producer_index) {
                        return None;
                    }
                    if core.claim_consumer_index(index) {
                        return Some(self.rotate_and_take(current, next, chunk_index, guard));
                    }
                }
            } else if is_published(chunk, offset, chunk_index) {
                if core.claim_consumer_index(index) {
                    return Some(chunk.slot(offset).take());
                }
            } else if self.is_drained(index, &mut producer_index) {
                return None;
            }
            spin(&backoff);
        }
    }

    unsafe fn relaxed_poll(&self) -> Option<T> {
        let core = &self.core;
        let guard = &epoch::pin();
        let index = core.consumer_index.load(Ordering::Acquire);
        let current = core.consumer_chunk.load(Ordering::Acquire, guard);
        let chunk = current.deref();
        let (offset, chunk_index) = core.position(index);

        if offset == 0 && index != 0 {
            if chunk.index() != chunk_index - 1 {
                return None;
            }
            let next = chunk.next(guard);
            if next.is_null()
                || !is_published(next.deref(), 0, chunk_index)
                || !core.claim_consumer_index(index)
            {
                return None;
            }
            let e = next.deref().slot(0).take();
            core.move_to_next_consumer_chunk(current, next, guard);
            Some(e)
        } else {
            if !is_published(chunk, offset, chunk_index) || !core.claim_consumer_index(index) {
                return None;
            }
            Some(chunk.slot(offset).take())
        }
    }
}

unsafe impl<T: Send> MultiProducer for MpmcUnboundedXaddArrayQueue<T> {}

unsafe impl<T: Send> MultiConsumer for MpmcUnboundedXaddArrayQueue<T> {
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
