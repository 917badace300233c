use core::{ptr::NonNull, sync::atomic::Ordering};

use crossbeam_epoch::{self as epoch, Guard, Shared};

use crate::config::XaddConfig;
use crate::error::Result;
use crate::handle::{Consumer, Producer};
use crate::loom_exports::sync::Arc;
use crate::queue::{MultiProducer, RawQueue, SingleConsumer, UNBOUNDED_CAPACITY};
use crate::slot::{Slot, FULL};
use crate::util;

use super::chunk::XaddChunk;
use super::XaddCore;

/// Unbounded multi-producer single-consumer queue whose producers never contend on a CAS.
///
/// The single consumer takes every element of a chunk before moving on, so a pooled chunk
/// is always empty when it is reused and needs no sequences.
pub struct MpscUnboundedXaddArrayQueue<T> {
    core: XaddCore<T>,
}

/// Creates a fetch-and-add MPSC queue.
pub fn mpsc_xadd<T: Send>(
    config: XaddConfig,
) -> Result<(Producer<MpscUnboundedXaddArrayQueue<T>>, Consumer<MpscUnboundedXaddArrayQueue<T>>)>
{
    let queue = Arc::new(MpscUnboundedXaddArrayQueue {
        core: XaddCore::new(config, false)?,
    });
    Ok((Producer::new(queue.clone()), Consumer::new(queue)))
}

impl<T: Send> MpscUnboundedXaddArrayQueue<T> {
    /// Successor of `chunk` for a consumer standing at `index`, the first index of the
    /// successor. `None` when the queue looks empty.
    fn next_chunk<'g>(
        &self,
        chunk: &XaddChunk<T>,
        index: u64,
        strict: bool,
        guard: &'g Guard,
    ) -> Option<Shared<'g, XaddChunk<T>>> {
        let next = chunk.next(guard);
        if !next.is_null() {
            return Some(next);
        }
        if !strict || self.core.producer_index.load(Ordering::Acquire) == index {
            return None;
        }
        // Claimed but the producer is still linking the chunk.
        Some(chunk.spin_for_next(guard))
    }

    /// Slot holding the element at `index`, waiting for an in-flight write when strict.
    fn ready_slot<'a>(&self, slot: &'a Slot<T>, index: u64, strict: bool) -> Option<&'a Slot<T>> {
        if slot.state() != FULL {
            if !strict || self.core.producer_index.load(Ordering::Acquire) == index {
                return None;
            }
            slot.spin_until_published();
        }
        Some(slot)
    }

    unsafe fn poll_inner(&self, strict: bool) -> Option<T> {
        let core = &self.core;
        let guard = &epoch::pin();
        let index = core.consumer_index.load(Ordering::Relaxed);
        let (offset, _) = core.position(index);
        let current = core.consumer_chunk.load(Ordering::Relaxed, guard);

        let chunk = if offset == 0 && index != 0 {
            let next = self.next_chunk(current.deref(), index, strict, guard)?;
            // The move only happens together with a successful take.
            if !strict && next.deref().slot(0).state() != FULL {
                return None;
            }
            core.move_to_next_consumer_chunk(current, next, guard);
            next
        } else {
            current
        };

        let e = self.ready_slot(chunk.deref().slot(offset), index, strict)?.take();
        core.consumer_index.store(index + 1, Ordering::Release);
        Some(e)
    }

    unsafe fn peek_inner(&self, strict: bool) -> Option<NonNull<T>> {
        let core = &self.core;
        let guard = &epoch::pin();
        let index = core.consumer_index.load(Ordering::Relaxed);
        let (offset, _) = core.position(index);
        let mut chunk = core.consumer_chunk.load(Ordering::Relaxed, guard);
        if offset == 0 && index != 0 {
            chunk = self.next_chunk(chunk.deref(), index, strict, guard)?;
        }
        // The chunk outlives the guard: only this consumer retires chunks, and only once it
        // has polled past them.
        let slot = self.ready_slot(chunk.deref().slot(offset), index, strict)?;
        Some(slot.value_ptr())
    }
}

unsafe impl<T: Send> RawQueue for MpscUnboundedXaddArrayQueue<T> {
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
        self.poll_inner(true)
    }

    unsafe fn relaxed_poll(&self) -> Option<T> {
        self.poll_inner(false)
    }
}

unsafe impl<T: Send> MultiProducer for MpscUnboundedXaddArrayQueue<T> {}

unsafe impl<T: Send> SingleConsumer for MpscUnboundedXaddArrayQueue<T> {
    unsafe fn peek(&self) -> Option<NonNull<T>> {
        self.peek_inner(true)
    }

    unsafe fn relaxed_peek(&self) -> Option<NonNull<T>> {
        self.peek_inner(false)
    }
}
