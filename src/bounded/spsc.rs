use core::{ptr::NonNull, sync::atomic::Ordering};

use crossbeam_utils::CachePadded;

use crate::error::{Error, Result};
use crate::handle::{Consumer, Producer};
use crate::loom_exports::sync::{atomic::AtomicU64, Arc};
use crate::queue::{RawQueue, SingleConsumer};
use crate::slot::{Slot, FULL};
use crate::util::{self, circular_offset, round_to_power_of_two, IndexedQueue, MAX_LOOK_AHEAD_STEP};

const MIN_CAPACITY: usize = 4;

/// Producer-owned state. `limit` is a private cache: every index below it is known to map to
/// an empty slot.
struct ProducerState {
    index: AtomicU64,
    limit: AtomicU64,
}

/// Bounded single-producer single-consumer ring.
///
/// Neither side ever CASes. Fullness is decided by slot occupancy rather than by the consumer
/// index: when the producer runs into its cached limit it checks the slot `look_ahead_step`
/// positions ahead, and if that one is free, every slot up to it must be free too (the
/// consumer empties slots in order), so the limit can jump forward by a whole step.
pub struct SpscArrayQueue<T> {
    producer: CachePadded<ProducerState>,
    consumer_index: CachePadded<AtomicU64>,
    buffer: Box<[Slot<T>]>,
    mask: u64,
    look_ahead_step: u64,
}

/// Creates a bounded SPSC queue holding at least `capacity` elements.
///
/// The capacity is rounded up to a power of two, and to at least 4 so the look-ahead step
/// stays meaningful.
pub fn spsc<T: Send>(
    capacity: usize,
) -> Result<(Producer<SpscArrayQueue<T>>, Consumer<SpscArrayQueue<T>>)> {
    let queue = Arc::new(SpscArrayQueue::with_capacity(capacity)?);
    Ok((Producer::new(queue.clone()), Consumer::new(queue)))
}

impl<T> SpscArrayQueue<T> {
    pub(crate) fn with_capacity(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::InvalidCapacity { requested: capacity, minimum: 1 });
        }
        let capacity = round_to_power_of_two(capacity.max(MIN_CAPACITY))?;
        let look_ahead_step = (capacity / 4).min(MAX_LOOK_AHEAD_STEP) as u64;
        tracing::trace!(capacity, look_ahead_step, "spsc array queue created");

        Ok(Self {
            producer: CachePadded::new(ProducerState {
                index: AtomicU64::new(0),
                limit: AtomicU64::new(0),
            }),
            consumer_index: CachePadded::new(AtomicU64::new(0)),
            buffer: Slot::boxed_slice(capacity),
            mask: capacity as u64 - 1,
            look_ahead_step,
        })
    }

    #[inline(always)]
    fn slot(&self, index: u64) -> &Slot<T> {
        &self.buffer[circular_offset(index, self.mask)]
    }

    fn offer_slow_path(&self, index: u64) -> bool {
        let look_ahead = index + self.look_ahead_step;
        if self.slot(look_ahead).is_empty() {
            self.producer.limit.store(look_ahead, Ordering::Relaxed);
            true
        } else {
            self.slot(index).is_empty()
        }
    }

    /// Writes `e` at `index` and publishes the new producer index.
    #[inline(always)]
    unsafe fn write(&self, index: u64, e: T) {
        self.slot(index).publish(e);
        self.producer.index.store(index + 1, Ordering::Release);
    }
}

impl<T> IndexedQueue for SpscArrayQueue<T> {
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

unsafe impl<T: Send> RawQueue for SpscArrayQueue<T> {
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
        let index = self.producer.index.load(Ordering::Relaxed);
        if index >= self.producer.limit.load(Ordering::Relaxed) && !self.offer_slow_path(index) {
            return Err(e);
        }
        self.write(index, e);
        Ok(())
    }

    unsafe fn fill<F>(&self, mut supplier: F, limit: usize) -> usize
    where
        F: FnMut() -> T,
    {
        let mut index = self.producer.index.load(Ordering::Relaxed);
        let mut filled = 0;
        while filled < limit {
            if self.slot(index + self.look_ahead_step).is_empty() {
                let batch = (self.look_ahead_step as usize).min(limit - filled);
                for _ in 0..batch {
                    self.write(index, supplier());
                    index += 1;
                }
                filled += batch;
            } else {
                if !self.slot(index).is_empty() {
                    return filled;
                }
                self.write(index, supplier());
                index += 1;
                filled += 1;
            }
        }
        limit
    }

    unsafe fn poll(&self) -> Option<T> {
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

unsafe impl<T: Send> SingleConsumer for SpscArrayQueue<T> {
    unsafe fn peek(&self) -> Option<NonNull<T>> {
        let slot = self.slot(self.consumer_index.load(Ordering::Relaxed));
        if slot.state() != FULL {
            return None;
        }
        Some(slot.value_ptr())
    }
}

impl<T> Drop for SpscArrayQueue<T> {
    fn drop(&mut self) {
        for slot in self.buffer.iter_mut() {
            slot.drop_in_place();
        }
    }
}
