use std::sync::OnceLock;

use crossbeam_utils::Backoff;

use crate::error::{Error, Result};
use crate::queue::UNBOUNDED_CAPACITY;

/// Upper bound on how far a single-producer queue looks ahead for free slots.
pub(crate) const MAX_LOOK_AHEAD_STEP: usize = 4096;

/// Rounds `value` up to the next power of two, failing when that would overflow.
pub(crate) fn round_to_power_of_two(value: usize) -> Result<usize> {
    value
        .checked_next_power_of_two()
        .ok_or(Error::CapacityOverflow { requested: value })
}

/// Maps a monotonic index onto a slot of a power-of-two ring.
#[inline(always)]
pub(crate) fn circular_offset(index: u64, mask: u64) -> usize {
    (index & mask) as usize
}

/// Same as [`circular_offset`] for queues whose indices advance in steps of two, the low bit
/// being reserved as a "resize in progress" flag. `mask` is expressed in that doubled space.
#[inline(always)]
pub(crate) fn modified_circular_offset(index: u64, mask: u64) -> usize {
    ((index & mask) >> 1) as usize
}

/// Signed distance `to - from` between two monotonic indices, valid across wrap-around.
#[inline(always)]
pub(crate) fn index_distance(from: u64, to: u64) -> i64 {
    to.wrapping_sub(from) as i64
}

/// Queues exposing their producer and consumer indices for size estimation.
pub(crate) trait IndexedQueue {
    fn lv_producer_index(&self) -> u64;
    fn lv_consumer_index(&self) -> u64;
    fn capacity(&self) -> usize;
}

/// Best-effort size computed from an index snapshot.
///
/// The consumer index is read on both sides of the producer index and the read is retried
/// until both consumer reads agree, so the pair is a snapshot the consumer was actually
/// at. The producer may still have moved, and with multiple producers the index can run ahead
/// of the published elements, so the result is sanitized into `[0, capacity]`.
/// `divisor` is the number of low index bits that do not count elements.
pub(crate) fn size<Q: IndexedQueue + ?Sized>(queue: &Q, divisor: u32) -> usize {
    let mut after = queue.lv_consumer_index();
    let size = loop {
        let before = after;
        let producer_index = queue.lv_producer_index();
        after = queue.lv_consumer_index();
        if before == after {
            break index_distance(after >> divisor, producer_index >> divisor);
        }
    };
    sanitized_size(queue.capacity(), size)
}

/// `true` when the consumer has caught up with the producer.
pub(crate) fn is_empty<Q: IndexedQueue + ?Sized>(queue: &Q, divisor: u32) -> bool {
    // Consumer index first: a producer index read after it can only be larger.
    let consumer_index = queue.lv_consumer_index() >> divisor;
    let producer_index = queue.lv_producer_index() >> divisor;
    index_distance(consumer_index, producer_index) <= 0
}

pub(crate) fn sanitized_size(capacity: usize, size: i64) -> usize {
    if size < 0 {
        return 0;
    }
    let size = usize::try_from(size).unwrap_or(usize::MAX);
    if capacity != UNBOUNDED_CAPACITY && size > capacity {
        capacity
    } else {
        size
    }
}

/// Batch size used when filling an unbounded queue without an explicit limit.
pub(crate) fn recommended_offer_batch() -> usize {
    static BATCH: OnceLock<usize> = OnceLock::new();
    *BATCH.get_or_init(|| {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            * 4
    })
}

/// One round of waiting for a peer's in-flight write.
#[inline(always)]
pub(crate) fn spin(backoff: &Backoff) {
    backoff.snooze();
    #[cfg(loom)]
    loom::hint::spin_loop();
}

#[cfg(test)]
mod test {
    use super::*;

    struct Indices {
        producer: u64,
        consumer: u64,
        capacity: usize,
    }

    impl IndexedQueue for Indices {
        fn lv_producer_index(&self) -> u64 {
            self.producer
        }

        fn lv_consumer_index(&self) -> u64 {
            self.consumer
        }

        fn capacity(&self) -> usize {
            self.capacity
        }
    }

    #[test]
    fn test_round_to_power_of_two() {
        assert_eq!(round_to_power_of_two(1), Ok(1));
        assert_eq!(round_to_power_of_two(3), Ok(4));
        assert_eq!(round_to_power_of_two(64), Ok(64));
        assert_eq!(round_to_power_of_two(65), Ok(128));
        assert!(round_to_power_of_two(usize::MAX).is_err());
    }

    #[test]
    fn test_offsets() {
        assert_eq!(circular_offset(0, 7), 0);
        assert_eq!(circular_offset(9, 7), 1);
        assert_eq!(circular_offset(u64::MAX, 7), 7);

        // Doubled index space: element n lives at index 2n.
        let mask = (8 - 1) << 1;
        assert_eq!(modified_circular_offset(0, mask), 0);
        assert_eq!(modified_circular_offset(6, mask), 3);
        assert_eq!(modified_circular_offset(16, mask), 0);
        assert_eq!(modified_circular_offset(18, mask), 1);
    }

    #[test]
    fn test_size_is_sanitized() {
        let q = Indices { producer: 10, consumer: 4, capacity: 8 };
        assert_eq!(size(&q, 0), 6);

        // Transient consumer overtaking the producer snapshot.
        let q = Indices { producer: 4, consumer: 5, capacity: 8 };
        assert_eq!(size(&q, 0), 0);
        assert!(is_empty(&q, 0));

        // Producer claims running ahead of capacity.
        let q = Indices { producer: 20, consumer: 4, capacity: 8 };
        assert_eq!(size(&q, 0), 8);

        let q = Indices { producer: 1 << 40, consumer: 0, capacity: UNBOUNDED_CAPACITY };
        assert_eq!(size(&q, 0), 1 << 40);
    }

    #[test]
    fn test_size_with_resize_bit() {
        // Resize in progress: producer index has the low bit set.
        let q = Indices { producer: 9, consumer: 4, capacity: 8 };
        assert_eq!(size(&q, 1), 2);

        let q = Indices { producer: 5, consumer: 4, capacity: 8 };
        assert_eq!(size(&q, 1), 0);
        assert!(is_empty(&q, 1));
    }
}
