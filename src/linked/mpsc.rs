use core::ptr::NonNull;

use crate::error::Result;
use crate::handle::{Consumer, Producer};
use crate::loom_exports::sync::Arc;
use crate::queue::{MultiProducer, RawQueue, SingleConsumer, UNBOUNDED_CAPACITY};

use super::LinkedCore;

/// Unbounded multi-producer single-consumer node queue.
///
/// `offer` allocates one node and exchanges it into the producer end, which always succeeds in
/// one step. `size()` walks the chain and is O(n).
pub struct MpscLinkedQueue<T> {
    core: LinkedCore<T>,
}

/// Creates a linked-node MPSC queue. Construction cannot fail; the `Result` keeps the
/// signature in line with the other constructors.
pub fn mpsc_linked<T: Send>() -> Result<(Producer<MpscLinkedQueue<T>>, Consumer<MpscLinkedQueue<T>>)>
{
    tracing::trace!("linked mpsc queue created");
    let queue = Arc::new(MpscLinkedQueue { core: LinkedCore::new() });
    Ok((Producer::new(queue.clone()), Consumer::new(queue)))
}

unsafe impl<T: Send> RawQueue for MpscLinkedQueue<T> {
    type Item = T;

    fn capacity(&self) -> usize {
        UNBOUNDED_CAPACITY
    }

    fn size(&self) -> usize {
        self.core.size()
    }

    fn is_empty(&self) -> bool {
        self.core.is_empty()
    }

    unsafe fn offer(&self, e: T) -> core::result::Result<(), T> {
        self.core.offer(e, false);
        Ok(())
    }

    unsafe fn fill<F>(&self, supplier: F, limit: usize) -> usize
    where
        F: FnMut() -> T,
    {
        self.core.fill(supplier, limit, false)
    }

    unsafe fn poll(&self) -> Option<T> {
        self.core.poll(true)
    }

    unsafe fn relaxed_poll(&self) -> Option<T> {
        self.core.poll(false)
    }
}

unsafe impl<T: Send> MultiProducer for MpscLinkedQueue<T> {}

unsafe impl<T: Send> SingleConsumer for MpscLinkedQueue<T> {
    unsafe fn peek(&self) -> Option<NonNull<T>> {
        self.core.peek(true)
    }

    unsafe fn relaxed_peek(&self) -> Option<NonNull<T>> {
        self.core.peek(false)
    }
}

#[cfg(all(test, not(loom)))]
mod test {
    use super::*;

    #[test]
    fn test_offer_poll_peek() {
        let (tx, mut rx) = mpsc_linked().unwrap();
        assert_eq!(tx.capacity(), UNBOUNDED_CAPACITY);
        assert!(rx.is_empty());
        assert_eq!(rx.poll(), None);
        assert_eq!(rx.peek(), None);

        tx.offer("a".to_string()).unwrap();
        tx.offer("b".to_string()).unwrap();
        assert_eq!(rx.size(), 2);
        assert!(!rx.is_empty());
        assert_eq!(rx.peek().map(String::as_str), Some("a"));
        assert_eq!(rx.relaxed_peek().map(String::as_str), Some("a"));
        assert_eq!(rx.poll().as_deref(), Some("a"));
        assert_eq!(rx.relaxed_poll().as_deref(), Some("b"));
        assert_eq!(rx.poll(), None);
        assert_eq!(rx.size(), 0);
        assert!(rx.is_empty());
    }

    #[test]
    fn test_fill_publishes_batch_in_order() {
        let (tx, rx) = mpsc_linked().unwrap();
        tx.offer(0).unwrap();
        let mut i = 0;
        assert_eq!(
            tx.fill(
                || {
                    i += 1;
                    i
                },
                5
            ),
            5
        );
        assert_eq!(tx.fill(|| unreachable!(), 0), 0);
        tx.offer(6).unwrap();
        assert_eq!(rx.size(), 7);

        let mut out = Vec::new();
        assert_eq!(rx.drain_all(|e| out.push(e)), 7);
        assert_eq!(out, (0..=6).collect::<Vec<_>>());
    }

    #[test]
    fn test_drop_frees_elements() {
        let marker = std::sync::Arc::new(());
        {
            let (tx, rx) = mpsc_linked().unwrap();
            for _ in 0..5 {
                tx.offer(marker.clone()).unwrap();
            }
            rx.poll().unwrap();
            assert_eq!(std::sync::Arc::strong_count(&marker), 5);
        }
        assert_eq!(std::sync::Arc::strong_count(&marker), 1);
    }

    #[test]
    fn test_threaded_with_concurrent_size() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 20_000;
        let (tx, rx) = mpsc_linked().unwrap();

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let tx = tx.clone();
                std::thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        tx.offer(p * PER_PRODUCER + i).unwrap();
                        if i % 1000 == 0 {
                            // Walks nodes the consumer may be retiring.
                            assert!(tx.size() <= PRODUCERS * PER_PRODUCER);
                        }
                    }
                })
            })
            .collect();

        let mut last_per_producer = vec![None; PRODUCERS];
        let mut received = 0;
        while received < PRODUCERS * PER_PRODUCER {
            if let Some(e) = rx.poll() {
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
        assert!(rx.is_empty());
    }
}
