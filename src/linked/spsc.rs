use core::ptr::NonNull;

use crate::error::Result;
use crate::handle::{Consumer, Producer};
use crate::loom_exports::sync::Arc;
use crate::queue::{RawQueue, SingleConsumer, UNBOUNDED_CAPACITY};

use super::LinkedCore;

/// Unbounded single-producer single-consumer node queue. Same chain as [`super::MpscLinkedQueue`],
/// with a plain store in place of the exchange.
pub struct SpscLinkedQueue<T> {
    core: LinkedCore<T>,
}

/// Creates a linked-node SPSC queue.
pub fn spsc_linked<T: Send>() -> Result<(Producer<SpscLinkedQueue<T>>, Consumer<SpscLinkedQueue<T>>)>
{
    tracing::trace!("linked spsc queue created");
    let queue = Arc::new(SpscLinkedQueue { core: LinkedCore::new() });
    Ok((Producer::new(queue.clone()), Consumer::new(queue)))
}

unsafe impl<T: Send> RawQueue for SpscLinkedQueue<T> {
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
        self.core.offer(e, true);
        Ok(())
    }

    unsafe fn fill<F>(&self, supplier: F, limit: usize) -> usize
    where
        F: FnMut() -> T,
    {
        self.core.fill(supplier, limit, true)
    }

    unsafe fn poll(&self) -> Option<T> {
        self.core.poll(true)
    }

    unsafe fn relaxed_poll(&self) -> Option<T> {
        self.core.poll(false)
    }
}

unsafe impl<T: Send> SingleConsumer for SpscLinkedQueue<T> {
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
    fn test_fifo_and_size() {
        let (tx, mut rx) = spsc_linked().unwrap();
        for i in 0..100 {
            tx.offer(i).unwrap();
        }
        assert_eq!(tx.size(), 100);
        assert_eq!(rx.peek(), Some(&0));
        for i in 0..100 {
            assert_eq!(rx.poll(), Some(i));
        }
        assert_eq!(rx.poll(), None);
        assert!(rx.is_empty());
    }

    #[test]
    fn test_fill_with_stops_on_exit() {
        let (tx, rx) = spsc_linked().unwrap();
        let mut rounds = 0;
        let mut next = 0;
        tx.fill_with(
            || {
                next += 1;
                next
            },
            crate::queue::BackoffWait::new(),
            || {
                rounds += 1;
                rounds <= 2
            },
        );
        // Two batches went in.
        assert_eq!(rx.size(), next);
        let mut expected = 1;
        while let Some(e) = rx.poll() {
            assert_eq!(e, expected);
            expected += 1;
        }
        assert_eq!(expected, next + 1);
    }

    #[test]
    fn test_threaded_fifo() {
        const N: usize = 100_000;
        let (tx, rx) = spsc_linked().unwrap();
        let producer = std::thread::spawn(move || {
            for i in 0..N {
                tx.offer(i).unwrap();
            }
        });
        let mut expected = 0;
        while expected < N {
            if let Some(e) = rx.poll() {
                assert_eq!(e, expected);
                expected += 1;
            }
        }
        producer.join().unwrap();
        assert_eq!(rx.poll(), None);
    }
}
