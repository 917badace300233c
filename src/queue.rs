use core::ptr::NonNull;

use crossbeam_utils::Backoff;

/// Value reported by [`RawQueue::capacity`] for queues without a bound.
pub const UNBOUNDED_CAPACITY: usize = usize::MAX;

/// The operations every queue algorithm implements.
///
/// Producer methods (`offer`, `relaxed_offer`, `fill`) and consumer methods (`poll`,
/// `relaxed_poll`, `drain`) are `unsafe` because each algorithm only tolerates the
/// concurrency it was designed for. The handles ([`crate::Producer`], [`crate::Consumer`],
/// [`crate::SharedConsumer`]) are the safe way in: they
/// can only be cloned when the queue implements [`MultiProducer`] or [`MultiConsumer`].
///
/// # Safety
///
/// Implementors guarantee that producer and consumer methods are data-race free when no
/// more than one thread calls producer methods at a time (any number when the queue is
/// [`MultiProducer`]) and no more than one thread calls consumer methods at a time (any number
/// when the queue is [`MultiConsumer`]). `capacity`, `size` and `is_empty` may be called from
/// any thread at any time.
pub unsafe trait RawQueue: Send + Sync {
    type Item;

    /// The fixed bound, or [`UNBOUNDED_CAPACITY`].
    fn capacity(&self) -> usize;

    /// Best-effort element count, always within `[0, capacity]`.
    fn size(&self) -> usize;

    /// Best-effort emptiness check. Never reports empty while an element whose offer has
    /// returned is still in the queue, as seen from the calling thread.
    fn is_empty(&self) -> bool;

    /// Inserts `e`, handing it back if the queue was full at the time of the attempt.
    ///
    /// # Safety
    ///
    /// The caller respects the producer cardinality described on the trait.
    unsafe fn offer(&self, e: Self::Item) -> Result<(), Self::Item>;

    /// Like [`RawQueue::offer`], but may report full slightly earlier than a strict
    /// `offer` would.
    ///
    /// # Safety
    ///
    /// Same as [`RawQueue::offer`].
    unsafe fn relaxed_offer(&self, e: Self::Item) -> Result<(), Self::Item> {
        self.offer(e)
    }

    /// Claims up to `limit` slots and fills them from `supplier`, returning how many were
    /// inserted. `supplier` is only called for slots that were already claimed.
    ///
    /// # Safety
    ///
    /// Same as [`RawQueue::offer`].
    unsafe fn fill<F>(&self, supplier: F, limit: usize) -> usize
    where
        F: FnMut() -> Self::Item;

    /// Removes the next element. `None` iff the queue is empty.
    ///
    /// # Safety
    ///
    /// The caller respects the consumer cardinality described on the trait.
    unsafe fn poll(&self) -> Option<Self::Item>;

    /// Like [`RawQueue::poll`], but may report empty while an in-flight element is about
    /// to become visible.
    ///
    /// # Safety
    ///
    /// Same as [`RawQueue::poll`].
    unsafe fn relaxed_poll(&self) -> Option<Self::Item> {
        self.poll()
    }

    /// Relaxed-polls up to `limit` elements into `consumer`, returning how many were taken.
    ///
    /// # Safety
    ///
    /// Same as [`RawQueue::poll`].
    unsafe fn drain<F>(&self, mut consumer: F, limit: usize) -> usize
    where
        F: FnMut(Self::Item),
    {
        for i in 0..limit {
            match self.relaxed_poll() {
                Some(e) => consumer(e),
                None => return i,
            }
        }
        limit
    }
}

/// Queues whose producer methods may run on any number of threads at once.
///
/// # Safety
///
/// `offer`, `relaxed_offer` and `fill` must be data-race free under concurrent calls.
pub unsafe trait MultiProducer: RawQueue {}

/// Queues with exactly one consumer, which may inspect the head element in place.
///
/// # Safety
///
/// The pointer returned by `peek` must stay valid until the consumer next polls.
pub unsafe trait SingleConsumer: RawQueue {
    /// The element `poll` would return, left in place.
    ///
    /// # Safety
    ///
    /// Only the single consumer may call this.
    unsafe fn peek(&self) -> Option<NonNull<Self::Item>>;

    /// # Safety
    ///
    /// Same as [`SingleConsumer::peek`].
    unsafe fn relaxed_peek(&self) -> Option<NonNull<Self::Item>> {
        self.peek()
    }
}

/// Queues whose consumer methods may run on any number of threads at once.
///
/// # Safety
///
/// `poll`, `relaxed_poll` and `drain` must be data-race free under concurrent calls.
pub unsafe trait MultiConsumer: RawQueue {
    /// A copy of the element `poll` would return. The copy is validated against the consumer
    /// index, so it is never a value another consumer had already taken.
    fn peek(&self) -> Option<Self::Item>
    where
        Self::Item: Copy;

    fn relaxed_peek(&self) -> Option<Self::Item>
    where
        Self::Item: Copy,
    {
        self.peek()
    }
}

/// Called by the spinning `drain_with`/`fill_with` loops when no progress was made.
pub trait WaitStrategy {
    /// Waits a little and returns the next idle counter. The counter is reset to zero after
    /// any progress.
    fn idle(&mut self, idle_counter: u32) -> u32;
}

impl<F> WaitStrategy for F
where
    F: FnMut(u32) -> u32,
{
    fn idle(&mut self, idle_counter: u32) -> u32 {
        self(idle_counter)
    }
}

/// Decides whether a spinning `drain_with`/`fill_with` loop carries on.
pub trait ExitCondition {
    fn keep_running(&mut self) -> bool;
}

impl<F> ExitCondition for F
where
    F: FnMut() -> bool,
{
    fn keep_running(&mut self) -> bool {
        self()
    }
}

/// Spin, then yield, using [`crossbeam_utils::Backoff`].
#[derive(Debug, Default)]
pub struct BackoffWait {
    backoff: Backoff,
}

impl BackoffWait {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WaitStrategy for BackoffWait {
    fn idle(&mut self, idle_counter: u32) -> u32 {
        if idle_counter == 0 {
            self.backoff.reset();
        }
        self.backoff.snooze();
        idle_counter.saturating_add(1)
    }
}
