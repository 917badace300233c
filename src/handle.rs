//! Producer and consumer handles.
//!
//! Every constructor in this crate returns a handle pair. The handle types carry the
//! producer/consumer cardinality of the queue behind them: a [`Producer`] can only be cloned
//! when the queue accepts concurrent producers, a [`Consumer`] is never cloned, and
//! multi-consumer queues hand out a [`SharedConsumer`] instead. Single-role handles can be
//! moved to another thread but not shared with one.

use core::{cell::Cell, marker::PhantomData};

use crate::loom_exports::sync::Arc;
use crate::queue::{
    ExitCondition,
    MultiConsumer,
    MultiProducer,
    RawQueue,
    SingleConsumer,
    WaitStrategy,
    UNBOUNDED_CAPACITY,
};
use crate::util::recommended_offer_batch;

/// `fill_all` on an unbounded queue stops once it has inserted more than this many elements.
const UNBOUNDED_FILL_LIMIT: usize = 4096;

type NotSync = PhantomData<Cell<()>>;

/// The producing side of a queue.
pub struct Producer<Q> {
    queue: Arc<Q>,
    _not_sync: NotSync,
}

/// The consuming side of a single-consumer queue.
pub struct Consumer<Q> {
    queue: Arc<Q>,
    _not_sync: NotSync,
}

/// The consuming side of a multi-consumer queue.
pub struct SharedConsumer<Q> {
    queue: Arc<Q>,
}

impl<Q: RawQueue> Producer<Q> {
    pub(crate) fn new(queue: Arc<Q>) -> Self {
        Self {
            queue,
            _not_sync: PhantomData,
        }
    }

    pub(crate) fn queue(&self) -> &Q {
        &self.queue
    }

    /// Inserts `e`, or hands it back if the queue was full when the attempt was made.
    #[inline]
    pub fn offer(&self, e: Q::Item) -> Result<(), Q::Item> {
        // SAFETY: this handle is `!Sync` and only `Clone` for `MultiProducer` queues.
        unsafe { self.queue.offer(e) }
    }

    /// An `offer` that may report full slightly early in exchange for lower overhead.
    #[inline]
    pub fn relaxed_offer(&self, e: Q::Item) -> Result<(), Q::Item> {
        unsafe { self.queue.relaxed_offer(e) }
    }

    /// Inserts up to `limit` elements produced by `supplier`. `supplier` is only called for
    /// slots that have already been claimed.
    pub fn fill(&self, supplier: impl FnMut() -> Q::Item, limit: usize) -> usize {
        if limit == 0 {
            return 0;
        }
        unsafe { self.queue.fill(supplier, limit) }
    }

    /// Fills a bounded queue up to its capacity, or an unbounded queue in batches until a
    /// batch makes no progress or a few thousand elements went in.
    pub fn fill_all(&self, mut supplier: impl FnMut() -> Q::Item) -> usize {
        let capacity = self.queue.capacity();
        if capacity != UNBOUNDED_CAPACITY {
            return self.fill(supplier, capacity);
        }

        let batch = recommended_offer_batch();
        let mut filled = 0;
        loop {
            let n = self.fill(&mut supplier, batch);
            if n == 0 {
                return filled;
            }
            filled += n;
            if filled > UNBOUNDED_FILL_LIMIT {
                return filled;
            }
        }
    }

    /// Keeps filling while `exit` says so, idling through `wait` whenever the queue is full.
    pub fn fill_with(
        &self,
        mut supplier: impl FnMut() -> Q::Item,
        mut wait: impl WaitStrategy,
        mut exit: impl ExitCondition,
    ) {
        let batch = recommended_offer_batch();
        let mut idle_counter = 0;
        while exit.keep_running() {
            if self.fill(&mut supplier, batch) == 0 {
                idle_counter = wait.idle(idle_counter);
                continue;
            }
            idle_counter = 0;
        }
    }

    pub fn size(&self) -> usize {
        self.queue.size()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }
}

impl<Q: MultiProducer> Clone for Producer<Q> {
    fn clone(&self) -> Self {
        Self::new(self.queue.clone())
    }
}

impl<Q: SingleConsumer> Consumer<Q> {
    pub(crate) fn new(queue: Arc<Q>) -> Self {
        Self {
            queue,
            _not_sync: PhantomData,
        }
    }

    /// Removes the next element, `None` iff the queue is empty.
    #[inline]
    pub fn poll(&self) -> Option<Q::Item> {
        // SAFETY: this handle is `!Sync` and never cloned.
        unsafe { self.queue.poll() }
    }

    /// A `poll` that may miss an element whose producer has not finished publishing it.
    #[inline]
    pub fn relaxed_poll(&self) -> Option<Q::Item> {
        unsafe { self.queue.relaxed_poll() }
    }

    /// The element `poll` would return, left in the queue.
    #[inline]
    pub fn peek(&mut self) -> Option<&Q::Item> {
        // SAFETY: the element stays in place until the next poll, which the `&mut` borrow
        // rules out while the reference is alive.
        unsafe { self.queue.peek().map(|e| &*e.as_ptr()) }
    }

    #[inline]
    pub fn relaxed_peek(&mut self) -> Option<&Q::Item> {
        unsafe { self.queue.relaxed_peek().map(|e| &*e.as_ptr()) }
    }

    /// Passes up to `limit` elements to `consumer`, stopping early when the queue looks empty.
    pub fn drain(&self, consumer: impl FnMut(Q::Item), limit: usize) -> usize {
        unsafe { self.queue.drain(consumer, limit) }
    }

    /// Drains up to `capacity()` elements, or until empty for unbounded queues.
    pub fn drain_all(&self, consumer: impl FnMut(Q::Item)) -> usize {
        unsafe { drain_all(&*self.queue, consumer) }
    }

    /// Keeps draining while `exit` says so, idling through `wait` whenever the queue is empty.
    pub fn drain_with(
        &self,
        consumer: impl FnMut(Q::Item),
        wait: impl WaitStrategy,
        exit: impl ExitCondition,
    ) {
        unsafe { drain_with(&*self.queue, consumer, wait, exit) }
    }

    pub fn size(&self) -> usize {
        self.queue.size()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }
}

impl<Q: MultiConsumer> SharedConsumer<Q> {
    pub(crate) fn new(queue: Arc<Q>) -> Self {
        Self { queue }
    }

    /// Removes the next element, `None` iff the queue is empty.
    #[inline]
    pub fn poll(&self) -> Option<Q::Item> {
        // SAFETY: the queue is `MultiConsumer`.
        unsafe { self.queue.poll() }
    }

    #[inline]
    pub fn relaxed_poll(&self) -> Option<Q::Item> {
        unsafe { self.queue.relaxed_poll() }
    }

    /// A copy of the element `poll` would return. Another consumer may take the element at
    /// any moment, which is why it cannot be borrowed in place.
    #[inline]
    pub fn peek(&self) -> Option<Q::Item>
    where
        Q::Item: Copy,
    {
        self.queue.peek()
    }

    #[inline]
    pub fn relaxed_peek(&self) -> Option<Q::Item>
    where
        Q::Item: Copy,
    {
        self.queue.relaxed_peek()
    }

    pub fn drain(&self, consumer: impl FnMut(Q::Item), limit: usize) -> usize {
        unsafe { self.queue.drain(consumer, limit) }
    }

    pub fn drain_all(&self, consumer: impl FnMut(Q::Item)) -> usize {
        unsafe { drain_all(&*self.queue, consumer) }
    }

    pub fn drain_with(
        &self,
        consumer: impl FnMut(Q::Item),
        wait: impl WaitStrategy,
        exit: impl ExitCondition,
    ) {
        unsafe { drain_with(&*self.queue, consumer, wait, exit) }
    }

    pub fn size(&self) -> usize {
        self.queue.size()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }
}

impl<Q: MultiConsumer> Clone for SharedConsumer<Q> {
    fn clone(&self) -> Self {
        Self::new(self.queue.clone())
    }
}

unsafe fn drain_all<Q: RawQueue>(queue: &Q, mut consumer: impl FnMut(Q::Item)) -> usize {
    let capacity = queue.capacity();
    if capacity != UNBOUNDED_CAPACITY {
        return queue.drain(consumer, capacity);
    }

    let mut drained = 0;
    while let Some(e) = queue.relaxed_poll() {
        drained += 1;
        consumer(e);
    }
    drained
}

unsafe fn drain_with<Q: RawQueue>(
    queue: &Q,
    mut consumer: impl FnMut(Q::Item),
    mut wait: impl WaitStrategy,
    mut exit: impl ExitCondition,
) {
    let mut idle_counter = 0;
    while exit.keep_running() {
        match queue.relaxed_poll() {
            Some(e) => {
                idle_counter = 0;
                consumer(e);
            }
            None => idle_counter = wait.idle(idle_counter),
        }
    }
}
