//! Lock-free and wait-free queues for passing values between threads, for every producer and
//! consumer cardinality, bounded and unbounded.
//!
//! Four families are provided:
//!
//! - [`bounded`]: fixed-capacity circular arrays ([`spsc`], [`mpsc`], [`spmc`], [`mpmc`]).
//! - [`chunked`]: arrays that grow by linking new chunks instead of copying, either without
//!   bound or up to a maximum ([`spsc_chunked`], [`mpsc_chunked`]).
//! - [`xadd`]: unbounded chunked queues whose producers claim slots with a single
//!   fetch-and-add and recycle drained chunks through a small pool ([`mpsc_xadd`],
//!   [`mpmc_xadd`]).
//! - [`linked`]: the classic node-per-element queue ([`spsc_linked`], [`mpsc_linked`]).
//!
//! Every constructor returns a producer handle and a consumer handle. The handle types only
//! allow what the algorithm behind them supports: a [`Producer`] is only `Clone` for
//! multi-producer queues, a [`Consumer`] is never shared, and multi-consumer queues hand out a
//! cloneable [`SharedConsumer`].
//!
//! Nothing here blocks. `offer` hands the element back when a bounded queue is full and
//! `poll` returns `None` when the queue is empty; waiting is up to the caller, or to the
//! `fill_with`/`drain_with` loops and a [`WaitStrategy`].
//!
//! If you only need one value at a time through a bounded MPMC channel with blocking receives,
//! you are better off with a channel crate such as flume.

pub mod bounded;
pub mod chunked;
pub mod linked;
pub mod xadd;

mod config;
mod error;
mod handle;
mod loom_exports;
mod queue;
mod slot;
mod util;

pub use bounded::{mpmc, mpsc, spmc, spsc, MpmcArrayQueue, MpscArrayQueue, SpmcArrayQueue, SpscArrayQueue};
pub use chunked::{mpsc_chunked, spsc_chunked, MpscLinkedArrayQueue, SpscLinkedArrayQueue};
pub use config::{GrowthPolicy, XaddConfig};
pub use error::{Error, Result};
pub use handle::{Consumer, Producer, SharedConsumer};
pub use linked::{mpsc_linked, spsc_linked, MpscLinkedQueue, SpscLinkedQueue};
pub use queue::{
    BackoffWait,
    ExitCondition,
    MultiConsumer,
    MultiProducer,
    RawQueue,
    SingleConsumer,
    WaitStrategy,
    UNBOUNDED_CAPACITY,
};
pub use xadd::{mpmc_xadd, mpsc_xadd, MpmcUnboundedXaddArrayQueue, MpscUnboundedXaddArrayQueue};
