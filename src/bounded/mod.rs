//! Fixed-capacity circular-array queues.
//!
//! All four share the same shape: a power-of-two array of slots addressed by
//! `index & mask`, a producer index and a consumer index, each on its own cache line. They
//! differ in how a thread claims an index and how the other side learns that a claimed slot
//! is ready:
//!
//! | Queue | Producer claim | Consumer claim | Readiness |
//! |---|---|---|---|
//! | [`SpscArrayQueue`] | plain store | plain store | slot state, with producer look-ahead |
//! | [`MpscArrayQueue`] | CAS | plain store | slot state, consumer spins over in-flight writes |
//! | [`SpmcArrayQueue`] | plain store | CAS | slot state, consumers spin over in-flight reads |
//! | [`MpmcArrayQueue`] | CAS | CAS | per-slot lap sequence |

mod mpmc;
mod mpsc;
mod spmc;
mod spsc;

pub use mpmc::{mpmc, MpmcArrayQueue};
pub use mpsc::{mpsc, MpscArrayQueue};
pub use spmc::{spmc, SpmcArrayQueue};
pub use spsc::{spsc, SpscArrayQueue};

use crate::error::{Error, Result};
use crate::util::round_to_power_of_two;

/// Effective capacity of the MPSC and SPMC rings: a power of two, at least 2.
fn ring_capacity(requested: usize) -> Result<usize> {
    if requested == 0 {
        return Err(Error::InvalidCapacity { requested, minimum: 1 });
    }
    round_to_power_of_two(requested.max(2))
}
