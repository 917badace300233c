//! Construction parameters for the unbounded and growable queue families.

use crate::error::{Error, Result};
use crate::util::round_to_power_of_two;

/// How a chunk-linked queue sizes its chunks and whether it is bounded.
///
/// All sizes are rounded up to a power of two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrowthPolicy {
    /// Every chunk holds `chunk_size` slots and the queue never reports full.
    Unbounded { chunk_size: usize },

    /// Every chunk holds `chunk_size` slots; the queue holds at most `max_capacity` elements.
    Chunked { chunk_size: usize, max_capacity: usize },

    /// The first chunk holds `initial_capacity` slots and each new chunk doubles until a
    /// chunk can hold `max_capacity` elements on its own, after which no more chunks are
    /// linked.
    Growable { initial_capacity: usize, max_capacity: usize },
}

/// Growth rule of a validated policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Growth {
    Unbounded,
    Chunked,
    Growable,
}

/// A validated [`GrowthPolicy`]: first chunk length and bound, both powers of two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ChunkLayout {
    pub(crate) growth: Growth,
    pub(crate) chunk_capacity: usize,
    /// `None` when unbounded.
    pub(crate) max_capacity: Option<usize>,
}

const MPSC_MIN_CHUNK: usize = 2;
const MPSC_MIN_MAX_CAPACITY: usize = 4;
const SPSC_MIN_CHUNK: usize = 16;
const SPSC_MIN_GROWABLE_CHUNK: usize = 8;
const SPSC_MIN_MAX_CAPACITY: usize = 16;

impl GrowthPolicy {
    /// Validates the policy for the multi-producer chunk-linked queue.
    pub(crate) fn mpsc_layout(self) -> Result<ChunkLayout> {
        match self {
            GrowthPolicy::Unbounded { chunk_size } => Ok(ChunkLayout {
                growth: Growth::Unbounded,
                chunk_capacity: mpsc_chunk(chunk_size)?,
                max_capacity: None,
            }),
            GrowthPolicy::Chunked { chunk_size, max_capacity } => {
                bounded_layout(Growth::Chunked, mpsc_chunk(chunk_size)?, mpsc_max(max_capacity)?)
            }
            GrowthPolicy::Growable { initial_capacity, max_capacity } => bounded_layout(
                Growth::Growable,
                mpsc_chunk(initial_capacity)?,
                mpsc_max(max_capacity)?,
            ),
        }
    }

    /// Validates the policy for the single-producer chunk-linked queue, whose look-ahead
    /// needs somewhat larger chunks.
    pub(crate) fn spsc_layout(self) -> Result<ChunkLayout> {
        match self {
            GrowthPolicy::Unbounded { chunk_size } => Ok(ChunkLayout {
                growth: Growth::Unbounded,
                chunk_capacity: spsc_chunk(chunk_size, SPSC_MIN_CHUNK)?,
                max_capacity: None,
            }),
            GrowthPolicy::Chunked { chunk_size, max_capacity } => bounded_layout(
                Growth::Chunked,
                spsc_chunk(chunk_size, SPSC_MIN_CHUNK)?,
                spsc_max(max_capacity)?,
            ),
            GrowthPolicy::Growable { initial_capacity, max_capacity } => bounded_layout(
                Growth::Growable,
                spsc_chunk(initial_capacity, SPSC_MIN_GROWABLE_CHUNK)?,
                spsc_max(max_capacity)?,
            ),
        }
    }
}

fn mpsc_chunk(requested: usize) -> Result<usize> {
    if requested < MPSC_MIN_CHUNK {
        return Err(Error::InvalidChunkSize { requested, minimum: MPSC_MIN_CHUNK });
    }
    round_to_power_of_two(requested)
}

fn mpsc_max(requested: usize) -> Result<usize> {
    if requested < MPSC_MIN_MAX_CAPACITY {
        return Err(Error::InvalidCapacity { requested, minimum: MPSC_MIN_MAX_CAPACITY });
    }
    // Doubled internally for the resize flag bit.
    if requested > usize::MAX / 4 {
        return Err(Error::CapacityOverflow { requested });
    }
    round_to_power_of_two(requested)
}

fn spsc_chunk(requested: usize, minimum: usize) -> Result<usize> {
    if requested == 0 {
        return Err(Error::InvalidChunkSize { requested, minimum: 1 });
    }
    round_to_power_of_two(requested.max(minimum))
}

fn spsc_max(requested: usize) -> Result<usize> {
    if requested < SPSC_MIN_MAX_CAPACITY {
        return Err(Error::InvalidCapacity { requested, minimum: SPSC_MIN_MAX_CAPACITY });
    }
    round_to_power_of_two(requested)
}

fn bounded_layout(growth: Growth, chunk_capacity: usize, max_capacity: usize) -> Result<ChunkLayout> {
    if chunk_capacity >= max_capacity {
        return Err(Error::InitialCapacityNotBelowMax {
            initial: chunk_capacity,
            max: max_capacity,
        });
    }
    Ok(ChunkLayout {
        growth,
        chunk_capacity,
        max_capacity: Some(max_capacity),
    })
}

/// Chunk geometry and recycling for the fetch-and-add queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XaddConfig {
    /// Slots per chunk, rounded up to a power of two. At least 2.
    pub chunk_size: usize,
    /// Drained chunks kept for reuse. Zero disables pooling.
    pub max_pooled_chunks: usize,
}

impl Default for XaddConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1024,
            max_pooled_chunks: 2,
        }
    }
}

impl XaddConfig {
    pub fn new(chunk_size: usize, max_pooled_chunks: usize) -> Self {
        Self { chunk_size, max_pooled_chunks }
    }

    /// Power-of-two chunk size.
    pub(crate) fn validated_chunk_size(&self) -> Result<usize> {
        if self.chunk_size < 2 {
            return Err(Error::InvalidChunkSize {
                requested: self.chunk_size,
                minimum: 2,
            });
        }
        round_to_power_of_two(self.chunk_size)
    }
}
