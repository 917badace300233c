use thiserror::Error;

/// Result alias for queue construction.
pub type Result<T> = core::result::Result<T, Error>;

/// Invalid construction arguments. Queue operations themselves never fail: a full queue is
/// reported through `offer` handing the element back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    #[error("capacity {requested} is below the minimum of {minimum}")]
    InvalidCapacity { requested: usize, minimum: usize },

    #[error("chunk size {requested} is below the minimum of {minimum}")]
    InvalidChunkSize { requested: usize, minimum: usize },

    #[error("initial capacity {initial} must round to less than the maximum capacity {max}")]
    InitialCapacityNotBelowMax { initial: usize, max: usize },

    #[error("capacity {requested} exceeds the largest supported power of two")]
    CapacityOverflow { requested: usize },
}
