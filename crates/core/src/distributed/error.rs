//! Error types for multi-process generation.

use thiserror::Error;

/// Errors raised by a termination barrier.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DistributedError {
    /// Rank is out of valid range for the peer group.
    #[error("invalid rank {rank}: must be < world_size {world_size}")]
    InvalidRank { rank: usize, world_size: usize },

    /// A peer gave up; every other peer must stop as well.
    #[error("generation aborted by a peer")]
    Aborted,

    /// The barrier's shared state was poisoned by a panicking peer.
    #[error("barrier state poisoned")]
    Poisoned,
}

pub type Result<T> = std::result::Result<T, DistributedError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_invalid_rank() {
        let e = DistributedError::InvalidRank {
            rank: 3,
            world_size: 2,
        };
        assert_eq!(e.to_string(), "invalid rank 3: must be < world_size 2");
    }

    #[test]
    fn error_display_aborted() {
        assert_eq!(
            DistributedError::Aborted.to_string(),
            "generation aborted by a peer"
        );
    }
}
