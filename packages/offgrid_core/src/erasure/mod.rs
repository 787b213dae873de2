//! Reed-Solomon erasure coding over GF(256)
//!
//! Pure computation, no I/O: a blob becomes `n` shards, any `k` of which
//! reconstruct it.

pub mod codec;
pub mod galois;
pub mod matrix;

pub use codec::{
    choose_k_n, decode, encode, ErasureMeta, ErasureParams, PlacementTarget, DEFAULT_K, DEFAULT_N,
    DEFAULT_SHARD_SIZE,
};
pub use galois::GF256;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Invalid erasure parameters: {0}")]
    InvalidParameters(String),

    #[error("Insufficient shards: have {have}, need {need}")]
    InsufficientShards { have: usize, need: usize },

    #[error("Shard index {index} out of range for n={n}")]
    InvalidShardIndex { index: usize, n: usize },

    #[error("{payloads} payloads supplied for {indices} indices")]
    PayloadCountMismatch { payloads: usize, indices: usize },

    #[error("Shard length mismatch: {0}")]
    ShardLengthMismatch(String),

    #[error("Decode matrix is singular")]
    SingularMatrix,

    #[error("Invalid erasure metadata: {0}")]
    InvalidMeta(String),
}
