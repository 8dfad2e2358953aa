#![forbid(unsafe_code)]
//! Error types for the evblock workspace.
//!
//! Defines `EvbError` and a `Result<T>` alias used throughout the stack.
//! Layers never retry on error; retry policy, where it exists at all,
//! belongs to the transport.

use evb_types::BlockNum;
use thiserror::Error;

/// Unified error type for all block-store layers.
#[derive(Debug, Error)]
pub enum EvbError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("out of memory")]
    OutOfMemory,

    #[error("stale read on block {block}: fetched payload fails digest check")]
    Stale { block: BlockNum },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl EvbError {
    /// Whether this is a stale read rejected by digest verification.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Stale { .. })
    }
}

/// Result alias using `EvbError`.
pub type Result<T> = std::result::Result<T, EvbError>;
