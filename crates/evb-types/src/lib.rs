#![forbid(unsafe_code)]
//! Shared identifier and digest types for the evblock workspace.
//!
//! Newtypes keep block numbers, byte counts, and digests from being mixed
//! up across layer boundaries. Nothing here holds state or does I/O.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Block identifier within a store's geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNum(pub u64);

impl fmt::Display for BlockNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 16-byte MD5 digest of one block payload.
///
/// Backends verify fetched payloads against an expected digest, so this is
/// the currency the whole stack trades in for read validation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockDigest(pub [u8; 16]);

impl BlockDigest {
    /// Digest a payload.
    #[must_use]
    pub fn of(bytes: &[u8]) -> Self {
        Self(md5::compute(bytes).0)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for BlockDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for BlockDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Digest of a block consisting of `block_size` zero bytes.
///
/// This is the reserved value that marks elided zero blocks: writing an
/// all-zero payload records this digest, and a store read of an absent
/// block (which yields zeros) verifies against it.
#[must_use]
pub fn zero_digest(block_size: usize) -> BlockDigest {
    const CHUNK: [u8; 4096] = [0_u8; 4096];
    let mut ctx = md5::Context::new();
    let mut remaining = block_size;
    while remaining > 0 {
        let take = remaining.min(CHUNK.len());
        ctx.consume(&CHUNK[..take]);
        remaining -= take;
    }
    BlockDigest(ctx.compute().0)
}

/// Result of probing a store for its size and block size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreGeometry {
    /// Total addressable bytes.
    pub file_size: u64,
    /// Bytes per block.
    pub block_size: u32,
}

impl StoreGeometry {
    /// Number of whole blocks the geometry covers.
    #[must_use]
    pub fn block_count(&self) -> u64 {
        if self.block_size == 0 {
            0
        } else {
            self.file_size / u64::from(self.block_size)
        }
    }
}
