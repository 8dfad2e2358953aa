#![forbid(unsafe_code)]
//! The abstract block-store capability and an in-memory backend.
//!
//! Every layer of the stack (transport, consistency guard, caches)
//! implements [`BlockStore`] and wraps an inner instance of the same
//! capability, so layers compose by construction. The store-level contract
//! follows object-store semantics: a block that was never written (or was
//! deleted) reads back as zeros, which makes "delete" and "write a zero
//! block" the same operation seen from above.

use evb_error::{EvbError, Result};
use evb_types::{BlockDigest, BlockNum, StoreGeometry};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use tracing::trace;

/// Block-addressed storage with digest-verified reads.
pub trait BlockStore: Send + Sync {
    /// Read `block` into `dst`. `dst.len()` MUST equal the block size.
    ///
    /// With `expect` set, the fetched payload's MD5 is verified and
    /// [`EvbError::Stale`] is returned on mismatch.
    fn read_block(&self, block: BlockNum, dst: &mut [u8], expect: Option<&BlockDigest>)
    -> Result<()>;

    /// Write `src` to `block`. `src = None` deletes the block (store-level
    /// zero elision); otherwise `src.len()` MUST equal the block size.
    ///
    /// `digest` may carry a precomputed MD5 of `src` so implementations
    /// need not rehash the payload.
    fn write_block(
        &self,
        block: BlockNum,
        src: Option<&[u8]>,
        digest: Option<BlockDigest>,
    ) -> Result<()>;

    /// Probe the backing object for its size and block size.
    fn detect_sizes(&self) -> Result<StoreGeometry>;
}

impl<S: BlockStore + ?Sized> BlockStore for Arc<S> {
    fn read_block(
        &self,
        block: BlockNum,
        dst: &mut [u8],
        expect: Option<&BlockDigest>,
    ) -> Result<()> {
        (**self).read_block(block, dst, expect)
    }

    fn write_block(
        &self,
        block: BlockNum,
        src: Option<&[u8]>,
        digest: Option<BlockDigest>,
    ) -> Result<()> {
        (**self).write_block(block, src, digest)
    }

    fn detect_sizes(&self) -> Result<StoreGeometry> {
        (**self).detect_sizes()
    }
}

/// In-memory block store with object-store read semantics.
///
/// Clones share the same underlying block map, so a handle kept outside a
/// wrapping layer still observes writes made through it.
#[derive(Debug, Clone)]
pub struct MemStore {
    geometry: StoreGeometry,
    blocks: Arc<Mutex<HashMap<BlockNum, Vec<u8>>>>,
}

impl MemStore {
    pub fn new(geometry: StoreGeometry) -> Result<Self> {
        if geometry.block_size == 0 {
            return Err(EvbError::Config("block_size must be > 0".to_owned()));
        }
        if geometry.file_size % u64::from(geometry.block_size) != 0 {
            return Err(EvbError::Config(format!(
                "file_size {} is not a multiple of block_size {}",
                geometry.file_size, geometry.block_size
            )));
        }
        Ok(Self {
            geometry,
            blocks: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Whether the store currently holds a payload for `block`.
    ///
    /// Deleted and never-written blocks are absent.
    #[must_use]
    pub fn contains(&self, block: BlockNum) -> bool {
        self.blocks.lock().contains_key(&block)
    }

    /// Number of blocks with a stored payload.
    #[must_use]
    pub fn stored_blocks(&self) -> usize {
        self.blocks.lock().len()
    }

    fn check_block(&self, block: BlockNum) -> Result<()> {
        if block.0 >= self.geometry.block_count() {
            return Err(EvbError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "block {} out of range (block_count {})",
                    block.0,
                    self.geometry.block_count()
                ),
            )));
        }
        Ok(())
    }

    fn check_len(&self, len: usize, what: &'static str) -> Result<()> {
        if len != self.geometry.block_size as usize {
            return Err(EvbError::InvalidArgument(what));
        }
        Ok(())
    }
}

impl BlockStore for MemStore {
    fn read_block(
        &self,
        block: BlockNum,
        dst: &mut [u8],
        expect: Option<&BlockDigest>,
    ) -> Result<()> {
        self.check_block(block)?;
        self.check_len(dst.len(), "read buffer length != block_size")?;

        let blocks = self.blocks.lock();
        match blocks.get(&block) {
            Some(data) => dst.copy_from_slice(data),
            None => dst.fill(0),
        }
        drop(blocks);

        if let Some(expect) = expect {
            let actual = BlockDigest::of(dst);
            if actual != *expect {
                trace!(
                    target: "evb::store",
                    event = "digest_mismatch",
                    block = block.0,
                    expected = %expect,
                    actual = %actual
                );
                return Err(EvbError::Stale { block });
            }
        }
        Ok(())
    }

    fn write_block(
        &self,
        block: BlockNum,
        src: Option<&[u8]>,
        digest: Option<BlockDigest>,
    ) -> Result<()> {
        self.check_block(block)?;

        match src {
            Some(data) => {
                self.check_len(data.len(), "write buffer length != block_size")?;
                if let Some(digest) = digest {
                    debug_assert_eq!(digest, BlockDigest::of(data), "caller-supplied digest lies");
                }
                self.blocks.lock().insert(block, data.to_vec());
                trace!(target: "evb::store", event = "block_stored", block = block.0);
            }
            None => {
                self.blocks.lock().remove(&block);
                trace!(target: "evb::store", event = "block_deleted", block = block.0);
            }
        }
        Ok(())
    }

    fn detect_sizes(&self) -> Result<StoreGeometry> {
        Ok(self.geometry)
    }
}
