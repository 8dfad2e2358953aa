#![forbid(unsafe_code)]
//! evblock public API facade.
//!
//! Re-exports the block-store capability, the in-memory backend, and the
//! eventual-consistency guard through a stable external interface. This is
//! the crate downstream consumers depend on.

pub use evb_error::{EvbError, Result};
pub use evb_protect::{EcGuard, GuardConfig, GuardStats};
pub use evb_store::{BlockStore, MemStore};
pub use evb_types::{BlockDigest, BlockNum, StoreGeometry, zero_digest};
