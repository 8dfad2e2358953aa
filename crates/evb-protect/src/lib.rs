#![forbid(unsafe_code)]
//! Eventual-consistency protection for object-store-backed block devices.
//!
//! An eventually consistent backend may transiently serve a read from a
//! write that is no longer the latest, and gives no ordering between
//! overlapping writes to the same object. [`EcGuard`] wraps such a backend
//! and restores per-block read-after-write and write ordering by:
//!
//! - enforcing a minimum delay between the completion of one write and the
//!   start of the next write to the same block,
//! - remembering the MD5 of every recently written block and verifying
//!   backend reads against it, rejecting stale payloads,
//! - serving reads of a block whose write is still in flight directly from
//!   the in-flight payload, without touching the backend.
//!
//! Each tracked block is in one of three states:
//!
//! | State   | Meaning                    | Table | Expiry queue |
//! |---------|----------------------------|-------|--------------|
//! | CLEAN   | untracked steady state     | no    | no           |
//! | WRITING | a write is in flight       | yes   | no           |
//! | WRITTEN | write done, digest cached  | yes   | yes          |
//!
//! A WRITTEN entry expires back to CLEAN after `cache_time`. The expiry
//! queue is ordered by completion time, so the head is always the next
//! entry to expire.
//!
//! # Concurrency design
//!
//! A single `parking_lot::Mutex` protects the entry table, the expiry
//! queue, and the counters. The lock is **never held across backend I/O**:
//! both the read and the write path drop it before delegating inward and
//! re-acquire it afterwards. An entry stays pinned in the table while its
//! write is in flight (the scavenger only removes WRITTEN entries), so the
//! unlocked window cannot lose it. Every wait re-checks its predicate
//! after waking; spurious wakeups are harmless.

use evb_error::{EvbError, Result};
use evb_store::BlockStore;
use evb_types::{BlockDigest, BlockNum, StoreGeometry, zero_digest};
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, trace, warn};

/// Tuning for the consistency guard. All values are fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Bytes per block. Must be positive; enforced when the first write is
    /// issued.
    pub block_size: u32,
    /// Minimum gap between the completion of one write and the start of
    /// the next write to the same block.
    pub min_write_delay: Duration,
    /// How long a completed write's digest is remembered. Must be at least
    /// `min_write_delay`.
    pub cache_time: Duration,
    /// Maximum number of simultaneously tracked blocks. Writers on new
    /// blocks wait when the table is full.
    pub cache_size: usize,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            block_size: 4096,
            min_write_delay: Duration::from_millis(500),
            cache_time: Duration::from_secs(10),
            cache_size: 10_000,
        }
    }
}

impl GuardConfig {
    fn validate(self) -> Result<Self> {
        if self.cache_size == 0 {
            return Err(EvbError::Config("cache_size must be > 0".to_owned()));
        }
        if self.cache_time < self.min_write_delay {
            return Err(EvbError::Config(format!(
                "cache_time {:?} must be >= min_write_delay {:?}",
                self.cache_time, self.min_write_delay
            )));
        }
        Ok(self)
    }
}

/// Point-in-time snapshot of guard counters.
///
/// Obtained via [`EcGuard::stats()`] with a single lock acquisition. All
/// counters except `current_cache_size` are monotonically increasing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GuardStats {
    /// Number of blocks currently tracked (WRITING + WRITTEN).
    pub current_cache_size: usize,
    /// Reads served locally from tracked state, without a backend call.
    pub cache_data_hits: u64,
    /// Total milliseconds writers spent waiting for table space.
    pub cache_full_delay_ms: u64,
    /// Total milliseconds writers spent waiting out the inter-write gap.
    pub repeated_write_delay_ms: u64,
    /// Failed entry-table reservations.
    pub out_of_memory_errors: u64,
}

/// Per-block payload while tracked.
///
/// The state/payload correspondence is static: an in-flight write carries
/// its live payload, a completed write carries only the digest.
#[derive(Debug, Clone)]
enum EntryState {
    /// A write is in flight; reads are served from this payload.
    /// `None` is the zero sentinel (the block is being deleted).
    Writing(Option<Arc<[u8]>>),
    /// The last write completed at `stamp` (wall-clock ms) with this digest.
    Written { stamp: u64, digest: BlockDigest },
}

#[derive(Debug, Default)]
struct GuardState {
    /// Every tracked block, keyed by number. CLEAN blocks are absent.
    table: HashMap<BlockNum, EntryState>,
    /// WRITTEN blocks in completion order; the head expires first.
    expiry: VecDeque<BlockNum>,
    cache_data_hits: u64,
    cache_full_delay_ms: u64,
    repeated_write_delay_ms: u64,
    out_of_memory_errors: u64,
}

/// Consistency guard wrapping an inner [`BlockStore`].
///
/// Implements [`BlockStore`] itself, so it slots into a layer stack
/// between the transport below and any cache above.
#[derive(Debug)]
pub struct EcGuard<S: BlockStore> {
    inner: S,
    config: GuardConfig,
    block_len: usize,
    min_write_delay_ms: u64,
    cache_time_ms: u64,
    state: Mutex<GuardState>,
    /// Signalled when an entry leaves the table and space frees up.
    space_cond: Condvar,
    /// Never signalled; timed waits on it are pure sleeps that release the
    /// lock.
    never_cond: Condvar,
    /// Digest of an all-zero block, computed on first use.
    zero: OnceLock<BlockDigest>,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| {
            u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
        })
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl<S: BlockStore> EcGuard<S> {
    pub fn new(inner: S, config: GuardConfig) -> Result<Self> {
        let config = config.validate()?;
        let block_len = usize::try_from(config.block_size)
            .map_err(|_| EvbError::Config("block_size does not fit usize".to_owned()))?;
        info!(
            event = "guard_created",
            block_size = config.block_size,
            min_write_delay_ms = duration_millis(config.min_write_delay),
            cache_time_ms = duration_millis(config.cache_time),
            cache_size = config.cache_size
        );
        Ok(Self {
            inner,
            config,
            block_len,
            min_write_delay_ms: duration_millis(config.min_write_delay),
            cache_time_ms: duration_millis(config.cache_time),
            state: Mutex::new(GuardState::default()),
            space_cond: Condvar::new(),
            never_cond: Condvar::new(),
            zero: OnceLock::new(),
        })
    }

    #[must_use]
    pub fn inner(&self) -> &S {
        &self.inner
    }

    #[must_use]
    pub fn config(&self) -> GuardConfig {
        self.config
    }

    /// Take a snapshot of the current counters.
    #[must_use]
    pub fn stats(&self) -> GuardStats {
        let state = self.state.lock();
        GuardStats {
            current_cache_size: state.table.len(),
            cache_data_hits: state.cache_data_hits,
            cache_full_delay_ms: state.cache_full_delay_ms,
            repeated_write_delay_ms: state.repeated_write_delay_ms,
            out_of_memory_errors: state.out_of_memory_errors,
        }
    }

    fn zero_digest(&self) -> BlockDigest {
        *self.zero.get_or_init(|| zero_digest(self.block_len))
    }

    /// Sleep on `cond` until the wall-clock millisecond `wake_ms`, or
    /// indefinitely when `wake_ms` is `None`. Returns the milliseconds
    /// spent asleep. Spurious early wakeups are possible; callers re-check
    /// their predicate after waking.
    fn sleep_until(
        &self,
        state: &mut MutexGuard<'_, GuardState>,
        cond: &Condvar,
        wake_ms: Option<u64>,
    ) -> u64 {
        let before = now_millis();
        match wake_ms {
            Some(wake) => {
                let deadline = Instant::now() + Duration::from_millis(wake.saturating_sub(before));
                if cond.wait_until(state, deadline).timed_out() {
                    wake.saturating_sub(before)
                } else {
                    now_millis().saturating_sub(before)
                }
            }
            None => {
                cond.wait(state);
                now_millis().saturating_sub(before)
            }
        }
    }

    /// Drop expired WRITTEN entries from the head of the expiry queue and
    /// wake writers waiting for space. Lock must be held.
    ///
    /// `except` exempts the block the caller is about to write: an entry
    /// that is simultaneously expiry-eligible and rewrite-eligible is
    /// reused rather than freed. `cache_time >= min_write_delay` guarantees
    /// an exempted expired entry is rewrite-eligible, and the stop at the
    /// exempted head only postpones later-stamped entries to the next run.
    fn scrub_expired(&self, state: &mut GuardState, now: u64, except: Option<BlockNum>) {
        let mut removed = 0_usize;
        loop {
            let Some(&head) = state.expiry.front() else {
                break;
            };
            if except == Some(head) {
                break;
            }
            let expired = matches!(
                state.table.get(&head),
                Some(EntryState::Written { stamp, .. })
                    if now >= stamp.saturating_add(self.cache_time_ms)
            );
            if !expired {
                break;
            }
            state.expiry.pop_front();
            state.table.remove(&head);
            removed += 1;
        }
        match removed {
            0 => {}
            1 => {
                self.space_cond.notify_one();
            }
            _ => {
                self.space_cond.notify_all();
            }
        }
        if removed > 0 {
            debug!(
                event = "expired_entries_dropped",
                removed,
                tracked = state.table.len()
            );
        }
    }

    #[cfg(debug_assertions)]
    fn check_invariants(&self, state: &GuardState) {
        assert!(
            state.table.len() <= self.config.cache_size,
            "table holds {} entries, cache_size is {}",
            state.table.len(),
            self.config.cache_size
        );

        let written = state
            .table
            .values()
            .filter(|entry| matches!(entry, EntryState::Written { .. }))
            .count();
        assert_eq!(
            written,
            state.expiry.len(),
            "every WRITTEN entry is queued exactly once"
        );

        let mut last_stamp = 0_u64;
        for block in &state.expiry {
            match state.table.get(block) {
                Some(EntryState::Written { stamp, .. }) => {
                    assert!(
                        *stamp >= last_stamp,
                        "expiry queue stamps must be non-decreasing"
                    );
                    last_stamp = *stamp;
                }
                other => panic!("expiry queue references block {block} in state {other:?}"),
            }
        }
    }

    #[cfg(not(debug_assertions))]
    #[allow(clippy::unused_self)]
    fn check_invariants(&self, _state: &GuardState) {}
}

/// One dispatch decision of the write loop, captured so the table borrow
/// is released before the state mutates.
enum WriteStep {
    Insert,
    AwaitInFlight,
    AwaitGap(u64),
    Reuse,
}

impl<S: BlockStore> BlockStore for EcGuard<S> {
    fn read_block(
        &self,
        block: BlockNum,
        dst: &mut [u8],
        expect: Option<&BlockDigest>,
    ) -> Result<()> {
        if dst.len() != self.block_len {
            return Err(EvbError::InvalidArgument("read buffer length != block_size"));
        }

        let mut state = self.state.lock();
        self.check_invariants(&state);
        self.scrub_expired(&mut state, now_millis(), None);

        let effective = match state.table.get(&block) {
            Some(EntryState::Writing(payload)) => {
                match payload {
                    Some(data) => dst.copy_from_slice(data),
                    None => dst.fill(0),
                }
                state.cache_data_hits += 1;
                trace!(event = "read_served_in_flight", block = block.0);
                return Ok(());
            }
            Some(EntryState::Written { digest, .. }) => {
                let stored = *digest;
                if stored == self.zero_digest() {
                    dst.fill(0);
                    state.cache_data_hits += 1;
                    trace!(event = "read_served_zero", block = block.0);
                    return Ok(());
                }
                // The cached digest is authoritative for this block; a
                // disagreeing caller expectation cannot be satisfied.
                if let Some(caller) = expect {
                    if *caller != stored {
                        error!(
                            event = "caller_digest_conflict",
                            block = block.0,
                            caller = %caller,
                            stored = %stored
                        );
                    }
                }
                Some(stored)
            }
            None => expect.copied(),
        };

        drop(state);
        self.inner.read_block(block, dst, effective.as_ref())
    }

    fn write_block(
        &self,
        block: BlockNum,
        src: Option<&[u8]>,
        digest: Option<BlockDigest>,
    ) -> Result<()> {
        if self.block_len == 0 {
            return Err(EvbError::InvalidArgument("block_size is zero"));
        }
        if let Some(data) = src {
            if data.len() != self.block_len {
                return Err(EvbError::InvalidArgument(
                    "write buffer length != block_size",
                ));
            }
        }

        // All-zero payloads collapse to the zero sentinel so the backend
        // sees a delete, and the recorded digest is the zero digest no
        // matter what the caller supplied.
        let (payload, effective): (Option<Arc<[u8]>>, BlockDigest) = match src {
            Some(data) if !data.iter().all(|&byte| byte == 0) => {
                let effective = digest.unwrap_or_else(|| BlockDigest::of(data));
                (Some(Arc::from(data)), effective)
            }
            _ => (None, self.zero_digest()),
        };

        let mut state = self.state.lock();
        loop {
            self.check_invariants(&state);
            let now = now_millis();
            self.scrub_expired(&mut state, now, Some(block));

            let step = match state.table.get(&block) {
                None => WriteStep::Insert,
                Some(EntryState::Writing(_)) => WriteStep::AwaitInFlight,
                Some(EntryState::Written { stamp, .. }) => {
                    let gate = stamp.saturating_add(self.min_write_delay_ms);
                    if now < gate {
                        WriteStep::AwaitGap(gate)
                    } else {
                        WriteStep::Reuse
                    }
                }
            };

            match step {
                WriteStep::Insert => {
                    if state.table.len() >= self.config.cache_size {
                        // Wait for the next expiry, or for an entry removal
                        // if nothing is queued (everything is WRITING).
                        let wake = state.expiry.front().and_then(|head| {
                            match state.table.get(head) {
                                Some(EntryState::Written { stamp, .. }) => {
                                    Some(stamp.saturating_add(self.cache_time_ms))
                                }
                                _ => None,
                            }
                        });
                        warn!(
                            event = "write_blocked_cache_full",
                            block = block.0,
                            tracked = state.table.len()
                        );
                        let slept = self.sleep_until(&mut state, &self.space_cond, wake);
                        state.cache_full_delay_ms += slept;
                        continue;
                    }
                    if state.table.try_reserve(1).is_err() {
                        state.out_of_memory_errors += 1;
                        return Err(EvbError::OutOfMemory);
                    }
                    state.table.insert(block, EntryState::Writing(payload.clone()));
                    trace!(event = "entry_created", block = block.0);
                    break;
                }
                WriteStep::AwaitInFlight => {
                    // Another writer holds this block. Once its write
                    // completes we owe a full min_write_delay anyway, so
                    // wait exactly that long now; an extra wakeup or two
                    // is harmless.
                    let wake = now.saturating_add(self.min_write_delay_ms);
                    let slept = self.sleep_until(&mut state, &self.never_cond, Some(wake));
                    state.repeated_write_delay_ms += slept;
                }
                WriteStep::AwaitGap(gate) => {
                    let slept = self.sleep_until(&mut state, &self.never_cond, Some(gate));
                    state.repeated_write_delay_ms += slept;
                }
                WriteStep::Reuse => {
                    // The gap has passed: take the entry back to WRITING.
                    if let Some(pos) = state.expiry.iter().position(|queued| *queued == block) {
                        state.expiry.remove(pos);
                    }
                    state.table.insert(block, EntryState::Writing(payload.clone()));
                    trace!(event = "entry_reused", block = block.0);
                    break;
                }
            }
        }

        drop(state);
        let result = self
            .inner
            .write_block(block, payload.as_deref(), Some(effective));
        let mut state = self.state.lock();
        self.check_invariants(&state);

        match result {
            Err(err) => {
                state.table.remove(&block);
                self.space_cond.notify_one();
                drop(state);
                warn!(event = "inner_write_failed", block = block.0, error = %err);
                Err(err)
            }
            Ok(()) => {
                // Stamps are clamped to the queue tail so a backwards
                // clock jump cannot break the queue ordering.
                let mut stamp = now_millis();
                if let Some(tail) = state.expiry.back() {
                    if let Some(EntryState::Written {
                        stamp: tail_stamp, ..
                    }) = state.table.get(tail)
                    {
                        stamp = stamp.max(*tail_stamp);
                    }
                }
                state.table.insert(
                    block,
                    EntryState::Written {
                        stamp,
                        digest: effective,
                    },
                );
                state.expiry.push_back(block);
                self.check_invariants(&state);
                Ok(())
            }
        }
    }

    fn detect_sizes(&self) -> Result<StoreGeometry> {
        self.inner.detect_sizes()
    }
}

#[cfg(test)]
#[allow(clippy::cast_possible_truncation)]
mod tests {
    use super::*;
    use evb_store::MemStore;
    use proptest::prelude::*;
    use std::collections::HashMap;

    const BLOCK_SIZE: u32 = 8;

    fn mem_store(blocks: u64) -> MemStore {
        MemStore::new(StoreGeometry {
            file_size: blocks * u64::from(BLOCK_SIZE),
            block_size: BLOCK_SIZE,
        })
        .expect("geometry")
    }

    fn fast_config() -> GuardConfig {
        GuardConfig {
            block_size: BLOCK_SIZE,
            min_write_delay: Duration::ZERO,
            cache_time: Duration::from_secs(60),
            cache_size: 64,
        }
    }

    #[test]
    fn config_rejects_zero_cache_size() {
        let config = GuardConfig {
            cache_size: 0,
            ..GuardConfig::default()
        };
        assert!(matches!(
            EcGuard::new(mem_store(4), config),
            Err(EvbError::Config(_))
        ));
    }

    #[test]
    fn config_rejects_cache_time_below_min_write_delay() {
        let config = GuardConfig {
            min_write_delay: Duration::from_millis(200),
            cache_time: Duration::from_millis(100),
            ..GuardConfig::default()
        };
        assert!(matches!(
            EcGuard::new(mem_store(4), config),
            Err(EvbError::Config(_))
        ));
    }

    #[test]
    fn zero_block_size_rejected_at_write_time() {
        let config = GuardConfig {
            block_size: 0,
            ..fast_config()
        };
        let guard = EcGuard::new(mem_store(4), config).expect("guard");
        assert!(matches!(
            guard.write_block(BlockNum(0), Some(b"ABCDEFGH"), None),
            Err(EvbError::InvalidArgument(_))
        ));
    }

    #[test]
    fn buffer_length_mismatch_rejected() {
        let guard = EcGuard::new(mem_store(4), fast_config()).expect("guard");
        assert!(matches!(
            guard.write_block(BlockNum(0), Some(b"short"), None),
            Err(EvbError::InvalidArgument(_))
        ));
        let mut small = [0_u8; 4];
        assert!(matches!(
            guard.read_block(BlockNum(0), &mut small, None),
            Err(EvbError::InvalidArgument(_))
        ));
    }

    #[test]
    fn zero_write_deletes_at_the_store() {
        let store = mem_store(4);
        let guard = EcGuard::new(store.clone(), fast_config()).expect("guard");

        guard
            .write_block(BlockNum(1), Some(b"ABCDEFGH"), None)
            .expect("write");
        assert!(store.contains(BlockNum(1)));

        guard
            .write_block(BlockNum(1), Some(&[0_u8; 8]), None)
            .expect("zero write");
        assert!(!store.contains(BlockNum(1)), "all-zero write becomes a delete");

        let mut dst = [0xFF_u8; 8];
        guard.read_block(BlockNum(1), &mut dst, None).expect("read");
        assert_eq!(dst, [0_u8; 8]);
    }

    #[test]
    fn none_src_is_the_zero_sentinel() {
        let store = mem_store(4);
        let guard = EcGuard::new(store.clone(), fast_config()).expect("guard");

        guard.write_block(BlockNum(2), None, None).expect("delete");
        let mut dst = [0xFF_u8; 8];
        guard.read_block(BlockNum(2), &mut dst, None).expect("read");
        assert_eq!(dst, [0_u8; 8]);

        // Served from the cached zero digest, not the store.
        assert_eq!(guard.stats().cache_data_hits, 1);
    }

    #[test]
    fn caller_digest_override_is_ignored_for_zero_payloads() {
        let store = mem_store(4);
        let guard = EcGuard::new(store, fast_config()).expect("guard");

        let bogus = BlockDigest::of(b"ABCDEFGH");
        guard
            .write_block(BlockNum(0), Some(&[0_u8; 8]), Some(bogus))
            .expect("zero write");

        let mut dst = [0xFF_u8; 8];
        guard.read_block(BlockNum(0), &mut dst, None).expect("read");
        assert_eq!(dst, [0_u8; 8]);
        assert_eq!(guard.stats().cache_data_hits, 1);
    }

    #[test]
    fn entries_expire_after_cache_time() {
        let config = GuardConfig {
            min_write_delay: Duration::ZERO,
            cache_time: Duration::from_millis(40),
            ..fast_config()
        };
        let guard = EcGuard::new(mem_store(4), config).expect("guard");

        guard
            .write_block(BlockNum(0), Some(b"ABCDEFGH"), None)
            .expect("write");
        assert_eq!(guard.stats().current_cache_size, 1);

        std::thread::sleep(Duration::from_millis(80));

        // Any operation runs the scavenger.
        let mut dst = [0_u8; 8];
        guard.read_block(BlockNum(3), &mut dst, None).expect("read");
        assert_eq!(guard.stats().current_cache_size, 0);
    }

    #[test]
    fn min_write_delay_zero_never_sleeps() {
        let guard = EcGuard::new(mem_store(4), fast_config()).expect("guard");
        let start = Instant::now();
        for round in 0_u8..20 {
            let payload = [round; 8];
            guard
                .write_block(BlockNum(0), Some(&payload), None)
                .expect("write");
        }
        assert!(start.elapsed() < Duration::from_millis(200));
        assert_eq!(guard.stats().repeated_write_delay_ms, 0);
    }

    #[test]
    fn stats_snapshot_counts_hits() {
        let guard = EcGuard::new(mem_store(4), fast_config()).expect("guard");
        guard.write_block(BlockNum(1), None, None).expect("write");

        let mut dst = [0_u8; 8];
        for _ in 0..3 {
            guard.read_block(BlockNum(1), &mut dst, None).expect("read");
        }

        let stats = guard.stats();
        assert_eq!(stats.cache_data_hits, 3);
        assert_eq!(stats.current_cache_size, 1);
        assert_eq!(stats.out_of_memory_errors, 0);
    }

    #[test]
    fn detect_sizes_delegates() {
        let guard = EcGuard::new(mem_store(16), fast_config()).expect("guard");
        let geometry = guard.detect_sizes().expect("detect");
        assert_eq!(geometry.block_count(), 16);
    }

    proptest! {
        // Random single-threaded op sequences against an in-memory oracle:
        // every read must observe the latest write, and the table must stay
        // within bounds. The debug invariant pass runs at every lock
        // acquisition underneath.
        #[test]
        fn reads_observe_latest_write(
            ops in proptest::collection::vec((0_u64..12, 0_u8..4), 1..200)
        ) {
            let guard = EcGuard::new(mem_store(12), fast_config()).expect("guard");
            let mut oracle: HashMap<u64, [u8; 8]> = HashMap::new();

            for (block, kind) in ops {
                match kind {
                    // Write a payload derived from the block and a counter.
                    0 | 1 => {
                        let salt = oracle.len() as u8;
                        let payload = [salt.wrapping_add(block as u8); 8];
                        guard
                            .write_block(BlockNum(block), Some(&payload), None)
                            .expect("write");
                        oracle.insert(block, payload);
                    }
                    // Delete.
                    2 => {
                        guard.write_block(BlockNum(block), None, None).expect("delete");
                        oracle.insert(block, [0_u8; 8]);
                    }
                    // Read and compare against the oracle.
                    _ => {
                        let mut dst = [0xEE_u8; 8];
                        guard.read_block(BlockNum(block), &mut dst, None).expect("read");
                        let expected = oracle.get(&block).copied().unwrap_or([0_u8; 8]);
                        prop_assert_eq!(dst, expected);
                    }
                }
                let stats = guard.stats();
                prop_assert!(stats.current_cache_size <= guard.config().cache_size);
            }
        }
    }
}
