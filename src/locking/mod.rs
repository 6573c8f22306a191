//! Manual locking over a bucket-keyed lock table.
//!
//! Keys are collapsed to 64-bit lock codes; the table locks *buckets*, not
//! keys, so distinct codes may contend on one bucket. Sessions sort their
//! key sets by `(lock_code, lock_type)` with `Exclusive` first, which gives
//! every session the same total acquisition order and rules out deadlock.

mod lock_table;

pub use lock_table::{BucketLockTable, LockTable};

/// Lock mode for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LockType {
    /// Exclusive (writer) lock. Sorts before `Shared` for equal lock codes.
    Exclusive = 0,
    /// Shared (reader) lock.
    Shared = 1,
}

/// Whether a lock-table call acquires or releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LockOperationType {
    /// Acquire the bucket in the given mode.
    Lock,
    /// Release the bucket from the given mode.
    Unlock,
}

/// A single lock-table request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOperation {
    /// Acquire or release.
    pub op: LockOperationType,
    /// Lock mode.
    pub lock_type: LockType,
}

impl LockOperation {
    /// Acquisition request in the given mode.
    pub const fn lock(lock_type: LockType) -> Self {
        Self {
            op: LockOperationType::Lock,
            lock_type,
        }
    }

    /// Release request in the given mode.
    pub const fn unlock(lock_type: LockType) -> Self {
        Self {
            op: LockOperationType::Unlock,
            lock_type,
        }
    }
}

/// A key prepared for manual locking: its lock code plus the requested mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockableKey {
    /// 64-bit hash-derived lock code selecting the bucket.
    pub lock_code: u64,
    /// Requested lock mode.
    pub lock_type: LockType,
}

impl LockableKey {
    /// An exclusive request for `lock_code`.
    pub const fn exclusive(lock_code: u64) -> Self {
        Self {
            lock_code,
            lock_type: LockType::Exclusive,
        }
    }

    /// A shared request for `lock_code`.
    pub const fn shared(lock_code: u64) -> Self {
        Self {
            lock_code,
            lock_type: LockType::Shared,
        }
    }
}

/// Sort keys into the total order sessions must lock in:
/// ascending `lock_code`, with `Exclusive` before `Shared` per code.
pub fn sort_lockable_keys(keys: &mut [LockableKey]) {
    keys.sort_unstable_by_key(|key| (key.lock_code, key.lock_type));
}

/// Check the total-order invariant (used in debug assertions).
pub fn lockable_keys_sorted(keys: &[LockableKey]) -> bool {
    keys.windows(2)
        .all(|pair| (pair[0].lock_code, pair[0].lock_type) <= (pair[1].lock_code, pair[1].lock_type))
}
