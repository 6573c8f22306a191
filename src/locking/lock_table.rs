//! Lock-table contract and the default bucket implementation.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::locking::{LockOperation, LockOperationType, LockType};
use crate::status::OperationStatus;
use crate::utility::{hash_i64, next_power_of_two};

/// Contract boundary for the bucket-keyed lock table.
///
/// `internal_lock` returns `RetryNow` on contention; callers loop on it
/// until `Success`. The predicates exist for debug assertions and report
/// the state of the *bucket* the code maps to.
pub trait LockTable: Send + Sync + 'static {
    /// Number of buckets.
    fn bucket_count(&self) -> u64;

    /// Map a lock code to its bucket.
    fn bucket_index(&self, lock_code: u64) -> u64;

    /// Apply one lock operation against the bucket for `lock_code`.
    ///
    /// Acquisitions return `RetryNow` when the bucket cannot be taken in
    /// the requested mode right now; releases always succeed.
    fn internal_lock(&self, lock_code: u64, op: LockOperation) -> OperationStatus;

    /// Whether the bucket for `lock_code` is held exclusively.
    fn is_locked_exclusive(&self, lock_code: u64) -> bool;

    /// Whether the bucket for `lock_code` has shared holders.
    fn is_locked_shared(&self, lock_code: u64) -> bool;

    /// Whether the bucket for `lock_code` is held in any mode.
    fn is_locked(&self, lock_code: u64) -> bool;
}

const EXCLUSIVE_BIT: u64 = 1 << 63;
const SHARED_MASK: u64 = EXCLUSIVE_BIT - 1;

/// Default lock table: a power-of-two array of atomic bucket words, each
/// packing an exclusive bit and a shared-holder count.
pub struct BucketLockTable {
    buckets: Box<[AtomicU64]>,
    mask: u64,
}

impl BucketLockTable {
    /// Create a table with at least `bucket_count` buckets (rounded up to a
    /// power of two).
    pub fn new(bucket_count: usize) -> Self {
        let count = next_power_of_two(bucket_count.max(1) as u64);
        let buckets = (0..count)
            .map(|_| AtomicU64::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            buckets,
            mask: count - 1,
        }
    }

    fn bucket(&self, lock_code: u64) -> &AtomicU64 {
        &self.buckets[self.bucket_index(lock_code) as usize]
    }

    fn try_lock_exclusive(&self, lock_code: u64) -> OperationStatus {
        let bucket = self.bucket(lock_code);
        match bucket.compare_exchange(0, EXCLUSIVE_BIT, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => OperationStatus::Success,
            Err(_) => OperationStatus::RetryNow,
        }
    }

    fn try_lock_shared(&self, lock_code: u64) -> OperationStatus {
        let bucket = self.bucket(lock_code);
        let current = bucket.load(Ordering::Acquire);
        if current & EXCLUSIVE_BIT != 0 {
            return OperationStatus::RetryNow;
        }
        debug_assert!(current & SHARED_MASK < SHARED_MASK);
        match bucket.compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => OperationStatus::Success,
            Err(_) => OperationStatus::RetryNow,
        }
    }

    fn unlock_exclusive(&self, lock_code: u64) -> OperationStatus {
        let bucket = self.bucket(lock_code);
        let prev = bucket.fetch_and(!EXCLUSIVE_BIT, Ordering::AcqRel);
        debug_assert!(prev & EXCLUSIVE_BIT != 0, "exclusive unlock of unheld bucket");
        OperationStatus::Success
    }

    fn unlock_shared(&self, lock_code: u64) -> OperationStatus {
        let bucket = self.bucket(lock_code);
        let prev = bucket.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev & SHARED_MASK != 0, "shared unlock of unheld bucket");
        OperationStatus::Success
    }
}

impl LockTable for BucketLockTable {
    fn bucket_count(&self) -> u64 {
        self.mask + 1
    }

    fn bucket_index(&self, lock_code: u64) -> u64 {
        hash_i64(lock_code as i64) & self.mask
    }

    fn internal_lock(&self, lock_code: u64, op: LockOperation) -> OperationStatus {
        match (op.op, op.lock_type) {
            (LockOperationType::Lock, LockType::Exclusive) => self.try_lock_exclusive(lock_code),
            (LockOperationType::Lock, LockType::Shared) => self.try_lock_shared(lock_code),
            (LockOperationType::Unlock, LockType::Exclusive) => self.unlock_exclusive(lock_code),
            (LockOperationType::Unlock, LockType::Shared) => self.unlock_shared(lock_code),
        }
    }

    fn is_locked_exclusive(&self, lock_code: u64) -> bool {
        self.bucket(lock_code).load(Ordering::Acquire) & EXCLUSIVE_BIT != 0
    }

    fn is_locked_shared(&self, lock_code: u64) -> bool {
        self.bucket(lock_code).load(Ordering::Acquire) & SHARED_MASK != 0
    }

    fn is_locked(&self, lock_code: u64) -> bool {
        self.bucket(lock_code).load(Ordering::Acquire) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locking::LockOperation;

    #[test]
    fn test_exclusive_excludes() {
        let table = BucketLockTable::new(64);
        let code = 42;

        assert_eq!(
            table.internal_lock(code, LockOperation::lock(LockType::Exclusive)),
            OperationStatus::Success
        );
        assert!(table.is_locked_exclusive(code));
        assert!(table.is_locked(code));

        // Neither mode can re-acquire the bucket.
        assert_eq!(
            table.internal_lock(code, LockOperation::lock(LockType::Exclusive)),
            OperationStatus::RetryNow
        );
        assert_eq!(
            table.internal_lock(code, LockOperation::lock(LockType::Shared)),
            OperationStatus::RetryNow
        );

        assert_eq!(
            table.internal_lock(code, LockOperation::unlock(LockType::Exclusive)),
            OperationStatus::Success
        );
        assert!(!table.is_locked(code));
    }

    #[test]
    fn test_shared_is_counted() {
        let table = BucketLockTable::new(64);
        let code = 7;

        for _ in 0..3 {
            assert_eq!(
                table.internal_lock(code, LockOperation::lock(LockType::Shared)),
                OperationStatus::Success
            );
        }
        assert!(table.is_locked_shared(code));
        assert!(!table.is_locked_exclusive(code));

        // Exclusive blocked while shared holders remain.
        assert_eq!(
            table.internal_lock(code, LockOperation::lock(LockType::Exclusive)),
            OperationStatus::RetryNow
        );

        for _ in 0..3 {
            table.internal_lock(code, LockOperation::unlock(LockType::Shared));
        }
        assert!(!table.is_locked(code));
        assert_eq!(
            table.internal_lock(code, LockOperation::lock(LockType::Exclusive)),
            OperationStatus::Success
        );
        table.internal_lock(code, LockOperation::unlock(LockType::Exclusive));
    }

    #[test]
    fn test_bucket_count_rounds_up() {
        let table = BucketLockTable::new(1000);
        assert_eq!(table.bucket_count(), 1024);
        assert!(table.bucket_index(u64::MAX) < 1024);
    }

    #[test]
    fn test_distinct_codes_same_bucket_collide() {
        // With one bucket, every code shares the lock.
        let table = BucketLockTable::new(1);
        assert_eq!(table.bucket_count(), 1);

        table.internal_lock(1, LockOperation::lock(LockType::Exclusive));
        assert_eq!(
            table.internal_lock(2, LockOperation::lock(LockType::Shared)),
            OperationStatus::RetryNow
        );
        table.internal_lock(1, LockOperation::unlock(LockType::Exclusive));
    }
}
