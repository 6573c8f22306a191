//! Session-bound adapter over user functions.
//!
//! The adapter wires the side effects the store requires regardless of user
//! code: every successful mutation marks the record dirty and modified, a
//! successful concurrent delete additionally sets the tombstone, concurrent
//! reads refuse sealed or invalid records, and transient locking is reduced
//! to assertions because lockable sessions hold their locks manually.

use std::marker::PhantomData;

use uuid::Uuid;

use crate::locking::LockTable;
use crate::record::RecordInfo;
use crate::status::Status;
use crate::store::functions::{CommitPoint, SessionFunctions};

/// Adapter the lockable session passes into the store in place of the raw
/// user functions.
pub struct LockableFunctions<'a, K, V, F, L>
where
    V: Clone,
    F: SessionFunctions<K, V>,
    L: LockTable,
{
    funcs: &'a mut F,
    lock_table: &'a L,
    session_id: Uuid,
    latest_commit_point: &'a mut Option<CommitPoint>,
    _marker: PhantomData<fn(K, V)>,
}

impl<'a, K, V, F, L> LockableFunctions<'a, K, V, F, L>
where
    V: Clone,
    F: SessionFunctions<K, V>,
    L: LockTable,
{
    pub(crate) fn new(
        funcs: &'a mut F,
        lock_table: &'a L,
        session_id: Uuid,
        latest_commit_point: &'a mut Option<CommitPoint>,
    ) -> Self {
        Self {
            funcs,
            lock_table,
            session_id,
            latest_commit_point,
            _marker: PhantomData,
        }
    }
}

impl<K, V, F, L> SessionFunctions<K, V> for LockableFunctions<'_, K, V, F, L>
where
    K: Send + Sync,
    V: Clone + Send,
    F: SessionFunctions<K, V>,
    L: LockTable,
{
    fn single_reader(&mut self, key: &K, value: &V, info: &RecordInfo) {
        self.funcs.single_reader(key, value, info);
    }

    fn concurrent_reader(&mut self, key: &K, value: &V, info: &RecordInfo) -> bool {
        if info.is_sealed() || !info.is_valid() {
            return false;
        }
        self.funcs.concurrent_reader(key, value, info)
    }

    fn single_writer(&mut self, key: &K, src: &V) -> V {
        self.funcs.single_writer(key, src)
    }

    fn post_single_writer(&mut self, key: &K, value: &V, info: &RecordInfo) {
        self.funcs.post_single_writer(key, value, info);
        info.mark_dirty_and_modified();
    }

    fn concurrent_writer(&mut self, key: &K, src: &V, dst: &mut V, info: &RecordInfo) -> bool {
        let written = self.funcs.concurrent_writer(key, src, dst, info);
        if written {
            info.mark_dirty_and_modified();
        }
        written
    }

    fn initial_updater(&mut self, key: &K, input: &V) -> V {
        self.funcs.initial_updater(key, input)
    }

    fn post_initial_updater(&mut self, key: &K, value: &V, info: &RecordInfo) {
        self.funcs.post_initial_updater(key, value, info);
        info.mark_dirty_and_modified();
    }

    fn in_place_updater(&mut self, key: &K, input: &V, value: &mut V, info: &RecordInfo) -> bool {
        let updated = self.funcs.in_place_updater(key, input, value, info);
        if updated {
            info.mark_dirty_and_modified();
        }
        updated
    }

    fn copy_updater(&mut self, key: &K, input: &V, old: &V) -> V {
        self.funcs.copy_updater(key, input, old)
    }

    fn post_copy_updater(&mut self, key: &K, value: &V, info: &RecordInfo) {
        self.funcs.post_copy_updater(key, value, info);
        info.mark_dirty_and_modified();
    }

    fn single_deleter(&mut self, key: &K, value: &mut V) {
        self.funcs.single_deleter(key, value);
    }

    fn concurrent_deleter(&mut self, key: &K, value: &mut V, info: &RecordInfo) -> bool {
        let deleted = self.funcs.concurrent_deleter(key, value, info);
        if deleted {
            info.mark_dirty_and_modified();
            info.set_tombstone(true);
        }
        deleted
    }

    fn dispose(&mut self, key: &K, value: &V) {
        self.funcs.dispose(key, value);
    }

    // Transient locking is disabled in lockable mode: the key must already
    // be held manually in the required mode.
    fn try_lock_transient_exclusive(&mut self, lock_code: u64) -> bool {
        debug_assert!(
            self.lock_table.is_locked_exclusive(lock_code),
            "mutating a key that is not manually locked exclusive"
        );
        true
    }

    fn try_lock_transient_shared(&mut self, lock_code: u64) -> bool {
        debug_assert!(
            self.lock_table.is_locked(lock_code),
            "reading a key that is not manually locked"
        );
        true
    }

    fn unlock_transient_exclusive(&mut self, _lock_code: u64) {}

    fn unlock_transient_shared(&mut self, _lock_code: u64) {}

    fn read_completion_callback(&mut self, key: &K, status: Status) {
        self.funcs.read_completion_callback(key, status);
    }

    fn upsert_completion_callback(&mut self, key: &K, status: Status) {
        self.funcs.upsert_completion_callback(key, status);
    }

    fn rmw_completion_callback(&mut self, key: &K, status: Status) {
        self.funcs.rmw_completion_callback(key, status);
    }

    fn delete_completion_callback(&mut self, key: &K, status: Status) {
        self.funcs.delete_completion_callback(key, status);
    }

    fn checkpoint_completion_callback(&mut self, _session_id: Uuid, commit_point: &CommitPoint) {
        *self.latest_commit_point = Some(*commit_point);
        self.funcs
            .checkpoint_completion_callback(self.session_id, commit_point);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locking::{BucketLockTable, LockOperation, LockType};
    use crate::store::functions::BasicFunctions;

    fn adapter_fixture() -> (BasicFunctions<u64, u64>, BucketLockTable, Option<CommitPoint>) {
        (BasicFunctions::new(), BucketLockTable::new(64), None)
    }

    #[test]
    fn test_concurrent_reader_refuses_sealed() {
        let (mut funcs, table, mut commit) = adapter_fixture();
        let mut adapter =
            LockableFunctions::new(&mut funcs, &table, Uuid::new_v4(), &mut commit);

        let info = RecordInfo::new(1);
        assert!(info.try_seal());
        assert!(!adapter.concurrent_reader(&1, &2, &info));

        info.unseal();
        assert!(adapter.concurrent_reader(&1, &2, &info));
    }

    #[test]
    fn test_concurrent_reader_refuses_invalid() {
        let (mut funcs, table, mut commit) = adapter_fixture();
        let mut adapter =
            LockableFunctions::new(&mut funcs, &table, Uuid::new_v4(), &mut commit);

        let info = RecordInfo::new(1);
        info.set_valid(false);
        assert!(!adapter.concurrent_reader(&1, &2, &info));
    }

    #[test]
    fn test_writer_marks_dirty_and_modified() {
        let (mut funcs, table, mut commit) = adapter_fixture();
        let mut adapter =
            LockableFunctions::new(&mut funcs, &table, Uuid::new_v4(), &mut commit);

        let info = RecordInfo::new(1);
        let mut dst = 0u64;
        assert!(adapter.concurrent_writer(&1, &7, &mut dst, &info));
        assert_eq!(dst, 7);
        assert!(info.is_dirty());
        assert!(info.is_modified());
    }

    #[test]
    fn test_deleter_sets_tombstone() {
        let (mut funcs, table, mut commit) = adapter_fixture();
        let mut adapter =
            LockableFunctions::new(&mut funcs, &table, Uuid::new_v4(), &mut commit);

        let info = RecordInfo::new(1);
        let mut value = 9u64;
        assert!(adapter.concurrent_deleter(&1, &mut value, &info));
        assert!(info.is_tombstone());
        assert!(info.is_dirty());
        assert!(info.is_modified());
    }

    #[test]
    fn test_post_hooks_mark_record() {
        let (mut funcs, table, mut commit) = adapter_fixture();
        let mut adapter =
            LockableFunctions::new(&mut funcs, &table, Uuid::new_v4(), &mut commit);

        let info = RecordInfo::new(1);
        adapter.post_single_writer(&1, &2, &info);
        assert!(info.is_dirty() && info.is_modified());

        let info = RecordInfo::new(2);
        adapter.post_initial_updater(&1, &2, &info);
        assert!(info.is_dirty() && info.is_modified());

        let info = RecordInfo::new(3);
        adapter.post_copy_updater(&1, &2, &info);
        assert!(info.is_dirty() && info.is_modified());
    }

    #[test]
    fn test_transient_lock_asserts_manual_hold() {
        let (mut funcs, table, mut commit) = adapter_fixture();

        // Manually lock the bucket first, as a lockable session would.
        table.internal_lock(42, LockOperation::lock(LockType::Exclusive));

        let mut adapter =
            LockableFunctions::new(&mut funcs, &table, Uuid::new_v4(), &mut commit);
        assert!(adapter.try_lock_transient_exclusive(42));
        assert!(adapter.try_lock_transient_shared(42));

        table.internal_lock(42, LockOperation::unlock(LockType::Exclusive));
    }

    #[test]
    fn test_checkpoint_callback_records_commit_point() {
        let (mut funcs, table, mut commit) = adapter_fixture();
        let session_id = Uuid::new_v4();
        {
            let mut adapter =
                LockableFunctions::new(&mut funcs, &table, session_id, &mut commit);
            adapter.checkpoint_completion_callback(
                session_id,
                &CommitPoint { until_serial: 17 },
            );
        }
        assert_eq!(commit, Some(CommitPoint { until_serial: 17 }));
    }
}
