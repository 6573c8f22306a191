//! The lockable session: two-phase manual locking plus point operations.
//!
//! A session is owned by one logical task at a time. Between
//! `begin_lockable` and `end_lockable` the caller may lock and unlock
//! presorted key sets any number of times and run point operations against
//! keys it holds. Every point operation runs under a scoped epoch guard;
//! the async variants re-enter protection per attempt instead of holding it
//! across suspension points.

use std::sync::Arc;

use uuid::Uuid;

use crate::codec::{PersistKey, PersistValue};
use crate::epoch::EpochGuard;
use crate::locking::{
    lockable_keys_sorted, BucketLockTable, LockOperation, LockTable, LockableKey, LockType,
};
use crate::status::{OperationStatus, Status};
use crate::store::adapter::LockableFunctions;
use crate::store::cancel::CancellationToken;
use crate::store::functions::{BasicFunctions, CommitPoint, SessionFunctions};
use crate::store::store_core::StoreCore;

/// Per-session façade over the store with manual two-phase locking.
///
/// Not thread-safe within a session; the two-phase state machine assumes a
/// single owner.
pub struct LockableSession<K, V, L = BucketLockTable>
where
    K: PersistKey,
    V: PersistValue,
    L: LockTable,
{
    store: Arc<StoreCore<K, V, L>>,
    guid: Uuid,
    serial: u64,
    is_acquired_lockable: bool,
    exclusive_lock_count: u64,
    shared_lock_count: u64,
    latest_commit_point: Option<CommitPoint>,
}

impl<K, V, L> LockableSession<K, V, L>
where
    K: PersistKey,
    V: PersistValue,
    L: LockTable,
{
    pub(crate) fn new(store: Arc<StoreCore<K, V, L>>) -> Self {
        Self {
            store,
            guid: Uuid::new_v4(),
            serial: 0,
            is_acquired_lockable: false,
            exclusive_lock_count: 0,
            shared_lock_count: 0,
            latest_commit_point: None,
        }
    }

    /// Session GUID.
    pub fn guid(&self) -> Uuid {
        self.guid
    }

    /// Serial number of the most recent point operation.
    pub fn serial_num(&self) -> u64 {
        self.serial
    }

    /// Whether the session is between `begin_lockable` and `end_lockable`.
    pub fn is_acquired_lockable(&self) -> bool {
        self.is_acquired_lockable
    }

    /// Number of exclusive locks currently held.
    pub fn exclusive_lock_count(&self) -> u64 {
        self.exclusive_lock_count
    }

    /// Number of shared locks currently held.
    pub fn shared_lock_count(&self) -> u64 {
        self.shared_lock_count
    }

    /// The most recent commit point delivered to this session.
    pub fn latest_commit_point(&self) -> Option<CommitPoint> {
        self.latest_commit_point
    }

    /// Derive the lock code for a key.
    pub fn lock_code_for(&self, key: &K) -> Result<u64, Status> {
        self.store.lock_code_for(key)
    }

    // ==================== Two-phase locking ====================

    /// Enter the lockable state.
    pub fn begin_lockable(&mut self) -> Status {
        if self.is_acquired_lockable {
            debug_assert!(false, "begin_lockable while already acquired");
            return Status::InvalidState;
        }
        self.is_acquired_lockable = true;
        Status::Ok
    }

    /// Leave the lockable state. Every lock must have been released.
    pub fn end_lockable(&mut self) -> Status {
        if !self.is_acquired_lockable {
            debug_assert!(false, "end_lockable while not acquired");
            return Status::InvalidState;
        }
        if self.exclusive_lock_count != 0 || self.shared_lock_count != 0 {
            debug_assert!(false, "end_lockable with locks held");
            return Status::InvalidState;
        }
        self.is_acquired_lockable = false;
        Status::Ok
    }

    /// Acquire locks for `keys`, presorted by `(lock_code, lock_type)` with
    /// `Exclusive` first.
    ///
    /// Walks left to right, taking one lock per distinct bucket: because
    /// `Exclusive` sorts first per code, a code that needs any exclusive
    /// access is acquired exclusive on its first occurrence and later
    /// duplicates are no-ops. Each acquisition retries until it succeeds.
    pub fn lock(&mut self, keys: &[LockableKey]) -> Status {
        if !self.is_acquired_lockable {
            debug_assert!(false, "lock outside begin_lockable");
            return Status::InvalidState;
        }
        debug_assert!(lockable_keys_sorted(keys), "keys must be presorted");
        if keys.is_empty() {
            return Status::Ok;
        }

        let store = Arc::clone(&self.store);
        let guard = match EpochGuard::enter(store.epoch()) {
            Ok(guard) => guard,
            Err(status) => return status,
        };
        let table = store.lock_table();
        for i in 0..keys.len() {
            if i == 0
                || table.bucket_index(keys[i].lock_code) != table.bucket_index(keys[i - 1].lock_code)
            {
                let key = keys[i];
                while table.internal_lock(key.lock_code, LockOperation::lock(key.lock_type))
                    != OperationStatus::Success
                {
                    std::hint::spin_loop();
                }
                match key.lock_type {
                    LockType::Exclusive => self.exclusive_lock_count += 1,
                    LockType::Shared => self.shared_lock_count += 1,
                }
            }
        }
        drop(guard);
        Status::Ok
    }

    /// Release locks for `keys` (the same presorted slice passed to
    /// [`LockableSession::lock`]).
    ///
    /// Walks right to left and releases exactly the first-occurrence
    /// entries `lock` acquired, in reverse order.
    pub fn unlock(&mut self, keys: &[LockableKey]) -> Status {
        if !self.is_acquired_lockable {
            debug_assert!(false, "unlock outside begin_lockable");
            return Status::InvalidState;
        }
        debug_assert!(lockable_keys_sorted(keys), "keys must be presorted");
        if keys.is_empty() {
            return Status::Ok;
        }

        let store = Arc::clone(&self.store);
        let guard = match EpochGuard::enter(store.epoch()) {
            Ok(guard) => guard,
            Err(status) => return status,
        };
        let table = store.lock_table();
        for i in (0..keys.len()).rev() {
            if i == 0
                || table.bucket_index(keys[i].lock_code) != table.bucket_index(keys[i - 1].lock_code)
            {
                let key = keys[i];
                while table.internal_lock(key.lock_code, LockOperation::unlock(key.lock_type))
                    != OperationStatus::Success
                {
                    std::hint::spin_loop();
                }
                match key.lock_type {
                    LockType::Exclusive => {
                        debug_assert!(self.exclusive_lock_count > 0);
                        self.exclusive_lock_count = self.exclusive_lock_count.saturating_sub(1);
                    }
                    LockType::Shared => {
                        debug_assert!(self.shared_lock_count > 0);
                        self.shared_lock_count = self.shared_lock_count.saturating_sub(1);
                    }
                }
            }
        }
        drop(guard);
        Status::Ok
    }

    // ==================== Point operations ====================

    /// Read `key` through the pipeline.
    pub fn read<F>(&mut self, functions: &mut F, key: &K) -> Status
    where
        F: SessionFunctions<K, V>,
    {
        let store = Arc::clone(&self.store);
        let guard = match EpochGuard::enter(store.epoch()) {
            Ok(guard) => guard,
            Err(status) => return status,
        };
        self.serial += 1;
        let mut adapter = LockableFunctions::new(
            functions,
            store.lock_table().as_ref(),
            self.guid,
            &mut self.latest_commit_point,
        );
        let status = store.read(key, &mut adapter);
        drop(guard);
        status
    }

    /// Read the record at a logical address through the pipeline.
    pub fn read_at_address<F>(&mut self, functions: &mut F, address: u64) -> Status
    where
        F: SessionFunctions<K, V>,
    {
        let store = Arc::clone(&self.store);
        let guard = match EpochGuard::enter(store.epoch()) {
            Ok(guard) => guard,
            Err(status) => return status,
        };
        self.serial += 1;
        let mut adapter = LockableFunctions::new(
            functions,
            store.lock_table().as_ref(),
            self.guid,
            &mut self.latest_commit_point,
        );
        let status = store.read_at_address(address, &mut adapter);
        drop(guard);
        status
    }

    /// Upsert `key` to `value` through the pipeline.
    pub fn upsert<F>(&mut self, functions: &mut F, key: &K, value: &V) -> Status
    where
        F: SessionFunctions<K, V>,
    {
        let store = Arc::clone(&self.store);
        let guard = match EpochGuard::enter(store.epoch()) {
            Ok(guard) => guard,
            Err(status) => return status,
        };
        self.serial += 1;
        let mut adapter = LockableFunctions::new(
            functions,
            store.lock_table().as_ref(),
            self.guid,
            &mut self.latest_commit_point,
        );
        let status = store.upsert(key, value, &mut adapter);
        drop(guard);
        status
    }

    /// Read-modify-write `key` with `input` through the pipeline.
    pub fn rmw<F>(&mut self, functions: &mut F, key: &K, input: &V) -> Status
    where
        F: SessionFunctions<K, V>,
    {
        let store = Arc::clone(&self.store);
        let guard = match EpochGuard::enter(store.epoch()) {
            Ok(guard) => guard,
            Err(status) => return status,
        };
        self.serial += 1;
        let mut adapter = LockableFunctions::new(
            functions,
            store.lock_table().as_ref(),
            self.guid,
            &mut self.latest_commit_point,
        );
        let status = store.rmw(key, input, &mut adapter);
        drop(guard);
        status
    }

    /// Delete `key` through the pipeline.
    pub fn delete<F>(&mut self, functions: &mut F, key: &K) -> Status
    where
        F: SessionFunctions<K, V>,
    {
        let store = Arc::clone(&self.store);
        let guard = match EpochGuard::enter(store.epoch()) {
            Ok(guard) => guard,
            Err(status) => return status,
        };
        self.serial += 1;
        let mut adapter = LockableFunctions::new(
            functions,
            store.lock_table().as_ref(),
            self.guid,
            &mut self.latest_commit_point,
        );
        let status = store.delete(key, &mut adapter);
        drop(guard);
        status
    }

    /// Re-publish the epoch and drain deferred actions.
    pub fn refresh(&mut self) -> Status {
        match EpochGuard::enter(self.store.epoch()) {
            Ok(guard) => {
                drop(guard);
                Status::Ok
            }
            Err(status) => status,
        }
    }

    /// Whether all issued log I/O has completed; with `wait`, spins
    /// (refreshing the epoch) until it has.
    pub fn complete_pending(&mut self, wait: bool) -> bool {
        let store = Arc::clone(&self.store);
        let guard = match EpochGuard::enter(store.epoch()) {
            Ok(guard) => guard,
            Err(_) => return false,
        };
        if !wait {
            let done = store.complete_pending(false);
            drop(guard);
            return done;
        }
        while !store.complete_pending(false) {
            guard.refresh();
            std::thread::yield_now();
        }
        drop(guard);
        true
    }

    /// Flush the log, wait for durability, and deliver the commit point
    /// (all operations through the current serial number).
    pub fn commit<F>(&mut self, functions: &mut F) -> Status
    where
        F: SessionFunctions<K, V>,
    {
        let store = Arc::clone(&self.store);
        let guard = match EpochGuard::enter(store.epoch()) {
            Ok(guard) => guard,
            Err(status) => return status,
        };
        let commit_point = CommitPoint {
            until_serial: self.serial,
        };
        let mut adapter = LockableFunctions::new(
            functions,
            store.lock_table().as_ref(),
            self.guid,
            &mut self.latest_commit_point,
        );
        let status = store.commit(self.guid, commit_point, &mut adapter);
        drop(guard);
        status
    }

    // ==================== Convenience wrappers ====================

    /// Read the value for `key`, if any.
    pub fn read_value(&mut self, key: &K) -> Result<Option<V>, Status> {
        let mut functions = BasicFunctions::new();
        match self.read(&mut functions, key) {
            Status::Ok => Ok(functions.take_read()),
            Status::NotFound => Ok(None),
            status => Err(status),
        }
    }

    /// Upsert `key` to `value` with the default functions.
    pub fn upsert_value(&mut self, key: &K, value: &V) -> Status {
        let mut functions = BasicFunctions::new();
        self.upsert(&mut functions, key, value)
    }

    /// Delete `key` with the default functions.
    pub fn delete_value(&mut self, key: &K) -> Status {
        let mut functions = BasicFunctions::new();
        self.delete(&mut functions, key)
    }

    // ==================== Async variants ====================
    //
    // These do not hold the scoped guard across suspension points; each
    // attempt re-enters epoch protection through the sync routine.

    /// Async read with cooperative cancellation.
    pub async fn read_async<F>(
        &mut self,
        functions: &mut F,
        key: &K,
        token: &CancellationToken,
    ) -> Status
    where
        F: SessionFunctions<K, V>,
    {
        loop {
            if token.is_cancelled() {
                return Status::Cancelled;
            }
            let status = self.read(functions, key);
            if status != Status::Pending {
                return status;
            }
            tokio::task::yield_now().await;
        }
    }

    /// Async upsert with cooperative cancellation.
    pub async fn upsert_async<F>(
        &mut self,
        functions: &mut F,
        key: &K,
        value: &V,
        token: &CancellationToken,
    ) -> Status
    where
        F: SessionFunctions<K, V>,
    {
        loop {
            if token.is_cancelled() {
                return Status::Cancelled;
            }
            let status = self.upsert(functions, key, value);
            if status != Status::Pending {
                return status;
            }
            tokio::task::yield_now().await;
        }
    }

    /// Async read-modify-write with cooperative cancellation.
    pub async fn rmw_async<F>(
        &mut self,
        functions: &mut F,
        key: &K,
        input: &V,
        token: &CancellationToken,
    ) -> Status
    where
        F: SessionFunctions<K, V>,
    {
        loop {
            if token.is_cancelled() {
                return Status::Cancelled;
            }
            let status = self.rmw(functions, key, input);
            if status != Status::Pending {
                return status;
            }
            tokio::task::yield_now().await;
        }
    }

    /// Async delete with cooperative cancellation.
    pub async fn delete_async<F>(
        &mut self,
        functions: &mut F,
        key: &K,
        token: &CancellationToken,
    ) -> Status
    where
        F: SessionFunctions<K, V>,
    {
        loop {
            if token.is_cancelled() {
                return Status::Cancelled;
            }
            let status = self.delete(functions, key);
            if status != Status::Pending {
                return status;
            }
            tokio::task::yield_now().await;
        }
    }

    /// Await the drain of all issued log I/O, or cancellation.
    pub async fn complete_pending_async(&mut self, token: &CancellationToken) -> Status {
        tokio::select! {
            biased;
            _ = token.cancelled() => Status::Cancelled,
            _ = self.store.wait_pending_drained() => Status::Ok,
        }
    }

    /// Async commit: flush the log, await durability, deliver the commit
    /// point.
    pub async fn commit_async<F>(&mut self, functions: &mut F, token: &CancellationToken) -> Status
    where
        F: SessionFunctions<K, V>,
    {
        let store = Arc::clone(&self.store);
        let status = store.flush_log();
        if status.is_error() {
            return status;
        }
        tokio::select! {
            biased;
            _ = token.cancelled() => return Status::Cancelled,
            _ = store.wait_pending_drained() => {}
        }
        let commit_point = CommitPoint {
            until_serial: self.serial,
        };
        let mut adapter = LockableFunctions::new(
            functions,
            store.lock_table().as_ref(),
            self.guid,
            &mut self.latest_commit_point,
        );
        adapter.checkpoint_completion_callback(self.guid, &commit_point);
        Status::Ok
    }
}

impl<K, V, L> Drop for LockableSession<K, V, L>
where
    K: PersistKey,
    V: PersistValue,
    L: LockTable,
{
    fn drop(&mut self) {
        if !std::thread::panicking() {
            debug_assert!(
                self.exclusive_lock_count == 0 && self.shared_lock_count == 0,
                "session dropped with locks held"
            );
        }
    }
}

impl<K, V, L> StoreCore<K, V, L>
where
    K: PersistKey,
    V: PersistValue,
    L: LockTable,
{
    /// Start a lockable session against this store.
    pub fn lockable_session(self: &Arc<Self>) -> LockableSession<K, V, L> {
        LockableSession::new(Arc::clone(self))
    }
}
