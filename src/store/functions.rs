//! The functions pipeline: user hooks invoked at record lifecycle points.
//!
//! A session is parameterized on a concrete [`SessionFunctions`] type so
//! every hook call is monomorphized and inlineable. Most hooks have
//! defaults; an implementation only has to say how to read and how to
//! update in place.

use uuid::Uuid;

use crate::record::RecordInfo;
use crate::status::Status;

/// The durable point a session has been committed through.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitPoint {
    /// All operations up to and including this serial number are durable.
    pub until_serial: u64,
}

/// Strategy object invoked at record lifecycle points.
///
/// `single_*` hooks run when the store has exclusive access to a fresh
/// record; `concurrent_*` hooks run against records other threads may
/// observe and may refuse (return `false`) to force a retry or a
/// copy-update. Transient lock hooks default to no-ops that grant the lock;
/// in lockable mode the session's adapter replaces them with assertions
/// that the key is already manually locked.
pub trait SessionFunctions<K, V>: Send
where
    V: Clone,
{
    /// Read a record the store holds privately.
    fn single_reader(&mut self, key: &K, value: &V, info: &RecordInfo);

    /// Read a record concurrently visible to other threads.
    ///
    /// Returning `false` makes the store retry.
    fn concurrent_reader(&mut self, key: &K, value: &V, info: &RecordInfo) -> bool {
        self.single_reader(key, value, info);
        true
    }

    /// Produce the stored value for a fresh record.
    fn single_writer(&mut self, _key: &K, src: &V) -> V {
        src.clone()
    }

    /// Runs after a fresh record becomes visible.
    fn post_single_writer(&mut self, _key: &K, _value: &V, _info: &RecordInfo) {}

    /// Overwrite a concurrently visible record in place.
    ///
    /// Returning `false` makes the store install a fresh record instead.
    fn concurrent_writer(&mut self, _key: &K, src: &V, dst: &mut V, _info: &RecordInfo) -> bool {
        *dst = src.clone();
        true
    }

    /// Produce the value for a read-modify-write of an absent key.
    fn initial_updater(&mut self, _key: &K, input: &V) -> V {
        input.clone()
    }

    /// Runs after an initial-update record becomes visible.
    fn post_initial_updater(&mut self, _key: &K, _value: &V, _info: &RecordInfo) {}

    /// Apply a read-modify-write in place.
    ///
    /// Returning `false` makes the store copy-update into a fresh record.
    fn in_place_updater(&mut self, key: &K, input: &V, value: &mut V, info: &RecordInfo)
        -> bool;

    /// Produce the updated value for a copy-update.
    fn copy_updater(&mut self, key: &K, input: &V, old: &V) -> V {
        let mut value = old.clone();
        let scratch = RecordInfo::new(0);
        self.in_place_updater(key, input, &mut value, &scratch);
        value
    }

    /// Runs after a copy-update record becomes visible.
    fn post_copy_updater(&mut self, _key: &K, _value: &V, _info: &RecordInfo) {}

    /// Delete a record the store holds privately.
    fn single_deleter(&mut self, _key: &K, _value: &mut V) {}

    /// Delete a concurrently visible record.
    ///
    /// Returning `false` makes the store retry.
    fn concurrent_deleter(&mut self, _key: &K, _value: &mut V, _info: &RecordInfo) -> bool {
        true
    }

    /// A discarded record version is handed back before it is dropped.
    fn dispose(&mut self, _key: &K, _value: &V) {}

    /// Take the per-record transient lock in exclusive mode.
    fn try_lock_transient_exclusive(&mut self, _lock_code: u64) -> bool {
        true
    }

    /// Take the per-record transient lock in shared mode.
    fn try_lock_transient_shared(&mut self, _lock_code: u64) -> bool {
        true
    }

    /// Release the transient exclusive lock.
    fn unlock_transient_exclusive(&mut self, _lock_code: u64) {}

    /// Release the transient shared lock.
    fn unlock_transient_shared(&mut self, _lock_code: u64) {}

    /// A read resolved with the given status.
    fn read_completion_callback(&mut self, _key: &K, _status: Status) {}

    /// An upsert resolved with the given status.
    fn upsert_completion_callback(&mut self, _key: &K, _status: Status) {}

    /// A read-modify-write resolved with the given status.
    fn rmw_completion_callback(&mut self, _key: &K, _status: Status) {}

    /// A delete resolved with the given status.
    fn delete_completion_callback(&mut self, _key: &K, _status: Status) {}

    /// The session's log was committed through `commit_point`.
    fn checkpoint_completion_callback(&mut self, _session_id: Uuid, _commit_point: &CommitPoint) {
    }
}

/// Minimal functions implementation: reads record the value, writes and
/// updates overwrite with the input.
pub struct BasicFunctions<K, V> {
    /// Value captured by the most recent read.
    pub last_read: Option<V>,
    _marker: std::marker::PhantomData<fn(K)>,
}

impl<K, V> BasicFunctions<K, V> {
    /// Create a fresh instance with no captured read.
    pub fn new() -> Self {
        Self {
            last_read: None,
            _marker: std::marker::PhantomData,
        }
    }

    /// Take the value captured by the most recent read.
    pub fn take_read(&mut self) -> Option<V> {
        self.last_read.take()
    }
}

impl<K, V> Default for BasicFunctions<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> SessionFunctions<K, V> for BasicFunctions<K, V>
where
    K: Send,
    V: Clone + Send,
{
    fn single_reader(&mut self, _key: &K, value: &V, _info: &RecordInfo) {
        self.last_read = Some(value.clone());
    }

    fn in_place_updater(
        &mut self,
        _key: &K,
        input: &V,
        value: &mut V,
        _info: &RecordInfo,
    ) -> bool {
        *value = input.clone();
        true
    }
}
