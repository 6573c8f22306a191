//! Store internals: the sharded record table and the log appender.
//!
//! Every operation is driven through the functions pipeline and reports an
//! `OperationStatus`; retry signals are resolved by the outer routines and
//! never escape. Mutations append encoded records to the segmented device
//! through sector-aligned pages.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::codec::{encode_key, encode_value, KeyCodec, PersistKey, PersistValue};
use crate::device::SegmentedDevice;
use crate::epoch::LightEpoch;
use crate::locking::{BucketLockTable, LockTable};
use crate::record::RecordInfo;
use crate::status::{OperationStatus, Status};
use crate::store::functions::{CommitPoint, SessionFunctions};
use crate::utility::{monotonic_update, pad_alignment, AlignedBuffer};

/// Log frame kind: a stored value.
const FRAME_UPSERT: u8 = 1;
/// Log frame kind: a tombstone.
const FRAME_DELETE: u8 = 2;

/// Log segment capacity used when the device has no fixed segment size.
const DEFAULT_LOG_SEGMENT_SIZE: u64 = 1 << 30;

/// Store configuration.
#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    /// Number of record-table shards (rounded up to a power of two).
    pub shard_count: usize,
    /// Number of lock-table buckets (rounded up to a power of two).
    pub lock_bucket_count: usize,
    /// Log staging page size in bytes (rounded up to a sector multiple).
    pub log_page_size: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            shard_count: 16,
            lock_bucket_count: 1024,
            log_page_size: 4096,
        }
    }
}

struct RecordEntry<V> {
    info: RecordInfo,
    value: V,
}

struct Shard<K, V> {
    records: HashMap<K, RecordEntry<V>>,
}

impl<K, V> Shard<K, V> {
    fn new() -> Self {
        Self {
            records: HashMap::new(),
        }
    }
}

struct PendingIo {
    count: AtomicU64,
    notify: Notify,
}

struct LogTail {
    page: AlignedBuffer,
    page_len: usize,
    page_start: u64,
}

/// Appends encoded records to the segmented device through sector-aligned
/// staging pages. Full pages are written asynchronously; the flushed-until
/// watermark only ever advances.
struct LogAppender {
    device: Arc<SegmentedDevice>,
    page_size: usize,
    sector_size: usize,
    segment_capacity: u64,
    tail: Mutex<LogTail>,
    flushed_until: Arc<AtomicU64>,
    pending: Arc<PendingIo>,
}

impl LogAppender {
    fn new(device: Arc<SegmentedDevice>, page_size: usize) -> Result<Self, Status> {
        let sector_size = device.sector_size();
        let page_size = pad_alignment(page_size.max(sector_size), sector_size);
        let segment_capacity = device
            .segment_size()
            .unwrap_or(DEFAULT_LOG_SEGMENT_SIZE)
            .max(page_size as u64)
            .next_multiple_of(page_size as u64);
        let page = AlignedBuffer::zeroed(sector_size, page_size).ok_or(Status::OutOfMemory)?;
        Ok(Self {
            device,
            page_size,
            sector_size,
            segment_capacity,
            tail: Mutex::new(LogTail {
                page,
                page_len: 0,
                page_start: 0,
            }),
            flushed_until: Arc::new(AtomicU64::new(0)),
            pending: Arc::new(PendingIo {
                count: AtomicU64::new(0),
                notify: Notify::new(),
            }),
        })
    }

    fn append(&self, frame: &[u8]) -> Result<(), Status> {
        if frame.len() > self.page_size {
            return Err(Status::ResourceExhausted);
        }
        let mut tail = self.tail.lock();
        if tail.page_len + frame.len() > self.page_size {
            self.flush_locked(&mut tail)?;
        }
        let offset = tail.page_len;
        tail.page.as_mut_slice()[offset..offset + frame.len()].copy_from_slice(frame);
        tail.page_len += frame.len();
        Ok(())
    }

    /// Flush the staged page, padded to a sector multiple. Pages never
    /// straddle a segment boundary; the remainder of a segment is skipped
    /// as a hole.
    fn flush_locked(&self, tail: &mut LogTail) -> Result<(), Status> {
        if tail.page_len == 0 {
            return Ok(());
        }
        let padded = pad_alignment(tail.page_len, self.sector_size);
        let fresh =
            AlignedBuffer::zeroed(self.sector_size, self.page_size).ok_or(Status::OutOfMemory)?;
        let page = std::mem::replace(&mut tail.page, fresh);
        tail.page_len = 0;

        let mut start = tail.page_start;
        if start % self.segment_capacity + padded as u64 > self.segment_capacity {
            start = (start / self.segment_capacity + 1) * self.segment_capacity;
        }
        tail.page_start = start + padded as u64;

        let segment = start / self.segment_capacity;
        let offset = start % self.segment_capacity;
        let end = start + padded as u64;

        self.pending.count.fetch_add(1, Ordering::AcqRel);
        let pending = Arc::clone(&self.pending);
        let flushed_until = Arc::clone(&self.flushed_until);
        let source = page.as_ptr();
        self.device.write_async(
            source,
            segment,
            offset,
            padded as u32,
            move |error, _bytes, staged: AlignedBuffer| {
                if error == 0 {
                    monotonic_update(&flushed_until, end);
                } else {
                    tracing::warn!(error, segment, offset, "log page flush failed");
                }
                drop(staged);
                pending.count.fetch_sub(1, Ordering::AcqRel);
                pending.notify.notify_waiters();
            },
            page,
        );
        Ok(())
    }

    fn flush_tail(&self) -> Result<(), Status> {
        let mut tail = self.tail.lock();
        self.flush_locked(&mut tail)
    }

    fn pending_count(&self) -> u64 {
        self.pending.count.load(Ordering::Acquire)
    }

    fn wait_pending(&self) {
        while self.pending_count() != 0 {
            std::thread::yield_now();
        }
    }

    async fn wait_pending_drained(&self) {
        loop {
            let notified = self.pending.notify.notified();
            tokio::pin!(notified);
            // Register before re-checking the count, so a completion
            // between the check and the await cannot be missed.
            notified.as_mut().enable();
            if self.pending_count() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn flushed_until(&self) -> u64 {
        self.flushed_until.load(Ordering::Acquire)
    }
}

/// The store the lockable session drives.
///
/// Records live in a sharded in-memory table; record metadata carries the
/// validity/seal/tombstone/dirty/modified flags the pipeline inspects and
/// mutates. Mutations append to the device-backed log when one is attached.
pub struct StoreCore<K, V, L = BucketLockTable>
where
    K: PersistKey,
    V: PersistValue,
    L: LockTable,
{
    shards: Box<[Mutex<Shard<K, V>>]>,
    shard_mask: u64,
    addresses: Mutex<HashMap<u64, K>>,
    next_address: AtomicU64,
    epoch: Arc<LightEpoch>,
    lock_table: Arc<L>,
    log: Option<LogAppender>,
}

impl<K, V> StoreCore<K, V, BucketLockTable>
where
    K: PersistKey,
    V: PersistValue,
{
    /// Create a store with no device-backed log.
    pub fn in_memory(options: StoreOptions) -> Arc<Self> {
        let lock_table = Arc::new(BucketLockTable::new(options.lock_bucket_count));
        match Self::with_lock_table(options, None, lock_table) {
            Ok(store) => store,
            // No device means no log page allocation; construction cannot fail.
            Err(_) => unreachable!("in-memory store construction is infallible"),
        }
    }

    /// Create a store whose mutations append to `device`.
    pub fn with_device(
        options: StoreOptions,
        device: Arc<SegmentedDevice>,
    ) -> Result<Arc<Self>, Status> {
        let lock_table = Arc::new(BucketLockTable::new(options.lock_bucket_count));
        Self::with_lock_table(options, Some(device), lock_table)
    }
}

impl<K, V, L> StoreCore<K, V, L>
where
    K: PersistKey,
    V: PersistValue,
    L: LockTable,
{
    /// Create a store over a caller-provided lock table.
    pub fn with_lock_table(
        options: StoreOptions,
        device: Option<Arc<SegmentedDevice>>,
        lock_table: Arc<L>,
    ) -> Result<Arc<Self>, Status> {
        let shard_count = crate::utility::next_power_of_two(options.shard_count.max(1) as u64);
        let shards = (0..shard_count)
            .map(|_| Mutex::new(Shard::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let log = match device {
            Some(device) => Some(LogAppender::new(device, options.log_page_size)?),
            None => None,
        };
        Ok(Arc::new(Self {
            shards,
            shard_mask: shard_count - 1,
            addresses: Mutex::new(HashMap::new()),
            next_address: AtomicU64::new(1),
            epoch: Arc::new(LightEpoch::new()),
            lock_table,
            log,
        }))
    }

    /// The store's epoch domain.
    pub fn epoch(&self) -> &Arc<LightEpoch> {
        &self.epoch
    }

    /// The store's lock table.
    pub fn lock_table(&self) -> &Arc<L> {
        &self.lock_table
    }

    /// Derive the lock code for a key (stable across runs).
    pub fn lock_code_for(&self, key: &K) -> Result<u64, Status> {
        K::Codec::hash(key)
    }

    /// Number of live (non-tombstone) records.
    pub fn record_count(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| {
                shard
                    .lock()
                    .records
                    .values()
                    .filter(|entry| !entry.info.is_tombstone())
                    .count()
            })
            .sum()
    }

    /// Snapshot a record's metadata flags.
    pub fn record_info(&self, key: &K) -> Option<RecordInfo> {
        let code = K::Codec::hash(key).ok()?;
        let shard = self.shards[(code & self.shard_mask) as usize].lock();
        shard.records.get(key).map(|entry| entry.info.clone())
    }

    /// Logical address of a record, if present.
    pub fn record_address(&self, key: &K) -> Option<u64> {
        self.record_info(key).map(|info| info.address())
    }

    /// Log bytes confirmed durable (0 without a device-backed log).
    pub fn flushed_until(&self) -> u64 {
        self.log.as_ref().map_or(0, |log| log.flushed_until())
    }

    /// Number of log page writes still in flight.
    pub fn pending_io_count(&self) -> u64 {
        self.log.as_ref().map_or(0, |log| log.pending_count())
    }

    fn shard_for(&self, lock_code: u64) -> &Mutex<Shard<K, V>> {
        &self.shards[(lock_code & self.shard_mask) as usize]
    }

    fn allocate_address(&self) -> u64 {
        self.next_address.fetch_add(1, Ordering::AcqRel)
    }

    fn register_address(&self, address: u64, key: &K) {
        self.addresses.lock().insert(address, key.clone());
    }

    fn release_address(&self, address: u64) {
        self.addresses.lock().remove(&address);
    }

    fn log_record(&self, kind: u8, key: &K, value: Option<&V>) -> Result<(), Status> {
        let Some(log) = &self.log else {
            return Ok(());
        };
        let key_bytes = encode_key(key)?;
        let value_bytes = match value {
            Some(value) => encode_value(value)?,
            None => Vec::new(),
        };
        let total = 9 + key_bytes.len() + value_bytes.len();
        let mut frame = Vec::with_capacity(total);
        frame.extend_from_slice(&(total as u32).to_le_bytes());
        frame.extend_from_slice(&(key_bytes.len() as u32).to_le_bytes());
        frame.push(kind);
        frame.extend_from_slice(&key_bytes);
        frame.extend_from_slice(&value_bytes);
        log.append(&frame)
    }

    // ==================== Internal routines ====================

    fn internal_read<A>(&self, lock_code: u64, key: &K, hooks: &mut A) -> OperationStatus
    where
        A: SessionFunctions<K, V>,
    {
        let shard = self.shard_for(lock_code).lock();
        match shard.records.get(key) {
            None => OperationStatus::NotFound,
            Some(entry) => {
                if entry.info.is_tombstone() {
                    return OperationStatus::NotFound;
                }
                if !hooks.try_lock_transient_shared(lock_code) {
                    return OperationStatus::RetryNow;
                }
                let ok = hooks.concurrent_reader(key, &entry.value, &entry.info);
                hooks.unlock_transient_shared(lock_code);
                if ok {
                    OperationStatus::Success
                } else {
                    OperationStatus::RetryNow
                }
            }
        }
    }

    fn internal_upsert<A>(
        &self,
        lock_code: u64,
        key: &K,
        value: &V,
        hooks: &mut A,
    ) -> OperationStatus
    where
        A: SessionFunctions<K, V>,
    {
        let mut shard = self.shard_for(lock_code).lock();
        if let Some(entry) = shard.records.get_mut(key) {
            if !entry.info.is_tombstone() {
                if entry.info.is_sealed() {
                    return OperationStatus::RetryNow;
                }
                if !hooks.try_lock_transient_exclusive(lock_code) {
                    return OperationStatus::RetryNow;
                }
                let written = hooks.concurrent_writer(key, value, &mut entry.value, &entry.info);
                hooks.unlock_transient_exclusive(lock_code);
                if written {
                    if self.log_record(FRAME_UPSERT, key, Some(&entry.value)).is_err() {
                        return OperationStatus::Aborted;
                    }
                    return OperationStatus::Success;
                }
                // In-place write refused: fall through and install a fresh
                // record version.
            }
        }

        let address = self.allocate_address();
        let new_value = hooks.single_writer(key, value);
        self.install_record(&mut shard, key, address, new_value, hooks, InstallKind::Upsert)
    }

    fn internal_rmw<A>(
        &self,
        lock_code: u64,
        key: &K,
        input: &V,
        hooks: &mut A,
    ) -> OperationStatus
    where
        A: SessionFunctions<K, V>,
    {
        let mut shard = self.shard_for(lock_code).lock();
        let copied = match shard.records.get_mut(key) {
            Some(entry) if !entry.info.is_tombstone() => {
                if entry.info.is_sealed() {
                    return OperationStatus::RetryNow;
                }
                if !hooks.try_lock_transient_exclusive(lock_code) {
                    return OperationStatus::RetryNow;
                }
                let updated = hooks.in_place_updater(key, input, &mut entry.value, &entry.info);
                hooks.unlock_transient_exclusive(lock_code);
                if updated {
                    if self.log_record(FRAME_UPSERT, key, Some(&entry.value)).is_err() {
                        return OperationStatus::Aborted;
                    }
                    return OperationStatus::Success;
                }
                // In-place update refused: copy-update into a fresh record,
                // sealing the old version for the transition.
                if !entry.info.try_seal() {
                    return OperationStatus::RetryNow;
                }
                Some(hooks.copy_updater(key, input, &entry.value))
            }
            _ => None,
        };

        let address = self.allocate_address();
        match copied {
            Some(new_value) => self.install_record(
                &mut shard,
                key,
                address,
                new_value,
                hooks,
                InstallKind::CopyUpdate,
            ),
            None => {
                let new_value = hooks.initial_updater(key, input);
                self.install_record(
                    &mut shard,
                    key,
                    address,
                    new_value,
                    hooks,
                    InstallKind::InitialUpdate,
                )
            }
        }
    }

    fn internal_delete<A>(&self, lock_code: u64, key: &K, hooks: &mut A) -> OperationStatus
    where
        A: SessionFunctions<K, V>,
    {
        let mut shard = self.shard_for(lock_code).lock();
        match shard.records.get_mut(key) {
            Some(entry) if !entry.info.is_tombstone() => {
                if entry.info.is_sealed() {
                    return OperationStatus::RetryNow;
                }
                if !hooks.try_lock_transient_exclusive(lock_code) {
                    return OperationStatus::RetryNow;
                }
                let deleted = hooks.concurrent_deleter(key, &mut entry.value, &entry.info);
                hooks.unlock_transient_exclusive(lock_code);
                if deleted {
                    if self.log_record(FRAME_DELETE, key, None).is_err() {
                        return OperationStatus::Aborted;
                    }
                    OperationStatus::Success
                } else {
                    OperationStatus::RetryNow
                }
            }
            _ => OperationStatus::NotFound,
        }
    }

    fn install_record<A>(
        &self,
        shard: &mut Shard<K, V>,
        key: &K,
        address: u64,
        value: V,
        hooks: &mut A,
        kind: InstallKind,
    ) -> OperationStatus
    where
        A: SessionFunctions<K, V>,
    {
        let entry = RecordEntry {
            info: RecordInfo::new(address),
            value,
        };
        if let Some(old) = shard.records.insert(key.clone(), entry) {
            self.release_address(old.info.address());
            old.info.set_valid(false);
            hooks.dispose(key, &old.value);
        }
        self.register_address(address, key);

        let entry = match shard.records.get(key) {
            Some(entry) => entry,
            None => return OperationStatus::Aborted,
        };
        match kind {
            InstallKind::Upsert => hooks.post_single_writer(key, &entry.value, &entry.info),
            InstallKind::InitialUpdate => {
                hooks.post_initial_updater(key, &entry.value, &entry.info)
            }
            InstallKind::CopyUpdate => hooks.post_copy_updater(key, &entry.value, &entry.info),
        }
        if self.log_record(FRAME_UPSERT, key, Some(&entry.value)).is_err() {
            return OperationStatus::Aborted;
        }
        OperationStatus::Success
    }

    // ==================== Outer routines ====================

    pub(crate) fn read<A>(&self, key: &K, hooks: &mut A) -> Status
    where
        A: SessionFunctions<K, V>,
    {
        debug_assert!(self.epoch.is_current_thread_protected());
        let lock_code = match K::Codec::hash(key) {
            Ok(code) => code,
            Err(status) => return status,
        };
        loop {
            let op_status = self.internal_read(lock_code, key, hooks);
            if op_status.needs_retry() {
                std::hint::spin_loop();
                continue;
            }
            let status = op_status.to_status();
            hooks.read_completion_callback(key, status);
            return status;
        }
    }

    pub(crate) fn read_at_address<A>(&self, address: u64, hooks: &mut A) -> Status
    where
        A: SessionFunctions<K, V>,
    {
        debug_assert!(self.epoch.is_current_thread_protected());
        // Resolve outside the shard lock; lock order is shard before
        // addresses.
        let key = match self.addresses.lock().get(&address) {
            Some(key) => key.clone(),
            None => return Status::NotFound,
        };
        self.read(&key, hooks)
    }

    pub(crate) fn upsert<A>(&self, key: &K, value: &V, hooks: &mut A) -> Status
    where
        A: SessionFunctions<K, V>,
    {
        debug_assert!(self.epoch.is_current_thread_protected());
        let lock_code = match K::Codec::hash(key) {
            Ok(code) => code,
            Err(status) => return status,
        };
        loop {
            let op_status = self.internal_upsert(lock_code, key, value, hooks);
            if op_status.needs_retry() {
                std::hint::spin_loop();
                continue;
            }
            let status = op_status.to_status();
            hooks.upsert_completion_callback(key, status);
            return status;
        }
    }

    pub(crate) fn rmw<A>(&self, key: &K, input: &V, hooks: &mut A) -> Status
    where
        A: SessionFunctions<K, V>,
    {
        debug_assert!(self.epoch.is_current_thread_protected());
        let lock_code = match K::Codec::hash(key) {
            Ok(code) => code,
            Err(status) => return status,
        };
        loop {
            let op_status = self.internal_rmw(lock_code, key, input, hooks);
            if op_status.needs_retry() {
                std::hint::spin_loop();
                continue;
            }
            let status = op_status.to_status();
            hooks.rmw_completion_callback(key, status);
            return status;
        }
    }

    pub(crate) fn delete<A>(&self, key: &K, hooks: &mut A) -> Status
    where
        A: SessionFunctions<K, V>,
    {
        debug_assert!(self.epoch.is_current_thread_protected());
        let lock_code = match K::Codec::hash(key) {
            Ok(code) => code,
            Err(status) => return status,
        };
        loop {
            let op_status = self.internal_delete(lock_code, key, hooks);
            if op_status.needs_retry() {
                std::hint::spin_loop();
                continue;
            }
            let status = op_status.to_status();
            hooks.delete_completion_callback(key, status);
            return status;
        }
    }

    /// Whether all issued log I/O has completed. With `wait`, spins until
    /// it has.
    pub(crate) fn complete_pending(&self, wait: bool) -> bool {
        match &self.log {
            None => true,
            Some(log) => {
                if wait {
                    log.wait_pending();
                    true
                } else {
                    log.pending_count() == 0
                }
            }
        }
    }

    /// Await the drain of all issued log I/O.
    pub(crate) async fn wait_pending_drained(&self) {
        if let Some(log) = &self.log {
            log.wait_pending_drained().await;
        }
    }

    /// Flush the partial tail page to the device.
    pub(crate) fn flush_log(&self) -> Status {
        match &self.log {
            None => Status::Ok,
            Some(log) => match log.flush_tail() {
                Ok(()) => Status::Ok,
                Err(status) => status,
            },
        }
    }

    /// Flush the log, wait for durability, and deliver the commit point
    /// through the pipeline.
    pub(crate) fn commit<A>(
        &self,
        session_id: Uuid,
        commit_point: CommitPoint,
        hooks: &mut A,
    ) -> Status
    where
        A: SessionFunctions<K, V>,
    {
        let status = self.flush_log();
        if status.is_error() {
            return status;
        }
        if let Some(log) = &self.log {
            log.wait_pending();
        }
        hooks.checkpoint_completion_callback(session_id, &commit_point);
        Status::Ok
    }
}

enum InstallKind {
    Upsert,
    InitialUpdate,
    CopyUpdate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_default() {
        let options = StoreOptions::default();
        assert_eq!(options.shard_count, 16);
        assert_eq!(options.lock_bucket_count, 1024);
        assert_eq!(options.log_page_size, 4096);
    }

    #[test]
    fn test_in_memory_store_empty() {
        let store = StoreCore::<u64, u64>::in_memory(StoreOptions::default());
        assert_eq!(store.record_count(), 0);
        assert_eq!(store.flushed_until(), 0);
        assert_eq!(store.pending_io_count(), 0);
        assert!(store.complete_pending(false));
    }

    #[test]
    fn test_lock_code_is_stable() {
        let store = StoreCore::<u64, u64>::in_memory(StoreOptions::default());
        let a = store.lock_code_for(&42).unwrap();
        let b = store.lock_code_for(&42).unwrap();
        assert_eq!(a, b);
        // lock code is the pinned hash of the encoded key bytes
        assert_eq!(a, crate::utility::hash_bytes(&42u64.to_le_bytes()));
    }
}
