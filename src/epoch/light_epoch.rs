//! LightEpoch - lightweight epoch-based memory reclamation
//!
//! Threads register as active while touching shared state; reclamation of
//! retired memory is deferred until every registered thread has moved past
//! the epoch in which it was retired.

use std::cell::{RefCell, UnsafeCell};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::constants::{CACHE_LINE_BYTES, MAX_THREADS};
use crate::status::Status;

// ============ Thread ID Allocation ============

/// Global counter for allocating thread-local IDs
static NEXT_THREAD_ID: AtomicUsize = AtomicUsize::new(0);

/// Recycled thread IDs (used when threads exit).
static FREE_THREAD_IDS: OnceLock<Mutex<Vec<usize>>> = OnceLock::new();

fn free_thread_ids() -> &'static Mutex<Vec<usize>> {
    FREE_THREAD_IDS.get_or_init(|| Mutex::new(Vec::new()))
}

#[derive(Debug)]
struct ThreadIdGuard {
    id: usize,
}

impl Drop for ThreadIdGuard {
    fn drop(&mut self) {
        if let Some(free) = FREE_THREAD_IDS.get() {
            free.lock().push(self.id);
        }
    }
}

fn try_allocate_thread_id() -> Option<ThreadIdGuard> {
    if let Some(id) = free_thread_ids().lock().pop() {
        return Some(ThreadIdGuard { id });
    }

    match NEXT_THREAD_ID.fetch_update(Ordering::AcqRel, Ordering::Acquire, |next| {
        if next < MAX_THREADS {
            Some(next + 1)
        } else {
            None
        }
    }) {
        Ok(id) => Some(ThreadIdGuard { id }),
        Err(_) => {
            // Another thread may have just returned an ID. Re-check before giving up.
            free_thread_ids().lock().pop().map(|id| ThreadIdGuard { id })
        }
    }
}

thread_local! {
    static THREAD_ID: RefCell<Option<ThreadIdGuard>> = const { RefCell::new(None) };
}

/// Get the current thread's ID for epoch protection
///
/// The ID is allocated on first call, remains constant for the thread's
/// lifetime, and is recycled when the thread exits.
///
/// # Errors
///
/// Returns `Status::TooManyThreads` if more than `MAX_THREADS` threads
/// concurrently use the library.
#[inline]
pub fn get_thread_id() -> Result<usize, Status> {
    THREAD_ID
        .with(|slot| {
            let mut slot = slot.borrow_mut();
            if let Some(guard) = slot.as_ref() {
                return Some(guard.id);
            }

            let guard = try_allocate_thread_id()?;
            let id = guard.id;
            *slot = Some(guard);
            Some(id)
        })
        .ok_or(Status::TooManyThreads)
}

/// Special epoch value indicating the thread is not protected
pub const UNPROTECTED: u64 = 0;

/// Size of the drain list for deferred actions
const DRAIN_LIST_SIZE: usize = 256;

/// Entry in the epoch table (one per thread)
#[repr(C, align(64))]
struct Entry {
    /// Local epoch value seen by this thread
    local_current_epoch: AtomicU64,
    /// Padding to fill the cache line
    _padding: [u8; CACHE_LINE_BYTES - 8],
}

impl Entry {
    const fn new() -> Self {
        Self {
            local_current_epoch: AtomicU64::new(UNPROTECTED),
            _padding: [0; CACHE_LINE_BYTES - 8],
        }
    }
}

/// Action to be performed when an epoch becomes safe to reclaim
pub struct EpochAction {
    /// The epoch when this action was registered
    epoch: AtomicU64,
    /// The callback to invoke
    callback: UnsafeCell<Option<Box<dyn FnOnce() + Send + 'static>>>,
}

impl EpochAction {
    /// Epoch value indicating this slot is free
    const FREE: u64 = u64::MAX;
    /// Epoch value indicating this slot is locked
    const LOCKED: u64 = u64::MAX - 1;

    const fn new() -> Self {
        Self {
            epoch: AtomicU64::new(Self::FREE),
            callback: UnsafeCell::new(None),
        }
    }

    /// Try to pop the action if the epoch has been reached
    fn try_pop(&self, expected_epoch: u64) -> bool {
        match self.epoch.compare_exchange(
            expected_epoch,
            Self::LOCKED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                let callback = unsafe { (*self.callback.get()).take() };
                self.epoch.store(Self::FREE, Ordering::Release);
                if let Some(cb) = callback {
                    cb();
                }
                true
            }
            Err(_) => false,
        }
    }

    /// Try to push a new action
    ///
    /// Returns `Ok(())` if successful, `Err(callback)` if the CAS failed,
    /// allowing the caller to retry with the callback.
    fn try_push<F>(&self, prior_epoch: u64, callback: F) -> Result<(), F>
    where
        F: FnOnce() + Send + 'static,
    {
        match self.epoch.compare_exchange(
            Self::FREE,
            Self::LOCKED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                unsafe {
                    *self.callback.get() = Some(Box::new(callback));
                }
                self.epoch.store(prior_epoch, Ordering::Release);
                Ok(())
            }
            Err(_) => Err(callback),
        }
    }
}

// Safety: EpochAction is protected by atomic operations
unsafe impl Send for EpochAction {}
unsafe impl Sync for EpochAction {}

/// Lightweight epoch protection framework
///
/// Tracks which threads are accessing shared state and defers cleanup until
/// all threads have moved past a safe point.
pub struct LightEpoch {
    /// Per-thread epoch table
    table: Box<[Entry]>,
    /// List of deferred actions
    drain_list: Box<[EpochAction]>,
    /// Number of pending drain actions
    drain_count: AtomicU32,
    /// Current global epoch
    pub current_epoch: AtomicU64,
    /// Cached safe-to-reclaim epoch
    pub safe_to_reclaim_epoch: AtomicU64,
}

impl LightEpoch {
    /// Create a new LightEpoch instance
    pub fn new() -> Self {
        let table = (0..MAX_THREADS)
            .map(|_| Entry::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let drain_list = (0..DRAIN_LIST_SIZE)
            .map(|_| EpochAction::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            table,
            drain_list,
            drain_count: AtomicU32::new(0),
            current_epoch: AtomicU64::new(1),
            safe_to_reclaim_epoch: AtomicU64::new(0),
        }
    }

    /// Enter the protected region
    ///
    /// Returns the current epoch value. The thread must call `unprotect()`
    /// when done accessing shared state.
    #[inline]
    pub fn protect(&self, thread_id: usize) -> u64 {
        debug_assert!(thread_id < MAX_THREADS);
        let epoch = self.current_epoch.load(Ordering::Acquire);
        self.table[thread_id]
            .local_current_epoch
            .store(epoch, Ordering::Release);
        epoch
    }

    /// Enter the protected region and drain pending actions
    #[inline]
    pub fn protect_and_drain(&self, thread_id: usize) -> u64 {
        let epoch = self.protect(thread_id);
        if self.drain_count.load(Ordering::Acquire) > 0 {
            self.drain(epoch);
        }
        epoch
    }

    /// Check if the thread is currently protected
    #[inline]
    pub fn is_protected(&self, thread_id: usize) -> bool {
        debug_assert!(thread_id < MAX_THREADS);
        self.table[thread_id]
            .local_current_epoch
            .load(Ordering::Acquire)
            != UNPROTECTED
    }

    /// Check if the calling thread is currently protected
    #[inline]
    pub fn is_current_thread_protected(&self) -> bool {
        get_thread_id().map(|id| self.is_protected(id)).unwrap_or(false)
    }

    /// Exit the protected region
    #[inline]
    pub fn unprotect(&self, thread_id: usize) {
        debug_assert!(thread_id < MAX_THREADS);
        self.table[thread_id]
            .local_current_epoch
            .store(UNPROTECTED, Ordering::Release);
    }

    /// Drain pending actions that are now safe to execute
    fn drain(&self, next_epoch: u64) {
        self.compute_new_safe_to_reclaim_epoch(next_epoch);
        let safe_epoch = self.safe_to_reclaim_epoch.load(Ordering::Acquire);

        for action in self.drain_list.iter() {
            let trigger_epoch = action.epoch.load(Ordering::Acquire);
            if trigger_epoch == EpochAction::FREE
                || trigger_epoch == EpochAction::LOCKED
                || trigger_epoch > safe_epoch
            {
                continue;
            }

            if action.try_pop(trigger_epoch) && self.drain_count.fetch_sub(1, Ordering::AcqRel) == 1
            {
                break;
            }
        }
    }

    /// Increment the current epoch
    pub fn bump_current_epoch(&self) -> u64 {
        let next_epoch = self.current_epoch.fetch_add(1, Ordering::AcqRel) + 1;
        if self.drain_count.load(Ordering::Acquire) > 0 {
            self.drain(next_epoch);
        }
        next_epoch
    }

    /// Increment the epoch and register a callback for when the old epoch is safe
    pub fn bump_current_epoch_with_action<F>(&self, callback: F) -> u64
    where
        F: FnOnce() + Send + 'static,
    {
        const MAX_FULL_SCANS: usize = 500;

        let prior_epoch = self.bump_current_epoch() - 1;

        let mut callback = Some(callback);
        let mut i = 0;
        let mut full_scans = 0;
        loop {
            let action = &self.drain_list[i];
            let trigger_epoch = action.epoch.load(Ordering::Acquire);

            if trigger_epoch == EpochAction::FREE {
                if let Some(cb) = callback.take() {
                    match action.try_push(prior_epoch, cb) {
                        Ok(()) => {
                            self.drain_count.fetch_add(1, Ordering::AcqRel);
                            return prior_epoch + 1;
                        }
                        Err(returned_cb) => {
                            // CAS failed, restore the callback and try another slot
                            callback = Some(returned_cb);
                        }
                    }
                }
            }

            i = (i + 1) % DRAIN_LIST_SIZE;
            if i == 0 {
                full_scans += 1;
                if full_scans >= MAX_FULL_SCANS {
                    thread::sleep(Duration::from_secs(1));
                    tracing::warn!("unable to add trigger to epoch after many retries");
                    // Execute the callback directly since we couldn't defer it
                    if let Some(cb) = callback.take() {
                        cb();
                    }
                    return prior_epoch + 1;
                }
            }
        }
    }

    /// Compute the new safe-to-reclaim epoch by scanning all threads
    pub fn compute_new_safe_to_reclaim_epoch(&self, current_epoch: u64) -> u64 {
        let mut oldest_ongoing = current_epoch;

        for entry in self.table.iter() {
            let entry_epoch = entry.local_current_epoch.load(Ordering::Acquire);
            if entry_epoch != UNPROTECTED && entry_epoch < oldest_ongoing {
                oldest_ongoing = entry_epoch;
            }
        }

        let safe = oldest_ongoing.saturating_sub(1);
        self.safe_to_reclaim_epoch.store(safe, Ordering::Release);
        safe
    }

    /// Check if an epoch is safe to reclaim
    #[inline]
    pub fn is_safe_to_reclaim(&self, epoch: u64) -> bool {
        epoch <= self.safe_to_reclaim_epoch.load(Ordering::Acquire)
    }
}

impl Default for LightEpoch {
    fn default() -> Self {
        Self::new()
    }
}

// Safety: LightEpoch uses only atomic operations for thread-safe access
unsafe impl Send for LightEpoch {}
unsafe impl Sync for LightEpoch {}

/// RAII guard for scoped epoch protection.
///
/// Protection here is not reentrant: entering while the thread is already
/// protected is a protocol violation, asserted in debug builds. Session
/// entry points rely on this to reject nested protection.
pub struct EpochGuard<'a> {
    epoch: &'a LightEpoch,
    thread_id: usize,
}

impl<'a> EpochGuard<'a> {
    /// Enter epoch protection on the calling thread.
    ///
    /// # Errors
    ///
    /// Returns `Status::TooManyThreads` if no thread slot is available.
    pub fn enter(epoch: &'a LightEpoch) -> Result<Self, Status> {
        let thread_id = get_thread_id()?;
        debug_assert!(
            !epoch.is_protected(thread_id),
            "epoch protection is not reentrant"
        );
        epoch.protect_and_drain(thread_id);
        Ok(Self { epoch, thread_id })
    }

    /// Get the thread ID
    pub fn thread_id(&self) -> usize {
        self.thread_id
    }

    /// Re-publish the current epoch and drain pending actions.
    pub fn refresh(&self) {
        self.epoch.protect_and_drain(self.thread_id);
    }
}

impl Drop for EpochGuard<'_> {
    fn drop(&mut self) {
        self.epoch.unprotect(self.thread_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_basic_protection() {
        let epoch = LightEpoch::new();

        assert!(!epoch.is_protected(0));

        let e = epoch.protect(0);
        assert!(epoch.is_protected(0));
        assert_eq!(e, 1);

        epoch.unprotect(0);
        assert!(!epoch.is_protected(0));
    }

    #[test]
    fn test_bump_epoch() {
        let epoch = LightEpoch::new();

        assert_eq!(epoch.current_epoch.load(Ordering::Relaxed), 1);

        let new_epoch = epoch.bump_current_epoch();
        assert_eq!(new_epoch, 2);
        assert_eq!(epoch.current_epoch.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_safe_to_reclaim() {
        let epoch = LightEpoch::new();

        // No threads protected - all prior epochs are safe
        epoch.compute_new_safe_to_reclaim_epoch(10);
        assert!(epoch.is_safe_to_reclaim(9));

        // Protect thread 0 at epoch 5
        epoch.current_epoch.store(5, Ordering::Relaxed);
        epoch.protect(0);
        epoch.compute_new_safe_to_reclaim_epoch(10);
        assert!(epoch.is_safe_to_reclaim(4));
        assert!(!epoch.is_safe_to_reclaim(5));

        epoch.unprotect(0);
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let epoch = LightEpoch::new();
        let tid;
        {
            let guard = EpochGuard::enter(&epoch).unwrap();
            tid = guard.thread_id();
            assert!(epoch.is_protected(tid));
        }
        assert!(!epoch.is_protected(tid));
    }

    #[test]
    fn test_deferred_action_runs_when_safe() {
        let epoch = Arc::new(LightEpoch::new());
        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let ran2 = Arc::clone(&ran);
        epoch.bump_current_epoch_with_action(move || {
            ran2.store(true, Ordering::Release);
        });

        // No protected threads: a further bump drains the action.
        epoch.bump_current_epoch();
        assert!(ran.load(Ordering::Acquire));
    }

    #[test]
    fn test_deferred_action_waits_for_protected_thread() {
        let epoch = Arc::new(LightEpoch::new());
        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));

        epoch.protect(0);

        let ran2 = Arc::clone(&ran);
        epoch.bump_current_epoch_with_action(move || {
            ran2.store(true, Ordering::Release);
        });

        epoch.bump_current_epoch();
        assert!(!ran.load(Ordering::Acquire));

        epoch.unprotect(0);
        epoch.bump_current_epoch();
        assert!(ran.load(Ordering::Acquire));
    }

    #[test]
    fn test_thread_id_stable() {
        let a = get_thread_id().unwrap();
        let b = get_thread_id().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    #[should_panic(expected = "not reentrant")]
    fn test_nested_protection_asserts() {
        let epoch = LightEpoch::new();
        let _outer = EpochGuard::enter(&epoch).unwrap();
        let _inner = EpochGuard::enter(&epoch).unwrap();
    }
}
