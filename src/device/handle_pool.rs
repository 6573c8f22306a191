//! Bounded, awaitable pools of file handles.
//!
//! Each segment gets one pool per direction (read/write). A pool owns at
//! most `capacity` open handles at any instant; claimants beyond that
//! suspend in FIFO order until a handle is returned. Claims are returned by
//! dropping the [`PooledHandle`], so a handle goes back to its pool on every
//! exit path.

use std::collections::VecDeque;
use std::fs::File;
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

/// Default per-segment, per-direction throttle limit.
pub const DEFAULT_HANDLE_CAPACITY: usize = 120;

type HandleFactory = Box<dyn Fn() -> io::Result<File> + Send + Sync + 'static>;

struct PoolState {
    idle: Vec<File>,
    waiters: VecDeque<oneshot::Sender<PooledHandle>>,
    open_handles: usize,
    disposed: bool,
}

/// A file handle claimed from a [`HandlePool`].
///
/// Returns to the pool on drop; after the pool is disposed the handle is
/// closed instead of re-pooled.
pub struct PooledHandle {
    file: Option<File>,
    pool: Arc<HandlePool>,
}

impl PooledHandle {
    /// Access the underlying file.
    pub fn file(&self) -> &File {
        self.file.as_ref().expect("handle already returned")
    }
}

impl Drop for PooledHandle {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let pool = Arc::clone(&self.pool);
            HandlePool::release(&pool, file);
        }
    }
}

/// Bounded multiset of open file handles for one segment in one direction.
pub struct HandlePool {
    capacity: usize,
    factory: HandleFactory,
    state: Mutex<PoolState>,
}

impl HandlePool {
    /// Create a pool that opens handles with `factory`, holding at most
    /// `capacity` open handles at once.
    pub fn new<F>(capacity: usize, factory: F) -> Arc<Self>
    where
        F: Fn() -> io::Result<File> + Send + Sync + 'static,
    {
        Arc::new(Self {
            capacity: capacity.max(1),
            factory: Box::new(factory),
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                waiters: VecDeque::new(),
                open_handles: 0,
                disposed: false,
            }),
        })
    }

    /// The throttle limit.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of idle handles ready to claim.
    pub fn idle_count(&self) -> usize {
        self.state.lock().idle.len()
    }

    /// Number of handles currently open (idle + claimed).
    pub fn open_count(&self) -> usize {
        self.state.lock().open_handles
    }

    /// Non-blocking claim: returns an idle handle if one is available.
    ///
    /// Never opens a new handle.
    pub fn try_get(self: &Arc<Self>) -> Option<PooledHandle> {
        let mut state = self.state.lock();
        if state.disposed {
            return None;
        }
        state.idle.pop().map(|file| PooledHandle {
            file: Some(file),
            pool: Arc::clone(self),
        })
    }

    /// Awaitable claim.
    ///
    /// Returns an idle handle, opens a new one when below capacity, or
    /// suspends in FIFO order until a handle is returned. Dropping the
    /// returned future while waiting does not leak a handle: a handle sent
    /// to a cancelled waiter bounces back to the pool at hand-off.
    ///
    /// # Errors
    ///
    /// Fails when the pool has been disposed or the handle factory fails.
    pub async fn get(self: &Arc<Self>) -> io::Result<PooledHandle> {
        let waiter = {
            let mut state = self.state.lock();
            if state.disposed {
                return Err(disposed_error());
            }
            if let Some(file) = state.idle.pop() {
                return Ok(PooledHandle {
                    file: Some(file),
                    pool: Arc::clone(self),
                });
            }
            if state.open_handles < self.capacity {
                state.open_handles += 1;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                Some(rx)
            }
        };

        match waiter {
            None => {
                // Construct a fresh handle outside the lock.
                match (self.factory)() {
                    Ok(file) => Ok(PooledHandle {
                        file: Some(file),
                        pool: Arc::clone(self),
                    }),
                    Err(err) => {
                        self.state.lock().open_handles -= 1;
                        Err(err)
                    }
                }
            }
            Some(rx) => rx.await.map_err(|_| disposed_error()),
        }
    }

    /// Give a handle back; wakes the oldest waiter if any.
    fn release(self: &Arc<Self>, mut file: File) {
        let mut state = self.state.lock();
        if state.disposed {
            // Close rather than re-pool.
            state.open_handles -= 1;
            return;
        }
        loop {
            match state.waiters.pop_front() {
                Some(waiter) => {
                    let handle = PooledHandle {
                        file: Some(file),
                        pool: Arc::clone(self),
                    };
                    match waiter.send(handle) {
                        Ok(()) => return,
                        // Waiter cancelled before hand-off: reclaim and try the next.
                        Err(mut bounced) => {
                            file = bounced.file.take().expect("bounced handle present");
                        }
                    }
                }
                None => {
                    state.idle.push(file);
                    return;
                }
            }
        }
    }

    /// Close all idle handles and refuse new claims.
    ///
    /// In-flight users drain normally; their handles are closed on return.
    /// Pending waiters fail with a disposed error.
    pub fn dispose(&self) {
        let (idle, waiters) = {
            let mut state = self.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            let idle_count = state.idle.len();
            state.open_handles -= idle_count;
            (
                std::mem::take(&mut state.idle),
                std::mem::take(&mut state.waiters),
            )
        };
        // Dropping the senders wakes every waiter with an error;
        // dropping the idle handles closes them.
        drop(waiters);
        drop(idle);
    }

    /// Whether the pool has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }
}

fn disposed_error() -> io::Error {
    io::Error::other("handle pool disposed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_pool(dir: &std::path::Path, capacity: usize) -> Arc<HandlePool> {
        let path = dir.join("pool.dat");
        std::fs::write(&path, b"pool test").unwrap();
        HandlePool::new(capacity, move || {
            std::fs::OpenOptions::new().read(true).open(&path)
        })
    }

    #[test]
    fn test_try_get_empty_pool() {
        let dir = tempdir().unwrap();
        let pool = test_pool(dir.path(), 2);
        // try_get never constructs handles
        assert!(pool.try_get().is_none());
        assert_eq!(pool.open_count(), 0);
    }

    #[tokio::test]
    async fn test_get_constructs_below_capacity() {
        let dir = tempdir().unwrap();
        let pool = test_pool(dir.path(), 2);

        let a = pool.get().await.unwrap();
        let b = pool.get().await.unwrap();
        assert_eq!(pool.open_count(), 2);

        drop(a);
        assert_eq!(pool.idle_count(), 1);
        assert!(pool.try_get().is_some());
        drop(b);
    }

    #[tokio::test]
    async fn test_capacity_never_exceeded() {
        let dir = tempdir().unwrap();
        let pool = test_pool(dir.path(), 2);

        let a = pool.get().await.unwrap();
        let b = pool.get().await.unwrap();

        let pool2 = Arc::clone(&pool);
        let waiter = tokio::spawn(async move { pool2.get().await });

        tokio::task::yield_now().await;
        assert_eq!(pool.open_count(), 2);

        drop(a);
        let c = waiter.await.unwrap().unwrap();
        assert_eq!(pool.open_count(), 2);
        drop(b);
        drop(c);
    }

    #[tokio::test]
    async fn test_dispose_fails_waiters() {
        let dir = tempdir().unwrap();
        let pool = test_pool(dir.path(), 1);

        let held = pool.get().await.unwrap();

        let pool2 = Arc::clone(&pool);
        let waiter = tokio::spawn(async move { pool2.get().await });
        tokio::task::yield_now().await;

        pool.dispose();
        assert!(waiter.await.unwrap().is_err());

        // Returned handles close instead of re-pooling
        drop(held);
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.open_count(), 0);
        assert!(pool.get().await.is_err());
    }

    #[tokio::test]
    async fn test_cancelled_waiter_does_not_leak() {
        let dir = tempdir().unwrap();
        let pool = test_pool(dir.path(), 1);

        let held = pool.get().await.unwrap();

        let pool2 = Arc::clone(&pool);
        let waiter = tokio::spawn(async move { pool2.get().await });
        tokio::task::yield_now().await;
        waiter.abort();
        let _ = waiter.await;

        // The handle bounces back to the pool at hand-off.
        drop(held);
        assert_eq!(pool.open_count(), 1);
        assert!(pool.try_get().is_some() || pool.idle_count() == 1);
    }
}
