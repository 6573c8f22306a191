//! Fixed worker pool for device I/O jobs.
//!
//! The device spawns every I/O job onto a dedicated runtime with a fixed
//! number of worker threads, so concurrency under load is bounded by the
//! worker count and the handle pools rather than by ad-hoc task spawning.

use std::future::Future;
use std::io;

use parking_lot::Mutex;
use tokio::runtime::Runtime;

pub(crate) struct IoTaskPool {
    runtime: Mutex<Option<Runtime>>,
}

impl IoTaskPool {
    pub(crate) fn new(worker_threads: usize) -> io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name("tidekv-io")
            .enable_all()
            .build()?;
        Ok(Self {
            runtime: Mutex::new(Some(runtime)),
        })
    }

    /// Spawn an I/O job. Jobs submitted after shutdown are dropped.
    pub(crate) fn spawn<F>(&self, job: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let runtime = self.runtime.lock();
        match runtime.as_ref() {
            Some(rt) => {
                rt.spawn(job);
                true
            }
            None => {
                tracing::warn!("I/O job submitted after task pool shutdown");
                false
            }
        }
    }

    /// Stop accepting jobs and release the workers.
    ///
    /// Uses a background shutdown so it is safe to call from async contexts.
    pub(crate) fn shutdown(&self) {
        if let Some(rt) = self.runtime.lock().take() {
            rt.shutdown_background();
        }
    }
}

impl Drop for IoTaskPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_spawn_runs_job() {
        let pool = IoTaskPool::new(1).unwrap();
        let counter = Arc::new(AtomicU32::new(0));

        let c = Arc::clone(&counter);
        assert!(pool.spawn(async move {
            c.fetch_add(1, Ordering::AcqRel);
        }));

        while counter.load(Ordering::Acquire) == 0 {
            std::thread::yield_now();
        }
    }

    #[test]
    fn test_spawn_after_shutdown() {
        let pool = IoTaskPool::new(1).unwrap();
        pool.shutdown();
        assert!(!pool.spawn(async {}));
    }
}
