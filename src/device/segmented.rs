//! Segmented direct-I/O storage device.
//!
//! A large append-only log is multiplexed across numbered segment files
//! `<base>.<segment_id>`. Each segment gets a pair of bounded handle pools
//! (one per direction); positioned reads and writes are issued
//! asynchronously on a fixed worker pool and complete through an
//! exactly-once callback.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer_pool::SectorBufferPool;
use crate::constants::SECTOR_SIZE;
use crate::device::handle_pool::{HandlePool, PooledHandle, DEFAULT_HANDLE_CAPACITY};
use crate::device::positioned_io;
use crate::device::task_pool::IoTaskPool;
use crate::status::Status;
use crate::utility::pad_alignment;

/// Error code reported through the callback for non-I/O failures.
///
/// OS-level I/O failures report the low 16 bits of the OS error instead,
/// and success reports `0`.
pub const GENERIC_ERROR_CODE: u32 = u32::MAX;

/// Map an I/O error to its callback error code.
fn os_error_code(err: &io::Error) -> u32 {
    err.raw_os_error()
        .map(|code| (code as u32) & 0xFFFF)
        .unwrap_or(GENERIC_ERROR_CODE)
}

/// Options for a [`SegmentedDevice`].
#[derive(Clone, Debug)]
pub struct SegmentedDeviceOptions {
    /// Fixed segment size in bytes, or `None` for unbounded segments.
    pub segment_size: Option<u64>,
    /// Per-segment, per-direction throttle limit on open handles.
    pub handle_capacity: usize,
    /// Delete segment files on `reset`/`dispose`.
    pub delete_on_close: bool,
    /// Keep OS buffering instead of enabling direct I/O on handles.
    pub os_read_buffering: bool,
    /// Resize newly opened write handles to the fixed segment size.
    pub preallocate_file: bool,
    /// Enumerate existing segments on startup.
    pub recover_device: bool,
    /// Worker threads serving async I/O jobs.
    pub io_workers: usize,
}

impl Default for SegmentedDeviceOptions {
    fn default() -> Self {
        Self {
            segment_size: None,
            handle_capacity: DEFAULT_HANDLE_CAPACITY,
            delete_on_close: false,
            os_read_buffering: true,
            preallocate_file: false,
            recover_device: true,
            io_workers: 4,
        }
    }
}

/// Read/write handle pools for one segment.
struct SegmentPools {
    read: Arc<HandlePool>,
    write: Arc<HandlePool>,
}

impl SegmentPools {
    fn dispose(&self) {
        self.read.dispose();
        self.write.dispose();
    }
}

struct TableState {
    map: HashMap<u64, Arc<SegmentPools>>,
    disposed: bool,
}

/// Mapping `segment_id` to its pool pair.
///
/// Insertion is atomically rejected after dispose, so teardown never races
/// construction.
struct SegmentTable {
    inner: Mutex<TableState>,
}

impl SegmentTable {
    fn new() -> Self {
        Self {
            inner: Mutex::new(TableState {
                map: HashMap::new(),
                disposed: false,
            }),
        }
    }

    fn get_or_add(
        &self,
        segment: u64,
        build: impl FnOnce() -> Arc<SegmentPools>,
    ) -> Result<Arc<SegmentPools>, Status> {
        let mut state = self.inner.lock();
        if state.disposed {
            return Err(Status::Aborted);
        }
        Ok(Arc::clone(state.map.entry(segment).or_insert_with(build)))
    }

    fn lookup(&self, segment: u64) -> Option<Arc<SegmentPools>> {
        self.inner.lock().map.get(&segment).cloned()
    }

    fn remove(&self, segment: u64) -> Option<Arc<SegmentPools>> {
        self.inner.lock().map.remove(&segment)
    }

    fn drain(&self) -> Vec<(u64, Arc<SegmentPools>)> {
        self.inner.lock().map.drain().collect()
    }

    fn dispose(&self) -> Vec<(u64, Arc<SegmentPools>)> {
        let mut state = self.inner.lock();
        state.disposed = true;
        state.map.drain().collect()
    }
}

/// Raw destination pointer shipped to an I/O worker.
///
/// The caller contract is that the pointed-to buffer stays valid and
/// unaliased until the completion callback runs.
struct SendMutPtr(*mut u8);
// Safety: the device never dereferences the pointer outside the single I/O
// job that owns it, per the caller contract above.
unsafe impl Send for SendMutPtr {}

/// Raw source pointer shipped to an I/O worker. Same contract as
/// [`SendMutPtr`].
struct SendConstPtr(*const u8);
// Safety: see SendMutPtr.
unsafe impl Send for SendConstPtr {}

/// Log-structured storage device over numbered segment files.
pub struct SegmentedDevice {
    base_path: PathBuf,
    options: SegmentedDeviceOptions,
    sector_size: usize,
    table: SegmentTable,
    in_flight: AtomicU64,
    start_segment: AtomicU64,
    end_segment: AtomicU64,
    buffers: SectorBufferPool,
    workers: IoTaskPool,
    disposed: AtomicBool,
}

impl SegmentedDevice {
    /// Open a device rooted at `base_path`; segments live at
    /// `<base_path>.<segment_id>`.
    ///
    /// The base name's directory is created if absent. With
    /// `recover_device`, existing segments are enumerated to compute the
    /// segment bounds.
    pub fn create(
        base_path: impl AsRef<Path>,
        options: SegmentedDeviceOptions,
    ) -> io::Result<Arc<Self>> {
        let base_path = base_path.as_ref().to_path_buf();
        if let Some(dir) = base_path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }

        let workers = IoTaskPool::new(options.io_workers)?;
        let device = Arc::new(Self {
            base_path,
            sector_size: SECTOR_SIZE,
            table: SegmentTable::new(),
            in_flight: AtomicU64::new(0),
            start_segment: AtomicU64::new(0),
            end_segment: AtomicU64::new(0),
            buffers: SectorBufferPool::new(SECTOR_SIZE),
            workers,
            disposed: AtomicBool::new(false),
            options,
        });

        if device.options.recover_device {
            device.recover()?;
        }
        Ok(device)
    }

    /// Sector size governing direct-I/O alignment.
    pub fn sector_size(&self) -> usize {
        self.sector_size
    }

    /// Fixed segment size, when one is configured.
    pub fn segment_size(&self) -> Option<u64> {
        self.options.segment_size
    }

    /// First segment of the trailing contiguous run found at startup.
    pub fn start_segment(&self) -> u64 {
        self.start_segment.load(Ordering::Acquire)
    }

    /// Highest segment id found at startup.
    pub fn end_segment(&self) -> u64 {
        self.end_segment.load(Ordering::Acquire)
    }

    /// Number of I/O operations issued but not yet completed.
    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Acquire)
    }

    /// The handle pools are the only throttle; the device itself never
    /// pushes back.
    pub fn throttle(&self) -> bool {
        false
    }

    /// Path of a segment file.
    pub fn segment_path(&self, segment: u64) -> PathBuf {
        PathBuf::from(format!("{}.{}", self.base_path.display(), segment))
    }

    /// Enumerate `<base>.<id>` files and compute the segment bounds.
    ///
    /// `end_segment` is the maximum observed id; `start_segment` is the
    /// first id of the trailing contiguous run (a gap resets it to the next
    /// segment's id).
    fn recover(&self) -> io::Result<()> {
        let dir = match self.base_path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let base_name = self
            .base_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let prefix = format!("{base_name}.");

        let mut segments: Vec<u64> = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(suffix) = name.strip_prefix(&prefix) {
                if let Ok(id) = suffix.parse::<u64>() {
                    segments.push(id);
                }
            }
        }
        segments.sort_unstable();

        if let (Some(&first), Some(&last)) = (segments.first(), segments.last()) {
            let mut start = first;
            for pair in segments.windows(2) {
                if pair[1] != pair[0] + 1 {
                    start = pair[1];
                }
            }
            self.start_segment.store(start, Ordering::Release);
            self.end_segment.store(last, Ordering::Release);

            if tracing::enabled!(tracing::Level::INFO) {
                tracing::info!(
                    segments = segments.len(),
                    start_segment = start,
                    end_segment = last,
                    "device recovery complete"
                );
            }
        }
        Ok(())
    }

    fn build_pools(&self, segment: u64) -> Arc<SegmentPools> {
        let capacity = self.options.handle_capacity;
        let direct = !self.options.os_read_buffering;

        let read_path = self.segment_path(segment);
        let read = HandlePool::new(capacity, move || {
            let file = open_segment_file(&read_path)?;
            if direct {
                positioned_io::enable_direct(&file);
            }
            Ok(file)
        });

        let write_path = self.segment_path(segment);
        let preallocate = if self.options.preallocate_file {
            self.options.segment_size
        } else {
            None
        };
        let write = HandlePool::new(capacity, move || {
            let file = open_segment_file(&write_path)?;
            if direct {
                positioned_io::enable_direct(&file);
            }
            if let Some(size) = preallocate {
                if file.metadata()?.len() < size {
                    file.set_len(size)?;
                }
            }
            Ok(file)
        });

        Arc::new(SegmentPools { read, write })
    }

    fn segment_pools(&self, segment: u64) -> Result<Arc<SegmentPools>, Status> {
        self.table.get_or_add(segment, || self.build_pools(segment))
    }

    /// Issue an asynchronous positioned read.
    ///
    /// Reads `length` bytes at `source` within `segment` into the buffer at
    /// `dest`. The callback is invoked exactly once with
    /// `(error_code, bytes_transferred, ctx)` from a worker context.
    ///
    /// # Safety contract
    ///
    /// `dest` must stay valid and unaliased for `length` bytes until the
    /// callback runs.
    pub fn read_async<C, F>(
        self: &Arc<Self>,
        segment: u64,
        source: u64,
        dest: *mut u8,
        length: u32,
        callback: F,
        ctx: C,
    ) where
        C: Send + 'static,
        F: FnOnce(u32, u32, C) + Send + 'static,
    {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let pools = match self.segment_pools(segment) {
            Ok(pools) => pools,
            Err(_) => {
                self.complete(Err(device_disposed_error()), callback, ctx);
                return;
            }
        };

        let pool = Arc::clone(&pools.read);
        let device = Arc::clone(self);
        let dest = SendMutPtr(dest);
        let claimed = pool.try_get();
        self.workers.spawn(async move {
            let result = match claimed {
                Some(handle) => device.do_read(handle, source, dest, length),
                None => match pool.get().await {
                    Ok(handle) => device.do_read(handle, source, dest, length),
                    Err(err) => Err(err),
                },
            };
            device.complete(result, callback, ctx);
        });
    }

    /// Issue an asynchronous positioned write.
    ///
    /// Writes `length` bytes from `source` to `dest_offset` within
    /// `segment`, flushing the handle after the write so durability on
    /// callback matches the log's invariants. Same callback contract as
    /// [`SegmentedDevice::read_async`].
    ///
    /// # Safety contract
    ///
    /// `source` must stay valid for `length` bytes until the callback runs.
    pub fn write_async<C, F>(
        self: &Arc<Self>,
        source: *const u8,
        segment: u64,
        dest_offset: u64,
        length: u32,
        callback: F,
        ctx: C,
    ) where
        C: Send + 'static,
        F: FnOnce(u32, u32, C) + Send + 'static,
    {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let pools = match self.segment_pools(segment) {
            Ok(pools) => pools,
            Err(_) => {
                self.complete(Err(device_disposed_error()), callback, ctx);
                return;
            }
        };

        let pool = Arc::clone(&pools.write);
        let device = Arc::clone(self);
        let source = SendConstPtr(source);
        let claimed = pool.try_get();
        self.workers.spawn(async move {
            let result = match claimed {
                Some(handle) => device.do_write(handle, source, dest_offset, length),
                None => match pool.get().await {
                    Ok(handle) => device.do_write(handle, source, dest_offset, length),
                    Err(err) => Err(err),
                },
            };
            device.complete(result, callback, ctx);
        });
    }

    fn do_read(
        &self,
        handle: PooledHandle,
        offset: u64,
        dest: SendMutPtr,
        length: u32,
    ) -> io::Result<usize> {
        let len = length as usize;
        if len == 0 {
            return Ok(0);
        }
        // SAFETY: caller contract of read_async.
        let buf = unsafe { std::slice::from_raw_parts_mut(dest.0, len) };

        let direct = !self.options.os_read_buffering;
        let misaligned =
            (dest.0 as usize) % self.sector_size != 0 || len % self.sector_size != 0;
        if direct && misaligned && offset % self.sector_size as u64 == 0 {
            // Stage through a sector-aligned buffer, rounding the transfer
            // up to a sector multiple.
            let staged_len = pad_alignment(len, self.sector_size);
            let mut staged = self
                .buffers
                .get(staged_len)
                .ok_or_else(|| io::Error::new(io::ErrorKind::OutOfMemory, "staging buffer"))?;
            let n = positioned_io::pread(handle.file(), &mut staged.as_mut_slice()[..staged_len], offset)?;
            let n = n.min(len);
            buf[..n].copy_from_slice(&staged.as_slice()[..n]);
            Ok(n)
        } else {
            positioned_io::pread(handle.file(), buf, offset)
        }
        // `handle` drops here, returning to its pool on success and failure
        // alike.
    }

    fn do_write(
        &self,
        handle: PooledHandle,
        source: SendConstPtr,
        offset: u64,
        length: u32,
    ) -> io::Result<usize> {
        let len = length as usize;
        if len == 0 {
            return Ok(0);
        }
        // SAFETY: caller contract of write_async.
        let data = unsafe { std::slice::from_raw_parts(source.0, len) };
        let written = positioned_io::pwrite(handle.file(), data, offset)?;
        handle.file().sync_data()?;
        Ok(written)
    }

    fn complete<C, F>(&self, result: io::Result<usize>, callback: F, ctx: C)
    where
        C: Send + 'static,
        F: FnOnce(u32, u32, C) + Send + 'static,
    {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        match result {
            Ok(n) => callback(0, n as u32, ctx),
            Err(err) => callback(os_error_code(&err), 0, ctx),
        }
    }

    /// Size of a segment in bytes.
    ///
    /// Returns the fixed segment size when one is configured; otherwise
    /// borrows an idle read handle (or queries file metadata) for the live
    /// length. Never leaks a handle.
    pub fn get_file_size(&self, segment: u64) -> io::Result<u64> {
        if let Some(size) = self.options.segment_size {
            return Ok(size);
        }
        if let Some(pools) = self.table.lookup(segment) {
            if let Some(handle) = pools.read.try_get() {
                return handle.file().metadata().map(|m| m.len());
            }
        }
        match fs::metadata(self.segment_path(segment)) {
            Ok(meta) => Ok(meta.len()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(err) => Err(err),
        }
    }

    /// Remove a segment: dispose its pools and delete the backing file.
    pub fn remove_segment(&self, segment: u64) -> io::Result<()> {
        if let Some(pools) = self.table.remove(segment) {
            pools.dispose();
        }
        match fs::remove_file(self.segment_path(segment)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// [`SegmentedDevice::remove_segment`] with a post-completion callback.
    ///
    /// Removal runs synchronously; the callback then fires once with the
    /// usual error-code convention.
    pub fn remove_segment_async<C, F>(&self, segment: u64, callback: F, ctx: C)
    where
        C: Send + 'static,
        F: FnOnce(u32, u32, C) + Send + 'static,
    {
        match self.remove_segment(segment) {
            Ok(()) => callback(0, 0, ctx),
            Err(err) => callback(os_error_code(&err), 0, ctx),
        }
    }

    /// Drop every segment's pools; delete the files when `delete_on_close`
    /// is set. The device stays usable afterwards.
    pub fn reset(&self) -> io::Result<()> {
        for (segment, pools) in self.table.drain() {
            pools.dispose();
            if self.options.delete_on_close {
                match fs::remove_file(self.segment_path(segment)) {
                    Ok(()) => {}
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(())
    }

    /// Tear the device down.
    ///
    /// Waits for in-flight I/O to drain, disposes every pool (rejecting new
    /// segment insertions), deletes files when `delete_on_close` is set, and
    /// releases the worker pool. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        while self.in_flight.load(Ordering::Acquire) != 0 {
            std::thread::yield_now();
        }
        for (segment, pools) in self.table.dispose() {
            pools.dispose();
            if self.options.delete_on_close {
                let _ = fs::remove_file(self.segment_path(segment));
            }
        }
        self.workers.shutdown();
    }
}

impl Drop for SegmentedDevice {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn open_segment_file(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

fn device_disposed_error() -> io::Error {
    io::Error::other("segment table disposed")
}
