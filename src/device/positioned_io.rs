//! Positioned file I/O primitives.
//!
//! Positioned reads and writes address an absolute byte offset without
//! moving the file's seek pointer, so many concurrent operations can share
//! one handle without seek races. Short transfers are returned as-is and
//! never retried here.

use std::fs::File;
use std::io;

/// Read into `buf` at the absolute `offset`.
///
/// Returns the number of bytes read; short reads are possible.
#[cfg(unix)]
pub fn pread(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

/// Write `data` at the absolute `offset`.
///
/// Returns the number of bytes written; short writes are possible.
#[cfg(unix)]
pub fn pwrite(file: &File, data: &[u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.write_at(data, offset)
}

/// Read into `buf` at the absolute `offset`.
#[cfg(windows)]
pub fn pread(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}

/// Write `data` at the absolute `offset`.
#[cfg(windows)]
pub fn pwrite(file: &File, data: &[u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_write(data, offset)
}

/// Enable direct (unbuffered) I/O on an already-open file.
///
/// ORs `O_DIRECT` into the file status flags obtained via `fcntl(F_GETFL)`
/// and writes them back with `F_SETFL`. Callers are then responsible for
/// sector alignment of buffer addresses, lengths, and offsets.
///
/// Returns whether the operation succeeded.
#[cfg(target_os = "linux")]
pub fn enable_direct(file: &File) -> bool {
    use std::os::unix::io::AsRawFd;

    let fd = file.as_raw_fd();
    // SAFETY: fcntl on an owned, open descriptor.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return false;
        }
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_DIRECT) == 0
    }
}

/// No direct-I/O flag on this platform.
#[cfg(not(target_os = "linux"))]
pub fn enable_direct(_file: &File) -> bool {
    false
}
