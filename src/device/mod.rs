//! Storage device layer
//!
//! The device maps a large append-only log onto numbered segment files and
//! serves concurrent asynchronous positioned I/O against pooled file
//! handles. On Linux the handles run unbuffered (direct I/O), which makes
//! sector alignment of addresses, lengths, and offsets the caller's
//! responsibility.

mod handle_pool;
pub mod positioned_io;
mod segmented;
mod task_pool;

pub use handle_pool::{HandlePool, PooledHandle, DEFAULT_HANDLE_CAPACITY};
pub use segmented::{
    GENERIC_ERROR_CODE, SegmentedDevice, SegmentedDeviceOptions,
};
