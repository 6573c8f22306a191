//! tidekv - embedded key-value store core
//!
//! The hard kernel of a FASTER-style store, in two subsystems:
//! - **Lockable sessions**: per-session façades coordinating two-phase
//!   manual locking over a bucket-keyed lock table, under epoch-based safe
//!   memory reclamation, routing point operations through a functions
//!   pipeline that maintains record metadata.
//! - **Segmented direct-I/O device**: a log-structured device multiplexing
//!   an append-only log across numbered segment files, with pooled handles,
//!   async positioned I/O, and exactly-once completion callbacks.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use tidekv::locking::{sort_lockable_keys, LockableKey};
//! use tidekv::store::{StoreCore, StoreOptions};
//!
//! let store = StoreCore::<u64, u64>::in_memory(StoreOptions::default());
//! let mut session = store.lockable_session();
//!
//! session.begin_lockable();
//! let mut keys = vec![LockableKey::exclusive(store.lock_code_for(&1)?)];
//! sort_lockable_keys(&mut keys);
//! session.lock(&keys);
//! session.upsert_value(&1, &100);
//! session.unlock(&keys);
//! session.end_lockable();
//! ```

#![warn(missing_docs)]
#![allow(dead_code)]

pub mod buffer_pool;
pub mod codec;
pub mod config;
pub mod device;
pub mod epoch;
pub mod locking;
pub mod record;
pub mod status;
pub mod store;
pub mod utility;

// Re-exports for convenience
pub use record::RecordInfo;
pub use status::{OperationStatus, Status};

/// Constants used throughout the library
pub mod constants {
    /// Size of a cache line in bytes
    pub const CACHE_LINE_BYTES: usize = 64;

    /// Maximum number of threads supported by epoch protection
    pub const MAX_THREADS: usize = 96;

    /// Sector size assumed for direct I/O
    pub const SECTOR_SIZE: usize = 512;
}

/// Utility for size literals (e.g., 1_GiB)
pub mod size {
    /// 1 KiB in bytes
    pub const KIB: u64 = 1024;
    /// 1 MiB in bytes
    pub const MIB: u64 = 1024 * KIB;
    /// 1 GiB in bytes
    pub const GIB: u64 = 1024 * MIB;
}

/// Prelude module for common imports
pub mod prelude {
    pub use crate::device::{SegmentedDevice, SegmentedDeviceOptions};
    pub use crate::locking::{sort_lockable_keys, LockType, LockableKey};
    pub use crate::record::RecordInfo;
    pub use crate::status::{OperationStatus, Status};
    pub use crate::store::{
        BasicFunctions, CancellationToken, LockableSession, SessionFunctions, StoreCore,
        StoreOptions,
    };
}
