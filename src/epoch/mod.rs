//! Epoch-based memory reclamation
//!
//! Threads register as active while touching the log or lock table; every
//! session operation runs inside a scoped [`EpochGuard`].

mod light_epoch;

pub use light_epoch::{get_thread_id, EpochAction, EpochGuard, LightEpoch, UNPROTECTED};
