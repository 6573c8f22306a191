//! Store layer: record table, functions pipeline, lockable sessions.

mod adapter;
mod cancel;
mod functions;
mod lockable_session;
mod store_core;

pub use adapter::LockableFunctions;
pub use cancel::{with_cancellation, CancellationToken};
pub use functions::{BasicFunctions, CommitPoint, SessionFunctions};
pub use lockable_session::LockableSession;
pub use store_core::{StoreCore, StoreOptions};
