//! Status codes and operation results for tidekv operations
//!
//! This module defines the status codes returned by sessions and the device,
//! plus the internal retry signalling the store loops on.

use std::fmt;

/// Status code returned by public operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Status {
    /// Operation completed successfully
    #[default]
    Ok = 0,
    /// Operation is pending (async continuation required)
    Pending = 1,
    /// Key was not found
    NotFound = 2,
    /// Out of memory
    OutOfMemory = 3,
    /// I/O error occurred
    IoError = 4,
    /// Data corruption detected
    Corruption = 5,
    /// Operation was aborted
    Aborted = 6,
    /// Operation was cancelled via a cancellation token
    Cancelled = 7,
    /// Invalid argument provided
    InvalidArgument = 8,
    /// Invalid operation in current session state (lock protocol violation)
    InvalidState = 9,
    /// Feature or operation not supported
    NotSupported = 10,
    /// Too many concurrent threads for epoch protection
    TooManyThreads = 11,
    /// Resource limit exceeded
    ResourceExhausted = 12,
}

impl Status {
    /// Check if the status indicates success
    #[inline]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }

    /// Check if the operation is pending
    #[inline]
    pub const fn is_pending(&self) -> bool {
        matches!(self, Status::Pending)
    }

    /// Check if the key was not found
    #[inline]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Status::NotFound)
    }

    /// Check if the status indicates an error
    #[inline]
    pub const fn is_error(&self) -> bool {
        !matches!(self, Status::Ok | Status::Pending | Status::NotFound)
    }

    /// Get the status as a string
    pub const fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "Ok",
            Status::Pending => "Pending",
            Status::NotFound => "NotFound",
            Status::OutOfMemory => "OutOfMemory",
            Status::IoError => "IoError",
            Status::Corruption => "Corruption",
            Status::Aborted => "Aborted",
            Status::Cancelled => "Cancelled",
            Status::InvalidArgument => "InvalidArgument",
            Status::InvalidState => "InvalidState",
            Status::NotSupported => "NotSupported",
            Status::TooManyThreads => "TooManyThreads",
            Status::ResourceExhausted => "ResourceExhausted",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Internal operation status used within the store and lock table
///
/// Retry signals are never surfaced to callers; the outer routines loop on
/// them until the operation resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum OperationStatus {
    /// Operation succeeded
    #[default]
    Success,
    /// Key not found
    NotFound,
    /// Should retry the operation immediately
    RetryNow,
    /// Should retry the operation after refreshing the epoch
    RetryLater,
    /// Operation was aborted
    Aborted,
}

impl OperationStatus {
    /// Check if the operation succeeded
    #[inline]
    pub const fn is_success(&self) -> bool {
        matches!(self, OperationStatus::Success)
    }

    /// Check if a retry is needed
    #[inline]
    pub const fn needs_retry(&self) -> bool {
        matches!(self, OperationStatus::RetryNow | OperationStatus::RetryLater)
    }

    /// Convert to external Status
    pub const fn to_status(&self) -> Status {
        match self {
            OperationStatus::Success => Status::Ok,
            OperationStatus::NotFound => Status::NotFound,
            OperationStatus::RetryNow | OperationStatus::RetryLater => Status::Pending,
            OperationStatus::Aborted => Status::Aborted,
        }
    }
}
