//! Record metadata for the store's log
//!
//! Each record carries an 8-byte header packing its logical address and the
//! lifecycle flags the session core inspects and mutates: validity, seal,
//! tombstone, and the dirty/modified pair set after every mutation.

use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};

/// Record header, internal to the store
///
/// The header is 8 bytes and contains:
/// - Logical address (48 bits): the record's position in the log
/// - Valid bit: cleared when the record is superseded or discarded
/// - Sealed bit: set during an in-place transition; concurrent readers skip
///   sealed records
/// - Tombstone bit: marks a logically deleted record awaiting reclamation
/// - Dirty bit: the record has unpersisted changes
/// - Modified bit: the record was mutated since the last commit point
#[repr(C)]
pub struct RecordInfo {
    control: AtomicU64,
}

impl RecordInfo {
    /// Mask for the logical address (48 bits)
    const ADDRESS_MASK: u64 = (1 << 48) - 1;

    /// Bit position for the valid flag
    const VALID_BIT: u64 = 1 << 59;
    /// Bit position for the sealed flag
    const SEALED_BIT: u64 = 1 << 60;
    /// Bit position for the tombstone flag
    const TOMBSTONE_BIT: u64 = 1 << 61;
    /// Bit position for the dirty flag
    const DIRTY_BIT: u64 = 1 << 62;
    /// Bit position for the modified flag
    const MODIFIED_BIT: u64 = 1 << 63;

    /// Create a new valid record header at the given logical address
    pub fn new(address: u64) -> Self {
        debug_assert!(address <= Self::ADDRESS_MASK);
        Self {
            control: AtomicU64::new((address & Self::ADDRESS_MASK) | Self::VALID_BIT),
        }
    }

    /// Create a record header from a raw control value
    pub fn from_control(control: u64) -> Self {
        Self {
            control: AtomicU64::new(control),
        }
    }

    /// Get the logical address
    #[inline]
    pub fn address(&self) -> u64 {
        self.control.load(Ordering::Acquire) & Self::ADDRESS_MASK
    }

    /// Check if the record is valid
    #[inline]
    pub fn is_valid(&self) -> bool {
        (self.control.load(Ordering::Acquire) & Self::VALID_BIT) != 0
    }

    /// Set or clear the valid flag
    #[inline]
    pub fn set_valid(&self, valid: bool) {
        if valid {
            self.control.fetch_or(Self::VALID_BIT, Ordering::AcqRel);
        } else {
            self.control.fetch_and(!Self::VALID_BIT, Ordering::AcqRel);
        }
    }

    /// Check if the record is sealed
    #[inline]
    pub fn is_sealed(&self) -> bool {
        (self.control.load(Ordering::Acquire) & Self::SEALED_BIT) != 0
    }

    /// Try to seal the record for an in-place transition.
    ///
    /// Fails if the record is already sealed or no longer valid.
    pub fn try_seal(&self) -> bool {
        let mut current = self.control.load(Ordering::Acquire);
        loop {
            if current & Self::SEALED_BIT != 0 || current & Self::VALID_BIT == 0 {
                return false;
            }
            match self.control.compare_exchange_weak(
                current,
                current | Self::SEALED_BIT,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Clear the sealed flag
    #[inline]
    pub fn unseal(&self) {
        self.control.fetch_and(!Self::SEALED_BIT, Ordering::AcqRel);
    }

    /// Check if this is a tombstone (delete marker)
    #[inline]
    pub fn is_tombstone(&self) -> bool {
        (self.control.load(Ordering::Acquire) & Self::TOMBSTONE_BIT) != 0
    }

    /// Set or clear the tombstone flag
    #[inline]
    pub fn set_tombstone(&self, tombstone: bool) {
        if tombstone {
            self.control.fetch_or(Self::TOMBSTONE_BIT, Ordering::AcqRel);
        } else {
            self.control.fetch_and(!Self::TOMBSTONE_BIT, Ordering::AcqRel);
        }
    }

    /// Check if the record has unpersisted changes
    #[inline]
    pub fn is_dirty(&self) -> bool {
        (self.control.load(Ordering::Acquire) & Self::DIRTY_BIT) != 0
    }

    /// Set or clear the dirty flag
    #[inline]
    pub fn set_dirty(&self, dirty: bool) {
        if dirty {
            self.control.fetch_or(Self::DIRTY_BIT, Ordering::AcqRel);
        } else {
            self.control.fetch_and(!Self::DIRTY_BIT, Ordering::AcqRel);
        }
    }

    /// Check if the record was mutated since the last commit point
    #[inline]
    pub fn is_modified(&self) -> bool {
        (self.control.load(Ordering::Acquire) & Self::MODIFIED_BIT) != 0
    }

    /// Set or clear the modified flag
    #[inline]
    pub fn set_modified(&self, modified: bool) {
        if modified {
            self.control.fetch_or(Self::MODIFIED_BIT, Ordering::AcqRel);
        } else {
            self.control.fetch_and(!Self::MODIFIED_BIT, Ordering::AcqRel);
        }
    }

    /// Set dirty and modified together (one atomic OR).
    ///
    /// Every successful mutation through the functions pipeline ends here.
    #[inline]
    pub fn mark_dirty_and_modified(&self) {
        self.control
            .fetch_or(Self::DIRTY_BIT | Self::MODIFIED_BIT, Ordering::AcqRel);
    }

    /// Get the raw control value
    #[inline]
    pub fn control(&self) -> u64 {
        self.control.load(Ordering::Acquire)
    }
}

impl Clone for RecordInfo {
    fn clone(&self) -> Self {
        Self {
            control: AtomicU64::new(self.control.load(Ordering::Acquire)),
        }
    }
}

impl Default for RecordInfo {
    fn default() -> Self {
        Self {
            control: AtomicU64::new(0),
        }
    }
}

impl std::fmt::Debug for RecordInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordInfo")
            .field("address", &self.address())
            .field("valid", &self.is_valid())
            .field("sealed", &self.is_sealed())
            .field("tombstone", &self.is_tombstone())
            .field("dirty", &self.is_dirty())
            .field("modified", &self.is_modified())
            .finish()
    }
}

// RecordInfo should be exactly 8 bytes
const _: () = assert!(mem::size_of::<RecordInfo>() == 8);
