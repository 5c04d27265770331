// SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! The capability interface between the verification core and the platform.
//!
//! The core performs no I/O of its own. Every read of a partition, every
//! rollback index access, and every device-state query goes through an
//! [`Ops`] implementation supplied by the caller. The core holds no global
//! state, so two concurrent verifications with independent ops objects
//! cannot interfere.

use thiserror::Error;

/// Status of an individual ops call. [`IoError::Io`] is the only transient
/// class; callers may retry it. Everything else is a property of the request
/// or the device.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum IoError {
    #[error("I/O error")]
    Io,
    #[error("Out of memory")]
    Oom,
    #[error("No such partition")]
    NoSuchPartition,
    #[error("Range outside partition")]
    RangeOutsidePartition,
    #[error("Invalid value size")]
    InvalidValueSize,
    #[error("Operation not implemented")]
    NotImplemented,
}

pub type IoResult<T> = Result<T, IoError>;

/// How the root-of-trust oracle classified a public key.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KeyValidity {
    /// The key is the device manufacturer's key.
    Trusted,
    /// The key is trusted, but was enrolled by the device owner. Booting with
    /// it yields the YELLOW boot state instead of GREEN.
    TrustedUserKey,
    /// The key is not trusted for this device.
    Untrusted,
}

/// Response from [`Ops::validate_vbmeta_public_key`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PublicKeyStatus {
    pub validity: KeyValidity,
    /// Overrides the rollback index location declared in the vbmeta header
    /// when set. Key-hierarchy extensions use this to reserve locations for
    /// key version counters.
    pub rollback_index_location: Option<usize>,
}

impl PublicKeyStatus {
    pub fn trusted() -> Self {
        Self {
            validity: KeyValidity::Trusted,
            rollback_index_location: None,
        }
    }

    pub fn untrusted() -> Self {
        Self {
            validity: KeyValidity::Untrusted,
            rollback_index_location: None,
        }
    }
}

/// Platform callbacks used during verification.
///
/// Implementations are expected to serialize access to mutable state (the
/// rollback store and device flags) externally. Calls block until complete;
/// the core imposes no timeouts.
pub trait Ops {
    /// Read `buf.len()` bytes from the named partition starting at `offset`.
    /// A negative offset is relative to the end of the partition. Returns the
    /// number of bytes read, which is only allowed to be short when the read
    /// extends past the end of the partition.
    fn read_from_partition(&mut self, partition: &str, offset: i64, buf: &mut [u8])
        -> IoResult<usize>;

    /// Optional fast path returning an already-resident copy of the named
    /// partition. `Ok(None)` means the partition is not preloaded and must be
    /// read through [`Ops::read_from_partition`].
    fn get_preloaded_partition(&mut self, _partition: &str) -> IoResult<Option<&[u8]>> {
        Ok(None)
    }

    /// Write to a partition. Only update and unlock flows use this; the
    /// verification core itself never writes.
    fn write_to_partition(&mut self, _partition: &str, _offset: i64, _data: &[u8]) -> IoResult<()> {
        Err(IoError::NotImplemented)
    }

    /// The root-of-trust oracle. Called once for the top-level vbmeta; chained
    /// vbmetas are pinned by their parent's chain descriptor instead.
    fn validate_vbmeta_public_key(
        &mut self,
        partition: &str,
        public_key: &[u8],
        public_key_metadata: &[u8],
    ) -> IoResult<PublicKeyStatus>;

    /// Read the stored monotonic counter at the given location.
    fn read_rollback_index(&mut self, location: usize) -> IoResult<u64>;

    /// Write a monotonic counter. Callers commit the values from a successful
    /// verification after the boot proves healthy, never during verification.
    fn write_rollback_index(&mut self, location: usize, value: u64) -> IoResult<()>;

    /// Whether the device is unlocked. Drives the boot-state color.
    fn read_is_device_unlocked(&mut self) -> IoResult<bool>;

    /// Unique GUID for a partition, for `by-partuuid` kernel cmdline
    /// references.
    fn get_unique_guid_for_partition(&mut self, partition: &str) -> IoResult<String>;

    /// Total size of a partition in bytes.
    fn get_size_of_partition(&mut self, partition: &str) -> IoResult<u64>;
}
