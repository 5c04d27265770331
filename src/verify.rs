// SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Slot verification.
//!
//! [`slot_verify`] is the entry point the bootloader calls: it loads and
//! authenticates the top-level vbmeta image, expands chain descriptors into a
//! forest of verified vbmetas, eagerly checks hash descriptors against their
//! partitions, enforces rollback indices, and folds everything into a single
//! [`SlotVerifyData`] carrying the boot state, kernel cmdline, and the
//! rollback values to commit after a successful boot.
//!
//! The walk is synchronous and single-threaded. Ops calls happen in exact
//! traversal order (breadth-first over chain descriptors), so callers can
//! rely on deterministic telemetry.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt,
    io::Cursor,
};

use num_traits::ToPrimitive;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::{
    cmdline,
    crypto::DigestAlgorithm,
    format::avb::{
        self, AlgorithmType, ChainPartitionDescriptor, Descriptor, Footer, HashDescriptor,
        HashTreeDescriptor, Header, KernelCmdlineDescriptor,
    },
    ops::{IoError, KeyValidity, Ops},
    stream::{FromReader, ToWriter},
    util::NumBytes,
};

/// Maximum size of a vbmeta image. Reads are capped at this size, so any
/// valid image must fit within it.
pub const MAX_VBMETA_SIZE: usize = 64 * 1024;

/// Maximum depth of the chained-partition walk. Chains deeper than this are
/// treated as invalid metadata.
pub const MAX_CHAIN_DEPTH: usize = 32;

/// Number of rollback index locations tracked in the result.
pub const MAX_ROLLBACK_INDEX_LOCATIONS: usize = 32;

/// Downgrade verification failures: record them in the result and keep
/// walking instead of aborting. Used to enter a degraded boot state on
/// unlocked devices.
pub const FLAG_ALLOW_VERIFICATION_ERROR: u32 = 1 << 0;

/// There is no dedicated top-level vbmeta partition. Each requested partition
/// carries its own appended vbmeta image, located via the footer.
pub const FLAG_NO_VBMETA_PARTITION: u32 = 1 << 1;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SlotVerifyError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("Out of memory")]
    Oom,
    #[error("I/O error while accessing {0:?}")]
    Io(String),
    #[error("Invalid metadata in partition {partition:?}: {reason}")]
    InvalidMetadata { partition: String, reason: String },
    #[error("Partition {partition:?} requires unsupported vbmeta version {major}.{minor}")]
    UnsupportedVersion {
        partition: String,
        major: u32,
        minor: u32,
    },
    #[error("Verification failed for partition {partition:?}: {reason}")]
    Verification { partition: String, reason: String },
    #[error("Rollback index at location {location} is {stored}, but partition {partition:?} carries {value}")]
    RollbackIndex {
        partition: String,
        location: usize,
        stored: u64,
        value: u64,
    },
    #[error("Public key used to sign partition {partition:?} was rejected")]
    PublicKeyRejected { partition: String },
}

impl SlotVerifyError {
    /// Whether [`FLAG_ALLOW_VERIFICATION_ERROR`] may downgrade this error to
    /// a recorded failure. Out-of-memory and caller bugs are always fatal.
    fn is_downgradable(&self) -> bool {
        !matches!(self, Self::InvalidArgument(_) | Self::Oom)
    }
}

type Result<T> = std::result::Result<T, SlotVerifyError>;

/// The verified-boot state color communicated to the user and the kernel.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BootState {
    /// Fully verified with the device manufacturer's key.
    Green,
    /// Fully verified with a key enrolled by the device owner.
    Yellow,
    /// Device is unlocked; verification results are informational only.
    Orange,
    /// Verification failed or the image is unsigned on a locked device.
    Red,
    /// Verification failed because of I/O errors on a required read.
    RedEio,
}

/// Overall outcome of the verification walk.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VerificationStatus {
    /// Every vbmeta and hash descriptor checked out.
    FullyVerified,
    /// The top-level vbmeta declares no signature algorithm. The image was
    /// still parsed; device policy decides whether to boot.
    NotSigned,
    /// One or more failures were downgraded via
    /// [`FLAG_ALLOW_VERIFICATION_ERROR`] and recorded in the result.
    Degraded,
}

/// An authenticated vbmeta image, owned by the result.
#[derive(Clone, Eq, PartialEq)]
pub struct VbmetaImage {
    /// Partition base name without the slot suffix.
    pub partition_name: String,
    pub header: Header,
    /// The canonical serialized image, covered by the aggregate digest.
    pub data: Vec<u8>,
}

impl fmt::Debug for VbmetaImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VbmetaImage")
            .field("partition_name", &self.partition_name)
            .field("header", &self.header)
            .field("data", &NumBytes(self.data.len()))
            .finish()
    }
}

/// A partition that was read and verified against a hash descriptor.
#[derive(Clone, Eq, PartialEq)]
pub struct LoadedPartition {
    /// Partition base name without the slot suffix.
    pub partition_name: String,
    pub data: Vec<u8>,
}

impl fmt::Debug for LoadedPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedPartition")
            .field("partition_name", &self.partition_name)
            .field("data", &NumBytes(self.data.len()))
            .finish()
    }
}

/// The structured result of a verification walk.
#[derive(Clone, Debug)]
pub struct SlotVerifyData {
    pub ab_suffix: String,
    pub status: VerificationStatus,
    pub boot_state: BootState,
    /// Verified vbmeta images in traversal order.
    pub vbmeta_images: Vec<VbmetaImage>,
    /// Partitions verified against hash descriptors, in traversal order.
    pub loaded_partitions: Vec<LoadedPartition>,
    /// Values to commit via [`Ops::write_rollback_index`] after a successful
    /// boot. Index is the rollback index location.
    pub rollback_indexes: [u64; MAX_ROLLBACK_INDEX_LOCATIONS],
    pub cmdline: String,
    /// Failures downgraded by [`FLAG_ALLOW_VERIFICATION_ERROR`].
    pub errors: Vec<SlotVerifyError>,
}

/// A pending vbmeta image in the breadth-first walk.
struct ChainEntry {
    /// Base name without the slot suffix.
    partition_name: String,
    use_ab_suffix: bool,
    /// Pinned signing key from the parent's chain descriptor. `None` for
    /// top-level images, which are validated by the ops oracle instead.
    expected_public_key: Option<Vec<u8>>,
    /// Rollback index location pinned by the parent's chain descriptor.
    rollback_index_location: Option<usize>,
    depth: usize,
}

struct SlotVerifier<'a> {
    ops: &'a mut dyn Ops,
    ab_suffix: &'a str,
    allow_errors: bool,
    queue: VecDeque<ChainEntry>,
    seen_partitions: HashSet<String>,
    chain_locations: HashSet<usize>,
    verified_hash_partitions: HashMap<String, HashDescriptor>,
    vbmeta_images: Vec<VbmetaImage>,
    loaded_partitions: Vec<LoadedPartition>,
    rollback_indexes: [u64; MAX_ROLLBACK_INDEX_LOCATIONS],
    hashtree_descriptors: Vec<HashTreeDescriptor>,
    cmdline_descriptors: Vec<KernelCmdlineDescriptor>,
    errors: Vec<SlotVerifyError>,
    user_key_used: bool,
    not_signed: bool,
    hashtree_disabled: bool,
    verification_disabled: bool,
}

impl<'a> SlotVerifier<'a> {
    fn new(ops: &'a mut dyn Ops, ab_suffix: &'a str, allow_errors: bool) -> Self {
        Self {
            ops,
            ab_suffix,
            allow_errors,
            queue: VecDeque::new(),
            seen_partitions: HashSet::new(),
            chain_locations: HashSet::new(),
            verified_hash_partitions: HashMap::new(),
            vbmeta_images: vec![],
            loaded_partitions: vec![],
            rollback_indexes: [0; MAX_ROLLBACK_INDEX_LOCATIONS],
            hashtree_descriptors: vec![],
            cmdline_descriptors: vec![],
            errors: vec![],
            user_key_used: false,
            not_signed: false,
            hashtree_disabled: false,
            verification_disabled: false,
        }
    }

    fn map_io_error(error: IoError, partition: &str) -> SlotVerifyError {
        match error {
            IoError::Oom => SlotVerifyError::Oom,
            _ => SlotVerifyError::Io(partition.to_owned()),
        }
    }

    /// Record the error if the caller opted into degraded mode. Otherwise,
    /// fail the walk.
    fn record_or_fail(&mut self, error: SlotVerifyError) -> Result<()> {
        if self.allow_errors && error.is_downgradable() {
            warn!("Continuing in degraded mode after: {error}");
            self.errors.push(error);
            Ok(())
        } else {
            Err(error)
        }
    }

    fn suffixed_name(&self, base: &str, use_ab_suffix: bool) -> String {
        if use_ab_suffix {
            format!("{base}{}", self.ab_suffix)
        } else {
            base.to_owned()
        }
    }

    fn read_exact_from(&mut self, partition: &str, offset: i64, size: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; size];
        let n = self
            .ops
            .read_from_partition(partition, offset, &mut buf)
            .map_err(|e| Self::map_io_error(e, partition))?;

        if n != size {
            return Err(SlotVerifyError::Io(partition.to_owned()));
        }

        Ok(buf)
    }

    fn invalid_metadata(partition: &str, reason: impl fmt::Display) -> SlotVerifyError {
        SlotVerifyError::InvalidMetadata {
            partition: partition.to_owned(),
            reason: reason.to_string(),
        }
    }

    fn map_parse_error(partition: &str, error: avb::Error) -> SlotVerifyError {
        match error {
            avb::Error::UnsupportedVbmetaVersion { major, minor } => {
                SlotVerifyError::UnsupportedVersion {
                    partition: partition.to_owned(),
                    major,
                    minor,
                }
            }
            e => Self::invalid_metadata(partition, e),
        }
    }

    /// Load a vbmeta image from a partition. The image either sits at the
    /// start of a dedicated vbmeta partition or is appended to partition data
    /// and located by the footer at the end.
    fn load_vbmeta(&mut self, partition: &str) -> Result<(Header, Vec<u8>)> {
        let partition_size = self
            .ops
            .get_size_of_partition(partition)
            .map_err(|e| Self::map_io_error(e, partition))?;
        let read_size = partition_size.min(MAX_VBMETA_SIZE as u64) as usize;
        let buf = self.read_exact_from(partition, 0, read_size)?;

        let header = match Header::from_reader(Cursor::new(&buf)) {
            Ok(header) => header,
            Err(avb::Error::InvalidHeaderMagic(_)) => {
                trace!("{partition}: no vbmeta at offset 0; looking for a footer");

                if partition_size < Footer::SIZE as u64 {
                    return Err(Self::invalid_metadata(
                        partition,
                        "partition is too small to hold a vbmeta footer",
                    ));
                }

                let footer_buf =
                    self.read_exact_from(partition, -(Footer::SIZE as i64), Footer::SIZE)?;
                let footer = Footer::from_reader(Cursor::new(&footer_buf))
                    .map_err(|e| Self::invalid_metadata(partition, e))?;

                if footer.vbmeta_size > MAX_VBMETA_SIZE as u64
                    || footer
                        .vbmeta_offset
                        .checked_add(footer.vbmeta_size)
                        .is_none_or(|end| end > partition_size)
                {
                    return Err(Self::invalid_metadata(
                        partition,
                        "footer vbmeta region is out of bounds",
                    ));
                }

                let vbmeta_offset = footer
                    .vbmeta_offset
                    .to_i64()
                    .ok_or_else(|| Self::invalid_metadata(partition, "vbmeta offset overflow"))?;
                let vbmeta_buf =
                    self.read_exact_from(partition, vbmeta_offset, footer.vbmeta_size as usize)?;

                Header::from_reader(Cursor::new(&vbmeta_buf))
                    .map_err(|e| Self::map_parse_error(partition, e))?
            }
            Err(e) => return Err(Self::map_parse_error(partition, e)),
        };

        // Re-serialize to get the canonical image bytes without trailing
        // partition padding. Parsing guarantees the round trip is exact.
        let mut writer = Cursor::new(Vec::new());
        header
            .to_writer(&mut writer)
            .map_err(|e| Self::invalid_metadata(partition, e))?;

        Ok((header, writer.into_inner()))
    }

    /// Verify one vbmeta image and enqueue its chained children.
    fn verify_vbmeta(&mut self, entry: &ChainEntry) -> Result<()> {
        let name = self.suffixed_name(&entry.partition_name, entry.use_ab_suffix);

        // A diamond in the chain graph is fine as long as each partition is
        // only verified once.
        if !self.seen_partitions.insert(name.clone()) {
            return Ok(());
        }

        debug!("Verifying vbmeta from partition {name:?}");

        let (header, image_raw) = self.load_vbmeta(&name)?;
        let is_top_level = entry.expected_public_key.is_none();
        let mut key_location_override = None;

        // Trust anchor: the pinned key from the parent chain descriptor, or
        // the ops oracle for top-level images.
        match &entry.expected_public_key {
            Some(pinned) => {
                if header.algorithm_type == AlgorithmType::None {
                    return Err(SlotVerifyError::Verification {
                        partition: name,
                        reason: "chained vbmeta is not signed".to_owned(),
                    });
                }

                if &header.public_key != pinned {
                    return Err(SlotVerifyError::PublicKeyRejected { partition: name });
                }
            }
            None if header.algorithm_type == AlgorithmType::None => {
                debug!("{name}: vbmeta is unsigned; deferring policy to the caller");
                self.not_signed = true;
            }
            None => {
                let status = self
                    .ops
                    .validate_vbmeta_public_key(
                        &name,
                        &header.public_key,
                        &header.public_key_metadata,
                    )
                    .map_err(|e| Self::map_io_error(e, &name))?;

                match status.validity {
                    KeyValidity::Trusted => {}
                    KeyValidity::TrustedUserKey => self.user_key_used = true,
                    KeyValidity::Untrusted => {
                        return Err(SlotVerifyError::PublicKeyRejected { partition: name });
                    }
                }

                key_location_override = status.rollback_index_location;
            }
        }

        // Signature over header ∥ aux block.
        if header.algorithm_type != AlgorithmType::None {
            match header.verify() {
                Ok(_) => trace!("{name}: vbmeta signature is valid"),
                Err(e @ avb::Error::UnsupportedAlgorithm(_)) => {
                    return Err(Self::invalid_metadata(&name, e));
                }
                Err(e) => {
                    return Err(SlotVerifyError::Verification {
                        partition: name,
                        reason: e.to_string(),
                    });
                }
            }
        }

        // Rollback index gate. The stored value may never exceed the image's.
        let location = entry
            .rollback_index_location
            .or(key_location_override)
            .unwrap_or(header.rollback_index_location as usize);

        if location >= MAX_ROLLBACK_INDEX_LOCATIONS {
            return Err(Self::invalid_metadata(
                &name,
                format!("rollback index location {location} is out of range"),
            ));
        }

        let stored = self
            .ops
            .read_rollback_index(location)
            .map_err(|e| Self::map_io_error(e, &name))?;

        if stored > header.rollback_index {
            return Err(SlotVerifyError::RollbackIndex {
                partition: name,
                location,
                stored,
                value: header.rollback_index,
            });
        }

        self.rollback_indexes[location] =
            self.rollback_indexes[location].max(header.rollback_index);

        if is_top_level {
            if header.flags & Header::FLAG_HASHTREE_DISABLED != 0 {
                debug!("{name}: hashtree verification is disabled");
                self.hashtree_disabled = true;
            }
            if header.flags & Header::FLAG_VERIFICATION_DISABLED != 0 {
                debug!("{name}: verification is disabled");
                self.verification_disabled = true;
                self.hashtree_disabled = true;
            }
        }

        let descriptors = header.descriptors.clone();

        self.vbmeta_images.push(VbmetaImage {
            partition_name: entry.partition_name.clone(),
            header,
            data: image_raw,
        });

        // With verification disabled, only the top-level image itself is
        // consumed. Descriptors are not processed and nothing is chained.
        if self.verification_disabled {
            return Ok(());
        }

        for descriptor in &descriptors {
            match descriptor {
                Descriptor::ChainPartition(d) => {
                    self.process_chain_descriptor(d, entry.depth, &name)?;
                }
                Descriptor::Hash(d) => {
                    if let Err(e) = self.verify_hash_partition(d) {
                        self.record_or_fail(e)?;
                    }
                }
                Descriptor::HashTree(d) => {
                    trace!(
                        "{name}: collected hashtree descriptor for {:?}",
                        d.partition_name,
                    );
                    self.hashtree_descriptors.push(d.clone());
                }
                Descriptor::KernelCmdline(d) => {
                    self.cmdline_descriptors.push(d.clone());
                }
                Descriptor::Property(_) | Descriptor::Unknown(..) => {}
            }
        }

        Ok(())
    }

    fn process_chain_descriptor(
        &mut self,
        descriptor: &ChainPartitionDescriptor,
        depth: usize,
        parent: &str,
    ) -> Result<()> {
        if depth + 1 > MAX_CHAIN_DEPTH {
            return Err(Self::invalid_metadata(
                parent,
                format!("chain exceeds maximum depth {MAX_CHAIN_DEPTH}"),
            ));
        }

        let location = descriptor.rollback_index_location as usize;

        // Every chain descriptor in the walk must use its own location.
        if !self.chain_locations.insert(location) {
            return Err(Self::invalid_metadata(
                parent,
                format!("rollback index location {location} is used by multiple chains"),
            ));
        }

        trace!(
            "{parent}: chaining to {:?} at rollback location {location}",
            descriptor.partition_name,
        );

        self.queue.push_back(ChainEntry {
            partition_name: descriptor.partition_name.clone(),
            use_ab_suffix: descriptor.flags & ChainPartitionDescriptor::FLAG_DO_NOT_USE_AB == 0,
            expected_public_key: Some(descriptor.public_key.clone()),
            rollback_index_location: Some(location),
            depth: depth + 1,
        });

        Ok(())
    }

    /// Eagerly verify a hash descriptor by reading and digesting the named
    /// partition.
    fn verify_hash_partition(&mut self, descriptor: &HashDescriptor) -> Result<()> {
        let name = self.suffixed_name(
            &descriptor.partition_name,
            descriptor.flags & HashDescriptor::FLAG_DO_NOT_USE_AB == 0,
        );

        // The same partition may be covered by multiple vbmetas, but only
        // with identical descriptors.
        if let Some(previous) = self.verified_hash_partitions.get(&name) {
            if previous != descriptor {
                return Err(Self::invalid_metadata(
                    &name,
                    "hash descriptor does not match previous encounter",
                ));
            }

            return Ok(());
        }

        let image_size = descriptor
            .image_size
            .to_usize()
            .ok_or_else(|| Self::invalid_metadata(&name, "image size exceeds address space"))?;

        let data = match self
            .ops
            .get_preloaded_partition(&name)
            .map_err(|e| Self::map_io_error(e, &name))?
        {
            Some(preloaded) => {
                trace!("{name}: using preloaded partition data");

                if preloaded.len() < image_size {
                    return Err(SlotVerifyError::Io(name));
                }

                preloaded[..image_size].to_vec()
            }
            None => self.read_exact_from(&name, 0, image_size)?,
        };

        match descriptor.verify(&data) {
            Ok(()) => debug!("{name}: partition digest is valid"),
            Err(e @ avb::Error::UnsupportedHashAlgorithm(_)) => {
                return Err(Self::invalid_metadata(&name, e));
            }
            Err(e) => {
                return Err(SlotVerifyError::Verification {
                    partition: name,
                    reason: e.to_string(),
                });
            }
        }

        self.verified_hash_partitions
            .insert(name, descriptor.clone());
        self.loaded_partitions.push(LoadedPartition {
            partition_name: descriptor.partition_name.clone(),
            data,
        });

        Ok(())
    }

    /// Fold the walk outcome into the final result: boot state, aggregate
    /// digest, and kernel cmdline.
    fn finish(mut self) -> Result<SlotVerifyData> {
        let unlocked = self
            .ops
            .read_is_device_unlocked()
            .map_err(|_| SlotVerifyError::Io("device state".to_owned()))?;

        // The aggregate digest covers every verified vbmeta image in
        // traversal order, hashed with the top-level image's algorithm.
        let algorithm = self
            .vbmeta_images
            .first()
            .and_then(|i| i.header.algorithm_type.digest_algorithm())
            .unwrap_or(DigestAlgorithm::Sha256);

        let mut context = algorithm.context();
        let mut total_size = 0u64;
        for image in &self.vbmeta_images {
            context.update(&image.data);
            total_size += image.data.len() as u64;
        }
        let digest = context.finish();

        let mut cmdline_parts = vec![
            cmdline::vbmeta_params(unlocked, algorithm, total_size, digest.as_ref()),
            format!(
                "androidboot.veritymode={}",
                if self.hashtree_disabled {
                    "disabled"
                } else {
                    "enforcing"
                },
            ),
        ];

        if !self.hashtree_disabled {
            for descriptor in &self.hashtree_descriptors {
                let fragment =
                    cmdline::hashtree_cmdline(self.ops, descriptor, self.ab_suffix)
                        .map_err(|e| Self::map_io_error(e, &descriptor.partition_name))?;
                cmdline_parts.push(fragment);
            }
        }

        for descriptor in &self.cmdline_descriptors {
            if cmdline::cmdline_descriptor_applies(descriptor, self.hashtree_disabled) {
                let fragment =
                    cmdline::substitute_partuuids(self.ops, &descriptor.cmdline, self.ab_suffix)
                        .map_err(|e| Self::map_io_error(e, "cmdline"))?;
                cmdline_parts.push(fragment);
            }
        }

        let status = if !self.errors.is_empty() {
            VerificationStatus::Degraded
        } else if self.not_signed {
            VerificationStatus::NotSigned
        } else {
            VerificationStatus::FullyVerified
        };

        let any_io_error = self
            .errors
            .iter()
            .any(|e| matches!(e, SlotVerifyError::Io(_)));

        let boot_state = if any_io_error {
            BootState::RedEio
        } else if unlocked {
            BootState::Orange
        } else if !self.errors.is_empty() {
            BootState::Red
        } else if self.not_signed || self.verification_disabled {
            BootState::Red
        } else if self.user_key_used {
            BootState::Yellow
        } else {
            BootState::Green
        };

        debug!(
            "Verification finished: status {status:?}, boot state {boot_state:?}, \
             {} vbmeta image(s), {} loaded partition(s)",
            self.vbmeta_images.len(),
            self.loaded_partitions.len(),
        );

        Ok(SlotVerifyData {
            ab_suffix: self.ab_suffix.to_owned(),
            status,
            boot_state,
            vbmeta_images: self.vbmeta_images,
            loaded_partitions: self.loaded_partitions,
            rollback_indexes: self.rollback_indexes,
            cmdline: cmdline_parts.join(" "),
            errors: self.errors,
        })
    }
}

/// Verify the vbmeta forest for a boot slot.
///
/// `requested_partitions` names the partitions the caller intends to boot
/// from. With [`FLAG_NO_VBMETA_PARTITION`] each one is treated as a root
/// carrying its own appended vbmeta; otherwise the walk starts at the
/// `vbmeta` partition. `ab_suffix` is appended to partition names unless a
/// descriptor opts out.
///
/// On success the caller must still consult [`SlotVerifyData::status`] and
/// [`SlotVerifyData::boot_state`]: an unsigned top-level image or a degraded
/// walk both return `Ok`.
pub fn slot_verify(
    ops: &mut dyn Ops,
    requested_partitions: &[&str],
    ab_suffix: &str,
    flags: u32,
) -> Result<SlotVerifyData> {
    if requested_partitions.is_empty() {
        return Err(SlotVerifyError::InvalidArgument(
            "requested_partitions must not be empty",
        ));
    }
    if !ab_suffix.is_empty() && !ab_suffix.starts_with('_') {
        return Err(SlotVerifyError::InvalidArgument(
            "ab_suffix must be empty or start with an underscore",
        ));
    }

    let allow_errors = flags & FLAG_ALLOW_VERIFICATION_ERROR != 0;
    let mut verifier = SlotVerifier::new(ops, ab_suffix, allow_errors);

    if flags & FLAG_NO_VBMETA_PARTITION != 0 {
        for partition in requested_partitions {
            verifier.queue.push_back(ChainEntry {
                partition_name: (*partition).to_owned(),
                use_ab_suffix: true,
                expected_public_key: None,
                rollback_index_location: None,
                depth: 0,
            });
        }
    } else {
        verifier.queue.push_back(ChainEntry {
            partition_name: "vbmeta".to_owned(),
            use_ab_suffix: true,
            expected_public_key: None,
            rollback_index_location: None,
            depth: 0,
        });
    }

    while let Some(entry) = verifier.queue.pop_front() {
        if let Err(e) = verifier.verify_vbmeta(&entry) {
            verifier.record_or_fail(e)?;
        }
    }

    verifier.finish()
}
