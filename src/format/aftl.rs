// SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Firmware transparency log (AFTL) support.
//!
//! An AFTL image is appended to a vbmeta image and carries one inclusion
//! proof per transparency log: the firmware-info leaf that was submitted to
//! the log, the Merkle path from that leaf to the log's root, and the log's
//! signed root descriptor. Verification is independent of the main slot
//! verification walk; a caller opts into transparency enforcement
//! separately.

use std::{
    fmt,
    io::{self, Cursor, Read, Write},
};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use num_traits::ToPrimitive;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::{
    crypto,
    stream::{CountingReader, FromReader, ReadFixedSizeExt, ReadStringExt, ToWriter},
    util::EscapedString,
};

pub const VERSION_MAJOR: u32 = 1;
pub const VERSION_MINOR: u32 = 1;

pub const HEADER_MAGIC: [u8; 4] = *b"AFTL";

/// All proof hashes are SHA-256.
pub const HASH_SIZE: usize = 32;

/// Log root signatures are Ed25519 (64 bytes) or RSA-4096 (512 bytes). Only
/// the former can be verified; the latter is tolerated by the codec.
pub const ED25519_SIGNATURE_SIZE: usize = 64;
pub const RSA4096_SIGNATURE_SIZE: usize = 512;

/// RFC 6962 domain-separation prefixes.
const LEAF_HASH_PREFIX: u8 = 0x00;
const NODE_HASH_PREFIX: u8 = 0x01;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to read {0:?} field: {1}")]
    ReadFieldError(&'static str, io::Error),
    #[error("Invalid AFTL header magic: {0:?}")]
    InvalidHeaderMagic([u8; 4]),
    #[error("Unsupported AFTL version: {major}.{minor}")]
    UnsupportedVersion { major: u32, minor: u32 },
    #[error("{0:?} field exceeds integer bounds")]
    IntegerTooLarge(&'static str),
    #[error("Declared image size ({expected}) does not match actual size ({actual})")]
    IncorrectImageSize { expected: u32, actual: u64 },
    #[error("Root hash size {0} is not a SHA-256 digest size")]
    InvalidRootHashSize(u8),
    #[error("Inclusion proof size {size} does not match hash count {count}")]
    IncorrectProofSize { count: u8, size: u32 },
    #[error("Log root descriptor does not fill its declared size")]
    IncorrectLogRootSize,
    #[error("Leaf index {leaf_index} is outside tree of size {tree_size}")]
    LeafIndexOutOfRange { leaf_index: u64, tree_size: u64 },
    #[error("Inclusion proof has wrong length for tree of size {tree_size}")]
    IncorrectProofLength { tree_size: u64 },
    #[error("Computed root {computed} does not match log root {stored}")]
    RootHashMismatch { computed: String, stored: String },
    #[error("Log root signature size {0} cannot be verified")]
    UnsupportedSignatureSize(usize),
    #[error("Failed to verify log root signature")]
    LogRootSignature(#[source] crypto::Error),
    #[error("Firmware info leaf does not commit to the vbmeta digest")]
    LeafCommitmentMismatch,
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// The signed portion of a Trillian log root. The signature covers the exact
/// big-endian serialization produced by [`TrillianLogRootDescriptor::to_writer`].
#[derive(Clone, Eq, PartialEq)]
pub struct TrillianLogRootDescriptor {
    pub version: u16,
    pub tree_size: u64,
    pub root_hash: Vec<u8>,
    pub timestamp: u64,
    pub metadata: Vec<u8>,
}

impl fmt::Debug for TrillianLogRootDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrillianLogRootDescriptor")
            .field("version", &self.version)
            .field("tree_size", &self.tree_size)
            .field("root_hash", &hex::encode(&self.root_hash))
            .field("timestamp", &self.timestamp)
            .field("metadata", &EscapedString::new(&self.metadata))
            .finish()
    }
}

impl TrillianLogRootDescriptor {
    /// Serialize the descriptor to the byte sequence the log signs.
    pub fn signed_data(&self) -> Result<Vec<u8>> {
        let mut writer = Cursor::new(Vec::new());
        self.to_writer(&mut writer)?;

        Ok(writer.into_inner())
    }
}

impl<R: Read> FromReader<R> for TrillianLogRootDescriptor {
    type Error = Error;

    fn from_reader(mut reader: R) -> Result<Self> {
        let version = reader.read_u16::<BigEndian>()?;
        let tree_size = reader.read_u64::<BigEndian>()?;

        let root_hash_size = reader.read_u8()?;
        if root_hash_size as usize != HASH_SIZE {
            return Err(Error::InvalidRootHashSize(root_hash_size));
        }
        let root_hash = reader.read_vec_exact(root_hash_size as usize)?;

        let timestamp = reader.read_u64::<BigEndian>()?;

        let metadata_size = reader.read_u16::<BigEndian>()?;
        let metadata = reader.read_vec_exact(metadata_size as usize)?;

        Ok(Self {
            version,
            tree_size,
            root_hash,
            timestamp,
            metadata,
        })
    }
}

impl<W: Write> ToWriter<W> for TrillianLogRootDescriptor {
    type Error = Error;

    fn to_writer(&self, mut writer: W) -> Result<()> {
        writer.write_u16::<BigEndian>(self.version)?;
        writer.write_u64::<BigEndian>(self.tree_size)?;

        let root_hash_size = self
            .root_hash
            .len()
            .to_u8()
            .ok_or(Error::IntegerTooLarge("root_hash_size"))?;
        writer.write_u8(root_hash_size)?;
        writer.write_all(&self.root_hash)?;

        writer.write_u64::<BigEndian>(self.timestamp)?;

        let metadata_size = self
            .metadata
            .len()
            .to_u16()
            .ok_or(Error::IntegerTooLarge("metadata_size"))?;
        writer.write_u16::<BigEndian>(metadata_size)?;
        writer.write_all(&self.metadata)?;

        Ok(())
    }
}

/// One inclusion proof from a single transparency log.
#[derive(Clone, Eq, PartialEq)]
pub struct AftlIcpEntry {
    pub log_url: String,
    pub leaf_index: u64,
    pub log_root: TrillianLogRootDescriptor,
    pub fw_info_leaf: Vec<u8>,
    pub log_root_signature: Vec<u8>,
    pub proof_hashes: Vec<[u8; HASH_SIZE]>,
}

impl fmt::Debug for AftlIcpEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AftlIcpEntry")
            .field("log_url", &self.log_url)
            .field("leaf_index", &self.leaf_index)
            .field("log_root", &self.log_root)
            .field("fw_info_leaf", &EscapedString::new(&self.fw_info_leaf))
            .field("log_root_signature", &hex::encode(&self.log_root_signature))
            .field(
                "proof_hashes",
                &self.proof_hashes.iter().map(hex::encode).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl AftlIcpEntry {
    /// Verify this entry against the log's Ed25519 public key and the digest
    /// of the vbmeta image the entry accompanies:
    ///
    /// 1. Recompute the Merkle root from the firmware-info leaf and the
    ///    inclusion path and compare it to the signed log root.
    /// 2. Verify the log root signature.
    /// 3. Check that the firmware-info leaf commits to `vbmeta_digest`.
    pub fn verify(
        &self,
        log_public_key: &[u8; crypto::ED25519_PUBLIC_KEY_SIZE],
        vbmeta_digest: &[u8],
    ) -> Result<()> {
        let leaf = leaf_hash(&self.fw_info_leaf);
        let computed = root_from_inclusion_proof(
            self.leaf_index,
            self.log_root.tree_size,
            &leaf,
            &self.proof_hashes,
        )?;

        if computed[..] != self.log_root.root_hash[..] {
            return Err(Error::RootHashMismatch {
                computed: hex::encode(computed),
                stored: hex::encode(&self.log_root.root_hash),
            });
        }

        match self.log_root_signature.len() {
            ED25519_SIGNATURE_SIZE => {
                let signature: [u8; ED25519_SIGNATURE_SIZE] =
                    self.log_root_signature[..].try_into().unwrap();

                crypto::ed25519_verify(
                    log_public_key,
                    &self.log_root.signed_data()?,
                    &signature,
                )
                .map_err(Error::LogRootSignature)?;
            }
            n => return Err(Error::UnsupportedSignatureSize(n)),
        }

        if !self.leaf_commits_to(vbmeta_digest) {
            return Err(Error::LeafCommitmentMismatch);
        }

        Ok(())
    }

    /// Check whether the firmware-info leaf contains the given digest, either
    /// as raw bytes or as lowercase hex.
    fn leaf_commits_to(&self, digest: &[u8]) -> bool {
        if digest.is_empty() {
            return false;
        }

        let hex = hex::encode(digest);

        contains(&self.fw_info_leaf, digest) || contains(&self.fw_info_leaf, hex.as_bytes())
    }
}

impl<R: Read> FromReader<R> for AftlIcpEntry {
    type Error = Error;

    fn from_reader(mut reader: R) -> Result<Self> {
        let log_url_size = reader
            .read_u32::<BigEndian>()?
            .to_usize()
            .ok_or(Error::IntegerTooLarge("log_url_size"))?;
        let leaf_index = reader.read_u64::<BigEndian>()?;
        let log_root_descriptor_size = reader.read_u32::<BigEndian>()?;
        let fw_info_leaf_size = reader
            .read_u32::<BigEndian>()?
            .to_usize()
            .ok_or(Error::IntegerTooLarge("fw_info_leaf_size"))?;
        let log_root_sig_size = reader
            .read_u32::<BigEndian>()?
            .to_usize()
            .ok_or(Error::IntegerTooLarge("log_root_sig_size"))?;
        let proof_hash_count = reader.read_u8()?;
        let inc_proof_size = reader.read_u32::<BigEndian>()?;

        if inc_proof_size != u32::from(proof_hash_count) * HASH_SIZE as u32 {
            return Err(Error::IncorrectProofSize {
                count: proof_hash_count,
                size: inc_proof_size,
            });
        }

        let log_url = reader
            .read_string_exact(log_url_size)
            .map_err(|e| Error::ReadFieldError("log_url", e))?;

        let mut log_root_reader =
            CountingReader::new((&mut reader).take(log_root_descriptor_size.into()));
        let log_root = TrillianLogRootDescriptor::from_reader(&mut log_root_reader)?;
        let (_, log_root_consumed) = log_root_reader.finish();
        if log_root_consumed != u64::from(log_root_descriptor_size) {
            return Err(Error::IncorrectLogRootSize);
        }

        let fw_info_leaf = reader.read_vec_exact(fw_info_leaf_size)?;
        let log_root_signature = reader.read_vec_exact(log_root_sig_size)?;

        let mut proof_hashes = Vec::with_capacity(proof_hash_count as usize);
        for _ in 0..proof_hash_count {
            proof_hashes.push(reader.read_array_exact::<HASH_SIZE>()?);
        }

        Ok(Self {
            log_url,
            leaf_index,
            log_root,
            fw_info_leaf,
            log_root_signature,
            proof_hashes,
        })
    }
}

impl<W: Write> ToWriter<W> for AftlIcpEntry {
    type Error = Error;

    fn to_writer(&self, mut writer: W) -> Result<()> {
        let log_url_size = self
            .log_url
            .len()
            .to_u32()
            .ok_or(Error::IntegerTooLarge("log_url_size"))?;
        writer.write_u32::<BigEndian>(log_url_size)?;
        writer.write_u64::<BigEndian>(self.leaf_index)?;

        let log_root_raw = self.log_root.signed_data()?;
        let log_root_descriptor_size = log_root_raw
            .len()
            .to_u32()
            .ok_or(Error::IntegerTooLarge("log_root_descriptor_size"))?;
        writer.write_u32::<BigEndian>(log_root_descriptor_size)?;

        let fw_info_leaf_size = self
            .fw_info_leaf
            .len()
            .to_u32()
            .ok_or(Error::IntegerTooLarge("fw_info_leaf_size"))?;
        writer.write_u32::<BigEndian>(fw_info_leaf_size)?;

        let log_root_sig_size = self
            .log_root_signature
            .len()
            .to_u32()
            .ok_or(Error::IntegerTooLarge("log_root_sig_size"))?;
        writer.write_u32::<BigEndian>(log_root_sig_size)?;

        let proof_hash_count = self
            .proof_hashes
            .len()
            .to_u8()
            .ok_or(Error::IntegerTooLarge("proof_hash_count"))?;
        writer.write_u8(proof_hash_count)?;
        writer.write_u32::<BigEndian>(u32::from(proof_hash_count) * HASH_SIZE as u32)?;

        writer.write_all(self.log_url.as_bytes())?;
        writer.write_all(&log_root_raw)?;
        writer.write_all(&self.fw_info_leaf)?;
        writer.write_all(&self.log_root_signature)?;

        for hash in &self.proof_hashes {
            writer.write_all(hash)?;
        }

        Ok(())
    }
}

/// A parsed AFTL image: a fixed header followed by one entry per log.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AftlImage {
    pub required_icp_version_major: u32,
    pub required_icp_version_minor: u32,
    pub entries: Vec<AftlIcpEntry>,
}

impl AftlImage {
    /// Verify every entry. See [`AftlIcpEntry::verify`].
    pub fn verify(
        &self,
        log_public_key: &[u8; crypto::ED25519_PUBLIC_KEY_SIZE],
        vbmeta_digest: &[u8],
    ) -> Result<()> {
        for entry in &self.entries {
            entry.verify(log_public_key, vbmeta_digest)?;
        }

        Ok(())
    }
}

impl<R: Read> FromReader<R> for AftlImage {
    type Error = Error;

    fn from_reader(reader: R) -> Result<Self> {
        let mut reader = CountingReader::new(reader);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;

        if magic != HEADER_MAGIC {
            return Err(Error::InvalidHeaderMagic(magic));
        }

        let required_icp_version_major = reader.read_u32::<BigEndian>()?;
        let required_icp_version_minor = reader.read_u32::<BigEndian>()?;

        if required_icp_version_major != VERSION_MAJOR
            || required_icp_version_minor > VERSION_MINOR
        {
            return Err(Error::UnsupportedVersion {
                major: required_icp_version_major,
                minor: required_icp_version_minor,
            });
        }

        let image_size = reader.read_u32::<BigEndian>()?;
        let icp_count = reader.read_u16::<BigEndian>()?;

        let mut entries = Vec::with_capacity(icp_count as usize);
        for _ in 0..icp_count {
            entries.push(AftlIcpEntry::from_reader(&mut reader)?);
        }

        let (_, consumed) = reader.finish();
        if u64::from(image_size) != consumed {
            return Err(Error::IncorrectImageSize {
                expected: image_size,
                actual: consumed,
            });
        }

        Ok(Self {
            required_icp_version_major,
            required_icp_version_minor,
            entries,
        })
    }
}

impl<W: Write> ToWriter<W> for AftlImage {
    type Error = Error;

    fn to_writer(&self, mut writer: W) -> Result<()> {
        let mut entries_writer = Cursor::new(Vec::new());
        for entry in &self.entries {
            entry.to_writer(&mut entries_writer)?;
        }
        let entries_raw = entries_writer.into_inner();

        // Header: magic + 2 version fields + image size + entry count.
        let header_size = 4 + 4 + 4 + 4 + 2;
        let image_size = entries_raw
            .len()
            .checked_add(header_size)
            .and_then(|s| s.to_u32())
            .ok_or(Error::IntegerTooLarge("image_size"))?;

        let icp_count = self
            .entries
            .len()
            .to_u16()
            .ok_or(Error::IntegerTooLarge("icp_count"))?;

        writer.write_all(&HEADER_MAGIC)?;
        writer.write_u32::<BigEndian>(self.required_icp_version_major)?;
        writer.write_u32::<BigEndian>(self.required_icp_version_minor)?;
        writer.write_u32::<BigEndian>(image_size)?;
        writer.write_u16::<BigEndian>(icp_count)?;
        writer.write_all(&entries_raw)?;

        Ok(())
    }
}

/// RFC 6962 leaf hash: `SHA-256(0x00 ∥ leaf)`.
pub fn leaf_hash(data: &[u8]) -> [u8; HASH_SIZE] {
    let mut context = Sha256::new();
    context.update([LEAF_HASH_PREFIX]);
    context.update(data);
    context.finalize().into()
}

/// RFC 6962 interior node hash: `SHA-256(0x01 ∥ left ∥ right)`.
pub fn node_hash(left: &[u8; HASH_SIZE], right: &[u8; HASH_SIZE]) -> [u8; HASH_SIZE] {
    let mut context = Sha256::new();
    context.update([NODE_HASH_PREFIX]);
    context.update(left);
    context.update(right);
    context.finalize().into()
}

/// Recompute the Merkle root from a leaf hash and its inclusion path,
/// following the RFC 9162 §2.1.3.2 verification algorithm. The leaf index
/// decides at each level whether the sibling sits on the left or the right;
/// the tree size handles the border nodes of non-perfect trees.
pub fn root_from_inclusion_proof(
    leaf_index: u64,
    tree_size: u64,
    leaf_hash: &[u8; HASH_SIZE],
    proof_hashes: &[[u8; HASH_SIZE]],
) -> Result<[u8; HASH_SIZE]> {
    if leaf_index >= tree_size {
        return Err(Error::LeafIndexOutOfRange {
            leaf_index,
            tree_size,
        });
    }

    let mut fn_ = leaf_index;
    let mut sn = tree_size - 1;
    let mut result = *leaf_hash;

    for hash in proof_hashes {
        if sn == 0 {
            return Err(Error::IncorrectProofLength { tree_size });
        }

        if fn_ & 1 == 1 || fn_ == sn {
            result = node_hash(hash, &result);

            if fn_ & 1 == 0 {
                while fn_ & 1 == 0 && fn_ != 0 {
                    fn_ >>= 1;
                    sn >>= 1;
                }
            }
        } else {
            result = node_hash(&result, hash);
        }

        fn_ >>= 1;
        sn >>= 1;
    }

    if sn != 0 {
        return Err(Error::IncorrectProofLength { tree_size });
    }

    Ok(result)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty()
        && haystack
            .windows(needle.len())
            .any(|window| window == needle)
}
