// SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    cmp, fmt,
    io::{self, Cursor, Read, Seek, SeekFrom, Write},
};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use num_bigint_dig::{ModInverse, ToBigInt};
use num_traits::{Pow, ToPrimitive};
use rsa::{traits::PublicKeyParts, BigUint, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;

use crate::{
    crypto::DigestAlgorithm,
    format::padding,
    stream::{
        CountingReader, FromReader, ReadFixedSizeExt, ReadStringExt, ToWriter, WriteStringExt,
        WriteZerosExt,
    },
    util::{self, EscapedString},
};

pub const VERSION_MAJOR: u32 = 1;
pub const VERSION_MINOR: u32 = 3;
pub const VERSION_SUB: u32 = 0;

pub const FOOTER_VERSION_MAJOR: u32 = 1;
pub const FOOTER_VERSION_MINOR: u32 = 0;

pub const HEADER_MAGIC: [u8; 4] = *b"AVB0";
pub const FOOTER_MAGIC: [u8; 4] = *b"AVBf";

/// Maximum length of a partition name carried in a descriptor.
pub const PARTITION_NAME_MAX_SIZE: usize = 32;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to read {0:?} field: {1}")]
    ReadFieldError(&'static str, io::Error),
    #[error("Failed to write {0:?} field: {1}")]
    WriteFieldError(&'static str, io::Error),
    #[error("{0:?} field does not have NULL terminator")]
    StringNotNullTerminated(&'static str),
    #[error("{0:?} field is not ASCII encoded: {1:?}")]
    StringNotAscii(&'static str, String),
    #[error("{0:?} field exceeds {1} byte limit")]
    StringTooLong(&'static str, usize),
    #[error("{0:?} field exceeds integer bounds")]
    IntegerTooLarge(&'static str),
    #[error("Descriptor padding is too long or data was not consumed")]
    PaddingTooLong,
    #[error("{0:?} field padding contains non-zero bytes")]
    PaddingNotZero(&'static str),
    #[error("{0:?} field size does not equal size of contained items")]
    IncorrectCombinedSize(&'static str),
    #[error("Invalid VBMeta header magic: {0:?}")]
    InvalidHeaderMagic([u8; 4]),
    #[error("Invalid VBMeta footer magic: {0:?}")]
    InvalidFooterMagic([u8; 4]),
    #[error("Unsupported VBMeta version: {major}.{minor}")]
    UnsupportedVbmetaVersion { major: u32, minor: u32 },
    #[error("RSA public key exponent not supported: {0}")]
    UnsupportedRsaPublicExponent(BigUint),
    #[error("Signature algorithm not supported: {0:?}")]
    UnsupportedAlgorithm(AlgorithmType),
    #[error("Hashing algorithm not supported: {0:?}")]
    UnsupportedHashAlgorithm(String),
    #[error("Incorrect key size ({key_size} bytes) for algorithm {algo:?} ({} bytes)", algo.public_key_len())]
    IncorrectKeySize {
        key_size: usize,
        algo: AlgorithmType,
    },
    #[error("Expected digest {expected}, but have {actual}")]
    InvalidRootDigest { expected: String, actual: String },
    #[error("Stored digest {stored} does not match computed digest {computed}")]
    MismatchedStoredDigest { stored: String, computed: String },
    #[error("Failed to RSA sign digest")]
    RsaSign(#[source] rsa::Error),
    #[error("Failed to RSA verify signature")]
    RsaVerify(#[source] rsa::Error),
    #[error("{0} byte image size is too small to fit header or footer")]
    ImageSizeTooSmall(u64),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AlgorithmType {
    None,
    Sha256Rsa2048,
    Sha256Rsa4096,
    Sha256Rsa8192,
    Sha512Rsa2048,
    Sha512Rsa4096,
    Sha512Rsa8192,
    Unknown(u32),
}

impl AlgorithmType {
    pub fn from_raw(value: u32) -> Self {
        match value {
            0 => Self::None,
            1 => Self::Sha256Rsa2048,
            2 => Self::Sha256Rsa4096,
            3 => Self::Sha256Rsa8192,
            4 => Self::Sha512Rsa2048,
            5 => Self::Sha512Rsa4096,
            6 => Self::Sha512Rsa8192,
            v => Self::Unknown(v),
        }
    }

    pub fn to_raw(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Sha256Rsa2048 => 1,
            Self::Sha256Rsa4096 => 2,
            Self::Sha256Rsa8192 => 3,
            Self::Sha512Rsa2048 => 4,
            Self::Sha512Rsa4096 => 5,
            Self::Sha512Rsa8192 => 6,
            Self::Unknown(v) => v,
        }
    }

    /// The digest algorithm half of the pair. [`AlgorithmType::None`] and
    /// unknown algorithms have no associated digest.
    pub fn digest_algorithm(self) -> Option<DigestAlgorithm> {
        match self {
            Self::None | Self::Unknown(_) => None,
            Self::Sha256Rsa2048 | Self::Sha256Rsa4096 | Self::Sha256Rsa8192 => {
                Some(DigestAlgorithm::Sha256)
            }
            Self::Sha512Rsa2048 | Self::Sha512Rsa4096 | Self::Sha512Rsa8192 => {
                Some(DigestAlgorithm::Sha512)
            }
        }
    }

    pub fn hash_len(self) -> usize {
        match self {
            Self::None | Self::Unknown(_) => 0,
            Self::Sha256Rsa2048 | Self::Sha256Rsa4096 | Self::Sha256Rsa8192 => {
                Sha256::output_size()
            }
            Self::Sha512Rsa2048 | Self::Sha512Rsa4096 | Self::Sha512Rsa8192 => {
                Sha512::output_size()
            }
        }
    }

    pub fn signature_len(self) -> usize {
        match self {
            Self::None | Self::Unknown(_) => 0,
            Self::Sha256Rsa2048 | Self::Sha512Rsa2048 => 256,
            Self::Sha256Rsa4096 | Self::Sha512Rsa4096 => 512,
            Self::Sha256Rsa8192 | Self::Sha512Rsa8192 => 1024,
        }
    }

    pub fn public_key_len(self) -> usize {
        match self {
            Self::None | Self::Unknown(_) => 0,
            Self::Sha256Rsa2048 | Self::Sha512Rsa2048 => 8 + 2 * 2048 / 8,
            Self::Sha256Rsa4096 | Self::Sha512Rsa4096 => 8 + 2 * 4096 / 8,
            Self::Sha256Rsa8192 | Self::Sha512Rsa8192 => 8 + 2 * 8192 / 8,
        }
    }

    pub fn hash(self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::None | Self::Unknown(_) => vec![],
            Self::Sha256Rsa2048 | Self::Sha256Rsa4096 | Self::Sha256Rsa8192 => {
                Sha256::digest(data).to_vec()
            }
            Self::Sha512Rsa2048 | Self::Sha512Rsa4096 | Self::Sha512Rsa8192 => {
                Sha512::digest(data).to_vec()
            }
        }
    }

    pub fn sign(self, key: &RsaPrivateKey, digest: &[u8]) -> Result<Vec<u8>> {
        let signature = match self {
            Self::None | Self::Unknown(_) => vec![],
            Self::Sha256Rsa2048 | Self::Sha256Rsa4096 | Self::Sha256Rsa8192 => {
                let scheme = Pkcs1v15Sign::new::<Sha256>();
                key.sign(scheme, digest).map_err(Error::RsaSign)?
            }
            Self::Sha512Rsa2048 | Self::Sha512Rsa4096 | Self::Sha512Rsa8192 => {
                let scheme = Pkcs1v15Sign::new::<Sha512>();
                key.sign(scheme, digest).map_err(Error::RsaSign)?
            }
        };

        Ok(signature)
    }

    pub fn verify(self, key: &RsaPublicKey, digest: &[u8], signature: &[u8]) -> Result<()> {
        match self {
            Self::None | Self::Unknown(_) => {}
            Self::Sha256Rsa2048 | Self::Sha256Rsa4096 | Self::Sha256Rsa8192 => {
                let scheme = Pkcs1v15Sign::new::<Sha256>();
                key.verify(scheme, digest, signature)
                    .map_err(Error::RsaVerify)?;
            }
            Self::Sha512Rsa2048 | Self::Sha512Rsa4096 | Self::Sha512Rsa8192 => {
                let scheme = Pkcs1v15Sign::new::<Sha512>();
                key.verify(scheme, digest, signature)
                    .map_err(Error::RsaVerify)?;
            }
        }

        Ok(())
    }
}

trait DescriptorTag {
    const TAG: u64;

    fn get_tag(&self) -> u64 {
        Self::TAG
    }
}

#[derive(Clone, Eq, PartialEq)]
pub struct PropertyDescriptor {
    pub key: String,
    pub value: Vec<u8>,
}

impl fmt::Debug for PropertyDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyDescriptor")
            .field("key", &self.key)
            .field("value", &EscapedString::new(&self.value))
            .finish()
    }
}

impl DescriptorTag for PropertyDescriptor {
    const TAG: u64 = 0;
}

impl<R: Read> FromReader<R> for PropertyDescriptor {
    type Error = Error;

    fn from_reader(mut reader: R) -> Result<Self> {
        let key_size = reader
            .read_u64::<BigEndian>()?
            .to_usize()
            .ok_or(Error::IntegerTooLarge("key_size"))?;
        let value_size = reader
            .read_u64::<BigEndian>()?
            .to_usize()
            .ok_or(Error::IntegerTooLarge("value_size"))?;

        let key = reader
            .read_string_exact(key_size)
            .map_err(|e| Error::ReadFieldError("key", e))?;

        let mut null = [0u8; 1];
        reader.read_exact(&mut null)?;
        if null[0] != b'\0' {
            return Err(Error::StringNotNullTerminated("key"));
        }

        let value = reader.read_vec_exact(value_size)?;

        // The non-string value is also null terminated.
        reader.read_exact(&mut null)?;
        if null[0] != b'\0' {
            return Err(Error::StringNotNullTerminated("value"));
        }

        Ok(Self { key, value })
    }
}

impl<W: Write> ToWriter<W> for PropertyDescriptor {
    type Error = Error;

    fn to_writer(&self, mut writer: W) -> Result<()> {
        writer.write_u64::<BigEndian>(self.key.len() as u64)?;
        writer.write_u64::<BigEndian>(self.value.len() as u64)?;
        writer.write_all(self.key.as_bytes())?;
        writer.write_all(b"\0")?;
        writer.write_all(&self.value)?;
        writer.write_all(b"\0")?;

        Ok(())
    }
}

#[derive(Clone, Eq, PartialEq)]
pub struct HashTreeDescriptor {
    pub dm_verity_version: u32,
    pub image_size: u64,
    pub tree_offset: u64,
    pub tree_size: u64,
    pub data_block_size: u32,
    pub hash_block_size: u32,
    pub fec_num_roots: u32,
    pub fec_offset: u64,
    pub fec_size: u64,
    pub hash_algorithm: String,
    pub partition_name: String,
    pub salt: Vec<u8>,
    pub root_digest: Vec<u8>,
    pub flags: u32,
    pub reserved: [u8; 60],
}

impl HashTreeDescriptor {
    pub const FLAG_DO_NOT_USE_AB: u32 = 1 << 0;
}

impl fmt::Debug for HashTreeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashTreeDescriptor")
            .field("dm_verity_version", &self.dm_verity_version)
            .field("image_size", &self.image_size)
            .field("tree_offset", &self.tree_offset)
            .field("tree_size", &self.tree_size)
            .field("data_block_size", &self.data_block_size)
            .field("hash_block_size", &self.hash_block_size)
            .field("fec_num_roots", &self.fec_num_roots)
            .field("fec_offset", &self.fec_offset)
            .field("fec_size", &self.fec_size)
            .field("hash_algorithm", &self.hash_algorithm)
            .field("partition_name", &self.partition_name)
            .field("salt", &hex::encode(&self.salt))
            .field("root_digest", &hex::encode(&self.root_digest))
            .field("flags", &self.flags)
            .field("reserved", &hex::encode(self.reserved))
            .finish()
    }
}

impl DescriptorTag for HashTreeDescriptor {
    const TAG: u64 = 1;
}

impl<R: Read> FromReader<R> for HashTreeDescriptor {
    type Error = Error;

    fn from_reader(mut reader: R) -> Result<Self> {
        let dm_verity_version = reader.read_u32::<BigEndian>()?;
        let image_size = reader.read_u64::<BigEndian>()?;
        let tree_offset = reader.read_u64::<BigEndian>()?;
        let tree_size = reader.read_u64::<BigEndian>()?;
        let data_block_size = reader.read_u32::<BigEndian>()?;
        let hash_block_size = reader.read_u32::<BigEndian>()?;
        let fec_num_roots = reader.read_u32::<BigEndian>()?;
        let fec_offset = reader.read_u64::<BigEndian>()?;
        let fec_size = reader.read_u64::<BigEndian>()?;

        let hash_algorithm = reader
            .read_string_padded(32)
            .map_err(|e| Error::ReadFieldError("hash_algorithm", e))?;
        if !hash_algorithm.is_ascii() {
            return Err(Error::StringNotAscii("hash_algorithm", hash_algorithm));
        }

        let partition_name_len = reader.read_u32::<BigEndian>()?;
        let salt_len = reader.read_u32::<BigEndian>()?;
        let root_digest_len = reader.read_u32::<BigEndian>()?;
        let flags = reader.read_u32::<BigEndian>()?;

        let reserved = reader.read_array_exact::<60>()?;

        let partition_name_len = partition_name_len.to_usize().unwrap();
        if partition_name_len > PARTITION_NAME_MAX_SIZE {
            return Err(Error::StringTooLong(
                "partition_name",
                PARTITION_NAME_MAX_SIZE,
            ));
        }

        // Not NULL-terminated.
        let partition_name = reader
            .read_string_exact(partition_name_len)
            .map_err(|e| Error::ReadFieldError("partition_name", e))?;

        let salt = reader.read_vec_exact(salt_len.to_usize().unwrap())?;
        let root_digest = reader.read_vec_exact(root_digest_len.to_usize().unwrap())?;

        let descriptor = Self {
            dm_verity_version,
            image_size,
            tree_offset,
            tree_size,
            data_block_size,
            hash_block_size,
            fec_num_roots,
            fec_offset,
            fec_size,
            hash_algorithm,
            partition_name,
            salt,
            root_digest,
            flags,
            reserved,
        };

        Ok(descriptor)
    }
}

impl<W: Write> ToWriter<W> for HashTreeDescriptor {
    type Error = Error;

    fn to_writer(&self, mut writer: W) -> Result<()> {
        writer.write_u32::<BigEndian>(self.dm_verity_version)?;
        writer.write_u64::<BigEndian>(self.image_size)?;
        writer.write_u64::<BigEndian>(self.tree_offset)?;
        writer.write_u64::<BigEndian>(self.tree_size)?;
        writer.write_u32::<BigEndian>(self.data_block_size)?;
        writer.write_u32::<BigEndian>(self.hash_block_size)?;
        writer.write_u32::<BigEndian>(self.fec_num_roots)?;
        writer.write_u64::<BigEndian>(self.fec_offset)?;
        writer.write_u64::<BigEndian>(self.fec_size)?;

        if !self.hash_algorithm.is_ascii() {
            return Err(Error::StringNotAscii(
                "hash_algorithm",
                self.hash_algorithm.clone(),
            ));
        }
        writer
            .write_string_padded(&self.hash_algorithm, 32)
            .map_err(|e| Error::WriteFieldError("hash_algorithm", e))?;

        let partition_name_len = self
            .partition_name
            .len()
            .to_u32()
            .ok_or(Error::IntegerTooLarge("partition_name_len"))?;
        writer.write_u32::<BigEndian>(partition_name_len)?;

        let salt_len = self
            .salt
            .len()
            .to_u32()
            .ok_or(Error::IntegerTooLarge("salt_len"))?;
        writer.write_u32::<BigEndian>(salt_len)?;

        let root_digest_len = self
            .root_digest
            .len()
            .to_u32()
            .ok_or(Error::IntegerTooLarge("root_digest_len"))?;
        writer.write_u32::<BigEndian>(root_digest_len)?;

        writer.write_u32::<BigEndian>(self.flags)?;
        writer.write_all(&self.reserved)?;
        writer.write_all(self.partition_name.as_bytes())?;
        writer.write_all(&self.salt)?;
        writer.write_all(&self.root_digest)?;

        Ok(())
    }
}

#[derive(Clone, Eq, PartialEq)]
pub struct HashDescriptor {
    pub image_size: u64,
    pub hash_algorithm: String,
    pub partition_name: String,
    pub salt: Vec<u8>,
    pub root_digest: Vec<u8>,
    pub flags: u32,
    pub reserved: [u8; 60],
}

impl HashDescriptor {
    pub const FLAG_DO_NOT_USE_AB: u32 = 1 << 0;

    /// Verify a fully loaded partition image against the stored digest. The
    /// caller is responsible for reading exactly `image_size` bytes.
    pub fn verify(&self, data: &[u8]) -> Result<()> {
        let algorithm = DigestAlgorithm::from_name(&self.hash_algorithm)
            .map_err(|_| Error::UnsupportedHashAlgorithm(self.hash_algorithm.clone()))?;

        let mut context = algorithm.context();
        context.update(&self.salt);
        context.update(data);
        let digest = context.finish();

        if self.root_digest != digest.as_ref() {
            return Err(Error::InvalidRootDigest {
                expected: hex::encode(&self.root_digest),
                actual: hex::encode(digest),
            });
        }

        Ok(())
    }
}

impl fmt::Debug for HashDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashDescriptor")
            .field("image_size", &self.image_size)
            .field("hash_algorithm", &self.hash_algorithm)
            .field("partition_name", &self.partition_name)
            .field("salt", &hex::encode(&self.salt))
            .field("root_digest", &hex::encode(&self.root_digest))
            .field("flags", &self.flags)
            .field("reserved", &hex::encode(self.reserved))
            .finish()
    }
}

impl DescriptorTag for HashDescriptor {
    const TAG: u64 = 2;
}

impl<R: Read> FromReader<R> for HashDescriptor {
    type Error = Error;

    fn from_reader(mut reader: R) -> Result<Self> {
        let image_size = reader.read_u64::<BigEndian>()?;

        let hash_algorithm = reader
            .read_string_padded(32)
            .map_err(|e| Error::ReadFieldError("hash_algorithm", e))?;
        if !hash_algorithm.is_ascii() {
            return Err(Error::StringNotAscii("hash_algorithm", hash_algorithm));
        }

        let partition_name_len = reader.read_u32::<BigEndian>()?;
        let salt_len = reader.read_u32::<BigEndian>()?;
        let root_digest_len = reader.read_u32::<BigEndian>()?;
        let flags = reader.read_u32::<BigEndian>()?;

        let reserved = reader.read_array_exact::<60>()?;

        let partition_name_len = partition_name_len.to_usize().unwrap();
        if partition_name_len > PARTITION_NAME_MAX_SIZE {
            return Err(Error::StringTooLong(
                "partition_name",
                PARTITION_NAME_MAX_SIZE,
            ));
        }

        // Not NULL-terminated.
        let partition_name = reader
            .read_string_exact(partition_name_len)
            .map_err(|e| Error::ReadFieldError("partition_name", e))?;

        let salt = reader.read_vec_exact(salt_len.to_usize().unwrap())?;
        let root_digest = reader.read_vec_exact(root_digest_len.to_usize().unwrap())?;

        let descriptor = Self {
            image_size,
            hash_algorithm,
            partition_name,
            salt,
            root_digest,
            flags,
            reserved,
        };

        Ok(descriptor)
    }
}

impl<W: Write> ToWriter<W> for HashDescriptor {
    type Error = Error;

    fn to_writer(&self, mut writer: W) -> Result<()> {
        writer.write_u64::<BigEndian>(self.image_size)?;

        if !self.hash_algorithm.is_ascii() {
            return Err(Error::StringNotAscii(
                "hash_algorithm",
                self.hash_algorithm.clone(),
            ));
        }
        writer
            .write_string_padded(&self.hash_algorithm, 32)
            .map_err(|e| Error::WriteFieldError("hash_algorithm", e))?;

        let partition_name_len = self
            .partition_name
            .len()
            .to_u32()
            .ok_or(Error::IntegerTooLarge("partition_name_len"))?;
        writer.write_u32::<BigEndian>(partition_name_len)?;

        let salt_len = self
            .salt
            .len()
            .to_u32()
            .ok_or(Error::IntegerTooLarge("salt_len"))?;
        writer.write_u32::<BigEndian>(salt_len)?;

        let root_digest_len = self
            .root_digest
            .len()
            .to_u32()
            .ok_or(Error::IntegerTooLarge("root_digest_len"))?;
        writer.write_u32::<BigEndian>(root_digest_len)?;

        writer.write_u32::<BigEndian>(self.flags)?;
        writer.write_all(&self.reserved)?;
        writer.write_all(self.partition_name.as_bytes())?;
        writer.write_all(&self.salt)?;
        writer.write_all(&self.root_digest)?;

        Ok(())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KernelCmdlineDescriptor {
    pub flags: u32,
    pub cmdline: String,
}

impl KernelCmdlineDescriptor {
    pub const FLAG_USE_ONLY_IF_HASHTREE_NOT_DISABLED: u32 = 1 << 0;
    pub const FLAG_USE_ONLY_IF_HASHTREE_DISABLED: u32 = 1 << 1;
}

impl DescriptorTag for KernelCmdlineDescriptor {
    const TAG: u64 = 3;
}

impl<R: Read> FromReader<R> for KernelCmdlineDescriptor {
    type Error = Error;

    fn from_reader(mut reader: R) -> Result<Self> {
        let flags = reader.read_u32::<BigEndian>()?;
        let cmdline_len = reader.read_u32::<BigEndian>()?;

        // Not NULL-terminated.
        let cmdline = reader
            .read_string_exact(cmdline_len.to_usize().unwrap())
            .map_err(|e| Error::ReadFieldError("cmdline", e))?;

        let descriptor = Self { flags, cmdline };

        Ok(descriptor)
    }
}

impl<W: Write> ToWriter<W> for KernelCmdlineDescriptor {
    type Error = Error;

    fn to_writer(&self, mut writer: W) -> Result<()> {
        writer.write_u32::<BigEndian>(self.flags)?;

        let cmdline_len = self
            .cmdline
            .len()
            .to_u32()
            .ok_or(Error::IntegerTooLarge("cmdline_len"))?;
        writer.write_u32::<BigEndian>(cmdline_len)?;

        writer.write_all(self.cmdline.as_bytes())?;

        Ok(())
    }
}

#[derive(Clone, Eq, PartialEq)]
pub struct ChainPartitionDescriptor {
    pub rollback_index_location: u32,
    pub partition_name: String,
    pub public_key: Vec<u8>,
    pub flags: u32,
    pub reserved: [u8; 60],
}

impl ChainPartitionDescriptor {
    pub const FLAG_DO_NOT_USE_AB: u32 = 1 << 0;
}

impl fmt::Debug for ChainPartitionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainPartitionDescriptor")
            .field("rollback_index_location", &self.rollback_index_location)
            .field("partition_name", &self.partition_name)
            .field("public_key", &hex::encode(&self.public_key))
            .field("flags", &self.flags)
            .field("reserved", &hex::encode(self.reserved))
            .finish()
    }
}

impl DescriptorTag for ChainPartitionDescriptor {
    const TAG: u64 = 4;
}

impl<R: Read> FromReader<R> for ChainPartitionDescriptor {
    type Error = Error;

    fn from_reader(mut reader: R) -> Result<Self> {
        let rollback_index_location = reader.read_u32::<BigEndian>()?;
        let partition_name_len = reader.read_u32::<BigEndian>()?;
        let public_key_len = reader.read_u32::<BigEndian>()?;
        let flags = reader.read_u32::<BigEndian>()?;

        let reserved = reader.read_array_exact::<60>()?;

        let partition_name_len = partition_name_len.to_usize().unwrap();
        if partition_name_len > PARTITION_NAME_MAX_SIZE {
            return Err(Error::StringTooLong(
                "partition_name",
                PARTITION_NAME_MAX_SIZE,
            ));
        }

        // Not NULL-terminated.
        let partition_name = reader
            .read_string_exact(partition_name_len)
            .map_err(|e| Error::ReadFieldError("partition_name", e))?;

        let public_key = reader.read_vec_exact(public_key_len.to_usize().unwrap())?;

        let descriptor = Self {
            rollback_index_location,
            partition_name,
            public_key,
            flags,
            reserved,
        };

        Ok(descriptor)
    }
}

impl<W: Write> ToWriter<W> for ChainPartitionDescriptor {
    type Error = Error;

    fn to_writer(&self, mut writer: W) -> Result<()> {
        writer.write_u32::<BigEndian>(self.rollback_index_location)?;

        let partition_name_len = self
            .partition_name
            .len()
            .to_u32()
            .ok_or(Error::IntegerTooLarge("partition_name_len"))?;
        writer.write_u32::<BigEndian>(partition_name_len)?;

        let public_key_len = self
            .public_key
            .len()
            .to_u32()
            .ok_or(Error::IntegerTooLarge("public_key_len"))?;
        writer.write_u32::<BigEndian>(public_key_len)?;

        writer.write_u32::<BigEndian>(self.flags)?;
        writer.write_all(&self.reserved)?;
        writer.write_all(self.partition_name.as_bytes())?;
        writer.write_all(&self.public_key)?;

        Ok(())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Descriptor {
    Property(PropertyDescriptor),
    HashTree(HashTreeDescriptor),
    Hash(HashDescriptor),
    KernelCmdline(KernelCmdlineDescriptor),
    ChainPartition(ChainPartitionDescriptor),
    Unknown(u64, Vec<u8>),
}

impl Descriptor {
    pub fn partition_name(&self) -> Option<&str> {
        match self {
            Self::HashTree(d) => Some(&d.partition_name),
            Self::Hash(d) => Some(&d.partition_name),
            Self::ChainPartition(d) => Some(&d.partition_name),
            _ => None,
        }
    }
}

impl<R: Read> FromReader<R> for Descriptor {
    type Error = Error;

    fn from_reader(mut reader: R) -> Result<Self> {
        let tag = reader.read_u64::<BigEndian>()?;
        let nbf_len = reader.read_u64::<BigEndian>()?;

        let mut inner_reader = CountingReader::new(reader.take(nbf_len));

        let descriptor = match tag {
            PropertyDescriptor::TAG => {
                let d = PropertyDescriptor::from_reader(&mut inner_reader)?;
                Self::Property(d)
            }
            HashTreeDescriptor::TAG => {
                let d = HashTreeDescriptor::from_reader(&mut inner_reader)?;
                Self::HashTree(d)
            }
            HashDescriptor::TAG => {
                let d = HashDescriptor::from_reader(&mut inner_reader)?;
                Self::Hash(d)
            }
            KernelCmdlineDescriptor::TAG => {
                let d = KernelCmdlineDescriptor::from_reader(&mut inner_reader)?;
                Self::KernelCmdline(d)
            }
            ChainPartitionDescriptor::TAG => {
                let d = ChainPartitionDescriptor::from_reader(&mut inner_reader)?;
                Self::ChainPartition(d)
            }
            _ => {
                let nbf = nbf_len
                    .to_usize()
                    .ok_or(Error::IntegerTooLarge("num_bytes_following"))?;
                let data = inner_reader.read_vec_exact(nbf)?;

                Self::Unknown(tag, data)
            }
        };

        // The descriptor data is always aligned to 8 bytes.
        padding::read_discard(&mut inner_reader, 8)?;
        if inner_reader.stream_position()? != nbf_len {
            return Err(Error::PaddingTooLong);
        }

        Ok(descriptor)
    }
}

impl<W: Write> ToWriter<W> for Descriptor {
    type Error = Error;

    fn to_writer(&self, mut writer: W) -> Result<()> {
        let mut inner_writer = Cursor::new(Vec::new());

        let tag = match self {
            Self::Property(d) => {
                d.to_writer(&mut inner_writer)?;
                d.get_tag()
            }
            Self::HashTree(d) => {
                d.to_writer(&mut inner_writer)?;
                d.get_tag()
            }
            Self::Hash(d) => {
                d.to_writer(&mut inner_writer)?;
                d.get_tag()
            }
            Self::KernelCmdline(d) => {
                d.to_writer(&mut inner_writer)?;
                d.get_tag()
            }
            Self::ChainPartition(d) => {
                d.to_writer(&mut inner_writer)?;
                d.get_tag()
            }
            Self::Unknown(tag, data) => {
                inner_writer.write_all(data)?;
                *tag
            }
        };

        let inner_data = inner_writer.into_inner();
        let inner_len = inner_data.len() as u64;
        let padding_len = padding::calc(inner_len, 8);
        let nbf = inner_len
            .checked_add(padding_len)
            .ok_or(Error::IntegerTooLarge("num_bytes_following"))?;

        writer.write_u64::<BigEndian>(tag)?;
        writer.write_u64::<BigEndian>(nbf)?;
        writer.write_all(&inner_data)?;
        writer.write_zeros_exact(padding_len)?;

        Ok(())
    }
}

/// Lazy iterator over the descriptors in a raw descriptor region. The
/// sequence is finite and can be restarted by constructing a new iterator
/// over the same buffer. Iteration stops after the first error since the
/// remaining record boundaries can no longer be trusted.
pub struct DescriptorIter<'a> {
    reader: Cursor<&'a [u8]>,
    failed: bool,
}

impl<'a> DescriptorIter<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            reader: Cursor::new(data),
            failed: false,
        }
    }
}

impl Iterator for DescriptorIter<'_> {
    type Item = Result<Descriptor>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.reader.position() >= self.reader.get_ref().len() as u64 {
            return None;
        }

        match Descriptor::from_reader(&mut self.reader) {
            Ok(descriptor) => Some(Ok(descriptor)),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

#[derive(Clone, Eq, PartialEq)]
pub struct Header {
    pub required_libavb_version_major: u32,
    pub required_libavb_version_minor: u32,
    pub algorithm_type: AlgorithmType,
    pub hash: Vec<u8>,
    pub signature: Vec<u8>,
    pub public_key: Vec<u8>,
    pub public_key_metadata: Vec<u8>,
    pub descriptors: Vec<Descriptor>,
    pub rollback_index: u64,
    pub flags: u32,
    pub rollback_index_location: u32,
    pub release_string: String,
    pub reserved: [u8; 80],
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header")
            .field(
                "required_libavb_version_major",
                &self.required_libavb_version_major,
            )
            .field(
                "required_libavb_version_minor",
                &self.required_libavb_version_minor,
            )
            .field("algorithm_type", &self.algorithm_type)
            .field("hash", &hex::encode(&self.hash))
            .field("signature", &hex::encode(&self.signature))
            .field("public_key", &hex::encode(&self.public_key))
            .field(
                "public_key_metadata",
                &hex::encode(&self.public_key_metadata),
            )
            .field("descriptors", &self.descriptors)
            .field("rollback_index", &self.rollback_index)
            .field("flags", &self.flags)
            .field("rollback_index_location", &self.rollback_index_location)
            .field("release_string", &self.release_string)
            .field("reserved", &hex::encode(self.reserved))
            .finish()
    }
}

impl Header {
    pub const SIZE: usize = 256;

    /// Set when the hashtree descriptors should be ignored and dm-verity
    /// should not be set up.
    pub const FLAG_HASHTREE_DISABLED: u32 = 1 << 0;

    /// Set when verification should be skipped entirely except for the
    /// top-level vbmeta image itself.
    pub const FLAG_VERIFICATION_DISABLED: u32 = 1 << 1;

    fn to_writer_internal(&self, mut writer: impl Write, skip_auth_block: bool) -> Result<()> {
        let mut descriptors_writer = Cursor::new(Vec::new());
        for d in &self.descriptors {
            d.to_writer(&mut descriptors_writer)?;
        }
        let descriptors_raw = descriptors_writer.into_inner();

        // Auth block.

        let hash_offset = 0u64;
        let hash_size = self.hash.len() as u64;

        let signature_offset = hash_offset
            .checked_add(hash_size)
            .ok_or(Error::IntegerTooLarge("signature_offset"))?;
        let signature_size = self.signature.len() as u64;

        let auth_block_data_size = signature_offset
            .checked_add(signature_size)
            .ok_or(Error::IntegerTooLarge("authentication_data_block_size"))?;
        let auth_block_padding_size = padding::calc(auth_block_data_size, 64);
        let auth_block_size = auth_block_data_size
            .checked_add(auth_block_padding_size)
            .ok_or(Error::IntegerTooLarge("authentication_data_block_size"))?;

        // Aux block.

        let descriptors_offset = 0u64;
        let descriptors_size = descriptors_raw.len() as u64;

        let public_key_offset = descriptors_offset
            .checked_add(descriptors_size)
            .ok_or(Error::IntegerTooLarge("public_key_offset"))?;
        let public_key_size = self.public_key.len() as u64;

        let public_key_metadata_offset = public_key_offset
            .checked_add(public_key_size)
            .ok_or(Error::IntegerTooLarge("public_key_metadata_offset"))?;
        let public_key_metadata_size = self.public_key_metadata.len() as u64;

        let aux_block_data_size = public_key_metadata_offset
            .checked_add(public_key_metadata_size)
            .ok_or(Error::IntegerTooLarge("auxiliary_data_block_size"))?;
        let aux_block_padding_size = padding::calc(aux_block_data_size, 64);
        let aux_block_size = aux_block_data_size
            .checked_add(aux_block_padding_size)
            .ok_or(Error::IntegerTooLarge("auxiliary_data_block_size"))?;

        writer.write_all(&HEADER_MAGIC)?;
        writer.write_u32::<BigEndian>(self.required_libavb_version_major)?;
        writer.write_u32::<BigEndian>(self.required_libavb_version_minor)?;
        writer.write_u64::<BigEndian>(auth_block_size)?;
        writer.write_u64::<BigEndian>(aux_block_size)?;
        writer.write_u32::<BigEndian>(self.algorithm_type.to_raw())?;
        writer.write_u64::<BigEndian>(hash_offset)?;
        writer.write_u64::<BigEndian>(hash_size)?;
        writer.write_u64::<BigEndian>(signature_offset)?;
        writer.write_u64::<BigEndian>(signature_size)?;
        writer.write_u64::<BigEndian>(public_key_offset)?;
        writer.write_u64::<BigEndian>(public_key_size)?;
        writer.write_u64::<BigEndian>(public_key_metadata_offset)?;
        writer.write_u64::<BigEndian>(public_key_metadata_size)?;
        writer.write_u64::<BigEndian>(descriptors_offset)?;
        writer.write_u64::<BigEndian>(descriptors_size)?;
        writer.write_u64::<BigEndian>(self.rollback_index)?;
        writer.write_u32::<BigEndian>(self.flags)?;
        writer.write_u32::<BigEndian>(self.rollback_index_location)?;

        writer
            .write_string_padded(&self.release_string, 48)
            .map_err(|e| Error::WriteFieldError("release_string", e))?;

        writer.write_all(&self.reserved)?;

        // Auth block.
        if !skip_auth_block {
            writer.write_all(&self.hash)?;
            writer.write_all(&self.signature)?;
            writer.write_zeros_exact(auth_block_padding_size)?;
        }

        // Aux block.
        writer.write_all(&descriptors_raw)?;
        writer.write_all(&self.public_key)?;
        writer.write_all(&self.public_key_metadata)?;
        writer.write_zeros_exact(aux_block_padding_size)?;

        Ok(())
    }

    /// Serialize the signed portion of the image: the fixed header followed
    /// by the auxiliary block, with the authentication block omitted.
    fn signed_data(&self) -> Result<Vec<u8>> {
        let mut writer = Cursor::new(Vec::new());
        self.to_writer_internal(&mut writer, true)?;

        Ok(writer.into_inner())
    }

    pub fn sign(&mut self, key: &RsaPrivateKey) -> Result<()> {
        let key_raw = encode_public_key(&key.to_public_key())?;

        // RustCrypto does not support 8192-bit keys.
        match self.algorithm_type {
            AlgorithmType::Sha256Rsa8192
            | AlgorithmType::Sha512Rsa8192
            | AlgorithmType::Unknown(_) => {
                return Err(Error::UnsupportedAlgorithm(self.algorithm_type));
            }
            _ => {}
        }

        if key_raw.len() != self.algorithm_type.public_key_len() {
            return Err(Error::IncorrectKeySize {
                key_size: key_raw.len(),
                algo: self.algorithm_type,
            });
        }

        // The public key and the sizes of the hash and signature are included
        // in the data that's about to be signed.
        self.public_key = key_raw;
        self.hash.resize(self.algorithm_type.hash_len(), 0);
        self.signature
            .resize(self.algorithm_type.signature_len(), 0);

        let without_auth = self.signed_data()?;

        let hash = self.algorithm_type.hash(&without_auth);
        let signature = self.algorithm_type.sign(key, &hash)?;

        self.hash = hash;
        self.signature = signature;

        Ok(())
    }

    /// Verify the header's digest and signature against the embedded public
    /// key and return the public key. If the header is not signed, then
    /// `None` is returned. Whether the embedded key is *trusted* is a
    /// separate question the caller must answer.
    pub fn verify(&self) -> Result<Option<RsaPublicKey>> {
        // RustCrypto does not support 8192-bit keys.
        match self.algorithm_type {
            AlgorithmType::None => return Ok(None),
            a @ AlgorithmType::Sha256Rsa8192
            | a @ AlgorithmType::Sha512Rsa8192
            | a @ AlgorithmType::Unknown(_) => return Err(Error::UnsupportedAlgorithm(a)),
            _ => {}
        }

        // Reconstruct the public key.
        let public_key = decode_public_key(&self.public_key)?;

        let without_auth = self.signed_data()?;
        let hash = self.algorithm_type.hash(&without_auth);

        // The stored digest in the authentication block must match the
        // computed digest even though the signature alone would suffice.
        if self.hash != hash {
            return Err(Error::MismatchedStoredDigest {
                stored: hex::encode(&self.hash),
                computed: hex::encode(&hash),
            });
        }

        self.algorithm_type
            .verify(&public_key, &hash, &self.signature)?;

        Ok(Some(public_key))
    }
}

impl<R: Read> FromReader<R> for Header {
    type Error = Error;

    fn from_reader(mut reader: R) -> Result<Self> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;

        if magic != HEADER_MAGIC {
            return Err(Error::InvalidHeaderMagic(magic));
        }

        let required_libavb_version_major = reader.read_u32::<BigEndian>()?;
        let required_libavb_version_minor = reader.read_u32::<BigEndian>()?;

        if required_libavb_version_major != VERSION_MAJOR
            || required_libavb_version_minor > VERSION_MINOR
        {
            return Err(Error::UnsupportedVbmetaVersion {
                major: required_libavb_version_major,
                minor: required_libavb_version_minor,
            });
        }

        let authentication_data_block_size = reader
            .read_u64::<BigEndian>()?
            .to_usize()
            .ok_or(Error::IntegerTooLarge("authentication_data_block_size"))?;
        let auxiliary_data_block_size = reader
            .read_u64::<BigEndian>()?
            .to_usize()
            .ok_or(Error::IntegerTooLarge("auxiliary_data_block_size"))?;

        let algorithm_type_raw = reader.read_u32::<BigEndian>()?;
        let algorithm_type = AlgorithmType::from_raw(algorithm_type_raw);

        let hash_offset = reader
            .read_u64::<BigEndian>()?
            .to_usize()
            .ok_or(Error::IntegerTooLarge("hash_offset"))?;
        let hash_size = reader
            .read_u64::<BigEndian>()?
            .to_usize()
            .ok_or(Error::IntegerTooLarge("hash_size"))?;
        let signature_offset = reader
            .read_u64::<BigEndian>()?
            .to_usize()
            .ok_or(Error::IntegerTooLarge("signature_offset"))?;
        let signature_size = reader
            .read_u64::<BigEndian>()?
            .to_usize()
            .ok_or(Error::IntegerTooLarge("signature_size"))?;

        let auth_block_combined = hash_size + signature_size;
        let auth_block_padding = padding::calc(auth_block_combined, 64);
        if authentication_data_block_size != auth_block_combined + auth_block_padding {
            return Err(Error::IncorrectCombinedSize(
                "authentication_data_block_size",
            ));
        }

        let public_key_offset = reader
            .read_u64::<BigEndian>()?
            .to_usize()
            .ok_or(Error::IntegerTooLarge("public_key_offset"))?;
        let public_key_size = reader
            .read_u64::<BigEndian>()?
            .to_usize()
            .ok_or(Error::IntegerTooLarge("public_key_size"))?;
        let public_key_metadata_offset = reader
            .read_u64::<BigEndian>()?
            .to_usize()
            .ok_or(Error::IntegerTooLarge("public_key_metadata_offset"))?;
        let public_key_metadata_size = reader
            .read_u64::<BigEndian>()?
            .to_usize()
            .ok_or(Error::IntegerTooLarge("public_key_metadata_size"))?;
        let descriptors_offset = reader
            .read_u64::<BigEndian>()?
            .to_usize()
            .ok_or(Error::IntegerTooLarge("descriptors_offset"))?;
        let descriptors_size = reader
            .read_u64::<BigEndian>()?
            .to_usize()
            .ok_or(Error::IntegerTooLarge("descriptors_size"))?;

        let aux_block_combined = public_key_size + public_key_metadata_size + descriptors_size;
        let aux_block_padding = padding::calc(aux_block_combined, 64);
        if auxiliary_data_block_size != aux_block_combined + aux_block_padding {
            return Err(Error::IncorrectCombinedSize("auxiliary_data_block_size"));
        }

        let rollback_index = reader.read_u64::<BigEndian>()?;
        let flags = reader.read_u32::<BigEndian>()?;
        let rollback_index_location = reader.read_u32::<BigEndian>()?;

        let release_string = reader
            .read_string_padded(48)
            .map_err(|e| Error::ReadFieldError("release_string", e))?;

        let reserved = reader.read_array_exact::<80>()?;

        let auth_block = reader.read_vec_exact(authentication_data_block_size)?;
        let aux_block = reader.read_vec_exact(auxiliary_data_block_size)?;

        // When we verify() the signatures, we're doing so on re-serialized
        // fields. The padding is the only thing that can escape this, so make
        // sure they don't contain any data.
        if !util::is_zero(
            &auth_block[auth_block_combined..auth_block_combined + auth_block_padding],
        ) {
            return Err(Error::PaddingNotZero("authentication_data_block"));
        }
        if !util::is_zero(&aux_block[aux_block_combined..aux_block_combined + aux_block_padding]) {
            return Err(Error::PaddingNotZero("auxiliary_data_block"));
        }

        // Auth block data.

        if hash_offset
            .checked_add(hash_size)
            .is_none_or(|s| s > auth_block.len())
        {
            return Err(Error::IntegerTooLarge("hash_offset + hash_size"));
        }
        let hash = &auth_block[hash_offset..hash_offset + hash_size];

        if signature_offset
            .checked_add(signature_size)
            .is_none_or(|s| s > auth_block.len())
        {
            return Err(Error::IntegerTooLarge("signature_offset + signature_size"));
        }
        let signature = &auth_block[signature_offset..signature_offset + signature_size];

        // Aux block data.

        if public_key_offset
            .checked_add(public_key_size)
            .is_none_or(|s| s > aux_block.len())
        {
            return Err(Error::IntegerTooLarge(
                "public_key_offset + public_key_size",
            ));
        }
        let public_key = &aux_block[public_key_offset..public_key_offset + public_key_size];

        if public_key_metadata_offset
            .checked_add(public_key_metadata_size)
            .is_none_or(|s| s > aux_block.len())
        {
            return Err(Error::IntegerTooLarge(
                "public_key_metadata_offset + public_key_metadata_size",
            ));
        }
        let public_key_metadata = &aux_block
            [public_key_metadata_offset..public_key_metadata_offset + public_key_metadata_size];

        // Descriptors must stay within their declared region. Overruns into
        // the rest of the aux block are not tolerated.
        if descriptors_offset
            .checked_add(descriptors_size)
            .is_none_or(|s| s > aux_block.len())
        {
            return Err(Error::IntegerTooLarge(
                "descriptors_offset + descriptors_size",
            ));
        }
        let descriptor_region =
            &aux_block[descriptors_offset..descriptors_offset + descriptors_size];

        let descriptors =
            DescriptorIter::new(descriptor_region).collect::<Result<Vec<Descriptor>>>()?;

        let header = Self {
            required_libavb_version_major,
            required_libavb_version_minor,
            algorithm_type,
            hash: hash.to_owned(),
            signature: signature.to_owned(),
            public_key: public_key.to_owned(),
            public_key_metadata: public_key_metadata.to_owned(),
            descriptors,
            rollback_index,
            flags,
            rollback_index_location,
            release_string,
            reserved,
        };

        Ok(header)
    }
}

impl<W: Write> ToWriter<W> for Header {
    type Error = Error;

    fn to_writer(&self, writer: W) -> Result<()> {
        self.to_writer_internal(writer, false)
    }
}

#[derive(Clone, Eq, PartialEq)]
pub struct Footer {
    pub version_major: u32,
    pub version_minor: u32,
    pub original_image_size: u64,
    pub vbmeta_offset: u64,
    pub vbmeta_size: u64,
    pub reserved: [u8; 28],
}

impl fmt::Debug for Footer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Footer")
            .field("version_major", &self.version_major)
            .field("version_minor", &self.version_minor)
            .field("original_image_size", &self.original_image_size)
            .field("vbmeta_offset", &self.vbmeta_offset)
            .field("vbmeta_size", &self.vbmeta_size)
            .field("reserved", &hex::encode(self.reserved))
            .finish()
    }
}

impl Footer {
    pub const SIZE: usize = 64;
}

impl<R: Read> FromReader<R> for Footer {
    type Error = Error;

    fn from_reader(mut reader: R) -> Result<Self> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;

        if magic != FOOTER_MAGIC {
            return Err(Error::InvalidFooterMagic(magic));
        }

        let version_major = reader.read_u32::<BigEndian>()?;
        let version_minor = reader.read_u32::<BigEndian>()?;
        let original_image_size = reader.read_u64::<BigEndian>()?;
        let vbmeta_offset = reader.read_u64::<BigEndian>()?;
        let vbmeta_size = reader.read_u64::<BigEndian>()?;

        let reserved = reader.read_array_exact::<28>()?;

        let footer = Self {
            version_major,
            version_minor,
            original_image_size,
            vbmeta_offset,
            vbmeta_size,
            reserved,
        };

        Ok(footer)
    }
}

impl<W: Write> ToWriter<W> for Footer {
    type Error = Error;

    fn to_writer(&self, mut writer: W) -> Result<()> {
        writer.write_all(&FOOTER_MAGIC)?;
        writer.write_u32::<BigEndian>(self.version_major)?;
        writer.write_u32::<BigEndian>(self.version_minor)?;
        writer.write_u64::<BigEndian>(self.original_image_size)?;
        writer.write_u64::<BigEndian>(self.vbmeta_offset)?;
        writer.write_u64::<BigEndian>(self.vbmeta_size)?;
        writer.write_all(&self.reserved)?;
        Ok(())
    }
}

/// Encode a public key in the AVB binary format:
/// `[key_num_bits: u32][n0inv: u32][n][rr]` with `n` and `rr` stored as
/// big-endian byte strings of `key_num_bits / 8` bytes each.
pub fn encode_public_key(key: &RsaPublicKey) -> Result<Vec<u8>> {
    if key.e() != &BigUint::from(65537u32) {
        return Err(Error::UnsupportedRsaPublicExponent(key.e().clone()));
    }

    // The verifier expects certain values to be precomputed so that the
    // bootloader's Montgomery-form exponentiation can run faster.
    //
    // Values:
    //   n0inv = -1 / n[0] (mod 2 ^ 32)
    //     - Guaranteed to fit in a u32
    //   r = 2 ^ (key size in bits)
    //   rr = r^2 (mod N)
    //     - Guaranteed to fit in key size bits
    let b = BigUint::from(2u64.pow(32));
    let n0inv = b.to_bigint().unwrap() - key.n().mod_inverse(&b).unwrap();
    let r = BigUint::from(2u32).pow(key.n().bits());
    let rrmodn = r.modpow(&BigUint::from(2u32), key.n());

    let key_bits = (key.size() * 8).to_u32().unwrap();

    let mut data = vec![];
    data.extend_from_slice(&key_bits.to_be_bytes());
    data.extend_from_slice(&n0inv.to_u32().unwrap().to_be_bytes());

    let modulus_raw = key.n().to_bytes_be();
    data.resize(data.len() + key.size() - modulus_raw.len(), 0);
    data.extend_from_slice(&modulus_raw);

    let rrmodn_raw = rrmodn.to_bytes_be();
    data.resize(data.len() + key.size() - rrmodn_raw.len(), 0);
    data.extend_from_slice(&rrmodn_raw);

    Ok(data)
}

/// Decode a public key from the AVB binary format. The `n0inv` and `rr`
/// fields are precomputation artifacts and do not need to be read back.
pub fn decode_public_key(data: &[u8]) -> Result<RsaPublicKey> {
    let mut reader = Cursor::new(data);
    let key_bits = reader
        .read_u32::<BigEndian>()?
        .to_usize()
        .ok_or(Error::IntegerTooLarge("key_bits"))?;

    // Skip n0inv.
    reader.read_u32::<BigEndian>()?;

    let modulus_raw = reader.read_vec_exact(key_bits / 8)?;

    let modulus = BigUint::from_bytes_be(&modulus_raw);
    let public_key =
        RsaPublicKey::new(modulus, BigUint::from(65537u32)).map_err(Error::RsaVerify)?;

    Ok(public_key)
}

/// Load the vbmeta header and footer from the specified reader. A footer is
/// present only if the file is not a vbmeta partition image (ie. the header
/// follows actual data).
pub fn load_image(mut reader: impl Read + Seek) -> Result<(Header, Option<Footer>, u64)> {
    let image_size = reader.seek(SeekFrom::End(0))?;

    reader.seek(SeekFrom::End(-(Footer::SIZE as i64)))?;

    let footer = match Footer::from_reader(&mut reader) {
        Ok(f) => Some(f),
        Err(e @ Error::Io(_)) => return Err(e),
        Err(_) => None,
    };

    let vbmeta_offset = footer.as_ref().map_or(0, |f| f.vbmeta_offset);

    reader.seek(SeekFrom::Start(vbmeta_offset))?;
    let header = Header::from_reader(&mut reader)?;

    Ok((header, footer, image_size))
}

/// Write a vbmeta header to the specified writer. If a footer is specified, it
/// will be used as the basis of the newly written footer, with the original
/// image size, vbmeta header offset, and vbmeta header size fields updated
/// appropriately.
///
/// The writer must not have an existing vbmeta header or footer.
fn write_image_internal(
    mut writer: impl Write + Seek,
    header: &Header,
    footer: Option<&Footer>,
    image_size: Option<u64>,
    block_size: u64,
) -> Result<()> {
    let original_image_size = writer.seek(SeekFrom::End(0))?;

    // The header must be block-aligned.
    let vbmeta_offset = if block_size > 0 {
        let padding_size = padding::write_zeros(&mut writer, block_size)?;
        original_image_size
            .checked_add(padding_size)
            .ok_or(Error::IntegerTooLarge("vbmeta_offset"))?
    } else {
        original_image_size
    };

    header.to_writer(&mut writer)?;
    let vbmeta_end = writer.stream_position()?;

    if let Some(s) = image_size {
        let footer_space = if footer.is_some() {
            cmp::max(block_size, Footer::SIZE as u64)
        } else {
            0
        };

        if s < footer_space || vbmeta_end > s - footer_space {
            return Err(Error::ImageSizeTooSmall(s));
        }
    }

    if block_size > 0 {
        padding::write_zeros(&mut writer, block_size)?;
    }

    if let Some(f) = footer {
        let footer_offset = image_size.unwrap() - Footer::SIZE as u64;
        writer.seek(SeekFrom::Start(footer_offset))?;

        let mut new_footer = f.clone();
        new_footer.original_image_size = original_image_size;
        new_footer.vbmeta_offset = vbmeta_offset;
        new_footer.vbmeta_size = vbmeta_end - vbmeta_offset;

        new_footer.to_writer(&mut writer)?;
    }

    Ok(())
}

/// Write a vbmeta header to the specified writer. This is meant for writing
/// vbmeta partition images, not appended vbmeta images. The writer must refer
/// to an empty file.
pub fn write_root_image(writer: impl Write + Seek, header: &Header, block_size: u64) -> Result<()> {
    write_image_internal(writer, header, None, None, block_size)
}

/// Write a vbmeta header and footer to the specified writer. This is meant for
/// appending vbmeta data to existing partition data, not writing vbmeta images.
pub fn write_appended_image(
    writer: impl Write + Seek,
    header: &Header,
    footer: &Footer,
    image_size: u64,
) -> Result<()> {
    // avbtool hardcodes a 4096 block size for appended non-sparse images.
    write_image_internal(writer, header, Some(footer), Some(image_size), 4096)
}

#[cfg(test)]
mod tests {
    use std::{io::Cursor, sync::OnceLock};

    use assert_matches::assert_matches;
    use rsa::RsaPrivateKey;

    use super::{
        AlgorithmType, ChainPartitionDescriptor, Descriptor, DescriptorIter, Error, Footer,
        HashDescriptor, HashTreeDescriptor, Header, KernelCmdlineDescriptor, PropertyDescriptor,
    };
    use crate::stream::{FromReader, ToWriter};

    fn round_trip_descriptor(descriptor: &Descriptor) {
        let mut writer = Cursor::new(Vec::new());
        descriptor.to_writer(&mut writer).unwrap();
        let raw = writer.into_inner();

        assert_eq!(raw.len() % 8, 0, "Record length is not 8-byte aligned");

        let new_descriptor = Descriptor::from_reader(Cursor::new(&raw)).unwrap();
        assert_eq!(descriptor, &new_descriptor);

        let mut writer = Cursor::new(Vec::new());
        new_descriptor.to_writer(&mut writer).unwrap();
        assert_eq!(raw, writer.into_inner());
    }

    fn test_descriptors() -> Vec<Descriptor> {
        vec![
            Descriptor::Property(PropertyDescriptor {
                key: "com.android.build.boot.os_version".to_owned(),
                value: b"14".to_vec(),
            }),
            Descriptor::HashTree(HashTreeDescriptor {
                dm_verity_version: 1,
                image_size: 40960,
                tree_offset: 40960,
                tree_size: 4096,
                data_block_size: 4096,
                hash_block_size: 4096,
                fec_num_roots: 2,
                fec_offset: 45056,
                fec_size: 8192,
                hash_algorithm: "sha256".to_owned(),
                partition_name: "system".to_owned(),
                salt: vec![0xaa; 32],
                root_digest: vec![0xbb; 32],
                flags: 0,
                reserved: [0u8; 60],
            }),
            Descriptor::Hash(HashDescriptor {
                image_size: 8192,
                hash_algorithm: "sha256".to_owned(),
                partition_name: "boot".to_owned(),
                salt: vec![0x01, 0x02, 0x03, 0x04],
                root_digest: vec![0xcc; 32],
                flags: 0,
                reserved: [0u8; 60],
            }),
            Descriptor::KernelCmdline(KernelCmdlineDescriptor {
                flags: KernelCmdlineDescriptor::FLAG_USE_ONLY_IF_HASHTREE_NOT_DISABLED,
                cmdline: "dm=\"1 vroot none ro 1,0 80 verity\"".to_owned(),
            }),
            Descriptor::ChainPartition(ChainPartitionDescriptor {
                rollback_index_location: 1,
                partition_name: "vbmeta_system".to_owned(),
                public_key: vec![0xdd; 520],
                flags: 0,
                reserved: [0u8; 60],
            }),
            Descriptor::Unknown(0x1234, vec![0xee; 40]),
        ]
    }

    fn test_header() -> Header {
        Header {
            required_libavb_version_major: 1,
            required_libavb_version_minor: 0,
            algorithm_type: AlgorithmType::Sha256Rsa2048,
            hash: vec![],
            signature: vec![],
            public_key: vec![],
            public_key_metadata: vec![],
            descriptors: test_descriptors(),
            rollback_index: 3,
            flags: 0,
            rollback_index_location: 0,
            release_string: "avbtool 1.3.0".to_owned(),
            reserved: [0u8; 80],
        }
    }

    fn test_key() -> &'static RsaPrivateKey {
        static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();

        KEY.get_or_init(|| {
            let mut rng = rand::thread_rng();

            RsaPrivateKey::new(&mut rng, 2048).unwrap()
        })
    }

    #[test]
    fn round_trip_descriptors() {
        for descriptor in test_descriptors() {
            round_trip_descriptor(&descriptor);
        }
    }

    #[test]
    fn descriptor_iter_restartable() {
        let mut writer = Cursor::new(Vec::new());
        for descriptor in test_descriptors() {
            descriptor.to_writer(&mut writer).unwrap();
        }
        let region = writer.into_inner();

        let first = DescriptorIter::new(&region)
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        let second = DescriptorIter::new(&region)
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        assert_eq!(first, test_descriptors());
        assert_eq!(first, second);
    }

    #[test]
    fn descriptor_region_overrun() {
        let descriptor = Descriptor::Hash(HashDescriptor {
            image_size: 16384,
            hash_algorithm: "sha256".to_owned(),
            partition_name: "boot".to_owned(),
            salt: vec![],
            root_digest: vec![0x11; 32],
            flags: 0,
            reserved: [0u8; 60],
        });

        let mut writer = Cursor::new(Vec::new());
        descriptor.to_writer(&mut writer).unwrap();
        let raw = writer.into_inner();

        // Truncating the region makes the record overrun it.
        let result = DescriptorIter::new(&raw[..raw.len() - 8]).collect::<Result<Vec<_>, _>>();
        assert_matches!(result, Err(Error::ReadFieldError(_, _) | Error::Io(_)));
    }

    #[test]
    fn partition_name_cap() {
        let descriptor = Descriptor::Hash(HashDescriptor {
            image_size: 0,
            hash_algorithm: "sha256".to_owned(),
            partition_name: "x".repeat(33),
            salt: vec![],
            root_digest: vec![],
            flags: 0,
            reserved: [0u8; 60],
        });

        let mut writer = Cursor::new(Vec::new());
        descriptor.to_writer(&mut writer).unwrap();

        let result = Descriptor::from_reader(Cursor::new(writer.get_ref()));
        assert_matches!(result, Err(Error::StringTooLong("partition_name", _)));
    }

    #[test]
    fn round_trip_header() {
        let mut header = test_header();
        let key = test_key();
        header.sign(&key).unwrap();

        let mut writer = Cursor::new(Vec::new());
        header.to_writer(&mut writer).unwrap();
        writer.set_position(0);

        let new_header = Header::from_reader(&mut writer).unwrap();
        assert_eq!(header, new_header);

        new_header.verify().unwrap().unwrap();
    }

    #[test]
    fn unsigned_header_verifies_as_none() {
        let mut header = test_header();
        header.algorithm_type = AlgorithmType::None;

        assert_matches!(header.verify(), Ok(None));
    }

    #[test]
    fn unsupported_version_rejected() {
        let mut header = test_header();
        header.required_libavb_version_major = 2;

        let mut writer = Cursor::new(Vec::new());
        header.to_writer(&mut writer).unwrap();
        writer.set_position(0);

        assert_matches!(
            Header::from_reader(&mut writer),
            Err(Error::UnsupportedVbmetaVersion { major: 2, minor: 0 })
        );
    }

    #[test]
    fn signed_region_tampering_detected() {
        let mut header = test_header();
        let key = test_key();
        header.sign(&key).unwrap();

        // Mutating any re-serialized field in the signed region must break
        // verification.
        let mut modified = header.clone();
        modified.rollback_index += 1;
        assert_matches!(
            modified.verify(),
            Err(Error::MismatchedStoredDigest { .. })
        );

        // Mutating the stored digest must break verification even though the
        // signature check alone would not notice.
        let mut modified = header.clone();
        modified.hash[0] ^= 0x01;
        assert_matches!(
            modified.verify(),
            Err(Error::MismatchedStoredDigest { .. })
        );

        // Mutating the signature must break verification.
        let mut modified = header.clone();
        modified.signature[0] ^= 0x01;
        assert_matches!(modified.verify(), Err(Error::RsaVerify(_)));
    }

    #[test]
    fn round_trip_footer() {
        let footer = Footer {
            version_major: 1,
            version_minor: 0,
            original_image_size: 8192,
            vbmeta_offset: 8192,
            vbmeta_size: 2112,
            reserved: [0u8; 28],
        };

        let mut writer = Cursor::new(Vec::new());
        footer.to_writer(&mut writer).unwrap();
        assert_eq!(writer.get_ref().len(), Footer::SIZE);

        writer.set_position(0);
        let new_footer = Footer::from_reader(&mut writer).unwrap();
        assert_eq!(footer, new_footer);
    }

    #[test]
    fn public_key_round_trip() {
        let key = test_key();
        let encoded = super::encode_public_key(&key.to_public_key()).unwrap();

        assert_eq!(encoded.len(), AlgorithmType::Sha256Rsa2048.public_key_len());

        let decoded = super::decode_public_key(&encoded).unwrap();
        assert_eq!(decoded, key.to_public_key());

        let reencoded = super::encode_public_key(&decoded).unwrap();
        assert_eq!(encoded, reencoded);
    }
}
