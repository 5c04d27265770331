// SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Crypto primitives used by the verification core.
//!
//! RSA signature checks live in [`crate::format::avb`] next to the
//! pre-encoded public key codec. This module covers the digest algorithms
//! named by descriptors and the Curve25519 operations used for transparency
//! log signatures. The Ed25519/X25519 implementations are delegated to the
//! dalek crates, which keep all secret-dependent operations constant-time.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use ring::digest::{self, Algorithm, Context};
use thiserror::Error;

pub const SHA256_DIGEST_SIZE: usize = 32;
pub const SHA512_DIGEST_SIZE: usize = 64;

pub const ED25519_SEED_SIZE: usize = 32;
pub const ED25519_PUBLIC_KEY_SIZE: usize = 32;
pub const ED25519_SIGNATURE_SIZE: usize = 64;

pub const X25519_KEY_SIZE: usize = 32;

/// The X25519 basepoint (u = 9).
pub use x25519_dalek::X25519_BASEPOINT_BYTES;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Hashing algorithm not supported: {0:?}")]
    UnsupportedHashAlgorithm(String),
    #[error("Invalid Ed25519 public key")]
    InvalidEd25519PublicKey(#[source] ed25519_dalek::SignatureError),
    #[error("Failed to verify Ed25519 signature")]
    Ed25519Verify(#[source] ed25519_dalek::SignatureError),
}

type Result<T> = std::result::Result<T, Error>;

/// Digest algorithms that hash and hashtree descriptors can name.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DigestAlgorithm {
    Sha256,
    Sha512,
}

impl DigestAlgorithm {
    /// Look up an algorithm by the name carried in a descriptor.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "sha256" => Ok(Self::Sha256),
            "sha512" => Ok(Self::Sha512),
            n => Err(Error::UnsupportedHashAlgorithm(n.to_owned())),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }

    pub fn digest_size(self) -> usize {
        match self {
            Self::Sha256 => SHA256_DIGEST_SIZE,
            Self::Sha512 => SHA512_DIGEST_SIZE,
        }
    }

    pub fn ring_algorithm(self) -> &'static Algorithm {
        match self {
            Self::Sha256 => &digest::SHA256,
            Self::Sha512 => &digest::SHA512,
        }
    }

    /// Start a streaming digest context.
    pub fn context(self) -> Context {
        Context::new(self.ring_algorithm())
    }

    /// One-shot digest.
    pub fn hash(self, data: &[u8]) -> Vec<u8> {
        digest::digest(self.ring_algorithm(), data).as_ref().to_vec()
    }
}

/// Derive the Ed25519 public key for a 32-byte seed.
pub fn ed25519_public_key(seed: &[u8; ED25519_SEED_SIZE]) -> [u8; ED25519_PUBLIC_KEY_SIZE] {
    SigningKey::from_bytes(seed).verifying_key().to_bytes()
}

/// Produce a deterministic RFC 8032 Ed25519 signature.
pub fn ed25519_sign(
    seed: &[u8; ED25519_SEED_SIZE],
    message: &[u8],
) -> [u8; ED25519_SIGNATURE_SIZE] {
    SigningKey::from_bytes(seed).sign(message).to_bytes()
}

/// Verify an Ed25519 signature. This is a vartime operation; all inputs are
/// public.
pub fn ed25519_verify(
    public_key: &[u8; ED25519_PUBLIC_KEY_SIZE],
    message: &[u8],
    signature: &[u8; ED25519_SIGNATURE_SIZE],
) -> Result<()> {
    let key = VerifyingKey::from_bytes(public_key).map_err(Error::InvalidEd25519PublicKey)?;
    let signature = Signature::from_bytes(signature);

    key.verify(message, &signature).map_err(Error::Ed25519Verify)
}

/// X25519 scalar multiplication over 255 bits via the Montgomery ladder.
pub fn x25519(scalar: [u8; X25519_KEY_SIZE], point: [u8; X25519_KEY_SIZE]) -> [u8; X25519_KEY_SIZE] {
    x25519_dalek::x25519(scalar, point)
}
