// SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Verified-boot trust-root library.
//!
//! Given a root-of-trust public key and a signed top-level vbmeta image, this
//! crate decides whether a set of partition images may boot and derives the
//! state that follows from that decision: rollback index intents, the
//! verified-boot state color, and the kernel command line. All device access
//! goes through the [`ops::Ops`] capability trait; the crate itself performs
//! no I/O and holds no global state.
//!
//! The main entry point is [`verify::slot_verify`]. The on-wire codecs in
//! [`format`] and the transparency-log verifier in [`format::aftl`] are also
//! usable on their own, eg. by host-side image tooling.

pub mod cmdline;
pub mod crypto;
pub mod format;
pub mod ops;
pub mod stream;
pub mod util;
pub mod verify;
