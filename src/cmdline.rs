// SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Kernel command line synthesis.
//!
//! The verification result carries a cmdline with three kinds of content:
//! `androidboot.vbmeta.*` facts about the verification itself, a dm-verity
//! table generated from each hashtree descriptor, and the raw fragments from
//! kernel-cmdline descriptors. Hashtree descriptors are never verified at
//! boot; translating them here and handing the table to the kernel is the
//! core's entire responsibility for them.

use crate::{
    crypto::DigestAlgorithm,
    format::avb::{self, HashTreeDescriptor, KernelCmdlineDescriptor},
    ops::{IoResult, Ops},
};

/// Substitution variables accepted in kernel-cmdline descriptors. Each
/// expands to the GUID of the named partition with the slot suffix applied.
const PARTUUID_VARIABLES: &[(&str, &str)] = &[
    ("$(ANDROID_SYSTEM_PARTUUID)", "system"),
    ("$(ANDROID_BOOT_PARTUUID)", "boot"),
    ("$(ANDROID_VBMETA_PARTUUID)", "vbmeta"),
];

/// Replace `$(ANDROID_*_PARTUUID)` references with the partition GUIDs
/// reported by the ops layer.
pub fn substitute_partuuids(
    ops: &mut dyn Ops,
    cmdline: &str,
    ab_suffix: &str,
) -> IoResult<String> {
    let mut result = cmdline.to_owned();

    for (variable, partition) in PARTUUID_VARIABLES {
        if !result.contains(variable) {
            continue;
        }

        let name = format!("{partition}{ab_suffix}");
        let guid = ops.get_unique_guid_for_partition(&name)?;

        result = result.replace(variable, &guid);
    }

    Ok(result)
}

/// Facts about the verification, prepended to the cmdline.
pub fn vbmeta_params(
    unlocked: bool,
    algorithm: DigestAlgorithm,
    total_size: u64,
    digest: &[u8],
) -> String {
    format!(
        "androidboot.vbmeta.device_state={} \
         androidboot.vbmeta.avb_version={}.{} \
         androidboot.vbmeta.hash_alg={} \
         androidboot.vbmeta.size={} \
         androidboot.vbmeta.digest={}",
        if unlocked { "unlocked" } else { "locked" },
        avb::VERSION_MAJOR,
        avb::VERSION_MINOR,
        algorithm.name(),
        total_size,
        hex::encode(digest),
    )
}

/// Whether a kernel-cmdline descriptor applies given the hashtree state.
pub fn cmdline_descriptor_applies(
    descriptor: &KernelCmdlineDescriptor,
    hashtree_disabled: bool,
) -> bool {
    if descriptor.flags & KernelCmdlineDescriptor::FLAG_USE_ONLY_IF_HASHTREE_NOT_DISABLED != 0
        && hashtree_disabled
    {
        return false;
    }

    if descriptor.flags & KernelCmdlineDescriptor::FLAG_USE_ONLY_IF_HASHTREE_DISABLED != 0
        && !hashtree_disabled
    {
        return false;
    }

    true
}

/// Translate a hashtree descriptor into a dm-verity table for the kernel.
/// The partition holding the data also holds the hash tree and FEC data, so
/// the same `by-partuuid` device backs all three roles.
pub fn hashtree_cmdline(
    ops: &mut dyn Ops,
    descriptor: &HashTreeDescriptor,
    ab_suffix: &str,
) -> IoResult<String> {
    let partition = if descriptor.flags & HashTreeDescriptor::FLAG_DO_NOT_USE_AB != 0 {
        descriptor.partition_name.clone()
    } else {
        format!("{}{ab_suffix}", descriptor.partition_name)
    };

    let guid = ops.get_unique_guid_for_partition(&partition)?;
    let device = format!("PARTUUID={guid}");

    let num_sectors = descriptor.image_size / 512;
    let num_data_blocks = descriptor.image_size / u64::from(descriptor.data_block_size);
    let hash_start_block = descriptor.tree_offset / u64::from(descriptor.hash_block_size);

    let salt = if descriptor.salt.is_empty() {
        "-".to_owned()
    } else {
        hex::encode(&descriptor.salt)
    };

    let optional_args = if descriptor.fec_size > 0 {
        let fec_blocks = descriptor.fec_offset / u64::from(descriptor.data_block_size);

        format!(
            "10 restart_on_corruption ignore_zero_blocks use_fec_from_device {device} \
             fec_roots {} fec_blocks {fec_blocks} fec_start {fec_blocks}",
            descriptor.fec_num_roots,
        )
    } else {
        "2 restart_on_corruption ignore_zero_blocks".to_owned()
    };

    let table = format!(
        "1 vroot none ro 1,0 {num_sectors} verity {} {device} {device} {} {} \
         {num_data_blocks} {hash_start_block} {} {} {salt} {optional_args}",
        descriptor.dm_verity_version,
        descriptor.data_block_size,
        descriptor.hash_block_size,
        descriptor.hash_algorithm,
        hex::encode(&descriptor.root_digest),
    );

    Ok(format!("dm=\"{table}\" root=/dev/dm-0"))
}
