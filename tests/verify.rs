// SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    collections::HashMap,
    io::Cursor,
    sync::OnceLock,
};

use assert_matches::assert_matches;
use rsa::RsaPrivateKey;
use sha2::{Digest, Sha256};

use avbverify::{
    format::avb::{
        self, AlgorithmType, ChainPartitionDescriptor, Descriptor, Footer, HashDescriptor,
        HashTreeDescriptor, Header, KernelCmdlineDescriptor,
    },
    ops::{IoError, IoResult, KeyValidity, Ops, PublicKeyStatus},
    stream::ToWriter,
    verify::{
        slot_verify, BootState, SlotVerifyError, VerificationStatus, FLAG_ALLOW_VERIFICATION_ERROR,
        FLAG_NO_VBMETA_PARTITION,
    },
};

/// In-memory ops implementation backed by hash maps.
#[derive(Default)]
struct TestOps {
    partitions: HashMap<String, Vec<u8>>,
    preloaded: HashMap<String, Vec<u8>>,
    rollback_indexes: HashMap<usize, u64>,
    unlocked: bool,
    trusted_keys: Vec<Vec<u8>>,
    trusted_user_keys: Vec<Vec<u8>>,
}

impl Ops for TestOps {
    fn read_from_partition(
        &mut self,
        partition: &str,
        offset: i64,
        buf: &mut [u8],
    ) -> IoResult<usize> {
        let data = self
            .partitions
            .get(partition)
            .ok_or(IoError::NoSuchPartition)?;

        let start = if offset < 0 {
            data.len()
                .checked_add_signed(offset as isize)
                .ok_or(IoError::RangeOutsidePartition)?
        } else {
            offset as usize
        };
        let end = start
            .checked_add(buf.len())
            .ok_or(IoError::RangeOutsidePartition)?;

        if end > data.len() {
            return Err(IoError::RangeOutsidePartition);
        }

        buf.copy_from_slice(&data[start..end]);

        Ok(buf.len())
    }

    fn get_preloaded_partition(&mut self, partition: &str) -> IoResult<Option<&[u8]>> {
        Ok(self.preloaded.get(partition).map(|d| d.as_slice()))
    }

    fn validate_vbmeta_public_key(
        &mut self,
        _partition: &str,
        public_key: &[u8],
        _public_key_metadata: &[u8],
    ) -> IoResult<PublicKeyStatus> {
        if self.trusted_keys.iter().any(|k| k == public_key) {
            Ok(PublicKeyStatus::trusted())
        } else if self.trusted_user_keys.iter().any(|k| k == public_key) {
            Ok(PublicKeyStatus {
                validity: KeyValidity::TrustedUserKey,
                rollback_index_location: None,
            })
        } else {
            Ok(PublicKeyStatus::untrusted())
        }
    }

    fn read_rollback_index(&mut self, location: usize) -> IoResult<u64> {
        Ok(self.rollback_indexes.get(&location).copied().unwrap_or(0))
    }

    fn write_rollback_index(&mut self, location: usize, value: u64) -> IoResult<()> {
        self.rollback_indexes.insert(location, value);
        Ok(())
    }

    fn read_is_device_unlocked(&mut self) -> IoResult<bool> {
        Ok(self.unlocked)
    }

    fn get_unique_guid_for_partition(&mut self, partition: &str) -> IoResult<String> {
        if !self.partitions.contains_key(partition) && !self.preloaded.contains_key(partition) {
            return Err(IoError::NoSuchPartition);
        }

        Ok(format!("00000000-0000-0000-0000-{partition:0>12}"))
    }

    fn get_size_of_partition(&mut self, partition: &str) -> IoResult<u64> {
        self.partitions
            .get(partition)
            .map(|d| d.len() as u64)
            .ok_or(IoError::NoSuchPartition)
    }
}

/// RSA keys are expensive to generate, so a fixed set is shared by all tests.
fn test_key(index: usize) -> &'static RsaPrivateKey {
    static KEYS: OnceLock<Vec<RsaPrivateKey>> = OnceLock::new();

    &KEYS.get_or_init(|| {
        let mut rng = rand::thread_rng();

        (0..3)
            .map(|_| RsaPrivateKey::new(&mut rng, 2048).unwrap())
            .collect()
    })[index]
}

fn encoded_public_key(key: &RsaPrivateKey) -> Vec<u8> {
    avb::encode_public_key(&key.to_public_key()).unwrap()
}

struct VbmetaConfig<'a> {
    descriptors: Vec<Descriptor>,
    rollback_index: u64,
    rollback_index_location: u32,
    flags: u32,
    key: Option<&'a RsaPrivateKey>,
}

impl Default for VbmetaConfig<'_> {
    fn default() -> Self {
        Self {
            descriptors: vec![],
            rollback_index: 0,
            rollback_index_location: 0,
            flags: 0,
            key: None,
        }
    }
}

fn make_vbmeta(config: VbmetaConfig) -> Vec<u8> {
    let mut header = Header {
        required_libavb_version_major: 1,
        required_libavb_version_minor: 0,
        algorithm_type: if config.key.is_some() {
            AlgorithmType::Sha256Rsa2048
        } else {
            AlgorithmType::None
        },
        hash: vec![],
        signature: vec![],
        public_key: vec![],
        public_key_metadata: vec![],
        descriptors: config.descriptors,
        rollback_index: config.rollback_index,
        flags: config.flags,
        rollback_index_location: config.rollback_index_location,
        release_string: "avbtool 1.3.0".to_owned(),
        reserved: [0u8; 80],
    };

    if let Some(key) = config.key {
        header.sign(key).unwrap();
    }

    let mut writer = Cursor::new(Vec::new());
    header.to_writer(&mut writer).unwrap();

    writer.into_inner()
}

fn hash_descriptor(partition: &str, data: &[u8], salt: &[u8]) -> HashDescriptor {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(data);

    HashDescriptor {
        image_size: data.len() as u64,
        hash_algorithm: "sha256".to_owned(),
        partition_name: partition.to_owned(),
        salt: salt.to_vec(),
        root_digest: hasher.finalize().to_vec(),
        flags: 0,
        reserved: [0u8; 60],
    }
}

fn chain_descriptor(partition: &str, location: u32, key: &RsaPrivateKey) -> ChainPartitionDescriptor {
    ChainPartitionDescriptor {
        rollback_index_location: location,
        partition_name: partition.to_owned(),
        public_key: encoded_public_key(key),
        flags: 0,
        reserved: [0u8; 60],
    }
}

/// Ops with a trusted device key, a `vbmeta` partition with one hash
/// descriptor for an 8 KiB `boot` partition.
fn simple_setup() -> TestOps {
    let boot_data = vec![0u8; 8192];
    let vbmeta = make_vbmeta(VbmetaConfig {
        descriptors: vec![Descriptor::Hash(hash_descriptor("boot", &boot_data, &[0xbb; 8]))],
        key: Some(test_key(0)),
        ..Default::default()
    });

    let mut ops = TestOps::default();
    ops.partitions.insert("vbmeta".to_owned(), vbmeta);
    ops.partitions.insert("boot".to_owned(), boot_data);
    ops.trusted_keys.push(encoded_public_key(test_key(0)));

    ops
}

#[test]
fn hash_partition_verifies_green() {
    let mut ops = simple_setup();

    let data = slot_verify(&mut ops, &["boot"], "", 0).unwrap();

    assert_eq!(data.status, VerificationStatus::FullyVerified);
    assert_eq!(data.boot_state, BootState::Green);
    assert!(data.errors.is_empty());
    assert!(data.cmdline.contains("androidboot.vbmeta.device_state=locked"));

    assert_eq!(data.vbmeta_images.len(), 1);
    assert_eq!(data.vbmeta_images[0].partition_name, "vbmeta");

    assert_eq!(data.loaded_partitions.len(), 1);
    assert_eq!(data.loaded_partitions[0].partition_name, "boot");
    assert_eq!(data.loaded_partitions[0].data, vec![0u8; 8192]);
}

#[test]
fn vbmeta_cmdline_reports_aggregate_digest() {
    let mut ops = simple_setup();

    let data = slot_verify(&mut ops, &["boot"], "", 0).unwrap();

    let mut hasher = Sha256::new();
    let mut total_size = 0;
    for image in &data.vbmeta_images {
        hasher.update(&image.data);
        total_size += image.data.len();
    }
    let digest = hex::encode(hasher.finalize());

    assert!(data.cmdline.contains("androidboot.vbmeta.hash_alg=sha256"));
    assert!(data.cmdline.contains(&format!("androidboot.vbmeta.size={total_size}")));
    assert!(data.cmdline.contains(&format!("androidboot.vbmeta.digest={digest}")));
}

#[test]
fn corrupted_hash_partition_fails() {
    let mut ops = simple_setup();
    ops.partitions.get_mut("boot").unwrap()[100] ^= 0x01;

    assert_matches!(
        slot_verify(&mut ops, &["boot"], "", 0),
        Err(SlotVerifyError::Verification { partition, .. }) if partition == "boot"
    );
}

#[test]
fn corrupted_hash_partition_downgrades_to_orange_when_unlocked() {
    let mut ops = simple_setup();
    ops.partitions.get_mut("boot").unwrap()[100] ^= 0x01;
    ops.unlocked = true;

    let data = slot_verify(&mut ops, &["boot"], "", FLAG_ALLOW_VERIFICATION_ERROR).unwrap();

    assert_eq!(data.status, VerificationStatus::Degraded);
    assert_eq!(data.boot_state, BootState::Orange);
    assert_eq!(data.errors.len(), 1);
    assert_matches!(&data.errors[0], SlotVerifyError::Verification { .. });
    assert!(data.cmdline.contains("androidboot.vbmeta.device_state=unlocked"));
}

#[test]
fn corrupted_hash_partition_downgrades_to_red_when_locked() {
    let mut ops = simple_setup();
    ops.partitions.get_mut("boot").unwrap()[100] ^= 0x01;

    let data = slot_verify(&mut ops, &["boot"], "", FLAG_ALLOW_VERIFICATION_ERROR).unwrap();

    assert_eq!(data.status, VerificationStatus::Degraded);
    assert_eq!(data.boot_state, BootState::Red);
}

#[test]
fn missing_partition_downgrades_to_red_eio() {
    let mut ops = simple_setup();
    ops.partitions.remove("boot");

    assert_matches!(
        slot_verify(&mut ops, &["boot"], "", 0),
        Err(SlotVerifyError::Io(partition)) if partition == "boot"
    );

    let data = slot_verify(&mut ops, &["boot"], "", FLAG_ALLOW_VERIFICATION_ERROR).unwrap();
    assert_eq!(data.boot_state, BootState::RedEio);
}

#[test]
fn unlocked_device_is_orange_even_when_fully_verified() {
    let mut ops = simple_setup();
    ops.unlocked = true;

    let data = slot_verify(&mut ops, &["boot"], "", 0).unwrap();

    assert_eq!(data.status, VerificationStatus::FullyVerified);
    assert_eq!(data.boot_state, BootState::Orange);
}

#[test]
fn user_enrolled_key_is_yellow() {
    let mut ops = simple_setup();
    ops.trusted_keys.clear();
    ops.trusted_user_keys.push(encoded_public_key(test_key(0)));

    let data = slot_verify(&mut ops, &["boot"], "", 0).unwrap();

    assert_eq!(data.boot_state, BootState::Yellow);
}

#[test]
fn untrusted_top_level_key_is_rejected() {
    let mut ops = simple_setup();
    ops.trusted_keys.clear();

    assert_matches!(
        slot_verify(&mut ops, &["boot"], "", 0),
        Err(SlotVerifyError::PublicKeyRejected { partition }) if partition == "vbmeta"
    );
}

#[test]
fn unsigned_vbmeta_defers_policy() {
    let boot_data = vec![0u8; 4096];
    let vbmeta = make_vbmeta(VbmetaConfig {
        descriptors: vec![Descriptor::Hash(hash_descriptor("boot", &boot_data, &[]))],
        key: None,
        ..Default::default()
    });

    let mut ops = TestOps::default();
    ops.partitions.insert("vbmeta".to_owned(), vbmeta);
    ops.partitions.insert("boot".to_owned(), boot_data);

    // Locked device: the caller receives the parsed result, but policy maps
    // the state to RED.
    let data = slot_verify(&mut ops, &["boot"], "", 0).unwrap();
    assert_eq!(data.status, VerificationStatus::NotSigned);
    assert_eq!(data.boot_state, BootState::Red);

    // Unlocked device: ORANGE.
    ops.unlocked = true;
    let data = slot_verify(&mut ops, &["boot"], "", 0).unwrap();
    assert_eq!(data.status, VerificationStatus::NotSigned);
    assert_eq!(data.boot_state, BootState::Orange);
}

fn chained_setup(child_rollback: u64, child_key: &RsaPrivateKey) -> TestOps {
    let child = make_vbmeta(VbmetaConfig {
        rollback_index: child_rollback,
        key: Some(child_key),
        ..Default::default()
    });
    let vbmeta = make_vbmeta(VbmetaConfig {
        descriptors: vec![Descriptor::ChainPartition(chain_descriptor(
            "system",
            1,
            test_key(1),
        ))],
        rollback_index: 1,
        key: Some(test_key(0)),
        ..Default::default()
    });

    let mut ops = TestOps::default();
    ops.partitions.insert("vbmeta_a".to_owned(), vbmeta);
    ops.partitions.insert("system_a".to_owned(), child);
    ops.trusted_keys.push(encoded_public_key(test_key(0)));

    ops
}

#[test]
fn chained_vbmeta_verifies_and_reports_rollback_intent() {
    let mut ops = chained_setup(5, test_key(1));
    ops.rollback_indexes.insert(1, 5);

    let data = slot_verify(&mut ops, &["system"], "_a", 0).unwrap();

    assert_eq!(data.status, VerificationStatus::FullyVerified);
    assert_eq!(data.boot_state, BootState::Green);

    assert_eq!(data.vbmeta_images.len(), 2);
    assert_eq!(data.vbmeta_images[0].partition_name, "vbmeta");
    assert_eq!(data.vbmeta_images[1].partition_name, "system");

    // The intended new stored values are the maxima seen during the walk.
    assert_eq!(data.rollback_indexes[0], 1);
    assert_eq!(data.rollback_indexes[1], 5);
}

#[test]
fn stored_rollback_index_above_image_fails() {
    let mut ops = chained_setup(5, test_key(1));
    ops.rollback_indexes.insert(1, 6);

    assert_matches!(
        slot_verify(&mut ops, &["system"], "_a", 0),
        Err(SlotVerifyError::RollbackIndex {
            partition,
            location: 1,
            stored: 6,
            value: 5,
        }) if partition == "system_a"
    );
}

#[test]
fn chained_key_is_pinned_bit_exactly() {
    // The child is signed by a key that the ops oracle would trust, but that
    // does not match the pinned key in the chain descriptor.
    let mut ops = chained_setup(0, test_key(2));
    ops.trusted_keys.push(encoded_public_key(test_key(2)));

    assert_matches!(
        slot_verify(&mut ops, &["system"], "_a", 0),
        Err(SlotVerifyError::PublicKeyRejected { partition }) if partition == "system_a"
    );
}

#[test]
fn unsigned_chained_vbmeta_fails() {
    let mut ops = chained_setup(0, test_key(1));
    let unsigned = make_vbmeta(VbmetaConfig::default());
    ops.partitions.insert("system_a".to_owned(), unsigned);

    assert_matches!(
        slot_verify(&mut ops, &["system"], "_a", 0),
        Err(SlotVerifyError::Verification { partition, .. }) if partition == "system_a"
    );
}

#[test]
fn duplicate_chain_rollback_locations_fail() {
    let vbmeta = make_vbmeta(VbmetaConfig {
        descriptors: vec![
            Descriptor::ChainPartition(chain_descriptor("system", 1, test_key(1))),
            Descriptor::ChainPartition(chain_descriptor("vendor", 1, test_key(1))),
        ],
        key: Some(test_key(0)),
        ..Default::default()
    });

    let mut ops = TestOps::default();
    ops.partitions.insert("vbmeta".to_owned(), vbmeta);
    ops.trusted_keys.push(encoded_public_key(test_key(0)));

    assert_matches!(
        slot_verify(&mut ops, &["system"], "", 0),
        Err(SlotVerifyError::InvalidMetadata { partition, .. }) if partition == "vbmeta"
    );
}

#[test]
fn unsupported_vbmeta_version_fails() {
    let mut ops = simple_setup();

    // Craft an image that requires a newer minor version than we implement.
    let mut raw = ops.partitions["vbmeta"].clone();
    raw[8..12].copy_from_slice(&99u32.to_be_bytes());
    ops.partitions.insert("vbmeta".to_owned(), raw);

    assert_matches!(
        slot_verify(&mut ops, &["boot"], "", 0),
        Err(SlotVerifyError::UnsupportedVersion {
            partition,
            major: 1,
            minor: 99,
        }) if partition == "vbmeta"
    );
}

#[test]
fn signed_region_tampering_fails() {
    let ops = simple_setup();
    let raw = ops.partitions["vbmeta"].clone();

    // Header fields, auth block digest/signature fields, and aux block
    // contents are all covered. For a 2048-bit key the auth block spans
    // [256, 576) with the digest at [256, 288) and signature at [288, 544).
    for offset in [50, 260, 300, 600] {
        let mut ops = simple_setup();
        let mut modified = raw.clone();
        modified[offset] ^= 0x01;
        ops.partitions.insert("vbmeta".to_owned(), modified);

        assert!(
            slot_verify(&mut ops, &["boot"], "", 0).is_err(),
            "Flipping byte {offset} was not detected",
        );
    }

    // Trailing padding after the image is outside the signed region.
    let mut ops = simple_setup();
    let mut modified = raw.clone();
    modified.extend_from_slice(&[0xffu8; 64]);
    ops.partitions.insert("vbmeta".to_owned(), modified);

    slot_verify(&mut ops, &["boot"], "", 0).unwrap();
}

#[test]
fn preloaded_partition_skips_device_reads() {
    let mut ops = simple_setup();
    let boot_data = ops.partitions.remove("boot").unwrap();
    ops.preloaded.insert("boot".to_owned(), boot_data);

    let data = slot_verify(&mut ops, &["boot"], "", 0).unwrap();

    assert_eq!(data.boot_state, BootState::Green);
    assert_eq!(data.loaded_partitions.len(), 1);
}

#[test]
fn appended_vbmeta_located_by_footer() {
    let boot_data = vec![0u8; 8192];

    let mut header = Header {
        required_libavb_version_major: 1,
        required_libavb_version_minor: 0,
        algorithm_type: AlgorithmType::Sha256Rsa2048,
        hash: vec![],
        signature: vec![],
        public_key: vec![],
        public_key_metadata: vec![],
        descriptors: vec![Descriptor::Hash(hash_descriptor("boot", &boot_data, &[0x01]))],
        rollback_index: 0,
        flags: 0,
        rollback_index_location: 0,
        release_string: "avbtool 1.3.0".to_owned(),
        reserved: [0u8; 80],
    };
    header.sign(test_key(0)).unwrap();

    let footer = Footer {
        version_major: 1,
        version_minor: 0,
        original_image_size: 0,
        vbmeta_offset: 0,
        vbmeta_size: 0,
        reserved: [0u8; 28],
    };

    let mut writer = Cursor::new(boot_data.clone());
    writer.set_position(boot_data.len() as u64);
    avb::write_appended_image(&mut writer, &header, &footer, 16384).unwrap();
    let image = writer.into_inner();
    assert_eq!(image.len(), 16384);

    let mut ops = TestOps::default();
    ops.partitions.insert("boot".to_owned(), image);
    ops.trusted_keys.push(encoded_public_key(test_key(0)));

    let data = slot_verify(&mut ops, &["boot"], "", FLAG_NO_VBMETA_PARTITION).unwrap();

    assert_eq!(data.status, VerificationStatus::FullyVerified);
    assert_eq!(data.boot_state, BootState::Green);
    assert_eq!(data.vbmeta_images.len(), 1);
    assert_eq!(data.vbmeta_images[0].partition_name, "boot");
    assert_eq!(data.loaded_partitions[0].data, boot_data);
}

fn hashtree_setup(vbmeta_flags: u32) -> TestOps {
    let hashtree = HashTreeDescriptor {
        dm_verity_version: 1,
        image_size: 40960,
        tree_offset: 40960,
        tree_size: 4096,
        data_block_size: 4096,
        hash_block_size: 4096,
        fec_num_roots: 0,
        fec_offset: 0,
        fec_size: 0,
        hash_algorithm: "sha256".to_owned(),
        partition_name: "system".to_owned(),
        salt: vec![0x0a, 0x0b],
        root_digest: vec![0xcd; 32],
        flags: 0,
        reserved: [0u8; 60],
    };
    let with_verity = KernelCmdlineDescriptor {
        flags: KernelCmdlineDescriptor::FLAG_USE_ONLY_IF_HASHTREE_NOT_DISABLED,
        cmdline: "root=/dev/dm-0 rootuuid=$(ANDROID_SYSTEM_PARTUUID)".to_owned(),
    };
    let without_verity = KernelCmdlineDescriptor {
        flags: KernelCmdlineDescriptor::FLAG_USE_ONLY_IF_HASHTREE_DISABLED,
        cmdline: "root=PARTUUID=$(ANDROID_SYSTEM_PARTUUID)".to_owned(),
    };

    let vbmeta = make_vbmeta(VbmetaConfig {
        descriptors: vec![
            Descriptor::HashTree(hashtree),
            Descriptor::KernelCmdline(with_verity),
            Descriptor::KernelCmdline(without_verity),
        ],
        flags: vbmeta_flags,
        key: Some(test_key(0)),
        ..Default::default()
    });

    let mut ops = TestOps::default();
    ops.partitions.insert("vbmeta".to_owned(), vbmeta);
    ops.partitions.insert("system".to_owned(), vec![0u8; 49152]);
    ops.trusted_keys.push(encoded_public_key(test_key(0)));

    ops
}

#[test]
fn hashtree_descriptor_generates_dm_verity_cmdline() {
    let mut ops = hashtree_setup(0);

    let data = slot_verify(&mut ops, &["system"], "", 0).unwrap();

    assert!(data.cmdline.contains("androidboot.veritymode=enforcing"));
    assert!(data.cmdline.contains("dm=\"1 vroot none ro 1,0 80 verity 1 "));
    assert!(data.cmdline.contains(&hex::encode([0xcdu8; 32])));
    assert!(data.cmdline.contains("rootuuid=00000000-0000-0000-0000-000000system"));
    assert!(!data.cmdline.contains("root=PARTUUID="));

    // Hashtree partitions are not read during verification; dm-verity checks
    // them on demand at runtime.
    assert!(data.loaded_partitions.is_empty());
}

#[test]
fn hashtree_disabled_flag_switches_cmdline() {
    let mut ops = hashtree_setup(Header::FLAG_HASHTREE_DISABLED);

    let data = slot_verify(&mut ops, &["system"], "", 0).unwrap();

    assert!(data.cmdline.contains("androidboot.veritymode=disabled"));
    assert!(!data.cmdline.contains("dm=\""));
    assert!(data.cmdline.contains("root=PARTUUID=00000000-0000-0000-0000-000000system"));
}

#[test]
fn verification_disabled_skips_descriptors() {
    let mut ops = hashtree_setup(Header::FLAG_VERIFICATION_DISABLED);
    ops.unlocked = true;

    let data = slot_verify(&mut ops, &["system"], "", 0).unwrap();

    assert_eq!(data.boot_state, BootState::Orange);
    assert_eq!(data.vbmeta_images.len(), 1);
    assert!(data.loaded_partitions.is_empty());
    assert!(data.cmdline.contains("androidboot.veritymode=disabled"));
}

#[test]
fn empty_requested_partitions_is_invalid() {
    let mut ops = simple_setup();

    assert_matches!(
        slot_verify(&mut ops, &[], "", 0),
        Err(SlotVerifyError::InvalidArgument(_))
    );

    assert_matches!(
        slot_verify(&mut ops, &["boot"], "a", 0),
        Err(SlotVerifyError::InvalidArgument(_))
    );
}

#[test]
fn rollback_intents_are_committed_by_the_caller() {
    let mut ops = chained_setup(5, test_key(1));
    ops.rollback_indexes.insert(1, 4);

    let data = slot_verify(&mut ops, &["system"], "_a", 0).unwrap();

    // Nothing is written during verification.
    assert_eq!(ops.rollback_indexes[&1], 4);

    for (location, value) in data.rollback_indexes.iter().enumerate() {
        if *value > 0 {
            ops.write_rollback_index(location, *value).unwrap();
        }
    }

    assert_eq!(ops.rollback_indexes[&1], 5);
}
