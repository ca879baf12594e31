#![forbid(unsafe_code)]

use cowfs_types::{
    BlockNumber, ObjectId, ParseError, Xid, read_le_u32, read_le_u64, write_le_u32, write_le_u64,
};
use serde::{Deserialize, Serialize};

/// Size of the common object header.
pub const OBJ_PHYS_SIZE: usize = 32;
/// Bytes at the start of every object reserved for its checksum.
pub const MAX_CKSUM_SIZE: usize = 8;

pub const OBJECT_TYPE_MASK: u32 = 0x0000_ffff;
pub const OBJECT_TYPE_FLAGS_MASK: u32 = 0xffff_0000;
pub const OBJ_STORAGETYPE_MASK: u32 = 0xc000_0000;

pub const OBJ_VIRTUAL: u32 = 0x0000_0000;
pub const OBJ_EPHEMERAL: u32 = 0x8000_0000;
pub const OBJ_PHYSICAL: u32 = 0x4000_0000;

pub const OBJECT_TYPE_BTREE: u32 = 0x0002;
pub const OBJECT_TYPE_BTREE_NODE: u32 = 0x0003;
pub const OBJECT_TYPE_SPACEMAN_FREE_QUEUE: u32 = 0x0009;
pub const OBJECT_TYPE_OMAP: u32 = 0x000b;
pub const OBJECT_TYPE_CHECKPOINT_MAP: u32 = 0x000c;
pub const OBJECT_TYPE_FSTREE: u32 = 0x000e;

/// Addressing class of an object, encoded in the top bits of its type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageClass {
    /// Referenced by oid, resolved through the object map.
    Virtual,
    /// Referenced by oid, resolved through the checkpoint-mapping block.
    Ephemeral,
    /// Referenced directly by block number.
    Physical,
}

impl StorageClass {
    #[must_use]
    pub fn from_type(type_and_flags: u32) -> Self {
        match type_and_flags & OBJ_STORAGETYPE_MASK {
            OBJ_EPHEMERAL => Self::Ephemeral,
            OBJ_PHYSICAL => Self::Physical,
            _ => Self::Virtual,
        }
    }

    #[must_use]
    pub fn bits(self) -> u32 {
        match self {
            Self::Virtual => OBJ_VIRTUAL,
            Self::Ephemeral => OBJ_EPHEMERAL,
            Self::Physical => OBJ_PHYSICAL,
        }
    }
}

/// Header shared by every checksummed object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectHeader {
    pub cksum: u64,
    pub oid: ObjectId,
    pub xid: Xid,
    pub type_and_flags: u32,
    pub subtype: u32,
}

impl ObjectHeader {
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            cksum: read_le_u64(block, 0x00)?,
            oid: ObjectId(read_le_u64(block, 0x08)?),
            xid: Xid(read_le_u64(block, 0x10)?),
            type_and_flags: read_le_u32(block, 0x18)?,
            subtype: read_le_u32(block, 0x1C)?,
        })
    }

    /// Store everything except the checksum, which is set last.
    pub fn write(&self, block: &mut [u8]) {
        write_le_u64(block, 0x08, self.oid.0);
        write_le_u64(block, 0x10, self.xid.0);
        write_le_u32(block, 0x18, self.type_and_flags);
        write_le_u32(block, 0x1C, self.subtype);
    }

    #[must_use]
    pub fn object_type(&self) -> u32 {
        self.type_and_flags & OBJECT_TYPE_MASK
    }

    #[must_use]
    pub fn storage_class(&self) -> StorageClass {
        StorageClass::from_type(self.type_and_flags)
    }
}

/// Overwrite the xid field of an encoded object.
pub fn stamp_xid(block: &mut [u8], xid: Xid) {
    write_le_u64(block, 0x10, xid.0);
}

/// Overwrite the oid field of an encoded object.
pub fn stamp_oid(block: &mut [u8], oid: ObjectId) {
    write_le_u64(block, 0x08, oid.0);
}

/// Physical objects carry their own address as oid.
pub fn stamp_physical_oid(block: &mut [u8], bno: BlockNumber) {
    stamp_oid(block, bno.as_oid());
}

/// Fletcher-64 over little-endian 32-bit words.
///
/// Not a general-purpose implementation: the running sums are only reduced
/// at the end, which cannot overflow for inputs up to 64 KiB.
#[must_use]
pub fn fletcher64(bytes: &[u8]) -> u64 {
    const MODULUS: u64 = 0xFFFF_FFFF;

    let mut sum1: u64 = 0;
    let mut sum2: u64 = 0;
    for word in bytes.chunks_exact(4) {
        sum1 += u64::from(u32::from_le_bytes([word[0], word[1], word[2], word[3]]));
        sum2 += sum1;
    }

    let c1 = MODULUS - (sum1 + sum2) % MODULUS;
    let c2 = MODULUS - (sum1 + c1) % MODULUS;
    (c2 << 32) | c1
}

/// Whether the stored checksum matches the object contents.
#[must_use]
pub fn verify_checksum(block: &[u8]) -> bool {
    if block.len() < OBJ_PHYS_SIZE {
        return false;
    }
    let stored = u64::from_le_bytes([
        block[0], block[1], block[2], block[3], block[4], block[5], block[6], block[7],
    ]);
    stored == fletcher64(&block[MAX_CKSUM_SIZE..])
}

/// Recompute and store the object checksum.
pub fn set_checksum(block: &mut [u8]) {
    let cksum = fletcher64(&block[MAX_CKSUM_SIZE..]);
    write_le_u64(block, 0, cksum);
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn fletcher64_known_values() {
        assert_eq!(fletcher64(&[0_u8; 4088]), 0xFFFF_FFFF_FFFF_FFFF);
        assert_eq!(fletcher64(&[1, 0, 0, 0]), 0x0000_0001_FFFF_FFFD);
        // Trailing bytes that do not fill a word are ignored.
        assert_eq!(fletcher64(&[1, 0, 0, 0, 9, 9]), fletcher64(&[1, 0, 0, 0]));
    }

    #[test]
    fn fletcher64_max_block_does_not_overflow() {
        let block = vec![0xFF_u8; 65536 - MAX_CKSUM_SIZE];
        let _ = fletcher64(&block);
    }

    #[test]
    fn header_round_trip_and_class() {
        let mut block = vec![0_u8; 4096];
        let header = ObjectHeader {
            cksum: 0,
            oid: ObjectId(0x402),
            xid: Xid(7),
            type_and_flags: OBJ_PHYSICAL | OBJECT_TYPE_BTREE,
            subtype: OBJECT_TYPE_OMAP,
        };
        header.write(&mut block);
        set_checksum(&mut block);

        let parsed = ObjectHeader::parse(&block).expect("parse");
        assert_eq!(parsed.oid, ObjectId(0x402));
        assert_eq!(parsed.xid, Xid(7));
        assert_eq!(parsed.object_type(), OBJECT_TYPE_BTREE);
        assert_eq!(parsed.storage_class(), StorageClass::Physical);
        assert_eq!(parsed.cksum, fletcher64(&block[8..]));
        assert!(verify_checksum(&block));
    }

    #[test]
    fn storage_class_bits_round_trip() {
        for class in [
            StorageClass::Virtual,
            StorageClass::Ephemeral,
            StorageClass::Physical,
        ] {
            assert_eq!(StorageClass::from_type(class.bits() | OBJECT_TYPE_BTREE_NODE), class);
        }
    }

    #[test]
    fn stamping_changes_checksum_input() {
        let mut block = vec![0_u8; 4096];
        set_checksum(&mut block);
        assert!(verify_checksum(&block));
        stamp_xid(&mut block, Xid(2));
        assert!(!verify_checksum(&block));
        stamp_physical_oid(&mut block, BlockNumber(99));
        set_checksum(&mut block);
        assert!(verify_checksum(&block));
        assert_eq!(ObjectHeader::parse(&block).unwrap().oid, ObjectId(99));
    }

    #[test]
    fn short_block_never_verifies() {
        assert!(!verify_checksum(&[0_u8; 16]));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn single_byte_flip_is_detected(
            seed in proptest::collection::vec(any::<u8>(), 4096),
            pos in 8_usize..4096,
            mask in 1_u8..=255,
        ) {
            let mut block = seed;
            set_checksum(&mut block);
            prop_assert!(verify_checksum(&block));
            block[pos] ^= mask;
            prop_assert!(!verify_checksum(&block));
        }
    }
}
