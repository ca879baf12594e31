#![forbid(unsafe_code)]

use cowfs_types::{
    BlockNumber, ObjectId, ParseError, read_le_u32, read_le_u64, write_le_u32, write_le_u64,
};
use serde::{Deserialize, Serialize};

use crate::object::OBJ_PHYS_SIZE;

/// Object header plus `cpm_flags` and `cpm_count`.
pub const CHECKPOINT_MAP_HEADER_SIZE: usize = OBJ_PHYS_SIZE + 8;
/// Size of one `checkpoint_mapping` entry.
pub const CHECKPOINT_MAPPING_SIZE: usize = 40;
/// Set on the last mapping block of a checkpoint.
pub const CHECKPOINT_MAP_LAST: u32 = 0x0000_0001;

/// How many mappings fit in one block.
#[must_use]
pub fn max_maps_per_block(block_size: usize) -> usize {
    block_size.saturating_sub(CHECKPOINT_MAP_HEADER_SIZE) / CHECKPOINT_MAPPING_SIZE
}

/// Fields following the object header of a checkpoint-mapping block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMapHeader {
    pub flags: u32,
    pub count: u32,
}

impl CheckpointMapHeader {
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            flags: read_le_u32(block, OBJ_PHYS_SIZE)?,
            count: read_le_u32(block, OBJ_PHYS_SIZE + 4)?,
        })
    }

    pub fn write(&self, block: &mut [u8]) {
        write_le_u32(block, OBJ_PHYS_SIZE, self.flags);
        write_le_u32(block, OBJ_PHYS_SIZE + 4, self.count);
    }
}

/// One ephemeral object mapping: oid to physical address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMapping {
    pub type_and_flags: u32,
    pub subtype: u32,
    pub size: u32,
    pub pad: u32,
    pub fs_oid: ObjectId,
    pub oid: ObjectId,
    pub paddr: BlockNumber,
}

impl CheckpointMapping {
    fn offset(index: usize) -> usize {
        CHECKPOINT_MAP_HEADER_SIZE + index * CHECKPOINT_MAPPING_SIZE
    }

    /// Parse the mapping at `index` of a mapping block.
    pub fn parse(block: &[u8], index: usize) -> Result<Self, ParseError> {
        let base = Self::offset(index);
        Ok(Self {
            type_and_flags: read_le_u32(block, base)?,
            subtype: read_le_u32(block, base + 4)?,
            size: read_le_u32(block, base + 8)?,
            pad: read_le_u32(block, base + 12)?,
            fs_oid: ObjectId(read_le_u64(block, base + 16)?),
            oid: ObjectId(read_le_u64(block, base + 24)?),
            paddr: BlockNumber(read_le_u64(block, base + 32)?),
        })
    }

    pub fn write(&self, block: &mut [u8], index: usize) {
        let base = Self::offset(index);
        write_le_u32(block, base, self.type_and_flags);
        write_le_u32(block, base + 4, self.subtype);
        write_le_u32(block, base + 8, self.size);
        write_le_u32(block, base + 12, self.pad);
        write_le_u64(block, base + 16, self.fs_oid.0);
        write_le_u64(block, base + 24, self.oid.0);
        write_le_u64(block, base + 32, self.paddr.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{OBJ_EPHEMERAL, OBJECT_TYPE_BTREE_NODE, OBJECT_TYPE_SPACEMAN_FREE_QUEUE};

    #[test]
    fn capacity_for_common_block_sizes() {
        assert_eq!(max_maps_per_block(4096), 101);
        assert_eq!(max_maps_per_block(65536), 1637);
    }

    #[test]
    fn mapping_round_trip() {
        let mut block = vec![0_u8; 4096];
        CheckpointMapHeader {
            flags: CHECKPOINT_MAP_LAST,
            count: 2,
        }
        .write(&mut block);
        let mapping = CheckpointMapping {
            type_and_flags: OBJ_EPHEMERAL | OBJECT_TYPE_BTREE_NODE,
            subtype: OBJECT_TYPE_SPACEMAN_FREE_QUEUE,
            size: 4096,
            pad: 0,
            fs_oid: ObjectId(0),
            oid: ObjectId(0x410),
            paddr: BlockNumber(20),
        };
        mapping.write(&mut block, 1);

        let header = CheckpointMapHeader::parse(&block).unwrap();
        assert_eq!(header.count, 2);
        assert_eq!(header.flags, CHECKPOINT_MAP_LAST);
        assert_eq!(CheckpointMapping::parse(&block, 1).unwrap(), mapping);
        assert_eq!(read_le_u64(&block, 40 + 40 + 24).unwrap(), 0x410);
    }

    #[test]
    fn mapping_past_block_end_is_rejected() {
        let block = vec![0_u8; 4096];
        assert!(CheckpointMapping::parse(&block, max_maps_per_block(4096)).is_err());
    }
}
