#![forbid(unsafe_code)]

use cowfs_types::{
    BlockNumber, ObjectId, ParseError, Xid, ensure_slice, read_le_u16, read_le_u32, read_le_u64,
    write_le_u16, write_le_u32, write_le_u64,
};
use serde::{Deserialize, Serialize};

use crate::object::OBJ_PHYS_SIZE;

/// Object header plus the node header fields.
pub const BTREE_NODE_PHYS_SIZE: usize = 56;
/// Size of the tree-info footer carried by root nodes.
pub const BTREE_INFO_SIZE: usize = 40;

pub const BTNODE_ROOT: u16 = 0x0001;
pub const BTNODE_LEAF: u16 = 0x0002;
pub const BTNODE_FIXED_KV_SIZE: u16 = 0x0004;

pub const BTREE_UINT64_KEYS: u32 = 0x0000_0001;
pub const BTREE_SEQUENTIAL_INSERT: u32 = 0x0000_0002;
pub const BTREE_PHYSICAL: u32 = 0x0000_0010;

/// Marker for an unused offset.
pub const BTOFF_INVALID: u16 = 0xffff;
/// The table of contents grows in chunks of this many entries.
pub const BTREE_TOC_ENTRY_INCREMENT: usize = 8;

pub const KVOFF_SIZE: usize = 4;
pub const KVLOC_SIZE: usize = 8;

pub const OMAP_KEY_SIZE: usize = 16;
pub const OMAP_VAL_SIZE: usize = 16;
/// Values of nonleaf records: the child object id.
pub const CHILD_ID_SIZE: usize = 8;

pub const OMAP_VAL_DELETED: u32 = 0x0000_0001;
pub const OMAP_VAL_SAVED: u32 = 0x0000_0002;

/// Location of a region inside a node: offset and length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NLoc {
    pub off: u16,
    pub len: u16,
}

impl NLoc {
    pub const EMPTY: Self = Self {
        off: BTOFF_INVALID,
        len: 0,
    };

    fn parse(block: &[u8], offset: usize) -> Result<Self, ParseError> {
        Ok(Self {
            off: read_le_u16(block, offset)?,
            len: read_le_u16(block, offset + 2)?,
        })
    }

    fn write(self, block: &mut [u8], offset: usize) {
        write_le_u16(block, offset, self.off);
        write_le_u16(block, offset + 2, self.len);
    }
}

/// Node header stored right after the object header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtreeNodeHeader {
    pub flags: u16,
    pub level: u16,
    pub nkeys: u32,
    pub table_space: NLoc,
    pub free_space: NLoc,
    pub key_free_list: NLoc,
    pub val_free_list: NLoc,
}

impl BtreeNodeHeader {
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(block, 0, BTREE_NODE_PHYS_SIZE)?;
        Ok(Self {
            flags: read_le_u16(block, OBJ_PHYS_SIZE)?,
            level: read_le_u16(block, OBJ_PHYS_SIZE + 2)?,
            nkeys: read_le_u32(block, OBJ_PHYS_SIZE + 4)?,
            table_space: NLoc::parse(block, OBJ_PHYS_SIZE + 8)?,
            free_space: NLoc::parse(block, OBJ_PHYS_SIZE + 12)?,
            key_free_list: NLoc::parse(block, OBJ_PHYS_SIZE + 16)?,
            val_free_list: NLoc::parse(block, OBJ_PHYS_SIZE + 20)?,
        })
    }

    pub fn write(&self, block: &mut [u8]) {
        write_le_u16(block, OBJ_PHYS_SIZE, self.flags);
        write_le_u16(block, OBJ_PHYS_SIZE + 2, self.level);
        write_le_u32(block, OBJ_PHYS_SIZE + 4, self.nkeys);
        self.table_space.write(block, OBJ_PHYS_SIZE + 8);
        self.free_space.write(block, OBJ_PHYS_SIZE + 12);
        self.key_free_list.write(block, OBJ_PHYS_SIZE + 16);
        self.val_free_list.write(block, OBJ_PHYS_SIZE + 20);
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.flags & BTNODE_ROOT != 0
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.flags & BTNODE_LEAF != 0
    }

    #[must_use]
    pub fn has_fixed_kv_size(&self) -> bool {
        self.flags & BTNODE_FIXED_KV_SIZE != 0
    }

    /// Start of the key area, right after the table of contents.
    #[must_use]
    pub fn key_area_start(&self) -> usize {
        BTREE_NODE_PHYS_SIZE + usize::from(self.table_space.off) + usize::from(self.table_space.len)
    }
}

/// Tree-wide summary kept in the root node's footer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BtreeInfo {
    pub flags: u32,
    pub node_size: u32,
    pub key_size: u32,
    pub val_size: u32,
    pub longest_key: u32,
    pub longest_val: u32,
    pub key_count: u64,
    pub node_count: u64,
}

impl BtreeInfo {
    /// Parse the footer occupying the last bytes of a root block.
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        let base = block
            .len()
            .checked_sub(BTREE_INFO_SIZE)
            .ok_or(ParseError::InsufficientData {
                needed: BTREE_INFO_SIZE,
                offset: 0,
                actual: block.len(),
            })?;
        Ok(Self {
            flags: read_le_u32(block, base)?,
            node_size: read_le_u32(block, base + 4)?,
            key_size: read_le_u32(block, base + 8)?,
            val_size: read_le_u32(block, base + 12)?,
            longest_key: read_le_u32(block, base + 16)?,
            longest_val: read_le_u32(block, base + 20)?,
            key_count: read_le_u64(block, base + 24)?,
            node_count: read_le_u64(block, base + 32)?,
        })
    }

    pub fn write(&self, block: &mut [u8]) {
        let base = block.len() - BTREE_INFO_SIZE;
        write_le_u32(block, base, self.flags);
        write_le_u32(block, base + 4, self.node_size);
        write_le_u32(block, base + 8, self.key_size);
        write_le_u32(block, base + 12, self.val_size);
        write_le_u32(block, base + 16, self.longest_key);
        write_le_u32(block, base + 20, self.longest_val);
        write_le_u64(block, base + 24, self.key_count);
        write_le_u64(block, base + 32, self.node_count);
    }
}

/// Table-of-contents flavor of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeLayout {
    /// `kvoff` entries: offsets only, every key and value has the same size.
    Fixed { key_size: u16, val_size: u16 },
    /// `kvloc` entries: offset and length for both key and value.
    Variable,
}

impl NodeLayout {
    /// Object-map leaves: key plus mapping value.
    pub const OMAP_LEAF: Self = Self::Fixed {
        key_size: 16,
        val_size: 16,
    };
    /// Object-map index nodes: key plus child id.
    pub const OMAP_INDEX: Self = Self::Fixed {
        key_size: 16,
        val_size: 8,
    };

    #[must_use]
    pub fn toc_entry_size(self) -> usize {
        match self {
            Self::Fixed { .. } => KVOFF_SIZE,
            Self::Variable => KVLOC_SIZE,
        }
    }

    /// Bytes of table of contents needed for `records` entries.
    #[must_use]
    pub fn toc_len(self, records: usize) -> usize {
        let slots = records
            .div_ceil(BTREE_TOC_ENTRY_INCREMENT)
            .max(1)
            * BTREE_TOC_ENTRY_INCREMENT;
        slots * self.toc_entry_size()
    }
}

/// One decoded table-of-contents entry.
///
/// Key offsets are relative to the key area; value offsets count backwards
/// from the end of the value area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TocEntry {
    pub key: NLoc,
    pub val: NLoc,
}

impl TocEntry {
    pub fn parse(
        block: &[u8],
        header: &BtreeNodeHeader,
        layout: NodeLayout,
        index: usize,
    ) -> Result<Self, ParseError> {
        let base = BTREE_NODE_PHYS_SIZE
            + usize::from(header.table_space.off)
            + index * layout.toc_entry_size();
        match layout {
            NodeLayout::Fixed { key_size, val_size } => Ok(Self {
                key: NLoc {
                    off: read_le_u16(block, base)?,
                    len: key_size,
                },
                val: NLoc {
                    off: read_le_u16(block, base + 2)?,
                    len: val_size,
                },
            }),
            NodeLayout::Variable => Ok(Self {
                key: NLoc::parse(block, base)?,
                val: NLoc::parse(block, base + 4)?,
            }),
        }
    }

    pub fn write(self, block: &mut [u8], header: &BtreeNodeHeader, layout: NodeLayout, index: usize) {
        let base = BTREE_NODE_PHYS_SIZE
            + usize::from(header.table_space.off)
            + index * layout.toc_entry_size();
        match layout {
            NodeLayout::Fixed { .. } => {
                write_le_u16(block, base, self.key.off);
                write_le_u16(block, base + 2, self.val.off);
            }
            NodeLayout::Variable => {
                self.key.write(block, base);
                self.val.write(block, base + 4);
            }
        }
    }
}

/// Bytes available for table of contents, keys and values in one node.
#[must_use]
pub fn node_capacity(block_size: usize, is_root: bool) -> usize {
    let footer = if is_root { BTREE_INFO_SIZE } else { 0 };
    block_size.saturating_sub(BTREE_NODE_PHYS_SIZE + footer)
}

/// Object-map key: ordered by oid, then xid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OmapKey {
    pub oid: ObjectId,
    pub xid: Xid,
}

impl OmapKey {
    pub fn parse(raw: &[u8]) -> Result<Self, ParseError> {
        if raw.len() != OMAP_KEY_SIZE {
            return Err(ParseError::InvalidField {
                field: "omap_key",
                reason: "must be 16 bytes",
            });
        }
        Ok(Self {
            oid: ObjectId(read_le_u64(raw, 0)?),
            xid: Xid(read_le_u64(raw, 8)?),
        })
    }

    #[must_use]
    pub fn encode(&self) -> [u8; OMAP_KEY_SIZE] {
        let mut raw = [0_u8; OMAP_KEY_SIZE];
        write_le_u64(&mut raw, 0, self.oid.0);
        write_le_u64(&mut raw, 8, self.xid.0);
        raw
    }
}

/// Object-map value: where a given version of a virtual object lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OmapVal {
    pub flags: u32,
    pub size: u32,
    pub paddr: BlockNumber,
}

impl OmapVal {
    pub fn parse(raw: &[u8]) -> Result<Self, ParseError> {
        if raw.len() != OMAP_VAL_SIZE {
            return Err(ParseError::InvalidField {
                field: "omap_val",
                reason: "must be 16 bytes",
            });
        }
        Ok(Self {
            flags: read_le_u32(raw, 0)?,
            size: read_le_u32(raw, 4)?,
            paddr: BlockNumber(read_le_u64(raw, 8)?),
        })
    }

    #[must_use]
    pub fn encode(&self) -> [u8; OMAP_VAL_SIZE] {
        let mut raw = [0_u8; OMAP_VAL_SIZE];
        write_le_u32(&mut raw, 0, self.flags);
        write_le_u32(&mut raw, 4, self.size);
        write_le_u64(&mut raw, 8, self.paddr.0);
        raw
    }
}
