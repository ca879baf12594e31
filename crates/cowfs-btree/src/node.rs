#![forbid(unsafe_code)]
//! In-memory view of one B-tree node.
//!
//! Records are read through the table of contents; every local write
//! rebuilds the node compactly (table of contents, then keys growing up,
//! values growing down from the end of the value area), so the free lists
//! are always empty and free space is one contiguous run.

use crate::key::TreeKind;
use crate::{corruption, parse_corruption};
use cowfs_error::{CowfsError, Result};
use cowfs_ondisk::btree::{
    BTNODE_FIXED_KV_SIZE, BTNODE_LEAF, BTNODE_ROOT, BTREE_INFO_SIZE, BTREE_NODE_PHYS_SIZE,
    BTREE_PHYSICAL, CHILD_ID_SIZE,
};
use cowfs_ondisk::object::{OBJECT_TYPE_BTREE, OBJECT_TYPE_BTREE_NODE};
use cowfs_ondisk::{
    BtreeInfo, BtreeNodeHeader, NLoc, NodeLayout, ObjectHeader, TocEntry, node_capacity,
};
use cowfs_txn::BufRef;
use cowfs_types::{BlockNumber, ObjectId, Xid, usize_to_u16};

/// One key/value pair as stored in a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Record {
    #[must_use]
    pub fn new(key: &[u8], value: &[u8]) -> Self {
        Self {
            key: key.to_vec(),
            value: value.to_vec(),
        }
    }
}

/// Outcome of a local write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalWrite {
    Done,
    /// The records do not fit even when packed; nothing was changed.
    NoSpace,
}

/// Largest key plus value a leaf record may carry: whatever fits an empty
/// root leaf.
#[must_use]
pub fn max_record_size(tree: TreeKind, block_size: usize) -> usize {
    node_capacity(block_size, true).saturating_sub(tree.layout(true).toc_len(1))
}

/// Largest key a record may carry. Any two index records built from such
/// keys fit in a root node, so a split always has somewhere to go.
#[must_use]
pub fn max_key_size(tree: TreeKind, block_size: usize) -> usize {
    (node_capacity(block_size, true).saturating_sub(tree.layout(false).toc_len(2)) / 2)
        .saturating_sub(CHILD_ID_SIZE)
}

#[derive(Debug, Clone)]
pub struct Node {
    buf: BufRef,
    tree: TreeKind,
    oid: ObjectId,
    xid: Xid,
    len: usize,
    header: BtreeNodeHeader,
}

impl Node {
    /// Validate the headers of `buf` and wrap it.
    pub fn from_buf(buf: BufRef, tree: TreeKind) -> Result<Self> {
        let block = buf.block();
        let (obj, header, len) = {
            let data = buf.read();
            let obj = ObjectHeader::parse(&data).map_err(|e| parse_corruption(block, &e))?;
            let header =
                BtreeNodeHeader::parse(&data).map_err(|e| parse_corruption(block, &e))?;
            (obj, header, data.len())
        };

        let ty = obj.object_type();
        if ty != OBJECT_TYPE_BTREE && ty != OBJECT_TYPE_BTREE_NODE {
            return Err(corruption(block, format!("not a b-tree node (type {ty:#x})")));
        }
        if obj.subtype != tree.subtype() {
            return Err(corruption(
                block,
                format!("node subtype {:#x} belongs to another tree", obj.subtype),
            ));
        }
        if header.has_fixed_kv_size() != (tree == TreeKind::Omap) {
            return Err(corruption(block, "unexpected node layout"));
        }

        let node = Self {
            buf,
            tree,
            oid: obj.oid,
            xid: obj.xid,
            len,
            header,
        };
        let toc_end = usize::from(header.table_space.off) + usize::from(header.table_space.len);
        let toc_needed = node
            .records()
            .saturating_mul(node.layout().toc_entry_size());
        if toc_end > node.capacity() || toc_needed > usize::from(header.table_space.len) {
            return Err(corruption(block, "table of contents overflows the node"));
        }
        Ok(node)
    }

    /// Initialize `buf` as an empty node and wrap it.
    pub fn format(
        buf: BufRef,
        tree: TreeKind,
        oid: ObjectId,
        xid: Xid,
        is_root: bool,
        level: u16,
    ) -> Result<Self> {
        let block = buf.block();
        let is_leaf = level == 0;
        let layout = tree.layout(is_leaf);
        {
            let mut data = buf.write();
            data.fill(0);
            let len = data.len();
            let capacity = node_capacity(len, is_root);
            let toc_len = layout.toc_len(0);
            let kind = if is_root {
                OBJECT_TYPE_BTREE
            } else {
                OBJECT_TYPE_BTREE_NODE
            };
            ObjectHeader {
                cksum: 0,
                oid,
                xid,
                type_and_flags: tree.storage().bits() | kind,
                subtype: tree.subtype(),
            }
            .write(&mut data);

            let mut flags = 0;
            if is_root {
                flags |= BTNODE_ROOT;
            }
            if is_leaf {
                flags |= BTNODE_LEAF;
            }
            if tree == TreeKind::Omap {
                flags |= BTNODE_FIXED_KV_SIZE;
            }
            let to_u16 = |v: usize, field| usize_to_u16(v, field).map_err(|e| parse_corruption(block, &e));
            BtreeNodeHeader {
                flags,
                level,
                nkeys: 0,
                table_space: NLoc {
                    off: 0,
                    len: to_u16(toc_len, "table_space")?,
                },
                free_space: NLoc {
                    off: 0,
                    len: to_u16(capacity - toc_len, "free_space")?,
                },
                key_free_list: NLoc::EMPTY,
                val_free_list: NLoc::EMPTY,
            }
            .write(&mut data);

            if is_root {
                let (key_size, val_size) = match tree.layout(true) {
                    NodeLayout::Fixed { key_size, val_size } => {
                        (u32::from(key_size), u32::from(val_size))
                    }
                    NodeLayout::Variable => (0, 0),
                };
                BtreeInfo {
                    flags: if tree == TreeKind::Omap { BTREE_PHYSICAL } else { 0 },
                    node_size: u32::try_from(len)
                        .map_err(|_| corruption(block, "node size overflow"))?,
                    key_size,
                    val_size,
                    longest_key: 0,
                    longest_val: 0,
                    key_count: 0,
                    node_count: 1,
                }
                .write(&mut data);
            }
        }
        Self::from_buf(buf, tree)
    }

    #[must_use]
    pub fn buf(&self) -> &BufRef {
        &self.buf
    }

    #[must_use]
    pub fn block(&self) -> BlockNumber {
        self.buf.block()
    }

    #[must_use]
    pub fn oid(&self) -> ObjectId {
        self.oid
    }

    #[must_use]
    pub fn xid(&self) -> Xid {
        self.xid
    }

    #[must_use]
    pub fn tree(&self) -> TreeKind {
        self.tree
    }

    #[must_use]
    pub fn header(&self) -> &BtreeNodeHeader {
        &self.header
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.header.is_root()
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.header.is_leaf()
    }

    #[must_use]
    pub fn level(&self) -> u16 {
        self.header.level
    }

    #[must_use]
    pub fn records(&self) -> usize {
        usize::try_from(self.header.nkeys).unwrap_or(usize::MAX)
    }

    #[must_use]
    pub fn layout(&self) -> NodeLayout {
        self.tree.layout(self.is_leaf())
    }

    /// Bytes available for records and their table of contents.
    #[must_use]
    pub fn capacity(&self) -> usize {
        node_capacity(self.len, self.is_root())
    }

    fn value_end(&self) -> usize {
        if self.is_root() {
            self.len - BTREE_INFO_SIZE
        } else {
            self.len
        }
    }

    /// Identifier a parent index record stores for this node.
    #[must_use]
    pub fn child_id(&self) -> [u8; CHILD_ID_SIZE] {
        self.oid.0.to_le_bytes()
    }

    fn toc_entry(&self, data: &[u8], index: usize) -> Result<TocEntry> {
        if index >= self.records() {
            return Err(corruption(
                self.block(),
                format!("record index {index} out of range ({} records)", self.records()),
            ));
        }
        TocEntry::parse(data, &self.header, self.layout(), index)
            .map_err(|e| parse_corruption(self.block(), &e))
    }

    fn key_range(&self, data: &[u8], index: usize) -> Result<(usize, usize)> {
        let toc = self.toc_entry(data, index)?;
        let start = self.header.key_area_start() + usize::from(toc.key.off);
        let end = start + usize::from(toc.key.len);
        if end > self.value_end() {
            return Err(corruption(self.block(), "bad key location"));
        }
        Ok((start, end))
    }

    fn value_range(&self, data: &[u8], index: usize) -> Result<(usize, usize)> {
        let toc = self.toc_entry(data, index)?;
        let off = usize::from(toc.val.off);
        let len = usize::from(toc.val.len);
        let area = self.value_end() - self.header.key_area_start();
        if off < len || off > area {
            return Err(corruption(self.block(), "bad value location"));
        }
        let start = self.value_end() - off;
        Ok((start, start + len))
    }

    pub fn key_at(&self, index: usize) -> Result<Vec<u8>> {
        let data = self.buf.read();
        let (start, end) = self.key_range(&data, index)?;
        Ok(data[start..end].to_vec())
    }

    pub fn value_at(&self, index: usize) -> Result<Vec<u8>> {
        let data = self.buf.read();
        let (start, end) = self.value_range(&data, index)?;
        Ok(data[start..end].to_vec())
    }

    /// Child id stored in index record `index`.
    pub fn child_at(&self, index: usize) -> Result<ObjectId> {
        let value = self.value_at(index)?;
        let raw: [u8; CHILD_ID_SIZE] = value
            .as_slice()
            .try_into()
            .map_err(|_| corruption(self.block(), "bad index block"))?;
        Ok(ObjectId(u64::from_le_bytes(raw)))
    }

    /// Every record, in key order.
    pub fn entries(&self) -> Result<Vec<Record>> {
        let data = self.buf.read();
        (0..self.records())
            .map(|index| {
                let (ks, ke) = self.key_range(&data, index)?;
                let (vs, ve) = self.value_range(&data, index)?;
                Ok(Record {
                    key: data[ks..ke].to_vec(),
                    value: data[vs..ve].to_vec(),
                })
            })
            .collect()
    }

    /// Replace the contents of the node with `records`, packed.
    pub fn rewrite(&mut self, records: &[Record]) -> Result<LocalWrite> {
        let block = self.block();
        let layout = self.layout();
        if let NodeLayout::Fixed { key_size, val_size } = layout {
            let mismatched = records.iter().any(|rec| {
                rec.key.len() != usize::from(key_size) || rec.value.len() != usize::from(val_size)
            });
            if mismatched {
                return Err(CowfsError::Format(format!(
                    "record does not match the fixed {key_size}/{val_size} layout"
                )));
            }
        }

        let toc_len = layout.toc_len(records.len());
        let keys_len: usize = records.iter().map(|rec| rec.key.len()).sum();
        let vals_len: usize = records.iter().map(|rec| rec.value.len()).sum();
        let used = toc_len + keys_len + vals_len;
        let capacity = self.capacity();
        if used > capacity {
            return Ok(LocalWrite::NoSpace);
        }

        let to_u16 =
            |v: usize, field| usize_to_u16(v, field).map_err(|e| parse_corruption(block, &e));
        let mut header = self.header;
        header.nkeys = u32::try_from(records.len())
            .map_err(|_| corruption(block, "record count overflow"))?;
        header.table_space = NLoc {
            off: 0,
            len: to_u16(toc_len, "table_space")?,
        };
        header.free_space = NLoc {
            off: to_u16(keys_len, "free_space_off")?,
            len: to_u16(capacity - used, "free_space_len")?,
        };
        header.key_free_list = NLoc::EMPTY;
        header.val_free_list = NLoc::EMPTY;

        let key_start = header.key_area_start();
        let value_end = self.value_end();
        let mut data = self.buf.write();
        data[BTREE_NODE_PHYS_SIZE..value_end].fill(0);
        let mut key_off = 0;
        let mut val_off = 0;
        for (index, rec) in records.iter().enumerate() {
            let start = key_start + key_off;
            data[start..start + rec.key.len()].copy_from_slice(&rec.key);
            val_off += rec.value.len();
            let start = value_end - val_off;
            data[start..start + rec.value.len()].copy_from_slice(&rec.value);
            TocEntry {
                key: NLoc {
                    off: to_u16(key_off, "key_off")?,
                    len: to_u16(rec.key.len(), "key_len")?,
                },
                val: NLoc {
                    off: to_u16(val_off, "val_off")?,
                    len: to_u16(rec.value.len(), "val_len")?,
                },
            }
            .write(&mut data, &header, layout, index);
            key_off += rec.key.len();
        }
        header.write(&mut data);
        drop(data);
        self.header = header;
        Ok(LocalWrite::Done)
    }

    /// Insert a record right after position `after` (-1 for the front).
    pub fn insert_local(&mut self, after: isize, key: &[u8], value: &[u8]) -> Result<LocalWrite> {
        let mut records = self.entries()?;
        let at = usize::try_from(after + 1)
            .ok()
            .filter(|at| *at <= records.len())
            .ok_or_else(|| corruption(self.block(), format!("insert position {after} out of range")))?;
        records.insert(at, Record::new(key, value));
        self.rewrite(&records)
    }

    pub fn remove_local(&mut self, index: usize) -> Result<()> {
        let mut records = self.entries()?;
        if index >= records.len() {
            return Err(corruption(self.block(), format!("remove index {index} out of range")));
        }
        records.remove(index);
        match self.rewrite(&records)? {
            LocalWrite::Done => Ok(()),
            LocalWrite::NoSpace => Err(corruption(self.block(), "node overflowed while shrinking")),
        }
    }

    /// Swap the key and/or value of record `index`.
    pub fn replace_local(
        &mut self,
        index: usize,
        key: Option<&[u8]>,
        value: Option<&[u8]>,
    ) -> Result<LocalWrite> {
        let mut records = self.entries()?;
        let Some(rec) = records.get_mut(index) else {
            return Err(corruption(self.block(), format!("replace index {index} out of range")));
        };
        if let Some(key) = key {
            rec.key = key.to_vec();
        }
        if let Some(value) = value {
            rec.value = value.to_vec();
        }
        self.rewrite(&records)
    }

    /// Change level and leaf flag. The records must be rewritten right after
    /// when the layout changes.
    pub fn set_level(&mut self, level: u16) {
        let mut header = self.header;
        header.level = level;
        if level == 0 {
            header.flags |= BTNODE_LEAF;
        } else {
            header.flags &= !BTNODE_LEAF;
        }
        header.write(&mut self.buf.write());
        self.header = header;
    }

    pub fn info(&self) -> Result<BtreeInfo> {
        if !self.is_root() {
            return Err(corruption(self.block(), "tree info requested from a non-root node"));
        }
        BtreeInfo::parse(&self.buf.read()).map_err(|e| parse_corruption(self.block(), &e))
    }

    pub fn set_info(&self, info: &BtreeInfo) -> Result<()> {
        if !self.is_root() {
            return Err(corruption(self.block(), "tree info written to a non-root node"));
        }
        info.write(&mut self.buf.write());
        Ok(())
    }
}
