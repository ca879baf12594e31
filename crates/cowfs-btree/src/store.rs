#![forbid(unsafe_code)]

use crate::corruption;
use crate::key::TreeKind;
use crate::node::Node;
use cowfs_alloc::{BitmapAllocator, SpaceAllocator};
use cowfs_block::BlockDevice;
use cowfs_error::{CowfsError, Result};
use cowfs_ondisk::checkpoint::CHECKPOINT_MAP_LAST;
use cowfs_ondisk::object::{OBJ_PHYSICAL, OBJECT_TYPE_CHECKPOINT_MAP};
use cowfs_ondisk::{CheckpointMapHeader, ObjectHeader, verify_checksum};
use cowfs_txn::{BufRef, CommitOutcome, ObjectBuf, Transaction, TxnBudget, TxnManager};
use cowfs_types::{BlockNumber, BlockSize, OID_RESERVED_COUNT, ObjectId, Xid};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace};

/// The two circular areas of a checkpoint.
///
/// The descriptor ring holds the checkpoint-mapping block; the data ring
/// holds ephemeral objects, which are addressed by their offset from
/// `data_index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointArea {
    pub desc_base: BlockNumber,
    pub desc_blocks: u32,
    pub desc_index: u32,
    pub desc_len: u32,
    pub data_base: BlockNumber,
    pub data_blocks: u32,
    pub data_index: u32,
    pub data_len: u32,
}

impl CheckpointArea {
    /// Block holding entry `i` of the descriptor ring.
    #[must_use]
    pub fn desc_block(&self, i: u32) -> BlockNumber {
        let slot = (u64::from(self.desc_index) + u64::from(i)) % u64::from(self.desc_blocks.max(1));
        BlockNumber(self.desc_base.0 + slot)
    }

    /// Ring slot of the object at offset `index` of the data ring.
    #[must_use]
    pub fn data_slot(&self, index: u32) -> u32 {
        let blocks = self.data_blocks.max(1);
        let index = index % blocks;
        let rest = blocks.saturating_sub(self.data_index);
        if index < rest {
            self.data_index + index
        } else {
            index - rest
        }
    }

    /// Block holding the object at offset `index` of the data ring.
    #[must_use]
    pub fn data_block(&self, index: u32) -> BlockNumber {
        BlockNumber(self.data_base.0 + u64::from(self.data_slot(index)))
    }

    /// Offset of `block` from the start of the data ring, if it lies in it.
    #[must_use]
    pub fn data_offset(&self, block: BlockNumber) -> Option<u32> {
        let blocks = u64::from(self.data_blocks);
        let rel = block.0.checked_sub(self.data_base.0).filter(|rel| *rel < blocks)?;
        let offset = (rel + blocks - u64::from(self.data_index)) % blocks;
        u32::try_from(offset).ok()
    }

    fn validate(&self) -> Result<()> {
        let sane = self.desc_blocks > 0
            && self.data_blocks > 0
            && self.desc_index < self.desc_blocks
            && self.data_index < self.data_blocks
            && self.data_len <= self.data_blocks;
        if sane {
            Ok(())
        } else {
            Err(corruption(self.desc_base, "checkpoint areas are inconsistent"))
        }
    }
}

/// Everything needed to resume from a published checkpoint: what a
/// superblock would record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointDescriptor {
    pub xid: Xid,
    pub block_size: u32,
    /// Physical address of the object-map root.
    pub omap_root: BlockNumber,
    /// Virtual oid of the catalog root.
    pub cat_root: ObjectId,
    pub next_oid: ObjectId,
    pub area: CheckpointArea,
}

/// Sizes of the checkpoint rings laid out by [`ObjectStore::format`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatGeometry {
    pub desc_blocks: u32,
    pub data_blocks: u32,
}

impl Default for FormatGeometry {
    fn default() -> Self {
        Self {
            desc_blocks: 8,
            data_blocks: 32,
        }
    }
}

/// Which checkpoint a read goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum View {
    /// The last published checkpoint.
    Committed,
    /// The running transaction's state, falling back to the committed one.
    Working,
}

/// Block device, allocator and transaction manager of one container.
pub struct ObjectStore {
    pub(crate) dev: Box<dyn BlockDevice>,
    pub(crate) alloc: Box<dyn SpaceAllocator>,
    pub(crate) txns: TxnManager,
    pub(crate) committed: CheckpointDescriptor,
    pub(crate) working: CheckpointDescriptor,
    pub(crate) block_size: BlockSize,
    pub(crate) check_nodes: bool,
}

impl ObjectStore {
    /// Resume from `checkpoint`. `alloc` must reflect the space in use at
    /// that checkpoint.
    pub fn open(
        dev: Box<dyn BlockDevice>,
        alloc: Box<dyn SpaceAllocator>,
        checkpoint: CheckpointDescriptor,
        check_nodes: bool,
    ) -> Result<Self> {
        let block_size =
            BlockSize::new(checkpoint.block_size).map_err(|e| CowfsError::Format(e.to_string()))?;
        if dev.block_size() != block_size.get() {
            return Err(CowfsError::Format(format!(
                "device block size {} does not match checkpoint block size {block_size}",
                dev.block_size()
            )));
        }
        checkpoint.area.validate()?;
        debug!(
            xid = checkpoint.xid.0,
            omap_root = checkpoint.omap_root.0,
            cat_root = checkpoint.cat_root.0,
            "object_store_open"
        );
        Ok(Self {
            dev,
            alloc,
            txns: TxnManager::new(checkpoint.xid),
            committed: checkpoint,
            working: checkpoint,
            block_size,
            check_nodes,
        })
    }

    /// Lay out an empty container and commit it as xid 1.
    ///
    /// Block 0 is reserved, followed by the descriptor ring and the data
    /// ring. The object-map root, the catalog root and the first
    /// checkpoint-mapping block are created empty.
    pub fn format(
        dev: Box<dyn BlockDevice>,
        mut alloc: BitmapAllocator,
        geometry: FormatGeometry,
        check_nodes: bool,
    ) -> Result<Self> {
        let block_size =
            BlockSize::new(dev.block_size()).map_err(|e| CowfsError::Format(e.to_string()))?;
        if geometry.desc_blocks < 2 || geometry.data_blocks == 0 {
            return Err(CowfsError::Format(
                "descriptor ring needs two blocks and data ring one".to_owned(),
            ));
        }
        let reserved = 1 + u64::from(geometry.desc_blocks) + u64::from(geometry.data_blocks);
        if alloc.total_blocks() != dev.block_count() {
            return Err(CowfsError::Format(format!(
                "allocator covers {} blocks, device has {}",
                alloc.total_blocks(),
                dev.block_count()
            )));
        }
        if reserved + 2 > dev.block_count() {
            return Err(CowfsError::Format(format!(
                "device of {} blocks cannot hold the checkpoint areas",
                dev.block_count()
            )));
        }
        alloc.reserve(BlockNumber(0), reserved)?;

        let area = CheckpointArea {
            desc_base: BlockNumber(1),
            desc_blocks: geometry.desc_blocks,
            desc_index: 0,
            desc_len: 1,
            data_base: BlockNumber(1 + u64::from(geometry.desc_blocks)),
            data_blocks: geometry.data_blocks,
            data_index: 0,
            data_len: 0,
        };
        let cat_root = ObjectId(OID_RESERVED_COUNT);
        let empty = CheckpointDescriptor {
            xid: Xid(0),
            block_size: block_size.get(),
            omap_root: BlockNumber(0),
            cat_root,
            next_oid: ObjectId(OID_RESERVED_COUNT + 1),
            area,
        };
        let mut store = Self {
            dev,
            alloc: Box::new(alloc),
            txns: TxnManager::new(Xid(0)),
            committed: empty,
            working: empty,
            block_size,
            check_nodes,
        };

        let xid = store.begin(TxnBudget::new(1, 2))?;

        let omap_root = store.allocate(false)?;
        let buf = store.new_buf(omap_root)?;
        Node::format(buf, TreeKind::Omap, omap_root.as_oid(), xid, true, 0)?;
        store.working.omap_root = omap_root;

        let cat_block = store.allocate(false)?;
        let buf = store.new_buf(cat_block)?;
        Node::format(buf, TreeKind::Catalog, cat_root, xid, true, 0)?;
        store.create_omap_rec(cat_root, cat_block)?;

        let cpm_block = area.desc_block(0);
        let cpm = store.new_buf(cpm_block)?;
        {
            let mut data = cpm.write();
            ObjectHeader {
                cksum: 0,
                oid: cpm_block.as_oid(),
                xid,
                type_and_flags: OBJ_PHYSICAL | OBJECT_TYPE_CHECKPOINT_MAP,
                subtype: 0,
            }
            .write(&mut data);
            CheckpointMapHeader {
                flags: CHECKPOINT_MAP_LAST,
                count: 0,
            }
            .write(&mut data);
        }

        store.commit()?;
        debug!(
            block_size = block_size.get(),
            blocks = store.dev.block_count(),
            omap_root = omap_root.0,
            cat_block = cat_block.0,
            "container_format"
        );
        Ok(store)
    }

    /// Give back the device and allocator along with the last published
    /// checkpoint. A running transaction is aborted first.
    pub fn into_parts(
        mut self,
    ) -> Result<(Box<dyn BlockDevice>, Box<dyn SpaceAllocator>, CheckpointDescriptor)> {
        if self.txns.active().is_some() {
            self.abort()?;
        }
        Ok((self.dev, self.alloc, self.committed))
    }

    #[must_use]
    pub fn block_size(&self) -> BlockSize {
        self.block_size
    }

    #[must_use]
    pub fn check_nodes(&self) -> bool {
        self.check_nodes
    }

    #[must_use]
    pub fn device(&self) -> &dyn BlockDevice {
        self.dev.as_ref()
    }

    #[must_use]
    pub fn allocator(&self) -> &dyn SpaceAllocator {
        self.alloc.as_ref()
    }

    /// Descriptor of the last published checkpoint.
    #[must_use]
    pub fn committed(&self) -> &CheckpointDescriptor {
        &self.committed
    }

    #[must_use]
    pub fn descriptor(&self, view: View) -> &CheckpointDescriptor {
        match view {
            View::Committed => &self.committed,
            View::Working => &self.working,
        }
    }

    #[must_use]
    pub fn transaction(&self) -> Option<&Transaction> {
        self.txns.active()
    }

    /// Xid of the running transaction.
    pub fn current_xid(&self) -> Result<Xid> {
        self.txns.xid()
    }

    // ── Transaction lifecycle ───────────────────────────────────────────

    pub fn begin(&mut self, budget: TxnBudget) -> Result<Xid> {
        let xid = self.txns.begin(budget, self.alloc.free_blocks())?;
        self.working.xid = xid;
        Ok(xid)
    }

    pub fn set_defer_commit(&mut self, defer: bool) {
        self.txns.set_defer_commit(defer);
    }

    pub fn commit(&mut self) -> Result<CommitOutcome> {
        let outcome = self.txns.commit(self.dev.as_ref(), self.alloc.as_mut())?;
        if let CommitOutcome::Committed { xid } = outcome {
            self.publish(xid);
        }
        Ok(outcome)
    }

    /// Perform a deferred commit, if any.
    pub fn flush(&mut self) -> Result<Option<Xid>> {
        let flushed = self.txns.flush(self.dev.as_ref(), self.alloc.as_mut())?;
        if let Some(xid) = flushed {
            self.publish(xid);
        }
        Ok(flushed)
    }

    /// Drop the running transaction; the committed checkpoint stays
    /// authoritative.
    pub fn abort(&mut self) -> Result<()> {
        let result = self.txns.abort(self.alloc.as_mut());
        self.working = self.committed;
        result
    }

    fn publish(&mut self, xid: Xid) {
        self.working.xid = xid;
        self.committed = self.working;
    }

    // ── Block access ────────────────────────────────────────────────────

    /// Buffer for `block`: the transaction's copy if it owns one, otherwise
    /// a fresh read from the device.
    pub(crate) fn read_block(&self, block: BlockNumber) -> Result<BufRef> {
        if let Some(buf) = self.txns.dirty(block) {
            return Ok(buf);
        }
        if block.0 >= self.dev.block_count() {
            return Err(corruption(block, "block address beyond the end of the device"));
        }
        let data = self.dev.read_block(block)?.into_inner();
        Ok(ObjectBuf::new(block, data))
    }

    /// Like [`Self::read_block`], verifying the checksum of blocks read from
    /// the device when node checking is enabled.
    pub(crate) fn read_verified(&self, block: BlockNumber) -> Result<BufRef> {
        if let Some(buf) = self.txns.dirty(block) {
            return Ok(buf);
        }
        let buf = self.read_block(block)?;
        if self.check_nodes && !verify_checksum(&buf.read()) {
            error!(block = block.0, "checksum_mismatch");
            return Err(CowfsError::ChecksumMismatch { block: block.0 });
        }
        Ok(buf)
    }

    /// Allocate one block for the running transaction.
    pub(crate) fn allocate(&mut self, backward: bool) -> Result<BlockNumber> {
        self.txns.xid()?;
        let block = self.alloc.allocate(1, backward)?;
        self.txns.record_alloc(block, 1)?;
        trace!(block = block.0, backward, "object_block_alloc");
        Ok(block)
    }

    /// Zeroed buffer for `block`, owned by the running transaction.
    pub(crate) fn new_buf(&mut self, block: BlockNumber) -> Result<BufRef> {
        let buf = ObjectBuf::new(block, vec![0; self.block_size.as_usize()]);
        self.txns.join(&buf)?;
        Ok(buf)
    }

    /// Release `block` once the running transaction commits.
    pub(crate) fn free_block(&mut self, block: BlockNumber) -> Result<()> {
        self.txns.free_enqueue(block, 1)?;
        trace!(block = block.0, "object_block_free");
        Ok(())
    }

    pub(crate) fn next_oid(&mut self) -> ObjectId {
        let oid = self.working.next_oid;
        self.working.next_oid = ObjectId(oid.0 + 1);
        oid
    }
}
