#![forbid(unsafe_code)]
//! Transaction and checkpoint manager.
//!
//! A transaction bounds a batch of block mutations. It is started with a
//! budget that is validated against the free space before anything is
//! touched, owns the dirty block buffers of the batch, and ends either in a
//! commit (all dirty blocks written, the checkpoint advances) or an abort
//! (dirty blocks dropped, the previous checkpoint stays authoritative).
//!
//! Blocks vacated by copy-on-write go onto the free queue and are only
//! handed back to the allocator once the commit that stops referencing them
//! has reached stable storage.

mod buf;

pub use buf::{BufRef, ObjectBuf};

use cowfs_alloc::SpaceAllocator;
use cowfs_block::BlockDevice;
use cowfs_error::{CowfsError, Result};
use cowfs_ondisk::set_checksum;
use cowfs_types::{BlockNumber, Xid};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Worst-case blocks consumed by one tree operation: a copy-on-write of a
/// full descent path in both the catalog and the object map, plus splits.
pub const BLOCKS_PER_TREE_OP: u64 = 32;

/// Resources a transaction declares up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TxnBudget {
    /// Maximum number of tree operations (insert, remove, replace).
    pub tree_ops: u64,
    /// Blocks needed beyond what the tree operations consume.
    pub new_blocks: u64,
}

impl TxnBudget {
    #[must_use]
    pub fn new(tree_ops: u64, new_blocks: u64) -> Self {
        Self {
            tree_ops,
            new_blocks,
        }
    }

    /// Free blocks that must exist for `begin` to succeed.
    #[must_use]
    pub fn blocks_needed(&self) -> u64 {
        self.tree_ops
            .saturating_mul(BLOCKS_PER_TREE_OP)
            .saturating_add(self.new_blocks)
    }

    fn merge(&mut self, other: Self) {
        self.tree_ops = self.tree_ops.saturating_add(other.tree_ops);
        self.new_blocks = self.new_blocks.saturating_add(other.new_blocks);
    }
}

/// Result of [`TxnManager::commit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Dirty blocks are on stable storage and `xid` is the new checkpoint.
    Committed { xid: Xid },
    /// Defer-commit mode is on: the transaction stays open until a flush.
    Deferred { xid: Xid },
}

/// State of the one in-flight transaction.
#[derive(Debug)]
pub struct Transaction {
    xid: Xid,
    budget: TxnBudget,
    dirty: BTreeMap<BlockNumber, BufRef>,
    allocated: Vec<(BlockNumber, u64)>,
    free_queue: Vec<(BlockNumber, u64)>,
    tree_ops: u64,
    blocks_allocated: u64,
    commit_pending: bool,
}

impl Transaction {
    fn new(xid: Xid, budget: TxnBudget) -> Self {
        Self {
            xid,
            budget,
            dirty: BTreeMap::new(),
            allocated: Vec::new(),
            free_queue: Vec::new(),
            tree_ops: 0,
            blocks_allocated: 0,
            commit_pending: false,
        }
    }

    #[must_use]
    pub fn xid(&self) -> Xid {
        self.xid
    }

    #[must_use]
    pub fn budget(&self) -> TxnBudget {
        self.budget
    }

    #[must_use]
    pub fn dirty_blocks(&self) -> usize {
        self.dirty.len()
    }

    #[must_use]
    pub fn tree_ops(&self) -> u64 {
        self.tree_ops
    }

    #[must_use]
    pub fn blocks_allocated(&self) -> u64 {
        self.blocks_allocated
    }

    /// Blocks waiting to be released after commit.
    #[must_use]
    pub fn free_queue(&self) -> &[(BlockNumber, u64)] {
        &self.free_queue
    }
}

/// Owner of the transaction lifecycle and of the last published xid.
#[derive(Debug)]
pub struct TxnManager {
    last_xid: Xid,
    active: Option<Transaction>,
    defer_commit: bool,
}

impl TxnManager {
    /// Manager resuming after the checkpoint `last_xid`.
    #[must_use]
    pub fn new(last_xid: Xid) -> Self {
        Self {
            last_xid,
            active: None,
            defer_commit: false,
        }
    }

    /// Xid of the last published checkpoint.
    #[must_use]
    pub fn last_committed(&self) -> Xid {
        self.last_xid
    }

    #[must_use]
    pub fn active(&self) -> Option<&Transaction> {
        self.active.as_ref()
    }

    /// Xid of the running transaction.
    pub fn xid(&self) -> Result<Xid> {
        self.active
            .as_ref()
            .map(Transaction::xid)
            .ok_or(CowfsError::NoTransaction)
    }

    fn txn_mut(&mut self) -> Result<&mut Transaction> {
        self.active.as_mut().ok_or(CowfsError::NoTransaction)
    }

    /// Start a transaction after checking the budget against free space.
    ///
    /// A transaction left open by a deferred commit is resumed instead; its
    /// budget grows by `budget`.
    pub fn begin(&mut self, budget: TxnBudget, free_blocks: u64) -> Result<Xid> {
        let needed = budget.blocks_needed();
        if let Some(txn) = self.active.as_mut() {
            if !txn.commit_pending {
                return Err(CowfsError::TransactionActive);
            }
            if needed > free_blocks {
                return Err(CowfsError::NoSpace);
            }
            txn.commit_pending = false;
            txn.budget.merge(budget);
            debug!(xid = txn.xid.0, "txn_resume");
            return Ok(txn.xid);
        }
        if needed > free_blocks {
            debug!(needed, free_blocks, "txn_budget_rejected");
            return Err(CowfsError::NoSpace);
        }
        let xid = self.last_xid.next();
        self.active = Some(Transaction::new(xid, budget));
        debug!(
            xid = xid.0,
            tree_ops = budget.tree_ops,
            new_blocks = budget.new_blocks,
            "txn_begin"
        );
        Ok(xid)
    }

    /// Add a buffer to the dirty set. Joining twice is a no-op.
    pub fn join(&mut self, buf: &BufRef) -> Result<()> {
        let txn = self.txn_mut()?;
        txn.dirty
            .entry(buf.block())
            .or_insert_with(|| Arc::clone(buf));
        Ok(())
    }

    #[must_use]
    pub fn is_joined(&self, block: BlockNumber) -> bool {
        self.active
            .as_ref()
            .is_some_and(|txn| txn.dirty.contains_key(&block))
    }

    /// Dirty buffer for `block`, if the running transaction owns one.
    #[must_use]
    pub fn dirty(&self, block: BlockNumber) -> Option<BufRef> {
        self.active
            .as_ref()
            .and_then(|txn| txn.dirty.get(&block).cloned())
    }

    /// Remember blocks handed out by the allocator so abort can return them.
    pub fn record_alloc(&mut self, block: BlockNumber, count: u64) -> Result<()> {
        let txn = self.txn_mut()?;
        txn.allocated.push((block, count));
        txn.blocks_allocated = txn.blocks_allocated.saturating_add(count);
        let limit = txn.budget.blocks_needed();
        if txn.blocks_allocated > limit && txn.blocks_allocated - count <= limit {
            warn!(
                xid = txn.xid.0,
                allocated = txn.blocks_allocated,
                budget = limit,
                "txn_block_budget_exceeded"
            );
        }
        Ok(())
    }

    /// Count one tree operation against the budget.
    pub fn note_tree_op(&mut self) -> Result<()> {
        let txn = self.txn_mut()?;
        txn.tree_ops = txn.tree_ops.saturating_add(1);
        if txn.tree_ops == txn.budget.tree_ops.saturating_add(1) {
            warn!(
                xid = txn.xid.0,
                ops = txn.tree_ops,
                budget = txn.budget.tree_ops,
                "txn_op_budget_exceeded"
            );
        }
        Ok(())
    }

    /// Queue blocks for release once this transaction commits.
    ///
    /// A queued block is no longer written at commit.
    pub fn free_enqueue(&mut self, block: BlockNumber, count: u64) -> Result<()> {
        let txn = self.txn_mut()?;
        for offset in 0..count {
            txn.dirty.remove(&BlockNumber(block.0 + offset));
        }
        txn.free_queue.push((block, count));
        Ok(())
    }

    /// Enable or disable defer-commit mode.
    pub fn set_defer_commit(&mut self, defer: bool) {
        self.defer_commit = defer;
    }

    #[must_use]
    pub fn defer_commit(&self) -> bool {
        self.defer_commit
    }

    /// Write every dirty block, sync, release the free queue and publish the
    /// new xid.
    ///
    /// On error nothing is published and the transaction stays open, so the
    /// caller can abort it.
    pub fn commit(
        &mut self,
        dev: &dyn BlockDevice,
        alloc: &mut dyn SpaceAllocator,
    ) -> Result<CommitOutcome> {
        let defer = self.defer_commit;
        let txn = self.txn_mut()?;
        if defer {
            txn.commit_pending = true;
            debug!(xid = txn.xid.0, dirty = txn.dirty.len(), "txn_commit_deferred");
            return Ok(CommitOutcome::Deferred { xid: txn.xid });
        }
        self.write_out(dev, alloc)
    }

    /// Perform a commit that was deferred. Without one this is a no-op.
    pub fn flush(
        &mut self,
        dev: &dyn BlockDevice,
        alloc: &mut dyn SpaceAllocator,
    ) -> Result<Option<Xid>> {
        match self.active.as_ref() {
            Some(txn) if txn.commit_pending => {}
            _ => return Ok(None),
        }
        match self.write_out(dev, alloc)? {
            CommitOutcome::Committed { xid } | CommitOutcome::Deferred { xid } => Ok(Some(xid)),
        }
    }

    fn write_out(
        &mut self,
        dev: &dyn BlockDevice,
        alloc: &mut dyn SpaceAllocator,
    ) -> Result<CommitOutcome> {
        let txn = self.active.as_ref().ok_or(CowfsError::NoTransaction)?;
        for (block, buf) in &txn.dirty {
            let mut data = buf.write();
            set_checksum(&mut data);
            dev.write_block(*block, &data)?;
        }
        dev.sync()?;

        let Some(txn) = self.active.take() else {
            return Err(CowfsError::NoTransaction);
        };
        let mut released = 0_u64;
        for (block, count) in &txn.free_queue {
            match alloc.free(*block, *count) {
                Ok(()) => released += count,
                Err(err) => error!(
                    xid = txn.xid.0,
                    block = block.0,
                    count,
                    error = %err,
                    "free_queue_release_failed"
                ),
            }
        }
        self.last_xid = txn.xid;
        debug!(
            xid = txn.xid.0,
            blocks_written = txn.dirty.len(),
            blocks_released = released,
            tree_ops = txn.tree_ops,
            "txn_commit"
        );
        Ok(CommitOutcome::Committed { xid: txn.xid })
    }

    /// Drop every dirty block and return the transaction's allocations.
    pub fn abort(&mut self, alloc: &mut dyn SpaceAllocator) -> Result<()> {
        let txn = self.active.take().ok_or(CowfsError::NoTransaction)?;
        let mut first_err = None;
        for (block, count) in &txn.allocated {
            if let Err(err) = alloc.free(*block, *count) {
                error!(
                    xid = txn.xid.0,
                    block = block.0,
                    error = %err,
                    "txn_abort_release_failed"
                );
                first_err.get_or_insert(err);
            }
        }
        debug!(
            xid = txn.xid.0,
            discarded = txn.dirty.len(),
            released = txn.allocated.len(),
            "txn_abort"
        );
        first_err.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cowfs_alloc::BitmapAllocator;
    use cowfs_block::{BlockBuf, ByteBlockDevice, MemoryByteDevice};
    use cowfs_ondisk::verify_checksum;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn mem_device(blocks: usize) -> (MemoryByteDevice, ByteBlockDevice<MemoryByteDevice>) {
        let mem = MemoryByteDevice::new(4096 * blocks);
        let dev = ByteBlockDevice::new(mem.clone(), 4096).expect("device");
        (mem, dev)
    }

    /// Device whose writes fail while `fail` is set.
    struct FlakyDevice {
        inner: ByteBlockDevice<MemoryByteDevice>,
        fail: AtomicBool,
    }

    impl BlockDevice for FlakyDevice {
        fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
            self.inner.read_block(block)
        }

        fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(CowfsError::Io(std::io::Error::other("injected write failure")));
            }
            self.inner.write_block(block, data)
        }

        fn block_size(&self) -> u32 {
            self.inner.block_size()
        }

        fn block_count(&self) -> u64 {
            self.inner.block_count()
        }

        fn sync(&self) -> Result<()> {
            self.inner.sync()
        }
    }

    #[test]
    fn begin_checks_budget_against_free_space() {
        let mut txns = TxnManager::new(Xid(1));
        let budget = TxnBudget::new(2, 5);
        assert_eq!(budget.blocks_needed(), 2 * BLOCKS_PER_TREE_OP + 5);
        assert!(matches!(
            txns.begin(budget, budget.blocks_needed() - 1),
            Err(CowfsError::NoSpace)
        ));
        assert!(txns.active().is_none());
        assert_eq!(txns.begin(budget, budget.blocks_needed()).unwrap(), Xid(2));
        assert!(matches!(
            txns.begin(budget, u64::MAX),
            Err(CowfsError::TransactionActive)
        ));
    }

    #[test]
    fn join_is_idempotent() {
        let mut txns = TxnManager::new(Xid(1));
        let buf = ObjectBuf::new(BlockNumber(9), vec![0_u8; 4096]);
        assert!(matches!(txns.join(&buf), Err(CowfsError::NoTransaction)));
        txns.begin(TxnBudget::default(), 0).unwrap();
        txns.join(&buf).unwrap();
        txns.join(&buf).unwrap();
        assert!(txns.is_joined(BlockNumber(9)));
        assert_eq!(txns.active().unwrap().dirty_blocks(), 1);
        assert!(Arc::ptr_eq(&txns.dirty(BlockNumber(9)).unwrap(), &buf));
    }

    #[test]
    fn commit_writes_checksummed_blocks_and_releases_free_queue() {
        let (mem, dev) = mem_device(16);
        let mut alloc = BitmapAllocator::new(16).unwrap();
        let mut txns = TxnManager::new(Xid(1));
        txns.begin(TxnBudget::new(0, 2), alloc.free_blocks()).unwrap();

        let old = alloc.allocate(1, false).unwrap();
        let new = alloc.allocate(1, true).unwrap();
        txns.record_alloc(new, 1).unwrap();
        let buf = ObjectBuf::new(new, vec![0x5A_u8; 4096]);
        txns.join(&buf).unwrap();
        txns.free_enqueue(old, 1).unwrap();
        assert_eq!(txns.active().unwrap().free_queue(), &[(old, 1)]);

        let outcome = txns.commit(&dev, &mut alloc).unwrap();
        assert_eq!(outcome, CommitOutcome::Committed { xid: Xid(2) });
        assert_eq!(txns.last_committed(), Xid(2));
        assert!(txns.active().is_none());
        assert!(!alloc.is_allocated(old));
        assert!(alloc.is_allocated(new));

        let start = usize::try_from(new.0).unwrap() * 4096;
        let on_disk = &mem.snapshot()[start..start + 4096];
        assert!(verify_checksum(on_disk));
        assert_eq!(on_disk[100], 0x5A);
    }

    #[test]
    fn abort_returns_allocations_and_keeps_xid() {
        let mut alloc = BitmapAllocator::new(16).unwrap();
        let mut txns = TxnManager::new(Xid(4));
        txns.begin(TxnBudget::new(0, 1), alloc.free_blocks()).unwrap();
        let block = alloc.allocate(1, true).unwrap();
        txns.record_alloc(block, 1).unwrap();
        txns.join(&ObjectBuf::new(block, vec![0_u8; 4096])).unwrap();

        txns.abort(&mut alloc).unwrap();
        assert_eq!(alloc.free_blocks(), 16);
        assert_eq!(txns.last_committed(), Xid(4));
        assert!(!txns.is_joined(block));
        assert!(matches!(txns.abort(&mut alloc), Err(CowfsError::NoTransaction)));
    }

    #[test]
    fn failed_commit_leaves_transaction_abortable() {
        let (_mem, inner) = mem_device(16);
        let dev = FlakyDevice {
            inner,
            fail: AtomicBool::new(true),
        };
        let mut alloc = BitmapAllocator::new(16).unwrap();
        let mut txns = TxnManager::new(Xid(1));
        txns.begin(TxnBudget::new(0, 1), alloc.free_blocks()).unwrap();
        let block = alloc.allocate(1, true).unwrap();
        txns.record_alloc(block, 1).unwrap();
        txns.join(&ObjectBuf::new(block, vec![1_u8; 4096])).unwrap();

        assert!(matches!(
            txns.commit(&dev, &mut alloc),
            Err(CowfsError::Io(_))
        ));
        assert_eq!(txns.last_committed(), Xid(1));
        assert!(txns.is_joined(block));

        txns.abort(&mut alloc).unwrap();
        assert_eq!(alloc.free_blocks(), 16);
    }

    #[test]
    fn deferred_commit_waits_for_flush() {
        let (_mem, dev) = mem_device(8);
        let mut alloc = BitmapAllocator::new(8).unwrap();
        let mut txns = TxnManager::new(Xid(1));
        txns.set_defer_commit(true);
        txns.begin(TxnBudget::default(), 8).unwrap();
        assert_eq!(
            txns.commit(&dev, &mut alloc).unwrap(),
            CommitOutcome::Deferred { xid: Xid(2) }
        );
        assert_eq!(txns.last_committed(), Xid(1));

        // The pending transaction is resumed rather than rejected.
        assert_eq!(txns.begin(TxnBudget::new(1, 0), 64).unwrap(), Xid(2));
        assert_eq!(txns.active().unwrap().budget(), TxnBudget::new(1, 0));
        txns.commit(&dev, &mut alloc).unwrap();

        txns.set_defer_commit(false);
        assert_eq!(txns.flush(&dev, &mut alloc).unwrap(), Some(Xid(2)));
        assert_eq!(txns.last_committed(), Xid(2));
        assert_eq!(txns.flush(&dev, &mut alloc).unwrap(), None);
    }

    #[test]
    fn usage_counters_track_operations() {
        let mut txns = TxnManager::new(Xid(1));
        txns.begin(TxnBudget::new(1, 0), 64).unwrap();
        txns.note_tree_op().unwrap();
        txns.note_tree_op().unwrap();
        txns.record_alloc(BlockNumber(3), 2).unwrap();
        let txn = txns.active().unwrap();
        assert_eq!(txn.tree_ops(), 2);
        assert_eq!(txn.blocks_allocated(), 2);
    }
}
