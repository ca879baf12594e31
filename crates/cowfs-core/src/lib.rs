#![forbid(unsafe_code)]
//! cowfs container API.
//!
//! A [`Container`] owns one [`ObjectStore`] behind a container-wide
//! reader/writer lock. Readers take a [`ReadSession`] and see the last
//! published checkpoint; a single writer takes a [`WriteTxn`], which holds
//! the lock exclusively until it is committed, aborted or dropped.
//!
//! ```ignore
//! let container = Container::format_bytes(MemoryByteDevice::new(8 << 20), &FormatOptions::default())?;
//! let mut txn = container.begin(TxnBudget::new(1, 0))?;
//! txn.insert(&CatalogKey::new(ObjectId(2000), 3), b"payload")?;
//! txn.commit()?;
//! assert!(container.read().get(&CatalogKey::new(ObjectId(2000), 3))?.is_some());
//! ```

mod catalog;
mod session;

pub use session::{ReadSession, WriteTxn};

pub use cowfs_btree::{
    CatalogKey, CheckpointArea, CheckpointDescriptor, FormatGeometry, MAX_DEPTH, ObjectStore,
    TreeKind, TreeReport, View,
};
pub use cowfs_txn::{CommitOutcome, TxnBudget};

use cowfs_alloc::{BitmapAllocator, SpaceAllocator};
use cowfs_block::{BlockDevice, ByteBlockDevice, ByteDevice};
use cowfs_error::{CowfsError, Result};
use cowfs_ondisk::{OmapKey, OmapVal};
use cowfs_types::{BlockNumber, Xid};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Options for [`Container::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerOptions {
    /// Verify object checksums when blocks are read from the device.
    ///
    /// Disable only for diagnostics on a damaged container.
    pub check_nodes: bool,
    /// Deepest tree descent accepted. Only [`MAX_DEPTH`] is supported.
    pub max_depth: usize,
}

impl Default for ContainerOptions {
    fn default() -> Self {
        Self {
            check_nodes: true,
            max_depth: MAX_DEPTH,
        }
    }
}

/// Options for [`Container::format`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatOptions {
    pub block_size: u32,
    /// Descriptor and data ring sizes.
    #[serde(flatten)]
    pub geometry: FormatGeometry,
    /// Options the formatted container is opened with.
    pub container: ContainerOptions,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            block_size: 4096,
            geometry: FormatGeometry::default(),
            container: ContainerOptions::default(),
        }
    }
}

/// Result of [`Container::check`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckReport {
    /// Checkpoint the check ran against.
    pub xid: Xid,
    pub omap: TreeReport,
    pub catalog: TreeReport,
    /// Problems spanning both trees.
    pub problems: Vec<String>,
}

impl CheckReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.omap.is_clean() && self.catalog.is_clean() && self.problems.is_empty()
    }
}

/// A container: object map, catalog and checkpoint state on one device.
pub struct Container {
    store: RwLock<ObjectStore>,
    options: ContainerOptions,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("options", &self.options)
            .field(
                "checkpoint",
                &self.store.try_read().map(|store| *store.committed()),
            )
            .finish_non_exhaustive()
    }
}

impl Container {
    /// Lay out an empty container on `dev`.
    ///
    /// The device's block size must match `options.block_size`. The whole
    /// device is handed to a fresh bitmap allocator.
    pub fn format(dev: Box<dyn BlockDevice>, options: &FormatOptions) -> Result<Self> {
        if dev.block_size() != options.block_size {
            return Err(CowfsError::Format(format!(
                "device block size {} does not match requested block size {}",
                dev.block_size(),
                options.block_size
            )));
        }
        check_options(&options.container)?;
        let alloc = BitmapAllocator::new(dev.block_count())?;
        let store = ObjectStore::format(
            dev,
            alloc,
            options.geometry,
            options.container.check_nodes,
        )?;
        info!(
            block_size = options.block_size,
            blocks = store.device().block_count(),
            desc_blocks = options.geometry.desc_blocks,
            data_blocks = options.geometry.data_blocks,
            "container_formatted"
        );
        Ok(Self::from_store(store, options.container))
    }

    /// [`Self::format`] on a byte-addressed device cut into
    /// `options.block_size` blocks.
    pub fn format_bytes<D: ByteDevice + 'static>(dev: D, options: &FormatOptions) -> Result<Self> {
        let dev = ByteBlockDevice::new(dev, options.block_size)?;
        Self::format(Box::new(dev), options)
    }

    /// Resume from a published checkpoint. `alloc` must account for every
    /// block in use at that checkpoint.
    pub fn open(
        dev: Box<dyn BlockDevice>,
        checkpoint: CheckpointDescriptor,
        alloc: Box<dyn SpaceAllocator>,
        options: &ContainerOptions,
    ) -> Result<Self> {
        check_options(options)?;
        let store = ObjectStore::open(dev, alloc, checkpoint, options.check_nodes)?;
        info!(
            xid = checkpoint.xid.0,
            check_nodes = options.check_nodes,
            "container_opened"
        );
        Ok(Self::from_store(store, *options))
    }

    fn from_store(store: ObjectStore, options: ContainerOptions) -> Self {
        Self {
            store: RwLock::new(store),
            options,
        }
    }

    #[must_use]
    pub fn options(&self) -> &ContainerOptions {
        &self.options
    }

    /// Descriptor of the last published checkpoint.
    ///
    /// Blocks while a write transaction is open.
    #[must_use]
    pub fn checkpoint(&self) -> CheckpointDescriptor {
        *self.store.read().committed()
    }

    #[must_use]
    pub fn free_blocks(&self) -> u64 {
        self.store.read().allocator().free_blocks()
    }

    /// Shared access to the last published checkpoint.
    #[must_use]
    pub fn read(&self) -> ReadSession<'_> {
        ReadSession::new(self.store.read())
    }

    /// Start the write transaction. Waits for readers and any other writer
    /// to finish.
    pub fn begin(&self, budget: TxnBudget) -> Result<WriteTxn<'_>> {
        WriteTxn::begin(self.store.write(), budget)
    }

    /// Keep transactions open across commits until [`Self::flush`].
    pub fn set_defer_commit(&self, defer: bool) {
        self.store.write().set_defer_commit(defer);
        debug!(defer, "container_defer_commit");
    }

    /// Write out a deferred commit, returning the published xid.
    pub fn flush(&self) -> Result<Option<Xid>> {
        self.store.write().flush()
    }

    /// Verify both trees of the last published checkpoint.
    pub fn check(&self) -> Result<CheckReport> {
        self.read().check()
    }

    /// Hand back the device, the allocator and the last published
    /// checkpoint, for a later [`Self::open`]. A transaction left open by a
    /// deferred commit is dropped.
    pub fn close(self) -> Result<(Box<dyn BlockDevice>, Box<dyn SpaceAllocator>, CheckpointDescriptor)> {
        let store = self.store.into_inner();
        if store.transaction().is_some() {
            warn!(xid = ?store.current_xid().ok(), "container_close_discards_transaction");
        }
        let parts = store.into_parts()?;
        info!(xid = parts.2.xid.0, "container_closed");
        Ok(parts)
    }
}

fn check_options(options: &ContainerOptions) -> Result<()> {
    if options.max_depth == MAX_DEPTH {
        Ok(())
    } else {
        Err(CowfsError::Unsupported(format!(
            "tree depth limit {} (only {MAX_DEPTH} is supported)",
            options.max_depth
        )))
    }
}

/// Cross-tree check: every block the object map points at must be in use.
pub(crate) fn check_mapped_blocks(store: &ObjectStore, view: View) -> Result<Vec<String>> {
    let mut problems = Vec::new();
    store.walk(view, TreeKind::Omap, |key, value| {
        let key = OmapKey::parse(key).map_err(|e| CowfsError::Parse(e.to_string()))?;
        let val = OmapVal::parse(value).map_err(|e| CowfsError::Parse(e.to_string()))?;
        let block = val.paddr;
        if !store.allocator().is_allocated(block) {
            problems.push(format!(
                "oid {} at xid {} maps to free block {}",
                key.oid.0, key.xid.0, block.0
            ));
        }
        if block == BlockNumber(0) || block.0 >= store.device().block_count() {
            problems.push(format!(
                "oid {} at xid {} maps outside the device (block {})",
                key.oid.0, key.xid.0, block.0
            ));
        }
        Ok(())
    })?;
    Ok(problems)
}
