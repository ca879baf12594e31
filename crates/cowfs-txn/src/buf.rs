#![forbid(unsafe_code)]

use cowfs_types::BlockNumber;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::Arc;

/// In-memory copy of one object block.
///
/// Shared between every query frame that references the block. A buffer
/// joined to the running transaction is the only copy that may be
/// modified; clean buffers read from the device are treated as read-only.
#[derive(Debug)]
pub struct ObjectBuf {
    block: BlockNumber,
    data: RwLock<Vec<u8>>,
}

/// Reference-counted handle to an [`ObjectBuf`].
pub type BufRef = Arc<ObjectBuf>;

impl ObjectBuf {
    #[must_use]
    pub fn new(block: BlockNumber, data: Vec<u8>) -> BufRef {
        Arc::new(Self {
            block,
            data: RwLock::new(data),
        })
    }

    #[must_use]
    pub fn block(&self) -> BlockNumber {
        self.block
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.data.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.data.write()
    }

    /// Copy of the current bytes.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.data.read().clone()
    }
}
