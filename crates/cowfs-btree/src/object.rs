#![forbid(unsafe_code)]
//! Object resolver.
//!
//! Turns an oid and a storage class into a block buffer, and implements
//! copy-on-write: the first write access to an object in a transaction
//! relocates it to a freshly allocated block, stamped with the running xid,
//! and queues the old block for release at commit.

use crate::store::{ObjectStore, View};
use crate::{corruption, parse_corruption};
use cowfs_error::{CowfsError, Result};
use cowfs_ondisk::object::{stamp_physical_oid, stamp_xid};
use cowfs_ondisk::{ObjectHeader, StorageClass, set_checksum};
use cowfs_txn::{BufRef, ObjectBuf};
use cowfs_types::{BlockNumber, ObjectId};
use tracing::trace;

impl ObjectStore {
    /// Read a physical or virtual object block by address.
    ///
    /// With `write`, the returned buffer belongs to the running transaction:
    /// either the block itself when it was already written at the current
    /// xid, or a relocated copy. The caller updates whatever points at the
    /// object (parent index record, object map, root pointer).
    pub fn read_object_block(&mut self, block: BlockNumber, write: bool) -> Result<BufRef> {
        let buf = self.read_verified(block)?;
        if !write {
            return Ok(buf);
        }
        let header = ObjectHeader::parse(&buf.read()).map_err(|e| parse_corruption(block, &e))?;
        let class = header.storage_class();
        if class == StorageClass::Ephemeral {
            return Err(corruption(block, "ephemeral object addressed by block"));
        }
        let xid = self.txns.xid()?;
        if header.xid == xid {
            self.txns.join(&buf)?;
            return Ok(buf);
        }

        let new_block = self.allocate(true)?;
        let mut data = buf.to_vec();
        if class == StorageClass::Physical {
            stamp_physical_oid(&mut data, new_block);
        }
        stamp_xid(&mut data, xid);
        set_checksum(&mut data);
        self.free_block(block)?;
        let copy = ObjectBuf::new(new_block, data);
        self.txns.join(&copy)?;
        trace!(
            old_block = block.0,
            new_block = new_block.0,
            oid = header.oid.0,
            xid = xid.0,
            "object_cow"
        );
        Ok(copy)
    }

    /// Resolve an object through the running transaction, optionally for
    /// writing.
    ///
    /// Virtual objects written this way get their object-map record pointed
    /// at the relocated copy. Ephemeral objects are never relocated and
    /// cannot be requested for writing here.
    pub fn resolve_object(
        &mut self,
        oid: ObjectId,
        class: StorageClass,
        want_write: bool,
    ) -> Result<BufRef> {
        match (class, want_write) {
            (StorageClass::Physical, _) => self.read_object_block(oid.as_block(), want_write),
            (StorageClass::Virtual, true) => {
                let block = self.omap_lookup_block(oid, true)?;
                self.read_block(block)
            }
            (StorageClass::Ephemeral, true) => Err(CowfsError::Unsupported(
                "ephemeral objects cannot be resolved for writing".to_owned(),
            )),
            (_, false) => self.read_object(View::Working, oid, class),
        }
    }

    /// Read-only resolution through `view`.
    pub fn read_object(&self, view: View, oid: ObjectId, class: StorageClass) -> Result<BufRef> {
        match class {
            StorageClass::Physical => self.read_verified(oid.as_block()),
            StorageClass::Virtual => {
                let block = self.omap_resolve(view, oid)?;
                self.read_verified(block)
            }
            StorageClass::Ephemeral => self.read_ephemeral_object(view, oid),
        }
    }
}
