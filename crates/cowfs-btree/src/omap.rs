#![forbid(unsafe_code)]
//! Object-map operations: virtual oid to block address, per xid.

use crate::key::SearchKey;
use crate::query::{Query, QueryFlags};
use crate::store::{ObjectStore, View};
use crate::{corruption, parse_corruption};
use cowfs_error::{CowfsError, Result};
use cowfs_ondisk::btree::OMAP_VAL_DELETED;
use cowfs_ondisk::{OmapKey, OmapVal};
use cowfs_types::{BlockNumber, ObjectId};
use tracing::trace;

impl ObjectStore {
    fn omap_record(query: &Query) -> Result<(OmapKey, OmapVal)> {
        let block = query.node().map_or(BlockNumber(0), crate::Node::block);
        let key = OmapKey::parse(&query.key()?).map_err(|e| parse_corruption(block, &e))?;
        let val = OmapVal::parse(&query.value()?).map_err(|e| parse_corruption(block, &e))?;
        Ok((key, val))
    }

    /// Latest live mapping of `oid` visible through `view`.
    pub fn omap_lookup(&self, view: View, oid: ObjectId) -> Result<Option<(OmapKey, OmapVal)>> {
        let xid = self.descriptor(view).xid;
        let mut query = self.query(view, SearchKey::omap(oid, xid), QueryFlags::NEAREST)?;
        if !self.btree_query(&mut query)? {
            return Ok(None);
        }
        let (key, val) = Self::omap_record(&query)?;
        if key.oid != oid || val.flags & OMAP_VAL_DELETED != 0 {
            return Ok(None);
        }
        Ok(Some((key, val)))
    }

    /// Block currently holding the virtual object `oid`.
    pub fn omap_resolve(&self, view: View, oid: ObjectId) -> Result<BlockNumber> {
        match self.omap_lookup(view, oid)? {
            Some((_, val)) => Ok(val.paddr),
            None => Err(corruption(
                self.descriptor(view).omap_root,
                format!("missing object map record for oid {}", oid.0),
            )),
        }
    }

    /// Resolve `oid` in the running transaction.
    ///
    /// With `write`, the object is copied on write if needed and its record
    /// is rekeyed to the current xid and pointed at the copy. The record's
    /// flags are carried over.
    pub fn omap_lookup_block(&mut self, oid: ObjectId, write: bool) -> Result<BlockNumber> {
        if !write {
            return self.omap_resolve(View::Working, oid);
        }
        let xid = self.txns.xid()?;
        let mut query = self.query(View::Working, SearchKey::omap(oid, xid), QueryFlags::NEAREST)?;
        let found = self.btree_query(&mut query)?;
        let record = if found {
            Some(Self::omap_record(&query)?)
        } else {
            None
        };
        let Some((key, val)) =
            record.filter(|(key, val)| key.oid == oid && val.flags & OMAP_VAL_DELETED == 0)
        else {
            return Err(corruption(
                self.working.omap_root,
                format!("missing object map record for oid {}", oid.0),
            ));
        };

        let new_block = self.read_object_block(val.paddr, true)?.block();
        if new_block != val.paddr || key.xid != xid {
            let new_key = OmapKey { oid, xid }.encode();
            let new_val = OmapVal {
                flags: val.flags,
                size: self.block_size.get(),
                paddr: new_block,
            }
            .encode();
            self.btree_replace(&mut query, Some(&new_key), Some(&new_val))?;
            trace!(
                oid = oid.0,
                old_block = val.paddr.0,
                new_block = new_block.0,
                xid = xid.0,
                "omap_remap"
            );
        }
        Ok(new_block)
    }

    /// Map the new virtual object `oid` to `block` at the current xid.
    pub fn create_omap_rec(&mut self, oid: ObjectId, block: BlockNumber) -> Result<()> {
        let xid = self.txns.xid()?;
        let mut query = self.query(View::Working, SearchKey::omap(oid, xid), QueryFlags::EXACT)?;
        if self.btree_query(&mut query)? {
            return Err(CowfsError::Exists);
        }
        let key = OmapKey { oid, xid }.encode();
        let val = OmapVal {
            flags: 0,
            size: self.block_size.get(),
            paddr: block,
        }
        .encode();
        self.btree_insert(&mut query, &key, &val)?;
        trace!(oid = oid.0, block = block.0, xid = xid.0, "omap_create");
        Ok(())
    }

    /// Remove the latest mapping of `oid`. The mapping must exist.
    pub fn delete_omap_rec(&mut self, oid: ObjectId) -> Result<()> {
        let xid = self.txns.xid()?;
        let mut query = self.query(View::Working, SearchKey::omap(oid, xid), QueryFlags::NEAREST)?;
        let found = self.btree_query(&mut query)? && Self::omap_record(&query)?.0.oid == oid;
        if !found {
            return Err(corruption(
                self.working.omap_root,
                format!("missing object map record for oid {}", oid.0),
            ));
        }
        self.btree_remove(&mut query)?;
        trace!(oid = oid.0, xid = xid.0, "omap_delete");
        Ok(())
    }

    /// Every stored version of `oid`, oldest first.
    pub fn omap_versions(&self, view: View, oid: ObjectId) -> Result<Vec<(OmapKey, OmapVal)>> {
        let mut query = self.query(view, SearchKey::omap_versions(oid), QueryFlags::MULTIPLE)?;
        let mut versions = Vec::new();
        let mut found = self.btree_query(&mut query)?;
        while found {
            versions.push(Self::omap_record(&query)?);
            found = self.btree_query_next(&mut query)?;
        }
        versions.reverse();
        Ok(versions)
    }
}
