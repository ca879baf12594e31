#![forbid(unsafe_code)]
//! Checkpoint-mapping bookkeeping.
//!
//! Ephemeral objects live in the data ring of the checkpoint area and are
//! found through the mapping block in the descriptor ring. Only a single
//! mapping block per checkpoint is supported.
//!
//! The first ephemeral change of a transaction copies the mapping block to
//! the next descriptor slot and every live ephemeral object to the data-ring
//! slots following the published ones. Nothing the last published
//! checkpoint refers to is overwritten before the next one is published, so
//! the ring must hold twice the live set.

use crate::corruption;
use crate::parse_corruption;
use crate::store::{ObjectStore, View};
use cowfs_error::{CowfsError, Result};
use cowfs_ondisk::object::{OBJ_EPHEMERAL, OBJECT_TYPE_CHECKPOINT_MAP, stamp_physical_oid, stamp_xid};
use cowfs_ondisk::{CheckpointMapHeader, CheckpointMapping, ObjectHeader, max_maps_per_block};
use cowfs_txn::{BufRef, ObjectBuf};
use cowfs_types::{BlockNumber, ObjectId};
use tracing::{trace, warn};

const EMPTY_MAPPING: CheckpointMapping = CheckpointMapping {
    type_and_flags: 0,
    subtype: 0,
    size: 0,
    pad: 0,
    fs_oid: ObjectId(0),
    oid: ObjectId(0),
    paddr: BlockNumber(0),
};

fn parse_mappings(block: BlockNumber, data: &[u8]) -> Result<(CheckpointMapHeader, Vec<CheckpointMapping>)> {
    let header = CheckpointMapHeader::parse(data).map_err(|e| parse_corruption(block, &e))?;
    let count = usize::try_from(header.count).unwrap_or(usize::MAX);
    if count > max_maps_per_block(data.len()) {
        return Err(corruption(
            block,
            format!("checkpoint map holds {count} entries"),
        ));
    }
    let mappings = (0..count)
        .map(|index| CheckpointMapping::parse(data, index).map_err(|e| parse_corruption(block, &e)))
        .collect::<Result<Vec<_>>>()?;
    Ok((header, mappings))
}

impl ObjectStore {
    fn cpm_block(&self, view: View) -> Result<BlockNumber> {
        let area = self.descriptor(view).area;
        match area.desc_len {
            0 => Err(corruption(area.desc_base, "checkpoint has no mapping block")),
            1 => Ok(area.desc_block(0)),
            blocks => {
                warn!(blocks, "checkpoint_map_multiblock");
                Err(CowfsError::Unsupported(
                    "checkpoints with more than one mapping block".to_owned(),
                ))
            }
        }
    }

    fn read_cpm(&self, view: View) -> Result<BufRef> {
        let block = self.cpm_block(view)?;
        let buf = self.read_verified(block)?;
        let header = ObjectHeader::parse(&buf.read()).map_err(|e| parse_corruption(block, &e))?;
        if header.object_type() != OBJECT_TYPE_CHECKPOINT_MAP {
            return Err(corruption(block, "not a checkpoint mapping block"));
        }
        Ok(buf)
    }

    /// The working mapping block, relocated to the next descriptor slot on
    /// first modification in the running transaction together with the
    /// ephemeral objects it maps.
    fn cpm_for_write(&mut self) -> Result<BufRef> {
        let block = self.cpm_block(View::Working)?;
        if let Some(buf) = self.txns.dirty(block) {
            return Ok(buf);
        }
        let xid = self.txns.xid()?;
        let old = self.read_cpm(View::Working)?;
        let area = self.working.area;
        let next = (area.desc_index + 1) % area.desc_blocks.max(1);
        let new_block = BlockNumber(area.desc_base.0 + u64::from(next));

        let mut data = old.to_vec();
        let (_, mappings) = parse_mappings(block, &data)?;
        let moved = self.relocate_ephemerals(&mappings)?;
        for (index, mapping) in moved.iter().enumerate() {
            mapping.write(&mut data, index);
        }
        stamp_physical_oid(&mut data, new_block);
        stamp_xid(&mut data, xid);
        let copy = ObjectBuf::new(new_block, data);
        self.txns.join(&copy)?;
        self.working.area.desc_index = next;
        trace!(
            old_block = block.0,
            new_block = new_block.0,
            xid = xid.0,
            "checkpoint_map_relocate"
        );
        Ok(copy)
    }

    /// Copy every ephemeral object, in ring order, to the slots right after
    /// the current run and return the mappings pointing at the copies.
    fn relocate_ephemerals(
        &mut self,
        mappings: &[CheckpointMapping],
    ) -> Result<Vec<CheckpointMapping>> {
        let xid = self.txns.xid()?;
        let area = self.working.area;
        if area.data_len.saturating_mul(2) > area.data_blocks {
            warn!(
                data_len = area.data_len,
                data_blocks = area.data_blocks,
                "checkpoint_data_full"
            );
            return Err(CowfsError::NoSpace);
        }
        let mut target = area;
        target.data_index = area.data_slot(area.data_len);

        let mut moved = Vec::with_capacity(mappings.len());
        for mapping in mappings {
            let offset = area
                .data_offset(mapping.paddr)
                .filter(|offset| *offset < area.data_len)
                .ok_or_else(|| corruption(mapping.paddr, "mapped block lies outside the data area"))?;
            let new_block = target.data_block(offset);
            let mut data = self.read_verified(mapping.paddr)?.to_vec();
            stamp_xid(&mut data, xid);
            self.place_ephemeral(new_block, data)?;
            moved.push(CheckpointMapping {
                paddr: new_block,
                ..*mapping
            });
        }
        self.working.area.data_index = target.data_index;
        if !moved.is_empty() {
            trace!(
                count = moved.len(),
                from = area.data_index,
                to = target.data_index,
                xid = xid.0,
                "ephemeral_relocate"
            );
        }
        Ok(moved)
    }

    /// Every mapping of the checkpoint seen through `view`.
    pub fn checkpoint_mappings(&self, view: View) -> Result<Vec<CheckpointMapping>> {
        let buf = self.read_cpm(view)?;
        let (_, mappings) = parse_mappings(buf.block(), &buf.read())?;
        Ok(mappings)
    }

    pub fn cpm_lookup(&self, view: View, oid: ObjectId) -> Result<Option<CheckpointMapping>> {
        Ok(self
            .checkpoint_mappings(view)?
            .into_iter()
            .find(|mapping| mapping.oid == oid))
    }

    /// Read the ephemeral object `oid`. A missing mapping is corruption.
    pub fn read_ephemeral_object(&self, view: View, oid: ObjectId) -> Result<BufRef> {
        let mapping = self.cpm_lookup(view, oid)?.ok_or_else(|| {
            corruption(
                self.descriptor(view).area.desc_base,
                format!("missing checkpoint mapping for oid {}", oid.0),
            )
        })?;
        self.read_verified(mapping.paddr)
    }

    /// Append a mapping for the ephemeral object `oid` stored at `block`.
    pub fn create_cpoint_map(
        &mut self,
        oid: ObjectId,
        block: BlockNumber,
        object_type: u32,
        subtype: u32,
    ) -> Result<()> {
        let buf = self.cpm_for_write()?;
        let size = self.block_size.get();
        let mut data = buf.write();
        let (mut header, mappings) = parse_mappings(buf.block(), &data)?;
        let count = mappings.len();
        if count >= max_maps_per_block(data.len()) {
            warn!(count, oid = oid.0, "checkpoint_map_full");
            return Err(CowfsError::Unsupported(
                "creation of additional mapping blocks".to_owned(),
            ));
        }
        CheckpointMapping {
            type_and_flags: OBJ_EPHEMERAL | object_type,
            subtype,
            size,
            pad: 0,
            fs_oid: ObjectId(0),
            oid,
            paddr: block,
        }
        .write(&mut data, count);
        header.count += 1;
        header.write(&mut data);
        trace!(oid = oid.0, block = block.0, count = header.count, "checkpoint_map_create");
        Ok(())
    }

    /// Remove the mapping for `block` and renumber the mappings stored
    /// after it in the data ring, each moving back by one slot.
    ///
    /// `block` is the address the running transaction maps.
    pub fn remove_cpoint_map(&mut self, block: BlockNumber) -> Result<()> {
        let buf = self.cpm_for_write()?;
        let area = self.working.area;
        let removed = area
            .data_offset(block)
            .ok_or_else(|| corruption(block, "mapped block lies outside the data area"))?;
        let mut data = buf.write();
        let (mut header, mappings) = parse_mappings(buf.block(), &data)?;
        let pos = mappings
            .iter()
            .position(|mapping| mapping.paddr == block)
            .ok_or_else(|| corruption(block, "no checkpoint mapping for block"))?;

        let kept = mappings
            .into_iter()
            .enumerate()
            .filter(|(index, _)| *index != pos)
            .map(|(_, mut mapping)| {
                if let Some(offset) = area.data_offset(mapping.paddr) {
                    if offset > removed {
                        mapping.paddr = area.data_block(offset - 1);
                    }
                }
                mapping
            })
            .collect::<Vec<_>>();
        for (index, mapping) in kept.iter().enumerate() {
            mapping.write(&mut data, index);
        }
        EMPTY_MAPPING.write(&mut data, kept.len());
        header.count -= 1;
        header.write(&mut data);
        trace!(block = block.0, count = header.count, "checkpoint_map_remove");
        Ok(())
    }

    /// Create an ephemeral object at the end of the data ring.
    pub fn create_ephemeral_object(
        &mut self,
        object_type: u32,
        subtype: u32,
    ) -> Result<(ObjectId, BufRef)> {
        let xid = self.txns.xid()?;
        self.cpm_for_write()?;
        let area = self.working.area;
        // The published run stays reserved until the next checkpoint.
        if area.data_len.saturating_add(self.committed.area.data_len) >= area.data_blocks {
            warn!(data_len = area.data_len, "checkpoint_data_full");
            return Err(CowfsError::NoSpace);
        }
        let block = area.data_block(area.data_len);
        let oid = self.next_oid();
        let mut data = vec![0; self.block_size.as_usize()];
        ObjectHeader {
            cksum: 0,
            oid,
            xid,
            type_and_flags: OBJ_EPHEMERAL | object_type,
            subtype,
        }
        .write(&mut data);
        let buf = self.place_ephemeral(block, data)?;
        self.create_cpoint_map(oid, block, object_type, subtype)?;
        self.working.area.data_len += 1;
        trace!(oid = oid.0, block = block.0, xid = xid.0, "ephemeral_create");
        Ok((oid, buf))
    }

    /// Writable buffer of the ephemeral object `oid`, stamped with the
    /// running xid.
    pub fn ephemeral_object_for_write(&mut self, oid: ObjectId) -> Result<BufRef> {
        self.cpm_for_write()?;
        let mapping = self.cpm_lookup(View::Working, oid)?.ok_or_else(|| {
            corruption(
                self.working.area.desc_base,
                format!("missing checkpoint mapping for oid {}", oid.0),
            )
        })?;
        self.txns
            .dirty(mapping.paddr)
            .ok_or_else(|| corruption(mapping.paddr, "ephemeral object was not relocated"))
    }

    /// Remove the ephemeral object `oid` and close the gap it leaves in the
    /// data ring.
    pub fn remove_ephemeral_object(&mut self, oid: ObjectId) -> Result<()> {
        let xid = self.txns.xid()?;
        self.cpm_for_write()?;
        let mapping = self.cpm_lookup(View::Working, oid)?.ok_or_else(|| {
            corruption(
                self.working.area.desc_base,
                format!("missing checkpoint mapping for oid {}", oid.0),
            )
        })?;
        let area = self.working.area;
        let removed = area
            .data_offset(mapping.paddr)
            .ok_or_else(|| corruption(mapping.paddr, "ephemeral object lies outside the data area"))?;
        self.remove_cpoint_map(mapping.paddr)?;
        for offset in removed + 1..area.data_len {
            let mut data = self.read_verified(area.data_block(offset))?.to_vec();
            stamp_xid(&mut data, xid);
            self.place_ephemeral(area.data_block(offset - 1), data)?;
        }
        self.working.area.data_len = area.data_len.saturating_sub(1);
        trace!(oid = oid.0, block = mapping.paddr.0, xid = xid.0, "ephemeral_remove");
        Ok(())
    }

    /// Put `data` into data-ring slot `block` within the transaction,
    /// overwriting a dirty copy if there is one.
    fn place_ephemeral(&mut self, block: BlockNumber, data: Vec<u8>) -> Result<BufRef> {
        if let Some(buf) = self.txns.dirty(block) {
            buf.write().copy_from_slice(&data);
            return Ok(buf);
        }
        let buf = ObjectBuf::new(block, data);
        self.txns.join(&buf)?;
        Ok(buf)
    }
}
