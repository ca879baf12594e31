#![forbid(unsafe_code)]
//! Lock-scoped access to a container.

use crate::{CheckReport, catalog, check_mapped_blocks};
use cowfs_btree::{CatalogKey, CheckpointDescriptor, ObjectStore, TreeKind, View};
use cowfs_error::Result;
use cowfs_txn::{CommitOutcome, TxnBudget};
use cowfs_types::{BlockNumber, ObjectId, Xid};
use parking_lot::{RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, error, warn};

/// Shared view of the last published checkpoint.
///
/// Any number of sessions can be open at once; a write transaction waits
/// until all of them are dropped.
pub struct ReadSession<'a> {
    store: RwLockReadGuard<'a, ObjectStore>,
}

impl<'a> ReadSession<'a> {
    pub(crate) fn new(store: RwLockReadGuard<'a, ObjectStore>) -> Self {
        Self { store }
    }

    #[must_use]
    pub fn checkpoint(&self) -> &CheckpointDescriptor {
        self.store.committed()
    }

    #[must_use]
    pub fn xid(&self) -> Xid {
        self.store.committed().xid
    }

    /// Low-level access for object-map and checkpoint-map queries.
    #[must_use]
    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    pub fn get(&self, key: &CatalogKey) -> Result<Option<Vec<u8>>> {
        catalog::get(&self.store, View::Committed, key)
    }

    /// Every catalog record of `oid`, in key order.
    pub fn records_for(&self, oid: ObjectId) -> Result<Vec<(CatalogKey, Vec<u8>)>> {
        catalog::records_for(&self.store, View::Committed, oid)
    }

    /// Visit every catalog record in key order.
    pub fn walk<F>(&self, visit: F) -> Result<()>
    where
        F: FnMut(CatalogKey, &[u8]) -> Result<()>,
    {
        catalog::walk(&self.store, View::Committed, visit)
    }

    /// Block holding the virtual object `oid`.
    pub fn omap_resolve(&self, oid: ObjectId) -> Result<BlockNumber> {
        self.store.omap_resolve(View::Committed, oid)
    }

    pub fn check(&self) -> Result<CheckReport> {
        let store: &ObjectStore = &self.store;
        let report = CheckReport {
            xid: store.committed().xid,
            omap: store.check_tree(View::Committed, TreeKind::Omap)?,
            catalog: store.check_tree(View::Committed, TreeKind::Catalog)?,
            problems: check_mapped_blocks(store, View::Committed)?,
        };
        if report.is_clean() {
            debug!(
                xid = report.xid.0,
                catalog_records = report.catalog.records,
                omap_records = report.omap.records,
                "container_check_clean"
            );
        } else {
            warn!(
                xid = report.xid.0,
                omap = report.omap.problems.len(),
                catalog = report.catalog.problems.len(),
                cross = report.problems.len(),
                "container_check_problems"
            );
        }
        Ok(report)
    }
}

/// The write transaction, holding the container lock exclusively.
///
/// Reads through a `WriteTxn` see its own uncommitted changes. Dropping it
/// without [`Self::commit`] aborts, and so does a failed commit.
pub struct WriteTxn<'a> {
    store: RwLockWriteGuard<'a, ObjectStore>,
    xid: Xid,
    open: bool,
}

impl std::fmt::Debug for WriteTxn<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteTxn")
            .field("xid", &self.xid)
            .field("open", &self.open)
            .finish_non_exhaustive()
    }
}

impl<'a> WriteTxn<'a> {
    pub(crate) fn begin(mut store: RwLockWriteGuard<'a, ObjectStore>, budget: TxnBudget) -> Result<Self> {
        let xid = store.begin(budget)?;
        Ok(Self {
            store,
            xid,
            open: true,
        })
    }

    #[must_use]
    pub fn xid(&self) -> Xid {
        self.xid
    }

    #[must_use]
    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    /// Low-level access for object-map and checkpoint-map mutations.
    pub fn store_mut(&mut self) -> &mut ObjectStore {
        &mut self.store
    }

    pub fn get(&self, key: &CatalogKey) -> Result<Option<Vec<u8>>> {
        catalog::get(&self.store, View::Working, key)
    }

    pub fn records_for(&self, oid: ObjectId) -> Result<Vec<(CatalogKey, Vec<u8>)>> {
        catalog::records_for(&self.store, View::Working, oid)
    }

    pub fn walk<F>(&self, visit: F) -> Result<()>
    where
        F: FnMut(CatalogKey, &[u8]) -> Result<()>,
    {
        catalog::walk(&self.store, View::Working, visit)
    }

    /// Add a record. An existing record with the same key is `Exists`.
    pub fn insert(&mut self, key: &CatalogKey, value: &[u8]) -> Result<()> {
        catalog::insert(&mut self.store, key, value)
    }

    /// Replace the value of an existing record.
    pub fn update(&mut self, key: &CatalogKey, value: &[u8]) -> Result<()> {
        catalog::update(&mut self.store, key, value)
    }

    /// Remove a record, returning its value.
    pub fn remove(&mut self, key: &CatalogKey) -> Result<Vec<u8>> {
        catalog::remove(&mut self.store, key)
    }

    /// Publish the transaction. On error it is aborted when `self` drops.
    pub fn commit(mut self) -> Result<CommitOutcome> {
        let outcome = self.store.commit()?;
        self.open = false;
        debug!(xid = self.xid.0, ?outcome, "write_txn_commit");
        Ok(outcome)
    }

    pub fn abort(mut self) -> Result<()> {
        self.open = false;
        self.store.abort()
    }
}

impl Drop for WriteTxn<'_> {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        warn!(xid = self.xid.0, "write_txn_dropped");
        if let Err(err) = self.store.abort() {
            error!(xid = self.xid.0, error = %err, "write_txn_abort_failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Container, FormatOptions};
    use cowfs_block::MemoryByteDevice;
    use cowfs_error::CowfsError;

    fn container() -> Container {
        Container::format_bytes(MemoryByteDevice::new(4096 * 2048), &FormatOptions::default())
            .unwrap()
    }

    fn key(oid: u64, kind: u8) -> CatalogKey {
        CatalogKey::new(ObjectId(oid), kind)
    }

    #[test]
    fn insert_get_update_remove() {
        let c = container();
        let mut txn = c.begin(TxnBudget::new(4, 0)).unwrap();
        assert_eq!(txn.xid(), Xid(2));
        txn.insert(&key(2000, 3), b"first").unwrap();
        assert_eq!(txn.get(&key(2000, 3)).unwrap().as_deref(), Some(&b"first"[..]));
        txn.update(&key(2000, 3), b"second value").unwrap();
        assert_eq!(txn.commit().unwrap(), CommitOutcome::Committed { xid: Xid(2) });

        assert_eq!(
            c.read().get(&key(2000, 3)).unwrap().as_deref(),
            Some(&b"second value"[..])
        );

        let mut txn = c.begin(TxnBudget::new(1, 0)).unwrap();
        assert_eq!(txn.remove(&key(2000, 3)).unwrap(), b"second value");
        assert!(txn.get(&key(2000, 3)).unwrap().is_none());
        txn.commit().unwrap();
        assert!(c.read().get(&key(2000, 3)).unwrap().is_none());
    }

    #[test]
    fn duplicate_and_missing_keys() {
        let c = container();
        let mut txn = c.begin(TxnBudget::new(4, 0)).unwrap();
        txn.insert(&key(7, 1), b"x").unwrap();
        assert!(matches!(txn.insert(&key(7, 1), b"y"), Err(CowfsError::Exists)));
        assert!(matches!(txn.update(&key(8, 1), b"y"), Err(CowfsError::NotFound(_))));
        assert!(matches!(txn.remove(&key(8, 1)), Err(CowfsError::NotFound(_))));
        txn.commit().unwrap();
    }

    #[test]
    fn named_and_unnamed_records_stay_distinct() {
        let c = container();
        let alpha = CatalogKey::named(ObjectId(5), 3, "alpha");
        let zzz = CatalogKey::named(ObjectId(6), 3, "zzz");
        let mut txn = c.begin(TxnBudget::new(4, 0)).unwrap();
        txn.insert(&alpha, b"named").unwrap();
        assert!(txn.get(&key(5, 3)).unwrap().is_none());
        txn.insert(&key(5, 3), b"unnamed").unwrap();
        txn.insert(&key(6, 3), b"six").unwrap();
        assert!(txn.get(&zzz).unwrap().is_none());
        assert!(matches!(txn.remove(&zzz), Err(CowfsError::NotFound(_))));
        txn.commit().unwrap();

        let session = c.read();
        assert_eq!(session.get(&key(5, 3)).unwrap().as_deref(), Some(&b"unnamed"[..]));
        assert_eq!(session.get(&alpha).unwrap().as_deref(), Some(&b"named"[..]));
        assert_eq!(session.get(&key(6, 3)).unwrap().as_deref(), Some(&b"six"[..]));
        assert_eq!(session.records_for(ObjectId(5)).unwrap().len(), 2);
    }

    #[test]
    fn dropping_a_transaction_aborts_it() {
        let c = container();
        let free = c.free_blocks();
        {
            let mut txn = c.begin(TxnBudget::new(1, 0)).unwrap();
            txn.insert(&key(1, 1), b"gone").unwrap();
        }
        assert!(c.read().get(&key(1, 1)).unwrap().is_none());
        assert_eq!(c.free_blocks(), free);
        // The xid is reused.
        let txn = c.begin(TxnBudget::new(1, 0)).unwrap();
        assert_eq!(txn.xid(), Xid(2));
        txn.abort().unwrap();
    }

    #[test]
    fn records_for_lists_one_object_in_key_order() {
        let c = container();
        let mut txn = c.begin(TxnBudget::new(50, 0)).unwrap();
        for name in 0..150_u32 {
            let k = CatalogKey::named(ObjectId(42), 9, format!("entry-{name:04}"));
            txn.insert(&k, &[7; 64]).unwrap();
        }
        txn.insert(&key(41, 3), b"before").unwrap();
        txn.insert(&key(42, 3), b"inode").unwrap();
        txn.insert(&key(43, 3), b"after").unwrap();
        txn.commit().unwrap();

        let session = c.read();
        let records = session.records_for(ObjectId(42)).unwrap();
        assert_eq!(records.len(), 151);
        assert_eq!(records[0].0, key(42, 3));
        assert_eq!(records[1].0.name.as_deref(), Some(&b"entry-0000"[..]));
        assert_eq!(records[150].0.name.as_deref(), Some(&b"entry-0149"[..]));
        assert!(session.records_for(ObjectId(44)).unwrap().is_empty());
    }

    #[test]
    fn transaction_reads_see_uncommitted_changes_only_inside() {
        let c = container();
        let mut txn = c.begin(TxnBudget::new(1, 0)).unwrap();
        txn.insert(&key(5, 5), b"pending").unwrap();
        let mut seen = Vec::new();
        txn.walk(|k, v| {
            seen.push((k, v.to_vec()));
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![(key(5, 5), b"pending".to_vec())]);
        assert_eq!(txn.store().committed().xid, Xid(1));
        txn.commit().unwrap();
    }

    #[test]
    fn deferred_commit_publishes_on_flush() {
        let c = container();
        c.set_defer_commit(true);
        let mut txn = c.begin(TxnBudget::new(1, 0)).unwrap();
        txn.insert(&key(9, 1), b"a").unwrap();
        assert_eq!(txn.commit().unwrap(), CommitOutcome::Deferred { xid: Xid(2) });
        assert!(c.read().get(&key(9, 1)).unwrap().is_none());

        // The next transaction continues the deferred one.
        let mut txn = c.begin(TxnBudget::new(1, 0)).unwrap();
        assert_eq!(txn.xid(), Xid(2));
        txn.insert(&key(9, 2), b"b").unwrap();
        txn.commit().unwrap();

        assert_eq!(c.flush().unwrap(), Some(Xid(2)));
        assert_eq!(c.flush().unwrap(), None);
        let session = c.read();
        assert_eq!(session.xid(), Xid(2));
        assert_eq!(session.records_for(ObjectId(9)).unwrap().len(), 2);
    }

    #[test]
    fn failed_begin_reports_the_error() {
        let c = container();
        let err = c.begin(TxnBudget::new(u64::MAX / 64, 0)).unwrap_err();
        assert!(matches!(err, CowfsError::NoSpace));
        let txn = c.begin(TxnBudget::new(1, 0)).unwrap();
        assert_eq!(format!("{txn:?}"), "WriteTxn { xid: Xid(2), open: true, .. }");
        txn.abort().unwrap();
    }

    #[test]
    fn oversized_key_is_rejected_before_the_tree_is_touched() {
        let c = container();
        let mut txn = c.begin(TxnBudget::new(1, 0)).unwrap();
        let huge = CatalogKey::named(ObjectId(1), 1, vec![b'n'; 70_000]);
        assert!(matches!(txn.insert(&huge, b"v"), Err(CowfsError::Format(_))));
        let long = CatalogKey::named(ObjectId(1), 1, vec![b'n'; 3000]);
        assert!(matches!(
            txn.insert(&long, &[0; 2000]),
            Err(CowfsError::RecordTooLarge { .. })
        ));
        txn.abort().unwrap();
    }
}
