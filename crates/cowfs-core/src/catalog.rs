#![forbid(unsafe_code)]
//! Catalog record access shared by read sessions and write transactions.

use cowfs_btree::{CatalogKey, ObjectStore, Query, QueryFlags, SearchKey, TreeKind, View};
use cowfs_error::{CowfsError, Result};
use cowfs_types::ObjectId;
use tracing::trace;

fn encode(key: &CatalogKey) -> Result<Vec<u8>> {
    key.encode().map_err(|e| CowfsError::Format(e.to_string()))
}

fn decode(raw: &[u8]) -> Result<CatalogKey> {
    CatalogKey::parse(raw).map_err(|e| CowfsError::Parse(e.to_string()))
}

fn not_found(key: &CatalogKey) -> CowfsError {
    CowfsError::NotFound(format!(
        "catalog record oid={} kind={}",
        key.oid.0, key.kind
    ))
}

/// Exact lookup; the returned query is positioned for a mutation.
fn locate(store: &ObjectStore, view: View, key: &CatalogKey) -> Result<(Query, bool)> {
    // Reject keys that cannot be stored before touching the tree.
    encode(key)?;
    let mut query = store.query(view, SearchKey::catalog(key), QueryFlags::EXACT)?;
    let found = store.btree_query(&mut query)?;
    Ok((query, found))
}

pub(crate) fn get(store: &ObjectStore, view: View, key: &CatalogKey) -> Result<Option<Vec<u8>>> {
    let (query, found) = locate(store, view, key)?;
    if found {
        Ok(Some(query.value()?))
    } else {
        Ok(None)
    }
}

/// Every record of `oid`, in key order.
pub(crate) fn records_for(
    store: &ObjectStore,
    view: View,
    oid: ObjectId,
) -> Result<Vec<(CatalogKey, Vec<u8>)>> {
    let mut query = store.query(view, SearchKey::catalog_object(oid), QueryFlags::MULTIPLE)?;
    let mut records = Vec::new();
    let mut found = store.btree_query(&mut query)?;
    while found {
        records.push((decode(&query.key()?)?, query.value()?));
        found = store.btree_query_next(&mut query)?;
    }
    // The iteration runs backwards.
    records.reverse();
    Ok(records)
}

pub(crate) fn walk<F>(store: &ObjectStore, view: View, mut visit: F) -> Result<()>
where
    F: FnMut(CatalogKey, &[u8]) -> Result<()>,
{
    store.walk(view, TreeKind::Catalog, |key, value| visit(decode(key)?, value))
}

pub(crate) fn insert(store: &mut ObjectStore, key: &CatalogKey, value: &[u8]) -> Result<()> {
    let (mut query, found) = locate(store, View::Working, key)?;
    if found {
        return Err(CowfsError::Exists);
    }
    store.btree_insert(&mut query, &encode(key)?, value)?;
    trace!(oid = key.oid.0, kind = key.kind, len = value.len(), "catalog_insert");
    Ok(())
}

pub(crate) fn update(store: &mut ObjectStore, key: &CatalogKey, value: &[u8]) -> Result<()> {
    let (mut query, found) = locate(store, View::Working, key)?;
    if !found {
        return Err(not_found(key));
    }
    store.btree_replace(&mut query, None, Some(value))?;
    trace!(oid = key.oid.0, kind = key.kind, len = value.len(), "catalog_update");
    Ok(())
}

/// Remove a record, returning its value.
pub(crate) fn remove(store: &mut ObjectStore, key: &CatalogKey) -> Result<Vec<u8>> {
    let (mut query, found) = locate(store, View::Working, key)?;
    if !found {
        return Err(not_found(key));
    }
    let value = query.value()?;
    store.btree_remove(&mut query)?;
    trace!(oid = key.oid.0, kind = key.kind, "catalog_remove");
    Ok(value)
}
