#![forbid(unsafe_code)]
//! Copy-on-write object store.
//!
//! [`ObjectStore`] ties a block device, a space allocator and the
//! transaction manager together and implements everything that reads or
//! mutates objects:
//!
//! - the object resolver (`object`): physical, virtual and ephemeral
//!   addressing, copy-on-write on first modification in a transaction;
//! - checkpoint-mapping bookkeeping (`checkpoint`) for ephemeral objects;
//! - the B-tree node engine (`node`) and the query engine (`query`) that
//!   drives search, insert, remove and replace from the root down;
//! - object-map operations (`omap`) and whole-tree walks (`walk`).
//!
//! Two trees live in a container: the object map, whose nodes are physical
//! and which maps virtual oids to block addresses, and the catalog, whose
//! nodes are virtual.

mod checkpoint;
mod key;
mod node;
mod object;
mod omap;
mod query;
mod store;
mod walk;

pub use key::{CatalogKey, NameMatch, OBJ_ID_MASK, OBJ_TYPE_SHIFT, SearchKey, TreeKind};
pub use node::{LocalWrite, Node, Record};
pub use query::{MAX_DEPTH, Query, QueryFlags};
pub use store::{CheckpointArea, CheckpointDescriptor, FormatGeometry, ObjectStore, View};
pub use walk::TreeReport;

use cowfs_error::CowfsError;
use cowfs_types::{BlockNumber, ParseError};

/// Attach the block being parsed to a parse-layer error.
pub(crate) fn parse_corruption(block: BlockNumber, err: &ParseError) -> CowfsError {
    CowfsError::Corruption {
        block: block.0,
        detail: err.to_string(),
    }
}

pub(crate) fn corruption(block: BlockNumber, detail: impl Into<String>) -> CowfsError {
    CowfsError::Corruption {
        block: block.0,
        detail: detail.into(),
    }
}
