#![forbid(unsafe_code)]
//! On-disk format parsing and encoding for cowfs containers.
//!
//! Pure format crate: no I/O, no side effects. Parses byte slices into typed
//! Rust structures (object headers, B-tree node headers, tree-info footers,
//! object-map records, checkpoint mappings) and encodes them back, plus the
//! Fletcher-64 checksum every object carries.

pub mod btree;
pub mod checkpoint;
pub mod object;

pub use btree::{
    BtreeInfo, BtreeNodeHeader, NLoc, NodeLayout, OmapKey, OmapVal, TocEntry, node_capacity,
};
pub use checkpoint::{CheckpointMapHeader, CheckpointMapping, max_maps_per_block};
pub use object::{ObjectHeader, StorageClass, fletcher64, set_checksum, verify_checksum};
