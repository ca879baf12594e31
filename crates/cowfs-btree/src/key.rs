#![forbid(unsafe_code)]

use cowfs_ondisk::object::{OBJECT_TYPE_FSTREE, OBJECT_TYPE_OMAP};
use cowfs_ondisk::{NodeLayout, OmapKey, StorageClass};
use cowfs_types::{ObjectId, ParseError, Xid, read_le_u16, read_le_u64, usize_to_u16};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Low bits of a catalog key header: the object id.
pub const OBJ_ID_MASK: u64 = 0x0fff_ffff_ffff_ffff;
/// The record kind lives in the top four bits.
pub const OBJ_TYPE_SHIFT: u32 = 60;

const CATALOG_HEADER_SIZE: usize = 8;
const NAME_LEN_SIZE: usize = 2;

/// Which tree a node or query belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TreeKind {
    /// Object map: physical nodes, fixed-size records.
    Omap,
    /// Catalog: virtual nodes, variable-size records.
    Catalog,
}

impl TreeKind {
    /// Addressing class of the tree's nodes.
    #[must_use]
    pub fn storage(self) -> StorageClass {
        match self {
            Self::Omap => StorageClass::Physical,
            Self::Catalog => StorageClass::Virtual,
        }
    }

    /// Object subtype stamped into every node header.
    #[must_use]
    pub fn subtype(self) -> u32 {
        match self {
            Self::Omap => OBJECT_TYPE_OMAP,
            Self::Catalog => OBJECT_TYPE_FSTREE,
        }
    }

    #[must_use]
    pub fn layout(self, is_leaf: bool) -> NodeLayout {
        match self {
            Self::Omap if is_leaf => NodeLayout::OMAP_LEAF,
            Self::Omap => NodeLayout::OMAP_INDEX,
            Self::Catalog => NodeLayout::Variable,
        }
    }

    /// Total order over two raw keys of this tree.
    pub fn compare_raw(self, a: &[u8], b: &[u8]) -> Result<Ordering, ParseError> {
        match self {
            Self::Omap => Ok(OmapKey::parse(a)?.cmp(&OmapKey::parse(b)?)),
            Self::Catalog => Ok(CatalogKey::parse(a)?.cmp(&CatalogKey::parse(b)?)),
        }
    }
}

/// Decoded catalog key.
///
/// Ordered by object id, then record kind, then name bytes; records without
/// a name sort before named records of the same kind.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CatalogKey {
    pub oid: ObjectId,
    pub kind: u8,
    pub name: Option<Vec<u8>>,
}

impl CatalogKey {
    /// Unnamed record. `oid` is truncated to 60 bits and `kind` to 4.
    #[must_use]
    pub fn new(oid: ObjectId, kind: u8) -> Self {
        Self {
            oid: ObjectId(oid.0 & OBJ_ID_MASK),
            kind: kind & 0x0f,
            name: None,
        }
    }

    #[must_use]
    pub fn named(oid: ObjectId, kind: u8, name: impl Into<Vec<u8>>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::new(oid, kind)
        }
    }

    pub fn parse(raw: &[u8]) -> Result<Self, ParseError> {
        let header = read_le_u64(raw, 0)?;
        let oid = ObjectId(header & OBJ_ID_MASK);
        let kind = u8::try_from(header >> OBJ_TYPE_SHIFT).map_err(|_| {
            ParseError::IntegerConversion {
                field: "catalog_kind",
            }
        })?;
        if raw.len() == CATALOG_HEADER_SIZE {
            return Ok(Self {
                oid,
                kind,
                name: None,
            });
        }
        let name_len = usize::from(read_le_u16(raw, CATALOG_HEADER_SIZE)?);
        let start = CATALOG_HEADER_SIZE + NAME_LEN_SIZE;
        if raw.len() != start + name_len {
            return Err(ParseError::InvalidField {
                field: "catalog_name_len",
                reason: "does not match key length",
            });
        }
        Ok(Self {
            oid,
            kind,
            name: Some(raw[start..].to_vec()),
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, ParseError> {
        let header = (self.oid.0 & OBJ_ID_MASK) | (u64::from(self.kind & 0x0f) << OBJ_TYPE_SHIFT);
        let mut raw = header.to_le_bytes().to_vec();
        if let Some(name) = &self.name {
            let len = usize_to_u16(name.len(), "catalog_name_len")?;
            raw.extend_from_slice(&len.to_le_bytes());
            raw.extend_from_slice(name);
        }
        Ok(raw)
    }
}

/// Name component of a catalog search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameMatch {
    /// Any name, and unnamed records too.
    Any,
    /// Exactly this name; `None` is the unnamed record.
    Exact(Option<Vec<u8>>),
}

/// What a query is looking for.
///
/// A `None` xid or kind, or [`NameMatch::Any`], matches every value of that
/// component, so a search key can name a single record or a contiguous run
/// of records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchKey {
    Omap {
        oid: ObjectId,
        xid: Option<Xid>,
    },
    Catalog {
        oid: ObjectId,
        kind: Option<u8>,
        name: NameMatch,
    },
}

impl SearchKey {
    /// Latest version of `oid` visible at `xid`.
    #[must_use]
    pub fn omap(oid: ObjectId, xid: Xid) -> Self {
        Self::Omap { oid, xid: Some(xid) }
    }

    /// Every version of `oid`.
    #[must_use]
    pub fn omap_versions(oid: ObjectId) -> Self {
        Self::Omap { oid, xid: None }
    }

    /// Exactly `key`.
    #[must_use]
    pub fn catalog(key: &CatalogKey) -> Self {
        Self::Catalog {
            oid: key.oid,
            kind: Some(key.kind),
            name: NameMatch::Exact(key.name.clone()),
        }
    }

    /// Every catalog record of `oid`.
    #[must_use]
    pub fn catalog_object(oid: ObjectId) -> Self {
        Self::Catalog {
            oid: ObjectId(oid.0 & OBJ_ID_MASK),
            kind: None,
            name: NameMatch::Any,
        }
    }

    /// Search key matching exactly the stored key `raw`.
    pub fn from_raw(tree: TreeKind, raw: &[u8]) -> Result<Self, ParseError> {
        match tree {
            TreeKind::Omap => {
                let key = OmapKey::parse(raw)?;
                Ok(Self::omap(key.oid, key.xid))
            }
            TreeKind::Catalog => Ok(Self::catalog(&CatalogKey::parse(raw)?)),
        }
    }

    #[must_use]
    pub fn tree(&self) -> TreeKind {
        match self {
            Self::Omap { .. } => TreeKind::Omap,
            Self::Catalog { .. } => TreeKind::Catalog,
        }
    }

    /// Order of the stored key `raw` relative to this search key.
    pub fn compare(&self, raw: &[u8]) -> Result<Ordering, ParseError> {
        match self {
            Self::Omap { oid, xid } => {
                let rec = OmapKey::parse(raw)?;
                let ord = rec.oid.cmp(oid);
                match xid {
                    Some(xid) if ord == Ordering::Equal => Ok(rec.xid.cmp(xid)),
                    _ => Ok(ord),
                }
            }
            Self::Catalog { oid, kind, name } => {
                let rec = CatalogKey::parse(raw)?;
                let ord = rec.oid.cmp(oid);
                if ord != Ordering::Equal {
                    return Ok(ord);
                }
                let Some(kind) = kind else {
                    return Ok(Ordering::Equal);
                };
                let ord = rec.kind.cmp(kind);
                if ord != Ordering::Equal {
                    return Ok(ord);
                }
                match name {
                    NameMatch::Any => Ok(Ordering::Equal),
                    NameMatch::Exact(name) => Ok(rec.name.as_deref().cmp(&name.as_deref())),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn omap_raw(oid: u64, xid: u64) -> [u8; 16] {
        OmapKey {
            oid: ObjectId(oid),
            xid: Xid(xid),
        }
        .encode()
    }

    #[test]
    fn catalog_key_packs_kind_into_top_bits() {
        let key = CatalogKey::new(ObjectId(0x1234), 3);
        let raw = key.encode().unwrap();
        assert_eq!(raw.len(), 8);
        assert_eq!(read_le_u64(&raw, 0).unwrap(), (3_u64 << 60) | 0x1234);
        assert_eq!(CatalogKey::parse(&raw).unwrap(), key);
    }

    #[test]
    fn named_catalog_key_round_trip() {
        let key = CatalogKey::named(ObjectId(77), 9, b"hello".to_vec());
        let raw = key.encode().unwrap();
        assert_eq!(raw.len(), 8 + 2 + 5);
        assert_eq!(CatalogKey::parse(&raw).unwrap(), key);
    }

    #[test]
    fn truncated_name_is_rejected() {
        let mut raw = CatalogKey::named(ObjectId(1), 1, b"abc".to_vec())
            .encode()
            .unwrap();
        raw.pop();
        assert!(CatalogKey::parse(&raw).is_err());
        assert!(CatalogKey::parse(&[0_u8; 4]).is_err());
    }

    #[test]
    fn omap_search_ignores_xid_when_absent() {
        let search = SearchKey::omap_versions(ObjectId(10));
        assert_eq!(search.compare(&omap_raw(10, 1)).unwrap(), Ordering::Equal);
        assert_eq!(search.compare(&omap_raw(10, 99)).unwrap(), Ordering::Equal);
        assert_eq!(search.compare(&omap_raw(9, 99)).unwrap(), Ordering::Less);
        assert_eq!(search.compare(&omap_raw(11, 0)).unwrap(), Ordering::Greater);

        let exact = SearchKey::omap(ObjectId(10), Xid(5));
        assert_eq!(exact.compare(&omap_raw(10, 4)).unwrap(), Ordering::Less);
        assert_eq!(exact.compare(&omap_raw(10, 6)).unwrap(), Ordering::Greater);
    }

    #[test]
    fn catalog_prefix_search_matches_every_record_of_an_object() {
        let search = SearchKey::catalog_object(ObjectId(5));
        for key in [
            CatalogKey::new(ObjectId(5), 1),
            CatalogKey::named(ObjectId(5), 9, b"z".to_vec()),
        ] {
            assert_eq!(
                search.compare(&key.encode().unwrap()).unwrap(),
                Ordering::Equal
            );
        }
        let other = CatalogKey::new(ObjectId(6), 0).encode().unwrap();
        assert_eq!(search.compare(&other).unwrap(), Ordering::Greater);
    }

    #[test]
    fn exact_search_tells_named_and_unnamed_records_apart() {
        let plain = CatalogKey::new(ObjectId(5), 3);
        let named = CatalogKey::named(ObjectId(5), 3, b"alpha".to_vec());
        let raw_plain = plain.encode().unwrap();
        let raw_named = named.encode().unwrap();
        assert_eq!(
            SearchKey::catalog(&plain).compare(&raw_named).unwrap(),
            Ordering::Greater
        );
        assert_eq!(
            SearchKey::catalog(&named).compare(&raw_plain).unwrap(),
            Ordering::Less
        );
        assert_eq!(
            SearchKey::catalog(&named).compare(&raw_named).unwrap(),
            Ordering::Equal
        );
    }

    #[test]
    fn unnamed_records_sort_first() {
        let plain = CatalogKey::new(ObjectId(5), 4).encode().unwrap();
        let named = CatalogKey::named(ObjectId(5), 4, b"a".to_vec())
            .encode()
            .unwrap();
        assert_eq!(
            TreeKind::Catalog.compare_raw(&plain, &named).unwrap(),
            Ordering::Less
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn search_order_agrees_with_key_order(
            a in (0_u64..64, 0_u8..16, proptest::option::of(proptest::collection::vec(any::<u8>(), 0..6))),
            b in (0_u64..64, 0_u8..16, proptest::option::of(proptest::collection::vec(any::<u8>(), 0..6))),
        ) {
            let ka = CatalogKey { oid: ObjectId(a.0), kind: a.1, name: a.2 };
            let kb = CatalogKey { oid: ObjectId(b.0), kind: b.1, name: b.2 };
            let raw_a = ka.encode().unwrap();
            let raw_b = kb.encode().unwrap();
            let search = SearchKey::catalog(&kb);
            prop_assert_eq!(search.compare(&raw_a).unwrap(), ka.cmp(&kb));
            prop_assert_eq!(TreeKind::Catalog.compare_raw(&raw_a, &raw_b).unwrap(), ka.cmp(&kb));
        }
    }
}
