#![forbid(unsafe_code)]
//! Query engine.
//!
//! A [`Query`] is an owned root-to-leaf stack of frames, each holding a node
//! and a position in it. Searches descend from the root; `multiple` queries
//! then walk backwards through every matching record, backing up one level
//! whenever a subtree is exhausted. Mutations operate on the leaf frame and
//! propagate upward through the stack: routing keys follow the first key of
//! their child, splits insert routing records into the parent, and the
//! tree-info footer of the root is kept current.
//!
//! A chain whose top frame is not the root is *orphaned*. Operations that
//! need the missing ancestors rebuild them first with a fresh descent
//! ([`ObjectStore::query_refresh`]); this is only supported for the catalog.

use crate::key::{SearchKey, TreeKind};
use crate::node::{LocalWrite, Node, Record, max_key_size, max_record_size};
use crate::store::{ObjectStore, View};
use crate::{corruption, parse_corruption};
use cowfs_error::{CowfsError, Result};
use cowfs_ondisk::{BtreeInfo, NodeLayout, StorageClass};
use cowfs_types::{BlockNumber, ObjectId};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, error, trace};

/// Deepest descent a query attempts before declaring the tree corrupt.
pub const MAX_DEPTH: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueryFlags {
    /// Leaf hits must compare equal to the search key.
    pub exact: bool,
    /// Iterate every matching record with [`ObjectStore::btree_query_next`].
    pub multiple: bool,
}

impl QueryFlags {
    /// Last record not greater than the search key.
    pub const NEAREST: Self = Self {
        exact: false,
        multiple: false,
    };
    pub const EXACT: Self = Self {
        exact: true,
        multiple: false,
    };
    pub const MULTIPLE: Self = Self {
        exact: true,
        multiple: true,
    };
}

#[derive(Debug, Clone)]
struct Frame {
    node: Node,
    /// Current record; -1 sits before the first one.
    index: isize,
    /// Set once the node has been searched; later visits step backwards.
    started: bool,
    /// No earlier record of this node can match.
    done: bool,
}

impl Frame {
    fn new(node: Node) -> Self {
        let index = isize::try_from(node.records()).unwrap_or(isize::MAX);
        Self {
            node,
            index,
            started: false,
            done: false,
        }
    }
}

/// Result of searching or stepping within one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Found,
    NotFound,
    /// No earlier record left in this node.
    Exhausted,
}

/// Traversal handle for one search.
///
/// Nodes are shared buffers, so a query borrows nothing from the store.
/// A query is only valid until the tree is changed through another query.
#[derive(Debug, Clone)]
pub struct Query {
    key: SearchKey,
    flags: QueryFlags,
    view: View,
    frames: Vec<Frame>,
}

impl Query {
    #[must_use]
    pub fn tree(&self) -> TreeKind {
        self.key.tree()
    }

    #[must_use]
    pub fn search_key(&self) -> &SearchKey {
        &self.key
    }

    #[must_use]
    pub fn flags(&self) -> QueryFlags {
        self.flags
    }

    #[must_use]
    pub fn view(&self) -> View {
        self.view
    }

    /// Number of frames in the chain.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Node of the deepest frame.
    #[must_use]
    pub fn node(&self) -> Option<&Node> {
        self.frames.last().map(|frame| &frame.node)
    }

    /// Position in the deepest frame, if it points at a record.
    #[must_use]
    pub fn index(&self) -> Option<usize> {
        self.frames
            .last()
            .and_then(|frame| usize::try_from(frame.index).ok())
    }

    /// True when the ancestors of the top frame were discarded.
    #[must_use]
    pub fn is_orphan(&self) -> bool {
        self.frames.first().is_some_and(|frame| !frame.node.is_root())
    }

    pub fn key(&self) -> Result<Vec<u8>> {
        let (frame, at) = self.positioned()?;
        frame.node.key_at(at)
    }

    pub fn value(&self) -> Result<Vec<u8>> {
        let (frame, at) = self.positioned()?;
        frame.node.value_at(at)
    }

    pub fn record(&self) -> Result<Record> {
        Ok(Record {
            key: self.key()?,
            value: self.value()?,
        })
    }

    fn positioned(&self) -> Result<(&Frame, usize)> {
        let frame = self.current()?;
        let at = usize::try_from(frame.index)
            .ok()
            .filter(|at| *at < frame.node.records())
            .ok_or_else(|| CowfsError::NotFound("query is not positioned on a record".to_owned()))?;
        Ok((frame, at))
    }

    fn current(&self) -> Result<&Frame> {
        self.frames
            .last()
            .ok_or_else(|| CowfsError::Format("query has no current node".to_owned()))
    }

    fn current_mut(&mut self) -> Result<&mut Frame> {
        self.frames
            .last_mut()
            .ok_or_else(|| CowfsError::Format("query has no current node".to_owned()))
    }

    fn has_parent(&self) -> bool {
        self.frames.len() > 1
    }

    /// Drop every ancestor of the deepest frame.
    pub(crate) fn orphan(&mut self) {
        let keep = self.frames.len().saturating_sub(1);
        self.frames.drain(..keep);
    }

    /// Point the parent frame back at the current node after a routing
    /// record was inserted right after it.
    fn step_parent_back(&mut self) {
        let len = self.frames.len();
        if len < 2 {
            return;
        }
        let parent = &mut self.frames[len - 2];
        if parent.index > 0 {
            parent.index -= 1;
        } else {
            self.orphan();
        }
    }
}

fn position(frame: &Frame) -> Result<usize> {
    usize::try_from(frame.index).map_err(|_| {
        corruption(
            frame.node.block(),
            format!("record index {} out of range", frame.index),
        )
    })
}

fn compare(frame: &Frame, key: &SearchKey, index: usize) -> Result<Ordering> {
    let raw = frame.node.key_at(index)?;
    key.compare(&raw)
        .map_err(|e| parse_corruption(frame.node.block(), &e))
}

/// Count of leading records not greater than `key`. Fixed-size records are
/// bisected; variable-size ones are scanned in order.
fn records_up_to(frame: &Frame, key: &SearchKey) -> Result<usize> {
    let records = frame.node.records();
    match frame.node.layout() {
        NodeLayout::Fixed { .. } => {
            let (mut lo, mut hi) = (0, records);
            while lo < hi {
                let mid = lo + (hi - lo) / 2;
                if compare(frame, key, mid)? == Ordering::Greater {
                    hi = mid;
                } else {
                    lo = mid + 1;
                }
            }
            Ok(lo)
        }
        NodeLayout::Variable => {
            let mut at = 0;
            while at < records && compare(frame, key, at)? != Ordering::Greater {
                at += 1;
            }
            Ok(at)
        }
    }
}

/// Position `frame` on the last record not greater than `key`; for
/// `multiple` queries that is the last matching one.
fn node_query(frame: &mut Frame, key: &SearchKey, flags: QueryFlags) -> Result<Step> {
    frame.started = true;
    let lo = records_up_to(frame, key)?;
    if lo == 0 {
        frame.index = -1;
        return Ok(Step::NotFound);
    }
    let at = lo - 1;
    frame.index = isize::try_from(at).map_err(|_| corruption(frame.node.block(), "record index overflow"))?;
    let cmp = compare(frame, key, at)?;
    if frame.node.is_leaf() && flags.exact && cmp != Ordering::Equal {
        return Ok(Step::NotFound);
    }
    if flags.multiple {
        frame.done = cmp != Ordering::Equal;
    }
    Ok(Step::Found)
}

/// Step one record back within an already searched node.
fn node_next(frame: &mut Frame, key: &SearchKey) -> Result<Step> {
    if frame.done {
        return Ok(Step::NotFound);
    }
    if frame.index <= 0 {
        return Ok(Step::Exhausted);
    }
    frame.index -= 1;
    let cmp = compare(frame, key, position(frame)?)?;
    if cmp == Ordering::Greater {
        return Err(corruption(frame.node.block(), "records are out of order"));
    }
    if cmp != Ordering::Equal {
        if frame.node.is_leaf() {
            return Ok(Step::NotFound);
        }
        frame.done = true;
    }
    Ok(Step::Found)
}

fn ensure_done(outcome: LocalWrite, block: BlockNumber) -> Result<()> {
    match outcome {
        LocalWrite::Done => Ok(()),
        LocalWrite::NoSpace => Err(corruption(block, "records do not fit after a split")),
    }
}

fn info_len(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

impl ObjectStore {
    /// Root node of `tree` as seen through `view`.
    pub(crate) fn tree_root(&self, view: View, tree: TreeKind) -> Result<Node> {
        let desc = self.descriptor(view);
        let buf = match tree {
            TreeKind::Omap => self.read_verified(desc.omap_root)?,
            TreeKind::Catalog => self.read_object(view, desc.cat_root, StorageClass::Virtual)?,
        };
        let node = Node::from_buf(buf, tree)?;
        if !node.is_root() {
            return Err(corruption(node.block(), "tree root is missing the root flag"));
        }
        Ok(node)
    }

    /// Child `oid` of an index node at `parent_level`.
    pub(crate) fn read_node(
        &self,
        view: View,
        tree: TreeKind,
        oid: ObjectId,
        parent_level: u16,
    ) -> Result<Node> {
        let buf = match tree.storage() {
            StorageClass::Virtual => self.read_object(view, oid, StorageClass::Virtual)?,
            _ => self.read_verified(oid.as_block())?,
        };
        let node = Node::from_buf(buf, tree)?;
        if node.oid() != oid {
            debug!(
                block = node.block().0,
                expected = oid.0,
                found = node.oid().0,
                "btree_node_oid_mismatch"
            );
        }
        if node.is_root() {
            return Err(corruption(node.block(), "child node is flagged as a root"));
        }
        if u32::from(node.level()) + 1 != u32::from(parent_level) {
            return Err(corruption(
                node.block(),
                format!(
                    "child level {} under a parent at level {parent_level}",
                    node.level()
                ),
            ));
        }
        Ok(node)
    }

    /// New query for `key`, positioned at the root of its tree.
    pub fn query(&self, view: View, key: SearchKey, flags: QueryFlags) -> Result<Query> {
        let root = self.tree_root(view, key.tree())?;
        Ok(Query {
            key,
            flags,
            view,
            frames: vec![Frame::new(root)],
        })
    }

    /// Run `query` down to a leaf.
    ///
    /// Returns true when the leaf frame sits on a matching record. On a
    /// miss the leaf frame sits on the last record before the search key
    /// (or before the first record), which is where an insert goes.
    pub fn btree_query(&self, query: &mut Query) -> Result<bool> {
        loop {
            let Query {
                key,
                flags,
                view,
                frames,
            } = query;
            let depth = frames.len().saturating_sub(1);
            let frame = frames
                .last_mut()
                .ok_or_else(|| CowfsError::Format("query has no current node".to_owned()))?;
            if depth >= MAX_DEPTH {
                error!(block = frame.node.block().0, depth, "btree_too_deep");
                return Err(corruption(frame.node.block(), "b-tree is too deep"));
            }

            let step = if frame.started {
                node_next(frame, key)?
            } else {
                node_query(frame, key, *flags)?
            };
            match step {
                Step::Exhausted => {
                    if frames.len() == 1 {
                        return Ok(false);
                    }
                    frames.pop();
                }
                Step::NotFound => {
                    if frame.index >= 0 || frame.node.is_leaf() {
                        return Ok(false);
                    }
                    if depth > 0 {
                        return Err(corruption(
                            frame.node.block(),
                            "search key sorts before the first key of a child",
                        ));
                    }
                    self.set_before_first(query)?;
                    return Ok(false);
                }
                Step::Found => {
                    if frame.node.is_leaf() {
                        return Ok(true);
                    }
                    let child_oid = frame.node.child_at(position(frame)?)?;
                    let child =
                        self.read_node(*view, frame.node.tree(), child_oid, frame.node.level())?;
                    frames.push(Frame::new(child));
                }
            }
        }
    }

    /// Move a `multiple` query to the previous matching record.
    pub fn btree_query_next(&self, query: &mut Query) -> Result<bool> {
        if !query.flags.multiple {
            return Err(CowfsError::Format(
                "only multiple queries can be continued".to_owned(),
            ));
        }
        if query.frames.is_empty() {
            return Ok(false);
        }
        self.btree_query(query)
    }

    /// Search key sorts before everything: follow the first child of every
    /// index node down to the leftmost leaf and sit before its first record.
    fn set_before_first(&self, query: &mut Query) -> Result<()> {
        loop {
            let depth = query.frames.len();
            let view = query.view;
            let frame = query.current_mut()?;
            frame.started = true;
            if frame.node.is_leaf() {
                frame.index = -1;
                return Ok(());
            }
            frame.index = 0;
            if depth >= MAX_DEPTH {
                return Err(corruption(frame.node.block(), "b-tree is too deep"));
            }
            let child_oid = frame.node.child_at(0)?;
            let mut child =
                Frame::new(self.read_node(view, frame.node.tree(), child_oid, frame.node.level())?);
            child.started = true;
            query.frames.push(child);
        }
    }

    // ── Mutations ───────────────────────────────────────────────────────

    fn check_mutation(&self, query: &Query) -> Result<()> {
        if query.view != View::Working {
            return Err(CowfsError::ReadOnly);
        }
        self.txns.xid()?;
        let frame = query.current()?;
        if !frame.started || !frame.node.is_leaf() {
            return Err(CowfsError::Format(
                "query is not positioned at a leaf".to_owned(),
            ));
        }
        Ok(())
    }

    fn check_record_size(&self, tree: TreeKind, key_len: usize, val_len: usize) -> Result<()> {
        let bs = self.block_size.as_usize();
        let max = max_record_size(tree, bs);
        if key_len + val_len > max {
            return Err(CowfsError::RecordTooLarge {
                size: key_len + val_len,
                max,
            });
        }
        let max = max_key_size(tree, bs);
        if key_len > max {
            return Err(CowfsError::RecordTooLarge { size: key_len, max });
        }
        Ok(())
    }

    /// Insert a record where a missed query left its leaf frame.
    ///
    /// On success the frame points at the new record.
    pub fn btree_insert(&mut self, query: &mut Query, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_mutation(query)?;
        self.check_record_size(query.tree(), key.len(), value.len())?;
        self.txns.note_tree_op()?;
        self.insert_record(query, key, value)
    }

    /// Remove the record under the leaf frame.
    ///
    /// The query must be run again before further use.
    pub fn btree_remove(&mut self, query: &mut Query) -> Result<()> {
        self.check_mutation(query)?;
        query.positioned()?;
        self.txns.note_tree_op()?;
        self.remove_record(query)
    }

    /// Replace the key and/or value of the record under the leaf frame.
    /// A new key must sort in the same place as the old one.
    pub fn btree_replace(
        &mut self,
        query: &mut Query,
        key: Option<&[u8]>,
        value: Option<&[u8]>,
    ) -> Result<()> {
        self.check_mutation(query)?;
        let (frame, at) = query.positioned()?;
        let key_len = match key {
            Some(key) => key.len(),
            None => frame.node.key_at(at)?.len(),
        };
        let val_len = match value {
            Some(value) => value.len(),
            None => frame.node.value_at(at)?.len(),
        };
        self.check_record_size(query.tree(), key_len, val_len)?;
        self.txns.note_tree_op()?;
        self.replace_record(query, key, value)
    }

    /// Rebuild the ancestors of an orphaned chain with a fresh descent from
    /// the working root, keeping the caller's frames and flags.
    pub fn query_refresh(&mut self, query: &mut Query) -> Result<()> {
        let top = query
            .frames
            .first()
            .ok_or_else(|| CowfsError::Format("query has no current node".to_owned()))?;
        let target = top.node.block();
        if query.tree() != TreeKind::Catalog {
            error!(block = target.0, "btree_refresh_unsupported");
            return Err(corruption(target, "object map queries cannot be refreshed"));
        }
        if top.node.is_root() {
            return Ok(());
        }
        if top.node.records() == 0 {
            return Err(corruption(target, "orphaned node has no records"));
        }
        let level = top.node.level();
        let raw = top.node.key_at(0)?;
        let key = SearchKey::from_raw(TreeKind::Catalog, &raw)
            .map_err(|e| parse_corruption(target, &e))?;

        let mut path = Vec::new();
        let mut node = self.tree_root(View::Working, TreeKind::Catalog)?;
        while node.level() > level {
            if path.len() >= MAX_DEPTH {
                return Err(corruption(node.block(), "b-tree is too deep"));
            }
            let mut frame = Frame::new(node);
            if node_query(&mut frame, &key, QueryFlags::NEAREST)? != Step::Found {
                return Err(corruption(frame.node.block(), "refresh lost the orphaned node"));
            }
            let child_oid = frame.node.child_at(position(&frame)?)?;
            node = self.read_node(
                View::Working,
                TreeKind::Catalog,
                child_oid,
                frame.node.level(),
            )?;
            path.push(frame);
        }
        if node.block() != target || path.is_empty() {
            return Err(corruption(target, "refresh reached a different node"));
        }
        debug!(block = target.0, level, ancestors = path.len(), "btree_query_refresh");
        path.append(&mut query.frames);
        query.frames = path;
        Ok(())
    }

    fn settle(&mut self, query: &mut Query) -> Result<()> {
        if query.is_orphan() {
            self.query_refresh(query)?;
        }
        Ok(())
    }

    /// Run `op` against the parent frame, then restore the current one.
    fn with_parent<T>(
        &mut self,
        query: &mut Query,
        op: impl FnOnce(&mut Self, &mut Query) -> Result<T>,
    ) -> Result<T> {
        let frame = query
            .frames
            .pop()
            .ok_or_else(|| CowfsError::Format("query has no current node".to_owned()))?;
        let result = op(self, query);
        query.frames.push(frame);
        result
    }

    /// Make the current node writable in the running transaction.
    ///
    /// A relocated physical node gets its parent's index record (or the
    /// root pointer) updated; a virtual node gets its object-map record
    /// updated by the resolver.
    fn join_current(&mut self, query: &mut Query) -> Result<()> {
        self.settle(query)?;
        let frame = query.current_mut()?;
        let tree = frame.node.tree();
        let block = frame.node.block();
        if let Some(buf) = self.txns.dirty(block) {
            if !Arc::ptr_eq(&buf, frame.node.buf()) {
                frame.node = Node::from_buf(buf, tree)?;
            }
            return Ok(());
        }

        if tree.storage() == StorageClass::Virtual {
            let oid = frame.node.oid();
            let new_block = self.omap_lookup_block(oid, true)?;
            let buf = self.read_block(new_block)?;
            query.current_mut()?.node = Node::from_buf(buf, tree)?;
            return Ok(());
        }

        let node = Node::from_buf(self.read_object_block(block, true)?, tree)?;
        let new_block = node.block();
        let is_root = node.is_root();
        frame.node = node;
        if new_block == block {
            return Ok(());
        }
        if query.has_parent() {
            let child_id = new_block.0.to_le_bytes();
            self.with_parent(query, |store, q| store.replace_record(q, None, Some(&child_id)))
        } else if is_root {
            self.working.omap_root = new_block;
            Ok(())
        } else {
            Err(corruption(block, "orphaned physical node cannot be relocated"))
        }
    }

    /// Apply `update` to the root's tree info.
    fn update_root_info(
        &mut self,
        query: &mut Query,
        update: impl FnOnce(&mut BtreeInfo) -> Option<()>,
    ) -> Result<()> {
        self.settle(query)?;
        let below = query.frames.split_off(1);
        let result = self.write_root_info(query, update);
        query.frames.extend(below);
        result
    }

    fn write_root_info(
        &mut self,
        query: &mut Query,
        update: impl FnOnce(&mut BtreeInfo) -> Option<()>,
    ) -> Result<()> {
        self.join_current(query)?;
        let root = &query.current()?.node;
        let mut info = root.info()?;
        update(&mut info)
            .ok_or_else(|| corruption(root.block(), "tree info counters out of range"))?;
        root.set_info(&info)
    }

    fn change_rec_count(
        &mut self,
        query: &mut Query,
        delta: i64,
        key_len: usize,
        val_len: usize,
    ) -> Result<()> {
        self.update_root_info(query, |info| {
            info.key_count = info.key_count.checked_add_signed(delta)?;
            info.longest_key = info.longest_key.max(info_len(key_len));
            info.longest_val = info.longest_val.max(info_len(val_len));
            Some(())
        })
    }

    fn change_node_count(&mut self, query: &mut Query, delta: i64) -> Result<()> {
        self.update_root_info(query, |info| {
            info.node_count = info.node_count.checked_add_signed(delta)?;
            Some(())
        })
    }

    fn insert_record(&mut self, query: &mut Query, key: &[u8], value: &[u8]) -> Result<()> {
        self.settle(query)?;
        let (is_leaf, index) = {
            let frame = query.current()?;
            (frame.node.is_leaf(), frame.index)
        };
        if is_leaf {
            self.change_rec_count(query, 1, key.len(), value.len())?;
        }
        if index < 0 && query.has_parent() {
            self.with_parent(query, |store, q| store.replace_record(q, Some(key), None))?;
        }
        self.join_current(query)?;

        loop {
            let frame = query.current_mut()?;
            if frame.node.insert_local(frame.index, key, value)? == LocalWrite::Done {
                frame.index += 1;
                if frame.index == 0 {
                    // A split may have grown a parent that routes by the
                    // old first key.
                    self.route_first_key(query, key)?;
                }
                return Ok(());
            }
            if frame.node.records() == 1 && query.has_parent() {
                return self.single_record_split(query, key, value);
            }
            self.node_split(query)?;
        }
    }

    /// Make the parent's routing record for the current node carry `key`,
    /// its new first key.
    fn route_first_key(&mut self, query: &mut Query, key: &[u8]) -> Result<()> {
        let len = query.frames.len();
        if len < 2 {
            return Ok(());
        }
        let parent = &query.frames[len - 2];
        if parent.node.key_at(position(parent)?)? == key {
            return Ok(());
        }
        self.with_parent(query, |store, q| store.replace_record(q, Some(key), None))
    }

    fn remove_record(&mut self, query: &mut Query) -> Result<()> {
        self.settle(query)?;
        let (is_leaf, records, at) = {
            let frame = query.current()?;
            (frame.node.is_leaf(), frame.node.records(), position(frame)?)
        };
        if is_leaf {
            self.change_rec_count(query, -1, 0, 0)?;
        } else {
            self.change_node_count(query, -1)?;
        }
        if records == 1 && query.has_parent() {
            return self.delete_node(query);
        }
        if at == 0 && records > 1 && query.has_parent() {
            let next = query.current()?.node.key_at(1)?;
            self.with_parent(query, |store, q| store.replace_record(q, Some(&next), None))?;
        }
        self.join_current(query)?;

        let frame = query.current_mut()?;
        if records == 1 {
            frame.node.set_level(0);
            ensure_done(frame.node.rewrite(&[])?, frame.node.block())?;
            frame.index = -1;
            debug!(block = frame.node.block().0, "btree_root_collapse");
            return Ok(());
        }
        frame.node.remove_local(at)?;
        frame.index -= 1;
        Ok(())
    }

    fn replace_record(
        &mut self,
        query: &mut Query,
        key: Option<&[u8]>,
        value: Option<&[u8]>,
    ) -> Result<()> {
        self.settle(query)?;
        let (is_leaf, at) = {
            let frame = query.current()?;
            (frame.node.is_leaf(), position(frame)?)
        };
        if is_leaf {
            let node = &query.current()?.node;
            let key_len = match key {
                Some(key) => key.len(),
                None => node.key_at(at)?.len(),
            };
            let val_len = match value {
                Some(value) => value.len(),
                None => node.value_at(at)?.len(),
            };
            self.change_rec_count(query, 0, key_len, val_len)?;
        }

        loop {
            let at = position(query.current()?)?;
            if let Some(key) = key {
                if at == 0 && query.has_parent() {
                    self.with_parent(query, |store, q| store.replace_record(q, Some(key), None))?;
                }
            }
            self.join_current(query)?;
            let frame = query.current_mut()?;
            if frame.node.replace_local(at, key, value)? == LocalWrite::Done {
                return Ok(());
            }
            if frame.node.records() == 1 && !frame.node.is_root() {
                return Err(corruption(
                    frame.node.block(),
                    "single-record node has no room for its own record",
                ));
            }
            self.node_split(query)?;
        }
    }

    /// Split the current node into two count-balanced halves.
    ///
    /// The frame follows the half that holds its position, so the retried
    /// write lands in the right node and never at the front of the new
    /// sibling.
    fn node_split(&mut self, query: &mut Query) -> Result<()> {
        if query.current()?.node.is_root() {
            self.increase_height(query)?;
        }
        let (tree, level, records) = {
            let node = &query.current()?.node;
            (node.tree(), node.level(), node.entries()?)
        };
        if records.len() < 2 {
            return Ok(());
        }
        let mid = records.len() / 2;
        let mut sibling = self.new_node(tree, level)?;
        {
            let frame = query.current_mut()?;
            ensure_done(frame.node.rewrite(&records[..mid])?, frame.node.block())?;
        }
        ensure_done(sibling.rewrite(&records[mid..])?, sibling.block())?;
        self.change_node_count(query, 1)?;
        debug!(
            block = query.current()?.node.block().0,
            sibling = sibling.block().0,
            level,
            left = mid,
            right = records.len() - mid,
            "btree_node_split"
        );

        let separator = records[mid].key.clone();
        let child_id = sibling.child_id();
        self.with_parent(query, |store, q| store.insert_record(q, &separator, &child_id))?;

        let mid = isize::try_from(mid).unwrap_or(isize::MAX);
        let frame = query.current_mut()?;
        if frame.index < mid {
            query.step_parent_back();
        } else {
            frame.node = sibling;
            frame.index -= mid;
        }
        Ok(())
    }

    /// A single record that cannot share its node with the incoming one:
    /// give one of them a node of its own.
    fn single_record_split(&mut self, query: &mut Query, key: &[u8], value: &[u8]) -> Result<()> {
        let (tree, level, front, existing) = {
            let frame = query.current()?;
            let existing = frame
                .node
                .entries()?
                .pop()
                .ok_or_else(|| corruption(frame.node.block(), "expected one record"))?;
            (frame.node.tree(), frame.node.level(), frame.index < 0, existing)
        };
        let incoming = Record::new(key, value);
        let (kept, moved) = if front {
            (incoming, existing)
        } else {
            (existing, incoming)
        };

        let mut sibling = self.new_node(tree, level)?;
        {
            let frame = query.current_mut()?;
            ensure_done(
                frame.node.rewrite(std::slice::from_ref(&kept))?,
                frame.node.block(),
            )?;
        }
        ensure_done(sibling.rewrite(std::slice::from_ref(&moved))?, sibling.block())?;
        self.change_node_count(query, 1)?;
        debug!(
            block = query.current()?.node.block().0,
            sibling = sibling.block().0,
            level,
            front,
            "btree_single_record_split"
        );

        let child_id = sibling.child_id();
        self.with_parent(query, |store, q| store.insert_record(q, &moved.key, &child_id))?;
        if front {
            query.current_mut()?.index = 0;
            query.step_parent_back();
        } else {
            let frame = query.current_mut()?;
            frame.node = sibling;
            frame.index = 0;
        }
        Ok(())
    }

    /// Move every record of the root into a new child and leave the root
    /// with a single index record pointing at it.
    fn increase_height(&mut self, query: &mut Query) -> Result<()> {
        let (tree, level, records, index) = {
            let frame = query.current()?;
            if query.frames.len() != 1 {
                return Err(corruption(
                    frame.node.block(),
                    "tree height can only grow from the root",
                ));
            }
            (
                frame.node.tree(),
                frame.node.level(),
                frame.node.entries()?,
                frame.index,
            )
        };
        let root_block = query.current()?.node.block();
        let first = records
            .first()
            .ok_or_else(|| corruption(root_block, "cannot grow an empty root"))?
            .key
            .clone();
        let new_level = level
            .checked_add(1)
            .ok_or_else(|| corruption(root_block, "tree level overflow"))?;

        let mut child = self.new_node(tree, level)?;
        ensure_done(child.rewrite(&records)?, child.block())?;
        {
            let frame = query.current_mut()?;
            frame.node.set_level(new_level);
            ensure_done(
                frame.node.rewrite(&[Record::new(&first, &child.child_id())])?,
                root_block,
            )?;
            frame.index = 0;
            frame.started = true;
        }
        debug!(
            root = root_block.0,
            child = child.block().0,
            level = new_level,
            "btree_height_increase"
        );
        query.frames.push(Frame {
            node: child,
            index,
            started: true,
            done: false,
        });
        self.change_node_count(query, 1)
    }

    /// Unlink the current node from its parent and release it.
    fn delete_node(&mut self, query: &mut Query) -> Result<()> {
        let frame = query
            .frames
            .pop()
            .ok_or_else(|| CowfsError::Format("query has no current node".to_owned()))?;
        self.remove_record(query)?;
        let node = frame.node;
        let block = if node.tree().storage() == StorageClass::Virtual {
            let block = self.omap_resolve(View::Working, node.oid())?;
            self.delete_omap_rec(node.oid())?;
            block
        } else {
            node.block()
        };
        self.free_block(block)?;
        debug!(
            block = block.0,
            oid = node.oid().0,
            level = node.level(),
            "btree_node_delete"
        );
        query.frames.clear();
        Ok(())
    }

    /// Empty non-root node for `tree`, owned by the running transaction.
    fn new_node(&mut self, tree: TreeKind, level: u16) -> Result<Node> {
        let xid = self.txns.xid()?;
        let block = self.allocate(false)?;
        let oid = if tree.storage() == StorageClass::Virtual {
            let oid = self.next_oid();
            self.create_omap_rec(oid, block)?;
            oid
        } else {
            block.as_oid()
        };
        let buf = self.new_buf(block)?;
        let node = Node::format(buf, tree, oid, xid, false, level)?;
        trace!(block = block.0, oid = oid.0, level, "btree_node_alloc");
        Ok(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::CatalogKey;
    use crate::test_support::{begin, formatted, formatted_with, get, put};
    use crate::store::FormatGeometry;
    use cowfs_ondisk::btree::CHILD_ID_SIZE;
    use cowfs_ondisk::{OmapKey, OmapVal};
    use cowfs_txn::TxnBudget;
    use cowfs_types::Xid;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn key(oid: u64) -> CatalogKey {
        CatalogKey::new(ObjectId(oid), 3)
    }

    fn value(oid: u64, len: usize) -> Vec<u8> {
        vec![u8::try_from(oid % 251).unwrap(); len]
    }

    fn assert_clean(store: &ObjectStore, view: View, tree: TreeKind) -> crate::TreeReport {
        let report = store.check_tree(view, tree).unwrap();
        assert!(report.is_clean(), "{:?}", report.problems);
        report
    }

    fn catalog_keys(store: &ObjectStore, view: View) -> Vec<CatalogKey> {
        let mut keys = Vec::new();
        store
            .walk(view, TreeKind::Catalog, |raw, _| {
                keys.push(CatalogKey::parse(raw).unwrap());
                Ok(())
            })
            .unwrap();
        keys
    }

    #[test]
    fn empty_tree_misses() {
        let (_mem, store) = formatted();
        let mut q = store
            .query(View::Committed, SearchKey::catalog(&key(5)), QueryFlags::EXACT)
            .unwrap();
        assert!(!store.btree_query(&mut q).unwrap());
        assert_eq!(q.index(), None);
        assert!(q.key().is_err());
    }

    #[test]
    fn insert_and_find_in_a_single_leaf() {
        let (_mem, mut store) = formatted();
        begin(&mut store);
        for oid in [5, 1, 9, 3] {
            put(&mut store, &key(oid), &value(oid, 20));
        }
        assert_eq!(get(&store, View::Working, &key(9)), Some(value(9, 20)));
        assert_eq!(get(&store, View::Working, &key(4)), None);
        // Nothing is visible through the committed view until commit.
        assert_eq!(get(&store, View::Committed, &key(9)), None);
        store.commit().unwrap();
        assert_eq!(get(&store, View::Committed, &key(9)), Some(value(9, 20)));

        let report = assert_clean(&store, View::Committed, TreeKind::Catalog);
        assert_eq!(report.records, 4);
        assert_eq!(report.height, 1);
        assert_eq!(report.longest_val, 20);
    }

    #[test]
    fn nearest_query_lands_on_the_previous_record() {
        let (_mem, mut store) = formatted();
        begin(&mut store);
        for oid in [10, 20, 30] {
            put(&mut store, &key(oid), &value(oid, 8));
        }
        let mut q = store
            .query(View::Working, SearchKey::catalog(&key(25)), QueryFlags::NEAREST)
            .unwrap();
        assert!(store.btree_query(&mut q).unwrap());
        assert_eq!(CatalogKey::parse(&q.key().unwrap()).unwrap(), key(20));
        store.abort().unwrap();
    }

    #[test]
    fn ascending_inserts_split_into_a_valid_tree() {
        let (_mem, mut store) = formatted();
        begin(&mut store);
        for oid in 0..600 {
            put(&mut store, &key(oid), &value(oid, 100));
        }
        store.commit().unwrap();
        let report = assert_clean(&store, View::Committed, TreeKind::Catalog);
        assert_eq!(report.records, 600);
        assert!(report.height >= 2);
        assert_eq!(
            catalog_keys(&store, View::Committed),
            (0..600).map(key).collect::<Vec<_>>()
        );
        for oid in [0, 299, 599] {
            assert_eq!(get(&store, View::Committed, &key(oid)), Some(value(oid, 100)));
        }
        assert_clean(&store, View::Committed, TreeKind::Omap);
    }

    #[test]
    fn descending_inserts_keep_routing_keys_current() {
        let (_mem, mut store) = formatted();
        begin(&mut store);
        for oid in (0..400).rev() {
            put(&mut store, &key(oid), &value(oid, 120));
        }
        store.commit().unwrap();
        let report = assert_clean(&store, View::Committed, TreeKind::Catalog);
        assert_eq!(report.records, 400);
        assert_eq!(get(&store, View::Committed, &key(0)), Some(value(0, 120)));
    }

    #[test]
    fn removing_everything_collapses_the_tree() {
        let (_mem, mut store) = formatted();
        let free_before = store.allocator().free_blocks();
        begin(&mut store);
        for oid in 0..300 {
            put(&mut store, &key(oid), &value(oid, 150));
        }
        store.commit().unwrap();
        assert!(assert_clean(&store, View::Committed, TreeKind::Catalog).height >= 2);

        begin(&mut store);
        for oid in (0..300).step_by(2).chain((1..300).step_by(2)) {
            let mut q = store
                .query(View::Working, SearchKey::catalog(&key(oid)), QueryFlags::EXACT)
                .unwrap();
            assert!(store.btree_query(&mut q).unwrap(), "oid {oid}");
            store.btree_remove(&mut q).unwrap();
        }
        store.commit().unwrap();

        let report = assert_clean(&store, View::Committed, TreeKind::Catalog);
        assert_eq!(report.records, 0);
        assert_eq!(report.nodes, 1);
        assert_eq!(report.height, 1);
        assert_eq!(store.allocator().free_blocks(), free_before);
    }

    #[test]
    fn growing_values_split_on_replace() {
        let (_mem, mut store) = formatted();
        begin(&mut store);
        for oid in 0..30 {
            put(&mut store, &key(oid), &value(oid, 10));
        }
        for oid in 0..30 {
            let mut q = store
                .query(View::Working, SearchKey::catalog(&key(oid)), QueryFlags::EXACT)
                .unwrap();
            assert!(store.btree_query(&mut q).unwrap());
            store
                .btree_replace(&mut q, None, Some(&value(oid, 900)))
                .unwrap();
        }
        store.commit().unwrap();
        let report = assert_clean(&store, View::Committed, TreeKind::Catalog);
        assert_eq!(report.records, 30);
        assert!(report.nodes > 1);
        assert_eq!(report.longest_val, 900);
        assert_eq!(get(&store, View::Committed, &key(17)), Some(value(17, 900)));
    }

    #[test]
    fn replacing_a_first_key_updates_the_routing_key() {
        let (_mem, mut store) = formatted();
        begin(&mut store);
        for oid in (10..400).step_by(10) {
            put(&mut store, &key(oid), &value(oid, 300));
        }
        // Every leaf starts at some multiple of ten; shift each key down by
        // one, which keeps the order but changes every routing key.
        for oid in (10..400).step_by(10) {
            let mut q = store
                .query(View::Working, SearchKey::catalog(&key(oid)), QueryFlags::EXACT)
                .unwrap();
            assert!(store.btree_query(&mut q).unwrap());
            let new_key = key(oid - 1).encode().unwrap();
            store.btree_replace(&mut q, Some(&new_key), None).unwrap();
        }
        store.commit().unwrap();
        assert_clean(&store, View::Committed, TreeKind::Catalog);
        assert_eq!(get(&store, View::Committed, &key(9)), Some(value(10, 300)));
        assert_eq!(get(&store, View::Committed, &key(10)), None);
    }

    #[test]
    fn multiple_query_walks_backwards_across_leaves() {
        let (_mem, mut store) = formatted();
        begin(&mut store);
        for oid in [7, 9] {
            put(&mut store, &key(oid), &value(oid, 8));
        }
        let names: Vec<Vec<u8>> = (0..200_u32).map(|i| format!("name-{i:04}").into_bytes()).collect();
        for name in &names {
            put(
                &mut store,
                &CatalogKey::named(ObjectId(8), 9, name.clone()),
                &value(8, 200),
            );
        }
        put(&mut store, &CatalogKey::new(ObjectId(8), 1), &value(8, 4));
        store.commit().unwrap();
        assert!(assert_clean(&store, View::Committed, TreeKind::Catalog).nodes > 3);

        let mut q = store
            .query(
                View::Committed,
                SearchKey::catalog_object(ObjectId(8)),
                QueryFlags::MULTIPLE,
            )
            .unwrap();
        let mut seen = Vec::new();
        let mut found = store.btree_query(&mut q).unwrap();
        while found {
            seen.push(CatalogKey::parse(&q.key().unwrap()).unwrap());
            found = store.btree_query_next(&mut q).unwrap();
        }
        assert_eq!(seen.len(), 201);
        assert_eq!(seen.last(), Some(&CatalogKey::new(ObjectId(8), 1)));
        assert_eq!(
            seen.first(),
            Some(&CatalogKey::named(ObjectId(8), 9, names[199].clone()))
        );
        assert!(seen.windows(2).all(|w| w[0] > w[1]));
    }

    #[test]
    fn next_requires_a_multiple_query() {
        let (_mem, store) = formatted();
        let mut q = store
            .query(View::Committed, SearchKey::catalog(&key(1)), QueryFlags::EXACT)
            .unwrap();
        assert!(matches!(
            store.btree_query_next(&mut q),
            Err(CowfsError::Format(_))
        ));
    }

    #[test]
    fn orphaned_chain_is_refreshed_before_a_split() {
        let (_mem, mut store) = formatted_with(8192, FormatGeometry::default());
        let name = |n: u64| format!("{n:05}{}", "x".repeat(495)).into_bytes();
        let count = 3000_u64;
        for batch in (0..count).collect::<Vec<_>>().chunks(50) {
            begin(&mut store);
            for n in batch {
                let n = n * 7919 % 3001;
                put(&mut store, &CatalogKey::named(ObjectId(2), 4, name(n)), &value(n, 16));
            }
            store.commit().unwrap();
        }
        let report = assert_clean(&store, View::Committed, TreeKind::Catalog);
        assert!(report.height >= 3, "height {}", report.height);

        begin(&mut store);
        let target = CatalogKey::named(ObjectId(2), 4, name(1234));
        let mut q = store
            .query(View::Working, SearchKey::catalog(&target), QueryFlags::EXACT)
            .unwrap();
        assert!(store.btree_query(&mut q).unwrap());
        let depth = q.depth();
        q.orphan();
        assert!(q.is_orphan());
        store
            .btree_replace(&mut q, None, Some(&value(1234, 1500)))
            .unwrap();
        assert!(!q.is_orphan());
        assert!(q.depth() >= depth);
        store.commit().unwrap();

        assert_clean(&store, View::Committed, TreeKind::Catalog);
        assert_eq!(get(&store, View::Committed, &target), Some(value(1234, 1500)));
    }

    #[test]
    fn object_map_queries_are_not_refreshed() {
        let (_mem, mut store) = formatted();
        begin(&mut store);
        for oid in 0..300 {
            store.create_omap_rec(ObjectId(5000 + oid), BlockNumber(100 + oid)).unwrap();
        }
        let mut q = store
            .query(View::Working, SearchKey::omap(ObjectId(5100), Xid(2)), QueryFlags::EXACT)
            .unwrap();
        assert!(store.btree_query(&mut q).unwrap());
        q.orphan();
        let err = store.query_refresh(&mut q).unwrap_err();
        assert!(err.is_corruption());
        store.abort().unwrap();
    }

    #[test]
    fn cyclic_child_pointer_stops_at_the_depth_limit() {
        let (_mem, mut store) = formatted();
        begin(&mut store);
        let raw_key = OmapKey {
            oid: ObjectId(5000),
            xid: Xid(1),
        }
        .encode();
        let root_block = store.descriptor(View::Working).omap_root;
        let mut root = Node::from_buf(
            store.read_object_block(root_block, true).unwrap(),
            TreeKind::Omap,
        )
        .unwrap();
        store.working.omap_root = root.block();

        // Levels count down from the root so every hop looks legitimate;
        // the deepest node points back at the root.
        let mut child = store.new_node(TreeKind::Omap, 8).unwrap();
        child.insert_local(-1, &raw_key, &root.child_id()).unwrap();
        for level in 9..20 {
            let mut node = store.new_node(TreeKind::Omap, level).unwrap();
            node.insert_local(-1, &raw_key, &child.child_id()).unwrap();
            child = node;
        }
        root.set_level(20);
        root.rewrite(&[Record::new(&raw_key, &child.child_id())]).unwrap();
        assert_eq!(child.child_id().len(), CHILD_ID_SIZE);

        let mut q = store
            .query(View::Working, SearchKey::omap(ObjectId(5000), Xid(2)), QueryFlags::NEAREST)
            .unwrap();
        let err = store.btree_query(&mut q).unwrap_err();
        assert!(err.is_corruption());
        assert!(err.to_string().contains("too deep"), "{err}");
        assert_eq!(q.depth(), MAX_DEPTH + 1);
        store.abort().unwrap();
    }

    #[test]
    fn back_pointer_with_honest_levels_is_corruption() {
        let (_mem, mut store) = formatted();
        begin(&mut store);
        let raw_key = OmapKey {
            oid: ObjectId(5000),
            xid: Xid(1),
        }
        .encode();
        let root_block = store.descriptor(View::Working).omap_root;
        let mut root = Node::from_buf(
            store.read_object_block(root_block, true).unwrap(),
            TreeKind::Omap,
        )
        .unwrap();
        store.working.omap_root = root.block();
        let mut middle = store.new_node(TreeKind::Omap, 1).unwrap();
        middle.insert_local(-1, &raw_key, &root.child_id()).unwrap();
        root.set_level(2);
        root.rewrite(&[Record::new(&raw_key, &middle.child_id())]).unwrap();

        let mut q = store
            .query(View::Working, SearchKey::omap(ObjectId(5000), Xid(2)), QueryFlags::NEAREST)
            .unwrap();
        assert!(store.btree_query(&mut q).unwrap_err().is_corruption());
        store.abort().unwrap();
    }

    #[test]
    fn new_first_key_reaches_a_parent_grown_by_the_split() {
        let (_mem, mut store) = formatted();
        begin(&mut store);
        for oid in 100..114 {
            put(&mut store, &key(oid), &value(oid, 250));
        }
        assert_eq!(assert_clean(&store, View::Working, TreeKind::Catalog).height, 1);

        put(&mut store, &key(1), &value(1, 1000));
        let report = assert_clean(&store, View::Working, TreeKind::Catalog);
        assert_eq!(report.height, 2);
        assert_eq!(get(&store, View::Working, &key(1)), Some(value(1, 1000)));
        store.commit().unwrap();
        assert_eq!(get(&store, View::Committed, &key(1)), Some(value(1, 1000)));
        assert_eq!(get(&store, View::Committed, &key(113)), Some(value(113, 250)));
    }

    #[test]
    fn node_search_agrees_across_layouts() {
        let (_mem, mut store) = formatted();
        begin(&mut store);
        let oids = [10_u64, 20, 30, 40, 50];
        let mut omap = store.new_node(TreeKind::Omap, 0).unwrap();
        let records: Vec<_> = oids
            .iter()
            .map(|oid| {
                let key = OmapKey {
                    oid: ObjectId(*oid),
                    xid: Xid(1),
                };
                let val = OmapVal {
                    flags: 0,
                    size: 4096,
                    paddr: BlockNumber(*oid),
                };
                Record::new(&key.encode(), &val.encode())
            })
            .collect();
        assert_eq!(omap.rewrite(&records).unwrap(), LocalWrite::Done);
        let mut catalog = store.new_node(TreeKind::Catalog, 0).unwrap();
        let records: Vec<_> = oids
            .iter()
            .map(|oid| Record::new(&key(*oid).encode().unwrap(), &value(*oid, 8)))
            .collect();
        assert_eq!(catalog.rewrite(&records).unwrap(), LocalWrite::Done);

        for (probe, expected) in [(5, -1), (10, 0), (25, 1), (50, 4), (99, 4)] {
            let mut fixed = Frame::new(omap.clone());
            let fixed_step = node_query(
                &mut fixed,
                &SearchKey::omap(ObjectId(probe), Xid(1)),
                QueryFlags::NEAREST,
            )
            .unwrap();
            let mut variable = Frame::new(catalog.clone());
            let variable_step = node_query(
                &mut variable,
                &SearchKey::catalog(&key(probe)),
                QueryFlags::NEAREST,
            )
            .unwrap();
            assert_eq!(fixed_step, variable_step, "probe {probe}");
            assert_eq!(fixed.index, expected, "probe {probe}");
            assert_eq!(variable.index, expected, "probe {probe}");
        }
        store.abort().unwrap();
    }

    #[test]
    fn damaged_node_fails_its_checksum() {
        let (mem, mut store) = formatted();
        begin(&mut store);
        for oid in 0..200 {
            put(&mut store, &key(oid), &value(oid, 100));
        }
        store.commit().unwrap();

        let leaf = {
            let mut q = store
                .query(View::Committed, SearchKey::catalog(&key(150)), QueryFlags::EXACT)
                .unwrap();
            assert!(store.btree_query(&mut q).unwrap());
            q.node().unwrap().block()
        };
        let offset = usize::try_from(leaf.0).unwrap() * 4096 + 2000;
        let flipped = mem.snapshot()[offset] ^ 0xff;
        mem.poke(offset, &[flipped]).unwrap();

        let mut q = store
            .query(View::Committed, SearchKey::catalog(&key(150)), QueryFlags::EXACT)
            .unwrap();
        assert!(matches!(
            store.btree_query(&mut q),
            Err(CowfsError::ChecksumMismatch { block }) if block == leaf.0
        ));

        store.check_nodes = false;
        let mut q = store
            .query(View::Committed, SearchKey::catalog(&key(150)), QueryFlags::EXACT)
            .unwrap();
        assert!(store.btree_query(&mut q).is_ok());
    }

    #[test]
    fn oversized_records_are_rejected_up_front() {
        let (_mem, mut store) = formatted();
        begin(&mut store);
        let mut q = store
            .query(View::Working, SearchKey::catalog(&key(1)), QueryFlags::EXACT)
            .unwrap();
        assert!(!store.btree_query(&mut q).unwrap());
        let raw = key(1).encode().unwrap();
        let err = store.btree_insert(&mut q, &raw, &[0; 4096]).unwrap_err();
        assert!(matches!(err, CowfsError::RecordTooLarge { .. }));

        let long = CatalogKey::named(ObjectId(1), 3, vec![b'k'; 2500]).encode().unwrap();
        let err = store.btree_insert(&mut q, &long, &[]).unwrap_err();
        assert!(matches!(err, CowfsError::RecordTooLarge { .. }));
        store.abort().unwrap();
    }

    #[test]
    fn committed_view_is_read_only() {
        let (_mem, mut store) = formatted();
        begin(&mut store);
        let mut q = store
            .query(View::Committed, SearchKey::catalog(&key(1)), QueryFlags::EXACT)
            .unwrap();
        store.btree_query(&mut q).unwrap();
        let raw = key(1).encode().unwrap();
        assert!(matches!(
            store.btree_insert(&mut q, &raw, b"v"),
            Err(CowfsError::ReadOnly)
        ));
        store.abort().unwrap();
    }

    #[test]
    fn abort_discards_inserted_records() {
        let (_mem, mut store) = formatted();
        let free_before = store.allocator().free_blocks();
        begin(&mut store);
        for oid in 0..300 {
            put(&mut store, &key(oid), &value(oid, 100));
        }
        store.abort().unwrap();
        assert_eq!(store.allocator().free_blocks(), free_before);
        assert_eq!(get(&store, View::Working, &key(10)), None);
        assert_clean(&store, View::Committed, TreeKind::Catalog);

        store.begin(TxnBudget::new(8, 0)).unwrap();
        put(&mut store, &key(10), b"again");
        store.commit().unwrap();
        assert_eq!(get(&store, View::Committed, &key(10)), Some(b"again".to_vec()));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Insert(u64, usize),
        Remove(u64),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => (0_u64..400, 0_usize..300).prop_map(|(k, len)| Op::Insert(k, len)),
            1 => (0_u64..400).prop_map(Op::Remove),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn tree_agrees_with_a_btreemap(ops in proptest::collection::vec(op(), 1..400)) {
            let (_mem, mut store) = formatted();
            let mut model = BTreeMap::new();
            begin(&mut store);
            for op in ops {
                match op {
                    Op::Insert(k, len) => {
                        if model.contains_key(&k) {
                            continue;
                        }
                        put(&mut store, &key(k), &value(k, len));
                        model.insert(k, value(k, len));
                    }
                    Op::Remove(k) => {
                        let mut q = store
                            .query(View::Working, SearchKey::catalog(&key(k)), QueryFlags::EXACT)
                            .unwrap();
                        let found = store.btree_query(&mut q).unwrap();
                        prop_assert_eq!(found, model.remove(&k).is_some());
                        if found {
                            store.btree_remove(&mut q).unwrap();
                        }
                    }
                }
            }
            store.commit().unwrap();

            let report = store.check_tree(View::Committed, TreeKind::Catalog).unwrap();
            prop_assert!(report.is_clean(), "{:?}", report.problems);
            prop_assert_eq!(report.records, u64::try_from(model.len()).unwrap());
            let mut stored = Vec::new();
            store
                .walk(View::Committed, TreeKind::Catalog, |k, v| {
                    stored.push((CatalogKey::parse(k).unwrap().oid.0, v.to_vec()));
                    Ok(())
                })
                .unwrap();
            prop_assert_eq!(stored, model.into_iter().collect::<Vec<_>>());
        }
    }
}
