#![forbid(unsafe_code)]
//! Whole-tree traversal and consistency checking.

use crate::key::TreeKind;
use crate::node::Node;
use crate::query::MAX_DEPTH;
use crate::store::{ObjectStore, View};
use crate::{corruption, parse_corruption};
use cowfs_error::{CowfsError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::{debug, warn};

/// What [`ObjectStore::check_tree`] found.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeReport {
    /// Leaf records.
    pub records: u64,
    pub nodes: u64,
    /// Levels, counting the root.
    pub height: usize,
    pub longest_key: u32,
    pub longest_val: u32,
    /// Violated invariants, one line each.
    pub problems: Vec<String>,
}

impl TreeReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.problems.is_empty()
    }
}

struct CheckState {
    tree: TreeKind,
    view: View,
    last_key: Option<Vec<u8>>,
    report: TreeReport,
}

impl ObjectStore {
    /// Visit every leaf record of `tree` in key order.
    pub fn walk<F>(&self, view: View, tree: TreeKind, mut visit: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> Result<()>,
    {
        let root = self.tree_root(view, tree)?;
        self.walk_node(view, &root, 0, &mut visit)
    }

    fn walk_node(
        &self,
        view: View,
        node: &Node,
        depth: usize,
        visit: &mut dyn FnMut(&[u8], &[u8]) -> Result<()>,
    ) -> Result<()> {
        if depth >= MAX_DEPTH {
            return Err(corruption(node.block(), "b-tree is too deep"));
        }
        if node.is_leaf() {
            for record in node.entries()? {
                visit(&record.key, &record.value)?;
            }
            return Ok(());
        }
        for index in 0..node.records() {
            let child = self.read_node(view, node.tree(), node.child_at(index)?, node.level())?;
            self.walk_node(view, &child, depth + 1, visit)?;
        }
        Ok(())
    }

    /// Walk `tree` verifying key order, routing keys, levels, node
    /// allocation and the root's tree info.
    ///
    /// Broken invariants are collected in the report; I/O and checksum
    /// failures are returned as errors.
    pub fn check_tree(&self, view: View, tree: TreeKind) -> Result<TreeReport> {
        let root = self.tree_root(view, tree)?;
        let info = root.info()?;
        let mut state = CheckState {
            tree,
            view,
            last_key: None,
            report: TreeReport {
                height: usize::from(root.level()) + 1,
                ..TreeReport::default()
            },
        };
        self.check_node(&mut state, &root, None, 0)?;

        let mut report = state.report;
        if info.key_count != report.records {
            report.problems.push(format!(
                "tree info counts {} records, found {}",
                info.key_count, report.records
            ));
        }
        if info.node_count != report.nodes {
            report.problems.push(format!(
                "tree info counts {} nodes, found {}",
                info.node_count, report.nodes
            ));
        }
        if info.longest_key < report.longest_key || info.longest_val < report.longest_val {
            report.problems.push(format!(
                "tree info maxima {}/{} below stored {}/{}",
                info.longest_key, info.longest_val, report.longest_key, report.longest_val
            ));
        }
        report.longest_key = report.longest_key.max(info.longest_key);
        report.longest_val = report.longest_val.max(info.longest_val);

        if report.is_clean() {
            debug!(?tree, records = report.records, nodes = report.nodes, "btree_check_clean");
        } else {
            warn!(?tree, problems = report.problems.len(), "btree_check_problems");
        }
        Ok(report)
    }

    fn check_node(
        &self,
        state: &mut CheckState,
        node: &Node,
        routing_key: Option<&[u8]>,
        depth: usize,
    ) -> Result<()> {
        if depth >= MAX_DEPTH {
            return Err(corruption(node.block(), "b-tree is too deep"));
        }
        let block = node.block();
        state.report.nodes += 1;
        if !self.alloc.is_allocated(block) && self.txns.dirty(block).is_none() {
            state
                .report
                .problems
                .push(format!("node at block {} is not allocated", block.0));
        }

        let records = node.entries()?;
        if records.is_empty() && !node.is_root() {
            state
                .report
                .problems
                .push(format!("non-root node at block {} is empty", block.0));
        }
        if let Some(routing_key) = routing_key {
            if records.first().map(|record| record.key.as_slice()) != Some(routing_key) {
                state.report.problems.push(format!(
                    "routing key for block {} differs from its first key",
                    block.0
                ));
            }
        }
        for pair in records.windows(2) {
            let order = state
                .tree
                .compare_raw(&pair[0].key, &pair[1].key)
                .map_err(|e| parse_corruption(block, &e))?;
            if order != Ordering::Less {
                state
                    .report
                    .problems
                    .push(format!("records of block {} are out of order", block.0));
                break;
            }
        }

        if node.is_leaf() {
            for record in &records {
                if let Some(last) = &state.last_key {
                    let order = state
                        .tree
                        .compare_raw(last, &record.key)
                        .map_err(|e| parse_corruption(block, &e))?;
                    if order != Ordering::Less {
                        state.report.problems.push(format!(
                            "block {} starts before the end of the previous leaf",
                            block.0
                        ));
                    }
                }
                state.last_key = Some(record.key.clone());
                state.report.records += 1;
                state.report.longest_key = state.report.longest_key.max(len_u32(record.key.len()));
                state.report.longest_val = state.report.longest_val.max(len_u32(record.value.len()));
            }
            return Ok(());
        }

        for (index, record) in records.iter().enumerate() {
            let child = match self.read_node(state.view, state.tree, node.child_at(index)?, node.level()) {
                Ok(child) => child,
                Err(CowfsError::Corruption { block, detail }) => {
                    state
                        .report
                        .problems
                        .push(format!("block {block}: {detail}"));
                    continue;
                }
                Err(err) => return Err(err),
            };
            self.check_node(state, &child, Some(&record.key), depth + 1)?;
        }
        Ok(())
    }
}

fn len_u32(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}
