//! Hierarchical functional-coverage database: a prefix trie of named items
//! populated by sampling primitives.
//!
//! Leaves are [`point::CoverPoint`]s, [`cross::CoverCross`]es and
//! [`check::CoverCheck`]s; every dotted-name prefix above a leaf is an
//! implicit container that aggregates its children. All updates are
//! single-threaded and synchronous: a sample updates a leaf, walks to the
//! root refreshing aggregates, and fires any newly satisfied callbacks in
//! child-before-parent order before the sampling call returns.

use std::{
    cell::RefCell,
    collections::HashSet,
    rc::{Rc, Weak},
};

use indexmap::IndexMap;

use crate::{
    error::{Error, Result},
    value::Value,
};

pub mod check;
pub mod cross;
pub mod db;
pub mod export;
pub mod matcher;
pub mod point;
pub mod section;

use check::CheckLeaf;
use cross::CrossLeaf;
use point::PointLeaf;

/// Error type user callbacks may return. Callback failures never interrupt
/// the update that triggered them; they are surfaced once the update is done.
pub type CallbackError = Box<dyn std::error::Error>;

/// Result type user callbacks return.
pub type CallbackResult = std::result::Result<(), CallbackError>;

type CallbackFn = Box<dyn FnMut() -> CallbackResult>;

pub(crate) type NodeRef = Rc<RefCell<Node>>;

/// A threshold callback waiting for the item's percentage to cross a mark.
/// The closure slot empties once the callback has fired.
pub(crate) struct ThresholdHook {
    percent: f64,
    f: Option<CallbackFn>,
}

/// A bins callback keyed by label. Fires once per labeled bin, the first time
/// that bin becomes covered anywhere below the owning item.
pub(crate) struct BinsHook {
    label: String,
    f: Option<CallbackFn>,
    seen: HashSet<(String, Value)>,
}

/// One newly covered bin produced by a leaf update.
pub(crate) struct CoveredEvent {
    pub bin: Value,
    pub label: Option<String>,
}

/// A node of the coverage trie: an implicit container or one of the three
/// leaf kinds.
pub(crate) struct Node {
    pub name: String,
    pub weight: u64,
    pub at_least: u64,
    pub parent: Weak<RefCell<Node>>,
    pub kind: NodeKind,
    threshold_hooks: Vec<ThresholdHook>,
    bins_hooks: Vec<BinsHook>,
    pub updating: bool,
}

pub(crate) enum NodeKind {
    Container { children: Vec<NodeRef> },
    Point(PointLeaf),
    Cross(CrossLeaf),
    Check(CheckLeaf),
}

impl Node {
    pub fn new(name: String, weight: u64, at_least: u64, kind: NodeKind) -> Node {
        Node {
            name,
            weight,
            at_least,
            parent: Weak::new(),
            kind,
            threshold_hooks: Vec::new(),
            bins_hooks: Vec::new(),
            updating: false,
        }
    }

    pub fn container(name: String) -> Node {
        Node::new(name, 1, 1, NodeKind::Container { children: Vec::new() })
    }

    pub fn is_container(&self) -> bool {
        matches!(self.kind, NodeKind::Container { .. })
    }

    /// Total size: number of bins times weight for leaves, sum over children
    /// for containers. Takes `&mut self` because cross bins materialize on
    /// first access.
    pub fn size(&mut self) -> u64 {
        match &mut self.kind {
            NodeKind::Container { children } => {
                children.iter().map(|c| c.borrow_mut().size()).sum()
            }
            NodeKind::Point(p) => self.weight * p.bins.len() as u64,
            NodeKind::Cross(c) => self.weight * c.bins().len() as u64,
            NodeKind::Check(_) => self.weight,
        }
    }

    /// Covered size: weight times the number of bins whose hit count reached
    /// `at_least`, folded over children for containers.
    pub fn coverage(&mut self) -> u64 {
        let (weight, at_least) = (self.weight, self.at_least);
        match &mut self.kind {
            NodeKind::Container { children } => {
                children.iter().map(|c| c.borrow_mut().coverage()).sum()
            }
            NodeKind::Point(p) => {
                weight * p.bins.values().filter(|b| b.hits >= at_least).count() as u64
            }
            NodeKind::Cross(c) => {
                weight * c.bins().values().filter(|b| b.hits >= at_least).count() as u64
            }
            NodeKind::Check(c) => {
                if c.covered(at_least) {
                    weight
                } else {
                    0
                }
            }
        }
    }

    pub fn cover_percentage(&mut self) -> f64 {
        percentage(self.coverage(), self.size())
    }

    /// Per-bin hit counts for leaves; child name (as a string value) mapped
    /// to child coverage for containers.
    pub fn detailed_coverage(&mut self) -> IndexMap<Value, u64> {
        match &mut self.kind {
            NodeKind::Container { children } => children
                .iter()
                .map(|c| {
                    let mut child = c.borrow_mut();
                    (Value::Str(child.name.clone()), child.coverage())
                })
                .collect(),
            NodeKind::Point(p) => p.bins.iter().map(|(v, b)| (v.clone(), b.hits)).collect(),
            NodeKind::Cross(c) => c.bins().iter().map(|(v, b)| (v.clone(), b.hits)).collect(),
            NodeKind::Check(c) => IndexMap::from([
                (Value::Str("PASS".to_string()), c.pass_hits),
                (Value::Str("FAIL".to_string()), c.fail_hits),
            ]),
        }
    }

    /// Drains the bins newly covered since the previous query, as
    /// `(item path, bin)` pairs. Consume-on-read.
    pub fn take_new_hits(&mut self) -> Vec<(String, Value)> {
        match &mut self.kind {
            NodeKind::Container { children } => children
                .iter()
                .flat_map(|c| c.borrow_mut().take_new_hits())
                .collect(),
            NodeKind::Point(p) => drain_pending(&self.name, &mut p.pending),
            NodeKind::Cross(c) => drain_pending(&self.name, &mut c.pending),
            NodeKind::Check(c) => drain_pending(&self.name, &mut c.pending),
        }
    }

    pub fn add_threshold_hook(&mut self, percent: f64, f: CallbackFn) -> Result<()> {
        if !(percent > 0.0 && percent <= 100.0) {
            return Err(Error::Registration(format!(
                "threshold callback percentage {} on `{}` must lie in (0, 100]",
                percent, self.name
            )));
        }
        self.threshold_hooks.push(ThresholdHook { percent, f: Some(f) });
        Ok(())
    }

    pub fn add_bins_hook(&mut self, label: String, f: CallbackFn) {
        self.bins_hooks.push(BinsHook {
            label,
            f: Some(f),
            seen: HashSet::new(),
        });
    }
}

fn drain_pending(name: &str, pending: &mut Vec<Value>) -> Vec<(String, Value)> {
    pending
        .drain(..)
        .map(|bin| (name.to_string(), bin))
        .collect()
}

pub(crate) fn percentage(coverage: u64, size: u64) -> f64 {
    if size == 0 {
        0.0
    } else {
        100.0 * coverage as f64 / size as f64
    }
}

/// Public handle over a coverage item, container or leaf. Cheap to clone;
/// exposes the query API and callback registration.
#[derive(Clone)]
pub struct CoverItem {
    pub(crate) node: NodeRef,
}

impl std::fmt::Debug for CoverItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoverItem")
            .field("name", &self.name())
            .finish()
    }
}

impl CoverItem {
    /// The item's full dotted name.
    pub fn name(&self) -> String {
        self.node.borrow().name.clone()
    }

    /// The size multiplier this item was registered with.
    pub fn weight(&self) -> u64 {
        self.node.borrow().weight
    }

    /// The per-bin hit count required for coverage.
    pub fn at_least(&self) -> u64 {
        self.node.borrow().at_least
    }

    /// Total size of this item (bins times weight, summed over children).
    pub fn size(&self) -> u64 {
        self.node.borrow_mut().size()
    }

    /// Covered size of this item.
    pub fn coverage(&self) -> u64 {
        self.node.borrow_mut().coverage()
    }

    /// `100 * coverage / size`, or 0 for an empty item.
    pub fn cover_percentage(&self) -> f64 {
        self.node.borrow_mut().cover_percentage()
    }

    /// Per-bin hit counts for leaves; child coverage keyed by child name for
    /// containers.
    pub fn detailed_coverage(&self) -> IndexMap<Value, u64> {
        self.node.borrow_mut().detailed_coverage()
    }

    /// Bins covered since the last call, as `(item path, bin)` pairs. The
    /// pending set resets to empty on read.
    pub fn new_hits(&self) -> Vec<(String, Value)> {
        self.node.borrow_mut().take_new_hits()
    }

    /// Registers a callback fired once, when `cover_percentage` first crosses
    /// `percent` from below. `percent` must lie in `(0, 100]`.
    pub fn add_threshold_callback(
        &self,
        percent: f64,
        f: impl FnMut() -> CallbackResult + 'static,
    ) -> Result<()> {
        self.node
            .borrow_mut()
            .add_threshold_hook(percent, Box::new(f))
    }

    /// Registers a callback fired once per bin carrying `label`, the first
    /// time that bin becomes covered in this item or any descendant.
    pub fn add_bins_callback(&self, label: &str, f: impl FnMut() -> CallbackResult + 'static) {
        self.node
            .borrow_mut()
            .add_bins_hook(label.to_string(), Box::new(f));
    }
}

enum HookSlot {
    Threshold(usize),
    Bins(usize),
}

/// Walks from an updated leaf to the root, deciding which callbacks the
/// update satisfied, then fires them child-before-parent with all node
/// borrows released. Callback errors are collected, never short-circuited.
pub(crate) fn propagate_update(
    leaf: &NodeRef,
    leaf_name: &str,
    events: &[CoveredEvent],
    delta: i64,
    errors: &mut Vec<Error>,
) {
    let mut chain: Vec<NodeRef> = vec![Rc::clone(leaf)];
    loop {
        let parent = chain.last().unwrap().borrow().parent.upgrade();
        match parent {
            Some(p) => chain.push(p),
            None => break,
        }
    }

    let mut to_fire: Vec<(NodeRef, HookSlot)> = Vec::new();
    for node_ref in &chain {
        let mut node = node_ref.borrow_mut();

        // Hooks outer, events inner, so firing follows registration order.
        for (idx, hook) in node.bins_hooks.iter_mut().enumerate() {
            if hook.f.is_none() {
                continue;
            }
            for event in events {
                if event.label.as_deref() != Some(hook.label.as_str()) {
                    continue;
                }
                let key = (leaf_name.to_string(), event.bin.clone());
                if hook.seen.insert(key) {
                    to_fire.push((Rc::clone(node_ref), HookSlot::Bins(idx)));
                }
            }
        }

        if delta != 0 {
            let size = node.size();
            let after = node.coverage();
            let before = (after as i64 - delta).max(0) as u64;
            let pct_after = percentage(after, size);
            let pct_before = percentage(before, size);
            for (idx, hook) in node.threshold_hooks.iter().enumerate() {
                if hook.f.is_some() && pct_before < hook.percent && pct_after >= hook.percent {
                    to_fire.push((Rc::clone(node_ref), HookSlot::Threshold(idx)));
                }
            }
        }
    }

    for (node_ref, slot) in to_fire {
        let (mut f, item) = {
            let mut node = node_ref.borrow_mut();
            let f = match &slot {
                HookSlot::Threshold(idx) => node.threshold_hooks[*idx].f.take(),
                HookSlot::Bins(idx) => node.bins_hooks[*idx].f.take(),
            };
            (f.expect("hook closure present when scheduled"), node.name.clone())
        };
        if let Err(source) = f() {
            errors.push(Error::Callback { item, source });
        }
        // Bins hooks keep firing for other labeled bins; threshold hooks are
        // one-shot and stay empty.
        if let HookSlot::Bins(idx) = slot {
            node_ref.borrow_mut().bins_hooks[idx].f = Some(f);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentage_of_empty_item_is_zero() {
        assert_eq!(percentage(0, 0), 0.0);
        assert_eq!(percentage(2, 3), 100.0 * 2.0 / 3.0);
        assert_eq!(percentage(7, 7), 100.0);
    }
}
