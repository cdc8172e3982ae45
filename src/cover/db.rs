//! The process-scoped coverage registry: dotted names mapped to trie nodes,
//! with sampling dispatch and summary reporting.

use std::{cell::RefCell, collections::BTreeMap, fmt, rc::Rc};

use tracing::{debug, info};

use crate::{
    cover::{propagate_update, CoverItem, Node, NodeKind, NodeRef},
    error::{Error, Result},
    value::Sample,
};

struct DbState {
    items: BTreeMap<String, NodeRef>,
    sample_seq: u64,
}

/// A coverage database. Cloning yields another handle onto the same
/// registry. Most test benches use the process-wide [`coverage_db`]; explicit
/// instances exist for isolation.
#[derive(Clone)]
pub struct CoverageDb {
    inner: Rc<RefCell<DbState>>,
}

impl Default for CoverageDb {
    fn default() -> Self {
        Self::new()
    }
}

impl CoverageDb {
    /// Creates an empty database.
    pub fn new() -> CoverageDb {
        CoverageDb {
            inner: Rc::new(RefCell::new(DbState {
                items: BTreeMap::new(),
                sample_seq: 0,
            })),
        }
    }

    /// Looks an item up by its full dotted name.
    pub fn get(&self, name: &str) -> Result<CoverItem> {
        self.lookup(name)
            .map(|node| CoverItem { node })
            .ok_or_else(|| Error::UnknownItem(name.to_string()))
    }

    /// Whether an item with this name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.inner.borrow().items.contains_key(name)
    }

    /// All registered item names, containers included, in name order.
    pub fn item_names(&self) -> Vec<String> {
        self.inner.borrow().items.keys().cloned().collect()
    }

    /// Number of registered items, containers included.
    pub fn len(&self) -> usize {
        self.inner.borrow().items.len()
    }

    /// Whether nothing has been registered yet.
    pub fn is_empty(&self) -> bool {
        self.inner.borrow().items.is_empty()
    }

    pub(crate) fn lookup(&self, name: &str) -> Option<NodeRef> {
        self.inner.borrow().items.get(name).cloned()
    }

    /// Registers a fully built leaf node, materializing missing containers
    /// along its dotted path.
    pub(crate) fn register_leaf(&self, node: Node) -> Result<CoverItem> {
        let name = node.name.clone();
        if name.is_empty() || name.split('.').any(|seg| seg.is_empty()) {
            return Err(Error::Registration(format!(
                "`{}` is not a valid dotted name",
                name
            )));
        }

        let mut state = self.inner.borrow_mut();
        if state.items.contains_key(&name) {
            return Err(Error::DuplicateItem(name));
        }

        // Materialize the container chain above the leaf. Containers are
        // shared: registering `a.b.c` then `a.b.d` yields a single `a.b`.
        let mut parent: Option<NodeRef> = None;
        let segments: Vec<&str> = name.split('.').collect();
        for depth in 1..segments.len() {
            let prefix = segments[..depth].join(".");
            let container = match state.items.get(&prefix) {
                Some(existing) => {
                    if !existing.borrow().is_container() {
                        return Err(Error::Registration(format!(
                            "cannot register `{}`: `{}` is a leaf",
                            name, prefix
                        )));
                    }
                    Rc::clone(existing)
                }
                None => {
                    let fresh = Rc::new(RefCell::new(Node::container(prefix.clone())));
                    link(&parent, &fresh);
                    state.items.insert(prefix, Rc::clone(&fresh));
                    fresh
                }
            };
            parent = Some(container);
        }

        let leaf: NodeRef = Rc::new(RefCell::new(node));
        link(&parent, &leaf);
        state.items.insert(name, Rc::clone(&leaf));
        Ok(CoverItem { node: leaf })
    }

    /// Samples the named leaves with the given arguments, then updates every
    /// cross whose referenced points all fired in this call. Callback errors
    /// are deferred until the whole dispatch has run; the first one is
    /// returned.
    pub fn sample(&self, items: &[&str], sample: &Sample) -> Result<()> {
        let seq = {
            let mut state = self.inner.borrow_mut();
            state.sample_seq += 1;
            state.sample_seq
        };

        let mut named = Vec::with_capacity(items.len());
        for name in items {
            named.push((*name, self.get(name)?.node));
        }

        let mut deferred: Vec<Error> = Vec::new();
        for (name, node) in &named {
            let kind_ok = {
                let n = node.borrow();
                match n.kind {
                    NodeKind::Container { .. } => {
                        return Err(Error::Contract(format!(
                            "`{}` is a container and cannot be sampled directly",
                            name
                        )))
                    }
                    // Crosses update opportunistically below.
                    NodeKind::Cross(_) => false,
                    _ => true,
                }
            };
            if kind_ok {
                self.update_leaf(node, sample, seq, &mut deferred)?;
            }
        }

        // Every registered cross gets a chance, in name order, whether or
        // not it was named in the dispatch list.
        let crosses: Vec<NodeRef> = {
            let state = self.inner.borrow();
            state
                .items
                .values()
                .filter(|n| matches!(n.borrow().kind, NodeKind::Cross(_)))
                .cloned()
                .collect()
        };
        for node in crosses {
            self.update_cross(&node, seq, &mut deferred)?;
        }

        match deferred.into_iter().next() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn update_leaf(
        &self,
        node_ref: &NodeRef,
        sample: &Sample,
        seq: u64,
        deferred: &mut Vec<Error>,
    ) -> Result<()> {
        let (name, events, delta) = {
            let mut node = node_ref.borrow_mut();
            if node.updating {
                return Err(Error::Contract(format!(
                    "reentrant sample on `{}` from within its own update",
                    node.name
                )));
            }
            node.updating = true;
            let name = node.name.clone();
            let (weight, at_least) = (node.weight, node.at_least);
            let outcome = match &mut node.kind {
                NodeKind::Point(p) => p.sample(weight, at_least, sample, seq),
                NodeKind::Check(c) => Ok(c.sample(weight, at_least, sample)),
                _ => Ok((Vec::new(), 0)),
            };
            match outcome {
                Ok((events, delta)) => (name, events, delta),
                Err(e) => {
                    node.updating = false;
                    return Err(e);
                }
            }
        };

        if !events.is_empty() {
            debug!("`{}`: {} newly covered bin(s)", name, events.len());
        }
        propagate_update(node_ref, &name, &events, delta, deferred);
        node_ref.borrow_mut().updating = false;
        Ok(())
    }

    fn update_cross(&self, node_ref: &NodeRef, seq: u64, deferred: &mut Vec<Error>) -> Result<()> {
        let fired = {
            let mut node = node_ref.borrow_mut();
            if node.updating {
                return Err(Error::Contract(format!(
                    "reentrant sample on `{}` from within its own update",
                    node.name
                )));
            }
            node.updating = true;
            let (weight, at_least) = (node.weight, node.at_least);
            let outcome = match &mut node.kind {
                NodeKind::Cross(c) => c.sample(weight, at_least, seq),
                _ => None,
            };
            outcome.map(|(events, delta)| (node.name.clone(), events, delta))
        };

        if let Some((name, events, delta)) = fired {
            if !events.is_empty() {
                debug!("`{}`: {} newly covered combination(s)", name, events.len());
            }
            propagate_update(node_ref, &name, &events, delta, deferred);
        }
        node_ref.borrow_mut().updating = false;
        Ok(())
    }

    /// Logs a coverage summary for every item in name order, optionally with
    /// per-bin hit counts.
    pub fn report(&self, include_bins: bool) {
        let entries: Vec<NodeRef> = self.inner.borrow().items.values().cloned().collect();
        for node_ref in entries {
            let mut node = node_ref.borrow_mut();
            let (coverage, size) = (node.coverage(), node.size());
            info!(
                "{} : {}/{} ({})",
                node.name,
                coverage,
                size,
                PercentageFormat(coverage, size)
            );
            if include_bins && !node.is_container() {
                for (bin, hits) in node.detailed_coverage() {
                    info!("  bin {} : {} hit(s)", bin, hits);
                }
            }
        }
    }
}

fn link(parent: &Option<NodeRef>, child: &NodeRef) {
    if let Some(parent) = parent {
        child.borrow_mut().parent = Rc::downgrade(parent);
        if let NodeKind::Container { children } = &mut parent.borrow_mut().kind {
            children.push(Rc::clone(child));
        }
    }
}

//====================//
// Display and global //
//====================//

/// Utility struct for displaying coverage ratios as percentages. The first
/// field is the covered size and the second the total size.
pub struct PercentageFormat(pub u64, pub u64);

impl fmt::Display for PercentageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.1 == 0 {
            f.write_str("N/A")
        } else {
            let (a, b) = (self.0 as f64, self.1 as f64);
            write!(f, "{:.2}%", a / b * 100.0)
        }
    }
}

thread_local! {
    static GLOBAL_DB: RefCell<Option<CoverageDb>> = RefCell::new(None);
}

/// The process-wide coverage database, created on first access. The core is
/// single-threaded; the registry is per-thread state.
pub fn coverage_db() -> CoverageDb {
    GLOBAL_DB.with(|global| {
        global
            .borrow_mut()
            .get_or_insert_with(CoverageDb::new)
            .clone()
    })
}

/// Discards the process-wide database so tests can start from scratch.
pub fn reset_coverage_db() {
    GLOBAL_DB.with(|global| *global.borrow_mut() = None);
}
