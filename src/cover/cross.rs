//! Cross coverage: Cartesian-product bins over sibling CoverPoints.

use indexmap::IndexMap;
use itertools::Itertools;

use crate::{
    cover::{
        db::CoverageDb,
        point::{validate_weight_at_least, BinState},
        CoverItem, CoveredEvent, Node, NodeKind, NodeRef,
    },
    error::{Error, Result},
    value::Value,
};

/// Leaf payload of a registered CoverCross.
pub(crate) struct CrossLeaf {
    /// The referenced point nodes, in declared axis order.
    pub points: Vec<NodeRef>,
    /// Ignore tuples; a `None` position matches any value of that axis.
    pub ign: Vec<Vec<Option<Value>>>,
    generated: Option<IndexMap<Value, BinState>>,
    pub pending: Vec<Value>,
}

impl CrossLeaf {
    pub fn new(points: Vec<NodeRef>, ign: Vec<Vec<Option<Value>>>) -> CrossLeaf {
        CrossLeaf {
            points,
            ign,
            generated: None,
            pending: Vec::new(),
        }
    }

    /// The cross's bins: the Cartesian product of the referenced points'
    /// bins minus the ignored tuples, materialized on first access.
    pub fn bins(&mut self) -> &mut IndexMap<Value, BinState> {
        let points = &self.points;
        let ign = &self.ign;
        self.generated.get_or_insert_with(|| {
            let axes: Vec<Vec<Value>> = points
                .iter()
                .map(|p| match &p.borrow().kind {
                    NodeKind::Point(point) => point.bins.keys().cloned().collect(),
                    _ => Vec::new(),
                })
                .collect();
            axes.iter()
                .map(|axis| axis.iter().cloned())
                .multi_cartesian_product()
                .filter(|combo| !ign.iter().any(|tuple| ignores(tuple, combo)))
                .map(|combo| (Value::Seq(combo), BinState { hits: 0, label: None }))
                .collect()
        })
    }

    /// Applies the current sample's per-axis match sets. Returns `None` when
    /// not every referenced point fired in this sample call.
    pub fn sample(&mut self, weight: u64, at_least: u64, seq: u64) -> Option<(Vec<CoveredEvent>, i64)> {
        let mut axis_matches: Vec<Vec<Value>> = Vec::with_capacity(self.points.len());
        for point in &self.points {
            match &point.borrow().kind {
                NodeKind::Point(p) if p.last_seq == seq => {
                    axis_matches.push(p.last_match.clone())
                }
                _ => return None,
            }
        }

        let mut events = Vec::new();
        let mut delta = 0i64;
        let combos: Vec<Vec<Value>> = axis_matches
            .iter()
            .map(|axis| axis.iter().cloned())
            .multi_cartesian_product()
            .collect();
        let bins = self.bins();
        let mut newly_covered = Vec::new();
        for combo in combos {
            let key = Value::Seq(combo);
            // Ignored combinations are absent from the bin map.
            if let Some(state) = bins.get_mut(&key) {
                state.hits += 1;
                if state.hits == at_least {
                    events.push(CoveredEvent { bin: key.clone(), label: None });
                    newly_covered.push(key);
                    delta += weight as i64;
                }
            }
        }
        self.pending.extend(newly_covered);
        Some((events, delta))
    }
}

/// True when the ignore tuple rules this combination out.
fn ignores(tuple: &[Option<Value>], combo: &[Value]) -> bool {
    tuple.len() == combo.len()
        && tuple
            .iter()
            .zip(combo)
            .all(|(pat, v)| pat.as_ref().map_or(true, |p| p == v))
}

/// Declarative description of a cross-coverage leaf over previously
/// registered CoverPoints.
pub struct CoverCross {
    name: String,
    items: Vec<String>,
    ign_bins: Vec<Vec<Option<Value>>>,
    weight: u64,
    at_least: u64,
}

impl CoverCross {
    /// Starts a CoverCross description for the given dotted name.
    pub fn new(name: &str) -> CoverCross {
        CoverCross {
            name: name.to_string(),
            items: Vec::new(),
            ign_bins: Vec::new(),
            weight: 1,
            at_least: 1,
        }
    }

    /// Full paths of the CoverPoints crossed, in axis order.
    pub fn items<S: Into<String>>(mut self, items: impl IntoIterator<Item = S>) -> CoverCross {
        self.items = items.into_iter().map(Into::into).collect();
        self
    }

    /// Combinations excluded from the product; `None` positions are
    /// wildcards.
    pub fn ign_bins(mut self, ign: impl IntoIterator<Item = Vec<Option<Value>>>) -> CoverCross {
        self.ign_bins = ign.into_iter().collect();
        self
    }

    /// Size multiplier, at least 1.
    pub fn weight(mut self, weight: u64) -> CoverCross {
        self.weight = weight;
        self
    }

    /// Minimum hit count for a combination to count as covered, at least 1.
    pub fn at_least(mut self, at_least: u64) -> CoverCross {
        self.at_least = at_least;
        self
    }

    /// Validates the description and registers the leaf. Every referenced
    /// item must already be a registered CoverPoint.
    pub fn register(self, db: &CoverageDb) -> Result<CoverItem> {
        validate_weight_at_least(&self.name, self.weight, self.at_least)?;
        if self.items.is_empty() {
            return Err(Error::Registration(format!(
                "`{}` crosses no items",
                self.name
            )));
        }

        let mut points = Vec::with_capacity(self.items.len());
        for item in &self.items {
            let node = db.lookup(item).ok_or_else(|| {
                Error::Registration(format!(
                    "`{}` references unknown item `{}`",
                    self.name, item
                ))
            })?;
            if !matches!(node.borrow().kind, NodeKind::Point(_)) {
                return Err(Error::Registration(format!(
                    "`{}` references `{}`, which is not a CoverPoint",
                    self.name, item
                )));
            }
            points.push(node);
        }

        for tuple in &self.ign_bins {
            if tuple.len() != self.items.len() {
                return Err(Error::Registration(format!(
                    "`{}`: ignore tuple has arity {}, expected {}",
                    self.name,
                    tuple.len(),
                    self.items.len()
                )));
            }
        }

        let leaf = CrossLeaf::new(points, self.ign_bins);
        db.register_leaf(Node::new(
            self.name,
            self.weight,
            self.at_least,
            NodeKind::Cross(leaf),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cover::{db::CoverageDb, point::CoverPoint};
    use crate::value::Sample;

    fn setup() -> (CoverageDb, CoverItem, CoverItem, CoverItem) {
        let db = CoverageDb::new();
        let x = CoverPoint::new("a.x").bins([0, 1]).vname("x").register(&db).unwrap();
        let y = CoverPoint::new("a.y").bins([0, 1, 2]).vname("y").register(&db).unwrap();
        let c = CoverCross::new("a.c")
            .items(["a.x", "a.y"])
            .ign_bins([vec![None, Some(Value::Int(2))]])
            .register(&db)
            .unwrap();
        (db, x, y, c)
    }

    #[test]
    fn test_product_minus_ignored_wildcards() {
        let (_db, _x, _y, c) = setup();
        // 2 * 3 = 6 combinations, minus (*, 2) = 2 ignored.
        assert_eq!(c.size(), 4);
    }

    #[test]
    fn test_ignored_combination_counts_nothing() {
        let (db, x, _y, c) = setup();
        db.sample(&["a.x", "a.y"], &Sample::new().with("x", 0).with("y", 2))
            .unwrap();
        assert_eq!(c.coverage(), 0);
        assert_eq!(x.coverage(), 1);
    }

    #[test]
    fn test_cross_updates_opportunistically_with_both_axes() {
        let (db, _x, _y, c) = setup();
        // The cross is not named in the dispatch list.
        db.sample(&["a.x", "a.y"], &Sample::new().with("x", 1).with("y", 0))
            .unwrap();
        assert_eq!(c.coverage(), 1);
        assert_eq!(
            c.new_hits(),
            vec![(
                "a.c".to_string(),
                Value::Seq(vec![Value::Int(1), Value::Int(0)])
            )]
        );
    }

    #[test]
    fn test_cross_silent_when_one_axis_missing() {
        let (db, x, _y, c) = setup();
        db.sample(&["a.x"], &Sample::new().with("x", 0)).unwrap();
        assert_eq!(x.coverage(), 1);
        assert_eq!(c.coverage(), 0);
    }

    #[test]
    fn test_unknown_reference_is_registration_error() {
        let db = CoverageDb::new();
        CoverPoint::new("a.x").bins([0]).register(&db).unwrap();
        let err = CoverCross::new("a.c")
            .items(["a.x", "a.missing"])
            .register(&db)
            .unwrap_err();
        assert!(matches!(err, Error::Registration(_)));
    }

    #[test]
    fn test_ignore_arity_mismatch_is_registration_error() {
        let db = CoverageDb::new();
        CoverPoint::new("b.x").bins([0]).register(&db).unwrap();
        CoverPoint::new("b.y").bins([0]).register(&db).unwrap();
        let err = CoverCross::new("b.c")
            .items(["b.x", "b.y"])
            .ign_bins([vec![Some(Value::Int(0))]])
            .register(&db)
            .unwrap_err();
        assert!(matches!(err, Error::Registration(_)));
    }
}
