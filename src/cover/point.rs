//! Single-dimensional coverage: a list of bins sampled through a
//! transformation and a relation.

use indexmap::IndexMap;

use crate::{
    cover::{
        db::CoverageDb,
        matcher::{BinMatcher, RelationFn, TransformFn},
        CoverItem, CoveredEvent, Node, NodeKind,
    },
    error::{Error, Result},
    value::{Sample, Value},
};

/// Hit state of one bin.
pub(crate) struct BinState {
    pub hits: u64,
    pub label: Option<String>,
}

/// Leaf payload of a registered CoverPoint.
pub(crate) struct PointLeaf {
    pub bins: IndexMap<Value, BinState>,
    pub matcher: BinMatcher,
    pub pending: Vec<Value>,
    /// Bins matched by the most recent sample, consumed by sibling crosses.
    pub last_match: Vec<Value>,
    /// Sample sequence number of `last_match`.
    pub last_seq: u64,
}

impl PointLeaf {
    /// Applies one sample: increments matched bins and reports newly covered
    /// bins together with the coverage delta they contribute.
    pub fn sample(
        &mut self,
        weight: u64,
        at_least: u64,
        sample: &Sample,
        seq: u64,
    ) -> Result<(Vec<CoveredEvent>, i64)> {
        let Self { bins, matcher, .. } = self;
        let matched = matcher.matches(sample, bins.keys())?;

        let mut events = Vec::new();
        let mut delta = 0i64;
        let mut matched_values = Vec::with_capacity(matched.len());
        for idx in matched {
            let (value, state) = self
                .bins
                .get_index_mut(idx)
                .expect("matcher yields in-range bin indices");
            state.hits += 1;
            if state.hits == at_least {
                events.push(CoveredEvent {
                    bin: value.clone(),
                    label: state.label.clone(),
                });
                self.pending.push(value.clone());
                delta += weight as i64;
            }
            matched_values.push(value.clone());
        }

        self.last_match = matched_values;
        self.last_seq = seq;
        Ok((events, delta))
    }
}

/// Declarative description of a single-dimensional coverage leaf. Configure
/// with the chained setters, then [`register`](CoverPoint::register) it into
/// a database.
///
/// ```no_run
/// # use fcov::{cover::point::CoverPoint, CoverageDb, Value};
/// let db = CoverageDb::new();
/// let addr = CoverPoint::new("memory.address")
///     .bins([Value::pair(0, 50), Value::pair(51, 150), Value::pair(151, 255)])
///     .vname("addr")
///     .rel(|v, bin| {
///         let r = bin.as_seq().unwrap();
///         r[0].as_int() <= v.as_int() && v.as_int() <= r[1].as_int()
///     })
///     .register(&db)
///     .unwrap();
/// ```
pub struct CoverPoint {
    name: String,
    bins: Vec<Value>,
    labels: Option<Vec<String>>,
    xf: Option<TransformFn>,
    rel: Option<RelationFn>,
    vname: Option<String>,
    weight: u64,
    at_least: u64,
    injective: bool,
}

impl CoverPoint {
    /// Starts a CoverPoint description for the given dotted name.
    pub fn new(name: &str) -> CoverPoint {
        CoverPoint {
            name: name.to_string(),
            bins: Vec::new(),
            labels: None,
            xf: None,
            rel: None,
            vname: None,
            weight: 1,
            at_least: 1,
            injective: true,
        }
    }

    /// The bins sampled values are tested against, in match-precedence order.
    pub fn bins<V: Into<Value>>(mut self, bins: impl IntoIterator<Item = V>) -> CoverPoint {
        self.bins = bins.into_iter().map(Into::into).collect();
        self
    }

    /// Labels paired with the bins, used by bins callbacks and reports. Must
    /// be as long as the bin list.
    pub fn bins_labels<S: Into<String>>(mut self, labels: impl IntoIterator<Item = S>) -> CoverPoint {
        self.labels = Some(labels.into_iter().map(Into::into).collect());
        self
    }

    /// Transformation applied to the sampled arguments before matching.
    pub fn xf(mut self, f: impl FnMut(&Sample) -> Result<Value> + 'static) -> CoverPoint {
        self.xf = Some(Box::new(f));
        self
    }

    /// Relation between the transformed value and a bin. Defaults to
    /// equality.
    pub fn rel(mut self, f: impl FnMut(&Value, &Value) -> bool + 'static) -> CoverPoint {
        self.rel = Some(Box::new(f));
        self
    }

    /// Name of the sampled argument matched against bins when no
    /// transformation is given.
    pub fn vname(mut self, name: &str) -> CoverPoint {
        self.vname = Some(name.to_string());
        self
    }

    /// Size multiplier, at least 1.
    pub fn weight(mut self, weight: u64) -> CoverPoint {
        self.weight = weight;
        self
    }

    /// Minimum hit count for a bin to count as covered, at least 1.
    pub fn at_least(mut self, at_least: u64) -> CoverPoint {
        self.at_least = at_least;
        self
    }

    /// Whether a sample matches at most one bin (the first in declared
    /// order). Defaults to true.
    pub fn injective(mut self, injective: bool) -> CoverPoint {
        self.injective = injective;
        self
    }

    /// Validates the description and registers the leaf, creating any missing
    /// containers along the dotted path.
    pub fn register(self, db: &CoverageDb) -> Result<CoverItem> {
        validate_weight_at_least(&self.name, self.weight, self.at_least)?;

        let labels = match self.labels {
            Some(labels) if labels.len() != self.bins.len() => {
                return Err(Error::Registration(format!(
                    "`{}` declares {} bins but {} labels",
                    self.name,
                    self.bins.len(),
                    labels.len()
                )));
            }
            other => other,
        };

        let mut bins: IndexMap<Value, BinState> = IndexMap::with_capacity(self.bins.len());
        for (idx, bin) in self.bins.into_iter().enumerate() {
            let label = labels.as_ref().map(|l| l[idx].clone());
            if bins.insert(bin.clone(), BinState { hits: 0, label }).is_some() {
                return Err(Error::Registration(format!(
                    "`{}` declares bin `{}` twice",
                    self.name, bin
                )));
            }
        }

        let matcher = BinMatcher::new(
            self.name.clone(),
            self.xf,
            self.rel,
            self.vname,
            self.injective,
        );
        let leaf = PointLeaf {
            bins,
            matcher,
            pending: Vec::new(),
            last_match: Vec::new(),
            last_seq: 0,
        };
        db.register_leaf(Node::new(
            self.name,
            self.weight,
            self.at_least,
            NodeKind::Point(leaf),
        ))
    }
}

pub(crate) fn validate_weight_at_least(name: &str, weight: u64, at_least: u64) -> Result<()> {
    if weight == 0 {
        return Err(Error::Registration(format!(
            "`{}`: weight must be at least 1",
            name
        )));
    }
    if at_least == 0 {
        return Err(Error::Registration(format!(
            "`{}`: at_least must be at least 1",
            name
        )));
    }
    Ok(())
}
