//! Assertion-like coverage: a pass/fail leaf whose failure is absorbing.

use crate::{
    cover::{db::CoverageDb, point::validate_weight_at_least, CoverItem, CoveredEvent, Node, NodeKind},
    error::{Error, Result},
    value::{Sample, Value},
};

/// Predicate evaluated against the sampled arguments.
pub type SamplePredicate = Box<dyn FnMut(&Sample) -> bool>;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum CheckState {
    New,
    Pass,
    Fail,
}

/// Leaf payload of a registered CoverCheck.
pub(crate) struct CheckLeaf {
    f_fail: SamplePredicate,
    f_pass: Option<SamplePredicate>,
    pub state: CheckState,
    pub pass_hits: u64,
    pub fail_hits: u64,
    pub pending: Vec<Value>,
}

impl CheckLeaf {
    pub fn new(f_fail: SamplePredicate, f_pass: Option<SamplePredicate>) -> CheckLeaf {
        CheckLeaf {
            f_fail,
            f_pass,
            state: CheckState::New,
            pass_hits: 0,
            fail_hits: 0,
            pending: Vec::new(),
        }
    }

    /// Covered once the pass predicate held `at_least` times and the fail
    /// predicate never held.
    pub fn covered(&self, at_least: u64) -> bool {
        self.state != CheckState::Fail && self.pass_hits >= at_least
    }

    /// Applies one sample. Failure is absorbing: once failed the leaf stays
    /// at zero coverage forever.
    pub fn sample(&mut self, weight: u64, at_least: u64, sample: &Sample) -> (Vec<CoveredEvent>, i64) {
        if self.state == CheckState::Fail {
            return (Vec::new(), 0);
        }

        if (self.f_fail)(sample) {
            let was_covered = self.covered(at_least);
            self.fail_hits += 1;
            self.state = CheckState::Fail;
            self.pending.push(Value::Str("FAIL".to_string()));
            let events = vec![CoveredEvent {
                bin: Value::Str("FAIL".to_string()),
                label: Some("FAIL".to_string()),
            }];
            let delta = if was_covered { -(weight as i64) } else { 0 };
            return (events, delta);
        }

        let passed = match &mut self.f_pass {
            Some(f) => f(sample),
            // With no explicit pass predicate, any non-failing sample passes.
            None => true,
        };
        if passed {
            self.pass_hits += 1;
            if self.pass_hits == at_least {
                self.state = CheckState::Pass;
                self.pending.push(Value::Str("PASS".to_string()));
                let events = vec![CoveredEvent {
                    bin: Value::Str("PASS".to_string()),
                    label: Some("PASS".to_string()),
                }];
                return (events, weight as i64);
            }
        }
        (Vec::new(), 0)
    }

    /// Direct hit-count addition used by coverage merging.
    pub fn add_hits(&mut self, label: &str, n: u64, weight: u64, at_least: u64) -> (Vec<CoveredEvent>, i64) {
        if n == 0 {
            return (Vec::new(), 0);
        }
        let was_covered = self.covered(at_least);
        match label {
            "PASS" => self.pass_hits += n,
            _ => {
                self.fail_hits += n;
                self.state = CheckState::Fail;
            }
        }
        let mut events = Vec::new();
        let mut delta = 0i64;
        if !was_covered && self.covered(at_least) {
            self.state = CheckState::Pass;
            self.pending.push(Value::Str("PASS".to_string()));
            events.push(CoveredEvent {
                bin: Value::Str("PASS".to_string()),
                label: Some("PASS".to_string()),
            });
            delta = weight as i64;
        } else if was_covered && !self.covered(at_least) {
            self.pending.push(Value::Str("FAIL".to_string()));
            events.push(CoveredEvent {
                bin: Value::Str("FAIL".to_string()),
                label: Some("FAIL".to_string()),
            });
            delta = -(weight as i64);
        }
        (events, delta)
    }
}

/// Declarative description of a pass/fail coverage leaf.
pub struct CoverCheck {
    name: String,
    f_fail: Option<SamplePredicate>,
    f_pass: Option<SamplePredicate>,
    weight: u64,
    at_least: u64,
}

impl CoverCheck {
    /// Starts a CoverCheck description for the given dotted name.
    pub fn new(name: &str) -> CoverCheck {
        CoverCheck {
            name: name.to_string(),
            f_fail: None,
            f_pass: None,
            weight: 1,
            at_least: 1,
        }
    }

    /// The failing predicate. Required; once it holds for any sample the
    /// check is failed for good.
    pub fn f_fail(mut self, f: impl FnMut(&Sample) -> bool + 'static) -> CoverCheck {
        self.f_fail = Some(Box::new(f));
        self
    }

    /// The passing predicate. Defaults to "any sample that does not fail".
    pub fn f_pass(mut self, f: impl FnMut(&Sample) -> bool + 'static) -> CoverCheck {
        self.f_pass = Some(Box::new(f));
        self
    }

    /// Size of this check when covered, at least 1.
    pub fn weight(mut self, weight: u64) -> CoverCheck {
        self.weight = weight;
        self
    }

    /// How many passing samples are required, at least 1.
    pub fn at_least(mut self, at_least: u64) -> CoverCheck {
        self.at_least = at_least;
        self
    }

    /// Validates the description and registers the leaf.
    pub fn register(self, db: &CoverageDb) -> Result<CoverItem> {
        validate_weight_at_least(&self.name, self.weight, self.at_least)?;
        let f_fail = self.f_fail.ok_or_else(|| {
            Error::Registration(format!("`{}` declares no f_fail predicate", self.name))
        })?;
        let leaf = CheckLeaf::new(f_fail, self.f_pass);
        db.register_leaf(Node::new(
            self.name,
            self.weight,
            self.at_least,
            NodeKind::Check(leaf),
        ))
    }
}
